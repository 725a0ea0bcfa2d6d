use anyhow::{Context, Result};
use num_bigint::BigUint;
use num_traits::Num;

/// Every Stoat permission bit; granted wholesale to Discord administrators.
pub const STOAT_ALL_PERMISSIONS: u64 = 0x000F_FFFF_FFFF_FFFF;

/// One row of the Discord → Stoat permission table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionMapping {
    pub discord_bit: u64,
    pub stoat_bits: u64,
}

const fn map(discord_bit: u64, stoat_bits: u64) -> PermissionMapping {
    PermissionMapping {
        discord_bit,
        stoat_bits,
    }
}

/// Hand-curated and partial. Discord bits without a row are dropped on
/// translation.
pub const PERMISSION_MAP: &[PermissionMapping] = &[
    // CREATE_INSTANT_INVITE -> InviteOthers
    map(0, 1 << 25),
    // KICK_MEMBERS -> KickMembers
    map(1, 1 << 6),
    // BAN_MEMBERS -> BanMembers
    map(2, 1 << 7),
    // ADMINISTRATOR
    map(3, STOAT_ALL_PERMISSIONS),
    // MANAGE_CHANNELS -> ManageChannel
    map(4, 1 << 0),
    // MANAGE_GUILD -> ManageServer
    map(5, 1 << 1),
    // ADD_REACTIONS -> React
    map(6, 1 << 29),
    // STREAM -> Video
    map(9, 1 << 32),
    // VIEW_CHANNEL -> ViewChannel
    map(10, 1 << 20),
    // SEND_MESSAGES -> SendMessage
    map(11, 1 << 22),
    // MANAGE_MESSAGES -> ManageMessages
    map(13, 1 << 23),
    // EMBED_LINKS -> SendEmbeds
    map(14, 1 << 26),
    // ATTACH_FILES -> UploadFiles
    map(15, 1 << 27),
    // READ_MESSAGE_HISTORY -> ReadMessageHistory
    map(16, 1 << 21),
    // MENTION_EVERYONE -> MentionEveryone
    map(17, 1 << 37),
    // CONNECT -> Connect
    map(20, 1 << 30),
    // SPEAK -> Speak
    map(21, 1 << 31),
    // MUTE_MEMBERS -> MuteMembers
    map(22, 1 << 33),
    // DEAFEN_MEMBERS -> DeafenMembers
    map(23, 1 << 34),
    // MOVE_MEMBERS -> MoveMembers
    map(24, 1 << 35),
    // CHANGE_NICKNAME -> ChangeNickname | ChangeAvatar
    map(26, (1 << 10) | (1 << 12)),
    // MANAGE_NICKNAMES -> ManageNicknames | RemoveAvatars
    map(27, (1 << 11) | (1 << 13)),
    // MANAGE_ROLES -> AssignRoles | ManageRole | ManagePermissions
    map(28, (1 << 9) | (1 << 2) | (1 << 3)),
    // MANAGE_WEBHOOKS -> ManageWebhooks
    map(29, 1 << 24),
    // MANAGE_GUILD_EXPRESSIONS -> ManageCustomisation
    map(30, 1 << 4),
    // MODERATE_MEMBERS -> TimeoutMembers
    map(40, 1 << 8),
];

/// Parse a Discord permission string. An empty string reads as zero.
pub fn parse_discord_permissions(value: &str) -> Result<BigUint> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(BigUint::default());
    }
    BigUint::from_str_radix(trimmed, 10)
        .with_context(|| format!("invalid Discord permission value: {trimmed:?}"))
}

/// Translate a decimal Discord permission bitmask into a Stoat bitmask.
///
/// The translation is lossy: Discord bits without a row in
/// [`PERMISSION_MAP`] are ignored.
pub fn translate_permission(value: &str) -> Result<u64> {
    let parsed = parse_discord_permissions(value)?;
    Ok(translate_bits(&parsed))
}

pub fn translate_bits(value: &BigUint) -> u64 {
    PERMISSION_MAP
        .iter()
        .filter(|mapping| value.bit(mapping.discord_bit))
        .fold(0u64, |output, mapping| output | mapping.stoat_bits)
}

/// Discord bits set in `value` that have no Stoat counterpart.
pub fn unmapped_bits(value: &BigUint) -> Vec<u64> {
    (0..value.bits())
        .filter(|bit| value.bit(*bit))
        .filter(|bit| !PERMISSION_MAP.iter().any(|mapping| mapping.discord_bit == *bit))
        .collect()
}
