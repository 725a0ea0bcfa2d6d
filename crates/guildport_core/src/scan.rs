use crate::discord::Guild;
use crate::stoat::Server;

/// Pre-flight check of a migration from `guild` into `server`.
///
/// Nothing here blocks a migration; each warning names something that will
/// be left behind or silently changed. Order: existing Stoat channels,
/// existing Stoat roles, role icons, then per Discord channel its type
/// downgrade followed by its member overwrites.
pub fn scan_incompatibilities(server: &Server, guild: &Guild) -> Vec<String> {
    let mut warnings = Vec::new();

    for channel in &server.channels {
        warnings.push(format!(
            "Stoat server has channel #{}, it is recommended to delete this before you continue.",
            channel.label()
        ));
    }

    for role in server.roles.values() {
        warnings.push(format!(
            "Stoat server has role @{}, it is recommended to delete this before you continue.",
            role.name
        ));
    }

    for role in guild.roles.iter().filter(|role| role.has_icon()) {
        warnings.push(format!(
            "Role @{} has an icon which is not supported.",
            role.name
        ));
    }

    // Per channel: downgrade first, then that channel's member overwrites.
    for channel in &guild.channels {
        if let Some(target) = channel.kind.downgrade() {
            warnings.push(format!(
                "Channel #{} is an unsupported channel type, will be converted to a {target} channel.",
                channel.name
            ));
        }

        for overwrite in channel
            .permission_overwrites
            .iter()
            .filter(|overwrite| overwrite.is_member())
        {
            warnings.push(format!(
                "Channel #{} has a permission overwrite for member {} which is unsupported, will be skipped.",
                channel.name, overwrite.id
            ));
        }
    }

    warnings
}
