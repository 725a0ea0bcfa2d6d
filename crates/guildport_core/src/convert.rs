//! Discord → Stoat entity conversion.
//!
//! Every Stoat call returns a fresh snapshot of the server or channel it
//! touched. Converters never patch a snapshot locally: they hand the newest
//! one forward and return it to the caller.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::discord::{self, DiscordApi, EVERYONE_ID, Guild};
use crate::permissions::translate_permission;
use crate::stoat::{
    BANNERS_TAG, Category, Channel, DataCreateChannel, DataCreateRole, DataEditRole,
    DataEditServer, Override, Role, Server, StoatApi, SystemMessageChannels, VoiceInformation,
};

/// Discord role id → converted Stoat role.
pub type RoleMap = BTreeMap<String, Role>;
/// Discord channel id → converted Stoat channel.
pub type ChannelMap = BTreeMap<String, Channel>;
/// Discord category id → Discord category channel.
pub type CategoryLookup<'a> = BTreeMap<String, &'a discord::Channel>;

/// `#` + lowercase hex without padding, or `None` for Discord's "no colour".
pub fn role_colour(primary_color: u32) -> Option<String> {
    if primary_color == 0 {
        None
    } else {
        Some(format!("#{primary_color:x}"))
    }
}

/// Create a Stoat role mirroring `discord_role` and grant it the translated
/// server-wide permissions.
///
/// The role exists without permissions between the create and the final
/// permission write; a failure in between leaves it that way.
pub fn convert_role<S: StoatApi>(
    stoat: &mut S,
    server: Server,
    discord_role: &discord::Role,
) -> Result<(Role, Server)> {
    let created = stoat
        .create_role(
            &server.id,
            &DataCreateRole {
                name: discord_role.name.clone(),
            },
        )
        .with_context(|| format!("failed to create role @{}", discord_role.name))?;

    let server = stoat
        .edit_role(
            &server.id,
            &created.id,
            &DataEditRole {
                name: None,
                colour: role_colour(discord_role.colors.primary_color),
                hoist: Some(discord_role.hoist),
            },
        )
        .with_context(|| format!("failed to edit role @{}", discord_role.name))?;

    let allow = translate_permission(&discord_role.permissions)
        .with_context(|| format!("role @{} has unreadable permissions", discord_role.name))?;

    let server = stoat
        .set_role_server_permissions(&server.id, &created.id, Override { allow, deny: 0 })
        .with_context(|| format!("failed to set permissions of role @{}", discord_role.name))?;

    let role = server.role(&created.id).ok_or_else(|| {
        anyhow::anyhow!(
            "role {} (@{}) missing from server snapshot",
            created.id,
            discord_role.name
        )
    })?;
    info!(role = %discord_role.name, stoat_id = %role.id, allow, "converted role");
    Ok((role, server))
}

/// Category channels of `guild`, keyed by their id.
pub fn category_lookup(guild: &Guild) -> CategoryLookup<'_> {
    guild
        .categories()
        .map(|category| (category.id.clone(), category))
        .collect()
}

/// Translate one channel overwrite, folding in the parent category's
/// overwrite for the same role. Category bits only ever add to allow and deny.
pub fn merged_override(
    overwrite: &discord::Overwrite,
    category: Option<&discord::Channel>,
) -> Result<Override> {
    let mut allow = translate_permission(&overwrite.allow)?;
    let mut deny = translate_permission(&overwrite.deny)?;

    if let Some(inherited) = category.and_then(|category| category.overwrite_for(&overwrite.id)) {
        allow |= translate_permission(&inherited.allow)?;
        deny |= translate_permission(&inherited.deny)?;
    }

    Ok(Override { allow, deny })
}

fn create_channel_data(discord_channel: &discord::Channel) -> DataCreateChannel {
    DataCreateChannel {
        name: discord_channel.name.clone(),
        description: discord_channel.topic.clone(),
        nsfw: discord_channel.nsfw,
        voice: discord_channel
            .kind
            .is_voice()
            .then(|| VoiceInformation {
                max_users: discord_channel.user_limit,
            }),
    }
}

/// Create a Stoat channel for `discord_channel` and apply its role and
/// default overwrites. Member overwrites have no Stoat equivalent and are
/// skipped.
pub fn convert_channel<S: StoatApi>(
    stoat: &mut S,
    server: &Server,
    categories: &CategoryLookup<'_>,
    roles: &RoleMap,
    discord_channel: &discord::Channel,
) -> Result<Channel> {
    let mut channel = stoat
        .create_channel(&server.id, &create_channel_data(discord_channel))
        .with_context(|| format!("failed to create channel #{}", discord_channel.name))?;

    let category = match discord_channel.parent_id.as_deref() {
        Some(parent_id) => Some(*categories.get(parent_id).ok_or_else(|| {
            anyhow::anyhow!(
                "channel #{} references unknown category {parent_id}",
                discord_channel.name
            )
        })?),
        None => None,
    };

    for overwrite in &discord_channel.permission_overwrites {
        if overwrite.is_member() {
            warn!(
                channel = %discord_channel.name,
                member = %overwrite.id,
                "skipping member overwrite"
            );
            continue;
        }

        let permissions = merged_override(overwrite, category).with_context(|| {
            format!(
                "channel #{} has unreadable overwrite for {}",
                discord_channel.name, overwrite.id
            )
        })?;

        channel = if overwrite.id == EVERYONE_ID {
            stoat
                .set_default_channel_permissions(&channel.id, permissions)
                .with_context(|| {
                    format!(
                        "failed to set default permissions of #{}",
                        discord_channel.name
                    )
                })?
        } else {
            let role = roles.get(&overwrite.id).ok_or_else(|| {
                anyhow::anyhow!(
                    "channel #{} has an overwrite for unconverted role {}",
                    discord_channel.name,
                    overwrite.id
                )
            })?;
            stoat
                .set_role_channel_permissions(&channel.id, &role.id, permissions)
                .with_context(|| {
                    format!(
                        "failed to set @{} permissions of #{}",
                        role.name, discord_channel.name
                    )
                })?
        };
    }

    info!(channel = %discord_channel.name, stoat_id = %channel.id, "converted channel");
    Ok(channel)
}

/// One Stoat category per Discord category, members ordered by position.
pub fn build_categories(guild: &Guild, channels: &ChannelMap) -> Result<Vec<Category>> {
    let mut categories = Vec::new();
    for category in guild.categories() {
        let mut members: Vec<&discord::Channel> = guild
            .channels
            .iter()
            .filter(|channel| channel.parent_id.as_deref() == Some(category.id.as_str()))
            .collect();
        members.sort_by_key(|channel| channel.position);

        let mut channel_ids = Vec::with_capacity(members.len());
        for member in members {
            let converted = channels.get(&member.id).ok_or_else(|| {
                anyhow::anyhow!(
                    "channel #{} in category {} was not converted",
                    member.name,
                    category.name
                )
            })?;
            channel_ids.push(converted.id.clone());
        }

        categories.push(Category {
            id: category.id.clone(),
            title: category.name.clone(),
            channels: channel_ids,
        });
    }
    Ok(categories)
}

/// Discord has one system channel; Stoat routes each system message kind
/// separately.
pub fn system_message_channels(
    guild: &Guild,
    channels: &ChannelMap,
) -> Result<Option<SystemMessageChannels>> {
    let Some(system_channel_id) = guild.system_channel_id.as_deref() else {
        return Ok(None);
    };
    let channel = channels.get(system_channel_id).ok_or_else(|| {
        anyhow::anyhow!("system channel {system_channel_id} was not converted")
    })?;
    Ok(Some(SystemMessageChannels::all(&channel.id)))
}

/// Apply guild-level settings: categories, banner, system channels and the
/// `@everyone` permissions.
pub fn convert_server<D: DiscordApi, S: StoatApi>(
    discord: &mut D,
    stoat: &mut S,
    server: Server,
    guild: &Guild,
    channels: &ChannelMap,
) -> Result<Server> {
    let everyone = guild
        .everyone_role()
        .ok_or_else(|| anyhow::anyhow!("guild template has no @everyone role (id {EVERYONE_ID})"))?;
    let default_permissions = translate_permission(&everyone.permissions)
        .context("@everyone role has unreadable permissions")?;

    let categories = build_categories(guild, channels)?;
    let system_messages = system_message_channels(guild, channels)?;

    let banner = match guild.banner_hash() {
        Some(hash) => {
            let data = discord
                .fetch_banner(&guild.id, hash)
                .with_context(|| format!("failed to fetch guild banner {hash}"))?;
            let id = stoat
                .upload_file(BANNERS_TAG, &format!("{hash}.png"), data)
                .context("failed to upload guild banner")?;
            Some(id)
        }
        None => None,
    };

    let server = stoat
        .edit_server(
            &server.id,
            &DataEditServer {
                name: Some(guild.name.clone()),
                description: guild.description.clone(),
                icon: None,
                banner,
                categories: Some(categories),
                system_messages,
            },
        )
        .context("failed to edit server")?;

    let server = stoat
        .set_default_server_permissions(&server.id, default_permissions)
        .context("failed to set default server permissions")?;

    info!(server = %server.id, default_permissions, "converted server settings");
    Ok(server)
}
