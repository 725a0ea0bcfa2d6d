use std::cmp::Reverse;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{AuthConfig, MigrateConfig};
use crate::convert::{
    ChannelMap, RoleMap, category_lookup, convert_channel, convert_role, convert_server,
};
use crate::discord::{
    ChannelType, DiscordApi, DiscordClient, DiscordClientConfig, EVERYONE_ID, Guild,
    GuildTemplate,
};
use crate::scan::scan_incompatibilities;
use crate::stoat::{Server, StoatApi, StoatClient, StoatClientConfig};

#[derive(Debug, Clone)]
pub struct MigrateOptions {
    pub template_code: String,
    pub server_id: String,
    /// Refuse to convert when the pre-flight scan reports warnings.
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub template_code: String,
    pub guild_name: String,
    pub server_id: String,
    pub server_name: String,
    pub warnings: Vec<String>,
    pub request_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub success: bool,
    pub template_code: String,
    pub server_id: String,
    pub warnings: Vec<String>,
    pub roles_converted: usize,
    pub channels_converted: usize,
    pub categories: usize,
    pub skipped_member_overwrites: usize,
    pub request_count: usize,
    pub server: Option<Server>,
}

/// Snapshot and id maps produced by a conversion run.
#[derive(Debug, Clone)]
pub struct ConvertedGuild {
    pub server: Server,
    pub roles: RoleMap,
    pub channels: ChannelMap,
}

pub fn fetch_template(config: &MigrateConfig, code: &str) -> Result<GuildTemplate> {
    let mut discord = DiscordClient::new(DiscordClientConfig::from_config(config))?;
    discord.fetch_template(code)
}

pub fn scan(
    config: &MigrateConfig,
    auth: &AuthConfig,
    options: &MigrateOptions,
) -> Result<ScanReport> {
    let mut discord = DiscordClient::new(DiscordClientConfig::from_config(config))?;
    let mut stoat = StoatClient::new(StoatClientConfig::from_config(config), auth.clone())?;
    scan_with_api(&mut discord, &mut stoat, options)
}

pub fn run_migration(
    config: &MigrateConfig,
    auth: &AuthConfig,
    options: &MigrateOptions,
) -> Result<MigrationReport> {
    let mut discord = DiscordClient::new(DiscordClientConfig::from_config(config))?;
    let mut stoat = StoatClient::new(StoatClientConfig::from_config(config), auth.clone())?;
    run_migration_with_api(&mut discord, &mut stoat, options)
}

pub fn scan_with_api<D: DiscordApi, S: StoatApi>(
    discord: &mut D,
    stoat: &mut S,
    options: &MigrateOptions,
) -> Result<ScanReport> {
    let guild = discord
        .fetch_template(&options.template_code)
        .with_context(|| format!("failed to fetch template {}", options.template_code))?
        .into_guild();
    let server = stoat
        .fetch_server(&options.server_id)
        .with_context(|| format!("failed to fetch Stoat server {}", options.server_id))?;

    Ok(ScanReport {
        template_code: options.template_code.clone(),
        guild_name: guild.name.clone(),
        server_id: server.id.clone(),
        server_name: server.name.clone(),
        warnings: scan_incompatibilities(&server, &guild),
        request_count: stoat.request_count(),
    })
}

/// Fetch both sides, scan, and convert. Scan warnings travel in the report;
/// they only stop the conversion when the caller asked for `strict`.
pub fn run_migration_with_api<D: DiscordApi, S: StoatApi>(
    discord: &mut D,
    stoat: &mut S,
    options: &MigrateOptions,
) -> Result<MigrationReport> {
    let guild = discord
        .fetch_template(&options.template_code)
        .with_context(|| format!("failed to fetch template {}", options.template_code))?
        .into_guild();
    let server = stoat
        .fetch_server(&options.server_id)
        .with_context(|| format!("failed to fetch Stoat server {}", options.server_id))?;

    let warnings = scan_incompatibilities(&server, &guild);
    let mut report = MigrationReport {
        template_code: options.template_code.clone(),
        server_id: server.id.clone(),
        warnings,
        ..MigrationReport::default()
    };
    if !report.warnings.is_empty() && options.strict {
        warn!(
            warnings = report.warnings.len(),
            "pre-flight scan reported warnings, strict mode refuses to migrate"
        );
        report.request_count = stoat.request_count();
        return Ok(report);
    }

    let converted = migrate_guild(discord, stoat, server, &guild)?;

    report.success = true;
    report.roles_converted = converted.roles.len();
    report.channels_converted = converted.channels.len();
    report.categories = guild.categories().count();
    report.skipped_member_overwrites = guild
        .channels
        .iter()
        .flat_map(|channel| &channel.permission_overwrites)
        .filter(|overwrite| overwrite.is_member())
        .count();
    report.request_count = stoat.request_count();
    report.server = Some(converted.server);
    Ok(report)
}

/// Convert `guild` into `server`: roles, role order, channels, then guild
/// settings. Calls are strictly sequential; each one sees the snapshot the
/// previous one returned.
pub fn migrate_guild<D: DiscordApi, S: StoatApi>(
    discord: &mut D,
    stoat: &mut S,
    server: Server,
    guild: &Guild,
) -> Result<ConvertedGuild> {
    let mut server = server;
    let mut roles = RoleMap::new();
    for discord_role in guild.roles.iter().filter(|role| role.id != EVERYONE_ID) {
        let (role, next) = convert_role(stoat, server, discord_role)?;
        server = next;
        roles.insert(discord_role.id.clone(), role);
    }
    info!(count = roles.len(), "roles converted");

    if !roles.is_empty() {
        let ranks = role_ranks(&server, guild, &roles);
        server = stoat
            .edit_role_ranks(&server.id, &ranks)
            .context("failed to reorder roles")?;
    }

    let categories = category_lookup(guild);
    let mut channels = ChannelMap::new();
    for discord_channel in guild
        .channels
        .iter()
        .filter(|channel| channel.kind != ChannelType::Category)
    {
        let channel = convert_channel(stoat, &server, &categories, &roles, discord_channel)?;
        channels.insert(discord_channel.id.clone(), channel);
    }
    info!(count = channels.len(), "channels converted");

    let server = convert_server(discord, stoat, server, guild, &channels)?;
    Ok(ConvertedGuild {
        server,
        roles,
        channels,
    })
}

/// Stoat role ids from highest to lowest: converted roles by descending
/// Discord position, then roles the server already had, in their existing order.
fn role_ranks(server: &Server, guild: &Guild, roles: &RoleMap) -> Vec<String> {
    let mut converted: Vec<_> = guild
        .roles
        .iter()
        .filter_map(|discord_role| {
            roles
                .get(&discord_role.id)
                .map(|role| (discord_role.position, role.id.clone()))
        })
        .collect();
    converted.sort_by_key(|(position, _)| Reverse(*position));

    let mut ranks: Vec<String> = converted.into_iter().map(|(_, id)| id).collect();

    let mut existing: Vec<(&String, i64)> = server
        .roles
        .iter()
        .filter(|(id, _)| !ranks.contains(*id))
        .map(|(id, role)| (id, role.rank))
        .collect();
    existing.sort_by_key(|(_, rank)| *rank);
    ranks.extend(existing.into_iter().map(|(id, _)| id.clone()));
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::tests::{
        Call, MockDiscord, MockStoat, bit, discord_channel, discord_role, overwrite,
    };
    use crate::discord::OverwriteType;
    use crate::permissions::translate_permission;
    use crate::stoat::{OverrideField, Role};

    fn template(guild: Guild) -> GuildTemplate {
        GuildTemplate {
            code: "abc".to_string(),
            name: "Template".to_string(),
            description: None,
            source_guild_id: "900".to_string(),
            serialized_source_guild: guild,
            is_dirty: None,
        }
    }

    fn options(strict: bool) -> MigrateOptions {
        MigrateOptions {
            template_code: "abc".to_string(),
            server_id: "S1".to_string(),
            strict,
        }
    }

    fn general_guild() -> Guild {
        let mut mods = discord_role("1", "Mods", &bit(1));
        mods.position = 1;
        let mut admins = discord_role("2", "Admins", &bit(3));
        admins.position = 2;
        Guild {
            name: "Source".to_string(),
            roles: vec![discord_role("0", "@everyone", &bit(10)), mods, admins],
            channels: vec![
                discord_channel(
                    "10",
                    ChannelType::Category,
                    "General",
                    0,
                    None,
                    vec![overwrite("1", OverwriteType::Role, &bit(0), "0")],
                ),
                discord_channel(
                    "11",
                    ChannelType::Text,
                    "general",
                    0,
                    Some("10"),
                    vec![overwrite("1", OverwriteType::Role, &bit(1), "0")],
                ),
            ],
            system_channel_id: Some("11".to_string()),
            ..Guild::default()
        }
    }

    #[test]
    fn end_to_end_merges_category_overwrite_into_channel() {
        let mut discord = MockDiscord {
            template: Some(template(general_guild())),
            ..MockDiscord::default()
        };
        let mut stoat = MockStoat::with_server("S1");

        let report =
            run_migration_with_api(&mut discord, &mut stoat, &options(false)).expect("migrate");

        assert!(report.success);
        assert!(report.warnings.is_empty());
        assert_eq!(report.roles_converted, 2);
        assert_eq!(report.channels_converted, 1);
        assert_eq!(report.categories, 1);

        let mods_id = report
            .server
            .as_ref()
            .and_then(|server| {
                server
                    .roles
                    .iter()
                    .find(|(_, role)| role.name == "Mods")
                    .map(|(id, _)| id.clone())
            })
            .expect("mods role");
        let channel = stoat
            .channels
            .values()
            .find(|channel| channel.name == "general")
            .expect("general channel");
        let expected = translate_permission(&bit(0)).expect("translate")
            | translate_permission(&bit(1)).expect("translate");
        assert_eq!(
            channel.role_permissions.get(&mods_id),
            Some(&OverrideField { a: expected, d: 0 })
        );

        let server = report.server.expect("server");
        assert_eq!(server.default_permissions, 1 << 20);
        let categories = server.categories.expect("categories");
        assert_eq!(categories[0].title, "General");
        assert_eq!(categories[0].channels, vec![channel.id.clone()]);
        assert_eq!(
            server
                .system_messages
                .and_then(|slots| slots.user_banned),
            Some(channel.id.clone())
        );
    }

    #[test]
    fn roles_are_ranked_by_descending_position() {
        let mut discord = MockDiscord {
            template: Some(template(general_guild())),
            ..MockDiscord::default()
        };
        let mut stoat = MockStoat::with_server("S1");
        run_migration_with_api(&mut discord, &mut stoat, &options(false)).expect("migrate");

        let ranks = stoat
            .calls
            .iter()
            .find_map(|call| match call {
                Call::EditRoleRanks(ranks) => Some(ranks.clone()),
                _ => None,
            })
            .expect("ranks call");
        // Mods was created first (R1), Admins second (R2)
        assert_eq!(ranks, vec!["R2".to_string(), "R1".to_string()]);
        assert_eq!(stoat.server.role("R2").map(|role| role.rank), Some(0));
    }

    #[test]
    fn everyone_role_is_not_created_as_a_role() {
        let mut discord = MockDiscord {
            template: Some(template(general_guild())),
            ..MockDiscord::default()
        };
        let mut stoat = MockStoat::with_server("S1");
        run_migration_with_api(&mut discord, &mut stoat, &options(false)).expect("migrate");
        assert!(
            !stoat
                .calls
                .contains(&Call::CreateRole("@everyone".to_string()))
        );
    }

    #[test]
    fn warnings_do_not_stop_the_conversion() {
        let mut guild = general_guild();
        guild.channels[1]
            .permission_overwrites
            .push(overwrite("4242", OverwriteType::Member, &bit(10), "0"));
        let mut discord = MockDiscord {
            template: Some(template(guild)),
            ..MockDiscord::default()
        };
        let mut stoat = MockStoat::with_server("S1");

        let report =
            run_migration_with_api(&mut discord, &mut stoat, &options(false)).expect("migrate");
        assert!(report.success);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.skipped_member_overwrites, 1);
        assert_eq!(report.roles_converted, 2);
        assert_eq!(stoat.permission_calls(), 1);
    }

    #[test]
    fn fresh_server_with_default_channel_still_migrates() {
        let mut discord = MockDiscord {
            template: Some(template(general_guild())),
            ..MockDiscord::default()
        };
        let mut stoat = MockStoat::with_server("S1");
        stoat
            .create_channel(
                "S1",
                &crate::stoat::DataCreateChannel {
                    name: "General".to_string(),
                    ..Default::default()
                },
            )
            .expect("seed channel");
        let seeded_calls = stoat.calls.len();

        let report =
            run_migration_with_api(&mut discord, &mut stoat, &options(false)).expect("migrate");
        assert!(report.success);
        assert_eq!(
            report.warnings,
            vec!["Stoat server has channel #General, it is recommended to delete this before you continue."]
        );
        assert!(stoat.calls.len() > seeded_calls);
        assert_eq!(report.channels_converted, 1);
    }

    #[test]
    fn strict_mode_refuses_when_scan_warns() {
        let mut guild = general_guild();
        guild.channels[1]
            .permission_overwrites
            .push(overwrite("4242", OverwriteType::Member, &bit(10), "0"));
        let mut discord = MockDiscord {
            template: Some(template(guild)),
            ..MockDiscord::default()
        };
        let mut stoat = MockStoat::with_server("S1");

        let report =
            run_migration_with_api(&mut discord, &mut stoat, &options(true)).expect("scan");
        assert!(!report.success);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.server.is_none());
        assert!(stoat.calls.is_empty());
    }

    #[test]
    fn strict_mode_converts_a_clean_migration() {
        let mut discord = MockDiscord {
            template: Some(template(general_guild())),
            ..MockDiscord::default()
        };
        let mut stoat = MockStoat::with_server("S1");
        let report =
            run_migration_with_api(&mut discord, &mut stoat, &options(true)).expect("migrate");
        assert!(report.success);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn existing_roles_keep_their_order_after_converted_ones() {
        let mut stoat = MockStoat::with_server("S1");
        stoat.server.roles.insert(
            "OLD2".to_string(),
            Role {
                name: "Old two".to_string(),
                rank: 5,
                ..Role::default()
            },
        );
        stoat.server.roles.insert(
            "OLD1".to_string(),
            Role {
                name: "Old one".to_string(),
                rank: 2,
                ..Role::default()
            },
        );
        let mut discord = MockDiscord {
            template: Some(template(general_guild())),
            ..MockDiscord::default()
        };

        let report =
            run_migration_with_api(&mut discord, &mut stoat, &options(false)).expect("migrate");
        assert_eq!(report.warnings.len(), 2);
        let ranks = stoat
            .calls
            .iter()
            .find_map(|call| match call {
                Call::EditRoleRanks(ranks) => Some(ranks.clone()),
                _ => None,
            })
            .expect("ranks call");
        assert_eq!(ranks, vec!["R2", "R1", "OLD1", "OLD2"]);
    }

    #[test]
    fn missing_template_propagates_the_error() {
        let mut discord = MockDiscord::default();
        let mut stoat = MockStoat::with_server("S1");
        let error = run_migration_with_api(&mut discord, &mut stoat, &options(false))
            .expect_err("must fail");
        assert!(format!("{error:#}").contains("Unknown Guild Template"));
    }

    #[test]
    fn scan_reports_existing_server_content() {
        let mut discord = MockDiscord {
            template: Some(template(general_guild())),
            ..MockDiscord::default()
        };
        let mut stoat = MockStoat::with_server("S1");
        stoat
            .create_channel(
                "S1",
                &crate::stoat::DataCreateChannel {
                    name: "lobby".to_string(),
                    ..Default::default()
                },
            )
            .expect("seed channel");

        let report = scan_with_api(&mut discord, &mut stoat, &options(false)).expect("scan");
        assert_eq!(report.guild_name, "Source");
        assert_eq!(
            report.warnings,
            vec!["Stoat server has channel #lobby, it is recommended to delete this before you continue."]
        );
    }
}
