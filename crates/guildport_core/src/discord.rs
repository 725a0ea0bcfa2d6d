use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use tracing::debug;

use crate::config::MigrateConfig;

/// Overwrite / role id that stands for `@everyone`.
pub const EVERYONE_ID: &str = "0";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuildTemplate {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "id_string")]
    pub source_guild_id: String,
    pub serialized_source_guild: Guild,
    #[serde(default)]
    pub is_dirty: Option<bool>,
}

impl GuildTemplate {
    /// The serialized guild carries no id of its own; borrow the source guild's.
    pub fn into_guild(self) -> Guild {
        let mut guild = self.serialized_source_guild;
        if guild.id.is_empty() {
            guild.id = self.source_guild_id;
        }
        guild
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Guild {
    #[serde(default, deserialize_with = "id_string")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub banner: Option<String>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default, deserialize_with = "optional_id_string")]
    pub system_channel_id: Option<String>,
}

impl Guild {
    pub fn everyone_role(&self) -> Option<&Role> {
        self.roles.iter().find(|role| role.id == EVERYONE_ID)
    }

    pub fn categories(&self) -> impl Iterator<Item = &Channel> {
        self.channels
            .iter()
            .filter(|channel| channel.kind == ChannelType::Category)
    }

    /// Banner hash, when the guild has a usable one.
    pub fn banner_hash(&self) -> Option<&str> {
        self.banner
            .as_deref()
            .map(str::trim)
            .filter(|hash| !hash.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct RoleColors {
    #[serde(default)]
    pub primary_color: u32,
    #[serde(default)]
    pub secondary_color: Option<u32>,
    #[serde(default)]
    pub tertiary_color: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Role {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub colors: RoleColors,
    #[serde(default)]
    pub hoist: bool,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub position: i64,
    #[serde(default, deserialize_with = "permission_string")]
    pub permissions: String,
    #[serde(default)]
    pub mentionable: bool,
}

impl Role {
    pub fn has_icon(&self) -> bool {
        self.icon.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum OverwriteType {
    Role = 0,
    Member = 1,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Overwrite {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OverwriteType,
    #[serde(default, deserialize_with = "permission_string")]
    pub allow: String,
    #[serde(default, deserialize_with = "permission_string")]
    pub deny: String,
}

impl Overwrite {
    pub fn is_member(&self) -> bool {
        self.kind == OverwriteType::Member
    }
}

/// Discord channel type. Values Discord adds later land in `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "u8", into = "u8")]
pub enum ChannelType {
    Text,
    Dm,
    Voice,
    Group,
    Category,
    Announcement,
    AnnouncementThread,
    PublicThread,
    PrivateThread,
    StageVoice,
    Directory,
    Forum,
    Media,
    Unknown(u8),
}

impl From<u8> for ChannelType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Text,
            1 => Self::Dm,
            2 => Self::Voice,
            3 => Self::Group,
            4 => Self::Category,
            5 => Self::Announcement,
            10 => Self::AnnouncementThread,
            11 => Self::PublicThread,
            12 => Self::PrivateThread,
            13 => Self::StageVoice,
            14 => Self::Directory,
            15 => Self::Forum,
            16 => Self::Media,
            other => Self::Unknown(other),
        }
    }
}

impl From<ChannelType> for u8 {
    fn from(value: ChannelType) -> Self {
        match value {
            ChannelType::Text => 0,
            ChannelType::Dm => 1,
            ChannelType::Voice => 2,
            ChannelType::Group => 3,
            ChannelType::Category => 4,
            ChannelType::Announcement => 5,
            ChannelType::AnnouncementThread => 10,
            ChannelType::PublicThread => 11,
            ChannelType::PrivateThread => 12,
            ChannelType::StageVoice => 13,
            ChannelType::Directory => 14,
            ChannelType::Forum => 15,
            ChannelType::Media => 16,
            ChannelType::Unknown(other) => other,
        }
    }
}

impl ChannelType {
    pub fn is_voice(self) -> bool {
        matches!(self, Self::Voice | Self::StageVoice)
    }

    /// Stoat channel kind this type is downgraded to, for types Stoat has no
    /// direct equivalent of.
    pub fn downgrade(self) -> Option<&'static str> {
        match self {
            Self::Announcement | Self::Forum | Self::Media => Some("text"),
            Self::StageVoice => Some("voice"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Channel {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChannelType,
    #[serde(default)]
    pub position: i64,
    #[serde(default, deserialize_with = "nullable_vec")]
    pub permission_overwrites: Vec<Overwrite>,
    pub name: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub nsfw: Option<bool>,
    #[serde(default)]
    pub user_limit: Option<u32>,
    #[serde(default, deserialize_with = "optional_id_string")]
    pub parent_id: Option<String>,
}

impl Channel {
    pub fn overwrite_for(&self, id: &str) -> Option<&Overwrite> {
        self.permission_overwrites
            .iter()
            .find(|overwrite| overwrite.id == id)
    }
}

/// Template payloads carry ids as numbers, live guild payloads as strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(u64),
}

impl From<RawId> for String {
    fn from(value: RawId) -> Self {
        match value {
            RawId::Text(text) => text,
            RawId::Number(number) => number.to_string(),
        }
    }
}

fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

fn optional_id_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(String::from))
}

fn permission_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?
        .map(String::from)
        .unwrap_or_default())
}

fn nullable_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

pub trait DiscordApi {
    fn fetch_template(&mut self, code: &str) -> Result<GuildTemplate>;
    fn fetch_banner(&mut self, guild_id: &str, hash: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct DiscordClientConfig {
    pub api_url: String,
    pub cdn_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl DiscordClientConfig {
    pub fn from_config(config: &MigrateConfig) -> Self {
        Self {
            api_url: config.discord_api_url(),
            cdn_url: config.discord_cdn_url(),
            user_agent: config.user_agent(),
            timeout_ms: config.http_timeout_ms(),
        }
    }
}

pub struct DiscordClient {
    client: Client,
    config: DiscordClientConfig,
}

impl DiscordClient {
    pub fn new(config: DiscordClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build Discord HTTP client")?;
        Ok(Self { client, config })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response> {
        debug!(%url, "discord GET");
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to call {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(response)
    }
}

fn status_error(status: StatusCode, body: &str) -> anyhow::Error {
    anyhow!("Discord request failed with HTTP {status}: {body}")
}

impl DiscordApi for DiscordClient {
    fn fetch_template(&mut self, code: &str) -> Result<GuildTemplate> {
        let url = format!(
            "{}/guilds/templates/{}",
            self.config.api_url.trim_end_matches('/'),
            code.trim()
        );
        self.get(&url)?
            .json()
            .with_context(|| format!("failed to decode guild template {code}"))
    }

    fn fetch_banner(&mut self, guild_id: &str, hash: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/banners/{guild_id}/{hash}.png",
            self.config.cdn_url.trim_end_matches('/')
        );
        let bytes = self
            .get(&url)?
            .bytes()
            .with_context(|| format!("failed to read banner {hash}"))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE_JSON: &str = r#"{
        "code": "abc123",
        "name": "Test",
        "description": null,
        "usage_count": 3,
        "creator_id": "42",
        "source_guild_id": "900",
        "serialized_source_guild": {
            "name": "Test Guild",
            "description": "a guild",
            "roles": [
                {"id": 0, "name": "@everyone", "colors": {"primary_color": 0, "secondary_color": null, "tertiary_color": null}, "hoist": false, "position": 0, "permissions": "1071698660929", "mentionable": false},
                {"id": 1, "name": "Mods", "colors": {"primary_color": 255}, "hoist": true, "icon": "deadbeef", "position": 1, "permissions": "8", "mentionable": true}
            ],
            "channels": [
                {"id": 10, "type": 4, "position": 0, "name": "General", "permission_overwrites": [{"id": 1, "type": 0, "allow": "1", "deny": "0"}], "parent_id": null},
                {"id": 11, "type": 0, "position": 0, "name": "general", "topic": null, "nsfw": false, "parent_id": 10, "permission_overwrites": null},
                {"id": 12, "type": 2, "position": 1, "name": "voice", "user_limit": 5, "parent_id": 10, "permission_overwrites": []},
                {"id": 13, "type": 99, "position": 2, "name": "future", "permission_overwrites": []}
            ],
            "system_channel_id": 11
        }
    }"#;

    #[test]
    fn parses_template_with_numeric_ids() {
        let template: GuildTemplate = serde_json::from_str(TEMPLATE_JSON).expect("parse template");
        assert_eq!(template.source_guild_id, "900");
        let guild = template.into_guild();
        assert_eq!(guild.id, "900");
        assert_eq!(guild.system_channel_id.as_deref(), Some("11"));
        assert_eq!(guild.everyone_role().map(|role| role.name.as_str()), Some("@everyone"));
        assert_eq!(guild.roles[1].colors.primary_color, 255);
        assert!(guild.roles[1].has_icon());

        let general = &guild.channels[1];
        assert_eq!(general.parent_id.as_deref(), Some("10"));
        assert!(general.permission_overwrites.is_empty());
        assert_eq!(guild.channels[2].user_limit, Some(5));
        assert_eq!(guild.channels[3].kind, ChannelType::Unknown(99));

        let category = guild.categories().next().expect("category");
        assert_eq!(category.id, "10");
        let overwrite = category.overwrite_for("1").expect("overwrite");
        assert_eq!(overwrite.kind, OverwriteType::Role);
        assert_eq!(overwrite.allow, "1");
    }

    #[test]
    fn failed_status_carries_raw_body() {
        let message = status_error(
            StatusCode::NOT_FOUND,
            r#"{"message": "Unknown Guild Template", "code": 10057}"#,
        )
        .to_string();
        assert!(message.contains("404"));
        assert!(message.contains("Unknown Guild Template"));
        assert!(message.contains("10057"));
    }

    #[test]
    fn channel_type_round_trips_through_u8() {
        for value in [0u8, 2, 4, 5, 13, 15, 16, 77] {
            assert_eq!(u8::from(ChannelType::from(value)), value);
        }
    }

    #[test]
    fn downgrades_follow_channel_family() {
        assert_eq!(ChannelType::Announcement.downgrade(), Some("text"));
        assert_eq!(ChannelType::Forum.downgrade(), Some("text"));
        assert_eq!(ChannelType::Media.downgrade(), Some("text"));
        assert_eq!(ChannelType::StageVoice.downgrade(), Some("voice"));
        assert_eq!(ChannelType::Text.downgrade(), None);
        assert_eq!(ChannelType::Voice.downgrade(), None);
        assert_eq!(ChannelType::Category.downgrade(), None);
        assert_eq!(ChannelType::PublicThread.downgrade(), None);
    }

    #[test]
    fn banner_hash_ignores_blank_values() {
        let mut guild = Guild::default();
        assert_eq!(guild.banner_hash(), None);
        guild.banner = Some("  ".to_string());
        assert_eq!(guild.banner_hash(), None);
        guild.banner = Some("a1b2".to_string());
        assert_eq!(guild.banner_hash(), Some("a1b2"));
    }
}
