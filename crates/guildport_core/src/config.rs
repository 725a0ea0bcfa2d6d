use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "guildport/0.1";
pub const DEFAULT_STOAT_API_URL: &str = "https://api.stoat.chat";
pub const DEFAULT_STOAT_AUTUMN_URL: &str = "https://cdn.stoatusercontent.com";
pub const DEFAULT_DISCORD_API_URL: &str = "https://discord.com/api/v10";
pub const DEFAULT_DISCORD_CDN_URL: &str = "https://cdn.discordapp.com";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CONFIG_PATH: &str = ".guildport/config.toml";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MigrateConfig {
    #[serde(default)]
    pub stoat: StoatSection,
    #[serde(default)]
    pub discord: DiscordSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StoatSection {
    pub api_url: Option<String>,
    pub autumn_url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DiscordSection {
    pub api_url: Option<String>,
    pub cdn_url: Option<String>,
}

impl MigrateConfig {
    /// Resolve the Stoat API base URL: env STOAT_API_URL > config > default.
    pub fn stoat_api_url(&self) -> String {
        resolve("STOAT_API_URL", self.stoat.api_url.as_deref(), DEFAULT_STOAT_API_URL)
    }

    /// Resolve the Stoat file server (autumn) URL: env STOAT_AUTUMN_URL > config > default.
    pub fn stoat_autumn_url(&self) -> String {
        resolve(
            "STOAT_AUTUMN_URL",
            self.stoat.autumn_url.as_deref(),
            DEFAULT_STOAT_AUTUMN_URL,
        )
    }

    pub fn discord_api_url(&self) -> String {
        resolve(
            "DISCORD_API_URL",
            self.discord.api_url.as_deref(),
            DEFAULT_DISCORD_API_URL,
        )
    }

    pub fn discord_cdn_url(&self) -> String {
        resolve(
            "DISCORD_CDN_URL",
            self.discord.cdn_url.as_deref(),
            DEFAULT_DISCORD_CDN_URL,
        )
    }

    pub fn user_agent(&self) -> String {
        resolve(
            "GUILDPORT_USER_AGENT",
            self.stoat.user_agent.as_deref(),
            DEFAULT_USER_AGENT,
        )
    }

    pub fn http_timeout_ms(&self) -> u64 {
        env::var("GUILDPORT_HTTP_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .or(self.stoat.timeout_ms)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS)
    }
}

/// Credentials for the Stoat API. Bots and user sessions authenticate with
/// different headers.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub token: String,
    pub is_bot: bool,
}

impl AuthConfig {
    pub fn from_env() -> Result<Self> {
        let token = env::var("STOAT_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("STOAT_TOKEN is required"))?;
        let is_bot = env::var("STOAT_IS_BOT")
            .map(|value| parse_flag(&value))
            .unwrap_or(false);
        Ok(Self { token, is_bot })
    }

    pub fn header_name(&self) -> &'static str {
        if self.is_bot {
            "x-bot-token"
        } else {
            "x-session-token"
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token", &"<redacted>")
            .field("is_bot", &self.is_bot)
            .finish()
    }
}

/// Load and parse a MigrateConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MigrateConfig> {
    if !config_path.exists() {
        return Ok(MigrateConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MigrateConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    validate_urls(&parsed)
        .with_context(|| format!("invalid settings in {}", config_path.display()))?;
    Ok(parsed)
}

/// `--config` flag > GUILDPORT_CONFIG > `.guildport/config.toml` under `cwd`.
pub fn resolve_config_path(flag: Option<&Path>, cwd: &Path) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    if let Ok(value) = env::var("GUILDPORT_CONFIG") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    cwd.join(DEFAULT_CONFIG_PATH)
}

fn validate_urls(config: &MigrateConfig) -> Result<()> {
    let urls = [
        ("stoat.api_url", &config.stoat.api_url),
        ("stoat.autumn_url", &config.stoat.autumn_url),
        ("discord.api_url", &config.discord.api_url),
        ("discord.cdn_url", &config.discord.cdn_url),
    ];
    for (key, value) in urls {
        if let Some(url) = value
            && !(url.starts_with("https://") || url.starts_with("http://"))
        {
            bail!("{key} must be an http(s) URL, got {url:?}");
        }
    }
    Ok(())
}

fn resolve(key: &str, configured: Option<&str>, default: &str) -> String {
    if let Ok(value) = env::var(key) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            return trimmed;
        }
    }
    configured
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
