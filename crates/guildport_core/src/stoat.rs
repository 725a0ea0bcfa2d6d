use std::collections::BTreeMap;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{AuthConfig, MigrateConfig};

pub const RATELIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATELIMIT_RESET_AFTER_HEADER: &str = "x-ratelimit-reset-after";
pub const BANNERS_TAG: &str = "banners";

/// Allow/deny pair as Stoat stores it on roles and channels.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct OverrideField {
    pub a: u64,
    pub d: u64,
}

/// Allow/deny pair as Stoat accepts it in permission writes.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Override {
    pub allow: u64,
    pub deny: u64,
}

impl From<OverrideField> for Override {
    fn from(value: OverrideField) -> Self {
        Self {
            allow: value.a,
            deny: value.d,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct VoiceInformation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_users: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct File {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Channel {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub channel_type: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<File>,
    #[serde(default)]
    pub default_permissions: Option<OverrideField>,
    #[serde(default)]
    pub role_permissions: BTreeMap<String, OverrideField>,
    #[serde(default)]
    pub nsfw: Option<bool>,
    #[serde(default)]
    pub voice: Option<VoiceInformation>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Role {
    #[serde(rename = "_id", default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub permissions: OverrideField,
    #[serde(default)]
    pub colour: Option<String>,
    #[serde(default)]
    pub hoist: Option<bool>,
    #[serde(default)]
    pub rank: i64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Category {
    pub id: String,
    pub title: String,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SystemMessageChannels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_joined: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_left: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_kicked: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_banned: Option<String>,
}

impl SystemMessageChannels {
    /// Route every system message kind to one channel.
    pub fn all(channel_id: &str) -> Self {
        Self {
            user_joined: Some(channel_id.to_string()),
            user_left: Some(channel_id.to_string()),
            user_kicked: Some(channel_id.to_string()),
            user_banned: Some(channel_id.to_string()),
        }
    }
}

/// Servers fetched with channels included embed channel objects; mutation
/// responses list bare ids.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ServerChannel {
    Id(String),
    Full(Channel),
}

impl ServerChannel {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Full(channel) => &channel.id,
        }
    }

    /// Display label; the id when only the id is known.
    pub fn label(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Full(channel) => &channel.name,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Server {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub channels: Vec<ServerChannel>,
    #[serde(default)]
    pub categories: Option<Vec<Category>>,
    #[serde(default)]
    pub system_messages: Option<SystemMessageChannels>,
    #[serde(default)]
    pub roles: BTreeMap<String, Role>,
    #[serde(default)]
    pub default_permissions: u64,
    #[serde(default)]
    pub icon: Option<File>,
    #[serde(default)]
    pub banner: Option<File>,
}

impl Server {
    /// Role by id, with the id filled in from the map key.
    pub fn role(&self, role_id: &str) -> Option<Role> {
        self.roles.get(role_id).map(|role| {
            let mut role = role.clone();
            if role.id.is_empty() {
                role.id = role_id.to_string();
            }
            role
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DataCreateChannel {
    pub name: String,
    pub description: Option<String>,
    pub nsfw: Option<bool>,
    pub voice: Option<VoiceInformation>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DataCreateRole {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DataEditRole {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub colour: Option<String>,
    pub hoist: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DataEditServer {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub banner: Option<String>,
    pub categories: Option<Vec<Category>>,
    pub system_messages: Option<SystemMessageChannels>,
}

#[derive(Debug, Serialize)]
struct PermissionsBody<T> {
    permissions: T,
}

#[derive(Debug, Serialize)]
struct RanksBody<'a> {
    ranks: &'a [String],
}

#[derive(Debug, Deserialize)]
struct NewRoleResponse {
    id: String,
    role: Role,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    id: String,
}

/// Write access to a Stoat server. Every mutation returns the fresh
/// server or channel snapshot, which supersedes whatever the caller held.
pub trait StoatApi {
    fn fetch_server(&mut self, server_id: &str) -> Result<Server>;
    fn create_channel(&mut self, server_id: &str, data: &DataCreateChannel) -> Result<Channel>;
    fn create_role(&mut self, server_id: &str, data: &DataCreateRole) -> Result<Role>;
    fn edit_role(&mut self, server_id: &str, role_id: &str, data: &DataEditRole)
    -> Result<Server>;
    fn edit_role_ranks(&mut self, server_id: &str, ranks: &[String]) -> Result<Server>;
    fn set_default_server_permissions(&mut self, server_id: &str, permissions: u64)
    -> Result<Server>;
    fn set_role_server_permissions(
        &mut self,
        server_id: &str,
        role_id: &str,
        permissions: Override,
    ) -> Result<Server>;
    fn edit_server(&mut self, server_id: &str, data: &DataEditServer) -> Result<Server>;
    fn set_default_channel_permissions(
        &mut self,
        channel_id: &str,
        permissions: Override,
    ) -> Result<Channel>;
    fn set_role_channel_permissions(
        &mut self,
        channel_id: &str,
        role_id: &str,
        permissions: Override,
    ) -> Result<Channel>;
    /// Upload to the file server under `tag`, returning the file id.
    fn upload_file(&mut self, tag: &str, filename: &str, data: Vec<u8>) -> Result<String>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct StoatClientConfig {
    pub api_url: String,
    pub autumn_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl StoatClientConfig {
    pub fn from_config(config: &MigrateConfig) -> Self {
        Self {
            api_url: config.stoat_api_url(),
            autumn_url: config.stoat_autumn_url(),
            user_agent: config.user_agent(),
            timeout_ms: config.http_timeout_ms(),
        }
    }
}

pub struct StoatClient {
    client: Client,
    config: StoatClientConfig,
    auth: AuthConfig,
    request_count: usize,
}

impl StoatClient {
    pub fn new(config: StoatClientConfig, auth: AuthConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build Stoat HTTP client")?;

        Ok(Self {
            client,
            config,
            auth,
            request_count: 0,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_url.trim_end_matches('/'))
    }

    fn request(&mut self, method: Method, url: &str) -> RequestBuilder {
        self.request_count += 1;
        debug!(%method, %url, "stoat request");
        self.client
            .request(method, url)
            .header(self.auth.header_name(), self.auth.token.as_str())
    }

    fn send_json<B, T>(&mut self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.api_url(path);
        let mut builder = self.request(method, &url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder
            .send()
            .with_context(|| format!("failed to call Stoat API {url}"))?;
        let response = finish_response(response)?;
        response
            .json()
            .with_context(|| format!("failed to decode Stoat API response from {url}"))
    }
}

/// Honor rate-limit headers, then surface non-success statuses with the raw body.
fn finish_response(response: Response) -> Result<Response> {
    honor_rate_limit(response.headers(), sleep);

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(status_error(status, &body));
    }
    Ok(response)
}

/// Wait out an exhausted rate-limit window before the caller looks at the body.
fn honor_rate_limit(headers: &HeaderMap, mut wait: impl FnMut(Duration)) -> Option<Duration> {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let pause = rate_limit_pause(
        header(RATELIMIT_REMAINING_HEADER),
        header(RATELIMIT_RESET_AFTER_HEADER),
    )?;
    debug!(?pause, "stoat rate limit exhausted, waiting");
    wait(pause);
    Some(pause)
}

fn status_error(status: StatusCode, body: &str) -> anyhow::Error {
    anyhow!("Stoat API request failed with HTTP {status}: {body}")
}

/// How long to wait before the next call, given a response's rate-limit headers.
/// `reset_after` is in milliseconds.
pub fn rate_limit_pause(remaining: Option<&str>, reset_after: Option<&str>) -> Option<Duration> {
    if remaining.map(str::trim) != Some("0") {
        return None;
    }
    let millis = reset_after?.trim().parse::<f64>().ok()?;
    if !millis.is_finite() || millis <= 0.0 {
        return None;
    }
    Some(Duration::from_millis(millis.ceil() as u64))
}

impl StoatApi for StoatClient {
    fn fetch_server(&mut self, server_id: &str) -> Result<Server> {
        self.send_json::<(), _>(
            Method::GET,
            &format!("/servers/{server_id}?include_channels=true"),
            None,
        )
    }

    fn create_channel(&mut self, server_id: &str, data: &DataCreateChannel) -> Result<Channel> {
        self.send_json(
            Method::POST,
            &format!("/servers/{server_id}/channels"),
            Some(data),
        )
    }

    fn create_role(&mut self, server_id: &str, data: &DataCreateRole) -> Result<Role> {
        let response: NewRoleResponse = self.send_json(
            Method::POST,
            &format!("/servers/{server_id}/roles"),
            Some(data),
        )?;
        let mut role = response.role;
        if role.id.is_empty() {
            role.id = response.id;
        }
        Ok(role)
    }

    fn edit_role(
        &mut self,
        server_id: &str,
        role_id: &str,
        data: &DataEditRole,
    ) -> Result<Server> {
        self.send_json(
            Method::PATCH,
            &format!("/servers/{server_id}/roles/{role_id}"),
            Some(data),
        )
    }

    fn edit_role_ranks(&mut self, server_id: &str, ranks: &[String]) -> Result<Server> {
        self.send_json(
            Method::PATCH,
            &format!("/servers/{server_id}/roles/ranks"),
            Some(&RanksBody { ranks }),
        )
    }

    fn set_default_server_permissions(
        &mut self,
        server_id: &str,
        permissions: u64,
    ) -> Result<Server> {
        self.send_json(
            Method::PUT,
            &format!("/servers/{server_id}/permissions/default"),
            Some(&PermissionsBody { permissions }),
        )
    }

    fn set_role_server_permissions(
        &mut self,
        server_id: &str,
        role_id: &str,
        permissions: Override,
    ) -> Result<Server> {
        self.send_json(
            Method::PUT,
            &format!("/servers/{server_id}/permissions/{role_id}"),
            Some(&PermissionsBody { permissions }),
        )
    }

    fn edit_server(&mut self, server_id: &str, data: &DataEditServer) -> Result<Server> {
        self.send_json(Method::PATCH, &format!("/servers/{server_id}"), Some(data))
    }

    fn set_default_channel_permissions(
        &mut self,
        channel_id: &str,
        permissions: Override,
    ) -> Result<Channel> {
        self.send_json(
            Method::PUT,
            &format!("/channels/{channel_id}/permissions/default"),
            Some(&PermissionsBody { permissions }),
        )
    }

    fn set_role_channel_permissions(
        &mut self,
        channel_id: &str,
        role_id: &str,
        permissions: Override,
    ) -> Result<Channel> {
        self.send_json(
            Method::PUT,
            &format!("/channels/{channel_id}/permissions/{role_id}"),
            Some(&PermissionsBody { permissions }),
        )
    }

    fn upload_file(&mut self, tag: &str, filename: &str, data: Vec<u8>) -> Result<String> {
        let url = format!("{}/{tag}", self.config.autumn_url.trim_end_matches('/'));
        let form = Form::new().part("file", Part::bytes(data).file_name(filename.to_string()));
        let response = self
            .request(Method::POST, &url)
            .multipart(form)
            .send()
            .with_context(|| format!("failed to upload to {url}"))?;
        let response = finish_response(response)?;
        let payload: UploadResponse = response
            .json()
            .with_context(|| format!("failed to decode upload response from {url}"))?;
        Ok(payload.id)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}
