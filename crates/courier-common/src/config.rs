//! Configuration for registries, clients and servers.
//!
//! Every struct deserializes from JSON with all fields optional; missing
//! fields take the defaults documented on each field. Durations are
//! milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::server_info::{DEFAULT_PORT, WILDCARD_SERVER_TYPE};

/// Registry root path used when none is configured.
pub const DEFAULT_ROOT_PATH: &str = "/regax-rpc";

/// Delay used to coalesce bursts of registry change notifications.
pub const REGISTRY_CHANGE_DELAY_MS: u64 = 10;

/// Per-connection client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Identifies this client in logs and traces
    pub client_id: String,
    /// Queue outgoing calls and flush them as one batch every `flush_interval_ms`
    pub buffer_msg: bool,
    /// Ping interval; the link is closed after two intervals without a pong
    pub keepalive_ms: u64,
    /// Per-call deadline
    pub invoke_timeout_ms: u64,
    /// Deadline for establishing the TCP connection
    pub connect_timeout_ms: u64,
    /// Flush period for buffered mode
    pub flush_interval_ms: u64,
    /// Emit trace records for every step of every call
    pub rpc_debug_log: bool,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            buffer_msg: false,
            keepalive_ms: 10_000,
            invoke_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            flush_interval_ms: 50,
            rpc_debug_log: false,
        }
    }
}

impl MailboxConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Router used by `rpc_invoke_by_route`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    /// CRC hash of the seed (or a random value) modulo the candidate count
    #[default]
    Default,
    Random,
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(flatten)]
    pub mailbox: MailboxConfig,
    /// Maximum queued calls per server while its mailbox is connecting
    pub pending_size: usize,
    /// Delay before mailboxes are closed on a non-forced stop
    pub grace_timeout_ms: u64,
    pub route: RouteKind,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mailbox: MailboxConfig::default(),
            pending_size: 10_000,
            grace_timeout_ms: 3_000,
            route: RouteKind::Default,
        }
    }
}

impl ClientConfig {
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address advertised in the registry and bound by the acceptor
    pub host: String,
    /// Preferred port
    pub port: u16,
    pub server_type: String,
    /// Defaults to `host(serverType):port`
    pub server_id: Option<String>,
    pub server_version: Option<String>,
    /// Fall back to a free port when `port` is taken; when false the
    /// server fails instead and never retries
    pub autoport: bool,
    /// Bind attempts after the first one fails
    pub bind_retries: u32,
    /// Queue responses per connection and flush them every `flush_interval_ms`
    pub buffer_msg: bool,
    pub flush_interval_ms: u64,
    pub rpc_debug_log: bool,
    /// Let an endpoint call its own services without a network hop
    pub can_invoke_local: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            server_type: WILDCARD_SERVER_TYPE.to_string(),
            server_id: None,
            server_version: None,
            autoport: true,
            bind_retries: 10,
            buffer_msg: false,
            flush_interval_ms: 50,
            rpc_debug_log: false,
            can_invoke_local: true,
        }
    }
}

impl ServerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalRegistryConfig {
    pub root_path: String,
    pub change_delay_ms: u64,
}

impl Default for LocalRegistryConfig {
    fn default() -> Self {
        Self {
            root_path: DEFAULT_ROOT_PATH.to_string(),
            change_delay_ms: REGISTRY_CHANGE_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZookeeperConfig {
    pub root_path: String,
    /// Comma separated `host:port` list
    pub hosts: String,
    /// Digest credentials; when both are set, znodes get a creator-only ACL
    pub username: Option<String>,
    pub password: Option<String>,
    pub session_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ZookeeperConfig {
    fn default() -> Self {
        Self {
            root_path: DEFAULT_ROOT_PATH.to_string(),
            hosts: "127.0.0.1:2181".to_string(),
            username: None,
            password: None,
            session_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
        }
    }
}

impl ZookeeperConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `(username, password)` when both are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteCacheConfig {
    pub root_path: String,
    /// Cache connection url; an in-process cache is used when absent
    pub url: Option<String>,
    /// Poll interval right after start
    pub sync_interval_ms: u64,
    /// Time after start at which polling slows down
    pub start_long_sync_ms: u64,
    /// Poll interval in steady state
    pub long_sync_interval_ms: u64,
    /// TTL of the directory blob
    pub expired_time_ms: u64,
}

impl Default for RemoteCacheConfig {
    fn default() -> Self {
        Self {
            root_path: DEFAULT_ROOT_PATH.to_string(),
            url: None,
            sync_interval_ms: 3_000,
            start_long_sync_ms: 3 * 60 * 1_000,
            long_sync_interval_ms: 60 * 60 * 1_000,
            expired_time_ms: 24 * 60 * 60 * 1_000,
        }
    }
}

/// Registry backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryConfig {
    Local(LocalRegistryConfig),
    Zookeeper(ZookeeperConfig),
    RemoteCache(RemoteCacheConfig),
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig::Local(LocalRegistryConfig::default())
    }
}

impl RegistryConfig {
    pub fn root_path(&self) -> &str {
        match self {
            RegistryConfig::Local(c) => &c.root_path,
            RegistryConfig::Zookeeper(c) => &c.root_path,
            RegistryConfig::RemoteCache(c) => &c.root_path,
        }
    }
}

/// Full configuration of one RPC endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub registry: RegistryConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl RpcConfig {
    /// Loads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
