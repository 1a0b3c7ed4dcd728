use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Server type used by servers that accept calls for any type.
pub const WILDCARD_SERVER_TYPE: &str = "*";

/// Port a server tries first when none is configured.
pub const DEFAULT_PORT: u16 = 3723;

/// Address and identity of a registered server process.
///
/// A `ServerInfo` is immutable once registered. A different value under the
/// same `server_id` is a replacement, see [`ServerInfo::is_changed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
    pub server_id: String,
    pub server_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register_time: Option<u64>,
}

/// All currently known servers keyed by server id.
pub type ServerMap = HashMap<String, ServerInfo>;

impl ServerInfo {
    /// Creates a server info with the derived `host(serverType):port` id.
    pub fn new(host: impl Into<String>, port: u16, server_type: impl Into<String>) -> Self {
        let host = host.into();
        let server_type = server_type.into();
        Self {
            server_id: Self::default_server_id(&host, &server_type, port),
            host,
            port,
            server_type,
            server_version: None,
            weight: None,
            register_time: None,
        }
    }

    pub fn default_server_id(host: &str, server_type: &str, port: u16) -> String {
        format!("{}({}):{}", host, server_type, port)
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.server_version = Some(version.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_register_time(mut self, millis: u64) -> Self {
        self.register_time = Some(millis);
        self
    }

    /// `host:port` to connect to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Shallow field inequality: a changed info for the same id means the
    /// old connections must be torn down.
    pub fn is_changed(&self, other: &ServerInfo) -> bool {
        self != other
    }
}
