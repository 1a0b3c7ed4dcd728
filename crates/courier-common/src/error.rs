use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes carried on the wire next to an error message.
pub mod codes {
    pub const CONNECTION_LOSS: &str = "CONNECTION_LOSS";
    pub const SERVER_NOT_FOUND: &str = "SERVER_NOT_FOUND";
    pub const NO_SERVER_FOUND: &str = "NO_SERVER_FOUND";
    pub const SERVICE_NOT_FOUND: &str = "SERVICE_NOT_FOUND";
    pub const SERVER_CLOSED: &str = "SERVER_CLOSED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const FAIL_TO_SEND: &str = "FAIL_TO_SEND";
    pub const NOT_RUNNING: &str = "NOT_RUNNING";
    pub const INVALID_STATE: &str = "INVALID_STATE";
    pub const REGISTRY: &str = "REGISTRY_ERROR";
    pub const TRANSPORT: &str = "TRANSPORT_ERROR";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const IO: &str = "IO_ERROR";
    pub const JSON: &str = "JSON_ERROR";
    pub const RPC_FAIL: &str = "RPC_FAIL";
}

/// Every failure an RPC call, a registry operation or a server can surface.
///
/// The typed kinds carry their full human readable message so that a kind
/// reconstructed from the wire prints exactly what the remote side printed.
#[derive(Error, Debug)]
pub enum RpcError {
    /// A registry was used before `start()` or after `stop()`.
    #[error("{0}")]
    ConnectionLoss(String),

    /// No `ServerInfo` for the requested server id, even after retrying.
    #[error("{0}")]
    ServerNotFound(String),

    /// A router was handed an empty candidate list.
    #[error("{0}")]
    NoServerFound(String),

    /// The remote server has no service with the requested name.
    #[error("{0}")]
    ServiceNotFound(String),

    /// The remote server is shutting down or the connection to it dropped.
    #[error("{0}")]
    ServerClosed(String),

    /// No correlated response arrived in time, or a backend connect timed out.
    #[error("{0}")]
    Timeout(String),

    /// Transport level send failure.
    #[error("{0}")]
    FailToSend(String),

    /// Client or mailstation used outside its running state.
    #[error("{0}")]
    NotRunning(String),

    /// Component used in the wrong lifecycle state (started twice, and so on).
    #[error("{0}")]
    InvalidState(String),

    /// Error thrown by a remote service that maps to no known kind.
    #[error("{message}")]
    Remote { code: String, message: String },

    #[error("registry error: {0}")]
    Registry(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// Creates an application level service error with the generic `RPC_FAIL` code.
    pub fn service(message: impl Into<String>) -> Self {
        RpcError::Remote {
            code: codes::RPC_FAIL.to_string(),
            message: message.into(),
        }
    }

    /// Returns the stable wire code of this error.
    pub fn code(&self) -> &str {
        match self {
            RpcError::ConnectionLoss(_) => codes::CONNECTION_LOSS,
            RpcError::ServerNotFound(_) => codes::SERVER_NOT_FOUND,
            RpcError::NoServerFound(_) => codes::NO_SERVER_FOUND,
            RpcError::ServiceNotFound(_) => codes::SERVICE_NOT_FOUND,
            RpcError::ServerClosed(_) => codes::SERVER_CLOSED,
            RpcError::Timeout(_) => codes::TIMEOUT,
            RpcError::FailToSend(_) => codes::FAIL_TO_SEND,
            RpcError::NotRunning(_) => codes::NOT_RUNNING,
            RpcError::InvalidState(_) => codes::INVALID_STATE,
            RpcError::Remote { code, .. } => code.as_str(),
            RpcError::Registry(_) => codes::REGISTRY,
            RpcError::Transport(_) => codes::TRANSPORT,
            RpcError::InvalidMessage(_) => codes::INVALID_MESSAGE,
            RpcError::Io(_) => codes::IO,
            RpcError::Json(_) => codes::JSON,
        }
    }

    /// Serializes this error for a response envelope.
    pub fn to_wire(&self) -> WireError {
        WireError {
            message: self.to_string(),
            code: self.code().to_string(),
            stack: None,
        }
    }

    /// Rebuilds a typed error from a response envelope's `error` field.
    ///
    /// Known codes map back to their kind; anything else becomes
    /// [`RpcError::Remote`] so the remote code is never lost.
    pub fn from_wire(wire: WireError) -> Self {
        let WireError { message, code, .. } = wire;
        match code.as_str() {
            codes::CONNECTION_LOSS => RpcError::ConnectionLoss(message),
            codes::SERVER_NOT_FOUND => RpcError::ServerNotFound(message),
            codes::NO_SERVER_FOUND => RpcError::NoServerFound(message),
            codes::SERVICE_NOT_FOUND => RpcError::ServiceNotFound(message),
            codes::SERVER_CLOSED => RpcError::ServerClosed(message),
            codes::TIMEOUT => RpcError::Timeout(message),
            codes::FAIL_TO_SEND => RpcError::FailToSend(message),
            codes::NOT_RUNNING => RpcError::NotRunning(message),
            codes::INVALID_STATE => RpcError::InvalidState(message),
            _ => RpcError::Remote { code, message },
        }
    }
}

/// Serialized form of an error inside a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(default)]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_survive_the_wire() {
        let cases = vec![
            RpcError::ServiceNotFound("no such service: missing.".into()),
            RpcError::ServerClosed("Server \"S1\" is closed".into()),
            RpcError::Timeout("rpc callback timeout 200".into()),
            RpcError::ConnectionLoss("registry is stopped".into()),
        ];

        for err in cases {
            let message = err.to_string();
            let code = err.code().to_string();
            let back = RpcError::from_wire(err.to_wire());
            assert_eq!(back.code(), code);
            assert_eq!(back.to_string(), message);
        }
    }

    #[test]
    fn test_unknown_code_becomes_remote() {
        let wire = WireError {
            message: "boom".into(),
            code: "GAME_OVER".into(),
            stack: Some("at foo".into()),
        };
        match RpcError::from_wire(wire) {
            RpcError::Remote { code, message } => {
                assert_eq!(code, "GAME_OVER");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_service_error_uses_rpc_fail() {
        let err = RpcError::service("bad input");
        assert_eq!(err.code(), codes::RPC_FAIL);
        assert_eq!(err.to_string(), "bad input");
    }

    #[test]
    fn test_wire_error_skips_missing_stack() {
        let json = serde_json::to_value(RpcError::NotRunning("x".into()).to_wire()).unwrap();
        assert!(json.get("stack").is_none());
        assert_eq!(json["code"], codes::NOT_RUNNING);
    }
}
