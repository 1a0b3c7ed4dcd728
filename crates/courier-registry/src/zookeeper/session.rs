//! Abstraction over a ZooKeeper client session.
//!
//! [`ZookeeperRegistry`](super::ZookeeperRegistry) only needs a handful of
//! znode operations. They are expressed as the [`ZkSession`] trait so the
//! registry runs the same against a real ensemble and against
//! [`MemoryZk`](super::MemoryZk).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::sync::watch;

use courier_common::RpcError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ZkError {
    #[error("no node: {0}")]
    NoNode(String),

    #[error("node exists: {0}")]
    NodeExists(String),

    #[error("not authenticated for {0}")]
    NoAuth(String),

    #[error("session closed")]
    SessionClosed,

    #[error("{0}")]
    Other(String),
}

impl From<ZkError> for RpcError {
    fn from(e: ZkError) -> Self {
        match e {
            ZkError::SessionClosed => RpcError::ConnectionLoss(
                "[courier-zookeeperRegistry] CONNECTION_LOSS: session closed".to_string(),
            ),
            other => RpcError::Registry(format!("zookeeper: {}", other)),
        }
    }
}

pub type ZkResult<T> = std::result::Result<T, ZkError>;

/// Access control applied to the znodes a session creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZkAcl {
    /// world:anyone with all permissions
    Open,
    /// Full access for one digest identity only
    Digest(String),
}

/// Digest identity ZooKeeper derives from `user:password`:
/// `user:base64(sha1(user:password))`.
pub fn digest_identity(username: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{}:{}", username, password).as_bytes());
    let digest = base64::engine::general_purpose::STANDARD.encode(hasher.finalize());
    format!("{}:{}", username, digest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZkCreateMode {
    Persistent,
    Ephemeral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZkSessionState {
    Connected,
    Disconnected,
    Closed,
}

/// Resolves once when the watched children change or the session ends.
pub type ZkWatch = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Debug, Clone)]
pub struct ZkConnectOptions {
    pub hosts: String,
    pub session_timeout: Duration,
    pub connect_timeout: Duration,
    /// `(username, password)` for the digest scheme
    pub auth: Option<(String, String)>,
}

/// Opens sessions against an ensemble.
#[async_trait]
pub trait ZkConnector: Send + Sync {
    async fn connect(&self, options: &ZkConnectOptions) -> ZkResult<Arc<dyn ZkSession>>;
}

#[async_trait]
pub trait ZkSession: Send + Sync {
    async fn exists(&self, path: &str) -> ZkResult<bool>;

    async fn create(&self, path: &str, data: Vec<u8>, mode: ZkCreateMode, acl: &ZkAcl) -> ZkResult<()>;

    async fn delete(&self, path: &str) -> ZkResult<()>;

    async fn get_data(&self, path: &str) -> ZkResult<Vec<u8>>;

    async fn get_children(&self, path: &str) -> ZkResult<Vec<String>>;

    /// Lists children and arms a one-shot watch on them.
    async fn watch_children(&self, path: &str) -> ZkResult<(Vec<String>, ZkWatch)>;

    async fn set_acl(&self, path: &str, acl: &ZkAcl) -> ZkResult<()>;

    fn state(&self) -> watch::Receiver<ZkSessionState>;

    /// Ends the session. Ephemeral nodes it owns disappear.
    fn close(&self);
}

/// Creates every missing persistent node on `path`.
pub async fn mkdirp(session: &dyn ZkSession, path: &str, acl: &ZkAcl) -> ZkResult<()> {
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        if session.exists(&current).await? {
            continue;
        }
        match session.create(&current, Vec::new(), ZkCreateMode::Persistent, acl).await {
            Ok(()) | Err(ZkError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_identity() {
        // base64(sha1("admin:secret"))
        assert_eq!(
            digest_identity("admin", "secret"),
            "admin:fvr2cB/fjGeAiX8g1aGhUm3ZICk="
        );
    }

    #[test]
    fn test_session_closed_is_connection_loss() {
        let err: RpcError = ZkError::SessionClosed.into();
        assert!(matches!(err, RpcError::ConnectionLoss(_)));
        let err: RpcError = ZkError::NoAuth("/x".into()).into();
        assert!(matches!(err, RpcError::Registry(_)));
    }
}
