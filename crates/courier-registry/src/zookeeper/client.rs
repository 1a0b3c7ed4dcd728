//! [`ZkSession`] over the `zookeeper-client` crate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;
use zookeeper_client as zk;

use super::session::{
    ZkAcl, ZkConnectOptions, ZkConnector, ZkCreateMode, ZkError, ZkResult, ZkSession,
    ZkSessionState, ZkWatch,
};

/// Connects to a real ZooKeeper ensemble.
pub struct ZkClientConnector;

fn map_error(path: &str, e: zk::Error) -> ZkError {
    match e {
        zk::Error::NoNode => ZkError::NoNode(path.to_string()),
        zk::Error::NodeExists => ZkError::NodeExists(path.to_string()),
        zk::Error::NoAuth => ZkError::NoAuth(path.to_string()),
        zk::Error::ClientClosed | zk::Error::SessionExpired => ZkError::SessionClosed,
        other => ZkError::Other(other.to_string()),
    }
}

fn acls(acl: &ZkAcl) -> zk::Acls<'static> {
    match acl {
        ZkAcl::Open => zk::Acls::anyone_all(),
        ZkAcl::Digest(_) => zk::Acls::creator_all(),
    }
}

#[async_trait]
impl ZkConnector for ZkClientConnector {
    async fn connect(&self, options: &ZkConnectOptions) -> ZkResult<Arc<dyn ZkSession>> {
        let mut connector = zk::Client::connector();
        connector.session_timeout(options.session_timeout);
        connector.connection_timeout(options.connect_timeout);
        let client = connector
            .connect(&options.hosts)
            .await
            .map_err(|e| map_error(&options.hosts, e))?;
        if let Some((user, pass)) = &options.auth {
            client
                .auth("digest".to_string(), format!("{}:{}", user, pass).into_bytes())
                .await
                .map_err(|e| map_error(&options.hosts, e))?;
        }

        let (tx, rx) = watch::channel(ZkSessionState::Connected);
        let mut states = client.state_watcher();
        tokio::spawn(async move {
            loop {
                let state = match states.changed().await {
                    zk::SessionState::SyncConnected | zk::SessionState::ConnectedReadOnly => {
                        ZkSessionState::Connected
                    }
                    zk::SessionState::Disconnected => ZkSessionState::Disconnected,
                    _ => ZkSessionState::Closed,
                };
                debug!(?state, "zookeeper session state changed");
                let closed = state == ZkSessionState::Closed;
                if tx.send(state).is_err() || closed {
                    break;
                }
            }
        });

        Ok(Arc::new(ClientSession {
            client: Mutex::new(Some(client)),
            state: rx,
        }))
    }
}

struct ClientSession {
    client: Mutex<Option<zk::Client>>,
    state: watch::Receiver<ZkSessionState>,
}

impl ClientSession {
    fn client(&self) -> ZkResult<zk::Client> {
        self.client
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or(ZkError::SessionClosed)
    }
}

#[async_trait]
impl ZkSession for ClientSession {
    async fn exists(&self, path: &str) -> ZkResult<bool> {
        let client = self.client()?;
        let stat = client.check_stat(path).await.map_err(|e| map_error(path, e))?;
        Ok(stat.is_some())
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: ZkCreateMode, acl: &ZkAcl) -> ZkResult<()> {
        let client = self.client()?;
        let mode = match mode {
            ZkCreateMode::Persistent => zk::CreateMode::Persistent,
            ZkCreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        };
        let options = mode.with_acls(acls(acl));
        client
            .create(path, &data, &options)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> ZkResult<()> {
        let client = self.client()?;
        client.delete(path, None).await.map_err(|e| map_error(path, e))
    }

    async fn get_data(&self, path: &str) -> ZkResult<Vec<u8>> {
        let client = self.client()?;
        let (data, _) = client.get_data(path).await.map_err(|e| map_error(path, e))?;
        Ok(data)
    }

    async fn get_children(&self, path: &str) -> ZkResult<Vec<String>> {
        let client = self.client()?;
        client.list_children(path).await.map_err(|e| map_error(path, e))
    }

    async fn watch_children(&self, path: &str) -> ZkResult<(Vec<String>, ZkWatch)> {
        let client = self.client()?;
        let (children, _, watcher) = client
            .get_and_watch_children(path)
            .await
            .map_err(|e| map_error(path, e))?;
        let watch: ZkWatch = Box::pin(async move {
            watcher.changed().await;
        });
        Ok((children, watch))
    }

    async fn set_acl(&self, path: &str, acl: &ZkAcl) -> ZkResult<()> {
        let client = self.client()?;
        client
            .set_acl(path, &acls(acl), None)
            .await
            .map_err(|e| map_error(path, e))?;
        Ok(())
    }

    fn state(&self) -> watch::Receiver<ZkSessionState> {
        self.state.clone()
    }

    fn close(&self) {
        // the session ends when the last clone of the client is dropped
        self.client.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}
