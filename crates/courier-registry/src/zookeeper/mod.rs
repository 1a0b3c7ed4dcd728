//! ZooKeeper backed registry.
//!
//! Each server is an ephemeral znode `<root>/<serverId>` holding its
//! `ServerInfo` as JSON, so a crashed process disappears with its session.
//! A children watch on the root drives subscriptions.

mod memory;
pub mod session;

#[cfg(feature = "zookeeper")]
mod client;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use courier_common::config::{ZookeeperConfig, REGISTRY_CHANGE_DELAY_MS};
use courier_common::util::normalize_dir_path;
use courier_common::{Result, RpcError, ServerInfo, ServerMap};

use crate::lifecycle::{Lifecycle, RegistryState};
use crate::subscription::{spawn_subscription, Subscription};
use crate::{Registry, RegistryEvent, EVENT_CHANNEL_CAPACITY};

pub use memory::MemoryZk;
pub use session::{
    digest_identity, ZkAcl, ZkConnectOptions, ZkConnector, ZkCreateMode, ZkError, ZkSession,
    ZkSessionState,
};

#[cfg(feature = "zookeeper")]
pub use client::ZkClientConnector;

pub struct ZookeeperRegistry {
    shared: Arc<ZkShared>,
}

struct ZkShared {
    config: ZookeeperConfig,
    root: String,
    connector: Arc<dyn ZkConnector>,
    acl: ZkAcl,
    lifecycle: Lifecycle,
    session: watch::Sender<Option<Arc<dyn ZkSession>>>,
    root_ready: tokio::sync::Mutex<bool>,
    version: AtomicU64,
    changes: broadcast::Sender<()>,
    events: broadcast::Sender<RegistryEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ZookeeperRegistry {
    pub fn new(config: ZookeeperConfig, connector: Arc<dyn ZkConnector>) -> Self {
        let acl = match config.credentials() {
            Some((user, pass)) => ZkAcl::Digest(digest_identity(user, pass)),
            None => ZkAcl::Open,
        };
        let root = normalize_dir_path(&config.root_path);
        Self {
            shared: Arc::new(ZkShared {
                config,
                root,
                connector,
                acl,
                lifecycle: Lifecycle::new("zookeeperRegistry"),
                session: watch::channel(None).0,
                root_ready: tokio::sync::Mutex::new(false),
                version: AtomicU64::new(0),
                changes: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
                events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registry talking to a real ensemble at `config.hosts`.
    #[cfg(feature = "zookeeper")]
    pub fn with_client(config: ZookeeperConfig) -> Self {
        Self::new(config, Arc::new(ZkClientConnector))
    }

    pub fn root_path(&self) -> &str {
        &self.shared.root
    }
}

impl ZkShared {
    fn connect_options(&self) -> ZkConnectOptions {
        ZkConnectOptions {
            hosts: self.config.hosts.clone(),
            session_timeout: self.config.session_timeout(),
            connect_timeout: self.config.connect_timeout(),
            auth: self
                .config
                .credentials()
                .map(|(u, p)| (u.to_string(), p.to_string())),
        }
    }

    fn node_path(&self, server_id: &str) -> String {
        format!("{}/{}", self.root, server_id)
    }

    /// Waits for the session, bounded by the connect timeout.
    async fn session(&self, op: &str) -> Result<Arc<dyn ZkSession>> {
        self.lifecycle.check(op)?;
        let mut rx = self.session.subscribe();
        let timeout = self.config.connect_timeout();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.is_some()).await.map(|s| Option::clone(&s))
        })
        .await;
        match waited {
            Ok(Ok(session)) => session.ok_or_else(|| self.closed(op)),
            Ok(Err(_)) => Err(self.closed(op)),
            Err(_) => Err(RpcError::Timeout(format!(
                "[courier-zookeeperRegistry] ({}) connect to {} timeout {}ms",
                op,
                self.config.hosts,
                timeout.as_millis()
            ))),
        }
    }

    fn closed(&self, op: &str) -> RpcError {
        RpcError::ConnectionLoss(format!(
            "[courier-zookeeperRegistry] ({}) CONNECTION_LOSS: session closed",
            op
        ))
    }

    /// Creates the root on first use and restricts it to our identity when
    /// credentials are configured.
    async fn ensure_root(&self, session: &dyn ZkSession) -> Result<()> {
        let mut ready = self.root_ready.lock().await;
        if *ready {
            return Ok(());
        }
        session::mkdirp(session, &self.root, &ZkAcl::Open).await?;
        if let ZkAcl::Digest(_) = self.acl {
            if let Err(e) = session.set_acl(&self.root, &self.acl).await {
                error!(root = %self.root, "failed to set ACL: {}", e);
            }
        }
        *ready = true;
        Ok(())
    }

    async fn ready_session(&self, op: &str) -> Result<Arc<dyn ZkSession>> {
        let session = self.session(op).await?;
        self.ensure_root(&*session).await?;
        Ok(session)
    }

    async fn read_server(&self, session: &dyn ZkSession, server_id: &str) -> Result<Option<ServerInfo>> {
        match session.get_data(&self.node_path(server_id)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(ZkError::NoNode(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn all_servers(&self) -> Result<ServerMap> {
        let session = self.ready_session("getAllServers").await?;
        let children = session.get_children(&self.root).await?;
        let mut servers = ServerMap::new();
        for id in children {
            // removed between the listing and the read
            if let Some(info) = self.read_server(&*session, &id).await? {
                servers.insert(info.server_id.clone(), info);
            }
        }
        Ok(servers)
    }

    async fn run(self: Arc<Self>) {
        let options = self.connect_options();
        let session = match self.connector.connect(&options).await {
            Ok(session) => session,
            Err(e) => {
                error!(hosts = %options.hosts, "zookeeper connect failed: {}", e);
                let _ = self.events.send(RegistryEvent::Error(e.to_string()));
                return;
            }
        };
        if !self.lifecycle.is_connected() {
            session.close();
            return;
        }
        self.session.send_replace(Some(Arc::clone(&session)));
        info!(hosts = %options.hosts, "[courier-rpc] zookeeper client connected");
        let _ = self.events.send(RegistryEvent::Connection);

        tokio::join!(
            self.watch_state(Arc::clone(&session)),
            self.watch_children(session)
        );
    }

    async fn watch_state(&self, session: Arc<dyn ZkSession>) {
        let mut state = session.state();
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            match current {
                ZkSessionState::Disconnected => {
                    error!("[courier-rpc] zookeeper client disconnect");
                    let _ = self.events.send(RegistryEvent::Disconnect);
                }
                ZkSessionState::Connected => {
                    info!("[courier-rpc] zookeeper client reconnected");
                    let _ = self.events.send(RegistryEvent::Connection);
                }
                ZkSessionState::Closed => break,
            }
        }
    }

    /// Re-arms the root children watch forever. Watches firing within
    /// `REGISTRY_CHANGE_DELAY_MS` of each other produce one notification.
    async fn watch_children(&self, session: Arc<dyn ZkSession>) {
        if let Err(e) = self.ensure_root(&*session).await {
            error!(root = %self.root, "zookeeper root unavailable: {}", e);
            let _ = self.events.send(RegistryEvent::Error(e.to_string()));
            return;
        }
        let settle = Duration::from_millis(REGISTRY_CHANGE_DELAY_MS);
        let mut fired = false;
        loop {
            let watch = match session.watch_children(&self.root).await {
                Ok((_, watch)) => watch,
                Err(ZkError::SessionClosed) => return,
                Err(e) => {
                    warn!(root = %self.root, "zookeeper children watch failed: {}", e);
                    let _ = self.events.send(RegistryEvent::Error(e.to_string()));
                    return;
                }
            };
            if fired {
                self.version.fetch_add(1, Ordering::SeqCst);
                let _ = self.changes.send(());
                let _ = self.events.send(RegistryEvent::Changed);
            }
            watch.await;
            if *session.state().borrow() == ZkSessionState::Closed {
                return;
            }
            tokio::time::sleep(settle).await;
            fired = true;
        }
    }

    fn shutdown(&self) {
        let tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }
        if let Some(session) = self.session.send_replace(None) {
            session.close();
        }
    }
}

#[async_trait]
impl Registry for ZookeeperRegistry {
    fn start(&self) {
        if !self.shared.lifecycle.start() {
            return;
        }
        let task = tokio::spawn(Arc::clone(&self.shared).run());
        self.shared
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(task);
    }

    fn stop(&self) {
        if !self.shared.lifecycle.stop() {
            return;
        }
        self.shared.shutdown();
        info!(root = %self.shared.root, "zookeeper registry stopped");
        let _ = self.shared.events.send(RegistryEvent::Disconnect);
    }

    fn is_connected(&self) -> bool {
        self.shared.lifecycle.is_connected()
    }

    fn state(&self) -> RegistryState {
        self.shared.lifecycle.state()
    }

    async fn register(&self, info: ServerInfo) -> Result<()> {
        let session = self.shared.ready_session("register").await?;
        let path = self.shared.node_path(&info.server_id);
        let data = serde_json::to_vec(&info)?;
        if session.exists(&path).await? {
            match session.delete(&path).await {
                Ok(()) | Err(ZkError::NoNode(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        session
            .create(&path, data, ZkCreateMode::Ephemeral, &self.shared.acl)
            .await?;
        Ok(())
    }

    async fn unregister(&self, server_id: &str) -> Result<()> {
        let session = self.shared.ready_session("unRegister").await?;
        match session.delete(&self.shared.node_path(server_id)).await {
            Ok(()) | Err(ZkError::NoNode(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_server_info(&self, server_id: &str) -> Result<ServerInfo> {
        let session = self.shared.ready_session("getServerInfo").await?;
        self.shared
            .read_server(&*session, server_id)
            .await?
            .ok_or_else(|| RpcError::ServerNotFound(format!("unregistered server {}", server_id)))
    }

    async fn get_all_servers(&self) -> Result<ServerMap> {
        self.shared.all_servers().await
    }

    fn subscribe(&self) -> Subscription {
        let shared = Arc::clone(&self.shared);
        let start_version = shared.version.load(Ordering::SeqCst);
        let changes = shared.changes.subscribe();
        let events = shared.events.clone();
        spawn_subscription(changes, start_version, events, move || {
            let shared = Arc::clone(&shared);
            async move {
                if !shared.lifecycle.is_connected() {
                    return Ok(None);
                }
                let version = shared.version.load(Ordering::SeqCst);
                let servers = shared.all_servers().await?;
                Ok(Some((version, servers)))
            }
        })
    }

    fn events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for ZookeeperRegistry {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}
