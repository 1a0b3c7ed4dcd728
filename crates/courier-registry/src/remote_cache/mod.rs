//! Registry stored as one JSON directory blob in a shared cache.
//!
//! Every server writes its `ServerInfo` as a file of the directory at the
//! root path. There is no push notification: each registry polls the blob,
//! quickly right after start and slowly once the cluster settled, and
//! notifies subscribers when the version or the content moved.

mod cache;
mod directory;
#[cfg(feature = "redis")]
mod redis;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use courier_common::config::RemoteCacheConfig;
use courier_common::{Result, RpcError, ServerInfo, ServerMap};

use crate::lifecycle::{Lifecycle, RegistryState};
use crate::subscription::{spawn_subscription, Subscription};
use crate::{Registry, RegistryEvent, EVENT_CHANNEL_CAPACITY};

pub use cache::{MemoryCache, RemoteCache};
pub use directory::{DirectoryBlob, RemoteDirectory, LOCK_TTL, WAIT_LOCK_BUDGET, WAIT_LOCK_STEP};
#[cfg(feature = "redis")]
pub use redis::RedisCache;

pub struct RemoteCacheRegistry {
    shared: Arc<RcShared>,
}

struct RcShared {
    config: RemoteCacheConfig,
    directory: RemoteDirectory,
    lifecycle: Lifecycle,
    seen: Mutex<Seen>,
    /// Bumped whenever `seen` changes
    generation: AtomicU64,
    registered: Mutex<Vec<String>>,
    sync_interval: watch::Sender<Duration>,
    changes: broadcast::Sender<()>,
    events: broadcast::Sender<RegistryEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct Seen {
    /// `None` until the first successful read
    version: Option<u64>,
    servers: ServerMap,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl RemoteCacheRegistry {
    pub fn new(config: RemoteCacheConfig, cache: Arc<dyn RemoteCache>) -> Self {
        let directory = RemoteDirectory::new(
            cache,
            &config.root_path,
            Duration::from_millis(config.expired_time_ms),
        );
        let interval = Duration::from_millis(config.sync_interval_ms);
        Self {
            shared: Arc::new(RcShared {
                config,
                directory,
                lifecycle: Lifecycle::new("remoteRegistry"),
                seen: Mutex::new(Seen::default()),
                generation: AtomicU64::new(0),
                registered: Mutex::new(Vec::new()),
                sync_interval: watch::channel(interval).0,
                changes: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
                events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn root_path(&self) -> &str {
        self.shared.directory.path()
    }

    pub fn directory(&self) -> &RemoteDirectory {
        &self.shared.directory
    }

    /// Changes the poll interval. Takes effect immediately.
    pub fn set_sync_interval(&self, interval: Duration) {
        self.shared.sync_interval.send_replace(interval);
    }

    pub fn sync_interval(&self) -> Duration {
        *self.shared.sync_interval.borrow()
    }

    /// Deletes the whole directory, for every process sharing it.
    pub async fn clear(&self) -> Result<()> {
        self.shared.directory.remove_dir().await
    }
}

impl RcShared {
    async fn refresh(&self) -> Result<ServerMap> {
        let blob = self.directory.read_dir().await?;
        let mut servers = ServerMap::new();
        for (id, value) in blob.files {
            match serde_json::from_value::<ServerInfo>(value) {
                Ok(info) => {
                    servers.insert(id, info);
                }
                Err(e) => warn!(server_id = %id, "skipping malformed server entry: {}", e),
            }
        }

        let changed = {
            let mut seen = lock(&self.seen);
            if seen.version != Some(blob.version) || seen.servers != servers {
                seen.version = Some(blob.version);
                seen.servers = servers.clone();
                self.generation.fetch_add(1, Ordering::SeqCst);
                true
            } else {
                false
            }
        };
        if changed {
            debug!(version = blob.version, servers = servers.len(), "remote registry changed");
            let _ = self.changes.send(());
            let _ = self.events.send(RegistryEvent::Changed);
        }
        Ok(servers)
    }

    async fn sync_loop(self: Arc<Self>) {
        let mut interval = self.sync_interval.subscribe();
        loop {
            if self.lifecycle.is_connected() {
                if let Err(e) = self.refresh().await {
                    debug!("remote registry sync failed: {}", e);
                }
            }
            let period = *interval.borrow_and_update();
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                changed = interval.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn long_sync_switch(self: Arc<Self>) {
        let after = Duration::from_millis(self.config.start_long_sync_ms);
        tokio::time::sleep(after).await;
        info!(
            "[courier-remoteRegistry] start long sync interval after {}ms",
            after.as_millis()
        );
        self.sync_interval
            .send_replace(Duration::from_millis(self.config.long_sync_interval_ms));
    }

    fn abort_tasks(&self) {
        for task in std::mem::take(&mut *lock(&self.tasks)) {
            task.abort();
        }
    }
}

#[async_trait]
impl Registry for RemoteCacheRegistry {
    fn start(&self) {
        if !self.shared.lifecycle.start() {
            return;
        }
        let sync = tokio::spawn(Arc::clone(&self.shared).sync_loop());
        let switch = tokio::spawn(Arc::clone(&self.shared).long_sync_switch());
        lock(&self.shared.tasks).extend([sync, switch]);
        info!(root = %self.root_path(), "remote cache registry started");
        let _ = self.shared.events.send(RegistryEvent::Connection);
    }

    fn stop(&self) {
        if !self.shared.lifecycle.stop() {
            return;
        }
        self.shared.abort_tasks();
        let ids = std::mem::take(&mut *lock(&self.shared.registered));
        if !ids.is_empty() {
            let directory = self.shared.directory.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = directory.remove_files(&ids).await {
                        warn!("failed to remove registered servers on stop: {}", e);
                    }
                });
            }
        }
        let _ = self.shared.events.send(RegistryEvent::Disconnect);
    }

    fn is_connected(&self) -> bool {
        self.shared.lifecycle.is_connected()
    }

    fn state(&self) -> RegistryState {
        self.shared.lifecycle.state()
    }

    async fn register(&self, info: ServerInfo) -> Result<()> {
        self.shared.lifecycle.check("register")?;
        {
            let mut registered = lock(&self.shared.registered);
            if !registered.contains(&info.server_id) {
                registered.push(info.server_id.clone());
            }
        }
        let content = serde_json::to_value(&info)?;
        self.shared
            .directory
            .write_file(&info.server_id, content)
            .await
    }

    async fn unregister(&self, server_id: &str) -> Result<()> {
        self.shared.lifecycle.check("unRegister")?;
        lock(&self.shared.registered).retain(|id| id != server_id);
        self.shared
            .directory
            .remove_files(&[server_id.to_string()])
            .await
    }

    async fn get_server_info(&self, server_id: &str) -> Result<ServerInfo> {
        self.shared.lifecycle.check("getServerInfo")?;
        match self.shared.directory.read_file(server_id).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Err(RpcError::ServerNotFound(format!(
                "unregistered server {}",
                server_id
            ))),
        }
    }

    async fn get_all_servers(&self) -> Result<ServerMap> {
        self.shared.lifecycle.check("getAllServers")?;
        self.shared.refresh().await
    }

    fn subscribe(&self) -> Subscription {
        let shared = Arc::clone(&self.shared);
        let start = shared.generation.load(Ordering::SeqCst);
        let changes = shared.changes.subscribe();
        let events = shared.events.clone();
        spawn_subscription(changes, start, events, move || {
            let snapshot = shared.lifecycle.is_connected().then(|| {
                let seen = lock(&shared.seen);
                (shared.generation.load(Ordering::SeqCst), seen.servers.clone())
            });
            async move { Ok(snapshot) }
        })
    }

    fn events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for RemoteCacheRegistry {
    fn drop(&mut self) {
        self.shared.abort_tasks();
    }
}
