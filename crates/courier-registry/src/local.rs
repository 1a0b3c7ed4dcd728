//! In-process registry.
//!
//! Registries created from the same [`LocalRegistryHub`] with the same root
//! path observe each other's registrations, the way separate processes
//! sharing a ZooKeeper root would. Change notifications are delayed by
//! `change_delay_ms` to model propagation and to coalesce bursts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use courier_common::config::LocalRegistryConfig;
use courier_common::util::normalize_dir_path;
use courier_common::{Result, RpcError, ServerInfo, ServerMap};

use crate::lifecycle::{Lifecycle, RegistryState};
use crate::subscription::{spawn_subscription, Subscription};
use crate::{Registry, RegistryEvent, EVENT_CHANNEL_CAPACITY};

/// Process-wide directory of local registries, keyed by root path.
///
/// Pass one hub by reference to every local registry that should see the
/// others. A directory lives while at least one registry is joined to it.
#[derive(Default)]
pub struct LocalRegistryHub {
    directories: Mutex<HashMap<String, Arc<LocalDirectory>>>,
}

impl LocalRegistryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a registry joined to the directory of `config.root_path`.
    pub fn registry(self: &Arc<Self>, config: &LocalRegistryConfig) -> LocalRegistry {
        let root_path = normalize_dir_path(&config.root_path);
        let directory = self.join(&root_path);
        let member = directory.add_member();
        LocalRegistry {
            hub: Arc::clone(self),
            directory,
            member,
            root_path,
            change_delay: Duration::from_millis(config.change_delay_ms),
            lifecycle: Lifecycle::new("localRegistry"),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }

    /// Number of registries joined under `root_path`.
    pub fn member_count(&self, root_path: &str) -> usize {
        let root_path = normalize_dir_path(root_path);
        self.lock()
            .get(&root_path)
            .map(|d| d.state().members.len())
            .unwrap_or(0)
    }

    fn join(&self, root_path: &str) -> Arc<LocalDirectory> {
        let mut directories = self.lock();
        Arc::clone(
            directories
                .entry(root_path.to_string())
                .or_insert_with(|| Arc::new(LocalDirectory::new())),
        )
    }

    /// Drops the directory once its last member left.
    fn leave(&self, root_path: &str, directory: &Arc<LocalDirectory>) {
        let mut directories = self.lock();
        let empty = directory.state().members.is_empty();
        let current = directories
            .get(root_path)
            .map(|d| Arc::ptr_eq(d, directory))
            .unwrap_or(false);
        if empty && current {
            directories.remove(root_path);
            debug!(root_path, "local registry directory cleared");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<LocalDirectory>>> {
        self.directories
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct LocalDirectory {
    state: Mutex<DirectoryState>,
    changes: broadcast::Sender<()>,
}

#[derive(Default)]
struct DirectoryState {
    members: BTreeMap<u64, Member>,
    next_member: u64,
    version: u64,
}

#[derive(Default)]
struct Member {
    started: bool,
    servers: ServerMap,
}

impl DirectoryState {
    fn live_servers(&self) -> ServerMap {
        self.members
            .values()
            .filter(|m| m.started)
            .flat_map(|m| m.servers.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }

    fn claim(&mut self, member: u64, info: ServerInfo) {
        for m in self.members.values_mut() {
            m.servers.remove(&info.server_id);
        }
        if let Some(m) = self.members.get_mut(&member) {
            m.servers.insert(info.server_id.clone(), info);
        }
    }
}

impl LocalDirectory {
    fn new() -> Self {
        Self {
            state: Mutex::new(DirectoryState::default()),
            changes: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }

    fn state(&self) -> MutexGuard<'_, DirectoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_member(&self) -> u64 {
        let mut state = self.state();
        let id = state.next_member;
        state.next_member += 1;
        state.members.insert(id, Member::default());
        id
    }

    /// Bumps the version and notifies every member after `delay`.
    fn emit_changed(&self, delay: Duration) {
        {
            let mut state = self.state();
            state.version += 1;
        }
        let changes = self.changes.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let _ = changes.send(());
                });
            }
            Err(_) => {
                let _ = changes.send(());
            }
        }
    }
}

/// One handle on a shared local directory.
///
/// Dropping a started registry without calling `stop()` behaves like a
/// crashed process: its registrations disappear for everyone else.
pub struct LocalRegistry {
    hub: Arc<LocalRegistryHub>,
    directory: Arc<LocalDirectory>,
    member: u64,
    root_path: String,
    change_delay: Duration,
    lifecycle: Lifecycle,
    events: broadcast::Sender<RegistryEvent>,
}

impl LocalRegistry {
    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// Registers every server of `servers` with a single change notification.
    pub async fn register_more(&self, servers: ServerMap) -> Result<()> {
        self.lifecycle.check("register")?;
        {
            let mut state = self.directory.state();
            for info in servers.into_values() {
                state.claim(self.member, info);
            }
        }
        self.directory.emit_changed(self.change_delay);
        Ok(())
    }

    fn leave(&self) {
        let was_member = self.directory.state().members.remove(&self.member).is_some();
        if was_member {
            self.hub.leave(&self.root_path, &self.directory);
            self.directory.emit_changed(self.change_delay);
        }
    }
}

#[async_trait]
impl Registry for LocalRegistry {
    fn start(&self) {
        if !self.lifecycle.start() {
            return;
        }
        if let Some(m) = self.directory.state().members.get_mut(&self.member) {
            m.started = true;
        }
        info!(root_path = %self.root_path, "local registry started");
        let _ = self.events.send(RegistryEvent::Connection);
    }

    fn stop(&self) {
        if !self.lifecycle.stop() {
            return;
        }
        self.leave();
        let _ = self.events.send(RegistryEvent::Disconnect);
    }

    fn is_connected(&self) -> bool {
        self.lifecycle.is_connected()
    }

    fn state(&self) -> RegistryState {
        self.lifecycle.state()
    }

    async fn register(&self, info: ServerInfo) -> Result<()> {
        self.lifecycle.check("register")?;
        self.directory.state().claim(self.member, info);
        self.directory.emit_changed(self.change_delay);
        Ok(())
    }

    async fn unregister(&self, server_id: &str) -> Result<()> {
        self.lifecycle.check("unRegister")?;
        if let Some(m) = self.directory.state().members.get_mut(&self.member) {
            m.servers.remove(server_id);
        }
        self.directory.emit_changed(self.change_delay);
        Ok(())
    }

    async fn get_server_info(&self, server_id: &str) -> Result<ServerInfo> {
        self.lifecycle.check("getServerInfo")?;
        let state = self.directory.state();
        state
            .members
            .values()
            .find_map(|m| m.servers.get(server_id).cloned())
            .ok_or_else(|| RpcError::ServerNotFound(format!("unregistered server {}", server_id)))
    }

    async fn get_all_servers(&self) -> Result<ServerMap> {
        self.lifecycle.check("getAllServers")?;
        Ok(self.directory.state().live_servers())
    }

    fn subscribe(&self) -> Subscription {
        let directory = Arc::clone(&self.directory);
        let start_version = directory.state().version;
        let changes = directory.changes.subscribe();
        let member = self.member;
        spawn_subscription(changes, start_version, self.events.clone(), move || {
            let snapshot = {
                let state = directory.state();
                let running = state.members.get(&member).map(|m| m.started).unwrap_or(false);
                running.then(|| (state.version, state.live_servers()))
            };
            async move { Ok(snapshot) }
        })
    }

    fn events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}

impl Drop for LocalRegistry {
    fn drop(&mut self) {
        self.leave();
    }
}
