//! In-process ZooKeeper ensemble.
//!
//! Models the parts of ZooKeeper the registry relies on: a znode tree,
//! ephemeral nodes bound to their session, one-shot child watches and digest
//! ACLs. A [`RegistryFactory`](crate::RegistryFactory) configured with
//! `with_memory_zookeeper` serves ZooKeeper configurations from it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use super::session::{
    digest_identity, ZkAcl, ZkConnectOptions, ZkConnector, ZkCreateMode, ZkError, ZkResult,
    ZkSession, ZkSessionState, ZkWatch,
};

/// Shared handle on one in-memory ensemble. Clones see the same tree.
#[derive(Clone, Default)]
pub struct MemoryZk {
    ensemble: Arc<Mutex<Ensemble>>,
}

struct Ensemble {
    nodes: BTreeMap<String, ZNode>,
    sessions: HashMap<u64, watch::Sender<ZkSessionState>>,
    child_watches: HashMap<String, Vec<(u64, oneshot::Sender<()>)>>,
    next_session: u64,
    reachable: bool,
}

impl Default for Ensemble {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            sessions: HashMap::new(),
            child_watches: HashMap::new(),
            next_session: 1,
            reachable: true,
        }
    }
}

struct ZNode {
    data: Vec<u8>,
    owner: Option<u64>,
    acl: ZkAcl,
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

impl Ensemble {
    fn acl_of(&self, path: &str) -> ZkAcl {
        self.nodes
            .get(path)
            .map(|n| n.acl.clone())
            .unwrap_or(ZkAcl::Open)
    }

    fn check_acl(&self, path: &str, identity: Option<&str>) -> ZkResult<()> {
        match self.acl_of(path) {
            ZkAcl::Open => Ok(()),
            ZkAcl::Digest(id) if Some(id.as_str()) == identity => Ok(()),
            ZkAcl::Digest(_) => Err(ZkError::NoAuth(path.to_string())),
        }
    }

    fn node_exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn fire_child_watches(&mut self, parent: &str) {
        if let Some(watches) = self.child_watches.remove(parent) {
            for (_, tx) in watches {
                let _ = tx.send(());
            }
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn close_session(&mut self, id: u64) {
        let Some(state) = self.sessions.remove(&id) else {
            return;
        };
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(id))
            .map(|(k, _)| k.clone())
            .collect();
        for path in owned {
            self.nodes.remove(&path);
            self.fire_child_watches(parent_of(&path));
        }
        // dropping the senders resolves the session's pending watches
        for watches in self.child_watches.values_mut() {
            watches.retain(|(owner, _)| *owner != id);
        }
        state.send_replace(ZkSessionState::Closed);
        debug!(session = id, "memory zookeeper session closed");
    }
}

impl MemoryZk {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Ensemble> {
        self.ensemble
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// When false, new connection attempts never complete.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Every znode path, in order.
    pub fn paths(&self) -> Vec<String> {
        self.lock().nodes.keys().cloned().collect()
    }

    /// Simulates a network partition: every open session drops to
    /// `Disconnected` without losing its ephemeral nodes.
    pub fn disconnect_all(&self) {
        for state in self.lock().sessions.values() {
            state.send_replace(ZkSessionState::Disconnected);
        }
    }

    pub fn reconnect_all(&self) {
        for state in self.lock().sessions.values() {
            state.send_replace(ZkSessionState::Connected);
        }
    }
}

#[async_trait]
impl ZkConnector for MemoryZk {
    async fn connect(&self, options: &ZkConnectOptions) -> ZkResult<Arc<dyn ZkSession>> {
        let reachable = self.lock().reachable;
        if !reachable {
            std::future::pending::<()>().await;
        }
        let (tx, rx) = watch::channel(ZkSessionState::Connected);
        let id = {
            let mut ensemble = self.lock();
            let id = ensemble.next_session;
            ensemble.next_session += 1;
            ensemble.sessions.insert(id, tx);
            id
        };
        debug!(session = id, hosts = %options.hosts, "memory zookeeper session opened");
        Ok(Arc::new(MemorySession {
            zk: self.clone(),
            id,
            identity: options
                .auth
                .as_ref()
                .map(|(user, pass)| digest_identity(user, pass)),
            state: rx,
        }))
    }
}

struct MemorySession {
    zk: MemoryZk,
    id: u64,
    identity: Option<String>,
    state: watch::Receiver<ZkSessionState>,
}

impl MemorySession {
    fn ensemble(&self) -> ZkResult<MutexGuard<'_, Ensemble>> {
        let ensemble = self.zk.lock();
        if ensemble.sessions.contains_key(&self.id) {
            Ok(ensemble)
        } else {
            Err(ZkError::SessionClosed)
        }
    }

    fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }
}

#[async_trait]
impl ZkSession for MemorySession {
    async fn exists(&self, path: &str) -> ZkResult<bool> {
        Ok(self.ensemble()?.node_exists(path))
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: ZkCreateMode, acl: &ZkAcl) -> ZkResult<()> {
        let mut ensemble = self.ensemble()?;
        let parent = parent_of(path);
        if !ensemble.node_exists(parent) {
            return Err(ZkError::NoNode(parent.to_string()));
        }
        ensemble.check_acl(parent, self.identity())?;
        if ensemble.node_exists(path) {
            return Err(ZkError::NodeExists(path.to_string()));
        }
        let owner = match mode {
            ZkCreateMode::Ephemeral => Some(self.id),
            ZkCreateMode::Persistent => None,
        };
        ensemble.nodes.insert(
            path.to_string(),
            ZNode {
                data,
                owner,
                acl: acl.clone(),
            },
        );
        ensemble.fire_child_watches(parent);
        Ok(())
    }

    async fn delete(&self, path: &str) -> ZkResult<()> {
        let mut ensemble = self.ensemble()?;
        if !ensemble.nodes.contains_key(path) {
            return Err(ZkError::NoNode(path.to_string()));
        }
        let parent = parent_of(path);
        ensemble.check_acl(parent, self.identity())?;
        if !ensemble.children(path).is_empty() {
            return Err(ZkError::Other(format!("directory not empty: {}", path)));
        }
        ensemble.nodes.remove(path);
        ensemble.fire_child_watches(parent);
        Ok(())
    }

    async fn get_data(&self, path: &str) -> ZkResult<Vec<u8>> {
        let ensemble = self.ensemble()?;
        let node = ensemble
            .nodes
            .get(path)
            .ok_or_else(|| ZkError::NoNode(path.to_string()))?;
        ensemble.check_acl(path, self.identity())?;
        Ok(node.data.clone())
    }

    async fn get_children(&self, path: &str) -> ZkResult<Vec<String>> {
        let ensemble = self.ensemble()?;
        if !ensemble.node_exists(path) {
            return Err(ZkError::NoNode(path.to_string()));
        }
        ensemble.check_acl(path, self.identity())?;
        Ok(ensemble.children(path))
    }

    async fn watch_children(&self, path: &str) -> ZkResult<(Vec<String>, ZkWatch)> {
        let mut ensemble = self.ensemble()?;
        if !ensemble.node_exists(path) {
            return Err(ZkError::NoNode(path.to_string()));
        }
        ensemble.check_acl(path, self.identity())?;
        let (tx, rx) = oneshot::channel();
        ensemble
            .child_watches
            .entry(path.to_string())
            .or_default()
            .push((self.id, tx));
        let children = ensemble.children(path);
        let watch: ZkWatch = Box::pin(async move {
            let _ = rx.await;
        });
        Ok((children, watch))
    }

    async fn set_acl(&self, path: &str, acl: &ZkAcl) -> ZkResult<()> {
        let mut ensemble = self.ensemble()?;
        ensemble.check_acl(path, self.identity())?;
        let node = ensemble
            .nodes
            .get_mut(path)
            .ok_or_else(|| ZkError::NoNode(path.to_string()))?;
        node.acl = acl.clone();
        Ok(())
    }

    fn state(&self) -> watch::Receiver<ZkSessionState> {
        self.state.clone()
    }

    fn close(&self) {
        self.zk.lock().close_session(self.id);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.zk.lock().close_session(self.id);
    }
}
