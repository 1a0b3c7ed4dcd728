use std::sync::Arc;

use tracing::info;

use courier_common::config::RegistryConfig;
use courier_common::Result;

use crate::local::LocalRegistryHub;
use crate::remote_cache::{MemoryCache, RemoteCache, RemoteCacheRegistry};
use crate::zookeeper::{MemoryZk, ZkConnector, ZookeeperRegistry};
use crate::Registry;

/// Builds registries from configuration.
///
/// Local registries built by one factory share its hub, and remote cache
/// registries without a url share its in-process cache, so every endpoint
/// created from the same factory sees the same cluster.
#[derive(Clone)]
pub struct RegistryFactory {
    hub: Arc<LocalRegistryHub>,
    memory_cache: MemoryCache,
    memory_zk: Option<MemoryZk>,
}

impl Default for RegistryFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryFactory {
    pub fn new() -> Self {
        Self {
            hub: LocalRegistryHub::new(),
            memory_cache: MemoryCache::new(),
            memory_zk: None,
        }
    }

    /// Serves ZooKeeper configurations from `zk` instead of a real ensemble.
    pub fn with_memory_zookeeper(mut self, zk: MemoryZk) -> Self {
        self.memory_zk = Some(zk);
        self
    }

    pub fn hub(&self) -> &Arc<LocalRegistryHub> {
        &self.hub
    }

    pub fn memory_cache(&self) -> &MemoryCache {
        &self.memory_cache
    }

    pub async fn build(&self, config: &RegistryConfig) -> Result<Arc<dyn Registry>> {
        let registry: Arc<dyn Registry> = match config {
            RegistryConfig::Local(c) => Arc::new(self.hub.registry(c)),
            RegistryConfig::Zookeeper(c) => {
                Arc::new(ZookeeperRegistry::new(c.clone(), self.zookeeper_connector()?))
            }
            RegistryConfig::RemoteCache(c) => {
                let cache = self.remote_cache(c.url.as_deref()).await?;
                Arc::new(RemoteCacheRegistry::new(c.clone(), cache))
            }
        };
        info!(root = %config.root_path(), "registry created");
        Ok(registry)
    }

    fn zookeeper_connector(&self) -> Result<Arc<dyn ZkConnector>> {
        if let Some(zk) = &self.memory_zk {
            return Ok(Arc::new(zk.clone()));
        }
        #[cfg(feature = "zookeeper")]
        {
            Ok(Arc::new(crate::zookeeper::ZkClientConnector))
        }
        #[cfg(not(feature = "zookeeper"))]
        {
            Err(courier_common::RpcError::Registry(
                "zookeeper registry requires the `zookeeper` feature".to_string(),
            ))
        }
    }

    async fn remote_cache(&self, url: Option<&str>) -> Result<Arc<dyn RemoteCache>> {
        let Some(url) = url else {
            return Ok(Arc::new(self.memory_cache.clone()));
        };
        #[cfg(feature = "redis")]
        {
            Ok(Arc::new(crate::remote_cache::RedisCache::connect(url).await?))
        }
        #[cfg(not(feature = "redis"))]
        {
            Err(courier_common::RpcError::Registry(format!(
                "remote cache url {} requires the `redis` feature",
                url
            )))
        }
    }
}
