// Copyright 2025 Courier Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Courier Registry
//!
//! Service discovery for courier servers. A [`Registry`] holds the live
//! [`ServerMap`] of a root path; servers register their [`ServerInfo`],
//! clients read and subscribe to the map.
//!
//! ## Backends
//!
//! - [`LocalRegistry`]: registries sharing a root path inside one process,
//!   joined through an explicit [`LocalRegistryHub`]
//! - [`ZookeeperRegistry`]: one ephemeral znode per server under the root path
//! - [`RemoteCacheRegistry`]: a single JSON directory blob in a shared cache,
//!   polled on a timer
//!
//! ## Lifecycle
//!
//! Every backend moves `Inited -> Started -> Stopped`. `start()` and `stop()`
//! are idempotent and never block; every other operation fails with
//! `ConnectionLoss` outside `Started`.
//!
//! ## Example
//!
//! ```
//! use courier_registry::{LocalRegistryHub, Registry};
//! use courier_common::config::LocalRegistryConfig;
//! use courier_common::ServerInfo;
//!
//! # #[tokio::main]
//! # async fn main() -> courier_common::Result<()> {
//! let hub = LocalRegistryHub::new();
//! let registry = hub.registry(&LocalRegistryConfig::default());
//! registry.start();
//!
//! let info = ServerInfo::new("127.0.0.1", 3723, "chat");
//! registry.register(info.clone()).await?;
//! assert_eq!(registry.get_server_info(&info.server_id).await?, info);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use tokio::sync::broadcast;

use courier_common::{Result, ServerInfo, ServerMap};

pub mod factory;
mod lifecycle;
pub mod local;
pub mod remote_cache;
mod subscription;
pub mod zookeeper;

pub use factory::RegistryFactory;
pub use lifecycle::RegistryState;
pub use local::{LocalRegistry, LocalRegistryHub};
pub use remote_cache::{MemoryCache, RemoteCache, RemoteCacheRegistry, RemoteDirectory};
pub use subscription::Subscription;
pub use zookeeper::{MemoryZk, ZookeeperRegistry};

/// Capacity of each registry's event channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle and health notifications of a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// The backend is reachable.
    Connection,
    /// The backend connection dropped or the registry stopped.
    Disconnect,
    /// The server map may have changed.
    Changed,
    /// A background operation failed.
    Error(String),
}

/// A service discovery backend.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Starts the registry. Idempotent; never blocks.
    fn start(&self);

    /// Stops the registry for good. Idempotent; never blocks.
    fn stop(&self);

    /// True between `start()` and `stop()`.
    fn is_connected(&self) -> bool;

    fn state(&self) -> RegistryState;

    /// Publishes `info` under its server id, replacing any previous entry.
    async fn register(&self, info: ServerInfo) -> Result<()>;

    async fn unregister(&self, server_id: &str) -> Result<()>;

    /// Fails with `ServerNotFound` when nothing is registered under `server_id`.
    async fn get_server_info(&self, server_id: &str) -> Result<ServerInfo>;

    async fn get_all_servers(&self) -> Result<ServerMap>;

    /// Delivers a fresh server map whenever the registry observes a change.
    ///
    /// Bursts of changes are coalesced and a version already delivered is
    /// never delivered twice. Dropping the subscription cancels it.
    fn subscribe(&self) -> Subscription;

    fn events(&self) -> broadcast::Receiver<RegistryEvent>;
}
