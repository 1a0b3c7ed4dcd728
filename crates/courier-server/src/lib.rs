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

//! # Courier Server
//!
//! Serves named services to courier clients.
//!
//! - [`Services`]: the table of named async service functions
//! - [`Acceptor`]: framed TCP listener, one reader and writer per connection,
//!   ping replies and optional response batching
//! - [`Server`]: port detection with bind retries, registry registration,
//!   `ServerClosed` after stop
//! - [`RpcEndpoint`]: a server plus a client on one registry, with local
//!   invoke for calls addressed to itself
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use courier_common::config::{LocalRegistryConfig, ServerConfig};
//! use courier_registry::LocalRegistryHub;
//! use courier_server::{Server, Services};
//! use serde_json::{json, Value};
//!
//! # async fn demo() -> courier_common::Result<()> {
//! let hub = LocalRegistryHub::new();
//! let server = Server::new(
//!     ServerConfig { server_id: Some("S1".into()), ..Default::default() },
//!     Arc::new(hub.registry(&LocalRegistryConfig::default())),
//! )
//! .with_services(Services::new().with("plus", |args: Vec<Value>| async move {
//!     let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
//!     Ok(json!(sum))
//! }));
//! let info = server.start(None).await?;
//! println!("listening on {}", info.address());
//! # Ok(())
//! # }
//! ```

pub mod acceptor;
pub mod endpoint;
pub mod server;
pub mod services;

pub use acceptor::{Acceptor, AcceptorConfig, AcceptorEvent, Dispatcher};
pub use endpoint::RpcEndpoint;
pub use server::{Server, ServerState};
pub use services::{Service, ServiceFuture, Services};
