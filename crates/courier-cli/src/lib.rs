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

//! # Courier CLI
//!
//! Building blocks of the `courier` binary:
//!
//! - `courier serve`: run an [`RpcEndpoint`] exposing the demo services
//!   (`ping`, `echo`, `plus`) and register it
//! - `courier call`: invoke a service by server id or by server type
//! - `courier servers`: print the registry's server map
//!
//! Every command reads an optional JSON [`RpcConfig`] file. Registries are
//! built through one [`RegistryFactory`], so commands run in the same process
//! (as the tests do) share local and in-memory backends.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use courier_client::Client;
use courier_common::config::{RpcConfig, ServerConfig};
use courier_common::ServerMap;
use courier_registry::{Registry, RegistryEvent, RegistryFactory};
use courier_server::{RpcEndpoint, Services};

/// How long a command waits for its registry to connect.
pub const REGISTRY_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Loads `path`, or the defaults when no file is given.
pub fn load_config(path: Option<&Path>) -> Result<RpcConfig> {
    match path {
        Some(path) => RpcConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(RpcConfig::default()),
    }
}

/// Command-line values that replace the config file's server settings.
#[derive(Debug, Clone, Default)]
pub struct ServerOverrides {
    pub port: Option<u16>,
    pub server_type: Option<String>,
    pub server_id: Option<String>,
}

impl ServerOverrides {
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(server_type) = &self.server_type {
            config.server_type = server_type.clone();
        }
        if let Some(server_id) = &self.server_id {
            config.server_id = Some(server_id.clone());
        }
    }
}

/// Parses call arguments: a JSON array is the argument list, any other
/// value is a single argument.
pub fn parse_call_args(text: &str) -> Result<Vec<Value>> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| anyhow!("Invalid JSON in args: {}", e))?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

/// `echo` returns its first argument; `plus` sums its numeric arguments.
pub fn demo_services() -> Services {
    Services::new()
        .with("echo", |args: Vec<Value>| async move {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        })
        .with("plus", |args: Vec<Value>| async move {
            if args.iter().all(|a| a.is_i64()) {
                Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
            } else {
                Ok(json!(args.iter().filter_map(Value::as_f64).sum::<f64>()))
            }
        })
}

/// Starts `registry` and waits until it reports a connection.
pub async fn connect_registry(registry: &Arc<dyn Registry>, timeout: Duration) -> Result<()> {
    let mut events = registry.events();
    registry.start();
    if registry.is_connected() {
        return Ok(());
    }
    let wait = async {
        loop {
            match events.recv().await {
                Ok(RegistryEvent::Connection) => return Ok(()),
                Ok(RegistryEvent::Error(e)) => tracing::warn!("registry error: {}", e),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Err(anyhow!("registry closed before connecting")),
            }
            if registry.is_connected() {
                return Ok(());
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| anyhow!("registry did not connect within {:?}", timeout))?
}

/// Builds, starts and registers an endpoint serving the demo services.
pub async fn serve(config: &RpcConfig, factory: &RegistryFactory) -> Result<RpcEndpoint> {
    let registry = factory.build(&config.registry).await?;
    connect_registry(&registry, REGISTRY_CONNECT_TIMEOUT).await?;

    let endpoint = RpcEndpoint::from_config(config, registry);
    endpoint.extend_services(demo_services());
    let info = endpoint.start(None).await?;
    tracing::info!(
        server_id = %info.server_id,
        server_type = %info.server_type,
        "serving {} on {}",
        endpoint.server().service_names().join(", "),
        info.address()
    );
    Ok(endpoint)
}

/// Where `courier call` sends its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    Server(String),
    Route {
        server_type: String,
        seed: Option<String>,
    },
}

/// Starts a client, performs one call and stops the client.
pub async fn call(
    config: &RpcConfig,
    factory: &RegistryFactory,
    target: &CallTarget,
    service: &str,
    args: Vec<Value>,
) -> Result<Value> {
    let registry = factory.build(&config.registry).await?;
    connect_registry(&registry, REGISTRY_CONNECT_TIMEOUT).await?;

    let client = Client::new(config.client.clone(), registry);
    client.start().await?;
    let result = match target {
        CallTarget::Server(server_id) => client.rpc_invoke(server_id, service, args).await,
        CallTarget::Route { server_type, seed } => {
            client
                .rpc_invoke_by_route(server_type, service, args, seed.as_deref())
                .await
        }
    };
    client.stop(true);
    Ok(result?)
}

/// Reads every registered server.
pub async fn list_servers(config: &RpcConfig, factory: &RegistryFactory) -> Result<ServerMap> {
    let registry = factory.build(&config.registry).await?;
    connect_registry(&registry, REGISTRY_CONNECT_TIMEOUT).await?;
    let servers = registry.get_all_servers().await;
    registry.stop();
    Ok(servers?)
}
