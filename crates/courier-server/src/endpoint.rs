use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::info;

use courier_client::Client;
use courier_common::config::{ClientConfig, RpcConfig, ServerConfig};
use courier_common::{Result, ServerInfo};
use courier_registry::Registry;

use crate::server::Server;
use crate::services::Services;

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

/// A server and a client sharing one registry.
///
/// Calls addressed to the endpoint's own server id skip the network when
/// `can_invoke_local` is set. Every endpoint serves `ping`.
pub struct RpcEndpoint {
    server: Server,
    client: Client,
    can_invoke_local: bool,
    started: watch::Sender<Option<ServerInfo>>,
}

impl RpcEndpoint {
    pub fn new(server_config: ServerConfig, mut client_config: ClientConfig, registry: Arc<dyn Registry>) -> Self {
        if client_config.mailbox.client_id.is_empty() {
            client_config.mailbox.client_id = format!(
                "client_{}_{}",
                server_config.server_type,
                NEXT_CLIENT.fetch_add(1, Ordering::Relaxed)
            );
        }
        let can_invoke_local = server_config.can_invoke_local;
        let server = Server::new(server_config, Arc::clone(&registry))
            .with_services(Services::new().with("ping", |_| async { Ok(json!("pong")) }));
        let client = Client::new(client_config, registry);
        let (started, _) = watch::channel(None);
        Self {
            server,
            client,
            can_invoke_local,
            started,
        }
    }

    pub fn from_config(config: &RpcConfig, registry: Arc<dyn Registry>) -> Self {
        Self::new(config.server.clone(), config.client.clone(), registry)
    }

    /// Adds services to the server.
    pub fn extend_services(&self, services: Services) {
        self.server.extend_services(services);
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Yields the registered [`ServerInfo`] once the server is up.
    pub fn on_started(&self) -> watch::Receiver<Option<ServerInfo>> {
        self.started.subscribe()
    }

    /// Starts the server, then the client.
    pub async fn start(&self, port: Option<u16>) -> Result<ServerInfo> {
        let info = self.server.start(port).await?;
        self.started.send_replace(Some(info.clone()));
        self.client.start().await?;
        info!(server_id = %info.server_id, client_id = %self.client.client_id(), "rpc endpoint started");
        Ok(info)
    }

    /// Stops the server first so it leaves the registry before the client
    /// closes its mailboxes.
    pub async fn stop(&self, force: bool) {
        self.server.stop().await;
        self.client.stop(force);
    }

    pub async fn rpc_invoke(&self, server_id: &str, service: &str, args: Vec<Value>) -> Result<Value> {
        if self.can_invoke_local && self.server.server_id().as_deref() == Some(server_id) {
            return self.server.dispatch(service, args).await;
        }
        self.client.rpc_invoke(server_id, service, args).await
    }

    pub async fn rpc_invoke_by_route(
        &self,
        server_type: &str,
        service: &str,
        args: Vec<Value>,
        seed: Option<&str>,
    ) -> Result<Value> {
        let server_id = self.client.pick_server(server_type, service, &args, seed)?;
        self.rpc_invoke(&server_id, service, args).await
    }
}
