use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{error, warn};

use courier_common::config::ClientConfig;
use courier_common::{Result, RpcError, RpcMessage, ServerMap, TraceRole, Tracer, WILDCARD_SERVER_TYPE};
use courier_registry::Registry;

use crate::mailbox::MailboxFactory;
use crate::mailstation::{Mailstation, StationEvent};
use crate::router::{RouteContext, Router};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Inited,
    Started,
    Closed,
}

/// RPC client for one process.
///
/// Calls go either to an explicit server id ([`rpc_invoke`](Self::rpc_invoke))
/// or to a server type picked by the configured [`Router`]
/// ([`rpc_invoke_by_route`](Self::rpc_invoke_by_route)).
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use courier_client::Client;
/// use courier_common::config::{ClientConfig, LocalRegistryConfig};
/// use courier_registry::LocalRegistryHub;
/// use serde_json::json;
///
/// # async fn demo() -> courier_common::Result<()> {
/// let hub = LocalRegistryHub::new();
/// let client = Client::new(
///     ClientConfig::default(),
///     Arc::new(hub.registry(&LocalRegistryConfig::default())),
/// );
/// client.start().await?;
/// let sum = client.rpc_invoke("S1", "plus", vec![json!(1), json!(2)]).await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: ClientConfig,
    station: Mailstation,
    router: Router,
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new(config: ClientConfig, registry: Arc<dyn Registry>) -> Self {
        let station = Mailstation::new(config.clone(), registry);
        Self::with_station(config, station)
    }

    /// Builds a client whose mailboxes come from `factory`.
    pub fn with_mailbox_factory(
        config: ClientConfig,
        registry: Arc<dyn Registry>,
        factory: Arc<dyn MailboxFactory>,
    ) -> Self {
        let station = Mailstation::with_factory(config.clone(), registry, factory);
        Self::with_station(config, station)
    }

    fn with_station(config: ClientConfig, station: Mailstation) -> Self {
        Self {
            router: Router::from_kind(config.route),
            config,
            station,
            state: Mutex::new(ClientState::Inited),
        }
    }

    /// Replaces the router built from the configured route kind.
    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.config.mailbox.client_id
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn station(&self) -> &Mailstation {
        &self.station
    }

    pub async fn start(&self) -> Result<()> {
        if self.state() != ClientState::Inited {
            warn!("client has started");
            return Ok(());
        }
        self.station.start().await?;
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = ClientState::Started;
        Ok(())
    }

    pub fn stop(&self, force: bool) {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state != ClientState::Started {
                warn!("client is not running now");
                return;
            }
            *state = ClientState::Closed;
        }
        self.station.stop(force);
    }

    /// Calls `service` on the server registered under `server_id`.
    pub async fn rpc_invoke(&self, server_id: &str, service: &str, args: Vec<Value>) -> Result<Value> {
        let tracer = self.config.mailbox.rpc_debug_log.then(|| {
            let tracer = Tracer::new(
                self.client_id(),
                server_id,
                json!({ "service": service, "args": args }),
            );
            tracer.info(TraceRole::Client, "rpcInvoke", "the entrance of rpc invoke");
            tracer
        });

        if self.state() != ClientState::Started {
            let message = "fail to do rpc invoke for client is not running";
            if let Some(tracer) = &tracer {
                tracer.error(TraceRole::Client, "rpcInvoke", message);
            }
            error!(client_id = %self.client_id(), "{}", message);
            return Err(RpcError::NotRunning(message.to_string()));
        }
        self.station
            .dispatch(server_id, RpcMessage::new(service, args), tracer)
            .await
    }

    /// Calls `service` on a server of `server_type` (or a wildcard server)
    /// chosen by the router. `seed` makes the default router sticky.
    pub async fn rpc_invoke_by_route(
        &self,
        server_type: &str,
        service: &str,
        args: Vec<Value>,
        seed: Option<&str>,
    ) -> Result<Value> {
        let server_id = self.pick_server(server_type, service, &args, seed)?;
        self.rpc_invoke(&server_id, service, args).await
    }

    /// Runs the router over the candidates for `server_type`.
    pub fn pick_server(
        &self,
        server_type: &str,
        service: &str,
        args: &[Value],
        seed: Option<&str>,
    ) -> Result<String> {
        let candidates = self.route_candidates(server_type);
        self.router.route(
            &candidates,
            &RouteContext {
                server_type,
                service,
                args,
            },
            seed,
        )
    }

    /// Servers of `server_type` followed by the wildcard servers.
    pub fn route_candidates(&self, server_type: &str) -> Vec<String> {
        let mut candidates = self.station.servers_of_type(server_type);
        if server_type != WILDCARD_SERVER_TYPE {
            candidates.extend(self.station.servers_of_type(WILDCARD_SERVER_TYPE));
        }
        candidates
    }

    pub fn servers_by_type(&self, server_type: &str) -> Vec<String> {
        self.station.servers_of_type(server_type)
    }

    pub fn servers_index(&self) -> HashMap<String, Vec<String>> {
        self.station.servers_by_type()
    }

    pub fn servers(&self) -> ServerMap {
        self.station.servers()
    }

    pub fn events(&self) -> broadcast::Receiver<StationEvent> {
        self.station.events()
    }
}
