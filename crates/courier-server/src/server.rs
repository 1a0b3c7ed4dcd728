use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use courier_common::config::ServerConfig;
use courier_common::util::now_millis;
use courier_common::{Result, RpcError, ServerInfo, TraceRole, Tracer};
use courier_registry::Registry;

use crate::acceptor::{Acceptor, AcceptorConfig, AcceptorEvent, Dispatcher};
use crate::services::{not_found, Services};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Upper bound of the random pause between bind attempts, in milliseconds.
const BIND_JITTER_MS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Inited,
    Started,
    Closed,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// The part of a server the acceptor calls into.
struct ServerCore {
    services: RwLock<Services>,
    closed: AtomicBool,
    server_id: Mutex<String>,
}

impl ServerCore {
    fn service_names(&self) -> Vec<String> {
        self.services.read().unwrap_or_else(|p| p.into_inner()).names()
    }
}

#[async_trait]
impl Dispatcher for ServerCore {
    async fn dispatch(&self, service: &str, args: Vec<Value>, tracer: Option<&Tracer>) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            let id = lock(&self.server_id).clone();
            return Err(RpcError::ServerClosed(format!("Server \"{}\" is closed", id)));
        }
        let handler = self
            .services
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(service);
        let Some(handler) = handler else {
            if let Some(tracer) = tracer {
                tracer.error(TraceRole::Server, "dispatch", "no such service");
            }
            return Err(not_found(service));
        };
        if let Some(tracer) = tracer {
            tracer.info(TraceRole::Server, "dispatch", "invoke service");
        }
        handler(args).await
    }
}

/// A courier RPC server.
///
/// `start` binds the acceptor (probing for a free port when `autoport` is
/// set) and registers the resulting [`ServerInfo`]; `stop` unregisters
/// before closing the acceptor. Calls that arrive after `stop` fail with
/// `ServerClosed`.
pub struct Server {
    config: ServerConfig,
    registry: Arc<dyn Registry>,
    core: Arc<ServerCore>,
    acceptor: Mutex<Option<Acceptor>>,
    info: Mutex<Option<ServerInfo>>,
    state: Mutex<ServerState>,
    events: broadcast::Sender<AcceptorEvent>,
}

impl Server {
    pub fn new(config: ServerConfig, registry: Arc<dyn Registry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            registry,
            core: Arc::new(ServerCore {
                services: RwLock::new(Services::new()),
                closed: AtomicBool::new(false),
                server_id: Mutex::new(String::new()),
            }),
            acceptor: Mutex::new(None),
            info: Mutex::new(None),
            state: Mutex::new(ServerState::Inited),
            events,
        }
    }

    pub fn with_services(self, services: Services) -> Self {
        self.extend_services(services);
        self
    }

    /// Adds services; same-named ones are replaced. Allowed at any time.
    pub fn extend_services(&self, services: Services) {
        self.core
            .services
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .extend(services);
    }

    pub fn service_names(&self) -> Vec<String> {
        self.core.service_names()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn state(&self) -> ServerState {
        *lock(&self.state)
    }

    /// Info registered by the last successful start.
    pub fn server_info(&self) -> Option<ServerInfo> {
        lock(&self.info).clone()
    }

    pub fn server_id(&self) -> Option<String> {
        lock(&self.info).as_ref().map(|info| info.server_id.clone())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.acceptor).as_ref().and_then(Acceptor::local_addr)
    }

    pub fn events(&self) -> broadcast::Receiver<AcceptorEvent> {
        self.events.subscribe()
    }

    /// Starts listening on `port` (or the configured port) and registers.
    ///
    /// With `autoport`, a failed bind is retried up to `bind_retries` times
    /// after a short random pause, which absorbs two servers probing the
    /// same free port at once.
    pub async fn start(&self, port: Option<u16>) -> Result<ServerInfo> {
        {
            let state = lock(&self.state);
            if *state != ServerState::Inited {
                return Err(RpcError::InvalidState(format!("server is {:?}", *state)));
            }
        }
        self.registry.start();

        let wanted = port.unwrap_or(self.config.port);
        let mut retries = if self.config.autoport {
            self.config.bind_retries
        } else {
            0
        };
        loop {
            match self.try_start(wanted).await {
                Ok(info) => {
                    *lock(&self.state) = ServerState::Started;
                    info!(server_id = %info.server_id, address = %info.address(), "server started");
                    return Ok(info);
                }
                Err(e) if retries > 0 => {
                    retries -= 1;
                    let jitter = rand::thread_rng().gen_range(0..BIND_JITTER_MS);
                    warn!("server start failed, retrying ({} left): {}", retries, e);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                }
                Err(e) => {
                    error!("server start failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn try_start(&self, wanted: u16) -> Result<ServerInfo> {
        let host = self.config.host.clone();
        let port = detect_port(&host, wanted).await?;
        if !self.config.autoport && wanted != 0 && port != wanted {
            return Err(RpcError::Transport(format!("port {} already in use", wanted)));
        }

        let acceptor = Acceptor::new(
            AcceptorConfig::from(&self.config),
            Arc::clone(&self.core) as Arc<dyn Dispatcher>,
            self.events.clone(),
        );
        let addr = acceptor.listen(&host, port).await?;

        let mut info = ServerInfo::new(host, addr.port(), self.config.server_type.clone())
            .with_register_time(now_millis());
        if let Some(id) = &self.config.server_id {
            info = info.with_server_id(id.clone());
        }
        if let Some(version) = &self.config.server_version {
            info = info.with_version(version.clone());
        }

        *lock(&self.core.server_id) = info.server_id.clone();
        *lock(&self.acceptor) = Some(acceptor);
        *lock(&self.info) = Some(info.clone());

        if let Err(e) = self.registry.register(info.clone()).await {
            error!(server_id = %info.server_id, "failed to register server: {}", e);
        }
        Ok(info)
    }

    /// Unregisters, stops the registry and closes the acceptor.
    pub async fn stop(&self) {
        {
            let mut state = lock(&self.state);
            if *state != ServerState::Started {
                warn!("server is not running now");
                return;
            }
            *state = ServerState::Closed;
        }
        self.core.closed.store(true, Ordering::SeqCst);

        if let Some(server_id) = self.server_id() {
            if let Err(e) = self.registry.unregister(&server_id).await {
                error!(server_id = %server_id, "failed to unregister server: {}", e);
            }
        }
        self.registry.stop();
        if let Some(acceptor) = lock(&self.acceptor).take() {
            acceptor.close();
        }
        info!(server_id = ?self.server_id(), "server stopped");
    }

    /// Runs `service` in process, the same way an inbound call would.
    pub async fn dispatch(&self, service: &str, args: Vec<Value>) -> Result<Value> {
        self.core.dispatch(service, args, None).await
    }
}

/// Returns `wanted` when it can be bound, otherwise a port the OS hands out.
/// Port 0 is passed through so the acceptor binds whatever the OS picks.
async fn detect_port(host: &str, wanted: u16) -> Result<u16> {
    if wanted == 0 {
        return Ok(0);
    }
    if let Ok(listener) = TcpListener::bind((host, wanted)).await {
        drop(listener);
        return Ok(wanted);
    }
    debug!("port {} is busy, asking the system for one", wanted);
    let listener = TcpListener::bind((host, 0))
        .await
        .map_err(|e| RpcError::Transport(format!("Failed to bind to {}:0: {}", host, e)))?;
    Ok(listener.local_addr()?.port())
}
