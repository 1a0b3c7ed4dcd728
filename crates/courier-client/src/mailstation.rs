//! Client side connection manager.
//!
//! The [`Mailstation`] keeps the registry's server map in sync, owns one
//! mailbox per remote server id and decides for every call whether it is
//! sent right away, queued behind a connecting mailbox or dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_common::config::ClientConfig;
use courier_common::util::retry;
use courier_common::{codes, Result, RpcError, RpcMessage, ServerInfo, ServerMap, TraceRole, Tracer};
use courier_registry::Registry;

use crate::mailbox::{Mailbox, MailboxContext, MailboxEvent, MailboxEvents, MailboxFactory, TcpMailboxFactory};

/// Attempts at finding a server in the cached map before giving up.
pub const CONNECT_RETRIES: usize = 3;
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

const STATION_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationState {
    Inited,
    Started,
    Closed,
}

/// Notifications for the client's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StationEvent {
    /// The mailbox of this server closed.
    Close(String),
    /// A call or a connection failed; `code` is the error code.
    Error { code: String, server_id: String },
}

pub struct Mailstation {
    inner: Arc<StationInner>,
}

struct StationInner {
    config: ClientConfig,
    registry: Arc<dyn Registry>,
    factory: Arc<dyn MailboxFactory>,
    state: Mutex<StationState>,
    book: Mutex<Book>,
    next_serial: AtomicU64,
    mailbox_tx: mpsc::UnboundedSender<MailboxEvent>,
    mailbox_rx: Mutex<Option<mpsc::UnboundedReceiver<MailboxEvent>>>,
    events: broadcast::Sender<StationEvent>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct Book {
    servers: ServerMap,
    by_type: HashMap<String, Vec<String>>,
    mailboxes: HashMap<String, Slot>,
    pendings: HashMap<String, VecDeque<Pending>>,
}

struct Slot {
    mailbox: Arc<dyn Mailbox>,
    serial: u64,
    connecting: bool,
}

struct Pending {
    msg: RpcMessage,
    tracer: Option<Tracer>,
    reply: oneshot::Sender<Result<Value>>,
}

/// What to do with a call given the current mailbox of its server.
enum Route {
    Send(Arc<dyn Mailbox>),
    Queue,
    Overflow,
    Missing,
}

enum Outcome {
    Reply(BoxFuture<'static, Result<Value>>),
    Wait(oneshot::Receiver<Result<Value>>),
    Dropped,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Groups server ids by type, each group ordered by port.
fn index_by_type(servers: &ServerMap) -> HashMap<String, Vec<String>> {
    let mut by_type: HashMap<String, Vec<&ServerInfo>> = HashMap::new();
    for info in servers.values() {
        by_type.entry(info.server_type.clone()).or_default().push(info);
    }
    by_type
        .into_iter()
        .map(|(server_type, mut infos)| {
            infos.sort_by(|a, b| a.port.cmp(&b.port).then_with(|| a.server_id.cmp(&b.server_id)));
            let ids = infos.into_iter().map(|i| i.server_id.clone()).collect();
            (server_type, ids)
        })
        .collect()
}

impl Mailstation {
    pub fn new(config: ClientConfig, registry: Arc<dyn Registry>) -> Self {
        Self::with_factory(config, registry, Arc::new(TcpMailboxFactory))
    }

    pub fn with_factory(
        config: ClientConfig,
        registry: Arc<dyn Registry>,
        factory: Arc<dyn MailboxFactory>,
    ) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(StationInner {
                config,
                registry,
                factory,
                state: Mutex::new(StationState::Inited),
                book: Mutex::new(Book::default()),
                next_serial: AtomicU64::new(1),
                mailbox_tx,
                mailbox_rx: Mutex::new(Some(mailbox_rx)),
                events: broadcast::channel(STATION_EVENT_CAPACITY).0,
                sync_task: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> StationState {
        *lock(&self.inner.state)
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.inner.registry
    }

    /// Starts the registry, follows its changes and seeds the server map.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if *state != StationState::Inited {
                return Ok(());
            }
            *state = StationState::Started;
        }

        let inner = &self.inner;
        inner.registry.start();

        let mut subscription = inner.registry.subscribe();
        let station = Arc::clone(inner);
        let sync = tokio::spawn(async move {
            while let Some(servers) = subscription.recv().await {
                station.sync_servers(servers);
            }
        });
        *lock(&inner.sync_task) = Some(sync);
        if let Some(rx) = lock(&inner.mailbox_rx).take() {
            let events = tokio::spawn(Arc::clone(inner).mailbox_events(rx));
            lock(&inner.tasks).push(events);
        }

        let servers = match inner.registry.get_all_servers().await {
            Ok(servers) => servers,
            Err(e) => {
                // Back to Inited so a later start runs again from scratch
                if let Some(sync) = lock(&inner.sync_task).take() {
                    sync.abort();
                }
                *lock(&inner.state) = StationState::Inited;
                return Err(e);
            }
        };
        inner.sync_servers(servers);
        Ok(())
    }

    /// Stops following the registry and closes every mailbox, right away
    /// when `force` is set or after the grace window otherwise.
    pub fn stop(&self, force: bool) {
        {
            let mut state = lock(&self.inner.state);
            if *state != StationState::Started {
                warn!("client is not running now");
                return;
            }
            *state = StationState::Closed;
        }

        if let Some(sync) = lock(&self.inner.sync_task).take() {
            sync.abort();
        }
        self.inner.registry.stop();

        if force {
            self.inner.close_all();
        } else {
            let station = Arc::clone(&self.inner);
            let grace = self.inner.config.grace_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                station.close_all();
            });
        }
    }

    /// Sends `msg` to `server_id`, connecting lazily on first use.
    ///
    /// A call dropped because the connect queue is full never completes.
    pub async fn dispatch(
        &self,
        server_id: &str,
        msg: RpcMessage,
        tracer: Option<Tracer>,
    ) -> Result<Value> {
        Arc::clone(&self.inner)
            .dispatch(server_id.to_string(), msg, tracer)
            .await
    }

    pub fn servers(&self) -> ServerMap {
        lock(&self.inner.book).servers.clone()
    }

    pub fn servers_by_type(&self) -> HashMap<String, Vec<String>> {
        lock(&self.inner.book).by_type.clone()
    }

    /// Ids of servers of `server_type`, ordered by port.
    pub fn servers_of_type(&self, server_type: &str) -> Vec<String> {
        lock(&self.inner.book)
            .by_type
            .get(server_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_mailbox(&self, server_id: &str) -> bool {
        lock(&self.inner.book).mailboxes.contains_key(server_id)
    }

    /// Calls waiting for the mailbox of `server_id` to connect.
    pub fn pending(&self, server_id: &str) -> usize {
        lock(&self.inner.book)
            .pendings
            .get(server_id)
            .map_or(0, VecDeque::len)
    }

    pub fn events(&self) -> broadcast::Receiver<StationEvent> {
        self.inner.events.subscribe()
    }
}

impl StationInner {
    fn emit_error(&self, code: &str, server_id: &str) {
        let _ = self.events.send(StationEvent::Error {
            code: code.to_string(),
            server_id: server_id.to_string(),
        });
    }

    fn check_running(&self, server_id: &str, tracer: Option<&Tracer>) -> Result<()> {
        if *lock(&self.state) == StationState::Started {
            return Ok(());
        }
        if let Some(tracer) = tracer {
            tracer.error(TraceRole::Client, "dispatch", "client is not running now");
        }
        error!(server_id = %server_id, "client is not running now");
        self.emit_error(codes::NOT_RUNNING, server_id);
        Err(RpcError::NotRunning("client is not running now".to_string()))
    }

    async fn dispatch(
        self: Arc<Self>,
        server_id: String,
        msg: RpcMessage,
        tracer: Option<Tracer>,
    ) -> Result<Value> {
        if let Some(tracer) = &tracer {
            tracer.info(TraceRole::Client, "dispatch", "dispatch rpc message to the mailbox");
        }
        self.check_running(&server_id, tracer.as_ref())?;

        if !lock(&self.book).mailboxes.contains_key(&server_id) {
            if let Some(tracer) = &tracer {
                tracer.debug(TraceRole::Client, "dispatch", "mailbox is not exist");
            }
            if !self.lazy_connect(&server_id, tracer.as_ref()).await {
                let message = format!("fail to find remote server:{}", server_id);
                if let Some(tracer) = &tracer {
                    tracer.error(TraceRole::Client, "dispatch", &message);
                }
                error!("{}", message);
                self.emit_error(codes::SERVER_NOT_FOUND, &server_id);
                return Err(RpcError::ServerNotFound(message));
            }
        }

        let outcome = {
            let mut book = lock(&self.book);
            self.check_running(&server_id, tracer.as_ref())?;
            match self.route(&book, &server_id) {
                Route::Send(mailbox) => Outcome::Reply(mailbox.send(msg, tracer)),
                Route::Queue => {
                    if let Some(tracer) = &tracer {
                        tracer.debug(TraceRole::Client, "dispatch", "request add to connecting");
                    }
                    let (reply, rx) = oneshot::channel();
                    book.pendings.entry(server_id.clone()).or_default().push_back(Pending {
                        msg,
                        tracer,
                        reply,
                    });
                    Outcome::Wait(rx)
                }
                Route::Overflow => {
                    if let Some(tracer) = &tracer {
                        tracer.debug(TraceRole::Client, "addToPending", "station pending too much");
                    }
                    warn!("station pending too much for: {}", server_id);
                    Outcome::Dropped
                }
                Route::Missing => {
                    drop(book);
                    self.emit_error(codes::FAIL_TO_SEND, &server_id);
                    return Err(RpcError::FailToSend(format!(
                        "fail to send message, no mailbox for remote server {}",
                        server_id
                    )));
                }
            }
        };

        match outcome {
            Outcome::Reply(reply) => {
                let result = reply.await;
                if let Err(RpcError::FailToSend(e)) = &result {
                    error!(server_id = %server_id, "fail to send message {}", e);
                    self.emit_error(codes::FAIL_TO_SEND, &server_id);
                }
                result
            }
            Outcome::Wait(rx) => rx.await.unwrap_or_else(|_| {
                Err(RpcError::FailToSend(format!(
                    "pending call to {} was abandoned",
                    server_id
                )))
            }),
            Outcome::Dropped => std::future::pending().await,
        }
    }

    fn route(&self, book: &Book, server_id: &str) -> Route {
        match book.mailboxes.get(server_id) {
            None => Route::Missing,
            Some(slot) if !slot.connecting => Route::Send(Arc::clone(&slot.mailbox)),
            Some(_) => {
                let queued = book.pendings.get(server_id).map_or(0, VecDeque::len);
                if queued >= self.config.pending_size {
                    Route::Overflow
                } else {
                    Route::Queue
                }
            }
        }
    }

    /// Finds the server in the cached map and opens a mailbox to it.
    /// Returns false when the server is unknown.
    async fn lazy_connect(self: &Arc<Self>, server_id: &str, tracer: Option<&Tracer>) -> bool {
        if let Some(tracer) = tracer {
            tracer.info(
                TraceRole::Client,
                "lazyConnect",
                "create mailbox and try to connect to remote server",
            );
        }
        let found = retry(
            || {
                let info = lock(&self.book).servers.get(server_id).cloned();
                async move { info }
            },
            CONNECT_RETRIES,
            CONNECT_RETRY_DELAY,
        )
        .await;
        let Some(info) = found else {
            error!("unknown server: {}", server_id);
            return false;
        };

        let mut book = lock(&self.book);
        if book.mailboxes.contains_key(server_id) {
            return true;
        }
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let mailbox = self.factory.create(MailboxContext {
            server: info,
            config: self.config.mailbox.clone(),
            events: MailboxEvents::new(self.mailbox_tx.clone(), server_id, serial),
        });
        book.mailboxes.insert(
            server_id.to_string(),
            Slot {
                mailbox: Arc::clone(&mailbox),
                serial,
                connecting: true,
            },
        );
        drop(book);

        let task = tokio::spawn(Arc::clone(self).connect(
            server_id.to_string(),
            mailbox,
            serial,
            tracer.cloned(),
        ));
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        true
    }

    async fn connect(
        self: Arc<Self>,
        server_id: String,
        mailbox: Arc<dyn Mailbox>,
        serial: u64,
        tracer: Option<Tracer>,
    ) {
        match mailbox.connect().await {
            Ok(()) => {
                let mut book = lock(&self.book);
                if let Some(slot) = book.mailboxes.get_mut(&server_id) {
                    if slot.serial == serial {
                        slot.connecting = false;
                    }
                }
                self.flush_pending(&mut book, &server_id, tracer.as_ref());
            }
            Err(e) => {
                if let Some(tracer) = &tracer {
                    tracer.error(
                        TraceRole::Client,
                        "lazyConnect",
                        &format!("fail to connect to remote server: {}", server_id),
                    );
                }
                error!(server_id = %server_id, "mailbox fail to connect to remote server: {}", e);
                let pending = {
                    let mut book = lock(&self.book);
                    if book.mailboxes.get(&server_id).is_some_and(|s| s.serial == serial) {
                        book.mailboxes.remove(&server_id);
                    }
                    book.pendings.remove(&server_id).unwrap_or_default()
                };
                self.emit_error(codes::FAIL_TO_SEND, &server_id);
                for call in pending {
                    let _ = call.reply.send(Err(RpcError::FailToSend(format!(
                        "fail to connect to remote server {}: {}",
                        server_id, e
                    ))));
                }
            }
        }
    }

    /// Re-routes queued calls in the order they were issued. Runs under the
    /// book lock so no new call can overtake them.
    fn flush_pending(&self, book: &mut Book, server_id: &str, tracer: Option<&Tracer>) {
        let Some(pending) = book.pendings.remove(server_id) else {
            return;
        };
        if let Some(tracer) = tracer {
            tracer.info(
                TraceRole::Client,
                "flushPending",
                "flush pending requests to dispatch method",
            );
        }
        debug!(server_id = %server_id, count = pending.len(), "flushing pending calls");

        let running = *lock(&self.state) == StationState::Started;
        let mut requeue = VecDeque::new();
        for call in pending {
            if !running {
                let _ = call
                    .reply
                    .send(Err(RpcError::NotRunning("client is not running now".to_string())));
                continue;
            }
            match self.route(book, server_id) {
                Route::Send(mailbox) => {
                    let reply = mailbox.send(call.msg, call.tracer);
                    let tx = call.reply;
                    tokio::spawn(async move {
                        let _ = tx.send(reply.await);
                    });
                }
                // A newer mailbox took over and is still connecting
                Route::Queue | Route::Overflow => requeue.push_back(call),
                Route::Missing => {
                    error!("fail to flush pending messages for empty mailbox: {}", server_id);
                    let _ = call.reply.send(Err(RpcError::FailToSend(format!(
                        "fail to flush pending messages for empty mailbox: {}",
                        server_id
                    ))));
                }
            }
        }
        if !requeue.is_empty() {
            book.pendings.insert(server_id.to_string(), requeue);
        }
    }

    async fn mailbox_events(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<MailboxEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                MailboxEvent::Close { server_id, serial } => {
                    let removed = {
                        let mut book = lock(&self.book);
                        if book.mailboxes.get(&server_id).is_some_and(|s| s.serial == serial) {
                            book.mailboxes.remove(&server_id)
                        } else {
                            None
                        }
                    };
                    // A stale mailbox closing after its replacement stays silent
                    if let Some(slot) = removed {
                        slot.mailbox.close();
                        let _ = self.events.send(StationEvent::Close(server_id));
                    }
                }
                MailboxEvent::Error { server_id, message } => {
                    warn!(server_id = %server_id, "mailbox error: {}", message);
                    self.emit_error(codes::TRANSPORT, &server_id);
                }
            }
        }
    }

    /// Replaces the cached server map, closing mailboxes whose server
    /// disappeared or changed.
    fn sync_servers(&self, servers: ServerMap) {
        let stale: Vec<Slot> = {
            let mut book = lock(&self.book);
            let outdated: Vec<String> = book
                .servers
                .iter()
                .filter(|(id, old)| servers.get(*id).map_or(true, |new| old.is_changed(new)))
                .map(|(id, _)| id.clone())
                .collect();
            let stale = outdated
                .iter()
                .filter_map(|id| book.mailboxes.remove(id))
                .collect();
            book.by_type = index_by_type(&servers);
            book.servers = servers;
            stale
        };
        for slot in stale {
            info!(server_id = %slot.mailbox.server_id(), "closing mailbox of outdated server");
            slot.mailbox.close();
        }
    }

    fn close_all(&self) {
        let slots: Vec<Slot> = lock(&self.book).mailboxes.drain().map(|(_, s)| s).collect();
        for slot in slots {
            slot.mailbox.close();
        }
    }
}

impl Drop for Mailstation {
    fn drop(&mut self) {
        if let Some(sync) = lock(&self.inner.sync_task).take() {
            sync.abort();
        }
        for task in std::mem::take(&mut *lock(&self.inner.tasks)) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, server_type: &str, port: u16) -> ServerInfo {
        ServerInfo::new("127.0.0.1", port, server_type).with_server_id(id)
    }

    #[test]
    fn test_index_by_type_sorted_by_port() {
        let mut servers = ServerMap::new();
        for (id, t, port) in [("c3", "chat", 4003), ("c1", "chat", 4001), ("g1", "gate", 5000), ("c2", "chat", 4002)] {
            servers.insert(id.to_string(), info(id, t, port));
        }
        let index = index_by_type(&servers);
        assert_eq!(index["chat"], vec!["c1", "c2", "c3"]);
        assert_eq!(index["gate"], vec!["g1"]);
        assert!(!index.contains_key("*"));
    }
}
