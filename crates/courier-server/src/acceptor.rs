use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use courier_common::config::ServerConfig;
use courier_common::transport::{Frame, FrameKind, InvalidRequest, JsonCodec, TcpTransport};
use courier_common::{RequestEnvelope, ResponseEnvelope, Result, RpcError, TraceRole, Tracer};

/// Runs a named service for an inbound call.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, service: &str, args: Vec<Value>, tracer: Option<&Tracer>) -> Result<Value>;
}

/// Acceptor lifecycle and connection notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptorEvent {
    Listening(SocketAddr),
    Connection(u64),
    Disconnect(u64),
    Close,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Queue responses per connection and flush them as one batch
    pub buffer_msg: bool,
    pub flush_interval: Duration,
    /// Continue client traces and emit server side trace records
    pub rpc_debug_log: bool,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            buffer_msg: false,
            flush_interval: Duration::from_millis(50),
            rpc_debug_log: false,
        }
    }
}

impl From<&ServerConfig> for AcceptorConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            buffer_msg: config.buffer_msg,
            flush_interval: config.flush_interval(),
            rpc_debug_log: config.rpc_debug_log,
        }
    }
}

/// TCP listener that feeds inbound calls to a [`Dispatcher`].
///
/// Each connection gets a reader task and a writer task. Calls on one
/// connection run concurrently; every call produces exactly one response
/// correlated by the request id.
pub struct Acceptor {
    shared: Arc<Shared>,
}

struct Shared {
    config: AcceptorConfig,
    dispatcher: Arc<dyn Dispatcher>,
    events: broadcast::Sender<AcceptorEvent>,
    next_conn: AtomicU64,
    closed: AtomicBool,
    connections: Mutex<HashMap<u64, JoinHandle<()>>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

enum Outgoing {
    Response(ResponseEnvelope),
    Pong,
}

/// Aborting a connection task also stops its writer.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Acceptor {
    pub fn new(
        config: AcceptorConfig,
        dispatcher: Arc<dyn Dispatcher>,
        events: broadcast::Sender<AcceptorEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                dispatcher,
                events,
                next_conn: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                connections: Mutex::new(HashMap::new()),
                listener_task: Mutex::new(None),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Binds `host:port` and starts accepting connections.
    pub async fn listen(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RpcError::InvalidState("acceptor is closed".to_string()));
        }
        let bind_addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            let err = RpcError::Transport(format!("Failed to bind to {}: {}", bind_addr, e));
            let _ = self.shared.events.send(AcceptorEvent::Error(err.to_string()));
            err
        })?;
        let addr = listener
            .local_addr()
            .map_err(|e| RpcError::Transport(format!("Failed to get local addr: {}", e)))?;
        *lock(&self.shared.local_addr) = Some(addr);

        let task = tokio::spawn(Arc::clone(&self.shared).accept_loop(listener));
        *lock(&self.shared.listener_task) = Some(task);
        info!(address = %addr, "acceptor listening");
        let _ = self.shared.events.send(AcceptorEvent::Listening(addr));
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.local_addr)
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared.connections).len()
    }

    /// Stops accepting and drops every connection. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = lock(&self.shared.listener_task).take() {
            task.abort();
        }
        for (_, task) in lock(&self.shared.connections).drain() {
            task.abort();
        }
        debug!("acceptor closed");
        let _ = self.shared.events.send(AcceptorEvent::Close);
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let id = self.next_conn.fetch_add(1, Ordering::SeqCst);
                    debug!(conn_id = id, peer = %peer, "connection established");
                    let _ = stream.set_nodelay(true);
                    let task = tokio::spawn(Arc::clone(&self).serve(id, stream));
                    let mut connections = lock(&self.connections);
                    connections.retain(|_, t| !t.is_finished());
                    connections.insert(id, task);
                    drop(connections);
                    let _ = self.events.send(AcceptorEvent::Connection(id));
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                    let _ = self.events.send(AcceptorEvent::Error(e.to_string()));
                }
            }
        }
    }

    async fn serve(self: Arc<Self>, id: u64, stream: TcpStream) {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut writer = AbortOnDrop(tokio::spawn(write_loop(writer, rx, self.config.clone())));

        let reason = self.read_loop(reader, tx).await;
        debug!(conn_id = id, "connection closed: {}", reason);
        // Responses still queued are flushed before the writer exits
        let _ = (&mut writer.0).await;

        lock(&self.connections).remove(&id);
        let _ = self.events.send(AcceptorEvent::Disconnect(id));
    }

    async fn read_loop(
        self: &Arc<Self>,
        mut reader: OwnedReadHalf,
        tx: mpsc::UnboundedSender<Outgoing>,
    ) -> String {
        loop {
            let frame = match TcpTransport::receive_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return "peer closed".to_string(),
                Err(e) => {
                    let _ = self.events.send(AcceptorEvent::Error(e.to_string()));
                    return e.to_string();
                }
            };
            match frame.kind {
                FrameKind::Publish => self.process(&frame.payload, &tx),
                FrameKind::PingReq => {
                    let _ = tx.send(Outgoing::Pong);
                }
                FrameKind::PingResp => {}
            }
        }
    }

    fn process(self: &Arc<Self>, payload: &[u8], tx: &mpsc::UnboundedSender<Outgoing>) {
        let items = match JsonCodec::decode_request_items(payload) {
            Ok(items) => items,
            Err(e) => {
                error!("process rpc message error: {}", e);
                return;
            }
        };

        for item in items {
            let request = match item {
                Ok(request) => request,
                Err(InvalidRequest { id, error }) => {
                    error!("process rpc message error: {}", error);
                    // Elements with a readable id still get an answer
                    if let Some(id) = id {
                        let _ = tx.send(Outgoing::Response(ResponseEnvelope::failure(id, &error)));
                    }
                    continue;
                }
            };
            let shared = Arc::clone(self);
            let tx = tx.clone();
            tokio::spawn(async move {
                let response = shared.handle(request).await;
                let _ = tx.send(Outgoing::Response(response));
            });
        }
    }

    async fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let RequestEnvelope { id, msg, trace } = request;
        let tracer = if self.config.rpc_debug_log {
            Tracer::from_fields(&trace, json!({ "service": msg.service, "args": msg.args }))
        } else {
            None
        };
        if let Some(tracer) = &tracer {
            tracer.info(
                TraceRole::Server,
                "processMsg",
                "acceptor receive message and try to process message",
            );
        }

        let result = self
            .dispatcher
            .dispatch(&msg.service, msg.args, tracer.as_ref())
            .await;
        if let Err(e) = &result {
            debug!(service = %msg.service, "service call failed: {}", e);
        }
        let response = ResponseEnvelope::from_result(id, &result);
        match &tracer {
            Some(tracer) => response.with_trace(tracer.fields()),
            None => response,
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    config: AcceptorConfig,
) {
    let mut queue: Vec<ResponseEnvelope> = Vec::new();
    let mut flush = tokio::time::interval_at(Instant::now() + config.flush_interval, config.flush_interval);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            item = rx.recv() => match item {
                Some(Outgoing::Pong) => Frame::ping_resp(),
                Some(Outgoing::Response(response)) if config.buffer_msg => {
                    queue.push(response);
                    continue;
                }
                Some(Outgoing::Response(response)) => match JsonCodec::encode_responses(vec![response]) {
                    Ok(payload) => Frame::publish(payload),
                    Err(e) => {
                        error!("failed to encode rpc response: {}", e);
                        continue;
                    }
                },
                None if queue.is_empty() => break,
                None => match JsonCodec::encode_responses(std::mem::take(&mut queue)) {
                    Ok(payload) => Frame::publish(payload),
                    Err(_) => break,
                },
            },
            _ = flush.tick(), if !queue.is_empty() => match JsonCodec::encode_responses(std::mem::take(&mut queue)) {
                Ok(payload) => Frame::publish(payload),
                Err(e) => {
                    error!("failed to encode rpc responses: {}", e);
                    continue;
                }
            },
        };
        if let Err(e) = TcpTransport::send_frame(&mut writer, &frame).await {
            debug!("failed to write to rpc client: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::RpcMessage;
    use tokio::net::TcpStream;

    struct Echo;

    #[async_trait]
    impl Dispatcher for Echo {
        async fn dispatch(&self, service: &str, args: Vec<Value>, _tracer: Option<&Tracer>) -> Result<Value> {
            match service {
                "echo" => Ok(args.into_iter().next().unwrap_or(Value::Null)),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!("slow"))
                }
                other => Err(RpcError::ServiceNotFound(format!("no such service: {}.", other))),
            }
        }
    }

    async fn start(config: AcceptorConfig) -> (Acceptor, SocketAddr, broadcast::Receiver<AcceptorEvent>) {
        let (events, rx) = broadcast::channel(64);
        let acceptor = Acceptor::new(config, Arc::new(Echo), events);
        let addr = acceptor.listen("127.0.0.1", 0).await.unwrap();
        (acceptor, addr, rx)
    }

    async fn call(stream: &mut TcpStream, requests: Vec<RequestEnvelope>) -> Vec<ResponseEnvelope> {
        let payload = JsonCodec::encode_requests(requests).unwrap();
        TcpTransport::send_frame(stream, &Frame::publish(payload)).await.unwrap();
        let frame = TcpTransport::receive_frame(stream).await.unwrap().unwrap();
        JsonCodec::decode_responses(&frame.payload).unwrap()
    }

    #[tokio::test]
    async fn test_call_and_missing_service() {
        let (_acceptor, addr, _events) = start(AcceptorConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let responses = call(&mut stream, vec![RequestEnvelope::new(7, RpcMessage::new("echo", vec![json!("hi")]))]).await;
        assert_eq!(responses[0].id, 7);
        assert_eq!(responses[0].msg, json!("hi"));

        let responses = call(&mut stream, vec![RequestEnvelope::new(8, RpcMessage::new("missing", vec![]))]).await;
        let err = responses[0].clone().into_result().unwrap_err();
        assert!(matches!(err, RpcError::ServiceNotFound(_)));
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let (_acceptor, addr, _events) = start(AcceptorConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        TcpTransport::send_frame(&mut stream, &Frame::ping_req()).await.unwrap();
        let frame = TcpTransport::receive_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::PingResp);
    }

    #[tokio::test]
    async fn test_malformed_envelope_with_id_gets_error() {
        let (_acceptor, addr, _events) = start(AcceptorConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        TcpTransport::send_frame(&mut stream, &Frame::publish(br#"{"id": 3, "msg": 42}"#.to_vec()))
            .await
            .unwrap();
        let frame = TcpTransport::receive_frame(&mut stream).await.unwrap().unwrap();
        let responses = JsonCodec::decode_responses(&frame.payload).unwrap();
        assert_eq!(responses[0].id, 3);
        assert_eq!(responses[0].error.as_ref().unwrap().code, "INVALID_MESSAGE");
    }

    #[tokio::test]
    async fn test_buffered_responses_flush_as_batch() {
        let (_acceptor, addr, _events) = start(AcceptorConfig {
            buffer_msg: true,
            flush_interval: Duration::from_millis(30),
            ..AcceptorConfig::default()
        })
        .await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let mut responses = call(
            &mut stream,
            vec![
                RequestEnvelope::new(1, RpcMessage::new("echo", vec![json!(1)])),
                RequestEnvelope::new(2, RpcMessage::new("echo", vec![json!(2)])),
            ],
        )
        .await;
        responses.sort_by_key(|r| r.id);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1].msg, json!(2));
    }

    #[tokio::test]
    async fn test_connection_events_and_close() {
        let (acceptor, addr, mut events) = start(AcceptorConfig::default()).await;
        assert_eq!(events.recv().await.unwrap(), AcceptorEvent::Listening(addr));

        let stream = TcpStream::connect(addr).await.unwrap();
        let conn = match events.recv().await.unwrap() {
            AcceptorEvent::Connection(id) => id,
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(acceptor.connection_count(), 1);

        drop(stream);
        assert_eq!(events.recv().await.unwrap(), AcceptorEvent::Disconnect(conn));

        acceptor.close();
        acceptor.close();
        assert_eq!(events.recv().await.unwrap(), AcceptorEvent::Close);
        assert_eq!(acceptor.connection_count(), 0);
        assert!(acceptor.listen("127.0.0.1", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let (_first, addr, _events) = start(AcceptorConfig::default()).await;
        let (events, mut rx) = broadcast::channel(8);
        let second = Acceptor::new(AcceptorConfig::default(), Arc::new(Echo), events);
        let err = second.listen("127.0.0.1", addr.port()).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
        assert!(matches!(rx.recv().await.unwrap(), AcceptorEvent::Error(_)));
    }
}
