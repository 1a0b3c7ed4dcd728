use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use courier_common::config::MailboxConfig;
use courier_common::transport::{Frame, FrameKind, JsonCodec, TcpTransport};
use courier_common::{RequestEnvelope, Result, RpcError, RpcMessage, ServerInfo, TraceRole, Tracer};

use super::{Mailbox, MailboxContext, MailboxEvents};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Mailbox over one framed TCP connection.
///
/// Requests are correlated by a per-mailbox increasing id. A background
/// writer owns the write half (and the flush timer in buffered mode), a
/// reader owns the read half, and an optional keepalive task pings the
/// server every `keepalive` interval.
pub struct TcpMailbox {
    inner: Arc<Inner>,
}

struct Inner {
    server: ServerInfo,
    config: MailboxConfig,
    events: MailboxEvents,
    next_id: AtomicU64,
    state: Mutex<LinkState>,
    requests: Mutex<HashMap<u64, PendingCall>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    keepalive: Mutex<KeepAlive>,
}

enum LinkState {
    Idle,
    Connecting,
    Connected(mpsc::UnboundedSender<Outbound>),
    Closed,
}

enum Outbound {
    Publish(RequestEnvelope),
    Ping,
}

struct PendingCall {
    tx: oneshot::Sender<Result<Value>>,
    tracer: Option<Tracer>,
}

/// Keepalive intervals a ping may stay unanswered before the link is dead.
const MISSED_PONG_LIMIT: u32 = 2;

#[derive(Default)]
struct KeepAlive {
    last_ping: Option<Instant>,
    last_pong: Option<Instant>,
    /// Ticks seen since `last_ping` without a pong
    missed: u32,
}

/// Drops the correlation entry when the caller stops waiting.
struct RequestGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        lock(&self.inner.requests).remove(&self.id);
    }
}

impl TcpMailbox {
    pub fn new(ctx: MailboxContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                server: ctx.server,
                config: ctx.config,
                events: ctx.events,
                next_id: AtomicU64::new(0),
                state: Mutex::new(LinkState::Idle),
                requests: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                keepalive: Mutex::new(KeepAlive::default()),
            }),
        }
    }

    pub fn server(&self) -> &ServerInfo {
        &self.inner.server
    }

    /// Number of calls still waiting for a response.
    pub fn pending(&self) -> usize {
        lock(&self.inner.requests).len()
    }
}

impl Inner {
    fn client_id(&self) -> &str {
        &self.config.client_id
    }

    fn server_id(&self) -> &str {
        &self.server.server_id
    }

    fn timeout_message(&self) -> String {
        format!(
            "rpc ({}) callback timeout {}, remote server host: {}, port: {}",
            self.client_id(),
            self.config.invoke_timeout_ms,
            self.server.host,
            self.server.port
        )
    }

    /// Registers a call and hands its envelope to the writer.
    fn enqueue(
        &self,
        msg: RpcMessage,
        tracer: Option<Tracer>,
    ) -> Result<(u64, oneshot::Receiver<Result<Value>>)> {
        let outbound = match &*lock(&self.state) {
            LinkState::Connected(tx) => tx.clone(),
            LinkState::Closed => {
                return Err(RpcError::FailToSend(format!(
                    "{} mailbox has already closed {}",
                    self.client_id(),
                    self.server_id()
                )))
            }
            _ => {
                return Err(RpcError::FailToSend(format!(
                    "{} mailbox is not init {}",
                    self.client_id(),
                    self.server_id()
                )))
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut envelope = RequestEnvelope::new(id, msg);
        if let Some(tracer) = &tracer {
            envelope = envelope.with_trace(tracer.fields());
        }
        let (tx, rx) = oneshot::channel();
        lock(&self.requests).insert(id, PendingCall { tx, tracer });

        if outbound.send(Outbound::Publish(envelope)).is_err() {
            lock(&self.requests).remove(&id);
            return Err(RpcError::FailToSend(format!(
                "{} mailbox lost its writer {}",
                self.client_id(),
                self.server_id()
            )));
        }
        Ok((id, rx))
    }

    /// Pushes a frame to the writer. False when the link is not connected.
    fn push(&self, item: Outbound) -> bool {
        match &*lock(&self.state) {
            LinkState::Connected(tx) => tx.send(item).is_ok(),
            _ => false,
        }
    }

    fn process(&self, payload: &[u8]) {
        let responses = match JsonCodec::decode_responses(payload) {
            Ok(responses) => responses,
            Err(e) => {
                error!(
                    client_id = %self.client_id(),
                    server_id = %self.server_id(),
                    "rpc client failed to process remote server message: {}",
                    e
                );
                return;
            }
        };

        for response in responses {
            // Late replies have no entry left
            let Some(call) = lock(&self.requests).remove(&response.id) else {
                continue;
            };
            let result = response.into_result();
            if let Some(tracer) = &call.tracer {
                tracer.info(TraceRole::Client, "processMsg", "mailbox receive response");
            }
            let server_closed = matches!(result, Err(RpcError::ServerClosed(_)));
            let _ = call.tx.send(result);
            if server_closed {
                self.close();
            }
        }
    }

    fn reject_all(&self, make_error: impl Fn() -> RpcError) {
        let calls: Vec<PendingCall> = lock(&self.requests).drain().map(|(_, call)| call).collect();
        for call in calls {
            let err = make_error();
            if let Some(tracer) = &call.tracer {
                tracer.error(TraceRole::Client, "send", &err.to_string());
            }
            let _ = call.tx.send(Err(err));
        }
    }

    fn abort_tasks(&self) {
        for task in std::mem::take(&mut *lock(&self.tasks)) {
            task.abort();
        }
    }

    fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), LinkState::Closed);
        if matches!(previous, LinkState::Closed) {
            return;
        }
        self.abort_tasks();
        self.reject_all(|| {
            RpcError::ServerClosed(format!(
                "{} mailbox closed {}",
                self.client_id(),
                self.server_id()
            ))
        });
        debug!(server_id = %self.server_id(), "mailbox closed");
        self.events.close();
    }

    /// One keepalive round, run once per `period`. Returns false once the
    /// link was closed.
    fn check_keepalive(&self, period: Duration) -> bool {
        {
            let mut keepalive = lock(&self.keepalive);
            if let Some(ping) = keepalive.last_ping {
                let answered = keepalive.last_pong.is_some_and(|pong| pong >= ping);
                if !answered {
                    keepalive.missed += 1;
                    if keepalive.missed < MISSED_PONG_LIMIT {
                        return true;
                    }
                    keepalive.last_ping = None;
                    keepalive.missed = 0;
                    drop(keepalive);
                    error!(
                        client_id = %self.client_id(),
                        server_id = %self.server_id(),
                        "rpc client keepalive timeout after {}ms",
                        (period * MISSED_PONG_LIMIT).as_millis()
                    );
                    self.events.error("keepalive timeout");
                    self.close();
                    return false;
                }
            }
        }
        if self.push(Outbound::Ping) {
            let mut keepalive = lock(&self.keepalive);
            keepalive.last_ping = Some(Instant::now());
            keepalive.missed = 0;
        }
        true
    }
}

fn encode(envelopes: Vec<RequestEnvelope>) -> Result<Frame> {
    Ok(Frame::publish(JsonCodec::encode_requests(envelopes)?))
}

async fn write_loop(
    inner: Arc<Inner>,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let buffered = inner.config.buffer_msg;
    let mut queue: Vec<RequestEnvelope> = Vec::new();
    let period = inner.config.flush_interval();
    let mut flush = tokio::time::interval_at(Instant::now() + period, period);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let encoded = tokio::select! {
            item = rx.recv() => match item {
                None => break,
                Some(Outbound::Ping) => Ok(Frame::ping_req()),
                Some(Outbound::Publish(envelope)) if buffered => {
                    queue.push(envelope);
                    continue;
                }
                Some(Outbound::Publish(envelope)) => encode(vec![envelope]),
            },
            _ = flush.tick(), if buffered && !queue.is_empty() => encode(std::mem::take(&mut queue)),
        };

        let frame = match encoded {
            Ok(frame) => frame,
            Err(e) => {
                warn!(server_id = %inner.server_id(), "failed to encode rpc request: {}", e);
                continue;
            }
        };
        if let Err(e) = TcpTransport::send_frame(&mut writer, &frame).await {
            error!(
                client_id = %inner.client_id(),
                server_id = %inner.server_id(),
                host = %inner.server.host,
                port = inner.server.port,
                "rpc socket is error: {}",
                e
            );
            inner.events.error(e.to_string());
            inner.close();
            break;
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: OwnedReadHalf) {
    let reason = loop {
        match TcpTransport::receive_frame(&mut reader).await {
            Ok(Some(frame)) => match frame.kind {
                FrameKind::Publish => inner.process(&frame.payload),
                FrameKind::PingResp => lock(&inner.keepalive).last_pong = Some(Instant::now()),
                FrameKind::PingReq => debug!(server_id = %inner.server_id(), "unexpected ping request"),
            },
            Ok(None) => break "connection closed".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    error!(
        client_id = %inner.client_id(),
        server_id = %inner.server_id(),
        "rpc socket is disconnect from remote server, reason: {}",
        reason
    );
    inner.reject_all(|| {
        RpcError::ServerClosed(format!(
            "{} disconnect with remote server {}",
            inner.client_id(),
            inner.server_id()
        ))
    });
    inner.close();
}

async fn keepalive_loop(inner: Arc<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !inner.check_keepalive(period) {
            break;
        }
    }
}

#[async_trait]
impl Mailbox for TcpMailbox {
    fn server_id(&self) -> &str {
        self.inner.server_id()
    }

    async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = lock(&inner.state);
            match *state {
                LinkState::Idle => *state = LinkState::Connecting,
                LinkState::Closed => {
                    return Err(RpcError::InvalidState(format!(
                        "{} mailbox has already closed {}",
                        inner.client_id(),
                        inner.server_id()
                    )))
                }
                _ => {
                    return Err(RpcError::InvalidState(
                        "mailbox has already connected.".to_string(),
                    ))
                }
            }
        }

        let address = inner.server.address();
        let stream = match TcpTransport::connect(&address, inner.config.connect_timeout()).await {
            Ok(stream) => stream,
            Err(e) => {
                let err = match e {
                    RpcError::Timeout(_) => {
                        let message = format!(
                            "rpc client {} connect to remote server {} timeout",
                            inner.client_id(),
                            inner.server_id()
                        );
                        error!("{}", message);
                        RpcError::Timeout(message)
                    }
                    other => other,
                };
                inner.close();
                return Err(err);
            }
        };

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = lock(&inner.state);
            if matches!(*state, LinkState::Closed) {
                return Err(RpcError::InvalidState(format!(
                    "{} mailbox closed while connecting to {}",
                    inner.client_id(),
                    inner.server_id()
                )));
            }
            *state = LinkState::Connected(tx);
        }

        let mut tasks = vec![
            tokio::spawn(write_loop(Arc::clone(inner), writer, rx)),
            tokio::spawn(read_loop(Arc::clone(inner), reader)),
        ];
        let period = inner.config.keepalive();
        if !period.is_zero() {
            tasks.push(tokio::spawn(keepalive_loop(Arc::clone(inner), period)));
        }
        lock(&inner.tasks).extend(tasks);
        if matches!(*lock(&inner.state), LinkState::Closed) {
            inner.abort_tasks();
        }

        info!(
            client_id = %inner.client_id(),
            server_id = %inner.server_id(),
            address = %address,
            "mailbox connected"
        );
        Ok(())
    }

    fn send(&self, msg: RpcMessage, tracer: Option<Tracer>) -> BoxFuture<'static, Result<Value>> {
        if let Some(tracer) = &tracer {
            tracer.info(TraceRole::Client, "send", "tcp-mailbox try to send");
        }
        let (id, rx) = match self.inner.enqueue(msg, tracer.clone()) {
            Ok(pending) => pending,
            Err(e) => {
                if let Some(tracer) = &tracer {
                    tracer.error(TraceRole::Client, "send", &e.to_string());
                }
                return future::ready(Err(e)).boxed();
            }
        };
        let deadline = Instant::now() + self.inner.config.invoke_timeout();
        let inner = Arc::clone(&self.inner);

        async move {
            let _guard = RequestGuard {
                inner: Arc::clone(&inner),
                id,
            };
            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(RpcError::ServerClosed(format!(
                    "{} mailbox dropped the call to {}",
                    inner.client_id(),
                    inner.server_id()
                ))),
                Err(_) => {
                    let message = inner.timeout_message();
                    if let Some(tracer) = &tracer {
                        tracer.error(TraceRole::Client, "send", &message);
                    }
                    Err(RpcError::Timeout(message))
                }
            }
        }
        .boxed()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_connected(&self) -> bool {
        matches!(*lock(&self.inner.state), LinkState::Connected(_))
    }
}

impl Drop for TcpMailbox {
    fn drop(&mut self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::MailboxEvent;
    use courier_common::ResponseEnvelope;
    use serde_json::json;
    use std::future::Future;
    use tokio::net::{TcpListener, TcpStream};

    fn config() -> MailboxConfig {
        MailboxConfig {
            client_id: "client-1".to_string(),
            ..MailboxConfig::default()
        }
    }

    fn mailbox(port: u16, config: MailboxConfig) -> (TcpMailbox, mpsc::UnboundedReceiver<MailboxEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = ServerInfo::new("127.0.0.1", port, "chat").with_server_id("S1");
        let ctx = MailboxContext {
            server,
            config,
            events: MailboxEvents::new(tx, "S1", 1),
        };
        (TcpMailbox::new(ctx), rx)
    }

    /// Accepts one connection and hands it to `handler`.
    async fn fake_server<F, Fut>(handler: F) -> u16
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handler(stream).await;
        });
        port
    }

    async fn reply(stream: &mut TcpStream, responses: Vec<ResponseEnvelope>) {
        let payload = JsonCodec::encode_responses(responses).unwrap();
        TcpTransport::send_frame(stream, &Frame::publish(payload)).await.unwrap();
    }

    /// Answers every call with its first argument and every ping with a pong.
    async fn echo(mut stream: TcpStream) {
        while let Ok(Some(frame)) = TcpTransport::receive_frame(&mut stream).await {
            match frame.kind {
                FrameKind::Publish => {
                    let responses = JsonCodec::decode_requests(&frame.payload)
                        .unwrap()
                        .into_iter()
                        .map(|r| ResponseEnvelope::success(r.id, r.msg.args.first().cloned().unwrap_or(Value::Null)))
                        .collect();
                    reply(&mut stream, responses).await;
                }
                FrameKind::PingReq => {
                    TcpTransport::send_frame(&mut stream, &Frame::ping_resp()).await.unwrap();
                }
                FrameKind::PingResp => {}
            }
        }
    }

    // ========================================================================
    // Send / receive
    // ========================================================================

    #[tokio::test]
    async fn test_send_resolves_with_response() {
        let port = fake_server(echo).await;
        let (mailbox, _events) = mailbox(port, config());
        mailbox.connect().await.unwrap();
        assert!(mailbox.is_connected());

        let a = mailbox.send(RpcMessage::new("echo", vec![json!("a")]), None);
        let b = mailbox.send(RpcMessage::new("echo", vec![json!(2)]), None);
        assert_eq!(a.await.unwrap(), json!("a"));
        assert_eq!(b.await.unwrap(), json!(2));
        assert_eq!(mailbox.pending(), 0);
    }

    #[tokio::test]
    async fn test_error_response_keeps_remote_kind() {
        let port = fake_server(|mut stream| async move {
            let frame = TcpTransport::receive_frame(&mut stream).await.unwrap().unwrap();
            let request = JsonCodec::decode_requests(&frame.payload).unwrap().remove(0);
            let err = RpcError::ServiceNotFound("no such service: missing.".to_string());
            reply(&mut stream, vec![ResponseEnvelope::failure(request.id, &err)]).await;
            let _ = TcpTransport::receive_frame(&mut stream).await;
        })
        .await;
        let (mailbox, _events) = mailbox(port, config());
        mailbox.connect().await.unwrap();

        let err = mailbox.send(RpcMessage::new("missing", vec![]), None).await.unwrap_err();
        assert!(matches!(err, RpcError::ServiceNotFound(_)));
        assert_eq!(err.to_string(), "no such service: missing.");
        assert!(mailbox.is_connected());
    }

    #[tokio::test]
    async fn test_buffered_calls_share_one_frame() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let port = fake_server(move |mut stream| async move {
            let frame = TcpTransport::receive_frame(&mut stream).await.unwrap().unwrap();
            let requests = JsonCodec::decode_requests(&frame.payload).unwrap();
            seen_tx.send(requests.len()).unwrap();
            let responses = requests
                .into_iter()
                .map(|r| ResponseEnvelope::success(r.id, json!(r.msg.service)))
                .collect();
            reply(&mut stream, responses).await;
            let _ = TcpTransport::receive_frame(&mut stream).await;
        })
        .await;
        let (mailbox, _events) = mailbox(
            port,
            MailboxConfig {
                buffer_msg: true,
                ..config()
            },
        );
        mailbox.connect().await.unwrap();

        let calls: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|s| mailbox.send(RpcMessage::new(*s, vec![]), None))
            .collect();
        let results = futures::future::join_all(calls).await;

        assert_eq!(seen_rx.recv().await, Some(3));
        let services: Vec<Value> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(services, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_trace_fields_travel_with_request() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let port = fake_server(move |mut stream| async move {
            let frame = TcpTransport::receive_frame(&mut stream).await.unwrap().unwrap();
            let request = JsonCodec::decode_requests(&frame.payload).unwrap().remove(0);
            seen_tx.send(request.trace.clone()).unwrap();
            reply(&mut stream, vec![ResponseEnvelope::success(request.id, Value::Null)]).await;
            let _ = TcpTransport::receive_frame(&mut stream).await;
        })
        .await;
        let (mailbox, _events) = mailbox(port, config());
        mailbox.connect().await.unwrap();

        let tracer = Tracer::new("client-1", "S1", json!({"service": "ping"}));
        mailbox.send(RpcMessage::new("ping", vec![]), Some(tracer.clone())).await.unwrap();

        let trace = seen_rx.recv().await.unwrap();
        assert_eq!(trace.trace_id.as_deref(), Some(tracer.id()));
        assert_eq!(trace.source.as_deref(), Some("client-1"));
    }

    // ========================================================================
    // Timeouts
    // ========================================================================

    #[tokio::test]
    async fn test_timeout_then_late_reply_is_ignored() {
        let (late_tx, late_rx) = oneshot::channel::<()>();
        let port = fake_server(move |mut stream| async move {
            let frame = TcpTransport::receive_frame(&mut stream).await.unwrap().unwrap();
            let request = JsonCodec::decode_requests(&frame.payload).unwrap().remove(0);
            late_rx.await.unwrap();
            reply(&mut stream, vec![ResponseEnvelope::success(request.id, json!("late"))]).await;
            echo(stream).await;
        })
        .await;
        let (mailbox, _events) = mailbox(
            port,
            MailboxConfig {
                invoke_timeout_ms: 100,
                ..config()
            },
        );
        mailbox.connect().await.unwrap();

        let err = mailbox.send(RpcMessage::new("slow", vec![]), None).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout(_)));
        assert_eq!(
            err.to_string(),
            format!("rpc (client-1) callback timeout 100, remote server host: 127.0.0.1, port: {}", port)
        );
        assert_eq!(mailbox.pending(), 0);

        late_tx.send(()).unwrap();
        let next = mailbox.send(RpcMessage::new("echo", vec![json!(7)]), None).await.unwrap();
        assert_eq!(next, json!(7));
        assert!(mailbox.is_connected());
        assert_eq!(mailbox.pending(), 0);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let (mailbox, _events) = mailbox(1, config());
        let err = mailbox.send(RpcMessage::new("echo", vec![]), None).await.unwrap_err();
        assert!(matches!(err, RpcError::FailToSend(_)));
        assert!(err.to_string().contains("not init"));
    }

    #[tokio::test]
    async fn test_connect_twice_and_after_close_fail() {
        let port = fake_server(echo).await;
        let (mailbox, mut events) = mailbox(port, config());
        mailbox.connect().await.unwrap();
        assert!(matches!(mailbox.connect().await, Err(RpcError::InvalidState(_))));

        mailbox.close();
        mailbox.close();
        assert!(!mailbox.is_connected());
        assert!(matches!(mailbox.connect().await, Err(RpcError::InvalidState(_))));
        assert_eq!(
            events.recv().await,
            Some(MailboxEvent::Close {
                server_id: "S1".to_string(),
                serial: 1
            })
        );
        assert!(events.try_recv().is_err());

        let err = mailbox.send(RpcMessage::new("echo", vec![]), None).await.unwrap_err();
        assert!(err.to_string().contains("already closed"));
    }

    #[tokio::test]
    async fn test_connect_refused_closes_mailbox() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (mailbox, mut events) = mailbox(port, config());
        assert!(mailbox.connect().await.is_err());
        assert!(matches!(events.recv().await, Some(MailboxEvent::Close { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_rejects_pending_with_server_closed() {
        let port = fake_server(|mut stream| async move {
            let _ = TcpTransport::receive_frame(&mut stream).await;
            drop(stream);
        })
        .await;
        let (mailbox, mut events) = mailbox(port, config());
        mailbox.connect().await.unwrap();

        let err = mailbox.send(RpcMessage::new("echo", vec![]), None).await.unwrap_err();
        assert!(matches!(err, RpcError::ServerClosed(_)));
        assert_eq!(err.to_string(), "client-1 disconnect with remote server S1");
        assert!(matches!(events.recv().await, Some(MailboxEvent::Close { .. })));
        assert!(!mailbox.is_connected());
    }

    #[tokio::test]
    async fn test_server_closed_response_closes_mailbox() {
        let port = fake_server(|mut stream| async move {
            let frame = TcpTransport::receive_frame(&mut stream).await.unwrap().unwrap();
            let request = JsonCodec::decode_requests(&frame.payload).unwrap().remove(0);
            let err = RpcError::ServerClosed("Server \"S1\" is closed".to_string());
            reply(&mut stream, vec![ResponseEnvelope::failure(request.id, &err)]).await;
            let _ = TcpTransport::receive_frame(&mut stream).await;
        })
        .await;
        let (mailbox, mut events) = mailbox(port, config());
        mailbox.connect().await.unwrap();

        let err = mailbox.send(RpcMessage::new("echo", vec![]), None).await.unwrap_err();
        assert_eq!(err.to_string(), "Server \"S1\" is closed");
        assert!(matches!(events.recv().await, Some(MailboxEvent::Close { .. })));
        assert!(!mailbox.is_connected());
    }

    // ========================================================================
    // Keepalive
    // ========================================================================

    #[tokio::test]
    async fn test_missing_pongs_close_the_link() {
        let port = fake_server(|mut stream| async move {
            while let Ok(Some(_)) = TcpTransport::receive_frame(&mut stream).await {}
        })
        .await;
        let (mailbox, mut events) = mailbox(
            port,
            MailboxConfig {
                keepalive_ms: 30,
                ..config()
            },
        );
        mailbox.connect().await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert!(matches!(first, Some(MailboxEvent::Error { .. })));
        assert!(matches!(events.recv().await, Some(MailboxEvent::Close { .. })));
        assert!(!mailbox.is_connected());
    }

    #[tokio::test]
    async fn test_keepalive_closes_two_intervals_after_unanswered_ping() {
        let period = Duration::from_millis(200);
        let port = fake_server(|mut stream| async move {
            while let Ok(Some(_)) = TcpTransport::receive_frame(&mut stream).await {}
        })
        .await;
        let (mailbox, mut events) = mailbox(
            port,
            MailboxConfig {
                keepalive_ms: period.as_millis() as u64,
                ..config()
            },
        );
        let started = Instant::now();
        mailbox.connect().await.unwrap();

        // The first ping goes out one period after connect
        let event = tokio::time::timeout(period * 6, events.recv()).await.unwrap();
        let elapsed = started.elapsed();
        assert!(matches!(event, Some(MailboxEvent::Error { .. })));
        assert!(elapsed >= period * 3, "closed too early: {:?}", elapsed);
        assert!(elapsed < period * 3 + period / 2, "closed too late: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_answered_pings_keep_the_link() {
        let port = fake_server(echo).await;
        let (mailbox, mut events) = mailbox(
            port,
            MailboxConfig {
                keepalive_ms: 20,
                ..config()
            },
        );
        mailbox.connect().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(mailbox.is_connected());
        assert!(events.try_recv().is_err());
    }
}
