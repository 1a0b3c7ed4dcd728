// Integration tests for the courier client
//
// Mailboxes are replaced by an in-process fake whose connect can be held
// open, released or failed, so the station's queueing can be observed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::watch;

use courier_client::router::RoundRobinCounters;
use courier_client::{
    Client, ClientState, Mailbox, MailboxContext, MailboxEvents, MailboxFactory, Router,
    StationEvent,
};
use courier_common::config::{ClientConfig, LocalRegistryConfig};
use courier_common::{codes, Result, RpcError, RpcMessage, ServerInfo, ServerMap, Tracer};
use courier_registry::{
    LocalRegistry, LocalRegistryHub, Registry, RegistryEvent, RegistryState, Subscription,
};

// ============================================================================
// Fake mailboxes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Held,
    Open,
    Fail,
}

struct FakeNet {
    gate: watch::Sender<Gate>,
    sent: Mutex<Vec<(String, String)>>,
    mailboxes: Mutex<Vec<Arc<FakeMailbox>>>,
}

impl FakeNet {
    fn new(gate: Gate) -> Arc<Self> {
        Arc::new(Self {
            gate: watch::channel(gate).0,
            sent: Mutex::new(Vec::new()),
            mailboxes: Mutex::new(Vec::new()),
        })
    }

    fn set_gate(&self, gate: Gate) {
        self.gate.send_replace(gate);
    }

    fn sent_services(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, s)| s.clone()).collect()
    }

    fn mailbox(&self, server_id: &str) -> Option<Arc<FakeMailbox>> {
        self.mailboxes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|m| m.server_id == server_id)
            .cloned()
    }
}

struct FakeMailbox {
    server_id: String,
    events: MailboxEvents,
    gate: watch::Receiver<Gate>,
    net: Arc<FakeNet>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl FakeMailbox {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mailbox for FakeMailbox {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn connect(&self) -> Result<()> {
        let mut gate = self.gate.clone();
        let outcome = gate
            .wait_for(|g| *g != Gate::Held)
            .await
            .map(|g| *g)
            .unwrap_or(Gate::Fail);
        if outcome == Gate::Open {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            self.close();
            Err(RpcError::Transport("connection refused".to_string()))
        }
    }

    fn send(&self, msg: RpcMessage, _tracer: Option<Tracer>) -> BoxFuture<'static, Result<Value>> {
        if !self.is_connected() {
            return future::ready(Err(RpcError::FailToSend("fake mailbox is not init".to_string()))).boxed();
        }
        self.net
            .sent
            .lock()
            .unwrap()
            .push((self.server_id.clone(), msg.service.clone()));
        let reply = json!({ "server": self.server_id, "service": msg.service });
        future::ready(Ok(reply)).boxed()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
            self.events.close();
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct FakeFactory(Arc<FakeNet>);

impl MailboxFactory for FakeFactory {
    fn create(&self, ctx: MailboxContext) -> Arc<dyn Mailbox> {
        let mailbox = Arc::new(FakeMailbox {
            server_id: ctx.server.server_id.clone(),
            events: ctx.events,
            gate: self.0.gate.subscribe(),
            net: Arc::clone(&self.0),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.0.mailboxes.lock().unwrap().push(Arc::clone(&mailbox));
        mailbox
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Local registry whose first server listing fails.
struct FlakyRegistry {
    inner: LocalRegistry,
    fail_next: AtomicBool,
}

#[async_trait]
impl Registry for FlakyRegistry {
    fn start(&self) {
        self.inner.start()
    }

    fn stop(&self) {
        self.inner.stop()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn state(&self) -> RegistryState {
        self.inner.state()
    }

    async fn register(&self, info: ServerInfo) -> Result<()> {
        self.inner.register(info).await
    }

    async fn unregister(&self, server_id: &str) -> Result<()> {
        self.inner.unregister(server_id).await
    }

    async fn get_server_info(&self, server_id: &str) -> Result<ServerInfo> {
        self.inner.get_server_info(server_id).await
    }

    async fn get_all_servers(&self) -> Result<ServerMap> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RpcError::ConnectionLoss("registry is still connecting".to_string()));
        }
        self.inner.get_all_servers().await
    }

    fn subscribe(&self) -> Subscription {
        self.inner.subscribe()
    }

    fn events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events()
    }
}

struct Cluster {
    hub: Arc<LocalRegistryHub>,
    servers: LocalRegistry,
    net: Arc<FakeNet>,
}

impl Cluster {
    async fn new(gate: Gate, infos: &[ServerInfo]) -> Self {
        let hub = LocalRegistryHub::new();
        let servers = hub.registry(&LocalRegistryConfig::default());
        servers.start();
        for info in infos {
            servers.register(info.clone()).await.unwrap();
        }
        Self {
            hub,
            servers,
            net: FakeNet::new(gate),
        }
    }

    fn client(&self, config: ClientConfig) -> Client {
        Client::with_mailbox_factory(
            ClientConfig {
                grace_timeout_ms: 100,
                ..config
            },
            Arc::new(self.hub.registry(&LocalRegistryConfig::default())),
            Arc::new(FakeFactory(Arc::clone(&self.net))),
        )
    }
}

fn server(id: &str, server_type: &str, port: u16) -> ServerInfo {
    ServerInfo::new("127.0.0.1", port, server_type).with_server_id(id)
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_invoke_by_server_id() {
    let cluster = Cluster::new(Gate::Open, &[server("S1", "chat", 4001)]).await;
    let client = cluster.client(ClientConfig::default());
    client.start().await.unwrap();

    let reply = client.rpc_invoke("S1", "plus", vec![json!(1), json!(2)]).await.unwrap();
    assert_eq!(reply, json!({"server": "S1", "service": "plus"}));
    assert!(client.station().has_mailbox("S1"));
}

#[tokio::test]
async fn test_unknown_server_is_not_found() {
    let cluster = Cluster::new(Gate::Open, &[server("S1", "chat", 4001)]).await;
    let client = cluster.client(ClientConfig::default());
    client.start().await.unwrap();
    let mut events = client.events();

    let err = client.rpc_invoke("unknown", "plus", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::ServerNotFound(_)));
    assert_eq!(err.to_string(), "fail to find remote server:unknown");
    assert_eq!(
        events.recv().await.unwrap(),
        StationEvent::Error {
            code: codes::SERVER_NOT_FOUND.to_string(),
            server_id: "unknown".to_string()
        }
    );
}

#[tokio::test]
async fn test_invoke_requires_start() {
    let cluster = Cluster::new(Gate::Open, &[server("S1", "chat", 4001)]).await;
    let client = cluster.client(ClientConfig::default());

    let err = client.rpc_invoke("S1", "plus", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::NotRunning(_)));

    client.start().await.unwrap();
    client.stop(true);
    let err = client.rpc_invoke("S1", "plus", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::NotRunning(_)));
}

#[tokio::test]
async fn test_pending_calls_flush_in_order() {
    let cluster = Cluster::new(Gate::Held, &[server("S1", "chat", 4001)]).await;
    let client = Arc::new(cluster.client(ClientConfig::default()));
    client.start().await.unwrap();

    let mut calls = Vec::new();
    for (i, service) in ["first", "second", "third"].into_iter().enumerate() {
        let c = Arc::clone(&client);
        calls.push(tokio::spawn(async move { c.rpc_invoke("S1", service, vec![]).await }));
        wait_until(|| client.station().pending("S1") == i + 1).await;
    }
    assert!(cluster.net.sent_services().is_empty());

    cluster.net.set_gate(Gate::Open);
    for call in calls {
        call.await.unwrap().unwrap();
    }
    assert_eq!(cluster.net.sent_services(), vec!["first", "second", "third"]);
    assert_eq!(client.station().pending("S1"), 0);

    client.rpc_invoke("S1", "fourth", vec![]).await.unwrap();
    assert_eq!(cluster.net.sent_services().len(), 4);
}

#[tokio::test]
async fn test_calls_beyond_pending_size_are_dropped() {
    let cluster = Cluster::new(Gate::Held, &[server("S1", "chat", 4001)]).await;
    let client = Arc::new(cluster.client(ClientConfig {
        pending_size: 3,
        ..ClientConfig::default()
    }));
    client.start().await.unwrap();

    let mut calls = Vec::new();
    for i in 0..4 {
        let c = Arc::clone(&client);
        calls.push(tokio::spawn(async move { c.rpc_invoke("S1", &format!("call-{}", i), vec![]).await }));
        wait_until(|| client.station().pending("S1") == (i + 1).min(3)).await;
    }
    let dropped = calls.pop().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!dropped.is_finished());

    cluster.net.set_gate(Gate::Open);
    for call in calls {
        call.await.unwrap().unwrap();
    }
    assert_eq!(cluster.net.sent_services(), vec!["call-0", "call-1", "call-2"]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!dropped.is_finished());
    dropped.abort();
}

#[tokio::test]
async fn test_connect_failure_rejects_pending() {
    let cluster = Cluster::new(Gate::Held, &[server("S1", "chat", 4001)]).await;
    let client = Arc::new(cluster.client(ClientConfig::default()));
    client.start().await.unwrap();
    let mut events = client.events();

    let mut calls = Vec::new();
    for i in 0..2 {
        let c = Arc::clone(&client);
        calls.push(tokio::spawn(async move { c.rpc_invoke("S1", "plus", vec![]).await }));
        wait_until(|| client.station().pending("S1") == i + 1).await;
    }

    cluster.net.set_gate(Gate::Fail);
    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::FailToSend(_)));
    }
    assert!(!client.station().has_mailbox("S1"));

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if event
            == (StationEvent::Error {
                code: codes::FAIL_TO_SEND.to_string(),
                server_id: "S1".to_string(),
            })
        {
            saw_error = true;
        }
    }
    assert!(saw_error);
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_route_includes_wildcard_servers() {
    let cluster = Cluster::new(
        Gate::Open,
        &[
            server("c2", "chat", 4002),
            server("c1", "chat", 4001),
            server("w1", "*", 5000),
            server("g1", "gate", 3000),
        ],
    )
    .await;
    let client = cluster
        .client(ClientConfig::default())
        .with_router(Router::RoundRobin(Arc::new(RoundRobinCounters::new())));
    client.start().await.unwrap();

    assert_eq!(client.route_candidates("chat"), vec!["c1", "c2", "w1"]);
    assert_eq!(client.route_candidates("*"), vec!["w1"]);

    let mut picked = Vec::new();
    for _ in 0..4 {
        let reply = client.rpc_invoke_by_route("chat", "join", vec![], None).await.unwrap();
        picked.push(reply["server"].as_str().unwrap().to_string());
    }
    assert_eq!(picked, vec!["c1", "c2", "w1", "c1"]);
}

#[tokio::test]
async fn test_route_with_seed_is_sticky() {
    let cluster = Cluster::new(
        Gate::Open,
        &[server("c1", "chat", 4001), server("c2", "chat", 4002), server("c3", "chat", 4003)],
    )
    .await;
    let client = cluster.client(ClientConfig::default());
    client.start().await.unwrap();

    let first = client.rpc_invoke_by_route("chat", "join", vec![], Some("room-7")).await.unwrap();
    for _ in 0..5 {
        let again = client.rpc_invoke_by_route("chat", "join", vec![], Some("room-7")).await.unwrap();
        assert_eq!(again["server"], first["server"]);
    }
}

#[tokio::test]
async fn test_route_without_candidates() {
    let cluster = Cluster::new(Gate::Open, &[server("g1", "gate", 3000)]).await;
    let client = cluster.client(ClientConfig::default());
    client.start().await.unwrap();

    let err = client.rpc_invoke_by_route("chat", "join", vec![], None).await.unwrap_err();
    assert!(matches!(err, RpcError::NoServerFound(_)));
    assert_eq!(err.to_string(), "cannot find server info by type: chat");
}

// ============================================================================
// Registry changes and shutdown
// ============================================================================

#[tokio::test]
async fn test_changed_server_info_closes_mailbox() {
    let cluster = Cluster::new(Gate::Open, &[server("S1", "chat", 4001)]).await;
    let client = cluster.client(ClientConfig::default());
    client.start().await.unwrap();
    client.rpc_invoke("S1", "plus", vec![]).await.unwrap();
    let first = cluster.net.mailbox("S1").unwrap();

    cluster.servers.register(server("S1", "chat", 4010)).await.unwrap();
    wait_until(|| first.is_closed()).await;
    wait_until(|| client.servers()["S1"].port == 4010).await;
    assert!(!client.station().has_mailbox("S1"));

    client.rpc_invoke("S1", "plus", vec![]).await.unwrap();
    let second = cluster.net.mailbox("S1").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_removed_server_closes_mailbox() {
    let cluster = Cluster::new(Gate::Open, &[server("S1", "chat", 4001), server("S2", "chat", 4002)]).await;
    let client = cluster.client(ClientConfig::default());
    client.start().await.unwrap();
    client.rpc_invoke("S1", "plus", vec![]).await.unwrap();

    cluster.servers.unregister("S1").await.unwrap();
    let mailbox = cluster.net.mailbox("S1").unwrap();
    wait_until(|| mailbox.is_closed()).await;
    assert_eq!(client.servers_by_type("chat"), vec!["S2"]);
}

#[tokio::test]
async fn test_mailbox_close_emits_station_event() {
    let cluster = Cluster::new(Gate::Open, &[server("S1", "chat", 4001)]).await;
    let client = cluster.client(ClientConfig::default());
    client.start().await.unwrap();
    let mut events = client.events();
    client.rpc_invoke("S1", "plus", vec![]).await.unwrap();

    cluster.net.mailbox("S1").unwrap().close();
    assert_eq!(events.recv().await.unwrap(), StationEvent::Close("S1".to_string()));
    assert!(!client.station().has_mailbox("S1"));
}

#[tokio::test]
async fn test_stale_mailbox_close_is_not_announced() {
    let cluster = Cluster::new(Gate::Open, &[server("S1", "chat", 4001)]).await;
    let client = cluster.client(ClientConfig::default());
    client.start().await.unwrap();
    let mut events = client.events();
    client.rpc_invoke("S1", "plus", vec![]).await.unwrap();
    let first = cluster.net.mailbox("S1").unwrap();

    cluster.servers.register(server("S1", "chat", 4010)).await.unwrap();
    wait_until(|| first.is_closed()).await;
    wait_until(|| client.servers()["S1"].port == 4010).await;
    client.rpc_invoke("S1", "plus", vec![]).await.unwrap();
    let second = cluster.net.mailbox("S1").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert!(client.station().has_mailbox("S1"));

    second.close();
    assert_eq!(events.recv().await.unwrap(), StationEvent::Close("S1".to_string()));
    assert!(!client.station().has_mailbox("S1"));
}

#[tokio::test]
async fn test_failed_start_can_be_retried() {
    let cluster = Cluster::new(Gate::Open, &[server("S1", "chat", 4001)]).await;
    let registry = Arc::new(FlakyRegistry {
        inner: cluster.hub.registry(&LocalRegistryConfig::default()),
        fail_next: AtomicBool::new(true),
    });
    let client = Client::with_mailbox_factory(
        ClientConfig::default(),
        registry,
        Arc::new(FakeFactory(Arc::clone(&cluster.net))),
    );

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, RpcError::ConnectionLoss(_)));
    assert_eq!(client.state(), ClientState::Inited);

    client.start().await.unwrap();
    assert_eq!(client.state(), ClientState::Started);
    assert!(client.servers().contains_key("S1"));
    let reply = client.rpc_invoke("S1", "plus", vec![]).await.unwrap();
    assert_eq!(reply["server"], json!("S1"));
    client.stop(true);
}

#[tokio::test]
async fn test_stop_waits_for_grace_window() {
    let cluster = Cluster::new(Gate::Open, &[server("S1", "chat", 4001)]).await;
    let client = cluster.client(ClientConfig::default());
    client.start().await.unwrap();
    client.rpc_invoke("S1", "plus", vec![]).await.unwrap();
    let mailbox = cluster.net.mailbox("S1").unwrap();

    client.stop(false);
    assert!(!mailbox.is_closed());
    wait_until(|| mailbox.is_closed()).await;
}

#[tokio::test]
async fn test_forced_stop_closes_immediately() {
    let cluster = Cluster::new(Gate::Open, &[server("S1", "chat", 4001)]).await;
    let client = cluster.client(ClientConfig::default());
    client.start().await.unwrap();
    client.rpc_invoke("S1", "plus", vec![]).await.unwrap();

    client.stop(true);
    assert!(cluster.net.mailbox("S1").unwrap().is_closed());
    assert!(!client.station().registry().is_connected());
}
