use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use sfu_rust::net::{DnsResolver, ResolvedAddrs, Transport, TransportEvent, TransportFactory};
use sfu_rust::protocol::{Command, IncomingFrame, OutgoingCommand, SendIvs};
use sfu_rust::relay::{
    DnsCache, RelayConfig, RelayConnector, RelayError, RelayEvent, RelayEventKind, RelaySink,
    RelayState, RetryPolicy, TransportRelayConnector,
};
use sfu_rust::sdp::Sdp;
use sfu_rust::types::AvFlags;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};

const URL: &str = "wss://relay.example.com/ws";
const HOST: &str = "relay.example.com";

/// Records frames on entry and holds each send until a permit is released.
struct FakeTransport {
    sent: Mutex<Vec<serde_json::Value>>,
    permits: Semaphore,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, frame: &[u8]) -> anyhow::Result<()> {
        self.sent.lock().push(serde_json::from_slice(frame)?);
        self.permits.acquire().await?.forget();
        Ok(())
    }

    async fn disconnect(&self) {}
}

struct Dialed {
    addr: IpAddr,
    transport: Arc<FakeTransport>,
    events: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct FakeNetwork {
    dialed: Mutex<Vec<Dialed>>,
    failures_left: AtomicUsize,
    /// Sends are released immediately unless this is set.
    hold_sends: bool,
}

impl FakeNetwork {
    fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Default::default()
        }
    }

    fn dial_addrs(&self) -> Vec<IpAddr> {
        self.dialed.lock().iter().map(|d| d.addr).collect()
    }

    fn last(&self) -> (Arc<FakeTransport>, mpsc::Sender<TransportEvent>) {
        let dialed = self.dialed.lock();
        let last = dialed.last().expect("nothing dialed");
        (last.transport.clone(), last.events.clone())
    }
}

#[async_trait]
impl TransportFactory for FakeNetwork {
    async fn create_transport(
        &self,
        _url: &str,
        addr: IpAddr,
    ) -> anyhow::Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let permits = if self.hold_sends { 0 } else { Semaphore::MAX_PERMITS };
        let transport = Arc::new(FakeTransport {
            sent: Mutex::new(Vec::new()),
            permits: Semaphore::new(permits),
        });
        let (tx, rx) = mpsc::channel(16);
        self.dialed.lock().push(Dialed {
            addr,
            transport: transport.clone(),
            events: tx,
        });
        if failing {
            anyhow::bail!("connection refused");
        }
        Ok((transport, rx))
    }
}

struct FakeResolver {
    answer: Mutex<ResolvedAddrs>,
    calls: AtomicUsize,
}

impl FakeResolver {
    fn new(ips: &[&str]) -> Self {
        Self {
            answer: Mutex::new(addrs(ips)),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DnsResolver for FakeResolver {
    async fn resolve(&self, _host: &str) -> anyhow::Result<ResolvedAddrs> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.answer.lock().clone())
    }
}

fn addrs(ips: &[&str]) -> ResolvedAddrs {
    ResolvedAddrs::from_ips(ips.iter().map(|ip| ip.parse::<IpAddr>().unwrap()))
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn config(max_attempts: Option<u32>) -> RelayConfig {
    RelayConfig {
        retry: RetryPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(4),
            max_attempts,
        },
        ..Default::default()
    }
}

struct Harness {
    network: Arc<FakeNetwork>,
    resolver: Arc<FakeResolver>,
    cache: Arc<DnsCache>,
    events: mpsc::Receiver<RelayEvent>,
    relay: Arc<dyn RelaySink>,
}

async fn connect(
    network: FakeNetwork,
    resolver: FakeResolver,
    cache: DnsCache,
    config: RelayConfig,
) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let network = Arc::new(network);
    let resolver = Arc::new(resolver);
    let cache = Arc::new(cache);
    let connector = TransportRelayConnector::new(
        network.clone(),
        resolver.clone(),
        cache.clone(),
        config,
    );
    let (tx, events) = mpsc::channel(64);
    let relay = connector.connect(URL, tx).await.unwrap();
    Harness {
        network,
        resolver,
        cache,
        events,
        relay,
    }
}

impl Harness {
    async fn next(&mut self) -> RelayEventKind {
        let event = tokio::time::timeout(Duration::from_secs(60), self.events.recv())
            .await
            .expect("timed out waiting for relay event")
            .expect("event channel closed");
        assert_eq!(event.connection_id, self.relay.connection_id());
        event.kind
    }

    async fn wait_state(&mut self, wanted: RelayState) {
        loop {
            if let RelayEventKind::StateChanged(state) = self.next().await
                && state == wanted
            {
                return;
            }
        }
    }

    async fn inject(&self, frame: serde_json::Value) {
        let (_, events) = self.network.last();
        events
            .send(TransportEvent::FrameReceived(Bytes::from(frame.to_string())))
            .await
            .unwrap();
    }
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never met: {what}");
}

fn join_command() -> OutgoingCommand {
    OutgoingCommand::Join {
        sdp: Sdp::default(),
        ivs: SendIvs::random(),
        av: AvFlags::EMPTY,
        speaker: false,
        vthumbs: None,
    }
}

fn answer() -> serde_json::Value {
    json!({
        "a": "ANSWER",
        "cid": 7,
        "t": 1,
        "sdp": {"cmn": "v=0\r\n", "tracks": []},
        "peers": []
    })
}

#[tokio::test]
async fn test_connect_reports_states_in_order() {
    let mut h = connect(
        FakeNetwork::default(),
        FakeResolver::new(&["10.0.0.1"]),
        DnsCache::new(),
        config(None),
    )
    .await;

    let mut states = Vec::new();
    while states.last() != Some(&RelayState::Connected) {
        if let RelayEventKind::StateChanged(state) = h.next().await {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            RelayState::Resolving,
            RelayState::Connecting,
            RelayState::Connected
        ]
    );
    assert_eq!(h.relay.state(), RelayState::Connected);
    assert_eq!(h.network.dial_addrs(), vec![ip("10.0.0.1")]);
    assert_eq!(h.cache.get(HOST), Some(addrs(&["10.0.0.1"])));
}

#[tokio::test]
async fn test_rejects_non_websocket_url() {
    let connector = TransportRelayConnector::new(
        Arc::new(FakeNetwork::default()),
        Arc::new(FakeResolver::new(&["10.0.0.1"])),
        Arc::new(DnsCache::new()),
        RelayConfig::default(),
    );
    let (tx, _rx) = mpsc::channel(1);
    let err = connector.connect("https://relay.example.com", tx).await.err();
    assert!(matches!(err, Some(RelayError::InvalidUrl(_))));
}

#[tokio::test]
async fn test_send_requires_open_socket() {
    let network = FakeNetwork::failing(usize::MAX);
    let h = connect(
        network,
        FakeResolver::new(&["10.0.0.1"]),
        DnsCache::new(),
        config(None),
    )
    .await;
    let err = h
        .relay
        .send(OutgoingCommand::Av {
            av: AvFlags::new(true, false),
        })
        .await;
    assert_eq!(err, Err(RelayError::NotConnected));
}

#[tokio::test]
async fn test_frames_leave_one_at_a_time() {
    let network = FakeNetwork {
        hold_sends: true,
        ..Default::default()
    };
    let mut h = connect(
        network,
        FakeResolver::new(&["10.0.0.1"]),
        DnsCache::new(),
        config(None),
    )
    .await;
    h.wait_state(RelayState::Connected).await;

    for cids in [vec![1], vec![2], vec![3]] {
        h.relay
            .send(OutgoingCommand::GetVthumbs { cids })
            .await
            .unwrap();
    }
    let (transport, _) = h.network.last();
    eventually("first frame in flight", || transport.sent.lock().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.sent.lock().len(), 1, "second frame sent before ack");

    transport.permits.add_permits(1);
    eventually("second frame in flight", || transport.sent.lock().len() == 2).await;
    transport.permits.add_permits(1);
    eventually("third frame in flight", || transport.sent.lock().len() == 3).await;

    let sent = transport.sent.lock().clone();
    let order: Vec<_> = sent.iter().map(|f| f["cids"][0].as_u64().unwrap()).collect();
    assert_eq!(order, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_commands_are_held_back_until_answer() {
    let mut h = connect(
        FakeNetwork::default(),
        FakeResolver::new(&["10.0.0.1"]),
        DnsCache::new(),
        config(None),
    )
    .await;
    h.wait_state(RelayState::Connected).await;

    // Not joined yet: dropped.
    h.inject(json!({"a": "AV", "cid": 3, "av": 1})).await;

    h.relay.join(join_command()).await.unwrap();
    h.wait_state(RelayState::Joining).await;
    assert_eq!(
        h.relay.join(join_command()).await,
        Err(RelayError::AlreadyJoining)
    );

    h.inject(answer()).await;
    assert!(matches!(
        h.next().await,
        RelayEventKind::StateChanged(RelayState::Joined)
    ));
    assert!(matches!(
        h.next().await,
        RelayEventKind::Frame(IncomingFrame::Command(Command::Answer(_)))
    ));

    h.inject(json!({"a": "AV", "cid": 3, "av": 3})).await;
    match h.next().await {
        RelayEventKind::Frame(IncomingFrame::Command(Command::Av { cid, av })) => {
            assert_eq!(cid, 3);
            assert_eq!(av, AvFlags::new(true, true));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_error_frames_pass_before_join() {
    let mut h = connect(
        FakeNetwork::default(),
        FakeResolver::new(&["10.0.0.1"]),
        DnsCache::new(),
        config(None),
    )
    .await;
    h.wait_state(RelayState::Connected).await;

    h.inject(json!({"a": "NOT_A_COMMAND"})).await;
    h.inject(json!({"err": 403, "msg": "forbidden"})).await;
    match h.next().await {
        RelayEventKind::Frame(IncomingFrame::Error(err)) => {
            assert_eq!(err.code, 403);
            assert_eq!(err.msg.as_deref(), Some("forbidden"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_retries_with_backoff_then_gives_up() {
    let started = tokio::time::Instant::now();
    let mut h = connect(
        FakeNetwork::failing(usize::MAX),
        FakeResolver::new(&["10.0.0.1", "fd00::1"]),
        DnsCache::new(),
        config(Some(2)),
    )
    .await;

    let failure = loop {
        match h.next().await {
            RelayEventKind::Failed(err) => break err,
            RelayEventKind::StateChanged(RelayState::Connected) => panic!("should not connect"),
            _ => {}
        }
    };
    assert_eq!(failure, RelayError::RetriesExhausted(2));
    assert!(matches!(h.next().await, RelayEventKind::Closed));

    // 1s then 2s between the three attempts.
    assert!(started.elapsed() >= Duration::from_secs(3));
    // Each failure switches address family.
    assert_eq!(
        h.network.dial_addrs(),
        vec![ip("10.0.0.1"), ip("fd00::1"), ip("10.0.0.1")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_socket_loss() {
    let mut h = connect(
        FakeNetwork::default(),
        FakeResolver::new(&["10.0.0.1"]),
        DnsCache::new(),
        config(None),
    )
    .await;
    h.wait_state(RelayState::Connected).await;

    let (_, events) = h.network.last();
    events.send(TransportEvent::Disconnected).await.unwrap();
    h.wait_state(RelayState::Disconnected).await;
    h.wait_state(RelayState::Connected).await;
    assert_eq!(h.network.dialed.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_frames_queued_before_socket_loss_are_not_replayed() {
    let network = FakeNetwork {
        hold_sends: true,
        ..Default::default()
    };
    let mut h = connect(
        network,
        FakeResolver::new(&["10.0.0.1"]),
        DnsCache::new(),
        config(None),
    )
    .await;
    h.wait_state(RelayState::Connected).await;

    for cids in [vec![1], vec![2], vec![3]] {
        h.relay
            .send(OutgoingCommand::GetVthumbs { cids })
            .await
            .unwrap();
    }
    let (first, events) = h.network.last();
    eventually("first frame in flight", || first.sent.lock().len() == 1).await;
    events.send(TransportEvent::Disconnected).await.unwrap();
    h.wait_state(RelayState::Disconnected).await;
    h.wait_state(RelayState::Connected).await;

    let (second, _) = h.network.last();
    assert!(!Arc::ptr_eq(&first, &second));
    h.relay
        .send(OutgoingCommand::GetVthumbs { cids: vec![4] })
        .await
        .unwrap();
    eventually("new frame in flight", || second.sent.lock().len() == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let sent = second.sent.lock().clone();
    let cids: Vec<_> = sent.iter().map(|f| f["cids"][0].as_u64().unwrap()).collect();
    assert_eq!(cids, vec![4]);
    assert_eq!(first.sent.lock().len(), 1);
}

#[tokio::test]
async fn test_changed_dns_answer_replaces_connection() {
    let cache = DnsCache::new();
    cache.set(HOST, addrs(&["10.0.0.1"]));
    let mut h = connect(
        FakeNetwork::default(),
        FakeResolver::new(&["10.0.0.2"]),
        cache,
        config(None),
    )
    .await;

    h.wait_state(RelayState::Connected).await;
    h.wait_state(RelayState::Disconnected).await;
    h.wait_state(RelayState::Connected).await;

    assert_eq!(h.network.dial_addrs(), vec![ip("10.0.0.1"), ip("10.0.0.2")]);
    assert_eq!(h.cache.get(HOST), Some(addrs(&["10.0.0.2"])));
    assert!(h.resolver.calls.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_failed_connect_on_cached_address_forgets_it() {
    let cache = DnsCache::new();
    cache.set(HOST, addrs(&["10.0.0.9"]));
    let mut h = connect(
        FakeNetwork::failing(1),
        FakeResolver::new(&["10.0.0.9"]),
        cache,
        RelayConfig {
            retry: RetryPolicy {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(10),
                max_attempts: None,
            },
            ..Default::default()
        },
    )
    .await;

    h.wait_state(RelayState::Disconnected).await;
    h.wait_state(RelayState::Connected).await;
    assert_eq!(h.network.dialed.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_abort_stops_reconnecting() {
    let mut h = connect(
        FakeNetwork::failing(usize::MAX),
        FakeResolver::new(&["10.0.0.1"]),
        DnsCache::new(),
        config(None),
    )
    .await;
    h.wait_state(RelayState::Disconnected).await;
    h.relay.abort_retries();

    loop {
        match h.next().await {
            RelayEventKind::Failed(err) => {
                assert_eq!(err, RelayError::Aborted);
                break;
            }
            RelayEventKind::StateChanged(RelayState::Connected) => panic!("should not connect"),
            _ => {}
        }
    }
    assert!(matches!(h.next().await, RelayEventKind::Closed));
}

#[tokio::test]
async fn test_disconnect_closes_task() {
    let mut h = connect(
        FakeNetwork::default(),
        FakeResolver::new(&["10.0.0.1"]),
        DnsCache::new(),
        config(None),
    )
    .await;
    h.wait_state(RelayState::Connected).await;

    h.relay.disconnect().await;
    assert!(matches!(h.next().await, RelayEventKind::Closed));
    eventually("state settles", || {
        h.relay.state() == RelayState::Disconnected
    })
    .await;
}
