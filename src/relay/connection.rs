use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use sfucore::net::{DnsResolver, ResolvedAddrs, Transport, TransportEvent, TransportFactory};
use sfucore::protocol::{Command, IncomingFrame, OutgoingCommand, parse_frame};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    Backoff, CommandsQueue, DnsCache, RelayConfig, RelayConnector, RelayError, RelayEvent,
    RelayEventKind, RelaySink, RelayState,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type DnsResult = (u64, anyhow::Result<ResolvedAddrs>);

enum RelayCommand {
    Send { frame: Vec<u8>, name: &'static str },
    Join(Vec<u8>),
}

/// Owner handle of a running [`RelayConnection`]. Dropping it closes the
/// connection.
pub struct RelayHandle {
    connection_id: u64,
    commands: mpsc::Sender<RelayCommand>,
    state: watch::Receiver<RelayState>,
    cancel: CancellationToken,
    abort: CancellationToken,
}

impl RelayHandle {
    /// Validates `url` and starts connecting in the background.
    pub fn spawn(
        url: &str,
        factory: Arc<dyn TransportFactory>,
        resolver: Arc<dyn DnsResolver>,
        dns_cache: Arc<DnsCache>,
        config: RelayConfig,
        events: mpsc::Sender<RelayEvent>,
    ) -> Result<Self, RelayError> {
        let parsed = Url::parse(url).map_err(|e| RelayError::InvalidUrl(format!("{url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(RelayError::InvalidUrl(format!(
                "{url}: unsupported scheme {}",
                parsed.scheme()
            )));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| RelayError::InvalidUrl(format!("{url}: missing host")))?
            .to_string();

        let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (commands_tx, commands_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(RelayState::New);
        let (dns_tx, dns_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let abort = CancellationToken::new();

        let connection = RelayConnection {
            id: connection_id,
            url: url.to_string(),
            host,
            factory,
            resolver,
            dns_cache,
            queue: CommandsQueue::new(config.queue_capacity),
            backoff: Backoff::new(config.retry.clone()),
            config,
            commands: commands_rx,
            events,
            state: state_tx,
            cancel: cancel.clone(),
            abort: abort.clone(),
            prefer_ipv6: false,
            dns_round: 0,
            dns_tx,
            dns_rx,
        };
        tokio::spawn(connection.run());

        Ok(Self {
            connection_id,
            commands: commands_tx,
            state: state_rx,
            cancel,
            abort,
        })
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl RelaySink for RelayHandle {
    fn connection_id(&self) -> u64 {
        self.connection_id
    }

    fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    async fn send(&self, cmd: OutgoingCommand) -> Result<(), RelayError> {
        if !self.state().is_online() {
            return Err(RelayError::NotConnected);
        }
        self.commands
            .send(RelayCommand::Send {
                frame: cmd.to_frame(),
                name: cmd.name(),
            })
            .await
            .map_err(|_| RelayError::Closed)
    }

    async fn join(&self, cmd: OutgoingCommand) -> Result<(), RelayError> {
        match self.state() {
            RelayState::Connected => {}
            RelayState::Joining | RelayState::Joined => return Err(RelayError::AlreadyJoining),
            _ => return Err(RelayError::NotConnected),
        }
        self.commands
            .send(RelayCommand::Join(cmd.to_frame()))
            .await
            .map_err(|_| RelayError::Closed)
    }

    fn abort_retries(&self) {
        self.abort.cancel();
    }

    async fn disconnect(&self) {
        self.abort.cancel();
        self.cancel.cancel();
    }
}

/// Creates [`RelayHandle`]s over a real transport factory and resolver.
pub struct TransportRelayConnector {
    factory: Arc<dyn TransportFactory>,
    resolver: Arc<dyn DnsResolver>,
    dns_cache: Arc<DnsCache>,
    config: RelayConfig,
}

impl TransportRelayConnector {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        resolver: Arc<dyn DnsResolver>,
        dns_cache: Arc<DnsCache>,
        config: RelayConfig,
    ) -> Self {
        Self {
            factory,
            resolver,
            dns_cache,
            config,
        }
    }
}

#[async_trait]
impl RelayConnector for TransportRelayConnector {
    async fn connect(
        &self,
        url: &str,
        events: mpsc::Sender<RelayEvent>,
    ) -> Result<Arc<dyn RelaySink>, RelayError> {
        let handle = RelayHandle::spawn(
            url,
            self.factory.clone(),
            self.resolver.clone(),
            self.dns_cache.clone(),
            self.config.clone(),
            events,
        )?;
        Ok(Arc::new(handle))
    }
}

enum LinkEnd {
    /// Owner asked to close or went away.
    Closed,
    /// The socket failed. Retry with backoff.
    Lost(RelayError),
    /// The host resolved to different addresses than the ones in use.
    StaleAddress,
}

struct Link {
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    /// Addresses taken from the cache for this attempt, if any.
    cached: Option<ResolvedAddrs>,
}

struct RelayConnection {
    id: u64,
    url: String,
    host: String,
    factory: Arc<dyn TransportFactory>,
    resolver: Arc<dyn DnsResolver>,
    dns_cache: Arc<DnsCache>,
    config: RelayConfig,
    commands: mpsc::Receiver<RelayCommand>,
    events: mpsc::Sender<RelayEvent>,
    state: watch::Sender<RelayState>,
    cancel: CancellationToken,
    abort: CancellationToken,
    queue: CommandsQueue,
    backoff: Backoff,
    prefer_ipv6: bool,
    dns_round: u64,
    dns_tx: mpsc::Sender<DnsResult>,
    dns_rx: mpsc::Receiver<DnsResult>,
}

impl RelayConnection {
    async fn run(mut self) {
        let id = self.id;
        let closed_tx = self.events.clone();
        let _closed = scopeguard::guard((), move |_| {
            let _ = closed_tx.try_send(RelayEvent {
                connection_id: id,
                kind: RelayEventKind::Closed,
            });
        });

        info!(target: "Relay", "[{id}] starting connection to {}", self.url);
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let failure = match self.establish().await {
                Ok(link) => {
                    self.backoff.reset();
                    match self.serve(link).await {
                        LinkEnd::Closed => break,
                        LinkEnd::StaleAddress => {
                            self.set_state(RelayState::Disconnected).await;
                            continue;
                        }
                        LinkEnd::Lost(e) => e,
                    }
                }
                Err(RelayError::Closed) => break,
                Err(e) => e,
            };

            warn!(target: "Relay", "[{id}] {failure}");
            self.prefer_ipv6 = !self.prefer_ipv6;
            self.set_state(RelayState::Disconnected).await;

            if self.abort.is_cancelled() {
                self.fail(RelayError::Aborted).await;
                break;
            }
            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.attempts();
                self.fail(RelayError::RetriesExhausted(attempts)).await;
                break;
            };
            info!(
                target: "Relay",
                "[{id}] reconnecting in {delay:?} (attempt {})",
                self.backoff.attempts()
            );
            if !self.wait_retry(delay).await {
                break;
            }
        }

        self.state.send_replace(RelayState::Disconnected);
        debug!(target: "Relay", "[{id}] connection task finished");
    }

    async fn establish(&mut self) -> Result<Link, RelayError> {
        self.set_state(RelayState::Resolving).await;
        self.dns_round += 1;
        let round = self.dns_round;

        let cached = self.dns_cache.get(&self.host).filter(|a| !a.is_empty());
        let addrs = match &cached {
            Some(cached) => {
                debug!(
                    target: "Relay",
                    "[{}] using cached addresses for {}, refreshing in background",
                    self.id, self.host
                );
                let resolver = self.resolver.clone();
                let host = self.host.clone();
                let tx = self.dns_tx.clone();
                tokio::spawn(async move {
                    let result = resolver.resolve(&host).await;
                    let _ = tx.send((round, result)).await;
                });
                cached.clone()
            }
            None => {
                let result = tokio::select! {
                    r = self.resolver.resolve(&self.host) => r,
                    _ = self.cancel.cancelled() => return Err(RelayError::Closed),
                };
                let addrs = result.map_err(|e| RelayError::Dns {
                    host: self.host.clone(),
                    reason: e.to_string(),
                })?;
                if addrs.is_empty() {
                    return Err(RelayError::NoUsableAddress(self.host.clone()));
                }
                self.dns_cache.set(&self.host, addrs.clone());
                addrs
            }
        };

        let addr = addrs
            .pick(self.prefer_ipv6)
            .ok_or_else(|| RelayError::NoUsableAddress(self.host.clone()))?;

        self.set_state(RelayState::Connecting).await;
        debug!(target: "Relay", "[{}] dialing {} at {addr}", self.id, self.url);
        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            self.factory.create_transport(&self.url, addr),
        );
        let result = tokio::select! {
            r = attempt => r,
            _ = self.cancel.cancelled() => return Err(RelayError::Closed),
        };
        let (transport, events) = match result {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.forget_cached(&cached);
                return Err(RelayError::Transport(e.to_string()));
            }
            Err(_) => {
                self.forget_cached(&cached);
                return Err(RelayError::Timeout);
            }
        };

        self.discard_stale_commands();
        self.queue.clear();
        self.set_state(RelayState::Connected).await;
        info!(target: "Relay", "[{}] connected to {} ({addr})", self.id, self.host);
        Ok(Link {
            transport,
            events,
            cached,
        })
    }

    /// A failed attempt on cached addresses resolves afresh next time.
    fn forget_cached(&self, cached: &Option<ResolvedAddrs>) {
        if cached.is_some() {
            self.dns_cache.remove(&self.host);
        }
    }

    async fn serve(&mut self, mut link: Link) -> LinkEnd {
        let (ack_tx, mut ack_rx) = mpsc::channel::<Result<(), String>>(1);

        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break LinkEnd::Closed,
                cmd = self.commands.recv() => match cmd {
                    None => break LinkEnd::Closed,
                    Some(RelayCommand::Send { frame, name }) => {
                        self.enqueue(&link, &ack_tx, frame, name);
                    }
                    Some(RelayCommand::Join(frame)) => {
                        if *self.state.borrow() == RelayState::Connected {
                            self.set_state(RelayState::Joining).await;
                            self.enqueue(&link, &ack_tx, frame, "JOIN");
                        } else {
                            warn!(target: "Relay", "[{}] JOIN ignored, already joining", self.id);
                        }
                    }
                },
                Some(ack) = ack_rx.recv() => match ack {
                    Ok(()) => {
                        if let Some(next) = self.queue.on_sent() {
                            self.spawn_send(&link, &ack_tx, next);
                        }
                    }
                    Err(e) => break LinkEnd::Lost(RelayError::Transport(e)),
                },
                event = link.events.recv() => match event {
                    Some(TransportEvent::Connected) => {
                        trace!(target: "Relay", "[{}] transport reports connected", self.id);
                    }
                    Some(TransportEvent::FrameReceived(data)) => {
                        if !self.on_frame(&data).await {
                            break LinkEnd::Closed;
                        }
                    }
                    Some(TransportEvent::Disconnected) | None => {
                        break LinkEnd::Lost(RelayError::Transport("socket closed".into()));
                    }
                },
                Some((round, result)) = self.dns_rx.recv() => {
                    if self.on_fresh_addresses(round, result, link.cached.as_ref()) {
                        break LinkEnd::StaleAddress;
                    }
                }
            }
        };

        link.transport.disconnect().await;
        let dropped = self.queue.len();
        if dropped > 0 {
            warn!(target: "Relay", "[{}] dropping {dropped} queued frames", self.id);
        }
        self.queue.clear();
        end
    }

    fn enqueue(
        &mut self,
        link: &Link,
        ack_tx: &mpsc::Sender<Result<(), String>>,
        frame: Vec<u8>,
        name: &'static str,
    ) {
        debug!(target: "Relay", "[{}] --> {name}", self.id);
        match self.queue.push(frame) {
            Ok(Some(frame)) => self.spawn_send(link, ack_tx, frame),
            Ok(None) => trace!(
                target: "Relay",
                "[{}] {name} queued behind {} frames",
                self.id,
                self.queue.len()
            ),
            Err(e) => warn!(target: "Relay", "[{}] dropping {name}: {e}", self.id),
        }
    }

    fn spawn_send(&self, link: &Link, ack_tx: &mpsc::Sender<Result<(), String>>, frame: Vec<u8>) {
        let transport = link.transport.clone();
        let ack_tx = ack_tx.clone();
        tokio::spawn(async move {
            let result = transport.send(&frame).await.map_err(|e| e.to_string());
            let _ = ack_tx.send(result).await;
        });
    }

    /// Returns false once nobody listens for events anymore.
    async fn on_frame(&mut self, data: &[u8]) -> bool {
        let frame = match parse_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "Relay", "[{}] dropping inbound frame: {e}", self.id);
                return true;
            }
        };

        let state = *self.state.borrow();
        match (&frame, state) {
            (IncomingFrame::Error(err), _) => {
                warn!(target: "Relay", "[{}] relay error {}: {:?}", self.id, err.code, err.msg);
            }
            (IncomingFrame::Command(Command::Answer(_)), RelayState::Joining) => {
                self.set_state(RelayState::Joined).await;
            }
            (IncomingFrame::Command(cmd), RelayState::Joined)
                if !matches!(cmd, Command::Answer(_)) => {}
            (IncomingFrame::Command(cmd), state) => {
                warn!(
                    target: "Relay",
                    "[{}] unexpected {} while {state:?}, dropping",
                    self.id,
                    cmd.name()
                );
                return true;
            }
        }
        trace!(target: "Relay", "[{}] <-- {frame:?}", self.id);
        self.emit(RelayEventKind::Frame(frame)).await
    }

    /// Returns true if the live connection must be replaced.
    fn on_fresh_addresses(
        &self,
        round: u64,
        result: anyhow::Result<ResolvedAddrs>,
        cached: Option<&ResolvedAddrs>,
    ) -> bool {
        if round != self.dns_round {
            debug!(target: "Relay", "[{}] ignoring superseded resolution round {round}", self.id);
            return false;
        }
        let fresh = match result {
            Ok(fresh) if !fresh.is_empty() => fresh,
            Ok(_) => {
                debug!(target: "Relay", "[{}] background resolution returned nothing", self.id);
                return false;
            }
            Err(e) => {
                debug!(target: "Relay", "[{}] background resolution failed: {e}", self.id);
                return false;
            }
        };
        let Some(cached) = cached else {
            self.dns_cache.set(&self.host, fresh);
            return false;
        };
        if cached.same_set(&fresh) {
            return false;
        }
        info!(
            target: "Relay",
            "[{}] {} now resolves to {fresh:?}, reconnecting",
            self.id, self.host
        );
        self.dns_cache.set(&self.host, fresh);
        true
    }

    async fn wait_retry(&mut self, delay: std::time::Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.cancel.cancelled() => return false,
                _ = self.abort.cancelled() => {
                    self.fail(RelayError::Aborted).await;
                    return false;
                }
                cmd = self.commands.recv() => match cmd {
                    None => return false,
                    Some(cmd) => self.drop_command(&cmd),
                },
            }
        }
    }

    /// Commands accepted for a socket that is gone never reach its successor.
    fn discard_stale_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            self.drop_command(&cmd);
        }
    }

    fn drop_command(&self, cmd: &RelayCommand) {
        let name = match cmd {
            RelayCommand::Send { name, .. } => *name,
            RelayCommand::Join(_) => "JOIN",
        };
        warn!(target: "Relay", "[{}] dropping {name}: not connected", self.id);
    }

    async fn set_state(&self, state: RelayState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(target: "Relay", "[{}] {previous:?} -> {state:?}", self.id);
            self.emit(RelayEventKind::StateChanged(state)).await;
        }
    }

    async fn fail(&self, err: RelayError) {
        error!(target: "Relay", "[{}] giving up: {err}", self.id);
        self.emit(RelayEventKind::Failed(err)).await;
    }

    async fn emit(&self, kind: RelayEventKind) -> bool {
        self.events
            .send(RelayEvent {
                connection_id: self.id,
                kind,
            })
            .await
            .is_ok()
    }
}
