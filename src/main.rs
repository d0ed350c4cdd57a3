use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use sfu_rust::calls::{
    CallError, CallManager, CallObserver, CallServices, CallState, HeadlessMediaEngine,
    InMemoryKeyCache, MediaKeyCrypto, RestSessionInitiator, SessionInitiator,
    StaticSessionInitiator,
};
use sfu_rust::crypto::generate_identity;
use sfu_rust::relay::{DnsCache, TransportRelayConnector};
use sfu_rust::types::{AvFlags, CallId, ChatId, Cid, SpeakerState, TermCode, UserId};
use sfu_rust::CallConfig;
use sfu_tokio_transport::{TokioDnsResolver, TokioWebSocketTransportFactory};
use sfu_ureq_http_client::UreqHttpClient;
use std::sync::Arc;

// Joins a call without capturing or rendering media, logging everything the
// relay tells us.
//
// Usage:
//   cargo run -- --chat-id c1 --call-id k1 --relay-url wss://relay.example.com/ws
//   cargo run -- --chat-id c1 --call-id k1 --initiator https://api.example.com/call/join
//   cargo run -- ... --peer-key alice=<hex public key> --audio --video

#[derive(Parser, Debug)]
#[command(about = "Signalling-only group call client")]
struct Args {
    #[arg(long)]
    chat_id: String,
    #[arg(long)]
    call_id: String,
    #[arg(long, default_value = "me")]
    user: String,
    /// Relay url to use directly.
    #[arg(long, conflicts_with = "initiator")]
    relay_url: Option<String>,
    /// HTTP endpoint that hands out relay urls.
    #[arg(long)]
    initiator: Option<String>,
    /// Public key of another participant, as `user=hex`.
    #[arg(long = "peer-key")]
    peer_keys: Vec<String>,
    #[arg(long)]
    audio: bool,
    #[arg(long)]
    video: bool,
}

struct LoggingObserver;

impl CallObserver for LoggingObserver {
    fn on_state_changed(&self, call_id: &CallId, state: CallState) {
        info!("[{call_id}] state {state:?}");
    }

    fn on_session_added(&self, call_id: &CallId, cid: Cid, user: &UserId) {
        info!("[{call_id}] {user} joined as cid {cid}");
    }

    fn on_session_removed(&self, call_id: &CallId, cid: Cid) {
        info!("[{call_id}] cid {cid} left");
    }

    fn on_speaker_state(&self, call_id: &CallId, state: SpeakerState) {
        info!("[{call_id}] speaker state {state:?}");
    }

    fn on_error(&self, call_id: &CallId, error: &CallError) {
        warn!("[{call_id}] {error}");
    }

    fn on_terminated(&self, call_id: &CallId, code: TermCode) {
        info!("[{call_id}] terminated: {code:?}");
    }
}

fn parse_peer_key(arg: &str) -> anyhow::Result<(UserId, Vec<u8>)> {
    let (user, key) = arg
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected user=hex, got {arg}"))?;
    Ok((UserId::from(user), hex::decode(key)?))
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            return;
        }
    };

    if let Err(e) = rt.block_on(run(args)) {
        error!("{e:#}");
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let initiator: Arc<dyn SessionInitiator> = match (&args.relay_url, &args.initiator) {
        (Some(url), _) => Arc::new(StaticSessionInitiator::new(url.clone())),
        (None, Some(endpoint)) => Arc::new(RestSessionInitiator::new(
            Arc::new(UreqHttpClient::new()),
            endpoint.clone(),
        )),
        (None, None) => anyhow::bail!("either --relay-url or --initiator is required"),
    };

    let key_cache = Arc::new(InMemoryKeyCache::new());
    for arg in &args.peer_keys {
        let (user, key) = parse_peer_key(arg)?;
        key_cache.insert(user, key);
    }
    let keys = Arc::new(MediaKeyCrypto::new(generate_identity(), key_cache));
    info!("our public key: {}", hex::encode(keys.public_key()));

    let config = CallConfig::default();
    let connector = Arc::new(TransportRelayConnector::new(
        Arc::new(TokioWebSocketTransportFactory::new()),
        Arc::new(TokioDnsResolver::new()),
        Arc::new(DnsCache::new()),
        config.relay.clone(),
    ));
    let manager = CallManager::new(
        UserId::from(args.user.as_str()),
        config,
        CallServices {
            initiator,
            connector,
            keys,
            observer: Arc::new(LoggingObserver),
        },
    );

    let call = manager
        .create_call(
            ChatId::from(args.chat_id.as_str()),
            CallId::from(args.call_id.as_str()),
            Arc::new(HeadlessMediaEngine::new()),
            None,
        )
        .await;
    call.join(AvFlags::new(args.audio, args.video)).await?;

    tokio::signal::ctrl_c().await?;
    info!("hanging up");
    if let Err(e) = call.hangup().await {
        warn!("hangup: {e}");
    }
    manager.shutdown().await;
    Ok(())
}
