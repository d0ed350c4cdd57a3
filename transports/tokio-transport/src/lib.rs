//! Tokio WebSocket transport and DNS resolver for the relay connection.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use sfucore::net::{DnsResolver, ResolvedAddrs, Transport, TransportEvent, TransportFactory};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, client_async_tls};
use url::Url;

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_QUEUE: usize = 100;

pub struct TokioWebSocketTransport {
    ws_sink: Mutex<Option<WsSink>>,
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send(&self, frame: &[u8]) -> anyhow::Result<()> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        // Relay commands are JSON, sent as text frames.
        let msg = match std::str::from_utf8(frame) {
            Ok(text) => Message::text(text),
            Err(_) => Message::binary(frame.to_vec()),
        };
        debug!(target: "Transport", "--> {} bytes", frame.len());
        sink.send(msg)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {e}"))?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }
}

/// Opens relay sockets against an already resolved address, keeping the
/// host of the url for TLS and the `Host` header.
#[derive(Debug, Default, Clone)]
pub struct TokioWebSocketTransportFactory;

impl TokioWebSocketTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

fn target_addr(url: &str, addr: IpAddr) -> anyhow::Result<SocketAddr> {
    let parsed = Url::parse(url).map_err(|e| anyhow::anyhow!("Failed to parse URL: {e}"))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| anyhow::anyhow!("No port for {url}"))?;
    Ok(SocketAddr::new(addr, port))
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
        url: &str,
        addr: IpAddr,
    ) -> anyhow::Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
        let target = target_addr(url, addr)?;
        info!(target: "Transport", "Dialing {url} at {target}");

        let tcp = TcpStream::connect(target)
            .await
            .map_err(|e| anyhow::anyhow!("TCP connect to {target} failed: {e}"))?;
        let (client, _response) = client_async_tls(url, tcp)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {e}"))?;
        let (sink, stream) = client.split();

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let transport = Arc::new(TokioWebSocketTransport {
            ws_sink: Mutex::new(Some(sink)),
        });
        tokio::spawn(read_pump(stream, event_tx.clone()));
        let _ = event_tx.send(TransportEvent::Connected).await;

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        let data = match stream.next().await {
            Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_bytes()),
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) => {
                trace!(target: "Transport", "Received close frame");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!(target: "Transport", "Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!(target: "Transport", "Websocket stream ended");
                break;
            }
        };
        debug!(target: "Transport", "<-- {} bytes", data.len());
        if event_tx
            .send(TransportEvent::FrameReceived(data))
            .await
            .is_err()
        {
            warn!(target: "Transport", "Event receiver dropped, closing read pump");
            break;
        }
    }
    let _ = event_tx.send(TransportEvent::Disconnected).await;
}

/// Resolves host names with the system resolver.
#[derive(Debug, Default, Clone)]
pub struct TokioDnsResolver;

impl TokioDnsResolver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DnsResolver for TokioDnsResolver {
    async fn resolve(&self, host: &str) -> anyhow::Result<ResolvedAddrs> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(ResolvedAddrs::from_ips(addrs.map(|a| a.ip())))
    }
}
