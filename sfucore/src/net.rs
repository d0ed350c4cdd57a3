//! Ports to the network collaborators: the message socket, DNS and HTTP.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The socket is open and frames may be sent.
    Connected,
    /// One complete frame from the relay.
    FrameReceived(Bytes),
    /// The connection was lost.
    Disconnected,
}

/// An open message socket. Knows nothing about relay commands.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one frame. Returns once the transport has accepted it.
    async fn send(&self, frame: &[u8]) -> Result<()>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Opens a socket to `url`, connecting to the already resolved `addr`.
    async fn create_transport(
        &self,
        url: &str,
        addr: IpAddr,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)>;
}

/// Result of resolving a relay host name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAddrs {
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
}

impl ResolvedAddrs {
    pub fn from_ips(ips: impl IntoIterator<Item = IpAddr>) -> Self {
        let mut out = Self::default();
        for ip in ips {
            match ip {
                IpAddr::V4(v4) => out.ipv4.push(v4),
                IpAddr::V6(v6) => out.ipv6.push(v6),
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_empty() && self.ipv6.is_empty()
    }

    /// Same addresses regardless of order or duplicates.
    pub fn same_set(&self, other: &Self) -> bool {
        fn norm<T: Ord + Clone>(v: &[T]) -> Vec<T> {
            let mut v = v.to_vec();
            v.sort();
            v.dedup();
            v
        }
        norm(&self.ipv4) == norm(&other.ipv4) && norm(&self.ipv6) == norm(&other.ipv6)
    }

    /// First address of the preferred family, falling back to the other one.
    pub fn pick(&self, prefer_ipv6: bool) -> Option<IpAddr> {
        let v4 = self.ipv4.first().map(|a| IpAddr::V4(*a));
        let v6 = self.ipv6.first().map(|a| IpAddr::V6(*a));
        if prefer_ipv6 { v6.or(v4) } else { v4.or(v6) }
    }
}

#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<ResolvedAddrs>;
}

/// A simple structure to represent an HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

pub struct HttpResponse {
    pub status_code: u16,
    pub body: Box<dyn Read + Send + Sync>,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status_code", &self.status_code)
            .field("body", &"<streaming reader>")
            .finish()
    }
}

impl HttpResponse {
    pub fn from_bytes(status_code: u16, body: Vec<u8>) -> Self {
        Self {
            status_code,
            body: Box::new(std::io::Cursor::new(body)),
        }
    }

    /// Reads the whole body into memory.
    pub fn body_into_vec(mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.body.read_to_end(&mut buffer)?;
        Ok(buffer)
    }
}

/// Trait for executing HTTP requests in a runtime-agnostic way
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}
