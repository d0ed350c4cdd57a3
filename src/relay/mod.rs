//! Reconnecting connection to the media relay.
//!
//! A [`connection::RelayConnection`] actor owns the socket, resolves the relay
//! host through the shared [`DnsCache`], sends queued command frames one at a
//! time and reports everything that happens as [`RelayEvent`]s tagged with
//! the connection id, so the owner can ignore events from a connection it has
//! already replaced.

pub mod backoff;
pub mod connection;
pub mod dns_cache;
mod error;
pub mod queue;

use async_trait::async_trait;
use sfucore::protocol::{IncomingFrame, OutgoingCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use backoff::{Backoff, RetryPolicy};
pub use connection::{RelayHandle, TransportRelayConnector};
pub use dns_cache::DnsCache;
pub use error::RelayError;
pub use queue::CommandsQueue;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub retry: RetryPolicy,
    /// Applies to opening the socket, not to DNS.
    pub connect_timeout: Duration,
    /// Frames that may wait behind the one in flight.
    pub queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelayState {
    New,
    Resolving,
    Connecting,
    Connected,
    Joining,
    Joined,
    Disconnected,
}

impl RelayState {
    /// A socket is open and frames can be queued.
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Connected | Self::Joining | Self::Joined)
    }
}

#[derive(Debug, Clone)]
pub enum RelayEventKind {
    StateChanged(RelayState),
    Frame(IncomingFrame),
    /// No further attempts will be made.
    Failed(RelayError),
    /// The connection task has exited.
    Closed,
}

#[derive(Debug, Clone)]
pub struct RelayEvent {
    pub connection_id: u64,
    pub kind: RelayEventKind,
}

/// The owner's side of a relay connection.
#[async_trait]
pub trait RelaySink: Send + Sync {
    fn connection_id(&self) -> u64;

    fn state(&self) -> RelayState;

    /// Queues a command. Requires an open socket.
    ///
    /// Delivery is best effort: frames still queued when the socket drops are
    /// discarded, not replayed on the next socket.
    async fn send(&self, cmd: OutgoingCommand) -> Result<(), RelayError>;

    /// Queues `JOIN` and moves the connection to `Joining`. Only an `ANSWER`
    /// moves it on to `Joined`.
    async fn join(&self, cmd: OutgoingCommand) -> Result<(), RelayError>;

    /// Stops any pending reconnect. The current socket, if any, stays up.
    fn abort_retries(&self);

    /// Closes the socket and stops reconnecting.
    async fn disconnect(&self);
}

/// Creates relay connections for calls.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        events: mpsc::Sender<RelayEvent>,
    ) -> Result<Arc<dyn RelaySink>, RelayError>;
}
