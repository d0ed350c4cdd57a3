use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("failed to resolve {host}: {reason}")]
    Dns { host: String, reason: String },
    #[error("no usable address for {0}")]
    NoUsableAddress(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection attempt timed out")]
    Timeout,
    #[error("not connected to the relay")]
    NotConnected,
    #[error("join already sent on this connection")]
    AlreadyJoining,
    #[error("outbound queue is full ({0} frames)")]
    QueueFull(usize),
    #[error("gave up after {0} attempts")]
    RetriesExhausted(u32),
    #[error("reconnection aborted")]
    Aborted,
    #[error("connection closed")]
    Closed,
}
