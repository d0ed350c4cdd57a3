//! Call-related error types.

use sfucore::crypto::CryptoError;
use sfucore::protocol::ProtocolError;
use sfucore::sdp::SdpError;
use sfucore::types::UserId;
use thiserror::Error;

use super::state::{CallState, InvalidTransition};
use crate::relay::RelayError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("{op} is not allowed while {state:?}")]
    StateViolation { op: &'static str, state: CallState },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("access denied: {0}")]
    AccessDenied(&'static str),

    #[error("public key unavailable for {0}")]
    KeyUnavailable(UserId),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("relay error {code}: {msg}")]
    Relay { code: i32, msg: String },

    #[error("relay connection: {0}")]
    Connection(#[from] RelayError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("sdp error: {0}")]
    Sdp(#[from] SdpError),

    #[error("media engine: {0}")]
    Media(String),

    #[error("session initiator: {0}")]
    Initiator(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("call is closed")]
    Closed,
}
