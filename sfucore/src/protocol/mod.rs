//! Relay command protocol.
//!
//! Every frame is a JSON object. Inbound commands carry their name in the
//! `a` field; relay errors carry `err` (and optionally `msg`) instead.
//!
//! - [`incoming`]: typed inbound commands and their validating parsers
//! - [`outgoing`]: client commands and their JSON encoding
//! - [`dispatch`]: routes a parsed frame to the matching [`SfuInterface`] method
//! - [`hex`]: fixed-width hex helpers for 64-bit values

pub mod dispatch;
mod error;
pub mod hex;
pub mod incoming;
pub mod outgoing;

pub use dispatch::{SfuInterface, dispatch, dispatch_raw};
pub use error::ProtocolError;
pub use incoming::{
    Answer, CidTrack, Command, IncomingFrame, PeerInfo, RelayErrorFrame, encode_key, parse_frame,
};
pub use outgoing::{OutgoingCommand, SendIvs};

/// JSON field holding the command name.
pub const COMMAND_FIELD: &str = "a";
/// JSON field holding a relay error code.
pub const ERROR_FIELD: &str = "err";
