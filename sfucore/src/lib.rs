//! Platform-agnostic core of the SFU call client.
//!
//! Nothing in here performs I/O. The runtime crate drives these types over a
//! real relay connection and a media engine.

pub mod crypto;
pub mod net;
pub mod protocol;
pub mod sdp;
pub mod types;
