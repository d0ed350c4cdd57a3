//! Client for group calls through a selective forwarding relay.
//!
//! [`relay`] keeps the signalling connection alive and [`calls`] runs the
//! call state machine on top of it. The wire formats, SDP compression and
//! media key handling live in the `sfucore` crate.

pub use sfucore::{crypto, net, protocol, sdp, types};

pub mod calls;
pub mod relay;

pub use calls::{CallConfig, CallError, CallHandle, CallManager, CallObserver, CallServices, CallState};
pub use relay::{RelayConfig, RelayError, RetryPolicy};
