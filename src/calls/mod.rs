//! Group calls through a selective forwarding relay.
//!
//! A [`Call`] tracks who is in the call, which receive slot carries whose
//! media and which keys decrypt it. Relay commands reach it through
//! [`sfucore::protocol::SfuInterface`]; applications drive it through a
//! [`CallHandle`] obtained from the [`CallManager`].

mod call;
pub mod error;
mod handler;
pub mod headless;
pub mod initiator;
pub mod keys;
pub mod manager;
pub mod media;
pub mod observer;
pub mod session;
pub mod slot;
pub mod state;

pub use call::{Call, CallConfig, CallDeps, CallSnapshot};
pub use error::CallError;
pub use headless::{HeadlessMediaEngine, HeadlessTrack};
pub use initiator::{RestSessionInitiator, SessionInitiator, StaticSessionInitiator};
pub use keys::{InMemoryKeyCache, KeyCache, MediaKeyCrypto};
pub use manager::{CallHandle, CallManager, CallRequest, CallServices};
pub use media::{FrameCrypto, MediaEngine, MediaTrack};
pub use observer::{CallObserver, NoopObserver};
pub use session::{KeyRing, Peer, Session, SessionInfo, SlotRole};
pub use slot::{LocalSlots, Slot, SlotManager};
pub use state::{CallState, InvalidTransition};
