//! Port to the media engine that owns codecs, capture and rendering.

use async_trait::async_trait;
use sfucore::crypto::{FrameDecryptor, FrameEncryptor};
use sfucore::types::{Cid, Direction, TrackKind};
use std::sync::Arc;

/// Encryption context installed on a track.
#[derive(Clone)]
pub enum FrameCrypto {
    Encrypt(Arc<FrameEncryptor>),
    Decrypt(Arc<FrameDecryptor>),
}

impl std::fmt::Debug for FrameCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encrypt(e) => write!(f, "Encrypt(iv={})", e.iv()),
            Self::Decrypt(d) => write!(f, "Decrypt(iv={})", d.iv()),
        }
    }
}

/// One transceiver of the media engine.
pub trait MediaTrack: Send + Sync {
    /// Transport mid, known once an offer has been created.
    fn mid(&self) -> Option<u32>;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn set_frame_crypto(&self, crypto: Option<FrameCrypto>);
    /// Routes decoded media of this track to the renderer of `cid`.
    fn attach_sink(&self, cid: Cid);
    fn detach_sink(&self);
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: Direction,
    ) -> anyhow::Result<Arc<dyn MediaTrack>>;

    /// Creates and applies the local offer.
    async fn create_offer(&self) -> anyhow::Result<String>;

    async fn set_remote_description(&self, sdp: &str) -> anyhow::Result<()>;

    /// Drops every transceiver.
    async fn close(&self);
}
