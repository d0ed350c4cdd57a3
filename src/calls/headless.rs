//! A media engine that negotiates like a real one but moves no media.
//!
//! Used by the command line client and by tests: it hands out transceivers
//! with sequential mids, writes a plausible offer (one video ssrc with an
//! `FID` retransmission ssrc per video sender) and records what the call
//! does to each track.

use async_trait::async_trait;
use parking_lot::Mutex;
use sfucore::types::{Cid, Direction, TrackKind};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::media::{FrameCrypto, MediaEngine, MediaTrack};

const FIRST_SSRC: u64 = 1000;

pub struct HeadlessTrack {
    mid: u32,
    kind: TrackKind,
    direction: Direction,
    enabled: AtomicBool,
    crypto: Mutex<Option<FrameCrypto>>,
    sink: Mutex<Option<Cid>>,
}

impl HeadlessTrack {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn crypto(&self) -> Option<FrameCrypto> {
        self.crypto.lock().clone()
    }

    /// Participant whose media this track is rendering.
    pub fn sink(&self) -> Option<Cid> {
        *self.sink.lock()
    }
}

impl MediaTrack for HeadlessTrack {
    fn mid(&self) -> Option<u32> {
        Some(self.mid)
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_frame_crypto(&self, crypto: Option<FrameCrypto>) {
        *self.crypto.lock() = crypto;
    }

    fn attach_sink(&self, cid: Cid) {
        *self.sink.lock() = Some(cid);
    }

    fn detach_sink(&self) {
        *self.sink.lock() = None;
    }
}

#[derive(Default)]
pub struct HeadlessMediaEngine {
    tracks: Mutex<Vec<Arc<HeadlessTrack>>>,
    remote: Mutex<Option<String>>,
    closes: AtomicUsize,
}

impl HeadlessMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, mid: u32) -> Option<Arc<HeadlessTrack>> {
        self.tracks.lock().get(mid as usize).cloned()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn remote_description(&self) -> Option<String> {
        self.remote.lock().clone()
    }

    /// How many times the call has torn its media down.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Relaxed)
    }

    fn offer(tracks: &[Arc<HeadlessTrack>]) -> String {
        let mut sdp = String::from("v=0\r\no=- 0 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
        let mids: Vec<String> = tracks.iter().map(|t| t.mid.to_string()).collect();
        let _ = write!(sdp, "a=group:BUNDLE {}\r\n", mids.join(" "));

        let mut ssrc = FIRST_SSRC;
        for track in tracks {
            let (media, codec) = match track.kind {
                TrackKind::Audio => ("audio", "a=rtpmap:111 opus/48000/2"),
                TrackKind::Video => ("video", "a=rtpmap:96 VP8/90000"),
            };
            let pt = if track.kind == TrackKind::Audio { 111 } else { 96 };
            let _ = write!(
                sdp,
                "m={media} 9 UDP/TLS/RTP/SAVPF {pt}\r\nc=IN IP4 0.0.0.0\r\n{codec}\r\n"
            );
            let _ = write!(sdp, "a=mid:{}\r\na={}\r\n", track.mid, track.direction.as_str());
            if track.direction == Direction::RecvOnly {
                continue;
            }
            let _ = write!(sdp, "a=msid:local track{}\r\n", track.mid);
            match track.kind {
                TrackKind::Audio => {
                    let _ = write!(sdp, "a=ssrc:{ssrc} cname:headless\r\n");
                    ssrc += 1;
                }
                TrackKind::Video => {
                    let rtx = ssrc + 500;
                    let _ = write!(
                        sdp,
                        "a=ssrc-group:FID {ssrc} {rtx}\r\na=ssrc:{ssrc} cname:headless\r\na=ssrc:{rtx} cname:headless\r\n"
                    );
                    ssrc += 10;
                }
            }
        }
        sdp
    }
}

#[async_trait]
impl MediaEngine for HeadlessMediaEngine {
    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: Direction,
    ) -> anyhow::Result<Arc<dyn MediaTrack>> {
        let mut tracks = self.tracks.lock();
        let track = Arc::new(HeadlessTrack {
            mid: tracks.len() as u32,
            kind,
            direction,
            enabled: AtomicBool::new(false),
            crypto: Mutex::new(None),
            sink: Mutex::new(None),
        });
        tracks.push(track.clone());
        Ok(track)
    }

    async fn create_offer(&self) -> anyhow::Result<String> {
        let tracks = self.tracks.lock();
        if tracks.is_empty() {
            anyhow::bail!("no transceivers");
        }
        Ok(Self::offer(&tracks))
    }

    async fn set_remote_description(&self, sdp: &str) -> anyhow::Result<()> {
        *self.remote.lock() = Some(sdp.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
        for track in self.tracks.lock().drain(..) {
            track.set_enabled(false);
            track.set_frame_crypto(None);
            track.detach_sink();
        }
        self.remote.lock().take();
    }
}
