//! Bindings between media engine tracks and participant key contexts.

use log::{debug, warn};
use sfucore::crypto::{FrameDecryptor, FrameEncryptor, KeySource};
use sfucore::protocol::SendIvs;
use sfucore::types::{Cid, InitVector, TrackKind};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::media::{FrameCrypto, MediaTrack};

/// A media track plus the participant and IV it currently carries.
pub struct Slot {
    track: Arc<dyn MediaTrack>,
    cid: Option<Cid>,
    iv: Option<InitVector>,
}

impl Slot {
    pub fn new(track: Arc<dyn MediaTrack>) -> Self {
        Self {
            track,
            cid: None,
            iv: None,
        }
    }

    pub fn mid(&self) -> Option<u32> {
        self.track.mid()
    }

    pub fn kind(&self) -> TrackKind {
        self.track.kind()
    }

    pub fn cid(&self) -> Option<Cid> {
        self.cid
    }

    pub fn iv(&self) -> Option<InitVector> {
        self.iv
    }

    pub fn is_enabled(&self) -> bool {
        self.track.is_enabled()
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.track.is_enabled() != enabled {
            self.track.set_enabled(enabled);
        }
    }

    /// Installs the encryptor of a local send slot.
    pub fn bind_local(&mut self, iv: InitVector, keys: Arc<dyn KeySource>) {
        self.iv = Some(iv);
        self.track
            .set_frame_crypto(Some(FrameCrypto::Encrypt(Arc::new(FrameEncryptor::new(
                iv, keys,
            )))));
    }

    /// Binds the slot to `cid`. The previous decryptor is dropped before a
    /// new one is built, even when only the IV changes.
    pub fn assign(&mut self, cid: Cid, iv: InitVector, keys: Arc<dyn KeySource>) {
        self.track.set_frame_crypto(None);
        self.track
            .set_frame_crypto(Some(FrameCrypto::Decrypt(Arc::new(FrameDecryptor::new(
                iv, keys,
            )))));
        if self.cid != Some(cid) {
            if self.cid.is_some() {
                self.track.detach_sink();
            }
            self.track.attach_sink(cid);
        }
        self.cid = Some(cid);
        self.iv = Some(iv);
        self.set_enabled(true);
    }

    /// Unbinds the slot. The track stays allocated for later reuse.
    pub fn release(&mut self) {
        if self.cid.take().is_none() {
            return;
        }
        self.iv = None;
        self.track.set_frame_crypto(None);
        self.track.detach_sink();
        self.set_enabled(false);
    }
}

/// Our three send tracks.
pub struct LocalSlots {
    pub vthumb: Slot,
    pub hires: Slot,
    pub audio: Slot,
}

impl LocalSlots {
    pub fn new(
        vthumb: Arc<dyn MediaTrack>,
        hires: Arc<dyn MediaTrack>,
        audio: Arc<dyn MediaTrack>,
    ) -> Self {
        Self {
            vthumb: Slot::new(vthumb),
            hires: Slot::new(hires),
            audio: Slot::new(audio),
        }
    }

    pub fn bind(&mut self, ivs: &SendIvs, keys: Arc<dyn KeySource>) {
        self.vthumb.bind_local(ivs.vthumb, keys.clone());
        self.hires.bind_local(ivs.hires, keys.clone());
        self.audio.bind_local(ivs.audio, keys);
    }
}

/// Owns every slot of a call. Sessions refer to receive slots by mid.
pub struct SlotManager {
    local: LocalSlots,
    recv: BTreeMap<u32, Slot>,
}

impl SlotManager {
    pub fn new(local: LocalSlots, recv_tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        let mut recv = BTreeMap::new();
        for track in recv_tracks {
            match track.mid() {
                Some(mid) => {
                    recv.insert(mid, Slot::new(track));
                }
                None => warn!(target: "Call/Slots", "receive track without mid, ignoring"),
            }
        }
        Self { local, recv }
    }

    pub fn local(&self) -> &LocalSlots {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut LocalSlots {
        &mut self.local
    }

    pub fn recv(&self, mid: u32) -> Option<&Slot> {
        self.recv.get(&mid)
    }

    /// Binds receive slot `mid` to `cid`. Returns the participant the slot
    /// was bound to before, or `None` if the mid is unknown.
    pub fn assign(
        &mut self,
        mid: u32,
        cid: Cid,
        iv: InitVector,
        keys: Arc<dyn KeySource>,
    ) -> Option<Option<Cid>> {
        let slot = self.recv.get_mut(&mid)?;
        let previous = slot.cid();
        debug!(target: "Call/Slots", "mid {mid}: {previous:?} -> {cid} (iv {iv})");
        slot.assign(cid, iv, keys);
        Some(previous)
    }

    pub fn release(&mut self, mid: u32) {
        if let Some(slot) = self.recv.get_mut(&mid) {
            debug!(target: "Call/Slots", "mid {mid}: released from {:?}", slot.cid());
            slot.release();
        }
    }

    pub fn release_all(&mut self) {
        for slot in self.recv.values_mut() {
            slot.release();
        }
    }

    pub fn recv_count(&self) -> usize {
        self.recv.len()
    }

    pub fn free_count(&self, kind: TrackKind) -> usize {
        self.recv
            .values()
            .filter(|s| s.kind() == kind && s.cid().is_none())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::session::KeyRing;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct TrackLog {
        enabled: bool,
        crypto: Vec<Option<String>>,
        sinks: Vec<Option<Cid>>,
    }

    struct FakeTrack {
        mid: Option<u32>,
        kind: TrackKind,
        log: Mutex<TrackLog>,
    }

    impl FakeTrack {
        fn new(mid: u32, kind: TrackKind) -> Arc<Self> {
            Arc::new(Self {
                mid: Some(mid),
                kind,
                log: Mutex::new(TrackLog::default()),
            })
        }
    }

    impl MediaTrack for FakeTrack {
        fn mid(&self) -> Option<u32> {
            self.mid
        }
        fn kind(&self) -> TrackKind {
            self.kind
        }
        fn set_enabled(&self, enabled: bool) {
            self.log.lock().enabled = enabled;
        }
        fn is_enabled(&self) -> bool {
            self.log.lock().enabled
        }
        fn set_frame_crypto(&self, crypto: Option<FrameCrypto>) {
            self.log.lock().crypto.push(crypto.map(|c| format!("{c:?}")));
        }
        fn attach_sink(&self, cid: Cid) {
            self.log.lock().sinks.push(Some(cid));
        }
        fn detach_sink(&self) {
            self.log.lock().sinks.push(None);
        }
    }

    fn keys() -> Arc<dyn KeySource> {
        Arc::new(KeyRing::new(4))
    }

    #[test]
    fn test_reassign_rebuilds_decryptor() {
        let track = FakeTrack::new(4, TrackKind::Video);
        let mut slot = Slot::new(track.clone());

        slot.assign(1, InitVector(10), keys());
        slot.assign(1, InitVector(11), keys());
        slot.assign(2, InitVector(12), keys());

        let log = track.log.lock();
        assert_eq!(
            log.crypto,
            vec![
                None,
                Some("Decrypt(iv=000000000000000a)".to_string()),
                None,
                Some("Decrypt(iv=000000000000000b)".to_string()),
                None,
                Some("Decrypt(iv=000000000000000c)".to_string()),
            ]
        );
        assert_eq!(log.sinks, vec![Some(1), None, Some(2)]);
        assert!(log.enabled);
    }

    #[test]
    fn test_release_detaches_and_disables() {
        let track = FakeTrack::new(4, TrackKind::Audio);
        let mut slot = Slot::new(track.clone());
        slot.assign(3, InitVector(1), keys());
        slot.release();
        slot.release();

        assert_eq!(slot.cid(), None);
        assert_eq!(slot.iv(), None);
        let log = track.log.lock();
        assert!(!log.enabled);
        assert_eq!(log.sinks, vec![Some(3), None]);
        assert_eq!(log.crypto.last(), Some(&None));
    }

    #[test]
    fn test_manager_tracks_previous_owner() {
        let local = LocalSlots::new(
            FakeTrack::new(0, TrackKind::Video),
            FakeTrack::new(1, TrackKind::Video),
            FakeTrack::new(2, TrackKind::Audio),
        );
        let recv: Vec<Arc<dyn MediaTrack>> = vec![
            FakeTrack::new(3, TrackKind::Video),
            FakeTrack::new(4, TrackKind::Audio),
        ];
        let mut slots = SlotManager::new(local, recv);
        assert_eq!(slots.recv_count(), 2);
        assert_eq!(slots.free_count(TrackKind::Video), 1);

        assert_eq!(slots.assign(3, 7, InitVector(1), keys()), Some(None));
        assert_eq!(slots.assign(3, 8, InitVector(2), keys()), Some(Some(7)));
        assert_eq!(slots.assign(9, 8, InitVector(2), keys()), None);
        assert_eq!(slots.free_count(TrackKind::Video), 0);

        slots.release_all();
        assert_eq!(slots.free_count(TrackKind::Video), 1);
    }
}
