//! Participants of a call and their media keys.

use parking_lot::RwLock;
use serde::Serialize;
use sfucore::crypto::{KeySource, MediaKey};
use sfucore::types::{AvFlags, Cid, KeyId, UserId};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug)]
struct KeyRingInner {
    keys: BTreeMap<KeyId, MediaKey>,
    current: Option<KeyId>,
}

/// Media keys of one sender, indexed by id.
///
/// Older keys stay available so frames encrypted just before a rotation can
/// still be decrypted. At most `max_keys` are retained; the lowest id goes
/// first.
#[derive(Debug)]
pub struct KeyRing {
    inner: RwLock<KeyRingInner>,
    max_keys: usize,
}

impl KeyRing {
    pub fn new(max_keys: usize) -> Self {
        Self {
            inner: RwLock::new(KeyRingInner {
                keys: BTreeMap::new(),
                current: None,
            }),
            max_keys: max_keys.max(1),
        }
    }

    /// Stores a key. The current id only moves forward; a late older key is
    /// kept for decryption without becoming current.
    pub fn insert(&self, id: KeyId, key: MediaKey) {
        let mut inner = self.inner.write();
        inner.keys.insert(id, key);
        if inner.current.is_none_or(|current| id > current) {
            inner.current = Some(id);
        }
        while inner.keys.len() > self.max_keys {
            inner.keys.pop_first();
        }
    }

    pub fn current_id(&self) -> Option<KeyId> {
        self.inner.read().current
    }

    /// Id the next locally generated key should get.
    pub fn next_id(&self) -> KeyId {
        self.inner.read().current.map_or(0, |id| id.wrapping_add(1))
    }

    pub fn get(&self, id: KeyId) -> Option<MediaKey> {
        self.inner.read().keys.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().keys.is_empty()
    }

    /// Forgets every key older than `id`.
    pub fn purge_before(&self, id: KeyId) {
        self.inner.write().keys.retain(|k, _| *k >= id);
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.keys.clear();
        inner.current = None;
    }
}

impl KeySource for KeyRing {
    fn media_key(&self, id: KeyId) -> Option<MediaKey> {
        self.get(id)
    }

    fn current_key(&self) -> Option<(KeyId, MediaKey)> {
        let inner = self.inner.read();
        let id = inner.current?;
        inner.keys.get(&id).map(|k| (id, *k))
    }
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub cid: Cid,
    pub user_id: UserId,
    pub av: AvFlags,
    pub keys: Arc<KeyRing>,
}

impl Peer {
    pub fn new(cid: Cid, user_id: UserId, av: AvFlags, max_keys: usize) -> Self {
        Self {
            cid,
            user_id,
            av,
            keys: Arc::new(KeyRing::new(max_keys)),
        }
    }
}

/// Which receive slot of a session a track is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotRole {
    Audio,
    Vthumb,
    Hires,
}

/// One remote participant as seen by the call. Slots are referenced by mid.
#[derive(Debug)]
pub struct Session {
    pub peer: Peer,
    pub audio_slot: Option<u32>,
    pub vthumb_slot: Option<u32>,
    pub hires_slot: Option<u32>,
    pub speak_requested: bool,
}

impl Session {
    pub fn new(peer: Peer) -> Self {
        Self {
            peer,
            audio_slot: None,
            vthumb_slot: None,
            hires_slot: None,
            speak_requested: false,
        }
    }

    pub fn cid(&self) -> Cid {
        self.peer.cid
    }

    pub fn slot(&self, role: SlotRole) -> Option<u32> {
        match role {
            SlotRole::Audio => self.audio_slot,
            SlotRole::Vthumb => self.vthumb_slot,
            SlotRole::Hires => self.hires_slot,
        }
    }

    pub fn set_slot(&mut self, role: SlotRole, mid: Option<u32>) {
        match role {
            SlotRole::Audio => self.audio_slot = mid,
            SlotRole::Vthumb => self.vthumb_slot = mid,
            SlotRole::Hires => self.hires_slot = mid,
        }
    }

    /// Drops every reference to `mid`. Returns the roles it held.
    pub fn forget_mid(&mut self, mid: u32) -> Vec<SlotRole> {
        let mut roles = Vec::new();
        for role in [SlotRole::Audio, SlotRole::Vthumb, SlotRole::Hires] {
            if self.slot(role) == Some(mid) {
                self.set_slot(role, None);
                roles.push(role);
            }
        }
        roles
    }

    /// All slot mids this session holds.
    pub fn mids(&self) -> Vec<u32> {
        [self.audio_slot, self.vthumb_slot, self.hires_slot]
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            cid: self.peer.cid,
            user_id: self.peer.user_id.clone(),
            av: self.peer.av,
            speak_requested: self.speak_requested,
            audio_slot: self.audio_slot,
            vthumb_slot: self.vthumb_slot,
            hires_slot: self.hires_slot,
            key_id: self.peer.keys.current_id(),
        }
    }
}

/// Read-only view of a [`Session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub cid: Cid,
    pub user_id: UserId,
    pub av: AvFlags,
    pub speak_requested: bool,
    pub audio_slot: Option<u32>,
    pub vthumb_slot: Option<u32>,
    pub hires_slot: Option<u32>,
    pub key_id: Option<KeyId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_id_only_moves_forward() {
        let ring = KeyRing::new(4);
        assert_eq!(ring.next_id(), 0);
        ring.insert(3, [3; 16]);
        ring.insert(1, [1; 16]);
        assert_eq!(ring.current_id(), Some(3));
        assert_eq!(ring.current_key(), Some((3, [3; 16])));
        assert_eq!(ring.media_key(1), Some([1; 16]));
        assert_eq!(ring.next_id(), 4);
    }

    #[test]
    fn test_lowest_ids_are_evicted_first() {
        let ring = KeyRing::new(2);
        ring.insert(0, [0; 16]);
        ring.insert(1, [1; 16]);
        ring.insert(2, [2; 16]);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.get(0), None);
        assert_eq!(ring.get(1), Some([1; 16]));
        assert_eq!(ring.current_id(), Some(2));
    }

    #[test]
    fn test_purge() {
        let ring = KeyRing::new(8);
        for id in 0..4 {
            ring.insert(id, [id as u8; 16]);
        }
        ring.purge_before(3);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.current_key(), Some((3, [3; 16])));
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.current_key(), None);
    }

    #[test]
    fn test_forget_mid_clears_every_role() {
        let mut session = Session::new(Peer::new(1, UserId::from("U1"), AvFlags::EMPTY, 4));
        session.vthumb_slot = Some(5);
        session.hires_slot = Some(5);
        session.audio_slot = Some(6);
        assert_eq!(session.forget_mid(5), vec![SlotRole::Vthumb, SlotRole::Hires]);
        assert_eq!(session.mids(), vec![6]);
    }
}
