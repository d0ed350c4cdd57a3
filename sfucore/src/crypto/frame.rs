//! Per-slot media frame encryption.
//!
//! Frame layout: `key_id (4, BE) | counter (4, BE) | ciphertext | tag (16)`.
//! The first eight bytes are authenticated as associated data. The nonce is
//! the slot's 64-bit IV followed by the counter, so a slot must never reuse a
//! counter value under one key. The counter restarts with every newer key and
//! encryption stops once it would wrap.

use aes_gcm::Aes128Gcm;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use parking_lot::Mutex;
use std::sync::Arc;

use super::media_key::MediaKey;
use super::{CryptoError, Result};
use crate::types::{InitVector, KeyId};

pub const HEADER_LEN: usize = 8;
pub const TAG_LEN: usize = 16;

/// Read access to the media keys of one sender.
pub trait KeySource: Send + Sync {
    fn media_key(&self, id: KeyId) -> Option<MediaKey>;
    fn current_key(&self) -> Option<(KeyId, MediaKey)>;
}

fn nonce(iv: InitVector, counter: u32) -> [u8; 12] {
    let mut n = [0u8; 12];
    n[..8].copy_from_slice(&iv.to_be_bytes());
    n[8..].copy_from_slice(&counter.to_be_bytes());
    n
}

fn header(key_id: KeyId, counter: u32) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[..4].copy_from_slice(&key_id.to_be_bytes());
    h[4..].copy_from_slice(&counter.to_be_bytes());
    h
}

#[derive(Default)]
struct SendCounter {
    key_id: Option<KeyId>,
    next: u64,
}

/// Encrypts outgoing frames with the sender's current key.
pub struct FrameEncryptor {
    iv: InitVector,
    keys: Arc<dyn KeySource>,
    counter: Mutex<SendCounter>,
}

impl FrameEncryptor {
    pub fn new(iv: InitVector, keys: Arc<dyn KeySource>) -> Self {
        Self {
            iv,
            keys,
            counter: Mutex::new(SendCounter::default()),
        }
    }

    pub fn iv(&self) -> InitVector {
        self.iv
    }

    fn next_counter(&self, key_id: KeyId) -> Result<u32> {
        let mut state = self.counter.lock();
        if state.key_id.is_none_or(|last| key_id > last) {
            *state = SendCounter {
                key_id: Some(key_id),
                next: 0,
            };
        }
        let counter =
            u32::try_from(state.next).map_err(|_| CryptoError::CounterExhausted(key_id))?;
        state.next += 1;
        Ok(counter)
    }

    #[cfg(test)]
    fn resume_at(&self, key_id: KeyId, next: u64) {
        *self.counter.lock() = SendCounter {
            key_id: Some(key_id),
            next,
        };
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (key_id, key) = self.keys.current_key().ok_or(CryptoError::NoCurrentKey)?;
        let counter = self.next_counter(key_id)?;
        let header = header(key_id, counter);

        let cipher = Aes128Gcm::new_from_slice(&key).map_err(|_| CryptoError::Cipher)?;
        let nonce = nonce(self.iv, counter);
        let sealed = cipher
            .encrypt(
                aes_gcm::Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| CryptoError::Cipher)?;

        let mut out = Vec::with_capacity(HEADER_LEN + sealed.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}

/// Decrypts frames received from one participant's track.
pub struct FrameDecryptor {
    iv: InitVector,
    keys: Arc<dyn KeySource>,
}

impl FrameDecryptor {
    pub fn new(iv: InitVector, keys: Arc<dyn KeySource>) -> Self {
        Self { iv, keys }
    }

    pub fn iv(&self) -> InitVector {
        self.iv
    }

    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < HEADER_LEN + TAG_LEN {
            return Err(CryptoError::FrameTooShort(frame.len()));
        }
        let (header, sealed) = frame.split_at(HEADER_LEN);
        let key_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let counter = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        let key = self
            .keys
            .media_key(key_id)
            .ok_or(CryptoError::UnknownKeyId(key_id))?;
        let cipher = Aes128Gcm::new_from_slice(&key).map_err(|_| CryptoError::Cipher)?;
        let nonce = nonce(self.iv, counter);
        cipher
            .decrypt(
                aes_gcm::Nonce::from_slice(&nonce),
                Payload {
                    msg: sealed,
                    aad: header,
                },
            )
            .map_err(|_| CryptoError::Cipher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Keys(Mutex<BTreeMap<KeyId, MediaKey>>);

    impl Keys {
        fn with(entries: &[(KeyId, u8)]) -> Arc<Self> {
            let keys = Self::default();
            for (id, b) in entries {
                keys.0.lock().unwrap().insert(*id, [*b; 16]);
            }
            Arc::new(keys)
        }
    }

    impl KeySource for Keys {
        fn media_key(&self, id: KeyId) -> Option<MediaKey> {
            self.0.lock().unwrap().get(&id).copied()
        }

        fn current_key(&self) -> Option<(KeyId, MediaKey)> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .next_back()
                .map(|(id, k)| (*id, *k))
        }
    }

    #[test]
    fn test_frames_decrypt_with_matching_iv() {
        let keys = Keys::with(&[(1, 7)]);
        let enc = FrameEncryptor::new(InitVector(42), keys.clone());
        let dec = FrameDecryptor::new(InitVector(42), keys);

        let a = enc.encrypt(b"frame one").unwrap();
        let b = enc.encrypt(b"frame one").unwrap();
        assert_ne!(a, b, "counter must advance");
        assert_eq!(&a[..4], &1u32.to_be_bytes());
        assert_eq!(dec.decrypt(&a).unwrap(), b"frame one");
        assert_eq!(dec.decrypt(&b).unwrap(), b"frame one");
    }

    #[test]
    fn test_wrong_iv_fails() {
        let keys = Keys::with(&[(1, 7)]);
        let enc = FrameEncryptor::new(InitVector(1), keys.clone());
        let dec = FrameDecryptor::new(InitVector(2), keys);
        let frame = enc.encrypt(b"x").unwrap();
        assert_eq!(dec.decrypt(&frame), Err(CryptoError::Cipher));
    }

    #[test]
    fn test_old_keys_stay_usable_after_rotation() {
        let sender = Keys::with(&[(1, 7)]);
        let enc = FrameEncryptor::new(InitVector(5), sender.clone());
        let old = enc.encrypt(b"before").unwrap();
        sender.0.lock().unwrap().insert(2, [9; 16]);
        let new = enc.encrypt(b"after").unwrap();
        assert_eq!(&new[..4], &2u32.to_be_bytes());

        let receiver = Keys::with(&[(1, 7), (2, 9)]);
        let dec = FrameDecryptor::new(InitVector(5), receiver);
        assert_eq!(dec.decrypt(&old).unwrap(), b"before");
        assert_eq!(dec.decrypt(&new).unwrap(), b"after");
    }

    #[test]
    fn test_counter_never_wraps_under_one_key() {
        let keys = Keys::with(&[(1, 7)]);
        let enc = FrameEncryptor::new(InitVector(3), keys.clone());
        let dec = FrameDecryptor::new(InitVector(3), keys.clone());
        enc.resume_at(1, u64::from(u32::MAX));

        let last = enc.encrypt(b"last").unwrap();
        assert_eq!(&last[4..8], &u32::MAX.to_be_bytes());
        assert_eq!(dec.decrypt(&last).unwrap(), b"last");
        assert_eq!(enc.encrypt(b"x"), Err(CryptoError::CounterExhausted(1)));
        assert_eq!(enc.encrypt(b"x"), Err(CryptoError::CounterExhausted(1)));

        // A new key starts a fresh nonce space.
        keys.0.lock().unwrap().insert(2, [8; 16]);
        let frame = enc.encrypt(b"fresh").unwrap();
        assert_eq!(&frame[..4], &2u32.to_be_bytes());
        assert_eq!(&frame[4..8], &0u32.to_be_bytes());
        assert_eq!(dec.decrypt(&frame).unwrap(), b"fresh");
    }

    #[test]
    fn test_unknown_key_and_short_frames() {
        let dec = FrameDecryptor::new(InitVector(0), Keys::with(&[]));
        assert_eq!(dec.decrypt(&[0u8; 10]), Err(CryptoError::FrameTooShort(10)));
        let mut frame = vec![0u8; 30];
        frame[3] = 4;
        assert_eq!(dec.decrypt(&frame), Err(CryptoError::UnknownKeyId(4)));

        let enc = FrameEncryptor::new(InitVector(0), Keys::with(&[]));
        assert_eq!(enc.encrypt(b"x"), Err(CryptoError::NoCurrentKey));
    }
}
