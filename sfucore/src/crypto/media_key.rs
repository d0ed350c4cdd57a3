//! Pairwise wrapping of per-call media keys.
//!
//! A rotated media key is sent to every participant encrypted under a key
//! shared only with that participant: X25519 between our long-term secret and
//! their long-term public key, stretched with HKDF-SHA256. The wrapped value
//! is a single AES-128 block. ECB is acceptable only because the plaintext is
//! always a random 16-byte key.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use super::{CryptoError, Result, hkdf};

pub const KEY_SIZE: usize = 16;

/// Label binding the derived key to media key wrapping.
const PAIRWISE_LABEL: &[u8] = b"sfu-call pairwise media key v1";

/// A 16-byte symmetric media key.
pub type MediaKey = [u8; KEY_SIZE];

/// Key shared between us and one other user.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Derives the pairwise key from our secret and the peer's public key.
pub fn derive_shared_key(ours: &StaticSecret, theirs: &[u8]) -> Result<SymmetricKey> {
    let theirs: [u8; 32] = theirs
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey(theirs.len()))?;
    let shared = ours.diffie_hellman(&PublicKey::from(theirs));
    let okm = hkdf::sha256_array::<KEY_SIZE>(shared.as_bytes(), None, PAIRWISE_LABEL)?;
    Ok(SymmetricKey(okm))
}

fn check_size(data: &[u8]) -> Result<&[u8; KEY_SIZE]> {
    data.try_into().map_err(|_| CryptoError::InvalidKeySize {
        expected: KEY_SIZE,
        got: data.len(),
    })
}

pub fn encrypt_key(shared: &SymmetricKey, plain: &[u8]) -> Result<MediaKey> {
    let plain = check_size(plain)?;
    let cipher = Aes128::new(GenericArray::from_slice(shared.as_bytes()));
    let mut block = GenericArray::clone_from_slice(plain);
    cipher.encrypt_block(&mut block);
    Ok(to_key(&block))
}

pub fn decrypt_key(shared: &SymmetricKey, wrapped: &[u8]) -> Result<MediaKey> {
    let wrapped = check_size(wrapped)?;
    let cipher = Aes128::new(GenericArray::from_slice(shared.as_bytes()));
    let mut block = GenericArray::clone_from_slice(wrapped);
    cipher.decrypt_block(&mut block);
    Ok(to_key(&block))
}

fn to_key(block: &[u8]) -> MediaKey {
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(block);
    key
}

pub fn generate_send_key() -> MediaKey {
    let mut key = [0u8; KEY_SIZE];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Binds a rotated send key to the call by combining it with the call key.
pub fn xor_with_call_key(call_key: &MediaKey, send_key: &MediaKey) -> MediaKey {
    let mut out = [0u8; KEY_SIZE];
    for (o, (a, b)) in out.iter_mut().zip(call_key.iter().zip(send_key)) {
        *o = a ^ b;
    }
    out
}

/// Creates a fresh X25519 identity secret.
pub fn generate_identity() -> StaticSecret {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    StaticSecret::from(bytes)
}
