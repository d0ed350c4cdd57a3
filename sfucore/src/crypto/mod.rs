pub mod frame;
pub mod hkdf;
pub mod media_key;

use thiserror::Error;

pub use frame::{FrameDecryptor, FrameEncryptor, KeySource};
pub use media_key::{
    KEY_SIZE, MediaKey, SymmetricKey, decrypt_key, derive_shared_key, encrypt_key,
    generate_identity, generate_send_key, xor_with_call_key,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key size: expected {expected} bytes, got {got}")]
    InvalidKeySize { expected: usize, got: usize },
    #[error("invalid public key size: {0} bytes")]
    InvalidPublicKey(usize),
    #[error("key derivation failed")]
    Kdf,
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),
    #[error("no media key with id {0}")]
    UnknownKeyId(u32),
    #[error("no media key has been set yet")]
    NoCurrentKey,
    #[error("frame counter exhausted under key {0}")]
    CounterExhausted(u32),
    #[error("cipher operation failed")]
    Cipher,
}

pub type Result<T> = std::result::Result<T, CryptoError>;
