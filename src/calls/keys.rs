//! Pairwise wrapping of media keys for other participants.

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use sfucore::crypto::{self, MediaKey, SymmetricKey};
use sfucore::types::UserId;
use std::sync::Arc;
use x25519_dalek::{PublicKey, StaticSecret};

use super::error::CallError;

/// Resolves a user's long-term public key. Lookups may hit the network.
#[async_trait]
pub trait KeyCache: Send + Sync {
    async fn public_key(&self, user: &UserId) -> anyhow::Result<Option<Vec<u8>>>;
}

/// A [`KeyCache`] backed by a map. Useful when keys are pushed from elsewhere.
#[derive(Debug, Default)]
pub struct InMemoryKeyCache {
    keys: DashMap<UserId, Vec<u8>>,
}

impl InMemoryKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: UserId, public_key: Vec<u8>) {
        self.keys.insert(user, public_key);
    }

    pub fn remove(&self, user: &UserId) {
        self.keys.remove(user);
    }
}

#[async_trait]
impl KeyCache for InMemoryKeyCache {
    async fn public_key(&self, user: &UserId) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.keys.get(user).map(|k| k.value().clone()))
    }
}

/// Our long-term identity plus access to everybody else's public key.
///
/// The pairwise key is derived again on every call. Nothing is cached
/// between operations.
pub struct MediaKeyCrypto {
    identity: StaticSecret,
    cache: Arc<dyn KeyCache>,
}

impl MediaKeyCrypto {
    pub fn new(identity: StaticSecret, cache: Arc<dyn KeyCache>) -> Self {
        Self { identity, cache }
    }

    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.identity).to_bytes()
    }

    pub async fn derive_shared_key(&self, peer: &UserId) -> Result<SymmetricKey, CallError> {
        let public = match self.cache.public_key(peer).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                debug!(target: "Call/Keys", "no public key cached for {peer}");
                return Err(CallError::KeyUnavailable(peer.clone()));
            }
            Err(e) => {
                warn!(target: "Call/Keys", "public key lookup for {peer} failed: {e}");
                return Err(CallError::KeyUnavailable(peer.clone()));
            }
        };
        Ok(crypto::derive_shared_key(&self.identity, &public)?)
    }

    pub async fn encrypt_key_to(&self, peer: &UserId, plain: &[u8]) -> Result<MediaKey, CallError> {
        let shared = self.derive_shared_key(peer).await?;
        Ok(crypto::encrypt_key(&shared, plain)?)
    }

    pub async fn decrypt_key_from(
        &self,
        peer: &UserId,
        wrapped: &[u8],
    ) -> Result<MediaKey, CallError> {
        let shared = self.derive_shared_key(peer).await?;
        Ok(crypto::decrypt_key(&shared, wrapped)?)
    }
}
