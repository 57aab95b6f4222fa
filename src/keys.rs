//! Public-key lookup and the session-key exchange built on it.

use anyhow::anyhow;
use async_trait::async_trait;
use callcore::crypto::key_exchange::{
    IdentityKeyPair, KeyExchangeError, SessionKey, WrappedKeyPayload, public_key_from_bytes,
    unwrap_from_sender, wrap_for_recipient,
};
use callcore::types::call::UserId;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use x25519_dalek::PublicKey;

/// Resolves a user id to that user's current X25519 public key.
#[async_trait]
pub trait PublicKeyDirectory: Send + Sync {
    async fn public_key(&self, user: &UserId) -> Result<PublicKey, anyhow::Error>;
}

/// In-memory directory, filled by whoever learns peers' keys.
#[derive(Default)]
pub struct StaticKeyDirectory {
    keys: RwLock<HashMap<UserId, PublicKey>>,
}

impl StaticKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: UserId, key: PublicKey) {
        self.keys
            .write()
            .expect("RwLock should not be poisoned")
            .insert(user, key);
    }

    /// Register a key received as raw bytes (e.g. from a profile API).
    pub fn insert_bytes(&self, user: UserId, bytes: &[u8]) -> Result<(), KeyExchangeError> {
        let key = public_key_from_bytes(bytes)?;
        self.insert(user, key);
        Ok(())
    }
}

#[async_trait]
impl PublicKeyDirectory for StaticKeyDirectory {
    async fn public_key(&self, user: &UserId) -> Result<PublicKey, anyhow::Error> {
        self.keys
            .read()
            .expect("RwLock should not be poisoned")
            .get(user)
            .copied()
            .ok_or_else(|| anyhow!("no public key registered for {user}"))
    }
}

/// The local identity together with the directory used to reach peers.
pub struct KeyExchange {
    identity: IdentityKeyPair,
    directory: Arc<dyn PublicKeyDirectory>,
}

impl KeyExchange {
    pub fn new(identity: IdentityKeyPair, directory: Arc<dyn PublicKeyDirectory>) -> Self {
        Self {
            identity,
            directory,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    async fn lookup(&self, user: &UserId) -> Result<PublicKey, KeyExchangeError> {
        self.directory
            .public_key(user)
            .await
            .map_err(|e| KeyExchangeError::PublicKeyLookup {
                user: user.to_string(),
                reason: e.to_string(),
            })
    }

    /// Seal `key` for `peer`.
    pub async fn wrap_for(
        &self,
        peer: &UserId,
        key: &SessionKey,
    ) -> Result<WrappedKeyPayload, KeyExchangeError> {
        let recipient = self.lookup(peer).await?;
        let wrapped = wrap_for_recipient(&self.identity, &recipient, key)?;
        debug!("Wrapped session key {} for {peer}", key.hash());
        Ok(wrapped)
    }

    /// Open a key `peer` sealed for us.
    pub async fn unwrap_from(
        &self,
        peer: &UserId,
        payload: &WrappedKeyPayload,
    ) -> Result<SessionKey, KeyExchangeError> {
        let sender = self.lookup(peer).await?;
        unwrap_from_sender(&self.identity, &sender, payload)
    }
}
