//! Hardware key provider: private-key operations delegated to a card slot.
//!
//! The key never enters host memory. All cryptographic work involving the
//! private key runs on the token through a [`CardTransport`]; the host only
//! sees the key-agreement output and derives the wrap key from it.
//!
//! Card slots are exclusive resources: only one session may hold a slot at
//! a time process-wide. Acquisition either blocks with a timeout or fails
//! fast, per [`CardWait`](crate::config::CardWait); the session is an RAII
//! guard released on every exit path.

use crate::config::CardWait;
use crate::envelope::open_wrapped;
use crate::provider::{KeyProvider, PayloadKey, WrappedKey};
use crate::{PkvaultError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Transport to a hardware token.
///
/// Implementations talk to an actual card stack (PKCS#11, PIV, TPM);
/// [`MockToken`](super::mock::MockToken) provides an in-memory transport
/// for tests. The private key never crosses this interface.
#[async_trait]
pub trait CardTransport: Send + Sync {
    /// Returns the transport name (e.g., "piv", "mock").
    fn name(&self) -> &str;

    /// Checks whether a usable token is present in the slot.
    async fn is_present(&self, slot: usize) -> bool;

    /// Returns the X25519 public key of the key pair in the slot.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::KeyUnavailable`] if the token is absent or
    /// locked.
    async fn public_key(&self, slot: usize) -> Result<[u8; 32]>;

    /// Performs X25519 key agreement on the card.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::KeyUnavailable`] if the token is absent or
    /// locked.
    async fn key_agreement(&self, slot: usize, ephemeral: &[u8; 32]) -> Result<[u8; 32]>;

    /// Signs a message with the Ed25519 key on the card.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::KeyUnavailable`] if the token is absent or
    /// locked.
    async fn sign(&self, slot: usize, message: &[u8]) -> Result<Vec<u8>>;
}

// One lock per slot index, shared by every HardwareKey in the process.
static SLOT_LOCKS: OnceLock<StdMutex<HashMap<usize, Arc<Mutex<()>>>>> = OnceLock::new();

fn slot_lock(slot: usize) -> Arc<Mutex<()>> {
    let locks = SLOT_LOCKS.get_or_init(|| StdMutex::new(HashMap::new()));
    let mut locks = locks.lock().expect("slot lock registry poisoned");
    locks
        .entry(slot)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// An exclusive session on one card slot.
///
/// Dropping the session releases the slot, on success and failure paths
/// alike.
pub struct CardSession {
    slot: usize,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for CardSession {
    fn drop(&mut self) {
        debug!(slot = self.slot, "card session released");
    }
}

/// A private key behind a hardware token.
pub struct HardwareKey {
    identity: String,
    slot: usize,
    wait: CardWait,
    transport: Arc<dyn CardTransport>,
}

impl HardwareKey {
    /// Creates a hardware key for `identity` on the given slot.
    pub fn new(
        identity: impl Into<String>,
        transport: Arc<dyn CardTransport>,
        slot: usize,
        wait: CardWait,
    ) -> Self {
        Self {
            identity: identity.into(),
            slot,
            wait,
            transport,
        }
    }

    /// Acquires an exclusive session on this key's slot.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::KeyUnavailable`] if the slot is held by
    /// another session (fail-fast mode), acquisition times out (blocking
    /// mode), or no token is present.
    pub async fn session(&self) -> Result<CardSession> {
        let lock = slot_lock(self.slot);
        let guard = match self.wait {
            CardWait::FailFast => lock.try_lock_owned().map_err(|_| {
                PkvaultError::KeyUnavailable(format!(
                    "card slot {} is held by another session",
                    self.slot
                ))
            })?,
            CardWait::Block(timeout) => tokio::time::timeout(timeout, lock.lock_owned())
                .await
                .map_err(|_| {
                    PkvaultError::KeyUnavailable(format!(
                        "timed out waiting for card slot {}",
                        self.slot
                    ))
                })?,
        };

        if !self.transport.is_present(self.slot).await {
            return Err(PkvaultError::KeyUnavailable(format!(
                "no token present in slot {}",
                self.slot
            )));
        }

        debug!(slot = self.slot, transport = self.transport.name(), "card session acquired");
        Ok(CardSession {
            slot: self.slot,
            _guard: guard,
        })
    }
}

impl std::fmt::Debug for HardwareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareKey")
            .field("identity", &self.identity)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyProvider for HardwareKey {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<PayloadKey> {
        let _session = self.session().await?;
        let public = self.transport.public_key(self.slot).await?;
        let shared = self
            .transport
            .key_agreement(self.slot, &wrapped.ephemeral)
            .await?;
        open_wrapped(&shared, &public, wrapped)
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let _session = self.session().await?;
        self.transport.sign(self.slot, message).await
    }
}
