//! Key provider trait definition.
//!
//! This module defines the [`KeyProvider`] trait that all private-key
//! holders must satisfy. Callers program against the decrypt/sign
//! capability; key material never crosses the trait boundary.

use crate::Result;
use async_trait::async_trait;
use zeroize::Zeroizing;

/// The key-wrap portion of an envelope blob, as handed to a provider.
///
/// Self-contained: carries the ephemeral public key, the wrap nonce, the
/// wrapped payload key (AEAD ciphertext + tag), and the associated data the
/// wrap was bound to.
#[derive(Debug, Clone)]
pub struct WrappedKey {
    /// Ephemeral X25519 public key from the encrypting side
    pub ephemeral: [u8; 32],
    /// Wrap AEAD nonce
    pub nonce: [u8; 12],
    /// Wrapped payload key (ciphertext + tag)
    pub ciphertext: Vec<u8>,
    /// Associated data the wrap is authenticated against
    pub aad: Vec<u8>,
}

/// A 32-byte symmetric payload key, zeroed on drop.
///
/// Produced by [`KeyProvider::unwrap_key`] and consumed immediately by the
/// crypto engine; never persisted.
pub struct PayloadKey(Zeroizing<[u8; 32]>);

impl PayloadKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Borrows the key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for PayloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material is never printed.
        f.write_str("PayloadKey(..)")
    }
}

/// KeyProvider represents access to one identity's private key material.
///
/// Two implementations ship with the engine:
///
/// - [`SoftwareKey`](crate::providers::software::SoftwareKey): key bytes in
///   process memory, zeroed on release.
/// - [`HardwareKey`](crate::providers::hardware::HardwareKey): operations
///   delegated to a card slot through a
///   [`CardTransport`](crate::providers::hardware::CardTransport) session.
///
/// All implementations must be `Send + Sync` to support concurrent access
/// across async tasks.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Returns the identity name this provider holds keys for.
    fn identity(&self) -> &str;

    /// Unwraps a payload key.
    ///
    /// # Errors
    ///
    /// - [`PkvaultError::KeyUnavailable`](crate::PkvaultError::KeyUnavailable):
    ///   hardware token absent, locked, or slot acquisition timed out
    /// - [`PkvaultError::Integrity`](crate::PkvaultError::Integrity):
    ///   the wrap tag did not verify (tampered or wrong key)
    /// - [`PkvaultError::Decrypt`](crate::PkvaultError::Decrypt):
    ///   malformed wrap input
    async fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<PayloadKey>;

    /// Signs a message with the identity's Ed25519 key.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::KeyUnavailable`](crate::PkvaultError::KeyUnavailable)
    /// if the signing key cannot be reached.
    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}
