//! Mock issuing authority and card transport for testing.
//!
//! [`MockCa`] issues certificates chained to an in-memory Ed25519 anchor and
//! can write bundle/certificate/key files to disk so tests exercise the same
//! loading paths as production. [`MockToken`] is an in-memory
//! [`CardTransport`] with presence and lock toggles to simulate failure
//! conditions.

use crate::identity::{Certificate, TrustAnchor, TrustBundle};
use crate::providers::hardware::CardTransport;
use crate::providers::software::SoftwareKey;
use crate::{PkvaultError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signer, SigningKey};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use x25519_dalek::{PublicKey, StaticSecret};

/// In-memory certificate authority for tests.
///
/// # Example
///
/// ```
/// use pkvault::providers::mock::MockCa;
///
/// let ca = MockCa::new("test-ca");
/// let (cert, key) = ca.issue("alice");
/// assert_eq!(cert.subject, "alice");
/// assert_eq!(cert.issuer, "test-ca");
/// ```
pub struct MockCa {
    name: String,
    signing_key: SigningKey,
}

impl MockCa {
    /// Creates a new authority with a fresh Ed25519 anchor key.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Returns this authority's trust anchor.
    pub fn anchor(&self) -> TrustAnchor {
        TrustAnchor {
            name: self.name.clone(),
            verifying_key: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Returns a single-anchor trust bundle for this authority.
    pub fn bundle(&self) -> TrustBundle {
        TrustBundle {
            anchors: vec![self.anchor()],
        }
    }

    /// Issues a certificate and matching software key for `identity`,
    /// valid for one year.
    pub fn issue(&self, identity: &str) -> (Certificate, SoftwareKey) {
        let now = Utc::now();
        self.issue_with_window(identity, now - Duration::hours(1), now + Duration::days(365))
    }

    /// Issues a certificate with an explicit validity window.
    pub fn issue_with_window(
        &self,
        identity: &str,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> (Certificate, SoftwareKey) {
        let key = SoftwareKey::generate(identity);
        let cert = self.certify(identity, key.public_key(), key.verifying_key(), not_before, not_after);
        (cert, key)
    }

    /// Issues a certificate for keys held on a [`MockToken`].
    pub fn issue_for_token(&self, identity: &str, token: &MockToken) -> Certificate {
        let now = Utc::now();
        self.certify(
            identity,
            token.public_key_bytes(),
            token.verifying_key_bytes(),
            now - Duration::hours(1),
            now + Duration::days(365),
        )
    }

    fn certify(
        &self,
        identity: &str,
        encryption_key: [u8; 32],
        verifying_key: [u8; 32],
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> Certificate {
        let mut cert = Certificate {
            subject: identity.to_string(),
            encryption_key,
            verifying_key,
            issuer: self.name.clone(),
            not_before,
            not_after,
            signature: Vec::new(),
        };
        cert.signature = self.signing_key.sign(&cert.signed_bytes()).to_bytes().to_vec();
        cert
    }

    /// Writes the trust bundle to `path` as JSON.
    pub async fn write_bundle(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.bundle())?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Writes a certificate to `<dir>/<subject>.cert` as JSON.
    pub async fn write_certificate(dir: impl AsRef<Path>, cert: &Certificate) -> Result<()> {
        let path = dir.as_ref().join(format!("{}.cert", cert.subject));
        let json = serde_json::to_vec_pretty(cert)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

/// In-memory hardware token for testing.
///
/// Holds one X25519/Ed25519 keypair and simulates removal (`eject`) and a
/// locked PIN state (`lock`), both of which surface as
/// [`PkvaultError::KeyUnavailable`] from transport operations.
pub struct MockToken {
    encryption_secret: StaticSecret,
    signing_key: SigningKey,
    present: AtomicBool,
    locked: AtomicBool,
}

impl MockToken {
    /// Creates a present, unlocked token with fresh keys.
    pub fn new() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            encryption_secret: StaticSecret::random_from_rng(&mut rng),
            signing_key: SigningKey::generate(&mut rng),
            present: AtomicBool::new(true),
            locked: AtomicBool::new(false),
        }
    }

    /// Simulates removing the token from the slot.
    pub fn eject(&self) {
        self.present.store(false, Ordering::SeqCst);
    }

    /// Simulates inserting the token.
    pub fn insert(&self) {
        self.present.store(true, Ordering::SeqCst);
    }

    /// Simulates a locked PIN state.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    /// Unlocks the token.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    /// X25519 public key bytes.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        *PublicKey::from(&self.encryption_secret).as_bytes()
    }

    /// Ed25519 verifying key bytes.
    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Builds a self-signed certificate for the token's keys.
    pub fn self_signed_certificate(&self, identity: &str) -> Certificate {
        let now = Utc::now();
        let mut cert = Certificate {
            subject: identity.to_string(),
            encryption_key: self.public_key_bytes(),
            verifying_key: self.verifying_key_bytes(),
            issuer: identity.to_string(),
            not_before: now - Duration::hours(1),
            not_after: now + Duration::days(365),
            signature: Vec::new(),
        };
        cert.signature = self.signing_key.sign(&cert.signed_bytes()).to_bytes().to_vec();
        cert
    }

    fn check_usable(&self, slot: usize) -> Result<()> {
        if !self.present.load(Ordering::SeqCst) {
            return Err(PkvaultError::KeyUnavailable(format!(
                "no token present in slot {}",
                slot
            )));
        }
        if self.locked.load(Ordering::SeqCst) {
            return Err(PkvaultError::KeyUnavailable(format!(
                "token in slot {} is locked",
                slot
            )));
        }
        Ok(())
    }
}

impl Default for MockToken {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CardTransport for MockToken {
    fn name(&self) -> &str {
        "mock"
    }

    async fn is_present(&self, _slot: usize) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    async fn public_key(&self, slot: usize) -> Result<[u8; 32]> {
        self.check_usable(slot)?;
        Ok(self.public_key_bytes())
    }

    async fn key_agreement(&self, slot: usize, ephemeral: &[u8; 32]) -> Result<[u8; 32]> {
        self.check_usable(slot)?;
        let shared = self
            .encryption_secret
            .diffie_hellman(&PublicKey::from(*ephemeral));
        Ok(*shared.as_bytes())
    }

    async fn sign(&self, slot: usize, message: &[u8]) -> Result<Vec<u8>> {
        self.check_usable(slot)?;
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}
