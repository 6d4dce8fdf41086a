//! Hybrid (envelope) encryption of password payloads.
//!
//! One fresh random payload key encrypts the plaintext with
//! ChaCha20-Poly1305; that key is then wrapped independently for each
//! recipient via ephemeral X25519 key agreement, HKDF-SHA256, and a second
//! ChaCha20-Poly1305 pass. Every blob produced by one [`CryptoEngine::encrypt_for`]
//! call decrypts to the same plaintext, and payload keys are never reused
//! across calls.

use crate::identity::{hex_bytes, Recipient};
use crate::provider::{KeyProvider, PayloadKey, WrappedKey};
use crate::{PkvaultError, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

/// Current envelope wire-format version.
pub const ENVELOPE_VERSION: u8 = 1;

const WRAP_SALT: &[u8] = b"pkvault:hkdf-salt:v1";
const WRAP_INFO_LABEL: &[u8] = b"pkvault:wrap:v1";

/// One recipient's independently decryptable ciphertext blob.
///
/// Self-describing: carries everything needed to decrypt given that
/// recipient's private key, and enough metadata to detect mismatched
/// material at decryption time (version, recipient fingerprint, AAD
/// binding of the wrap to the payload nonce).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvelopeBlob {
    /// Wire-format version
    pub version: u8,

    /// Recipient identity name
    pub recipient: String,

    /// Fingerprint of the recipient certificate the key was wrapped for
    pub recipient_fingerprint: String,

    /// Ephemeral X25519 public key
    #[serde(with = "crate::identity::hex_array")]
    pub ephemeral: [u8; 32],

    /// Nonce for the key wrap
    #[serde(with = "hex_bytes")]
    pub wrap_nonce: Vec<u8>,

    /// Wrapped payload key (AEAD ciphertext + tag)
    #[serde(with = "hex_bytes")]
    pub wrapped_key: Vec<u8>,

    /// Nonce for the payload
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,

    /// Payload ciphertext (AEAD ciphertext + tag)
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

impl EnvelopeBlob {
    /// Associated data the key wrap is authenticated against.
    ///
    /// Binds the wrap to the format version, the recipient certificate,
    /// and this entry's payload nonce, so wrapped keys cannot be spliced
    /// between blobs or entries.
    fn wrap_aad(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(1 + self.recipient_fingerprint.len() + self.nonce.len());
        aad.push(self.version);
        aad.extend_from_slice(self.recipient_fingerprint.as_bytes());
        aad.extend_from_slice(&self.nonce);
        aad
    }

    /// Extracts the key-wrap portion for a [`KeyProvider`].
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::Decrypt`] on unknown version or malformed
    /// nonce lengths.
    pub fn wrapped(&self) -> Result<WrappedKey> {
        if self.version != ENVELOPE_VERSION {
            return Err(PkvaultError::Decrypt(format!(
                "unsupported envelope version {}",
                self.version
            )));
        }
        let nonce: [u8; 12] = self
            .wrap_nonce
            .as_slice()
            .try_into()
            .map_err(|_| PkvaultError::Decrypt("wrap nonce must be 12 bytes".to_string()))?;
        Ok(WrappedKey {
            ephemeral: self.ephemeral,
            nonce,
            ciphertext: self.wrapped_key.clone(),
            aad: self.wrap_aad(),
        })
    }
}

/// Derives the key-wrap key from an X25519 shared secret.
///
/// Context includes both public halves so a key derived for one
/// (ephemeral, recipient) pair can never open another pair's wrap.
pub(crate) fn derive_wrap_key(
    shared: &[u8; 32],
    ephemeral: &[u8; 32],
    recipient_pub: &[u8; 32],
) -> Zeroizing<[u8; 32]> {
    let mut info = Vec::with_capacity(WRAP_INFO_LABEL.len() + 64);
    info.extend_from_slice(WRAP_INFO_LABEL);
    info.extend_from_slice(ephemeral);
    info.extend_from_slice(recipient_pub);

    let hk = Hkdf::<Sha256>::new(Some(WRAP_SALT), shared);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(&info, key.as_mut())
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Opens a wrapped payload key given the X25519 shared secret.
///
/// Shared by [`SoftwareKey`](crate::providers::software::SoftwareKey) and
/// [`HardwareKey`](crate::providers::hardware::HardwareKey); only the
/// key-agreement step differs between them.
pub(crate) fn open_wrapped(
    shared: &[u8; 32],
    recipient_pub: &[u8; 32],
    wrapped: &WrappedKey,
) -> Result<PayloadKey> {
    let wrap_key = derive_wrap_key(shared, &wrapped.ephemeral, recipient_pub);
    let cipher = ChaCha20Poly1305::new_from_slice(wrap_key.as_ref())
        .map_err(|e| PkvaultError::Decrypt(e.to_string()))?;

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&wrapped.nonce),
            Payload {
                msg: &wrapped.ciphertext,
                aad: &wrapped.aad,
            },
        )
        .map_err(|_| PkvaultError::Integrity("key wrap tag verification failed".to_string()))?;

    let key: [u8; 32] = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| PkvaultError::Decrypt("wrapped key has wrong length".to_string()))?;
    Ok(PayloadKey::from_bytes(key))
}

/// Performs hybrid encryption and decryption of password payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct CryptoEngine;

impl CryptoEngine {
    /// Creates a new crypto engine.
    pub fn new() -> Self {
        Self
    }

    /// Encrypts `plaintext` for every recipient in `recipients`.
    ///
    /// A fresh random payload key is generated per call; the plaintext is
    /// encrypted once, and the key is wrapped independently under each
    /// recipient's public key. All returned blobs decrypt to the same
    /// plaintext.
    pub fn encrypt_for(
        &self,
        plaintext: &[u8],
        recipients: &[Arc<Recipient>],
    ) -> Result<HashMap<String, EnvelopeBlob>> {
        let mut rng = rand::rngs::OsRng;

        let mut payload_key = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(payload_key.as_mut());
        let mut nonce = [0u8; 12];
        rng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new_from_slice(payload_key.as_ref())
            .map_err(|e| PkvaultError::Other(anyhow::anyhow!("payload cipher init: {}", e)))?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &[ENVELOPE_VERSION],
                },
            )
            .map_err(|e| PkvaultError::Other(anyhow::anyhow!("payload encryption: {}", e)))?;

        let mut blobs = HashMap::with_capacity(recipients.len());
        for recipient in recipients {
            let recipient_pub = recipient.certificate.encryption_key;

            let ephemeral_secret = EphemeralSecret::random_from_rng(rng);
            let ephemeral = PublicKey::from(&ephemeral_secret);
            let shared = ephemeral_secret.diffie_hellman(&PublicKey::from(recipient_pub));

            let mut wrap_nonce = [0u8; 12];
            rng.fill_bytes(&mut wrap_nonce);

            let mut blob = EnvelopeBlob {
                version: ENVELOPE_VERSION,
                recipient: recipient.name.clone(),
                recipient_fingerprint: recipient.certificate.fingerprint(),
                ephemeral: *ephemeral.as_bytes(),
                wrap_nonce: wrap_nonce.to_vec(),
                wrapped_key: Vec::new(),
                nonce: nonce.to_vec(),
                ciphertext: ciphertext.clone(),
            };

            let wrap_key = derive_wrap_key(shared.as_bytes(), ephemeral.as_bytes(), &recipient_pub);
            let wrap_cipher = ChaCha20Poly1305::new_from_slice(wrap_key.as_ref())
                .map_err(|e| PkvaultError::Other(anyhow::anyhow!("wrap cipher init: {}", e)))?;
            blob.wrapped_key = wrap_cipher
                .encrypt(
                    Nonce::from_slice(&wrap_nonce),
                    Payload {
                        msg: payload_key.as_ref(),
                        aad: &blob.wrap_aad(),
                    },
                )
                .map_err(|e| PkvaultError::Other(anyhow::anyhow!("key wrap: {}", e)))?;

            blobs.insert(recipient.name.clone(), blob);
        }

        Ok(blobs)
    }

    /// Decrypts one recipient's blob using that recipient's provider.
    ///
    /// # Errors
    ///
    /// - [`PkvaultError::Integrity`]: an authentication tag did not verify
    ///   (tampered blob or wrong key); never returns wrong plaintext
    /// - [`PkvaultError::Decrypt`]: malformed blob
    /// - [`PkvaultError::KeyUnavailable`]: the provider cannot reach its key
    pub async fn decrypt_with(
        &self,
        blob: &EnvelopeBlob,
        provider: &dyn KeyProvider,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let wrapped = blob.wrapped()?;
        let payload_key = provider.unwrap_key(&wrapped).await?;

        let nonce: [u8; 12] = blob
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| PkvaultError::Decrypt("payload nonce must be 12 bytes".to_string()))?;

        let cipher = ChaCha20Poly1305::new_from_slice(payload_key.as_bytes())
            .map_err(|e| PkvaultError::Decrypt(e.to_string()))?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &blob.ciphertext,
                    aad: &[blob.version],
                },
            )
            .map_err(|_| {
                PkvaultError::Integrity("payload tag verification failed".to_string())
            })?;

        Ok(Zeroizing::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::software::SoftwareKey;

    fn recipient_for(key: &SoftwareKey) -> Arc<Recipient> {
        Arc::new(Recipient::new(key.self_signed_certificate()))
    }

    #[tokio::test]
    async fn test_roundtrip_single_recipient() {
        let alice = SoftwareKey::generate("alice");
        let recipients = vec![recipient_for(&alice)];

        let engine = CryptoEngine::new();
        let blobs = engine.encrypt_for(b"hunter2", &recipients).unwrap();
        let plaintext = engine
            .decrypt_with(&blobs["alice"], &alice)
            .await
            .unwrap();

        assert_eq!(plaintext.as_slice(), b"hunter2");
    }

    #[tokio::test]
    async fn test_multi_recipient_same_plaintext() {
        let alice = SoftwareKey::generate("alice");
        let bob = SoftwareKey::generate("bob");
        let recipients = vec![recipient_for(&alice), recipient_for(&bob)];

        let engine = CryptoEngine::new();
        let blobs = engine.encrypt_for(b"shared secret", &recipients).unwrap();
        assert_eq!(blobs.len(), 2);

        let for_alice = engine.decrypt_with(&blobs["alice"], &alice).await.unwrap();
        let for_bob = engine.decrypt_with(&blobs["bob"], &bob).await.unwrap();
        assert_eq!(for_alice.as_slice(), for_bob.as_slice());
        assert_eq!(for_alice.as_slice(), b"shared secret");
    }

    #[tokio::test]
    async fn test_wrong_recipient_fails_integrity() {
        let alice = SoftwareKey::generate("alice");
        let bob = SoftwareKey::generate("bob");
        let recipients = vec![recipient_for(&alice)];

        let engine = CryptoEngine::new();
        let blobs = engine.encrypt_for(b"secret", &recipients).unwrap();

        let result = engine.decrypt_with(&blobs["alice"], &bob).await;
        assert!(matches!(result, Err(PkvaultError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails_integrity() {
        let alice = SoftwareKey::generate("alice");
        let recipients = vec![recipient_for(&alice)];

        let engine = CryptoEngine::new();
        let mut blobs = engine.encrypt_for(b"secret", &recipients).unwrap();
        let blob = blobs.get_mut("alice").unwrap();
        blob.ciphertext[0] ^= 0x01;

        let result = engine.decrypt_with(blob, &alice).await;
        assert!(matches!(result, Err(PkvaultError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_tampered_wrapped_key_fails_integrity() {
        let alice = SoftwareKey::generate("alice");
        let recipients = vec![recipient_for(&alice)];

        let engine = CryptoEngine::new();
        let mut blobs = engine.encrypt_for(b"secret", &recipients).unwrap();
        let blob = blobs.get_mut("alice").unwrap();
        let last = blob.wrapped_key.len() - 1;
        blob.wrapped_key[last] ^= 0x80;

        let result = engine.decrypt_with(blob, &alice).await;
        assert!(matches!(result, Err(PkvaultError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_malformed_nonce_fails_decrypt() {
        let alice = SoftwareKey::generate("alice");
        let recipients = vec![recipient_for(&alice)];

        let engine = CryptoEngine::new();
        let mut blobs = engine.encrypt_for(b"secret", &recipients).unwrap();
        let blob = blobs.get_mut("alice").unwrap();
        blob.wrap_nonce.truncate(4);

        let result = engine.decrypt_with(blob, &alice).await;
        assert!(matches!(result, Err(PkvaultError::Decrypt(_))));
    }

    #[tokio::test]
    async fn test_fresh_keys_per_call() {
        let alice = SoftwareKey::generate("alice");
        let recipients = vec![recipient_for(&alice)];

        let engine = CryptoEngine::new();
        let first = engine.encrypt_for(b"same secret", &recipients).unwrap();
        let second = engine.encrypt_for(b"same secret", &recipients).unwrap();

        // Ciphertext-distinct, plaintext-identical.
        assert_ne!(first["alice"].ciphertext, second["alice"].ciphertext);
        let a = engine.decrypt_with(&first["alice"], &alice).await.unwrap();
        let b = engine.decrypt_with(&second["alice"], &alice).await.unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
    }
}
