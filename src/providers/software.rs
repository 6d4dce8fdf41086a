//! Software key provider: key material held in process memory.

use crate::envelope::open_wrapped;
use crate::identity::Certificate;
use crate::provider::{KeyProvider, PayloadKey, WrappedKey};
use crate::validation::validate_identity_name;
use crate::{PkvaultError, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use std::path::Path;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// On-disk key file: both secret halves of an identity, hex encoded.
///
/// Written with mode 0600; the directory holding key files should be 0700.
#[derive(Serialize, Deserialize)]
struct KeyFile {
    identity: String,
    encryption_secret: String,
    signing_secret: String,
}

/// A private key held in process memory.
///
/// Secrets are zeroed on drop. Use [`HardwareKey`](super::hardware::HardwareKey)
/// when the key must never enter host memory.
pub struct SoftwareKey {
    identity: String,
    encryption_secret: StaticSecret,
    signing_key: SigningKey,
}

impl SoftwareKey {
    /// Generates a fresh keypair for `identity`.
    pub fn generate(identity: impl Into<String>) -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            identity: identity.into(),
            encryption_secret: StaticSecret::random_from_rng(&mut rng),
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Loads `<identity>.key` from the key directory.
    ///
    /// # Errors
    ///
    /// - [`PkvaultError::KeyUnavailable`]: key file missing or unreadable
    /// - [`PkvaultError::Decrypt`]: key file malformed
    pub async fn load(key_dir: impl AsRef<Path>, identity: &str) -> Result<Self> {
        validate_identity_name(identity)?;
        let path = key_dir.as_ref().join(format!("{}.key", identity));

        let data = Zeroizing::new(tokio::fs::read(&path).await.map_err(|e| {
            PkvaultError::KeyUnavailable(format!(
                "cannot read key file {}: {}",
                path.display(),
                e
            ))
        })?);

        let file: KeyFile = serde_json::from_slice(&data)
            .map_err(|e| PkvaultError::Decrypt(format!("malformed key file: {}", e)))?;

        let encryption: [u8; 32] = decode_secret(&file.encryption_secret)?;
        let signing: [u8; 32] = decode_secret(&file.signing_secret)?;

        Ok(Self {
            identity: file.identity,
            encryption_secret: StaticSecret::from(encryption),
            signing_key: SigningKey::from_bytes(&signing),
        })
    }

    /// Writes `<identity>.key` into the key directory with mode 0600.
    pub async fn write(&self, key_dir: impl AsRef<Path>) -> Result<()> {
        let path = key_dir.as_ref().join(format!("{}.key", self.identity));

        let file = KeyFile {
            identity: self.identity.clone(),
            encryption_secret: hex::encode(self.encryption_secret.to_bytes()),
            signing_secret: hex::encode(self.signing_key.to_bytes()),
        };
        let json = Zeroizing::new(serde_json::to_vec_pretty(&file)?);

        tokio::fs::write(&path, &*json).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&path).await?.permissions();
            perms.set_mode(0o600);
            tokio::fs::set_permissions(&path, perms).await?;
        }

        Ok(())
    }

    /// X25519 public key.
    pub fn public_key(&self) -> [u8; 32] {
        *PublicKey::from(&self.encryption_secret).as_bytes()
    }

    /// Ed25519 verifying key.
    pub fn verifying_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Builds a self-signed certificate for this key, valid for one year.
    ///
    /// Useful for tests and for bootstrapping a store before a real
    /// authority signs the identity.
    pub fn self_signed_certificate(&self) -> Certificate {
        let now = Utc::now();
        let mut cert = Certificate {
            subject: self.identity.clone(),
            encryption_key: self.public_key(),
            verifying_key: self.verifying_key(),
            issuer: self.identity.clone(),
            not_before: now - Duration::hours(1),
            not_after: now + Duration::days(365),
            signature: Vec::new(),
        };
        cert.signature = self.signing_key.sign(&cert.signed_bytes()).to_bytes().to_vec();
        cert
    }
}

impl std::fmt::Debug for SoftwareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareKey")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

fn decode_secret(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = Zeroizing::new(
        hex::decode(hex_str)
            .map_err(|e| PkvaultError::Decrypt(format!("bad hex in key file: {}", e)))?,
    );
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| PkvaultError::Decrypt("key file secret must be 32 bytes".to_string()))
}

#[async_trait]
impl KeyProvider for SoftwareKey {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<PayloadKey> {
        let shared = self
            .encryption_secret
            .diffie_hellman(&PublicKey::from(wrapped.ephemeral));
        open_wrapped(shared.as_bytes(), &self.public_key(), wrapped)
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}
