//! Identity data structures: certificates, trust anchors, and recipients.
//!
//! A certificate binds a subject name to two public keys (an X25519
//! encryption key and an Ed25519 verifying key) for a validity window, and
//! is signed by a trust-bundle anchor. Certificates are plain JSON
//! documents; issuance is out of scope for the engine and handled by an
//! external authority (or [`MockCa`](crate::providers::mock::MockCa) in
//! tests).

use crate::{PkvaultError, Result};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Domain separation label for certificate signatures.
const CERT_SIGNING_LABEL: &[u8] = b"pkvault:certificate:v1";

/// A recipient certificate.
///
/// Carries both public key halves of an identity: the X25519 key used for
/// envelope key wrapping and the Ed25519 key used to verify entry
/// signatures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Certificate {
    /// Subject identity name
    pub subject: String,

    /// X25519 public key for key agreement
    #[serde(with = "hex_array")]
    pub encryption_key: [u8; 32],

    /// Ed25519 public key for signature verification
    #[serde(with = "hex_array")]
    pub verifying_key: [u8; 32],

    /// Issuing trust anchor name
    pub issuer: String,

    /// Start of the validity window
    pub not_before: DateTime<Utc>,

    /// End of the validity window
    pub not_after: DateTime<Utc>,

    /// Ed25519 signature by the issuer over the canonical encoding
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl Certificate {
    /// Canonical byte encoding covered by the issuer signature.
    ///
    /// Fields are length-prefixed so no two distinct certificates share an
    /// encoding.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(128);
        bytes.extend_from_slice(CERT_SIGNING_LABEL);
        for field in [self.subject.as_bytes(), self.issuer.as_bytes()] {
            bytes.extend_from_slice(&(field.len() as u32).to_le_bytes());
            bytes.extend_from_slice(field);
        }
        bytes.extend_from_slice(&self.encryption_key);
        bytes.extend_from_slice(&self.verifying_key);
        bytes.extend_from_slice(&self.not_before.timestamp().to_le_bytes());
        bytes.extend_from_slice(&self.not_after.timestamp().to_le_bytes());
        bytes
    }

    /// SHA-256 fingerprint of the canonical encoding, hex encoded.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.signed_bytes()))
    }

    /// Checks whether the certificate is within its validity window at `at`.
    pub fn valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }
}

/// A single trust anchor: a named Ed25519 verifying key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustAnchor {
    /// Anchor (issuer) name
    pub name: String,

    /// Ed25519 public key
    #[serde(with = "hex_array")]
    pub verifying_key: [u8; 32],
}

/// A bundle of trust anchors loaded from disk.
///
/// Certificates are admitted only if a bundle anchor with the certificate's
/// issuer name verifies the certificate signature and the validity window
/// contains the current time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustBundle {
    /// Trust anchors, in no particular order
    pub anchors: Vec<TrustAnchor>,
}

impl TrustBundle {
    /// Loads a trust bundle from a JSON file.
    pub async fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let data = tokio::fs::read(path.as_ref()).await.map_err(|e| {
            PkvaultError::Trust(format!(
                "cannot read trust bundle {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let bundle: TrustBundle = serde_json::from_slice(&data)
            .map_err(|e| PkvaultError::Trust(format!("malformed trust bundle: {}", e)))?;
        Ok(bundle)
    }

    /// Looks up an anchor by name.
    pub fn anchor(&self, name: &str) -> Option<&TrustAnchor> {
        self.anchors.iter().find(|a| a.name == name)
    }

    /// Validates a certificate against this bundle.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::Trust`] if the issuer is not an anchor, the
    /// signature does not verify, or `now` is outside the validity window.
    pub fn verify(&self, cert: &Certificate, now: DateTime<Utc>) -> Result<()> {
        let anchor = self.anchor(&cert.issuer).ok_or_else(|| {
            PkvaultError::Trust(format!(
                "certificate '{}' issued by unknown anchor '{}'",
                cert.subject, cert.issuer
            ))
        })?;

        let key = VerifyingKey::from_bytes(&anchor.verifying_key)
            .map_err(|e| PkvaultError::Trust(format!("bad anchor key '{}': {}", anchor.name, e)))?;
        let signature = Signature::from_slice(&cert.signature).map_err(|e| {
            PkvaultError::Trust(format!(
                "malformed signature on certificate '{}': {}",
                cert.subject, e
            ))
        })?;

        key.verify(&cert.signed_bytes(), &signature).map_err(|_| {
            PkvaultError::Trust(format!(
                "signature verification failed for certificate '{}'",
                cert.subject
            ))
        })?;

        if !cert.valid_at(now) {
            return Err(PkvaultError::Trust(format!(
                "certificate '{}' outside validity window ({} .. {})",
                cert.subject, cert.not_before, cert.not_after
            )));
        }

        Ok(())
    }
}

/// A password recipient.
///
/// Immutable once loaded; shared by reference (`Arc<Recipient>`) out of the
/// certificate store, never owned by entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipient {
    /// Identity name
    pub name: String,

    /// Validated certificate
    pub certificate: Certificate,

    /// Card slot holding this recipient's private key, if hardware-backed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_slot: Option<usize>,
}

impl Recipient {
    /// Creates a recipient from a validated certificate.
    pub fn new(certificate: Certificate) -> Self {
        Self {
            name: certificate.subject.clone(),
            certificate,
            card_slot: None,
        }
    }
}

/// Hex serde helper for fixed 32-byte arrays.
pub(crate) mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// Hex serde helper for variable-length byte vectors.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn issue(subject: &str, signing_key: &SigningKey, issuer: &str) -> Certificate {
        let now = Utc::now();
        let mut cert = Certificate {
            subject: subject.to_string(),
            encryption_key: [1u8; 32],
            verifying_key: [2u8; 32],
            issuer: issuer.to_string(),
            not_before: now - Duration::hours(1),
            not_after: now + Duration::days(365),
            signature: Vec::new(),
        };
        cert.signature = signing_key.sign(&cert.signed_bytes()).to_bytes().to_vec();
        cert
    }

    fn bundle_with(signing_key: &SigningKey, name: &str) -> TrustBundle {
        TrustBundle {
            anchors: vec![TrustAnchor {
                name: name.to_string(),
                verifying_key: signing_key.verifying_key().to_bytes(),
            }],
        }
    }

    #[test]
    fn test_verify_valid_certificate() {
        let ca = SigningKey::generate(&mut OsRng);
        let cert = issue("alice", &ca, "test-ca");
        let bundle = bundle_with(&ca, "test-ca");

        assert!(bundle.verify(&cert, Utc::now()).is_ok());
    }

    #[test]
    fn test_unknown_issuer() {
        let ca = SigningKey::generate(&mut OsRng);
        let cert = issue("alice", &ca, "other-ca");
        let bundle = bundle_with(&ca, "test-ca");

        let err = bundle.verify(&cert, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("unknown anchor"));
    }

    #[test]
    fn test_tampered_certificate() {
        let ca = SigningKey::generate(&mut OsRng);
        let mut cert = issue("alice", &ca, "test-ca");
        cert.encryption_key[0] ^= 0xff;
        let bundle = bundle_with(&ca, "test-ca");

        let err = bundle.verify(&cert, Utc::now()).unwrap_err();
        assert!(matches!(err, PkvaultError::Trust(_)));
    }

    #[test]
    fn test_expired_certificate() {
        let ca = SigningKey::generate(&mut OsRng);
        let cert = issue("alice", &ca, "test-ca");
        let bundle = bundle_with(&ca, "test-ca");

        let far_future = Utc::now() + Duration::days(400);
        let err = bundle.verify(&cert, far_future).unwrap_err();
        assert!(err.to_string().contains("validity window"));
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let ca = SigningKey::generate(&mut OsRng);
        let a = issue("alice", &ca, "test-ca");
        let b = issue("bob", &ca, "test-ca");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_certificate_serialization_roundtrip() {
        let ca = SigningKey::generate(&mut OsRng);
        let cert = issue("alice", &ca, "test-ca");
        let json = serde_json::to_string(&cert).unwrap();
        let parsed: Certificate = serde_json::from_str(&json).unwrap();
        assert_eq!(cert, parsed);
    }
}
