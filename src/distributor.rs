//! Password distribution: the operation layer tying the engine together.
//!
//! A [`Distributor`] acts as one local identity. It resolves targets
//! against the certificate store, envelope-encrypts passwords for them,
//! splits escrow shares when escrow is configured, signs each entry with
//! the local key, and persists entries atomically. Retrieval verifies the
//! distributor's signature before any decryption work.

use crate::certstore::CertificateStore;
use crate::config::Config;
use crate::envelope::CryptoEngine;
use crate::escrow::{EscrowEngine, EscrowShare};
use crate::generator::Generator;
use crate::identity::{Certificate, Recipient};
use crate::provider::KeyProvider;
use crate::store::{EntryMetadata, EntrySignature, EscrowBlock, PasswordStore, StoredEntry};
use crate::{PkvaultError, Result};
use chrono::Utc;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Domain separation label for entry signatures.
const ENTRY_SIGNING_LABEL: &[u8] = b"pkvault:entry:v1";

/// Who a password is distributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A named group from the configuration
    Group(String),
    /// An explicit list of recipient names
    Users(Vec<String>),
}

/// Per-call distribution options.
#[derive(Debug, Clone, Copy)]
pub struct DistributeOptions {
    /// Replace an existing entry instead of failing
    pub overwrite: bool,
    /// Produce escrow shares (when escrow users are configured)
    pub escrow: bool,
}

impl Default for DistributeOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            escrow: true,
        }
    }
}

/// The top-level password distribution engine for one local identity.
pub struct Distributor {
    config: Config,
    certs: CertificateStore,
    store: PasswordStore,
    engine: CryptoEngine,
    escrow: EscrowEngine,
    generator: Generator,
    signer: Arc<dyn KeyProvider>,
}

impl Distributor {
    /// Builds a distributor from configuration, loading the certificate
    /// store and opening the password store.
    pub async fn new(config: Config, signer: Arc<dyn KeyProvider>) -> Result<Self> {
        let certs = CertificateStore::load(&config).await?;
        let store = PasswordStore::open(&config.store_path).await?;
        let generator = Generator::new(&config)?;
        let escrow = EscrowEngine::new(config.max_escrow_shares);

        Ok(Self {
            config,
            certs,
            store,
            engine: CryptoEngine::new(),
            escrow,
            generator,
            signer,
        })
    }

    /// The verified certificate store backing this distributor.
    pub fn certificates(&self) -> &CertificateStore {
        &self.certs
    }

    /// Mutable access for merging fetched certificates.
    pub fn certificates_mut(&mut self) -> &mut CertificateStore {
        &mut self.certs
    }

    fn resolve_target(&self, target: &Target) -> Result<Vec<Arc<Recipient>>> {
        let recipients = match target {
            Target::Group(name) => self.certs.resolve_group(name)?,
            Target::Users(names) => self.certs.resolve_all(names)?,
        };
        if recipients.is_empty() {
            return Err(PkvaultError::Parameter(
                "distribution target resolves to no recipients".to_string(),
            ));
        }
        Ok(recipients)
    }

    /// Encrypts `password` for every recipient in `target` and stores it
    /// under `name`.
    ///
    /// # Errors
    ///
    /// - [`PkvaultError::NotFound`]: an unresolvable recipient or group
    /// - [`PkvaultError::AlreadyExists`]: entry exists and overwrite is off
    /// - [`PkvaultError::EntryOperation`]: encryption, escrow, signing, or
    ///   storage failed mid-distribution
    pub async fn distribute(
        &self,
        name: &str,
        target: &Target,
        password: &str,
        options: &DistributeOptions,
    ) -> Result<()> {
        let recipients = self.resolve_target(target)?;

        let lock = self.store.entry_lock(name);
        let _guard = lock.lock().await;

        // Carry identity and creation time across an overwrite.
        let previous = if options.overwrite {
            match self.store.get(name).await {
                Ok(entry) => Some(entry.metadata),
                Err(PkvaultError::NotFound(_)) => None,
                Err(e) => return Err(PkvaultError::entry_op(name, "distribute", e)),
            }
        } else {
            if self.store.contains(name).await? {
                return Err(PkvaultError::AlreadyExists(name.to_string()));
            }
            None
        };

        let blobs = self
            .engine
            .encrypt_for(password.as_bytes(), &recipients)
            .map_err(|e| PkvaultError::entry_op(name, "distribute", e))?;

        let escrow = if options.escrow && !self.config.escrow_users.is_empty() {
            Some(
                self.build_escrow(password)
                    .map_err(|e| PkvaultError::entry_op(name, "distribute", e))?,
            )
        } else {
            None
        };

        let now = Utc::now();
        let mut entry = StoredEntry {
            metadata: EntryMetadata {
                name: name.to_string(),
                id: previous.as_ref().map(|m| m.id).unwrap_or_else(Uuid::new_v4),
                distributor: self.signer.identity().to_string(),
                created: previous.as_ref().map(|m| m.created).unwrap_or(now),
                updated: now,
                signature: None,
            },
            recipients: blobs,
            escrow,
        };

        let signature = self
            .signer
            .sign(&entry_digest(&entry))
            .await
            .map_err(|e| PkvaultError::entry_op(name, "distribute", e))?;
        entry.metadata.signature = Some(EntrySignature(signature));

        match self.store.put(&entry, options.overwrite).await {
            Ok(()) => {}
            Err(e @ PkvaultError::AlreadyExists(_)) => return Err(e),
            Err(e) => return Err(PkvaultError::entry_op(name, "distribute", e)),
        }

        info!(
            entry = %name,
            recipients = entry.recipients.len(),
            escrowed = entry.escrow.is_some(),
            "password distributed"
        );
        Ok(())
    }

    /// Generates a password from a rule and distributes it, returning the
    /// generated password.
    pub async fn distribute_generated(
        &self,
        name: &str,
        target: &Target,
        rule: Option<&str>,
        options: &DistributeOptions,
    ) -> Result<Zeroizing<String>> {
        let password = self.generator.generate(rule)?;
        self.distribute(name, target, &password, options).await?;
        Ok(password)
    }

    fn build_escrow(&self, password: &str) -> Result<EscrowBlock> {
        // A name listed twice holds one share; totals count distinct holders.
        let mut seen = std::collections::HashSet::new();
        let users: Vec<&String> = self
            .config
            .escrow_users
            .iter()
            .filter(|user| seen.insert(user.as_str()))
            .collect();

        let total = u8::try_from(users.len()).map_err(|_| {
            PkvaultError::Parameter(format!(
                "escrow group of {} exceeds the 255-share limit",
                users.len()
            ))
        })?;
        let threshold = self.config.min_escrow.unwrap_or(total / 2 + 1);

        let shares = self.escrow.split(password.as_bytes(), total, threshold)?;

        let mut wrapped = std::collections::HashMap::with_capacity(users.len());
        for (user, share) in users.into_iter().zip(shares) {
            let recipient = self.certs.resolve(user)?;
            let share_json = Zeroizing::new(serde_json::to_vec(&share)?);
            let mut blobs = self
                .engine
                .encrypt_for(&share_json, std::slice::from_ref(&recipient))?;
            let blob = blobs.remove(user).ok_or_else(|| {
                PkvaultError::Other(anyhow::anyhow!("missing escrow blob for '{}'", user))
            })?;
            wrapped.insert(user.clone(), blob);
        }

        debug!(total, threshold, "escrow shares produced");
        Ok(EscrowBlock {
            threshold,
            total,
            shares: wrapped,
        })
    }

    /// Retrieves and decrypts the password stored under `name` for the
    /// identity behind `provider`.
    ///
    /// When verification is enabled and the distributor's certificate is in
    /// the store, the entry signature is checked before decryption.
    ///
    /// # Errors
    ///
    /// - [`PkvaultError::NotFound`]: no such entry, or the identity is not
    ///   among its recipients
    /// - [`PkvaultError::EntryOperation`]: a failed signature check
    ///   (source [`PkvaultError::Integrity`]) or a decryption failure
    pub async fn retrieve(
        &self,
        name: &str,
        provider: &dyn KeyProvider,
    ) -> Result<Zeroizing<String>> {
        let entry = self.store.get(name).await?;

        if self.config.verify_on_retrieve {
            self.verify_entry(&entry)
                .map_err(|e| PkvaultError::entry_op(name, "verify", e))?;
        }

        let blob = entry.recipients.get(provider.identity()).ok_or_else(|| {
            PkvaultError::NotFound(format!(
                "entry '{}' was not distributed to '{}'",
                name,
                provider.identity()
            ))
        })?;

        let plaintext = self
            .engine
            .decrypt_with(blob, provider)
            .await
            .map_err(|e| PkvaultError::entry_op(name, "retrieve", e))?;

        bytes_to_password(plaintext)
            .map_err(|e| PkvaultError::entry_op(name, "retrieve", e))
    }

    fn verify_entry(&self, entry: &StoredEntry) -> Result<()> {
        let signature = entry.metadata.signature.as_ref().ok_or_else(|| {
            PkvaultError::Integrity(format!(
                "entry '{}' carries no distributor signature",
                entry.metadata.name
            ))
        })?;

        let certificate = match self.certs.resolve(&entry.metadata.distributor) {
            Ok(recipient) => recipient.certificate.clone(),
            Err(PkvaultError::NotFound(_)) => {
                // The distributor may have rotated out of the directory;
                // without their certificate the signature cannot be checked.
                warn!(
                    entry = %entry.metadata.name,
                    distributor = %entry.metadata.distributor,
                    "distributor certificate unavailable, skipping signature check"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        verify_entry_signature(entry, &certificate, &signature.0)
    }

    /// Recovers the password stored under `name` from escrow shares.
    ///
    /// Each provider must belong to one of the entry's escrow users; any
    /// `threshold` of them suffice.
    ///
    /// # Errors
    ///
    /// - [`PkvaultError::NotFound`]: no such entry, or no escrow material
    /// - [`PkvaultError::InsufficientShares`]: fewer usable shares than the
    ///   recovery threshold
    pub async fn recover(
        &self,
        name: &str,
        providers: &[&dyn KeyProvider],
    ) -> Result<Zeroizing<String>> {
        let entry = self.store.get(name).await?;
        let escrow = entry.escrow.as_ref().ok_or_else(|| {
            PkvaultError::NotFound(format!("entry '{}' has no escrow material", name))
        })?;

        let mut shares = Vec::with_capacity(providers.len());
        for provider in providers {
            let blob = escrow.shares.get(provider.identity()).ok_or_else(|| {
                PkvaultError::NotFound(format!(
                    "'{}' holds no escrow share of entry '{}'",
                    provider.identity(),
                    name
                ))
            })?;
            let share_json = self
                .engine
                .decrypt_with(blob, *provider)
                .await
                .map_err(|e| PkvaultError::entry_op(name, "recover", e))?;
            let share: EscrowShare = serde_json::from_slice(&share_json)
                .map_err(|e| PkvaultError::entry_op(name, "recover", e.into()))?;
            shares.push(share);
        }

        let secret = self.escrow.reconstruct(&shares)?;
        info!(entry = %name, shares = shares.len(), "password recovered from escrow");
        bytes_to_password(secret).map_err(|e| PkvaultError::entry_op(name, "recover", e))
    }

    /// Deletes the entry stored under `name`.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.store.delete(name).await
    }

    /// Lists stored entry names.
    pub async fn list(&self) -> Result<Vec<String>> {
        self.store.list().await
    }

    /// Renames a stored entry. The signature still covers the original
    /// name, so verification is re-keyed by re-signing the entry.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return Err(PkvaultError::AlreadyExists(to.to_string()));
        }

        // Hold both entry locks so a concurrent distribute(to) cannot race
        // the existence check. Lexicographic order avoids lock cycles.
        let (first, second) = if from < to { (from, to) } else { (to, from) };
        let lock_first = self.store.entry_lock(first);
        let lock_second = self.store.entry_lock(second);
        let _guard_first = lock_first.lock().await;
        let _guard_second = lock_second.lock().await;

        if self.store.contains(to).await? {
            return Err(PkvaultError::AlreadyExists(to.to_string()));
        }

        let mut entry = self.store.get(from).await?;
        entry.metadata.name = to.to_string();
        entry.metadata.updated = Utc::now();
        entry.metadata.distributor = self.signer.identity().to_string();
        entry.metadata.signature = None;

        let signature = self
            .signer
            .sign(&entry_digest(&entry))
            .await
            .map_err(|e| PkvaultError::entry_op(from, "rename", e))?;
        entry.metadata.signature = Some(EntrySignature(signature));

        self.store.put(&entry, false).await?;
        self.store.delete(from).await?;
        debug!(from = %from, to = %to, "entry renamed and re-signed");
        Ok(())
    }
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor")
            .field("identity", &self.signer.identity())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Canonical digest an entry signature covers.
///
/// Everything except the signature itself, with maps walked in sorted
/// order so the digest is independent of hash-map iteration order.
pub(crate) fn entry_digest(entry: &StoredEntry) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(ENTRY_SIGNING_LABEL);
    for field in [&entry.metadata.name, &entry.metadata.distributor] {
        hasher.update((field.len() as u32).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hasher.update(entry.metadata.id.as_bytes());

    let recipients: BTreeMap<_, _> = entry.recipients.iter().collect();
    for (name, blob) in recipients {
        hasher.update((name.len() as u32).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update([blob.version]);
        hasher.update(blob.recipient_fingerprint.as_bytes());
        hasher.update(&blob.ephemeral);
        hasher.update(&blob.wrap_nonce);
        hasher.update(&blob.wrapped_key);
        hasher.update(&blob.nonce);
        hasher.update(&blob.ciphertext);
    }

    if let Some(escrow) = &entry.escrow {
        hasher.update([escrow.threshold, escrow.total]);
        let shares: BTreeMap<_, _> = escrow.shares.iter().collect();
        for (name, blob) in shares {
            hasher.update((name.len() as u32).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update(&blob.wrapped_key);
            hasher.update(&blob.ciphertext);
        }
    }

    hasher.finalize().to_vec()
}

fn verify_entry_signature(
    entry: &StoredEntry,
    certificate: &Certificate,
    signature: &[u8],
) -> Result<()> {
    let key = VerifyingKey::from_bytes(&certificate.verifying_key)
        .map_err(|e| PkvaultError::Integrity(format!("bad distributor key: {}", e)))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| PkvaultError::Integrity(format!("malformed entry signature: {}", e)))?;

    key.verify(&entry_digest(entry), &signature).map_err(|_| {
        PkvaultError::Integrity(format!(
            "entry '{}' failed distributor signature verification",
            entry.metadata.name
        ))
    })
}

fn bytes_to_password(bytes: Zeroizing<Vec<u8>>) -> Result<Zeroizing<String>> {
    let text = std::str::from_utf8(&bytes)
        .map_err(|_| PkvaultError::Decrypt("password is not valid UTF-8".to_string()))?;
    Ok(Zeroizing::new(text.to_string()))
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::providers::mock::MockCa;
    use crate::providers::software::SoftwareKey;
    use std::collections::HashMap;

    fn store_of(ca: &MockCa, members: &[&str]) -> (CertificateStore, Vec<SoftwareKey>) {
        let mut recipients = Vec::new();
        let mut keys = Vec::new();
        for member in members {
            let (cert, key) = ca.issue(member);
            recipients.push(Recipient::new(cert));
            keys.push(key);
        }
        let mut groups = HashMap::new();
        groups.insert("team".to_string(), vec!["alice".to_string(), "bob".to_string()]);
        (
            CertificateStore::from_parts(ca.bundle(), recipients, groups),
            keys,
        )
    }

    #[test]
    fn test_digest_ignores_map_order() {
        let ca = MockCa::new("test-ca");
        let (certs, _keys) = store_of(&ca, &["alice", "bob", "carol"]);
        let engine = CryptoEngine::new();

        let recipients: Vec<_> = ["alice", "bob", "carol"]
            .iter()
            .map(|n| certs.resolve(n).unwrap())
            .collect();
        let blobs = engine.encrypt_for(b"secret", &recipients).unwrap();

        let entry = StoredEntry {
            metadata: EntryMetadata {
                name: "web".to_string(),
                id: Uuid::new_v4(),
                distributor: "alice".to_string(),
                created: Utc::now(),
                updated: Utc::now(),
                signature: None,
            },
            recipients: blobs.clone(),
            escrow: None,
        };

        // Rebuild the map with a different insertion order.
        let mut reordered = HashMap::new();
        for name in ["carol", "alice", "bob"] {
            reordered.insert(name.to_string(), blobs[name].clone());
        }
        let shuffled = StoredEntry {
            recipients: reordered,
            ..entry.clone()
        };

        assert_eq!(entry_digest(&entry), entry_digest(&shuffled));
    }

    #[test]
    fn test_digest_covers_ciphertext() {
        let ca = MockCa::new("test-ca");
        let (certs, _keys) = store_of(&ca, &["alice"]);
        let engine = CryptoEngine::new();

        let recipients = vec![certs.resolve("alice").unwrap()];
        let blobs = engine.encrypt_for(b"secret", &recipients).unwrap();

        let mut entry = StoredEntry {
            metadata: EntryMetadata {
                name: "web".to_string(),
                id: Uuid::new_v4(),
                distributor: "alice".to_string(),
                created: Utc::now(),
                updated: Utc::now(),
                signature: None,
            },
            recipients: blobs,
            escrow: None,
        };

        let before = entry_digest(&entry);
        entry.recipients.get_mut("alice").unwrap().ciphertext[0] ^= 0x01;
        assert_ne!(before, entry_digest(&entry));
    }
}
