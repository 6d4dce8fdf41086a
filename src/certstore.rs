//! In-memory certificate store.
//!
//! Loads the trust bundle and every certificate in the certificate
//! directory, verifies each against the bundle, and resolves recipient
//! names and named groups for distribution. Certificates that do not chain
//! to a trust anchor never enter the store.

use crate::config::Config;
use crate::connector::CertificateFetcher;
use crate::identity::{Certificate, Recipient, TrustBundle};
use crate::{PkvaultError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Verified recipient certificates, indexed by subject name.
pub struct CertificateStore {
    recipients: HashMap<String, Arc<Recipient>>,
    groups: HashMap<String, Vec<String>>,
    bundle: TrustBundle,
}

impl CertificateStore {
    /// Loads the trust bundle and certificate directory from the
    /// configuration.
    ///
    /// Files with a `.cert` or `.crt` extension are parsed as certificates;
    /// other files are ignored. Every certificate must verify against the
    /// bundle.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::Trust`] if the bundle cannot be loaded, a
    /// certificate file is malformed, or a certificate fails verification.
    pub async fn load(config: &Config) -> Result<Self> {
        let bundle = TrustBundle::load(&config.trust_bundle).await?;
        let now = Utc::now();

        let mut recipients = HashMap::new();
        let mut entries = tokio::fs::read_dir(&config.cert_dir).await.map_err(|e| {
            PkvaultError::Trust(format!(
                "cannot read certificate directory {}: {}",
                config.cert_dir.display(),
                e
            ))
        })?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if !matches!(ext, Some("cert") | Some("crt")) {
                continue;
            }

            let data = tokio::fs::read(&path).await?;
            let cert: Certificate = serde_json::from_slice(&data).map_err(|e| {
                PkvaultError::Trust(format!(
                    "malformed certificate {}: {}",
                    path.display(),
                    e
                ))
            })?;
            bundle.verify(&cert, now).map_err(|e| {
                PkvaultError::Trust(format!("{}: {}", path.display(), e))
            })?;

            if recipients.contains_key(&cert.subject) {
                return Err(PkvaultError::Trust(format!(
                    "duplicate certificate for '{}' at {}",
                    cert.subject,
                    path.display()
                )));
            }
            debug!(subject = %cert.subject, fingerprint = %cert.fingerprint(), "loaded certificate");
            recipients.insert(cert.subject.clone(), Arc::new(Recipient::new(cert)));
        }

        Ok(Self {
            recipients,
            groups: config.groups.clone(),
            bundle,
        })
    }

    /// Builds a store directly from verified parts. Intended for tests and
    /// embedders that manage certificates themselves.
    pub fn from_parts(
        bundle: TrustBundle,
        recipients: impl IntoIterator<Item = Recipient>,
        groups: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            recipients: recipients
                .into_iter()
                .map(|r| (r.name.clone(), Arc::new(r)))
                .collect(),
            groups,
            bundle,
        }
    }

    /// Resolves a single recipient by name.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::NotFound`] if no verified certificate exists
    /// for `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<Recipient>> {
        self.recipients.get(name).cloned().ok_or_else(|| {
            PkvaultError::NotFound(format!("no certificate for recipient '{}'", name))
        })
    }

    /// Resolves a named group to its member recipients, deduplicated and in
    /// member order.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::NotFound`] if the group is unknown or any
    /// member lacks a verified certificate.
    pub fn resolve_group(&self, group: &str) -> Result<Vec<Arc<Recipient>>> {
        let members = self
            .groups
            .get(group)
            .ok_or_else(|| PkvaultError::NotFound(format!("no group named '{}'", group)))?;

        let mut seen = std::collections::HashSet::new();
        let mut recipients = Vec::with_capacity(members.len());
        for member in members {
            if seen.insert(member.as_str()) {
                recipients.push(self.resolve(member)?);
            }
        }
        Ok(recipients)
    }

    /// Resolves an explicit list of recipient names, deduplicated.
    pub fn resolve_all(&self, names: &[String]) -> Result<Vec<Arc<Recipient>>> {
        let mut seen = std::collections::HashSet::new();
        let mut recipients = Vec::with_capacity(names.len());
        for name in names {
            if seen.insert(name.as_str()) {
                recipients.push(self.resolve(name)?);
            }
        }
        Ok(recipients)
    }

    /// Pulls certificates from a fetcher and merges the ones that verify.
    ///
    /// Certificates failing verification are skipped with a warning; a
    /// fetched certificate replaces any existing one for the same subject.
    /// Returns the number merged.
    pub async fn merge_fetched(&mut self, fetcher: &dyn CertificateFetcher) -> Result<usize> {
        let now = Utc::now();
        let mut merged = 0;
        for cert in fetcher.list_certificates().await? {
            match self.bundle.verify(&cert, now) {
                Ok(()) => {
                    debug!(
                        subject = %cert.subject,
                        source = fetcher.name(),
                        "merged fetched certificate"
                    );
                    self.recipients
                        .insert(cert.subject.clone(), Arc::new(Recipient::new(cert)));
                    merged += 1;
                }
                Err(e) => {
                    warn!(
                        subject = %cert.subject,
                        source = fetcher.name(),
                        error = %e,
                        "skipping fetched certificate"
                    );
                }
            }
        }
        Ok(merged)
    }

    /// The trust bundle backing this store.
    pub fn bundle(&self) -> &TrustBundle {
        &self.bundle
    }

    /// Names of all loaded recipients.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.recipients.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("recipients", &self.recipients.keys().collect::<Vec<_>>())
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::providers::mock::MockCa;
    use async_trait::async_trait;
    use tempfile::tempdir;

    async fn store_with(members: &[&str]) -> (MockCa, CertificateStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let cert_dir = dir.path().join("certs");
        tokio::fs::create_dir(&cert_dir).await.unwrap();

        let ca = MockCa::new("test-ca");
        let bundle_path = cert_dir.join("ca-bundle");
        ca.write_bundle(&bundle_path).await.unwrap();
        for member in members {
            let (cert, _key) = ca.issue(member);
            MockCa::write_certificate(&cert_dir, &cert).await.unwrap();
        }

        let config = Config::new("alice")
            .with_trust_bundle(&bundle_path)
            .with_cert_dir(&cert_dir)
            .with_group("dba", ["alice", "bob"]);
        let store = CertificateStore::load(&config).await.unwrap();
        (ca, store, dir)
    }

    #[tokio::test]
    async fn test_load_and_resolve() {
        let (_ca, store, _dir) = store_with(&["alice", "bob"]).await;
        assert_eq!(store.len(), 2);

        let alice = store.resolve("alice").unwrap();
        assert_eq!(alice.name, "alice");
        assert!(matches!(
            store.resolve("mallory"),
            Err(PkvaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_group() {
        let (_ca, store, _dir) = store_with(&["alice", "bob"]).await;

        let dba = store.resolve_group("dba").unwrap();
        assert_eq!(dba.len(), 2);
        assert_eq!(dba[0].name, "alice");
        assert_eq!(dba[1].name, "bob");

        assert!(matches!(
            store.resolve_group("nobody"),
            Err(PkvaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_group_with_missing_member() {
        let (_ca, store, _dir) = store_with(&["alice"]).await;
        // "bob" is in the group but has no certificate on disk.
        assert!(matches!(
            store.resolve_group("dba"),
            Err(PkvaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_untrusted_certificate_rejected_at_load() {
        let dir = tempdir().unwrap();
        let cert_dir = dir.path().join("certs");
        tokio::fs::create_dir(&cert_dir).await.unwrap();

        let ca = MockCa::new("test-ca");
        let bundle_path = cert_dir.join("ca-bundle");
        ca.write_bundle(&bundle_path).await.unwrap();

        // Signed by an authority the bundle does not contain.
        let rogue = MockCa::new("rogue-ca");
        let (cert, _key) = rogue.issue("mallory");
        MockCa::write_certificate(&cert_dir, &cert).await.unwrap();

        let config = Config::new("alice")
            .with_trust_bundle(&bundle_path)
            .with_cert_dir(&cert_dir);
        let result = CertificateStore::load(&config).await;
        assert!(matches!(result, Err(PkvaultError::Trust(_))));
    }

    struct StaticFetcher {
        certs: Vec<Certificate>,
    }

    #[async_trait]
    impl CertificateFetcher for StaticFetcher {
        fn name(&self) -> &str {
            "static"
        }

        async fn list_certificates(&self) -> Result<Vec<Certificate>> {
            Ok(self.certs.clone())
        }
    }

    #[tokio::test]
    async fn test_merge_fetched_filters_untrusted() {
        let (ca, mut store, _dir) = store_with(&["alice"]).await;

        let (good, _key) = ca.issue("carol");
        let rogue = MockCa::new("rogue-ca");
        let (bad, _key) = rogue.issue("mallory");

        let fetcher = StaticFetcher {
            certs: vec![good, bad],
        };
        let merged = store.merge_fetched(&fetcher).await.unwrap();
        assert_eq!(merged, 1);
        assert!(store.resolve("carol").is_ok());
        assert!(store.resolve("mallory").is_err());
    }
}
