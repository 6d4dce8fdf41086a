//! On-disk password store.
//!
//! One JSON document per entry, named `<entry>.json` under the store root.
//! Writes go to a temporary file in the same directory and are renamed into
//! place, so a crash mid-write never leaves a truncated entry. The store
//! directory is created with mode 0700 and entry files with mode 0600.

use crate::envelope::EnvelopeBlob;
use crate::validation::validate_entry_name;
use crate::{PkvaultError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Entry bookkeeping: who distributed it, when, and the distributor's
/// signature over the entry digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryMetadata {
    pub name: String,
    pub id: Uuid,
    pub distributor: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Ed25519 signature by the distributor over the entry digest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<EntrySignature>,
}

/// Hex-encoded signature bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct EntrySignature(#[serde(with = "crate::identity::hex_bytes")] pub Vec<u8>);

/// Escrow material stored alongside an entry: each share wrapped to one
/// escrow user, recoverable by any `threshold` of them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscrowBlock {
    pub threshold: u8,
    pub total: u8,
    /// Escrow user name to that user's wrapped share
    pub shares: HashMap<String, EnvelopeBlob>,
}

/// A stored entry: the password wrapped to every recipient, plus optional
/// escrow material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEntry {
    pub metadata: EntryMetadata,
    /// Recipient name to that recipient's envelope
    pub recipients: HashMap<String, EnvelopeBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escrow: Option<EscrowBlock>,
}

/// Directory-backed entry storage with atomic writes.
pub struct PasswordStore {
    root: PathBuf,
    // Per-entry write locks so concurrent distributions of the same entry
    // serialize instead of interleaving read-modify-write.
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PasswordStore {
    /// Opens (creating if needed) the store at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&root).await?.permissions();
            perms.set_mode(0o700);
            tokio::fs::set_permissions(&root, perms).await?;
        }

        Ok(Self {
            root,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    /// Returns the write lock for one entry name.
    pub(crate) fn entry_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("entry lock registry poisoned");
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", name))
    }

    /// Writes an entry atomically.
    ///
    /// # Errors
    ///
    /// - [`PkvaultError::InvalidName`]: the entry name is not storable
    /// - [`PkvaultError::AlreadyExists`]: entry exists and `overwrite` is false
    pub async fn put(&self, entry: &StoredEntry, overwrite: bool) -> Result<()> {
        validate_entry_name(&entry.metadata.name)?;
        let path = self.entry_path(&entry.metadata.name);

        if !overwrite && path_exists(&path).await {
            return Err(PkvaultError::AlreadyExists(entry.metadata.name.clone()));
        }

        let json = serde_json::to_vec_pretty(entry)?;
        let tmp = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, &json).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&tmp).await?.permissions();
            perms.set_mode(0o600);
            tokio::fs::set_permissions(&tmp, perms).await?;
        }

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(entry = %entry.metadata.name, "entry written");
        Ok(())
    }

    /// Reads an entry.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::NotFound`] if no entry by that name exists,
    /// or [`PkvaultError::Integrity`] if the file does not parse.
    pub async fn get(&self, name: &str) -> Result<StoredEntry> {
        validate_entry_name(name)?;
        let path = self.entry_path(name);

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PkvaultError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&data).map_err(|e| {
            PkvaultError::Integrity(format!("entry '{}' does not parse: {}", name, e))
        })
    }

    /// Reads one recipient's blob out of an entry.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::NotFound`] naming the entry if it does not
    /// exist, or naming the recipient if the entry was not distributed to
    /// them.
    pub async fn get_blob(&self, name: &str, recipient: &str) -> Result<EnvelopeBlob> {
        let entry = self.get(name).await?;
        entry.recipients.get(recipient).cloned().ok_or_else(|| {
            PkvaultError::NotFound(format!(
                "entry '{}' was not distributed to '{}'",
                name, recipient
            ))
        })
    }

    /// Checks whether an entry exists.
    pub async fn contains(&self, name: &str) -> Result<bool> {
        validate_entry_name(name)?;
        Ok(path_exists(&self.entry_path(name)).await)
    }

    /// Deletes an entry.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::NotFound`] if no entry by that name exists.
    pub async fn delete(&self, name: &str) -> Result<()> {
        validate_entry_name(name)?;
        let path = self.entry_path(name);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(entry = %name, "entry deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PkvaultError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lists entry names, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Renames an entry, updating its stored name to match.
    ///
    /// # Errors
    ///
    /// - [`PkvaultError::NotFound`]: no entry named `from`
    /// - [`PkvaultError::AlreadyExists`]: an entry named `to` exists
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        validate_entry_name(from)?;
        validate_entry_name(to)?;
        if from == to {
            return Err(PkvaultError::AlreadyExists(to.to_string()));
        }

        // Both names are locked, in lexicographic order, so a concurrent
        // writer of `to` cannot slip between the existence check and the
        // final rename.
        let (first, second) = if from < to { (from, to) } else { (to, from) };
        let lock_first = self.entry_lock(first);
        let lock_second = self.entry_lock(second);
        let _guard_first = lock_first.lock().await;
        let _guard_second = lock_second.lock().await;

        if path_exists(&self.entry_path(to)).await {
            return Err(PkvaultError::AlreadyExists(to.to_string()));
        }

        let mut entry = self.get(from).await?;
        entry.metadata.name = to.to_string();
        entry.metadata.updated = Utc::now();

        self.put(&entry, false).await?;
        tokio::fs::remove_file(self.entry_path(from)).await?;
        debug!(from = %from, to = %to, "entry renamed");
        Ok(())
    }
}

impl std::fmt::Debug for PasswordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(name: &str) -> StoredEntry {
        StoredEntry {
            metadata: EntryMetadata {
                name: name.to_string(),
                id: Uuid::new_v4(),
                distributor: "alice".to_string(),
                created: Utc::now(),
                updated: Utc::now(),
                signature: None,
            },
            recipients: HashMap::new(),
            escrow: None,
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = PasswordStore::open(dir.path().join("passwords"))
            .await
            .unwrap();

        let original = entry("prod-db");
        store.put(&original, false).await.unwrap();

        let loaded = store.get("prod-db").await.unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn test_overwrite_protection() {
        let dir = tempdir().unwrap();
        let store = PasswordStore::open(dir.path()).await.unwrap();

        store.put(&entry("web"), false).await.unwrap();
        let err = store.put(&entry("web"), false).await.unwrap_err();
        assert!(matches!(err, PkvaultError::AlreadyExists(_)));

        // Explicit overwrite succeeds.
        store.put(&entry("web"), true).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_blob_distinguishes_missing_recipient() {
        let dir = tempdir().unwrap();
        let store = PasswordStore::open(dir.path()).await.unwrap();

        let mut stored = entry("web");
        stored.recipients.insert(
            "alice".to_string(),
            EnvelopeBlob {
                version: 1,
                recipient: "alice".to_string(),
                recipient_fingerprint: "00".repeat(32),
                ephemeral: [0u8; 32],
                wrap_nonce: vec![0u8; 12],
                wrapped_key: vec![0u8; 48],
                nonce: vec![0u8; 12],
                ciphertext: vec![0u8; 32],
            },
        );
        store.put(&stored, false).await.unwrap();

        assert!(store.get_blob("web", "alice").await.is_ok());

        let err = store.get_blob("web", "bob").await.unwrap_err();
        assert!(matches!(err, PkvaultError::NotFound(_)));
        assert!(err.to_string().contains("bob"));

        let err = store.get_blob("nothing", "alice").await.unwrap_err();
        assert!(matches!(err, PkvaultError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_get_missing_entry() {
        let dir = tempdir().unwrap();
        let store = PasswordStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.get("nothing").await,
            Err(PkvaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempdir().unwrap();
        let store = PasswordStore::open(dir.path()).await.unwrap();

        store.put(&entry("web"), false).await.unwrap();
        store.delete("web").await.unwrap();
        assert!(matches!(
            store.delete("web").await,
            Err(PkvaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let dir = tempdir().unwrap();
        let store = PasswordStore::open(dir.path()).await.unwrap();

        for name in ["zebra", "apple", "mango"] {
            store.put(&entry(name), false).await.unwrap();
        }
        assert_eq!(store.list().await.unwrap(), vec!["apple", "mango", "zebra"]);
    }

    #[tokio::test]
    async fn test_rename() {
        let dir = tempdir().unwrap();
        let store = PasswordStore::open(dir.path()).await.unwrap();

        store.put(&entry("old"), false).await.unwrap();
        store.rename("old", "new").await.unwrap();

        let renamed = store.get("new").await.unwrap();
        assert_eq!(renamed.metadata.name, "new");
        assert!(matches!(
            store.get("old").await,
            Err(PkvaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_onto_existing_fails() {
        let dir = tempdir().unwrap();
        let store = PasswordStore::open(dir.path()).await.unwrap();

        store.put(&entry("a"), false).await.unwrap();
        store.put(&entry("b"), false).await.unwrap();
        let err = store.rename("a", "b").await.unwrap_err();
        assert!(matches!(err, PkvaultError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_rename_to_same_name_fails() {
        let dir = tempdir().unwrap();
        let store = PasswordStore::open(dir.path()).await.unwrap();

        store.put(&entry("web"), false).await.unwrap();
        let err = store.rename("web", "web").await.unwrap_err();
        assert!(matches!(err, PkvaultError::AlreadyExists(_)));
        assert!(store.get("web").await.is_ok());
    }

    #[tokio::test]
    async fn test_hidden_name_rejected() {
        let dir = tempdir().unwrap();
        let store = PasswordStore::open(dir.path()).await.unwrap();

        // A leading dot would collide with the temp-file filter in list()
        // and make the entry unenumerable; it must never be storable.
        let err = store.put(&entry(".hidden"), false).await.unwrap_err();
        assert!(matches!(err, PkvaultError::InvalidName(_)));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let dir = tempdir().unwrap();
        let store = PasswordStore::open(dir.path()).await.unwrap();
        assert!(matches!(
            store.get("../escape").await,
            Err(PkvaultError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_garbled_entry_is_integrity_error() {
        let dir = tempdir().unwrap();
        let store = PasswordStore::open(dir.path()).await.unwrap();

        tokio::fs::write(dir.path().join("web.json"), b"not json")
            .await
            .unwrap();
        assert!(matches!(
            store.get("web").await,
            Err(PkvaultError::Integrity(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let root = dir.path().join("passwords");
        let store = PasswordStore::open(&root).await.unwrap();
        store.put(&entry("web"), false).await.unwrap();

        let dir_mode = tokio::fs::metadata(&root).await.unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let file_mode = tokio::fs::metadata(root.join("web.json"))
            .await
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }
}
