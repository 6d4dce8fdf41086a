//! Configuration types for engine initialization.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// How card-slot acquisition behaves when the slot is already held.
///
/// Only one session may hold a card slot at a time process-wide; this
/// controls what happens to the second caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardWait {
    /// Wait for the slot to become free, up to the given timeout.
    Block(Duration),
    /// Fail immediately with `KeyUnavailable` if the slot is held.
    FailFast,
}

impl Default for CardWait {
    fn default() -> Self {
        Self::Block(Duration::from_secs(10))
    }
}

/// Configuration for the pkvault engine.
///
/// Constructed explicitly and passed into each component's constructor so
/// multiple configurations can coexist (e.g., in tests); there is no
/// process-wide mutable state.
///
/// Use the builder pattern for ergonomic configuration:
///
/// ```no_run
/// use pkvault::Config;
///
/// let config = Config::new("alice")
///     .with_cert_dir("./certs")
///     .with_key_dir("./private")
///     .with_trust_bundle("./certs/ca-bundle")
///     .with_store_path("./passwords")
///     .with_group("dba", ["alice", "bob"])
///     .with_escrow_users(["carol", "dave", "erin"], 2)
///     .with_rule("default", "[a-zA-Z0-9]{24}");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Active identity name (the local user)
    pub identity: String,

    /// Trust anchor bundle path
    pub trust_bundle: PathBuf,

    /// Directory of recipient certificates (`*.cert` / `*.crt`)
    pub cert_dir: PathBuf,

    /// Directory of private key files (`*.key`)
    pub key_dir: PathBuf,

    /// Password store directory
    pub store_path: PathBuf,

    /// Card slot index for hardware keys (default: 0)
    pub card_slot: usize,

    /// Card-slot acquisition behavior (default: block 10s)
    pub card_wait: CardWait,

    /// Clipboard retention duration. Held for UI collaborators; the core
    /// never interprets it.
    pub clipboard_ttl: Duration,

    /// Escrow user identities (empty disables escrow)
    pub escrow_users: Vec<String>,

    /// Minimum shares required for escrow recovery
    pub min_escrow: Option<u8>,

    /// Maximum escrow group size (hard ceiling 255, the GF(256) point limit)
    pub max_escrow_shares: u8,

    /// Named generation rules (regex patterns)
    pub rules: HashMap<String, String>,

    /// Rule used when no name is given (default: "default")
    pub default_rule: String,

    /// Maximum length of a generated password
    pub max_generated_len: usize,

    /// Named recipient groups
    pub groups: HashMap<String, Vec<String>>,

    /// Named connector option blocks, passed through untouched to
    /// certificate-fetcher implementations
    pub connectors: HashMap<String, HashMap<String, String>>,

    /// Verify the distributor's entry signature on retrieve (default: true)
    pub verify_on_retrieve: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: whoami(),
            trust_bundle: PathBuf::from("./certs/ca-bundle"),
            cert_dir: PathBuf::from("./certs"),
            key_dir: PathBuf::from("./private"),
            store_path: PathBuf::from("./passwords"),
            card_slot: 0,
            card_wait: CardWait::default(),
            clipboard_ttl: Duration::from_secs(10),
            escrow_users: Vec::new(),
            min_escrow: None,
            max_escrow_shares: 255,
            rules: HashMap::new(),
            default_rule: "default".to_string(),
            max_generated_len: 256,
            groups: HashMap::new(),
            connectors: HashMap::new(),
            verify_on_retrieve: true,
        }
    }
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

impl Config {
    /// Creates a new configuration for the given identity.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Default::default()
        }
    }

    /// Sets the trust anchor bundle path.
    pub fn with_trust_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust_bundle = path.into();
        self
    }

    /// Sets the certificate directory.
    pub fn with_cert_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_dir = path.into();
        self
    }

    /// Sets the private key directory.
    pub fn with_key_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_dir = path.into();
        self
    }

    /// Sets the password store directory.
    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    /// Sets the card slot index for hardware keys.
    pub fn with_card_slot(mut self, slot: usize) -> Self {
        self.card_slot = slot;
        self
    }

    /// Sets the card-slot acquisition behavior.
    pub fn with_card_wait(mut self, wait: CardWait) -> Self {
        self.card_wait = wait;
        self
    }

    /// Sets the clipboard retention duration (opaque to the core).
    pub fn with_clipboard_ttl(mut self, ttl: Duration) -> Self {
        self.clipboard_ttl = ttl;
        self
    }

    /// Sets the escrow users and minimum recovery threshold.
    pub fn with_escrow_users<I, S>(mut self, users: I, min: u8) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.escrow_users = users.into_iter().map(Into::into).collect();
        self.min_escrow = Some(min);
        self
    }

    /// Adds a named generation rule.
    ///
    /// The rule named `"default"` (or whatever [`with_default_rule`]
    /// selects) is used when generation is requested without a rule name.
    ///
    /// [`with_default_rule`]: Config::with_default_rule
    pub fn with_rule(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.rules.insert(name.into(), pattern.into());
        self
    }

    /// Selects which named rule is the default.
    pub fn with_default_rule(mut self, name: impl Into<String>) -> Self {
        self.default_rule = name.into();
        self
    }

    /// Adds a named recipient group.
    pub fn with_group<I, S>(mut self, name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups
            .insert(name.into(), members.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a named connector option block.
    ///
    /// The options are opaque to the core; they are handed untouched to the
    /// registered [`CertificateFetcher`](crate::connector::CertificateFetcher)
    /// of the same name.
    pub fn with_connector(
        mut self,
        name: impl Into<String>,
        options: HashMap<String, String>,
    ) -> Self {
        self.connectors.insert(name.into(), options);
        self
    }

    /// Disables entry-signature verification on retrieve.
    pub fn without_verification(mut self) -> Self {
        self.verify_on_retrieve = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = Config::new("alice")
            .with_card_slot(2)
            .with_group("dba", ["alice", "bob"])
            .with_escrow_users(["carol", "dave"], 2)
            .with_rule("pin", "[0-9]{6}");

        assert_eq!(config.identity, "alice");
        assert_eq!(config.card_slot, 2);
        assert_eq!(config.groups["dba"], vec!["alice", "bob"]);
        assert_eq!(config.escrow_users, vec!["carol", "dave"]);
        assert_eq!(config.min_escrow, Some(2));
        assert_eq!(config.rules["pin"], "[0-9]{6}");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.card_slot, 0);
        assert_eq!(config.default_rule, "default");
        assert_eq!(config.max_escrow_shares, 255);
        assert!(config.verify_on_retrieve);
        assert!(config.escrow_users.is_empty());
    }

    #[test]
    fn test_card_wait_default() {
        assert_eq!(
            CardWait::default(),
            CardWait::Block(Duration::from_secs(10))
        );
    }
}
