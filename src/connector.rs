//! Certificate fetcher registry.
//!
//! A fetcher pulls recipient certificates from an external directory
//! service (LDAP, an HTTP endpoint, a shared filesystem). Implementations
//! register a factory by name; configuration selects fetchers by the same
//! name and hands them an opaque option block.

use crate::identity::Certificate;
use crate::{PkvaultError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

/// A source of recipient certificates outside the local certificate
/// directory.
#[async_trait]
pub trait CertificateFetcher: Send + Sync {
    /// Returns the fetcher name (matches its registration name).
    fn name(&self) -> &str;

    /// Fetches every certificate the source currently publishes.
    ///
    /// # Errors
    ///
    /// Returns [`PkvaultError::Trust`] if the source cannot be reached or
    /// returns malformed data.
    async fn list_certificates(&self) -> Result<Vec<Certificate>>;
}

/// Factory function type for creating fetchers.
pub type FetcherFactory = fn(HashMap<String, String>) -> Result<Box<dyn CertificateFetcher>>;

static FETCHER_REGISTRY: OnceLock<RwLock<HashMap<String, FetcherFactory>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, FetcherFactory>> {
    FETCHER_REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Registers a fetcher factory function.
///
/// Typically called from fetcher modules' `register()` functions during
/// library initialization.
pub fn register_fetcher(name: &str, factory: FetcherFactory) {
    let mut reg = registry().write().unwrap();
    reg.insert(name.to_string(), factory);
}

/// Creates a fetcher by registered name.
///
/// The option block comes from the `connectors` section of the
/// configuration and is passed through untouched.
///
/// # Errors
///
/// Returns an error if no fetcher is registered under `name` or the
/// factory fails to initialize.
pub fn new_fetcher(
    name: &str,
    options: HashMap<String, String>,
) -> Result<Box<dyn CertificateFetcher>> {
    let reg = registry().read().unwrap();
    let factory = reg.get(name).ok_or_else(|| {
        PkvaultError::Other(anyhow::anyhow!(
            "unknown certificate fetcher: {} (no register() call for it?)",
            name
        ))
    })?;

    factory(options)
}
