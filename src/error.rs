//! Error types for pkvault operations.

use thiserror::Error;

/// Result type alias using [`PkvaultError`].
pub type Result<T> = std::result::Result<T, PkvaultError>;

/// Errors that can occur during password distribution, retrieval, and recovery.
///
/// All errors implement `std::error::Error` and can be chained with `source()`.
/// Cryptographic failures ([`Integrity`](PkvaultError::Integrity),
/// [`Decrypt`](PkvaultError::Decrypt)) are always surfaced distinctly from
/// [`NotFound`](PkvaultError::NotFound) so callers can tell "no such password"
/// apart from "password exists but is corrupted or tampered".
#[derive(Debug, Error)]
pub enum PkvaultError {
    /// Certificate chain validation failed (bad signature, unknown issuer,
    /// or outside the validity window). Fatal; nothing is written.
    #[error("certificate not trusted: {0}")]
    Trust(String),

    /// Private key is unavailable: hardware token absent, locked, or the
    /// card slot is held by another session. Retryable after user action.
    #[error("key unavailable: {0}")]
    KeyUnavailable(String),

    /// Cryptographic input is malformed (wrong lengths, unknown version).
    #[error("decrypt failed: {0}")]
    Decrypt(String),

    /// Authentication tag did not verify: tampered data or wrong key.
    /// Fatal for that blob only; other recipients' blobs are unaffected.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Invalid escrow parameters (K < 1, K > N, N over the maximum).
    #[error("invalid escrow parameters: {0}")]
    Parameter(String),

    /// Too few distinct shares were supplied to reach the threshold.
    #[error("insufficient shares: have {have}, need {need}")]
    InsufficientShares {
        /// Distinct shares supplied
        have: usize,
        /// Recovery threshold K
        need: u8,
    },

    /// Shares carry mismatched (N, K) metadata, duplicate indices, or a
    /// failed checksum. No partial reconstruction is ever returned.
    #[error("inconsistent shares: {0}")]
    InconsistentShares(String),

    /// Generation rule is unsatisfiable or uses unsupported constructs.
    #[error("invalid generation pattern: {0}")]
    Pattern(String),

    /// Named generation rule is absent and no "default" rule exists.
    #[error("unknown generation rule: {0}")]
    UnknownPattern(String),

    /// Entry, recipient, or group was not found. Never implicitly created.
    #[error("not found: {0}")]
    NotFound(String),

    /// Entry already exists (put without overwrite).
    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    /// Entry or identity name contains invalid characters.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Operation on a password entry failed with context.
    #[error("{entry}: {operation}: {source}")]
    EntryOperation {
        /// Entry name
        entry: String,
        /// Operation name (distribute, retrieve, recover, delete)
        operation: String,
        /// Underlying error
        #[source]
        source: Box<PkvaultError>,
    },

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error (catch-all).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PkvaultError {
    /// Creates an entry operation error with context.
    ///
    /// This wraps an underlying error with the entry and operation that
    /// caused the failure.
    ///
    /// # Example
    ///
    /// ```
    /// use pkvault::PkvaultError;
    ///
    /// let err = PkvaultError::NotFound("db-admin".to_string());
    /// let wrapped = PkvaultError::entry_op("db-admin", "retrieve", err);
    ///
    /// assert_eq!(
    ///     wrapped.to_string(),
    ///     "db-admin: retrieve: not found: db-admin"
    /// );
    /// ```
    pub fn entry_op(
        entry: impl Into<String>,
        operation: impl Into<String>,
        err: PkvaultError,
    ) -> Self {
        Self::EntryOperation {
            entry: entry.into(),
            operation: operation.into(),
            source: Box::new(err),
        }
    }
}
