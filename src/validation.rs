//! Input validation for entry and identity names.
//!
//! Names become filenames inside the password store, so validation guards
//! against path traversal and characters that break per-entry files.

use crate::{PkvaultError, Result};

/// Characters that would break or escape store filenames.
const FORBIDDEN_CHARS: &str = "/\\:*?\"<>|";

/// Maximum allowed length for entry/identity names.
const MAX_NAME_LENGTH: usize = 255;

/// Validates a password entry name.
///
/// Checks for:
/// - Empty names
/// - Excessive length (>255 characters)
/// - Null bytes and control characters
/// - Path separators and other filename-hostile characters
/// - Leading `.` (path components, hidden files)
///
/// # Errors
///
/// Returns [`PkvaultError::InvalidName`] if validation fails.
///
/// # Example
///
/// ```
/// use pkvault::validation::validate_entry_name;
///
/// assert!(validate_entry_name("db-admin").is_ok());
/// assert!(validate_entry_name("prod.database.password").is_ok());
///
/// assert!(validate_entry_name("").is_err());
/// assert!(validate_entry_name("../escape").is_err());
/// assert!(validate_entry_name("a/b").is_err());
/// assert!(validate_entry_name(".hidden").is_err());
/// ```
pub fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PkvaultError::InvalidName(
            "name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_NAME_LENGTH {
        return Err(PkvaultError::InvalidName(format!(
            "name exceeds maximum length of {} characters",
            MAX_NAME_LENGTH
        )));
    }

    if name.contains('\0') {
        return Err(PkvaultError::InvalidName(
            "name contains null byte".to_string(),
        ));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(PkvaultError::InvalidName(
            "name contains control characters".to_string(),
        ));
    }

    if name.chars().any(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(PkvaultError::InvalidName(format!(
            "name contains forbidden characters (not allowed: {})",
            FORBIDDEN_CHARS
        )));
    }

    // Leading dots cover `.`/`..` and would also collide with the store's
    // hidden temp files, making the entry invisible to listing.
    if name.starts_with('.') {
        return Err(PkvaultError::InvalidName(
            "name cannot start with '.'".to_string(),
        ));
    }

    Ok(())
}

/// Validates a recipient/identity name.
///
/// Uses the same rules as [`validate_entry_name`]; identity names also
/// become key and certificate filenames.
pub fn validate_identity_name(name: &str) -> Result<()> {
    validate_entry_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(validate_entry_name("db-admin").is_ok());
        assert!(validate_entry_name("API_KEY_123").is_ok());
        assert!(validate_entry_name("prod.database.password").is_ok());
        assert!(validate_entry_name("user@example.com").is_ok());
    }

    #[test]
    fn test_empty_name() {
        let result = validate_entry_name("");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn test_too_long() {
        let long_name = "a".repeat(256);
        let result = validate_entry_name(&long_name);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("maximum length"));
    }

    #[test]
    fn test_null_byte() {
        let result = validate_entry_name("name\0with\0nulls");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("null byte"));
    }

    #[test]
    fn test_traversal_attempts() {
        let hostile_names = vec![
            "../escape",
            "a/b",
            "a\\b",
            "..",
            ".",
            ".hidden",
            ".web.json",
            "name:colon",
            "name*wildcard",
            "name?question",
            "name<angle>",
            "name|pipe",
        ];

        for name in hostile_names {
            assert!(
                validate_entry_name(name).is_err(),
                "Expected '{}' to fail validation",
                name
            );
        }
    }

    #[test]
    fn test_identity_name_validation() {
        assert!(validate_identity_name("alice").is_ok());
        assert!(validate_identity_name("alice/../bob").is_err());
    }
}
