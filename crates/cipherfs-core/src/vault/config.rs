//! Vault configuration options.
//!
//! The option set is closed: passphrase, pepper, masterkey filename, the
//! readonly flag and the migration check. Anything else is rejected at
//! entry, so a typo in an option name fails loudly instead of silently
//! falling back to a default.

use std::collections::HashMap;

use thiserror::Error;

use crate::fs::chunks::DEFAULT_CHUNK_CACHE_CAPACITY;
use crate::vault::master_key::DEFAULT_MASTERKEY_FILENAME;

#[derive(Error, Debug)]
pub enum VaultOptionsError {
    #[error("Missing required option '{0}'")]
    MissingOption(&'static str),

    #[error("Unrecognized option '{0}'")]
    UnrecognizedOption(String),

    #[error("Invalid value for option '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Options for creating or opening a vault.
///
/// The `Debug` implementation redacts the passphrase and pepper.
#[derive(Clone)]
pub struct VaultOptions {
    pub(crate) passphrase: String,
    pub(crate) pepper: Vec<u8>,
    pub(crate) masterkey_filename: String,
    pub(crate) readonly: bool,
    pub(crate) migration_check: bool,
    pub(crate) chunk_cache_capacity: usize,
}

impl VaultOptions {
    /// Options with defaults: no pepper, standard masterkey filename,
    /// writable, migration check enabled.
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            pepper: Vec::new(),
            masterkey_filename: DEFAULT_MASTERKEY_FILENAME.to_string(),
            readonly: false,
            migration_check: true,
            chunk_cache_capacity: DEFAULT_CHUNK_CACHE_CAPACITY,
        }
    }

    /// Additional secret bytes mixed into key derivation.
    pub fn with_pepper(mut self, pepper: impl Into<Vec<u8>>) -> Self {
        self.pepper = pepper.into();
        self
    }

    /// Use a non-standard masterkey filename inside the vault root.
    pub fn with_masterkey_filename(mut self, filename: impl Into<String>) -> Self {
        self.masterkey_filename = filename.into();
        self
    }

    /// Reject all mutating operations.
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Whether to probe the vault format version for needed migrations.
    pub fn migration_check(mut self, enabled: bool) -> Self {
        self.migration_check = enabled;
        self
    }

    /// Number of cleartext chunks cached per open file.
    pub fn with_chunk_cache_capacity(mut self, capacity: usize) -> Self {
        self.chunk_cache_capacity = capacity.max(1);
        self
    }

    /// Build options from a string property map, rejecting unknown keys.
    ///
    /// Recognized keys: `passphrase` (required), `pepper` (hex),
    /// `masterkeyFilename`, `readonly` (bool), `migrationCheck` (bool).
    pub fn from_properties(
        properties: &HashMap<String, String>,
    ) -> Result<Self, VaultOptionsError> {
        let passphrase = properties
            .get("passphrase")
            .ok_or(VaultOptionsError::MissingOption("passphrase"))?;
        let mut options = Self::new(passphrase.clone());

        for (key, value) in properties {
            match key.as_str() {
                "passphrase" => {}
                "pepper" => {
                    options.pepper =
                        hex::decode(value).map_err(|e| VaultOptionsError::InvalidValue {
                            key: key.clone(),
                            reason: e.to_string(),
                        })?;
                }
                "masterkeyFilename" => options.masterkey_filename = value.clone(),
                "readonly" => options.readonly = parse_bool(key, value)?,
                "migrationCheck" => options.migration_check = parse_bool(key, value)?,
                other => {
                    return Err(VaultOptionsError::UnrecognizedOption(other.to_string()));
                }
            }
        }
        Ok(options)
    }
}

impl std::fmt::Debug for VaultOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultOptions")
            .field("passphrase", &"[REDACTED]")
            .field("pepper", &"[REDACTED]")
            .field("masterkey_filename", &self.masterkey_filename)
            .field("readonly", &self.readonly)
            .field("migration_check", &self.migration_check)
            .field("chunk_cache_capacity", &self.chunk_cache_capacity)
            .finish()
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, VaultOptionsError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(VaultOptionsError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected 'true' or 'false', got '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = VaultOptions::new("secret");
        assert_eq!(options.masterkey_filename, DEFAULT_MASTERKEY_FILENAME);
        assert!(options.pepper.is_empty());
        assert!(!options.readonly);
        assert!(options.migration_check);
    }

    #[test]
    fn test_from_properties() {
        let mut props = HashMap::new();
        props.insert("passphrase".to_string(), "secret".to_string());
        props.insert("readonly".to_string(), "true".to_string());
        props.insert("pepper".to_string(), "deadbeef".to_string());

        let options = VaultOptions::from_properties(&props).unwrap();
        assert_eq!(options.passphrase, "secret");
        assert!(options.readonly);
        assert_eq!(options.pepper, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_missing_passphrase_rejected() {
        let props = HashMap::new();
        assert!(matches!(
            VaultOptions::from_properties(&props),
            Err(VaultOptionsError::MissingOption("passphrase"))
        ));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let mut props = HashMap::new();
        props.insert("passphrase".to_string(), "secret".to_string());
        props.insert("compression".to_string(), "lz4".to_string());

        assert!(matches!(
            VaultOptions::from_properties(&props),
            Err(VaultOptionsError::UnrecognizedOption(k)) if k == "compression"
        ));
    }

    #[test]
    fn test_bad_bool_rejected() {
        let mut props = HashMap::new();
        props.insert("passphrase".to_string(), "secret".to_string());
        props.insert("readonly".to_string(), "yes".to_string());

        assert!(matches!(
            VaultOptions::from_properties(&props),
            Err(VaultOptionsError::InvalidValue { .. })
        ));
    }
}
