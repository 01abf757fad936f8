//! Cryptographic primitives for vault operations.

pub mod key_wrap;
pub mod keys;
mod thread_safety; // Send + Sync impls for MasterKey

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
///
/// Some errors indicate potential adversarial tampering or integrity
/// violations; these should be treated as security events. Others indicate
/// user errors (wrong passphrase) or programming errors (invalid parameters).
#[derive(Error, Debug)]
pub enum CryptoError {
    /// HMAC verification of the vault version field failed.
    ///
    /// This indicates the masterkey file has been tampered with or corrupted.
    #[error("Version MAC verification failed - masterkey file tampered")]
    VersionMacMismatch,

    /// The master key file's integrity check failed during unwrapping.
    ///
    /// This typically indicates a wrong passphrase. It can also occur if the
    /// masterkey file has been tampered with; the two causes are
    /// cryptographically indistinguishable.
    #[error("Key unwrap failed - incorrect passphrase or corrupted masterkey file")]
    KeyUnwrapIntegrityFailed,

    /// Key derivation failed, typically due to a scrypt computation error.
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Invalid scrypt parameters in the master key file.
    #[error("Invalid scrypt parameters: {0}")]
    InvalidScryptParams(String),

    /// The ciphertext length is invalid for AES key unwrapping.
    #[error("Invalid ciphertext length for key unwrap")]
    InvalidCiphertextLength,

    /// Array conversion failed due to unexpected length.
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Key access failed due to memory protection error or lock poisoning.
    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

impl From<key_wrap::UnwrapError> for CryptoError {
    fn from(err: key_wrap::UnwrapError) -> Self {
        match err {
            key_wrap::UnwrapError::InvalidCiphertextLength
            | key_wrap::UnwrapError::CiphertextTooShort => CryptoError::InvalidCiphertextLength,
            key_wrap::UnwrapError::InvalidIntegrityCheck => CryptoError::KeyUnwrapIntegrityFailed,
        }
    }
}

// Re-export commonly used types
pub use keys::{KeyAccessError, MasterKey};
