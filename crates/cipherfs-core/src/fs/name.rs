//! Filename encryption and directory-id hashing.
//!
//! Cleartext entry names are encrypted with AES-SIV, using the parent
//! directory's id as associated data, and BASE32-encoded for the host
//! filesystem. The same cleartext name therefore produces different
//! ciphertext under different directories, and moving an entry between
//! directories requires re-encrypting its name.
//!
//! Entry kinds are distinguished by a marker prefix on the encoded name:
//! `0` for directory pointers, `1S` for symlinks, none for regular files.
//! The BASE32 alphabet contains neither `0` nor `1`, so the markers are
//! unambiguous.

use std::fmt;

use aes_siv::{siv::Aes256Siv, KeyInit};
use data_encoding::BASE32;
use ring::digest;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::crypto::keys::{KeyAccessError, MasterKey};
use crate::vault::path::DirId;

/// Marker prefix for directory-pointer entries.
pub const DIR_PREFIX: &str = "0";

/// Marker prefix for symlink entries.
pub const SYMLINK_PREFIX: &str = "1S";

/// The kind of entry a ciphertext name denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiphertextFileType {
    File,
    Directory,
    Symlink,
}

impl CiphertextFileType {
    /// The marker prefix carried by on-disk names of this kind.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            CiphertextFileType::File => "",
            CiphertextFileType::Directory => DIR_PREFIX,
            CiphertextFileType::Symlink => SYMLINK_PREFIX,
        }
    }

    /// Split an on-disk name into its kind and the bare encoded name.
    #[must_use]
    pub fn parse(name: &str) -> (Self, &str) {
        // Symlink prefix first: "1S" would otherwise never match after "0".
        if let Some(rest) = name.strip_prefix(SYMLINK_PREFIX) {
            (CiphertextFileType::Symlink, rest)
        } else if let Some(rest) = name.strip_prefix(DIR_PREFIX) {
            (CiphertextFileType::Directory, rest)
        } else {
            (CiphertextFileType::File, name)
        }
    }
}

/// Context for filename operations, carried in error messages.
#[derive(Debug, Clone, Default)]
pub struct NameContext {
    /// The encrypted filename (if available)
    pub encrypted_name: Option<String>,
    /// The cleartext filename (if available, e.g. during encryption)
    pub cleartext_name: Option<String>,
    /// The parent directory id
    pub dir_id: Option<String>,
}

impl NameContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_encrypted_name(mut self, name: impl Into<String>) -> Self {
        self.encrypted_name = Some(name.into());
        self
    }

    pub fn with_cleartext_name(mut self, name: impl Into<String>) -> Self {
        self.cleartext_name = Some(name.into());
        self
    }

    pub fn with_dir_id(mut self, dir_id: impl Into<String>) -> Self {
        self.dir_id = Some(dir_id.into());
        self
    }
}

impl fmt::Display for NameContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(ref name) = self.cleartext_name {
            parts.push(format!("filename '{name}'"));
        } else if let Some(ref enc_name) = self.encrypted_name {
            let display_name = if enc_name.len() > 40 {
                format!("{}...", &enc_name[..37])
            } else {
                enc_name.clone()
            };
            parts.push(format!("encrypted name '{display_name}'"));
        }

        if let Some(ref dir_id) = self.dir_id {
            let display_id = if dir_id.is_empty() {
                "<root>".to_string()
            } else if dir_id.len() > 12 {
                format!("{}...", &dir_id[..12])
            } else {
                dir_id.clone()
            };
            parts.push(format!("in directory {display_id}"));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

/// Errors that can occur during filename encryption/decryption.
///
/// Decryption failures indicate integrity violations: AES-SIV is
/// authenticated, so a failure means the ciphertext was tampered with, the
/// wrong key was used, or the name was moved under a different directory id.
#[derive(Error, Debug)]
pub enum NameError {
    /// AES-SIV decryption failed - the ciphertext is invalid or tampered.
    #[error("Failed to decrypt {context}: authentication failed - possible tampering, wrong key, or filename moved between directories")]
    DecryptionFailed { context: NameContext },

    /// BASE32 decoding failed - the encrypted filename is malformed.
    #[error("Invalid BASE32 encoding for {context}: {reason}")]
    Base32Decode { reason: String, context: NameContext },

    /// UTF-8 decoding failed after decryption.
    #[error("Invalid UTF-8 after decryption for {context}: {reason}")]
    Utf8Decode { reason: String, context: NameContext },

    /// Encryption failed unexpectedly.
    #[error("Unexpected encryption failure for {context}")]
    EncryptionFailed { context: NameContext },

    /// Directory id hashing failed unexpectedly.
    #[error("Failed to hash directory id '{dir_id}': encryption error")]
    DirIdHashFailed { dir_id: String },

    /// Key access failed due to memory protection error or lock poisoning.
    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

/// Compute the storage location hash for a directory id.
///
/// The id is AES-SIV encrypted (no associated data), SHA-1 hashed and
/// BASE32-encoded, yielding 32 characters. The physical directory is
/// `d/<hash[..2]>/<hash[2..]>/` under the vault root.
pub fn hash_dir_id(dir_id: &DirId, master_key: &MasterKey) -> Result<String, NameError> {
    master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);

        let associated_data: &[&[u8]] = &[];
        let encrypted = cipher
            .encrypt(associated_data, dir_id.as_str().as_bytes())
            .map_err(|_| NameError::DirIdHashFailed {
                dir_id: dir_id.as_str().to_string(),
            })?;

        let hashed = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &encrypted);
        Ok(BASE32.encode(hashed.as_ref()))
    })?
}

/// Encrypt an entry name with the parent directory id as associated data.
///
/// The name is normalized to Unicode NFC before encryption for cross-platform
/// stability. Returns the BASE32-encoded ciphertext without any marker
/// prefix; the caller prepends the prefix appropriate to the entry kind.
///
/// AES-SIV is deterministic, so the same (name, directory) pair always
/// produces the same output.
pub fn encrypt_name(
    name: &str,
    parent_dir_id: &DirId,
    master_key: &MasterKey,
) -> Result<String, NameError> {
    let context = NameContext::new()
        .with_cleartext_name(name)
        .with_dir_id(parent_dir_id.as_str());

    let normalized: String = name.nfc().collect();

    master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);

        let associated_data: &[&[u8]] = &[parent_dir_id.as_str().as_bytes()];
        let encrypted = cipher
            .encrypt(associated_data, normalized.as_bytes())
            .map_err(|_| NameError::EncryptionFailed {
                context: context.clone(),
            })?;

        Ok(BASE32.encode(&encrypted))
    })?
}

/// Decrypt an entry name (without marker prefix).
pub fn decrypt_name(
    encrypted_name: &str,
    parent_dir_id: &DirId,
    master_key: &MasterKey,
) -> Result<String, NameError> {
    let context = NameContext::new()
        .with_encrypted_name(encrypted_name)
        .with_dir_id(parent_dir_id.as_str());

    let decoded = BASE32
        .decode(encrypted_name.as_bytes())
        .map_err(|e| NameError::Base32Decode {
            reason: e.to_string(),
            context: context.clone(),
        })?;

    master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);

        let associated_data: &[&[u8]] = &[parent_dir_id.as_str().as_bytes()];
        let decrypted = cipher
            .decrypt(associated_data, &decoded)
            .map_err(|_| NameError::DecryptionFailed {
                context: context.clone(),
            })?;

        String::from_utf8(decrypted.to_vec()).map_err(|e| NameError::Utf8Decode {
            reason: e.to_string(),
            context: context.clone(),
        })
    })?
}
