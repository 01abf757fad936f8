//! The on-disk master-key file (`masterkey.cryptomator`).
//!
//! The file is JSON holding both vault keys wrapped (RFC 3394) under a key
//! encryption key derived from the passphrase via scrypt, plus the vault
//! format version and an HMAC over it. An optional pepper is appended to the
//! scrypt salt, so vaults created with a pepper can only be unlocked with
//! the same pepper.

use std::io::Write;
use std::path::Path;

use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::SecretBox;
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroizing;

use crate::crypto::{key_wrap, keys::KeyAccessError, CryptoError, MasterKey};

/// The vault format version written by this implementation.
pub const VAULT_FORMAT_VERSION: u32 = 6;

/// Default name of the master-key file inside the vault root.
pub const DEFAULT_MASTERKEY_FILENAME: &str = "masterkey.cryptomator";

/// Default scrypt parameters.
///
/// - salt length 8 bytes
/// - cost parameter N = 2^15 = 32768
/// - block size r = 8
/// - parallelization p = 1
const DEFAULT_SCRYPT_SALT_LENGTH: usize = 8;
const DEFAULT_SCRYPT_COST_PARAM_LOG2: u8 = 15;
const DEFAULT_SCRYPT_BLOCK_SIZE: u32 = 8;
const DEFAULT_SCRYPT_PARALLELIZATION: u32 = 1;

/// Errors that can occur when creating or persisting a master key file.
#[derive(Error, Debug)]
pub enum MasterKeyCreationError {
    #[error("RNG failed: {0}")]
    Rng(String),

    #[error("Invalid scrypt parameters: {0}")]
    InvalidScryptParams(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Key wrap failed: {0}")]
    KeyWrap(#[from] key_wrap::WrapError),

    #[error("JSON serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

/// The master key file format.
#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterKeyFile {
    /// Vault format version, authenticated by `version_mac`.
    version: u32,

    /// Salt for scrypt key derivation (8 bytes for vaults created here).
    #[serde_as(as = "Base64")]
    pub scrypt_salt: Vec<u8>,

    /// Scrypt cost parameter N (must be a power of 2).
    pub scrypt_cost_param: i32,

    /// Scrypt block size parameter r.
    pub scrypt_block_size: i32,

    /// The wrapped (RFC 3394) 256-bit encryption key.
    #[serde_as(as = "Base64")]
    pub primary_master_key: Vec<u8>,

    /// The wrapped (RFC 3394) 256-bit MAC key.
    #[serde_as(as = "Base64")]
    pub hmac_master_key: Vec<u8>,

    /// HMAC-SHA256 of the version as a big-endian 4-byte integer.
    #[serde_as(as = "Base64")]
    pub version_mac: Vec<u8>,
}

impl MasterKeyFile {
    /// Parse a master key file from its JSON representation.
    pub fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load and parse a master key file from disk.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents).map_err(std::io::Error::other)
    }

    /// The (unauthenticated) vault format version claimed by the file.
    ///
    /// Callers must unlock the file before trusting this value; unlock
    /// verifies the version MAC.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Derive the key encryption key from a passphrase and pepper.
    ///
    /// The passphrase is NFC-normalized; the pepper is appended to the salt:
    /// `scrypt(nfc(passphrase), salt ‖ pepper)`.
    pub fn derive_kek(
        &self,
        passphrase: &str,
        pepper: &[u8],
    ) -> Result<SecretBox<[u8; 32]>, CryptoError> {
        let normalized = Zeroizing::new(passphrase.nfc().collect::<String>());

        let log2_n = log_2(self.scrypt_cost_param).ok_or_else(|| {
            CryptoError::InvalidScryptParams(format!(
                "cost parameter must be positive, got {}",
                self.scrypt_cost_param
            ))
        })? as u8;
        let r = self.scrypt_block_size as u32;
        let p = DEFAULT_SCRYPT_PARALLELIZATION;

        let params = scrypt::Params::new(log2_n, r, p, 32).map_err(|e| {
            CryptoError::InvalidScryptParams(format!(
                "invalid scrypt parameters (N=2^{log2_n}, r={r}, p={p}): {e}"
            ))
        })?;

        let mut salt_and_pepper =
            Zeroizing::new(Vec::with_capacity(self.scrypt_salt.len() + pepper.len()));
        salt_and_pepper.extend_from_slice(&self.scrypt_salt);
        salt_and_pepper.extend_from_slice(pepper);

        let mut kek = Zeroizing::new([0u8; 32]);
        scrypt::scrypt(normalized.as_bytes(), &salt_and_pepper, &params, &mut kek[..])
            .map_err(|e| CryptoError::KeyDerivationFailed(format!("scrypt failed: {e}")))?;

        Ok(SecretBox::new(Box::new(*kek)))
    }

    /// Unlock the vault keys with a passphrase and optional pepper.
    ///
    /// # Errors
    ///
    /// - `CryptoError::KeyUnwrapIntegrityFailed`: wrong passphrase (or a
    ///   tampered file, indistinguishably)
    /// - `CryptoError::VersionMacMismatch`: the version field was tampered
    /// - `CryptoError::InvalidScryptParams` / `KeyDerivationFailed`
    pub fn unlock(&self, passphrase: &str, pepper: &[u8]) -> Result<MasterKey, CryptoError> {
        let kek = self.derive_kek(passphrase, pepper)?;

        let enc_key = key_wrap::unwrap_key(&self.primary_master_key, &kek)?;
        let enc_key: [u8; 32] =
            enc_key
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: enc_key.len(),
                })?;

        let mac_key = key_wrap::unwrap_key(&self.hmac_master_key, &kek)?;
        let mac_key: [u8; 32] =
            mac_key
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: mac_key.len(),
                })?;

        // Verify the version MAC - failure indicates tampering.
        let key = hmac::Key::new(hmac::HMAC_SHA256, &mac_key);
        hmac::verify(&key, &self.version.to_be_bytes(), &self.version_mac)
            .map_err(|_| CryptoError::VersionMacMismatch)?;

        MasterKey::new(enc_key, mac_key).map_err(CryptoError::from)
    }
}

fn log_2(x: i32) -> Option<u32> {
    if x <= 0 {
        return None;
    }
    Some(31 - x.leading_zeros())
}

/// Serialize a master key wrapped under `passphrase` (and `pepper`) to JSON.
pub fn create_masterkey_file(
    master_key: &MasterKey,
    passphrase: &str,
    pepper: &[u8],
) -> Result<String, MasterKeyCreationError> {
    use crate::crypto::key_wrap::wrap_key;

    let mut salt = vec![0u8; DEFAULT_SCRYPT_SALT_LENGTH];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| MasterKeyCreationError::Rng("failed to generate salt".to_string()))?;

    let log2_n = DEFAULT_SCRYPT_COST_PARAM_LOG2;
    let r = DEFAULT_SCRYPT_BLOCK_SIZE;
    let p = DEFAULT_SCRYPT_PARALLELIZATION;

    let mut salt_and_pepper = Zeroizing::new(Vec::with_capacity(salt.len() + pepper.len()));
    salt_and_pepper.extend_from_slice(&salt);
    salt_and_pepper.extend_from_slice(pepper);

    let normalized = Zeroizing::new(passphrase.nfc().collect::<String>());
    let params = scrypt::Params::new(log2_n, r, p, 32).map_err(|e| {
        MasterKeyCreationError::InvalidScryptParams(format!(
            "invalid scrypt parameters (N=2^{log2_n}, r={r}, p={p}): {e}"
        ))
    })?;
    let mut kek = Zeroizing::new([0u8; 32]);
    scrypt::scrypt(normalized.as_bytes(), &salt_and_pepper, &params, &mut kek[..])
        .map_err(|e| MasterKeyCreationError::KeyDerivation(format!("scrypt failed: {e}")))?;
    let kek = SecretBox::new(Box::new(*kek));

    // Wrap the encryption key first, then the MAC key.
    let wrapped_enc = master_key.with_enc_key(|key| wrap_key(key, &kek))??;
    let wrapped_mac = master_key.with_mac_key(|key| wrap_key(key, &kek))??;

    let version = VAULT_FORMAT_VERSION;
    let version_mac = master_key.with_mac_key(|key| {
        let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, key);
        hmac::sign(&hmac_key, &version.to_be_bytes()).as_ref().to_vec()
    })?;

    let file = MasterKeyFile {
        version,
        scrypt_salt: salt,
        scrypt_cost_param: 1i32 << log2_n,
        scrypt_block_size: r as i32,
        primary_master_key: wrapped_enc,
        hmac_master_key: wrapped_mac,
        version_mac,
    };

    Ok(serde_json::to_string_pretty(&file)?)
}

/// Atomically write a master key file next to its final location.
pub fn persist_masterkey_file(json: &str, path: &Path) -> Result<(), MasterKeyCreationError> {
    let parent = path.parent().ok_or_else(|| {
        MasterKeyCreationError::Io(std::io::Error::other("masterkey path has no parent"))
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(json.as_bytes())?;
    tmp.persist(path).map_err(|e| MasterKeyCreationError::Io(e.error))?;
    Ok(())
}

/// Errors that can occur when changing the vault passphrase.
#[derive(Error, Debug)]
pub enum ChangePassphraseError {
    #[error("Failed to read masterkey file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse masterkey file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to unlock vault: {0}")]
    Unlock(#[from] CryptoError),

    #[error("Failed to create new masterkey file: {0}")]
    Create(#[from] MasterKeyCreationError),
}

/// Re-wrap the master keys under a new passphrase.
///
/// The vault keys themselves never change, so no vault data is touched; only
/// the key encryption key derived from the passphrase is replaced. Both
/// passphrases use the same pepper.
pub fn change_passphrase(
    masterkey_path: &Path,
    old_passphrase: &str,
    new_passphrase: &str,
    pepper: &[u8],
) -> Result<(), ChangePassphraseError> {
    let contents = std::fs::read_to_string(masterkey_path)?;
    let file = MasterKeyFile::parse(&contents)?;

    let master_key = file.unlock(old_passphrase, pepper)?;

    let new_contents = create_masterkey_file(&master_key, new_passphrase, pepper)?;
    persist_masterkey_file(&new_contents, masterkey_path)?;
    Ok(())
}
