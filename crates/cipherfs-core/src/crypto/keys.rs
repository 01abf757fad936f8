#![forbid(unsafe_code)]

use std::sync::RwLock;

use generic_array::{typenum::U64, GenericArray};
use memsafe::MemSafe;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

/// Error type for key access operations.
///
/// This error can occur when accessing protected key material, either due to
/// memory protection failures or lock poisoning (a thread panicked while holding the lock).
#[derive(Debug, Error)]
pub enum KeyAccessError {
    /// Memory protection operation failed (mlock, mprotect, etc.)
    #[error("Memory protection operation failed: {0}")]
    MemoryProtection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Lock was poisoned (a thread panicked while holding it)
    #[error("Key lock was poisoned")]
    LockPoisoned,
}

impl KeyAccessError {
    /// Create a memory protection error from any error type.
    pub fn memory_protection<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        KeyAccessError::MemoryProtection(Box::new(err))
    }
}

/// Master key pair for vault operations.
///
/// Holds the AES encryption key and the MAC authentication key, each 256 bits
/// for a total of 512 bits of key material.
///
/// # Security
///
/// The keys are stored using the `memsafe` crate's `MemSafe` type, which provides:
/// - **Memory locking**: Keys are pinned in RAM via `mlock`, preventing swap to disk
/// - **Access control**: Memory is protected with `mprotect(PROT_NONE)` when not in use
/// - **Zeroization**: Memory is securely zeroed when the key is dropped
///
/// Access to key material is provided through scoped access methods that
/// temporarily elevate memory permissions to read the key, then immediately
/// revoke access when the operation completes. The fields are intentionally
/// private to enforce that pattern.
///
/// # Thread Safety
///
/// `MasterKey` is `Send + Sync` and can be shared across threads via
/// `Arc<MasterKey>`. If a thread panics while holding the internal lock, the
/// key becomes inaccessible (lock poisoning) as a safety measure.
#[derive(Debug)]
pub struct MasterKey {
    enc_key: RwLock<MemSafe<[u8; 32]>>,
    mac_key: RwLock<MemSafe<[u8; 32]>>,
}

impl MasterKey {
    /// Generate a new random master key pair using a cryptographically secure RNG.
    ///
    /// # Errors
    ///
    /// Returns a `KeyAccessError` if memory protection initialization fails,
    /// e.g. when the system's mlock limit is exceeded.
    pub fn random() -> Result<Self, KeyAccessError> {
        let mut enc_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        rand::rng().fill_bytes(&mut enc_key);
        rand::rng().fill_bytes(&mut mac_key);
        Self::new(enc_key, mac_key)
    }

    /// Create a new master key pair from raw key material.
    ///
    /// The provided arrays are copied into `MemSafe` containers; the caller is
    /// responsible for zeroing the originals if they contain sensitive data.
    ///
    /// # Errors
    ///
    /// Returns a `KeyAccessError` if memory protection initialization fails.
    pub fn new(enc_key: [u8; 32], mac_key: [u8; 32]) -> Result<Self, KeyAccessError> {
        Ok(MasterKey {
            enc_key: RwLock::new(MemSafe::new(enc_key).map_err(KeyAccessError::memory_protection)?),
            mac_key: RwLock::new(MemSafe::new(mac_key).map_err(KeyAccessError::memory_protection)?),
        })
    }

    /// Try to clone the master key, returning an error on failure.
    pub fn try_clone(&self) -> Result<Self, KeyAccessError> {
        let enc = {
            let mut lock = self.enc_key.write().map_err(|_| KeyAccessError::LockPoisoned)?;
            let guard = lock.read().map_err(KeyAccessError::memory_protection)?;
            *guard
        };
        let mac = {
            let mut lock = self.mac_key.write().map_err(|_| KeyAccessError::LockPoisoned)?;
            let guard = lock.read().map_err(KeyAccessError::memory_protection)?;
            *guard
        };
        Self::new(enc, mac)
    }

    /// Execute a function with access to just the AES encryption key.
    ///
    /// # Errors
    ///
    /// Returns a `KeyAccessError` if the lock is poisoned or if memory
    /// protection operations fail.
    pub fn with_enc_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        let mut lock = self.enc_key.write().map_err(|_| KeyAccessError::LockPoisoned)?;
        let guard = lock.read().map_err(KeyAccessError::memory_protection)?;
        Ok(f(&guard))
    }

    /// Execute a function with access to just the MAC key.
    ///
    /// # Errors
    ///
    /// Returns a `KeyAccessError` if the lock is poisoned or if memory
    /// protection operations fail.
    pub fn with_mac_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        let mut lock = self.mac_key.write().map_err(|_| KeyAccessError::LockPoisoned)?;
        let guard = lock.read().map_err(KeyAccessError::memory_protection)?;
        Ok(f(&guard))
    }

    /// Execute a function with access to both keys in AES-SIV order (MAC ‖ AES).
    ///
    /// For AES-SIV operations the key order is MAC key first, then encryption
    /// key. The 64-byte combined key is zeroed after the callback completes.
    ///
    /// # Errors
    ///
    /// Returns a `KeyAccessError` if the lock is poisoned or if memory
    /// protection operations fail.
    pub fn with_siv_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&GenericArray<u8, U64>) -> R,
    {
        // Custom wrapper since GenericArray doesn't implement DefaultIsZeroes
        struct ZeroizeOnDrop(GenericArray<u8, U64>);

        impl Drop for ZeroizeOnDrop {
            fn drop(&mut self) {
                self.0.zeroize();
            }
        }

        let mut key = ZeroizeOnDrop(GenericArray::<u8, U64>::default());

        {
            let mut lock = self.mac_key.write().map_err(|_| KeyAccessError::LockPoisoned)?;
            let guard = lock.read().map_err(KeyAccessError::memory_protection)?;
            key.0[..32].copy_from_slice(&*guard);
        }
        {
            let mut lock = self.enc_key.write().map_err(|_| KeyAccessError::LockPoisoned)?;
            let guard = lock.read().map_err(KeyAccessError::memory_protection)?;
            key.0[32..].copy_from_slice(&*guard);
        }

        Ok(f(&key.0))
    }
}
