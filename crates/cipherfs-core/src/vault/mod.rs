//! Vault lifecycle: creation, unlocking, scoped open/close.

pub mod config;
pub mod creator;
pub mod dir_id;
pub mod mapper;
pub mod master_key;
pub mod operations;
pub mod path;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::crypto::CryptoError;
use crate::vault::config::{VaultOptions, VaultOptionsError};
use crate::vault::creator::{initialize_vault, VaultCreationError};
use crate::vault::master_key::{MasterKeyFile, VAULT_FORMAT_VERSION};
use crate::vault::operations::VaultOperations;

pub use crate::vault::config::VaultOptions as Options;
pub use crate::vault::mapper::CleartextFileType;
pub use crate::vault::operations::{AttributeView, DirEntry, Metadata, VaultOperationError};
pub use crate::vault::path::{DirId, VaultPath};

/// Process-wide count of open vault handles per canonical root.
static OPEN_VAULTS: OnceLock<DashMap<PathBuf, usize>> = OnceLock::new();

fn open_vaults() -> &'static DashMap<PathBuf, usize> {
    OPEN_VAULTS.get_or_init(DashMap::new)
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Vault root does not exist: {0:?}")]
    Missing(PathBuf),

    #[error("Vault root is not a directory: {0:?}")]
    NotADirectory(PathBuf),

    #[error("No masterkey file at {0:?}")]
    MissingMasterkey(PathBuf),

    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Unsupported vault version {found} (supported: {VAULT_FORMAT_VERSION})")]
    UnsupportedVaultVersion { found: u32 },

    #[error("Vault version {found} needs migration to {VAULT_FORMAT_VERSION}")]
    NeedsMigration { found: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Options(#[from] VaultOptionsError),

    #[error(transparent)]
    Creation(#[from] VaultCreationError),

    #[error(transparent)]
    Crypto(CryptoError),
}

impl From<CryptoError> for VaultError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::KeyUnwrapIntegrityFailed => VaultError::InvalidPassphrase,
            other => VaultError::Crypto(other),
        }
    }
}

/// An unlocked vault.
///
/// Dropping a vault (or calling [`close`](Self::close)) flushes any files
/// still registered as open, releases cached path state and decrements the
/// process-wide open count for its root. The master key material is zeroed
/// once the last component holding it is dropped.
pub struct Vault {
    root: PathBuf,
    ops: VaultOperations,
    closed: Arc<AtomicBool>,
}

impl Vault {
    /// Initialize a new vault at `root` and open it.
    #[instrument(level = "debug", skip(options), fields(root = %root.display()))]
    pub fn create(root: &Path, options: VaultOptions) -> Result<Self, VaultError> {
        let master_key = initialize_vault(root, &options)?;
        let closed = Arc::new(AtomicBool::new(false));
        let ops = VaultOperations::new(
            root,
            master_key,
            options.readonly,
            options.chunk_cache_capacity,
            Arc::clone(&closed),
        );
        Self::register(root);
        Ok(Self {
            root: root.to_path_buf(),
            ops,
            closed,
        })
    }

    /// Open an existing vault at `root` with the given options.
    #[instrument(level = "debug", skip(options), fields(root = %root.display()))]
    pub fn open(root: &Path, options: VaultOptions) -> Result<Self, VaultError> {
        if !root.exists() {
            return Err(VaultError::Missing(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(VaultError::NotADirectory(root.to_path_buf()));
        }

        let masterkey_path = root.join(&options.masterkey_filename);
        if !masterkey_path.is_file() {
            return Err(VaultError::MissingMasterkey(masterkey_path));
        }

        let file = MasterKeyFile::load(&masterkey_path)?;
        if options.migration_check {
            match file.version() {
                v if v < VAULT_FORMAT_VERSION => {
                    return Err(VaultError::NeedsMigration { found: v })
                }
                v if v > VAULT_FORMAT_VERSION => {
                    return Err(VaultError::UnsupportedVaultVersion { found: v })
                }
                _ => {}
            }
        }

        let master_key = Arc::new(file.unlock(&options.passphrase, &options.pepper)?);

        let closed = Arc::new(AtomicBool::new(false));
        let ops = VaultOperations::new(
            root,
            master_key,
            options.readonly,
            options.chunk_cache_capacity,
            Arc::clone(&closed),
        );
        Self::register(root);
        debug!("Vault unlocked");
        Ok(Self {
            root: root.to_path_buf(),
            ops,
            closed,
        })
    }

    /// The vault's root directory on the host filesystem.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cleartext operations on this vault.
    pub fn operations(&self) -> &VaultOperations {
        &self.ops
    }

    /// Number of vault handles currently open for `root` in this process.
    pub fn open_count(root: &Path) -> usize {
        let key = canonical_root(root);
        open_vaults().get(&key).map(|e| *e.value()).unwrap_or(0)
    }

    /// Close this vault, flushing any files still open.
    pub fn close(mut self) -> Result<(), VaultError> {
        self.close_impl()
    }

    fn close_impl(&mut self) -> Result<(), VaultError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Channels the caller leaked still hold dirty chunks; flush them so
        // close-the-vault behaves like close-every-channel.
        if let Err(e) = self.ops.registry().flush_all() {
            warn!(error = %e, "Error flushing open files on vault close");
        }

        let key = canonical_root(&self.root);
        let remaining = {
            let mut count = open_vaults().entry(key.clone()).or_insert(0);
            *count = count.saturating_sub(1);
            *count
        };
        if remaining == 0 {
            open_vaults().remove_if(&key, |_, v| *v == 0);
            self.ops.clear_caches();
            debug!(root = %self.root.display(), "Last handle closed, caches released");
        }
        Ok(())
    }

    fn register(root: &Path) {
        *open_vaults().entry(canonical_root(root)).or_insert(0) += 1;
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close_impl() {
                warn!(error = %e, "Error closing vault on drop");
            }
        }
    }
}

fn canonical_root(root: &Path) -> PathBuf {
    root.canonicalize().unwrap_or_else(|_| root.to_path_buf())
}
