//! Vault initialization.
//!
//! Writes the master-key file and bootstraps the on-disk layout: the data
//! tree `d/` with the root storage directory, and the long-name tree `m/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::crypto::keys::{KeyAccessError, MasterKey};
use crate::fs::name;
use crate::vault::config::VaultOptions;
use crate::vault::master_key::{create_masterkey_file, persist_masterkey_file, MasterKeyCreationError};
use crate::vault::path::DirId;

#[derive(Error, Debug)]
pub enum VaultCreationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vault already exists at {0:?}")]
    VaultAlreadyExists(PathBuf),

    #[error("Failed to create masterkey file: {0}")]
    MasterkeyCreation(#[from] MasterKeyCreationError),

    #[error("Failed to compute root storage location: {0}")]
    RootLocation(#[from] name::NameError),

    #[error("Key access error: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

/// Create the on-disk structure of a new vault and return its master key.
///
/// Refuses to touch a directory that already contains a master-key file.
pub(crate) fn initialize_vault(
    root: &Path,
    options: &VaultOptions,
) -> Result<Arc<MasterKey>, VaultCreationError> {
    let masterkey_path = root.join(&options.masterkey_filename);
    if masterkey_path.exists() {
        return Err(VaultCreationError::VaultAlreadyExists(root.to_path_buf()));
    }
    fs::create_dir_all(root)?;

    let master_key = Arc::new(MasterKey::random()?);

    let json = create_masterkey_file(&master_key, &options.passphrase, &options.pepper)?;
    persist_masterkey_file(&json, &masterkey_path)?;

    // Root storage directory: d/<hash(empty id) split 2+30>.
    let hash = name::hash_dir_id(&DirId::root(), &master_key)?;
    let root_storage = root.join("d").join(&hash[..2]).join(&hash[2..]);
    fs::create_dir_all(&root_storage)?;
    fs::create_dir_all(root.join("m"))?;

    debug!(root = %root.display(), "Initialized vault");
    Ok(master_key)
}
