//! Cleartext-to-ciphertext path translation.
//!
//! Resolution walks the cleartext path component by component: each
//! directory's pointer file (under its parent's physical location) yields
//! its id, and hashing that id yields the physical location of its own
//! entries. A bounded cache short-circuits the walk; structural changes
//! (create, delete, rename, move) invalidate the affected subtree.
//!
//! Directory renames stay cheap because descendants are keyed by their own
//! ids, not by names: renaming a directory touches exactly one pointer
//! file and never relocates `d/<XX>/<YYY...>/`.

use std::path::PathBuf;
use std::sync::Arc;

use moka::sync::Cache;
use thiserror::Error;
use tracing::{instrument, trace};

use crate::crypto::keys::{KeyAccessError, MasterKey};
use crate::fs::name::{self, CiphertextFileType, NameError};
use crate::fs::shortening::{LongNameCodec, ShorteningError};
use crate::vault::dir_id::{DirIdError, DirectoryIdProvider};
use crate::vault::path::{DirId, VaultPath};

/// Upper bound on cached cleartext-path resolutions.
const MAX_CACHED_PATHS: u64 = 5000;

/// Resolution result of a cleartext path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleartextFileType {
    File,
    Directory,
    Symlink,
    Missing,
}

impl From<CiphertextFileType> for CleartextFileType {
    fn from(t: CiphertextFileType) -> Self {
        match t {
            CiphertextFileType::File => CleartextFileType::File,
            CiphertextFileType::Directory => CleartextFileType::Directory,
            CiphertextFileType::Symlink => CleartextFileType::Symlink,
        }
    }
}

/// A resolved cleartext directory: its id and its physical location.
#[derive(Debug, Clone)]
pub struct CiphertextDirectory {
    pub dir_id: DirId,
    pub physical_dir: PathBuf,
}

#[derive(Error, Debug)]
pub enum MapperError {
    #[error("No such file or directory: {0}")]
    NotFound(VaultPath),

    #[error("Not a directory: {0}")]
    NotADirectory(VaultPath),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error(transparent)]
    DirId(#[from] DirIdError),

    #[error(transparent)]
    Shortening(#[from] ShorteningError),

    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

/// Translates cleartext vault paths to ciphertext host paths.
pub struct PathMapper {
    data_dir: PathBuf,
    master_key: Arc<MasterKey>,
    dir_ids: DirectoryIdProvider,
    codec: LongNameCodec,
    dir_cache: Cache<VaultPath, CiphertextDirectory>,
}

impl PathMapper {
    pub fn new(
        data_dir: PathBuf,
        metadata_dir: PathBuf,
        master_key: Arc<MasterKey>,
    ) -> Self {
        Self {
            data_dir,
            master_key,
            dir_ids: DirectoryIdProvider::new(),
            codec: LongNameCodec::new(metadata_dir),
            dir_cache: Cache::builder()
                .max_capacity(MAX_CACHED_PATHS)
                .support_invalidation_closures()
                .build(),
        }
    }

    /// Physical directory for a directory id: `d/<hash[..2]>/<hash[2..]>/`.
    pub fn physical_dir_for(&self, dir_id: &DirId) -> Result<PathBuf, MapperError> {
        let hash = name::hash_dir_id(dir_id, &self.master_key)?;
        Ok(self.data_dir.join(&hash[..2]).join(&hash[2..]))
    }

    /// Resolve a cleartext directory path to its id and physical location.
    #[instrument(level = "trace", skip(self), fields(path = %path))]
    pub fn ciphertext_dir(&self, path: &VaultPath) -> Result<CiphertextDirectory, MapperError> {
        if path.is_root() {
            return Ok(CiphertextDirectory {
                dir_id: DirId::root(),
                physical_dir: self.physical_dir_for(&DirId::root())?,
            });
        }

        if let Some(resolved) = self.dir_cache.get(path) {
            trace!("Path cache hit");
            return Ok(resolved);
        }

        let (parent, basename) = path.split().expect("non-root path always splits");
        let parent_dir = self.ciphertext_dir(&parent)?;

        let pointer = self.pointer_path(&parent_dir, basename)?;
        let dir_id = match self.dir_ids.load(&pointer) {
            Ok(id) => id,
            Err(DirIdError::Missing { .. }) => return Err(MapperError::NotFound(path.clone())),
            Err(e) => return Err(e.into()),
        };

        let resolved = CiphertextDirectory {
            physical_dir: self.physical_dir_for(&dir_id)?,
            dir_id,
        };
        self.dir_cache.insert(path.clone(), resolved.clone());
        Ok(resolved)
    }

    /// On-disk path of the entry for `path` as the given kind, without
    /// touching the filesystem.
    pub fn ciphertext_file_path(
        &self,
        path: &VaultPath,
        kind: CiphertextFileType,
    ) -> Result<PathBuf, MapperError> {
        let (parent, basename) = path
            .split()
            .ok_or_else(|| MapperError::NotADirectory(path.clone()))?;
        let parent_dir = self.ciphertext_dir(&parent)?;
        self.file_path_in(&parent_dir, basename, kind, false)
    }

    /// Like [`ciphertext_file_path`](Self::ciphertext_file_path), but writes
    /// the long-name sidecar if the name needs deflation. Use on creation
    /// paths only.
    pub fn ciphertext_file_path_for_create(
        &self,
        path: &VaultPath,
        kind: CiphertextFileType,
    ) -> Result<PathBuf, MapperError> {
        let (parent, basename) = path
            .split()
            .ok_or_else(|| MapperError::NotADirectory(path.clone()))?;
        let parent_dir = self.ciphertext_dir(&parent)?;
        self.file_path_in(&parent_dir, basename, kind, true)
    }

    /// On-disk path of an entry inside an already-resolved directory.
    pub fn file_path_in(
        &self,
        parent: &CiphertextDirectory,
        basename: &str,
        kind: CiphertextFileType,
        create: bool,
    ) -> Result<PathBuf, MapperError> {
        let encrypted = name::encrypt_name(basename, &parent.dir_id, &self.master_key)?;
        let full_name = format!("{}{encrypted}", kind.prefix());

        let on_disk = if LongNameCodec::needs_deflation(&full_name) {
            if create {
                self.codec.deflate(&full_name)?
            } else {
                LongNameCodec::deflated_name(&full_name)
            }
        } else {
            full_name
        };
        Ok(parent.physical_dir.join(on_disk))
    }

    /// Determine what kind of entry, if any, exists at a cleartext path.
    ///
    /// When several candidates exist for the same basename (possible under
    /// concurrent external writers) the precedence is directory > symlink >
    /// file.
    pub fn ciphertext_file_type(&self, path: &VaultPath) -> Result<CleartextFileType, MapperError> {
        if path.is_root() {
            return Ok(CleartextFileType::Directory);
        }
        let (parent, basename) = path.split().expect("non-root path always splits");
        let parent_dir = match self.ciphertext_dir(&parent) {
            Ok(dir) => dir,
            Err(MapperError::NotFound(_)) => return Ok(CleartextFileType::Missing),
            Err(e) => return Err(e),
        };

        for kind in [
            CiphertextFileType::Directory,
            CiphertextFileType::Symlink,
            CiphertextFileType::File,
        ] {
            let candidate = self.file_path_in(&parent_dir, basename, kind, false)?;
            if candidate.exists() {
                return Ok(kind.into());
            }
        }
        Ok(CleartextFileType::Missing)
    }

    /// The pointer file holding the directory id of `basename` under `parent`.
    pub fn pointer_path(
        &self,
        parent: &CiphertextDirectory,
        basename: &str,
    ) -> Result<PathBuf, MapperError> {
        self.file_path_in(parent, basename, CiphertextFileType::Directory, false)
    }

    /// Decrypt an on-disk entry name, inflating deflated names first.
    ///
    /// Returns the cleartext name and the entry kind.
    pub fn decrypt_entry_name(
        &self,
        parent_dir_id: &DirId,
        on_disk_name: &str,
    ) -> Result<(String, CiphertextFileType), MapperError> {
        let full_name = if LongNameCodec::is_deflated(on_disk_name) {
            self.codec.inflate(on_disk_name)?
        } else {
            on_disk_name.to_string()
        };
        let (kind, encrypted) = CiphertextFileType::parse(&full_name);
        let cleartext = name::decrypt_name(encrypted, parent_dir_id, &self.master_key)?;
        Ok((cleartext, kind))
    }

    /// Access to the directory-id provider for structural mutations.
    pub fn dir_ids(&self) -> &DirectoryIdProvider {
        &self.dir_ids
    }

    /// Access to the long-name codec.
    pub fn long_names(&self) -> &LongNameCodec {
        &self.codec
    }

    /// Invalidate the cached resolution of `path` and everything beneath it.
    ///
    /// Must be called on any structural change.
    pub fn invalidate(&self, path: &VaultPath) {
        let prefix = path.clone();
        // Closure-based invalidation sweeps descendants as well.
        let _ = self
            .dir_cache
            .invalidate_entries_if(move |key, _| key.starts_with(&prefix));
        self.dir_cache.invalidate(path);
    }

    /// Drop all cached state (used on vault close).
    pub fn clear(&self) {
        self.dir_cache.invalidate_all();
        self.dir_ids.clear();
    }
}
