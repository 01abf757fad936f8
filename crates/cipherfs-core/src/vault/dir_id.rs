//! Directory-id resolution and caching.
//!
//! Every cleartext directory is identified by a UUID stored in a pointer
//! file under its parent. The provider caches pointer-file → id lookups;
//! a miss reads the file's UTF-8 contents. Ids are never rewritten in
//! place - a directory move relocates the pointer file but keeps its
//! contents - so a cached id stays valid until the pointer is deleted.
//! Deletion invalidates the key, so readers may observe a stale absence
//! but never a stale presence.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use moka::sync::Cache;
use thiserror::Error;
use tracing::{debug, trace};

use crate::vault::path::DirId;

/// Upper bound on cached pointer-file → id entries.
const MAX_CACHED_DIR_IDS: u64 = 5000;

#[derive(Error, Debug)]
pub enum DirIdError {
    #[error("IO error reading directory id {path:?}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// The pointer file does not exist.
    #[error("No directory id at {path:?}")]
    Missing { path: PathBuf },

    /// The pointer file contents are not a plausible directory id.
    #[error("Malformed directory id at {path:?}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Cached mapping from directory-pointer files to directory ids.
pub struct DirectoryIdProvider {
    cache: Cache<PathBuf, DirId>,
}

impl std::fmt::Debug for DirectoryIdProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryIdProvider")
            .field("cached_entries", &self.cache.entry_count())
            .finish()
    }
}

impl Default for DirectoryIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryIdProvider {
    pub fn new() -> Self {
        Self {
            cache: Cache::new(MAX_CACHED_DIR_IDS),
        }
    }

    /// Resolve the id stored in the pointer file at `pointer_path`.
    pub fn load(&self, pointer_path: &Path) -> Result<DirId, DirIdError> {
        if let Some(id) = self.cache.get(pointer_path) {
            trace!(path = %pointer_path.display(), "Directory id cache hit");
            return Ok(id);
        }

        let contents = match fs::read_to_string(pointer_path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DirIdError::Missing {
                    path: pointer_path.to_path_buf(),
                })
            }
            Err(source) => {
                return Err(DirIdError::Io {
                    source,
                    path: pointer_path.to_path_buf(),
                })
            }
        };

        if contents.is_empty() || contents.len() > 64 || contents.contains('\n') {
            return Err(DirIdError::Malformed {
                path: pointer_path.to_path_buf(),
                reason: format!("{} bytes", contents.len()),
            });
        }

        let id = DirId::from_raw(contents);
        self.cache.insert(pointer_path.to_path_buf(), id.clone());
        Ok(id)
    }

    /// Create a fresh id, write it to a new pointer file and cache it.
    ///
    /// The write is atomic and refuses to clobber an existing pointer.
    pub fn create(&self, pointer_path: &Path) -> Result<DirId, DirIdError> {
        let id = DirId::generate();

        let parent = pointer_path.parent().ok_or_else(|| DirIdError::Io {
            source: io::Error::other("pointer path has no parent"),
            path: pointer_path.to_path_buf(),
        })?;
        let io_err = |source: io::Error| DirIdError::Io {
            source,
            path: pointer_path.to_path_buf(),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(id.as_str().as_bytes()).map_err(io_err)?;
        tmp.persist_noclobber(pointer_path)
            .map_err(|e| io_err(e.error))?;

        debug!(path = %pointer_path.display(), %id, "Created directory id");
        self.cache.insert(pointer_path.to_path_buf(), id.clone());
        Ok(id)
    }

    /// Forget a pointer file, e.g. after it was deleted or moved away.
    pub fn invalidate(&self, pointer_path: &Path) {
        self.cache.invalidate(&pointer_path.to_path_buf());
    }

    /// Drop all cached entries.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}
