//! Cleartext-path operations on an unlocked vault.
//!
//! [`VaultOperations`] is the facade callers use after unlocking: every
//! method takes cleartext [`VaultPath`]s and translates them through the
//! [`PathMapper`] into reads and writes of ciphertext entries. File content
//! goes through the [`OpenFileRegistry`] so concurrent channels on the same
//! file always share one coordinator.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::crypto::keys::MasterKey;
use crate::fs::name::CiphertextFileType;
use crate::fs::open_file::{CleartextChannel, OpenFileError, OpenOptions};
use crate::fs::registry::OpenFileRegistry;
use crate::fs::content::cleartext_size_or_zero;
use crate::vault::mapper::{CleartextFileType, MapperError, PathMapper};
use crate::vault::path::VaultPath;

#[derive(Error, Debug)]
pub enum VaultOperationError {
    #[error("No such file or directory: {0}")]
    NotFound(VaultPath),

    #[error("Not a directory: {0}")]
    NotADirectory(VaultPath),

    #[error("Is a directory: {0}")]
    IsADirectory(VaultPath),

    #[error("Path already exists: {0}")]
    AlreadyExists(VaultPath),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(VaultPath),

    #[error("Not a symbolic link: {0}")]
    NotASymlink(VaultPath),

    #[error("Vault is opened read-only")]
    ReadOnly,

    #[error("Vault is closed")]
    Closed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error on {path:?}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Mapper(MapperError),

    #[error(transparent)]
    OpenFile(#[from] OpenFileError),
}

impl From<MapperError> for VaultOperationError {
    fn from(e: MapperError) -> Self {
        match e {
            MapperError::NotFound(path) => VaultOperationError::NotFound(path),
            MapperError::NotADirectory(path) => VaultOperationError::NotADirectory(path),
            other => VaultOperationError::Mapper(other),
        }
    }
}

/// Metadata of a cleartext path.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub kind: CleartextFileType,
    /// Cleartext size in bytes; 0 for directories.
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: CleartextFileType,
}

/// A lazy view onto one path's attributes.
///
/// The view holds no state besides the path; every query re-resolves, so a
/// view obtained before a file exists starts reporting real attributes the
/// moment the file is created, and reports the path missing again after
/// deletion.
pub struct AttributeView<'a> {
    ops: &'a VaultOperations,
    path: VaultPath,
}

impl AttributeView<'_> {
    pub fn path(&self) -> &VaultPath {
        &self.path
    }

    /// Current metadata; `kind` is `Missing` when the path does not exist.
    pub fn status(&self) -> Result<Metadata, VaultOperationError> {
        match self.ops.metadata(&self.path) {
            Ok(metadata) => Ok(metadata),
            Err(VaultOperationError::NotFound(_)) => Ok(Metadata {
                kind: CleartextFileType::Missing,
                size: 0,
                modified: None,
            }),
            Err(e) => Err(e),
        }
    }
}

/// Cleartext operations over one unlocked vault.
pub struct VaultOperations {
    mapper: PathMapper,
    registry: Arc<OpenFileRegistry>,
    readonly: bool,
    closed: Arc<AtomicBool>,
}

impl VaultOperations {
    pub(crate) fn new(
        vault_root: &std::path::Path,
        master_key: Arc<MasterKey>,
        readonly: bool,
        chunk_cache_capacity: usize,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            mapper: PathMapper::new(
                vault_root.join("d"),
                vault_root.join("m"),
                Arc::clone(&master_key),
            ),
            registry: Arc::new(OpenFileRegistry::new(master_key, chunk_cache_capacity)),
            readonly,
            closed,
        }
    }

    pub(crate) fn registry(&self) -> &Arc<OpenFileRegistry> {
        &self.registry
    }

    fn check_open(&self) -> Result<(), VaultOperationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VaultOperationError::Closed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), VaultOperationError> {
        self.check_open()?;
        if self.readonly {
            return Err(VaultOperationError::ReadOnly);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// What kind of entry, if any, exists at `path`.
    pub fn file_type(&self, path: &VaultPath) -> Result<CleartextFileType, VaultOperationError> {
        self.check_open()?;
        Ok(self.mapper.ciphertext_file_type(path)?)
    }

    pub fn exists(&self, path: &VaultPath) -> Result<bool, VaultOperationError> {
        Ok(self.file_type(path)? != CleartextFileType::Missing)
    }

    /// Metadata of the entry at `path`.
    ///
    /// For a file that is currently open, size and modification time come
    /// from the open handle (including un-flushed writes); otherwise they
    /// derive from the ciphertext on disk.
    pub fn metadata(&self, path: &VaultPath) -> Result<Metadata, VaultOperationError> {
        self.check_open()?;
        let kind = self.mapper.ciphertext_file_type(path)?;
        match kind {
            CleartextFileType::Missing => Err(VaultOperationError::NotFound(path.clone())),
            CleartextFileType::Directory => Ok(Metadata {
                kind,
                size: 0,
                modified: self.directory_modified(path)?,
            }),
            CleartextFileType::File | CleartextFileType::Symlink => {
                let ciphertext_kind = if kind == CleartextFileType::File {
                    CiphertextFileType::File
                } else {
                    CiphertextFileType::Symlink
                };
                let ciphertext_path = self.mapper.ciphertext_file_path(path, ciphertext_kind)?;

                if let Some(open_file) = self.registry.get(&ciphertext_path) {
                    return Ok(Metadata {
                        kind,
                        size: open_file.size(),
                        modified: open_file.modified().ok(),
                    });
                }

                let host_meta =
                    fs::metadata(&ciphertext_path).map_err(|source| VaultOperationError::Io {
                        source,
                        path: ciphertext_path.clone(),
                    })?;
                Ok(Metadata {
                    kind,
                    size: cleartext_size_or_zero(host_meta.len()),
                    modified: host_meta.modified().ok(),
                })
            }
        }
    }

    fn directory_modified(
        &self,
        path: &VaultPath,
    ) -> Result<Option<SystemTime>, VaultOperationError> {
        let resolved = self.mapper.ciphertext_dir(path)?;
        Ok(fs::metadata(&resolved.physical_dir)
            .and_then(|m| m.modified())
            .ok())
    }

    /// A lazy attribute view for `path`; the path need not exist yet.
    pub fn attribute_view(&self, path: &VaultPath) -> AttributeView<'_> {
        AttributeView {
            ops: self,
            path: path.clone(),
        }
    }

    // ------------------------------------------------------------------
    // File content
    // ------------------------------------------------------------------

    /// Open a cleartext channel on the file at `path`.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub fn open(
        &self,
        path: &VaultPath,
        options: OpenOptions,
    ) -> Result<CleartextChannel, VaultOperationError> {
        let wants_write =
            options.write || options.append || options.truncate || options.create || options.create_new;
        if wants_write {
            self.check_writable()?;
        } else {
            self.check_open()?;
        }

        match self.mapper.ciphertext_file_type(path)? {
            CleartextFileType::Directory => {
                return Err(VaultOperationError::IsADirectory(path.clone()))
            }
            CleartextFileType::Symlink => {
                return Err(VaultOperationError::InvalidArgument(
                    "cannot open a symlink as a file".to_string(),
                ))
            }
            CleartextFileType::File => {
                if options.create_new {
                    return Err(VaultOperationError::AlreadyExists(path.clone()));
                }
            }
            CleartextFileType::Missing => {
                if !options.create && !options.create_new {
                    return Err(VaultOperationError::NotFound(path.clone()));
                }
            }
        }

        let ciphertext_path = if options.create || options.create_new {
            self.mapper
                .ciphertext_file_path_for_create(path, CiphertextFileType::File)?
        } else {
            self.mapper
                .ciphertext_file_path(path, CiphertextFileType::File)?
        };

        Ok(self.registry.open(&ciphertext_path, options)?)
    }

    /// Read a file's entire cleartext.
    pub fn read(&self, path: &VaultPath) -> Result<Vec<u8>, VaultOperationError> {
        let channel = self.open(path, OpenOptions::new().read(true))?;
        let size = channel.size()?;
        let mut buf = vec![
            0u8;
            usize::try_from(size).map_err(|_| VaultOperationError::InvalidArgument(
                "file too large to read into memory".to_string()
            ))?
        ];
        let mut read = 0;
        while read < buf.len() {
            let n = channel.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        channel.close()?;
        Ok(buf)
    }

    /// Create or replace a file with the given cleartext.
    pub fn write(&self, path: &VaultPath, content: &[u8]) -> Result<(), VaultOperationError> {
        let channel = self.open(
            path,
            OpenOptions::new().write(true).create(true).truncate(true),
        )?;
        let mut written = 0;
        while written < content.len() {
            written += channel.write(&content[written..])?;
        }
        channel.close()?;
        Ok(())
    }

    /// Delete the file or symlink at `path`.
    pub fn remove_file(&self, path: &VaultPath) -> Result<(), VaultOperationError> {
        self.check_writable()?;
        let kind = match self.mapper.ciphertext_file_type(path)? {
            CleartextFileType::File => CiphertextFileType::File,
            CleartextFileType::Symlink => CiphertextFileType::Symlink,
            CleartextFileType::Directory => {
                return Err(VaultOperationError::IsADirectory(path.clone()))
            }
            CleartextFileType::Missing => {
                return Err(VaultOperationError::NotFound(path.clone()))
            }
        };

        let ciphertext_path = self.mapper.ciphertext_file_path(path, kind)?;
        fs::remove_file(&ciphertext_path).map_err(|source| VaultOperationError::Io {
            source,
            path: ciphertext_path.clone(),
        })?;
        self.mapper.invalidate(path);
        debug!(path = %path, "Removed file");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Directories
    // ------------------------------------------------------------------

    /// Create a cleartext directory.
    #[instrument(level = "debug", skip(self), fields(path = %path))]
    pub fn create_directory(&self, path: &VaultPath) -> Result<(), VaultOperationError> {
        self.check_writable()?;
        if path.is_root() {
            return Err(VaultOperationError::AlreadyExists(path.clone()));
        }
        if self.mapper.ciphertext_file_type(path)? != CleartextFileType::Missing {
            return Err(VaultOperationError::AlreadyExists(path.clone()));
        }

        let pointer = self
            .mapper
            .ciphertext_file_path_for_create(path, CiphertextFileType::Directory)?;
        let dir_id = self.mapper.dir_ids().create(&pointer).map_err(MapperError::from)?;

        let physical = self.mapper.physical_dir_for(&dir_id)?;
        fs::create_dir_all(&physical).map_err(|source| VaultOperationError::Io {
            source,
            path: physical,
        })?;
        debug!(path = %path, %dir_id, "Created directory");
        Ok(())
    }

    /// List the entries of a cleartext directory.
    ///
    /// Entries whose names cannot be inflated or decrypted are skipped with
    /// a warning; one corrupt entry must not hide the rest of the listing.
    pub fn list_directory(&self, path: &VaultPath) -> Result<Vec<DirEntry>, VaultOperationError> {
        self.check_open()?;
        match self.mapper.ciphertext_file_type(path)? {
            CleartextFileType::Directory => {}
            CleartextFileType::Missing => {
                return Err(VaultOperationError::NotFound(path.clone()))
            }
            _ => return Err(VaultOperationError::NotADirectory(path.clone())),
        }

        let resolved = self.mapper.ciphertext_dir(path)?;
        let read_dir =
            fs::read_dir(&resolved.physical_dir).map_err(|source| VaultOperationError::Io {
                source,
                path: resolved.physical_dir.clone(),
            })?;

        let mut entries = Vec::new();
        for host_entry in read_dir {
            let host_entry = host_entry.map_err(|source| VaultOperationError::Io {
                source,
                path: resolved.physical_dir.clone(),
            })?;
            let on_disk_name = host_entry.file_name().to_string_lossy().to_string();

            match self
                .mapper
                .decrypt_entry_name(&resolved.dir_id, &on_disk_name)
            {
                Ok((name, kind)) => entries.push(DirEntry {
                    name,
                    kind: kind.into(),
                }),
                Err(e) => {
                    warn!(entry = %on_disk_name, error = %e, "Skipping undecryptable entry");
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Remove an empty cleartext directory.
    pub fn remove_directory(&self, path: &VaultPath) -> Result<(), VaultOperationError> {
        self.check_writable()?;
        if path.is_root() {
            return Err(VaultOperationError::InvalidArgument(
                "cannot remove the vault root".to_string(),
            ));
        }
        match self.mapper.ciphertext_file_type(path)? {
            CleartextFileType::Directory => {}
            CleartextFileType::Missing => {
                return Err(VaultOperationError::NotFound(path.clone()))
            }
            _ => return Err(VaultOperationError::NotADirectory(path.clone())),
        }

        let resolved = self.mapper.ciphertext_dir(path)?;
        let mut read_dir =
            fs::read_dir(&resolved.physical_dir).map_err(|source| VaultOperationError::Io {
                source,
                path: resolved.physical_dir.clone(),
            })?;
        if read_dir.next().is_some() {
            return Err(VaultOperationError::DirectoryNotEmpty(path.clone()));
        }

        fs::remove_dir(&resolved.physical_dir).map_err(|source| VaultOperationError::Io {
            source,
            path: resolved.physical_dir.clone(),
        })?;
        let pointer = self
            .mapper
            .ciphertext_file_path(path, CiphertextFileType::Directory)?;
        fs::remove_file(&pointer).map_err(|source| VaultOperationError::Io {
            source,
            path: pointer.clone(),
        })?;

        self.mapper.dir_ids().invalidate(&pointer);
        self.mapper.invalidate(path);
        debug!(path = %path, "Removed directory");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rename / move
    // ------------------------------------------------------------------

    /// Rename or move an entry, re-encrypting its name under the target
    /// directory.
    ///
    /// For directories only the pointer file moves; the directory's id, and
    /// with it the physical location of all descendants, stays untouched.
    #[instrument(level = "debug", skip(self), fields(from = %from, to = %to))]
    pub fn rename(&self, from: &VaultPath, to: &VaultPath) -> Result<(), VaultOperationError> {
        self.check_writable()?;
        if from.is_root() || to.is_root() {
            return Err(VaultOperationError::InvalidArgument(
                "cannot rename the vault root".to_string(),
            ));
        }
        if from == to {
            return Ok(());
        }
        if to.starts_with(from) && to != from {
            return Err(VaultOperationError::InvalidArgument(
                "cannot move a directory beneath itself".to_string(),
            ));
        }
        if self.mapper.ciphertext_file_type(to)? != CleartextFileType::Missing {
            return Err(VaultOperationError::AlreadyExists(to.clone()));
        }

        let kind = match self.mapper.ciphertext_file_type(from)? {
            CleartextFileType::File => CiphertextFileType::File,
            CleartextFileType::Symlink => CiphertextFileType::Symlink,
            CleartextFileType::Directory => CiphertextFileType::Directory,
            CleartextFileType::Missing => {
                return Err(VaultOperationError::NotFound(from.clone()))
            }
        };

        let old_ciphertext = self.mapper.ciphertext_file_path(from, kind)?;
        let new_ciphertext = self.mapper.ciphertext_file_path_for_create(to, kind)?;

        fs::rename(&old_ciphertext, &new_ciphertext).map_err(|source| {
            VaultOperationError::Io {
                source,
                path: old_ciphertext.clone(),
            }
        })?;

        if kind == CiphertextFileType::Directory {
            // Pointer contents are preserved by the rename; only the cached
            // locations are stale now.
            self.mapper.dir_ids().invalidate(&old_ciphertext);
        }
        self.mapper.invalidate(from);
        self.mapper.invalidate(to);
        debug!("Renamed entry");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Symlinks
    // ------------------------------------------------------------------

    /// Create a symlink at `link` whose target is the string `target`.
    ///
    /// The target is stored as regular encrypted content under a symlink
    /// entry, so it enjoys the same authentication as file data.
    pub fn create_symlink(
        &self,
        link: &VaultPath,
        target: &str,
    ) -> Result<(), VaultOperationError> {
        self.check_writable()?;
        if self.mapper.ciphertext_file_type(link)? != CleartextFileType::Missing {
            return Err(VaultOperationError::AlreadyExists(link.clone()));
        }

        let ciphertext_path = self
            .mapper
            .ciphertext_file_path_for_create(link, CiphertextFileType::Symlink)?;
        let channel = self.registry.open(
            &ciphertext_path,
            OpenOptions::new().write(true).create_new(true),
        )?;
        let bytes = target.as_bytes();
        let mut written = 0;
        while written < bytes.len() {
            written += channel.write(&bytes[written..])?;
        }
        channel.close()?;
        debug!(link = %link, symlink_target = target, "Created symlink");
        Ok(())
    }

    /// Read the target of the symlink at `path`.
    pub fn read_symlink(&self, path: &VaultPath) -> Result<String, VaultOperationError> {
        self.check_open()?;
        if self.mapper.ciphertext_file_type(path)? != CleartextFileType::Symlink {
            return Err(VaultOperationError::NotASymlink(path.clone()));
        }

        let ciphertext_path = self
            .mapper
            .ciphertext_file_path(path, CiphertextFileType::Symlink)?;
        let channel = self
            .registry
            .open(&ciphertext_path, OpenOptions::new().read(true))?;
        let size = channel.size()? as usize;
        let mut buf = vec![0u8; size];
        let mut read = 0;
        while read < buf.len() {
            let n = channel.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        channel.close()?;

        String::from_utf8(buf).map_err(|e| {
            VaultOperationError::InvalidArgument(format!("symlink target is not UTF-8: {e}"))
        })
    }

    /// Drop all cached path state. Called on vault close.
    pub(crate) fn clear_caches(&self) {
        self.mapper.clear();
    }
}
