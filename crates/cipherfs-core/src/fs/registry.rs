//! Process-wide registry of open ciphertext files.
//!
//! Guarantees at most one [`OpenFile`] per physical path at any instant:
//! concurrent opens of the same path share the handle with its reference
//! count incremented, and the per-key entry lock of the underlying map makes
//! the get-or-create atomic. An entry in the `Closing` state is treated as
//! absent; an opener that observes one retires it and retries once.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::crypto::keys::MasterKey;
use crate::fs::open_file::{CleartextChannel, FileState, OpenFile, OpenFileError, OpenOptions};

/// Registry mapping canonicalized ciphertext paths to their open files.
#[derive(Debug)]
pub struct OpenFileRegistry {
    entries: DashMap<PathBuf, Arc<OpenFile>>,
    master_key: Arc<MasterKey>,
    chunk_cache_capacity: usize,
}

impl OpenFileRegistry {
    pub fn new(master_key: Arc<MasterKey>, chunk_cache_capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            master_key,
            chunk_cache_capacity,
        }
    }

    /// Number of currently registered open files.
    pub fn open_count(&self) -> usize {
        self.entries.len()
    }

    /// Open a cleartext channel on the ciphertext file at `path`.
    ///
    /// Atomically returns the existing [`OpenFile`] for the path (attaching a
    /// new channel) or constructs one under the map's per-key lock. A lost
    /// race against a closing entry is retried once.
    pub fn open(
        self: &Arc<Self>,
        path: &Path,
        options: OpenOptions,
    ) -> Result<CleartextChannel, OpenFileError> {
        use dashmap::mapref::entry::Entry;

        let key = canonicalize_key(path);

        for attempt in 0..2 {
            let file = match self.entries.entry(key.clone()) {
                Entry::Occupied(existing) => {
                    // create_new must not be satisfied by an already-open file.
                    if options.create_new {
                        return Err(OpenFileError::ChunkIo(
                            crate::fs::chunks::ChunkIoError::Io {
                                source: std::io::Error::new(
                                    std::io::ErrorKind::AlreadyExists,
                                    "file is already open",
                                ),
                                path: key,
                            },
                        ));
                    }
                    Arc::clone(existing.get())
                }
                Entry::Vacant(vacant) => {
                    debug!(path = %key.display(), "Registering open file");
                    let file = Arc::new(OpenFile::new(
                        path,
                        options,
                        Arc::clone(&self.master_key),
                        self.chunk_cache_capacity,
                    )?);
                    // Attach before publishing: a freshly built file cannot
                    // be drained to zero channels by a concurrent closer.
                    file.attach_channel()?;
                    vacant.insert(Arc::clone(&file));
                    return Ok(CleartextChannel::new(file, Arc::clone(self), options));
                }
            };

            match file.attach_channel() {
                Ok(()) => {
                    trace!(path = %key.display(), "Channel opened");
                    return Ok(CleartextChannel::new(file, Arc::clone(self), options));
                }
                Err(OpenFileError::NotOpen { .. }) if attempt == 0 => {
                    // The entry is draining; retire it so the retry can
                    // register a fresh one. The closer's own removal is
                    // pointer-guarded and will no-op.
                    self.entries
                        .remove_if(&key, |_, v| Arc::ptr_eq(v, &file));
                    trace!(path = %key.display(), "Retired closing entry, retrying open");
                }
                Err(e) => return Err(e),
            }
        }

        Err(OpenFileError::NotOpen {
            path: key,
        })
    }

    /// Release one channel's reference on `file`.
    ///
    /// The last release transitions the file to `Closing`, flushes it outside
    /// any map lock, removes the entry (unless a retrying opener already
    /// replaced it) and marks the file `Closed`.
    pub(crate) fn release(&self, file: &Arc<OpenFile>) -> Result<(), OpenFileError> {
        if !file.detach_channel()? {
            return Ok(());
        }

        let result = file.finalize();
        let key = canonicalize_key(file.path());
        self.entries.remove_if(&key, |_, v| Arc::ptr_eq(v, file));
        debug!(path = %key.display(), "Open file deregistered");
        result
    }

    /// Flush every registered file. Used by vault close as a last resort for
    /// channels the caller leaked.
    pub fn flush_all(&self) -> Result<(), OpenFileError> {
        for entry in &self.entries {
            if entry.value().state() == FileState::Open {
                entry.value().flush()?;
            }
        }
        Ok(())
    }

    /// Whether the registry currently holds an open file for `path`.
    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(&canonicalize_key(path))
    }

    /// The open file currently registered for `path`, if any.
    ///
    /// Entries in the `Closing` state are reported as absent.
    pub fn get(&self, path: &Path) -> Option<Arc<OpenFile>> {
        self.entries
            .get(&canonicalize_key(path))
            .map(|e| Arc::clone(e.value()))
            .filter(|f| f.state() == FileState::Open)
    }
}

/// Canonicalize a path for use as registry key.
///
/// Falls back to the given path when canonicalization fails, e.g. for files
/// that do not exist yet.
fn canonicalize_key(path: &Path) -> PathBuf {
    match path.canonicalize() {
        Ok(canonical) => canonical,
        Err(_) => match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => parent
                .canonicalize()
                .map(|p| p.join(name))
                .unwrap_or_else(|_| path.to_path_buf()),
            _ => path.to_path_buf(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, Arc<OpenFileRegistry>) {
        let tmp = TempDir::new().unwrap();
        let key = Arc::new(MasterKey::new([0x42; 32], [0x43; 32]).unwrap());
        (tmp, Arc::new(OpenFileRegistry::new(key, 5)))
    }

    #[test]
    fn test_single_entry_per_path() {
        let (tmp, registry) = registry();
        let path = tmp.path().join("file.enc");

        let a = registry
            .open(&path, OpenOptions::new().write(true).create(true))
            .unwrap();
        let b = registry
            .open(&path, OpenOptions::new().read(true))
            .unwrap();

        assert_eq!(registry.open_count(), 1);

        a.close().unwrap();
        assert_eq!(registry.open_count(), 1, "second channel keeps the entry");
        b.close().unwrap();
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn test_channels_share_state() {
        let (tmp, registry) = registry();
        let path = tmp.path().join("file.enc");

        let writer = registry
            .open(&path, OpenOptions::new().write(true).create(true))
            .unwrap();
        writer.write(b"shared bytes").unwrap();

        // A second channel on the same open file observes the un-flushed write.
        let reader = registry
            .open(&path, OpenOptions::new().read(true))
            .unwrap();
        assert_eq!(reader.size().unwrap(), 12);

        let mut buf = [0u8; 12];
        assert_eq!(reader.read(&mut buf).unwrap(), 12);
        assert_eq!(&buf, b"shared bytes");
    }

    #[test]
    fn test_reopen_after_close() {
        let (tmp, registry) = registry();
        let path = tmp.path().join("file.enc");

        let writer = registry
            .open(&path, OpenOptions::new().write(true).create(true))
            .unwrap();
        writer.write(b"persisted").unwrap();
        writer.close().unwrap();

        let reader = registry
            .open(&path, OpenOptions::new().read(true))
            .unwrap();
        let mut buf = vec![0u8; 9];
        reader.read(&mut buf).unwrap();
        assert_eq!(buf, b"persisted");
    }

    #[test]
    fn test_close_twice_fails() {
        let (tmp, registry) = registry();
        let path = tmp.path().join("file.enc");

        let channel = registry
            .open(&path, OpenOptions::new().write(true).create(true))
            .unwrap();
        channel.close().unwrap();
        assert!(matches!(channel.close(), Err(OpenFileError::ChannelClosed)));
    }

    #[test]
    fn test_concurrent_opens_converge() {
        let (tmp, registry) = registry();
        let path = tmp.path().join("file.enc");

        // Seed the file so concurrent read opens succeed.
        registry
            .open(&path, OpenOptions::new().write(true).create(true))
            .unwrap()
            .close()
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let path = path.clone();
            handles.push(std::thread::spawn(move || {
                let channel = registry.open(&path, OpenOptions::new().read(true)).unwrap();
                let count = registry.open_count();
                channel.close().unwrap();
                count
            }));
        }
        for h in handles {
            // Registry uniqueness: never more than one entry for the path.
            assert!(h.join().unwrap() <= 1);
        }
        assert_eq!(registry.open_count(), 0);
    }
}
