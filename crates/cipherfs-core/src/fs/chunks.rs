//! Random-access chunk I/O and the per-file chunk cache.
//!
//! [`ChunkIo`] maps chunk ordinals to their fixed positions in the ciphertext
//! file and performs the per-chunk encrypt/decrypt. [`ChunkCache`] sits on
//! top: a small bounded LRU of cleartext chunk buffers with dirty tracking,
//! write-through on eviction and ascending-order flush.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use lru::LruCache;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::crypto::keys::{KeyAccessError, MasterKey};
use crate::fs::content::{
    self, chunk_ciphertext_offset, ciphertext_size, cleartext_size_or_zero, ContentCryptoError,
    FileContext, FileHeader, CHUNK_LEN, CHUNK_OVERHEAD, HEADER_LEN,
};

/// Default number of cached chunks per open file.
pub const DEFAULT_CHUNK_CACHE_CAPACITY: usize = 5;

#[derive(Error, Debug)]
pub enum ChunkIoError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Crypto(#[from] ContentCryptoError),

    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

impl ChunkIoError {
    fn io(source: io::Error, path: &Path) -> Self {
        ChunkIoError::Io {
            source,
            path: path.to_path_buf(),
        }
    }
}

/// Chunk-granular access to one ciphertext file.
///
/// Chunk `n` occupies ciphertext bytes
/// `HEADER_LEN + n * CHUNK_LEN .. HEADER_LEN + (n + 1) * CHUNK_LEN`.
/// The header is read (or created) once; afterwards all operations are
/// seek-and-rw on chunk boundaries.
#[derive(Debug)]
pub struct ChunkIo {
    file: fs::File,
    path: PathBuf,
    header: FileHeader,
    master_key: Arc<MasterKey>,
}

impl ChunkIo {
    /// Open an existing ciphertext file and decrypt its header.
    ///
    /// Falls back to a read-only descriptor when the host denies writing;
    /// subsequent chunk writes then fail with the host's error.
    pub fn open(path: &Path, master_key: Arc<MasterKey>) -> Result<Self, ChunkIoError> {
        let mut file = match fs::OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => fs::OpenOptions::new()
                .read(true)
                .open(path)
                .map_err(|e| ChunkIoError::io(e, path))?,
            Err(e) => return Err(ChunkIoError::io(e, path)),
        };

        let mut header_bytes = [0u8; HEADER_LEN];
        file.read_exact(&mut header_bytes)
            .map_err(|e| ChunkIoError::io(e, path))?;

        let context = FileContext::new().with_path(path);
        let header = content::decrypt_header(&header_bytes, &master_key, &context)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            header,
            master_key,
        })
    }

    /// Create a new ciphertext file with a fresh header.
    ///
    /// The header is the only time this layer writes to the file outside of
    /// chunk positions; it is flushed immediately so a concurrently opened
    /// reader always finds a complete header.
    pub fn create(path: &Path, master_key: Arc<MasterKey>, exclusive: bool) -> Result<Self, ChunkIoError> {
        let mut options = fs::OpenOptions::new();
        options.read(true).write(true);
        if exclusive {
            options.create_new(true);
        } else {
            options.create(true).truncate(true);
        }
        let mut file = options.open(path).map_err(|e| ChunkIoError::io(e, path))?;

        let header = FileHeader::create();
        let encrypted = content::encrypt_header(&header, &master_key)?;
        file.write_all(&encrypted)
            .map_err(|e| ChunkIoError::io(e, path))?;

        debug!(path = %path.display(), "Created ciphertext file");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            header,
            master_key,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current cleartext length derived from the ciphertext size on disk.
    ///
    /// Malformed sizes degrade to 0, they never error (partially written
    /// files must still be observable).
    pub fn derived_cleartext_len(&self) -> Result<u64, ChunkIoError> {
        let metadata = self
            .file
            .metadata()
            .map_err(|e| ChunkIoError::io(e, &self.path))?;
        Ok(cleartext_size_or_zero(metadata.len()))
    }

    /// Read and decrypt chunk `index`.
    ///
    /// A read past EOF yields an empty chunk; a partial trailing chunk yields
    /// its partial cleartext.
    pub fn read_chunk(&mut self, index: u64) -> Result<Vec<u8>, ChunkIoError> {
        let offset = chunk_ciphertext_offset(index);
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| ChunkIoError::io(e, &self.path))?;

        let mut buf = vec![0u8; CHUNK_LEN];
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ChunkIoError::io(e, &self.path)),
            }
        }
        buf.truncate(filled);

        if buf.is_empty() {
            trace!(chunk = index, "Read past EOF, returning empty chunk");
            return Ok(Vec::new());
        }
        if buf.len() < CHUNK_OVERHEAD {
            warn!(chunk = index, len = buf.len(), "Truncated trailing chunk");
            return Err(ContentCryptoError::InvalidChunk {
                reason: format!("truncated chunk of {} bytes", buf.len()),
                context: FileContext::new().with_path(&self.path).with_chunk(index),
            }
            .into());
        }

        let context = FileContext::new().with_path(&self.path);
        let plaintext = self.master_key.with_mac_key(|mac_key| {
            content::decrypt_chunk(
                &buf,
                index,
                &self.header.content_key,
                &self.header.nonce,
                mac_key,
                &context,
            )
        })??;
        Ok(plaintext)
    }

    /// Encrypt and write chunk `index`.
    pub fn write_chunk(&mut self, index: u64, plaintext: &[u8]) -> Result<(), ChunkIoError> {
        let encrypted = self.master_key.with_mac_key(|mac_key| {
            content::encrypt_chunk(
                plaintext,
                index,
                &self.header.content_key,
                &self.header.nonce,
                mac_key,
            )
        })??;

        let offset = chunk_ciphertext_offset(index);
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| ChunkIoError::io(e, &self.path))?;
        self.file
            .write_all(&encrypted)
            .map_err(|e| ChunkIoError::io(e, &self.path))?;
        trace!(chunk = index, len = plaintext.len(), "Wrote chunk");
        Ok(())
    }

    /// Truncate the ciphertext file to hold exactly `cleartext_len` bytes.
    pub fn truncate(&mut self, cleartext_len: u64) -> Result<(), ChunkIoError> {
        let physical = ciphertext_size(cleartext_len);
        self.file
            .set_len(physical)
            .map_err(|e| ChunkIoError::io(e, &self.path))?;
        debug!(cleartext_len, physical, "Truncated ciphertext file");
        Ok(())
    }

    /// Best-effort persistence of the cleartext modification time.
    pub fn set_modified(&self, mtime: SystemTime) {
        if let Err(e) = self.file.set_modified(mtime) {
            warn!(path = %self.path.display(), error = %e, "Failed to persist modification time");
        }
    }
}

/// A cached cleartext chunk.
#[derive(Debug)]
struct CachedChunk {
    data: Vec<u8>,
    dirty: bool,
}

/// Bounded LRU of cleartext chunks with write-through eviction.
pub struct ChunkCache {
    entries: LruCache<u64, CachedChunk>,
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCache")
            .field("len", &self.entries.len())
            .field("cap", &self.entries.cap())
            .finish()
    }
}

impl ChunkCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Run `f` over the cleartext of chunk `index`, loading it on a miss.
    ///
    /// If `f` returns `true` the chunk is marked dirty. A dirty chunk evicted
    /// to make room is written through before this call returns.
    pub fn with_chunk<R>(
        &mut self,
        io: &mut ChunkIo,
        index: u64,
        f: impl FnOnce(&mut Vec<u8>) -> (R, bool),
    ) -> Result<R, ChunkIoError> {
        if !self.entries.contains(&index) {
            let data = io.read_chunk(index)?;
            if let Some((evicted_index, evicted)) =
                self.entries.push(index, CachedChunk { data, dirty: false })
            {
                // push only evicts entries under a *different* key
                debug_assert_ne!(evicted_index, index);
                if evicted.dirty {
                    trace!(chunk = evicted_index, "Write-through of evicted dirty chunk");
                    io.write_chunk(evicted_index, &evicted.data)?;
                }
            }
        }

        let entry = self.entries.get_mut(&index).expect("just inserted");
        let (result, dirtied) = f(&mut entry.data);
        if dirtied {
            entry.dirty = true;
        }
        Ok(result)
    }

    /// Write all dirty chunks in ascending index order and clear their flags.
    pub fn flush(&mut self, io: &mut ChunkIo) -> Result<(), ChunkIoError> {
        let mut dirty_indices: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, c)| c.dirty)
            .map(|(i, _)| *i)
            .collect();
        dirty_indices.sort_unstable();

        for index in dirty_indices {
            let chunk = self.entries.peek_mut(&index).expect("index from iteration");
            io.write_chunk(index, &chunk.data)?;
            chunk.dirty = false;
        }
        Ok(())
    }

    /// Drop all cached chunks with an index greater than `last`.
    ///
    /// Used by truncation; the dropped chunks are discarded, not written.
    pub fn drop_beyond(&mut self, last: u64) {
        let stale: Vec<u64> = self
            .entries
            .iter()
            .map(|(i, _)| *i)
            .filter(|i| *i > last)
            .collect();
        for index in stale {
            self.entries.pop(&index);
        }
    }

    /// Discard everything without flushing.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::content::CHUNK_PAYLOAD_LEN;
    use tempfile::TempDir;

    fn new_io(dir: &TempDir, name: &str) -> ChunkIo {
        let key = Arc::new(MasterKey::new([0x42; 32], [0x43; 32]).unwrap());
        ChunkIo::create(&dir.path().join(name), key, true).unwrap()
    }

    #[test]
    fn test_chunk_roundtrip_via_io() {
        let dir = TempDir::new().unwrap();
        let mut io = new_io(&dir, "f.enc");

        io.write_chunk(0, b"hello chunks").unwrap();
        assert_eq!(io.read_chunk(0).unwrap(), b"hello chunks");
    }

    #[test]
    fn test_read_past_eof_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut io = new_io(&dir, "f.enc");

        assert!(io.read_chunk(0).unwrap().is_empty());
        assert!(io.read_chunk(17).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_preserves_content_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.enc");
        let key = Arc::new(MasterKey::new([0x42; 32], [0x43; 32]).unwrap());

        {
            let mut io = ChunkIo::create(&path, Arc::clone(&key), true).unwrap();
            io.write_chunk(0, b"persisted").unwrap();
        }

        let mut io = ChunkIo::open(&path, key).unwrap();
        assert_eq!(io.read_chunk(0).unwrap(), b"persisted");
        assert_eq!(io.derived_cleartext_len().unwrap(), 9);
    }

    #[test]
    fn test_derived_len_of_new_file_is_zero() {
        let dir = TempDir::new().unwrap();
        let io = new_io(&dir, "f.enc");
        assert_eq!(io.derived_cleartext_len().unwrap(), 0);
    }

    #[test]
    fn test_cache_write_through_on_eviction() {
        let dir = TempDir::new().unwrap();
        let mut io = new_io(&dir, "f.enc");
        let mut cache = ChunkCache::new(2);

        // Dirty chunks 0 and 1, then touch 2 to evict 0.
        for i in 0..3u64 {
            cache
                .with_chunk(&mut io, i, |data| {
                    data.extend_from_slice(format!("chunk-{i}").as_bytes());
                    ((), true)
                })
                .unwrap();
        }

        // Chunk 0 must have been written through on eviction.
        assert_eq!(io.read_chunk(0).unwrap(), b"chunk-0");
    }

    #[test]
    fn test_cache_flush_writes_all_dirty() {
        let dir = TempDir::new().unwrap();
        let mut io = new_io(&dir, "f.enc");
        let mut cache = ChunkCache::new(4);

        for i in [2u64, 0, 1] {
            cache
                .with_chunk(&mut io, i, |data| {
                    data.extend_from_slice(&[i as u8; 4]);
                    ((), true)
                })
                .unwrap();
        }
        cache.flush(&mut io).unwrap();

        for i in 0..3u64 {
            assert_eq!(io.read_chunk(i).unwrap(), vec![i as u8; 4]);
        }

        // A second flush has nothing left to write.
        cache.flush(&mut io).unwrap();
    }

    #[test]
    fn test_truncate_drops_trailing_chunks() {
        let dir = TempDir::new().unwrap();
        let mut io = new_io(&dir, "f.enc");
        let mut cache = ChunkCache::new(4);

        for i in 0..3u64 {
            cache
                .with_chunk(&mut io, i, |data| {
                    *data = vec![0xAB; CHUNK_PAYLOAD_LEN];
                    ((), true)
                })
                .unwrap();
        }
        cache.flush(&mut io).unwrap();

        // Keep one full chunk.
        cache.drop_beyond(0);
        io.truncate(CHUNK_PAYLOAD_LEN as u64).unwrap();

        assert_eq!(io.derived_cleartext_len().unwrap(), CHUNK_PAYLOAD_LEN as u64);
        assert!(io.read_chunk(1).unwrap().is_empty());
    }
}
