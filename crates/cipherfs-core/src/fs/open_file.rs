//! In-memory coordination of one open ciphertext file.
//!
//! An [`OpenFile`] is the single in-process handle for one physical
//! ciphertext file. All cleartext channels targeting that file share it: it
//! owns the decrypted header, the chunk cache, the tracked cleartext length
//! and the in-memory modification time, and it flushes everything when the
//! last channel closes.
//!
//! # Locking
//!
//! One mutex guards the lifecycle (channel count, state, mtime). A separate
//! readers/writer lock gates content access: reads share it, writes and
//! truncation take it exclusively. Chunk cache and backing channel position
//! have their own interior locks, acquired in cache → io order, so no lock
//! is ever held across more than a single chunk read or write.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use crate::crypto::keys::MasterKey;
use crate::fs::chunks::{ChunkCache, ChunkIo, ChunkIoError};
use crate::fs::content::{chunk_index, offset_in_chunk, CHUNK_PAYLOAD_LEN};

#[derive(Error, Debug)]
pub enum OpenFileError {
    #[error(transparent)]
    ChunkIo(#[from] ChunkIoError),

    /// The file is closing or closed; no new channels may attach.
    #[error("File {path:?} is no longer open")]
    NotOpen { path: PathBuf },

    /// The channel was opened without the capability for this operation.
    #[error("Channel not opened for {operation}")]
    BadChannelMode { operation: &'static str },

    /// The channel has already been closed.
    #[error("Channel already closed")]
    ChannelClosed,

    #[error("Lock poisoned by a panicked thread")]
    Poisoned,
}

/// Open flags for cleartext channels, modeled after `std::fs::OpenOptions`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn create_new(mut self, create_new: bool) -> Self {
        self.create_new = create_new;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }
}

/// Lifecycle of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct Lifecycle {
    channel_count: u32,
    state: FileState,
    modified: SystemTime,
    modified_dirty: bool,
}

/// The shared in-memory handle for one physical ciphertext file.
#[derive(Debug)]
pub struct OpenFile {
    path: PathBuf,
    lifecycle: Mutex<Lifecycle>,
    /// Readers share, writers exclude. Guards only the *ordering* of content
    /// operations; the data structures below carry their own locks.
    content: RwLock<()>,
    cache: Mutex<ChunkCache>,
    io: Mutex<ChunkIo>,
    /// Cleartext length: max of the derived ciphertext length at open time
    /// and any in-memory dirty extension since.
    cleartext_len: AtomicU64,
}

impl OpenFile {
    /// Open or create the ciphertext file at `path`.
    ///
    /// For existing files the header is decrypted immediately; for new files
    /// (`create` / `create_new`) a fresh header is generated and written.
    #[instrument(level = "debug", skip(master_key), fields(path = %path.display()))]
    pub(crate) fn new(
        path: &Path,
        options: OpenOptions,
        master_key: Arc<MasterKey>,
        cache_capacity: usize,
    ) -> Result<Self, OpenFileError> {
        let io = if options.create_new {
            ChunkIo::create(path, master_key, true)?
        } else if options.create && !path.exists() {
            ChunkIo::create(path, master_key, false)?
        } else {
            ChunkIo::open(path, master_key)?
        };

        let len = io.derived_cleartext_len()?;

        let file = Self {
            path: path.to_path_buf(),
            lifecycle: Mutex::new(Lifecycle {
                channel_count: 0,
                state: FileState::Open,
                modified: SystemTime::now(),
                modified_dirty: false,
            }),
            content: RwLock::new(()),
            cache: Mutex::new(ChunkCache::new(cache_capacity)),
            io: Mutex::new(io),
            cleartext_len: AtomicU64::new(len),
        };

        if options.truncate {
            file.truncate(0)?;
        }
        Ok(file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current cleartext length.
    pub fn size(&self) -> u64 {
        self.cleartext_len.load(Ordering::Acquire)
    }

    /// In-memory last-modified time, updated on every successful write.
    pub fn modified(&self) -> Result<SystemTime, OpenFileError> {
        Ok(self
            .lifecycle
            .lock()
            .map_err(|_| OpenFileError::Poisoned)?
            .modified)
    }

    pub fn state(&self) -> FileState {
        self.lifecycle
            .lock()
            .map(|l| l.state)
            .unwrap_or(FileState::Closed)
    }

    /// Attach a new channel; fails once the file entered `Closing`.
    pub(crate) fn attach_channel(&self) -> Result<(), OpenFileError> {
        let mut lifecycle = self.lifecycle.lock().map_err(|_| OpenFileError::Poisoned)?;
        if lifecycle.state != FileState::Open {
            return Err(OpenFileError::NotOpen {
                path: self.path.clone(),
            });
        }
        lifecycle.channel_count += 1;
        trace!(path = %self.path.display(), count = lifecycle.channel_count, "Channel attached");
        Ok(())
    }

    /// Detach a channel. Returns `true` when this was the last one, in which
    /// case the file has transitioned to `Closing` and must be finalized.
    pub(crate) fn detach_channel(&self) -> Result<bool, OpenFileError> {
        let mut lifecycle = self.lifecycle.lock().map_err(|_| OpenFileError::Poisoned)?;
        lifecycle.channel_count = lifecycle.channel_count.saturating_sub(1);
        if lifecycle.channel_count == 0 && lifecycle.state == FileState::Open {
            lifecycle.state = FileState::Closing;
            return Ok(true);
        }
        Ok(false)
    }

    /// Read up to `buf.len()` bytes at cleartext `offset`.
    ///
    /// Returns the number of bytes read; 0 at or past EOF.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, OpenFileError> {
        let _shared = self.content.read().map_err(|_| OpenFileError::Poisoned)?;

        let len = self.size();
        if offset >= len || buf.is_empty() {
            return Ok(0);
        }
        let wanted = (buf.len() as u64).min(len - offset) as usize;

        let mut copied = 0;
        while copied < wanted {
            let pos = offset + copied as u64;
            let index = chunk_index(pos);
            let within = offset_in_chunk(pos);
            let take = (CHUNK_PAYLOAD_LEN - within).min(wanted - copied);

            let mut cache = self.cache.lock().map_err(|_| OpenFileError::Poisoned)?;
            let mut io = self.io.lock().map_err(|_| OpenFileError::Poisoned)?;
            let n = cache.with_chunk(&mut io, index, |data| {
                let available = data.len().saturating_sub(within);
                let n = take.min(available);
                buf[copied..copied + n].copy_from_slice(&data[within..within + n]);
                (n, false)
            })?;
            drop(io);
            drop(cache);

            if n == 0 {
                // Tracked length exceeds the materialized chunk, e.g. a gap
                // left by a write past EOF. Those bytes read as zero.
                buf[copied..copied + take].fill(0);
                copied += take;
            } else {
                copied += n;
            }
        }
        Ok(copied)
    }

    /// Write `buf` at cleartext `offset`, extending the file as needed.
    ///
    /// Writing past the current end zero-fills the gap.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, OpenFileError> {
        let _exclusive = self.content.write().map_err(|_| OpenFileError::Poisoned)?;

        if buf.is_empty() {
            return Ok(0);
        }

        // A write past the current end zero-fills the gap: the framing has
        // no sparse representation, every chunk up to the write must exist.
        let current = self.size();
        if offset > current {
            self.zero_fill(current, offset)?;
        }

        let mut written = 0;
        while written < buf.len() {
            let pos = offset + written as u64;
            let index = chunk_index(pos);
            let within = offset_in_chunk(pos);
            let take = (CHUNK_PAYLOAD_LEN - within).min(buf.len() - written);

            let mut cache = self.cache.lock().map_err(|_| OpenFileError::Poisoned)?;
            let mut io = self.io.lock().map_err(|_| OpenFileError::Poisoned)?;
            cache.with_chunk(&mut io, index, |data| {
                if data.len() < within {
                    data.resize(within, 0);
                }
                let end = within + take;
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[within..end].copy_from_slice(&buf[written..written + take]);
                ((), true)
            })?;
            drop(io);
            drop(cache);

            written += take;
        }

        let end = offset + written as u64;
        self.cleartext_len.fetch_max(end, Ordering::AcqRel);
        self.touch()?;
        trace!(offset, written, "Wrote cleartext range");
        Ok(written)
    }

    /// Zero-fill cleartext bytes `from..to` chunk by chunk.
    ///
    /// Caller must hold the exclusive content lock.
    fn zero_fill(&self, from: u64, to: u64) -> Result<(), OpenFileError> {
        let mut pos = from;
        while pos < to {
            let index = chunk_index(pos);
            let fill_end = if chunk_index(to) == index {
                offset_in_chunk(to)
            } else {
                CHUNK_PAYLOAD_LEN
            };

            let mut cache = self.cache.lock().map_err(|_| OpenFileError::Poisoned)?;
            let mut io = self.io.lock().map_err(|_| OpenFileError::Poisoned)?;
            cache.with_chunk(&mut io, index, |data| {
                if data.len() < fill_end {
                    data.resize(fill_end, 0);
                }
                ((), true)
            })?;
            drop(io);
            drop(cache);

            pos = (index + 1) * CHUNK_PAYLOAD_LEN as u64;
        }
        Ok(())
    }

    /// Truncate (or extend) the cleartext to exactly `len` bytes.
    pub fn truncate(&self, len: u64) -> Result<(), OpenFileError> {
        let _exclusive = self.content.write().map_err(|_| OpenFileError::Poisoned)?;

        let current = self.size();
        if len > current {
            // Extension zero-fills, like POSIX ftruncate.
            self.zero_fill(current, len)?;
        }
        if len < current {
            let last = chunk_index(len);
            let keep = offset_in_chunk(len);

            let mut cache = self.cache.lock().map_err(|_| OpenFileError::Poisoned)?;
            let mut io = self.io.lock().map_err(|_| OpenFileError::Poisoned)?;
            if keep > 0 {
                cache.with_chunk(&mut io, last, |data| {
                    data.truncate(keep);
                    ((), true)
                })?;
                cache.drop_beyond(last);
            } else {
                // len falls on a chunk boundary: chunk `last` itself is gone.
                match last.checked_sub(1) {
                    Some(prev) => cache.drop_beyond(prev),
                    None => cache.clear(),
                }
            }
            cache.flush(&mut io)?;
            io.truncate(len)?;
        }
        self.cleartext_len.store(len, Ordering::Release);
        self.touch()?;
        debug!(len, "Truncated open file");
        Ok(())
    }

    /// Write all dirty state back to the ciphertext file.
    pub fn flush(&self) -> Result<(), OpenFileError> {
        let _exclusive = self.content.write().map_err(|_| OpenFileError::Poisoned)?;
        let mut cache = self.cache.lock().map_err(|_| OpenFileError::Poisoned)?;
        let mut io = self.io.lock().map_err(|_| OpenFileError::Poisoned)?;
        Ok(cache.flush(&mut io)?)
    }

    /// Final flush when the last channel has detached: dirty chunks, then the
    /// modification time (best effort), then the `Closed` state.
    pub(crate) fn finalize(&self) -> Result<(), OpenFileError> {
        let result = self.flush();

        let mut lifecycle = self.lifecycle.lock().map_err(|_| OpenFileError::Poisoned)?;
        if lifecycle.modified_dirty {
            if let Ok(io) = self.io.lock() {
                io.set_modified(lifecycle.modified);
            }
            lifecycle.modified_dirty = false;
        }
        lifecycle.state = FileState::Closed;
        debug!(path = %self.path.display(), "Open file closed");
        result
    }

    fn touch(&self) -> Result<(), OpenFileError> {
        let mut lifecycle = self.lifecycle.lock().map_err(|_| OpenFileError::Poisoned)?;
        lifecycle.modified = SystemTime::now();
        lifecycle.modified_dirty = true;
        Ok(())
    }
}

/// A cleartext channel over an [`OpenFile`], with its own position cursor.
///
/// Operations on one channel are sequentially consistent from the caller's
/// point of view; operations across channels on the same file serialize on
/// the file's internal locks. Closing the channel (explicitly or on drop)
/// releases its reference; the last release flushes the file.
#[derive(Debug)]
pub struct CleartextChannel {
    file: Arc<OpenFile>,
    registry: Arc<super::registry::OpenFileRegistry>,
    readable: bool,
    writable: bool,
    append: bool,
    position: Mutex<u64>,
    closed: AtomicBool,
}

impl CleartextChannel {
    pub(crate) fn new(
        file: Arc<OpenFile>,
        registry: Arc<super::registry::OpenFileRegistry>,
        options: OpenOptions,
    ) -> Self {
        Self {
            file,
            registry,
            readable: options.read || !options.write,
            writable: options.write || options.append || options.create || options.create_new,
            append: options.append,
            position: Mutex::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> Result<u64, OpenFileError> {
        self.check_open()?;
        Ok(self.file.size())
    }

    pub fn modified(&self) -> Result<SystemTime, OpenFileError> {
        self.check_open()?;
        self.file.modified()
    }

    /// Read from the cursor, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, OpenFileError> {
        self.check_readable()?;
        let mut pos = self.position.lock().map_err(|_| OpenFileError::Poisoned)?;
        let n = self.file.read_at(*pos, buf)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Read at an explicit offset without moving the cursor.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, OpenFileError> {
        self.check_readable()?;
        self.file.read_at(offset, buf)
    }

    /// Write at the cursor (or at EOF in append mode), advancing it.
    pub fn write(&self, buf: &[u8]) -> Result<usize, OpenFileError> {
        self.check_writable()?;
        let mut pos = self.position.lock().map_err(|_| OpenFileError::Poisoned)?;
        let offset = if self.append { self.file.size() } else { *pos };
        let n = self.file.write_at(offset, buf)?;
        *pos = offset + n as u64;
        Ok(n)
    }

    /// Write at an explicit offset without moving the cursor.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, OpenFileError> {
        self.check_writable()?;
        self.file.write_at(offset, buf)
    }

    /// Position the cursor at an absolute cleartext offset.
    pub fn seek(&self, offset: u64) -> Result<(), OpenFileError> {
        self.check_open()?;
        *self.position.lock().map_err(|_| OpenFileError::Poisoned)? = offset;
        Ok(())
    }

    pub fn truncate(&self, len: u64) -> Result<(), OpenFileError> {
        self.check_writable()?;
        self.file.truncate(len)
    }

    /// Flush dirty chunks without closing.
    pub fn flush(&self) -> Result<(), OpenFileError> {
        self.check_open()?;
        self.file.flush()
    }

    /// Close this channel, releasing its reference on the shared file.
    pub fn close(&self) -> Result<(), OpenFileError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(OpenFileError::ChannelClosed);
        }
        self.registry.release(&self.file)
    }

    fn check_open(&self) -> Result<(), OpenFileError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OpenFileError::ChannelClosed);
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<(), OpenFileError> {
        self.check_open()?;
        if !self.readable {
            return Err(OpenFileError::BadChannelMode { operation: "read" });
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), OpenFileError> {
        self.check_open()?;
        if !self.writable {
            return Err(OpenFileError::BadChannelMode { operation: "write" });
        }
        Ok(())
    }
}

impl Drop for CleartextChannel {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                warn!(path = %self.file.path().display(), error = %e, "Error closing channel on drop");
            }
        }
    }
}

impl From<OpenFileError> for io::Error {
    fn from(e: OpenFileError) -> Self {
        match e {
            OpenFileError::ChunkIo(ChunkIoError::Io { source, .. }) => source,
            OpenFileError::NotOpen { .. } | OpenFileError::ChannelClosed => {
                io::Error::new(io::ErrorKind::BrokenPipe, e)
            }
            OpenFileError::BadChannelMode { .. } => {
                io::Error::new(io::ErrorKind::PermissionDenied, e)
            }
            other => io::Error::other(other),
        }
    }
}
