//! AES-CTR + HMAC-SHA256 content framing for encrypted files.
//!
//! # File Header Format (88 bytes)
//!
//! | Offset | Size | Description |
//! |--------|------|-------------|
//! | 0      | 16   | Nonce (IV for AES-CTR) |
//! | 16     | 40   | Encrypted payload (8-byte reserved + 32-byte content key) |
//! | 56     | 32   | HMAC-SHA256 over nonce + encrypted payload |
//!
//! # Content Chunk Format (up to 32816 bytes)
//!
//! | Offset | Size | Description |
//! |--------|------|-------------|
//! | 0      | 16   | Chunk nonce |
//! | 16     | n    | AES-CTR encrypted payload (up to 32768 bytes) |
//! | 16+n   | 32   | HMAC-SHA256 over (header nonce + chunk number + nonce + ciphertext) |
//!
//! Chunks are independently authenticated, so a reader can decrypt any chunk
//! without touching the rest of the file. The chunk number inside the MAC
//! pins each chunk to its ordinal position and the header nonce pins it to
//! its file.

use std::fmt;
use std::path::PathBuf;

use aes::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use ring::hmac;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::crypto::keys::{KeyAccessError, MasterKey};

// ============================================================================
// Constants
// ============================================================================

/// Nonce size for AES-CTR (16 bytes).
pub const NONCE_LEN: usize = 16;

/// HMAC-SHA256 output size (32 bytes).
pub const MAC_LEN: usize = 32;

/// Cleartext payload size per chunk (32 KiB).
pub const CHUNK_PAYLOAD_LEN: usize = 32 * 1024;

/// Per-chunk overhead: nonce + MAC.
pub const CHUNK_OVERHEAD: usize = NONCE_LEN + MAC_LEN;

/// Total encrypted chunk size: nonce + payload + MAC.
pub const CHUNK_LEN: usize = CHUNK_PAYLOAD_LEN + CHUNK_OVERHEAD;

/// Header payload size (8-byte reserved + 32-byte content key).
const HEADER_PAYLOAD_LEN: usize = 40;

/// File header size: nonce + encrypted payload + MAC.
pub const HEADER_LEN: usize = NONCE_LEN + HEADER_PAYLOAD_LEN + MAC_LEN; // 88 bytes

/// AES-256-CTR with big-endian 128-bit counter.
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

// ============================================================================
// Chunk math
// ============================================================================

/// Which chunk contains the given cleartext byte offset.
#[inline]
pub fn chunk_index(cleartext_offset: u64) -> u64 {
    cleartext_offset / CHUNK_PAYLOAD_LEN as u64
}

/// Byte offset within a chunk for a given cleartext offset.
#[inline]
pub fn offset_in_chunk(cleartext_offset: u64) -> usize {
    (cleartext_offset % CHUNK_PAYLOAD_LEN as u64) as usize
}

/// Ciphertext file offset of the start of chunk `n`.
#[inline]
pub fn chunk_ciphertext_offset(n: u64) -> u64 {
    HEADER_LEN as u64 + n * CHUNK_LEN as u64
}

/// Ciphertext file size for a given cleartext length.
pub fn ciphertext_size(cleartext_len: u64) -> u64 {
    let full = cleartext_len / CHUNK_PAYLOAD_LEN as u64;
    let partial = cleartext_len % CHUNK_PAYLOAD_LEN as u64;
    let mut size = HEADER_LEN as u64 + full * CHUNK_LEN as u64;
    if partial > 0 {
        size += partial + CHUNK_OVERHEAD as u64;
    }
    size
}

/// Cleartext length for a given ciphertext file size.
///
/// Returns `None` if the size cannot have been produced by the framing above
/// (shorter than a header, or a trailing fragment smaller than the chunk
/// overhead).
pub fn cleartext_size(ciphertext_len: u64) -> Option<u64> {
    let content = ciphertext_len.checked_sub(HEADER_LEN as u64)?;
    let full = content / CHUNK_LEN as u64;
    let remainder = content % CHUNK_LEN as u64;

    let mut size = full * CHUNK_PAYLOAD_LEN as u64;
    if remainder > 0 {
        if remainder <= CHUNK_OVERHEAD as u64 {
            return None;
        }
        size += remainder - CHUNK_OVERHEAD as u64;
    }
    Some(size)
}

/// Cleartext length for a ciphertext size, degrading to 0 on malformed input.
///
/// Size observation must never fail hard on a partially written file; a
/// malformed size is logged and reported as empty.
pub fn cleartext_size_or_zero(ciphertext_len: u64) -> u64 {
    cleartext_size(ciphertext_len).unwrap_or_else(|| {
        warn!(
            ciphertext_len,
            "Malformed ciphertext size, reporting cleartext length 0"
        );
        0
    })
}

// ============================================================================
// Errors
// ============================================================================

/// Context for content crypto operations, carried in error messages.
#[derive(Debug, Clone, Default)]
pub struct FileContext {
    /// The encrypted path on disk
    pub path: Option<PathBuf>,
    /// The chunk ordinal (for chunk errors)
    pub chunk: Option<u64>,
}

impl FileContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_chunk(mut self, chunk: u64) -> Self {
        self.chunk = Some(chunk);
        self
    }
}

impl fmt::Display for FileContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(chunk) = self.chunk {
            parts.push(format!("chunk {chunk}"));
        }
        if let Some(ref path) = self.path {
            parts.push(format!("at {:?}", path.display()));
        }
        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[derive(Error, Debug)]
pub enum ContentCryptoError {
    /// HMAC verification failed - possible tampering or wrong key
    #[error("HMAC verification failed for {context}: possible tampering or wrong key")]
    MacMismatch { context: FileContext },

    /// Invalid header structure
    #[error("Invalid header for {context}: {reason}")]
    InvalidHeader { reason: String, context: FileContext },

    /// Invalid chunk structure
    #[error("Invalid chunk for {context}: {reason}")]
    InvalidChunk { reason: String, context: FileContext },

    /// Key access failed
    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

// ============================================================================
// File header
// ============================================================================

/// Decrypted file header carrying the per-file content key.
///
/// The header nonce is retained after decryption because it participates in
/// every chunk MAC.
pub struct FileHeader {
    pub nonce: [u8; NONCE_LEN],
    pub content_key: Zeroizing<[u8; 32]>,
}

impl fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHeader")
            .field("nonce", &hex::encode(self.nonce))
            .field("content_key", &"[REDACTED]")
            .finish()
    }
}

impl FileHeader {
    /// Create a fresh header with a random nonce and content key.
    pub fn create() -> Self {
        let mut nonce = [0u8; NONCE_LEN];
        let mut content_key = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut nonce);
        rand::rng().fill_bytes(&mut *content_key);
        FileHeader { nonce, content_key }
    }
}

/// Encrypt a file header under the master key.
///
/// Produces the 88-byte on-disk representation: nonce, AES-CTR encrypted
/// payload (reserved bytes + content key), HMAC over both.
pub fn encrypt_header(
    header: &FileHeader,
    master_key: &MasterKey,
) -> Result<Vec<u8>, ContentCryptoError> {
    // Build plaintext: reserved (8 bytes of 0xFF) + content key
    let mut payload = Zeroizing::new(vec![0xFF; 8]);
    payload.extend_from_slice(&*header.content_key);

    let ciphertext = master_key.with_enc_key(|enc_key| {
        let mut cipher = Aes256Ctr::new(enc_key.into(), (&header.nonce).into());
        let mut encrypted = Zeroizing::new(payload.to_vec());
        cipher.apply_keystream(&mut encrypted);
        encrypted.to_vec()
    })?;

    let mac = master_key.with_mac_key(|mac_key| {
        let key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
        let mut data = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        data.extend_from_slice(&header.nonce);
        data.extend_from_slice(&ciphertext);
        hmac::sign(&key, &data)
    })?;

    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(&header.nonce);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(mac.as_ref());
    Ok(out)
}

/// Decrypt a file header, verifying its MAC first.
pub fn decrypt_header(
    encrypted_header: &[u8],
    master_key: &MasterKey,
    context: &FileContext,
) -> Result<FileHeader, ContentCryptoError> {
    trace!("Decrypting file header");

    if encrypted_header.len() != HEADER_LEN {
        warn!(
            actual_size = encrypted_header.len(),
            expected_size = HEADER_LEN,
            "Invalid header size"
        );
        return Err(ContentCryptoError::InvalidHeader {
            reason: format!(
                "expected {HEADER_LEN} bytes, got {} bytes",
                encrypted_header.len()
            ),
            context: context.clone(),
        });
    }

    let nonce: [u8; NONCE_LEN] = encrypted_header[..NONCE_LEN].try_into().unwrap();
    let ciphertext = &encrypted_header[NONCE_LEN..NONCE_LEN + HEADER_PAYLOAD_LEN];
    let expected_mac = &encrypted_header[NONCE_LEN + HEADER_PAYLOAD_LEN..];

    // Verify HMAC first (authenticate-then-decrypt)
    master_key.with_mac_key(|mac_key| {
        let key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
        let computed = hmac::sign(&key, &encrypted_header[..NONCE_LEN + HEADER_PAYLOAD_LEN]);
        if computed.as_ref().ct_eq(expected_mac).into() {
            Ok(())
        } else {
            warn!("Header MAC verification failed");
            Err(ContentCryptoError::MacMismatch {
                context: context.clone(),
            })
        }
    })??;

    let content_key = master_key.with_enc_key(|enc_key| {
        let mut cipher = Aes256Ctr::new(enc_key.into(), (&nonce).into());
        let mut payload = Zeroizing::new(ciphertext.to_vec());
        cipher.apply_keystream(&mut payload);

        // Reserved bytes are 0xFF for current files; tolerated otherwise for
        // forward compatibility.
        if payload[..8] != [0xFF; 8] {
            debug!(
                reserved = ?hex::encode(&payload[..8]),
                "Header has non-standard reserved bytes"
            );
        }

        let mut content_key = Zeroizing::new([0u8; 32]);
        content_key.copy_from_slice(&payload[8..HEADER_PAYLOAD_LEN]);
        content_key
    })?;

    Ok(FileHeader { nonce, content_key })
}

// ============================================================================
// Chunks
// ============================================================================

/// Encrypt one chunk of cleartext at ordinal `chunk_number`.
///
/// `plaintext` must not exceed [`CHUNK_PAYLOAD_LEN`]. The MAC binds the chunk
/// to the header nonce and its ordinal.
pub fn encrypt_chunk(
    plaintext: &[u8],
    chunk_number: u64,
    content_key: &[u8; 32],
    header_nonce: &[u8; NONCE_LEN],
    mac_key: &[u8],
) -> Result<Vec<u8>, ContentCryptoError> {
    if plaintext.len() > CHUNK_PAYLOAD_LEN {
        return Err(ContentCryptoError::InvalidChunk {
            reason: format!(
                "payload too large: {} > {CHUNK_PAYLOAD_LEN}",
                plaintext.len()
            ),
            context: FileContext::new().with_chunk(chunk_number),
        });
    }

    let mut chunk_nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut chunk_nonce);

    let mut ciphertext = plaintext.to_vec();
    let mut cipher = Aes256Ctr::new(content_key.into(), (&chunk_nonce).into());
    cipher.apply_keystream(&mut ciphertext);

    // MAC(header_nonce || chunk_number_be || chunk_nonce || ciphertext)
    let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
    let mut mac_context = hmac::Context::with_key(&hmac_key);
    mac_context.update(header_nonce);
    mac_context.update(&chunk_number.to_be_bytes());
    mac_context.update(&chunk_nonce);
    mac_context.update(&ciphertext);
    let mac = mac_context.sign();

    let mut out = Vec::with_capacity(ciphertext.len() + CHUNK_OVERHEAD);
    out.extend_from_slice(&chunk_nonce);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(mac.as_ref());
    Ok(out)
}

/// Decrypt one chunk read from ciphertext offset of ordinal `chunk_number`.
///
/// The chunk may be a partial trailing chunk; its payload length is whatever
/// remains after nonce and MAC.
pub fn decrypt_chunk(
    chunk: &[u8],
    chunk_number: u64,
    content_key: &[u8; 32],
    header_nonce: &[u8; NONCE_LEN],
    mac_key: &[u8],
    context: &FileContext,
) -> Result<Vec<u8>, ContentCryptoError> {
    let chunk_context = FileContext {
        chunk: Some(chunk_number),
        ..context.clone()
    };

    if chunk.len() < CHUNK_OVERHEAD || chunk.len() > CHUNK_LEN {
        warn!(
            chunk = chunk_number,
            actual_size = chunk.len(),
            "Invalid chunk size"
        );
        return Err(ContentCryptoError::InvalidChunk {
            reason: format!(
                "expected between {CHUNK_OVERHEAD} and {CHUNK_LEN} bytes, got {}",
                chunk.len()
            ),
            context: chunk_context,
        });
    }

    let chunk_nonce: [u8; NONCE_LEN] = chunk[..NONCE_LEN].try_into().unwrap();
    let ciphertext = &chunk[NONCE_LEN..chunk.len() - MAC_LEN];
    let expected_mac = &chunk[chunk.len() - MAC_LEN..];

    // MAC(header_nonce || chunk_number_be || chunk_nonce || ciphertext)
    let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
    let mut mac_context = hmac::Context::with_key(&hmac_key);
    mac_context.update(header_nonce);
    mac_context.update(&chunk_number.to_be_bytes());
    mac_context.update(&chunk_nonce);
    mac_context.update(ciphertext);
    let computed = mac_context.sign();

    if !bool::from(computed.as_ref().ct_eq(expected_mac)) {
        warn!(chunk = chunk_number, "Chunk MAC verification failed");
        return Err(ContentCryptoError::MacMismatch {
            context: chunk_context,
        });
    }

    let mut plaintext = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new(content_key.into(), (&chunk_nonce).into());
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}
