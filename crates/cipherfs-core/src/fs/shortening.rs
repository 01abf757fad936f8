//! Long-name deflation via content-addressed sidecar files.
//!
//! Encrypted names grow with the cleartext name and can exceed host filename
//! limits. Names longer than [`SHORTENING_THRESHOLD`] characters are
//! "deflated": the on-disk entry is renamed to the BASE32-encoded SHA-1 of
//! the full name plus a `.lng` suffix, and the full name is stored in a
//! sidecar under `m/`. The sidecar name contains the hash of its own
//! contents, so a sidecar is immutable once written: the same full name
//! always deflates to byte-identical sidecar contents, and two different
//! names never share one.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use data_encoding::BASE32;
use ring::digest;
use thiserror::Error;
use tracing::{debug, trace};

/// Maximum on-disk name length (marker prefix included) before deflation.
pub const SHORTENING_THRESHOLD: usize = 222;

/// Suffix identifying a deflated name.
pub const LONG_NAME_SUFFIX: &str = ".lng";

#[derive(Error, Debug)]
pub enum ShorteningError {
    #[error("IO error accessing long-name sidecar {path:?}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// The sidecar contents do not hash to the sidecar's own name.
    #[error("Corrupt long-name sidecar {path:?}: contents do not match name")]
    Corrupt { path: PathBuf },

    /// The referenced sidecar does not exist.
    #[error("Missing long-name sidecar {path:?}")]
    Missing { path: PathBuf },
}

/// Codec mapping over-long ciphertext names to `.lng` sidecar references.
///
/// Pure apart from the one-time sidecar write on first deflation.
#[derive(Debug, Clone)]
pub struct LongNameCodec {
    /// The vault's `m/` directory.
    metadata_dir: PathBuf,
}

impl LongNameCodec {
    pub fn new(metadata_dir: impl Into<PathBuf>) -> Self {
        Self {
            metadata_dir: metadata_dir.into(),
        }
    }

    /// Whether an on-disk name is a deflated reference.
    #[must_use]
    pub fn is_deflated(name: &str) -> bool {
        name.ends_with(LONG_NAME_SUFFIX)
    }

    /// Whether a full ciphertext name requires deflation.
    #[must_use]
    pub fn needs_deflation(name: &str) -> bool {
        name.len() > SHORTENING_THRESHOLD
    }

    /// The deflated form of a full name, without touching the filesystem.
    #[must_use]
    pub fn deflated_name(full_name: &str) -> String {
        let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, full_name.as_bytes());
        let mut name = BASE32.encode(hash.as_ref());
        name.push_str(LONG_NAME_SUFFIX);
        name
    }

    /// Deflate a full ciphertext name, writing the sidecar on first use.
    ///
    /// Returns the deflated on-disk name. If the sidecar already exists its
    /// contents are verified against `full_name`; a mismatch is corruption.
    pub fn deflate(&self, full_name: &str) -> Result<String, ShorteningError> {
        let deflated = Self::deflated_name(full_name);
        let sidecar = self.sidecar_path(&deflated);

        match fs::read_to_string(&sidecar) {
            Ok(existing) => {
                if existing == full_name {
                    trace!(?sidecar, "Long-name sidecar already present");
                    return Ok(deflated);
                }
                return Err(ShorteningError::Corrupt { path: sidecar });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(ShorteningError::Io { source, path: sidecar }),
        }

        let parent = sidecar.parent().expect("sidecar path always has a parent");
        fs::create_dir_all(parent).map_err(|source| ShorteningError::Io {
            source,
            path: parent.to_path_buf(),
        })?;

        // Content-addressed, so a concurrent writer produces identical bytes;
        // losing the persist race is not an error.
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|source| {
            ShorteningError::Io {
                source,
                path: parent.to_path_buf(),
            }
        })?;
        tmp.write_all(full_name.as_bytes())
            .map_err(|source| ShorteningError::Io {
                source,
                path: sidecar.clone(),
            })?;
        match tmp.persist_noclobber(&sidecar) {
            Ok(_) => debug!(?sidecar, "Wrote long-name sidecar"),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                trace!(?sidecar, "Lost sidecar write race");
            }
            Err(e) => {
                return Err(ShorteningError::Io {
                    source: e.error,
                    path: sidecar,
                })
            }
        }

        Ok(deflated)
    }

    /// Inflate a deflated name by reading its sidecar.
    pub fn inflate(&self, deflated_name: &str) -> Result<String, ShorteningError> {
        let sidecar = self.sidecar_path(deflated_name);

        let full_name = match fs::read_to_string(&sidecar) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ShorteningError::Missing { path: sidecar })
            }
            Err(source) => return Err(ShorteningError::Io { source, path: sidecar }),
        };

        // The sidecar is content-addressed; verify before trusting it.
        if Self::deflated_name(&full_name) != deflated_name {
            return Err(ShorteningError::Corrupt { path: sidecar });
        }

        Ok(full_name)
    }

    /// Sidecar location: `m/<s[0..2]>/<s[2..4]>/<deflated>`.
    fn sidecar_path(&self, deflated_name: &str) -> PathBuf {
        self.metadata_dir
            .join(&deflated_name[0..2])
            .join(&deflated_name[2..4])
            .join(deflated_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn codec() -> (TempDir, LongNameCodec) {
        let tmp = TempDir::new().unwrap();
        let codec = LongNameCodec::new(tmp.path().join("m"));
        (tmp, codec)
    }

    #[test]
    fn test_threshold() {
        assert!(!LongNameCodec::needs_deflation(&"A".repeat(222)));
        assert!(LongNameCodec::needs_deflation(&"A".repeat(223)));
    }

    #[test]
    fn test_deflate_inflate_roundtrip() {
        let (_tmp, codec) = codec();
        let full_name = format!("0{}", "MZXW6YTBOI".repeat(30));

        let deflated = codec.deflate(&full_name).unwrap();
        assert!(deflated.ends_with(LONG_NAME_SUFFIX));
        assert_eq!(deflated.len(), 32 + LONG_NAME_SUFFIX.len());

        let inflated = codec.inflate(&deflated).unwrap();
        assert_eq!(inflated, full_name);
    }

    #[test]
    fn test_deflation_is_idempotent() {
        let (tmp, codec) = codec();
        let full_name = "B".repeat(300);

        let a = codec.deflate(&full_name).unwrap();
        let b = codec.deflate(&full_name).unwrap();
        assert_eq!(a, b);

        // Exactly one sidecar, with byte-identical contents on both calls.
        let sidecar = tmp
            .path()
            .join("m")
            .join(&a[0..2])
            .join(&a[2..4])
            .join(&a);
        assert_eq!(std::fs::read_to_string(sidecar).unwrap(), full_name);
    }

    #[test]
    fn test_inflate_missing_sidecar() {
        let (_tmp, codec) = codec();
        let deflated = LongNameCodec::deflated_name("whatever");

        let result = codec.inflate(&deflated);
        assert!(matches!(result, Err(ShorteningError::Missing { .. })));
    }

    #[test]
    fn test_inflate_detects_corruption() {
        let (tmp, codec) = codec();
        let full_name = "C".repeat(300);
        let deflated = codec.deflate(&full_name).unwrap();

        // Overwrite the sidecar with different contents.
        let sidecar = tmp
            .path()
            .join("m")
            .join(&deflated[0..2])
            .join(&deflated[2..4])
            .join(&deflated);
        std::fs::write(&sidecar, "not the original name").unwrap();

        let result = codec.inflate(&deflated);
        assert!(matches!(result, Err(ShorteningError::Corrupt { .. })));
    }

    #[test]
    fn test_sharded_layout() {
        let (tmp, codec) = codec();
        let full_name = "D".repeat(400);

        let deflated = codec.deflate(&full_name).unwrap();
        let shard = tmp.path().join("m").join(&deflated[0..2]).join(&deflated[2..4]);
        assert!(shard.join(&deflated).is_file());
    }
}
