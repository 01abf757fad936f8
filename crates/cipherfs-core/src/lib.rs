//! Encrypting virtual filesystem core.
//!
//! A vault is a directory tree on the host filesystem holding
//! authenticated-encrypted blobs. Callers open a vault with a passphrase
//! and manipulate cleartext paths; this crate translates those operations
//! into reads and writes of the encrypted backing store: name encryption
//! with per-directory binding, directory-id indirection that keeps renames
//! cheap, chunked authenticated content with random access, and a
//! process-wide registry that coordinates concurrent channels on the same
//! file.

pub mod crypto;
pub mod error;
pub mod fs;
pub mod vault;

pub use fs::open_file::{CleartextChannel, OpenOptions};
pub use vault::config::VaultOptions;
pub use vault::operations::VaultOperations;
pub use vault::path::{DirId, VaultPath};
pub use vault::{Vault, VaultError};
