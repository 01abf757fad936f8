//! Shared fixtures for integration tests.

use cipherfs_core::{Vault, VaultOptions};
use tempfile::TempDir;

/// Create a fresh vault in a temp directory.
///
/// The temp dir must be kept alive for the duration of the test.
pub fn new_vault(passphrase: &str) -> (TempDir, Vault) {
    let tmp = TempDir::new().expect("temp dir");
    let root = tmp.path().join("vault");
    let vault = Vault::create(&root, VaultOptions::new(passphrase)).expect("create vault");
    (tmp, vault)
}

/// Deterministic pseudo-random content of the given size.
#[allow(dead_code)]
pub fn sized_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
