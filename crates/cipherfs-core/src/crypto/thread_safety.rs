//! Thread safety implementations for cryptographic types.
//!
//! The `MemSafe` type manages memory protection at the OS level and holds a
//! raw pointer, which suppresses the automatic `Send`/`Sync` derivation for
//! [`MasterKey`]. The manual implementations below are sound because every
//! access to the protected memory goes through the surrounding `RwLock`, and
//! the memory protection syscalls (mlock, mprotect) are themselves
//! thread-safe.

use super::keys::MasterKey;

// SAFETY: all fields are wrapped in RwLock which synchronizes access, and the
// memory behind MemSafe's pointer is valid regardless of the accessing thread.
unsafe impl Send for MasterKey {}

// SAFETY: key material is only ever reached through RwLock::read()/write();
// the raw pointer in MemSafe is never dereferenced without holding the lock.
unsafe impl Sync for MasterKey {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn master_key_is_send_and_sync() {
        assert_send::<MasterKey>();
        assert_sync::<MasterKey>();
        assert_send::<Arc<MasterKey>>();
    }

    #[test]
    fn concurrent_key_access() {
        let key = Arc::new(MasterKey::random().expect("generate key"));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let key = Arc::clone(&key);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    key.with_enc_key(|k| k[0]).expect("access key");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("thread completed");
        }
    }
}
