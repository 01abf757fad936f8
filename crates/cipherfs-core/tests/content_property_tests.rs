mod common;

use cipherfs_core::{OpenOptions, VaultPath};
use common::new_vault;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Whatever bytes go in at whatever offset come back out.
    #[test]
    fn roundtrip_at_arbitrary_offsets(
        content in proptest::collection::vec(any::<u8>(), 0..96 * 1024),
        offset in 0u64..64 * 1024,
    ) {
        let (_tmp, vault) = new_vault("prop");
        let ops = vault.operations();
        let path = VaultPath::new("prop.bin");

        let channel = ops
            .open(&path, OpenOptions::new().read(true).write(true).create(true))
            .unwrap();
        channel.write_at(offset, &content).unwrap();

        let mut read_back = vec![0u8; content.len()];
        let n = channel.read_at(offset, &mut read_back).unwrap();
        prop_assert_eq!(n, content.len());
        prop_assert_eq!(&read_back, &content);

        // Size law: the file ends exactly where the write ended (or is empty
        // if nothing was written).
        let expected = if content.is_empty() { 0 } else { offset + content.len() as u64 };
        prop_assert_eq!(channel.size().unwrap(), expected);
        channel.close().unwrap();
    }

    /// Close and reopen: persisted ciphertext decrypts to the same bytes.
    #[test]
    fn persisted_roundtrip(
        content in proptest::collection::vec(any::<u8>(), 1..80 * 1024),
    ) {
        let (_tmp, vault) = new_vault("prop");
        let ops = vault.operations();
        let path = VaultPath::new("persist.bin");

        ops.write(&path, &content).unwrap();
        prop_assert_eq!(ops.metadata(&path).unwrap().size, content.len() as u64);
        prop_assert_eq!(ops.read(&path).unwrap(), content);
    }
}
