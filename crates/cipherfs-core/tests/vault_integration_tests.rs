mod common;

use cipherfs_core::error::VaultOperationError;
use cipherfs_core::vault::CleartextFileType;
use cipherfs_core::{OpenOptions, Vault, VaultError, VaultOptions, VaultPath};
use common::{new_vault, sized_content};

const CHUNK: usize = 32 * 1024;

#[test]
fn test_create_write_read_reopen() {
    let tmp = tempfile::TempDir::new().unwrap();
    let root = tmp.path().join("vault");

    {
        let vault = Vault::create(&root, VaultOptions::new("asd")).unwrap();
        let ops = vault.operations();
        ops.create_directory(&VaultPath::new("foo")).unwrap();
        ops.write(&VaultPath::new("foo/bar"), &[1, 2, 3, 4, 5, 6, 7])
            .unwrap();
        vault.close().unwrap();
    }

    let vault = Vault::open(&root, VaultOptions::new("asd")).unwrap();
    let ops = vault.operations();
    assert_eq!(
        ops.metadata(&VaultPath::new("foo/bar")).unwrap().size,
        7
    );
    assert_eq!(
        ops.read(&VaultPath::new("foo/bar")).unwrap(),
        vec![1, 2, 3, 4, 5, 6, 7]
    );
}

#[test]
fn test_wrong_passphrase() {
    let tmp = tempfile::TempDir::new().unwrap();
    let root = tmp.path().join("vault");

    Vault::create(&root, VaultOptions::new("asd"))
        .unwrap()
        .close()
        .unwrap();

    let result = Vault::open(&root, VaultOptions::new("qwe"));
    assert!(matches!(result, Err(VaultError::InvalidPassphrase)));
}

#[test]
fn test_long_name_lands_in_sidecar_tree() {
    let (tmp, vault) = new_vault("pass");
    let ops = vault.operations();

    let long_name = "n".repeat(200);
    ops.create_directory(&VaultPath::new(&long_name)).unwrap();

    // The sidecar tree must now contain exactly this entry's full name.
    let m = tmp.path().join("vault").join("m");
    let sidecars: Vec<_> = walkdir_files(&m);
    assert_eq!(sidecars.len(), 1, "one deflated name, one sidecar");
    assert!(sidecars[0].to_string_lossy().ends_with(".lng"));

    // Listing the root returns the original cleartext name.
    let entries = ops.list_directory(&VaultPath::root()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, long_name);
    assert_eq!(entries[0].kind, CleartextFileType::Directory);

    // And the directory is usable.
    ops.write(&VaultPath::new(format!("{long_name}/inner")), b"deep")
        .unwrap();
    assert_eq!(
        ops.read(&VaultPath::new(format!("{long_name}/inner"))).unwrap(),
        b"deep"
    );
}

#[test]
fn test_symlink_roundtrip() {
    let (_tmp, vault) = new_vault("pass");
    let ops = vault.operations();

    ops.create_directory(&VaultPath::new("a")).unwrap();
    ops.create_symlink(&VaultPath::new("a/link"), "./target")
        .unwrap();

    assert_eq!(
        ops.file_type(&VaultPath::new("a/link")).unwrap(),
        CleartextFileType::Symlink
    );
    assert_eq!(ops.read_symlink(&VaultPath::new("a/link")).unwrap(), "./target");

    let entries = ops.list_directory(&VaultPath::new("a")).unwrap();
    assert_eq!(entries[0].kind, CleartextFileType::Symlink);
    assert_eq!(entries[0].name, "link");
}

#[test]
fn test_cross_vault_copy_distinct_ciphertext() {
    let tmp = tempfile::TempDir::new().unwrap();
    let root1 = tmp.path().join("vault1");
    let root2 = tmp.path().join("vault2");

    let vault1 = Vault::create(&root1, VaultOptions::new("first")).unwrap();
    let vault2 = Vault::create(&root2, VaultOptions::new("second")).unwrap();

    let content: Vec<u8> = (1..=7).collect();
    vault1
        .operations()
        .create_directory(&VaultPath::new("foo"))
        .unwrap();
    vault1
        .operations()
        .write(&VaultPath::new("foo/bar"), &content)
        .unwrap();

    // Copy by reading cleartext from one vault and writing into the other.
    let copied = vault1.operations().read(&VaultPath::new("foo/bar")).unwrap();
    vault2
        .operations()
        .create_directory(&VaultPath::new("bar"))
        .unwrap();
    vault2
        .operations()
        .write(&VaultPath::new("bar/baz"), &copied)
        .unwrap();

    assert_eq!(vault1.operations().read(&VaultPath::new("foo/bar")).unwrap(), content);
    assert_eq!(vault2.operations().read(&VaultPath::new("bar/baz")).unwrap(), content);

    // The two vaults hold different keys, so the ciphertext bytes differ.
    let ct1 = only_regular_file_bytes(&root1.join("d"));
    let ct2 = only_regular_file_bytes(&root2.join("d"));
    assert_ne!(ct1, ct2);
}

#[test]
fn test_attribute_view_is_lazy() {
    let (_tmp, vault) = new_vault("pass");
    let ops = vault.operations();
    let path = VaultPath::new("late.txt");

    // View obtained before the file exists.
    let view = ops.attribute_view(&path);
    assert_eq!(view.status().unwrap().kind, CleartextFileType::Missing);

    ops.write(&path, b"abc").unwrap();
    let status = view.status().unwrap();
    assert_eq!(status.kind, CleartextFileType::File);
    assert_eq!(status.size, 3);

    ops.remove_file(&path).unwrap();
    assert_eq!(view.status().unwrap().kind, CleartextFileType::Missing);
}

#[test]
fn test_size_law_across_chunk_boundaries() {
    let (_tmp, vault) = new_vault("pass");
    let ops = vault.operations();

    for (name, len) in [
        ("empty", 0usize),
        ("one", 1),
        ("chunk_minus", CHUNK - 1),
        ("chunk_exact", CHUNK),
        ("chunk_plus", CHUNK + 1),
        ("two_chunks_plus", 2 * CHUNK + 17),
    ] {
        let path = VaultPath::new(name);
        let content = sized_content(len);
        ops.write(&path, &content).unwrap();

        assert_eq!(ops.metadata(&path).unwrap().size, len as u64, "{name}");
        assert_eq!(ops.read(&path).unwrap(), content, "{name}");
    }
}

#[test]
fn test_random_access_reads_and_writes() {
    let (_tmp, vault) = new_vault("pass");
    let ops = vault.operations();
    let path = VaultPath::new("random.bin");

    let content = sized_content(3 * CHUNK + 500);
    ops.write(&path, &content).unwrap();

    let channel = ops.open(&path, OpenOptions::new().read(true).write(true)).unwrap();

    // Misaligned read spanning a chunk boundary.
    let mut buf = vec![0u8; 1000];
    let n = channel.read_at(CHUNK as u64 - 500, &mut buf).unwrap();
    assert_eq!(n, 1000);
    assert_eq!(buf, content[CHUNK - 500..CHUNK + 500]);

    // Overwrite in the middle of chunk 1, then read it back.
    channel.write_at(CHUNK as u64 + 100, b"PATCH").unwrap();
    let mut patched = vec![0u8; 5];
    channel.read_at(CHUNK as u64 + 100, &mut patched).unwrap();
    assert_eq!(&patched, b"PATCH");

    // Bytes around the patch are untouched.
    let mut before = vec![0u8; 100];
    channel.read_at(CHUNK as u64, &mut before).unwrap();
    assert_eq!(before, content[CHUNK..CHUNK + 100]);

    channel.close().unwrap();
}

#[test]
fn test_write_read_same_channel_is_consistent() {
    let (_tmp, vault) = new_vault("pass");
    let ops = vault.operations();

    let channel = ops
        .open(&VaultPath::new("wr.bin"), OpenOptions::new().read(true).write(true).create(true))
        .unwrap();
    channel.write(b"first ").unwrap();
    channel.write(b"second").unwrap();

    let mut buf = vec![0u8; 12];
    channel.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"first second");
    assert_eq!(channel.size().unwrap(), 12);
    channel.close().unwrap();
}

#[test]
fn test_truncate_shrinks_and_preserves_prefix() {
    let (_tmp, vault) = new_vault("pass");
    let ops = vault.operations();
    let path = VaultPath::new("trunc.bin");

    let content = sized_content(2 * CHUNK + 300);
    ops.write(&path, &content).unwrap();

    let channel = ops.open(&path, OpenOptions::new().read(true).write(true)).unwrap();
    channel.truncate(CHUNK as u64 + 10).unwrap();
    assert_eq!(channel.size().unwrap(), CHUNK as u64 + 10);
    channel.close().unwrap();

    let after = ops.read(&path).unwrap();
    assert_eq!(after.len(), CHUNK + 10);
    assert_eq!(after, content[..CHUNK + 10]);
}

#[test]
fn test_append_mode() {
    let (_tmp, vault) = new_vault("pass");
    let ops = vault.operations();
    let path = VaultPath::new("log.txt");

    ops.write(&path, b"line1\n").unwrap();

    let channel = ops.open(&path, OpenOptions::new().append(true)).unwrap();
    channel.write(b"line2\n").unwrap();
    channel.close().unwrap();

    assert_eq!(ops.read(&path).unwrap(), b"line1\nline2\n");
}

#[test]
fn test_directory_rename_is_cheap() {
    let (tmp, vault) = new_vault("pass");
    let ops = vault.operations();

    ops.create_directory(&VaultPath::new("old")).unwrap();
    ops.create_directory(&VaultPath::new("old/sub")).unwrap();
    ops.write(&VaultPath::new("old/sub/file"), b"payload").unwrap();

    // Snapshot the data tree before the rename.
    let data = tmp.path().join("vault").join("d");
    let before = snapshot(&data);

    ops.rename(&VaultPath::new("old"), &VaultPath::new("new")).unwrap();

    let after = snapshot(&data);
    // Exactly one entry differs: the directory-pointer file was renamed.
    let removed: Vec<_> = before.iter().filter(|p| !after.contains(*p)).collect();
    let added: Vec<_> = after.iter().filter(|p| !before.contains(*p)).collect();
    assert_eq!(removed.len(), 1, "exactly one pointer disappears");
    assert_eq!(added.len(), 1, "exactly one pointer appears");

    // Content is reachable under the new name, not under the old.
    assert_eq!(ops.read(&VaultPath::new("new/sub/file")).unwrap(), b"payload");
    assert!(matches!(
        ops.read(&VaultPath::new("old/sub/file")),
        Err(VaultOperationError::NotFound(_))
    ));
}

#[test]
fn test_file_move_across_directories() {
    let (_tmp, vault) = new_vault("pass");
    let ops = vault.operations();

    ops.create_directory(&VaultPath::new("src")).unwrap();
    ops.create_directory(&VaultPath::new("dst")).unwrap();
    ops.write(&VaultPath::new("src/file"), b"moving").unwrap();

    ops.rename(&VaultPath::new("src/file"), &VaultPath::new("dst/renamed"))
        .unwrap();

    assert_eq!(ops.read(&VaultPath::new("dst/renamed")).unwrap(), b"moving");
    assert_eq!(
        ops.file_type(&VaultPath::new("src/file")).unwrap(),
        CleartextFileType::Missing
    );
}

#[test]
fn test_rename_onto_existing_fails() {
    let (_tmp, vault) = new_vault("pass");
    let ops = vault.operations();

    ops.write(&VaultPath::new("a"), b"1").unwrap();
    ops.write(&VaultPath::new("b"), b"2").unwrap();

    let result = ops.rename(&VaultPath::new("a"), &VaultPath::new("b"));
    assert!(matches!(result, Err(VaultOperationError::AlreadyExists(_))));
}

#[test]
fn test_remove_directory_requires_empty() {
    let (_tmp, vault) = new_vault("pass");
    let ops = vault.operations();

    ops.create_directory(&VaultPath::new("dir")).unwrap();
    ops.write(&VaultPath::new("dir/file"), b"x").unwrap();

    assert!(matches!(
        ops.remove_directory(&VaultPath::new("dir")),
        Err(VaultOperationError::DirectoryNotEmpty(_))
    ));

    ops.remove_file(&VaultPath::new("dir/file")).unwrap();
    ops.remove_directory(&VaultPath::new("dir")).unwrap();
    assert_eq!(
        ops.file_type(&VaultPath::new("dir")).unwrap(),
        CleartextFileType::Missing
    );
}

#[test]
fn test_readonly_vault_rejects_mutations() {
    let tmp = tempfile::TempDir::new().unwrap();
    let root = tmp.path().join("vault");

    Vault::create(&root, VaultOptions::new("pass"))
        .unwrap()
        .close()
        .unwrap();

    let vault = Vault::open(&root, VaultOptions::new("pass").readonly(true)).unwrap();
    let ops = vault.operations();

    assert!(matches!(
        ops.write(&VaultPath::new("f"), b"x"),
        Err(VaultOperationError::ReadOnly)
    ));
    assert!(matches!(
        ops.create_directory(&VaultPath::new("d")),
        Err(VaultOperationError::ReadOnly)
    ));
    assert!(matches!(
        ops.remove_file(&VaultPath::new("f")),
        Err(VaultOperationError::ReadOnly)
    ));

    // Reads still work.
    assert!(ops.list_directory(&VaultPath::root()).unwrap().is_empty());
}

#[test]
fn test_listing_mixed_entries() {
    let (_tmp, vault) = new_vault("pass");
    let ops = vault.operations();

    ops.create_directory(&VaultPath::new("docs")).unwrap();
    ops.write(&VaultPath::new("notes.txt"), b"n").unwrap();
    ops.create_symlink(&VaultPath::new("shortcut"), "docs").unwrap();

    let entries = ops.list_directory(&VaultPath::root()).unwrap();
    let kinds: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            ("docs", CleartextFileType::Directory),
            ("notes.txt", CleartextFileType::File),
            ("shortcut", CleartextFileType::Symlink),
        ]
    );
}

#[test]
fn test_unicode_names_roundtrip() {
    let (_tmp, vault) = new_vault("pass");
    let ops = vault.operations();

    for name in ["résumé.txt", "日本語ファイル", "папка"] {
        ops.write(&VaultPath::new(name), name.as_bytes()).unwrap();
    }

    let entries = ops.list_directory(&VaultPath::root()).unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"résumé.txt"));
    assert!(names.contains(&"日本語ファイル"));
    assert!(names.contains(&"папка"));
}

#[test]
fn test_open_missing_without_create() {
    let (_tmp, vault) = new_vault("pass");
    let result = vault
        .operations()
        .open(&VaultPath::new("ghost"), OpenOptions::new().read(true));
    assert!(matches!(result, Err(VaultOperationError::NotFound(_))));
}

#[test]
fn test_create_new_on_existing_fails() {
    let (_tmp, vault) = new_vault("pass");
    let ops = vault.operations();

    ops.write(&VaultPath::new("f"), b"x").unwrap();
    let result = ops.open(
        &VaultPath::new("f"),
        OpenOptions::new().write(true).create_new(true),
    );
    assert!(matches!(result, Err(VaultOperationError::AlreadyExists(_))));
}

#[test]
fn test_needs_migration_and_unsupported_version() {
    let tmp = tempfile::TempDir::new().unwrap();
    let root = tmp.path().join("vault");

    Vault::create(&root, VaultOptions::new("pass"))
        .unwrap()
        .close()
        .unwrap();

    let masterkey_path = root.join("masterkey.cryptomator");
    let original = std::fs::read_to_string(&masterkey_path).unwrap();

    // A vault claiming an older format needs migration.
    std::fs::write(&masterkey_path, original.replace("\"version\": 6", "\"version\": 5")).unwrap();
    assert!(matches!(
        Vault::open(&root, VaultOptions::new("pass")),
        Err(VaultError::NeedsMigration { found: 5 })
    ));

    // A newer format is unsupported.
    std::fs::write(&masterkey_path, original.replace("\"version\": 6", "\"version\": 7")).unwrap();
    assert!(matches!(
        Vault::open(&root, VaultOptions::new("pass")),
        Err(VaultError::UnsupportedVaultVersion { found: 7 })
    ));
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn walkdir_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(walkdir_files(&path));
            } else {
                files.push(path);
            }
        }
    }
    files
}

fn snapshot(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut paths = walkdir_files(dir);
    paths.sort();
    paths
}

fn only_regular_file_bytes(data_dir: &std::path::Path) -> Vec<u8> {
    let mut files: Vec<_> = walkdir_files(data_dir)
        .into_iter()
        .filter(|p| {
            // Regular file entries carry no marker prefix.
            let name = p.file_name().unwrap().to_string_lossy().to_string();
            !name.starts_with('0') && !name.starts_with("1S")
        })
        .collect();
    files.sort();
    assert_eq!(files.len(), 1, "expected exactly one regular file entry");
    std::fs::read(&files[0]).unwrap()
}
