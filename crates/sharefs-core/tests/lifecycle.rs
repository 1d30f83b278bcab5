// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::{Arc, Barrier};
use std::thread;

use sharefs_core::options::{access_mask, create_options};
use sharefs_core::{
    Access, BackstoreMode, CleanupFlags, Disposition, FaultErrno, FaultInjectingBackend,
    FaultInjector, FaultOp, FaultPolicy, FaultRule, FsConfig, FsError, InMemoryBackend, LockMode,
    NormalizedPath, OpenRequest, ShareFs, WriteMode,
};

fn memfs() -> ShareFs {
    ShareFs::new(FsConfig::default()).expect("in-memory fs")
}

fn write_file(fs: &ShareFs, path: &str, data: &[u8]) {
    let (h, _) = fs
        .open(path, &OpenRequest::create_file(Access::read_write(), Disposition::OverwriteIf))
        .unwrap();
    fs.write(h, data, 0, WriteMode::default()).unwrap();
    fs.close(h);
}

fn mkdir(fs: &ShareFs, path: &str) {
    let (h, _) = fs.open(path, &OpenRequest::create_dir()).unwrap();
    fs.close(h);
}

fn read_all(fs: &ShareFs, path: &str) -> Vec<u8> {
    let (h, info) = fs.open(path, &OpenRequest::open(Access::read_only())).unwrap();
    let mut buf = vec![0u8; info.file_size as usize];
    if !buf.is_empty() {
        fs.read(h, &mut buf, 0).unwrap();
    }
    fs.close(h);
    buf
}

fn deletable() -> OpenRequest {
    OpenRequest::open(Access::read_write().with_delete())
}

#[test]
fn ordinary_opens_coexist_but_delete_access_conflicts() {
    let fs = memfs();
    write_file(&fs, "\\doc.txt", b"text");

    let (a, _) = fs.open("\\doc.txt", &OpenRequest::open(Access::read_only())).unwrap();
    let (b, _) = fs.open("/doc.txt", &OpenRequest::open(Access::read_write())).unwrap();
    assert!(matches!(fs.open("\\doc.txt", &deletable()), Err(FsError::SharingViolation)));

    fs.close(a);
    fs.close(b);
    let (c, _) = fs.open("\\doc.txt", &deletable()).unwrap();
    assert!(matches!(
        fs.open("\\doc.txt", &OpenRequest::open(Access::read_only())),
        Err(FsError::SharingViolation)
    ));
    fs.close(c);
    assert!(fs.locker().table().is_empty());
}

#[test]
fn open_children_protect_ancestors() {
    let fs = memfs();
    mkdir(&fs, "/a");
    mkdir(&fs, "/a/b");
    write_file(&fs, "/a/b/c", b"");

    let (leaf, _) = fs.open("/a/b/c", &OpenRequest::open(Access::read_only())).unwrap();
    for ancestor in ["/a", "/a/b", "\\a\\b\\c"] {
        assert!(
            matches!(fs.open(ancestor, &deletable()), Err(FsError::SharingViolation)),
            "{ancestor} should be busy"
        );
    }
    // A sibling is unaffected.
    write_file(&fs, "/a/b/d", b"");
    let (sibling, _) = fs.open("/a/b/d", &deletable()).unwrap();
    fs.close(sibling);
    fs.close(leaf);

    let (dir, _) = fs.open("/a/b", &deletable()).unwrap();
    fs.close(dir);
    assert!(fs.locker().table().is_empty());
}

#[test]
fn delete_on_close_removes_at_cleanup() {
    let fs = memfs();
    write_file(&fs, "/tmp.bin", b"scratch");
    let (h, _) = fs.open("/tmp.bin", &deletable().delete_on_close()).unwrap();
    assert!(fs.is_pending_delete(h).unwrap());
    assert_eq!(fs.lock_mode(h).unwrap(), LockMode::Exclusive);

    fs.cleanup(h, CleanupFlags::default()).unwrap();
    assert!(matches!(fs.attributes_by_name("/tmp.bin"), Err(FsError::NotFound)));
    // The path stays locked until close.
    assert!(!fs.locker().table().is_empty());
    assert!(matches!(fs.get_file_info(h), Err(FsError::InvalidHandle)));

    fs.close(h);
    assert!(fs.locker().table().is_empty());
    assert_eq!(fs.open_handles(), 0);
}

#[test]
fn cleanup_delete_flag_from_driver_word() {
    let fs = memfs();
    mkdir(&fs, "/dir");
    let (h, _) = fs.open("/dir", &OpenRequest::open(Access::read_only().with_delete())).unwrap();
    fs.cleanup(h, CleanupFlags::from_raw(CleanupFlags::DELETE)).unwrap();
    fs.close(h);
    assert!(matches!(fs.attributes_by_name("/dir"), Err(FsError::NotFound)));
}

#[test]
fn supersede_downgrades_unless_opened_for_delete() {
    let fs = memfs();
    write_file(&fs, "/s", b"old contents");

    let supersede = OpenRequest::create_file(Access::read_write(), Disposition::Supersede);
    let (h, info) = fs.open("/s", &supersede).unwrap();
    assert_eq!(info.file_size, 0);
    assert_eq!(fs.lock_mode(h).unwrap(), LockMode::Shared);
    let (other, _) = fs.open("/s", &OpenRequest::open(Access::read_only())).unwrap();
    fs.close(other);
    fs.close(h);

    let retained = OpenRequest {
        access: Access::read_write().with_delete(),
        ..supersede
    };
    let (h, _) = fs.open("/s", &retained).unwrap();
    assert_eq!(fs.lock_mode(h).unwrap(), LockMode::Exclusive);
    assert!(matches!(
        fs.open("/s", &OpenRequest::open(Access::read_only())),
        Err(FsError::SharingViolation)
    ));
    fs.close(h);
}

#[test]
fn overwrite_truncates_and_supersede_releases_exclusivity() {
    let fs = memfs();
    write_file(&fs, "/o", b"0123456789");

    let (h, _) = fs.open("/o", &OpenRequest::open(Access::read_write())).unwrap();
    assert_eq!(fs.overwrite(h, false).unwrap().file_size, 0);
    fs.close(h);

    write_file(&fs, "/o", b"again");
    let request = OpenRequest {
        disposition: Disposition::Supersede,
        ..OpenRequest::open(Access::read_write())
    };
    let (h, _) = fs.open("/o", &request).unwrap();
    assert_eq!(fs.overwrite(h, true).unwrap().file_size, 0);
    assert_eq!(fs.lock_mode(h).unwrap(), LockMode::Shared);
    fs.close(h);
}

#[test]
fn rename_to_read_locked_target_is_a_sharing_violation() {
    let fs = memfs();
    write_file(&fs, "/src", b"payload");
    write_file(&fs, "/dst", b"");

    let (reader, _) = fs.open("/dst", &OpenRequest::open(Access::read_only())).unwrap();
    let (h, _) = fs.open("/src", &deletable()).unwrap();
    let before = fs.locker().table().snapshot();

    assert!(matches!(fs.rename(h, "/dst", true), Err(FsError::SharingViolation)));
    assert_eq!(fs.locker().table().snapshot(), before);
    assert_eq!(fs.handle_path(h).unwrap(), NormalizedPath::new("/src"));
    assert_eq!(read_all(&fs, "/dst"), b"");

    fs.close(reader);
    fs.close(h);
    assert!(fs.locker().table().is_empty());
}

#[test]
fn rename_moves_lock_and_keeps_identity() {
    let fs = memfs();
    write_file(&fs, "/old.txt", b"moved");
    let (h, info) = fs.open("/old.txt", &deletable()).unwrap();

    fs.rename(h, "\\new.txt", false).unwrap();
    assert_eq!(fs.handle_path(h).unwrap(), NormalizedPath::new("/new.txt"));
    assert_eq!(fs.get_file_info(h).unwrap().index_number, info.index_number);

    // The old name is free again, the new one is held.
    write_file(&fs, "/old.txt", b"fresh");
    assert!(matches!(
        fs.open("/new.txt", &OpenRequest::open(Access::read_only())),
        Err(FsError::SharingViolation)
    ));
    let mut buf = [0u8; 5];
    fs.read(h, &mut buf, 0).unwrap();
    assert_eq!(&buf, b"moved");
    fs.close(h);

    assert_eq!(read_all(&fs, "/new.txt"), b"moved");
    assert!(fs.locker().table().is_empty());
}

#[test]
fn rename_without_replace_reports_collision() {
    let fs = memfs();
    write_file(&fs, "/a", b"a");
    write_file(&fs, "/b", b"b");
    let (h, _) = fs.open("/a", &deletable()).unwrap();
    assert!(matches!(fs.rename(h, "/b", false), Err(FsError::AlreadyExists)));
    fs.rename(h, "/b", true).unwrap();
    fs.close(h);
    assert_eq!(read_all(&fs, "/b"), b"a");
}

#[test]
fn rename_requires_exclusive_handle() {
    let fs = memfs();
    write_file(&fs, "/a", b"");
    let (h, _) = fs.open("/a", &OpenRequest::open(Access::read_write())).unwrap();
    assert!(matches!(fs.rename(h, "/b", false), Err(FsError::AccessDenied)));
    fs.close(h);
}

#[test]
fn failing_backend_rename_keeps_source() {
    let inner = Arc::new(InMemoryBackend::new());
    let injector = Arc::new(FaultInjector::new());
    let backend = Arc::new(FaultInjectingBackend::new(inner, Arc::clone(&injector)));
    let fs = ShareFs::with_backend(FsConfig::default(), backend);
    write_file(&fs, "/src", b"kept");

    let (h, _) = fs.open("/src", &deletable()).unwrap();
    injector.set_policy(FaultPolicy {
        enabled: true,
        rules: vec![FaultRule {
            op: FaultOp::Rename,
            errno: FaultErrno::Eio,
            max_faults: Some(1),
            ..FaultRule::default()
        }],
    });

    assert!(matches!(fs.rename(h, "/dst", false), Err(FsError::Io(_))));
    assert_eq!(fs.handle_path(h).unwrap(), NormalizedPath::new("/src"));
    assert_eq!(fs.lock_mode(h).unwrap(), LockMode::Exclusive);
    assert!(fs.locker().table().state_of(&NormalizedPath::new("/dst")).is_none());
    assert_eq!(fs.get_file_info(h).unwrap().file_size, 4);

    // The fault is spent; a retry goes through.
    fs.rename(h, "/dst", false).unwrap();
    fs.close(h);
    assert_eq!(read_all(&fs, "/dst"), b"kept");
}

#[test]
fn closed_handles_are_invalid_and_close_is_idempotent() {
    let fs = memfs();
    write_file(&fs, "/f", b"x");
    let (h, _) = fs.open("/f", &OpenRequest::open(Access::read_only())).unwrap();
    fs.close(h);
    fs.close(h);

    let mut buf = [0u8; 1];
    assert!(matches!(fs.read(h, &mut buf, 0), Err(FsError::InvalidHandle)));
    assert!(matches!(fs.get_file_info(h), Err(FsError::InvalidHandle)));
    assert!(matches!(fs.rename(h, "/g", true), Err(FsError::InvalidHandle)));
    assert!(matches!(
        fs.cleanup(h, CleanupFlags { delete: true }),
        Err(FsError::InvalidHandle)
    ));
    assert!(fs.locker().table().is_empty());
}

#[test]
fn raw_driver_words_drive_open() {
    let fs = memfs();
    let options = (2 << 24) | create_options::FILE_NON_DIRECTORY_FILE;
    let access = access_mask::FILE_READ_DATA | access_mask::FILE_WRITE_DATA;
    let request = OpenRequest::from_raw(options, access).unwrap();
    let (h, info) = fs.create("\\raw.txt", &request, 0).unwrap();
    assert_eq!(info.file_size, 0);
    fs.close(h);
    assert!(matches!(fs.create("\\raw.txt", &request, 0), Err(FsError::AlreadyExists)));

    let options = (1 << 24) | create_options::FILE_DELETE_ON_CLOSE;
    let request = OpenRequest::from_raw(options, access_mask::DELETE).unwrap();
    let (h, _) = fs.open("\\raw.txt", &request).unwrap();
    fs.cleanup(h, CleanupFlags::default()).unwrap();
    fs.close(h);
    assert!(fs.attributes_by_name("\\raw.txt").is_err());
}

#[test]
fn concurrent_readers_keep_writer_out() {
    let fs = Arc::new(memfs());
    write_file(&fs, "/shared", b"data");
    let barrier = Arc::new(Barrier::new(3));

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let (h, _) = fs.open("/shared", &OpenRequest::open(Access::read_only())).unwrap();
                barrier.wait();
                barrier.wait();
                fs.close(h);
            })
        })
        .collect();

    barrier.wait();
    assert!(matches!(fs.open("/shared", &deletable()), Err(FsError::SharingViolation)));
    barrier.wait();
    for reader in readers {
        reader.join().unwrap();
    }

    let (h, _) = fs.open("/shared", &deletable()).unwrap();
    fs.close(h);
}

#[test]
fn host_backend_end_to_end() {
    let temp = tempfile::tempdir().unwrap();
    let config = FsConfig {
        backstore: BackstoreMode::HostFs {
            root: temp.path().to_path_buf(),
        },
        ..FsConfig::default()
    };
    let fs = ShareFs::new(config).unwrap();
    mkdir(&fs, "\\docs");
    write_file(&fs, "\\docs\\a.txt", b"host data");
    assert_eq!(std::fs::read(temp.path().join("docs/a.txt")).unwrap(), b"host data");

    let (dir, _) = fs.open("\\docs", &OpenRequest::open(Access::read_only())).unwrap();
    let names: Vec<_> = fs
        .read_directory(dir, None)
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert_eq!(names, vec!["a.txt"]);
    fs.close(dir);

    let (h, _) = fs.open("\\docs\\a.txt", &deletable()).unwrap();
    fs.rename(h, "\\docs\\b.txt", false).unwrap();
    fs.set_delete(h, true).unwrap();
    fs.cleanup(h, CleanupFlags::default()).unwrap();
    fs.close(h);
    assert!(!temp.path().join("docs/a.txt").exists());
    assert!(!temp.path().join("docs/b.txt").exists());
    assert!(fs.locker().table().is_empty());
}
