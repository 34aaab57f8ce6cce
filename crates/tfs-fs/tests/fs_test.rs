use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tempfile::TempDir;
use tfs_codec::CodecChain;
use tfs_fs::{open_store, Ctx, Fs, FsError, FsOptions, FsUser, SetAttr, ROOT_INO};
use tfs_storage::BackendKind;

fn memory_fs(options: FsOptions) -> Arc<Fs> {
    let store = open_store(BackendKind::Memory, "".as_ref(), CodecChain::identity()).unwrap();
    Arc::new(Fs::mount(Arc::new(store), options).unwrap())
}

fn root_user(options: FsOptions) -> FsUser {
    FsUser::new(memory_fs(options), Ctx::root())
}

fn small_extents() -> FsOptions {
    FsOptions {
        embedded_size: 64,
        extent_size: 256,
        ..FsOptions::default()
    }
}

fn pattern() -> Vec<u8> {
    b"0123456789".repeat(10)
}

#[test]
fn test_small_file_round_trip() {
    let user = root_user(FsOptions::default());
    user.mkdir("/public", 0o777).unwrap();

    let flags = libc::O_WRONLY | libc::O_CREAT;
    let mut file = user.open_file("/public/file", flags, 0o777).unwrap();
    file.write_all(&pattern()).unwrap();
    file.close().unwrap();

    let file = user.open_file("/public/file", libc::O_RDONLY, 0).unwrap();
    let data = file.read_at(7, 20).unwrap();
    assert_eq!(data, &pattern()[7..27]);
    assert!(data.starts_with(b"7890123456789012345"));
    assert_eq!(file.stat().unwrap().size, 100);
}

#[test]
fn test_hard_link() {
    let user = root_user(FsOptions::default());
    user.write_file("/a", b"data", 0o644).unwrap();
    user.link("/a", "/b").unwrap();
    assert_eq!(user.stat("/a").unwrap().nlink, 2);
    assert_eq!(user.stat("/b").unwrap().nlink, 2);
    assert_eq!(user.stat("/a").unwrap().ino, user.stat("/b").unwrap().ino);

    user.unlink("/a").unwrap();
    assert!(matches!(user.stat("/a"), Err(FsError::NotFound)));
    assert_eq!(user.read_file("/b").unwrap(), b"data");
    assert_eq!(user.stat("/b").unwrap().nlink, 1);
}

#[test]
fn test_write_past_embedded_size_moves_to_extents() {
    let user = root_user(small_extents());
    let inline = vec![7u8; 64];
    user.write_file("/f", &inline, 0o644).unwrap();
    assert_eq!(user.read_file("/f").unwrap(), inline);

    let mut file = user.open_file("/f", libc::O_RDWR, 0).unwrap();
    file.seek(SeekFrom::End(0)).unwrap();
    file.write_all(b"x").unwrap();
    file.close().unwrap();

    let data = user.read_file("/f").unwrap();
    assert_eq!(data.len(), 65);
    assert_eq!(&data[..64], &inline[..]);
    assert_eq!(data[64], b'x');
}

#[test]
fn test_write_straddling_extent_boundary() {
    let user = root_user(small_extents());
    let base: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
    user.write_file("/f", &base, 0o644).unwrap();

    let file = user.open_file("/f", libc::O_RDWR, 0).unwrap();
    file.write_at(250, b"ABCDEFGHIJKL").unwrap();
    file.close().unwrap();

    let mut expected = base.clone();
    expected[250..262].copy_from_slice(b"ABCDEFGHIJKL");
    assert_eq!(user.read_file("/f").unwrap(), expected);
}

#[test]
fn test_sparse_write_reads_zeros() {
    let user = root_user(small_extents());
    let file = user
        .open_file("/sparse", libc::O_RDWR | libc::O_CREAT, 0o644)
        .unwrap();
    file.write_at(1000, b"end").unwrap();
    let data = file.read_at(0, 2000).unwrap();
    assert_eq!(data.len(), 1003);
    assert!(data[..1000].iter().all(|b| *b == 0));
    assert_eq!(&data[1000..], b"end");
}

#[test]
fn test_truncate_via_setattr() {
    let user = root_user(small_extents());
    let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
    user.write_file("/f", &data, 0o644).unwrap();
    let fs = user.fs();
    let ino = user.stat("/f").unwrap().ino;

    let shrink = SetAttr {
        size: Some(300),
        ..SetAttr::default()
    };
    assert_eq!(fs.setattr(&Ctx::root(), ino, &shrink).unwrap().size, 300);
    let grow = SetAttr {
        size: Some(400),
        ..SetAttr::default()
    };
    fs.setattr(&Ctx::root(), ino, &grow).unwrap();

    let read = user.read_file("/f").unwrap();
    assert_eq!(&read[..300], &data[..300]);
    assert!(read[300..].iter().all(|b| *b == 0));

    let tiny = SetAttr {
        size: Some(10),
        ..SetAttr::default()
    };
    fs.setattr(&Ctx::root(), ino, &tiny).unwrap();
    assert_eq!(user.read_file("/f").unwrap(), &data[..10]);
}

#[test]
fn test_stream_io() {
    let user = root_user(small_extents());
    let mut file = user
        .open_file("/stream", libc::O_RDWR | libc::O_CREAT, 0o644)
        .unwrap();
    for chunk in pattern().chunks(7) {
        file.write_all(chunk).unwrap();
    }
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut back = Vec::new();
    file.read_to_end(&mut back).unwrap();
    assert_eq!(back, pattern());
    assert_eq!(file.seek(SeekFrom::Current(-10)).unwrap(), 90);
}

#[test]
fn test_directories() {
    let user = root_user(FsOptions::default());
    user.mkdir("/d", 0o755).unwrap();
    user.mkdir("/d/sub", 0o755).unwrap();
    user.write_file("/d/file", b"x", 0o644).unwrap();
    assert_eq!(user.stat("/d").unwrap().nlink, 3);
    assert_eq!(user.stat("/").unwrap().nlink, 3);

    let mut names = user.list_dir("/d").unwrap();
    names.sort();
    assert_eq!(names, vec!["file", "sub"]);

    assert!(matches!(user.rmdir("/d"), Err(FsError::NotEmpty)));
    assert!(matches!(user.rmdir("/d/file"), Err(FsError::NotDir)));
    assert!(matches!(user.unlink("/d/sub"), Err(FsError::IsDir)));
    assert!(matches!(user.mkdir("/d/sub", 0o755), Err(FsError::Exists)));

    user.remove("/d/file").unwrap();
    user.remove("/d/sub").unwrap();
    user.rmdir("/d").unwrap();
    assert!(user.list_dir("/").unwrap().is_empty());
    assert_eq!(user.stat("/").unwrap().nlink, 2);
}

#[test]
fn test_readdir_cursor_resumes() {
    let user = root_user(FsOptions::default());
    for i in 0..10 {
        user.write_file(&format!("/f{i}"), b"", 0o644).unwrap();
    }
    let fs = user.fs();
    let fh = fs.opendir(&Ctx::root(), ROOT_INO).unwrap();
    let first = fs.readdir(fh, 0, 4).unwrap();
    assert_eq!(first.len(), 4);
    assert_eq!(first.last().unwrap().offset, 4);

    let rest = fs.readdir(fh, 4, 100).unwrap();
    assert_eq!(rest.len(), 6);

    // Seeking back re-scans from the start
    let again = fs.readdir(fh, 2, 2).unwrap();
    assert_eq!(again[0].name, first[2].name);
    fs.releasedir(fh).unwrap();

    let mut all: Vec<_> = first.iter().chain(&rest).map(|e| e.name.clone()).collect();
    all.dedup();
    assert_eq!(all.len(), 10);
}

#[test]
fn test_rename() {
    let user = root_user(FsOptions::default());
    user.mkdir("/a", 0o755).unwrap();
    user.mkdir("/b", 0o755).unwrap();
    user.write_file("/a/f", b"one", 0o644).unwrap();
    user.write_file("/b/g", b"two", 0o644).unwrap();

    user.rename("/a/f", "/b/g").unwrap();
    assert!(matches!(user.stat("/a/f"), Err(FsError::NotFound)));
    assert_eq!(user.read_file("/b/g").unwrap(), b"one");
    assert_eq!(user.list_dir("/b").unwrap(), vec!["g"]);

    user.rename("/b", "/a/b").unwrap();
    assert_eq!(user.read_file("/a/b/g").unwrap(), b"one");
    assert_eq!(user.stat("/a").unwrap().nlink, 3);
    assert_eq!(user.stat("/").unwrap().nlink, 3);

    // A directory cannot move below itself
    assert!(matches!(
        user.rename("/a", "/a/b/inside"),
        Err(FsError::Invalid(_))
    ));
    user.mkdir("/c", 0o755).unwrap();
    user.write_file("/c/x", b"", 0o644).unwrap();
    assert!(matches!(user.rename("/a/b", "/c"), Err(FsError::NotEmpty)));
    // The failed rename left both trees alone
    assert_eq!(user.read_file("/a/b/g").unwrap(), b"one");
    assert_eq!(user.list_dir("/c").unwrap(), vec!["x"]);
}

#[test]
fn test_symlink() {
    let user = root_user(small_extents());
    user.symlink("/some/where", "/link").unwrap();
    assert_eq!(user.readlink("/link").unwrap(), b"/some/where");
    assert!(user.stat("/link").unwrap().is_symlink());

    let long = "x/".repeat(100);
    user.symlink(&long, "/long").unwrap();
    assert_eq!(user.readlink("/long").unwrap(), long.as_bytes());
}

#[test]
fn test_xattrs() {
    let user = root_user(FsOptions::default());
    user.write_file("/f", b"", 0o644).unwrap();
    user.set_xattr("/f", "user.a", b"1").unwrap();
    user.set_xattr("/f", "user.b", b"2").unwrap();
    assert_eq!(user.get_xattr("/f", "user.a").unwrap(), b"1");
    assert_eq!(user.list_xattr("/f").unwrap(), vec!["user.a", "user.b"]);

    let fs = user.fs();
    let ino = user.stat("/f").unwrap().ino;
    let create = tfs_fs::XATTR_CREATE;
    assert!(matches!(
        fs.setxattr(&Ctx::root(), ino, b"user.a", b"3", create),
        Err(FsError::Exists)
    ));
    assert!(matches!(
        fs.setxattr(&Ctx::root(), ino, b"user.c", b"3", tfs_fs::XATTR_REPLACE),
        Err(FsError::NoData)
    ));

    user.remove_xattr("/f", "user.a").unwrap();
    assert!(matches!(user.get_xattr("/f", "user.a"), Err(FsError::NoData)));
    assert!(matches!(user.remove_xattr("/f", "user.a"), Err(FsError::NoData)));
}

#[test]
fn test_permissions() {
    let fs = memory_fs(FsOptions::default());
    let root = FsUser::new(fs.clone(), Ctx::root());
    root.mkdir("/private", 0o700).unwrap();
    root.write_file("/secret", b"s", 0o600).unwrap();
    root.mkdir("/tmp", 0o1777).unwrap();

    let alice = FsUser::new(fs.clone(), Ctx::new(1000, 1000, 1));
    let bob = FsUser::new(fs.clone(), Ctx::new(1001, 1001, 2));
    assert!(matches!(alice.read_file("/secret"), Err(FsError::Access)));
    assert!(matches!(alice.list_dir("/private"), Err(FsError::Access)));
    assert!(matches!(alice.stat("/private/x"), Err(FsError::Access)));

    alice.write_file("/tmp/mine", b"a", 0o666).unwrap();
    assert!(matches!(bob.unlink("/tmp/mine"), Err(FsError::Perm)));
    alice.unlink("/tmp/mine").unwrap();

    let ino = root.stat("/secret").unwrap().ino;
    let chmod = SetAttr {
        mode: Some(0o644),
        ..SetAttr::default()
    };
    assert!(matches!(
        fs.setattr(&Ctx::new(1000, 1000, 1), ino, &chmod),
        Err(FsError::Perm)
    ));
    fs.setattr(&Ctx::root(), ino, &chmod).unwrap();
    assert_eq!(alice.read_file("/secret").unwrap(), b"s");
}

#[test]
fn test_unlinked_open_file_survives_until_release() {
    let user = root_user(FsOptions::default());
    user.write_file("/f", b"still here", 0o644).unwrap();
    let file = user.open_file("/f", libc::O_RDONLY, 0).unwrap();
    let ino = file.ino();
    user.unlink("/f").unwrap();

    assert_eq!(file.read_at(0, 100).unwrap(), b"still here");
    assert_eq!(user.fs().getattr(ino).unwrap().nlink, 0);
    file.close().unwrap();
    assert!(matches!(user.fs().getattr(ino), Err(FsError::NotFound)));
}

#[test]
fn test_lookup_counts_delay_reclaim() {
    let user = root_user(FsOptions::default());
    user.write_file("/f", b"x", 0o644).unwrap();
    let fs = user.fs();
    let entry = fs.lookup(&Ctx::root(), ROOT_INO, b"f").unwrap();
    user.unlink("/f").unwrap();
    assert!(fs.getattr(entry.ino).is_ok());
    fs.forget(entry.ino, 1).unwrap();
    assert!(matches!(fs.getattr(entry.ino), Err(FsError::NotFound)));
}

#[test]
fn test_concurrent_reclaims_and_lookups() {
    let user = root_user(FsOptions::default());
    user.write_file("/stable", b"s", 0o644).unwrap();
    std::thread::scope(|s| {
        for t in 0..4u8 {
            let user = user.clone();
            s.spawn(move || {
                for i in 0..25 {
                    let path = format!("/r{t}-{i}");
                    user.write_file(&path, &[t; 100], 0o644).unwrap();
                    let file = user.open_file(&path, libc::O_RDONLY, 0).unwrap();
                    let ino = file.ino();
                    user.unlink(&path).unwrap();
                    file.close().unwrap();
                    assert!(matches!(user.fs().getattr(ino), Err(FsError::NotFound)));
                }
            });
        }
        let fs = user.fs().clone();
        s.spawn(move || {
            for _ in 0..200 {
                let entry = fs.lookup(&Ctx::root(), ROOT_INO, b"stable").unwrap();
                fs.forget(entry.ino, 1).unwrap();
            }
        });
    });
    assert_eq!(user.list_dir("/").unwrap(), vec!["stable"]);
}

#[test]
fn test_names_are_validated() {
    let user = root_user(FsOptions::default());
    let long = format!("/{}", "n".repeat(256));
    assert!(matches!(user.mkdir(&long, 0o755), Err(FsError::NameTooLong)));
    assert!(matches!(user.mkdir("/", 0o755), Err(FsError::Invalid(_))));
    assert!(matches!(user.stat("/missing"), Err(FsError::NotFound)));
}

#[test]
fn test_concurrent_writers() {
    let user = root_user(small_extents());
    std::thread::scope(|s| {
        for t in 0..4u8 {
            let user = user.clone();
            s.spawn(move || {
                let path = format!("/t{t}");
                let data = vec![t; 1000];
                user.write_file(&path, &data, 0o644).unwrap();
                assert_eq!(user.read_file(&path).unwrap(), data);
            });
        }
    });
    assert_eq!(user.list_dir("/").unwrap().len(), 4);
}

#[test]
fn test_rename_races_rmdir_of_target_parent() {
    let user = root_user(FsOptions::default());
    user.mkdir("/a", 0o755).unwrap();
    user.mkdir("/a/x", 0o755).unwrap();
    std::thread::scope(|s| {
        let mover = user.clone();
        s.spawn(move || {
            for _ in 0..300 {
                let _ = mover.rename("/a/x", "/a/b/x");
                let _ = mover.rename("/a/b/x", "/a/x");
            }
        });
        let cleaner = user.clone();
        s.spawn(move || {
            for _ in 0..300 {
                let _ = cleaner.mkdir("/a/b", 0o755);
                let _ = cleaner.rmdir("/a/b");
            }
        });
    });
    let at_top = user.stat("/a/x").is_ok();
    let nested = user.stat("/a/b/x").is_ok();
    assert!(at_top ^ nested);
}

#[test]
fn test_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let options = small_extents();
    {
        let store = open_store(BackendKind::File, dir.path(), CodecChain::identity()).unwrap();
        let fs = Arc::new(Fs::mount(Arc::new(store), options.clone()).unwrap());
        let user = FsUser::new(fs.clone(), Ctx::root());
        user.mkdir("/docs", 0o755).unwrap();
        user.write_file("/docs/big", &pattern().repeat(10), 0o644).unwrap();
        fs.flush().unwrap();
        let store = fs.store().clone();
        drop(user);
        drop(fs);
        store.close().unwrap();
    }
    let store = open_store(BackendKind::File, dir.path(), CodecChain::identity()).unwrap();
    let fs = Arc::new(Fs::mount(Arc::new(store), options).unwrap());
    let user = FsUser::new(fs, Ctx::root());
    assert_eq!(user.read_file("/docs/big").unwrap(), pattern().repeat(10));
}

#[test]
fn test_statfs_reports_block_size() {
    let fs = memory_fs(FsOptions::default());
    let stat = fs.statfs().unwrap();
    assert_eq!(stat.bsize, 512);
    assert_eq!(stat.namelen, 255);
}
