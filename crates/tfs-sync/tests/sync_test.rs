use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use tempfile::TempDir;
use tfs_btree::BlockId;
use tfs_codec::CodecChain;
use tfs_fs::{open_store, Ctx, Fs, FsOptions, FsUser};
use tfs_storage::{BackendKind, BlockStatus};
use tfs_sync::{
    serve, Connection, Connector, Server, SyncBlock, SyncEndpoint, SyncError, TcpEndpoint,
};

struct Instance {
    _dir: TempDir,
    user: FsUser,
    server: Arc<Server>,
}

fn codec() -> CodecChain {
    CodecChain::for_password("sync-secret", "tfs-salt", 1000, true)
}

fn instance(root_name: &str) -> Instance {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(BackendKind::File, dir.path(), codec()).unwrap();
    let options = FsOptions {
        root_name: root_name.to_string(),
        ..FsOptions::default()
    };
    let fs = Arc::new(Fs::mount(Arc::new(store), options).unwrap());
    let server = Arc::new(Server::new(fs.clone(), codec()).unwrap());
    Instance {
        _dir: dir,
        user: FsUser::new(fs, Ctx::root()),
        server,
    }
}

fn connector(x: &Instance, y: &Instance) -> Connector {
    Connector::new(
        Connection::new(x.server.clone(), "r1", "r2"),
        Connection::new(y.server.clone(), "r2", "r1"),
    )
    .unwrap()
}

/// Keeps change times of successive edits strictly ordered
fn tick() {
    sleep(Duration::from_millis(5));
}

#[test]
fn test_sync_two_instances() {
    let x = instance("r1");
    let y = instance("r2");
    tick();
    x.user.write_file("/foo", b"bar", 0o644).unwrap();

    let sync = connector(&x, &y);
    assert!(sync.run().unwrap() > 0);
    assert_eq!(y.user.read_file("/foo").unwrap(), b"bar");

    tick();
    y.user.write_file("/baz", b"qux", 0o644).unwrap();
    sync.run().unwrap();
    assert_eq!(x.user.read_file("/baz").unwrap(), b"qux");
    assert_eq!(x.user.read_file("/foo").unwrap(), b"bar");

    let mut names = x.user.list_dir("/").unwrap();
    names.sort();
    assert_eq!(names, vec!["baz", "foo"]);
}

#[test]
fn test_unchanged_trees_copy_nothing() {
    let x = instance("r1");
    let y = instance("r2");
    tick();
    x.user.mkdir("/dir", 0o755).unwrap();
    x.user.write_file("/dir/file", &vec![7u8; 200_000], 0o644).unwrap();

    let sync = connector(&x, &y);
    sync.run().unwrap();
    assert_eq!(y.user.read_file("/dir/file").unwrap().len(), 200_000);

    sync.run().unwrap();
    assert_eq!(sync.run().unwrap(), 0);
}

#[test]
fn test_conflict_newer_change_wins() {
    let a = instance("r1");
    let b = instance("r2");
    tick();
    a.user.write_file("/shared", b"T0", 0o644).unwrap();
    let sync = connector(&a, &b);
    sync.run().unwrap();
    assert_eq!(b.user.read_file("/shared").unwrap(), b"T0");

    tick();
    a.user.write_file("/shared", b"A", 0o644).unwrap();
    tick();
    b.user.write_file("/shared", b"B", 0o644).unwrap();

    sync.run().unwrap();
    assert_eq!(a.user.read_file("/shared").unwrap(), b"B");
    assert_eq!(b.user.read_file("/shared").unwrap(), b"B");
}

#[test]
fn test_concurrent_directory_entries_converge() {
    let x = instance("r1");
    let y = instance("r2");
    tick();
    x.user.write_file("/seed", b"s", 0o644).unwrap();
    let sync = connector(&x, &y);
    sync.run().unwrap();
    sync.run().unwrap();

    tick();
    x.user.write_file("/a", b"from x", 0o644).unwrap();
    tick();
    y.user.write_file("/b", b"from y", 0o644).unwrap();
    sync.run().unwrap();
    sync.run().unwrap();

    for side in [&x, &y] {
        let mut names = side.user.list_dir("/").unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b", "seed"]);
        assert_eq!(side.user.read_file("/a").unwrap(), b"from x");
        assert_eq!(side.user.read_file("/b").unwrap(), b"from y");
    }
}

#[test]
fn test_local_entry_change_not_overwritten_by_stale_delete() {
    let x = instance("r1");
    let y = instance("r2");
    tick();
    x.user.write_file("/old", b"shared", 0o644).unwrap();
    let sync = connector(&x, &y);
    sync.run().unwrap();
    sync.run().unwrap();

    // x drops the entry while y points the same name at a new file
    tick();
    y.user.unlink("/old").unwrap();
    y.user.write_file("/old", b"replaced", 0o644).unwrap();
    tick();
    x.user.unlink("/old").unwrap();
    x.user.write_file("/other", b"o", 0o644).unwrap();
    sync.run().unwrap();

    assert_eq!(y.user.read_file("/old").unwrap(), b"replaced");
}

#[test]
fn test_remote_delete_propagates() {
    let x = instance("r1");
    let y = instance("r2");
    tick();
    x.user.write_file("/gone", b"soon", 0o644).unwrap();
    let sync = connector(&x, &y);
    sync.run().unwrap();
    assert!(y.user.stat("/gone").is_ok());

    tick();
    x.user.unlink("/gone").unwrap();
    sync.run().unwrap();
    assert!(y.user.stat("/gone").is_err());
}

#[test]
fn test_store_block_checks_id() {
    let x = instance("r1");
    let data = b"payload".to_vec();
    let encoded = {
        use tfs_codec::Codec;
        let wrong = BlockId::for_content(b"other");
        codec().encode(&data, wrong.as_bytes()).unwrap()
    };
    let result = x.server.store_block(
        "r2",
        SyncBlock {
            id: BlockId::for_content(b"other"),
            status: BlockStatus::Weak,
            data: Some(encoded),
            missing: Vec::new(),
        },
    );
    assert!(matches!(result, Err(SyncError::WrongId { .. })));
}

#[test]
fn test_merge_only_into_fs_root() {
    let x = instance("r1");
    let result = x.server.merge_block_name_to("r2", "elsewhere");
    assert!(matches!(result, Err(SyncError::UnsupportedMerge(_))));
}

#[test]
fn test_merge_base_is_the_merged_remote_tree() {
    let x = instance("r1");
    let y = instance("r2");
    tick();
    x.user.write_file("/local", b"x only", 0o644).unwrap();
    tick();
    y.user.write_file("/remote", b"y", 0o644).unwrap();
    connector(&x, &y).run().unwrap();

    let remote = x.server.get_block_id_by_name("r2").unwrap();
    let base = x.server.get_block_id_by_name("r2.r1").unwrap();
    let root = x.server.get_block_id_by_name("r1").unwrap();
    assert!(base.is_some());
    assert_eq!(base, remote);
    assert_ne!(base, root);

    // Nothing new from y: the next merge has no delta to replay
    tick();
    x.user.unlink("/remote").unwrap();
    x.server.merge_block_name_to("r2", "r1").unwrap();
    assert!(x.user.stat("/remote").is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_over_tcp() {
    let x = instance("r1");
    let y = instance("r2");
    tick();
    x.user.write_file("/remote", b"over the wire", 0o644).unwrap();

    let mut endpoints = Vec::new();
    for server in [x.server.clone(), y.server.clone()] {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, server));
        endpoints.push(addr);
    }

    let (left, right) = (endpoints[0], endpoints[1]);
    let copied = tokio::task::spawn_blocking(move || {
        let sync = Connector::new(
            Connection::new(Arc::new(TcpEndpoint::connect(left)?), "r1", "r2"),
            Connection::new(Arc::new(TcpEndpoint::connect(right)?), "r2", "r1"),
        )?;
        sync.run()
    })
    .await
    .unwrap()
    .unwrap();

    assert!(copied > 0);
    assert_eq!(y.user.read_file("/remote").unwrap(), b"over the wire");
}
