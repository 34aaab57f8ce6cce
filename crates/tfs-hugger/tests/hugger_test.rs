use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use tfs_btree::{iterate_delta, Node};
use tfs_codec::CodecChain;
use tfs_hugger::{
    tree_references, Hugger, HuggerError, HuggerOptions, MergeCallback, Transaction,
};
use tfs_storage::{BackendKind, BlockStatus, BlockStore};

fn store(kind: BackendKind, dir: &TempDir) -> Arc<BlockStore> {
    let refs = tree_references(|_, _| None);
    Arc::new(BlockStore::open(kind, dir.path(), CodecChain::identity(), Some(refs)).unwrap())
}

/// Applies every changed key of `src -> dst` as-is
fn replay() -> MergeCallback {
    Arc::new(|tr: &mut Transaction, src: &Arc<Node>, dst: &Arc<Node>, _local: bool| {
        let tree = tr.tree().clone();
        iterate_delta(&tree, src, dst, |key, _old, new| {
            match new {
                Some(value) => tr.set(key, value)?,
                None => {
                    tr.delete(key)?;
                }
            }
            Ok::<_, HuggerError>(())
        })
    })
}

fn get(h: &Hugger, key: &str) -> Option<String> {
    h.transaction()
        .get(key.as_bytes())
        .unwrap()
        .map(|v| String::from_utf8(v).unwrap())
}

#[test]
fn test_flush_publishes_latest_root() {
    let dir = TempDir::new().unwrap();
    let s = store(BackendKind::Memory, &dir);
    let h = Hugger::open(s.clone(), "fs", HuggerOptions::default()).unwrap();
    assert!(h.root_is_new());

    for round in 0..3 {
        h.update(|tr| {
            for i in 0..200 {
                let key = format!("key{i:04}");
                tr.set(key.as_bytes(), format!("{round}").as_bytes())?;
            }
            Ok::<_, HuggerError>(())
        })
        .unwrap();
    }
    h.flush().unwrap();

    let latest = h.root_block_id().unwrap();
    assert_eq!(s.backend().get_name("fs").unwrap(), Some(latest.clone()));
    // Superseded roots were released
    assert_eq!(
        s.backend().get_block_by_id(&latest).unwrap().unwrap().ref_count,
        1
    );
    assert_eq!(get(&h, "key0042").as_deref(), Some("2"));
}

#[test]
fn test_root_block_id_follows_commits() {
    let dir = TempDir::new().unwrap();
    let s = store(BackendKind::Memory, &dir);
    let h = Hugger::open(s.clone(), "fs", HuggerOptions::default()).unwrap();
    assert_eq!(h.root_block_id(), None);

    h.update(|tr| {
        tr.set(b"k", b"1")?;
        Ok::<_, HuggerError>(())
    })
    .unwrap();
    let first = h.root_block_id().unwrap();
    // Pinned while it is the root, even before a flush
    assert!(s.get_block_by_id(&first).unwrap().is_some());

    h.update(|tr| {
        tr.set(b"k", b"2")?;
        Ok::<_, HuggerError>(())
    })
    .unwrap();
    let second = h.root_block_id().unwrap();
    assert_ne!(first, second);
    h.flush().unwrap();
    assert_eq!(s.get_block_id_by_name("fs").unwrap(), Some(second));
}

#[test]
fn test_tree_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let s = store(BackendKind::File, &dir);
        let h = Hugger::open(s.clone(), "fs", HuggerOptions {
            node_max_size: 256,
            ..Default::default()
        })
        .unwrap();
        h.update(|tr| {
            for i in 0..500u32 {
                tr.set(format!("{i:05}").as_bytes(), &i.to_be_bytes())?;
            }
            Ok::<_, HuggerError>(())
        })
        .unwrap();
        h.flush().unwrap();
        drop(h);
        s.close().unwrap();
    }
    let s = store(BackendKind::File, &dir);
    let h = Hugger::open(s, "fs", HuggerOptions::default()).unwrap();
    assert!(!h.root_is_new());
    let tr = h.transaction();
    assert_eq!(tr.get(b"00321").unwrap(), Some(321u32.to_be_bytes().to_vec()));
    assert_eq!(tr.next_key(b"00321").unwrap(), Some(b"00322".to_vec()));
}

#[test]
fn test_lost_race_without_merge_is_conflict() {
    let dir = TempDir::new().unwrap();
    let h = Hugger::open(store(BackendKind::Memory, &dir), "fs", HuggerOptions::default()).unwrap();

    let mut first = h.transaction();
    let mut second = h.transaction();
    first.set(b"a", b"1").unwrap();
    second.set(b"b", b"2").unwrap();
    assert!(first.try_commit().unwrap());
    assert!(!second.try_commit().unwrap());
    assert!(matches!(second.commit(), Err(HuggerError::Conflict { .. })));
    drop(first);
    assert_eq!(get(&h, "a").as_deref(), Some("1"));
    assert_eq!(get(&h, "b"), None);
}

#[test]
fn test_commit_merges_lost_race() {
    let dir = TempDir::new().unwrap();
    let options = HuggerOptions {
        merge: Some(replay()),
        ..Default::default()
    };
    let h = Hugger::open(store(BackendKind::Memory, &dir), "fs", options).unwrap();
    h.update(|tr| tr.set(b"shared", b"0").map_err(HuggerError::from))
        .unwrap();

    let mut first = h.transaction();
    let mut second = h.transaction();
    first.set(b"a", b"1").unwrap();
    first.set(b"shared", b"first").unwrap();
    second.set(b"b", b"2").unwrap();
    second.delete(b"shared").unwrap();
    first.commit().unwrap();
    second.commit().unwrap();

    assert_eq!(get(&h, "a").as_deref(), Some("1"));
    assert_eq!(get(&h, "b").as_deref(), Some("2"));
    // The later commit replays its delete on top
    assert_eq!(get(&h, "shared"), None);
}

#[test]
fn test_dropped_transaction_releases_staged_blocks() {
    let dir = TempDir::new().unwrap();
    let s = store(BackendKind::Memory, &dir);
    let h = Hugger::open(s.clone(), "fs", HuggerOptions::default()).unwrap();

    let id = {
        let mut tr = h.transaction();
        let id = tr
            .store_block_data(BlockStatus::Normal, b"extent".to_vec())
            .unwrap();
        tr.set(b"file", id.as_bytes()).unwrap();
        assert_eq!(tr.staged_blocks(), 1);
        id
    };
    h.flush().unwrap();
    assert!(s.backend().get_block_by_id(&id).unwrap().is_none());
    assert_eq!(s.backend().get_name("fs").unwrap(), None);
}

#[test]
fn test_update_result_error_skips_commit() {
    let dir = TempDir::new().unwrap();
    let h = Hugger::open(store(BackendKind::Memory, &dir), "fs", HuggerOptions::default()).unwrap();

    let n = h
        .update_result(|tr| {
            tr.set(b"k", b"v")?;
            Ok::<_, HuggerError>(7)
        })
        .unwrap();
    assert_eq!(n, 7);

    let err = h.update_result(|tr| {
        tr.set(b"k", b"other")?;
        Err::<(), _>(HuggerError::Conflict { name: "test".into() })
    });
    assert!(err.is_err());
    assert_eq!(get(&h, "k").as_deref(), Some("v"));
}

#[test]
fn test_flush_waits_for_open_transactions() {
    let dir = TempDir::new().unwrap();
    let h = Hugger::open(store(BackendKind::Memory, &dir), "fs", HuggerOptions::default()).unwrap();
    let mut tr = h.transaction();
    tr.set(b"k", b"v").unwrap();

    let flushed = Arc::new(AtomicBool::new(false));
    let flusher = {
        let h = h.clone();
        let flushed = flushed.clone();
        thread::spawn(move || {
            h.flush().unwrap();
            flushed.store(true, Ordering::SeqCst);
        })
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!flushed.load(Ordering::SeqCst));

    // Nested transactions are not held up by the pending flush
    drop(h.nested_transaction());

    assert!(tr.try_commit().unwrap());
    let id = h.root_block_id().unwrap();
    drop(tr);
    flusher.join().unwrap();
    assert!(flushed.load(Ordering::SeqCst));
    assert_eq!(h.store().backend().get_name("fs").unwrap(), Some(id));
}
