//! Integration tests: the store's data path, ordering, pooling and reset.

use std::sync::Arc;
use std::thread;

use tempfile::TempDir;

use hybridlog_core::{CheckpointKind, Config, HybridError, SeekDirection, Store};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_store() -> (Store, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), Config::default().with_session_capacity(8)).unwrap();
    (store, dir)
}

fn key(i: usize) -> Vec<u8> {
    format!("key-{:06}", i).into_bytes()
}

// ---------------------------------------------------------------------------
// Basic Operations
// ---------------------------------------------------------------------------

#[test]
fn test_put_then_get() {
    let (store, _dir) = test_store();
    store.put(b"alpha", b"1").unwrap();
    assert_eq!(store.get(b"alpha").unwrap(), Some(b"1".to_vec()));
    assert!(store.contains(b"alpha").unwrap());
}

#[test]
fn test_missing_key_is_not_an_error() {
    let (store, _dir) = test_store();
    assert_eq!(store.get(b"nope").unwrap(), None);
    assert!(!store.contains(b"nope").unwrap());
}

#[test]
fn test_overwrite_keeps_last_value() {
    let (store, _dir) = test_store();
    store.put(b"k", b"v1").unwrap();
    store.put(b"k", b"v2").unwrap();
    assert_eq!(store.get(b"k").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(store.len(), 1);
}

#[test]
fn test_delete_existing_and_missing() {
    let (store, _dir) = test_store();
    store.put(b"k", b"v").unwrap();
    store.delete(b"k").unwrap();
    assert_eq!(store.get(b"k").unwrap(), None);

    store.delete(b"never-written").unwrap();
    assert_eq!(store.get(b"never-written").unwrap(), None);
    assert!(store.is_empty());
}

#[test]
fn test_empty_key_and_value() {
    let (store, _dir) = test_store();
    store.put(b"", b"").unwrap();
    assert_eq!(store.get(b"").unwrap(), Some(Vec::new()));
}

#[test]
fn test_oversized_key_rejected() {
    let (store, _dir) = test_store();
    let key = vec![7u8; store.config().max_key_size + 1];
    let err = store.put(&key, b"v").unwrap_err();
    assert!(matches!(err, HybridError::OversizedEntry { .. }));
    assert_eq!(store.get(&key).unwrap(), None);
}

// ---------------------------------------------------------------------------
// Ordered Scans
// ---------------------------------------------------------------------------

#[test]
fn test_forward_seek_is_ascending_from_prefix() {
    let (store, _dir) = test_store();
    for k in [&b"b"[..], b"a", b"ba", b"c", b"bb", b"\xff"] {
        store.put(k, k).unwrap();
    }

    let keys: Vec<Vec<u8>> = store.seek(b"b", SeekDirection::Forward).unwrap().keys().collect();
    assert_eq!(keys, vec![b"b".to_vec(), b"ba".to_vec(), b"bb".to_vec(), b"c".to_vec(), b"\xff".to_vec()]);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_backward_seek_is_descending_from_prefix() {
    let (store, _dir) = test_store();
    for k in [&b"b"[..], b"a", b"ba", b"c", b"ab"] {
        store.put(k, k).unwrap();
    }

    let keys: Vec<Vec<u8>> = store.seek(b"b", SeekDirection::Backward).unwrap().keys().collect();
    assert_eq!(keys, vec![b"b".to_vec(), b"ab".to_vec(), b"a".to_vec()]);
    assert!(keys.windows(2).all(|w| w[0] > w[1]));
}

#[test]
fn test_seek_empty_prefix_scans_everything() {
    let (store, _dir) = test_store();
    for i in 0..50 {
        store.put(&key(i), b"v").unwrap();
    }
    store.delete(&key(10)).unwrap();

    let forward: Vec<Vec<u8>> = store.seek(b"", SeekDirection::Forward).unwrap().keys().collect();
    assert_eq!(forward.len(), 49);
    assert_eq!(forward.first(), Some(&key(0)));

    let backward: Vec<Vec<u8>> = store.seek(b"", SeekDirection::Backward).unwrap().keys().collect();
    assert_eq!(backward.first(), Some(&key(49)));
}

#[test]
fn test_seek_values_match_gets() {
    let (store, _dir) = test_store();
    store.put(b"x1", b"one").unwrap();
    store.put(b"x2", b"two").unwrap();

    for (k, v) in store.seek(b"x", SeekDirection::Forward).unwrap() {
        assert_eq!(store.get(&k).unwrap(), Some(v));
    }
}

// ---------------------------------------------------------------------------
// Large Values
// ---------------------------------------------------------------------------

#[test]
fn test_large_values_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), Config::default().with_inline_value_limit(64)).unwrap();

    let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    store.put(b"big", &big).unwrap();
    store.put(b"small", b"tiny").unwrap();

    assert_eq!(store.get(b"big").unwrap(), Some(big.clone()));
    let scanned: Vec<_> = store.seek(b"big", SeekDirection::Forward).unwrap().collect();
    assert_eq!(scanned[0], (b"big".to_vec(), big));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn test_concurrent_distinct_puts_all_visible() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(dir.path(), Config::default().with_session_capacity(4)).unwrap());
    let threads = 8;
    let per_thread = 250;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..per_thread {
                    let n = t * per_thread + i;
                    store.put(&key(n), &n.to_le_bytes()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.len(), threads * per_thread);
    for n in 0..threads * per_thread {
        assert_eq!(store.get(&key(n)).unwrap(), Some(n.to_le_bytes().to_vec()));
    }
    assert!(store.session_pool().created_count() <= 4);
}

#[test]
fn test_concurrent_readers_and_writers() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(dir.path(), Config::default().with_session_capacity(2)).unwrap());
    store.put(b"shared", b"0").unwrap();

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for i in 0..500u32 {
                store.put(b"shared", i.to_string().as_bytes()).unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..500 {
                    assert!(store.get(b"shared").unwrap().is_some());
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(store.get(b"shared").unwrap(), Some(b"499".to_vec()));
}

#[test]
fn test_checkpoint_during_writes() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(dir.path(), Config::default()).unwrap());

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            for i in 0..1000 {
                store.put(&key(i), b"v").unwrap();
            }
        })
    };
    for _ in 0..5 {
        store.checkpoint(CheckpointKind::FoldOver).unwrap();
    }
    writer.join().unwrap();

    assert_eq!(store.len(), 1000);
}

// ---------------------------------------------------------------------------
// Reset and Dispose
// ---------------------------------------------------------------------------

#[test]
fn test_reset_clears_everything() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), Config::default().with_inline_value_limit(8)).unwrap();
    store.put(b"a", b"1").unwrap();
    store.put(b"big", &[9u8; 1024]).unwrap();
    store.checkpoint(CheckpointKind::Standalone).unwrap();
    store.checkpoint(CheckpointKind::FoldOver).unwrap();

    store.reset().unwrap();
    assert!(store.is_empty());
    assert_eq!(store.get(b"a").unwrap(), None);
    assert_eq!(store.get(b"big").unwrap(), None);
    assert!(store.checkpoints().unwrap().is_empty());

    // Still usable afterwards
    store.put(b"b", b"2").unwrap();
    store.dispose().unwrap();

    let store = Store::open(dir.path(), Config::default()).unwrap();
    assert_eq!(store.get(b"a").unwrap(), None);
    assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn test_drop_takes_final_checkpoint() {
    let dir = TempDir::new().unwrap();
    {
        let store = Store::open(dir.path(), Config::default()).unwrap();
        store.put(b"k", b"v").unwrap();
        assert_eq!(store.pending_mutations(), 1);
    }

    let store = Store::open(dir.path(), Config::default()).unwrap();
    let latest = store.latest_checkpoint().unwrap().unwrap();
    assert_eq!(latest.kind, CheckpointKind::Standalone);
    assert_eq!(latest.entry_count, 1);
    assert_eq!(store.pending_mutations(), 0);
}

#[test]
fn test_background_checkpointer() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), Config::default()).unwrap();
    store.start_checkpointer(std::time::Duration::from_millis(20)).unwrap();
    assert!(store.is_checkpointer_running());

    store.put(b"k", b"v").unwrap();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while store.pending_mutations() > 0 && std::time::Instant::now() < deadline {
        thread::sleep(std::time::Duration::from_millis(10));
    }
    assert_eq!(store.pending_mutations(), 0);
    assert!(!store.checkpoints().unwrap().is_empty());

    store.stop_checkpointer();
    assert!(!store.is_checkpointer_running());
}
