//! Cross-thread and cross-context contention on one cache directory.

mod common;

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tempfile::TempDir;

use common::{data, read_all, test_cache, wait_for, Probe};
use diskcache::{CacheKey, CacheLayout, LockCoordinator, StreamKind};
use diskcache::lock::ReadLockTokens;

const MIB: u64 = 1024 * 1024;

// =============================================================================
// Lock exclusivity
// =============================================================================

#[test]
fn test_single_writer_wins() {
    let temp_dir = TempDir::new().unwrap();
    let layout = CacheLayout::new(temp_dir.path());
    layout.create_dirs().unwrap();
    let entry = layout.entry_path(&CacheKey::new("w", 10, 1));

    const THREADS: usize = 8;
    let barrier = Arc::new(Barrier::new(THREADS));
    let winners = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            // Each thread stands in for a process with its own tokens.
            let coordinator = LockCoordinator::new(layout.clone(), Arc::new(ReadLockTokens::new()));
            let entry = entry.clone();
            let barrier = Arc::clone(&barrier);
            let release = Arc::clone(&release);
            let winners = Arc::clone(&winners);
            thread::spawn(move || {
                barrier.wait();
                let lock = coordinator.acquire_write(&entry);
                if lock.is_ok() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
                // Hold until everyone has tried.
                release.wait();
                drop(lock);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(winners.load(Ordering::SeqCst), 1);
}

#[test]
fn test_read_lock_never_outlives_entry() {
    let temp_dir = TempDir::new().unwrap();
    let layout = CacheLayout::new(temp_dir.path());
    layout.create_dirs().unwrap();
    let entry = layout.entry_path(&CacheKey::new("r", 4, 1));

    let reader = LockCoordinator::new(layout.clone(), Arc::new(ReadLockTokens::new()));
    let deleter = LockCoordinator::new(layout.clone(), Arc::new(ReadLockTokens::new()));

    for _ in 0..200 {
        fs::write(&entry, b"data").unwrap();
        let entry_for_deleter = entry.clone();
        let deleter = deleter.clone();
        let delete = thread::spawn(move || deleter.try_delete(&entry_for_deleter));

        if let Ok(lock) = reader.acquire_read(&entry) {
            assert!(entry.exists(), "entry vanished under a read lock");
            drop(lock);
        }
        delete.join().unwrap();
    }
}

// =============================================================================
// Shared loading
// =============================================================================

#[test]
fn test_concurrent_readers_share_one_fetch() {
    let temp_dir = TempDir::new().unwrap();
    let cache = Arc::new(test_cache(temp_dir.path(), MIB));
    let content = data(200_000);

    let (upstream, stats) = Probe::new(content.clone());
    let leader = cache.get_cached_stream("shared", Some(upstream), 200_000, 1).unwrap();
    assert_eq!(leader.kind(), StreamKind::Cached);

    const READERS: usize = 6;
    let barrier = Arc::new(Barrier::new(READERS));
    let handles: Vec<_> = (0..READERS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let content = content.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let (redundant, _) = Probe::new(content.clone());
                let mut stream = cache
                    .get_cached_stream("shared", Some(redundant), 200_000, 1)
                    .unwrap();
                assert_eq!(stream.kind(), StreamKind::Cached);
                barrier.wait();
                assert_eq!(read_all(&mut stream), content);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    drop(leader);

    assert_eq!(stats.served(), 200_000);
    wait_for(10, "loader to release the entry", || {
        cache.is_entry_complete("shared", 200_000, 1)
    });
    let entry = cache.layout().entry_path(&CacheKey::new("shared", 200_000, 1));
    assert_eq!(fs::read(entry).unwrap(), content);
    assert_eq!(cache.context().loaders().active_count(), 0);
}

#[test]
fn test_caches_in_separate_contexts_never_corrupt_entry() {
    let temp_dir = TempDir::new().unwrap();
    let content = data(64_000);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let root = temp_dir.path().to_path_buf();
            let content = content.clone();
            thread::spawn(move || {
                let cache = test_cache(&root, MIB);
                let (upstream, _) = Probe::new(content.clone());
                let mut stream = cache.get_cached_stream("multi", Some(upstream), 64_000, 1).unwrap();
                assert_eq!(read_all(&mut stream), content);
                stream.close();
                cache.shutdown();
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let cache = test_cache(temp_dir.path(), MIB);
    // One context always ends up writing, fresh or resumed, to the end.
    wait_for(10, "some context to complete the entry", || {
        cache.is_entry_complete("multi", 64_000, 1)
    });
    let mut hit = cache.get_cached_stream("multi", None, 64_000, 1).unwrap();
    assert_eq!(read_all(&mut hit), content);
}
