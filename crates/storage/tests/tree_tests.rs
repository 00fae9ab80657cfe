//! Integration tests for the tree layer
//!
//! These tests verify that:
//! 1. Concurrent writers splitting the same tree lose no keys
//! 2. Randomized commits and rollbacks match a simple ordered-map model
//! 3. Pruning after many overwrites leaves only the newest committed value
//! 4. Pages written back to a volume reload with the same contents

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use tessera_concurrency::TransactionIndex;
use tessera_core::{PageAddress, TimestampAllocator, TreeId, VolumeId};
use tessera_storage::{
    BufferPool, BufferPoolConfig, CleanupConfig, CleanupManager, PageSource, TreeConfig,
    TreeStore, VersionBody, Volume, VolumeSet,
};

const VOLUME: VolumeId = VolumeId(1);

struct Stack {
    _dir: TempDir,
    volumes: Arc<VolumeSet>,
    index: Arc<TransactionIndex>,
    trees: Arc<TreeStore>,
}

fn stack() -> Stack {
    let dir = TempDir::new().unwrap();
    let volumes = Arc::new(VolumeSet::new());
    volumes.insert(Volume::create(dir.path(), VOLUME, "data", 4096).unwrap());
    let pool = Arc::new(BufferPool::new(
        BufferPoolConfig::for_testing().with_capacity(4096),
        Arc::clone(&volumes) as Arc<dyn PageSource>,
    ));
    let index = Arc::new(TransactionIndex::new(Arc::new(TimestampAllocator::new())));
    let cleanup = Arc::new(CleanupManager::new(CleanupConfig::for_testing()));
    let trees = TreeStore::new(
        pool,
        Arc::clone(&volumes),
        Arc::clone(&index),
        cleanup,
        TreeConfig::for_testing(),
    );
    Stack {
        _dir: dir,
        volumes,
        index,
        trees,
    }
}

fn inline(bytes: &[u8]) -> VersionBody {
    VersionBody::Inline(bytes.to_vec())
}

fn committed_view(s: &Stack, tree: TreeId) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let reader = s.index.begin();
    let view = s
        .trees
        .scan(tree, reader)
        .unwrap()
        .into_iter()
        .map(|(k, body)| match body {
            VersionBody::Inline(v) => (k, v),
            other => panic!("unexpected body {:?}", other),
        })
        .collect();
    s.index.commit(reader).unwrap();
    view
}

#[test]
fn test_concurrent_writers_split_without_losing_keys() {
    let s = stack();
    let tree = s.trees.create_tree(VOLUME, "shared").unwrap();
    let threads = 4u32;
    let per_thread = 1000u32;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let trees = Arc::clone(&s.trees);
            let index = Arc::clone(&s.index);
            thread::spawn(move || {
                let writer = index.begin();
                for i in 0..per_thread {
                    // Interleave the key ranges so every thread splits every leaf.
                    let key = format!("key{:06}", i * threads + t);
                    trees
                        .store(tree, key.as_bytes(), writer, inline(b"payload"), true)
                        .unwrap();
                }
                index.commit(writer).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(s.trees.stats().splits > 0);
    let view = committed_view(&s, tree);
    assert_eq!(view.len(), (threads * per_thread) as usize);
    let keys: Vec<_> = view.keys().cloned().collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_random_commits_and_rollbacks_match_model() {
    let s = stack();
    let tree = s.trees.create_tree(VOLUME, "model").unwrap();
    let mut rng = StdRng::seed_from_u64(0x7e55e7a);
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for round in 0..60 {
        let writer = s.index.begin();
        let mut pending = model.clone();
        for _ in 0..rng.gen_range(1..40) {
            let key = format!("k{:03}", rng.gen_range(0..200)).into_bytes();
            if rng.gen_bool(0.25) {
                s.trees
                    .store(tree, &key, writer, VersionBody::AntiValue, true)
                    .unwrap();
                pending.remove(&key);
            } else {
                let value = format!("r{}-{}", round, rng.gen::<u16>()).into_bytes();
                s.trees
                    .store(tree, &key, writer, inline(&value), true)
                    .unwrap();
                pending.insert(key, value);
            }
        }
        if rng.gen_bool(0.7) {
            s.index.commit(writer).unwrap();
            model = pending;
        } else {
            s.index.rollback(writer).unwrap();
        }

        if round % 10 == 9 {
            s.index.update_active_transaction_cache();
            s.trees.prune_tree(tree).unwrap();
        }
        assert_eq!(committed_view(&s, tree), model, "round {}", round);
    }
}

#[test]
fn test_prune_after_overwrites_keeps_newest() {
    let s = stack();
    let tree = s.trees.create_tree(VOLUME, "overwrites").unwrap();
    for n in 0..20u32 {
        let writer = s.index.begin();
        for i in 0..50u32 {
            let value = format!("{}:{}", i, n);
            s.trees
                .store(tree, format!("k{:02}", i).as_bytes(), writer, inline(value.as_bytes()), true)
                .unwrap();
        }
        s.index.commit(writer).unwrap();
    }

    s.index.update_active_transaction_cache();
    let outcome = s.trees.prune_tree(tree).unwrap();
    assert!(outcome.changed);
    assert!(outcome.versions_removed >= 50 * 19);

    let mvv: usize = s
        .trees
        .data_pages(tree)
        .unwrap()
        .into_iter()
        .map(|page| s.trees.page_metrics(page).unwrap().mvv_count)
        .sum();
    assert_eq!(mvv, 0);
    let view = committed_view(&s, tree);
    assert_eq!(view.len(), 50);
    assert_eq!(view.get(b"k07".as_slice()), Some(&b"7:19".to_vec()));
}

#[test]
fn test_written_pages_reload_from_volume() {
    let s = stack();
    let tree = s.trees.create_tree(VOLUME, "reload").unwrap();
    let writer = s.index.begin();
    for i in 0..300u32 {
        s.trees
            .store(tree, format!("k{:04}", i).as_bytes(), writer, inline(b"persisted"), true)
            .unwrap();
    }
    s.index.commit(writer).unwrap();

    let volume = s.volumes.require(VOLUME).unwrap();
    let pages: Vec<PageAddress> = s.trees.data_pages(tree).unwrap();
    for address in &pages {
        let buffer = s.trees.pool().get(*address).unwrap();
        if let Some((page, _image)) = buffer.take_dirty_image() {
            volume.write_page(&page).unwrap();
        }
    }
    volume.sync().unwrap();

    for address in &pages {
        let page = volume.read_page(address.page).unwrap().unwrap();
        let cached = s.trees.pool().get(*address).unwrap().snapshot();
        assert_eq!(page, cached);
    }
    assert!(volume.write_count() >= pages.len() as u64);
}
