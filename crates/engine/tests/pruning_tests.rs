//! Pruning of obsolete versions through the engine
//!
//! These tests verify that:
//! 1. Pruning leaves versions alone while a transaction that may read them runs
//! 2. Settled AntiValues disappear except at the left edge of a page
//! 3. The cleanup manager removes the edge AntiValues it was offered
//! 4. Rolled back long records leave no long MVV behind

use std::sync::Arc;
use tempfile::TempDir;
use tessera_core::TreeId;
use tessera_engine::{Database, TesseraConfig};

fn open(dir: &TempDir) -> Arc<Database> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Database::open_with_config(dir.path(), TesseraConfig::for_testing()).unwrap()
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

fn mvv_total(db: &Database, tree: TreeId) -> usize {
    let trees = db.tree_store();
    trees
        .data_pages(tree)
        .unwrap()
        .into_iter()
        .map(|page| trees.page_metrics(page).unwrap().mvv_count)
        .sum()
}

#[test]
fn test_prune_primordial_anti_values() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let ex = db.exchange("data", "prune").unwrap();
    let tree = ex.tree();

    let mut txn = db.begin().unwrap();
    for i in 0..5000 {
        txn.store(tree, &key(i), b"value").unwrap();
    }
    for i in (2..5000).step_by(2) {
        assert!(txn.remove(tree, &key(i)).unwrap());
    }

    // The writer is still running: nothing may go.
    db.transaction_index().update_active_transaction_cache();
    let outcome = ex.prune_all(false).unwrap();
    assert_eq!(outcome.versions_removed, 0);
    assert_eq!(ex.stored_key_count().unwrap(), 5000);
    let before = ex.page_metrics(&key(1)).unwrap();

    txn.commit().unwrap();
    db.transaction_index().update_active_transaction_cache();
    let outcome = ex.prune_all(false).unwrap();
    assert!(outcome.changed);

    let edges = outcome.edge_anti_values.len();
    assert_eq!(ex.stored_key_count().unwrap(), 2501 + edges);
    assert_eq!(mvv_total(&db, tree), edges);
    let after = ex.page_metrics(&key(1)).unwrap();
    assert!(after.key_count < before.key_count);
    assert!(after.available_size > before.available_size);

    let mut ex = db.exchange("data", "prune").unwrap();
    assert_eq!(ex.fetch(&key(1)).unwrap(), Some(b"value".to_vec()));
    assert_eq!(ex.fetch(&key(2)).unwrap(), None);
    assert_eq!(ex.keys().unwrap().len(), 2501);
    db.close().unwrap();
}

#[test]
fn test_prune_cleanup_removes_edge_anti_values() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let mut ex = db.exchange("data", "cleanup").unwrap();
    let tree = ex.tree();

    db.transaction(|txn| {
        for i in 0..5000 {
            txn.store(tree, &key(i), b"value")?;
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(ex.remove_all().unwrap(), 5000);

    db.transaction_index().update_active_transaction_cache();
    ex.prune_all(false).unwrap();
    let anti_values = ex.stored_key_count().unwrap();
    assert!(anti_values > 0);
    assert!(anti_values < 5000);
    assert_eq!(anti_values, db.tree_store().data_pages(tree).unwrap().len());

    let cleanup = db.cleanup_manager();
    let before = cleanup.stats();
    let outcome = ex.prune_all(true).unwrap();
    assert_eq!(outcome.edge_anti_values.len(), anti_values);
    cleanup.poll();

    let stats = cleanup.stats();
    assert_eq!(stats.accepted - before.accepted, anti_values as u64);
    assert_eq!(stats.performed - before.performed, anti_values as u64);
    assert_eq!(stats.errors, 0);
    assert_eq!(ex.stored_key_count().unwrap(), 0);
    assert_eq!(db.tree_store().data_pages(tree).unwrap().len(), 1);
    assert!(ex.keys().unwrap().is_empty());
    db.close().unwrap();
}

#[test]
fn test_long_record_rollback_leaves_no_long_mvv() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let ex = db.exchange("data", "long").unwrap();
    let tree = ex.tree();
    let long = vec![7u8; 3000];

    // A concurrent reader keeps every version alive until it finishes.
    let mut ex0 = db.begin().unwrap();

    let mut trx2 = db.begin().unwrap();
    trx2.store(tree, b"x", &long).unwrap();
    trx2.commit().unwrap();

    let mut trx1 = db.begin().unwrap();
    trx1.store(tree, b"x", &vec![9u8; 3000]).unwrap();
    trx1.flush_transaction_buffer().unwrap();
    trx1.rollback().unwrap();

    db.transaction_index().update_active_transaction_cache();
    ex.prune(b"x").unwrap();
    assert!(ex.is_value_long_mvv(b"x").unwrap());

    ex0.commit().unwrap();
    db.transaction_index().cleanup();
    ex.prune(b"x").unwrap();
    assert!(!ex.is_value_long_mvv(b"x").unwrap());

    let mut ex = db.exchange("data", "long").unwrap();
    assert_eq!(ex.fetch(b"x").unwrap(), Some(long));
    db.close().unwrap();
}

#[test]
fn test_rollback_queues_touched_pages() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let tree = db.create_tree("data", "rolled").unwrap();
    let before = db.cleanup_manager().stats();

    let mut txn = db.begin().unwrap();
    txn.store(tree, b"a", b"1").unwrap();
    txn.store(tree, b"b", b"2").unwrap();
    txn.rollback().unwrap();

    let after = db.cleanup_manager().stats();
    assert!(after.accepted + after.refused > before.accepted + before.refused);

    db.set_rollback_pruning(false);
    let before = db.cleanup_manager().stats();
    let mut txn = db.begin().unwrap();
    txn.store(tree, b"c", b"3").unwrap();
    txn.rollback().unwrap();
    let after = db.cleanup_manager().stats();
    assert_eq!(after.accepted, before.accepted);

    db.cleanup_manager().poll();
    db.transaction_index().update_active_transaction_cache();
    db.tree_store().prune_tree(tree).unwrap();
    let mut ex = db.exchange("data", "rolled").unwrap();
    assert!(ex.keys().unwrap().is_empty());
    db.close().unwrap();
}
