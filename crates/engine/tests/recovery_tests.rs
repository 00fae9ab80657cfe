//! Crash and recovery tests
//!
//! These tests simulate crashes with `Database::crash`, which abandons every
//! background task and discards the buffer pool without writing anything.
//! Reopening the directory recovers from what the journal holds on disk.
//!
//! Key scenarios tested:
//! - Committed work survives a crash, uncommitted work does not
//! - Accumulators resume from the checkpoint plus replayed deltas
//! - Sequence numbers are never handed out twice
//! - Uncommitted versions captured by a checkpoint are pruned at startup
//! - Journal records of a volume that is no longer configured

use std::sync::Arc;
use tempfile::TempDir;
use tessera_core::{Error, TreeId};
use tessera_engine::{AccumulatorKind, CommitPolicy, Database, TesseraConfig, VolumeSpec};

fn open_with(dir: &TempDir, cfg: TesseraConfig) -> Arc<Database> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Database::open_with_config(dir.path(), cfg).unwrap()
}

fn open(dir: &TempDir) -> Arc<Database> {
    open_with(dir, TesseraConfig::for_testing())
}

fn key(i: usize) -> Vec<u8> {
    format!("k{:04}", i).into_bytes()
}

fn fetch(db: &Arc<Database>, tree: TreeId, k: &[u8]) -> Option<Vec<u8>> {
    let mut txn = db.begin().unwrap();
    let value = txn.fetch(tree, k).unwrap();
    txn.commit().unwrap();
    value
}

#[test]
fn test_crash_after_checkpoint_recovers_committed_state() {
    let dir = TempDir::new().unwrap();
    let tree;
    {
        let db = open(&dir);
        tree = db.create_tree("data", "accounts").unwrap();

        let mut txn = db.begin().unwrap();
        for i in 0..100 {
            txn.store(tree, &key(i), b"before").unwrap();
            txn.update_accumulator(tree, 0, AccumulatorKind::Sum, 1).unwrap();
        }
        txn.commit_with_policy(CommitPolicy::Hard).unwrap();
        assert!(db.checkpoint().unwrap().is_some());

        let mut txn = db.begin().unwrap();
        txn.store(tree, b"after", b"checkpoint").unwrap();
        txn.update_accumulator(tree, 0, AccumulatorKind::Sum, 5).unwrap();
        txn.commit_with_policy(CommitPolicy::Hard).unwrap();

        let mut pending = db.begin().unwrap();
        pending.store(tree, b"uncommitted", b"lost").unwrap();
        pending.update_accumulator(tree, 0, AccumulatorKind::Sum, 1000).unwrap();
        pending.flush_transaction_buffer().unwrap();
        db.force().unwrap();

        db.crash();
        assert!(!db.is_open());
    }

    let db = Database::open(dir.path()).unwrap();
    let startup = db.startup();
    assert_eq!(startup.report.error_count(), 0);
    assert!(startup.report.committed_applied >= 1);

    for i in 0..100 {
        assert_eq!(fetch(&db, tree, &key(i)), Some(b"before".to_vec()));
    }
    assert_eq!(fetch(&db, tree, b"after"), Some(b"checkpoint".to_vec()));
    assert_eq!(fetch(&db, tree, b"uncommitted"), None);

    let mut txn = db.begin().unwrap();
    assert_eq!(txn.accumulator_value(tree, 0, AccumulatorKind::Sum).unwrap(), 105);
    txn.commit().unwrap();

    assert!(db.management_info().task_errors().is_empty());
    db.close().unwrap();
}

#[test]
fn test_uncommitted_versions_in_checkpoint_are_pruned() {
    let dir = TempDir::new().unwrap();
    let tree;
    {
        let db = open(&dir);
        tree = db.create_tree("data", "ghosts").unwrap();
        db.transaction(|txn| txn.store(tree, b"real", b"value")).unwrap();

        let mut ghost = db.begin().unwrap();
        ghost.store(tree, b"ghost", b"boo").unwrap();
        let summary = db.checkpoint().unwrap().unwrap();
        assert!(summary.timestamp < ghost.start_timestamp());
        assert!(summary.pages_written > 0);
        db.crash();
    }

    let db = Database::open(dir.path()).unwrap();
    let startup = db.startup();
    assert_eq!(startup.orphaned_transactions, 1);
    assert!(startup.versions_pruned >= 1);
    assert_eq!(fetch(&db, tree, b"ghost"), None);
    assert_eq!(fetch(&db, tree, b"real"), Some(b"value".to_vec()));
    assert_eq!(db.transaction_index().stats().aborted_retained, 0);
    db.close().unwrap();
}

#[test]
fn test_accumulators_survive_clean_reopen() {
    let dir = TempDir::new().unwrap();
    let tree;
    {
        let db = open(&dir);
        tree = db.create_tree("data", "counters").unwrap();
        let mut ex = db.exchange("data", "counters").unwrap();
        ex.update_accumulator(0, AccumulatorKind::Sum, 40).unwrap();
        ex.update_accumulator(0, AccumulatorKind::Sum, 2).unwrap();
        ex.update_accumulator(1, AccumulatorKind::Max, 17).unwrap();
        ex.update_accumulator(1, AccumulatorKind::Max, 3).unwrap();
        ex.update_accumulator(2, AccumulatorKind::Min, -8).unwrap();
        db.close().unwrap();
    }

    let db = Database::open(dir.path()).unwrap();
    let mut ex = db.exchange("data", "counters").unwrap();
    assert_eq!(ex.tree(), tree);
    assert_eq!(ex.accumulator_value(0, AccumulatorKind::Sum).unwrap(), 42);
    assert_eq!(ex.accumulator_value(1, AccumulatorKind::Max).unwrap(), 17);
    assert_eq!(ex.accumulator_value(2, AccumulatorKind::Min).unwrap(), -8);
    assert!(matches!(
        ex.accumulator_value(0, AccumulatorKind::Max),
        Err(Error::InvalidOperation(_))
    ));
    db.close().unwrap();
}

#[test]
fn test_sequence_values_never_reissued() {
    let dir = TempDir::new().unwrap();
    let tree;
    let highest;
    {
        let db = open(&dir);
        tree = db.create_tree("data", "seq").unwrap();

        let mut txn = db.begin().unwrap();
        let first = txn.update_accumulator(tree, 0, AccumulatorKind::Seq, 1).unwrap();
        txn.commit_with_policy(CommitPolicy::Hard).unwrap();

        let mut txn = db.begin().unwrap();
        let second = txn.update_accumulator(tree, 0, AccumulatorKind::Seq, 1).unwrap();
        txn.rollback().unwrap();
        assert!(second > first);
        highest = second;

        db.force().unwrap();
        db.crash();
    }

    {
        let db = Database::open(dir.path()).unwrap();
        let mut txn = db.begin().unwrap();
        let next = txn.update_accumulator(tree, 0, AccumulatorKind::Seq, 1).unwrap();
        assert!(next > highest);
        txn.rollback().unwrap();
        db.close().unwrap();
    }

    let db = Database::open(dir.path()).unwrap();
    let mut txn = db.begin().unwrap();
    let next = txn.update_accumulator(tree, 0, AccumulatorKind::Seq, 1).unwrap();
    assert!(next > highest + 1);
    txn.commit().unwrap();
    db.close().unwrap();
}

#[test]
fn test_rolled_back_and_spilled_transactions() {
    let dir = TempDir::new().unwrap();
    let cfg = TesseraConfig::for_testing().with_transaction_buffer_size(2048);
    let tree;
    {
        let db = open_with(&dir, cfg);
        tree = db.create_tree("data", "spill").unwrap();

        let mut big = db.begin().unwrap();
        for i in 0..200 {
            big.store(tree, &key(i), &[b'v'; 100]).unwrap();
        }
        assert!(big.spill_count() > 0);
        big.commit_with_policy(CommitPolicy::Hard).unwrap();

        let mut rolled = db.begin().unwrap();
        for i in 200..400 {
            rolled.store(tree, &key(i), b"rolled").unwrap();
        }
        assert!(rolled.spill_count() > 0);
        rolled.rollback().unwrap();
        assert_eq!(fetch(&db, tree, &key(300)), None);

        db.force().unwrap();
        db.crash();
    }

    let db = Database::open(dir.path()).unwrap();
    assert_eq!(db.startup().report.error_count(), 0);
    assert!(db.startup().report.aborted >= 1);
    assert_eq!(fetch(&db, tree, &key(150)), Some(vec![b'v'; 100]));
    assert_eq!(fetch(&db, tree, &key(300)), None);
    let mut ex = db.exchange("data", "spill").unwrap();
    assert_eq!(ex.keys().unwrap().len(), 200);
    db.close().unwrap();
}

#[test]
fn test_long_records_survive_crash() {
    let dir = TempDir::new().unwrap();
    let big: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let tree;
    {
        let db = open(&dir);
        tree = db.create_tree("data", "blobs").unwrap();
        let mut txn = db.begin().unwrap();
        txn.store(tree, b"blob", &big).unwrap();
        txn.store(tree, b"small", b"s").unwrap();
        txn.commit_with_policy(CommitPolicy::Hard).unwrap();
        db.crash();
    }

    let db = Database::open(dir.path()).unwrap();
    assert_eq!(db.startup().report.error_count(), 0);
    assert_eq!(fetch(&db, tree, b"blob"), Some(big.clone()));

    // Replacing the long record releases its chain.
    let freed_before = db.tree_store().stats().pages_freed;
    db.transaction(|txn| txn.store(tree, b"blob", b"short now")).unwrap();
    db.transaction_index().cleanup();
    db.tree_store().prune_tree(tree).unwrap();
    assert!(db.tree_store().stats().pages_freed > freed_before);
    assert_eq!(fetch(&db, tree, b"blob"), Some(b"short now".to_vec()));
    db.close().unwrap();
}

#[test]
fn test_missing_volume_fails_unless_ignored() {
    let dir = TempDir::new().unwrap();
    let both = vec![VolumeSpec::new("data", 1), VolumeSpec::new("extra", 2)];
    let data_tree;
    {
        let db = open_with(&dir, TesseraConfig::for_testing().with_volumes(both));
        data_tree = db.create_tree("data", "kept").unwrap();
        let extra_tree = db.create_tree("extra", "dropped").unwrap();
        db.transaction(|txn| {
            txn.store(data_tree, b"a", b"1")?;
            txn.store(extra_tree, b"b", b"2")
        })
        .unwrap();
        db.force().unwrap();
        db.crash();
    }

    let only_data = TesseraConfig::for_testing().with_volumes(vec![VolumeSpec::new("data", 1)]);
    let err = Database::open_with_config(dir.path(), only_data.clone()).unwrap_err();
    assert!(matches!(err, Error::MissingVolume(_)), "unexpected {:?}", err);

    let db = open_with(&dir, only_data.with_ignore_missing_volumes(true));
    assert!(db.startup().report.missing_volume_records > 0);
    assert_eq!(fetch(&db, data_tree, b"a"), Some(b"1".to_vec()));
    db.close().unwrap();
}

#[test]
fn test_copy_back_then_crash() {
    let dir = TempDir::new().unwrap();
    let tree;
    {
        let db = open(&dir);
        tree = db.create_tree("data", "copied").unwrap();
        db.transaction(|txn| {
            for i in 0..50 {
                txn.store(tree, &key(i), b"on disk")?;
            }
            Ok(())
        })
        .unwrap();
        db.copy_back().unwrap();
        let info = db.management_info().journal;
        assert_eq!(info.page_map_size, 0);
        assert_eq!(info.file_count, 1);
        db.crash();
    }

    let db = Database::open(dir.path()).unwrap();
    assert_eq!(db.startup().report.error_count(), 0);
    assert_eq!(db.startup().report.page_images, 0);
    assert_eq!(fetch(&db, tree, &key(49)), Some(b"on disk".to_vec()));
    db.close().unwrap();
}
