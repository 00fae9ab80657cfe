//! End-to-end scenarios through the public facade
//!
//! Each scenario drives a database the way an application would: concurrent
//! writers, background checkpoints, repeated crashes and reopens. The
//! invariants checked are the ones an application relies on:
//! - Committed transfers conserve the total across crashes
//! - Background checkpoints advance without any explicit call
//! - Data written across several crash cycles accumulates
//! - The configuration written at first open is used on every reopen

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tessera::{
    AccumulatorKind, CommitPolicy, Database, RetryConfig, TesseraConfig, TreeId, VolumeSpec,
};

const ACCOUNTS: u64 = 10;
const INITIAL_BALANCE: u64 = 1_000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn account(i: u64) -> Vec<u8> {
    format!("account:{:02}", i).into_bytes()
}

fn balance(raw: Option<Vec<u8>>) -> u64 {
    raw.map(|v| String::from_utf8_lossy(&v).parse().unwrap_or(0))
        .unwrap_or(0)
}

fn total(db: &Arc<Database>, tree: TreeId) -> u64 {
    db.transaction(|txn| {
        let mut sum = 0;
        for i in 0..ACCOUNTS {
            sum += balance(txn.fetch(tree, &account(i))?);
        }
        Ok(sum)
    })
    .unwrap()
}

// ============================================================================
// Conservation under contention
// ============================================================================

#[test]
fn concurrent_transfers_conserve_total_across_crash() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = TesseraConfig::for_testing().with_commit_policy(CommitPolicy::Group);
    let tree;
    {
        let db = Database::open_with_config(dir.path(), config).unwrap();
        tree = db.create_tree("data", "bank").unwrap();
        db.transaction(|txn| {
            for i in 0..ACCOUNTS {
                txn.store(tree, &account(i), INITIAL_BALANCE.to_string().as_bytes())?;
            }
            Ok(())
        })
        .unwrap();

        let threads = 4;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads as u64)
            .map(|t| {
                let db = Arc::clone(&db);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for n in 0..25u64 {
                        let from = (t + n) % ACCOUNTS;
                        let to = (t * 3 + n + 1) % ACCOUNTS;
                        if from == to {
                            continue;
                        }
                        let config = RetryConfig::new()
                            .with_max_retries(10_000)
                            .with_max_delay_ms(2);
                        db.transaction_with_retry(config, |txn| {
                            let a = balance(txn.fetch(tree, &account(from))?);
                            let b = balance(txn.fetch(tree, &account(to))?);
                            let amount = a.min(7);
                            txn.store(tree, &account(from), (a - amount).to_string().as_bytes())?;
                            txn.store(tree, &account(to), (b + amount).to_string().as_bytes())?;
                            txn.update_accumulator(tree, 0, AccumulatorKind::Sum, 1)?;
                            Ok(())
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(total(&db, tree), ACCOUNTS * INITIAL_BALANCE);
        db.force().unwrap();
        db.crash();
    }

    let db = Database::open(dir.path()).unwrap();
    assert_eq!(db.startup().report.error_count(), 0);
    assert_eq!(total(&db, tree), ACCOUNTS * INITIAL_BALANCE);
    let transfers = db
        .transaction(|txn| txn.accumulator_value(tree, 0, AccumulatorKind::Sum))
        .unwrap();
    assert!(transfers > 0);
    assert!(transfers <= 100);
    db.close().unwrap();
}

// ============================================================================
// Background checkpoints
// ============================================================================

#[test]
fn background_checkpoint_advances_on_its_own() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = TesseraConfig::for_testing().with_checkpoint_interval_ms(50);
    let tree;
    let checkpointed;
    {
        let db = Database::open_with_config(dir.path(), config).unwrap();
        tree = db.create_tree("data", "ticking").unwrap();
        let at_open = db.journal().last_checkpoint().timestamp;

        db.transaction(|txn| {
            for i in 0..200u32 {
                txn.store(tree, format!("k{:04}", i).as_bytes(), b"before")?;
            }
            Ok(())
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while db.journal().last_checkpoint().timestamp <= at_open {
            assert!(Instant::now() < deadline, "no background checkpoint");
            thread::sleep(Duration::from_millis(10));
        }
        checkpointed = db.journal().last_checkpoint().timestamp;
        let info = db.management_info();
        assert!(info.checkpointer.as_ref().map(|s| s.cycles > 0).unwrap_or(false));
        assert!(info.task_errors().is_empty());

        db.transaction(|txn| txn.store(tree, b"k0000", b"after"))
            .unwrap();
        db.force().unwrap();
        db.crash();
    }

    let db = Database::open(dir.path()).unwrap();
    assert!(db.startup().report.checkpoint_timestamp >= checkpointed);
    let (first, last) = db
        .transaction(|txn| Ok((txn.fetch(tree, b"k0000")?, txn.fetch(tree, b"k0199")?)))
        .unwrap();
    assert_eq!(first, Some(b"after".to_vec()));
    assert_eq!(last, Some(b"before".to_vec()));
    db.close().unwrap();
}

// ============================================================================
// Repeated crashes
// ============================================================================

#[test]
fn repeated_crash_cycles_accumulate_data() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let cycles = 5u32;
    let per_cycle = 40u32;
    let mut tree = None;

    for cycle in 0..cycles {
        let db = Database::open_with_config(dir.path(), TesseraConfig::for_testing()).unwrap();
        assert_eq!(db.startup().report.error_count(), 0);
        let t = db.create_tree("data", "cycles").unwrap();
        if let Some(previous) = tree {
            assert_eq!(previous, t);
        }
        tree = Some(t);

        let mut ex = db.exchange("data", "cycles").unwrap();
        assert_eq!(ex.keys().unwrap().len(), (cycle * per_cycle) as usize);

        db.transaction(|txn| {
            for i in 0..per_cycle {
                let key = format!("c{}:{:03}", cycle, i);
                txn.store(t, key.as_bytes(), &vec![cycle as u8; 64 + i as usize * 10])?;
            }
            Ok(())
        })
        .unwrap();
        if cycle % 2 == 0 {
            db.checkpoint().unwrap();
        }
        db.force().unwrap();
        db.crash();
    }

    let db = Database::open(dir.path()).unwrap();
    let mut ex = db.exchange("data", "cycles").unwrap();
    assert_eq!(ex.keys().unwrap().len(), (cycles * per_cycle) as usize);
    let last = ex.fetch(format!("c{}:{:03}", cycles - 1, per_cycle - 1).as_bytes());
    assert_eq!(
        last.unwrap().map(|v| v.len()),
        Some(64 + (per_cycle as usize - 1) * 10)
    );
    db.close().unwrap();
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn configuration_persists_between_opens() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let volumes = vec![VolumeSpec::new("data", 1), VolumeSpec::new("index", 7)];
    let config = TesseraConfig::for_testing()
        .with_volumes(volumes)
        .with_commit_policy(CommitPolicy::Hard);
    {
        let db = Database::open_with_config(dir.path(), config.clone()).unwrap();
        let tree = db.create_tree("index", "by_name").unwrap();
        assert_eq!(tree.volume().0, 7);
        let mut ex = db.exchange("index", "by_name").unwrap();
        ex.store(b"n", b"1").unwrap();
        db.close().unwrap();
    }

    let db = Database::open(dir.path()).unwrap();
    assert_eq!(db.config(), &config);
    assert_eq!(db.commit_policy(), CommitPolicy::Hard);
    let mut ex = db.exchange("index", "by_name").unwrap();
    assert_eq!(ex.fetch(b"n").unwrap(), Some(b"1".to_vec()));
    db.close().unwrap();
}
