//! Journal recovery.
//!
//! Recovery runs in two phases.
//!
//! 1. [`RecoveryManager::scan`] reads every journal file from the base
//!    address of the newest header onward. It locates the last checkpoint,
//!    chooses the page image each page should be read from, and groups
//!    transaction records by start timestamp.
//! 2. [`RecoveredJournal::replay`] hands the recovered state to a
//!    [`RecoveryListener`]: trees, the checkpoint's accumulator values, and
//!    the updates of every transaction committed after the checkpoint, in
//!    commit order.
//!
//! ## Page images
//!
//! An image written before the last checkpoint record is certified. Images
//! written after it are only used if they are always valid (long-record
//! chain pages, which no transaction rewrites in place). Pages whose newer
//! images were discarded are reported so the caller can rewrite them at
//! the recovery checkpoint.
//!
//! ## Damage
//!
//! A truncated or corrupt tail of the newest file is the normal result of a
//! crash and is not an error. Damage anywhere else, and listener failures,
//! are recorded as incidents and skipped. A journal written by another
//! format version aborts recovery.

use crate::config::JournalConfig;
use crate::format::JournalRecord;
use crate::journal::{CheckpointMark, PageNode};
use crate::reader::{JournalReader, ReadStopReason};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tessera_core::{
    DatabaseId, Error, JournalAddress, PageAddress, Result, Timestamp, TreeId,
};
use tessera_storage::{AccumulatorKind, AccumulatorValue, VersionBody};
use tracing::{debug, info, warn};

/// The last checkpoint found in the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredCheckpoint {
    /// Checkpoint timestamp
    pub timestamp: Timestamp,
    /// Address of the checkpoint record
    pub address: JournalAddress,
    /// Lowest address recovery needed when it was written
    pub base_address: JournalAddress,
    /// Committed accumulator values as of `timestamp`
    pub accumulators: Vec<AccumulatorValue>,
    /// Wall-clock time of the checkpoint (ms)
    pub wall_clock_ms: i64,
}

/// Journal records of one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredTransaction {
    /// Address of the first record
    pub first_address: JournalAddress,
    /// Updates in journal order
    pub updates: Vec<(JournalAddress, JournalRecord)>,
    /// Commit timestamp, if a commit record was found
    pub commit: Option<Timestamp>,
    /// Whether a rollback record was found
    pub rolled_back: bool,
}

/// Something recovery skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryIncident {
    /// Where it happened
    pub address: JournalAddress,
    /// Short classification
    pub kind: &'static str,
    /// Detail
    pub message: String,
}

/// What replay did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Journal files read
    pub files_scanned: usize,
    /// Records decoded
    pub records_read: usize,
    /// Pages whose image is read from the journal
    pub page_images: usize,
    /// Transactions whose updates were applied
    pub committed_applied: usize,
    /// Committed transactions already covered by the checkpoint
    pub committed_skipped: usize,
    /// Rolled back or incomplete transactions
    pub aborted: usize,
    /// Timestamp of the checkpoint recovery started from
    pub checkpoint_timestamp: Timestamp,
    /// Largest timestamp seen anywhere in the journal
    pub max_timestamp: Timestamp,
    /// Records skipped because their volume is not open
    pub missing_volume_records: usize,
    /// Whether the newest file ended in a partial record
    pub partial_tail: bool,
    /// Address just past the last valid record
    pub end_address: JournalAddress,
    /// Damage and failures that were skipped
    pub incidents: Vec<RecoveryIncident>,
}

impl RecoveryReport {
    /// Number of incidents.
    pub fn error_count(&self) -> usize {
        self.incidents.len()
    }
}

/// Receives recovered state.
///
/// Errors returned by `store`, `remove`, `delta` and the transaction
/// callbacks are recorded as incidents and replay continues, except
/// `MissingVolume` (fatal unless missing volumes are ignored) and
/// `IncompatibleJournal` (always fatal).
pub trait RecoveryListener {
    /// Called first, with the checkpoint recovery starts from.
    fn start_recovery(&mut self, checkpoint: Option<&RecoveredCheckpoint>) -> Result<()>;

    /// A tree exists.
    fn tree_created(&mut self, tree: TreeId, name: &str) -> Result<()>;

    /// Reapply a store.
    fn store(
        &mut self,
        address: JournalAddress,
        start: Timestamp,
        tree: TreeId,
        key: &[u8],
        body: &VersionBody,
    ) -> Result<()>;

    /// Reapply a remove.
    fn remove(
        &mut self,
        address: JournalAddress,
        start: Timestamp,
        tree: TreeId,
        key: &[u8],
    ) -> Result<()>;

    /// Reapply an accumulator update.
    fn delta(
        &mut self,
        address: JournalAddress,
        start: Timestamp,
        tree: TreeId,
        index: u8,
        kind: AccumulatorKind,
        value: i64,
    ) -> Result<()>;

    /// A transaction committed at `commit`.
    fn transaction_committed(&mut self, start: Timestamp, commit: Timestamp) -> Result<()>;

    /// A transaction rolled back or never finished.
    fn transaction_aborted(&mut self, start: Timestamp) -> Result<()>;

    /// Called last.
    fn end_recovery(&mut self, report: &RecoveryReport) -> Result<()>;
}

/// Everything recovered from the journal files.
#[derive(Debug, Clone, Default)]
pub struct RecoveredJournal {
    files_scanned: usize,
    records_read: usize,
    block_size: Option<u64>,
    database_id: Option<DatabaseId>,
    journal_created_ms: Option<i64>,
    first_generation: Option<u64>,
    next_generation: u64,
    base_address: Option<JournalAddress>,
    end_address: JournalAddress,
    partial_tail: Option<(PathBuf, u64)>,
    checkpoint: Option<RecoveredCheckpoint>,
    page_images: FxHashMap<PageAddress, PageNode>,
    discarded_pages: Vec<PageAddress>,
    trees: Vec<(TreeId, String)>,
    transactions: BTreeMap<Timestamp, RecoveredTransaction>,
    max_timestamp: Timestamp,
    incidents: Vec<RecoveryIncident>,
}

impl RecoveredJournal {
    /// State of a journal that has no files yet.
    pub fn empty() -> Self {
        RecoveredJournal::default()
    }

    /// Whether no journal file was found.
    pub fn is_empty(&self) -> bool {
        self.files_scanned == 0
    }

    /// Block size of the existing journal.
    pub fn block_size(&self) -> Option<u64> {
        self.block_size
    }

    /// Identity of the existing journal.
    pub fn database_id(&self) -> Option<DatabaseId> {
        self.database_id
    }

    /// Creation time of the existing journal.
    pub fn journal_created_ms(&self) -> Option<i64> {
        self.journal_created_ms
    }

    /// Oldest generation still on disk.
    pub fn first_generation(&self) -> Option<u64> {
        self.first_generation
    }

    /// Generation the next file must use.
    pub fn next_generation(&self) -> u64 {
        self.next_generation
    }

    /// Lowest address recovery needed.
    pub fn base_address(&self) -> Option<JournalAddress> {
        self.base_address
    }

    /// Address just past the last valid record.
    pub fn end_address(&self) -> JournalAddress {
        self.end_address
    }

    /// File and valid length of a newest file that ended in a partial or
    /// corrupt record.
    pub fn partial_tail(&self) -> Option<(&PathBuf, u64)> {
        self.partial_tail.as_ref().map(|(p, len)| (p, *len))
    }

    /// The last checkpoint.
    pub fn checkpoint(&self) -> Option<&RecoveredCheckpoint> {
        self.checkpoint.as_ref()
    }

    /// The last checkpoint as the journal tracks it.
    pub fn checkpoint_mark(&self) -> Option<CheckpointMark> {
        self.checkpoint.as_ref().map(|c| CheckpointMark {
            timestamp: c.timestamp,
            address: c.address,
            base_address: c.base_address,
            wall_clock_ms: c.wall_clock_ms,
        })
    }

    /// Timestamp of the last checkpoint, or zero.
    pub fn checkpoint_timestamp(&self) -> Timestamp {
        self.checkpoint.as_ref().map(|c| c.timestamp).unwrap_or(0)
    }

    /// Page images pages should be read from.
    pub fn page_images(&self) -> impl Iterator<Item = (PageAddress, PageNode)> + '_ {
        self.page_images.iter().map(|(p, n)| (*p, *n))
    }

    /// Pages that had images newer than the one chosen.
    pub fn discarded_pages(&self) -> &[PageAddress] {
        &self.discarded_pages
    }

    /// Trees created in the journal.
    pub fn trees(&self) -> &[(TreeId, String)] {
        &self.trees
    }

    /// Transactions by start timestamp.
    pub fn transactions(&self) -> &BTreeMap<Timestamp, RecoveredTransaction> {
        &self.transactions
    }

    /// First record address of every recovered transaction.
    pub fn transaction_addresses(&self) -> impl Iterator<Item = (Timestamp, JournalAddress)> + '_ {
        self.transactions
            .iter()
            .map(|(start, txn)| (*start, txn.first_address))
    }

    /// Largest timestamp seen.
    pub fn max_timestamp(&self) -> Timestamp {
        self.max_timestamp
    }

    /// Damage found while scanning.
    pub fn incidents(&self) -> &[RecoveryIncident] {
        &self.incidents
    }

    /// Hand the recovered state to `listener`.
    pub fn replay(
        &self,
        listener: &mut dyn RecoveryListener,
        ignore_missing_volumes: bool,
    ) -> Result<RecoveryReport> {
        let checkpoint_ts = self.checkpoint_timestamp();
        let mut report = RecoveryReport {
            files_scanned: self.files_scanned,
            records_read: self.records_read,
            page_images: self.page_images.len(),
            checkpoint_timestamp: checkpoint_ts,
            max_timestamp: self.max_timestamp,
            partial_tail: self.partial_tail.is_some(),
            end_address: self.end_address,
            incidents: self.incidents.clone(),
            ..RecoveryReport::default()
        };
        let mut replay = Replay {
            report: &mut report,
            ignore_missing_volumes,
        };

        listener.start_recovery(self.checkpoint.as_ref())?;
        for (tree, name) in &self.trees {
            let result = listener.tree_created(*tree, name);
            replay.check(0, result)?;
        }

        let mut committed: Vec<(Timestamp, Timestamp, &RecoveredTransaction)> = Vec::new();
        let mut aborted: Vec<(Timestamp, &RecoveredTransaction)> = Vec::new();
        for (start, txn) in &self.transactions {
            match txn.commit {
                Some(commit) if !txn.rolled_back => committed.push((commit, *start, txn)),
                _ => aborted.push((*start, txn)),
            }
        }
        committed.sort_by_key(|(commit, start, _)| (*commit, *start));

        for (commit, start, txn) in committed {
            if commit > checkpoint_ts {
                for (address, record) in &txn.updates {
                    let result = apply_update(listener, *address, record, false);
                    replay.check(*address, result)?;
                }
                replay.report.committed_applied += 1;
            } else {
                replay.report.committed_skipped += 1;
            }
            let result = listener.transaction_committed(start, commit);
            replay.check(txn.first_address, result)?;
        }

        // Sequence values handed out by aborted transactions are never
        // reused, so their deltas survive.
        for (start, txn) in aborted {
            for (address, record) in &txn.updates {
                let result = apply_update(listener, *address, record, true);
                replay.check(*address, result)?;
            }
            let result = listener.transaction_aborted(start);
            replay.check(txn.first_address, result)?;
            replay.report.aborted += 1;
        }

        listener.end_recovery(&report)?;
        info!(
            target: "tessera::recovery",
            applied = report.committed_applied,
            skipped = report.committed_skipped,
            aborted = report.aborted,
            incidents = report.error_count(),
            "journal replay complete"
        );
        Ok(report)
    }
}

struct Replay<'a> {
    report: &'a mut RecoveryReport,
    ignore_missing_volumes: bool,
}

impl Replay<'_> {
    /// Classify a listener result.
    fn check(&mut self, address: JournalAddress, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(Error::MissingVolume(message)) if self.ignore_missing_volumes => {
                debug!(target: "tessera::recovery", address, %message, "skipping record of missing volume");
                self.report.missing_volume_records += 1;
                Ok(())
            }
            Err(e @ Error::MissingVolume(_)) | Err(e @ Error::IncompatibleJournal { .. }) => Err(e),
            Err(e) => {
                warn!(target: "tessera::recovery", address, error = %e, "recovery listener failed");
                self.report.incidents.push(RecoveryIncident {
                    address,
                    kind: e.kind(),
                    message: e.to_string(),
                });
                Ok(())
            }
        }
    }
}

fn apply_update(
    listener: &mut dyn RecoveryListener,
    address: JournalAddress,
    record: &JournalRecord,
    sequences_only: bool,
) -> Result<()> {
    match record {
        JournalRecord::Store {
            start,
            tree,
            key,
            body,
        } if !sequences_only => listener.store(address, *start, *tree, key, body),
        JournalRecord::Remove { start, tree, key } if !sequences_only => {
            listener.remove(address, *start, *tree, key)
        }
        JournalRecord::Delta {
            start,
            tree,
            index,
            kind,
            value,
        } if !sequences_only || *kind == AccumulatorKind::Seq => {
            listener.delta(address, *start, *tree, *index, *kind, *value)
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone)]
struct ImageCandidate {
    page: PageAddress,
    node: PageNode,
    always_valid: bool,
}

/// Reads the journal files and reconstructs what they hold.
#[derive(Debug, Clone)]
pub struct RecoveryManager {
    reader: JournalReader,
}

impl RecoveryManager {
    /// Create a recovery manager for the journal at `config.path`.
    pub fn new(config: JournalConfig) -> Self {
        RecoveryManager {
            reader: JournalReader::new(config),
        }
    }

    /// Scan the journal.
    pub fn scan(&self) -> Result<RecoveredJournal> {
        let files = self.reader.list_files()?;
        let mut recovered = RecoveredJournal::empty();
        let (newest, oldest) = match (files.last(), files.first()) {
            (Some(newest), Some(oldest)) => (newest.0, oldest.0),
            _ => {
                info!(target: "tessera::recovery", "no journal files found");
                return Ok(recovered);
            }
        };
        recovered.next_generation = newest + 1;
        recovered.first_generation = Some(oldest);

        // The newest readable header tells where recovery starts.
        let mut anchor = None;
        for (generation, path) in files.iter().rev() {
            match self.reader.read_header(path) {
                Ok(header) => {
                    anchor = Some(header);
                    break;
                }
                Err(e @ Error::IncompatibleJournal { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        target: "tessera::recovery",
                        generation,
                        error = %e,
                        "unreadable journal header"
                    );
                    recovered.incidents.push(RecoveryIncident {
                        address: 0,
                        kind: "CorruptHeader",
                        message: format!("{}: {}", path.display(), e),
                    });
                }
            }
        }
        let anchor = match anchor {
            Some(header) => header,
            None => return Ok(recovered),
        };
        let block_size = anchor.block_size;
        recovered.block_size = Some(block_size);
        recovered.database_id = Some(anchor.database_id);
        recovered.journal_created_ms = Some(anchor.journal_created_ms);
        let start_generation = anchor.base_address / block_size;

        let mut records = Vec::new();
        let readable: Vec<_> = files
            .iter()
            .filter(|(generation, _)| *generation >= start_generation)
            .collect();
        for (position, (generation, path)) in readable.iter().enumerate() {
            let is_newest = position + 1 == readable.len();
            let scan = match self.reader.read_file(path) {
                Ok(scan) => scan,
                Err(e @ Error::IncompatibleJournal { .. }) => return Err(e),
                Err(e) => {
                    if *generation != newest {
                        recovered.incidents.push(RecoveryIncident {
                            address: generation * block_size,
                            kind: "CorruptHeader",
                            message: format!("{}: {}", path.display(), e),
                        });
                    }
                    continue;
                }
            };
            if scan.header.database_id != anchor.database_id {
                recovered.incidents.push(RecoveryIncident {
                    address: generation * block_size,
                    kind: "ForeignFile",
                    message: format!("{} belongs to another database", path.display()),
                });
                continue;
            }
            recovered.files_scanned += 1;
            for (address, message) in scan.undecodable {
                recovered.incidents.push(RecoveryIncident {
                    address,
                    kind: "UndecodableRecord",
                    message,
                });
            }
            match &scan.stop_reason {
                ReadStopReason::EndOfData => {}
                ReadStopReason::PartialRecord { .. } | ReadStopReason::Corrupt { .. }
                    if is_newest =>
                {
                    let valid_len = scan.valid_end - generation * block_size;
                    recovered.partial_tail = Some((path.to_path_buf(), valid_len));
                    debug!(
                        target: "tessera::recovery",
                        generation,
                        valid_len,
                        "journal ends in a partial record"
                    );
                }
                ReadStopReason::PartialRecord { address } => {
                    recovered.incidents.push(RecoveryIncident {
                        address: *address,
                        kind: "PartialRecord",
                        message: format!("{} ends in a partial record", path.display()),
                    });
                }
                ReadStopReason::Corrupt { address, detail } => {
                    warn!(target: "tessera::recovery", address, %detail, "corrupt journal record");
                    recovered.incidents.push(RecoveryIncident {
                        address: *address,
                        kind: "CorruptRecord",
                        message: detail.clone(),
                    });
                }
            }
            recovered.end_address = scan.valid_end;
            recovered.records_read += scan.records.len();
            records.extend(scan.records);
        }

        // The last checkpoint decides which records still matter.
        for read in records.iter().rev() {
            if let JournalRecord::Checkpoint {
                timestamp,
                base_address,
                accumulators,
                wall_clock_ms,
            } = &read.record
            {
                recovered.checkpoint = Some(RecoveredCheckpoint {
                    timestamp: *timestamp,
                    address: read.address,
                    base_address: *base_address,
                    accumulators: accumulators.clone(),
                    wall_clock_ms: *wall_clock_ms,
                });
                break;
            }
        }
        let base = recovered
            .checkpoint
            .as_ref()
            .map(|c| c.base_address)
            .unwrap_or(anchor.base_address);
        recovered.base_address = Some(base);
        let certified_below = recovered.checkpoint.as_ref().map(|c| c.address).unwrap_or(0);

        let mut images: Vec<ImageCandidate> = Vec::new();
        for read in records {
            let address = read.address;
            if let Some(start) = read.record.transaction() {
                recovered.max_timestamp = recovered.max_timestamp.max(start);
            }
            match read.record {
                JournalRecord::TreeCreate { tree, name } => recovered.trees.push((tree, name)),
                JournalRecord::Checkpoint { timestamp, .. } => {
                    recovered.max_timestamp = recovered.max_timestamp.max(timestamp);
                }
                _ if address < base => {}
                JournalRecord::PageImage {
                    page,
                    timestamp,
                    always_valid,
                    ..
                } => {
                    recovered.max_timestamp = recovered.max_timestamp.max(timestamp);
                    images.push(ImageCandidate {
                        page,
                        node: PageNode {
                            address,
                            length: read.length,
                            timestamp,
                        },
                        always_valid,
                    });
                }
                JournalRecord::TxnBegin { start } => {
                    transaction(&mut recovered.transactions, start, address);
                }
                record @ (JournalRecord::Store { .. }
                | JournalRecord::Remove { .. }
                | JournalRecord::Delta { .. }) => {
                    if let Some(start) = record.transaction() {
                        transaction(&mut recovered.transactions, start, address)
                            .updates
                            .push((address, record));
                    }
                }
                JournalRecord::TxnCommit { start, commit } => {
                    recovered.max_timestamp = recovered.max_timestamp.max(commit);
                    transaction(&mut recovered.transactions, start, address).commit = Some(commit);
                }
                JournalRecord::TxnRollback { start } => {
                    transaction(&mut recovered.transactions, start, address).rolled_back = true;
                }
            }
        }

        // Newest usable image per page.
        for candidate in images {
            let usable = candidate.node.address < certified_below || candidate.always_valid;
            if !usable {
                recovered.discarded_pages.push(candidate.page);
                continue;
            }
            let newer = recovered
                .page_images
                .get(&candidate.page)
                .map(|n| n.address < candidate.node.address)
                .unwrap_or(true);
            if newer {
                recovered.page_images.insert(candidate.page, candidate.node);
            }
        }
        recovered.discarded_pages.sort();
        recovered.discarded_pages.dedup();

        info!(
            target: "tessera::recovery",
            files = recovered.files_scanned,
            records = recovered.records_read,
            pages = recovered.page_images.len(),
            transactions = recovered.transactions.len(),
            checkpoint = recovered.checkpoint_timestamp(),
            "journal scanned"
        );
        Ok(recovered)
    }
}

fn transaction(
    transactions: &mut BTreeMap<Timestamp, RecoveredTransaction>,
    start: Timestamp,
    address: JournalAddress,
) -> &mut RecoveredTransaction {
    transactions
        .entry(start)
        .or_insert_with(|| RecoveredTransaction {
            first_address: address,
            ..RecoveredTransaction::default()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{JournalFile, JournalHeader};
    use crate::journal::JournalManager;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};
    use tessera_core::VolumeId;
    use tessera_storage::{Page, Volume, VolumeSet};

    #[derive(Default)]
    struct Recorder {
        started: Option<Option<Timestamp>>,
        trees: Vec<TreeId>,
        stores: Vec<(Timestamp, Vec<u8>)>,
        removes: Vec<(Timestamp, Vec<u8>)>,
        deltas: Vec<(Timestamp, AccumulatorKind, i64)>,
        committed: Vec<(Timestamp, Timestamp)>,
        aborted: Vec<Timestamp>,
        ended: bool,
        fail_store: Option<Error>,
    }

    impl RecoveryListener for Recorder {
        fn start_recovery(&mut self, checkpoint: Option<&RecoveredCheckpoint>) -> Result<()> {
            self.started = Some(checkpoint.map(|c| c.timestamp));
            Ok(())
        }

        fn tree_created(&mut self, tree: TreeId, _name: &str) -> Result<()> {
            self.trees.push(tree);
            Ok(())
        }

        fn store(
            &mut self,
            _address: JournalAddress,
            start: Timestamp,
            _tree: TreeId,
            key: &[u8],
            _body: &VersionBody,
        ) -> Result<()> {
            if let Some(e) = self.fail_store.take() {
                return Err(e);
            }
            self.stores.push((start, key.to_vec()));
            Ok(())
        }

        fn remove(
            &mut self,
            _address: JournalAddress,
            start: Timestamp,
            _tree: TreeId,
            key: &[u8],
        ) -> Result<()> {
            self.removes.push((start, key.to_vec()));
            Ok(())
        }

        fn delta(
            &mut self,
            _address: JournalAddress,
            start: Timestamp,
            _tree: TreeId,
            _index: u8,
            kind: AccumulatorKind,
            value: i64,
        ) -> Result<()> {
            self.deltas.push((start, kind, value));
            Ok(())
        }

        fn transaction_committed(&mut self, start: Timestamp, commit: Timestamp) -> Result<()> {
            self.committed.push((start, commit));
            Ok(())
        }

        fn transaction_aborted(&mut self, start: Timestamp) -> Result<()> {
            self.aborted.push(start);
            Ok(())
        }

        fn end_recovery(&mut self, _report: &RecoveryReport) -> Result<()> {
            self.ended = true;
            Ok(())
        }
    }

    fn tree() -> TreeId {
        TreeId::new(VolumeId(1), 0)
    }

    fn store(start: Timestamp, key: &[u8]) -> JournalRecord {
        JournalRecord::Store {
            start,
            tree: tree(),
            key: key.to_vec(),
            body: VersionBody::Inline(b"v".to_vec()),
        }
    }

    fn setup() -> (TempDir, JournalConfig, Arc<VolumeSet>) {
        let dir = tempdir().unwrap();
        let config = JournalConfig::for_testing(dir.path().join("journal"));
        let volumes = Arc::new(VolumeSet::new());
        volumes.insert(Volume::create(dir.path(), VolumeId(1), "data", 4096).unwrap());
        (dir, config, volumes)
    }

    fn scan(config: &JournalConfig) -> RecoveredJournal {
        RecoveryManager::new(config.clone()).scan().unwrap()
    }

    #[test]
    fn test_empty_journal() {
        let (_dir, config, _volumes) = setup();
        let recovered = scan(&config);
        assert!(recovered.is_empty());
        assert_eq!(recovered.next_generation(), 0);

        let mut recorder = Recorder::default();
        let report = recovered.replay(&mut recorder, false).unwrap();
        assert_eq!(recorder.started, Some(None));
        assert!(recorder.ended);
        assert_eq!(report.error_count(), 0);
    }

    #[test]
    fn test_committed_transactions_replayed_in_commit_order() {
        let (_dir, config, volumes) = setup();
        let journal = JournalManager::open(config.clone(), volumes, &RecoveredJournal::empty()).unwrap();
        journal.append(&JournalRecord::TreeCreate { tree: tree(), name: "t".into() }).unwrap();
        journal.append(&store(5, b"b")).unwrap();
        journal.append(&store(3, b"a")).unwrap();
        journal.append(&JournalRecord::TxnCommit { start: 5, commit: 6 }).unwrap();
        journal
            .append(&JournalRecord::Remove { start: 3, tree: tree(), key: b"x".to_vec() })
            .unwrap();
        journal.append(&JournalRecord::TxnCommit { start: 3, commit: 7 }).unwrap();
        journal.close().unwrap();

        let recovered = scan(&config);
        assert_eq!(recovered.next_generation(), 1);
        assert_eq!(recovered.max_timestamp(), 7);
        let mut recorder = Recorder::default();
        let report = recovered.replay(&mut recorder, false).unwrap();

        assert_eq!(recorder.trees, vec![tree()]);
        assert_eq!(recorder.stores, vec![(5, b"b".to_vec()), (3, b"a".to_vec())]);
        assert_eq!(recorder.removes, vec![(3, b"x".to_vec())]);
        assert_eq!(recorder.committed, vec![(5, 6), (3, 7)]);
        assert_eq!(report.committed_applied, 2);
        assert_eq!(report.error_count(), 0);
    }

    #[test]
    fn test_aborted_transactions_keep_only_sequence_deltas() {
        let (_dir, config, volumes) = setup();
        let journal = JournalManager::open(config.clone(), volumes, &RecoveredJournal::empty()).unwrap();
        journal.append(&store(4, b"k")).unwrap();
        for kind in [AccumulatorKind::Sum, AccumulatorKind::Seq] {
            journal
                .append(&JournalRecord::Delta { start: 4, tree: tree(), index: 0, kind, value: 2 })
                .unwrap();
        }
        journal.append(&JournalRecord::TxnRollback { start: 4 }).unwrap();
        // Never finished.
        journal.append(&store(8, b"z")).unwrap();
        journal.close().unwrap();

        let mut recorder = Recorder::default();
        let report = scan(&config).replay(&mut recorder, false).unwrap();
        assert!(recorder.stores.is_empty());
        assert_eq!(recorder.deltas, vec![(4, AccumulatorKind::Seq, 2)]);
        assert_eq!(recorder.aborted, vec![4, 8]);
        assert_eq!(report.aborted, 2);
    }

    #[test]
    fn test_checkpoint_skips_covered_transactions() {
        let (_dir, config, volumes) = setup();
        let journal = JournalManager::open(config.clone(), volumes, &RecoveredJournal::empty()).unwrap();
        journal.append(&store(1, b"old")).unwrap();
        journal.append(&JournalRecord::TxnCommit { start: 1, commit: 2 }).unwrap();
        journal.append(&store(3, b"mid")).unwrap();
        let sum = AccumulatorValue { tree: tree(), index: 0, kind: AccumulatorKind::Sum, value: 9 };
        journal.write_checkpoint(5, vec![sum]).unwrap();
        journal.append(&JournalRecord::TxnCommit { start: 3, commit: 6 }).unwrap();
        journal.close().unwrap();

        let recovered = scan(&config);
        let checkpoint = recovered.checkpoint().unwrap();
        assert_eq!(checkpoint.timestamp, 5);
        assert_eq!(checkpoint.accumulators, vec![sum]);

        let mut recorder = Recorder::default();
        let report = recovered.replay(&mut recorder, false).unwrap();
        assert_eq!(recorder.started, Some(Some(5)));
        assert_eq!(recorder.stores, vec![(3, b"mid".to_vec())]);
        assert_eq!(recorder.committed, vec![(1, 2), (3, 6)]);
        assert_eq!(report.committed_skipped, 1);
        assert_eq!(report.committed_applied, 1);
    }

    #[test]
    fn test_uncertified_images_discarded() {
        let (_dir, config, volumes) = setup();
        let journal = JournalManager::open(config.clone(), volumes, &RecoveredJournal::empty()).unwrap();
        let certified = PageAddress::new(VolumeId(1), 2);
        let later = PageAddress::new(VolumeId(1), 3);
        let chain = PageAddress::new(VolumeId(1), 4);
        let image = |id| Page::new_data(id, tree()).encode();
        let first = journal.write_page_image(certified, 1, image(2), false).unwrap();
        journal.write_checkpoint(2, Vec::new()).unwrap();
        journal.write_page_image(certified, 3, image(2), false).unwrap();
        journal.write_page_image(later, 3, image(3), false).unwrap();
        let chain_address = journal.write_page_image(chain, 3, image(4), true).unwrap();
        journal.close().unwrap();

        let recovered = scan(&config);
        let images: FxHashMap<_, _> = recovered.page_images().collect();
        assert_eq!(images.len(), 2);
        assert_eq!(images[&certified].address, first);
        assert_eq!(images[&chain].address, chain_address);
        assert_eq!(recovered.discarded_pages(), &[certified, later]);
    }

    #[test]
    fn test_partial_tail_is_not_an_incident() {
        let (_dir, config, volumes) = setup();
        let journal = JournalManager::open(config.clone(), Arc::clone(&volumes), &RecoveredJournal::empty()).unwrap();
        journal.append(&store(1, b"k")).unwrap();
        journal.append(&JournalRecord::TxnCommit { start: 1, commit: 2 }).unwrap();
        journal.close().unwrap();
        let path = config.file_path(0);
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();

        let recovered = scan(&config);
        let (tail_path, valid_len) = recovered.partial_tail().unwrap();
        assert_eq!(tail_path, &path);
        assert!(valid_len < len);
        let mut recorder = Recorder::default();
        let report = recovered.replay(&mut recorder, false).unwrap();
        assert!(report.partial_tail);
        assert_eq!(report.error_count(), 0);
        assert_eq!(recorder.aborted, vec![1]);

        // Reopening cuts the tail so later recoveries see a clean file.
        let journal = JournalManager::open(config.clone(), volumes, &recovered).unwrap();
        journal.close().unwrap();
        let recovered = scan(&config);
        assert!(recovered.partial_tail().is_none());
        assert!(recovered.incidents().is_empty());
    }

    #[test]
    fn test_corruption_in_older_file_is_an_incident() {
        let (_dir, config, volumes) = setup();
        let journal = JournalManager::open(config.clone(), Arc::clone(&volumes), &RecoveredJournal::empty()).unwrap();
        journal.append(&store(1, b"k")).unwrap();
        journal.append(&store(1, b"l")).unwrap();
        journal.close().unwrap();

        let recovered = scan(&config);
        let journal = JournalManager::open(config.clone(), volumes, &recovered).unwrap();
        journal.append(&JournalRecord::TxnBegin { start: 9 }).unwrap();
        journal.close().unwrap();

        let path = config.file_path(0);
        let mut bytes = std::fs::read(&path).unwrap();
        let at = bytes.len() - 6;
        bytes[at] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let recovered = scan(&config);
        assert_eq!(recovered.incidents().len(), 1);
        assert_eq!(recovered.incidents()[0].kind, "CorruptRecord");
    }

    #[test]
    fn test_incompatible_version_is_fatal() {
        let (_dir, config, _volumes) = setup();
        let mut header = JournalHeader::new(0, config.block_size, 0, DatabaseId::new(), 0);
        header.version = 1;
        JournalFile::create(&config.file_path(0), &header).unwrap();

        let result = RecoveryManager::new(config).scan();
        assert!(matches!(
            result,
            Err(Error::IncompatibleJournal { found: 1, .. })
        ));
    }

    #[test]
    fn test_listener_errors() {
        let (_dir, config, volumes) = setup();
        let journal = JournalManager::open(config.clone(), volumes, &RecoveredJournal::empty()).unwrap();
        journal.append(&store(1, b"k")).unwrap();
        journal.append(&JournalRecord::TxnCommit { start: 1, commit: 2 }).unwrap();
        journal.close().unwrap();
        let recovered = scan(&config);

        let mut recorder = Recorder {
            fail_store: Some(Error::Corruption("bad page".into())),
            ..Recorder::default()
        };
        let report = recovered.replay(&mut recorder, false).unwrap();
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.incidents[0].kind, "Corruption");

        let mut recorder = Recorder {
            fail_store: Some(Error::MissingVolume("gone".into())),
            ..Recorder::default()
        };
        let report = recovered.replay(&mut recorder, true).unwrap();
        assert_eq!(report.missing_volume_records, 1);
        assert_eq!(report.error_count(), 0);

        let mut recorder = Recorder {
            fail_store: Some(Error::MissingVolume("gone".into())),
            ..Recorder::default()
        };
        assert!(matches!(
            recovered.replay(&mut recorder, false),
            Err(Error::MissingVolume(_))
        ));
    }

    #[test]
    fn test_reopen_continues_in_new_generation() {
        let (_dir, config, volumes) = setup();
        let journal = JournalManager::open(config.clone(), Arc::clone(&volumes), &RecoveredJournal::empty()).unwrap();
        let id = journal.database_id();
        journal.append(&JournalRecord::TxnBegin { start: 1 }).unwrap();
        journal.close().unwrap();

        let recovered = scan(&config);
        let journal = JournalManager::open(config.clone(), volumes, &recovered).unwrap();
        assert_eq!(journal.database_id(), id);
        assert_eq!(journal.info().current_generation, 1);
        assert_eq!(journal.transaction_address(1), recovered.transaction_addresses().next().map(|t| t.1));
        assert!(journal.base_address() < config.block_size);
    }
}
