//! Journal file and record format.
//!
//! Journal files are named `{path}.NNNNNNNNNNNN` where the suffix is the
//! zero-padded file generation. A journal address is
//! `generation * block_size + offset`, so addresses increase across files
//! and every file starts at a multiple of the block size.
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Header record (bincode payload)    │
//! ├────────────────────────────────────┤
//! │ Record 1 (MessagePack payload)     │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────────────┬──────────┬─────────────────────────┬──────────┐
//! │ Length (4 bytes)│ Type (1) │ Payload (variable)      │ CRC32 (4)│
//! └─────────────────┴──────────┴─────────────────────────┴──────────┘
//! ```
//!
//! `Length` counts the bytes after itself. The CRC covers the type byte and
//! the payload. The header payload starts with the format version as a
//! little-endian `u32`, so a version mismatch is detected before the rest
//! of the header is decoded.

use crate::config::JOURNAL_FORMAT_VERSION;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tessera_core::{
    DatabaseId, Error, JournalAddress, PageAddress, Result, Timestamp, TreeId,
};
use tessera_storage::{AccumulatorKind, AccumulatorValue, VersionBody};

/// Magic bytes identifying a journal file: "TSJL"
pub const JOURNAL_MAGIC: [u8; 4] = *b"TSJL";

/// Bytes before the payload: length and type.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Bytes after the payload: CRC32.
pub const FRAME_TRAILER_SIZE: usize = 4;

/// Largest accepted record body. Longer lengths are treated as garbage.
pub const MAX_RECORD_SIZE: usize = 256 * 1024 * 1024;

/// Type code of the file header record.
pub const TYPE_HEADER: u8 = 0x01;
const TYPE_PAGE_IMAGE: u8 = 0x02;
const TYPE_TREE_CREATE: u8 = 0x03;
const TYPE_TXN_BEGIN: u8 = 0x04;
const TYPE_STORE: u8 = 0x05;
const TYPE_REMOVE: u8 = 0x06;
const TYPE_DELTA: u8 = 0x07;
const TYPE_TXN_COMMIT: u8 = 0x08;
const TYPE_TXN_ROLLBACK: u8 = 0x09;
const TYPE_CHECKPOINT: u8 = 0x0A;

/// Header written at the start of every journal file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalHeader {
    /// Journal format version. Must stay the first field.
    pub version: u32,
    /// Magic bytes
    pub magic: [u8; 4],
    /// File generation
    pub generation: u64,
    /// Block size the journal was written with
    pub block_size: u64,
    /// Lowest address recovery needed when this file was started
    pub base_address: JournalAddress,
    /// Database identity
    pub database_id: DatabaseId,
    /// Wall-clock creation time of the first journal file (ms)
    pub journal_created_ms: i64,
    /// Wall-clock creation time of this file (ms)
    pub file_created_ms: i64,
}

impl JournalHeader {
    /// Create a header for a new file.
    pub fn new(
        generation: u64,
        block_size: u64,
        base_address: JournalAddress,
        database_id: DatabaseId,
        journal_created_ms: i64,
    ) -> Self {
        JournalHeader {
            version: JOURNAL_FORMAT_VERSION,
            magic: JOURNAL_MAGIC,
            generation,
            block_size,
            base_address,
            database_id,
            journal_created_ms,
            file_created_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Encode as a complete header record.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        Ok(encode_frame(TYPE_HEADER, &payload))
    }

    /// Decode a header payload. A version other than
    /// [`JOURNAL_FORMAT_VERSION`] fails with `IncompatibleJournal`.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let version = payload
            .get(0..4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| Error::Corruption("journal header too short".into()))?;
        if version != JOURNAL_FORMAT_VERSION {
            return Err(Error::IncompatibleJournal {
                expected: JOURNAL_FORMAT_VERSION,
                found: version,
            });
        }
        let header: JournalHeader = bincode::deserialize(payload)?;
        if header.magic != JOURNAL_MAGIC {
            return Err(Error::Corruption("journal header has bad magic".into()));
        }
        Ok(header)
    }
}

/// One journal record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// Encoded image of a page.
    PageImage {
        /// Page written
        page: PageAddress,
        /// Page timestamp at the time of the image
        timestamp: Timestamp,
        /// Encoded page
        image: Vec<u8>,
        /// Long-record chain pages are valid even after the last checkpoint
        always_valid: bool,
    },
    /// A tree was created.
    TreeCreate {
        /// New tree
        tree: TreeId,
        /// Its name
        name: String,
    },
    /// A transaction started writing.
    TxnBegin {
        /// Start timestamp
        start: Timestamp,
    },
    /// A transaction stored a value.
    Store {
        /// Start timestamp of the writer
        start: Timestamp,
        /// Tree
        tree: TreeId,
        /// Key
        key: Vec<u8>,
        /// Stored body; long records refer to journaled chain pages
        body: VersionBody,
    },
    /// A transaction removed a key.
    Remove {
        /// Start timestamp of the writer
        start: Timestamp,
        /// Tree
        tree: TreeId,
        /// Key
        key: Vec<u8>,
    },
    /// A transaction updated an accumulator.
    Delta {
        /// Start timestamp of the writer
        start: Timestamp,
        /// Tree owning the accumulator
        tree: TreeId,
        /// Accumulator index within the tree
        index: u8,
        /// Accumulator kind
        kind: AccumulatorKind,
        /// Delta value
        value: i64,
    },
    /// A transaction committed.
    TxnCommit {
        /// Start timestamp
        start: Timestamp,
        /// Commit timestamp
        commit: Timestamp,
    },
    /// A transaction rolled back.
    TxnRollback {
        /// Start timestamp
        start: Timestamp,
    },
    /// Every page image needed for recovery up to `timestamp` precedes
    /// this record.
    Checkpoint {
        /// Checkpoint timestamp
        timestamp: Timestamp,
        /// Lowest address recovery needs
        base_address: JournalAddress,
        /// Committed accumulator values as of `timestamp`
        accumulators: Vec<AccumulatorValue>,
        /// Wall-clock time of the checkpoint (ms)
        wall_clock_ms: i64,
    },
}

impl JournalRecord {
    /// Type code written in the frame.
    pub fn type_code(&self) -> u8 {
        match self {
            JournalRecord::PageImage { .. } => TYPE_PAGE_IMAGE,
            JournalRecord::TreeCreate { .. } => TYPE_TREE_CREATE,
            JournalRecord::TxnBegin { .. } => TYPE_TXN_BEGIN,
            JournalRecord::Store { .. } => TYPE_STORE,
            JournalRecord::Remove { .. } => TYPE_REMOVE,
            JournalRecord::Delta { .. } => TYPE_DELTA,
            JournalRecord::TxnCommit { .. } => TYPE_TXN_COMMIT,
            JournalRecord::TxnRollback { .. } => TYPE_TXN_ROLLBACK,
            JournalRecord::Checkpoint { .. } => TYPE_CHECKPOINT,
        }
    }

    /// Start timestamp of the transaction this record belongs to.
    pub fn transaction(&self) -> Option<Timestamp> {
        match self {
            JournalRecord::TxnBegin { start }
            | JournalRecord::Store { start, .. }
            | JournalRecord::Remove { start, .. }
            | JournalRecord::Delta { start, .. }
            | JournalRecord::TxnCommit { start, .. }
            | JournalRecord::TxnRollback { start } => Some(*start),
            _ => None,
        }
    }

    /// Encode as a complete frame.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let payload =
            rmp_serde::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))?;
        if payload.len() + 1 + FRAME_TRAILER_SIZE > MAX_RECORD_SIZE {
            return Err(Error::InvalidOperation(format!(
                "journal record of {} bytes is too large",
                payload.len()
            )));
        }
        Ok(encode_frame(self.type_code(), &payload))
    }

    /// Decode a record payload of a frame with `type_code`.
    pub fn from_payload(type_code: u8, payload: &[u8]) -> std::result::Result<Self, JournalRecordError> {
        if !(TYPE_PAGE_IMAGE..=TYPE_CHECKPOINT).contains(&type_code) {
            return Err(JournalRecordError::UnknownType(type_code));
        }
        let record: JournalRecord = rmp_serde::from_slice(payload)
            .map_err(|e| JournalRecordError::Decode(e.to_string()))?;
        if record.type_code() != type_code {
            return Err(JournalRecordError::Decode(format!(
                "type byte {:#04x} does not match payload",
                type_code
            )));
        }
        Ok(record)
    }
}

fn compute_crc(type_code: u8, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[type_code]);
    hasher.update(payload);
    hasher.finalize()
}

/// Frame a payload.
pub fn encode_frame(type_code: u8, payload: &[u8]) -> Vec<u8> {
    let length = 1 + payload.len() + FRAME_TRAILER_SIZE;
    let mut frame = Vec::with_capacity(4 + length);
    frame.extend_from_slice(&(length as u32).to_le_bytes());
    frame.push(type_code);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&compute_crc(type_code, payload).to_le_bytes());
    frame
}

/// A checked frame borrowed from a byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Record type
    pub type_code: u8,
    /// Payload bytes
    pub payload: &'a [u8],
    /// Total bytes occupied, including length, type and CRC
    pub len: usize,
}

/// Parse and verify the frame at the start of `bytes`.
pub fn decode_frame(bytes: &[u8]) -> std::result::Result<Frame<'_>, JournalRecordError> {
    let length = bytes
        .get(0..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(JournalRecordError::InsufficientData)? as usize;
    if length < 1 + FRAME_TRAILER_SIZE || length > MAX_RECORD_SIZE {
        return Err(JournalRecordError::InvalidLength(length));
    }
    let body = bytes
        .get(4..4 + length)
        .ok_or(JournalRecordError::InsufficientData)?;
    let type_code = body[0];
    let payload = &body[1..length - FRAME_TRAILER_SIZE];
    let stored = u32::from_le_bytes([
        body[length - 4],
        body[length - 3],
        body[length - 2],
        body[length - 1],
    ]);
    let computed = compute_crc(type_code, payload);
    if stored != computed {
        return Err(JournalRecordError::ChecksumMismatch {
            expected: stored,
            computed,
        });
    }
    Ok(Frame {
        type_code,
        payload,
        len: 4 + length,
    })
}

/// Journal record errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JournalRecordError {
    /// Not enough data to parse record
    #[error("Insufficient data to parse record")]
    InsufficientData,

    /// Length field out of range
    #[error("Invalid record length {0}")]
    InvalidLength(usize),

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Expected checksum from record
        expected: u32,
        /// Computed checksum
        computed: u32,
    },

    /// Unknown record type
    #[error("Unknown record type {0:#04x}")]
    UnknownType(u8),

    /// Payload could not be decoded
    #[error("Undecodable record payload: {0}")]
    Decode(String),
}

/// One journal file.
///
/// Only the newest file is written; older files are immutable until they
/// are deleted.
pub struct JournalFile {
    file: File,
    generation: u64,
    size: u64,
    path: PathBuf,
}

impl JournalFile {
    /// Create a new file and write its header.
    pub fn create(path: &Path, header: &JournalHeader) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        let frame = header.to_frame()?;
        file.write_all(&frame)?;
        Ok(JournalFile {
            file,
            generation: header.generation,
            size: frame.len() as u64,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing file and validate its header.
    pub fn open(path: &Path) -> Result<(Self, JournalHeader)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let (header, _) = read_header(&mut file, path)?;
        let size = file.seek(SeekFrom::End(0))?;
        Ok((
            JournalFile {
                file,
                generation: header.generation,
                size,
                path: path.to_path_buf(),
            },
            header,
        ))
    }

    /// Append bytes at the end of the file.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.size))?;
        self.file.write_all(bytes)?;
        self.size += bytes.len() as u64;
        Ok(())
    }

    /// Read `len` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Cut the file back to `len` bytes.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.size = len;
        Ok(())
    }

    /// Force written bytes to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Reopen the file without write access so every later write fails.
    #[cfg(test)]
    pub(crate) fn reopen_read_only(&mut self) -> Result<()> {
        self.file = OpenOptions::new().read(true).open(&self.path)?;
        Ok(())
    }

    /// File generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bytes in the file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read and validate the header record at the start of `file`. Returns the
/// header and the length of its frame, leaving the cursor just past it.
pub fn read_header(file: &mut File, path: &Path) -> Result<(JournalHeader, usize)> {
    file.seek(SeekFrom::Start(0))?;
    let mut prefix = [0u8; 4];
    file.read_exact(&mut prefix)?;
    let length = u32::from_le_bytes(prefix) as usize;
    if !(1 + FRAME_TRAILER_SIZE..=64 * 1024).contains(&length) {
        return Err(Error::Corruption(format!(
            "journal file {} has no valid header",
            path.display()
        )));
    }
    let mut frame = vec![0u8; 4 + length];
    frame[..4].copy_from_slice(&prefix);
    file.read_exact(&mut frame[4..])?;
    let frame_len = frame.len();
    let frame = decode_frame(&frame).map_err(|e| {
        Error::Corruption(format!("journal file {} header: {}", path.display(), e))
    })?;
    if frame.type_code != TYPE_HEADER {
        return Err(Error::Corruption(format!(
            "journal file {} does not start with a header",
            path.display()
        )));
    }
    Ok((JournalHeader::from_payload(frame.payload)?, frame_len))
}
