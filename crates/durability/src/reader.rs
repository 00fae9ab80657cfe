//! Journal reader for recovery.
//!
//! The reader finds the journal files belonging to a path prefix and
//! decodes the records of one file, reporting where and why decoding
//! stopped.

use crate::config::JournalConfig;
use crate::format::{decode_frame, read_header, JournalHeader, JournalRecord, JournalRecordError};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use tessera_core::{Error, JournalAddress, Result};
use tracing::warn;

/// One decoded record and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecord {
    /// Journal address of the record
    pub address: JournalAddress,
    /// Bytes occupied by the frame
    pub length: usize,
    /// The record
    pub record: JournalRecord,
}

/// Reason why record reading stopped before the end of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStopReason {
    /// Every byte of the file was consumed
    EndOfData,
    /// Partial record at end of file (expected after a crash)
    PartialRecord {
        /// Address where the partial record starts
        address: JournalAddress,
    },
    /// A frame failed its checksum or has an impossible length
    Corrupt {
        /// Address of the bad frame
        address: JournalAddress,
        /// What was wrong
        detail: String,
    },
}

impl ReadStopReason {
    /// Whether reading stopped early.
    pub fn is_early(&self) -> bool {
        !matches!(self, ReadStopReason::EndOfData)
    }
}

/// Everything read from one journal file.
#[derive(Debug)]
pub struct FileScan {
    /// The file's header
    pub header: JournalHeader,
    /// Valid records in address order
    pub records: Vec<ReadRecord>,
    /// Frames whose checksum held but whose payload did not decode
    pub undecodable: Vec<(JournalAddress, String)>,
    /// Address just past the last valid record
    pub valid_end: JournalAddress,
    /// Why reading stopped
    pub stop_reason: ReadStopReason,
}

/// Reads journal files.
#[derive(Debug, Clone)]
pub struct JournalReader {
    config: JournalConfig,
}

impl JournalReader {
    /// Create a reader for the journal at `config.path`.
    pub fn new(config: JournalConfig) -> Self {
        JournalReader { config }
    }

    /// Journal files as (generation, path), oldest first.
    pub fn list_files(&self) -> Result<Vec<(u64, PathBuf)>> {
        list_journal_files(&self.config.path)
    }

    /// Read the header of one file.
    pub fn read_header(&self, path: &Path) -> Result<JournalHeader> {
        let mut file = File::open(path)?;
        Ok(read_header(&mut file, path)?.0)
    }

    /// Read every record of the file at `path`.
    ///
    /// Returns records in order, stopping at the first frame that is
    /// incomplete or fails its checksum. Frames with a valid checksum but an
    /// undecodable payload are skipped and reported.
    pub fn read_file(&self, path: &Path) -> Result<FileScan> {
        let mut file = File::open(path)?;
        let (header, header_len) = read_header(&mut file, path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        let mut buffer_offset = 0usize;
        let file_start = header.generation * header.block_size;
        let mut records = Vec::new();
        let mut undecodable = Vec::new();
        let mut valid_end = file_start + header_len as u64;
        let mut stop_reason = ReadStopReason::EndOfData;

        while buffer_offset < buffer.len() {
            let address = file_start + (header_len + buffer_offset) as u64;
            match decode_frame(&buffer[buffer_offset..]) {
                Ok(frame) => {
                    match JournalRecord::from_payload(frame.type_code, frame.payload) {
                        Ok(record) => records.push(ReadRecord {
                            address,
                            length: frame.len,
                            record,
                        }),
                        Err(e) => {
                            warn!(
                                target: "tessera::recovery",
                                address,
                                error = %e,
                                "skipping undecodable journal record"
                            );
                            undecodable.push((address, e.to_string()));
                        }
                    }
                    buffer_offset += frame.len;
                    valid_end = address + frame.len as u64;
                }
                Err(JournalRecordError::InsufficientData) => {
                    stop_reason = ReadStopReason::PartialRecord { address };
                    break;
                }
                Err(e) => {
                    stop_reason = ReadStopReason::Corrupt {
                        address,
                        detail: e.to_string(),
                    };
                    break;
                }
            }
        }

        Ok(FileScan {
            header,
            records,
            undecodable,
            valid_end,
            stop_reason,
        })
    }
}

/// List the files of the journal with path prefix `prefix`, oldest first.
pub fn list_journal_files(prefix: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let dir = match prefix.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let stem = prefix
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .ok_or_else(|| Error::Config(format!("bad journal path {}", prefix.display())))?;

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        // Expected format: "<stem>.NNNNNNNNNNNN"
        let suffix = match name.strip_prefix(stem.as_str()).and_then(|s| s.strip_prefix('.')) {
            Some(s) => s,
            None => continue,
        };
        if suffix.len() == 12 && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(generation) = suffix.parse::<u64>() {
                files.push((generation, entry.path()));
            }
        }
    }
    files.sort();
    Ok(files)
}
