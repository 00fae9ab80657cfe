//! Database configuration via `tessera.toml`
//!
//! On first open, a default `tessera.toml` is created in the data directory.
//! To change settings, edit the file and reopen the database. Settings that
//! can change at runtime (append-only, copy-fast, rollback pruning) are
//! exposed on the database and are not written back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tessera_core::{Error, Result, VolumeId};
use tessera_durability::config::{
    DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_SIZE, DEFAULT_COPIER_INTERVAL_MS,
    DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_JOURNAL_FILE_NAME, MINIMUM_BLOCK_SIZE,
    MINIMUM_BUFFER_SIZE,
};
use tessera_durability::{CommitPolicy, JournalConfig};
use tessera_storage::{BufferPoolConfig, CleanupConfig, TreeConfig};

/// Config file name placed in the database data directory.
pub const CONFIG_FILE_NAME: &str = "tessera.toml";

/// One volume opened with the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// File name stem; the volume lives in `<name>.vol`
    pub name: String,
    /// Volume id recorded in the file header and in every tree id
    pub id: u32,
}

impl VolumeSpec {
    /// Create a volume entry.
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        VolumeSpec {
            name: name.into(),
            id,
        }
    }

    /// The id as a `VolumeId`.
    pub fn volume_id(&self) -> VolumeId {
        VolumeId(self.id)
    }
}

/// Database configuration loaded from `tessera.toml`.
///
/// # Example
///
/// ```toml
/// commit_policy = "group"
/// page_size = 16384
///
/// [[volumes]]
/// name = "data"
/// id = 1
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TesseraConfig {
    /// Default commit policy: `"soft"`, `"hard"` or `"group"`.
    #[serde(default)]
    pub commit_policy: CommitPolicy,
    /// Page size of every volume, a power of two.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Buffers kept in memory before clean pages are evicted.
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
    /// Maximum size of one journal file.
    #[serde(default = "default_journal_block_size")]
    pub journal_block_size: u64,
    /// Journal write buffer size.
    #[serde(default = "default_journal_buffer_size")]
    pub journal_buffer_size: usize,
    /// Milliseconds between journal flusher cycles.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Milliseconds between journal copier cycles.
    #[serde(default = "default_copier_interval_ms")]
    pub copier_interval_ms: u64,
    /// Milliseconds between checkpoints.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    /// Milliseconds between cleanup cycles; negative runs only when kicked.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: i64,
    /// Buffered journal bytes after which a transaction spills its records.
    #[serde(default = "default_transaction_buffer_size")]
    pub transaction_buffer_size: usize,
    /// Values longer than this go to long-record chains.
    #[serde(default = "default_long_record_threshold")]
    pub long_record_threshold: usize,
    /// Keep every journal file; the copier runs only when forced.
    #[serde(default)]
    pub append_only: bool,
    /// Skip journal contents that refer to volumes not listed here.
    #[serde(default)]
    pub ignore_missing_volumes: bool,
    /// Queue the pages of rolled-back transactions for pruning.
    #[serde(default = "default_true")]
    pub rollback_pruning: bool,
    /// Volumes opened with the database.
    #[serde(default = "default_volumes")]
    pub volumes: Vec<VolumeSpec>,
}

fn default_page_size() -> usize {
    16 * 1024
}

fn default_buffer_count() -> usize {
    4096
}

fn default_journal_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

fn default_journal_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

fn default_copier_interval_ms() -> u64 {
    DEFAULT_COPIER_INTERVAL_MS
}

fn default_checkpoint_interval_ms() -> u64 {
    120_000
}

fn default_cleanup_interval_ms() -> i64 {
    1_000
}

fn default_transaction_buffer_size() -> usize {
    64 * 1024
}

fn default_long_record_threshold() -> usize {
    2048
}

fn default_true() -> bool {
    true
}

fn default_volumes() -> Vec<VolumeSpec> {
    vec![VolumeSpec::new("data", 1)]
}

impl Default for TesseraConfig {
    fn default() -> Self {
        Self {
            commit_policy: CommitPolicy::default(),
            page_size: default_page_size(),
            buffer_count: default_buffer_count(),
            journal_block_size: default_journal_block_size(),
            journal_buffer_size: default_journal_buffer_size(),
            flush_interval_ms: default_flush_interval_ms(),
            copier_interval_ms: default_copier_interval_ms(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            transaction_buffer_size: default_transaction_buffer_size(),
            long_record_threshold: default_long_record_threshold(),
            append_only: false,
            ignore_missing_volumes: false,
            rollback_pruning: true,
            volumes: default_volumes(),
        }
    }
}

impl TesseraConfig {
    /// Small pages, minimum journal sizes and background tasks that never
    /// fire on their own (checkpoint hourly, cleanup only when kicked).
    pub fn for_testing() -> Self {
        Self {
            page_size: 4096,
            buffer_count: 1024,
            journal_block_size: MINIMUM_BLOCK_SIZE,
            journal_buffer_size: MINIMUM_BUFFER_SIZE,
            flush_interval_ms: 10,
            checkpoint_interval_ms: 3_600_000,
            cleanup_interval_ms: -1,
            transaction_buffer_size: 16 * 1024,
            long_record_threshold: 512,
            ..Self::default()
        }
    }

    /// Set the commit policy (builder pattern).
    pub fn with_commit_policy(mut self, policy: CommitPolicy) -> Self {
        self.commit_policy = policy;
        self
    }

    /// Set the volume list (builder pattern).
    pub fn with_volumes(mut self, volumes: Vec<VolumeSpec>) -> Self {
        self.volumes = volumes;
        self
    }

    /// Set ignore-missing-volumes (builder pattern).
    pub fn with_ignore_missing_volumes(mut self, ignore: bool) -> Self {
        self.ignore_missing_volumes = ignore;
        self
    }

    /// Set the checkpoint interval (builder pattern).
    pub fn with_checkpoint_interval_ms(mut self, ms: u64) -> Self {
        self.checkpoint_interval_ms = ms;
        self
    }

    /// Set the cleanup interval (builder pattern).
    pub fn with_cleanup_interval_ms(mut self, ms: i64) -> Self {
        self.cleanup_interval_ms = ms;
        self
    }

    /// Set the transaction buffer size (builder pattern).
    pub fn with_transaction_buffer_size(mut self, size: usize) -> Self {
        self.transaction_buffer_size = size;
        self
    }

    /// Journal settings for a database in `data_dir`.
    pub fn journal_config(&self, data_dir: &Path) -> JournalConfig {
        JournalConfig::new()
            .with_path(data_dir.join(DEFAULT_JOURNAL_FILE_NAME))
            .with_block_size(self.journal_block_size)
            .with_buffer_size(self.journal_buffer_size)
            .with_flush_interval_ms(self.flush_interval_ms)
            .with_copier_interval_ms(self.copier_interval_ms)
            .with_append_only(self.append_only)
            .with_ignore_missing_volumes(self.ignore_missing_volumes)
    }

    /// Buffer pool settings.
    pub fn buffer_pool_config(&self) -> BufferPoolConfig {
        BufferPoolConfig::default()
            .with_page_size(self.page_size)
            .with_capacity(self.buffer_count)
    }

    /// Tree settings.
    pub fn tree_config(&self) -> TreeConfig {
        TreeConfig {
            max_key_size: TreeConfig::default().max_key_size.min(self.page_size / 4),
            ..TreeConfig::default()
        }
        .with_long_record_threshold(self.long_record_threshold)
    }

    /// Cleanup manager settings.
    pub fn cleanup_config(&self) -> CleanupConfig {
        CleanupConfig::default().with_poll_interval_ms(self.cleanup_interval_ms)
    }

    /// Check every setting, including those of the layers it configures.
    pub fn validate(&self) -> Result<()> {
        self.buffer_pool_config().validate()?;
        self.tree_config().validate(self.page_size)?;
        self.cleanup_config().validate()?;
        self.journal_config(Path::new(".")).validate()?;
        if self.checkpoint_interval_ms == 0 {
            return Err(Error::Config("checkpoint interval must be positive".into()));
        }
        if self.transaction_buffer_size == 0 {
            return Err(Error::Config("transaction buffer size must be positive".into()));
        }
        if self.volumes.is_empty() {
            return Err(Error::Config("at least one volume is required".into()));
        }
        let mut names = BTreeSet::new();
        let mut ids = BTreeSet::new();
        for volume in &self.volumes {
            if volume.name.is_empty() || volume.id == 0 {
                return Err(Error::Config(format!(
                    "volume '{}' with id {} needs a name and a nonzero id",
                    volume.name, volume.id
                )));
            }
            if !names.insert(volume.name.as_str()) || !ids.insert(volume.id) {
                return Err(Error::Config(format!(
                    "volume '{}' (id {}) is listed twice",
                    volume.name, volume.id
                )));
            }
        }
        Ok(())
    }

    /// Interval between checkpoints.
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tessera database configuration
#
# Commit policy: "soft" (default), "hard" or "group"
#   "soft"  = return once the commit record is buffered; a crash may lose it
#   "hard"  = force the journal before every commit returns
#   "group" = wait for the next flusher cycle, sharing one force
commit_policy = "soft"

# Page size of every volume (power of two, 1024..=65536)
page_size = 16384

# Buffers kept in memory before clean pages are evicted
buffer_count = 4096

# Journal file size and write buffer size in bytes
journal_block_size = 1000000000
journal_buffer_size = 16777216

# Background task intervals in milliseconds
flush_interval_ms = 100
copier_interval_ms = 10000
checkpoint_interval_ms = 120000
cleanup_interval_ms = 1000

# Buffered journal bytes after which a transaction writes its records early
transaction_buffer_size = 65536

# Values longer than this many bytes are stored in long-record chains
long_record_threshold = 2048

# Keep every journal file (the copier runs only when forced)
append_only = false

# Skip journal contents for volumes not listed below instead of failing
ignore_missing_volumes = false

# Queue pages touched by rolled-back transactions for pruning
rollback_pruning = true

[[volumes]]
name = "data"
id = 1
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: TesseraConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_valid() {
        let config = TesseraConfig::default();
        assert_eq!(config.commit_policy, CommitPolicy::Soft);
        assert!(config.rollback_pruning);
        config.validate().unwrap();
        TesseraConfig::for_testing().validate().unwrap();
    }

    #[test]
    fn default_toml_matches_default() {
        let config: TesseraConfig = toml::from_str(TesseraConfig::default_toml()).unwrap();
        assert_eq!(config, TesseraConfig::default());
    }

    #[test]
    fn parse_commit_policies() {
        let config: TesseraConfig = toml::from_str("commit_policy = \"group\"").unwrap();
        assert_eq!(config.commit_policy, CommitPolicy::Group);
        let config: TesseraConfig = toml::from_str("commit_policy = \"hard\"").unwrap();
        assert_eq!(config.commit_policy, CommitPolicy::Hard);
        assert!(toml::from_str::<TesseraConfig>("commit_policy = \"turbo\"").is_err());
    }

    #[test]
    fn write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "commit_policy = \"hard\"\n").unwrap();

        TesseraConfig::write_default_if_missing(&path).unwrap();

        let config = TesseraConfig::from_file(&path).unwrap();
        assert_eq!(config.commit_policy, CommitPolicy::Hard);
        assert_eq!(config.volumes, vec![VolumeSpec::new("data", 1)]);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "").unwrap();
        assert_eq!(TesseraConfig::from_file(&path).unwrap(), TesseraConfig::default());
    }

    #[test]
    fn write_to_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = TesseraConfig::for_testing()
            .with_commit_policy(CommitPolicy::Group)
            .with_volumes(vec![VolumeSpec::new("data", 1), VolumeSpec::new("aux", 2)]);

        config.write_to_file(&path).unwrap();
        assert_eq!(TesseraConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn rejects_bad_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        std::fs::write(&path, "page_size = 3000\n").unwrap();
        assert!(matches!(TesseraConfig::from_file(&path), Err(Error::Config(_))));

        std::fs::write(&path, "journal_block_size = 1000\n").unwrap();
        assert!(matches!(TesseraConfig::from_file(&path), Err(Error::Config(_))));

        let duplicated = TesseraConfig::default()
            .with_volumes(vec![VolumeSpec::new("data", 1), VolumeSpec::new("data", 2)]);
        assert!(duplicated.validate().is_err());

        let empty = TesseraConfig::default().with_volumes(Vec::new());
        assert!(empty.validate().is_err());
    }
}
