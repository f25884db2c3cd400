//! Engine configuration.
//!
//! All knobs have defaults tuned for a single local SSD. Larger batches and
//! preallocation chunks mean fewer syncs and fewer file extensions, at the cost
//! of a longer window in which acknowledged-but-unflushed registry state lives
//! only in the journal.

use std::path::PathBuf;
use std::time::Duration;

use crate::storage::error::{StorageError, StorageResult};

/// Block registry persistence policy.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Persist a snapshot once this many mutations are pending.
    pub flush_threshold: usize,
    /// Persist a snapshot at least this often while mutations are pending.
    pub flush_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            flush_threshold: 50,
            flush_interval: Duration::from_millis(100),
        }
    }
}

/// Group-commit writer policy.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Seal a batch once it holds this many operations.
    pub batch_threshold: usize,
    /// Seal a non-empty batch after this much time.
    pub batch_interval: Duration,
    /// Capacity of the bounded submission queue.
    pub queue_capacity: usize,
    /// Retries for a failed batch write before every waiter is failed.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            batch_threshold: 32,
            batch_interval: Duration::from_millis(5),
            queue_capacity: 1024,
            max_retries: 3,
            retry_backoff: Duration::from_millis(10),
        }
    }
}

/// Size thresholds for value placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierConfig {
    /// Values up to this size are stored inline.
    pub inline_threshold: usize,
    /// Values up to this size go to an overflow chain; larger ones to a file.
    pub overflow_threshold: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        TierConfig {
            inline_threshold: 4 * 1024,
            overflow_threshold: 256 * 1024,
        }
    }
}

/// What to do when a referenced blob file is missing on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingBlobPolicy {
    /// Report the missing file as corruption.
    #[default]
    Fail,
    /// Log a warning and report `NotFound`.
    AlertOnly,
}

#[derive(Debug, Clone)]
pub struct FileStreamConfig {
    /// Blob directory. Defaults to `<database file>.blobs`.
    pub root: Option<PathBuf>,
    /// Unreferenced blobs younger than this are never swept.
    pub retention: Duration,
    pub missing_policy: MissingBlobPolicy,
}

impl Default for FileStreamConfig {
    fn default() -> Self {
        FileStreamConfig {
            root: None,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            missing_policy: MissingBlobPolicy::Fail,
        }
    }
}

/// Top-level configuration for a [`crate::database::Database`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Minimum number of pages added whenever the data file has to grow.
    pub preallocation_pages: u64,
    pub registry: RegistryConfig,
    pub writer: WriterConfig,
    pub tiers: TierConfig,
    pub filestream: FileStreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            preallocation_pages: 64,
            registry: RegistryConfig::default(),
            writer: WriterConfig::default(),
            tiers: TierConfig::default(),
            filestream: FileStreamConfig::default(),
        }
    }
}

impl Config {
    pub fn with_preallocation_pages(mut self, pages: u64) -> Self {
        self.preallocation_pages = pages;
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_tiers(mut self, tiers: TierConfig) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_filestream(mut self, filestream: FileStreamConfig) -> Self {
        self.filestream = filestream;
        self
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.preallocation_pages == 0 {
            return Err(StorageError::InvalidArgument(
                "preallocation_pages must be at least 1".to_string(),
            ));
        }
        if self.writer.batch_threshold == 0 || self.writer.queue_capacity == 0 {
            return Err(StorageError::InvalidArgument(
                "writer batch_threshold and queue_capacity must be non-zero".to_string(),
            ));
        }
        if self.registry.flush_threshold == 0 {
            return Err(StorageError::InvalidArgument(
                "registry flush_threshold must be non-zero".to_string(),
            ));
        }
        if self.tiers.inline_threshold > self.tiers.overflow_threshold {
            return Err(StorageError::InvalidArgument(format!(
                "inline threshold {} exceeds overflow threshold {}",
                self.tiers.inline_threshold, self.tiers.overflow_threshold
            )));
        }
        Ok(())
    }
}
