//! Configuration for the per-partition write path.
//!
//! [`WriterConfig`] is the record the worker's configuration layer hands to
//! every writer it creates. The defaults mirror the options recognised by
//! the service: a 256 KiB flush buffer, 8 MiB fetch chunks and two-minute
//! close and commit deadlines.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default size of a composite flush buffer.
pub const DEFAULT_FLUSH_BUFFER_SIZE: usize = 256 * 1024;

/// Default byte distance between recorded chunk boundaries.
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// How a writer that crossed its split threshold should be handled by the
/// push layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitMode {
    /// Advise the client to start a new epoch while accepting the write.
    #[default]
    Soft,
    /// Reject writes until the client has split.
    Hard,
}

/// Layout of the partition the writer backs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionType {
    /// One file per reducer partition, the common case.
    #[default]
    Reduce,
    /// One file per mapper.
    Map,
}

/// Media class of a local mount, published in [`StorageInfo`].
///
/// [`StorageInfo`]: crate::writer::StorageInfo
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskType {
    #[default]
    Hdd,
    Ssd,
}

/// Options governing a single partition writer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Capacity of each pooled composite buffer; crossing it triggers a
    /// flush.
    pub flush_buffer_size: usize,
    /// Target distance between chunk boundaries in the finished file.
    pub chunk_size: u64,
    /// Deadline for the two drain loops inside `close`, and for buffer
    /// borrows and task submits.
    pub close_timeout: Duration,
    /// Wall-clock budget for a whole `commit_files` fan-out.
    pub shuffle_commit_timeout: Duration,
    /// File length beyond which the push layer should split the partition.
    pub split_threshold: u64,
    /// Whether a crossed threshold advises or rejects.
    pub split_mode: SplitMode,
    pub partition_type: PartitionType,
    /// Record per-write map ids so readers can skip irrelevant producers.
    pub range_read_filter: bool,
    /// Committed files at least this large are reported for partition-size
    /// estimation.
    pub min_partition_size_to_estimate: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_buffer_size: DEFAULT_FLUSH_BUFFER_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            close_timeout: Duration::from_secs(120),
            shuffle_commit_timeout: Duration::from_secs(120),
            split_threshold: 1024 * 1024 * 1024,
            split_mode: SplitMode::default(),
            partition_type: PartitionType::default(),
            range_read_filter: false,
            min_partition_size_to_estimate: 8 * 1024 * 1024,
        }
    }
}

impl WriterConfig {
    /// Reject configurations that would make the writer inoperable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_buffer_size == 0 {
            return Err(ConfigError::NotPositive("flush_buffer_size"));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::NotPositive("chunk_size"));
        }
        Ok(())
    }
}
