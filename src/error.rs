//! Error kinds surfaced by the write path.
//!
//! Every failure that can poison a writer is representable as a
//! [`WriteError`]. The variants are `Clone` so the notifier's sticky slot
//! can hand the same first failure to every subsequent caller; I/O errors
//! are captured as rendered strings for that reason.

use std::{io, time::Duration};

use thiserror::Error;

use crate::device::DiskStatus;

/// Errors reported by the partition writer and its collaborators.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// An operation was attempted on a writer that already reached a
    /// terminal state.
    #[error("partition writer is already closed")]
    AlreadyClosed,
    /// An underlying sink or path operation failed.
    #[error("{0}")]
    Io(String),
    /// A bounded wait on pending writes, pending flushes, a buffer borrow
    /// or a task submit exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The device monitor reported the writer's mount as unusable.
    #[error("device error on {mount}: {status}")]
    Device { mount: String, status: DiskStatus },
    /// The flusher's buffer pool had nothing to lend within the deadline.
    #[error("flush buffer pool exhausted")]
    BufferExhausted,
    /// The writer was torn down by `destroy`.
    #[error("partition writer was destroyed")]
    Destroyed,
    /// The commit aggregate was cancelled before this close completed.
    #[error("commit cancelled before close completed")]
    Cancelled,
}

impl From<io::Error> for WriteError {
    fn from(err: io::Error) -> Self {
        WriteError::Io(err.to_string())
    }
}

/// Configuration values rejected by [`WriterConfig::validate`].
///
/// [`WriterConfig::validate`]: crate::config::WriterConfig::validate
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
}
