//! Per-partition write path of a remote shuffle worker.
//!
//! Streamed shuffle records for a partition replica land in a
//! [`PartitionWriter`], which buffers them off-heap in pooled
//! [`CompositeBuffer`]s, hands full buffers to a per-disk [`Flusher`] for
//! ordered draining into a [`Sink`], and tracks the chunk boundaries
//! readers later fetch by. The [`Controller`] coordinates reservation,
//! commit and teardown across every writer of a shuffle.
//!
//! The RPC endpoints, cluster master, reader protocol and disk probing
//! live elsewhere; this crate is the machinery between an accepted push
//! and a published partition file.

pub mod buffer;
pub mod commit;
pub mod config;
pub mod device;
pub mod error;
pub mod flusher;
pub mod memory;
pub mod metadata;
pub mod notifier;
pub mod rate_limited_warner;
pub mod sink;
pub mod writer;

pub use buffer::CompositeBuffer;
pub use commit::{CommitReport, CommitResponse, Controller, DestroyResponse};
pub use config::{DiskType, PartitionType, SplitMode, WriterConfig};
pub use device::{DeviceMonitor, DeviceObserver, DiskStatus};
pub use error::{ConfigError, WriteError};
pub use flusher::{Flusher, FlusherConfig};
pub use memory::MemoryTracker;
pub use metadata::{FileInfo, StoreKind, decode_chunk_index, encode_chunk_index};
pub use notifier::FlushNotifier;
pub use sink::{DfsSink, DistributedFs, LocalSink, MemoryFs, MountedFs, Sink};
pub use writer::{PartitionWriter, StorageInfo, StorageKind, WriterEnv};
