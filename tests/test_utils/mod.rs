//! Shared harness for write-path integration tests.
//!
//! Builds a flusher, device monitor and memory tracker over a temporary
//! mount, and constructs local or distributed writers against them.

#![allow(dead_code)]

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;

use riffle_worker::{
    DeviceMonitor, DfsSink, DiskType, DistributedFs, FileInfo, Flusher, FlusherConfig, LocalSink,
    MemoryFs, MemoryTracker, PartitionWriter, Sink, WriteError, WriterConfig, WriterEnv,
};

pub struct Harness {
    // The flusher drops (and joins its drain threads) before the mount
    // directory it writes into goes away.
    pub flusher: Arc<Flusher>,
    pub dir: TempDir,
    pub monitor: Arc<DeviceMonitor>,
    pub memory: Arc<MemoryTracker>,
    pub pool_size: usize,
}

impl Harness {
    /// A harness whose pooled buffers match `flush_buffer_size`.
    pub fn with_buffer_size(flush_buffer_size: usize) -> Self {
        let dir = TempDir::new().expect("create mount dir");
        let pool_size = 16;
        let flusher = Arc::new(Flusher::new(
            dir.path(),
            DiskType::Ssd,
            FlusherConfig {
                workers: 1,
                queue_capacity: 32,
                pool_size,
                flush_buffer_size,
            },
        ));
        Self {
            flusher,
            dir,
            monitor: Arc::new(DeviceMonitor::new()),
            memory: Arc::new(MemoryTracker::new()),
            pool_size,
        }
    }

    pub fn env(&self) -> WriterEnv {
        WriterEnv {
            flusher: Arc::clone(&self.flusher),
            worker_index: 0,
            device_monitor: Arc::clone(&self.monitor),
            memory: Arc::clone(&self.memory),
        }
    }

    /// A writer over a file on the harness mount.
    pub fn local_writer(
        &self,
        name: &str,
        config: &WriterConfig,
    ) -> Result<Arc<PartitionWriter>, WriteError> {
        let path = self.dir.path().join(name);
        let sink = Sink::Local(LocalSink::open(&path).map_err(WriteError::from)?);
        PartitionWriter::open(FileInfo::local(path), sink, self.env(), config)
    }

    /// A writer over a distributed filesystem.
    pub fn dfs_writer(
        &self,
        fs: Arc<dyn DistributedFs>,
        path: &str,
        peer_success: Option<PathBuf>,
        config: &WriterConfig,
    ) -> Result<Arc<PartitionWriter>, WriteError> {
        let path = Path::new(path);
        let sink = Sink::Distributed(DfsSink::open(fs, path).map_err(WriteError::from)?);
        PartitionWriter::open(
            FileInfo::distributed(path, peer_success),
            sink,
            self.env(),
            config,
        )
    }
}

/// A fast-failing test configuration.
pub fn test_config(flush_buffer_size: usize, chunk_size: u64) -> WriterConfig {
    WriterConfig {
        flush_buffer_size,
        chunk_size,
        close_timeout: Duration::from_secs(2),
        shuffle_commit_timeout: Duration::from_secs(5),
        ..WriterConfig::default()
    }
}

/// A buffer of `len` copies of `fill`.
pub fn filled(len: usize, fill: u8) -> Bytes {
    Bytes::from(vec![fill; len])
}

/// Announce and append a sequence of buffers.
pub fn push_all(writer: &PartitionWriter, chunks: &[Bytes]) -> Result<(), WriteError> {
    for chunk in chunks {
        writer.increment_pending_writes();
        writer.write(chunk.clone())?;
    }
    Ok(())
}

/// A 16-byte range-read header (map id in host byte order) plus payload.
pub fn with_header(map_id: u32, payload: &[u8]) -> Bytes {
    let mut framed = Vec::with_capacity(16 + payload.len());
    framed.extend_from_slice(&map_id.to_ne_bytes());
    framed.extend_from_slice(&[0u8; 12]);
    framed.extend_from_slice(payload);
    Bytes::from(framed)
}

/// [`DistributedFs`] whose append streams reject every write.
#[derive(Clone, Default)]
pub struct FailingFs {
    inner: MemoryFs,
}

impl FailingFs {
    pub fn new() -> Self {
        Self::default()
    }
}

struct FailingStream;

impl Write for FailingStream {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "injected append failure"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DistributedFs for FailingFs {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        self.inner.exists(path)
    }

    fn create(&self, path: &Path) -> io::Result<()> {
        self.inner.create(path)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        self.inner.delete(path)
    }

    fn open_append(&self, _path: &Path) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(FailingStream))
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.inner.write_file(path, contents)
    }
}
