//! Distributed-filesystem appender.
//!
//! The actual filesystem is abstracted behind [`DistributedFs`] so the
//! write path stays independent of any particular client library. Two
//! implementations ship here: [`MountedFs`], which drives a directory on a
//! mounted network filesystem through ordinary file operations, and
//! [`MemoryFs`], an in-process store for tests and local experimentation.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::CompositeBuffer;

/// Path operations a distributed filesystem must provide.
///
/// `open_append` is used throughout a file's life; the rest only at close,
/// when markers and the chunk index are published.
pub trait DistributedFs: Send + Sync {
    fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Create a zero-byte file, truncating any previous content.
    fn create(&self, path: &Path) -> io::Result<()>;

    fn delete(&self, path: &Path) -> io::Result<()>;

    /// Open a sequential append stream.
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    /// Write a small file in one shot (the chunk index).
    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
}

/// Append stream plus the path operations needed at close.
pub struct DfsSink {
    fs: Arc<dyn DistributedFs>,
    stream: Option<Box<dyn Write + Send>>,
}

impl DfsSink {
    /// Open an append stream for the partition file.
    pub fn open(fs: Arc<dyn DistributedFs>, path: &Path) -> io::Result<Self> {
        let stream = fs.open_append(path)?;
        Ok(Self {
            fs,
            stream: Some(stream),
        })
    }

    pub fn append(&mut self, buffer: &CompositeBuffer) -> io::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "sink already closed"))?;
        for segment in buffer.segments() {
            stream.write_all(segment)?;
        }
        Ok(())
    }

    /// Flush and drop the append stream.
    pub fn close(&mut self) -> io::Result<()> {
        match self.stream.take() {
            Some(mut stream) => stream.flush(),
            None => Ok(()),
        }
    }

    pub fn exists(&self, path: &Path) -> io::Result<bool> {
        self.fs.exists(path)
    }

    pub fn create(&self, path: &Path) -> io::Result<()> {
        self.fs.create(path)
    }

    pub fn delete(&self, path: &Path) -> io::Result<()> {
        self.fs.delete(path)
    }

    pub fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.fs.write_file(path, contents)
    }
}

/// [`DistributedFs`] over a mounted directory (NFS and friends).
#[derive(Debug, Default)]
pub struct MountedFs;

impl DistributedFs for MountedFs {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(path.exists())
    }

    fn create(&self, path: &Path) -> io::Result<()> {
        File::create(path).map(|_| ())
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(file))
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        fs::write(path, contents)
    }
}

/// In-process [`DistributedFs`] keeping every file in a map.
#[derive(Debug, Default, Clone)]
pub struct MemoryFs {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of a stored file, if present.
    pub fn read(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    /// Paths currently stored, for asserting cleanup.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.lock().keys().cloned().collect()
    }
}

struct MemoryStream {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
    path: PathBuf,
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.files
            .lock()
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DistributedFs for MemoryFs {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.files.lock().contains_key(path))
    }

    fn create(&self, path: &Path) -> io::Result<()> {
        self.files.lock().insert(path.to_path_buf(), Vec::new());
        Ok(())
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        match self.files.lock().remove(path) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        self.files.lock().entry(path.to_path_buf()).or_default();
        Ok(Box::new(MemoryStream {
            files: Arc::clone(&self.files),
            path: path.to_path_buf(),
        }))
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.files.lock().insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }
}
