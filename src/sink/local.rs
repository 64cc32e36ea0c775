//! Local-disk appender.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use crate::buffer::CompositeBuffer;

/// Append-only handle on a partition file on a local mount.
pub struct LocalSink {
    file: Option<File>,
}

impl LocalSink {
    /// Open (creating if absent) the partition file for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Some(file) })
    }

    pub fn append(&mut self, buffer: &CompositeBuffer) -> io::Result<()> {
        use io::Write;
        let file = self.file.as_mut().ok_or_else(closed_error)?;
        for segment in buffer.segments() {
            file.write_all(segment)?;
        }
        Ok(())
    }

    /// Push acknowledged flushes out of the page cache and drop the handle.
    pub fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "sink already closed")
}
