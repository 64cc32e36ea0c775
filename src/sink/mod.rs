//! Backing sinks: where flushed bytes land.
//!
//! A [`Sink`] is the write half of a partition file, either a local file
//! handle or a stream onto a distributed filesystem. Appends are strictly
//! sequential with no seeking and no concurrent appenders; the flusher's
//! single drain thread per worker upholds that. The DFS variant carries
//! the extra path operations used only during close.

mod dfs;
mod local;

use std::io;

pub use dfs::{DfsSink, DistributedFs, MemoryFs, MountedFs};
pub use local::LocalSink;

use crate::buffer::CompositeBuffer;

/// The two concrete sinks behind one capability set.
pub enum Sink {
    Local(LocalSink),
    Distributed(DfsSink),
}

impl Sink {
    /// Drain a composite buffer into the file as one sequential append.
    pub fn append(&mut self, buffer: &CompositeBuffer) -> io::Result<()> {
        match self {
            Sink::Local(sink) => sink.append(buffer),
            Sink::Distributed(sink) => sink.append(buffer),
        }
    }

    /// Flush and release the underlying handle. Append must not be called
    /// afterwards.
    pub fn close(&mut self) -> io::Result<()> {
        match self {
            Sink::Local(sink) => sink.close(),
            Sink::Distributed(sink) => sink.close(),
        }
    }
}
