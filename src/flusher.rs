//! Per-disk flusher: buffer pool, task queues and drain threads.
//!
//! Each [`Flusher`] owns a pool of reusable composite buffers and one or
//! more single-threaded workers, each draining a bounded FIFO queue of
//! [`FlushTask`]s. A writer is pinned to one worker for its whole life,
//! which is what guarantees its flushes reach the sink in submission
//! order. The pool is a pre-filled bounded channel: borrowing is a
//! timed receive, returning is a send, and the channel bound doubles as
//! the semaphore capping outstanding buffers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use log::warn;
use parking_lot::Mutex;

use crate::buffer::CompositeBuffer;
use crate::config::DiskType;
use crate::error::WriteError;
use crate::memory::MemoryTracker;
use crate::notifier::FlushNotifier;
use crate::sink::Sink;

/// How long `Drop` waits for each drain thread before giving up on it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// One buffer's trip to the sink.
///
/// Immutable once submitted. Executing it drains the buffer into the sink
/// as a single logical append, releases the buffer back to the pool
/// whatever the outcome, and retires itself on the notifier, recording
/// the error first so that observers waking on a drained counter see it.
pub struct FlushTask {
    buffer: CompositeBuffer,
    len: u64,
    sink: Arc<Mutex<Sink>>,
    notifier: Arc<FlushNotifier>,
    memory: Arc<MemoryTracker>,
    pool: Sender<CompositeBuffer>,
}

impl FlushTask {
    pub(crate) fn new(
        buffer: CompositeBuffer,
        sink: Arc<Mutex<Sink>>,
        notifier: Arc<FlushNotifier>,
        memory: Arc<MemoryTracker>,
        pool: Sender<CompositeBuffer>,
    ) -> Self {
        let len = buffer.len() as u64;
        Self {
            buffer,
            len,
            sink,
            notifier,
            memory,
            pool,
        }
    }

    fn run(self) {
        let Self {
            mut buffer,
            len,
            sink,
            notifier,
            memory,
            pool,
        } = self;
        let result = sink.lock().append(&buffer);
        buffer.clear();
        if pool.try_send(buffer).is_err() {
            warn!("flush buffer pool refused a returned buffer");
        }
        memory.release_disk_buffer(len);
        if let Err(err) = result {
            notifier.set_error(WriteError::from(err));
        }
        notifier.dec_pending();
    }

    /// Give up on a task that was never enqueued: release the buffer and
    /// the memory reservation and retire the pending count. The caller
    /// latches whatever error led here before invoking this.
    pub(crate) fn abandon(self) {
        let Self {
            mut buffer,
            len,
            memory,
            pool,
            notifier,
            ..
        } = self;
        buffer.clear();
        if pool.try_send(buffer).is_err() {
            warn!("flush buffer pool refused a returned buffer");
        }
        memory.release_disk_buffer(len);
        notifier.dec_pending();
    }
}

/// Sizing knobs for a [`Flusher`].
#[derive(Clone, Copy, Debug)]
pub struct FlusherConfig {
    /// Drain threads for this mount.
    pub workers: usize,
    /// Task-queue depth per worker.
    pub queue_capacity: usize,
    /// Composite buffers shared by every writer on this mount.
    pub pool_size: usize,
    /// Capacity of each pooled buffer.
    pub flush_buffer_size: usize,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 512,
            pool_size: 64,
            flush_buffer_size: crate::config::DEFAULT_FLUSH_BUFFER_SIZE,
        }
    }
}

struct WorkerSlot {
    tx: Option<Sender<FlushTask>>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

/// Buffer pool plus drain workers for one mount.
pub struct Flusher {
    mount: PathBuf,
    disk_type: DiskType,
    worker_count: usize,
    pool_tx: Sender<CompositeBuffer>,
    pool_rx: Receiver<CompositeBuffer>,
    workers: Mutex<Vec<WorkerSlot>>,
}

impl Flusher {
    pub fn new(mount: impl Into<PathBuf>, disk_type: DiskType, config: FlusherConfig) -> Self {
        let worker_count = config.workers.max(1);
        let (pool_tx, pool_rx) = bounded(config.pool_size.max(1));
        for _ in 0..config.pool_size.max(1) {
            let _ = pool_tx.try_send(CompositeBuffer::with_capacity(config.flush_buffer_size));
        }
        let workers = (0..worker_count)
            .map(|_| {
                let (tx, rx) = bounded(config.queue_capacity.max(1));
                let (done_rx, handle) = spawn_worker(rx);
                WorkerSlot {
                    tx: Some(tx),
                    done_rx,
                    handle: Some(handle),
                }
            })
            .collect();
        Self {
            mount: mount.into(),
            disk_type,
            worker_count,
            pool_tx,
            pool_rx,
            workers: Mutex::new(workers),
        }
    }

    pub fn mount(&self) -> &Path {
        &self.mount
    }

    pub fn disk_type(&self) -> DiskType {
        self.disk_type
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Pin a partition onto one of this flusher's workers.
    pub fn pick_worker(&self, partition_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        partition_id.hash(&mut hasher);
        (hasher.finish() % self.worker_count as u64) as usize
    }

    /// Borrow an empty buffer from the pool, waiting up to `timeout` for
    /// one to free up. `None` tells the caller to poison its writer.
    pub fn borrow_buffer(&self, timeout: Duration) -> Option<CompositeBuffer> {
        self.pool_rx.recv_timeout(timeout).ok()
    }

    /// Return a buffer to the pool. Safe from any thread; the buffer is
    /// cleared on the way in.
    pub fn return_buffer(&self, mut buffer: CompositeBuffer) {
        buffer.clear();
        if self.pool_tx.try_send(buffer).is_err() {
            warn!("flush buffer pool refused a returned buffer");
        }
    }

    /// Buffers currently idle in the pool.
    pub fn available_buffers(&self) -> usize {
        self.pool_rx.len()
    }

    /// Handle for flush tasks to return their buffers with.
    pub(crate) fn pool_handle(&self) -> Sender<CompositeBuffer> {
        self.pool_tx.clone()
    }

    /// Enqueue a task on the given worker, waiting up to `timeout` when
    /// the queue is full. On timeout (or after shutdown) the task comes
    /// back to the caller so its buffer can be recovered.
    pub fn submit(
        &self,
        task: FlushTask,
        timeout: Duration,
        worker_index: usize,
    ) -> Result<(), FlushTask> {
        let tx = {
            let workers = self.workers.lock();
            workers
                .get(worker_index % self.worker_count)
                .and_then(|slot| slot.tx.clone())
        };
        match tx {
            Some(tx) => tx.send_timeout(task, timeout).map_err(|err| err.into_inner()),
            None => Err(task),
        }
    }

    /// Stop accepting tasks, drain the queues and join the workers.
    ///
    /// Waits up to `timeout` per worker, logging the stragglers rather
    /// than blocking forever on a hung sink.
    pub fn shutdown(&self, timeout: Duration) {
        let mut workers = self.workers.lock();
        for slot in workers.iter_mut() {
            slot.tx = None;
        }
        for slot in workers.iter_mut() {
            if slot.handle.is_none() {
                continue;
            }
            if slot.done_rx.recv_timeout(timeout).is_err() {
                warn!("flusher worker on {} did not stop within {timeout:?}", self.mount.display());
                continue;
            }
            if let Some(handle) = slot.handle.take() {
                if handle.join().is_err() {
                    warn!("flusher worker on {} panicked", self.mount.display());
                }
            }
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.shutdown(SHUTDOWN_GRACE);
    }
}

fn spawn_worker(rx: Receiver<FlushTask>) -> (Receiver<()>, JoinHandle<()>) {
    let (done_tx, done_rx) = bounded(1);
    let handle = thread::spawn(move || {
        for task in rx {
            task.run();
        }
        let _ = done_tx.send(());
    });
    (done_rx, handle)
}
