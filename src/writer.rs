//! The per-partition writer state machine.
//!
//! A [`PartitionWriter`] accepts retained byte buffers from the network
//! layer, accumulates them in a pooled composite buffer, and hands full
//! buffers to its flusher as ordered tasks. `close` drains producers and
//! in-flight flushes under a deadline, records the final chunk boundary
//! and finalises the sink; `destroy` tears everything down from any
//! state. A writer whose notifier carries an error is poisoned: the file
//! is unrecoverable, so writes are deliberately discarded, close
//! re-raises the first error and only destroy makes progress.
//!
//! Locking: `write`, the buffer phase of `close`, and
//! `flush_on_memory_pressure` serialise on one per-writer monitor. The
//! pending-write and pending-flush counters are atomics and stay outside
//! it.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::buffer::CompositeBuffer;
use crate::config::{DiskType, SplitMode, WriterConfig};
use crate::device::{DeviceMonitor, DeviceObserver, DiskStatus, ObserverId};
use crate::error::WriteError;
use crate::flusher::{FlushTask, Flusher};
use crate::memory::MemoryTracker;
use crate::metadata::{FileInfo, StoreKind, encode_chunk_index};
use crate::notifier::{DRAIN_POLL_INTERVAL, FlushNotifier};
use crate::rate_limited_warner::RateLimitedWarner;
use crate::sink::Sink;

/// Writes carrying a range-read header prefix this many bytes of framing.
const RANGE_READ_HEADER_LEN: usize = 16;

/// Where a committed partition can be fetched from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageInfo {
    pub kind: StorageKind,
    /// Mount point for local disks, file path for the distributed store.
    pub location: String,
    pub available: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    LocalDisk(DiskType),
    DistributedFs,
}

/// Shared collaborators a writer is constructed with.
pub struct WriterEnv {
    pub flusher: Arc<Flusher>,
    /// Flusher worker this writer is pinned to; see
    /// [`Flusher::pick_worker`].
    pub worker_index: usize,
    pub device_monitor: Arc<DeviceMonitor>,
    pub memory: Arc<MemoryTracker>,
}

type DestroyHook = Box<dyn FnOnce() + Send>;

struct WriterState {
    /// The composite buffer currently being filled. `None` only inside a
    /// submit/borrow gap or after the writer reached a terminal state.
    buffer: Option<CompositeBuffer>,
    /// Sum of the byte lengths of every successfully submitted flush.
    bytes_flushed: u64,
    /// Next flushed-byte position at which to record a chunk boundary.
    next_boundary: u64,
}

/// Write half of one partition replica.
pub struct PartitionWriter {
    file_info: Arc<FileInfo>,
    sink: Arc<Mutex<Sink>>,
    flusher: Arc<Flusher>,
    worker_index: usize,
    device_monitor: Arc<DeviceMonitor>,
    memory: Arc<MemoryTracker>,
    notifier: Arc<FlushNotifier>,
    state: Mutex<WriterState>,
    /// Writes announced by the I/O layer but not yet landed in the buffer.
    pending_writes: AtomicI64,
    /// Set once `close` or `destroy` has been entered.
    closing: AtomicBool,
    /// Set once no further writes may succeed.
    closed: AtomicBool,
    close_succeeded: AtomicBool,
    /// A DFS peer won the replication race and our copy was removed.
    deleted: AtomicBool,
    observer_id: OnceCell<ObserverId>,
    destroy_hook: Mutex<Option<DestroyHook>>,
    dropped: RateLimitedWarner,
    flush_buffer_size: usize,
    chunk_size: u64,
    close_timeout: Duration,
    split_threshold: u64,
    split_mode: SplitMode,
    range_read_filter: bool,
}

impl PartitionWriter {
    /// Create a writer over a freshly reserved slot, borrowing its first
    /// buffer and registering for device callbacks on the flusher's
    /// mount.
    pub fn open(
        file_info: FileInfo,
        sink: Sink,
        env: WriterEnv,
        config: &WriterConfig,
    ) -> Result<Arc<Self>, WriteError> {
        let WriterEnv {
            flusher,
            worker_index,
            device_monitor,
            memory,
        } = env;
        let buffer = flusher
            .borrow_buffer(config.close_timeout)
            .ok_or(WriteError::BufferExhausted)?;
        let writer = Arc::new(Self {
            file_info: Arc::new(file_info),
            sink: Arc::new(Mutex::new(sink)),
            flusher,
            worker_index,
            device_monitor,
            memory,
            notifier: Arc::new(FlushNotifier::new()),
            state: Mutex::new(WriterState {
                buffer: Some(buffer),
                bytes_flushed: 0,
                next_boundary: config.chunk_size,
            }),
            pending_writes: AtomicI64::new(0),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_succeeded: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            observer_id: OnceCell::new(),
            destroy_hook: Mutex::new(None),
            dropped: RateLimitedWarner::default(),
            flush_buffer_size: config.flush_buffer_size,
            chunk_size: config.chunk_size,
            close_timeout: config.close_timeout,
            split_threshold: config.split_threshold,
            split_mode: config.split_mode,
            range_read_filter: config.range_read_filter,
        });
        let mount = writer.flusher.mount().to_path_buf();
        let id = writer
            .device_monitor
            .register(mount, Arc::downgrade(&writer) as Weak<dyn DeviceObserver>);
        let _ = writer.observer_id.set(id);
        Ok(writer)
    }

    /// Announce a write before its bytes arrive. `close` will not drain
    /// buffers while announced writes are outstanding.
    pub fn increment_pending_writes(&self) {
        self.pending_writes.fetch_add(1, Ordering::SeqCst);
    }

    /// Reconcile an announced write that will never arrive.
    pub fn decrement_pending_writes(&self) {
        self.pending_writes.fetch_sub(1, Ordering::SeqCst);
    }

    /// Append a retained buffer.
    ///
    /// Fails with [`WriteError::AlreadyClosed`] on a terminal writer. On a
    /// poisoned writer the data is discarded and `Ok` returned: the file
    /// is already unrecoverable and the producer cannot do anything with
    /// the failure here.
    pub fn write(&self, data: Bytes) -> Result<(), WriteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WriteError::AlreadyClosed);
        }
        if self.notifier.has_error() {
            self.drop_poisoned(data.len() as u64);
            return Ok(());
        }
        let mut state = self.state.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(WriteError::AlreadyClosed);
        }
        if self.range_read_filter {
            self.record_map_id(&data);
        }
        let num_bytes = data.len();
        let buffered = state.buffer.as_ref().map_or(0, CompositeBuffer::len);
        if buffered > 0 && buffered + num_bytes >= self.flush_buffer_size {
            self.flush_locked(&mut state, false)?;
        }
        match state.buffer.as_mut() {
            Some(buffer) => buffer.push(data),
            None => return Err(WriteError::Io("writer has no active buffer".into())),
        }
        self.memory.reserve_disk_buffer(num_bytes as u64);
        self.pending_writes.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    /// Hand the current buffer to the flusher early so its bytes stop
    /// counting against the worker's memory budget.
    pub fn flush_on_memory_pressure(&self) -> Result<(), WriteError> {
        let mut state = self.state.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if state.buffer.as_ref().is_some_and(|b| !b.is_empty()) {
            self.flush_locked(&mut state, false)?;
        }
        Ok(())
    }

    /// Drain producers and flushes, record the final chunk boundary and
    /// finalise the sink.
    ///
    /// Returns the total bytes flushed even when post-drain finalisation
    /// fails; those failures are logged, not re-raised, because the data
    /// itself already reached the store.
    pub fn close(&self) -> Result<u64, WriteError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Err(WriteError::AlreadyClosed);
        }
        let deadline = Instant::now() + self.close_timeout;
        let drained = self.drain_for_close(deadline);
        self.release_buffer();
        let bytes_flushed = drained?;
        if let Err(err) = self.finalise() {
            error!(
                "failed to finalise {}: {err}",
                self.file_info.file_path().display()
            );
        }
        self.close_succeeded.store(true, Ordering::SeqCst);
        self.unregister();
        Ok(bytes_flushed)
    }

    fn drain_for_close(&self, deadline: Instant) -> Result<u64, WriteError> {
        self.wait_pending_writes(deadline)?;
        self.closed.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            if state.buffer.as_ref().is_some_and(|b| !b.is_empty()) {
                self.flush_locked(&mut state, true)?;
            } else if state.bytes_flushed > 0
                && self.file_info.last_chunk_offset() != Some(state.bytes_flushed)
            {
                self.file_info.add_chunk_offset(state.bytes_flushed);
            }
        }
        self.notifier.await_drain(deadline, self.close_timeout)?;
        Ok(self.state.lock().bytes_flushed)
    }

    /// Tear the writer down from any state. Never raises; repeated calls
    /// only repeat the best-effort file deletes.
    pub fn destroy(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.notifier.set_error(WriteError::Destroyed);
            self.release_buffer();
            if let Err(err) = self.sink.lock().close() {
                warn!(
                    "failed to close sink for {}: {err}",
                    self.file_info.file_path().display()
                );
            }
        }
        self.delete_artifacts();
        self.unregister();
        let hook = self.destroy_hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Install the owner's one-shot teardown callback, run at most once
    /// when the writer is destroyed.
    pub fn set_destroy_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.destroy_hook.lock() = Some(Box::new(hook));
    }

    pub fn file_info(&self) -> &FileInfo {
        &self.file_info
    }

    pub fn bytes_flushed(&self) -> u64 {
        self.state.lock().bytes_flushed
    }

    /// Flushed bytes plus bytes still sitting in the current buffer.
    pub fn file_length(&self) -> u64 {
        let state = self.state.lock();
        state.bytes_flushed + state.buffer.as_ref().map_or(0, CompositeBuffer::len) as u64
    }

    /// Whether the push layer should split this partition.
    pub fn exceeds_split_threshold(&self) -> bool {
        self.file_length() >= self.split_threshold
    }

    pub fn split_mode(&self) -> SplitMode {
        self.split_mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fetch location for a successfully closed writer. `None` until then,
    /// and `None` forever for a DFS file whose peer won the replication
    /// race.
    pub fn storage_info(&self) -> Option<StorageInfo> {
        if !self.close_succeeded.load(Ordering::SeqCst) {
            return None;
        }
        match self.file_info.kind() {
            StoreKind::LocalDisk => Some(StorageInfo {
                kind: StorageKind::LocalDisk(self.flusher.disk_type()),
                location: self.flusher.mount().display().to_string(),
                available: true,
            }),
            StoreKind::DistributedFs => {
                if self.deleted.load(Ordering::SeqCst) {
                    None
                } else {
                    Some(StorageInfo {
                        kind: StorageKind::DistributedFs,
                        location: self.file_info.file_path().display().to_string(),
                        available: true,
                    })
                }
            }
        }
    }

    /// Submit the current buffer as a flush task and record any chunk
    /// boundary it completes. Non-final flushes immediately borrow a
    /// replacement buffer. Caller holds the monitor.
    fn flush_locked(&self, state: &mut WriterState, finalize: bool) -> Result<(), WriteError> {
        self.notifier.check()?;
        let Some(buffer) = state.buffer.take() else {
            return Err(WriteError::Io("writer has no active buffer".into()));
        };
        let num_bytes = buffer.len() as u64;
        let task = FlushTask::new(
            buffer,
            Arc::clone(&self.sink),
            Arc::clone(&self.notifier),
            Arc::clone(&self.memory),
            self.flusher.pool_handle(),
        );
        self.notifier.inc_pending();
        if let Err(task) = self.flusher.submit(task, self.close_timeout, self.worker_index) {
            let err = WriteError::Timeout(self.close_timeout);
            self.notifier.set_error(err.clone());
            task.abandon();
            return Err(err);
        }
        state.bytes_flushed += num_bytes;
        if finalize || state.bytes_flushed >= state.next_boundary {
            self.file_info.add_chunk_offset(state.bytes_flushed);
            state.next_boundary = state.bytes_flushed + self.chunk_size;
        }
        if !finalize {
            match self.flusher.borrow_buffer(self.close_timeout) {
                Some(buffer) => state.buffer = Some(buffer),
                None => {
                    let err = WriteError::BufferExhausted;
                    self.notifier.set_error(err.clone());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn wait_pending_writes(&self, deadline: Instant) -> Result<(), WriteError> {
        loop {
            self.notifier.check()?;
            if self.pending_writes.load(Ordering::SeqCst) <= 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(WriteError::Timeout(self.close_timeout));
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }

    fn release_buffer(&self) {
        let buffer = self.state.lock().buffer.take();
        if let Some(buffer) = buffer {
            self.flusher.return_buffer(buffer);
        }
    }

    fn finalise(&self) -> Result<(), WriteError> {
        let mut sink = self.sink.lock();
        sink.close()?;
        if let Sink::Distributed(dfs) = &*sink {
            if let Some(peer) = self.file_info.peer_success_path() {
                if dfs.exists(peer)? {
                    dfs.delete(self.file_info.file_path())?;
                    self.deleted.store(true, Ordering::SeqCst);
                    debug!(
                        "peer already committed {}; removed our copy",
                        self.file_info.file_path().display()
                    );
                    return Ok(());
                }
            }
            dfs.create(self.file_info.success_path())?;
            let index = encode_chunk_index(&self.file_info.chunk_offsets());
            dfs.write_file(self.file_info.index_path(), &index)?;
        }
        Ok(())
    }

    fn delete_artifacts(&self) {
        let sink = self.sink.lock();
        match &*sink {
            Sink::Local(_) => remove_if_present(self.file_info.file_path()),
            Sink::Distributed(dfs) => {
                for path in [
                    self.file_info.file_path(),
                    self.file_info.success_path(),
                    self.file_info.index_path(),
                ] {
                    if let Err(err) = dfs.delete(path) {
                        debug!("cleanup of {} skipped: {err}", path.display());
                    }
                }
            }
        }
    }

    fn record_map_id(&self, data: &Bytes) {
        if data.len() < RANGE_READ_HEADER_LEN {
            return;
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(&data[..4]);
        self.file_info.record_map_id(u32::from_ne_bytes(id));
    }

    fn drop_poisoned(&self, bytes: u64) {
        self.dropped.record_dropped(bytes);
        self.dropped.warn_if_due(|dropped| {
            warn!(
                "dropping writes to failed partition {}: {dropped} bytes discarded",
                self.file_info.file_path().display()
            );
        });
    }

    fn unregister(&self) {
        if let Some(id) = self.observer_id.get() {
            self.device_monitor.unregister(*id);
        }
    }
}

impl Drop for PartitionWriter {
    fn drop(&mut self) {
        // A writer abandoned without close or destroy must not strand its
        // pooled buffer.
        self.release_buffer();
    }
}

impl DeviceObserver for PartitionWriter {
    fn notify_device_error(&self, mount: &Path, status: DiskStatus) {
        warn!(
            "device error on {} ({status}); poisoning writer for {}",
            mount.display(),
            self.file_info.file_path().display()
        );
        self.notifier.set_error(WriteError::Device {
            mount: mount.display().to_string(),
            status,
        });
        self.unregister();
    }
}

fn remove_if_present(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("could not remove {}: {err}", path.display());
        }
    }
}
