//! Pending-flush tracking per writer.
//!
//! The [`FlushNotifier`] pairs an atomic in-flight counter with a sticky
//! first-wins error slot. Once the slot is set the whole file is treated
//! as unavailable and no partial-file recovery is attempted: writes drop
//! silently, close re-raises the first error, only destroy proceeds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;

use crate::error::WriteError;

/// How often the drain loops re-check their condition.
pub(crate) const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Counter and error latch shared between a writer and its flush tasks.
#[derive(Debug, Default)]
pub struct FlushNotifier {
    pending: AtomicUsize,
    error: OnceCell<WriteError>,
}

impl FlushNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a flush task about to be submitted.
    pub fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Retire a flush task, successful or not.
    pub fn dec_pending(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Latch an error. The first caller wins; later errors are discarded.
    pub fn set_error(&self, err: WriteError) {
        let _ = self.error.set(err);
    }

    pub fn has_error(&self) -> bool {
        self.error.get().is_some()
    }

    /// The latched error, if any.
    pub fn error(&self) -> Option<WriteError> {
        self.error.get().cloned()
    }

    /// Fail fast when the writer is already poisoned.
    pub fn check(&self) -> Result<(), WriteError> {
        match self.error.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Wait until every in-flight flush has retired.
    ///
    /// Polls the counter, short-circuiting as soon as an error is latched.
    /// `waited` in the timeout error reports the full budget, not the
    /// elapsed slice, matching how the deadline was configured.
    pub fn await_drain(&self, deadline: Instant, budget: Duration) -> Result<(), WriteError> {
        loop {
            self.check()?;
            if self.pending() == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(WriteError::Timeout(budget));
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }
}
