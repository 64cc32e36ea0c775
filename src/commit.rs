//! Commit and destroy coordination across the writers of a shuffle.
//!
//! The [`Controller`] owns the registry mapping a shuffle key to its live
//! writers and drives the lifecycle RPCs: `reserve` creates writers (and
//! rolls every one of them back if any creation fails), `commit_files`
//! fans `close` out across both replica sides under a wall-clock
//! deadline, and `handle_destroy` tears writers down. Closes that miss
//! the commit deadline are abandoned, not interrupted: a thread stuck in
//! sink I/O cannot be cancelled safely, so it finishes on its own and
//! its result is ignored.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use crossbeam_channel::bounded;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;

use crate::config::WriterConfig;
use crate::error::WriteError;
use crate::writer::{PartitionWriter, StorageInfo};

/// Which replica side an id belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Primary,
    Replica,
}

struct CloseOutcome {
    side: Side,
    id: String,
    result: Result<u64, WriteError>,
    storage: Option<StorageInfo>,
    map_ids: Option<RoaringBitmap>,
}

/// What a commit achieved for the ids that went through.
#[derive(Debug, Default)]
pub struct CommitReport {
    pub committed_primary_ids: Vec<String>,
    pub committed_replica_ids: Vec<String>,
    /// Fetch location per committed id.
    pub storage_infos: HashMap<String, StorageInfo>,
    /// Map-id presence bitmap per committed id, where the range-read
    /// filter recorded one.
    pub map_id_bitmaps: HashMap<String, RoaringBitmap>,
    /// Committed byte sizes large enough to feed partition-size
    /// estimation on the master.
    pub committed_sizes: Vec<u64>,
}

/// Reply to a `CommitFiles` request.
#[derive(Debug)]
pub enum CommitResponse {
    Success(CommitReport),
    PartialSuccess {
        report: CommitReport,
        failed_primary_ids: Vec<String>,
        failed_replica_ids: Vec<String>,
    },
    ShuffleNotRegistered,
}

/// Reply to a `Destroy` request: the ids that had no live writer.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DestroyResponse {
    pub failed_primary_ids: Vec<String>,
    pub failed_replica_ids: Vec<String>,
}

/// Registry and lifecycle coordinator for every writer on this worker.
pub struct Controller {
    registry: RwLock<HashMap<String, HashMap<String, Arc<PartitionWriter>>>>,
    mapper_attempts: Mutex<HashMap<String, Arc<Vec<i32>>>>,
    config: WriterConfig,
}

impl Controller {
    pub fn new(config: WriterConfig) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            mapper_attempts: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Create and register writers for every id of a shuffle.
    ///
    /// `create` is called once per id, primaries first. If any creation
    /// fails, every writer created so far, on both sides, is destroyed
    /// before the error is returned, so a failed reservation never leaks
    /// slots.
    pub fn reserve<F>(
        self: &Arc<Self>,
        shuffle_key: &str,
        primary_ids: &[String],
        replica_ids: &[String],
        mut create: F,
    ) -> Result<(), WriteError>
    where
        F: FnMut(&str) -> Result<Arc<PartitionWriter>, WriteError>,
    {
        let mut created: Vec<(String, Arc<PartitionWriter>)> = Vec::new();
        for id in primary_ids.iter().chain(replica_ids) {
            match create(id) {
                Ok(writer) => created.push((id.clone(), writer)),
                Err(err) => {
                    warn!(
                        "reservation for {shuffle_key} failed at {id}: {err}; destroying {} writers already created",
                        created.len()
                    );
                    for (_, writer) in &created {
                        writer.destroy();
                    }
                    return Err(err);
                }
            }
        }
        let mut registry = self.registry.write();
        let shuffle = registry.entry(shuffle_key.to_string()).or_default();
        for (id, writer) in created {
            let controller = Arc::downgrade(self);
            let key = shuffle_key.to_string();
            let unlink_id = id.clone();
            writer.set_destroy_hook(move || {
                if let Some(controller) = Weak::upgrade(&controller) {
                    controller.unlink(&key, &unlink_id);
                }
            });
            shuffle.insert(id, writer);
        }
        Ok(())
    }

    /// Look up a live writer.
    pub fn writer(&self, shuffle_key: &str, id: &str) -> Option<Arc<PartitionWriter>> {
        self.registry.read().get(shuffle_key)?.get(id).cloned()
    }

    /// Live writers registered for a shuffle.
    pub fn writer_count(&self, shuffle_key: &str) -> usize {
        self.registry.read().get(shuffle_key).map_or(0, HashMap::len)
    }

    /// The mapper-attempt array recorded for a shuffle, if any.
    pub fn mapper_attempts(&self, shuffle_key: &str) -> Option<Arc<Vec<i32>>> {
        self.mapper_attempts.lock().get(shuffle_key).cloned()
    }

    /// Close every named writer of a shuffle in parallel and classify the
    /// results.
    ///
    /// Always replies, even when the commit deadline expires: ids whose
    /// close did not finish in time are reported in the failed lists and
    /// their closes left to finish unobserved. Ids with no live writer
    /// are logged and skipped; writers that flushed zero bytes are
    /// dropped silently.
    pub fn commit_files(
        &self,
        shuffle_key: &str,
        primary_ids: &[String],
        replica_ids: &[String],
        mapper_attempts: Vec<i32>,
    ) -> CommitResponse {
        self.record_mapper_attempts(shuffle_key, mapper_attempts);
        let Some(shuffle) = self.registry.read().get(shuffle_key).cloned() else {
            return CommitResponse::ShuffleNotRegistered;
        };

        let (outcome_tx, outcome_rx) = bounded(primary_ids.len() + replica_ids.len());
        let mut spawned: Vec<(Side, String)> = Vec::new();
        for (side, ids) in [(Side::Primary, primary_ids), (Side::Replica, replica_ids)] {
            for id in ids {
                let Some(writer) = shuffle.get(id) else {
                    debug!("no writer for {id} in {shuffle_key}; skipping commit");
                    continue;
                };
                spawned.push((side, id.clone()));
                let writer = Arc::clone(writer);
                let outcome_tx = outcome_tx.clone();
                let id = id.clone();
                thread::spawn(move || {
                    let result = writer.close();
                    let _ = outcome_tx.send(CloseOutcome {
                        side,
                        id,
                        result,
                        storage: writer.storage_info(),
                        map_ids: writer.file_info().map_id_bitmap(),
                    });
                });
            }
        }
        drop(outcome_tx);

        let deadline = Instant::now() + self.config.shuffle_commit_timeout;
        let mut outcomes = Vec::with_capacity(spawned.len());
        for _ in 0..spawned.len() {
            match outcome_rx.recv_deadline(deadline) {
                Ok(outcome) => outcomes.push(outcome),
                Err(_) => {
                    warn!(
                        "commit of {shuffle_key} cancelled after {:?}; abandoning {} unfinished closes",
                        self.config.shuffle_commit_timeout,
                        spawned.len() - outcomes.len()
                    );
                    break;
                }
            }
        }

        let mut report = CommitReport::default();
        let mut failed_primary_ids = Vec::new();
        let mut failed_replica_ids = Vec::new();
        let mut finished: HashSet<String> = HashSet::new();
        for outcome in outcomes {
            finished.insert(outcome.id.clone());
            self.classify(outcome, &mut report, &mut failed_primary_ids, &mut failed_replica_ids);
        }
        for (side, id) in spawned {
            if !finished.contains(&id) {
                debug!("close of {id} abandoned: {}", WriteError::Cancelled);
                match side {
                    Side::Primary => failed_primary_ids.push(id),
                    Side::Replica => failed_replica_ids.push(id),
                }
            }
        }

        self.release_slots(shuffle_key, primary_ids, replica_ids);

        if failed_primary_ids.is_empty() && failed_replica_ids.is_empty() {
            CommitResponse::Success(report)
        } else {
            CommitResponse::PartialSuccess {
                report,
                failed_primary_ids,
                failed_replica_ids,
            }
        }
    }

    /// Destroy every named writer of a shuffle. Ids with no live writer
    /// are reported back as failed destroys.
    pub fn handle_destroy(
        &self,
        shuffle_key: &str,
        primary_ids: &[String],
        replica_ids: &[String],
    ) -> DestroyResponse {
        let shuffle = self
            .registry
            .read()
            .get(shuffle_key)
            .cloned()
            .unwrap_or_default();
        let mut response = DestroyResponse::default();
        for (side, ids) in [(Side::Primary, primary_ids), (Side::Replica, replica_ids)] {
            for id in ids {
                match shuffle.get(id) {
                    Some(writer) => writer.destroy(),
                    None => {
                        debug!("no writer for {id} in {shuffle_key}; reporting failed destroy");
                        match side {
                            Side::Primary => response.failed_primary_ids.push(id.clone()),
                            Side::Replica => response.failed_replica_ids.push(id.clone()),
                        }
                    }
                }
            }
        }
        self.release_slots(shuffle_key, primary_ids, replica_ids);
        response
    }

    fn classify(
        &self,
        outcome: CloseOutcome,
        report: &mut CommitReport,
        failed_primary_ids: &mut Vec<String>,
        failed_replica_ids: &mut Vec<String>,
    ) {
        let CloseOutcome {
            side,
            id,
            result,
            storage,
            map_ids,
        } = outcome;
        match result {
            Ok(bytes) if bytes > 0 && storage.is_some() => {
                if let Some(storage) = storage {
                    report.storage_infos.insert(id.clone(), storage);
                }
                if let Some(map_ids) = map_ids {
                    report.map_id_bitmaps.insert(id.clone(), map_ids);
                }
                if bytes >= self.config.min_partition_size_to_estimate {
                    report.committed_sizes.push(bytes);
                }
                match side {
                    Side::Primary => report.committed_primary_ids.push(id),
                    Side::Replica => report.committed_replica_ids.push(id),
                }
            }
            Ok(bytes) => {
                // Empty files and replication-race losers hold no data a
                // reader could want; they vanish from the reply.
                debug!("dropping {id} from commit reply ({bytes} bytes, storage {storage:?})");
            }
            Err(err) => {
                warn!("close of {id} failed: {err}");
                match side {
                    Side::Primary => failed_primary_ids.push(id),
                    Side::Replica => failed_replica_ids.push(id),
                }
            }
        }
    }

    fn record_mapper_attempts(&self, shuffle_key: &str, attempts: Vec<i32>) {
        self.mapper_attempts
            .lock()
            .entry(shuffle_key.to_string())
            .or_insert_with(|| Arc::new(attempts));
    }

    /// Remove the named ids from the partition-location index.
    fn release_slots(&self, shuffle_key: &str, primary_ids: &[String], replica_ids: &[String]) {
        let mut registry = self.registry.write();
        if let Some(shuffle) = registry.get_mut(shuffle_key) {
            for id in primary_ids.iter().chain(replica_ids) {
                shuffle.remove(id);
            }
            if shuffle.is_empty() {
                registry.remove(shuffle_key);
            }
        }
    }

    /// Destroy-hook path: forget a single writer.
    fn unlink(&self, shuffle_key: &str, id: &str) {
        let mut registry = self.registry.write();
        if let Some(shuffle) = registry.get_mut(shuffle_key) {
            shuffle.remove(id);
            if shuffle.is_empty() {
                registry.remove(shuffle_key);
            }
        }
    }
}
