//! Maintenance
//!
//! Space reclamation that runs outside transactions.
//!
//! ## Responsibilities
//! - Idle cleanup: after a transaction reports excessive stale index
//!   entries, sweep them and compact once no transaction is active
//! - Pre-close tasks: a tombstone sweep and a compaction run when the last
//!   connection closes, each throttled by a persisted earliest-run time and
//!   a process-wide spacing
//!
//! ## Pre-close run
//! ```text
//! build_pre_close_queue ──► [TombstoneSweeper, CompactionTask]
//!                                 │
//!             run(): round, round, round ... until done
//!                                 │
//!          budget spent / stop handle set ──► task.stop(reason)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{const_mutex, Mutex};

use crate::backing_store::StoreInner;
use crate::coding::keys::{EarliestCompactionKey, EarliestSweepKey, ExistsEntryKey, IndexDataKey, KeyPrefix};
use crate::coding::{decode_int, decode_var_int};
use crate::error::{IdbError, Result};
use crate::kv::{get_int, put_int, DirectTransaction, KvIterator, KvStore, KvView, WriteBatch};
use crate::metadata::DatabaseMetadata;
use crate::reporting::{report_read_error, ErrorLocation};

// =============================================================================
// Idle cleanup
// =============================================================================

/// Tracks whether a tombstone-triggered cleanup is owed and whether it may
/// run yet
#[derive(Debug, Default)]
pub struct CleanupScheduler {
    active_transactions: usize,
    pending_since: Option<Instant>,
}

impl CleanupScheduler {
    pub fn on_transaction_start(&mut self) {
        self.active_transactions += 1;
        // New activity postpones a pending cleanup.
        if self.pending_since.is_some() {
            self.pending_since = Some(Instant::now());
        }
    }

    pub fn on_transaction_complete(&mut self, tombstone_threshold_exceeded: bool) {
        self.active_transactions = self.active_transactions.saturating_sub(1);
        if tombstone_threshold_exceeded && self.pending_since.is_none() {
            tracing::debug!("scheduling cleanup after tombstone-heavy transaction");
            self.pending_since = Some(Instant::now());
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }

    /// Claim the pending cleanup if it is due. `force` skips the delay but
    /// never runs while a transaction is active.
    pub fn take_if_due(&mut self, delay: Duration, force: bool) -> bool {
        let Some(since) = self.pending_since else {
            return false;
        };
        if self.active_transactions > 0 || (!force && since.elapsed() < delay) {
            return false;
        }
        self.pending_since = None;
        true
    }
}

/// Delete every stale index entry, then compact each database
pub fn run_idle_cleanup(engine: &Arc<dyn KvStore>, metadata: &[DatabaseMetadata]) -> Result<()> {
    let started = Instant::now();

    let mut sweeper = TombstoneSweeper::new(Arc::clone(engine), SweepMode::Delete);
    sweeper.set_metadata(metadata);
    while !sweeper.run_round()? {}

    let mut compaction = CompactionTask::new(Arc::clone(engine));
    compaction.set_metadata(metadata);
    while !compaction.run_round()? {}

    tracing::info!(
        deleted = sweeper.stats().tombstones_deleted,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "idle cleanup finished"
    );
    Ok(())
}

// =============================================================================
// Pre-close tasks
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The queue's time budget ran out
    Timeout,
    /// A connection opened; the store is in use again
    NewConnection,
    Error,
}

/// Work run in bounded rounds while the store has no connections
pub trait PreCloseTask: Send {
    fn name(&self) -> &'static str;

    fn requires_metadata(&self) -> bool {
        false
    }

    fn set_metadata(&mut self, _metadata: &[DatabaseMetadata]) {}

    /// One bounded unit of work. Returns true once the task is finished.
    fn run_round(&mut self) -> Result<bool>;

    /// Halt; no disk work may follow
    fn stop(&mut self, reason: StopReason);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// Only count stale entries
    Count,
    Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub entries_seen: u64,
    pub tombstones_found: u64,
    pub tombstones_deleted: u64,
    pub tombstone_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct IndexTarget {
    database_id: i64,
    object_store_id: i64,
    index_id: i64,
}

/// Walks every index of every database and finds entries whose record
/// version no longer matches
pub struct TombstoneSweeper {
    engine: Arc<dyn KvStore>,
    mode: SweepMode,
    round_size: usize,
    targets: Vec<IndexTarget>,
    next_target: usize,
    resume_key: Option<Vec<u8>>,
    stats: SweepStats,
    stopped: Option<StopReason>,
}

impl TombstoneSweeper {
    const DEFAULT_ROUND_SIZE: usize = 1000;

    pub fn new(engine: Arc<dyn KvStore>, mode: SweepMode) -> Self {
        Self {
            engine,
            mode,
            round_size: Self::DEFAULT_ROUND_SIZE,
            targets: Vec::new(),
            next_target: 0,
            resume_key: None,
            stats: SweepStats::default(),
            stopped: None,
        }
    }

    /// Entries visited per round
    pub fn with_round_size(mut self, round_size: usize) -> Self {
        self.round_size = round_size.max(1);
        self
    }

    pub fn stats(&self) -> SweepStats {
        self.stats
    }

    pub fn stopped(&self) -> Option<StopReason> {
        self.stopped
    }

    fn is_tombstone(&self, target: IndexTarget, value: &[u8]) -> Result<bool> {
        let mut input = value;
        let version = decode_var_int(&mut input).ok_or_else(|| {
            report_read_error(ErrorLocation::TombstoneSweeper);
            IdbError::InternalInconsistency("index entry version failed to decode")
        })?;
        let exists_key = ExistsEntryKey::encode_encoded(target.database_id, target.object_store_id, input);
        match self.engine.get(&exists_key)? {
            Some(stored) => Ok(decode_int(&stored) != Some(version)),
            None => Ok(true),
        }
    }
}

impl PreCloseTask for TombstoneSweeper {
    fn name(&self) -> &'static str {
        "tombstone-sweeper"
    }

    fn requires_metadata(&self) -> bool {
        true
    }

    fn set_metadata(&mut self, metadata: &[DatabaseMetadata]) {
        self.targets.clear();
        for database in metadata {
            let Some(database_id) = database.id else {
                continue;
            };
            for store in database.object_stores.values() {
                for index_id in store.indexes.keys() {
                    self.targets.push(IndexTarget {
                        database_id,
                        object_store_id: store.id,
                        index_id: *index_id,
                    });
                }
            }
        }
        self.next_target = 0;
        self.resume_key = None;
    }

    fn run_round(&mut self) -> Result<bool> {
        if self.stopped.is_some() {
            return Ok(true);
        }

        let view: &dyn KvStore = &*self.engine;
        let mut batch = WriteBatch::new();
        let mut visited = 0;
        while visited < self.round_size {
            let Some(target) = self.targets.get(self.next_target).copied() else {
                break;
            };
            let start = self.resume_key.take().unwrap_or_else(|| {
                IndexDataKey::encode_min_key(target.database_id, target.object_store_id, target.index_id)
            });
            let stop = IndexDataKey::encode_max_key(target.database_id, target.object_store_id, target.index_id);

            let mut it = KvIterator::new();
            it.seek(view, &start)?;
            while it.is_valid() && it.key() < stop.as_slice() && visited < self.round_size {
                visited += 1;
                self.stats.entries_seen += 1;
                if self.is_tombstone(target, it.value())? {
                    self.stats.tombstones_found += 1;
                    self.stats.tombstone_bytes += (it.key().len() + it.value().len()) as u64;
                    if self.mode == SweepMode::Delete {
                        batch.delete(it.key().to_vec());
                    }
                }
                it.next(view)?;
            }

            if it.is_valid() && it.key() < stop.as_slice() {
                self.resume_key = Some(it.key().to_vec());
            } else {
                self.next_target += 1;
            }
        }

        if !batch.is_empty() {
            let deleted = batch.len() as u64;
            self.engine.write(batch, false)?;
            self.stats.tombstones_deleted += deleted;
        }

        let done = self.next_target >= self.targets.len();
        if done {
            tracing::debug!(
                seen = self.stats.entries_seen,
                found = self.stats.tombstones_found,
                deleted = self.stats.tombstones_deleted,
                "tombstone sweep finished"
            );
        }
        Ok(done)
    }

    fn stop(&mut self, reason: StopReason) {
        tracing::debug!(?reason, seen = self.stats.entries_seen, "tombstone sweep stopped");
        self.stopped = Some(reason);
    }
}

/// Compacts one database per round
pub struct CompactionTask {
    engine: Arc<dyn KvStore>,
    database_ids: Vec<i64>,
    next: usize,
    stopped: Option<StopReason>,
}

impl CompactionTask {
    pub fn new(engine: Arc<dyn KvStore>) -> Self {
        Self { engine, database_ids: Vec::new(), next: 0, stopped: None }
    }
}

impl PreCloseTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn requires_metadata(&self) -> bool {
        true
    }

    fn set_metadata(&mut self, metadata: &[DatabaseMetadata]) {
        self.database_ids = metadata.iter().filter_map(|database| database.id).collect();
        self.next = 0;
    }

    fn run_round(&mut self) -> Result<bool> {
        if self.stopped.is_some() {
            return Ok(true);
        }
        if let Some(&database_id) = self.database_ids.get(self.next) {
            self.engine.compact_range(
                &KeyPrefix::database(database_id).encode(),
                &KeyPrefix::database(database_id + 1).encode(),
            )?;
            self.next += 1;
        }
        Ok(self.next >= self.database_ids.len())
    }

    fn stop(&mut self, reason: StopReason) {
        self.stopped = Some(reason);
    }
}

// =============================================================================
// Queue
// =============================================================================

/// Set from another thread to interrupt a running queue
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreCloseOutcome {
    pub completed: Vec<&'static str>,
    pub stopped: Option<(&'static str, StopReason)>,
}

pub type MetadataSource = Box<dyn FnOnce() -> Result<Vec<DatabaseMetadata>> + Send>;

pub struct PreCloseTaskQueue {
    tasks: VecDeque<Box<dyn PreCloseTask>>,
    budget: Duration,
    stop: StopHandle,
    metadata_source: Option<MetadataSource>,
}

impl PreCloseTaskQueue {
    pub fn new(tasks: Vec<Box<dyn PreCloseTask>>, budget: Duration, metadata_source: MetadataSource) -> Self {
        Self {
            tasks: tasks.into(),
            budget,
            stop: StopHandle::default(),
            metadata_source: Some(metadata_source),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|task| task.name()).collect()
    }

    /// Run every task to completion, the budget or a stop request
    pub fn run(mut self) -> Result<PreCloseOutcome> {
        let started = Instant::now();
        let mut outcome = PreCloseOutcome::default();
        let mut metadata: Option<Vec<DatabaseMetadata>> = None;

        while let Some(mut task) = self.tasks.pop_front() {
            if task.requires_metadata() {
                if metadata.is_none() {
                    // Loaded once, for the first task that asks.
                    let source = self.metadata_source.take().ok_or(IdbError::InternalInconsistency(
                        "pre-close metadata requested twice",
                    ))?;
                    match source() {
                        Ok(loaded) => metadata = Some(loaded),
                        Err(err) => {
                            task.stop(StopReason::Error);
                            return Err(err);
                        }
                    }
                }
                if let Some(metadata) = &metadata {
                    task.set_metadata(metadata);
                }
            }

            loop {
                let reason = if self.stop.is_stopped() {
                    Some(StopReason::NewConnection)
                } else if started.elapsed() >= self.budget {
                    Some(StopReason::Timeout)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    task.stop(reason);
                    for remaining in self.tasks.iter_mut() {
                        remaining.stop(reason);
                    }
                    outcome.stopped = Some((task.name(), reason));
                    return Ok(outcome);
                }

                match task.run_round() {
                    Ok(true) => {
                        outcome.completed.push(task.name());
                        break;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(task = task.name(), %err, "pre-close task failed");
                        task.stop(StopReason::Error);
                        return Err(err);
                    }
                }
            }
        }
        Ok(outcome)
    }
}

// =============================================================================
// Throttling
// =============================================================================

static LAST_GLOBAL_SWEEP: Mutex<Option<Instant>> = const_mutex(None);
static LAST_GLOBAL_COMPACTION: Mutex<Option<Instant>> = const_mutex(None);

fn to_micros(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|since| since.as_micros() as i64)
        .unwrap_or(0)
}

/// Claim a maintenance run: the persisted earliest time must have passed
/// and no store of this process may have run the same task within
/// `global_spacing`. A claimed run pushes both forward.
fn claim_run(
    store: &StoreInner,
    earliest_key: Vec<u8>,
    interval: Duration,
    global_last_run: &Mutex<Option<Instant>>,
) -> Result<bool> {
    let now = SystemTime::now();
    let mut direct = DirectTransaction::new(Arc::clone(&store.engine));
    if let Some(earliest) = get_int(&direct, &earliest_key)? {
        if earliest > to_micros(now) {
            return Ok(false);
        }
    }

    let mut last_run = global_last_run.lock();
    if let Some(last) = *last_run {
        if last.elapsed() < store.config.global_maintenance_spacing {
            return Ok(false);
        }
    }

    put_int(&mut direct, earliest_key, to_micros(now + interval))?;
    direct.commit()?;
    *last_run = Some(Instant::now());
    Ok(true)
}

/// The pre-close tasks that are due for `store`, or `None`
pub(crate) fn build_pre_close_queue(store: &Arc<StoreInner>) -> Result<Option<PreCloseTaskQueue>> {
    let config = &store.config;
    let mut tasks: Vec<Box<dyn PreCloseTask>> = Vec::new();

    if claim_run(store, EarliestSweepKey::encode(), config.tombstone_sweep_interval, &LAST_GLOBAL_SWEEP)? {
        tasks.push(Box::new(TombstoneSweeper::new(Arc::clone(&store.engine), SweepMode::Delete)));
    }
    if claim_run(store, EarliestCompactionKey::encode(), config.compaction_interval, &LAST_GLOBAL_COMPACTION)? {
        tasks.push(Box::new(CompactionTask::new(Arc::clone(&store.engine))));
    }
    if tasks.is_empty() {
        return Ok(None);
    }

    let weak = store.weak();
    let metadata_source: MetadataSource = Box::new(move || {
        weak.upgrade()
            .ok_or_else(|| IdbError::InvalidState("backing store closed".into()))?
            .get_complete_metadata()
    });
    Ok(Some(PreCloseTaskQueue::new(tasks, config.pre_close_task_budget, metadata_source)))
}
