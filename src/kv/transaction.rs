//! Engine transactions
//!
//! `LevelDbTransaction` buffers writes in a sorted map and serves reads
//! from the merge of that map and the engine. `DirectTransaction` reads the
//! engine as-is and writes one batch on commit.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::error::{IdbError, Result};

use super::{borrow_bound, own_bound, Entry, KvStore, KvView, KvWrite, WriteBatch};

// =============================================================================
// Locks
// =============================================================================

/// Identifies one lockable resource (the database, or one object store)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionedLockId {
    pub partition: i32,
    pub key: Vec<u8>,
}

/// A lock granted by the lock manager. The store holds it for the lifetime
/// of the transaction and never looks inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionedLock {
    id: PartitionedLockId,
}

impl PartitionedLock {
    pub fn new(id: PartitionedLockId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &PartitionedLockId {
        &self.id
    }
}

// =============================================================================
// Buffered Transaction
// =============================================================================

/// How `remove_range` treats its end key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveRangeMode {
    /// Delete `[start, end)` key by key
    ExclusiveEnd,
    /// Delete `[start, end]` key by key
    InclusiveEnd,
    /// Hide `[start, end)` now; write one range delete and compact at commit
    DeferredWithCompaction,
}

/// Buffered transaction over a `KvStore`
pub struct LevelDbTransaction {
    store: Arc<dyn KvStore>,
    /// `None` marks a deletion
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// Half-open ranges removed in deferred mode
    deferred_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    locks: Vec<PartitionedLock>,
    finished: bool,
}

impl LevelDbTransaction {
    pub fn new(store: Arc<dyn KvStore>, locks: Vec<PartitionedLock>) -> Self {
        Self {
            store,
            pending: BTreeMap::new(),
            deferred_ranges: Vec::new(),
            locks,
            finished: false,
        }
    }

    pub fn locks(&self) -> &[PartitionedLock] {
        &self.locks
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.pending.is_empty() || !self.deferred_ranges.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn check_open(&self) -> Result<()> {
        if self.finished {
            return Err(IdbError::InvalidState("engine transaction already finished".into()));
        }
        Ok(())
    }

    fn deferred_range_containing(&self, key: &[u8]) -> Option<&(Vec<u8>, Vec<u8>)> {
        self.deferred_ranges
            .iter()
            .find(|(start, end)| start.as_slice() <= key && key < end.as_slice())
    }

    pub fn remove_range(&mut self, start: &[u8], end: &[u8], mode: RemoveRangeMode) -> Result<()> {
        self.check_open()?;
        match mode {
            RemoveRangeMode::DeferredWithCompaction => {
                if start < end {
                    let doomed: Vec<Vec<u8>> = self
                        .pending
                        .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in doomed {
                        self.pending.remove(&key);
                    }
                    self.deferred_ranges.push((start.to_vec(), end.to_vec()));
                }
            }
            RemoveRangeMode::ExclusiveEnd | RemoveRangeMode::InclusiveEnd => {
                let inclusive = mode == RemoveRangeMode::InclusiveEnd;
                let mut from = Bound::Included(start.to_vec());
                while let Some((key, _)) = self.next_entry(borrow_bound(&from))? {
                    let past_end = if inclusive { key.as_slice() > end } else { key.as_slice() >= end };
                    if past_end {
                        break;
                    }
                    self.pending.insert(key.clone(), None);
                    from = Bound::Excluded(key);
                }
            }
        }
        Ok(())
    }

    /// Write every buffered mutation in one atomic batch
    pub fn commit(&mut self, sync: bool) -> Result<()> {
        self.check_open()?;

        let mut batch = WriteBatch::new();
        for (start, end) in &self.deferred_ranges {
            batch.delete_range(start.clone(), end.clone());
        }
        for (key, value) in &self.pending {
            match value {
                Some(value) => batch.put(key.clone(), value.clone()),
                None => batch.delete(key.clone()),
            }
        }
        if !batch.is_empty() {
            self.store.write(batch, sync)?;
        }

        for (start, end) in &self.deferred_ranges {
            if let Err(err) = self.store.compact_range(start, end) {
                tracing::warn!(%err, "compaction after deferred range delete failed");
            }
        }

        self.finish();
        Ok(())
    }

    pub fn rollback(&mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        self.pending.clear();
        self.deferred_ranges.clear();
        self.locks.clear();
        self.finished = true;
    }
}

enum Candidate {
    Pending(Vec<u8>, Option<Vec<u8>>),
    Stored(Entry),
}

impl KvView for LevelDbTransaction {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.pending.get(key) {
            return Ok(value.clone());
        }
        if self.deferred_range_containing(key).is_some() {
            return Ok(None);
        }
        self.store.get(key)
    }

    fn next_entry(&self, from: Bound<&[u8]>) -> Result<Option<Entry>> {
        let mut from = own_bound(from);
        loop {
            let stored = self.store.next_entry(borrow_bound(&from))?;
            let pending = self.pending.range::<[u8], _>((borrow_bound(&from), Bound::Unbounded)).next();

            let candidate = match (stored, pending) {
                (None, None) => return Ok(None),
                (Some(stored), None) => Candidate::Stored(stored),
                (None, Some((key, value))) => Candidate::Pending(key.clone(), value.clone()),
                (Some(stored), Some((key, value))) => {
                    if key.as_slice() <= stored.0.as_slice() {
                        Candidate::Pending(key.clone(), value.clone())
                    } else {
                        Candidate::Stored(stored)
                    }
                }
            };

            match candidate {
                Candidate::Pending(key, Some(value)) => return Ok(Some((key, value))),
                Candidate::Pending(key, None) => from = Bound::Excluded(key),
                Candidate::Stored((key, value)) => match self.deferred_range_containing(&key) {
                    Some((_, end)) => from = Bound::Included(end.clone()),
                    None => return Ok(Some((key, value))),
                },
            }
        }
    }

    fn prev_entry(&self, before: Bound<&[u8]>) -> Result<Option<Entry>> {
        let mut before = own_bound(before);
        loop {
            let stored = self.store.prev_entry(borrow_bound(&before))?;
            let pending = self
                .pending
                .range::<[u8], _>((Bound::Unbounded, borrow_bound(&before)))
                .next_back();

            let candidate = match (stored, pending) {
                (None, None) => return Ok(None),
                (Some(stored), None) => Candidate::Stored(stored),
                (None, Some((key, value))) => Candidate::Pending(key.clone(), value.clone()),
                (Some(stored), Some((key, value))) => {
                    if key.as_slice() >= stored.0.as_slice() {
                        Candidate::Pending(key.clone(), value.clone())
                    } else {
                        Candidate::Stored(stored)
                    }
                }
            };

            match candidate {
                Candidate::Pending(key, Some(value)) => return Ok(Some((key, value))),
                Candidate::Pending(key, None) => before = Bound::Excluded(key),
                Candidate::Stored((key, value)) => match self.deferred_range_containing(&key) {
                    Some((start, _)) => before = Bound::Excluded(start.clone()),
                    None => return Ok(Some((key, value))),
                },
            }
        }
    }
}

impl KvWrite for LevelDbTransaction {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.check_open()?;
        self.pending.insert(key, Some(value));
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.pending.insert(key.to_vec(), None);
        Ok(())
    }
}

// =============================================================================
// Direct Transaction
// =============================================================================

/// Reads hit the engine directly; writes are batched until `commit`.
/// Used where no concurrent writer can exist (database creation, journals).
pub struct DirectTransaction {
    store: Arc<dyn KvStore>,
    batch: WriteBatch,
}

impl DirectTransaction {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store, batch: WriteBatch::new() }
    }

    /// Write the batch with sync
    pub fn commit(self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.store.write(self.batch, true)
    }
}

impl KvView for DirectTransaction {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.store.get(key)
    }

    fn next_entry(&self, from: Bound<&[u8]>) -> Result<Option<Entry>> {
        self.store.next_entry(from)
    }

    fn prev_entry(&self, before: Bound<&[u8]>) -> Result<Option<Entry>> {
        self.store.prev_entry(before)
    }
}

impl KvWrite for DirectTransaction {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.batch.put(key, value);
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> Result<()> {
        self.batch.delete(key.to_vec());
        Ok(())
    }
}
