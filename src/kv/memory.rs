//! In-memory engine
//!
//! BTreeMap-based ordered map with RwLock for concurrency. Also serves as
//! the live state of `LogStore`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::Result;

use super::{Entry, KvStore, KvView, WriteBatch, WriteOp};

/// Ordered in-memory key-value map
#[derive(Debug, Default)]
pub struct MemStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    /// Approximate size in bytes (keys + values)
    size: AtomicUsize,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self) -> usize {
        self.data.read().len()
    }

    /// Apply a batch under a single write lock
    pub fn apply(&self, batch: &WriteBatch) {
        let mut data = self.data.write();
        for op in batch.ops() {
            match op {
                WriteOp::Put { key, value } => {
                    let added = key.len() + value.len();
                    if let Some(old) = data.insert(key.clone(), value.clone()) {
                        self.size.fetch_sub(key.len() + old.len(), Ordering::Relaxed);
                    }
                    self.size.fetch_add(added, Ordering::Relaxed);
                }
                WriteOp::Delete { key } => {
                    if let Some(old) = data.remove(key.as_slice()) {
                        self.size.fetch_sub(key.len() + old.len(), Ordering::Relaxed);
                    }
                }
                WriteOp::DeleteRange { start, end } => {
                    if start >= end {
                        continue;
                    }
                    let doomed: Vec<Vec<u8>> = data
                        .range::<[u8], _>((Bound::Included(start.as_slice()), Bound::Excluded(end.as_slice())))
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in doomed {
                        if let Some(old) = data.remove(&key) {
                            self.size.fetch_sub(key.len() + old.len(), Ordering::Relaxed);
                        }
                    }
                }
            }
        }
    }

    /// Snapshot of every entry in key order (for table writes)
    pub fn snapshot(&self) -> Vec<Entry> {
        self.data
            .read()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Replace the whole content (table load during recovery)
    pub fn load(&self, entries: Vec<Entry>) {
        let mut data = self.data.write();
        data.clear();
        let mut size = 0;
        for (key, value) in entries {
            size += key.len() + value.len();
            data.insert(key, value);
        }
        self.size.store(size, Ordering::Relaxed);
    }
}

impl KvView for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn next_entry(&self, from: Bound<&[u8]>) -> Result<Option<Entry>> {
        let data = self.data.read();
        Ok(data
            .range::<[u8], _>((from, Bound::Unbounded))
            .next()
            .map(|(key, value)| (key.clone(), value.clone())))
    }

    fn prev_entry(&self, before: Bound<&[u8]>) -> Result<Option<Entry>> {
        let data = self.data.read();
        Ok(data
            .range::<[u8], _>((Bound::Unbounded, before))
            .next_back()
            .map(|(key, value)| (key.clone(), value.clone())))
    }
}

impl KvStore for MemStore {
    fn write(&self, batch: WriteBatch, _sync: bool) -> Result<()> {
        self.apply(&batch);
        Ok(())
    }

    fn compact_range(&self, _start: &[u8], _end: &[u8]) -> Result<()> {
        Ok(())
    }

    fn approximate_size(&self) -> u64 {
        self.size.load(Ordering::Relaxed) as u64
    }
}
