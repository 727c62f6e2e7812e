//! Ordered Key-Value Engine
//!
//! The backing store sits on top of an ordered, crash-consistent byte-string
//! map. This module defines that seam and ships two small engines so the
//! store is usable without an external one.
//!
//! ## Responsibilities
//! - `KvStore`: point reads, ordered neighbour lookups, atomic batch writes
//! - `KvFactory`: opens and destroys engines; injected into `BackingStore`
//! - `LevelDbTransaction`: buffered writes with read-your-writes iteration
//! - `DirectTransaction`: unbuffered reads, one batched write on commit
//! - `KvIterator`: a cursor position over any `KvView`
//!
//! ## Layering
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │   LevelDbTransaction / DirectTransaction      │
//! │        (pending writes, range deletes)        │
//! └──────────────────────┬────────────────────────┘
//!                        │ WriteBatch (atomic)
//! ┌──────────────────────▼────────────────────────┐
//! │                  KvStore                      │
//! │   MemStore (BTreeMap)  │  LogStore (log+table)│
//! └───────────────────────────────────────────────┘
//! ```

mod iterator;
mod log;
mod memory;
mod transaction;
mod typed;

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use iterator::KvIterator;
pub use log::LogStore;
pub use memory::MemStore;
pub use transaction::{
    DirectTransaction, LevelDbTransaction, PartitionedLock, PartitionedLockId, RemoveRangeMode,
};
pub use typed::{
    get_bool, get_int, get_string, get_var_int, put_bool, put_int, put_string, put_var_int,
};

/// A key and its value
pub type Entry = (Vec<u8>, Vec<u8>);

// =============================================================================
// Traits
// =============================================================================

/// Ordered read access
pub trait KvView {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// First entry at or after `from` (`Included`), strictly after it
    /// (`Excluded`), or the first entry overall (`Unbounded`).
    fn next_entry(&self, from: Bound<&[u8]>) -> Result<Option<Entry>>;

    /// Last entry at or before `before` (`Included`), strictly before it
    /// (`Excluded`), or the last entry overall (`Unbounded`).
    fn prev_entry(&self, before: Bound<&[u8]>) -> Result<Option<Entry>>;
}

/// Buffered mutation
pub trait KvWrite {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()>;
    fn remove(&mut self, key: &[u8]) -> Result<()>;
}

/// An ordered, crash-consistent key-value engine
pub trait KvStore: KvView + Send + Sync {
    /// Apply every operation of `batch` atomically
    fn write(&self, batch: WriteBatch, sync: bool) -> Result<()>;

    /// Reclaim space held by deleted entries in `[start, end)`
    fn compact_range(&self, start: &[u8], end: &[u8]) -> Result<()>;

    /// Approximate bytes of live data
    fn approximate_size(&self) -> u64;
}

/// Opens engines. Tests substitute fault-injecting factories.
pub trait KvFactory: Send + Sync {
    /// Open the engine at `path`, or an in-memory one when `path` is `None`
    fn open(&self, path: Option<&Path>, options: &KvOptions) -> Result<Arc<dyn KvStore>>;

    /// Remove every file of the engine at `path`
    fn destroy(&self, path: &Path) -> Result<()>;
}

// =============================================================================
// Write Batch
// =============================================================================

/// One mutation inside a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    /// Removes `[start, end)`
    DeleteRange { start: Vec<u8>, end: Vec<u8> },
}

/// Ordered list of mutations applied atomically
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put { key, value });
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete { key });
    }

    pub fn delete_range(&mut self, start: Vec<u8>, end: Vec<u8>) {
        self.ops.push(WriteOp::DeleteRange { start, end });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Fixed engine tuning handed over at open
#[derive(Debug, Clone)]
pub struct KvOptions {
    pub create_if_missing: bool,
    pub paranoid_checks: bool,
    pub max_open_files: usize,
    pub write_buffer_size: usize,
}

impl Default for KvOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            paranoid_checks: true,
            max_open_files: 80,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Opens `LogStore` for a path and `MemStore` otherwise
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKvFactory;

impl KvFactory for DefaultKvFactory {
    fn open(&self, path: Option<&Path>, options: &KvOptions) -> Result<Arc<dyn KvStore>> {
        match path {
            Some(path) => Ok(Arc::new(LogStore::open(path, options)?)),
            None => Ok(Arc::new(MemStore::new())),
        }
    }

    fn destroy(&self, path: &Path) -> Result<()> {
        LogStore::destroy(path)
    }
}

// =============================================================================
// Bound helpers
// =============================================================================

pub(crate) fn borrow_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(key) => Bound::Included(key.as_slice()),
        Bound::Excluded(key) => Bound::Excluded(key.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

pub(crate) fn own_bound(bound: Bound<&[u8]>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(key) => Bound::Included(key.to_vec()),
        Bound::Excluded(key) => Bound::Excluded(key.to_vec()),
        Bound::Unbounded => Bound::Unbounded,
    }
}
