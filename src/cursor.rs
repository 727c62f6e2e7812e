//! Cursors
//!
//! Ordered iteration over the records of an object store or the entries of
//! an index, inside one transaction.
//!
//! ## Bounds
//! A key range is turned into a pair of encoded keys once, at open. Every
//! later check is a byte comparison against them:
//! ```text
//!   object store  [lower]  (lower          [upper]  upper)
//!                 data key  data key, open  data key data key, open
//!
//!   index         [lower]        (lower          [upper]         upper)
//!                 user key prefix past user key  past user key,  user key prefix,
//!                                                open            open
//! ```
//!
//! ## Stale index entries
//! Index entries carry the version of the record they were written for. An
//! entry whose version no longer matches the record's exists entry is stale:
//! read-write transactions delete it on sight, read-only ones count it. A
//! cursor that skipped more than `CURSOR_TOMBSTONE_THRESHOLD` of them flags
//! its transaction so the store schedules a cleanup.

use std::sync::Weak;

use parking_lot::Mutex;

use crate::coding::keys::{IndexDataKey, ObjectStoreDataKey};
use crate::coding::{decode_var_int, IdbKey, KeyRange};
use crate::error::{IdbError, Result};
use crate::kv::{KvIterator, KvView, KvWrite};
use crate::record::{IdbValue, RecordIdentifier};
use crate::reporting::{report_read_error, ErrorLocation};
use crate::transaction::{TransactionCore, TransactionMode};

/// Stale index entries a single cursor may skip before its transaction
/// asks for a cleanup
pub const CURSOR_TOMBSTONE_THRESHOLD: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorDirection {
    #[default]
    Next,
    /// Forward, first entry of each distinct key only
    NextNoDuplicate,
    Prev,
    /// Backward, first entry of each distinct key only
    PrevNoDuplicate,
}

impl CursorDirection {
    pub fn is_forward(self) -> bool {
        matches!(self, CursorDirection::Next | CursorDirection::NextNoDuplicate)
    }

    pub fn is_unique(self) -> bool {
        matches!(self, CursorDirection::NextNoDuplicate | CursorDirection::PrevNoDuplicate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CursorKind {
    ObjectStoreKey,
    ObjectStore,
    IndexKey,
    Index,
}

impl CursorKind {
    fn is_index(self) -> bool {
        matches!(self, CursorKind::IndexKey | CursorKind::Index)
    }
}

fn corrupt(what: &'static str) -> IdbError {
    report_read_error(ErrorLocation::CursorLoadCurrentRow);
    IdbError::InternalInconsistency(what)
}

// =============================================================================
// Options
// =============================================================================

#[derive(Debug, Clone)]
pub(crate) struct CursorOptions {
    database_id: i64,
    object_store_id: i64,
    index_id: i64,
    low_key: Vec<u8>,
    low_open: bool,
    high_key: Vec<u8>,
    high_open: bool,
    direction: CursorDirection,
}

impl CursorOptions {
    pub(crate) fn for_object_store(
        database_id: i64,
        object_store_id: i64,
        range: &KeyRange,
        direction: CursorDirection,
    ) -> Self {
        let (low_key, low_open) = match &range.lower {
            Some(lower) => (ObjectStoreDataKey::encode(database_id, object_store_id, lower), range.lower_open),
            None => (ObjectStoreDataKey::encode_min_key(database_id, object_store_id), false),
        };
        let (high_key, high_open) = match &range.upper {
            Some(upper) => (ObjectStoreDataKey::encode(database_id, object_store_id, upper), range.upper_open),
            None => (ObjectStoreDataKey::encode_max_key(database_id, object_store_id), true),
        };
        Self { database_id, object_store_id, index_id: 0, low_key, low_open, high_key, high_open, direction }
    }

    pub(crate) fn for_index(
        database_id: i64,
        object_store_id: i64,
        index_id: i64,
        range: &KeyRange,
        direction: CursorDirection,
    ) -> Self {
        let prefix = |key: &IdbKey| {
            IndexDataKey::encode_user_key_prefix(database_id, object_store_id, index_id, &key.encode())
        };
        let past = |key: &IdbKey| {
            IndexDataKey::encode_past_user_key(database_id, object_store_id, index_id, &key.encode())
        };

        // Index keys are compared without their primary key part, so both
        // bounds land between whole groups of entries.
        let low_key = match &range.lower {
            Some(lower) if range.lower_open => past(lower),
            Some(lower) => prefix(lower),
            None => IndexDataKey::encode_min_key(database_id, object_store_id, index_id),
        };
        let high_key = match &range.upper {
            Some(upper) if range.upper_open => prefix(upper),
            Some(upper) => past(upper),
            None => IndexDataKey::encode_max_key(database_id, object_store_id, index_id),
        };
        Self {
            database_id,
            object_store_id,
            index_id,
            low_key,
            low_open: false,
            high_key,
            high_open: true,
            direction,
        }
    }

    fn above_low(&self, key: &[u8]) -> bool {
        if self.low_open {
            key > self.low_key.as_slice()
        } else {
            key >= self.low_key.as_slice()
        }
    }

    fn below_high(&self, key: &[u8]) -> bool {
        if self.high_open {
            key < self.high_key.as_slice()
        } else {
            key <= self.high_key.as_slice()
        }
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone)]
struct Row {
    key: IdbKey,
    primary_key: IdbKey,
    value: Option<IdbValue>,
    record_identifier: RecordIdentifier,
}

/// Position and current row of a cursor. Driven with the transaction core
/// so it works both for `Cursor` and for internal scans.
#[derive(Debug, Clone)]
pub(crate) struct CursorState {
    kind: CursorKind,
    options: CursorOptions,
    iterator: KvIterator,
    row: Option<Row>,
    tombstones_count: u32,
}

impl CursorState {
    /// Position on the first row in range, or `None` when there is none
    pub(crate) fn open(core: &mut TransactionCore, kind: CursorKind, options: CursorOptions) -> Result<Option<Self>> {
        let mut state = Self { kind, options, iterator: KvIterator::new(), row: None, tombstones_count: 0 };
        {
            let kv = core.kv()?;
            if state.options.direction.is_forward() {
                state.iterator.seek(kv, &state.options.low_key)?;
            } else {
                state.iterator.seek_before(kv, &state.options.high_key, !state.options.high_open)?;
            }
        }
        if state.find_row(core, false)? {
            Ok(Some(state))
        } else {
            // The caller never sees this state, so report its skips here.
            if state.tombstones_count > CURSOR_TOMBSTONE_THRESHOLD {
                core.tombstone_threshold_exceeded = true;
            }
            Ok(None)
        }
    }

    pub(crate) fn raw_key(&self) -> &[u8] {
        self.iterator.key()
    }

    pub(crate) fn tombstones_count(&self) -> u32 {
        self.tombstones_count
    }

    /// Step to the next row, or to the first row at or past `key` (and
    /// `primary_key` for index cursors) in the cursor's direction
    pub(crate) fn continue_(
        &mut self,
        core: &mut TransactionCore,
        key: Option<&IdbKey>,
        primary_key: Option<&IdbKey>,
    ) -> Result<bool> {
        if self.row.is_none() {
            return Ok(false);
        }
        match key {
            Some(key) => {
                self.seek_to(core, key, primary_key)?;
                self.find_row(core, false)
            }
            None => self.find_row(core, true),
        }
    }

    pub(crate) fn advance(&mut self, core: &mut TransactionCore, count: u32) -> Result<bool> {
        for _ in 0..count {
            if !self.continue_(core, None, None)? {
                return Ok(false);
            }
        }
        Ok(self.row.is_some())
    }

    fn step(&mut self, core: &TransactionCore) -> Result<()> {
        let kv = core.kv()?;
        if self.options.direction.is_forward() {
            self.iterator.next(kv)
        } else {
            self.iterator.prev(kv)
        }
    }

    fn seek_to(&mut self, core: &TransactionCore, key: &IdbKey, primary_key: Option<&IdbKey>) -> Result<()> {
        let kv = core.kv()?;
        let options = &self.options;
        let encoded_key = key.encode();
        let (target, inclusive) = if self.kind.is_index() {
            match primary_key {
                Some(primary_key) => (
                    IndexDataKey::encode(
                        options.database_id,
                        options.object_store_id,
                        options.index_id,
                        &encoded_key,
                        &primary_key.encode(),
                    ),
                    true,
                ),
                None if options.direction.is_forward() => (
                    IndexDataKey::encode_user_key_prefix(
                        options.database_id,
                        options.object_store_id,
                        options.index_id,
                        &encoded_key,
                    ),
                    true,
                ),
                None => (
                    IndexDataKey::encode_past_user_key(
                        options.database_id,
                        options.object_store_id,
                        options.index_id,
                        &encoded_key,
                    ),
                    false,
                ),
            }
        } else {
            (ObjectStoreDataKey::encode_encoded(options.database_id, options.object_store_id, &encoded_key), true)
        };

        // Never start outside the range.
        if options.direction.is_forward() {
            let target = if target < options.low_key { &options.low_key } else { &target };
            self.iterator.seek(kv, target)
        } else if target > options.high_key {
            self.iterator.seek_before(kv, &options.high_key, !options.high_open)
        } else {
            self.iterator.seek_before(kv, &target, inclusive)
        }
    }

    fn find_row(&mut self, core: &mut TransactionCore, mut step: bool) -> Result<bool> {
        let previous_key = self.row.take().map(|row| row.key);
        let forward = self.options.direction.is_forward();
        loop {
            if step {
                self.step(core)?;
            }
            step = true;

            if !self.iterator.is_valid() {
                return Ok(false);
            }
            let key = self.iterator.key();
            let (past_bounds, entered) = if forward {
                (!self.options.below_high(key), self.options.above_low(key))
            } else {
                (!self.options.above_low(key), self.options.below_high(key))
            };
            if past_bounds {
                return Ok(false);
            }
            if !entered {
                continue;
            }

            let Some(row) = self.load_current_row(core)? else {
                continue;
            };
            if self.options.direction.is_unique() && previous_key.as_ref() == Some(&row.key) {
                continue;
            }
            self.row = Some(row);
            if self.options.direction == CursorDirection::PrevNoDuplicate && self.kind.is_index() {
                self.rewind_to_first_duplicate(core)?;
            }
            return Ok(true);
        }
    }

    /// Reverse unique iteration reports the first entry of a key, so walk
    /// back over the rest of its group
    fn rewind_to_first_duplicate(&mut self, core: &mut TransactionCore) -> Result<()> {
        let Some(current) = self.row.as_ref().map(|row| row.key.encode()) else {
            return Ok(());
        };
        let group = IndexDataKey::encode_user_key_prefix(
            self.options.database_id,
            self.options.object_store_id,
            self.options.index_id,
            &current,
        );
        let mut probe = self.iterator.clone();
        loop {
            probe.prev(core.kv()?)?;
            if !probe.is_valid() || !probe.key().starts_with(&group) || !self.options.above_low(probe.key()) {
                return Ok(());
            }
            let last_good = std::mem::replace(&mut self.iterator, probe.clone());
            match self.load_current_row(core)? {
                Some(row) => self.row = Some(row),
                None => self.iterator = last_good,
            }
        }
    }

    /// The row under the iterator, or `None` for a stale index entry
    fn load_current_row(&mut self, core: &mut TransactionCore) -> Result<Option<Row>> {
        let raw_key = self.iterator.key().to_vec();
        let raw_value = self.iterator.value().to_vec();
        let mut value = raw_value.as_slice();

        if !self.kind.is_index() {
            let key = ObjectStoreDataKey::decode_user_key(&raw_key).ok_or_else(|| corrupt("record key failed to decode"))?;
            let version = decode_var_int(&mut value).ok_or_else(|| corrupt("record version failed to decode"))?;
            let value = match self.kind {
                CursorKind::ObjectStore => Some(IdbValue {
                    bits: value.to_vec(),
                    external_objects: core.get_external_objects_for_record(&raw_key)?,
                }),
                _ => None,
            };
            let record_identifier = RecordIdentifier::new(key.encode(), version);
            return Ok(Some(Row { primary_key: key.clone(), key, value, record_identifier }));
        }

        let index_key = IndexDataKey::decode(&raw_key).ok_or_else(|| corrupt("index key failed to decode"))?;
        let version = decode_var_int(&mut value).ok_or_else(|| corrupt("index entry version failed to decode"))?;
        let encoded_primary_key = value.to_vec();
        let primary_key =
            IdbKey::decode_exact(&encoded_primary_key).ok_or_else(|| corrupt("primary key failed to decode"))?;

        let object_store_id = self.options.object_store_id;
        if !core.version_exists(object_store_id, version, &encoded_primary_key)? {
            if core.mode == TransactionMode::ReadOnly {
                self.tombstones_count += 1;
            } else {
                core.kv_mut()?.remove(&raw_key)?;
            }
            return Ok(None);
        }

        let value = match self.kind {
            CursorKind::Index => {
                let data_key =
                    ObjectStoreDataKey::encode_encoded(self.options.database_id, object_store_id, &encoded_primary_key);
                let Some(record) = core.kv()?.get(&data_key)? else {
                    return Ok(None);
                };
                let mut input = record.as_slice();
                decode_var_int(&mut input).ok_or_else(|| corrupt("record version failed to decode"))?;
                Some(IdbValue {
                    bits: input.to_vec(),
                    external_objects: core.get_external_objects_for_record(&data_key)?,
                })
            }
            _ => None,
        };
        Ok(Some(Row {
            key: index_key.user_key,
            primary_key,
            value,
            record_identifier: RecordIdentifier::new(encoded_primary_key, version),
        }))
    }
}

// =============================================================================
// Cursor
// =============================================================================

/// An open cursor. Operations fail once its transaction has finished.
pub struct Cursor {
    core: Weak<Mutex<TransactionCore>>,
    state: CursorState,
}

impl Cursor {
    pub(crate) fn new(core: Weak<Mutex<TransactionCore>>, state: CursorState) -> Self {
        Self { core, state }
    }

    pub fn direction(&self) -> CursorDirection {
        self.state.options.direction
    }

    /// Index key for index cursors, primary key otherwise. `None` once the
    /// cursor ran off its range.
    pub fn key(&self) -> Option<&IdbKey> {
        self.state.row.as_ref().map(|row| &row.key)
    }

    pub fn primary_key(&self) -> Option<&IdbKey> {
        self.state.row.as_ref().map(|row| &row.primary_key)
    }

    /// The record; `None` for key-only cursors
    pub fn value(&self) -> Option<&IdbValue> {
        self.state.row.as_ref().and_then(|row| row.value.as_ref())
    }

    pub fn record_identifier(&self) -> Option<&RecordIdentifier> {
        self.state.row.as_ref().map(|row| &row.record_identifier)
    }

    fn with_core<R>(&mut self, f: impl FnOnce(&mut CursorState, &mut TransactionCore) -> Result<R>) -> Result<R> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| IdbError::InvalidState("cursor outlived its transaction".into()))?;
        let mut guard = core.lock();
        f(&mut self.state, &mut *guard)
    }

    pub fn continue_(&mut self) -> Result<bool> {
        self.with_core(|state, core| state.continue_(core, None, None))
    }

    /// Move to the first row at or beyond `key`, and `primary_key` within
    /// that key for index cursors
    pub fn continue_to(&mut self, key: &IdbKey, primary_key: Option<&IdbKey>) -> Result<bool> {
        if !key.is_valid() {
            return Err(IdbError::InvalidArgument("invalid key".into()));
        }
        self.with_core(|state, core| state.continue_(core, Some(key), primary_key))
    }

    pub fn advance(&mut self, count: u32) -> Result<bool> {
        if count == 0 {
            return Err(IdbError::InvalidArgument("advance by zero".into()));
        }
        self.with_core(|state, core| state.advance(core, count))
    }
}

impl Clone for Cursor {
    fn clone(&self) -> Self {
        let mut state = self.state.clone();
        state.tombstones_count = 0;
        Self { core: self.core.clone(), state }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.state.tombstones_count > CURSOR_TOMBSTONE_THRESHOLD {
            if let Some(core) = self.core.upgrade() {
                core.lock().tombstone_threshold_exceeded = true;
            }
            tracing::debug!(tombstones = self.state.tombstones_count, "cursor skipped many stale index entries");
        }
    }
}
