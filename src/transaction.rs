//! Transactions
//!
//! A transaction buffers record, index and schema writes in an engine
//! transaction and commits them in two phases so blob files are on disk
//! before any record refers to them.
//!
//! ## States
//! ```text
//!  Created ──begin──► Begun ──commit_phase_one──► CommittingPhaseOne
//!                       │                              │
//!                       │                  (blob writes complete)
//!                       │                              │
//!                       │                      commit_phase_two
//!                       │                              ▼
//!                       │                      CommittingPhaseTwo ──► Committed
//!                       ▼                              │
//!                   RolledBack ◄──rollback─────────────┘ (on failure)
//! ```
//!
//! ## Commit
//! Phase one assigns blob numbers, journals them in the recovery journal,
//! collects blob files replaced or deleted by this transaction and starts
//! the blob writes. Phase two writes blob entries, moves the written blobs
//! out of the recovery journal, journals the removed ones (active journal
//! while a reader holds them) and commits everything atomically. A crash at
//! any point leaves at most orphan files that the recovery journal names.

use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, TryRecvError};
use parking_lot::{Mutex, RwLock};

use crate::active_blobs::BlobActivation;
use crate::backing_store::StoreInner;
use crate::blob::WriteBlobToFileResult;
use crate::coding::external::{decode_external_objects, encode_external_objects};
use crate::coding::keys::{
    ActiveBlobJournalKey, BlobEntryKey, DatabaseMetaDataKey, ExistsEntryKey, IndexDataKey,
    IndexFreeListKey, IndexMetaDataKey, KeyPrefix, ObjectStoreDataKey, ObjectStoreMetaDataKey,
    ObjectStoreNamesKey, RecoveryBlobJournalKey,
};
use crate::coding::{decode_int, decode_var_int, encode_int, encode_var_int, IdbKey, KeyPath, KeyRange};
use crate::cursor::{Cursor, CursorDirection, CursorKind, CursorOptions, CursorState};
use crate::error::{IdbError, Result};
use crate::external_object::{ExternalObject, ExternalObjectKind};
use crate::journal::{append_blobs_to_journal, get_blob_journal, update_blob_journal, BlobJournalEntry};
use crate::kv::{
    get_string, get_var_int, put_bool, put_int, put_string, put_var_int, DirectTransaction,
    KvIterator, KvView, KvWrite, LevelDbTransaction, PartitionedLock, RemoveRangeMode,
};
use crate::metadata::{
    get_new_version_number, set_max_index_id, set_max_object_store_id, DatabaseMetadata,
    IndexMetadata, ObjectStoreMetadata, KEY_GENERATOR_INITIAL_NUMBER, KEY_GENERATOR_MAX_NUMBER,
};
use crate::record::{IdbValue, RecordIdentifier};
use crate::reporting::{report_consistency_error, report_read_error, report_write_error, ErrorLocation};

// =============================================================================
// Public enums
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    VersionChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Same as `Strict`
    #[default]
    Default,
    Strict,
    Relaxed,
}

impl Durability {
    fn sync_on_commit(self) -> bool {
        !matches!(self, Durability::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Created,
    Begun,
    CommittingPhaseOne,
    CommittingPhaseTwo,
    Committed,
    RolledBack,
}

/// What the caller does after phase one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobWriteResult {
    /// Nothing was written; run phase two now
    RunPhaseTwoAndReturnResult,
    /// Blob writes were started; wait for them, then run phase two
    RunPhaseTwoAsync,
}

// =============================================================================
// Shared core
// =============================================================================

fn inconsistent(location: ErrorLocation, what: &'static str) -> IdbError {
    report_consistency_error(location);
    IdbError::InternalInconsistency(what)
}

fn undecodable(location: ErrorLocation, what: &'static str) -> IdbError {
    report_read_error(location);
    IdbError::InternalInconsistency(what)
}

/// Moves a data key of `(db, os, 1)` to the same user key under another
/// per-record index id
fn rebase_data_key(data_key: &[u8], index_id: i64) -> Option<Vec<u8>> {
    let mut input = data_key;
    let prefix = KeyPrefix::decode(&mut input)?;
    if prefix.index_id != KeyPrefix::OBJECT_STORE_DATA_INDEX_ID {
        return None;
    }
    let mut out = KeyPrefix::new(prefix.database_id, prefix.object_store_id, index_id).encode();
    out.extend_from_slice(input);
    Some(out)
}

/// Engine transaction and blob bookkeeping, shared with open cursors
pub(crate) struct TransactionCore {
    pub(crate) store: Weak<StoreInner>,
    pub(crate) database_id: i64,
    pub(crate) mode: TransactionMode,
    in_memory: bool,
    kv: Option<LevelDbTransaction>,
    /// Object store data key -> objects the record will carry after commit.
    /// Empty means "had blobs, now has none".
    external_object_change_map: BTreeMap<Vec<u8>, Vec<ExternalObject>>,
    /// Snapshot of the store's in-memory blobs taken at begin
    in_memory_external_objects: BTreeMap<Vec<u8>, Vec<ExternalObject>>,
    pub(crate) tombstone_threshold_exceeded: bool,
}

impl TransactionCore {
    pub(crate) fn kv(&self) -> Result<&LevelDbTransaction> {
        match &self.kv {
            Some(kv) if !kv.is_finished() => Ok(kv),
            _ => Err(IdbError::InvalidState("transaction is not active".into())),
        }
    }

    pub(crate) fn kv_mut(&mut self) -> Result<&mut LevelDbTransaction> {
        match &mut self.kv {
            Some(kv) if !kv.is_finished() => Ok(kv),
            _ => Err(IdbError::InvalidState("transaction is not active".into())),
        }
    }

    fn check_ids(&self, object_store_id: i64) -> Result<()> {
        if !KeyPrefix::valid_ids(self.database_id, object_store_id) {
            return Err(IdbError::InvalidArgument(format!("invalid object store id {}", object_store_id)));
        }
        Ok(())
    }

    fn check_index_ids(&self, object_store_id: i64, index_id: i64) -> Result<()> {
        if !KeyPrefix::valid_index_ids(self.database_id, object_store_id, index_id) {
            return Err(IdbError::InvalidArgument(format!(
                "invalid index id {} of object store {}",
                index_id, object_store_id
            )));
        }
        Ok(())
    }

    fn check_key(key: &IdbKey) -> Result<()> {
        if !key.is_valid() {
            return Err(IdbError::InvalidArgument("invalid key".into()));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // External objects
    // -------------------------------------------------------------------------

    /// Objects of the record at `object_store_data_key`, as this transaction
    /// sees them
    pub(crate) fn get_external_objects_for_record(&self, object_store_data_key: &[u8]) -> Result<Vec<ExternalObject>> {
        let location = ErrorLocation::GetExternalObjectsForRecord;
        if let Some(objects) = self.external_object_change_map.get(object_store_data_key) {
            return Ok(objects.clone());
        }
        if self.in_memory {
            return Ok(self
                .in_memory_external_objects
                .get(object_store_data_key)
                .cloned()
                .unwrap_or_default());
        }

        let blob_entry_key = BlobEntryKey::from_object_store_data_key(object_store_data_key)
            .ok_or_else(|| inconsistent(location, "record key is not an object store data key"))?
            .encode();
        let Some(value) = self.kv()?.get(&blob_entry_key)? else {
            return Ok(Vec::new());
        };
        let mut objects = decode_external_objects(&value)
            .ok_or_else(|| undecodable(location, "blob entry failed to decode"))?;

        let store = self.store.upgrade();
        for object in objects.iter_mut().filter(|object| object.has_blob_file()) {
            let blob_number = object.blob_number();
            if let Some(path) = store.as_ref().and_then(|store| store.blob_file_name(self.database_id, blob_number)) {
                object.set_indexed_db_file_path(path);
            }
            object.set_activation(BlobActivation::new(self.store.clone(), self.database_id, blob_number));
        }
        Ok(objects)
    }

    fn put_external_objects_if_needed(&mut self, object_store_data_key: &[u8], objects: Vec<ExternalObject>) -> Result<()> {
        if objects.is_empty() {
            self.external_object_change_map.remove(object_store_data_key);
            let had_objects = if self.in_memory {
                self.in_memory_external_objects.contains_key(object_store_data_key)
            } else {
                let blob_entry_key = BlobEntryKey::from_object_store_data_key(object_store_data_key)
                    .ok_or_else(|| inconsistent(ErrorLocation::PutRecord, "record key is not an object store data key"))?
                    .encode();
                self.kv()?.get(&blob_entry_key)?.is_some()
            };
            if !had_objects {
                return Ok(());
            }
        }
        self.external_object_change_map.insert(object_store_data_key.to_vec(), objects);
        Ok(())
    }

    /// Record that every record in the data key range loses its objects
    fn remove_external_objects_between(&mut self, data_start: &[u8], data_end: &[u8], end_inclusive: bool) -> Result<()> {
        let end_bound = if end_inclusive { Bound::Included(data_end) } else { Bound::Excluded(data_end) };
        let range = (Bound::Included(data_start), end_bound);

        let mut doomed: Vec<Vec<u8>> = self
            .external_object_change_map
            .range::<[u8], _>(range)
            .map(|(key, _)| key.clone())
            .collect();

        if self.in_memory {
            doomed.extend(
                self.in_memory_external_objects
                    .range::<[u8], _>(range)
                    .map(|(key, _)| key.clone()),
            );
        } else {
            let location = ErrorLocation::DeleteRange;
            let blob_start = rebase_data_key(data_start, KeyPrefix::BLOB_ENTRY_INDEX_ID)
                .ok_or_else(|| inconsistent(location, "range start is not a data key"))?;
            let blob_end = rebase_data_key(data_end, KeyPrefix::BLOB_ENTRY_INDEX_ID)
                .ok_or_else(|| inconsistent(location, "range end is not a data key"))?;

            let kv = self.kv()?;
            let mut it = KvIterator::new();
            it.seek(kv, &blob_start)?;
            while it.is_valid() {
                let in_range = if end_inclusive { it.key() <= blob_end.as_slice() } else { it.key() < blob_end.as_slice() };
                if !in_range {
                    break;
                }
                let data_key = BlobEntryKey::reencode_to_object_store_data_key(it.key())
                    .ok_or_else(|| undecodable(location, "blob entry key failed to decode"))?;
                doomed.push(data_key);
                it.next(kv)?;
            }
        }

        for key in doomed {
            self.external_object_change_map.insert(key, Vec::new());
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    fn get_record(&self, object_store_id: i64, key: &IdbKey) -> Result<Option<IdbValue>> {
        let location = ErrorLocation::GetRecord;
        self.check_ids(object_store_id)?;
        Self::check_key(key)?;

        let data_key = ObjectStoreDataKey::encode(self.database_id, object_store_id, key);
        let Some(data) = self.kv()?.get(&data_key)? else {
            return Ok(None);
        };
        let mut input = data.as_slice();
        decode_var_int(&mut input).ok_or_else(|| undecodable(location, "record version failed to decode"))?;
        let bits = input.to_vec();
        let external_objects = self.get_external_objects_for_record(&data_key)?;
        Ok(Some(IdbValue { bits, external_objects }))
    }

    fn put_record(&mut self, object_store_id: i64, key: &IdbKey, value: IdbValue) -> Result<RecordIdentifier> {
        self.check_ids(object_store_id)?;
        Self::check_key(key)?;

        let database_id = self.database_id;
        let version = get_new_version_number(self.kv_mut()?, database_id, object_store_id)
            .inspect_err(|_| report_write_error(ErrorLocation::GetNewVersionNumber))?;
        let encoded_key = key.encode();
        let data_key = ObjectStoreDataKey::encode_encoded(database_id, object_store_id, &encoded_key);

        let mut record = Vec::with_capacity(value.bits.len() + 9);
        encode_var_int(version, &mut record);
        record.extend_from_slice(&value.bits);
        self.kv_mut()?.put(data_key.clone(), record)?;

        self.put_external_objects_if_needed(&data_key, value.external_objects)?;

        let exists_key = ExistsEntryKey::encode_encoded(database_id, object_store_id, &encoded_key);
        self.kv_mut()?.put(exists_key, encode_int(version))?;
        Ok(RecordIdentifier::new(encoded_key, version))
    }

    pub(crate) fn clear_object_store(&mut self, object_store_id: i64) -> Result<()> {
        self.check_ids(object_store_id)?;
        let database_id = self.database_id;

        self.remove_external_objects_between(
            &ObjectStoreDataKey::encode_min_key(database_id, object_store_id),
            &ObjectStoreDataKey::encode_max_key(database_id, object_store_id),
            false,
        )?;

        // Blob entries stay until phase one has read which files they name.
        let kv = self.kv_mut()?;
        kv.remove_range(
            &KeyPrefix::object_store(database_id, object_store_id).encode(),
            &BlobEntryKey::encode_min_key_for_object_store(database_id, object_store_id),
            RemoveRangeMode::ExclusiveEnd,
        )?;
        kv.remove_range(
            &BlobEntryKey::encode_stop_key_for_object_store(database_id, object_store_id),
            &KeyPrefix::object_store(database_id, object_store_id + 1).encode(),
            RemoveRangeMode::ExclusiveEnd,
        )
        .inspect_err(|_| report_write_error(ErrorLocation::ClearObjectStore))
    }

    fn delete_range(&mut self, object_store_id: i64, range: &KeyRange) -> Result<()> {
        let location = ErrorLocation::DeleteRange;
        self.check_ids(object_store_id)?;
        let database_id = self.database_id;

        let forward = CursorOptions::for_object_store(database_id, object_store_id, range, CursorDirection::Next);
        let Some(first) = CursorState::open(self, CursorKind::ObjectStoreKey, forward)? else {
            return Ok(());
        };
        let reverse = CursorOptions::for_object_store(database_id, object_store_id, range, CursorDirection::Prev);
        let Some(last) = CursorState::open(self, CursorKind::ObjectStoreKey, reverse)? else {
            return Ok(());
        };
        let start_key = first.raw_key().to_vec();
        let end_key = last.raw_key().to_vec();

        self.remove_external_objects_between(&start_key, &end_key, true)?;

        let exists_start = rebase_data_key(&start_key, KeyPrefix::EXISTS_ENTRY_INDEX_ID)
            .ok_or_else(|| inconsistent(location, "range start is not a data key"))?;
        let exists_end = rebase_data_key(&end_key, KeyPrefix::EXISTS_ENTRY_INDEX_ID)
            .ok_or_else(|| inconsistent(location, "range end is not a data key"))?;

        let kv = self.kv_mut()?;
        kv.remove_range(&start_key, &end_key, RemoveRangeMode::InclusiveEnd)?;
        kv.remove_range(&exists_start, &exists_end, RemoveRangeMode::InclusiveEnd)
            .inspect_err(|_| report_write_error(location))
    }

    fn get_key_generator_current_number(&self, object_store_id: i64) -> Result<i64> {
        let location = ErrorLocation::GetKeyGeneratorCurrentNumber;
        self.check_ids(object_store_id)?;
        let kv = self.kv()?;

        let key = ObjectStoreMetaDataKey::encode(
            self.database_id,
            object_store_id,
            ObjectStoreMetaDataKey::KEY_GENERATOR_CURRENT_NUMBER,
        );
        if let Some(bytes) = kv.get(&key)? {
            return decode_int(&bytes).ok_or_else(|| undecodable(location, "key generator state failed to decode"));
        }

        // Older stores never persisted the generator; derive it from the
        // largest numeric key. Numbers sort first.
        let start = ObjectStoreDataKey::encode_min_key(self.database_id, object_store_id);
        let stop = ObjectStoreDataKey::encode_max_key(self.database_id, object_store_id);
        let mut max_numeric_key = 0.0_f64;
        let mut it = KvIterator::new();
        it.seek(kv, &start)?;
        while it.is_valid() && it.key() < stop.as_slice() {
            let user_key = ObjectStoreDataKey::decode_user_key(it.key())
                .ok_or_else(|| undecodable(location, "record key failed to decode"))?;
            match user_key.as_number() {
                Some(number) => max_numeric_key = max_numeric_key.max(number),
                None => break,
            }
            it.next(kv)?;
        }
        // Past the largest generated number the generator reads as exhausted.
        Ok(max_numeric_key.min(KEY_GENERATOR_MAX_NUMBER as f64) as i64 + 1)
    }

    fn maybe_update_key_generator_current_number(
        &mut self,
        object_store_id: i64,
        new_number: i64,
        check_current: bool,
    ) -> Result<()> {
        self.check_ids(object_store_id)?;
        if check_current && new_number <= self.get_key_generator_current_number(object_store_id)? {
            return Ok(());
        }
        let key = ObjectStoreMetaDataKey::encode(
            self.database_id,
            object_store_id,
            ObjectStoreMetaDataKey::KEY_GENERATOR_CURRENT_NUMBER,
        );
        put_int(self.kv_mut()?, key, new_number)
    }

    fn key_exists_in_object_store(&self, object_store_id: i64, key: &IdbKey) -> Result<Option<RecordIdentifier>> {
        let location = ErrorLocation::KeyExistsInObjectStore;
        self.check_ids(object_store_id)?;
        Self::check_key(key)?;

        let encoded_key = key.encode();
        let data_key = ObjectStoreDataKey::encode_encoded(self.database_id, object_store_id, &encoded_key);
        let Some(data) = self.kv()?.get(&data_key)? else {
            return Ok(None);
        };
        let mut input = data.as_slice();
        let version = decode_var_int(&mut input)
            .ok_or_else(|| undecodable(location, "record version failed to decode"))?;
        Ok(Some(RecordIdentifier::new(encoded_key, version)))
    }

    /// True when the exists entry of the primary key carries `version`
    pub(crate) fn version_exists(&self, object_store_id: i64, version: i64, encoded_primary_key: &[u8]) -> Result<bool> {
        let key = ExistsEntryKey::encode_encoded(self.database_id, object_store_id, encoded_primary_key);
        let Some(data) = self.kv()?.get(&key)? else {
            return Ok(false);
        };
        let stored = decode_int(&data)
            .ok_or_else(|| undecodable(ErrorLocation::VersionExists, "exists entry failed to decode"))?;
        Ok(stored == version)
    }

    fn put_index_data_for_record(
        &mut self,
        object_store_id: i64,
        index_id: i64,
        key: &IdbKey,
        record_identifier: &RecordIdentifier,
    ) -> Result<()> {
        self.check_index_ids(object_store_id, index_id)?;
        Self::check_key(key)?;

        let index_data_key = IndexDataKey::encode(
            self.database_id,
            object_store_id,
            index_id,
            &key.encode(),
            &record_identifier.primary_key,
        );
        let mut value = Vec::with_capacity(record_identifier.primary_key.len() + 9);
        encode_var_int(record_identifier.version, &mut value);
        value.extend_from_slice(&record_identifier.primary_key);
        self.kv_mut()?.put(index_data_key, value)
    }

    /// Encoded primary key of the first live entry for `key`. Stale entries
    /// found on the way are deleted.
    fn find_key_in_index(&mut self, object_store_id: i64, index_id: i64, key: &IdbKey) -> Result<Option<Vec<u8>>> {
        let location = ErrorLocation::FindKeyInIndex;
        self.check_index_ids(object_store_id, index_id)?;
        Self::check_key(key)?;

        let prefix = IndexDataKey::encode_user_key_prefix(self.database_id, object_store_id, index_id, &key.encode());
        let mut it = KvIterator::new();
        it.seek(self.kv()?, &prefix)?;
        loop {
            if !it.is_valid() || !it.key().starts_with(&prefix) {
                return Ok(None);
            }
            let mut value = it.value();
            let version = decode_var_int(&mut value)
                .ok_or_else(|| undecodable(location, "index entry version failed to decode"))?;
            let encoded_primary_key = value.to_vec();
            if self.version_exists(object_store_id, version, &encoded_primary_key)? {
                return Ok(Some(encoded_primary_key));
            }

            let stale = it.key().to_vec();
            self.kv_mut()?.remove(&stale)?;
            it.next(self.kv()?)?;
        }
    }

    fn get_first_primary_key_for_index_key(
        &mut self,
        object_store_id: i64,
        index_id: i64,
        key: &IdbKey,
    ) -> Result<Option<IdbKey>> {
        let Some(encoded) = self.find_key_in_index(object_store_id, index_id, key)? else {
            return Ok(None);
        };
        IdbKey::decode_exact(&encoded)
            .map(Some)
            .ok_or_else(|| undecodable(ErrorLocation::FindKeyInIndex, "primary key failed to decode"))
    }

    fn count(&mut self, kind: CursorKind, options: CursorOptions) -> Result<u32> {
        let Some(mut cursor) = CursorState::open(self, kind, options)? else {
            return Ok(0);
        };
        let mut count = 1;
        while cursor.continue_(self, None, None)? {
            count += 1;
        }
        if cursor.tombstones_count() > crate::cursor::CURSOR_TOMBSTONE_THRESHOLD {
            self.tombstone_threshold_exceeded = true;
        }
        Ok(count)
    }
}

// =============================================================================
// Transaction
// =============================================================================

enum BlobWriteEvent {
    Written(WriteBlobToFileResult),
    HandleSerialized { object_store_data_key: Vec<u8>, index: usize, token: Vec<u8> },
}

struct PendingBlobWrites {
    events: Receiver<BlobWriteEvent>,
    calls_left: usize,
}

enum BlobJob {
    Write { payload: Bytes, path: PathBuf, last_modified: Option<SystemTime> },
    Serialize { object_store_data_key: Vec<u8>, index: usize, token: Bytes },
}

/// Brackets phase one through phase two in the store's commit count
struct CommitGuard {
    store: Weak<StoreInner>,
}

impl CommitGuard {
    fn new(store: &Arc<StoreInner>) -> Self {
        store.will_commit_transaction();
        Self { store: Arc::downgrade(store) }
    }
}

impl Drop for CommitGuard {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.did_commit_transaction();
        }
    }
}

/// One transaction against a database
pub struct Transaction {
    core: Arc<Mutex<TransactionCore>>,
    store: Weak<StoreInner>,
    database: Weak<RwLock<DatabaseMetadata>>,
    database_id: i64,
    durability: Durability,
    mode: TransactionMode,
    state: TransactionState,
    /// Metadata as it was at begin, restored on rollback (version change only)
    metadata_before_transaction: Option<DatabaseMetadata>,
    blobs_to_write: Vec<BlobJournalEntry>,
    blobs_to_remove: Vec<BlobJournalEntry>,
    pending_blob_writes: Option<PendingBlobWrites>,
    blob_write_failed: bool,
    commit_guard: Option<CommitGuard>,
    registered_with_store: bool,
}

impl Transaction {
    pub(crate) fn new(
        store: Weak<StoreInner>,
        database: Weak<RwLock<DatabaseMetadata>>,
        database_id: i64,
        durability: Durability,
        mode: TransactionMode,
    ) -> Self {
        let in_memory = store.upgrade().map(|store| store.is_in_memory()).unwrap_or(true);
        let core = TransactionCore {
            store: store.clone(),
            database_id,
            mode,
            in_memory,
            kv: None,
            external_object_change_map: BTreeMap::new(),
            in_memory_external_objects: BTreeMap::new(),
            tombstone_threshold_exceeded: false,
        };
        Self {
            core: Arc::new(Mutex::new(core)),
            store,
            database,
            database_id,
            durability,
            mode,
            state: TransactionState::Created,
            metadata_before_transaction: None,
            blobs_to_write: Vec::new(),
            blobs_to_remove: Vec::new(),
            pending_blob_writes: None,
            blob_write_failed: false,
            commit_guard: None,
            registered_with_store: false,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    pub fn database_id(&self) -> i64 {
        self.database_id
    }

    /// Set once a cursor of this transaction skipped too many stale entries
    pub fn tombstone_threshold_exceeded(&self) -> bool {
        self.core.lock().tombstone_threshold_exceeded
    }

    pub fn has_pending_blob_writes(&self) -> bool {
        self.pending_blob_writes.is_some()
    }

    fn store(&self) -> Result<Arc<StoreInner>> {
        self.store
            .upgrade()
            .ok_or_else(|| IdbError::InvalidState("backing store closed".into()))
    }

    fn database(&self) -> Result<Arc<RwLock<DatabaseMetadata>>> {
        self.database
            .upgrade()
            .ok_or_else(|| IdbError::InvalidState("database handle dropped".into()))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TransactionState::Begun {
            return Err(IdbError::InvalidState(format!("transaction is {:?}", self.state)));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        if self.mode == TransactionMode::ReadOnly {
            return Err(IdbError::InvalidState("read-only transaction".into()));
        }
        Ok(())
    }

    fn ensure_version_change(&self) -> Result<()> {
        self.ensure_active()?;
        if self.mode != TransactionMode::VersionChange {
            return Err(IdbError::InvalidState("schema changes need a version change transaction".into()));
        }
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start buffering. `locks` are held until the transaction finishes.
    pub fn begin(&mut self, locks: Vec<PartitionedLock>) -> Result<()> {
        if self.state != TransactionState::Created {
            return Err(IdbError::InvalidState(format!("cannot begin a {:?} transaction", self.state)));
        }
        let store = self.store()?;
        {
            let mut core = self.core.lock();
            core.kv = Some(LevelDbTransaction::new(Arc::clone(&store.engine), locks));
            if store.is_in_memory() {
                core.in_memory_external_objects = store.in_memory_external_objects.lock().clone();
            }
        }
        if self.mode == TransactionMode::VersionChange {
            self.metadata_before_transaction = Some(self.database()?.read().clone());
        }
        store.on_transaction_start();
        self.registered_with_store = true;
        self.state = TransactionState::Begun;
        Ok(())
    }

    /// Phase one: journal and start writing new blobs.
    ///
    /// On error the caller must roll back.
    pub fn commit_phase_one(&mut self) -> Result<BlobWriteResult> {
        self.ensure_active()?;
        let store = self.store()?;
        let core_arc = Arc::clone(&self.core);
        let mut core = core_arc.lock();

        if !core.external_object_change_map.is_empty() && !store.is_in_memory() {
            self.handle_blob_pre_transaction(&store, &mut core)
                .inspect_err(|_| report_write_error(ErrorLocation::HandleBlobPreTransaction))?;
            self.collect_blob_files_to_remove(&mut core)?;
        }

        self.commit_guard = Some(CommitGuard::new(&store));
        self.state = TransactionState::CommittingPhaseOne;
        self.write_new_blobs(&store, &core)
    }

    fn handle_blob_pre_transaction(&mut self, store: &StoreInner, core: &mut TransactionCore) -> Result<()> {
        let location = ErrorLocation::HandleBlobPreTransaction;
        let database_id = self.database_id;
        let mut direct = DirectTransaction::new(Arc::clone(&store.engine));

        let generator_key =
            DatabaseMetaDataKey::encode(database_id, DatabaseMetaDataKey::BLOB_KEY_GENERATOR_CURRENT_NUMBER);
        let mut next_blob_number = get_var_int(&direct, &generator_key)?
            .ok_or_else(|| inconsistent(location, "database without a blob number generator"))?;
        if next_blob_number < 0 {
            return Err(inconsistent(location, "negative blob number generator"));
        }

        // Older stores could hand out a number without persisting the
        // generator, so a file may already sit at the next number.
        while store
            .blob_file_name(database_id, next_blob_number)
            .is_some_and(|path| path.exists())
        {
            next_blob_number += 1;
        }

        let mut new_blobs = Vec::new();
        for objects in core.external_object_change_map.values_mut() {
            for object in objects.iter_mut().filter(|object| object.has_blob_file()) {
                if !DatabaseMetaDataKey::is_valid_blob_number(next_blob_number) {
                    return Err(inconsistent(location, "blob number generator out of range"));
                }
                object.set_blob_number(next_blob_number);
                new_blobs.push(BlobJournalEntry::new(database_id, next_blob_number));
                next_blob_number += 1;
            }
        }
        if new_blobs.is_empty() {
            return Ok(());
        }

        put_var_int(&mut direct, generator_key, next_blob_number)?;
        append_blobs_to_journal(&mut direct, &RecoveryBlobJournalKey::encode(), &new_blobs)?;
        direct.commit()?;

        self.blobs_to_write = new_blobs;
        Ok(())
    }

    /// Every blob named by a blob entry this transaction replaces or drops
    fn collect_blob_files_to_remove(&mut self, core: &mut TransactionCore) -> Result<()> {
        let location = ErrorLocation::CollectBlobFilesToRemove;
        let keys: Vec<Vec<u8>> = core.external_object_change_map.keys().cloned().collect();
        for object_store_data_key in keys {
            let blob_entry_key = BlobEntryKey::from_object_store_data_key(&object_store_data_key)
                .ok_or_else(|| inconsistent(location, "record key is not an object store data key"))?
                .encode();
            let Some(value) = core.kv()?.get(&blob_entry_key)? else {
                continue;
            };
            let objects = decode_external_objects(&value)
                .ok_or_else(|| undecodable(location, "blob entry failed to decode"))?;
            for object in objects.iter().filter(|object| object.has_blob_file()) {
                self.blobs_to_remove
                    .push(BlobJournalEntry::new(self.database_id, object.blob_number()));
            }
            core.kv_mut()?.remove(&blob_entry_key)?;
        }
        Ok(())
    }

    fn write_new_blobs(&mut self, store: &StoreInner, core: &TransactionCore) -> Result<BlobWriteResult> {
        let mut jobs = Vec::new();
        for (object_store_data_key, objects) in &core.external_object_change_map {
            for (index, object) in objects.iter().enumerate() {
                match object.kind() {
                    ExternalObjectKind::FileSystemAccessHandle => {
                        if !object.serialized_handle().is_empty() {
                            continue;
                        }
                        let token = object.transfer_token().cloned().ok_or_else(|| {
                            IdbError::InvalidArgument("file system access handle without a token".into())
                        })?;
                        jobs.push(BlobJob::Serialize {
                            object_store_data_key: object_store_data_key.clone(),
                            index,
                            token,
                        });
                    }
                    ExternalObjectKind::Blob | ExternalObjectKind::File => {
                        if store.is_in_memory() || object.size() == 0 {
                            continue;
                        }
                        let payload = match (object.payload(), object.indexed_db_file_path()) {
                            (Some(payload), _) => payload.clone(),
                            (None, Some(path)) => Bytes::from(fs::read(path)?),
                            (None, None) => {
                                return Err(IdbError::InvalidArgument("blob without a payload".into()));
                            }
                        };
                        let path = store
                            .blob_file_name(self.database_id, object.blob_number())
                            .ok_or_else(|| IdbError::InvalidState("no blob directory".into()))?;
                        let last_modified = match object.kind() {
                            ExternalObjectKind::File => object.last_modified(),
                            _ => None,
                        };
                        jobs.push(BlobJob::Write { payload, path, last_modified });
                    }
                }
            }
        }

        if jobs.is_empty() {
            return Ok(BlobWriteResult::RunPhaseTwoAndReturnResult);
        }

        let (sender, events) = channel::unbounded();
        self.pending_blob_writes = Some(PendingBlobWrites { events, calls_left: jobs.len() });
        let flush_on_write = self.durability.sync_on_commit();
        for job in jobs {
            let sender = sender.clone();
            match job {
                BlobJob::Write { payload, path, last_modified } => store.blob_storage.write_blob_to_file(
                    payload,
                    path,
                    flush_on_write,
                    last_modified,
                    Box::new(move |result| {
                        let _ = sender.send(BlobWriteEvent::Written(result));
                    }),
                ),
                BlobJob::Serialize { object_store_data_key, index, token } => store.blob_storage.serialize_handle(
                    token,
                    Box::new(move |token| {
                        let _ = sender.send(BlobWriteEvent::HandleSerialized { object_store_data_key, index, token });
                    }),
                ),
            }
        }
        Ok(BlobWriteResult::RunPhaseTwoAsync)
    }

    fn apply_blob_write_event(core: &mut TransactionCore, event: BlobWriteEvent) -> Result<()> {
        match event {
            BlobWriteEvent::Written(WriteBlobToFileResult::Success) => Ok(()),
            BlobWriteEvent::Written(WriteBlobToFileResult::AlreadyExistsMismatch) => {
                Err(IdbError::BlobWriteFailed("blob file exists with different content".into()))
            }
            BlobWriteEvent::Written(WriteBlobToFileResult::Error(message)) => Err(IdbError::BlobWriteFailed(message)),
            BlobWriteEvent::HandleSerialized { object_store_data_key, index, token } => {
                if let Some(object) = core
                    .external_object_change_map
                    .get_mut(&object_store_data_key)
                    .and_then(|objects| objects.get_mut(index))
                {
                    object.set_serialized_handle(token);
                }
                Ok(())
            }
        }
    }

    /// Block until every blob write started by phase one has finished.
    /// A single failed write fails the commit; roll back afterwards.
    pub fn wait_for_blob_writes(&mut self) -> Result<BlobWriteResult> {
        let Some(pending) = self.pending_blob_writes.take() else {
            return Ok(BlobWriteResult::RunPhaseTwoAndReturnResult);
        };
        let core_arc = Arc::clone(&self.core);
        let mut core = core_arc.lock();

        let mut first_error = None;
        for _ in 0..pending.calls_left {
            let event = match pending.events.recv() {
                Ok(event) => event,
                Err(_) => {
                    first_error.get_or_insert(IdbError::BlobWriteFailed("blob writer went away".into()));
                    break;
                }
            };
            if let Err(err) = Self::apply_blob_write_event(&mut core, event) {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => {
                self.blob_write_failed = true;
                Err(err)
            }
            None => Ok(BlobWriteResult::RunPhaseTwoAsync),
        }
    }

    /// Non-blocking form of `wait_for_blob_writes`: `None` while writes are
    /// still outstanding
    pub fn poll_blob_writes(&mut self) -> Result<Option<BlobWriteResult>> {
        let Some(mut pending) = self.pending_blob_writes.take() else {
            return Ok(Some(BlobWriteResult::RunPhaseTwoAndReturnResult));
        };
        let core_arc = Arc::clone(&self.core);
        let mut core = core_arc.lock();

        while pending.calls_left > 0 {
            match pending.events.try_recv() {
                Ok(event) => {
                    pending.calls_left -= 1;
                    if let Err(err) = Self::apply_blob_write_event(&mut core, event) {
                        self.blob_write_failed = true;
                        // Let the remaining writes finish before anyone cleans up.
                        for _ in 0..pending.calls_left {
                            if pending.events.recv().is_err() {
                                break;
                            }
                        }
                        return Err(err);
                    }
                }
                Err(TryRecvError::Empty) => {
                    self.pending_blob_writes = Some(pending);
                    return Ok(None);
                }
                Err(TryRecvError::Disconnected) => {
                    self.blob_write_failed = true;
                    return Err(IdbError::BlobWriteFailed("blob writer went away".into()));
                }
            }
        }
        Ok(Some(BlobWriteResult::RunPhaseTwoAsync))
    }

    /// Phase two: persist blob entries and journals, then commit atomically
    pub fn commit_phase_two(&mut self) -> Result<()> {
        if self.state != TransactionState::CommittingPhaseOne {
            return Err(IdbError::InvalidState(format!("phase two on a {:?} transaction", self.state)));
        }
        if self.pending_blob_writes.is_some() {
            return Err(IdbError::InvalidState("blob writes still outstanding".into()));
        }
        if self.blob_write_failed {
            return Err(IdbError::InvalidState("blob writes failed; roll back".into()));
        }
        self.state = TransactionState::CommittingPhaseTwo;

        let location = ErrorLocation::CommitPhaseTwo;
        let commit_guard = self.commit_guard.take();
        let store = self.store()?;
        let core_arc = Arc::clone(&self.core);
        let mut core = core_arc.lock();
        let in_memory = store.is_in_memory();

        // Step 1: Blob entries follow the change map
        if !in_memory {
            let changes: Vec<(Vec<u8>, Option<Vec<u8>>)> = core
                .external_object_change_map
                .iter()
                .map(|(key, objects)| {
                    let encoded = (!objects.is_empty()).then(|| encode_external_objects(objects));
                    (key.clone(), encoded)
                })
                .collect();
            for (object_store_data_key, encoded) in changes {
                let blob_entry_key = BlobEntryKey::from_object_store_data_key(&object_store_data_key)
                    .ok_or_else(|| inconsistent(location, "record key is not an object store data key"))?
                    .encode();
                match encoded {
                    Some(value) => core.kv_mut()?.put(blob_entry_key, value)?,
                    None => core.kv_mut()?.remove(&blob_entry_key)?,
                }
            }
        }

        // Step 2: Journals
        let mut inactive_blobs = Vec::new();
        let mut saved_recovery_journal = None;
        if !self.blobs_to_write.is_empty() || !self.blobs_to_remove.is_empty() {
            let recovery_key = RecoveryBlobJournalKey::encode();
            let mut recovery = get_blob_journal(core.kv()?, &recovery_key)?;
            recovery.retain(|entry| !self.blobs_to_write.contains(entry));
            saved_recovery_journal = Some(recovery.clone());

            let mut active_blobs = Vec::new();
            for entry in self.blobs_to_remove.drain(..) {
                if store
                    .active_blobs
                    .mark_blob_deleted_and_check_if_referenced(entry.database_id, entry.blob_number)
                {
                    active_blobs.push(entry);
                } else {
                    inactive_blobs.push(entry);
                }
            }
            recovery.extend_from_slice(&inactive_blobs);

            let kv = core.kv_mut()?;
            update_blob_journal(kv, &recovery_key, &recovery)?;
            append_blobs_to_journal(kv, &ActiveBlobJournalKey::encode(), &active_blobs)?;
        }

        // Step 3: Commit
        core.kv_mut()?
            .commit(self.durability.sync_on_commit())
            .inspect_err(|err| {
                report_write_error(location);
                tracing::warn!(%err, database_id = self.database_id, "commit phase two failed");
            })?;
        self.state = TransactionState::Committed;
        self.blobs_to_write.clear();
        let change_map = std::mem::take(&mut core.external_object_change_map);
        drop(core);

        // Step 4: Publish in-memory blobs, or delete files nobody needs
        if in_memory {
            let mut objects = store.in_memory_external_objects.lock();
            for (key, record_objects) in change_map {
                if record_objects.is_empty() {
                    objects.remove(&key);
                } else {
                    objects.insert(key, record_objects);
                }
            }
        } else if !inactive_blobs.is_empty() {
            match store.clean_up_blob_journal_entries(&inactive_blobs) {
                Ok(()) => {
                    if let Some(saved) = saved_recovery_journal {
                        let mut direct = DirectTransaction::new(Arc::clone(&store.engine));
                        update_blob_journal(&mut direct, &RecoveryBlobJournalKey::encode(), &saved)?;
                        direct.commit()?;
                    }
                }
                Err(err) => tracing::warn!(%err, "deleting replaced blobs failed; left in recovery journal"),
            }
        }

        drop(commit_guard);
        Ok(())
    }

    /// Both phases, waiting for blob writes in between
    pub fn commit(&mut self) -> Result<()> {
        if self.commit_phase_one()? == BlobWriteResult::RunPhaseTwoAsync {
            self.wait_for_blob_writes()?;
        }
        self.commit_phase_two()
    }

    /// Discard every buffered write. Blobs already written by phase one are
    /// left to the recovery journal.
    pub fn rollback(&mut self) -> Result<()> {
        match self.state {
            TransactionState::Committed | TransactionState::RolledBack => {
                return Err(IdbError::InvalidState(format!("cannot roll back a {:?} transaction", self.state)));
            }
            TransactionState::Created => {
                self.state = TransactionState::RolledBack;
                return Ok(());
            }
            TransactionState::Begun
            | TransactionState::CommittingPhaseOne
            | TransactionState::CommittingPhaseTwo => {}
        }

        // In-flight writes must land before the journal is cleaned.
        if let Some(pending) = self.pending_blob_writes.take() {
            for _ in 0..pending.calls_left {
                if pending.events.recv().is_err() {
                    break;
                }
            }
        }

        {
            let mut core = self.core.lock();
            if let Some(kv) = core.kv.as_mut() {
                kv.rollback();
            }
            core.external_object_change_map.clear();
        }
        drop(self.commit_guard.take());

        if !self.blobs_to_write.is_empty() {
            if let Some(store) = self.store.upgrade() {
                store.start_journal_cleaning_timer();
            }
        }
        self.blobs_to_write.clear();
        self.blobs_to_remove.clear();

        if let Some(before) = self.metadata_before_transaction.take() {
            if let Some(database) = self.database.upgrade() {
                *database.write() = before;
            }
        }
        self.state = TransactionState::RolledBack;
        Ok(())
    }

    // =========================================================================
    // Records
    // =========================================================================

    pub fn get_record(&self, object_store_id: i64, key: &IdbKey) -> Result<Option<IdbValue>> {
        self.ensure_active()?;
        self.core.lock().get_record(object_store_id, key)
    }

    pub fn put_record(&mut self, object_store_id: i64, key: &IdbKey, value: IdbValue) -> Result<RecordIdentifier> {
        self.ensure_writable()?;
        self.core
            .lock()
            .put_record(object_store_id, key, value)
            .inspect_err(|_| report_write_error(ErrorLocation::PutRecord))
    }

    pub fn clear_object_store(&mut self, object_store_id: i64) -> Result<()> {
        self.ensure_writable()?;
        self.core.lock().clear_object_store(object_store_id)
    }

    pub fn delete_range(&mut self, object_store_id: i64, range: &KeyRange) -> Result<()> {
        self.ensure_writable()?;
        self.core.lock().delete_range(object_store_id, range)
    }

    pub fn get_key_generator_current_number(&self, object_store_id: i64) -> Result<i64> {
        self.ensure_active()?;
        self.core.lock().get_key_generator_current_number(object_store_id)
    }

    /// Raise the generator to `new_number`; with `check_current` it never
    /// moves backwards
    pub fn maybe_update_key_generator_current_number(
        &mut self,
        object_store_id: i64,
        new_number: i64,
        check_current: bool,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.core
            .lock()
            .maybe_update_key_generator_current_number(object_store_id, new_number, check_current)
    }

    pub fn key_exists_in_object_store(&self, object_store_id: i64, key: &IdbKey) -> Result<Option<RecordIdentifier>> {
        self.ensure_active()?;
        self.core.lock().key_exists_in_object_store(object_store_id, key)
    }

    pub fn put_index_data_for_record(
        &mut self,
        object_store_id: i64,
        index_id: i64,
        key: &IdbKey,
        record_identifier: &RecordIdentifier,
    ) -> Result<()> {
        self.ensure_writable()?;
        self.core
            .lock()
            .put_index_data_for_record(object_store_id, index_id, key, record_identifier)
    }

    /// Primary key of the first live record indexed under `key`
    pub fn get_first_primary_key_for_index_key(
        &mut self,
        object_store_id: i64,
        index_id: i64,
        key: &IdbKey,
    ) -> Result<Option<IdbKey>> {
        self.ensure_active()?;
        self.core
            .lock()
            .get_first_primary_key_for_index_key(object_store_id, index_id, key)
    }

    pub fn get_object_store_key_count(&mut self, object_store_id: i64, range: &KeyRange) -> Result<u32> {
        self.ensure_active()?;
        let mut core = self.core.lock();
        core.check_ids(object_store_id)?;
        let options = CursorOptions::for_object_store(self.database_id, object_store_id, range, CursorDirection::Next);
        core.count(CursorKind::ObjectStoreKey, options)
            .inspect_err(|_| report_read_error(ErrorLocation::GetObjectStoreKeyCount))
    }

    pub fn get_index_key_count(&mut self, object_store_id: i64, index_id: i64, range: &KeyRange) -> Result<u32> {
        self.ensure_active()?;
        let mut core = self.core.lock();
        core.check_index_ids(object_store_id, index_id)?;
        let options =
            CursorOptions::for_index(self.database_id, object_store_id, index_id, range, CursorDirection::Next);
        core.count(CursorKind::IndexKey, options)
            .inspect_err(|_| report_read_error(ErrorLocation::GetIndexKeyCount))
    }

    // =========================================================================
    // Cursors
    // =========================================================================

    fn open_cursor(&self, kind: CursorKind, options: CursorOptions) -> Result<Option<Cursor>> {
        self.ensure_active()?;
        let state = {
            let mut core = self.core.lock();
            CursorState::open(&mut core, kind, options)?
        };
        Ok(state.map(|state| Cursor::new(Arc::downgrade(&self.core), state)))
    }

    pub fn open_object_store_key_cursor(
        &self,
        object_store_id: i64,
        range: &KeyRange,
        direction: CursorDirection,
    ) -> Result<Option<Cursor>> {
        self.core.lock().check_ids(object_store_id)?;
        let options = CursorOptions::for_object_store(self.database_id, object_store_id, range, direction);
        self.open_cursor(CursorKind::ObjectStoreKey, options)
    }

    pub fn open_object_store_cursor(
        &self,
        object_store_id: i64,
        range: &KeyRange,
        direction: CursorDirection,
    ) -> Result<Option<Cursor>> {
        self.core.lock().check_ids(object_store_id)?;
        let options = CursorOptions::for_object_store(self.database_id, object_store_id, range, direction);
        self.open_cursor(CursorKind::ObjectStore, options)
    }

    pub fn open_index_key_cursor(
        &self,
        object_store_id: i64,
        index_id: i64,
        range: &KeyRange,
        direction: CursorDirection,
    ) -> Result<Option<Cursor>> {
        self.core.lock().check_index_ids(object_store_id, index_id)?;
        let options = CursorOptions::for_index(self.database_id, object_store_id, index_id, range, direction);
        self.open_cursor(CursorKind::IndexKey, options)
    }

    pub fn open_index_cursor(
        &self,
        object_store_id: i64,
        index_id: i64,
        range: &KeyRange,
        direction: CursorDirection,
    ) -> Result<Option<Cursor>> {
        self.core.lock().check_index_ids(object_store_id, index_id)?;
        let options = CursorOptions::for_index(self.database_id, object_store_id, index_id, range, direction);
        self.open_cursor(CursorKind::Index, options)
    }

    // =========================================================================
    // Schema
    // =========================================================================

    pub fn set_database_version(&mut self, version: i64) -> Result<()> {
        self.ensure_version_change()?;
        if version < 0 {
            return Err(IdbError::InvalidArgument(format!("invalid version {}", version)));
        }
        let database = self.database()?;
        let key = DatabaseMetaDataKey::encode(self.database_id, DatabaseMetaDataKey::USER_VERSION);
        put_var_int(self.core.lock().kv_mut()?, key, version)?;
        database.write().version = version;
        Ok(())
    }

    pub fn create_object_store(
        &mut self,
        object_store_id: i64,
        name: &str,
        key_path: KeyPath,
        auto_increment: bool,
    ) -> Result<()> {
        self.ensure_version_change()?;
        let database = self.database()?;
        let database_id = self.database_id;
        let mut core = self.core.lock();
        core.check_ids(object_store_id)?;
        if database.read().object_stores.contains_key(&object_store_id) {
            return Err(IdbError::InvalidArgument(format!("object store {} exists", object_store_id)));
        }

        let kv = core.kv_mut()?;
        set_max_object_store_id(kv, database_id, object_store_id)?;
        let key = |field| ObjectStoreMetaDataKey::encode(database_id, object_store_id, field);
        put_string(kv, key(ObjectStoreMetaDataKey::NAME), name)?;
        kv.put(key(ObjectStoreMetaDataKey::KEY_PATH), key_path.encode())?;
        put_bool(kv, key(ObjectStoreMetaDataKey::AUTO_INCREMENT), auto_increment)?;
        put_bool(kv, key(ObjectStoreMetaDataKey::EVICTABLE), false)?;
        put_int(kv, key(ObjectStoreMetaDataKey::LAST_VERSION), 1)?;
        put_int(kv, key(ObjectStoreMetaDataKey::MAX_INDEX_ID), KeyPrefix::MINIMUM_INDEX_ID)?;
        put_bool(kv, key(ObjectStoreMetaDataKey::HAS_KEY_PATH), !key_path.is_null())?;
        put_int(kv, key(ObjectStoreMetaDataKey::KEY_GENERATOR_CURRENT_NUMBER), KEY_GENERATOR_INITIAL_NUMBER)?;
        put_int(kv, ObjectStoreNamesKey::encode(database_id, name), object_store_id)?;

        let mut metadata = database.write();
        metadata
            .object_stores
            .insert(object_store_id, ObjectStoreMetadata::new(object_store_id, name, key_path, auto_increment));
        metadata.max_object_store_id = object_store_id;
        Ok(())
    }

    pub fn delete_object_store(&mut self, object_store_id: i64) -> Result<()> {
        self.ensure_version_change()?;
        let database = self.database()?;
        let database_id = self.database_id;
        let mut core = self.core.lock();
        core.check_ids(object_store_id)?;

        let name_key = ObjectStoreMetaDataKey::encode(database_id, object_store_id, ObjectStoreMetaDataKey::NAME);
        let name = get_string(core.kv()?, &name_key)?.ok_or_else(|| {
            inconsistent(ErrorLocation::DeleteObjectStore, "deleting an object store without a name")
        })?;

        let kv = core.kv_mut()?;
        kv.remove_range(
            &ObjectStoreMetaDataKey::encode(database_id, object_store_id, 0),
            &ObjectStoreMetaDataKey::encode_max_key_for_store(database_id, object_store_id),
            RemoveRangeMode::InclusiveEnd,
        )?;
        kv.remove(&ObjectStoreNamesKey::encode(database_id, &name))?;
        kv.remove_range(
            &IndexFreeListKey::encode(database_id, object_store_id, 0),
            &IndexFreeListKey::encode_max_key(database_id, object_store_id),
            RemoveRangeMode::InclusiveEnd,
        )?;
        kv.remove_range(
            &IndexMetaDataKey::encode(database_id, object_store_id, 0, 0),
            &IndexMetaDataKey::encode_max_key(database_id, object_store_id),
            RemoveRangeMode::InclusiveEnd,
        )?;
        core.clear_object_store(object_store_id)?;

        database.write().object_stores.remove(&object_store_id);
        Ok(())
    }

    pub fn rename_object_store(&mut self, object_store_id: i64, new_name: &str) -> Result<()> {
        self.ensure_version_change()?;
        let database = self.database()?;
        let database_id = self.database_id;
        let mut core = self.core.lock();
        core.check_ids(object_store_id)?;

        let name_key = ObjectStoreMetaDataKey::encode(database_id, object_store_id, ObjectStoreMetaDataKey::NAME);
        let old_name = get_string(core.kv()?, &name_key)?
            .ok_or_else(|| inconsistent(ErrorLocation::ReadObjectStores, "renaming an object store without a name"))?;

        let kv = core.kv_mut()?;
        kv.remove(&ObjectStoreNamesKey::encode(database_id, &old_name))?;
        put_string(kv, name_key, new_name)?;
        put_int(kv, ObjectStoreNamesKey::encode(database_id, new_name), object_store_id)?;

        if let Some(store) = database.write().object_stores.get_mut(&object_store_id) {
            store.name = new_name.to_string();
        }
        Ok(())
    }

    pub fn create_index(
        &mut self,
        object_store_id: i64,
        index_id: i64,
        name: &str,
        key_path: KeyPath,
        unique: bool,
        multi_entry: bool,
    ) -> Result<()> {
        self.ensure_version_change()?;
        let database = self.database()?;
        let database_id = self.database_id;
        let mut core = self.core.lock();
        core.check_index_ids(object_store_id, index_id)?;
        if !database.read().object_stores.contains_key(&object_store_id) {
            return Err(IdbError::InvalidArgument(format!("unknown object store {}", object_store_id)));
        }

        let kv = core.kv_mut()?;
        set_max_index_id(kv, database_id, object_store_id, index_id)?;
        let key = |field| IndexMetaDataKey::encode(database_id, object_store_id, index_id, field);
        put_string(kv, key(IndexMetaDataKey::NAME), name)?;
        put_bool(kv, key(IndexMetaDataKey::UNIQUE), unique)?;
        kv.put(key(IndexMetaDataKey::KEY_PATH), key_path.encode())?;
        put_bool(kv, key(IndexMetaDataKey::MULTI_ENTRY), multi_entry)?;

        if let Some(store) = database.write().object_stores.get_mut(&object_store_id) {
            store.indexes.insert(
                index_id,
                IndexMetadata { name: name.to_string(), id: index_id, key_path, unique, multi_entry },
            );
            store.max_index_id = index_id;
        }
        Ok(())
    }

    pub fn delete_index(&mut self, object_store_id: i64, index_id: i64) -> Result<()> {
        self.ensure_version_change()?;
        let database = self.database()?;
        let database_id = self.database_id;
        let mut core = self.core.lock();
        core.check_index_ids(object_store_id, index_id)?;

        let kv = core.kv_mut()?;
        kv.remove_range(
            &IndexMetaDataKey::encode(database_id, object_store_id, index_id, 0),
            &IndexMetaDataKey::encode_max_key_for_index(database_id, object_store_id, index_id),
            RemoveRangeMode::InclusiveEnd,
        )?;
        kv.remove_range(
            &IndexDataKey::encode_min_key(database_id, object_store_id, index_id),
            &IndexDataKey::encode_max_key(database_id, object_store_id, index_id),
            RemoveRangeMode::InclusiveEnd,
        )?;

        if let Some(store) = database.write().object_stores.get_mut(&object_store_id) {
            store.indexes.remove(&index_id);
        }
        Ok(())
    }

    pub fn rename_index(&mut self, object_store_id: i64, index_id: i64, new_name: &str) -> Result<()> {
        self.ensure_version_change()?;
        let database = self.database()?;
        let database_id = self.database_id;
        let mut core = self.core.lock();
        core.check_index_ids(object_store_id, index_id)?;

        let key = IndexMetaDataKey::encode(database_id, object_store_id, index_id, IndexMetaDataKey::NAME);
        put_string(core.kv_mut()?, key, new_name)?;

        if let Some(index) = database
            .write()
            .object_stores
            .get_mut(&object_store_id)
            .and_then(|store| store.indexes.get_mut(&index_id))
        {
            index.name = new_name.to_string();
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(
            self.state,
            TransactionState::Begun | TransactionState::CommittingPhaseOne | TransactionState::CommittingPhaseTwo
        ) {
            if let Err(err) = self.rollback() {
                tracing::debug!(%err, "implicit rollback failed");
            }
        }
        if self.registered_with_store {
            let tombstones = self.core.lock().tombstone_threshold_exceeded;
            if let Some(store) = self.store.upgrade() {
                store.on_transaction_complete(tombstones);
            }
        }
    }
}
