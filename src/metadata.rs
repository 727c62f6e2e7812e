//! Schema metadata
//!
//! In-memory descriptions of databases, object stores and indexes, and the
//! routines that read them back from their metadata keys.
//!
//! ## Object store metadata run
//! ```text
//! (db, 0, 0) [50] os [0]  NAME                   (required)
//!                    [1]  KEY_PATH               (required)
//!                    [2]  AUTO_INCREMENT         (required)
//!                    [3]  EVICTABLE              (required, ignored)
//!                    [4]  LAST_VERSION           (required)
//!                    [5]  MAX_INDEX_ID           (required)
//!                    [6]  HAS_KEY_PATH           (optional)
//!                    [7]  KEY_GENERATOR_CURRENT  (optional)
//! ```
//! Entries that do not start a run with NAME are stale leftovers and are
//! skipped after logging a consistency error.

use std::collections::BTreeMap;

use crate::coding::keys::{
    DatabaseMetaDataKey, DatabaseNameKey, IndexMetaDataKey, KeyPrefix, MaxDatabaseIdKey,
    ObjectStoreMetaDataKey,
};
use crate::coding::{decode_bool, decode_int, decode_string, decode_var_int, KeyPath};
use crate::error::{IdbError, Result};
use crate::kv::{get_int, get_var_int, put_int, KvIterator, KvView, KvWrite};
use crate::reporting::{report_consistency_error, report_read_error, ErrorLocation};

/// Version of a database that has never been opened with a version
pub const NO_VERSION: i64 = -1;

/// Version persisted for a database created but not yet upgraded
pub const DEFAULT_VERSION: i64 = 0;

/// First key handed out by a fresh key generator
pub const KEY_GENERATOR_INITIAL_NUMBER: i64 = 1;
/// Largest number a key generator hands out (2^53)
pub const KEY_GENERATOR_MAX_NUMBER: i64 = 1 << 53;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMetadata {
    pub name: String,
    pub id: i64,
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreMetadata {
    pub name: String,
    pub id: i64,
    pub key_path: KeyPath,
    pub auto_increment: bool,
    pub max_index_id: i64,
    pub indexes: BTreeMap<i64, IndexMetadata>,
}

impl ObjectStoreMetadata {
    pub fn new(id: i64, name: impl Into<String>, key_path: KeyPath, auto_increment: bool) -> Self {
        Self {
            name: name.into(),
            id,
            key_path,
            auto_increment,
            max_index_id: KeyPrefix::MINIMUM_INDEX_ID,
            indexes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseMetadata {
    pub name: String,
    /// `None` until the database exists in the store
    pub id: Option<i64>,
    pub version: i64,
    pub max_object_store_id: i64,
    pub object_stores: BTreeMap<i64, ObjectStoreMetadata>,
}

impl DatabaseMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            version: NO_VERSION,
            max_object_store_id: 0,
            object_stores: BTreeMap::new(),
        }
    }

    /// Forget everything but the name
    pub(crate) fn reset(&mut self) {
        self.id = None;
        self.version = NO_VERSION;
        self.max_object_store_id = 0;
        self.object_stores.clear();
    }
}

// =============================================================================
// Readers
// =============================================================================

fn inconsistent(location: ErrorLocation, what: &'static str) -> IdbError {
    report_consistency_error(location);
    IdbError::InternalInconsistency(what)
}

fn undecodable(location: ErrorLocation, what: &'static str) -> IdbError {
    report_read_error(location);
    IdbError::InternalInconsistency(what)
}

/// Metadata for `name`; `id` stays `None` when the database does not exist
pub fn read_metadata_for_database_name<V: KvView + ?Sized>(
    view: &V,
    origin: &str,
    name: &str,
) -> Result<DatabaseMetadata> {
    let location = ErrorLocation::ReadMetadataForDatabaseName;
    let mut metadata = DatabaseMetadata::new(name);

    let Some(database_id) = get_var_int(view, &DatabaseNameKey::encode(origin, name))? else {
        return Ok(metadata);
    };

    let version = get_var_int(view, &DatabaseMetaDataKey::encode(database_id, DatabaseMetaDataKey::USER_VERSION))?
        .ok_or_else(|| inconsistent(location, "database without a version"))?;
    metadata.id = Some(database_id);
    metadata.version = if version == DEFAULT_VERSION { NO_VERSION } else { version };
    metadata.max_object_store_id = get_max_object_store_id(view, database_id)?;

    // Checked, not cached: the generator is only read when blobs are written.
    let blob_number = get_var_int(
        view,
        &DatabaseMetaDataKey::encode(database_id, DatabaseMetaDataKey::BLOB_KEY_GENERATOR_CURRENT_NUMBER),
    )?
    .ok_or_else(|| undecodable(location, "database without a blob number generator"))?;
    if !DatabaseMetaDataKey::is_valid_blob_number(blob_number) {
        return Err(inconsistent(location, "blob number generator out of range"));
    }

    metadata.object_stores = read_object_stores(view, database_id)?;
    Ok(metadata)
}

pub fn get_max_object_store_id<V: KvView + ?Sized>(view: &V, database_id: i64) -> Result<i64> {
    let key = DatabaseMetaDataKey::encode(database_id, DatabaseMetaDataKey::MAX_OBJECT_STORE_ID);
    Ok(get_int(view, &key)?.unwrap_or(0))
}

/// Positions `it` on the next entry of the run, or fails with `what` when
/// the run breaks off
fn expect_object_store_field<V: KvView + ?Sized>(
    view: &V,
    it: &mut KvIterator,
    stop: &[u8],
    object_store_id: i64,
    meta_data_type: u8,
    what: &'static str,
) -> Result<()> {
    it.next(view)?;
    if !object_store_field_matches(it, stop, object_store_id, meta_data_type) {
        return Err(inconsistent(ErrorLocation::ReadObjectStores, what));
    }
    Ok(())
}

fn object_store_field_matches(it: &KvIterator, stop: &[u8], object_store_id: i64, meta_data_type: u8) -> bool {
    if !it.is_valid() || it.key() >= stop {
        return false;
    }
    let mut input = it.key();
    matches!(
        ObjectStoreMetaDataKey::decode(&mut input),
        Some(key) if key.object_store_id == object_store_id && key.meta_data_type == meta_data_type
    )
}

pub fn read_object_stores<V: KvView + ?Sized>(
    view: &V,
    database_id: i64,
) -> Result<BTreeMap<i64, ObjectStoreMetadata>> {
    let location = ErrorLocation::ReadObjectStores;
    let start = ObjectStoreMetaDataKey::encode(database_id, 1, ObjectStoreMetaDataKey::NAME);
    let stop = ObjectStoreMetaDataKey::encode_max_key(database_id);
    let mut stores = BTreeMap::new();

    let mut it = KvIterator::new();
    it.seek(view, &start)?;
    while it.is_valid() && it.key() < stop.as_slice() {
        let mut input = it.key();
        let meta = ObjectStoreMetaDataKey::decode(&mut input)
            .ok_or_else(|| undecodable(location, "object store metadata key failed to decode"))?;
        if meta.meta_data_type != ObjectStoreMetaDataKey::NAME {
            // Leftover from an older schema or an interrupted delete.
            report_consistency_error(location);
            it.next(view)?;
            continue;
        }
        let object_store_id = meta.object_store_id;
        let name = decode_string(it.value())
            .ok_or_else(|| undecodable(location, "object store name failed to decode"))?;

        expect_object_store_field(view, &mut it, &stop, object_store_id, ObjectStoreMetaDataKey::KEY_PATH, "object store without a key path")?;
        let mut key_path = KeyPath::decode(it.value())
            .ok_or_else(|| undecodable(location, "object store key path failed to decode"))?;

        expect_object_store_field(view, &mut it, &stop, object_store_id, ObjectStoreMetaDataKey::AUTO_INCREMENT, "object store without auto increment")?;
        let auto_increment = decode_bool(it.value())
            .ok_or_else(|| undecodable(location, "auto increment failed to decode"))?;

        expect_object_store_field(view, &mut it, &stop, object_store_id, ObjectStoreMetaDataKey::EVICTABLE, "object store without evictable flag")?;
        decode_bool(it.value()).ok_or_else(|| undecodable(location, "evictable flag failed to decode"))?;

        expect_object_store_field(view, &mut it, &stop, object_store_id, ObjectStoreMetaDataKey::LAST_VERSION, "object store without last version")?;
        decode_int(it.value()).ok_or_else(|| undecodable(location, "last version failed to decode"))?;

        expect_object_store_field(view, &mut it, &stop, object_store_id, ObjectStoreMetaDataKey::MAX_INDEX_ID, "object store without max index id")?;
        let max_index_id = decode_int(it.value())
            .ok_or_else(|| undecodable(location, "max index id failed to decode"))?;

        // Optional trailing fields.
        it.next(view)?;
        if object_store_field_matches(&it, &stop, object_store_id, ObjectStoreMetaDataKey::HAS_KEY_PATH) {
            let has_key_path = decode_bool(it.value())
                .ok_or_else(|| undecodable(location, "has-key-path flag failed to decode"))?;
            if !has_key_path {
                let empty = key_path.is_null() || matches!(&key_path, KeyPath::String(path) if path.is_empty());
                if !empty {
                    return Err(inconsistent(location, "key path present but flagged absent"));
                }
                key_path = KeyPath::Null;
            }
            it.next(view)?;
        }
        if object_store_field_matches(&it, &stop, object_store_id, ObjectStoreMetaDataKey::KEY_GENERATOR_CURRENT_NUMBER) {
            decode_int(it.value())
                .ok_or_else(|| undecodable(location, "key generator state failed to decode"))?;
            it.next(view)?;
        }

        let mut store = ObjectStoreMetadata::new(object_store_id, name, key_path, auto_increment);
        store.max_index_id = max_index_id;
        store.indexes = read_indexes(view, database_id, object_store_id)?;
        stores.insert(object_store_id, store);
    }
    Ok(stores)
}

fn index_field_matches(it: &KvIterator, stop: &[u8], object_store_id: i64, index_id: i64, meta_data_type: u8) -> bool {
    if !it.is_valid() || it.key() >= stop {
        return false;
    }
    let mut input = it.key();
    matches!(
        IndexMetaDataKey::decode(&mut input),
        Some(key) if key.object_store_id == object_store_id
            && key.index_id == index_id
            && key.meta_data_type == meta_data_type
    )
}

pub fn read_indexes<V: KvView + ?Sized>(
    view: &V,
    database_id: i64,
    object_store_id: i64,
) -> Result<BTreeMap<i64, IndexMetadata>> {
    let location = ErrorLocation::ReadIndexes;
    if !KeyPrefix::valid_ids(database_id, object_store_id) {
        return Err(IdbError::InvalidArgument("invalid object store id".into()));
    }
    let start = IndexMetaDataKey::encode(database_id, object_store_id, KeyPrefix::MINIMUM_INDEX_ID, IndexMetaDataKey::NAME);
    let stop = IndexMetaDataKey::encode_max_key(database_id, object_store_id);
    let mut indexes = BTreeMap::new();

    let mut it = KvIterator::new();
    it.seek(view, &start)?;
    while it.is_valid() && it.key() < stop.as_slice() {
        let mut input = it.key();
        let meta = IndexMetaDataKey::decode(&mut input)
            .ok_or_else(|| undecodable(location, "index metadata key failed to decode"))?;
        if meta.meta_data_type != IndexMetaDataKey::NAME {
            report_consistency_error(location);
            it.next(view)?;
            continue;
        }
        let index_id = meta.index_id;
        let name = decode_string(it.value())
            .ok_or_else(|| undecodable(location, "index name failed to decode"))?;

        it.next(view)?;
        if !index_field_matches(&it, &stop, object_store_id, index_id, IndexMetaDataKey::UNIQUE) {
            return Err(inconsistent(location, "index without unique flag"));
        }
        let unique = decode_bool(it.value())
            .ok_or_else(|| undecodable(location, "unique flag failed to decode"))?;

        it.next(view)?;
        if !index_field_matches(&it, &stop, object_store_id, index_id, IndexMetaDataKey::KEY_PATH) {
            return Err(inconsistent(location, "index without a key path"));
        }
        let key_path = KeyPath::decode(it.value())
            .ok_or_else(|| undecodable(location, "index key path failed to decode"))?;

        it.next(view)?;
        let mut multi_entry = false;
        if index_field_matches(&it, &stop, object_store_id, index_id, IndexMetaDataKey::MULTI_ENTRY) {
            multi_entry = decode_bool(it.value())
                .ok_or_else(|| undecodable(location, "multi entry flag failed to decode"))?;
            it.next(view)?;
        }

        indexes.insert(index_id, IndexMetadata { name, id: index_id, key_path, unique, multi_entry });
    }
    Ok(indexes)
}

/// `(name, id)` of every database row of `origin`. Undecodable rows are
/// logged and skipped.
pub fn read_database_ids<V: KvView + ?Sized>(view: &V, origin: &str) -> Result<Vec<(String, i64)>> {
    let location = ErrorLocation::GetDatabaseNames;
    let start = DatabaseNameKey::encode_min_key_for_origin(origin);
    let stop = DatabaseNameKey::encode_stop_key_for_origin(origin);
    let mut found = Vec::new();

    let mut it = KvIterator::new();
    it.seek(view, &start)?;
    while it.is_valid() && (stop.is_empty() || it.key() < stop.as_slice()) {
        let mut input = it.key();
        let Some(name_key) = DatabaseNameKey::decode(&mut input) else {
            report_consistency_error(location);
            it.next(view)?;
            continue;
        };
        let mut value = it.value();
        match decode_var_int(&mut value) {
            Some(database_id) if value.is_empty() => found.push((name_key.database_name, database_id)),
            _ => report_consistency_error(location),
        }
        it.next(view)?;
    }
    Ok(found)
}

/// `(name, version)` of every database of `origin` that has been given a
/// version
pub fn get_database_names_and_versions<V: KvView + ?Sized>(view: &V, origin: &str) -> Result<Vec<(String, i64)>> {
    let location = ErrorLocation::GetDatabaseNames;
    let mut found = Vec::new();
    for (name, database_id) in read_database_ids(view, origin)? {
        let version_key = DatabaseMetaDataKey::encode(database_id, DatabaseMetaDataKey::USER_VERSION);
        match get_var_int(view, &version_key) {
            Ok(Some(version)) if version != DEFAULT_VERSION => found.push((name, version)),
            // Stale row from an initial open that never set a version.
            Ok(Some(_)) => {}
            Ok(None) => report_consistency_error(location),
            Err(_) => report_read_error(location),
        }
    }
    Ok(found)
}

// =============================================================================
// Writers
// =============================================================================

/// Allocates the next database id. Ids are never reused.
pub fn get_new_database_id<T: KvView + KvWrite + ?Sized>(txn: &mut T) -> Result<i64> {
    let max_database_id = get_int(&*txn, &MaxDatabaseIdKey::encode())?.unwrap_or(0);
    if max_database_id < 0 {
        return Err(inconsistent(ErrorLocation::CreateOrOpenDatabase, "negative max database id"));
    }
    let database_id = max_database_id + 1;
    put_int(txn, MaxDatabaseIdKey::encode(), database_id)?;
    Ok(database_id)
}

/// Object store ids must grow strictly
pub fn set_max_object_store_id<T: KvView + KvWrite + ?Sized>(
    txn: &mut T,
    database_id: i64,
    object_store_id: i64,
) -> Result<()> {
    let max_object_store_id = get_max_object_store_id(&*txn, database_id)?;
    if object_store_id <= max_object_store_id {
        report_consistency_error(ErrorLocation::SetMaxObjectStoreId);
        return Err(IdbError::InternalInconsistency("object store id not above the current maximum"));
    }
    put_int(
        txn,
        DatabaseMetaDataKey::encode(database_id, DatabaseMetaDataKey::MAX_OBJECT_STORE_ID),
        object_store_id,
    )
}

/// Index ids must grow strictly within their object store
pub fn set_max_index_id<T: KvView + KvWrite + ?Sized>(
    txn: &mut T,
    database_id: i64,
    object_store_id: i64,
    index_id: i64,
) -> Result<()> {
    let key = ObjectStoreMetaDataKey::encode(database_id, object_store_id, ObjectStoreMetaDataKey::MAX_INDEX_ID);
    let max_index_id = get_int(&*txn, &key)?
        .ok_or_else(|| inconsistent(ErrorLocation::SetMaxIndexId, "object store without max index id"))?;
    if index_id <= max_index_id {
        report_consistency_error(ErrorLocation::SetMaxIndexId);
        return Err(IdbError::InternalInconsistency("index id not above the current maximum"));
    }
    put_int(txn, key, index_id)
}

/// Bumps and returns the record version counter of an object store
pub fn get_new_version_number<T: KvView + KvWrite + ?Sized>(
    txn: &mut T,
    database_id: i64,
    object_store_id: i64,
) -> Result<i64> {
    let key = ObjectStoreMetaDataKey::encode(database_id, object_store_id, ObjectStoreMetaDataKey::LAST_VERSION);
    let last_version = get_int(&*txn, &key)?.unwrap_or(0);
    let version = last_version + 1;
    put_int(txn, key, version)?;
    Ok(version)
}
