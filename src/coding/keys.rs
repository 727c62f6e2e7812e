//! Persisted key types
//!
//! Every key starts with a `KeyPrefix` of three order-preserving ints:
//!
//! ```text
//! (0,  0,  0)      global metadata     + type byte [+ payload]
//! (db, 0,  0)      database metadata   + type byte [+ payload]
//! (db, os, 1)      object store data   + user key
//! (db, os, 2)      exists entries      + user key
//! (db, os, 3)      blob entries        + user key
//! (db, os, 30..)   index data          + index key + primary key
//! ```
//!
//! Because the prefix leads, every key of database `db` lies in
//! `[KeyPrefix(db,0,0), KeyPrefix(db+1,0,0))` and every data key of store
//! `os` lies in `[KeyPrefix(db,os,0), KeyPrefix(db,os+1,0))`.

use super::key::{IdbKey, PAST_KEY_SENTINEL};
use super::{
    decode_byte, decode_ordered_int, decode_ordered_string, encode_ordered_int,
    encode_ordered_string,
};

// =============================================================================
// KeyPrefix
// =============================================================================

/// What a key prefix addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    GlobalMetadata,
    DatabaseMetadata,
    ObjectStoreData,
    ExistsEntry,
    BlobEntry,
    IndexData,
    InvalidType,
}

/// Leading `(database_id, object_store_id, index_id)` of every key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPrefix {
    pub database_id: i64,
    pub object_store_id: i64,
    pub index_id: i64,
}

impl KeyPrefix {
    pub const OBJECT_STORE_DATA_INDEX_ID: i64 = 1;
    pub const EXISTS_ENTRY_INDEX_ID: i64 = 2;
    pub const BLOB_ENTRY_INDEX_ID: i64 = 3;
    pub const MINIMUM_INDEX_ID: i64 = 30;

    const MAX_DATABASE_ID: i64 = 1 << 56;
    const MAX_OBJECT_STORE_ID: i64 = 1 << 56;
    const MAX_INDEX_ID: i64 = 1 << 32;

    pub fn new(database_id: i64, object_store_id: i64, index_id: i64) -> Self {
        Self { database_id, object_store_id, index_id }
    }

    pub fn global() -> Self {
        Self::new(0, 0, 0)
    }

    pub fn database(database_id: i64) -> Self {
        Self::new(database_id, 0, 0)
    }

    pub fn object_store(database_id: i64, object_store_id: i64) -> Self {
        Self::new(database_id, object_store_id, 0)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, into: &mut Vec<u8>) {
        encode_ordered_int(self.database_id, into);
        encode_ordered_int(self.object_store_id, into);
        encode_ordered_int(self.index_id, into);
    }

    pub fn decode(input: &mut &[u8]) -> Option<Self> {
        let database_id = decode_ordered_int(input)?;
        let object_store_id = decode_ordered_int(input)?;
        let index_id = decode_ordered_int(input)?;
        Some(Self { database_id, object_store_id, index_id })
    }

    pub fn key_type(&self) -> KeyType {
        match (self.database_id, self.object_store_id, self.index_id) {
            (0, 0, 0) => KeyType::GlobalMetadata,
            (_, 0, 0) => KeyType::DatabaseMetadata,
            (_, _, Self::OBJECT_STORE_DATA_INDEX_ID) => KeyType::ObjectStoreData,
            (_, _, Self::EXISTS_ENTRY_INDEX_ID) => KeyType::ExistsEntry,
            (_, _, Self::BLOB_ENTRY_INDEX_ID) => KeyType::BlobEntry,
            (_, _, id) if id >= Self::MINIMUM_INDEX_ID => KeyType::IndexData,
            _ => KeyType::InvalidType,
        }
    }

    pub fn is_valid_database_id(database_id: i64) -> bool {
        database_id > 0 && database_id < Self::MAX_DATABASE_ID
    }

    pub fn is_valid_object_store_id(object_store_id: i64) -> bool {
        object_store_id > 0 && object_store_id < Self::MAX_OBJECT_STORE_ID
    }

    pub fn is_valid_index_id(index_id: i64) -> bool {
        index_id >= Self::MINIMUM_INDEX_ID && index_id < Self::MAX_INDEX_ID
    }

    pub fn valid_ids(database_id: i64, object_store_id: i64) -> bool {
        Self::is_valid_database_id(database_id) && Self::is_valid_object_store_id(object_store_id)
    }

    pub fn valid_index_ids(database_id: i64, object_store_id: i64, index_id: i64) -> bool {
        Self::valid_ids(database_id, object_store_id) && Self::is_valid_index_id(index_id)
    }
}

// =============================================================================
// Global metadata
// =============================================================================

const SCHEMA_VERSION_TYPE_BYTE: u8 = 0;
const MAX_DATABASE_ID_TYPE_BYTE: u8 = 1;
const DATA_VERSION_TYPE_BYTE: u8 = 2;
const RECOVERY_BLOB_JOURNAL_TYPE_BYTE: u8 = 3;
const ACTIVE_BLOB_JOURNAL_TYPE_BYTE: u8 = 4;
const EARLIEST_SWEEP_TYPE_BYTE: u8 = 5;
const EARLIEST_COMPACTION_TYPE_BYTE: u8 = 6;
const DATABASE_NAME_TYPE_BYTE: u8 = 201;

fn global_key(type_byte: u8) -> Vec<u8> {
    let mut out = KeyPrefix::global().encode();
    out.push(type_byte);
    out
}

pub struct SchemaVersionKey;

impl SchemaVersionKey {
    pub fn encode() -> Vec<u8> {
        global_key(SCHEMA_VERSION_TYPE_BYTE)
    }
}

pub struct MaxDatabaseIdKey;

impl MaxDatabaseIdKey {
    pub fn encode() -> Vec<u8> {
        global_key(MAX_DATABASE_ID_TYPE_BYTE)
    }
}

pub struct DataVersionKey;

impl DataVersionKey {
    pub fn encode() -> Vec<u8> {
        global_key(DATA_VERSION_TYPE_BYTE)
    }
}

pub struct RecoveryBlobJournalKey;

impl RecoveryBlobJournalKey {
    pub fn encode() -> Vec<u8> {
        global_key(RECOVERY_BLOB_JOURNAL_TYPE_BYTE)
    }
}

pub struct ActiveBlobJournalKey;

impl ActiveBlobJournalKey {
    pub fn encode() -> Vec<u8> {
        global_key(ACTIVE_BLOB_JOURNAL_TYPE_BYTE)
    }
}

/// Earliest time the tombstone sweeper may run again
pub struct EarliestSweepKey;

impl EarliestSweepKey {
    pub fn encode() -> Vec<u8> {
        global_key(EARLIEST_SWEEP_TYPE_BYTE)
    }
}

/// Earliest time the pre-close compaction may run again
pub struct EarliestCompactionKey;

impl EarliestCompactionKey {
    pub fn encode() -> Vec<u8> {
        global_key(EARLIEST_COMPACTION_TYPE_BYTE)
    }
}

/// `(origin, database name) -> database id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseNameKey {
    pub origin: String,
    pub database_name: String,
}

impl DatabaseNameKey {
    pub fn encode(origin: &str, database_name: &str) -> Vec<u8> {
        let mut out = Self::encode_min_key_for_origin(origin);
        encode_ordered_string(database_name, &mut out);
        out
    }

    pub fn encode_min_key_for_origin(origin: &str) -> Vec<u8> {
        let mut out = global_key(DATABASE_NAME_TYPE_BYTE);
        encode_ordered_string(origin, &mut out);
        out
    }

    pub fn encode_stop_key_for_origin(origin: &str) -> Vec<u8> {
        super::prefix_successor(&Self::encode_min_key_for_origin(origin))
    }

    pub fn decode(input: &mut &[u8]) -> Option<Self> {
        let prefix = KeyPrefix::decode(input)?;
        if prefix.key_type() != KeyType::GlobalMetadata
            || decode_byte(input)? != DATABASE_NAME_TYPE_BYTE
        {
            return None;
        }
        let origin = decode_ordered_string(input)?;
        let database_name = decode_ordered_string(input)?;
        Some(Self { origin, database_name })
    }
}

// =============================================================================
// Database metadata
// =============================================================================

/// Type bytes under `KeyPrefix(db, 0, 0)`
pub struct DatabaseMetaDataKey;

impl DatabaseMetaDataKey {
    pub const ORIGIN_NAME: u8 = 0;
    pub const DATABASE_NAME: u8 = 1;
    pub const USER_STRING_VERSION: u8 = 2;
    pub const MAX_OBJECT_STORE_ID: u8 = 3;
    pub const USER_VERSION: u8 = 4;
    pub const BLOB_KEY_GENERATOR_CURRENT_NUMBER: u8 = 5;
    pub const MAX_SIMPLE_METADATA_TYPE: u8 = 6;

    /// Blob number meaning "every blob of the database"
    pub const ALL_BLOBS_NUMBER: i64 = 1;
    pub const BLOB_NUMBER_GENERATOR_INITIAL_NUMBER: i64 = 2;
    /// Highest blob number the generator may hand out
    pub const MAX_BLOB_NUMBER: i64 = 1 << 56;
    pub const INVALID_BLOB_NUMBER: i64 = -1;

    pub fn encode(database_id: i64, meta_data_type: u8) -> Vec<u8> {
        let mut out = KeyPrefix::database(database_id).encode();
        out.push(meta_data_type);
        out
    }

    pub fn is_valid_blob_number(blob_number: i64) -> bool {
        (Self::BLOB_NUMBER_GENERATOR_INITIAL_NUMBER..Self::MAX_BLOB_NUMBER).contains(&blob_number)
    }
}

const OBJECT_STORE_META_DATA_TYPE_BYTE: u8 = 50;
const INDEX_META_DATA_TYPE_BYTE: u8 = 100;
const OBJECT_STORE_FREE_LIST_TYPE_BYTE: u8 = 150;
const INDEX_FREE_LIST_TYPE_BYTE: u8 = 151;
const OBJECT_STORE_NAMES_TYPE_BYTE: u8 = 200;
const INDEX_NAMES_TYPE_BYTE: u8 = 201;

const META_DATA_TYPE_MAXIMUM: u8 = 255;

/// `(db, object store id, field) -> value`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStoreMetaDataKey {
    pub object_store_id: i64,
    pub meta_data_type: u8,
}

impl ObjectStoreMetaDataKey {
    pub const NAME: u8 = 0;
    pub const KEY_PATH: u8 = 1;
    pub const AUTO_INCREMENT: u8 = 2;
    pub const EVICTABLE: u8 = 3;
    pub const LAST_VERSION: u8 = 4;
    pub const MAX_INDEX_ID: u8 = 5;
    pub const HAS_KEY_PATH: u8 = 6;
    pub const KEY_GENERATOR_CURRENT_NUMBER: u8 = 7;

    pub fn encode(database_id: i64, object_store_id: i64, meta_data_type: u8) -> Vec<u8> {
        let mut out = KeyPrefix::database(database_id).encode();
        out.push(OBJECT_STORE_META_DATA_TYPE_BYTE);
        encode_ordered_int(object_store_id, &mut out);
        out.push(meta_data_type);
        out
    }

    /// Sorts after every object store metadata key of the database
    pub fn encode_max_key(database_id: i64) -> Vec<u8> {
        Self::encode(database_id, i64::MAX, META_DATA_TYPE_MAXIMUM)
    }

    /// Sorts after every metadata key of one object store
    pub fn encode_max_key_for_store(database_id: i64, object_store_id: i64) -> Vec<u8> {
        Self::encode(database_id, object_store_id, META_DATA_TYPE_MAXIMUM)
    }

    pub fn decode(input: &mut &[u8]) -> Option<Self> {
        let prefix = KeyPrefix::decode(input)?;
        if prefix.key_type() != KeyType::DatabaseMetadata
            || decode_byte(input)? != OBJECT_STORE_META_DATA_TYPE_BYTE
        {
            return None;
        }
        let object_store_id = decode_ordered_int(input)?;
        let meta_data_type = decode_byte(input)?;
        Some(Self { object_store_id, meta_data_type })
    }
}

/// `(db, object store id, index id, field) -> value`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMetaDataKey {
    pub object_store_id: i64,
    pub index_id: i64,
    pub meta_data_type: u8,
}

impl IndexMetaDataKey {
    pub const NAME: u8 = 0;
    pub const UNIQUE: u8 = 1;
    pub const KEY_PATH: u8 = 2;
    pub const MULTI_ENTRY: u8 = 3;

    pub fn encode(database_id: i64, object_store_id: i64, index_id: i64, meta_data_type: u8) -> Vec<u8> {
        let mut out = KeyPrefix::database(database_id).encode();
        out.push(INDEX_META_DATA_TYPE_BYTE);
        encode_ordered_int(object_store_id, &mut out);
        encode_ordered_int(index_id, &mut out);
        out.push(meta_data_type);
        out
    }

    /// Sorts after every index metadata key of one object store
    pub fn encode_max_key(database_id: i64, object_store_id: i64) -> Vec<u8> {
        Self::encode(database_id, object_store_id, i64::MAX, META_DATA_TYPE_MAXIMUM)
    }

    /// Sorts after every metadata key of one index
    pub fn encode_max_key_for_index(database_id: i64, object_store_id: i64, index_id: i64) -> Vec<u8> {
        Self::encode(database_id, object_store_id, index_id, META_DATA_TYPE_MAXIMUM)
    }

    pub fn decode(input: &mut &[u8]) -> Option<Self> {
        let prefix = KeyPrefix::decode(input)?;
        if prefix.key_type() != KeyType::DatabaseMetadata
            || decode_byte(input)? != INDEX_META_DATA_TYPE_BYTE
        {
            return None;
        }
        let object_store_id = decode_ordered_int(input)?;
        let index_id = decode_ordered_int(input)?;
        let meta_data_type = decode_byte(input)?;
        Some(Self { object_store_id, index_id, meta_data_type })
    }
}

/// Legacy free-list of object store ids; only ever deleted now
pub struct ObjectStoreFreeListKey;

impl ObjectStoreFreeListKey {
    pub fn encode(database_id: i64, object_store_id: i64) -> Vec<u8> {
        let mut out = KeyPrefix::database(database_id).encode();
        out.push(OBJECT_STORE_FREE_LIST_TYPE_BYTE);
        encode_ordered_int(object_store_id, &mut out);
        out
    }
}

/// Legacy free-list of index ids; only ever deleted now
pub struct IndexFreeListKey;

impl IndexFreeListKey {
    pub fn encode(database_id: i64, object_store_id: i64, index_id: i64) -> Vec<u8> {
        let mut out = KeyPrefix::database(database_id).encode();
        out.push(INDEX_FREE_LIST_TYPE_BYTE);
        encode_ordered_int(object_store_id, &mut out);
        encode_ordered_int(index_id, &mut out);
        out
    }

    pub fn encode_max_key(database_id: i64, object_store_id: i64) -> Vec<u8> {
        Self::encode(database_id, object_store_id, i64::MAX)
    }
}

/// `(db, object store name) -> object store id`
pub struct ObjectStoreNamesKey;

impl ObjectStoreNamesKey {
    pub fn encode(database_id: i64, object_store_name: &str) -> Vec<u8> {
        let mut out = KeyPrefix::database(database_id).encode();
        out.push(OBJECT_STORE_NAMES_TYPE_BYTE);
        encode_ordered_string(object_store_name, &mut out);
        out
    }

    pub fn decode(input: &mut &[u8]) -> Option<String> {
        let prefix = KeyPrefix::decode(input)?;
        if prefix.key_type() != KeyType::DatabaseMetadata
            || decode_byte(input)? != OBJECT_STORE_NAMES_TYPE_BYTE
        {
            return None;
        }
        decode_ordered_string(input)
    }
}

/// `(db, object store id, index name) -> index id`
pub struct IndexNamesKey;

impl IndexNamesKey {
    pub fn encode(database_id: i64, object_store_id: i64, index_name: &str) -> Vec<u8> {
        let mut out = KeyPrefix::database(database_id).encode();
        out.push(INDEX_NAMES_TYPE_BYTE);
        encode_ordered_int(object_store_id, &mut out);
        encode_ordered_string(index_name, &mut out);
        out
    }
}

// =============================================================================
// Data keys
// =============================================================================

fn data_key(database_id: i64, object_store_id: i64, index_id: i64, encoded_user_key: &[u8]) -> Vec<u8> {
    let mut out = KeyPrefix::new(database_id, object_store_id, index_id).encode();
    out.extend_from_slice(encoded_user_key);
    out
}

fn decode_data_key(input: &mut &[u8], index_id: i64) -> Option<(KeyPrefix, Vec<u8>)> {
    let prefix = KeyPrefix::decode(input)?;
    if prefix.index_id != index_id {
        return None;
    }
    let encoded = input.to_vec();
    IdbKey::decode_exact(&encoded)?;
    *input = &[];
    Some((prefix, encoded))
}

/// `(db, os, user key) -> (version, value bytes)`
pub struct ObjectStoreDataKey;

impl ObjectStoreDataKey {
    pub fn encode(database_id: i64, object_store_id: i64, user_key: &IdbKey) -> Vec<u8> {
        Self::encode_encoded(database_id, object_store_id, &user_key.encode())
    }

    pub fn encode_encoded(database_id: i64, object_store_id: i64, encoded_user_key: &[u8]) -> Vec<u8> {
        data_key(database_id, object_store_id, KeyPrefix::OBJECT_STORE_DATA_INDEX_ID, encoded_user_key)
    }

    /// Sorts before every record of the store
    pub fn encode_min_key(database_id: i64, object_store_id: i64) -> Vec<u8> {
        KeyPrefix::new(database_id, object_store_id, KeyPrefix::OBJECT_STORE_DATA_INDEX_ID).encode()
    }

    /// Sorts after every record of the store
    pub fn encode_max_key(database_id: i64, object_store_id: i64) -> Vec<u8> {
        let mut out = Self::encode_min_key(database_id, object_store_id);
        out.push(PAST_KEY_SENTINEL);
        out
    }

    /// The user key of a full data key
    pub fn decode_user_key(bytes: &[u8]) -> Option<IdbKey> {
        let mut input = bytes;
        let (_, encoded) = decode_data_key(&mut input, KeyPrefix::OBJECT_STORE_DATA_INDEX_ID)?;
        IdbKey::decode_exact(&encoded)
    }
}

/// `(db, os, user key) -> current record version`
pub struct ExistsEntryKey;

impl ExistsEntryKey {
    pub fn encode(database_id: i64, object_store_id: i64, user_key: &IdbKey) -> Vec<u8> {
        Self::encode_encoded(database_id, object_store_id, &user_key.encode())
    }

    pub fn encode_encoded(database_id: i64, object_store_id: i64, encoded_user_key: &[u8]) -> Vec<u8> {
        data_key(database_id, object_store_id, KeyPrefix::EXISTS_ENTRY_INDEX_ID, encoded_user_key)
    }

    pub fn encode_min_key(database_id: i64, object_store_id: i64) -> Vec<u8> {
        KeyPrefix::new(database_id, object_store_id, KeyPrefix::EXISTS_ENTRY_INDEX_ID).encode()
    }
}

/// `(db, os, user key) -> encoded external objects`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntryKey {
    pub database_id: i64,
    pub object_store_id: i64,
    pub encoded_user_key: Vec<u8>,
}

impl BlobEntryKey {
    pub fn encode_encoded(database_id: i64, object_store_id: i64, encoded_user_key: &[u8]) -> Vec<u8> {
        data_key(database_id, object_store_id, KeyPrefix::BLOB_ENTRY_INDEX_ID, encoded_user_key)
    }

    pub fn encode(&self) -> Vec<u8> {
        Self::encode_encoded(self.database_id, self.object_store_id, &self.encoded_user_key)
    }

    pub fn encode_min_key_for_object_store(database_id: i64, object_store_id: i64) -> Vec<u8> {
        KeyPrefix::new(database_id, object_store_id, KeyPrefix::BLOB_ENTRY_INDEX_ID).encode()
    }

    pub fn encode_stop_key_for_object_store(database_id: i64, object_store_id: i64) -> Vec<u8> {
        KeyPrefix::new(database_id, object_store_id, KeyPrefix::BLOB_ENTRY_INDEX_ID + 1).encode()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut input = bytes;
        let (prefix, encoded_user_key) = decode_data_key(&mut input, KeyPrefix::BLOB_ENTRY_INDEX_ID)?;
        Some(Self {
            database_id: prefix.database_id,
            object_store_id: prefix.object_store_id,
            encoded_user_key,
        })
    }

    /// The blob entry key for a full object store data key
    pub fn from_object_store_data_key(bytes: &[u8]) -> Option<Self> {
        let mut input = bytes;
        let (prefix, encoded_user_key) =
            decode_data_key(&mut input, KeyPrefix::OBJECT_STORE_DATA_INDEX_ID)?;
        Some(Self {
            database_id: prefix.database_id,
            object_store_id: prefix.object_store_id,
            encoded_user_key,
        })
    }

    /// The object store data key for a full blob entry key
    pub fn reencode_to_object_store_data_key(bytes: &[u8]) -> Option<Vec<u8>> {
        let entry = Self::decode(bytes)?;
        Some(ObjectStoreDataKey::encode_encoded(
            entry.database_id,
            entry.object_store_id,
            &entry.encoded_user_key,
        ))
    }
}

/// `(db, os, index, index key, primary key) -> (version, primary key)`
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDataKey {
    pub database_id: i64,
    pub object_store_id: i64,
    pub index_id: i64,
    pub user_key: IdbKey,
    pub primary_key: Option<IdbKey>,
}

impl IndexDataKey {
    pub fn encode(
        database_id: i64,
        object_store_id: i64,
        index_id: i64,
        encoded_user_key: &[u8],
        encoded_primary_key: &[u8],
    ) -> Vec<u8> {
        let mut out = Self::encode_user_key_prefix(database_id, object_store_id, index_id, encoded_user_key);
        out.extend_from_slice(encoded_primary_key);
        out
    }

    /// Every entry for `encoded_user_key` starts with these bytes and
    /// sorts at or after them
    pub fn encode_user_key_prefix(
        database_id: i64,
        object_store_id: i64,
        index_id: i64,
        encoded_user_key: &[u8],
    ) -> Vec<u8> {
        data_key(database_id, object_store_id, index_id, encoded_user_key)
    }

    /// Sorts after every entry for `encoded_user_key`
    pub fn encode_past_user_key(
        database_id: i64,
        object_store_id: i64,
        index_id: i64,
        encoded_user_key: &[u8],
    ) -> Vec<u8> {
        let mut out = Self::encode_user_key_prefix(database_id, object_store_id, index_id, encoded_user_key);
        out.push(PAST_KEY_SENTINEL);
        out
    }

    pub fn encode_min_key(database_id: i64, object_store_id: i64, index_id: i64) -> Vec<u8> {
        KeyPrefix::new(database_id, object_store_id, index_id).encode()
    }

    pub fn encode_max_key(database_id: i64, object_store_id: i64, index_id: i64) -> Vec<u8> {
        let mut out = Self::encode_min_key(database_id, object_store_id, index_id);
        out.push(PAST_KEY_SENTINEL);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut input = bytes;
        let prefix = KeyPrefix::decode(&mut input)?;
        if prefix.key_type() != KeyType::IndexData {
            return None;
        }
        let user_key = IdbKey::decode(&mut input)?;
        let primary_key = if input.is_empty() {
            None
        } else {
            Some(IdbKey::decode(&mut input)?)
        };
        if !input.is_empty() {
            return None;
        }
        Some(Self {
            database_id: prefix.database_id,
            object_store_id: prefix.object_store_id,
            index_id: prefix.index_id,
            user_key,
            primary_key,
        })
    }
}
