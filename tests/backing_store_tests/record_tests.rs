//! Tests for Transaction record and schema operations
//!
//! These tests verify:
//! - Transaction lifecycle and mode checks
//! - Record put/get/delete and key counts
//! - Key generator state
//! - Index lookups that skip stale entries
//! - Schema changes and their rollback

use std::io;
use std::sync::Arc;

use atlas_idb::coding::keys::ObjectStoreMetaDataKey;
use atlas_idb::kv::{KvStore, WriteBatch};
use atlas_idb::metadata::KEY_GENERATOR_MAX_NUMBER;
use atlas_idb::{
    BackingStore, BlobWriteResult, Config, Database, Durability, IdbError, IdbKey, IdbValue, KeyPath, KeyRange, Transaction,
    TransactionMode, TransactionState,
};
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_store() -> BackingStore {
    let (store, _) = BackingStore::open(Config::builder().in_memory().build()).unwrap();
    store
}

/// Database with object store 1 ("people") and index 31 ("by_name") on it
fn setup_database(store: &BackingStore) -> Database {
    let database = store.create_or_open_database("test").unwrap();
    let mut txn = begin(&database, TransactionMode::VersionChange);
    txn.set_database_version(1).unwrap();
    txn.create_object_store(1, "people", KeyPath::String("id".to_string()), false)
        .unwrap();
    txn.create_index(1, 31, "by_name", KeyPath::String("name".to_string()), false, false)
        .unwrap();
    txn.commit().unwrap();
    database
}

fn begin(database: &Database, mode: TransactionMode) -> Transaction {
    let mut txn = database.create_transaction(Durability::Relaxed, mode).unwrap();
    txn.begin(Vec::new()).unwrap();
    txn
}

/// Collects formatted log lines
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn put_numbers(database: &Database, keys: &[f64]) {
    let mut txn = begin(database, TransactionMode::ReadWrite);
    for key in keys {
        txn.put_record(1, &IdbKey::number(*key), IdbValue::new(format!("v{}", key)))
            .unwrap();
    }
    txn.commit().unwrap();
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_rollback_twice_is_invalid_state() {
    let store = setup_store();
    let database = setup_database(&store);
    let mut txn = begin(&database, TransactionMode::ReadWrite);

    txn.rollback().unwrap();

    assert_eq!(txn.state(), TransactionState::RolledBack);
    assert!(matches!(txn.rollback(), Err(IdbError::InvalidState(_))));
}

#[test]
fn test_rollback_before_begin() {
    let store = setup_store();
    let database = setup_database(&store);
    let mut txn = database
        .create_transaction(Durability::Default, TransactionMode::ReadOnly)
        .unwrap();

    txn.rollback().unwrap();

    assert_eq!(txn.state(), TransactionState::RolledBack);
    assert!(txn.begin(Vec::new()).is_err());
}

#[test]
fn test_commit_after_commit_is_invalid_state() {
    let store = setup_store();
    let database = setup_database(&store);
    let mut txn = begin(&database, TransactionMode::ReadWrite);

    txn.commit().unwrap();

    assert_eq!(txn.state(), TransactionState::Committed);
    assert!(matches!(txn.commit(), Err(IdbError::InvalidState(_))));
    assert!(matches!(txn.rollback(), Err(IdbError::InvalidState(_))));
}

#[test]
fn test_phase_two_state_survives_failed_commit() {
    let store = setup_store();
    let database = setup_database(&store);
    let mut txn = begin(&database, TransactionMode::ReadWrite);
    txn.put_record(1, &IdbKey::number(1.0), IdbValue::new("pending")).unwrap();

    assert_eq!(txn.commit_phase_one().unwrap(), BlobWriteResult::RunPhaseTwoAndReturnResult);
    assert_eq!(txn.state(), TransactionState::CommittingPhaseOne);

    // Phase two cannot finish once the store is gone
    drop(store);
    assert!(matches!(txn.commit_phase_two(), Err(IdbError::InvalidState(_))));
    assert_eq!(txn.state(), TransactionState::CommittingPhaseTwo);
    assert!(matches!(txn.commit_phase_two(), Err(IdbError::InvalidState(_))));

    txn.rollback().unwrap();
    assert_eq!(txn.state(), TransactionState::RolledBack);
}

#[test]
fn test_read_only_transaction_rejects_writes() {
    let store = setup_store();
    let database = setup_database(&store);
    let mut txn = begin(&database, TransactionMode::ReadOnly);

    let err = txn.put_record(1, &IdbKey::number(1.0), IdbValue::new("x")).unwrap_err();

    assert!(matches!(err, IdbError::InvalidState(_)));
}

#[test]
fn test_operations_before_begin_are_invalid_state() {
    let store = setup_store();
    let database = setup_database(&store);
    let txn = database
        .create_transaction(Durability::Default, TransactionMode::ReadWrite)
        .unwrap();

    assert!(matches!(
        txn.get_record(1, &IdbKey::number(1.0)),
        Err(IdbError::InvalidState(_))
    ));
}

#[test]
fn test_dropped_transaction_discards_writes() {
    let store = setup_store();
    let database = setup_database(&store);
    {
        let mut txn = begin(&database, TransactionMode::ReadWrite);
        txn.put_record(1, &IdbKey::number(1.0), IdbValue::new("lost")).unwrap();
    }

    let txn = begin(&database, TransactionMode::ReadOnly);
    assert!(txn.get_record(1, &IdbKey::number(1.0)).unwrap().is_none());
}

// =============================================================================
// Record Tests
// =============================================================================

#[test]
fn test_put_and_get_record() {
    let store = setup_store();
    let database = setup_database(&store);
    let key = IdbKey::string("alice");

    let mut txn = begin(&database, TransactionMode::ReadWrite);
    let first = txn.put_record(1, &key, IdbValue::new("v1")).unwrap();
    let second = txn.put_record(1, &key, IdbValue::new("v2")).unwrap();
    txn.commit().unwrap();

    assert_eq!(first.primary_key, key.encode());
    assert!(second.version > first.version);

    let txn = begin(&database, TransactionMode::ReadOnly);
    assert_eq!(txn.get_record(1, &key).unwrap().unwrap().bits, b"v2");
    assert_eq!(txn.key_exists_in_object_store(1, &key).unwrap(), Some(second));
    assert!(txn.get_record(1, &IdbKey::string("bob")).unwrap().is_none());
}

#[test]
fn test_invalid_ids_and_keys_are_rejected() {
    let store = setup_store();
    let database = setup_database(&store);
    let mut txn = begin(&database, TransactionMode::ReadWrite);

    assert!(matches!(
        txn.get_record(0, &IdbKey::number(1.0)),
        Err(IdbError::InvalidArgument(_))
    ));
    assert!(matches!(
        txn.put_record(1, &IdbKey::number(f64::NAN), IdbValue::new("x")),
        Err(IdbError::InvalidArgument(_))
    ));
}

#[test]
fn test_delete_range_and_key_count() {
    let store = setup_store();
    let database = setup_database(&store);
    put_numbers(&database, &[1.0, 2.0, 3.0, 4.0, 5.0]);

    let mut txn = begin(&database, TransactionMode::ReadWrite);
    assert_eq!(txn.get_object_store_key_count(1, &KeyRange::all()).unwrap(), 5);

    txn.delete_range(
        1,
        &KeyRange::bound(IdbKey::number(2.0), IdbKey::number(4.0), false, true),
    )
    .unwrap();

    assert_eq!(txn.get_object_store_key_count(1, &KeyRange::all()).unwrap(), 3);
    assert!(txn.get_record(1, &IdbKey::number(2.0)).unwrap().is_none());
    assert!(txn.get_record(1, &IdbKey::number(3.0)).unwrap().is_none());
    assert!(txn.get_record(1, &IdbKey::number(4.0)).unwrap().is_some());
    assert!(txn.key_exists_in_object_store(1, &IdbKey::number(3.0)).unwrap().is_none());
}

#[test]
fn test_delete_empty_range_is_noop() {
    let store = setup_store();
    let database = setup_database(&store);
    put_numbers(&database, &[1.0]);

    let mut txn = begin(&database, TransactionMode::ReadWrite);
    txn.delete_range(1, &KeyRange::only(IdbKey::number(9.0))).unwrap();

    assert_eq!(txn.get_object_store_key_count(1, &KeyRange::all()).unwrap(), 1);
}

#[test]
fn test_clear_object_store() {
    let store = setup_store();
    let database = setup_database(&store);
    put_numbers(&database, &[1.0, 2.0, 3.0]);

    let mut txn = begin(&database, TransactionMode::ReadWrite);
    txn.clear_object_store(1).unwrap();
    txn.commit().unwrap();

    let mut txn = begin(&database, TransactionMode::ReadOnly);
    assert_eq!(txn.get_object_store_key_count(1, &KeyRange::all()).unwrap(), 0);
    // Metadata is kept
    assert!(database.metadata().object_stores.contains_key(&1));
}

// =============================================================================
// Key Generator Tests
// =============================================================================

#[test]
fn test_key_generator_never_moves_backwards_when_checked() {
    let store = setup_store();
    let database = setup_database(&store);
    let mut txn = begin(&database, TransactionMode::ReadWrite);

    assert_eq!(txn.get_key_generator_current_number(1).unwrap(), 1);

    txn.maybe_update_key_generator_current_number(1, 10, true).unwrap();
    txn.maybe_update_key_generator_current_number(1, 5, true).unwrap();
    assert_eq!(txn.get_key_generator_current_number(1).unwrap(), 10);

    txn.maybe_update_key_generator_current_number(1, 5, false).unwrap();
    assert_eq!(txn.get_key_generator_current_number(1).unwrap(), 5);
}

#[test]
fn test_key_generator_derived_from_huge_keys_is_exhausted() {
    let store = setup_store();
    let database = setup_database(&store);
    put_numbers(&database, &[3.0, 1e300]);

    // Stores written before the generator was persisted
    let mut batch = WriteBatch::new();
    batch.delete(ObjectStoreMetaDataKey::encode(
        database.id().unwrap(),
        1,
        ObjectStoreMetaDataKey::KEY_GENERATOR_CURRENT_NUMBER,
    ));
    store.engine().write(batch, true).unwrap();

    let txn = begin(&database, TransactionMode::ReadOnly);
    assert_eq!(txn.get_key_generator_current_number(1).unwrap(), KEY_GENERATOR_MAX_NUMBER + 1);
}

// =============================================================================
// Index Tests
// =============================================================================

#[test]
fn test_index_lookup_skips_stale_entries() {
    let store = setup_store();
    let database = setup_database(&store);
    let primary = IdbKey::number(1.0);

    let mut txn = begin(&database, TransactionMode::ReadWrite);
    let old = txn.put_record(1, &primary, IdbValue::new("ann")).unwrap();
    txn.put_index_data_for_record(1, 31, &IdbKey::string("ann"), &old).unwrap();
    // Renamed: the old index entry is left behind
    let new = txn.put_record(1, &primary, IdbValue::new("bea")).unwrap();
    txn.put_index_data_for_record(1, 31, &IdbKey::string("bea"), &new).unwrap();
    txn.commit().unwrap();

    let mut txn = begin(&database, TransactionMode::ReadWrite);
    assert_eq!(
        txn.get_first_primary_key_for_index_key(1, 31, &IdbKey::string("bea")).unwrap(),
        Some(primary)
    );
    assert_eq!(
        txn.get_first_primary_key_for_index_key(1, 31, &IdbKey::string("ann")).unwrap(),
        None
    );
    assert_eq!(txn.get_index_key_count(1, 31, &KeyRange::all()).unwrap(), 1);
}

// =============================================================================
// Schema Tests
// =============================================================================

#[test]
fn test_delete_missing_object_store_reports_its_location() {
    let store = setup_store();
    let database = setup_database(&store);
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .finish();

    let result = tracing::subscriber::with_default(subscriber, || {
        let mut txn = begin(&database, TransactionMode::VersionChange);
        txn.delete_object_store(2)
    });

    assert!(matches!(result, Err(IdbError::InternalInconsistency(_))));
    let logs = logs.contents();
    assert!(logs.contains("location=DeleteObjectStore"), "logs: {}", logs);
    assert!(!logs.contains("location=ClearObjectStore"), "logs: {}", logs);
}

#[test]
fn test_schema_changes_need_version_change() {
    let store = setup_store();
    let database = setup_database(&store);
    let mut txn = begin(&database, TransactionMode::ReadWrite);

    assert!(matches!(
        txn.create_object_store(2, "other", KeyPath::Null, false),
        Err(IdbError::InvalidState(_))
    ));
    assert!(matches!(txn.set_database_version(2), Err(IdbError::InvalidState(_))));
}

#[test]
fn test_negative_version_is_rejected() {
    let store = setup_store();
    let database = setup_database(&store);
    let mut txn = begin(&database, TransactionMode::VersionChange);

    assert!(matches!(txn.set_database_version(-5), Err(IdbError::InvalidArgument(_))));
}

#[test]
fn test_object_store_ids_must_grow() {
    let store = setup_store();
    let database = setup_database(&store);
    let mut txn = begin(&database, TransactionMode::VersionChange);

    txn.create_object_store(3, "third", KeyPath::Null, true).unwrap();

    assert!(txn.create_object_store(2, "second", KeyPath::Null, false).is_err());
}

#[test]
fn test_rollback_restores_metadata() {
    let store = setup_store();
    let database = setup_database(&store);
    let before = database.metadata();

    let mut txn = begin(&database, TransactionMode::VersionChange);
    txn.set_database_version(7).unwrap();
    txn.create_object_store(2, "pets", KeyPath::Null, true).unwrap();
    txn.rename_object_store(1, "humans").unwrap();
    txn.delete_index(1, 31).unwrap();
    assert_eq!(database.version(), 7);
    txn.rollback().unwrap();

    assert_eq!(database.metadata(), before);
    let reloaded = store.get_complete_metadata().unwrap();
    assert_eq!(reloaded[0].object_stores[&1].name, "people");
    assert_eq!(reloaded[0].version, 1);
}

#[test]
fn test_schema_changes_persist() {
    let store = setup_store();
    let database = setup_database(&store);

    let mut txn = begin(&database, TransactionMode::VersionChange);
    txn.set_database_version(2).unwrap();
    txn.rename_index(1, 31, "by_full_name").unwrap();
    txn.create_object_store(2, "pets", KeyPath::Null, true).unwrap();
    txn.commit().unwrap();

    let mut txn = begin(&database, TransactionMode::VersionChange);
    txn.delete_object_store(2).unwrap();
    txn.commit().unwrap();

    let reloaded = store.get_complete_metadata().unwrap();
    assert_eq!(reloaded.len(), 1);
    assert_eq!(reloaded[0].version, 2);
    assert_eq!(reloaded[0].object_stores[&1].indexes[&31].name, "by_full_name");
    assert!(!reloaded[0].object_stores.contains_key(&2));
    assert_eq!(reloaded[0], database.metadata());
}
