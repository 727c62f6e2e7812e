//! Tests for BackingStore
//!
//! These tests verify:
//! - A fresh store is stamped with the latest schema
//! - Database ids are never reused and names list only versioned databases
//! - Records survive a reopen
//! - Corrupt stores are destroyed once and reported as total data loss
//! - Older schemas migrate to v5, validating blob files on the way

use std::fs;
use std::sync::Arc;

use atlas_idb::blob::blob_file_name;
use atlas_idb::coding::encode_int;
use atlas_idb::coding::external::{decode_external_objects, encode_external_objects, encode_v3_external_objects};
use atlas_idb::coding::keys::{BlobEntryKey, SchemaVersionKey};
use atlas_idb::kv::{KvOptions, KvStore, KvView, LevelDbTransaction, LogStore, WriteBatch};
use atlas_idb::migration::{migrate_to_v4, remove_empty_blob_files};
use atlas_idb::{
    BackingStore, Config, DataLoss, Database, Durability, ExternalObject, ExternalObjectKind, IdbError, IdbKey,
    IdbValue, KeyPath, TransactionMode,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_config(temp_dir: &TempDir) -> Config {
    Config::builder().data_dir(temp_dir.path()).build()
}

fn setup_store(config: &Config) -> BackingStore {
    let (store, data_loss) = BackingStore::open(config.clone()).unwrap();
    assert_eq!(data_loss.status, DataLoss::None);
    store
}

/// Version 1 database holding object store 1 with a single record
fn setup_database_with_record(store: &BackingStore, name: &str, key: &IdbKey) -> Database {
    let database = store.create_or_open_database(name).unwrap();
    let mut txn = database
        .create_transaction(Durability::Strict, TransactionMode::VersionChange)
        .unwrap();
    txn.begin(Vec::new()).unwrap();
    txn.set_database_version(1).unwrap();
    txn.create_object_store(1, "items", KeyPath::Null, false).unwrap();
    txn.put_record(1, key, IdbValue::new(b"record".to_vec())).unwrap();
    txn.commit().unwrap();
    database
}

fn write_raw(store: &BackingStore, entries: Vec<(Vec<u8>, Vec<u8>)>) {
    let mut batch = WriteBatch::new();
    for (key, value) in entries {
        batch.put(key, value);
    }
    store.engine().write(batch, true).unwrap();
}

fn schema_version(store: &BackingStore) -> Option<Vec<u8>> {
    store.engine().get(&SchemaVersionKey::encode()).unwrap()
}

// =============================================================================
// Open Tests
// =============================================================================

#[test]
fn test_open_fresh_store_writes_latest_schema() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup_config(&temp_dir);

    let store = setup_store(&config);

    assert_eq!(schema_version(&store), Some(encode_int(5)));
    assert!(config.database_path().unwrap().exists());
    assert!(store.get_database_names().unwrap().is_empty());
}

#[test]
fn test_open_in_memory_store() {
    let (store, data_loss) = BackingStore::open(Config::builder().in_memory().build()).unwrap();

    assert_eq!(data_loss.status, DataLoss::None);
    assert!(store.is_in_memory());
    assert_eq!(schema_version(&store), Some(encode_int(5)));
}

#[test]
fn test_fresh_store_removes_stale_blob_directory() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup_config(&temp_dir);
    let leftover = blob_file_name(&config.blob_path().unwrap(), 1, 2);
    fs::create_dir_all(leftover.parent().unwrap()).unwrap();
    fs::write(&leftover, b"orphan").unwrap();

    let _store = setup_store(&config);

    assert!(!config.blob_path().unwrap().exists());
}

#[test]
fn test_records_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup_config(&temp_dir);
    let key = IdbKey::string("persisted");
    {
        let store = setup_store(&config);
        setup_database_with_record(&store, "notes", &key);
    }

    let store = setup_store(&config);
    let database = store.create_or_open_database("notes").unwrap();
    let mut txn = database
        .create_transaction(Durability::Default, TransactionMode::ReadOnly)
        .unwrap();
    txn.begin(Vec::new()).unwrap();

    assert_eq!(database.version(), 1);
    assert_eq!(database.metadata().object_stores[&1].name, "items");
    assert_eq!(txn.get_record(1, &key).unwrap().unwrap().bits, b"record");
}

// =============================================================================
// Database Tests
// =============================================================================

#[test]
fn test_names_list_only_versioned_databases() {
    let (store, _) = BackingStore::open(Config::builder().in_memory().build()).unwrap();
    setup_database_with_record(&store, "alpha", &IdbKey::number(1.0));
    store.create_or_open_database("beta").unwrap();

    assert_eq!(store.get_database_names().unwrap(), vec!["alpha".to_string()]);
    assert_eq!(
        store.get_database_names_and_versions().unwrap(),
        vec![("alpha".to_string(), 1)]
    );
}

#[test]
fn test_deleted_database_id_is_not_reused() {
    let (store, _) = BackingStore::open(Config::builder().in_memory().build()).unwrap();
    let database = setup_database_with_record(&store, "alpha", &IdbKey::number(1.0));
    let first_id = database.id().unwrap();

    database.delete_database(Vec::new()).unwrap();

    assert_eq!(database.id(), None);
    assert!(store.get_database_names().unwrap().is_empty());
    assert!(matches!(
        database.create_transaction(Durability::Default, TransactionMode::ReadOnly),
        Err(IdbError::InvalidState(_))
    ));

    let reopened = store.create_or_open_database("alpha").unwrap();
    assert!(reopened.id().unwrap() > first_id);
    assert!(reopened.metadata().object_stores.is_empty());
}

#[test]
fn test_open_database_twice_shares_metadata() {
    let (store, _) = BackingStore::open(Config::builder().in_memory().build()).unwrap();
    let first = setup_database_with_record(&store, "shared", &IdbKey::number(1.0));

    let second = store.create_or_open_database("shared").unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(second.version(), 1);
    assert!(second.metadata().object_stores.contains_key(&1));
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_corrupt_engine_reports_total_data_loss() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup_config(&temp_dir);
    {
        let store = setup_store(&config);
        setup_database_with_record(&store, "doomed", &IdbKey::number(1.0));
    }
    fs::write(config.database_path().unwrap().join("data.table"), b"garbage").unwrap();

    let (store, data_loss) = BackingStore::open(config.clone()).unwrap();

    assert_eq!(data_loss.status, DataLoss::Total);
    assert!(data_loss.message.starts_with("IndexedDB (database was corrupt): "));
    assert!(store.get_database_names().unwrap().is_empty());
    assert!(!config.corruption_info_path().unwrap().exists());
    drop(store);

    // The loss is reported once
    let (_store, data_loss) = BackingStore::open(config).unwrap();
    assert_eq!(data_loss.status, DataLoss::None);
}

#[test]
fn test_unknown_schema_version_is_treated_as_corruption() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup_config(&temp_dir);
    {
        let store = setup_store(&config);
        write_raw(&store, vec![(SchemaVersionKey::encode(), encode_int(99))]);
    }

    let (store, data_loss) = BackingStore::open(config).unwrap();

    assert_eq!(data_loss.status, DataLoss::Total);
    assert_eq!(schema_version(&store), Some(encode_int(5)));
}

// =============================================================================
// Migration Tests
// =============================================================================

#[test]
fn test_v3_store_migrates_to_v5() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup_config(&temp_dir);
    let blob_root = config.blob_path().unwrap();
    let key = IdbKey::string("photo");
    let database_id;
    {
        let store = setup_store(&config);
        let database = setup_database_with_record(&store, "photos", &key);
        database_id = database.id().unwrap();

        let v3_objects = encode_v3_external_objects(&[
            ExternalObject::stored_blob(2, "image/png".to_string(), 5),
            ExternalObject::stored_file(3, "text/plain".to_string(), 0, "empty.txt".to_string(), None),
        ]);
        write_raw(
            &store,
            vec![
                (BlobEntryKey::encode_encoded(database_id, 1, &key.encode()), v3_objects),
                (SchemaVersionKey::encode(), encode_int(3)),
            ],
        );
    }
    let image = blob_file_name(&blob_root, database_id, 2);
    let empty = blob_file_name(&blob_root, database_id, 3);
    fs::create_dir_all(image.parent().unwrap()).unwrap();
    fs::write(&image, b"12345").unwrap();
    fs::write(&empty, b"").unwrap();

    let store = setup_store(&config);

    assert_eq!(schema_version(&store), Some(encode_int(5)));
    let entry = store
        .engine()
        .get(&BlobEntryKey::encode_encoded(database_id, 1, &key.encode()))
        .unwrap()
        .unwrap();
    let objects = decode_external_objects(&entry).unwrap();
    assert_eq!(objects[0].size(), 5);
    assert_eq!(objects[1].kind(), ExternalObjectKind::File);
    assert_eq!(objects[1].size(), 0);
    assert!(objects[1].last_modified().is_some());
    assert!(image.exists());
    assert!(!empty.exists());
}

/// v3 store with one record whose blob entry holds `objects`
fn setup_v3_store(config: &Config, objects: &[ExternalObject]) -> (i64, Vec<u8>) {
    let store = setup_store(config);
    let key = IdbKey::string("photo");
    let database = setup_database_with_record(&store, "photos", &key);
    let database_id = database.id().unwrap();
    let entry_key = BlobEntryKey::encode_encoded(database_id, 1, &key.encode());
    write_raw(
        &store,
        vec![
            (entry_key.clone(), encode_v3_external_objects(objects)),
            (SchemaVersionKey::encode(), encode_int(3)),
        ],
    );
    (database_id, entry_key)
}

#[test]
fn test_v3_migration_keeps_blobs_without_files() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup_config(&temp_dir);
    let (_, entry_key) = setup_v3_store(&config, &[ExternalObject::stored_blob(2, "image/png".to_string(), 5)]);
    let excluded = Config::builder()
        .data_dir(temp_dir.path())
        .exclude_from_blob_validation("localhost")
        .build();

    let (store, data_loss) = BackingStore::open(excluded).unwrap();

    assert_eq!(data_loss.status, DataLoss::None);
    assert_eq!(store.get_database_names().unwrap(), vec!["photos".to_string()]);
    let objects = decode_external_objects(&store.engine().get(&entry_key).unwrap().unwrap()).unwrap();
    assert_eq!(objects[0].kind(), ExternalObjectKind::Blob);
    assert_eq!(objects[0].size(), 5);
}

#[test]
fn test_v4_migration_leaves_empty_files_until_commit() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup_config(&temp_dir);
    let blob_root = config.blob_path().unwrap();
    let v3_objects = [ExternalObject::stored_file(3, "text/plain".to_string(), 0, "empty.txt".to_string(), None)];
    let (database_id, entry_key) = setup_v3_store(&config, &v3_objects);
    let empty = blob_file_name(&blob_root, database_id, 3);
    fs::create_dir_all(empty.parent().unwrap()).unwrap();
    fs::write(&empty, b"").unwrap();

    // Run the upgrade by hand inside a transaction that never commits
    let engine: Arc<dyn KvStore> =
        Arc::new(LogStore::open(&config.database_path().unwrap(), &KvOptions::default()).unwrap());
    let mut txn = LevelDbTransaction::new(Arc::clone(&engine), Vec::new());
    let empty_blobs = migrate_to_v4(&mut txn, config.origin.as_str(), Some(&blob_root)).unwrap();
    txn.rollback();

    assert_eq!(empty_blobs, vec![empty.clone()]);
    assert!(empty.exists());
    assert_eq!(engine.get(&entry_key).unwrap(), Some(encode_v3_external_objects(&v3_objects)));

    // Removal tolerates files that are already gone
    remove_empty_blob_files(&empty_blobs);
    remove_empty_blob_files(&empty_blobs);
    assert!(!empty.exists());
}

/// v4 store whose only blob entry names a 5-byte blob that is not on disk
fn setup_v4_store_missing_blob(config: &Config) {
    let store = setup_store(config);
    let key = IdbKey::string("lost");
    let database = setup_database_with_record(&store, "photos", &key);
    let database_id = database.id().unwrap();

    let objects = encode_external_objects(&[ExternalObject::stored_blob(2, "image/png".to_string(), 5)]);
    write_raw(
        &store,
        vec![
            (BlobEntryKey::encode_encoded(database_id, 1, &key.encode()), objects),
            (SchemaVersionKey::encode(), encode_int(4)),
        ],
    );
}

#[test]
fn test_v5_migration_detects_missing_blob_file() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup_config(&temp_dir);
    setup_v4_store_missing_blob(&config);

    let (store, data_loss) = BackingStore::open(config).unwrap();

    assert_eq!(data_loss.status, DataLoss::Total);
    assert!(store.get_database_names().unwrap().is_empty());
}

#[test]
fn test_v5_migration_skips_excluded_host() {
    let temp_dir = TempDir::new().unwrap();
    let config = setup_config(&temp_dir);
    setup_v4_store_missing_blob(&config);
    let excluded = Config::builder()
        .data_dir(temp_dir.path())
        .exclude_from_blob_validation("localhost")
        .build();

    let (store, data_loss) = BackingStore::open(excluded).unwrap();

    assert_eq!(data_loss.status, DataLoss::None);
    assert_eq!(schema_version(&store), Some(encode_int(5)));
    assert_eq!(store.get_database_names().unwrap(), vec!["photos".to_string()]);
}
