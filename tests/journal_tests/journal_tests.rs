//! Tests for blob journals and blob files
//!
//! These tests verify:
//! - Journal values decode and reject malformed entries
//! - Journals persist through engine transactions
//! - Journal cleaning deletes single files and whole databases
//! - Blob file layout
//! - The filesystem blob writer, inline and on worker threads
//! - Active blob reference counting

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use atlas_idb::active_blobs::ActiveBlobRegistry;
use atlas_idb::blob::{
    blob_directory_name, blob_file_name, BlobStorageContext, FsBlobStorage, WriteBlobToFileResult,
};
use atlas_idb::coding::keys::{DatabaseMetaDataKey, RecoveryBlobJournalKey};
use atlas_idb::journal::{
    append_blobs_to_journal, clean_up_blob_journal_entries, clear_blob_journal, decode_blob_journal,
    encode_blob_journal, get_blob_journal, merge_database_into_journal, BlobJournalEntry,
};
use atlas_idb::kv::{KvStore, KvWrite, LevelDbTransaction, MemStore};
use bytes::Bytes;
use crossbeam::channel;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_engine() -> Arc<dyn KvStore> {
    Arc::new(MemStore::new())
}

fn create_blob_file(root: &Path, database_id: i64, blob_number: i64) {
    let path = blob_file_name(root, database_id, blob_number);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, b"blob bytes").unwrap();
}

fn write_blob(storage: &FsBlobStorage, payload: &[u8], path: &Path) -> WriteBlobToFileResult {
    let (sender, receiver) = channel::bounded(1);
    storage.write_blob_to_file(
        Bytes::copy_from_slice(payload),
        path.to_path_buf(),
        true,
        None,
        Box::new(move |result| {
            sender.send(result).unwrap();
        }),
    );
    receiver.recv_timeout(Duration::from_secs(10)).unwrap()
}

// =============================================================================
// Encoding Tests
// =============================================================================

#[test]
fn test_journal_decodes_entries_in_order() {
    let journal = vec![
        BlobJournalEntry::new(1, 2),
        BlobJournalEntry::all_blobs(3),
        BlobJournalEntry::new(1, 300),
    ];

    let decoded = decode_blob_journal(&encode_blob_journal(&journal)).unwrap();

    assert_eq!(decoded, journal);
    assert!(decoded[1].is_all_blobs());
}

#[test]
fn test_journal_rejects_invalid_entries() {
    // Database id zero
    assert!(decode_blob_journal(&encode_blob_journal(&[BlobJournalEntry::new(0, 5)])).is_none());
    // Blob number below the generator's first number and not the all-blobs marker
    assert!(decode_blob_journal(&encode_blob_journal(&[BlobJournalEntry::new(1, 0)])).is_none());
    // Dangling database id without a blob number
    let mut truncated = encode_blob_journal(&[BlobJournalEntry::new(1, 2)]);
    truncated.truncate(1);
    assert!(decode_blob_journal(&truncated).is_none());
}

// =============================================================================
// Persisted Journal Tests
// =============================================================================

#[test]
fn test_missing_journal_is_empty() {
    let engine = setup_engine();
    let txn = LevelDbTransaction::new(engine, Vec::new());

    assert!(get_blob_journal(&txn, &RecoveryBlobJournalKey::encode()).unwrap().is_empty());
}

#[test]
fn test_append_merge_and_clear_journal() {
    let engine = setup_engine();
    let key = RecoveryBlobJournalKey::encode();
    let mut txn = LevelDbTransaction::new(Arc::clone(&engine), Vec::new());

    append_blobs_to_journal(&mut txn, &key, &[BlobJournalEntry::new(1, 2)]).unwrap();
    append_blobs_to_journal(&mut txn, &key, &[BlobJournalEntry::new(1, 3)]).unwrap();
    merge_database_into_journal(&mut txn, &key, 4).unwrap();
    txn.commit(true).unwrap();

    let reader = LevelDbTransaction::new(Arc::clone(&engine), Vec::new());
    assert_eq!(
        get_blob_journal(&reader, &key).unwrap(),
        vec![
            BlobJournalEntry::new(1, 2),
            BlobJournalEntry::new(1, 3),
            BlobJournalEntry::all_blobs(4),
        ]
    );

    let mut txn = LevelDbTransaction::new(Arc::clone(&engine), Vec::new());
    clear_blob_journal(&mut txn, &key).unwrap();
    txn.commit(true).unwrap();
    assert!(get_blob_journal(&*engine, &key).unwrap().is_empty());
}

#[test]
fn test_undecodable_journal_is_corruption() {
    let engine = setup_engine();
    let key = RecoveryBlobJournalKey::encode();
    let mut txn = LevelDbTransaction::new(Arc::clone(&engine), Vec::new());
    txn.put(key.clone(), vec![0x05]).unwrap();

    let err = get_blob_journal(&txn, &key).unwrap_err();

    assert!(err.is_corruption());
}

// =============================================================================
// Cleaning Tests
// =============================================================================

#[test]
fn test_blob_file_layout() {
    let root = Path::new("/blobs");

    assert_eq!(blob_directory_name(root, 26), Path::new("/blobs/1a"));
    assert_eq!(blob_file_name(root, 26, 0x1234), Path::new("/blobs/1a/34/1234"));
    assert_eq!(blob_file_name(root, 1, 2), Path::new("/blobs/1/02/2"));
}

#[test]
fn test_clean_single_entries() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    create_blob_file(root, 1, 2);
    create_blob_file(root, 1, 3);

    clean_up_blob_journal_entries(Some(root), &[BlobJournalEntry::new(1, 2)]).unwrap();

    assert!(!blob_file_name(root, 1, 2).exists());
    assert!(blob_file_name(root, 1, 3).exists());
}

#[test]
fn test_clean_all_blobs_of_database() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    create_blob_file(root, 1, 2);
    create_blob_file(root, 1, 700);
    create_blob_file(root, 2, 2);

    clean_up_blob_journal_entries(Some(root), &[BlobJournalEntry::all_blobs(1)]).unwrap();

    assert!(!blob_directory_name(root, 1).exists());
    assert!(blob_file_name(root, 2, 2).exists());
}

#[test]
fn test_clean_missing_files_succeeds() {
    let temp_dir = TempDir::new().unwrap();

    clean_up_blob_journal_entries(
        Some(temp_dir.path()),
        &[BlobJournalEntry::new(9, 2), BlobJournalEntry::all_blobs(9)],
    )
    .unwrap();
    clean_up_blob_journal_entries(None, &[BlobJournalEntry::new(1, 2)]).unwrap();
}

// =============================================================================
// Blob Writer Tests
// =============================================================================

#[test]
fn test_inline_writer_creates_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = blob_file_name(temp_dir.path(), 1, 2);
    let storage = FsBlobStorage::inline();

    assert_eq!(write_blob(&storage, b"payload", &path), WriteBlobToFileResult::Success);
    assert_eq!(fs::read(&path).unwrap(), b"payload");
}

#[test]
fn test_writer_detects_existing_file_mismatch() {
    let temp_dir = TempDir::new().unwrap();
    let path = blob_file_name(temp_dir.path(), 1, 5);
    let storage = FsBlobStorage::new(2);

    assert_eq!(write_blob(&storage, b"first", &path), WriteBlobToFileResult::Success);
    assert_eq!(write_blob(&storage, b"first", &path), WriteBlobToFileResult::Success);
    assert_eq!(write_blob(&storage, b"second", &path), WriteBlobToFileResult::AlreadyExistsMismatch);
    assert_eq!(fs::read(&path).unwrap(), b"first");
}

#[test]
fn test_writer_sets_modification_time() {
    let temp_dir = TempDir::new().unwrap();
    let path = blob_file_name(temp_dir.path(), 1, 6);
    let storage = FsBlobStorage::inline();
    let modified = UNIX_EPOCH + Duration::from_secs(1_500_000_000);

    let (sender, receiver) = channel::bounded(1);
    storage.write_blob_to_file(
        Bytes::from_static(b"dated"),
        path.clone(),
        false,
        Some(modified),
        Box::new(move |result| sender.send(result).unwrap()),
    );

    assert_eq!(receiver.recv().unwrap(), WriteBlobToFileResult::Success);
    assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), modified);
}

#[test]
fn test_writer_serializes_handle_token() {
    let storage = FsBlobStorage::new(1);
    let (sender, receiver) = channel::bounded(1);

    storage.serialize_handle(Bytes::from_static(b"token"), Box::new(move |bytes| sender.send(bytes).unwrap()));

    assert_eq!(receiver.recv_timeout(Duration::from_secs(10)).unwrap(), b"token".to_vec());
}

// =============================================================================
// Active Blob Registry Tests
// =============================================================================

#[test]
fn test_released_blob_reported_only_after_delete() {
    let registry = ActiveBlobRegistry::new();
    registry.mark_blob_active(1, 2);
    registry.mark_blob_active(1, 2);

    assert!(registry.mark_blob_deleted_and_check_if_referenced(1, 2));
    assert!(registry.release_blob(1, 2).is_empty());
    assert_eq!(registry.release_blob(1, 2), vec![(1, 2)]);
    assert!(!registry.has_references(1, 2));
}

#[test]
fn test_unreferenced_blob_is_not_tracked() {
    let registry = ActiveBlobRegistry::new();

    assert!(!registry.mark_blob_deleted_and_check_if_referenced(1, 2));

    registry.mark_blob_active(1, 3);
    assert!(registry.release_blob(1, 3).is_empty());
}

#[test]
fn test_deleted_database_reported_once_all_released() {
    let registry = ActiveBlobRegistry::new();
    registry.mark_blob_active(4, 2);
    registry.mark_blob_active(4, 3);

    assert!(registry.mark_database_deleted_and_check_if_referenced(4));
    assert!(registry.release_blob(4, 2).is_empty());
    assert_eq!(
        registry.release_blob(4, 3),
        vec![(4, DatabaseMetaDataKey::ALL_BLOBS_NUMBER)]
    );
}
