//! Tests for store maintenance
//!
//! These tests verify:
//! - Idle cleanup scheduling after tombstone-heavy transactions
//! - The tombstone sweeper in count and delete modes
//! - Pre-close task queues: due checks, completion and interruption

use std::sync::Arc;
use std::time::Duration;

use atlas_idb::maintenance::{
    CleanupScheduler, PreCloseTask, StopReason, SweepMode, SweepStats, TombstoneSweeper,
};
use atlas_idb::{BackingStore, Config, Database, Durability, IdbKey, IdbValue, KeyPath, KeyRange, Transaction, TransactionMode};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const STORE: i64 = 1;
const INDEX: i64 = 31;

fn begin(database: &Database, mode: TransactionMode) -> Transaction {
    let mut txn = database.create_transaction(Durability::Relaxed, mode).unwrap();
    txn.begin(Vec::new()).unwrap();
    txn
}

/// One live index entry plus `stale` entries whose records were rewritten
fn setup_database_with_stale_entries(store: &BackingStore, stale: usize) -> Database {
    let database = store.create_or_open_database("sweep").unwrap();
    let mut txn = begin(&database, TransactionMode::VersionChange);
    txn.set_database_version(1).unwrap();
    txn.create_object_store(STORE, "items", KeyPath::Null, false).unwrap();
    txn.create_index(STORE, INDEX, "by_tag", KeyPath::String("tag".to_string()), false, false)
        .unwrap();

    let live = txn.put_record(STORE, &IdbKey::string("live"), IdbValue::new("live")).unwrap();
    txn.put_index_data_for_record(STORE, INDEX, &IdbKey::string("tag"), &live).unwrap();
    for i in 0..stale {
        let key = IdbKey::number(i as f64);
        let record = txn.put_record(STORE, &key, IdbValue::new("old")).unwrap();
        txn.put_index_data_for_record(STORE, INDEX, &IdbKey::number(i as f64), &record)
            .unwrap();
        txn.put_record(STORE, &key, IdbValue::new("new")).unwrap();
    }
    txn.commit().unwrap();
    database
}

fn sweep(store: &BackingStore, mode: SweepMode) -> SweepStats {
    let mut sweeper = TombstoneSweeper::new(Arc::clone(store.engine()), mode).with_round_size(7);
    sweeper.set_metadata(&store.get_complete_metadata().unwrap());
    while !sweeper.run_round().unwrap() {}
    sweeper.stats()
}

fn setup_store_without_spacing(temp_dir: &TempDir) -> BackingStore {
    // Other tests in this binary share the process-wide spacing
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .global_maintenance_spacing(Duration::ZERO)
        .build();
    let (store, _) = BackingStore::open(config).unwrap();
    store
}

// =============================================================================
// Cleanup Scheduler Tests
// =============================================================================

#[test]
fn test_scheduler_waits_for_active_transactions() {
    let mut scheduler = CleanupScheduler::default();
    scheduler.on_transaction_start();
    scheduler.on_transaction_complete(true);
    scheduler.on_transaction_start();

    assert!(scheduler.is_pending());
    assert!(!scheduler.take_if_due(Duration::ZERO, true));

    scheduler.on_transaction_complete(false);
    assert!(scheduler.take_if_due(Duration::ZERO, false));
    assert!(!scheduler.is_pending());
}

#[test]
fn test_scheduler_respects_delay_unless_forced() {
    let mut scheduler = CleanupScheduler::default();
    scheduler.on_transaction_start();
    scheduler.on_transaction_complete(true);

    assert!(!scheduler.take_if_due(Duration::from_secs(3600), false));
    assert!(scheduler.take_if_due(Duration::from_secs(3600), true));
}

#[test]
fn test_scheduler_ignores_clean_transactions() {
    let mut scheduler = CleanupScheduler::default();
    scheduler.on_transaction_start();
    scheduler.on_transaction_complete(false);

    assert!(!scheduler.is_pending());
    assert!(!scheduler.take_if_due(Duration::ZERO, true));
}

// =============================================================================
// Tombstone Tests
// =============================================================================

#[test]
fn test_sweeper_counts_then_deletes() {
    let (store, _) = BackingStore::open(Config::builder().in_memory().build()).unwrap();
    setup_database_with_stale_entries(&store, 20);

    let counted = sweep(&store, SweepMode::Count);
    assert_eq!(counted.entries_seen, 21);
    assert_eq!(counted.tombstones_found, 20);
    assert_eq!(counted.tombstones_deleted, 0);
    assert!(counted.tombstone_bytes > 0);

    let deleted = sweep(&store, SweepMode::Delete);
    assert_eq!(deleted.tombstones_deleted, 20);

    assert_eq!(sweep(&store, SweepMode::Count).tombstones_found, 0);
}

#[test]
fn test_tombstone_heavy_read_schedules_cleanup() {
    let (store, _) = BackingStore::open(Config::builder().in_memory().build()).unwrap();
    let database = setup_database_with_stale_entries(&store, 1001);

    let mut txn = begin(&database, TransactionMode::ReadOnly);
    assert_eq!(txn.get_index_key_count(STORE, INDEX, &KeyRange::all()).unwrap(), 1);
    assert!(txn.tombstone_threshold_exceeded());
    assert!(!store.is_cleanup_pending());
    drop(txn);

    assert!(store.is_cleanup_pending());
    assert!(store.force_run_cleanup().unwrap());
    assert!(!store.is_cleanup_pending());
    assert_eq!(sweep(&store, SweepMode::Count).tombstones_found, 0);
}

#[test]
fn test_few_tombstones_do_not_schedule_cleanup() {
    let (store, _) = BackingStore::open(Config::builder().in_memory().build()).unwrap();
    let database = setup_database_with_stale_entries(&store, 10);

    let mut txn = begin(&database, TransactionMode::ReadOnly);
    txn.get_index_key_count(STORE, INDEX, &KeyRange::all()).unwrap();
    drop(txn);

    assert!(!store.is_cleanup_pending());
    assert!(!store.force_run_cleanup().unwrap());
}

#[test]
fn test_cleanup_deferred_while_transaction_active() {
    let (store, _) = BackingStore::open(Config::builder().in_memory().build()).unwrap();
    let database = setup_database_with_stale_entries(&store, 1001);
    {
        let mut txn = begin(&database, TransactionMode::ReadOnly);
        txn.get_index_key_count(STORE, INDEX, &KeyRange::all()).unwrap();
    }

    let active = begin(&database, TransactionMode::ReadOnly);
    assert!(!store.force_run_cleanup().unwrap());
    drop(active);

    assert!(store.force_run_cleanup().unwrap());
}

// =============================================================================
// Pre-close Queue Tests
// =============================================================================

#[test]
fn test_pre_close_queue_runs_due_tasks_once() {
    let temp_dir = TempDir::new().unwrap();
    let store = setup_store_without_spacing(&temp_dir);
    setup_database_with_stale_entries(&store, 5);

    let queue = store.pre_close_tasks().unwrap().unwrap();
    assert_eq!(queue.task_names(), vec!["tombstone-sweeper", "compaction"]);

    let outcome = queue.run().unwrap();
    assert_eq!(outcome.completed, vec!["tombstone-sweeper", "compaction"]);
    assert_eq!(outcome.stopped, None);
    assert_eq!(sweep(&store, SweepMode::Count).tombstones_found, 0);

    // Not due again until the intervals pass
    assert!(store.pre_close_tasks().unwrap().is_none());
}

#[test]
fn test_pre_close_queue_stops_on_new_connection() {
    let temp_dir = TempDir::new().unwrap();
    let store = setup_store_without_spacing(&temp_dir);
    setup_database_with_stale_entries(&store, 5);

    let queue = store.pre_close_tasks().unwrap().unwrap();
    queue.stop_handle().stop();
    let outcome = queue.run().unwrap();

    assert!(outcome.completed.is_empty());
    assert_eq!(outcome.stopped, Some(("tombstone-sweeper", StopReason::NewConnection)));
    assert_eq!(sweep(&store, SweepMode::Count).tombstones_found, 5);
}

#[test]
fn test_pre_close_queue_respects_budget() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .global_maintenance_spacing(Duration::ZERO)
        .pre_close_task_budget(Duration::ZERO)
        .build();
    let (store, _) = BackingStore::open(config).unwrap();

    let outcome = store.pre_close_tasks().unwrap().unwrap().run().unwrap();

    assert_eq!(outcome.stopped, Some(("tombstone-sweeper", StopReason::Timeout)));
}

#[test]
fn test_pre_close_interval_is_persisted() {
    let temp_dir = TempDir::new().unwrap();
    {
        let store = setup_store_without_spacing(&temp_dir);
        assert!(store.pre_close_tasks().unwrap().is_some());
    }

    let store = setup_store_without_spacing(&temp_dir);

    assert!(store.pre_close_tasks().unwrap().is_none());
}
