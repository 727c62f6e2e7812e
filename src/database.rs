//! Database handle
//!
//! A named database of the origin. The backing store owns the metadata;
//! handles and transactions share it and see schema changes immediately.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::backing_store::StoreInner;
use crate::coding::keys::{
    ActiveBlobJournalKey, DatabaseMetaDataKey, DatabaseNameKey, RecoveryBlobJournalKey,
};
use crate::coding::{encode_ordered_int, encode_ordered_string};
use crate::error::{IdbError, Result};
use crate::journal::merge_database_into_journal;
use crate::kv::{KvWrite, LevelDbTransaction, PartitionedLock, PartitionedLockId, RemoveRangeMode};
use crate::metadata::DatabaseMetadata;
use crate::reporting::{report_write_error, ErrorLocation};
use crate::transaction::{Durability, Transaction, TransactionMode};

/// Lock partition of whole databases
pub const DATABASE_LOCK_PARTITION: i32 = 0;
/// Lock partition of single object stores
pub const OBJECT_STORE_LOCK_PARTITION: i32 = 1;

#[derive(Clone)]
pub struct Database {
    store: Weak<StoreInner>,
    metadata: Arc<RwLock<DatabaseMetadata>>,
}

impl Database {
    pub(crate) fn new(store: Weak<StoreInner>, metadata: Arc<RwLock<DatabaseMetadata>>) -> Self {
        Self { store, metadata }
    }

    fn store(&self) -> Result<Arc<StoreInner>> {
        self.store
            .upgrade()
            .ok_or_else(|| IdbError::InvalidState("backing store closed".into()))
    }

    /// Snapshot of the current metadata
    pub fn metadata(&self) -> DatabaseMetadata {
        self.metadata.read().clone()
    }

    pub fn id(&self) -> Option<i64> {
        self.metadata.read().id
    }

    pub fn name(&self) -> String {
        self.metadata.read().name.clone()
    }

    pub fn version(&self) -> i64 {
        self.metadata.read().version
    }

    pub fn lock_id(&self) -> PartitionedLockId {
        let mut key = Vec::new();
        encode_ordered_string(&self.metadata.read().name, &mut key);
        PartitionedLockId { partition: DATABASE_LOCK_PARTITION, key }
    }

    pub fn object_store_lock_id(&self, object_store_id: i64) -> PartitionedLockId {
        let mut key = Vec::new();
        encode_ordered_int(self.id().unwrap_or(0), &mut key);
        encode_ordered_int(object_store_id, &mut key);
        PartitionedLockId { partition: OBJECT_STORE_LOCK_PARTITION, key }
    }

    /// A transaction in the `Created` state; call `begin` before use
    pub fn create_transaction(&self, durability: Durability, mode: TransactionMode) -> Result<Transaction> {
        let store = self.store()?;
        let database_id = self
            .id()
            .ok_or_else(|| IdbError::InvalidState("database was deleted".into()))?;
        Ok(Transaction::new(
            Arc::downgrade(&store),
            Arc::downgrade(&self.metadata),
            database_id,
            durability,
            mode,
        ))
    }

    /// Remove every key of the database and schedule its blobs for
    /// deletion. Blobs still referenced by readers wait in the active
    /// journal.
    pub fn delete_database(&self, locks: Vec<PartitionedLock>) -> Result<()> {
        let store = self.store()?;
        let (name, database_id) = {
            let metadata = self.metadata.read();
            match metadata.id {
                Some(id) => (metadata.name.clone(), id),
                None => return Ok(()),
            }
        };

        let mut txn = LevelDbTransaction::new(Arc::clone(&store.engine), locks);
        let start = DatabaseMetaDataKey::encode(database_id, DatabaseMetaDataKey::ORIGIN_NAME);
        let stop = DatabaseMetaDataKey::encode(database_id + 1, DatabaseMetaDataKey::ORIGIN_NAME);
        txn.remove_range(&start, &stop, RemoveRangeMode::DeferredWithCompaction)?;
        txn.remove(&DatabaseNameKey::encode(store.origin(), &name))?;

        let referenced = store.active_blobs.mark_database_deleted_and_check_if_referenced(database_id);
        if referenced {
            merge_database_into_journal(&mut txn, &ActiveBlobJournalKey::encode(), database_id)?;
        } else {
            merge_database_into_journal(&mut txn, &RecoveryBlobJournalKey::encode(), database_id)?;
        }

        txn.commit(true)
            .inspect_err(|_| report_write_error(ErrorLocation::DeleteDatabase))?;

        if store.is_in_memory() {
            // Every key of the database starts with its ordered id.
            let mut database_key_prefix = Vec::new();
            encode_ordered_int(database_id, &mut database_key_prefix);
            store
                .in_memory_external_objects
                .lock()
                .retain(|key, _| !key.starts_with(&database_key_prefix));
        }
        if !referenced {
            store.clean_recovery_journal_ignore_return();
        }

        tracing::debug!(database = %name, database_id, "deleted database");
        self.metadata.write().reset();
        store.forget_database(&name);
        Ok(())
    }
}
