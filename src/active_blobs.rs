//! Active blob registry
//!
//! Tracks which persisted blobs are currently referenced by readers, so a
//! blob deleted by a transaction is only scheduled for file removal once the
//! last reader lets go of it.
//!
//! ## Lifecycle
//! ```text
//!  read record ──► BlobActivation ──mark_used()──► ActiveBlobGuard
//!                                                      │ drop
//!                                                      ▼
//!                                   release_blob() ──► report_blob_unused()
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Weak;

use parking_lot::Mutex;

use crate::backing_store::StoreInner;
use crate::coding::keys::DatabaseMetaDataKey;

#[derive(Debug, Default, Clone, Copy)]
struct BlobUse {
    references: usize,
    /// The record owning the blob was deleted while it was referenced
    deleted: bool,
}

#[derive(Debug, Default)]
struct RegistryState {
    in_use: HashMap<i64, HashMap<i64, BlobUse>>,
    deleted_databases: HashSet<i64>,
}

/// Reference counts of blobs handed out to readers
#[derive(Debug, Default)]
pub struct ActiveBlobRegistry {
    state: Mutex<RegistryState>,
}

impl ActiveBlobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_blob_active(&self, database_id: i64, blob_number: i64) {
        let mut state = self.state.lock();
        state
            .in_use
            .entry(database_id)
            .or_default()
            .entry(blob_number)
            .or_default()
            .references += 1;
    }

    /// Drop one reference. Returns the `(database_id, blob_number)` pairs
    /// that became unused and must be reported to the backing store.
    pub fn release_blob(&self, database_id: i64, blob_number: i64) -> Vec<(i64, i64)> {
        let mut state = self.state.lock();
        let mut unused = Vec::new();
        let database_deleted = state.deleted_databases.contains(&database_id);

        let Some(blobs) = state.in_use.get_mut(&database_id) else {
            return unused;
        };
        let Some(blob) = blobs.get_mut(&blob_number) else {
            return unused;
        };

        blob.references = blob.references.saturating_sub(1);
        if blob.references > 0 {
            return unused;
        }

        let blob_deleted = blob.deleted;
        blobs.remove(&blob_number);
        if blob_deleted && !database_deleted {
            unused.push((database_id, blob_number));
        }

        if blobs.is_empty() {
            state.in_use.remove(&database_id);
            if database_deleted {
                state.deleted_databases.remove(&database_id);
                unused.push((database_id, DatabaseMetaDataKey::ALL_BLOBS_NUMBER));
            }
        }
        unused
    }

    /// Returns true when some blob of the database is still referenced, in
    /// which case the whole database is reported once the last one goes.
    pub fn mark_database_deleted_and_check_if_referenced(&self, database_id: i64) -> bool {
        let mut state = self.state.lock();
        if !state.in_use.contains_key(&database_id) {
            return false;
        }
        state.deleted_databases.insert(database_id);
        true
    }

    /// Returns true when the blob is still referenced, in which case it is
    /// reported once the last reference goes.
    pub fn mark_blob_deleted_and_check_if_referenced(&self, database_id: i64, blob_number: i64) -> bool {
        let mut state = self.state.lock();
        match state
            .in_use
            .get_mut(&database_id)
            .and_then(|blobs| blobs.get_mut(&blob_number))
        {
            Some(blob) => {
                blob.deleted = true;
                true
            }
            None => false,
        }
    }

    pub fn has_references(&self, database_id: i64, blob_number: i64) -> bool {
        self.state
            .lock()
            .in_use
            .get(&database_id)
            .is_some_and(|blobs| blobs.contains_key(&blob_number))
    }

    /// Forget every reference without reporting anything
    pub fn force_shutdown(&self) {
        let mut state = self.state.lock();
        state.in_use.clear();
        state.deleted_databases.clear();
    }
}

// =============================================================================
// Activation handles
// =============================================================================

/// Attached to blobs read from an on-disk store. Calling `mark_used` pins the
/// blob file until the returned guard is dropped.
#[derive(Clone)]
pub struct BlobActivation {
    store: Weak<StoreInner>,
    database_id: i64,
    blob_number: i64,
}

impl BlobActivation {
    pub(crate) fn new(store: Weak<StoreInner>, database_id: i64, blob_number: i64) -> Self {
        Self { store, database_id, blob_number }
    }

    /// `None` once the backing store is gone
    pub fn mark_used(&self) -> Option<ActiveBlobGuard> {
        let store = self.store.upgrade()?;
        store.active_blobs.mark_blob_active(self.database_id, self.blob_number);
        Some(ActiveBlobGuard {
            store: self.store.clone(),
            database_id: self.database_id,
            blob_number: self.blob_number,
        })
    }
}

impl fmt::Debug for BlobActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobActivation")
            .field("database_id", &self.database_id)
            .field("blob_number", &self.blob_number)
            .finish()
    }
}

/// One live reference to a blob file
pub struct ActiveBlobGuard {
    store: Weak<StoreInner>,
    database_id: i64,
    blob_number: i64,
}

impl Drop for ActiveBlobGuard {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.release_blob_reference(self.database_id, self.blob_number);
        }
    }
}
