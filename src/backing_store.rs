//! Backing Store
//!
//! Owns one origin's key-value engine and blob directory, and coordinates
//! everything that spans transactions.
//!
//! ## Responsibilities
//! - Open, verify, migrate and (after corruption) destroy-and-recreate
//! - Create, open, enumerate and delete databases
//! - Blob journals: recovery-journal cleaning, deferred while commits run
//! - Active blob bookkeeping for blobs handed out to readers
//! - Idle cleanup after tombstone-heavy scans
//!
//! ## On-disk layout
//! ```text
//! {data_dir}/
//!   ├── indexeddb.leveldb/     engine files
//!   ├── indexeddb.blob/        {db:x}/{n % 256:02x}/{n:x}
//!   └── corruption_info        present only after detected corruption
//! ```
//!
//! ## Journal cleaning
//! ```text
//! request ──► count >= max? ──yes──► clean now (or when commits drain)
//!                 │ no
//!                 ▼
//!        arm timer: min(initial window, max window - burst age)
//!                 │ tick() past deadline
//!                 ▼
//!        clean now (or when commits drain)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::active_blobs::ActiveBlobRegistry;
use crate::blob::{self, BlobStorageContext, FsBlobStorage};
use crate::coding::keys::{
    ActiveBlobJournalKey, DataVersionKey, DatabaseMetaDataKey, DatabaseNameKey,
    RecoveryBlobJournalKey, SchemaVersionKey,
};
use crate::coding::DataFormatVersion;
use crate::config::Config;
use crate::database::Database;
use crate::error::{IdbError, Result};
use crate::external_object::ExternalObject;
use crate::journal::{
    clean_up_blob_journal_entries, clear_blob_journal, get_blob_journal, update_blob_journal,
    BlobJournalEntry,
};
use crate::kv::{
    get_int, put_int, put_var_int, DefaultKvFactory, DirectTransaction, KvFactory, KvOptions, KvStore,
    LevelDbTransaction,
};
use crate::maintenance::{self, CleanupScheduler, PreCloseTaskQueue};
use crate::metadata::{
    get_database_names_and_versions, get_new_database_id, read_database_ids,
    read_metadata_for_database_name, DatabaseMetadata, DEFAULT_VERSION,
};
use crate::migration::{
    migrate_to_v4, migrate_to_v5, remove_empty_blob_files, EARLIEST_SUPPORTED_SCHEMA_VERSION, LATEST_KNOWN_SCHEMA_VERSION,
};
use crate::reporting::{report_read_error, report_write_error, ErrorLocation};

// =============================================================================
// Data loss
// =============================================================================

/// How much data an open discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLoss {
    None,
    Total,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLossInfo {
    pub status: DataLoss,
    pub message: String,
}

impl DataLossInfo {
    pub fn none() -> Self {
        Self { status: DataLoss::None, message: String::new() }
    }

    fn total(message: String) -> Self {
        Self { status: DataLoss::Total, message }
    }
}

/// Persisted next to the engine after corruption was detected
#[derive(Debug, Serialize, Deserialize)]
struct CorruptionInfo {
    message: String,
}

// =============================================================================
// Shared state
// =============================================================================

#[derive(Debug, Default)]
struct JournalCleaningState {
    committing_transactions: usize,
    execute_on_no_transactions: bool,
    aggregated_requests: usize,
    window_start: Option<Instant>,
    deadline: Option<Instant>,
}

/// State shared by the store handle, its databases, transactions, cursors
/// and blob activations
pub(crate) struct StoreInner {
    pub(crate) config: Config,
    pub(crate) engine: Arc<dyn KvStore>,
    blob_root: Option<PathBuf>,
    pub(crate) blob_storage: Arc<dyn BlobStorageContext>,
    pub(crate) active_blobs: ActiveBlobRegistry,
    /// Blobs of an in-memory store, keyed by object store data key
    pub(crate) in_memory_external_objects: Mutex<BTreeMap<Vec<u8>, Vec<ExternalObject>>>,
    journal_cleaning: Mutex<JournalCleaningState>,
    cleanup: Mutex<CleanupScheduler>,
    open_databases: Mutex<HashMap<String, Arc<RwLock<DatabaseMetadata>>>>,
    self_ref: Weak<StoreInner>,
}

impl StoreInner {
    pub(crate) fn weak(&self) -> Weak<StoreInner> {
        self.self_ref.clone()
    }

    pub(crate) fn is_in_memory(&self) -> bool {
        self.blob_root.is_none()
    }

    pub(crate) fn origin(&self) -> &str {
        &self.config.origin
    }

    pub(crate) fn blob_root(&self) -> Option<&Path> {
        self.blob_root.as_deref()
    }

    pub(crate) fn blob_file_name(&self, database_id: i64, blob_number: i64) -> Option<PathBuf> {
        self.blob_root
            .as_deref()
            .map(|root| blob::blob_file_name(root, database_id, blob_number))
    }

    // -------------------------------------------------------------------------
    // Initialization
    // -------------------------------------------------------------------------

    fn initialize(&self, clean_active_journal: bool) -> Result<()> {
        let location = ErrorLocation::Initialize;
        let mut txn = LevelDbTransaction::new(Arc::clone(&self.engine), Vec::new());

        let schema_version = get_int(&txn, &SchemaVersionKey::encode())?;
        let data_version = get_int(&txn, &DataVersionKey::encode())?;
        let mut empty_blobs = Vec::new();

        match schema_version {
            None => {
                put_int(&mut txn, SchemaVersionKey::encode(), LATEST_KNOWN_SCHEMA_VERSION)?;
                put_int(&mut txn, DataVersionKey::encode(), DataFormatVersion::CURRENT.encode())?;

                // Leftover blobs of a partially purged previous generation.
                if let Some(blob_root) = self.blob_root.as_deref() {
                    match fs::remove_dir_all(blob_root) {
                        Ok(()) => tracing::info!(path = %blob_root.display(), "removed stale blob directory"),
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => {
                            report_write_error(location);
                            return Err(err.into());
                        }
                    }
                }
            }
            Some(version) => {
                if !(EARLIEST_SUPPORTED_SCHEMA_VERSION..=LATEST_KNOWN_SCHEMA_VERSION).contains(&version) {
                    return Err(IdbError::Corruption(format!("unknown schema version {}", version)));
                }
                if let Some(data_version) = data_version {
                    if !DataFormatVersion::CURRENT.is_at_least(DataFormatVersion::decode(data_version)) {
                        return Err(IdbError::Corruption(format!("unknown data version {:#x}", data_version)));
                    }
                }

                if version < 4 {
                    empty_blobs = migrate_to_v4(&mut txn, self.origin(), self.blob_root())?;
                }
                if version < 5 {
                    migrate_to_v5(
                        &mut txn,
                        self.origin(),
                        self.config.origin_host(),
                        self.blob_root(),
                        &self.config.blob_validation_exclusions,
                    )?;
                }
                if data_version != Some(DataFormatVersion::CURRENT.encode()) {
                    put_int(&mut txn, DataVersionKey::encode(), DataFormatVersion::CURRENT.encode())?;
                }
            }
        }

        txn.commit(true).inspect_err(|_| report_write_error(location))?;
        remove_empty_blob_files(&empty_blobs);

        if clean_active_journal {
            // Nothing from a previous session can still hold a blob.
            self.clean_up_blob_journal(&ActiveBlobJournalKey::encode())?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Databases
    // -------------------------------------------------------------------------

    fn create_or_open_database(&self, name: &str) -> Result<Database> {
        let mut open_databases = self.open_databases.lock();
        if let Some(metadata) = open_databases.get(name) {
            return Ok(Database::new(self.weak(), Arc::clone(metadata)));
        }

        let mut metadata = read_metadata_for_database_name(&*self.engine, self.origin(), name)?;
        if metadata.id.is_none() {
            let mut txn = DirectTransaction::new(Arc::clone(&self.engine));
            let database_id = get_new_database_id(&mut txn)?;
            put_var_int(&mut txn, DatabaseNameKey::encode(self.origin(), name), database_id)?;
            put_var_int(
                &mut txn,
                DatabaseMetaDataKey::encode(database_id, DatabaseMetaDataKey::USER_VERSION),
                DEFAULT_VERSION,
            )?;
            put_var_int(
                &mut txn,
                DatabaseMetaDataKey::encode(database_id, DatabaseMetaDataKey::BLOB_KEY_GENERATOR_CURRENT_NUMBER),
                DatabaseMetaDataKey::BLOB_NUMBER_GENERATOR_INITIAL_NUMBER,
            )?;
            txn.commit()
                .inspect_err(|_| report_write_error(ErrorLocation::CreateOrOpenDatabase))?;

            tracing::debug!(database = name, database_id, "created database");
            metadata.id = Some(database_id);
        }

        let metadata = Arc::new(RwLock::new(metadata));
        open_databases.insert(name.to_string(), Arc::clone(&metadata));
        Ok(Database::new(self.weak(), metadata))
    }

    pub(crate) fn forget_database(&self, name: &str) {
        self.open_databases.lock().remove(name);
    }

    // -------------------------------------------------------------------------
    // Blob journals
    // -------------------------------------------------------------------------

    pub(crate) fn clean_up_blob_journal_entries(&self, journal: &[BlobJournalEntry]) -> Result<()> {
        clean_up_blob_journal_entries(self.blob_root(), journal)
    }

    /// Delete every file named by the journal at `key`, then clear it
    fn clean_up_blob_journal(&self, key: &[u8]) -> Result<()> {
        let mut txn = DirectTransaction::new(Arc::clone(&self.engine));
        let journal = get_blob_journal(&txn, key)?;
        if journal.is_empty() {
            return Ok(());
        }
        self.clean_up_blob_journal_entries(&journal)
            .inspect_err(|_| report_write_error(ErrorLocation::CleanUpBlobJournal))?;
        clear_blob_journal(&mut txn, key)?;
        txn.commit()?;
        tracing::debug!(entries = journal.len(), "cleaned blob journal");
        Ok(())
    }

    pub(crate) fn clean_recovery_journal_ignore_return(&self) {
        {
            let mut state = self.journal_cleaning.lock();
            // Not safe while a commit may still add to the journal.
            if state.committing_transactions > 0 {
                state.execute_on_no_transactions = true;
                return;
            }
            state.aggregated_requests = 0;
            state.deadline = None;
        }
        if let Err(err) = self.clean_up_blob_journal(&RecoveryBlobJournalKey::encode()) {
            tracing::warn!(%err, "recovery journal cleaning failed");
        }
    }

    pub(crate) fn start_journal_cleaning_timer(&self) {
        let now = Instant::now();
        let clean_now = {
            let mut state = self.journal_cleaning.lock();
            state.aggregated_requests += 1;
            if state.execute_on_no_transactions {
                return;
            }
            if state.aggregated_requests >= self.config.max_journal_clean_requests {
                state.deadline = None;
                true
            } else {
                let window_start = match (state.window_start, state.deadline) {
                    (Some(start), Some(_)) => start,
                    _ => now,
                };
                state.window_start = Some(window_start);
                let until_max = self
                    .config
                    .max_journal_cleaning_window
                    .saturating_sub(now.duration_since(window_start));
                let delay = self.config.initial_journal_cleaning_window.min(until_max);
                if delay.is_zero() {
                    state.deadline = None;
                    true
                } else {
                    state.deadline = Some(now + delay);
                    false
                }
            }
        };
        if clean_now {
            self.clean_recovery_journal_ignore_return();
        }
    }

    fn fire_journal_timer_if_due(&self, force: bool) -> bool {
        let due = {
            let mut state = self.journal_cleaning.lock();
            match state.deadline {
                Some(deadline) if force || Instant::now() >= deadline => {
                    state.deadline = None;
                    true
                }
                _ => false,
            }
        };
        if due {
            self.clean_recovery_journal_ignore_return();
        }
        due
    }

    pub(crate) fn will_commit_transaction(&self) {
        self.journal_cleaning.lock().committing_transactions += 1;
    }

    pub(crate) fn did_commit_transaction(&self) {
        let run_deferred = {
            let mut state = self.journal_cleaning.lock();
            state.committing_transactions = state.committing_transactions.saturating_sub(1);
            if state.committing_transactions == 0 && state.execute_on_no_transactions {
                state.execute_on_no_transactions = false;
                true
            } else {
                false
            }
        };
        if run_deferred {
            self.clean_recovery_journal_ignore_return();
        }
    }

    // -------------------------------------------------------------------------
    // Active blobs
    // -------------------------------------------------------------------------

    pub(crate) fn release_blob_reference(&self, database_id: i64, blob_number: i64) {
        for (database_id, blob_number) in self.active_blobs.release_blob(database_id, blob_number) {
            if let Err(err) = self.report_blob_unused(database_id, blob_number) {
                tracing::warn!(database_id, blob_number, %err, "failed to report unused blob");
            }
        }
    }

    /// Move a released blob (or every blob of a deleted database) from the
    /// active journal to the recovery journal
    pub(crate) fn report_blob_unused(&self, database_id: i64, blob_number: i64) -> Result<()> {
        let all_blobs = blob_number == DatabaseMetaDataKey::ALL_BLOBS_NUMBER;
        let mut txn = DirectTransaction::new(Arc::clone(&self.engine));
        let active = get_blob_journal(&txn, &ActiveBlobJournalKey::encode())?;
        let mut recovery = get_blob_journal(&txn, &RecoveryBlobJournalKey::encode())?;

        let mut remaining = Vec::with_capacity(active.len());
        let mut moved = false;
        for entry in active {
            let matches = entry.database_id == database_id
                && (all_blobs || entry.is_all_blobs() || entry.blob_number == blob_number);
            if !matches || moved {
                remaining.push(entry);
                continue;
            }
            if all_blobs {
                // Every entry of the database collapses into one marker below.
                continue;
            }
            recovery.push(BlobJournalEntry::new(database_id, blob_number));
            if entry.is_all_blobs() {
                remaining.push(entry);
            }
            moved = true;
        }
        if all_blobs {
            recovery.push(BlobJournalEntry::all_blobs(database_id));
        }

        update_blob_journal(&mut txn, &RecoveryBlobJournalKey::encode(), &recovery)?;
        update_blob_journal(&mut txn, &ActiveBlobJournalKey::encode(), &remaining)?;
        txn.commit()?;

        // Batched with whatever else becomes unused shortly.
        self.start_journal_cleaning_timer();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Transaction tracking
    // -------------------------------------------------------------------------

    pub(crate) fn on_transaction_start(&self) {
        self.cleanup.lock().on_transaction_start();
    }

    pub(crate) fn on_transaction_complete(&self, tombstone_threshold_exceeded: bool) {
        self.cleanup.lock().on_transaction_complete(tombstone_threshold_exceeded);
    }

    fn run_cleanup_if_due(&self, force: bool) -> Result<bool> {
        if !self.cleanup.lock().take_if_due(self.config.cleanup_delay, force) {
            return Ok(false);
        }
        let metadata = self.get_complete_metadata()?;
        maintenance::run_idle_cleanup(&self.engine, &metadata)?;
        Ok(true)
    }

    pub(crate) fn get_complete_metadata(&self) -> Result<Vec<DatabaseMetadata>> {
        let mut all = Vec::new();
        for (name, _) in read_database_ids(&*self.engine, self.origin())? {
            let metadata = read_metadata_for_database_name(&*self.engine, self.origin(), &name)?;
            if metadata.id.is_some() {
                all.push(metadata);
            }
        }
        Ok(all)
    }
}

// =============================================================================
// BackingStore
// =============================================================================

/// Handle to one origin's store. Cheap to clone.
#[derive(Clone)]
pub struct BackingStore {
    inner: Arc<StoreInner>,
}

impl BackingStore {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const CORRUPTION_MESSAGE_PREFIX: &'static str = "IndexedDB (database was corrupt): ";

    /// Open with the default engine and a filesystem blob writer
    pub fn open(config: Config) -> Result<(Self, DataLossInfo)> {
        Self::open_with(config, Arc::new(DefaultKvFactory), Arc::new(FsBlobStorage::default()))
    }

    /// Open or create the store
    ///
    /// Corruption found while opening is recorded next to the engine and the
    /// open is retried once; the retry destroys the store and reports total
    /// data loss.
    pub fn open_with(
        config: Config,
        factory: Arc<dyn KvFactory>,
        blob_storage: Arc<dyn BlobStorageContext>,
    ) -> Result<(Self, DataLossInfo)> {
        match Self::open_and_verify(&config, &factory, &blob_storage) {
            Err(err) if err.is_corruption() && !config.is_in_memory() => {
                tracing::error!(%err, origin = %config.origin, "backing store corrupt, recreating");
                Self::record_corruption_info(&config, &err.to_string())?;
                Self::open_and_verify(&config, &factory, &blob_storage)
            }
            other => other,
        }
    }

    /// On startup:
    /// 1. Create the data directory
    /// 2. Consume a corruption sidecar, destroying the store if present
    /// 3. Open the engine
    /// 4. Verify schema, migrate, clear the active journal
    fn open_and_verify(
        config: &Config,
        factory: &Arc<dyn KvFactory>,
        blob_storage: &Arc<dyn BlobStorageContext>,
    ) -> Result<(Self, DataLossInfo)> {
        let mut data_loss = DataLossInfo::none();

        // Step 1: Create data directory if it doesn't exist
        if let Some(data_dir) = config.data_dir.as_deref() {
            fs::create_dir_all(data_dir)?;
        }

        // Step 2: A previous run found corruption; start over
        if let Some(message) = Self::take_corruption_info(config)? {
            Self::destroy(config, factory.as_ref())?;
            data_loss = DataLossInfo::total(format!("{}{}", Self::CORRUPTION_MESSAGE_PREFIX, message));
            tracing::warn!(message = %data_loss.message, "destroyed corrupt backing store");
        }

        // Step 3: Open the engine
        let options = KvOptions {
            create_if_missing: true,
            paranoid_checks: config.paranoid_checks,
            max_open_files: config.max_open_files,
            write_buffer_size: config.write_buffer_size,
        };
        let engine = factory.open(config.database_path().as_deref(), &options)?;

        // Step 4: Verify and migrate
        let inner = Arc::new_cyclic(|self_ref| StoreInner {
            config: config.clone(),
            engine,
            blob_root: config.blob_path(),
            blob_storage: Arc::clone(blob_storage),
            active_blobs: ActiveBlobRegistry::new(),
            in_memory_external_objects: Mutex::new(BTreeMap::new()),
            journal_cleaning: Mutex::new(JournalCleaningState::default()),
            cleanup: Mutex::new(CleanupScheduler::default()),
            open_databases: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        });
        inner.initialize(!config.is_in_memory())?;

        tracing::info!(
            origin = %config.origin,
            in_memory = config.is_in_memory(),
            data_loss = ?data_loss.status,
            "opened backing store"
        );
        Ok((Self { inner }, data_loss))
    }

    /// Remove the engine files and the blob directory
    pub fn destroy(config: &Config, factory: &dyn KvFactory) -> Result<()> {
        if let Some(path) = config.database_path() {
            factory.destroy(&path)?;
        }
        if let Some(path) = config.blob_path() {
            match fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn record_corruption_info(config: &Config, message: &str) -> Result<()> {
        let Some(path) = config.corruption_info_path() else {
            return Ok(());
        };
        let info = CorruptionInfo { message: message.to_string() };
        fs::write(&path, bincode::serialize(&info)?)?;
        Ok(())
    }

    /// Read and delete the sidecar. An unreadable sidecar still counts.
    fn take_corruption_info(config: &Config) -> Result<Option<String>> {
        let Some(path) = config.corruption_info_path() else {
            return Ok(None);
        };
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        fs::remove_file(&path)?;
        let message = match bincode::deserialize::<CorruptionInfo>(&bytes) {
            Ok(info) => info.message,
            Err(_) => {
                report_read_error(ErrorLocation::ReadCorruptionInfo);
                String::new()
            }
        };
        Ok(Some(message))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn origin(&self) -> &str {
        self.inner.origin()
    }

    pub fn is_in_memory(&self) -> bool {
        self.inner.is_in_memory()
    }

    /// The underlying engine, for inspection tools
    pub fn engine(&self) -> &Arc<dyn KvStore> {
        &self.inner.engine
    }

    // =========================================================================
    // Databases
    // =========================================================================

    /// Open `name`, creating it with the default version if it is new
    pub fn create_or_open_database(&self, name: &str) -> Result<Database> {
        self.inner.create_or_open_database(name)
    }

    pub fn get_database_names(&self) -> Result<Vec<String>> {
        Ok(self
            .get_database_names_and_versions()?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    pub fn get_database_names_and_versions(&self) -> Result<Vec<(String, i64)>> {
        get_database_names_and_versions(&*self.inner.engine, self.origin())
    }

    /// Metadata of every database of the origin, read from the engine
    pub fn get_complete_metadata(&self) -> Result<Vec<DatabaseMetadata>> {
        self.inner.get_complete_metadata()
    }

    // =========================================================================
    // Blob journal cleaning
    // =========================================================================

    /// Clean the recovery journal right away (deferred while commits run)
    pub fn clean_recovery_journal(&self) {
        self.inner.clean_recovery_journal_ignore_return();
    }

    /// Fire a pending journal cleaning timer now. Returns false when no
    /// cleaning was scheduled.
    pub fn force_run_blob_cleanup(&self) -> bool {
        self.inner.fire_journal_timer_if_due(true)
    }

    pub fn is_blob_cleanup_pending(&self) -> bool {
        let state = self.inner.journal_cleaning.lock();
        state.deadline.is_some() || state.execute_on_no_transactions
    }

    pub fn committing_transaction_count(&self) -> usize {
        self.inner.journal_cleaning.lock().committing_transactions
    }

    /// Drive timers: journal cleaning and idle cleanup
    pub fn tick(&self) -> Result<()> {
        self.inner.fire_journal_timer_if_due(false);
        self.inner.run_cleanup_if_due(false)?;
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    pub fn is_cleanup_pending(&self) -> bool {
        self.inner.cleanup.lock().is_pending()
    }

    /// Run a pending idle cleanup now if no transaction is active
    pub fn force_run_cleanup(&self) -> Result<bool> {
        self.inner.run_cleanup_if_due(true)
    }

    /// Tasks to run once the last connection closes, or `None` when none are
    /// due yet
    pub fn pre_close_tasks(&self) -> Result<Option<PreCloseTaskQueue>> {
        maintenance::build_pre_close_queue(&self.inner)
    }

    /// Approximate bytes used by the store
    pub fn size(&self) -> Result<u64> {
        match self.inner.config.data_dir.as_deref() {
            Some(data_dir) => Ok(directory_size(data_dir)?),
            None => {
                let blobs: u64 = self
                    .inner
                    .in_memory_external_objects
                    .lock()
                    .values()
                    .flatten()
                    .filter_map(|object| object.payload().map(|payload| payload.len() as u64))
                    .sum();
                Ok(self.inner.engine.approximate_size() + blobs)
            }
        }
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        self.active_blobs.force_shutdown();
    }
}

fn directory_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += directory_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
