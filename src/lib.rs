//! # atlas-idb
//!
//! The storage layer of an IndexedDB implementation:
//! - Order-preserving key encoding over an ordered key-value engine
//! - Two-phase commit that writes blob files before the records naming them
//! - Recovery and active blob journals so a crash never leaks blob files
//! - Cursors that skip and delete stale index entries lazily
//! - Schema migrations of older on-disk formats
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       BackingStore                           │
//! │     open / verify / migrate, databases, journal cleaning     │
//! └──────────────┬───────────────────────────────┬──────────────┘
//!                │                               │
//!                ▼                               ▼
//!        ┌──────────────┐                ┌──────────────┐
//!        │   Database   │                │ Maintenance  │
//!        │  (metadata)  │                │ sweep/compact│
//!        └──────┬───────┘                └──────────────┘
//!               │
//!               ▼
//!        ┌──────────────┐   blob writes   ┌──────────────┐
//!        │ Transaction  │ ──────────────► │ Blob storage │
//!        │  (2 phases)  │                 │ (worker pool)│
//!        └──────┬───────┘                 └──────────────┘
//!               │ cursors
//!               ▼
//!        ┌──────────────┐                 ┌──────────────┐
//!        │ Key encoding │ ──────────────► │  KV engine   │
//!        │   (coding)   │                 │ (mem / log)  │
//!        └──────────────┘                 └──────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod reporting;

pub mod kv;
pub mod coding;

pub mod external_object;
pub mod active_blobs;
pub mod blob;
pub mod journal;

pub mod metadata;
pub mod record;
pub mod migration;

pub mod backing_store;
pub mod database;
pub mod transaction;
pub mod cursor;
pub mod maintenance;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{IdbError, Result};
pub use config::{Config, ConfigBuilder};

pub use backing_store::{BackingStore, DataLoss, DataLossInfo};
pub use database::Database;
pub use transaction::{BlobWriteResult, Durability, Transaction, TransactionMode, TransactionState};
pub use cursor::{Cursor, CursorDirection};

pub use coding::{IdbKey, KeyPath, KeyRange};
pub use external_object::{ExternalObject, ExternalObjectKind};
pub use metadata::{DatabaseMetadata, IndexMetadata, ObjectStoreMetadata};
pub use record::{IdbValue, RecordIdentifier};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of atlas-idb
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
