//! Error reporting
//!
//! Every failed read, failed write and broken invariant is logged with a
//! category and the location that detected it, so that log pipelines can
//! count them the same way metrics would.

use std::fmt;

/// Where an internal error was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLocation {
    Initialize,
    MigrateToV4,
    MigrateToV5,
    GetDatabaseNames,
    ReadMetadataForDatabaseName,
    CreateOrOpenDatabase,
    DeleteDatabase,
    ReadObjectStores,
    ReadIndexes,
    SetMaxObjectStoreId,
    SetMaxIndexId,
    GetNewVersionNumber,
    GetRecord,
    PutRecord,
    ClearObjectStore,
    DeleteObjectStore,
    DeleteRange,
    GetKeyGeneratorCurrentNumber,
    KeyExistsInObjectStore,
    VersionExists,
    FindKeyInIndex,
    GetIndexKeyCount,
    GetObjectStoreKeyCount,
    GetBlobJournal,
    CleanUpBlobJournal,
    GetExternalObjectsForRecord,
    CollectBlobFilesToRemove,
    HandleBlobPreTransaction,
    CommitPhaseTwo,
    CursorLoadCurrentRow,
    CursorContinue,
    ReadCorruptionInfo,
    TombstoneSweeper,
}

impl fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A read from the key-value engine failed or returned undecodable bytes
pub fn report_read_error(location: ErrorLocation) {
    tracing::error!(category = "read", %location, "internal read error");
}

/// A write to the key-value engine or filesystem failed
pub fn report_write_error(location: ErrorLocation) {
    tracing::error!(category = "write", %location, "internal write error");
}

/// Stored data disagrees with what the store itself wrote earlier
pub fn report_consistency_error(location: ErrorLocation) {
    tracing::error!(category = "consistency", %location, "internal consistency error");
}
