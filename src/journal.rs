//! Blob journals
//!
//! Two journals list blob files that may need deleting:
//! - the recovery journal: files that are (or may become) unreferenced and
//!   are deleted on the next cleaning pass or at startup
//! - the active journal: files deleted from the database while a reader
//!   still held them; moved to the recovery journal once released
//!
//! A journal value is a run of `varint(database_id) varint(blob_number)`
//! pairs. `blob_number == ALL_BLOBS_NUMBER` means the whole database.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::blob::{blob_directory_name, blob_file_name};
use crate::coding::keys::{DatabaseMetaDataKey, KeyPrefix};
use crate::coding::{decode_var_int, encode_var_int};
use crate::error::{IdbError, Result};
use crate::kv::{KvView, KvWrite};
use crate::reporting::{report_read_error, ErrorLocation};

/// One journal line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobJournalEntry {
    pub database_id: i64,
    pub blob_number: i64,
}

impl BlobJournalEntry {
    pub fn new(database_id: i64, blob_number: i64) -> Self {
        Self { database_id, blob_number }
    }

    /// Every blob of `database_id`
    pub fn all_blobs(database_id: i64) -> Self {
        Self::new(database_id, DatabaseMetaDataKey::ALL_BLOBS_NUMBER)
    }

    pub fn is_all_blobs(&self) -> bool {
        self.blob_number == DatabaseMetaDataKey::ALL_BLOBS_NUMBER
    }
}

pub type BlobJournal = Vec<BlobJournalEntry>;

// =============================================================================
// Encoding
// =============================================================================

pub fn encode_blob_journal(journal: &[BlobJournalEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(journal.len() * 4);
    for entry in journal {
        encode_var_int(entry.database_id, &mut out);
        encode_var_int(entry.blob_number, &mut out);
    }
    out
}

/// Fails on truncated pairs, invalid database ids and blob numbers that are
/// neither valid nor the all-blobs marker.
pub fn decode_blob_journal(bytes: &[u8]) -> Option<BlobJournal> {
    let mut input = bytes;
    let mut journal = Vec::new();
    while !input.is_empty() {
        let database_id = decode_var_int(&mut input)?;
        let blob_number = decode_var_int(&mut input)?;
        if !KeyPrefix::is_valid_database_id(database_id) {
            return None;
        }
        let entry = BlobJournalEntry::new(database_id, blob_number);
        if !entry.is_all_blobs() && !DatabaseMetaDataKey::is_valid_blob_number(blob_number) {
            return None;
        }
        journal.push(entry);
    }
    Some(journal)
}

// =============================================================================
// Persisted journals
// =============================================================================

/// A missing journal is empty
pub fn get_blob_journal<V: KvView + ?Sized>(view: &V, key: &[u8]) -> Result<BlobJournal> {
    let Some(bytes) = view.get(key)? else {
        return Ok(Vec::new());
    };
    decode_blob_journal(&bytes).ok_or_else(|| {
        report_read_error(ErrorLocation::GetBlobJournal);
        IdbError::InternalInconsistency("blob journal failed to decode")
    })
}

pub fn update_blob_journal<W: KvWrite + ?Sized>(txn: &mut W, key: &[u8], journal: &[BlobJournalEntry]) -> Result<()> {
    txn.put(key.to_vec(), encode_blob_journal(journal))
}

pub fn append_blobs_to_journal<T: KvView + KvWrite + ?Sized>(
    txn: &mut T,
    key: &[u8],
    entries: &[BlobJournalEntry],
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let mut journal = get_blob_journal(&*txn, key)?;
    journal.extend_from_slice(entries);
    update_blob_journal(txn, key, &journal)
}

/// Schedule every blob of `database_id`
pub fn merge_database_into_journal<T: KvView + KvWrite + ?Sized>(
    txn: &mut T,
    key: &[u8],
    database_id: i64,
) -> Result<()> {
    append_blobs_to_journal(txn, key, &[BlobJournalEntry::all_blobs(database_id)])
}

pub fn clear_blob_journal<W: KvWrite + ?Sized>(txn: &mut W, key: &[u8]) -> Result<()> {
    txn.remove(key)
}

// =============================================================================
// File removal
// =============================================================================

/// Delete the files named by `journal`. Files and directories that are
/// already gone count as deleted. Stops at the first real failure.
pub fn clean_up_blob_journal_entries(blob_root: Option<&Path>, journal: &[BlobJournalEntry]) -> Result<()> {
    let Some(blob_root) = blob_root else {
        return Ok(());
    };

    for entry in journal {
        let removed = if entry.is_all_blobs() {
            fs::remove_dir_all(blob_directory_name(blob_root, entry.database_id))
        } else {
            fs::remove_file(blob_file_name(blob_root, entry.database_id, entry.blob_number))
        };
        match removed {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(
                    database_id = entry.database_id,
                    blob_number = entry.blob_number,
                    %err,
                    "failed to delete journaled blob"
                );
                return Err(err.into());
            }
        }
    }
    Ok(())
}
