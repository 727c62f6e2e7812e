//! Schema migrations
//!
//! Run inside the initialization transaction, oldest first:
//! - v3 -> v4: blob entries gain file size and modification time, read from
//!   the blob files themselves
//! - v4 -> v5: every non-empty blob file named by a blob entry must exist

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::blob::blob_file_name;
use crate::coding::external::{decode_external_objects, decode_v3_external_objects, encode_external_objects};
use crate::coding::keys::{BlobEntryKey, SchemaVersionKey};
use crate::error::{IdbError, Result};
use crate::external_object::ExternalObjectKind;
use crate::kv::{put_int, KvIterator, KvView, KvWrite, LevelDbTransaction};
use crate::metadata::{read_database_ids, read_object_stores};
use crate::reporting::{report_read_error, ErrorLocation};

pub const EARLIEST_SUPPORTED_SCHEMA_VERSION: i64 = 3;
pub const LATEST_KNOWN_SCHEMA_VERSION: i64 = 5;

/// `(database_id, object_store_id)` of every object store of `origin`
fn object_stores_of_origin<V: KvView + ?Sized>(view: &V, origin: &str) -> Result<Vec<(i64, i64)>> {
    let mut stores = Vec::new();
    for (_, database_id) in read_database_ids(view, origin)? {
        for object_store_id in read_object_stores(view, database_id)?.into_keys() {
            stores.push((database_id, object_store_id));
        }
    }
    Ok(stores)
}

/// Every `(key, value)` blob entry of one object store
fn blob_entries<V: KvView + ?Sized>(view: &V, database_id: i64, object_store_id: i64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let start = BlobEntryKey::encode_min_key_for_object_store(database_id, object_store_id);
    let stop = BlobEntryKey::encode_stop_key_for_object_store(database_id, object_store_id);
    let mut entries = Vec::new();
    let mut it = KvIterator::new();
    it.seek(view, &start)?;
    while it.is_valid() && it.key() < stop.as_slice() {
        entries.push((it.key().to_vec(), it.value().to_vec()));
        it.next(view)?;
    }
    Ok(entries)
}

/// Returns the empty blob files the upgraded entries no longer name. The
/// caller deletes them once the migration has committed.
pub fn migrate_to_v4(txn: &mut LevelDbTransaction, origin: &str, blob_root: Option<&Path>) -> Result<Vec<PathBuf>> {
    let location = ErrorLocation::MigrateToV4;
    let mut empty_blobs = Vec::new();

    if let Some(blob_root) = blob_root {
        for (database_id, object_store_id) in object_stores_of_origin(&*txn, origin)? {
            for (key, value) in blob_entries(&*txn, database_id, object_store_id)? {
                let mut objects = decode_v3_external_objects(&value).ok_or_else(|| {
                    report_read_error(location);
                    IdbError::InternalInconsistency("v3 blob entry failed to decode")
                })?;

                // v3 blobs already carry their size and encode as in v4.
                let mut needs_rewrite = false;
                for object in objects.iter_mut().filter(|object| object.kind() == ExternalObjectKind::File) {
                    needs_rewrite = true;
                    let path = blob_file_name(blob_root, database_id, object.blob_number());
                    let info = match fs::metadata(&path) {
                        Ok(info) => info,
                        Err(err) if err.kind() == ErrorKind::NotFound => {
                            return Err(IdbError::Corruption(format!(
                                "blob file {} missing during v4 migration",
                                path.display()
                            )));
                        }
                        Err(err) => return Err(err.into()),
                    };

                    object.set_size(info.len() as i64);
                    object.set_last_modified(info.modified()?);
                    // Empty files are not backed by a blob file from v4 on.
                    if info.len() == 0 {
                        empty_blobs.push(path);
                    }
                }
                if needs_rewrite {
                    txn.put(key, encode_external_objects(&objects))?;
                }
            }
        }
    }

    put_int(txn, SchemaVersionKey::encode(), 4)?;
    tracing::info!(origin, empty_blobs = empty_blobs.len(), "migrated backing store schema to v4");
    Ok(empty_blobs)
}

/// Best-effort removal of the files returned by [`migrate_to_v4`]
pub fn remove_empty_blob_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(err) = fs::remove_file(path) {
            tracing::debug!(path = %path.display(), error = %err, "could not remove empty blob file");
        }
    }
}

pub fn migrate_to_v5(
    txn: &mut LevelDbTransaction,
    origin: &str,
    origin_host: &str,
    blob_root: Option<&Path>,
    blob_validation_exclusions: &[String],
) -> Result<()> {
    let location = ErrorLocation::MigrateToV5;
    let excluded = blob_validation_exclusions.iter().any(|host| host == origin_host);

    match blob_root {
        Some(blob_root) if !excluded => {
            for (database_id, object_store_id) in object_stores_of_origin(&*txn, origin)? {
                for (_, value) in blob_entries(&*txn, database_id, object_store_id)? {
                    let objects = decode_external_objects(&value).ok_or_else(|| {
                        report_read_error(location);
                        IdbError::InternalInconsistency("blob entry failed to decode")
                    })?;
                    for object in objects.iter().filter(|object| object.has_blob_file() && object.size() != 0) {
                        let path = blob_file_name(blob_root, database_id, object.blob_number());
                        if !path.exists() {
                            return Err(IdbError::Corruption(format!(
                                "blob file {} missing during v5 migration",
                                path.display()
                            )));
                        }
                    }
                }
            }
        }
        Some(_) => tracing::info!(origin_host, "skipping blob validation for excluded host"),
        None => {}
    }

    put_int(txn, SchemaVersionKey::encode(), 5)?;
    tracing::info!(origin, "migrated backing store schema to v5");
    Ok(())
}
