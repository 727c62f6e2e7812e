//! External objects
//!
//! Blobs, files and file-system-access handles attached to a record. The
//! descriptor is persisted under the record's blob entry key; blob and
//! file bytes live in a file named after `(database_id, blob_number)`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;

use crate::active_blobs::BlobActivation;
use crate::coding::keys::DatabaseMetaDataKey;

/// What an external object refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalObjectKind {
    Blob,
    File,
    FileSystemAccessHandle,
}

/// One external object of a record
#[derive(Clone)]
pub struct ExternalObject {
    kind: ExternalObjectKind,
    blob_number: i64,
    mime_type: String,
    /// -1 while unknown (legacy file entries before migration)
    size: i64,
    file_name: String,
    last_modified: Option<SystemTime>,
    serialized_handle: Vec<u8>,
    /// Bytes still to be written at commit
    payload: Option<Bytes>,
    /// Handle token still to be serialized at commit
    transfer_token: Option<Bytes>,
    /// Set on objects read back from an on-disk store
    indexed_db_file_path: Option<PathBuf>,
    activation: Option<BlobActivation>,
}

impl ExternalObject {
    fn empty(kind: ExternalObjectKind) -> Self {
        Self {
            kind,
            blob_number: DatabaseMetaDataKey::INVALID_BLOB_NUMBER,
            mime_type: String::new(),
            size: -1,
            file_name: String::new(),
            last_modified: None,
            serialized_handle: Vec::new(),
            payload: None,
            transfer_token: None,
            indexed_db_file_path: None,
            activation: None,
        }
    }

    // -------------------------------------------------------------------------
    // New objects (to be written)
    // -------------------------------------------------------------------------

    pub fn blob(payload: Bytes, mime_type: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            size: payload.len() as i64,
            payload: Some(payload),
            ..Self::empty(ExternalObjectKind::Blob)
        }
    }

    pub fn file(
        payload: Bytes,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        last_modified: SystemTime,
    ) -> Self {
        Self {
            mime_type: mime_type.into(),
            size: payload.len() as i64,
            file_name: file_name.into(),
            last_modified: Some(last_modified),
            payload: Some(payload),
            ..Self::empty(ExternalObjectKind::File)
        }
    }

    /// A handle whose token is serialized during commit
    pub fn file_system_access_handle(transfer_token: Bytes) -> Self {
        Self {
            transfer_token: Some(transfer_token),
            ..Self::empty(ExternalObjectKind::FileSystemAccessHandle)
        }
    }

    // -------------------------------------------------------------------------
    // Persisted objects (decoded)
    // -------------------------------------------------------------------------

    pub fn stored_blob(blob_number: i64, mime_type: String, size: i64) -> Self {
        Self { blob_number, mime_type, size, ..Self::empty(ExternalObjectKind::Blob) }
    }

    pub fn stored_file(
        blob_number: i64,
        mime_type: String,
        size: i64,
        file_name: String,
        last_modified: Option<SystemTime>,
    ) -> Self {
        Self {
            blob_number,
            mime_type,
            size,
            file_name,
            last_modified,
            ..Self::empty(ExternalObjectKind::File)
        }
    }

    pub fn stored_handle(serialized_handle: Vec<u8>) -> Self {
        Self { serialized_handle, ..Self::empty(ExternalObjectKind::FileSystemAccessHandle) }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn kind(&self) -> ExternalObjectKind {
        self.kind
    }

    /// Blobs and files have a backing file; handles do not
    pub fn has_blob_file(&self) -> bool {
        self.kind != ExternalObjectKind::FileSystemAccessHandle
    }

    pub fn blob_number(&self) -> i64 {
        self.blob_number
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    pub fn serialized_handle(&self) -> &[u8] {
        &self.serialized_handle
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn transfer_token(&self) -> Option<&Bytes> {
        self.transfer_token.as_ref()
    }

    pub fn indexed_db_file_path(&self) -> Option<&Path> {
        self.indexed_db_file_path.as_deref()
    }

    /// Reference-tracking hook for readers of a persisted blob
    pub fn activation(&self) -> Option<&BlobActivation> {
        self.activation.as_ref()
    }

    // -------------------------------------------------------------------------
    // Mutators used by the store
    // -------------------------------------------------------------------------

    pub(crate) fn set_blob_number(&mut self, blob_number: i64) {
        self.blob_number = blob_number;
    }

    pub(crate) fn set_serialized_handle(&mut self, token: Vec<u8>) {
        self.serialized_handle = token;
    }

    pub(crate) fn set_size(&mut self, size: i64) {
        self.size = size;
    }

    pub(crate) fn set_last_modified(&mut self, last_modified: SystemTime) {
        self.last_modified = Some(last_modified);
    }

    pub(crate) fn set_indexed_db_file_path(&mut self, path: PathBuf) {
        self.indexed_db_file_path = Some(path);
    }

    pub(crate) fn set_activation(&mut self, activation: BlobActivation) {
        self.activation = Some(activation);
    }

    /// True when the persisted descriptor of both objects is the same
    pub fn same_descriptor(&self, other: &ExternalObject) -> bool {
        self.kind == other.kind
            && self.blob_number == other.blob_number
            && self.mime_type == other.mime_type
            && self.size == other.size
            && self.file_name == other.file_name
            && self.serialized_handle == other.serialized_handle
    }
}

impl fmt::Debug for ExternalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalObject")
            .field("kind", &self.kind)
            .field("blob_number", &self.blob_number)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .field("file_name", &self.file_name)
            .field("has_payload", &self.payload.is_some())
            .finish()
    }
}
