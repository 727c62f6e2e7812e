//! Blob files
//!
//! Deterministic blob file layout and the blob-storage collaborator that
//! writes payloads to those files.
//!
//! ## Layout
//! ```text
//! {blob_root}/
//!   └── {database_id:x}/
//!         └── {blob_number % 256:02x}/
//!               └── {blob_number:x}
//! ```

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::SystemTime;

use bytes::Bytes;
use crossbeam::channel::{self, SendError, Sender};

// =============================================================================
// Paths
// =============================================================================

/// Number of sub-directories blob files are spread over
const BLOB_DIRECTORY_FANOUT: i64 = 256;

pub fn blob_directory_name(blob_root: &Path, database_id: i64) -> PathBuf {
    blob_root.join(format!("{:x}", database_id))
}

pub fn blob_directory_name_for_key(blob_root: &Path, database_id: i64, blob_number: i64) -> PathBuf {
    blob_directory_name(blob_root, database_id)
        .join(format!("{:02x}", blob_number.rem_euclid(BLOB_DIRECTORY_FANOUT)))
}

pub fn blob_file_name(blob_root: &Path, database_id: i64, blob_number: i64) -> PathBuf {
    blob_directory_name_for_key(blob_root, database_id, blob_number).join(format!("{:x}", blob_number))
}

// =============================================================================
// Blob storage collaborator
// =============================================================================

/// Outcome of writing one blob payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteBlobToFileResult {
    Success,
    /// The destination exists with different content
    AlreadyExistsMismatch,
    Error(String),
}

pub type WriteBlobCallback = Box<dyn FnOnce(WriteBlobToFileResult) + Send>;
pub type SerializeHandleCallback = Box<dyn FnOnce(Vec<u8>) + Send>;

/// Writes blob payloads and serializes file-system-access handles.
/// Callbacks may run on any thread, before or after the call returns.
pub trait BlobStorageContext: Send + Sync {
    fn write_blob_to_file(
        &self,
        payload: Bytes,
        path: PathBuf,
        flush_on_write: bool,
        last_modified: Option<SystemTime>,
        done: WriteBlobCallback,
    );

    fn serialize_handle(&self, transfer_token: Bytes, done: SerializeHandleCallback);
}

type Job = Box<dyn FnOnce() + Send>;

/// Filesystem writer backed by a small pool of worker threads
pub struct FsBlobStorage {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl FsBlobStorage {
    /// Spawn `worker_count` writer threads. Zero writes inline.
    pub fn new(worker_count: usize) -> Self {
        if worker_count == 0 {
            return Self::inline();
        }

        let (sender, receiver) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let receiver = receiver.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("blob-writer-{}", index))
                .spawn(move || {
                    for job in receiver.iter() {
                        job();
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => tracing::warn!(%err, "failed to spawn blob writer thread"),
            }
        }

        if workers.is_empty() {
            return Self::inline();
        }
        Self { jobs: Some(sender), workers }
    }

    /// Run every write on the calling thread
    pub fn inline() -> Self {
        Self { jobs: None, workers: Vec::new() }
    }

    fn submit(&self, job: Job) {
        match &self.jobs {
            Some(sender) => {
                if let Err(SendError(job)) = sender.send(job) {
                    job();
                }
            }
            None => job(),
        }
    }
}

impl Default for FsBlobStorage {
    fn default() -> Self {
        Self::new(2)
    }
}

impl Drop for FsBlobStorage {
    fn drop(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl BlobStorageContext for FsBlobStorage {
    fn write_blob_to_file(
        &self,
        payload: Bytes,
        path: PathBuf,
        flush_on_write: bool,
        last_modified: Option<SystemTime>,
        done: WriteBlobCallback,
    ) {
        self.submit(Box::new(move || {
            let result = write_payload(&payload, &path, flush_on_write, last_modified);
            if let WriteBlobToFileResult::Error(message) = &result {
                tracing::warn!(path = %path.display(), %message, "blob write failed");
            }
            done(result);
        }));
    }

    fn serialize_handle(&self, transfer_token: Bytes, done: SerializeHandleCallback) {
        self.submit(Box::new(move || done(transfer_token.to_vec())));
    }
}

fn write_payload(
    payload: &[u8],
    path: &Path,
    flush_on_write: bool,
    last_modified: Option<SystemTime>,
) -> WriteBlobToFileResult {
    let attempt = || -> std::io::Result<WriteBlobToFileResult> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let existing = fs::read(path)?;
                return Ok(if existing == payload {
                    WriteBlobToFileResult::Success
                } else {
                    WriteBlobToFileResult::AlreadyExistsMismatch
                });
            }
            Err(err) => return Err(err),
        };
        file.write_all(payload)?;
        if let Some(modified) = last_modified {
            file.set_modified(modified)?;
        }
        if flush_on_write {
            file.sync_all()?;
        }
        Ok(WriteBlobToFileResult::Success)
    };

    attempt().unwrap_or_else(|err| WriteBlobToFileResult::Error(err.to_string()))
}
