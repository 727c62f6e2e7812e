//! Log-backed engine
//!
//! Keeps the live map in a `MemStore` and persists it as a sorted table
//! plus an append-only log of write batches.
//!
//! ## Files
//! ```text
//! {dir}/
//!   ├── data.table     (sorted snapshot written on compaction)
//!   └── batches.log    (write batches appended since the snapshot)
//! ```
//!
//! ## Log Record Format
//! ```text
//! ┌─────────┬─────────┬────────┬──────────────────────────┐
//! │ LSN (8) │ CRC (4) │Len (4) │ bincode(WriteBatch)      │
//! └─────────┴─────────┴────────┴──────────────────────────┘
//! ```
//!
//! ## Table Format
//! ```text
//! ┌──────────┬─────────────┬───────────┬──────────────────────┬─────────┐
//! │ "AIDB"(4)│ Version (2) │ Count (8) │ [klen][vlen][k][v]…  │ CRC (4) │
//! └──────────┴─────────────┴───────────┴──────────────────────┴─────────┘
//! ```
//!
//! Replaying the whole log over a table that already contains its effects
//! yields the same map, so a crash between table rename and log truncation
//! is harmless.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{IdbError, Result};

use super::{Entry, KvOptions, KvStore, KvView, MemStore, WriteBatch};

const MAGIC: &[u8; 4] = b"AIDB";
const TABLE_VERSION: u16 = 1;
const TABLE_HEADER_SIZE: usize = 4 + 2 + 8;
const LOG_HEADER_SIZE: usize = 8 + 4 + 4;

/// Appends write batches to the log file
#[derive(Debug)]
struct LogWriter {
    file: File,
    next_lsn: u64,
    bytes: u64,
}

impl LogWriter {
    fn append(&mut self, data: &[u8], sync: bool) -> Result<u64> {
        let lsn = self.next_lsn;
        let crc = crc32fast::hash(data);

        let mut record = Vec::with_capacity(LOG_HEADER_SIZE + data.len());
        record.extend_from_slice(&lsn.to_le_bytes());
        record.extend_from_slice(&crc.to_le_bytes());
        record.extend_from_slice(&(data.len() as u32).to_le_bytes());
        record.extend_from_slice(data);

        self.file.write_all(&record)?;
        if sync {
            self.file.sync_data()?;
        }

        self.next_lsn += 1;
        self.bytes += record.len() as u64;
        Ok(lsn)
    }
}

/// Outcome of replaying the log at open
#[derive(Debug, Default)]
struct ReplayResult {
    batches: Vec<WriteBatch>,
    last_lsn: u64,
    /// Offset of the end of the last intact record
    valid_len: u64,
    was_truncated: bool,
}

/// Persistent engine: live `MemStore` + table snapshot + batch log
#[derive(Debug)]
pub struct LogStore {
    dir: PathBuf,
    state: MemStore,
    log: Mutex<LogWriter>,
    write_buffer_size: usize,
}

impl LogStore {
    const LOG_FILENAME: &'static str = "batches.log";
    const TABLE_FILENAME: &'static str = "data.table";
    const TABLE_TMP_FILENAME: &'static str = "data.table.tmp";

    /// Open (or create) the engine in `dir`
    pub fn open(dir: &Path, options: &KvOptions) -> Result<Self> {
        // Step 1: Ensure the directory exists
        if !dir.exists() {
            if !options.create_if_missing {
                return Err(IdbError::NotFound(format!("no database at {}", dir.display())));
            }
            fs::create_dir_all(dir)?;
        }

        // Step 2: Load the last table snapshot
        let state = MemStore::new();
        let table_path = dir.join(Self::TABLE_FILENAME);
        if table_path.exists() {
            state.load(read_table(&table_path)?);
        }

        // Step 3: Replay batches logged after the snapshot
        let log_path = dir.join(Self::LOG_FILENAME);
        let replay = replay_log(&log_path, options.paranoid_checks)?;
        if replay.was_truncated {
            tracing::warn!(path = %log_path.display(), valid_len = replay.valid_len, "truncating torn log tail");
            let file = OpenOptions::new().write(true).open(&log_path)?;
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        for batch in &replay.batches {
            state.apply(batch);
        }

        // Step 4: Reopen the log for appending
        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;

        tracing::debug!(
            dir = %dir.display(),
            entries = state.entry_count(),
            replayed = replay.batches.len(),
            max_open_files = options.max_open_files,
            "log store opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            state,
            log: Mutex::new(LogWriter {
                file,
                next_lsn: replay.last_lsn + 1,
                bytes: replay.valid_len,
            }),
            write_buffer_size: options.write_buffer_size,
        })
    }

    /// Remove every engine file in `dir`
    pub fn destroy(dir: &Path) -> Result<()> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the live map as a fresh table and empty the log
    fn write_table(&self, log: &mut LogWriter) -> Result<()> {
        let tmp_path = self.dir.join(Self::TABLE_TMP_FILENAME);
        let entries = self.state.snapshot();

        let mut body = Vec::new();
        for (key, value) in &entries {
            body.extend_from_slice(&(key.len() as u32).to_le_bytes());
            body.extend_from_slice(&(value.len() as u32).to_le_bytes());
            body.extend_from_slice(key);
            body.extend_from_slice(value);
        }

        let mut file = File::create(&tmp_path)?;
        file.write_all(MAGIC)?;
        file.write_all(&TABLE_VERSION.to_le_bytes())?;
        file.write_all(&(entries.len() as u64).to_le_bytes())?;
        file.write_all(&body)?;
        file.write_all(&crc32fast::hash(&body).to_le_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, self.dir.join(Self::TABLE_FILENAME))?;

        log.file.set_len(0)?;
        log.file.sync_all()?;
        log.bytes = 0;

        tracing::debug!(dir = %self.dir.display(), entries = entries.len(), "table written");
        Ok(())
    }
}

impl KvView for LogStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.state.get(key)
    }

    fn next_entry(&self, from: Bound<&[u8]>) -> Result<Option<Entry>> {
        self.state.next_entry(from)
    }

    fn prev_entry(&self, before: Bound<&[u8]>) -> Result<Option<Entry>> {
        self.state.prev_entry(before)
    }
}

impl KvStore for LogStore {
    fn write(&self, batch: WriteBatch, sync: bool) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let data = bincode::serialize(&batch)?;

        let mut log = self.log.lock();
        log.append(&data, sync)?;
        self.state.apply(&batch);

        if log.bytes > self.write_buffer_size as u64 {
            self.write_table(&mut log)?;
        }
        Ok(())
    }

    fn compact_range(&self, _start: &[u8], _end: &[u8]) -> Result<()> {
        let mut log = self.log.lock();
        self.write_table(&mut log)
    }

    fn approximate_size(&self) -> u64 {
        self.state.approximate_size()
    }
}

// =============================================================================
// Recovery
// =============================================================================

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let slice = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes(slice.try_into().ok()?))
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let slice = bytes.get(at..at + 8)?;
    Some(u64::from_le_bytes(slice.try_into().ok()?))
}

fn read_table(path: &Path) -> Result<Vec<Entry>> {
    let corrupt = |what: &str| IdbError::Corruption(format!("{}: {}", path.display(), what));

    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    if bytes.len() < TABLE_HEADER_SIZE + 4 || &bytes[..4] != MAGIC {
        return Err(corrupt("bad table header"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != TABLE_VERSION {
        return Err(corrupt("unsupported table version"));
    }
    let count = read_u64(&bytes, 6).ok_or_else(|| corrupt("bad entry count"))?;

    let body_end = bytes.len() - 4;
    let body = &bytes[TABLE_HEADER_SIZE..body_end];
    let stored_crc = read_u32(&bytes, body_end).ok_or_else(|| corrupt("missing checksum"))?;
    if crc32fast::hash(body) != stored_crc {
        return Err(corrupt("table checksum mismatch"));
    }

    let mut entries = Vec::with_capacity(count as usize);
    let mut at = 0;
    for _ in 0..count {
        let key_len = read_u32(body, at).ok_or_else(|| corrupt("truncated entry"))? as usize;
        let value_len = read_u32(body, at + 4).ok_or_else(|| corrupt("truncated entry"))? as usize;
        at += 8;
        let key = body.get(at..at + key_len).ok_or_else(|| corrupt("truncated key"))?;
        at += key_len;
        let value = body.get(at..at + value_len).ok_or_else(|| corrupt("truncated value"))?;
        at += value_len;
        entries.push((key.to_vec(), value.to_vec()));
    }
    Ok(entries)
}

fn replay_log(path: &Path, paranoid_checks: bool) -> Result<ReplayResult> {
    let mut result = ReplayResult::default();
    if !path.exists() {
        return Ok(result);
    }

    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let mut at = 0usize;
    while at < bytes.len() {
        let header = (read_u64(&bytes, at), read_u32(&bytes, at + 8), read_u32(&bytes, at + 12));
        let (lsn, crc, len) = match header {
            (Some(lsn), Some(crc), Some(len)) => (lsn, crc, len as usize),
            _ => {
                result.was_truncated = true;
                break;
            }
        };
        let data_start = at + LOG_HEADER_SIZE;
        let data = match bytes.get(data_start..data_start + len) {
            Some(data) => data,
            None => {
                result.was_truncated = true;
                break;
            }
        };
        if crc32fast::hash(data) != crc {
            if paranoid_checks {
                return Err(IdbError::Corruption(format!(
                    "{}: checksum mismatch in log record {}",
                    path.display(),
                    lsn
                )));
            }
            result.was_truncated = true;
            break;
        }

        result.batches.push(bincode::deserialize(data)?);
        result.last_lsn = lsn;
        at = data_start + len;
        result.valid_len = at as u64;
    }
    Ok(result)
}
