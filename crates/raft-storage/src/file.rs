//! file-based storage implementation

use raft_core::{EntryStatus, LogEntry, NodeId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::{check_contiguous, slot, Storage, StorageError, StorageResult};

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term and voted_for, replaced atomically
/// - log.jsonl: one json entry per line, appended and synced
/// - status.jsonl: apply outcomes recorded since the log was last rewritten
///
/// the status journal keeps an apply to one small synced append. it is folded
/// into log.jsonl on load, on every log rewrite, and once it grows past
/// `STATUS_COMPACT_AFTER` records.
///
/// the log is cached in memory after load; the cache only changes after the
/// matching disk write succeeded.
#[derive(Debug)]
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    meta: MetaData,
    log: Vec<LogEntry>,
    /// records in status.jsonl not yet folded into log.jsonl
    journaled: usize,
}

/// metadata structure for term and vote
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
struct MetaData {
    term: u64,
    voted_for: Option<NodeId>,
}

/// one line of status.jsonl
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct StatusRecord {
    index: u64,
    status: EntryStatus,
}

impl FileStorage {
    /// open (or create) a filestorage at the given directory and load its state
    pub fn new(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let meta = read_meta(&dir.join(META_FILE))?;
        let (mut log, torn_log) = read_records::<LogEntry>(&dir.join(LOG_FILE))?;
        check_contiguous(0, &log)?;
        let (statuses, torn_status) = read_records::<StatusRecord>(&dir.join(STATUS_FILE))?;

        let journaled = statuses.len();
        for record in statuses {
            // records for indexes cut off by a later truncate are stale
            if let Some(i) = slot(&log, record.index) {
                log[i].status = record.status;
            }
        }

        let mut storage = Self { dir, meta, log, journaled };
        if torn_log || torn_status {
            tracing::warn!(dir = %storage.dir.display(), "discarding torn trailing record");
        }
        if torn_log || torn_status || journaled > 0 {
            let complete = storage.log.clone();
            storage.rewrite_log(&complete)?;
        }
        Ok(storage)
    }

    /// get the path to the metadata file
    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    /// get the path to the log file
    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// get the path to the status journal
    fn status_path(&self) -> PathBuf {
        self.dir.join(STATUS_FILE)
    }

    /// replace the whole log file with `log`, then adopt it as the cache.
    /// the status journal is dropped only after the new log is in place.
    fn rewrite_log(&mut self, log: &[LogEntry]) -> StorageResult<()> {
        let mut buf = Vec::new();
        for entry in log {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        write_atomic(&self.dir, LOG_FILE, &buf)?;
        self.log = log.to_vec();
        remove_if_exists(&self.status_path())?;
        self.journaled = 0;
        Ok(())
    }

    /// put both files back in step with the cache after a failed append
    fn repair(&mut self) {
        let cached = self.log.clone();
        if let Err(repair) = self.rewrite_log(&cached) {
            tracing::error!(error = %repair, "failed to repair log after append error");
        }
    }
}

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.jsonl";
const STATUS_FILE: &str = "status.jsonl";

/// journal length at which statuses are folded back into the log file
const STATUS_COMPACT_AFTER: usize = 4096;

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<NodeId>) -> StorageResult<()> {
        let meta = MetaData { term, voted_for };
        let json = serde_json::to_string_pretty(&meta)?;
        write_atomic(&self.dir, META_FILE, json.as_bytes())?;
        self.meta = meta;
        Ok(())
    }

    fn load_term_and_vote(&self) -> StorageResult<(u64, Option<NodeId>)> {
        Ok((self.meta.term, self.meta.voted_for.clone()))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        check_contiguous(self.log.len() as u64, entries)?;

        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }

        if let Err(err) = append_synced(&self.log_path(), &buf) {
            // a partial record may have reached the file
            self.repair();
            return Err(err.into());
        }

        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> StorageResult<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn entry(&self, index: u64) -> StorageResult<Option<LogEntry>> {
        Ok(slot(&self.log, index).map(|i| self.log[i].clone()))
    }

    fn log_len(&self) -> StorageResult<u64> {
        Ok(self.log.len() as u64)
    }

    fn entries_from(&self, start: u64) -> StorageResult<Vec<LogEntry>> {
        let from = start.max(1) as usize - 1;
        Ok(self.log.get(from..).map(<[LogEntry]>::to_vec).unwrap_or_default())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> StorageResult<()> {
        let kept: Vec<LogEntry> = self.log.iter().filter(|e| e.index < from_index).cloned().collect();
        if kept.len() == self.log.len() {
            return Ok(());
        }
        self.rewrite_log(&kept)
    }

    fn set_status(&mut self, index: u64, status: EntryStatus) -> StorageResult<()> {
        let i = slot(&self.log, index).ok_or(StorageError::MissingEntry(index))?;
        if self.log[i].status == status {
            return Ok(());
        }

        let mut line = serde_json::to_vec(&StatusRecord { index, status })?;
        line.push(b'\n');
        if let Err(err) = append_synced(&self.status_path(), &line) {
            self.repair();
            return Err(err.into());
        }
        self.log[i].status = status;
        self.journaled += 1;

        if self.journaled >= STATUS_COMPACT_AFTER {
            // the status is already durable in the journal; a failed fold is retried later
            let complete = self.log.clone();
            if let Err(err) = self.rewrite_log(&complete) {
                tracing::warn!(error = %err, "failed to fold status journal into log");
            }
        }
        Ok(())
    }

    fn clear(&mut self) -> StorageResult<()> {
        for path in [self.meta_path(), self.log_path(), self.status_path()] {
            remove_if_exists(&path)?;
        }
        self.meta = MetaData::default();
        self.log.clear();
        self.journaled = 0;
        Ok(())
    }
}

/// atomic write: write to temp file, sync, then rename over the target
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    let temp_path = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))
}

/// append and sync before returning
fn append_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_data()
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn read_meta(path: &Path) -> StorageResult<MetaData> {
    if !path.exists() {
        return Ok(MetaData::default()); // default for new nodes
    }
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// load every complete json-lines record. a final line that does not parse is
/// a write cut short by a crash and is dropped; a bad line anywhere else is corruption.
fn read_records<T: DeserializeOwned>(path: &Path) -> StorageResult<(Vec<T>, bool)> {
    if !path.exists() {
        return Ok((Vec::new(), false));
    }
    let lines: Vec<String> = BufReader::new(File::open(path)?)
        .lines()
        .collect::<io::Result<_>>()?;

    let mut records = Vec::with_capacity(lines.len());
    let last = lines.len().saturating_sub(1);
    for (n, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(line) {
            Ok(record) => records.push(record),
            Err(_) if n == last => return Ok((records, true)),
            Err(e) => return Err(e.into()),
        }
    }
    Ok((records, false))
}
