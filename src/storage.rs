use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::PeerId;

const HEADER_FILE: &str = "header";
const HEADER_TMP: &str = "header.tmp";
const LOG_FILE: &str = "log";

/// The atomically replaced portion of persistent state.
#[derive(Serialize, Deserialize, Debug, Default)]
struct Header {
    current_term: u64,
    voted_for: Option<PeerId>,
}

/// State recovered from disk at startup.
#[derive(Debug, Default)]
pub struct Recovered {
    pub current_term: u64,
    pub voted_for: Option<PeerId>,
    pub entries: Vec<LogEntry>,
}

/// Durable storage for consensus state, in two parts: a header holding
/// `current_term`/`voted_for`, replaced atomically via rename, and an
/// append-only log of `u32`-length-prefixed bincode records. Every write
/// is synced before returning; the consensus task must not answer an RPC
/// until the write that justifies the answer has gone through here.
pub struct Storage {
    dir: PathBuf,
    log_file: File,
    /// Byte offset at which each record starts; `offsets.len()` is the
    /// number of durable records.
    offsets: Vec<u64>,
    /// Offset one past the last durable record.
    end: u64,
}

impl Storage {
    /// Open (or create) the storage directory and recover its contents.
    /// A partially written or corrupt tail of the log is discarded.
    pub fn open(dir: &Path) -> Result<(Self, Recovered)> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating storage directory {}", dir.display()))?;

        let header = match fs::read(dir.join(HEADER_FILE)) {
            Ok(bytes) => bincode::deserialize::<Header>(&bytes)
                .with_context(|| format!("decoding header in {}", dir.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Header::default(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reading header in {}", dir.display()))
            }
        };

        let log_path = dir.join(LOG_FILE);
        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)
            .with_context(|| format!("opening log file {}", log_path.display()))?;

        let bytes = fs::read(&log_path)?;
        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= bytes.len() {
            let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            if pos + 4 + len > bytes.len() {
                break;
            }
            match bincode::deserialize::<LogEntry>(&bytes[pos + 4..pos + 4 + len]) {
                Ok(entry) => {
                    offsets.push(pos as u64);
                    entries.push(entry);
                    pos += 4 + len;
                }
                Err(_) => break,
            }
        }
        if pos < bytes.len() {
            warn!(
                "discarding {} bytes of unreadable log tail in {}",
                bytes.len() - pos,
                dir.display()
            );
            log_file.set_len(pos as u64)?;
            log_file.sync_data()?;
        }

        info!(
            "recovered term={} voted_for={:?} with {} log entries from {}",
            header.current_term,
            header.voted_for,
            entries.len(),
            dir.display()
        );

        let storage = Self {
            dir: dir.to_path_buf(),
            log_file,
            offsets,
            end: pos as u64,
        };
        let recovered = Recovered {
            current_term: header.current_term,
            voted_for: header.voted_for,
            entries,
        };
        Ok((storage, recovered))
    }

    /// Durably replace `current_term` and `voted_for`.
    pub fn save_header(&mut self, current_term: u64, voted_for: &Option<PeerId>) -> Result<()> {
        let header = Header {
            current_term,
            voted_for: voted_for.clone(),
        };
        let tmp_path = self.dir.join(HEADER_TMP);
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        tmp.write_all(&bincode::serialize(&header)?)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, self.dir.join(HEADER_FILE))?;
        Ok(())
    }

    /// Durably append log records.
    pub fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        let mut buf = Vec::new();
        for entry in entries {
            let record = bincode::serialize(entry)?;
            self.offsets.push(self.end + buf.len() as u64);
            buf.extend_from_slice(&(record.len() as u32).to_le_bytes());
            buf.extend_from_slice(&record);
        }
        self.log_file.seek(SeekFrom::Start(self.end))?;
        self.log_file.write_all(&buf)?;
        self.log_file.sync_data()?;
        self.end += buf.len() as u64;
        Ok(())
    }

    /// Durably remove all records with 1-based indices >= `index`.
    pub fn truncate_from(&mut self, index: u64) -> Result<()> {
        if index == 0 || index > self.offsets.len() as u64 {
            return Ok(());
        }
        let new_end = self.offsets[index as usize - 1];
        self.log_file.set_len(new_end)?;
        self.log_file.sync_data()?;
        self.offsets.truncate(index as usize - 1);
        self.end = new_end;
        Ok(())
    }

    pub fn last_index(&self) -> u64 {
        self.offsets.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn entry(term: u64, command: &str) -> LogEntry {
        LogEntry {
            term,
            command: command.to_string(),
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("quorum_log_storage_{}", name));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn fresh_directory() -> Result<()> {
        let dir = test_dir("fresh");
        let (storage, recovered) = Storage::open(&dir)?;
        assert_eq!(recovered.current_term, 0);
        assert_eq!(recovered.voted_for, None);
        assert!(recovered.entries.is_empty());
        assert_eq!(storage.last_index(), 0);
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn header_round_trip() -> Result<()> {
        let dir = test_dir("header");
        {
            let (mut storage, _) = Storage::open(&dir)?;
            storage.save_header(3, &Some("127.0.0.1:9001".to_string()))?;
            storage.save_header(4, &None)?;
        }
        let (_, recovered) = Storage::open(&dir)?;
        assert_eq!(recovered.current_term, 4);
        assert_eq!(recovered.voted_for, None);
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn log_round_trip_and_truncate() -> Result<()> {
        let dir = test_dir("log");
        {
            let (mut storage, _) = Storage::open(&dir)?;
            storage.append_entries(&[entry(1, "a"), entry(1, "b"), entry(2, "c")])?;
            storage.truncate_from(3)?;
            storage.append_entries(&[entry(3, "d")])?;
        }
        let (storage, recovered) = Storage::open(&dir)?;
        assert_eq!(storage.last_index(), 3);
        assert_eq!(
            recovered.entries,
            vec![entry(1, "a"), entry(1, "b"), entry(3, "d")]
        );
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn corrupt_tail_is_discarded() -> Result<()> {
        let dir = test_dir("corrupt");
        {
            let (mut storage, _) = Storage::open(&dir)?;
            storage.append_entries(&[entry(1, "a"), entry(1, "b")])?;
        }
        // Simulate a crash mid-append: a length prefix promising more
        // bytes than the file holds.
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.join(LOG_FILE))?;
            file.write_all(&999u32.to_le_bytes())?;
            file.write_all(b"garbage")?;
        }
        let (storage, recovered) = Storage::open(&dir)?;
        assert_eq!(recovered.entries, vec![entry(1, "a"), entry(1, "b")]);

        // The tail was truncated away, so appends continue cleanly.
        let mut storage = storage;
        storage.append_entries(&[entry(2, "c")])?;
        let (_, recovered) = Storage::open(&dir)?;
        assert_eq!(recovered.entries.len(), 3);
        assert_eq!(recovered.entries[2], entry(2, "c"));
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn truncate_everything() -> Result<()> {
        let dir = test_dir("truncate_all");
        {
            let (mut storage, _) = Storage::open(&dir)?;
            storage.append_entries(&[entry(1, "a"), entry(1, "b")])?;
            storage.truncate_from(1)?;
            assert_eq!(storage.last_index(), 0);
        }
        let (_, recovered) = Storage::open(&dir)?;
        assert!(recovered.entries.is_empty());
        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
