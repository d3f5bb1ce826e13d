//! Per-session write-ahead log.
//!
//! Records are stored as JSONL: one self-describing JSON object per line, so
//! a torn final line is detectable and every complete record is replayable on
//! its own. A user turn is logged as a *pending* record before the provider
//! call; the assistant turn is logged as a *committed* record once the reply
//! is known. A WAL whose last record is pending therefore means "user asked
//! this, no confirmed answer" — the designed crash-recovery case, never a
//! loss.
//!
//! Truncation is only legal after the session snapshot has been durably
//! written (snapshot-then-truncate two-phase commit; see `store.rs`).

use super::types::Turn;
use crate::error::{EngineError, Result};

use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One WAL record. Sequence numbers are monotonic per session and form the
/// replay order; `committed` distinguishes a pending user turn from a
/// confirmed assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalRecord {
    pub session_id: String,
    pub seq: u64,
    pub turn: Turn,
    pub committed: bool,
}

/// Append-only durability log for one session. The file is exclusively owned
/// by that session; callers serialize access through the session lock.
pub struct WriteAheadLog {
    path: PathBuf,
}

impl WriteAheadLog {
    /// WAL for `session_id`, stored as `<dir>/<session_id>.wal`.
    pub fn open(dir: &Path, session_id: &str) -> Self {
        Self {
            path: dir.join(format!("{session_id}.wal")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to disk. Returns the byte offset the
    /// record was written at.
    pub fn append(&self, record: &WalRecord) -> Result<u64> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(record)
            .map_err(|e| EngineError::Corrupt(format!("unserializable WAL record: {e}")))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let offset = file.metadata()?.len();

        writeln!(file, "{line}")?;
        file.sync_data()?;

        Ok(offset)
    }

    /// Read every well-formed record in append order.
    ///
    /// A missing file reads as empty. A malformed line fatal-truncates the
    /// log at the last well-formed offset with a warning; everything before
    /// it is returned. Records are never silently dropped without signal.
    pub fn read_all(&self) -> Result<Vec<WalRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let data = fs::read_to_string(&self.path)?;
        let mut records = Vec::new();
        let mut good_offset: u64 = 0;

        for line in data.split_inclusive('\n') {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                good_offset += line.len() as u64;
                continue;
            }
            // A line without a trailing newline is a torn partial write.
            if !line.ends_with('\n') {
                tracing::warn!(
                    wal = %self.path.display(),
                    "partial WAL record at end of log; truncating at offset {good_offset}"
                );
                self.truncate_at(good_offset)?;
                break;
            }
            match serde_json::from_str::<WalRecord>(trimmed) {
                Ok(record) => {
                    good_offset += line.len() as u64;
                    records.push(record);
                }
                Err(e) => {
                    tracing::warn!(
                        wal = %self.path.display(),
                        "malformed WAL record ({e}); truncating at offset {good_offset}"
                    );
                    self.truncate_at(good_offset)?;
                    break;
                }
            }
        }

        Ok(records)
    }

    /// Discard every record. Only call after the corresponding snapshot has
    /// been durably written.
    pub fn truncate(&self) -> Result<()> {
        self.truncate_at(0)
    }

    /// Remove the WAL file entirely (session removal).
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn truncate_at(&self, offset: u64) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(offset)?;
        file.sync_data()?;
        Ok(())
    }
}

/// Append raw bytes to a WAL file. Test-support shim for simulating torn
/// writes and foreign garbage.
#[doc(hidden)]
pub fn append_raw(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_data()
}
