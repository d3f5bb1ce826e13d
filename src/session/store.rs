//! Snapshot persistence and startup reconciliation.
//!
//! One snapshot file (`<id>.json`) and one WAL file (`<id>.wal`) per session,
//! both under the engine data directory. A snapshot is the consolidated,
//! WAL-free form of a session; `load` is the sole recovery path and replays
//! any WAL tail past the snapshot's `last_seq` marker before returning.
//! Sequence-number deduplication makes that replay idempotent: a crash
//! between snapshot write and WAL truncate leaves redundant records that are
//! recognized and discarded instead of double-applied.

use super::types::Turn;
use super::wal::WriteAheadLog;
use crate::assistant::Assistant;
use crate::config::SamplingConfig;
use crate::error::{EngineError, Result};

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Serialized form of a session, written on save and read on resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub session_id: String,
    pub assistant_name: String,
    pub system_prompt: String,
    pub model: String,
    #[serde(default)]
    pub sampling: SamplingConfig,
    /// Highest WAL sequence number reflected in `history`. WAL records at or
    /// below this marker are already applied and must not replay again.
    #[serde(default)]
    pub last_seq: u64,
    pub history: Vec<Turn>,
}

/// Listing metadata for one stored session. Unreadable files report an
/// error string instead of failing the whole listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub id: String,
    pub turns: usize,
    pub last_activity: Option<String>,
    pub error: Option<String>,
}

/// Session ids become file names under the data directory. Reject anything
/// that could resolve outside it.
pub fn validate_session_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(EngineError::Config("session id must not be empty".into()));
    }
    if id.contains(['/', '\\', '\0']) || id.contains("..") {
        return Err(EngineError::Config(format!(
            "invalid session id '{id}': path separators are not allowed"
        )));
    }
    Ok(())
}

/// Loads, lists, and persists session snapshots, reconciling each snapshot
/// with its WAL tail on load.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    /// The WAL handle for `session_id`. Exclusively owned by that session's
    /// lock; the store itself only reads it during `load`.
    pub fn wal(&self, session_id: &str) -> WriteAheadLog {
        WriteAheadLog::open(&self.dir, session_id)
    }

    /// All stored session ids with listing metadata, sorted by id.
    pub fn list(&self) -> Vec<SessionMeta> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut ids: Vec<String> = entries
            .filter_map(std::result::Result::ok)
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".json").map(str::to_string)
            })
            .collect();
        ids.sort();

        ids.into_iter()
            .map(|id| match self.read_snapshot(&id) {
                Ok(Some(snapshot)) => SessionMeta {
                    id,
                    turns: snapshot.history.len(),
                    last_activity: snapshot.history.last().map(|t| t.timestamp.clone()),
                    error: None,
                },
                Ok(None) => SessionMeta {
                    id,
                    turns: 0,
                    last_activity: None,
                    error: None,
                },
                Err(e) => SessionMeta {
                    id,
                    turns: 0,
                    last_activity: None,
                    error: Some(e.to_string()),
                },
            })
            .collect()
    }

    /// Load a session: snapshot first, then replay any WAL records past the
    /// snapshot's `last_seq`. If only a WAL exists (crash before the first
    /// save), the session is reconstructed purely from replay.
    pub fn load(&self, session_id: &str) -> Result<Snapshot> {
        let snapshot = self.read_snapshot(session_id)?;
        let wal = self.wal(session_id);
        let records = wal.read_all()?;

        let mut snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None if records.is_empty() => {
                return Err(EngineError::NotFound(session_id.to_string()));
            }
            // First-ever message happened before any save: rebuild from the
            // WAL alone, with the stock persona.
            None => {
                let assistant = Assistant::default();
                Snapshot {
                    session_id: session_id.to_string(),
                    assistant_name: assistant.name().to_string(),
                    system_prompt: assistant.system_prompt().to_string(),
                    model: String::new(),
                    sampling: SamplingConfig::default(),
                    last_seq: 0,
                    history: Vec::new(),
                }
            }
        };

        let mut replayed = 0usize;
        for record in records {
            if record.seq <= snapshot.last_seq {
                // Already reconciled into the snapshot; the crash happened
                // between snapshot write and WAL truncate.
                continue;
            }
            snapshot.last_seq = record.seq;
            snapshot.history.push(record.turn);
            replayed += 1;
        }

        if replayed > 0 {
            tracing::info!(
                session_id,
                replayed,
                "recovered turns from WAL tail"
            );
        }

        Ok(snapshot)
    }

    /// Durably write `snapshot`: temp file, flush, fsync, rename. The
    /// caller truncates the WAL only after this returns — the two phases of
    /// the commit, in that order.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let data = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| EngineError::Corrupt(format!("unserializable snapshot: {e}")))?;

        let path = self.snapshot_path(&snapshot.session_id);
        let tmp = path.with_extension("json.tmp");

        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Delete snapshot and WAL for `session_id`. Irreversible.
    pub fn remove(&self, session_id: &str) -> Result<()> {
        let path = self.snapshot_path(session_id);
        let wal = self.wal(session_id);

        let had_snapshot = path.exists();
        let had_wal = wal.path().exists();
        if !had_snapshot && !had_wal {
            return Err(EngineError::NotFound(session_id.to_string()));
        }

        if had_snapshot {
            fs::remove_file(&path)?;
        }
        wal.remove()?;
        Ok(())
    }

    fn read_snapshot(&self, session_id: &str) -> Result<Option<Snapshot>> {
        let path = self.snapshot_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)?;
        let snapshot = serde_json::from_str(&data).map_err(|e| {
            EngineError::Corrupt(format!("snapshot {}: {e}", path.display()))
        })?;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::Role;
    use crate::session::wal::WalRecord;
    use tempfile::TempDir;

    fn snapshot(id: &str, turns: usize, last_seq: u64) -> Snapshot {
        let history = (0..turns)
            .map(|i| {
                if i % 2 == 0 {
                    Turn::user(format!("prompt {i}"))
                } else {
                    Turn::assistant(format!("reply {i}"))
                }
            })
            .collect();
        Snapshot {
            session_id: id.into(),
            assistant_name: "Retriever".into(),
            system_prompt: "You are a helpful dog.".into(),
            model: "gemini-2.5-flash".into(),
            sampling: SamplingConfig::default(),
            last_seq,
            history,
        }
    }

    fn wal_record(id: &str, seq: u64, committed: bool) -> WalRecord {
        WalRecord {
            session_id: id.into(),
            seq,
            turn: if committed {
                Turn::assistant(format!("wal reply {seq}"))
            } else {
                Turn::user(format!("wal prompt {seq}"))
            },
            committed,
        }
    }

    #[test]
    fn path_like_session_ids_are_rejected() {
        assert!(validate_session_id("abc123").is_ok());
        assert!(validate_session_id("my-notes_2.old").is_ok());

        for bad in ["", "  ", "../escape", "a/b", "a\\b", "..", "a\0b"] {
            assert!(
                matches!(validate_session_id(bad), Err(EngineError::Config(_))),
                "id {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn save_then_load_roundtrips() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());

        let snap = snapshot("sess-1", 4, 4);
        store.save(&snap).unwrap();

        let loaded = store.load("sess-1").unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn load_unknown_id_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        assert!(matches!(
            store.load("missing"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn load_replays_wal_tail_past_snapshot_marker() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());

        store.save(&snapshot("sess-1", 2, 2)).unwrap();

        let wal = store.wal("sess-1");
        wal.append(&wal_record("sess-1", 3, false)).unwrap();
        wal.append(&wal_record("sess-1", 4, true)).unwrap();

        let loaded = store.load("sess-1").unwrap();
        assert_eq!(loaded.history.len(), 4);
        assert_eq!(loaded.last_seq, 4);
        assert_eq!(loaded.history[2].text, "wal prompt 3");
        assert_eq!(loaded.history[3].text, "wal reply 4");
    }

    #[test]
    fn redundant_wal_records_are_not_double_applied() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());

        // Crash between snapshot write and WAL truncate: the snapshot
        // already contains the turns the WAL still holds.
        store.save(&snapshot("sess-1", 4, 4)).unwrap();
        let wal = store.wal("sess-1");
        wal.append(&wal_record("sess-1", 3, false)).unwrap();
        wal.append(&wal_record("sess-1", 4, true)).unwrap();

        let loaded = store.load("sess-1").unwrap();
        assert_eq!(loaded.history.len(), 4);
        assert_eq!(loaded.last_seq, 4);
    }

    #[test]
    fn double_replay_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());

        store.save(&snapshot("sess-1", 2, 2)).unwrap();
        let wal = store.wal("sess-1");
        wal.append(&wal_record("sess-1", 3, false)).unwrap();
        wal.append(&wal_record("sess-1", 4, true)).unwrap();

        let first = store.load("sess-1").unwrap();
        let second = store.load("sess-1").unwrap();
        assert_eq!(first, second);
        assert_eq!(second.history.len(), 4);
    }

    #[test]
    fn wal_only_session_is_rebuilt_from_replay() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());

        let wal = store.wal("fresh");
        wal.append(&wal_record("fresh", 1, false)).unwrap();
        wal.append(&wal_record("fresh", 2, true)).unwrap();
        wal.append(&wal_record("fresh", 3, false)).unwrap(); // no reply yet

        let loaded = store.load("fresh").unwrap();
        assert_eq!(loaded.history.len(), 3);
        assert_eq!(loaded.last_seq, 3);
        assert_eq!(loaded.history[2].role, Role::User);
    }

    #[test]
    fn corrupt_snapshot_is_reported_not_swallowed() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());

        fs::create_dir_all(tmp.path()).unwrap();
        fs::write(store.snapshot_path("bad"), b"{ definitely not json").unwrap();

        assert!(matches!(store.load("bad"), Err(EngineError::Corrupt(_))));
    }

    #[test]
    fn list_reports_readable_and_corrupt_sessions() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());

        store.save(&snapshot("aaa", 2, 2)).unwrap();
        fs::write(store.snapshot_path("bbb"), b"garbage").unwrap();

        let listing = store.list();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].id, "aaa");
        assert_eq!(listing[0].turns, 2);
        assert!(listing[0].error.is_none());
        assert!(listing[0].last_activity.is_some());
        assert_eq!(listing[1].id, "bbb");
        assert!(listing[1].error.is_some());
    }

    #[test]
    fn remove_deletes_snapshot_and_wal() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());

        store.save(&snapshot("sess-1", 2, 2)).unwrap();
        store.wal("sess-1").append(&wal_record("sess-1", 3, false)).unwrap();

        store.remove("sess-1").unwrap();
        assert!(!store.snapshot_path("sess-1").exists());
        assert!(!store.wal("sess-1").path().exists());
        assert!(matches!(
            store.remove("sess-1"),
            Err(EngineError::NotFound(_))
        ));
    }
}
