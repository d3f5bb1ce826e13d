//! One durable conversation: history, lifecycle, and the WAL discipline.
//!
//! All mutation happens under one per-session async lock, so concurrent
//! `send_message` calls on the same session serialize and WAL sequence
//! numbers stay monotonic. The provider call is the only suspension point
//! expected to block for real wall-clock time; a crash during it leaves a
//! pending WAL record, which is the designed recovery case.

use super::store::{SessionStore, Snapshot};
use super::types::{export_view, ExportTurn, Turn};
use super::wal::{WalRecord, WriteAheadLog};
use crate::assistant::Assistant;
use crate::config::SamplingConfig;
use crate::error::{EngineError, Result};
use crate::providers::{ChatHandle, ProviderClient};
use crate::tokens::{TokenAccountant, TokenInfo};

use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Session lifecycle. `Closing` is only ever observable from inside the
/// session lock while a close is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Empty,
    Active,
    Closing,
    Closed,
}

/// What one `send_message` hands back: the reply text, the current token
/// budget view, and the concrete provider fault when the reply is the
/// synthetic fallback.
#[derive(Debug)]
pub struct SendOutcome {
    pub text: String,
    pub token_info: TokenInfo,
    pub fault: Option<String>,
}

struct SessionInner {
    state: SessionState,
    history: Vec<Turn>,
    chat: Box<dyn ChatHandle>,
    /// Next WAL sequence number to assign.
    next_seq: u64,
}

/// A single durable conversation bound to one provider. Exclusively owns
/// its history and WAL tail.
pub struct Session {
    id: String,
    assistant: Assistant,
    provider: Arc<dyn ProviderClient>,
    sampling: SamplingConfig,
    token_budget: u32,
    wal: WriteAheadLog,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// Fresh session. `id` is honored when given (resume-or-create keeps
    /// the requested id), otherwise a UUID is minted.
    pub fn new(
        assistant: Assistant,
        provider: Arc<dyn ProviderClient>,
        sampling: SamplingConfig,
        store: &SessionStore,
        id: Option<String>,
        token_budget: u32,
    ) -> Self {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let chat = provider.create_chat(assistant.system_prompt(), Vec::new(), &sampling);
        let wal = store.wal(&id);
        Self {
            id,
            assistant,
            provider,
            sampling,
            token_budget,
            wal,
            inner: Mutex::new(SessionInner {
                state: SessionState::Empty,
                history: Vec::new(),
                chat,
                next_seq: 1,
            }),
        }
    }

    /// Rebuild a session from a reconciled snapshot (see `SessionStore::load`).
    pub fn resume(
        provider: Arc<dyn ProviderClient>,
        snapshot: Snapshot,
        store: &SessionStore,
        token_budget: u32,
    ) -> Self {
        let assistant = Assistant::new(snapshot.assistant_name, snapshot.system_prompt);
        let chat = provider.create_chat(
            assistant.system_prompt(),
            snapshot.history.clone(),
            &snapshot.sampling,
        );
        let wal = store.wal(&snapshot.session_id);
        let state = if snapshot.history.is_empty() {
            SessionState::Empty
        } else {
            SessionState::Active
        };
        Self {
            id: snapshot.session_id,
            assistant,
            provider,
            sampling: snapshot.sampling,
            token_budget,
            wal,
            inner: Mutex::new(SessionInner {
                state,
                history: snapshot.history,
                chat,
                next_seq: snapshot.last_seq + 1,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn assistant_name(&self) -> &str {
        self.assistant.name()
    }

    pub fn provider(&self) -> &dyn ProviderClient {
        self.provider.as_ref()
    }

    /// Exchange one user message for a reply.
    ///
    /// The user turn is WAL-logged as pending *before* the provider call and
    /// the assistant turn as committed after it, so a crash anywhere in
    /// between loses at most the unconfirmed reply, never the question.
    /// Provider failure is not an error here: the synthetic fallback turn
    /// keeps the conversation well-formed and the fault rides along in the
    /// outcome.
    pub async fn send_message(&self, text: &str) -> Result<SendOutcome> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        let seq = inner.next_seq;
        let user_turn = Turn::user(text);
        self.wal.append(&WalRecord {
            session_id: self.id.clone(),
            seq,
            turn: user_turn.clone(),
            committed: false,
        })?;

        let reply = inner.chat.send(text).await;
        let assistant_turn = Turn::assistant(reply.text.clone());

        inner.history.push(user_turn);
        inner.history.push(assistant_turn.clone());
        inner.next_seq = seq + 2;
        inner.state = SessionState::Active;

        self.wal.append(&WalRecord {
            session_id: self.id.clone(),
            seq: seq + 1,
            turn: assistant_turn,
            committed: true,
        })?;

        let usage = TokenAccountant::estimate(self.provider.as_ref(), &inner.history).await;

        Ok(SendOutcome {
            text: reply.text,
            token_info: TokenInfo::new(usage.total, self.token_budget),
            fault: reply.fault.map(|e| e.to_string()),
        })
    }

    /// Current token budget view under this session's provider.
    pub async fn token_info(&self) -> TokenInfo {
        let inner = self.inner.lock().await;
        let usage = TokenAccountant::estimate(self.provider.as_ref(), &inner.history).await;
        TokenInfo::new(usage.total, self.token_budget)
    }

    pub async fn history(&self) -> Vec<Turn> {
        self.inner.lock().await.history.clone()
    }

    /// Read-only history in the universal `{role, parts:[{text}]}` shape.
    pub async fn export_history(&self) -> Vec<ExportTurn> {
        export_view(&self.inner.lock().await.history)
    }

    /// True until the first complete exchange exists.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.history.len() < 2
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Snapshot-then-truncate. Sessions without a complete exchange are not
    /// snapshotted (their WAL, pending turn included, stays put); returns
    /// whether a snapshot was written.
    pub async fn save(&self, store: &SessionStore) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;
        self.persist(store, &mut inner, false)
    }

    /// Wipe the conversation and start over on a fresh chat handle. The
    /// cleared state is persisted immediately.
    pub async fn clear_history(&self, store: &SessionStore) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        inner.history.clear();
        inner.chat =
            self.provider
                .create_chat(self.assistant.system_prompt(), Vec::new(), &self.sampling);
        inner.state = SessionState::Empty;

        self.persist(store, &mut inner, true)?;
        Ok(())
    }

    /// Drop the trailing user/assistant pair. Returns false when there is
    /// no complete exchange to drop.
    pub async fn pop_last_exchange(&self, store: &SessionStore) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        if inner.history.len() < 2 {
            return Ok(false);
        }
        let new_len = inner.history.len() - 2;
        inner.history.truncate(new_len);
        inner.chat = self.provider.create_chat(
            self.assistant.system_prompt(),
            inner.history.clone(),
            &self.sampling,
        );
        if inner.history.is_empty() {
            inner.state = SessionState::Empty;
        }

        self.persist(store, &mut inner, true)?;
        Ok(true)
    }

    /// Flush and seal the session. Idempotent; afterwards every operation
    /// fails with `ClosedSession`.
    pub async fn close(&self, store: &SessionStore) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Closed {
            return Ok(());
        }
        inner.state = SessionState::Closing;
        let result = self.persist(store, &mut inner, false);
        inner.state = SessionState::Closed;
        result.map(|_| ())
    }

    /// Seal without saving. Used when the session's files have just been
    /// removed from disk.
    pub async fn discard(&self) {
        self.inner.lock().await.state = SessionState::Closed;
    }

    fn ensure_open(&self, inner: &SessionInner) -> Result<()> {
        match inner.state {
            SessionState::Closed | SessionState::Closing => {
                Err(EngineError::ClosedSession(self.id.clone()))
            }
            SessionState::Empty | SessionState::Active => Ok(()),
        }
    }

    /// Two-phase commit: durable snapshot first, WAL truncate second. When
    /// `force` is false, histories without a complete exchange are skipped —
    /// and so is the truncate, because a pending WAL turn is then the only
    /// durable record of the conversation.
    fn persist(&self, store: &SessionStore, inner: &mut SessionInner, force: bool) -> Result<bool> {
        if !force && inner.history.len() < 2 {
            return Ok(false);
        }

        let snapshot = Snapshot {
            session_id: self.id.clone(),
            assistant_name: self.assistant.name().to_string(),
            system_prompt: self.assistant.system_prompt().to_string(),
            model: self.provider.model().to_string(),
            sampling: self.sampling.clone(),
            last_seq: inner.next_seq - 1,
            history: inner.history.clone(),
        };
        store.save(&snapshot)?;
        self.wal.truncate()?;
        Ok(true)
    }
}
