//! Top-level session orchestration: which session is active, which sessions
//! have been touched this process, and the end-of-process flush.

use super::chat::Session;
use super::store::{validate_session_id, SessionMeta, SessionStore};
use crate::assistant::Assistant;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::providers::ProviderClient;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owns the registry of known sessions and the active-session pointer.
/// One per process; all registry mutation goes through it.
pub struct SessionManager {
    store: SessionStore,
    provider: Arc<dyn ProviderClient>,
    assistant: Assistant,
    config: EngineConfig,
    sessions: HashMap<String, Arc<Session>>,
    active: Option<String>,
    cleaned_up: AtomicBool,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn ProviderClient>, config: EngineConfig) -> Self {
        Self {
            store: SessionStore::new(&config.data_dir),
            provider,
            assistant: Assistant::default(),
            config,
            sessions: HashMap::new(),
            active: None,
            cleaned_up: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Resume-or-create: a known id loads from the store; an unknown id is
    /// not an error but the seed for a new session that will use that id
    /// going forward. No id means a fresh session.
    pub fn initialize_from_cli(&mut self, session_id: Option<String>) -> Result<Arc<Session>> {
        let session = match session_id {
            Some(id) => {
                validate_session_id(&id)?;
                match self.store.load(&id) {
                    Ok(snapshot) => {
                        tracing::info!(session_id = %id, turns = snapshot.history.len(), "resumed session");
                        Arc::new(Session::resume(
                            self.provider.clone(),
                            snapshot,
                            &self.store,
                            self.config.token_budget,
                        ))
                    }
                    Err(EngineError::NotFound(_)) => {
                        tracing::info!(session_id = %id, "no stored session; starting fresh under that id");
                        self.build_session(Some(id))
                    }
                    Err(e) => return Err(e),
                }
            }
            None => self.build_session(None),
        };

        self.register(session.clone());
        Ok(session)
    }

    pub fn active_session(&self) -> Result<Arc<Session>> {
        self.active
            .as_ref()
            .and_then(|id| self.sessions.get(id))
            .cloned()
            .ok_or_else(|| EngineError::NotFound("no active session".into()))
    }

    pub fn has_active_session(&self) -> bool {
        self.active.is_some()
    }

    /// Start a fresh session, optionally flushing the outgoing one first.
    pub async fn create_new_session(&mut self, save_current: bool) -> Result<Arc<Session>> {
        if save_current {
            if let Ok(current) = self.active_session() {
                current.save(&self.store).await?;
            }
        }
        let session = self.build_session(None);
        self.register(session.clone());
        Ok(session)
    }

    /// Switch to a stored session, flushing the outgoing one first. Unlike
    /// `initialize_from_cli`, an unknown id is an error here.
    pub async fn switch_session(&mut self, session_id: &str) -> Result<Arc<Session>> {
        validate_session_id(session_id)?;
        if let Ok(current) = self.active_session() {
            if current.id() != session_id {
                if let Err(e) = current.save(&self.store).await {
                    tracing::warn!(session_id = current.id(), error = %e, "failed to flush outgoing session");
                }
            }
        }

        if let Some(session) = self.sessions.get(session_id) {
            self.active = Some(session_id.to_string());
            return Ok(session.clone());
        }

        let snapshot = self.store.load(session_id)?;
        let session = Arc::new(Session::resume(
            self.provider.clone(),
            snapshot,
            &self.store,
            self.config.token_budget,
        ));
        self.register(session.clone());
        Ok(session)
    }

    pub fn list_sessions(&self) -> Vec<SessionMeta> {
        self.store.list()
    }

    /// Delete a session's snapshot and WAL. Irreversible; the in-memory
    /// session, if loaded, is sealed without saving.
    pub async fn remove_session(&mut self, session_id: &str) -> Result<()> {
        validate_session_id(session_id)?;
        self.store.remove(session_id)?;
        if let Some(session) = self.sessions.remove(session_id) {
            session.discard().await;
        }
        if self.active.as_deref() == Some(session_id) {
            self.active = None;
        }
        Ok(())
    }

    /// Remove the active session and immediately start a fresh one.
    pub async fn remove_active_and_create_new(&mut self) -> Result<(String, Arc<Session>)> {
        let removed = self.active_session()?;
        let removed_id = removed.id().to_string();

        // The files may not exist yet for a never-saved session.
        match self.remove_session(&removed_id).await {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        removed.discard().await;

        let session = self.build_session(None);
        self.register(session.clone());
        Ok((removed_id, session))
    }

    /// End-of-process flush: close every touched session exactly once.
    /// Failures are reported, never propagated — the process must still be
    /// able to terminate.
    pub async fn cleanup_and_save(&self) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        for session in self.sessions.values() {
            if session.is_empty().await {
                continue;
            }
            if let Err(e) = session.close(&self.store).await {
                tracing::warn!(session_id = session.id(), error = %e, "cleanup save failed");
            }
        }
    }

    fn build_session(&self, id: Option<String>) -> Arc<Session> {
        Arc::new(Session::new(
            self.assistant.clone(),
            self.provider.clone(),
            self.config.sampling.clone(),
            &self.store,
            id,
            self.config.token_budget,
        ))
    }

    fn register(&mut self, session: Arc<Session>) {
        self.active = Some(session.id().to_string());
        self.sessions.insert(session.id().to_string(), session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplingConfig;
    use crate::session::chat::stub::{StubBehavior, StubProvider};
    use crate::session::chat::SessionState;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir, behavior: StubBehavior) -> SessionManager {
        let config = EngineConfig {
            engine: "stub".into(),
            model: None,
            sampling: SamplingConfig::default(),
            data_dir: tmp.path().to_path_buf(),
            token_budget: 32_768,
        };
        SessionManager::new(Arc::new(StubProvider { behavior }), config)
    }

    #[tokio::test]
    async fn initialize_without_id_creates_a_fresh_session() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp, StubBehavior::Reply("ok"));

        let session = mgr.initialize_from_cli(None).unwrap();
        assert!(mgr.has_active_session());
        assert!(!session.id().is_empty());
    }

    #[tokio::test]
    async fn unknown_cli_id_seeds_a_new_session_with_that_id() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp, StubBehavior::Reply("ok"));

        let session = mgr.initialize_from_cli(Some("abc123".into())).unwrap();
        assert_eq!(session.id(), "abc123");
        assert!(session.is_empty().await);

        // And it is usable immediately.
        let outcome = session.send_message("hi").await.unwrap();
        assert_eq!(outcome.text, "ok");
    }

    #[tokio::test]
    async fn path_like_ids_never_reach_the_store() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp, StubBehavior::Reply("ok"));

        assert!(matches!(
            mgr.initialize_from_cli(Some("../escape".into())),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            mgr.switch_session("a/b").await,
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            mgr.remove_session("..\\up").await,
            Err(EngineError::Config(_))
        ));

        // Nothing was written outside or inside the data dir.
        assert!(!mgr.has_active_session());
        assert!(!tmp.path().parent().unwrap().join("escape.wal").exists());
    }

    #[tokio::test]
    async fn initialize_resumes_a_stored_session() {
        let tmp = TempDir::new().unwrap();

        {
            let mut mgr = manager(&tmp, StubBehavior::Reply("woof"));
            let session = mgr.initialize_from_cli(Some("keep".into())).unwrap();
            session.send_message("hi").await.unwrap();
            mgr.cleanup_and_save().await;
        }

        let mut mgr = manager(&tmp, StubBehavior::Reply("woof"));
        let session = mgr.initialize_from_cli(Some("keep".into())).unwrap();
        let history = session.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text, "hi");
    }

    #[tokio::test]
    async fn switch_flushes_outgoing_and_loads_target() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp, StubBehavior::Reply("ok"));

        let first = mgr.initialize_from_cli(Some("first".into())).unwrap();
        first.send_message("hello").await.unwrap();

        // Target must exist on disk for switch (unlike initialize).
        assert!(matches!(
            mgr.switch_session("missing").await,
            Err(EngineError::NotFound(_))
        ));

        // The failed switch still flushed "first".
        assert!(mgr.store().snapshot_path("first").exists());

        let second = mgr.create_new_session(true).await.unwrap();
        second.send_message("hi").await.unwrap();
        mgr.cleanup_and_save().await;

        let mut mgr = manager(&tmp, StubBehavior::Reply("ok"));
        mgr.initialize_from_cli(None).unwrap();
        let back = mgr.switch_session("first").await.unwrap();
        assert_eq!(back.history().await.len(), 2);
        assert_eq!(mgr.active_session().unwrap().id(), "first");
    }

    #[tokio::test]
    async fn remove_deletes_files_and_seals_the_session() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp, StubBehavior::Reply("ok"));

        let session = mgr.initialize_from_cli(Some("doomed".into())).unwrap();
        session.send_message("hi").await.unwrap();
        session.save(mgr.store()).await.unwrap();

        mgr.remove_session("doomed").await.unwrap();
        assert!(!mgr.store().snapshot_path("doomed").exists());
        assert!(!mgr.has_active_session());
        assert!(matches!(
            session.send_message("more").await,
            Err(EngineError::ClosedSession(_))
        ));
    }

    #[tokio::test]
    async fn remove_active_creates_a_replacement() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp, StubBehavior::Reply("ok"));

        let session = mgr.initialize_from_cli(None).unwrap();
        let old_id = session.id().to_string();
        session.send_message("hi").await.unwrap();

        let (removed_id, fresh) = mgr.remove_active_and_create_new().await.unwrap();
        assert_eq!(removed_id, old_id);
        assert_ne!(fresh.id(), old_id);
        assert!(mgr.has_active_session());
    }

    #[tokio::test]
    async fn cleanup_runs_exactly_once_and_skips_empty_sessions() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp, StubBehavior::Reply("ok"));

        let session = mgr.initialize_from_cli(Some("real".into())).unwrap();
        session.send_message("hi").await.unwrap();
        mgr.create_new_session(true).await.unwrap(); // stays empty

        mgr.cleanup_and_save().await;
        mgr.cleanup_and_save().await; // second call is a no-op

        let listing = mgr.list_sessions();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].id, "real");
    }

    #[tokio::test]
    async fn cleanup_swallows_save_failures() {
        let tmp = TempDir::new().unwrap();
        let mut mgr = manager(&tmp, StubBehavior::Reply("ok"));

        let session = mgr.initialize_from_cli(Some("real".into())).unwrap();
        session.send_message("hi").await.unwrap();

        // Replace the data dir with a regular file: create_dir_all inside
        // the save now fails, so the snapshot write cannot succeed.
        std::fs::remove_dir_all(tmp.path()).unwrap();
        std::fs::write(tmp.path(), b"not a directory").unwrap();
        assert!(session.save(mgr.store()).await.is_err());

        // Must not panic or error even though every save fails.
        mgr.cleanup_and_save().await;
        assert_eq!(session.state().await, SessionState::Closed);
    }
}
