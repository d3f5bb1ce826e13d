//! End-to-end durability scenarios driven through the public API with an
//! in-memory provider: crash recovery from the WAL, replay idempotence, and
//! resume-or-create across process restarts.

use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;

use retriever::config::{EngineConfig, SamplingConfig};
use retriever::providers::{heuristic_tokens, Capability, ChatHandle, ChatReply, ProviderClient};
use retriever::session::{Role, SessionManager, SessionStore, Turn};
use retriever::Assistant;

#[derive(Debug)]
struct EchoProvider;

struct EchoChat {
    history: Vec<Turn>,
}

#[async_trait]
impl ProviderClient for EchoProvider {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn model(&self) -> &str {
        "echo-1"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Temperature]
    }

    fn create_chat(
        &self,
        _system_instruction: &str,
        history: Vec<Turn>,
        _sampling: &SamplingConfig,
    ) -> Box<dyn ChatHandle> {
        Box::new(EchoChat { history })
    }

    async fn count_tokens(&self, history: &[Turn]) -> u32 {
        heuristic_tokens(history)
    }
}

#[async_trait]
impl ChatHandle for EchoChat {
    async fn send(&mut self, text: &str) -> ChatReply {
        self.history.push(Turn::user(text));
        let reply = ChatReply::ok(format!("echo: {text}"));
        self.history.push(Turn::assistant(reply.text.clone()));
        reply
    }

    fn history(&self) -> Vec<Turn> {
        self.history.clone()
    }
}

fn config_for(tmp: &TempDir) -> EngineConfig {
    EngineConfig {
        engine: "echo".into(),
        model: None,
        sampling: SamplingConfig::default(),
        data_dir: tmp.path().to_path_buf(),
        token_budget: 32_768,
    }
}

fn manager_for(tmp: &TempDir) -> SessionManager {
    SessionManager::new(Arc::new(EchoProvider), config_for(tmp))
}

#[tokio::test]
async fn history_survives_a_crash_without_any_save() {
    let tmp = TempDir::new().unwrap();

    // "Process one": chat, then die without cleanup_and_save.
    let live_history = {
        let mut mgr = manager_for(&tmp);
        let session = mgr.initialize_from_cli(Some("crashy".into())).unwrap();
        session.send_message("first question").await.unwrap();
        session.send_message("second question").await.unwrap();
        session.history().await
    };

    // "Process two": resume from disk. Everything lives in the WAL.
    let mut mgr = manager_for(&tmp);
    let session = mgr.initialize_from_cli(Some("crashy".into())).unwrap();
    let recovered = session.history().await;

    assert_eq!(recovered, live_history);
    assert_eq!(recovered.len(), 4);
    assert_eq!(recovered[3].text, "echo: second question");

    // The resumed session keeps working and keeps its durability.
    session.send_message("third question").await.unwrap();
    mgr.cleanup_and_save().await;

    let mut mgr = manager_for(&tmp);
    let session = mgr.initialize_from_cli(Some("crashy".into())).unwrap();
    assert_eq!(session.history().await.len(), 6);
}

#[tokio::test]
async fn replaying_the_same_wal_twice_changes_nothing() {
    let tmp = TempDir::new().unwrap();

    {
        let mut mgr = manager_for(&tmp);
        let session = mgr.initialize_from_cli(Some("twice".into())).unwrap();
        session.send_message("hello").await.unwrap();
        // No save: the WAL is the only record.
    }

    let store = SessionStore::new(tmp.path());
    let first = store.load("twice").unwrap();
    let second = store.load("twice").unwrap();

    assert_eq!(first.history, second.history);
    assert_eq!(first.last_seq, second.last_seq);
    assert_eq!(first.history.len(), 2);
}

#[tokio::test]
async fn snapshot_plus_stale_wal_does_not_duplicate_turns() {
    let tmp = TempDir::new().unwrap();
    let store = SessionStore::new(tmp.path());

    {
        let mut mgr = manager_for(&tmp);
        let session = mgr.initialize_from_cli(Some("torn".into())).unwrap();
        session.send_message("hello").await.unwrap();
        // Phase one of the two-phase save completed, phase two did not:
        // snapshot on disk, WAL never truncated.
        let snapshot = retriever::session::Snapshot {
            session_id: "torn".into(),
            assistant_name: Assistant::default().name().to_string(),
            system_prompt: Assistant::default().system_prompt().to_string(),
            model: "echo-1".into(),
            sampling: SamplingConfig::default(),
            last_seq: 2,
            history: session.history().await,
        };
        store.save(&snapshot).unwrap();
    }

    let loaded = store.load("torn").unwrap();
    assert_eq!(loaded.history.len(), 2);
    assert_eq!(loaded.history[0].role, Role::User);
}

#[tokio::test]
async fn unknown_id_seeds_and_later_resumes_under_that_id() {
    let tmp = TempDir::new().unwrap();

    {
        let mut mgr = manager_for(&tmp);
        // Nothing stored under this id yet; it must not be an error.
        let session = mgr.initialize_from_cli(Some("chosen-name".into())).unwrap();
        assert_eq!(session.id(), "chosen-name");
        session.send_message("remember me").await.unwrap();
        mgr.cleanup_and_save().await;
    }

    let mut mgr = manager_for(&tmp);
    let session = mgr.initialize_from_cli(Some("chosen-name".into())).unwrap();
    let history = session.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].text, "remember me");
}

#[tokio::test]
async fn sessions_are_isolated_on_disk() {
    let tmp = TempDir::new().unwrap();
    let mut mgr = manager_for(&tmp);

    let a = mgr.initialize_from_cli(Some("a".into())).unwrap();
    a.send_message("for a").await.unwrap();

    let b = mgr.create_new_session(true).await.unwrap();
    let b_id = b.id().to_string();
    b.send_message("for b").await.unwrap();
    mgr.cleanup_and_save().await;

    let store = SessionStore::new(tmp.path());
    let a = store.load("a").unwrap();
    assert_eq!(a.history.len(), 2);
    assert_eq!(a.history[0].text, "for a");

    let b = store.load(&b_id).unwrap();
    assert_eq!(b.history.len(), 2);
    assert_eq!(b.history[0].text, "for b");
}
