//! Durable conversation sessions: history types, write-ahead log, snapshot
//! store, the session state machine, and the manager that orchestrates them.

pub mod chat;
pub mod manager;
pub mod store;
pub mod types;
pub mod wal;

pub use chat::{SendOutcome, Session, SessionState};
pub use manager::SessionManager;
pub use store::{SessionMeta, SessionStore, Snapshot};
pub use types::{ExportPart, ExportTurn, Role, Turn};
pub use wal::{WalRecord, WriteAheadLog};
