//! Error taxonomy for the session engine.
//!
//! Per-message failures never abort the process: provider faults degrade to
//! a synthetic assistant turn, and storage faults surface to the caller while
//! the session stays live in memory. Only `Config` errors at startup are
//! treated as fatal by the binary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad or missing credential / engine configuration. Fatal at provider
    /// construction time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transport or model failure. Recovered locally as a synthetic
    /// assistant turn; the conversation continues.
    #[error("provider failure: {0}")]
    Provider(String),

    /// WAL or snapshot read/write failure. Surfaced to the caller; the
    /// session stays in memory uncommitted.
    #[error("storage failure: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed snapshot or unreplayable WAL. The session is unloadable
    /// until an operator intervenes.
    #[error("corrupt session data: {0}")]
    Corrupt(String),

    /// Unknown session id. Callers that resume-by-id treat this as a seed
    /// for a new session rather than a failure.
    #[error("no session with id '{0}'")]
    NotFound(String),

    /// Operation attempted on a closed session. Programmer error, fatal to
    /// the call.
    #[error("session '{0}' is closed")]
    ClosedSession(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
