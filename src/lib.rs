#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

pub mod assistant;
pub mod config;
pub mod error;
pub mod providers;
pub mod session;
pub mod tokens;

pub use assistant::Assistant;
pub use config::{EngineConfig, SamplingConfig};
pub use error::{EngineError, Result};
pub use providers::{create_provider, Capability, ChatHandle, ChatReply, ProviderClient};
pub use session::{Session, SessionManager, SessionStore};
pub use tokens::{TokenAccountant, TokenInfo, TokenUsage};
