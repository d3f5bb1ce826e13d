//! Uniform provider contract over divergent LLM backends.
//!
//! Every backend is wrapped behind [`ProviderClient`] plus a per-conversation
//! [`ChatHandle`]. Callers branch on [`Capability`] flags, never on concrete
//! provider types. `ChatHandle::send` never errors across its boundary: a
//! transport or model failure yields the fixed [`FALLBACK_REPLY`] as a
//! synthetic assistant turn, appended to the handle's history so the
//! conversation stays well-formed, with the concrete fault reported
//! alongside.

pub mod gemini;
pub mod llama;
pub mod openai;

use crate::config::{EngineConfig, SamplingConfig};
use crate::error::{EngineError, Result};
use crate::session::types::Turn;

use async_trait::async_trait;

/// Shown to the user when a provider call fails. The failure is still a
/// real assistant turn so the conversation remains resumable.
pub const FALLBACK_REPLY: &str =
    "Sorry, something went wrong while generating a reply. Please try again.";

/// Optional sampling features a backend may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    TopP,
    TopK,
    Temperature,
}

/// Outcome of one chat exchange. `fault` carries the concrete provider
/// error when `text` is the synthetic fallback reply.
#[derive(Debug)]
pub struct ChatReply {
    pub text: String,
    pub fault: Option<EngineError>,
}

impl ChatReply {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fault: None,
        }
    }

    pub fn degraded(fault: EngineError) -> Self {
        Self {
            text: FALLBACK_REPLY.to_string(),
            fault: Some(fault),
        }
    }
}

/// One conversation bound to one backend. Implementations own whatever
/// backend-shaped state they need, but always expose the uniform turn view.
#[async_trait]
pub trait ChatHandle: Send {
    /// Exchange one user message for an assistant reply. Never errors:
    /// failures degrade to [`FALLBACK_REPLY`] and both turns are appended to
    /// the handle's history either way.
    async fn send(&mut self, text: &str) -> ChatReply;

    /// Conversation history in the uniform turn shape, including any
    /// synthetic failure turns.
    fn history(&self) -> Vec<Turn>;
}

/// Capability-negotiated wrapper around one LLM backend.
#[async_trait]
pub trait ProviderClient: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn model(&self) -> &str;

    fn capabilities(&self) -> &'static [Capability];

    /// Start a conversation seeded with `history`. Sampling knobs outside
    /// this provider's capability set are dropped, not forwarded.
    fn create_chat(
        &self,
        system_instruction: &str,
        history: Vec<Turn>,
        sampling: &SamplingConfig,
    ) -> Box<dyn ChatHandle>;

    /// Token count of `history` under this backend's counting strategy.
    /// Never fails: backends with exact counters degrade to the character
    /// heuristic on any internal failure. Counts are only meaningful for
    /// the provider that produced them.
    async fn count_tokens(&self, history: &[Turn]) -> u32;

    /// One-line startup banner with the model and a masked credential.
    fn ready_message(&self) -> String {
        format!("{} ready (model: {})", self.name(), self.model())
    }
}

/// Create the right provider for `engine`. Credentials are read from the
/// environment and validated before any client is built.
pub fn create_provider(config: &EngineConfig) -> Result<Box<dyn ProviderClient>> {
    let model = config.model.as_deref();
    match config.engine.as_str() {
        "gemini" | "google" => Ok(Box::new(gemini::GeminiProvider::from_env(model)?)),
        "openai" => Ok(Box::new(openai::OpenAiProvider::from_env(model)?)),
        "llama" | "llama-cpp" => Ok(Box::new(llama::LlamaProvider::from_env(model)?)),
        other => Err(EngineError::Config(format!(
            "unknown engine '{other}'; valid engines: gemini, openai, llama"
        ))),
    }
}

/// Unconditional credential validation, identical for every backend: the key
/// must be non-empty after trimming, contain no whitespace, and be pure
/// ASCII (it travels in HTTP headers).
pub fn validate_api_key(env_var: &str, raw: &str) -> Result<String> {
    let key = raw.trim();

    if key.is_empty() {
        return Err(EngineError::Config(format!(
            "{env_var} is required but not set"
        )));
    }
    if key.chars().any(char::is_whitespace) {
        return Err(EngineError::Config(format!(
            "{env_var} must not contain spaces or newlines"
        )));
    }
    if !key.is_ascii() {
        return Err(EngineError::Config(format!(
            "{env_var} contains non-ASCII characters; use the key exactly as issued"
        )));
    }

    Ok(key.to_string())
}

/// Character-based token heuristic (~4 characters per token). The universal
/// degraded counting strategy.
pub fn heuristic_tokens(history: &[Turn]) -> u32 {
    let chars: usize = history.iter().map(|t| t.text.chars().count()).sum();
    (chars / 4) as u32
}

/// Drop sampling knobs the capability set does not cover.
pub fn filter_sampling(sampling: &SamplingConfig, caps: &[Capability]) -> SamplingConfig {
    let keep = |cap: Capability| caps.contains(&cap);
    let filtered = SamplingConfig {
        top_p: sampling.top_p.filter(|_| keep(Capability::TopP)),
        top_k: sampling.top_k.filter(|_| keep(Capability::TopK)),
        temperature: sampling.temperature.filter(|_| keep(Capability::Temperature)),
    };
    if filtered != *sampling {
        tracing::debug!(?sampling, ?filtered, "dropped unsupported sampling knobs");
    }
    filtered
}

/// Mask a credential for display: first and last four characters.
pub fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        "****".to_string()
    } else {
        format!("{}...{}", &key[..4], &key[key.len() - 4..])
    }
}
