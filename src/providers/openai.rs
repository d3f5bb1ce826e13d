//! OpenAI chat-completions backend.
//!
//! Capability set: temperature and top-p only (no top-k on this API), and
//! heuristic token counting only — no exact encoder is wired to keep the
//! dependency surface small, matching the `~4 chars/token` strategy.

use crate::config::SamplingConfig;
use crate::error::{EngineError, Result};
use crate::providers::{
    filter_sampling, heuristic_tokens, mask_key, validate_api_key, Capability, ChatHandle,
    ChatReply, ProviderClient,
};
use crate::session::types::{Role, Turn};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

const CAPABILITIES: &[Capability] = &[Capability::TopP, Capability::Temperature];

#[derive(Debug)]
pub struct OpenAiProvider {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ─── Implementation ───────────────────────────────────────────────────────────

impl OpenAiProvider {
    pub fn new(api_key: String, model: Option<&str>, base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            client: http_client(),
        }
    }

    /// Build from `OPENAI_API_KEY` (and optional `OPENAI_BASE_URL`).
    pub fn from_env(model: Option<&str>) -> Result<Self> {
        let raw = std::env::var(API_KEY_ENV).unwrap_or_default();
        let api_key = validate_api_key(API_KEY_ENV, &raw)?;
        let base_url = std::env::var("OPENAI_BASE_URL").ok();
        Ok(Self::new(api_key, model, base_url.as_deref()))
    }
}

pub(crate) fn http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(120))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

#[async_trait]
impl ProviderClient for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn create_chat(
        &self,
        system_instruction: &str,
        history: Vec<Turn>,
        sampling: &SamplingConfig,
    ) -> Box<dyn ChatHandle> {
        Box::new(OpenAiChat {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            system_instruction: system_instruction.to_string(),
            sampling: filter_sampling(sampling, CAPABILITIES),
            history,
        })
    }

    async fn count_tokens(&self, history: &[Turn]) -> u32 {
        heuristic_tokens(history)
    }

    fn ready_message(&self) -> String {
        format!(
            "openai ready (model: {}, key: {})",
            self.model,
            mask_key(&self.api_key)
        )
    }
}

/// One OpenAI conversation. History is held wrapper-side in the uniform
/// shape and flattened into API messages on every call.
struct OpenAiChat {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    system_instruction: String,
    sampling: SamplingConfig,
    history: Vec<Turn>,
}

impl OpenAiChat {
    fn request_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        if !self.system_instruction.is_empty() {
            messages.push(Message {
                role: "system".into(),
                content: self.system_instruction.clone(),
            });
        }
        for turn in &self.history {
            messages.push(Message {
                role: match turn.role {
                    Role::User => "user".into(),
                    Role::Assistant => "assistant".into(),
                },
                content: turn.text.clone(),
            });
        }
        messages
    }

    async fn generate(&self) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: self.request_messages(),
            temperature: self.sampling.temperature,
            top_p: self.sampling.top_p,
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        tracing::debug!(url, model = %self.model, messages = request.messages.len(), "openai request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::Provider(format!("openai transport: {e}")))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| EngineError::Provider(format!("openai body: {e}")))?;

        if !status.is_success() {
            return Err(EngineError::Provider(format!(
                "openai API error ({status}): {}",
                String::from_utf8_lossy(&body)
            )));
        }

        let parsed: ChatResponse = serde_json::from_slice(&body)
            .map_err(|e| EngineError::Provider(format!("openai response decode: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| EngineError::Provider("openai returned no choices".into()))
    }
}

#[async_trait]
impl ChatHandle for OpenAiChat {
    async fn send(&mut self, text: &str) -> ChatReply {
        self.history.push(Turn::user(text));

        let reply = match self.generate().await {
            Ok(text) => ChatReply::ok(text),
            Err(fault) => {
                tracing::warn!(error = %fault, "openai generation failed; degrading");
                ChatReply::degraded(fault)
            }
        };

        self.history.push(Turn::assistant(reply.text.clone()));
        reply
    }

    fn history(&self) -> Vec<Turn> {
        self.history.clone()
    }
}
