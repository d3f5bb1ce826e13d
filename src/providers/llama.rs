//! Local llama.cpp server backend.
//!
//! Talks to a running `llama-server` over its OpenAI-compatible chat
//! endpoint, which accepts the full sampling surface (temperature, top-p,
//! top-k). Token counting is exact through the server's `/tokenize`
//! endpoint, degrading to the character heuristic whenever the tokenizer is
//! unreachable or answers garbage. No credential is required for a local
//! server; if `LLAMA_API_KEY` is set (for `--api-key` deployments) it is
//! validated like every other backend credential.

use crate::config::SamplingConfig;
use crate::error::{EngineError, Result};
use crate::providers::{
    filter_sampling, heuristic_tokens, openai::http_client, validate_api_key, Capability,
    ChatHandle, ChatReply, ProviderClient,
};
use crate::session::types::{Role, Turn};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_MODEL: &str = "llama-3.1-8b-instruct";
const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const API_KEY_ENV: &str = "LLAMA_API_KEY";
pub const BASE_URL_ENV: &str = "LLAMA_BASE_URL";

const CAPABILITIES: &[Capability] =
    &[Capability::TopP, Capability::TopK, Capability::Temperature];

#[derive(Debug)]
pub struct LlamaProvider {
    base_url: String,
    api_key: Option<String>,
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
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
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

#[derive(Debug, Serialize)]
struct TokenizeRequest<'a> {
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenizeResponse {
    tokens: Vec<i64>,
}

// ─── Implementation ───────────────────────────────────────────────────────────

impl LlamaProvider {
    pub fn new(base_url: Option<&str>, api_key: Option<String>, model: Option<&str>) -> Self {
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

    /// Build from `LLAMA_BASE_URL` / `LLAMA_API_KEY`. The key is optional,
    /// but when present it must pass the same validation as every other
    /// backend credential.
    pub fn from_env(model: Option<&str>) -> Result<Self> {
        let base_url = std::env::var(BASE_URL_ENV).ok();
        let api_key = match std::env::var(API_KEY_ENV) {
            Ok(raw) => Some(validate_api_key(API_KEY_ENV, &raw)?),
            Err(_) => None,
        };
        Ok(Self::new(base_url.as_deref(), api_key, model))
    }

    fn history_text(history: &[Turn]) -> String {
        history
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl ProviderClient for LlamaProvider {
    fn name(&self) -> &'static str {
        "llama"
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
        Box::new(LlamaChat {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            system_instruction: system_instruction.to_string(),
            sampling: filter_sampling(sampling, CAPABILITIES),
            history,
        })
    }

    /// Exact count via the server tokenizer; character heuristic when the
    /// tokenizer cannot be reached.
    async fn count_tokens(&self, history: &[Turn]) -> u32 {
        if history.is_empty() {
            return 0;
        }
        let text = Self::history_text(history);
        let url = format!("{}/tokenize", self.base_url);

        let exact: Result<u32> = async {
            let mut request = self
                .client
                .post(&url)
                .json(&TokenizeRequest { content: &text });
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            let response = request
                .send()
                .await
                .map_err(|e| EngineError::Provider(format!("llama tokenize: {e}")))?;
            if !response.status().is_success() {
                return Err(EngineError::Provider(format!(
                    "llama tokenize status {}",
                    response.status()
                )));
            }
            let parsed: TokenizeResponse = response
                .json()
                .await
                .map_err(|e| EngineError::Provider(format!("llama tokenize decode: {e}")))?;
            Ok(parsed.tokens.len() as u32)
        }
        .await;

        match exact {
            Ok(total) => total,
            Err(e) => {
                tracing::warn!(error = %e, "llama token counting degraded to heuristic");
                heuristic_tokens(history)
            }
        }
    }

    fn ready_message(&self) -> String {
        format!("llama ready (model: {}, server: {})", self.model, self.base_url)
    }
}

/// One llama.cpp conversation, history held wrapper-side.
struct LlamaChat {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    system_instruction: String,
    sampling: SamplingConfig,
    history: Vec<Turn>,
}

impl LlamaChat {
    async fn generate(&self) -> Result<String> {
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

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: self.sampling.temperature,
            top_p: self.sampling.top_p,
            top_k: self.sampling.top_k,
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        tracing::debug!(url, model = %self.model, "llama request");

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            EngineError::Provider(format!(
                "llama transport: {e}. Is llama-server running at {}?",
                self.base_url
            ))
        })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| EngineError::Provider(format!("llama body: {e}")))?;

        if !status.is_success() {
            return Err(EngineError::Provider(format!(
                "llama API error ({status}): {}",
                String::from_utf8_lossy(&body)
            )));
        }

        let parsed: ChatResponse = serde_json::from_slice(&body)
            .map_err(|e| EngineError::Provider(format!("llama response decode: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| EngineError::Provider("llama returned no choices".into()))
    }
}

#[async_trait]
impl ChatHandle for LlamaChat {
    async fn send(&mut self, text: &str) -> ChatReply {
        self.history.push(Turn::user(text));

        let reply = match self.generate().await {
            Ok(text) => ChatReply::ok(text),
            Err(fault) => {
                tracing::warn!(error = %fault, "llama generation failed; degrading");
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
