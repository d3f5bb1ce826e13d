//! Google Gemini backend.
//!
//! The chat handle is stateful: it accumulates backend-shaped `contents`
//! (Gemini's `user`/`model` roles) and re-sends them on every call, the way
//! the genai chat surface works. The wrapper still exposes the uniform turn
//! view regardless. Sampling goes through Gemini's native
//! `generationConfig`; token counting uses the `:countTokens` endpoint with
//! the character heuristic as fallback.

use crate::config::SamplingConfig;
use crate::error::{EngineError, Result};
use crate::providers::{
    filter_sampling, heuristic_tokens, mask_key, openai::http_client, validate_api_key,
    Capability, ChatHandle, ChatReply, ProviderClient,
};
use crate::session::types::{Role, Turn};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

const CAPABILITIES: &[Capability] =
    &[Capability::TopP, Capability::TopK, Capability::Temperature];

#[derive(Debug)]
pub struct GeminiProvider {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: &'a [Content],
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(rename = "topP", skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(rename = "topK", skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Option<Vec<Candidate>>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Serialize)]
struct CountTokensRequest<'a> {
    contents: &'a [Content],
}

#[derive(Debug, Deserialize)]
struct CountTokensResponse {
    #[serde(rename = "totalTokens", default)]
    total_tokens: u32,
}

// ─── Implementation ───────────────────────────────────────────────────────────

impl GeminiProvider {
    pub fn new(api_key: String, model: Option<&str>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            client: http_client(),
        }
    }

    /// Build from `GEMINI_API_KEY`.
    pub fn from_env(model: Option<&str>) -> Result<Self> {
        let raw = std::env::var(API_KEY_ENV).unwrap_or_default();
        let api_key = validate_api_key(API_KEY_ENV, &raw)?;
        Ok(Self::new(api_key, model))
    }

    fn contents_from(history: &[Turn]) -> Vec<Content> {
        history
            .iter()
            .map(|turn| Content {
                role: gemini_role(turn.role).to_string(),
                parts: vec![Part {
                    text: turn.text.clone(),
                }],
            })
            .collect()
    }
}

fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

#[async_trait]
impl ProviderClient for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
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
        Box::new(GeminiChat {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            system_instruction: system_instruction.to_string(),
            sampling: filter_sampling(sampling, CAPABILITIES),
            contents: Self::contents_from(&history),
            history,
        })
    }

    /// Exact count via `:countTokens`; character heuristic on any failure.
    async fn count_tokens(&self, history: &[Turn]) -> u32 {
        if history.is_empty() {
            return 0;
        }
        let contents = Self::contents_from(history);
        let url = format!(
            "{}/models/{}:countTokens?key={}",
            self.base_url, self.model, self.api_key
        );
        let request = CountTokensRequest {
            contents: &contents,
        };

        let exact: Result<u32> = async {
            let response = self
                .client
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(|e| EngineError::Provider(format!("gemini countTokens: {e}")))?;
            if !response.status().is_success() {
                return Err(EngineError::Provider(format!(
                    "gemini countTokens status {}",
                    response.status()
                )));
            }
            let parsed: CountTokensResponse = response
                .json()
                .await
                .map_err(|e| EngineError::Provider(format!("gemini countTokens decode: {e}")))?;
            Ok(parsed.total_tokens)
        }
        .await;

        match exact {
            Ok(total) => total,
            Err(e) => {
                tracing::warn!(error = %e, "gemini token counting degraded to heuristic");
                heuristic_tokens(history)
            }
        }
    }

    fn ready_message(&self) -> String {
        format!(
            "gemini ready (model: {}, key: {})",
            self.model,
            mask_key(&self.api_key)
        )
    }
}

/// One Gemini conversation. `contents` is the backend-shaped state that
/// grows with every exchange; `history` mirrors it in the uniform shape.
struct GeminiChat {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    system_instruction: String,
    sampling: SamplingConfig,
    contents: Vec<Content>,
    history: Vec<Turn>,
}

impl GeminiChat {
    async fn generate(&self) -> Result<String> {
        let request = GenerateContentRequest {
            contents: &self.contents,
            system_instruction: (!self.system_instruction.is_empty()).then(|| {
                SystemInstruction {
                    parts: vec![Part {
                        text: self.system_instruction.clone(),
                    }],
                }
            }),
            generation_config: GenerationConfig {
                temperature: self.sampling.temperature,
                top_p: self.sampling.top_p,
                top_k: self.sampling.top_k,
            },
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        tracing::debug!(model = %self.model, contents = self.contents.len(), "gemini request");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::Provider(format!("gemini transport: {e}")))?;

        let status = response.status();
        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Provider(format!("gemini response decode: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(EngineError::Provider(format!(
                "gemini API error ({status}): {}",
                error.message
            )));
        }

        let text: String = parsed
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            return Err(EngineError::Provider("gemini returned no candidates".into()));
        }
        Ok(text)
    }
}

#[async_trait]
impl ChatHandle for GeminiChat {
    async fn send(&mut self, text: &str) -> ChatReply {
        self.contents.push(Content {
            role: "user".into(),
            parts: vec![Part { text: text.into() }],
        });
        self.history.push(Turn::user(text));

        let reply = match self.generate().await {
            Ok(text) => ChatReply::ok(text),
            Err(fault) => {
                tracing::warn!(error = %fault, "gemini generation failed; degrading");
                ChatReply::degraded(fault)
            }
        };

        self.contents.push(Content {
            role: "model".into(),
            parts: vec![Part {
                text: reply.text.clone(),
            }],
        });
        self.history.push(Turn::assistant(reply.text.clone()));
        reply
    }

    fn history(&self) -> Vec<Turn> {
        self.history.clone()
    }
}
