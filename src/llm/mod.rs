//! LLM client: the narrow capability the rest of the core depends on for
//! Stage 1 (semantic nuance) and Stage 2 (flashcard row generation) calls.
//!
//! The reliability envelope (rate limiter, circuit breaker, retry executor)
//! lives outside this module and wraps calls to it; this module's only job
//! is to talk to a chat-completion provider and turn its response into a
//! validated artifact or a classified `PipelineError`.

mod config;
mod parsing;

pub use config::{LlmConfig, StagePreset};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ErrorKind, PipelineError};
use crate::models::{Stage1Artifact, Stage2Artifact};

/// Narrow capability for the two LLM calls the pipeline needs. Kept as a
/// trait object boundary so the orchestrator and engine never depend on the
/// concrete HTTP transport, and so tests can substitute an in-memory fake.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns the validated artifact and the token count actually consumed
    /// (from the provider's usage block, or estimated when absent).
    async fn stage1(&self, term: &str, type_hint: Option<&str>) -> Result<(Stage1Artifact, u64), PipelineError>;

    async fn stage2(&self, term: &str, stage1_artifact: &Stage1Artifact) -> Result<(Stage2Artifact, u64), PipelineError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: Option<u64>,
}

/// Concrete `LlmClient` backed by an OpenAI-compatible chat-completion
/// endpoint. A single `reqwest::Client` is shared across calls so connection
/// pooling applies to both stages.
pub struct HttpLlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn system_preamble(preset_id: &str) -> String {
        format!("You are the {preset_id} stage of a Korean vocabulary flashcard pipeline. Respond with a single JSON object and nothing else.")
    }

    async fn call(&self, preset: &StagePreset, user_content: String) -> Result<(serde_json::Value, u64), PipelineError> {
        let request = ChatRequest {
            model: &self.config.model_id,
            messages: vec![
                ChatMessage { role: "system", content: Self::system_preamble(&preset.preset_id) },
                ChatMessage { role: "user", content: user_content },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let mut builder = self
            .http
            .post(&self.config.endpoint)
            .timeout(Duration::from_secs(preset.timeout_s))
            .json(&request);

        if let Some(api_key) = &self.config.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::new(ErrorKind::Timeout, format!("request to {} timed out", redact_endpoint(&self.config.endpoint)))
            } else {
                PipelineError::new(ErrorKind::Network, format!("request to {} failed: {e}", redact_endpoint(&self.config.endpoint)))
            }
        })?;

        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(PipelineError::new(ErrorKind::AuthError, format!("provider rejected credentials (status {status})")));
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(PipelineError::new(
                ErrorKind::RateLimited { retry_after },
                "provider rate limit exceeded",
            ));
        }

        if status.is_server_error() {
            return Err(PipelineError::new(
                ErrorKind::ServerError { status: status.as_u16() },
                format!("provider returned status {status}"),
            ));
        }

        if !status.is_success() {
            return Err(PipelineError::new(ErrorKind::InvalidResponse, format!("unexpected status {status}")));
        }

        let body: ChatResponse = response.json().await.map_err(|e| {
            PipelineError::new(ErrorKind::InvalidResponse, format!("response body was not a valid chat completion: {e}"))
        })?;

        let content = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::new(ErrorKind::InvalidResponse, "response contained no choices"))?
            .message
            .content;

        let tokens = body
            .usage
            .and_then(|u| u.total_tokens)
            .unwrap_or_else(|| parsing::estimate_tokens(&content));

        let value = parsing::extract_json_object(&content)?;
        Ok((value, tokens))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn stage1(&self, term: &str, type_hint: Option<&str>) -> Result<(Stage1Artifact, u64), PipelineError> {
        let payload = json!({
            "term": term,
            "type_hint": type_hint,
        });
        let (value, tokens) = self.call(&self.config.preset_stage1, payload.to_string()).await?;

        let artifact: Stage1Artifact = serde_json::from_value(value)
            .map_err(|e| PipelineError::new(ErrorKind::SchemaValidation, format!("stage1 response did not match schema: {e}")))?;
        artifact
            .validate()
            .map_err(|msg| PipelineError::new(ErrorKind::SchemaValidation, msg))?;

        Ok((artifact, tokens))
    }

    async fn stage2(&self, term: &str, stage1_artifact: &Stage1Artifact) -> Result<(Stage2Artifact, u64), PipelineError> {
        let payload = json!({
            "term": term,
            "stage1": stage1_artifact,
        });
        let (value, tokens) = self.call(&self.config.preset_stage2, payload.to_string()).await?;

        let artifact: Stage2Artifact = serde_json::from_value(value)
            .map_err(|e| PipelineError::new(ErrorKind::SchemaValidation, format!("stage2 response did not match schema: {e}")))?;
        artifact
            .validate()
            .map_err(|msg| PipelineError::new(ErrorKind::SchemaValidation, msg))?;

        Ok((artifact, tokens))
    }
}

/// Strip everything but scheme/host from an endpoint URL before it goes into
/// an error message, in case it ever carries embedded credentials.
fn redact_endpoint(endpoint: &str) -> String {
    reqwest::Url::parse(endpoint)
        .ok()
        .map(|u| format!("{}://{}", u.scheme(), u.host_str().unwrap_or("?")))
        .unwrap_or_else(|| "<endpoint>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_endpoint_strips_path_and_query() {
        assert_eq!(redact_endpoint("https://api.openai.com/v1/chat/completions?x=1"), "https://api.openai.com");
    }

    #[test]
    fn redact_endpoint_falls_back_on_garbage_input() {
        assert_eq!(redact_endpoint("not a url"), "<endpoint>");
    }

    #[test]
    fn system_preamble_names_the_preset() {
        let preamble = HttpLlmClient::system_preamble("nuance_creator_v1");
        assert!(preamble.contains("nuance_creator_v1"));
    }
}
