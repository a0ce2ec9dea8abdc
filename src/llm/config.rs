//! LLM client configuration: provider endpoint, model, and per-stage presets.

use serde::{Deserialize, Serialize};

/// Configuration for a single stage's LLM request (preset + timeout).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePreset {
    /// Identifies which prompt template / system preamble to build the
    /// request from; opaque to the client, interpreted by the prompt
    /// builder out-of-core.
    pub preset_id: String,
    pub timeout_s: u64,
}

/// Configuration for the LLM client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model_id: String,
    #[serde(default = "default_stage1_preset")]
    pub preset_stage1: StagePreset,
    #[serde(default = "default_stage2_preset")]
    pub preset_stage2: StagePreset,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_stage1_preset() -> StagePreset {
    StagePreset {
        preset_id: "nuance_creator_v1".to_string(),
        timeout_s: 30,
    }
}

fn default_stage2_preset() -> StagePreset {
    StagePreset {
        preset_id: "card_generator_v1".to_string(),
        timeout_s: 30,
    }
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.3
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self::base_default().with_env_overrides()
    }
}

impl LlmConfig {
    fn base_default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            model_id: default_model(),
            preset_stage1: default_stage1_preset(),
            preset_stage2: default_stage2_preset(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars: `LLM_ENDPOINT`, `LLM_API_KEY`, `LLM_MODEL_ID`,
    /// `LLM_MAX_TOKENS`, `LLM_TEMPERATURE`, `LLM_PRESET_STAGE1`,
    /// `LLM_PRESET_STAGE2`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("LLM_ENDPOINT") {
            self.endpoint = val;
        }
        if let Ok(val) = std::env::var("LLM_API_KEY") {
            self.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("LLM_MODEL_ID") {
            self.model_id = val;
        }
        if let Ok(val) = std::env::var("LLM_MAX_TOKENS") {
            if let Ok(n) = val.parse() {
                self.max_tokens = n;
            }
        }
        if let Ok(val) = std::env::var("LLM_TEMPERATURE") {
            if let Ok(t) = val.parse() {
                self.temperature = t;
            }
        }
        if let Ok(val) = std::env::var("LLM_PRESET_STAGE1") {
            self.preset_stage1.preset_id = val;
        }
        if let Ok(val) = std::env::var("LLM_PRESET_STAGE2") {
            self.preset_stage2.preset_id = val;
        }
        self
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_default_has_no_api_key() {
        assert!(LlmConfig::base_default().api_key.is_none());
    }

    #[test]
    fn with_endpoint_overrides_only_endpoint() {
        let config = LlmConfig::base_default().with_endpoint("http://localhost:8080/v1/chat");
        assert_eq!(config.endpoint, "http://localhost:8080/v1/chat");
        assert_eq!(config.model_id, default_model());
    }
}
