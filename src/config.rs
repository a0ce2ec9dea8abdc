//! Top-level pipeline configuration: the recognized option surface, loaded
//! from an optional TOML file and layered with environment variable
//! overrides, mirroring [`crate::llm::LlmConfig::with_env_overrides`].
//!
//! Unknown TOML keys are rejected (`serde(deny_unknown_fields)`) per "unknown
//! options must be rejected."

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreakerConfig;
use crate::error::{ErrorKind, PipelineError};
use crate::llm::{LlmConfig, StagePreset};
use crate::models::CacheCodec;
use crate::rate_limit::ServiceLimitConfig;
use crate::retry::{Jitter, RetryPolicy};

/// Upper bound on `workers` accepted by [`PipelineConfig::validate`].
pub const MAX_WORKERS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterSetting {
    None,
    Full,
    Equal,
}

impl From<JitterSetting> for Jitter {
    fn from(value: JitterSetting) -> Self {
        match value {
            JitterSetting::None => Jitter::None,
            JitterSetting::Full => Jitter::Full,
            JitterSetting::Equal => Jitter::Equal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: JitterSetting,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> JitterSetting {
    JitterSetting::Full
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_ratio")]
    pub failure_ratio: f64,
    #[serde(default = "default_min_throughput")]
    pub min_throughput: u32,
    #[serde(default = "default_window_s")]
    pub window_s: u64,
    #[serde(default = "default_break_duration_s")]
    pub break_duration_s: u64,
    #[serde(default = "default_max_probes")]
    pub max_probes: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_ratio: default_failure_ratio(),
            min_throughput: default_min_throughput(),
            window_s: default_window_s(),
            break_duration_s: default_break_duration_s(),
            max_probes: default_max_probes(),
        }
    }
}

fn default_failure_ratio() -> f64 {
    0.5
}
fn default_min_throughput() -> u32 {
    10
}
fn default_window_s() -> u64 {
    60
}
fn default_break_duration_s() -> u64 {
    30
}
fn default_max_probes() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    #[serde(default = "default_cache_codec")]
    pub codec: CacheCodec,
    #[serde(default = "default_hot_threshold")]
    pub hot_threshold: u64,
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            codec: default_cache_codec(),
            hot_threshold: default_hot_threshold(),
            max_bytes: default_cache_max_bytes(),
        }
    }
}

fn default_cache_codec() -> CacheCodec {
    CacheCodec::Lz4
}
fn default_hot_threshold() -> u64 {
    5
}
fn default_cache_max_bytes() -> u64 {
    1 << 30 // 1 GiB
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointSettings {
    #[serde(default = "default_checkpoint_every_n")]
    pub every_n: u64,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self { every_n: default_checkpoint_every_n() }
    }
}

fn default_checkpoint_every_n() -> u64 {
    10
}

/// The full recognized configuration surface. Unrecognized fields are
/// rejected at both the TOML-parsing layer (via
/// `deny_unknown_fields` on every nested struct) and by `validate()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_stage1_rpm")]
    pub stage1_rpm: f64,
    #[serde(default = "default_stage1_tpm")]
    pub stage1_tpm: f64,
    #[serde(default = "default_stage2_rpm")]
    pub stage2_rpm: f64,
    #[serde(default = "default_stage2_tpm")]
    pub stage2_tpm: f64,
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,
    #[serde(default = "default_timeout_stage1_s")]
    pub timeout_stage1_s: u64,
    #[serde(default = "default_timeout_stage2_s")]
    pub timeout_stage2_s: u64,
    #[serde(default = "default_timeout_item_s")]
    pub timeout_item_s: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub checkpoint: CheckpointSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_preset_stage1")]
    pub preset_stage1: String,
    #[serde(default = "default_preset_stage2")]
    pub preset_stage2: String,
}

fn default_workers() -> usize {
    5
}
fn default_stage1_rpm() -> f64 {
    500.0
}
fn default_stage1_tpm() -> f64 {
    150_000.0
}
fn default_stage2_rpm() -> f64 {
    500.0
}
fn default_stage2_tpm() -> f64 {
    150_000.0
}
fn default_safety_factor() -> f64 {
    0.8
}
fn default_timeout_stage1_s() -> u64 {
    30
}
fn default_timeout_stage2_s() -> u64 {
    30
}
fn default_timeout_item_s() -> u64 {
    90
}
fn default_model_id() -> String {
    "gpt-4o-mini".to_string()
}
fn default_preset_stage1() -> String {
    "nuance_creator_v1".to_string()
}
fn default_preset_stage2() -> String {
    "card_generator_v1".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            stage1_rpm: default_stage1_rpm(),
            stage1_tpm: default_stage1_tpm(),
            stage2_rpm: default_stage2_rpm(),
            stage2_tpm: default_stage2_tpm(),
            safety_factor: default_safety_factor(),
            timeout_stage1_s: default_timeout_stage1_s(),
            timeout_stage2_s: default_timeout_stage2_s(),
            timeout_item_s: default_timeout_item_s(),
            retry: RetrySettings::default(),
            breaker: BreakerSettings::default(),
            cache: CacheSettings::default(),
            checkpoint: CheckpointSettings::default(),
            api_key: None,
            model_id: default_model_id(),
            preset_stage1: default_preset_stage1(),
            preset_stage2: default_preset_stage2(),
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file, rejecting unknown keys anywhere in the tree.
    pub fn from_toml_file(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::internal(format!("reading config file {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, PipelineError> {
        toml::from_str(text).map_err(|e| PipelineError::new(ErrorKind::SchemaValidation, format!("invalid configuration: {e}")))
    }

    /// Apply environment variable overrides. Env vars win over whatever was
    /// loaded from TOML or left at its default, matching
    /// `LlmConfig::with_env_overrides`'s precedence.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("PIPELINE_WORKERS") {
            if let Ok(n) = val.parse() {
                self.workers = n;
            }
        }
        if let Ok(val) = std::env::var("PIPELINE_STAGE1_RPM") {
            if let Ok(n) = val.parse() {
                self.stage1_rpm = n;
            }
        }
        if let Ok(val) = std::env::var("PIPELINE_STAGE1_TPM") {
            if let Ok(n) = val.parse() {
                self.stage1_tpm = n;
            }
        }
        if let Ok(val) = std::env::var("PIPELINE_STAGE2_RPM") {
            if let Ok(n) = val.parse() {
                self.stage2_rpm = n;
            }
        }
        if let Ok(val) = std::env::var("PIPELINE_STAGE2_TPM") {
            if let Ok(n) = val.parse() {
                self.stage2_tpm = n;
            }
        }
        if let Ok(val) = std::env::var("PIPELINE_SAFETY_FACTOR") {
            if let Ok(n) = val.parse() {
                self.safety_factor = n;
            }
        }
        if let Ok(val) = std::env::var("LLM_API_KEY") {
            self.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("LLM_MODEL_ID") {
            self.model_id = val;
        }
        self
    }

    /// Validate cross-field invariants not expressible via serde defaults
    /// alone (`workers` must be at least 1, `safety_factor` must be in
    /// `(0, 1]`).
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(PipelineError::new(
                ErrorKind::SchemaValidation,
                format!("workers must be in 1..={MAX_WORKERS}, got {}", self.workers),
            ));
        }
        if !(self.safety_factor > 0.0 && self.safety_factor <= 1.0) {
            return Err(PipelineError::new(
                ErrorKind::SchemaValidation,
                format!("safety_factor must be in (0, 1], got {}", self.safety_factor),
            ));
        }
        if self.breaker.max_probes == 0 {
            return Err(PipelineError::new(ErrorKind::SchemaValidation, "breaker.max_probes must be >= 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::new(ErrorKind::SchemaValidation, "retry.max_attempts must be >= 1"));
        }
        Ok(())
    }

    pub fn rate_limit_configs(&self) -> std::collections::HashMap<String, ServiceLimitConfig> {
        let mut m = std::collections::HashMap::new();
        m.insert(
            "stage1".to_string(),
            ServiceLimitConfig {
                requests_per_minute: self.stage1_rpm,
                tokens_per_minute: self.stage1_tpm,
                burst: (self.stage1_rpm / 10.0).max(1.0),
                avg_tokens_per_call: self.stage1_tpm / self.stage1_rpm.max(1.0),
                safety_factor: self.safety_factor,
            },
        );
        m.insert(
            "stage2".to_string(),
            ServiceLimitConfig {
                requests_per_minute: self.stage2_rpm,
                tokens_per_minute: self.stage2_tpm,
                burst: (self.stage2_rpm / 10.0).max(1.0),
                avg_tokens_per_call: self.stage2_tpm / self.stage2_rpm.max(1.0),
                safety_factor: self.safety_factor,
            },
        );
        m
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_ratio: self.breaker.failure_ratio,
            min_throughput: self.breaker.min_throughput,
            window: Duration::from_secs(self.breaker.window_s),
            break_duration: Duration::from_secs(self.breaker.break_duration_s),
            max_probes: self.breaker.max_probes,
            max_break_duration: Duration::from_secs(self.breaker.break_duration_s * 10),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            multiplier: self.retry.multiplier,
            jitter: self.retry.jitter.into(),
        }
    }

    pub fn llm_config(&self) -> LlmConfig {
        let mut config = LlmConfig::default();
        config.api_key = self.api_key.clone();
        config.model_id = self.model_id.clone();
        config.preset_stage1 = StagePreset { preset_id: self.preset_stage1.clone(), timeout_s: self.timeout_stage1_s };
        config.preset_stage2 = StagePreset { preset_id: self.preset_stage2.clone(), timeout_s: self.timeout_stage2_s };
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_cleanly() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_workers_out_of_range() {
        let config = PipelineConfig { workers: 0, ..PipelineConfig::default() };
        assert!(config.validate().is_err());

        let config = PipelineConfig { workers: MAX_WORKERS + 1, ..PipelineConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_safety_factor_out_of_range() {
        let config = PipelineConfig { safety_factor: 0.0, ..PipelineConfig::default() };
        assert!(config.validate().is_err());

        let config = PipelineConfig { safety_factor: 1.5, ..PipelineConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config = PipelineConfig::from_toml_str("workers = 10\n").unwrap();
        assert_eq!(config.workers, 10);
        assert_eq!(config.retry.max_attempts, default_max_attempts());
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let err = PipelineConfig::from_toml_str("bogus_option = 1\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaValidation);
    }

    #[test]
    fn rejects_unknown_nested_key() {
        let err = PipelineConfig::from_toml_str("[retry]\nbogus = 1\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaValidation);
    }
}
