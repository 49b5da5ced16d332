// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Benchmark configuration.
//!
//! Loaded from a TOML file, then overridden from the environment, then
//! validated. The resulting [`BenchConfig`] is read-only for one invocation.

use crate::resilience::{RetryPolicy, MIN_RATE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Language used when a dataset has no entry in `datasets_prompt_map`
pub const DEFAULT_PROMPT_LANGUAGE: &str = "zh";

/// Placeholder written in place of the API key when the config is persisted
pub const REDACTED: &str = "***";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level benchmark configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub llm_api: LlmApiConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub evaluation: EvaluationConfig,

    /// Present only for sampling workflows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingConfig>,

    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmApiConfig {
    /// OpenAI-compatible base URL (e.g., "http://localhost:8000/v1")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Requests per second. Negative means unlimited, fractions are allowed.
    #[serde(default = "default_api_rate_limit")]
    pub api_rate_limit: f64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-attempt timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub disable_ssl_verify: bool,

    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
}

impl LlmApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// `None` when requests are unthrottled
    pub fn rate_limit(&self) -> Option<f64> {
        (self.api_rate_limit >= 0.0).then_some(self.api_rate_limit)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.saturating_add(1),
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: self.retry_multiplier,
        }
    }
}

impl Default for LlmApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            api_rate_limit: default_api_rate_limit(),
            max_retries: default_max_retries(),
            timeout: default_timeout(),
            disable_ssl_verify: false,
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_multiplier: default_retry_multiplier(),
        }
    }
}

/// Model name and generation parameters sent with every request
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub frequency_penalty: f32,

    #[serde(default)]
    pub presence_penalty: f32,

    /// Merged verbatim into the request body
    #[serde(default)]
    pub extra_body: serde_json::Map<String, serde_json::Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            temperature: 0.0,
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            extra_body: serde_json::Map::new(),
        }
    }
}

/// Answer extraction policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMethod {
    #[default]
    Box,
    Pattern,
    CustomRegex,
}

impl EvaluationMethod {
    pub const ALL: [EvaluationMethod; 3] = [Self::Box, Self::Pattern, Self::CustomRegex];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Box => "box",
            Self::Pattern => "pattern",
            Self::CustomRegex => "custom_regex",
        }
    }
}

impl std::fmt::Display for EvaluationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// System prompt, either shared or keyed by prompt language
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Single(String),
    PerLanguage(BTreeMap<String, String>),
}

impl SystemPrompt {
    /// Prompt for `lang`, falling back to the default language
    pub fn for_language(&self, lang: &str) -> &str {
        match self {
            Self::Single(prompt) => prompt,
            Self::PerLanguage(map) => map
                .get(lang)
                .or_else(|| map.get(DEFAULT_PROMPT_LANGUAGE))
                .map(String::as_str)
                .unwrap_or(""),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StrategyConfig {
    /// Regular expressions for `custom_regex`; the first capture group is the label
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluationConfig {
    /// Dataset files or directories
    #[serde(default = "default_dataset_paths")]
    pub dataset_paths: Vec<PathBuf>,

    #[serde(default)]
    pub evaluation_method: EvaluationMethod,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<SystemPrompt>,

    /// Dataset path -> prompt language
    #[serde(default)]
    pub datasets_prompt_map: BTreeMap<String, String>,

    #[serde(default)]
    pub strategy_config: StrategyConfig,

    #[serde(default = "default_repeat_runs")]
    pub repeat_runs: usize,

    #[serde(default)]
    pub shuffle_options: bool,

    /// Maximum in-flight question evaluations
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Seed for option shuffling; falls back to the sampling seed, then entropy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Report cancelled passes instead of failing them
    #[serde(default)]
    pub allow_partial: bool,
}

impl EvaluationConfig {
    /// Prompt language of the dataset rooted at `dataset_path`
    pub fn prompt_language(&self, dataset_path: &Path) -> &str {
        self.datasets_prompt_map
            .iter()
            .find(|(key, _)| dataset_path.starts_with(Path::new(key.as_str())))
            .map(|(_, lang)| lang.as_str())
            .unwrap_or(DEFAULT_PROMPT_LANGUAGE)
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            dataset_paths: default_dataset_paths(),
            evaluation_method: EvaluationMethod::default(),
            system_prompt: None,
            datasets_prompt_map: BTreeMap::new(),
            strategy_config: StrategyConfig::default(),
            repeat_runs: default_repeat_runs(),
            shuffle_options: false,
            concurrency: default_concurrency(),
            seed: None,
            allow_partial: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SamplingConfig {
    /// Corpus files or directories the rounds draw from
    #[serde(default)]
    pub corpus_paths: Vec<PathBuf>,

    #[serde(default = "default_sample_n")]
    pub sample_n: usize,

    #[serde(default = "default_rounds")]
    pub rounds: usize,

    #[serde(default = "default_sampling_seed")]
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            corpus_paths: Vec::new(),
            sample_n: default_sample_n(),
            rounds: default_rounds(),
            seed: default_sampling_seed(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            logs_dir: default_logs_dir(),
        }
    }
}

// Default values
fn default_base_url() -> String {
    "http://localhost:8000/v1".to_string()
}

fn default_api_rate_limit() -> f64 {
    -1.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout() -> u64 {
    600
}

fn default_retry_initial_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_top_p() -> f32 {
    0.9
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_dataset_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("datasets")]
}

fn default_repeat_runs() -> usize {
    1
}

fn default_concurrency() -> usize {
    16
}

fn default_sample_n() -> usize {
    50
}

fn default_rounds() -> usize {
    5
}

fn default_sampling_seed() -> u64 {
    42
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl BenchConfig {
    /// Load configuration from a TOML file
    /// Seed for option shuffling, `None` when neither evaluation nor sampling sets one
    pub fn shuffle_seed(&self) -> Option<u64> {
        self.evaluation
            .seed
            .or_else(|| self.sampling.as_ref().map(|sampling| sampling.seed))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply environment overrides
    ///
    /// Supported environment variables:
    /// - MCQBENCH_BASE_URL: endpoint base URL
    /// - MCQBENCH_API_KEY: API key (falls back to OPENAI_API_KEY)
    /// - MCQBENCH_MODEL: model name
    /// - MCQBENCH_RESULTS_DIR: output directory
    pub fn merge_with_env(mut self) -> Self {
        if let Ok(url) = std::env::var("MCQBENCH_BASE_URL") {
            self.llm_api.base_url = url;
        }

        if let Ok(key) = std::env::var("MCQBENCH_API_KEY") {
            self.llm_api.api_key = Some(key);
        } else if self.llm_api.api_key.is_none() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                self.llm_api.api_key = Some(key);
            }
        }

        if let Ok(model) = std::env::var("MCQBENCH_MODEL") {
            self.model.name = model;
        }

        if let Ok(dir) = std::env::var("MCQBENCH_RESULTS_DIR") {
            self.output.results_dir = PathBuf::from(dir);
        }

        self
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(path)?
            }
            Some(path) => {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        let config = config.merge_with_env();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let api = &self.llm_api;
        if api.base_url.trim().is_empty() {
            return Err(ConfigError::invalid("llm_api.base_url", "must not be empty"));
        }
        if api.api_rate_limit == 0.0 || api.api_rate_limit.is_nan() {
            return Err(ConfigError::invalid(
                "llm_api.api_rate_limit",
                "must be positive, or negative for unlimited",
            ));
        }
        if api.api_rate_limit > 0.0 && api.api_rate_limit < MIN_RATE {
            return Err(ConfigError::invalid(
                "llm_api.api_rate_limit",
                format!("must be at least {} requests per second", MIN_RATE),
            ));
        }
        if api.timeout == 0 {
            return Err(ConfigError::invalid("llm_api.timeout", "must be at least 1 second"));
        }
        if !(api.retry_multiplier >= 1.0) {
            return Err(ConfigError::invalid(
                "llm_api.retry_multiplier",
                "must be >= 1.0 so backoff never shrinks",
            ));
        }
        if api.retry_initial_delay_ms > api.retry_max_delay_ms {
            return Err(ConfigError::invalid(
                "llm_api.retry_initial_delay_ms",
                "must not exceed retry_max_delay_ms",
            ));
        }

        if self.model.name.trim().is_empty() {
            return Err(ConfigError::invalid("model.name", "must not be empty"));
        }

        let eval = &self.evaluation;
        if eval.repeat_runs == 0 {
            return Err(ConfigError::invalid("evaluation.repeat_runs", "must be at least 1"));
        }
        if eval.concurrency == 0 {
            return Err(ConfigError::invalid("evaluation.concurrency", "must be at least 1"));
        }
        if eval.evaluation_method == EvaluationMethod::CustomRegex
            && eval.strategy_config.patterns.is_empty()
        {
            return Err(ConfigError::invalid(
                "evaluation.strategy_config.patterns",
                "custom_regex requires at least one pattern",
            ));
        }

        if let Some(sampling) = &self.sampling {
            if sampling.sample_n == 0 {
                return Err(ConfigError::invalid("sampling.sample_n", "must be at least 1"));
            }
            if sampling.rounds == 0 {
                return Err(ConfigError::invalid("sampling.rounds", "must be at least 1"));
            }
        }

        Ok(())
    }

    /// Copy with the API key replaced, for persisting next to results
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.llm_api.api_key.is_some() {
            config.llm_api.api_key = Some(REDACTED.to_string());
        }
        config
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system_prompt<'a>(config: &'a BenchConfig, lang: &str) -> Option<&'a str> {
        config
            .evaluation
            .system_prompt
            .as_ref()
            .map(|p| p.for_language(lang))
    }

    fn minimal() -> BenchConfig {
        let mut config = BenchConfig::default();
        config.model.name = "test-model".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = BenchConfig::default();
        assert_eq!(config.llm_api.max_retries, 3);
        assert_eq!(config.llm_api.timeout, 600);
        assert!(config.llm_api.rate_limit().is_none());
        assert_eq!(config.model.top_p, 0.9);
        assert_eq!(config.model.max_tokens, 4096);
        assert_eq!(config.evaluation.repeat_runs, 1);
        assert!(!config.evaluation.shuffle_options);
        assert_eq!(config.evaluation.evaluation_method, EvaluationMethod::Box);
    }

    #[test]
    fn test_parse_toml() {
        let config = BenchConfig::from_toml_str(
            r#"
            [llm_api]
            base_url = "http://example.test/v1"
            api_key = "sk-test"
            api_rate_limit = 2.5

            [model]
            name = "qwen"
            temperature = 0.2
            extra_body = { top_k = 20 }

            [evaluation]
            dataset_paths = ["data/mmlu"]
            evaluation_method = "custom_regex"
            strategy_config = { patterns = ["ANSWER: ([A-D])"] }
            system_prompt = { zh = "請作答", en = "Answer" }
            datasets_prompt_map = { "data/mmlu" = "en" }
            repeat_runs = 3
            shuffle_options = true

            [sampling]
            corpus_paths = ["corpus"]
            sample_n = 10
            rounds = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.llm_api.rate_limit(), Some(2.5));
        assert_eq!(config.model.extra_body["top_k"], serde_json::json!(20));
        assert_eq!(
            config.evaluation.evaluation_method,
            EvaluationMethod::CustomRegex
        );
        assert_eq!(config.evaluation.repeat_runs, 3);
        assert_eq!(config.sampling.as_ref().unwrap().rounds, 2);
        assert_eq!(config.sampling.as_ref().unwrap().seed, 42);
        config.validate().unwrap();

        let lang = config
            .evaluation
            .prompt_language(Path::new("data/mmlu/physics.csv"));
        assert_eq!(lang, "en");
        assert_eq!(system_prompt(&config, lang), Some("Answer"));
        assert_eq!(
            config.evaluation.prompt_language(Path::new("other/x.csv")),
            DEFAULT_PROMPT_LANGUAGE
        );
        assert_eq!(system_prompt(&config, "fr"), Some("請作答"));
    }

    #[test]
    fn test_single_system_prompt() {
        let config =
            BenchConfig::from_toml_str("[evaluation]\nsystem_prompt = \"Use \\\\box{}\"").unwrap();
        assert_eq!(
            system_prompt(&config, "en"),
            Some("Use \\box{}")
        );
    }

    #[test]
    fn test_tiny_rate_limit_rejected() {
        let mut config = minimal();
        config.llm_api.api_rate_limit = 1e-20;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "llm_api.api_rate_limit",
                ..
            })
        ));
        config.llm_api.api_rate_limit = 0.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_retries_saturates() {
        let mut config = minimal();
        config.llm_api.max_retries = u32::MAX;
        assert_eq!(config.llm_api.retry_policy().max_attempts, u32::MAX);
        config.llm_api.max_retries = 3;
        assert_eq!(config.llm_api.retry_policy().max_attempts, 4);
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let mut config = minimal();
        config.llm_api.api_rate_limit = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "llm_api.api_rate_limit",
                ..
            })
        ));
    }

    #[test]
    fn test_custom_regex_requires_patterns() {
        let mut config = minimal();
        config.evaluation.evaluation_method = EvaluationMethod::CustomRegex;
        assert!(config.validate().is_err());

        config.evaluation.strategy_config.patterns = vec!["([A-D])".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_model_name_rejected() {
        assert!(BenchConfig::default().validate().is_err());
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = minimal().llm_api.retry_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let mut config = minimal();
        config.llm_api.api_key = Some("sk-secret".to_string());
        let text = config.redacted().to_toml_string().unwrap();
        assert!(!text.contains("sk-secret"));
        assert!(text.contains(REDACTED));
        assert_eq!(config.llm_api.api_key.as_deref(), Some("sk-secret"));
    }

    #[test]
    fn test_from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[llm_api\nbroken").unwrap();

        let err = BenchConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_shuffle_seed_falls_back_to_sampling_seed() {
        let mut config = minimal();
        assert_eq!(config.shuffle_seed(), None);

        config.sampling = Some(SamplingConfig {
            seed: 17,
            ..SamplingConfig::default()
        });
        assert_eq!(config.shuffle_seed(), Some(17));

        config.evaluation.seed = Some(3);
        assert_eq!(config.shuffle_seed(), Some(3));
    }
}
