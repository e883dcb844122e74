//! Dialogen Configuration
//!
//! Handles parsing and management of dialogen.toml configuration files.
//! Every numeric constant the generator depends on (context window, output
//! caps, tokens-per-item table, estimator weights) lives here so that it can
//! be recalibrated for a different completion provider without code changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::session::ModelVariant;
use crate::tokens::TokenEstimator;

/// Name of the configuration file searched for from the working directory up.
pub const CONFIG_FILE_NAME: &str = "dialogen.toml";

/// Env var that overrides `api.model`.
pub const MODEL_ENV: &str = "DEEPSEEK_MODEL";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("API key not set: export {0}")]
    MissingApiKey(String),

    #[error("Instruction file missing or empty: {0}")]
    MissingInstruction(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching dialogen.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DialogenConfig {
    /// Completion API endpoint and request parameters
    #[serde(default)]
    pub api: ApiConfig,

    /// Token budget constants
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Token estimator weights
    #[serde(default)]
    pub estimator: EstimatorConfig,

    /// Bucket generation settings
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Worker pool settings
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

impl DialogenConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: DialogenConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
        Self::find_and_load(&cwd)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Ok(Self::default());
            }
        }
    }

    /// Apply environment overrides (currently only the model name).
    pub fn apply_env(&mut self) {
        if let Ok(model) = std::env::var(MODEL_ENV) {
            if !model.trim().is_empty() {
                self.api.model = model.trim().to_string();
            }
        }
    }

    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> ConfigResult<String> {
        match std::env::var(&self.api.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => Err(ConfigError::MissingApiKey(self.api.api_key_env.clone())),
        }
    }

    /// Read the system instruction that seeds every session.
    pub fn load_instruction(&self) -> ConfigResult<String> {
        let path = &self.generation.instruction_file;
        let text = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::MissingInstruction(path.display().to_string()))?;
        if text.trim().is_empty() {
            return Err(ConfigError::MissingInstruction(path.display().to_string()));
        }
        Ok(text)
    }

    /// Check internal consistency of the numeric settings.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.budget.max_context_tokens == 0 {
            return Err(ConfigError::Invalid(
                "budget.max_context_tokens must be positive".to_string(),
            ));
        }
        if self.budget.shrink_factor <= 0.0 {
            return Err(ConfigError::Invalid(
                "budget.shrink_factor must be positive".to_string(),
            ));
        }
        if self.estimator.dense_chars_per_token <= 0.0 || self.estimator.other_chars_per_token <= 0.0
        {
            return Err(ConfigError::Invalid(
                "estimator weights must be positive".to_string(),
            ));
        }
        if self.estimator.dense_range_start > self.estimator.dense_range_end {
            return Err(ConfigError::Invalid(
                "estimator.dense_range_start exceeds dense_range_end".to_string(),
            ));
        }
        if self.generation.summary_marker.is_empty() || self.generation.identifying_field.is_empty()
        {
            return Err(ConfigError::Invalid(
                "generation.summary_marker and identifying_field must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Model variant derived from the configured model name.
    pub fn variant(&self) -> ModelVariant {
        ModelVariant::from_model_name(&self.api.model)
    }

    /// Token estimator built from the `[estimator]` section.
    pub fn estimator(&self) -> TokenEstimator {
        TokenEstimator::from(&self.estimator)
    }

    /// Number of parallel bucket workers (1 when concurrency is disabled).
    pub fn worker_count(&self) -> usize {
        if self.concurrency.enabled {
            self.concurrency.workers.max(1)
        } else {
            1
        }
    }
}

/// Completion API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Chat completions endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model name; a name containing "reasoner" selects the reasoning variant
    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Ask the provider to enforce a JSON object response
    #[serde(default = "default_true")]
    pub json_mode: bool,

    /// TCP connect timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Read timeout; generous because large generations take minutes
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.deepseek.com/chat/completions".to_string()
}

fn default_model() -> String {
    "deepseek-reasoner".to_string()
}

fn default_api_key_env() -> String {
    "DEEPSEEK_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    1800
}

impl ApiConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            json_mode: true,
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

/// Token budget constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Session rollover threshold (kept below the provider window)
    #[serde(default = "default_max_context")]
    pub max_context_tokens: usize,

    /// Output cap for the standard variant
    #[serde(default = "default_max_output_standard")]
    pub max_output_standard: usize,

    /// Output cap for the reasoning variant
    #[serde(default = "default_max_output_reasoner")]
    pub max_output_reasoner: usize,

    /// Extra output tokens reserved for the reasoning phase
    #[serde(default = "default_reasoning_buffer")]
    pub reasoning_buffer: usize,

    /// Tokens per record when the round count is not in the table
    #[serde(default = "default_tokens_per_item")]
    pub default_tokens_per_item: usize,

    /// Divisor factor used when shrinking an oversized request
    #[serde(default = "default_shrink_factor")]
    pub shrink_factor: f64,

    /// Measured tokens per record, keyed by round count
    #[serde(default = "default_tokens_table")]
    pub tokens_per_item: BTreeMap<String, usize>,
}

fn default_max_context() -> usize {
    110_000
}

fn default_max_output_standard() -> usize {
    8_000
}

fn default_max_output_reasoner() -> usize {
    64_000
}

fn default_reasoning_buffer() -> usize {
    5_000
}

fn default_tokens_per_item() -> usize {
    1_000
}

fn default_shrink_factor() -> f64 {
    1.2
}

fn default_tokens_table() -> BTreeMap<String, usize> {
    [(1, 365), (2, 344), (3, 354), (4, 481), (5, 425)]
        .into_iter()
        .map(|(round, tokens)| (round.to_string(), tokens))
        .collect()
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context(),
            max_output_standard: default_max_output_standard(),
            max_output_reasoner: default_max_output_reasoner(),
            reasoning_buffer: default_reasoning_buffer(),
            default_tokens_per_item: default_tokens_per_item(),
            shrink_factor: default_shrink_factor(),
            tokens_per_item: default_tokens_table(),
        }
    }
}

/// Token estimator weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Characters per token inside the dense-script range
    #[serde(default = "default_dense_chars")]
    pub dense_chars_per_token: f64,

    /// Characters per token for everything else
    #[serde(default = "default_other_chars")]
    pub other_chars_per_token: f64,

    /// First code point of the dense-script range (inclusive)
    #[serde(default = "default_dense_start")]
    pub dense_range_start: u32,

    /// Last code point of the dense-script range (inclusive)
    #[serde(default = "default_dense_end")]
    pub dense_range_end: u32,
}

fn default_dense_chars() -> f64 {
    1.5
}

fn default_other_chars() -> f64 {
    4.0
}

fn default_dense_start() -> u32 {
    0x4E00
}

fn default_dense_end() -> u32 {
    0x9FFF
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            dense_chars_per_token: default_dense_chars(),
            other_chars_per_token: default_other_chars(),
            dense_range_start: default_dense_start(),
            dense_range_end: default_dense_end(),
        }
    }
}

/// Bucket generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Records each bucket must reach
    #[serde(default = "default_target")]
    pub target_per_bucket: usize,

    /// Consecutive failed turns before a bucket gives up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause after a failed turn
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Pause before releasing a worker slot after network activity
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    /// Pause after a session rollover
    #[serde(default = "default_rollover_delay")]
    pub rollover_delay_secs: u64,

    /// Root of the per-bucket record stores
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// System instruction shared by every session
    #[serde(default = "default_instruction_file")]
    pub instruction_file: PathBuf,

    /// Generation plan (domains, ambiguity types, rounds)
    #[serde(default = "default_plan_file")]
    pub plan_file: PathBuf,

    /// Required prefix of every record's final assistant turn
    #[serde(default = "default_summary_marker")]
    pub summary_marker: String,

    /// Key that marks a JSON object as a genuine record
    #[serde(default = "default_identifying_field")]
    pub identifying_field: String,

    /// Append unparseable responses to a per-bucket debug file
    #[serde(default = "default_true")]
    pub dump_unparsed: bool,
}

fn default_target() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

fn default_cooldown() -> u64 {
    5
}

fn default_rollover_delay() -> u64 {
    2
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data/raw")
}

fn default_instruction_file() -> PathBuf {
    PathBuf::from("initial_prompt.txt")
}

fn default_plan_file() -> PathBuf {
    PathBuf::from("generation_plan.txt")
}

fn default_summary_marker() -> String {
    "【完整请求总结】".to_string()
}

fn default_identifying_field() -> String {
    "system".to_string()
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            target_per_bucket: default_target(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            cooldown_secs: default_cooldown(),
            rollover_delay_secs: default_rollover_delay(),
            output_dir: default_output_dir(),
            instruction_file: default_instruction_file(),
            plan_file: default_plan_file(),
            summary_marker: default_summary_marker(),
            identifying_field: default_identifying_field(),
            dump_unparsed: true,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Run buckets in parallel
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Worker thread count
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    10
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: default_workers(),
        }
    }
}
