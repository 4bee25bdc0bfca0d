//! Configuration for the draftflow orchestrator
//!
//! Loaded from TOML. Secrets are never stored in the file: credentials are
//! named by environment variable and resolved when they are needed.

use crate::concurrency::SuccessCriterion;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DraftflowConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub resilience: ResilienceSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub llm: LlmSection,
    /// Per-agent overrides keyed by agent id
    #[serde(default)]
    pub agents: HashMap<String, AgentSection>,
    pub mqtt: Option<MqttSection>,
    pub health: Option<HealthSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorSection {
    /// How long a pause point waits for the operator (default: 600)
    #[serde(default = "default_input_timeout")]
    pub input_timeout_secs: u64,
    /// Concurrent research sub-tasks (default: 5)
    #[serde(default = "default_fanout_limit")]
    pub fanout_limit: usize,
    #[serde(default)]
    pub research_success: SuccessCriterion,
    /// Upper bound on planned research queries (default: 8)
    #[serde(default = "default_max_research_queries")]
    pub max_research_queries: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            input_timeout_secs: default_input_timeout(),
            fanout_limit: default_fanout_limit(),
            research_success: SuccessCriterion::default(),
            max_research_queries: default_max_research_queries(),
        }
    }
}

impl OrchestratorSection {
    pub fn input_timeout(&self) -> Duration {
        Duration::from_secs(self.input_timeout_secs)
    }
}

fn default_input_timeout() -> u64 {
    600
}

fn default_fanout_limit() -> usize {
    5
}

fn default_max_research_queries() -> usize {
    8
}

/// Agent retry budget and backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: true,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResilienceSection {
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    /// Consecutive missed keepalives before the channel counts as lost
    #[serde(default = "default_max_missed_keepalives")]
    pub max_missed_keepalives: u32,
    /// Finished background task records kept in memory (default: 64)
    #[serde(default = "default_finished_task_history")]
    pub finished_task_history: usize,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval(),
            max_missed_keepalives: default_max_missed_keepalives(),
            finished_task_history: default_finished_task_history(),
        }
    }
}

fn default_keepalive_interval() -> u64 {
    15
}

fn default_max_missed_keepalives() -> u32 {
    3
}

fn default_finished_task_history() -> usize {
    crate::resilience::background::DEFAULT_FINISHED_HISTORY
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageSection {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Root directory for the file backend
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSection {
    /// Provider name; only OpenAI-compatible endpoints are built in
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable containing the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Override for gateways and self-hosted endpoints
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Conversation turns forwarded to each agent call
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default)]
    pub cost_micros_per_1k_tokens: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            base_url: None,
            temperature: None,
            max_tokens: None,
            timeout_secs: default_llm_timeout(),
            history_window: default_history_window(),
            cost_micros_per_1k_tokens: 0,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_history_window() -> usize {
    6
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_topic_prefix() -> String {
    "draftflow".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_health_port() -> u16 {
    8080
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DraftflowConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: DraftflowConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidConfig(msg.to_string()));

        if self.orchestrator.fanout_limit == 0 {
            return invalid("orchestrator.fanout_limit must be at least 1");
        }
        if self.orchestrator.max_research_queries == 0 {
            return invalid("orchestrator.max_research_queries must be at least 1");
        }
        if self.orchestrator.input_timeout_secs == 0 {
            return invalid("orchestrator.input_timeout_secs must be greater than 0");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_factor < 1.0 {
            return invalid("retry.backoff_factor must be >= 1.0");
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            return invalid("retry.max_backoff_ms must be >= retry.initial_backoff_ms");
        }
        if self.resilience.keepalive_interval_secs == 0 {
            return invalid("resilience.keepalive_interval_secs must be greater than 0");
        }
        if self.resilience.max_missed_keepalives == 0 {
            return invalid("resilience.max_missed_keepalives must be at least 1");
        }
        if self.storage.backend == StorageBackend::File && self.storage.path.is_none() {
            return invalid("storage.path is required for the file backend");
        }
        if let Some(temperature) = self.llm.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return invalid("llm.temperature must be between 0.0 and 2.0");
            }
        }
        if self.llm.provider != "openai" {
            return Err(ConfigError::InvalidConfig(format!(
                "Unsupported LLM provider: {}",
                self.llm.provider
            )));
        }
        for id in self.agents.keys() {
            if !crate::steps::Step::ALL
                .iter()
                .any(|step| step.agent_id() == Some(id.as_str()))
            {
                return Err(ConfigError::InvalidConfig(format!(
                    "agents.{id} does not name a pipeline agent"
                )));
            }
        }
        Ok(())
    }

    /// Get LLM API key from environment variable
    pub fn get_llm_api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.llm.api_key_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.llm.api_key_env.clone()))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.resilience.keepalive_interval_secs)
    }
}
