//! TOML configuration parsing and management.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

/// Step loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Loop ceiling per step (values below 1 are treated as 1)
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    /// How many server tools run at the same time
    #[serde(default = "default_tool_concurrency")]
    pub tool_concurrency: usize,
    /// Per-tool execution timeout
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_seconds: u64,
    /// Idle timeout for the final answer stream
    #[serde(default = "default_stream_idle")]
    pub stream_idle_timeout_ms: u64,
    /// Idle timeout for a streamed decision
    #[serde(default = "default_decision_idle")]
    pub decision_idle_timeout_ms: u64,
    /// Stream decisions through the aggregator instead of a single completion
    #[serde(default = "default_true")]
    pub stream_decision: bool,
    /// Default model name sent to the provider
    #[serde(default = "default_model")]
    pub model: String,
    /// Optional system prompt prepended by the memory context assembler
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// How many memory messages the assembler reads
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
    /// Server tools switched off at runtime
    #[serde(default)]
    pub disabled_tools: Vec<String>,
    /// How long step bookkeeping (including a parked WAIT_CLIENT step) lives untouched
    #[serde(default = "default_step_state_ttl")]
    pub step_state_ttl_secs: u64,
}

fn default_max_loops() -> u32 {
    10
}

fn default_tool_concurrency() -> usize {
    4
}

fn default_tool_timeout() -> u64 {
    300
}

fn default_stream_idle() -> u64 {
    180_000
}

fn default_decision_idle() -> u64 {
    90_000
}

fn default_true() -> bool {
    true
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_context_limit() -> usize {
    50
}

fn default_step_state_ttl() -> u64 {
    86_400
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_loops: default_max_loops(),
            tool_concurrency: default_tool_concurrency(),
            tool_timeout_seconds: default_tool_timeout(),
            stream_idle_timeout_ms: default_stream_idle(),
            decision_idle_timeout_ms: default_decision_idle(),
            stream_decision: true,
            model: default_model(),
            system_prompt: None,
            context_limit: default_context_limit(),
            disabled_tools: vec![],
            step_state_ttl_secs: default_step_state_ttl(),
        }
    }
}

impl OrchestratorConfig {
    /// Per-tool timeout as a [`Duration`].
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_seconds)
    }

    /// Idle timeout of the continuation stream.
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }

    /// Idle timeout of a streamed decision.
    pub fn decision_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_idle_timeout_ms)
    }

    /// Effective loop ceiling, never below one.
    pub fn effective_max_loops(&self) -> u32 {
        self.max_loops.max(1)
    }

    /// Idle lifetime of step bookkeeping.
    pub fn step_state_ttl(&self) -> Duration {
        Duration::from_secs(self.step_state_ttl_secs)
    }

    /// Whether a tool name is disabled.
    pub fn is_tool_disabled(&self, name: &str) -> bool {
        self.disabled_tools.iter().any(|t| t == name)
    }
}

/// Event hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_heartbeat")]
    pub heartbeat_every_secs: u64,
    #[serde(default = "default_step_ttl")]
    pub step_ttl_secs: u64,
    #[serde(default = "default_janitor")]
    pub janitor_every_secs: u64,
    /// Per-step multicast buffer; older frames are dropped for lagging subscribers
    #[serde(default = "default_buffer")]
    pub buffer_capacity: usize,
}

fn default_heartbeat() -> u64 {
    20
}

fn default_step_ttl() -> u64 {
    600
}

fn default_janitor() -> u64 {
    60
}

fn default_buffer() -> usize {
    1024
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_every_secs: default_heartbeat(),
            step_ttl_secs: default_step_ttl(),
            janitor_every_secs: default_janitor(),
            buffer_capacity: default_buffer(),
        }
    }
}

/// Idempotency ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ledger_ttl")]
    pub default_ttl_seconds: u64,
    /// Argument keys stripped before fingerprinting
    #[serde(default = "default_ignore_args")]
    pub ignore_args: Vec<String>,
    /// Optional JSONL file receiving audit records
    #[serde(default)]
    pub audit_log: Option<String>,
    /// Audit records kept in memory per scope
    #[serde(default = "default_audit_retention")]
    pub audit_retention: usize,
}

fn default_ledger_ttl() -> u64 {
    600
}

fn default_audit_retention() -> usize {
    256
}

fn default_ignore_args() -> Vec<String> {
    vec![
        "timestamp".to_string(),
        "requestId".to_string(),
        "nonce".to_string(),
    ]
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_seconds: default_ledger_ttl(),
            ignore_args: default_ignore_args(),
            audit_log: None,
            audit_retention: default_audit_retention(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Markdown transcript file; empty means a temp file is created
    #[serde(default)]
    pub log_file: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_file: String::new(),
            log_level: default_log_level(),
        }
    }
}

/// LLM provider endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_endpoint() -> String {
    "chat/completions".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Loads and manages configuration from TOML files.
#[derive(Debug, Clone)]
pub struct ConfigurationLoader {
    pub config_path: PathBuf,
    pub config: Configuration,
}

impl ConfigurationLoader {
    /// Initialize configuration loader.
    ///
    /// # Arguments
    /// * `config_path` - Path to TOML config file. If None, uses default config.
    pub fn new(config_path: Option<&Path>) -> Result<Self> {
        let config_path = config_path
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("config/stepflow.toml"));

        let config = if config_path.exists() {
            Self::load_config(&config_path)?
        } else {
            Self::get_default_config()
        };
        config.validate()?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Create a configuration loader from a pre-parsed Configuration.
    pub fn from_config(config: Configuration) -> Self {
        Self {
            config_path: PathBuf::from("config/stepflow.toml"),
            config,
        }
    }

    /// Parse configuration from an inline TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Configuration =
            toml::from_str(content).context("Failed to parse TOML config")?;
        config.validate()?;
        Ok(Self::from_config(config))
    }

    /// Load configuration from TOML file.
    fn load_config(path: &Path) -> Result<Configuration> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }

    /// Get default configuration.
    fn get_default_config() -> Configuration {
        let mut config = Configuration::default();
        config.logging.log_file = std::env::temp_dir()
            .join("stepflow")
            .join(format!(
                "steps_{}_{}.md",
                Utc::now().timestamp_millis(),
                std::process::id()
            ))
            .to_string_lossy()
            .to_string();
        config
    }

    /// Get numeric configuration value by dot-notation key.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        let c = &self.config;
        match key {
            "orchestrator.max_loops" => Some(c.orchestrator.max_loops as u64),
            "orchestrator.tool_concurrency" => Some(c.orchestrator.tool_concurrency as u64),
            "orchestrator.tool_timeout_seconds" => Some(c.orchestrator.tool_timeout_seconds),
            "orchestrator.stream_idle_timeout_ms" => Some(c.orchestrator.stream_idle_timeout_ms),
            "orchestrator.decision_idle_timeout_ms" => {
                Some(c.orchestrator.decision_idle_timeout_ms)
            }
            "orchestrator.step_state_ttl_secs" => Some(c.orchestrator.step_state_ttl_secs),
            "hub.heartbeat_every_secs" => Some(c.hub.heartbeat_every_secs),
            "hub.step_ttl_secs" => Some(c.hub.step_ttl_secs),
            "hub.janitor_every_secs" => Some(c.hub.janitor_every_secs),
            "hub.buffer_capacity" => Some(c.hub.buffer_capacity as u64),
            "ledger.default_ttl_seconds" => Some(c.ledger.default_ttl_seconds),
            _ => None,
        }
    }

    /// Get boolean configuration value.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match key {
            "orchestrator.stream_decision" => Some(self.config.orchestrator.stream_decision),
            "ledger.enabled" => Some(self.config.ledger.enabled),
            _ => None,
        }
    }
}

impl Configuration {
    /// Reject values that would stall the loop or the hub.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.tool_concurrency == 0 {
            bail!("orchestrator.tool_concurrency must be at least 1");
        }
        if self.orchestrator.max_loops == 0 {
            bail!("orchestrator.max_loops must be at least 1");
        }
        if self.hub.buffer_capacity == 0 {
            bail!("hub.buffer_capacity must be at least 1");
        }
        if self.hub.janitor_every_secs == 0 {
            bail!("hub.janitor_every_secs must be at least 1");
        }
        if self.hub.heartbeat_every_secs == 0 {
            bail!("hub.heartbeat_every_secs must be at least 1");
        }
        Ok(())
    }
}
