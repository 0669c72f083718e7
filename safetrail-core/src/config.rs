//! Configuration system for SafeTrail.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> environment (`SAFETRAIL_<SECTION>__<KEY>`) ->
//! programmatic overrides.

use crate::error::ConfigError;
use crate::memory::MemoryLimits;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AgentConfig {
    /// Human-readable warnings about suspicious values, prefixed by section.
    pub fn validate(&self) -> Vec<String> {
        let sections = [
            ("generation", self.generation.validate()),
            ("memory", self.memory.validate()),
            ("escalation", self.escalation.validate()),
            ("monitor", self.monitor.validate()),
        ];
        sections
            .into_iter()
            .flat_map(|(name, warnings)| {
                warnings
                    .into_iter()
                    .map(move |w| format!("[{}] {}", name, w))
            })
            .collect()
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }
}

/// Text generation provider settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// `gemini` or `mock`.
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: "gemini-1.5-flash-latest".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            base_url: None,
            timeout_secs: 30,
            temperature: 0.7,
            max_output_tokens: 2048,
        }
    }
}

impl GenerationConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !matches!(self.provider.as_str(), "gemini" | "mock") {
            warnings.push(format!(
                "unknown provider '{}'; falling back to mock generation",
                self.provider
            ));
        }
        if self.timeout_secs == 0 {
            warnings.push("timeout_secs is 0; every generation call will time out".to_string());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            warnings.push(format!(
                "temperature ({}) is outside the typical range 0.0-2.0",
                self.temperature
            ));
        }
        warnings
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub window_size: usize,
    pub max_observations_per_bucket: usize,
    pub max_contextual_entries: usize,
    pub max_effectiveness_samples: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        let limits = MemoryLimits::default();
        Self {
            window_size: limits.window_size,
            max_observations_per_bucket: limits.max_observations_per_bucket,
            max_contextual_entries: limits.max_contextual_entries,
            max_effectiveness_samples: limits.max_effectiveness_samples,
        }
    }
}

impl MemoryConfig {
    pub fn limits(&self) -> MemoryLimits {
        MemoryLimits {
            window_size: self.window_size,
            max_observations_per_bucket: self.max_observations_per_bucket,
            max_contextual_entries: self.max_contextual_entries,
            max_effectiveness_samples: self.max_effectiveness_samples,
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.window_size == 0 {
            warnings.push("window_size is 0; one turn will be kept".to_string());
        }
        warnings
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Delay between contact notification and the authority alert.
    pub authority_delay_secs: u64,
    /// How long a safety check-in waits for an answer.
    pub check_in_window_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            authority_delay_secs: 300,
            check_in_window_secs: 120,
        }
    }
}

impl EscalationConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.authority_delay_secs < 60 {
            warnings.push(format!(
                "authority_delay_secs is {}; contacts get little time to respond before authorities are alerted",
                self.authority_delay_secs
            ));
        }
        if self.check_in_window_secs == 0 {
            warnings.push("check_in_window_secs is 0; check-ins escalate immediately".to_string());
        }
        warnings
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub error_backoff_secs: u64,
    pub traffic_alert_threshold: u64,
    pub news_alert_threshold: usize,
    /// Run the full emergency protocol, not just contact notification, on high risk.
    pub promote_high_risk: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            error_backoff_secs: 30,
            traffic_alert_threshold: 2,
            news_alert_threshold: 1,
            promote_high_risk: false,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.interval_secs < 5 {
            warnings.push(format!(
                "interval_secs is {}; monitoring will poll providers very frequently",
                self.interval_secs
            ));
        }
        warnings
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub timeout_secs: u64,
    /// Seed for the simulated providers; unset means entropy.
    pub seed: Option<u64>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            seed: None,
        }
    }
}

/// Names of the environment variables holding Twilio credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub account_sid_env: String,
    pub auth_token_env: String,
    pub from_number_env: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            account_sid_env: "TWILIO_ACCOUNT_SID".to_string(),
            auth_token_env: "TWILIO_AUTH_TOKEN".to_string(),
            from_number_env: "TWILIO_PHONE_NUMBER".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    /// Per-user push channel capacity.
    pub push_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            push_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Where memory snapshots and logs live. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
    /// Optional `contacts.json` with emergency contacts per user.
    pub contacts_file: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("dev", "safetrail", "safetrail")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".safetrail"))
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.resolved_data_dir().join("memory")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.resolved_data_dir().join("logs")
    }
}

/// Path of the per-user config file, if the platform has a config dir.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "safetrail", "safetrail")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration with layered sources.
///
/// Priority (highest first):
/// 1. Explicit overrides
/// 2. Environment variables (`SAFETRAIL_MONITOR__INTERVAL_SECS`, ...)
/// 3. Explicit config file
/// 4. User config (`~/.config/safetrail/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    config_file: Option<&Path>,
    overrides: Option<&AgentConfig>,
) -> Result<AgentConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(AgentConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(path) = config_file {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("SAFETRAIL_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}
