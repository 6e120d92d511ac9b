use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::gates::GateThresholds;

/// Top-level configuration loaded from `~/.ai-sprint/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
}

impl Config {
    /// Load config from `~/.ai-sprint/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.agents.validate()?;
        self.timeouts.validate()?;
        self.quality.validate()?;
        self.escalation.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        home().join(".ai-sprint").join("config.toml")
    }

    /// `general.database_path` with a leading `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.general.database_path)
    }

    pub fn gate_thresholds(&self) -> GateThresholds {
        GateThresholds {
            coverage_min: self.quality.coverage_threshold,
            mutation_min: self.quality.mutation_threshold,
            complexity_flag: f64::from(self.quality.complexity_flag),
            complexity_max: f64::from(self.quality.complexity_max),
            ac_satisfied_min: self.quality.ac_satisfied_percent,
            sast_high_max: f64::from(self.security.sast_high_max),
            critical_cve_max: f64::from(self.security.critical_cve_max),
            high_cve_max: f64::from(self.security.high_cve_max),
            medium_cve_max: f64::from(self.security.medium_cve_max),
            secret_max: f64::from(self.security.secret_max),
        }
    }
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => home().join(rest),
        None if raw == "~" => home(),
        None => Path::new(raw).to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

fn check_range<T>(name: &str, value: T, min: T, max: T) -> Result<(), ConfigError>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(ConfigError::Validation(format!(
            "{name} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

fn check_min<T>(name: &str, value: T, min: T) -> Result<(), ConfigError>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min {
        return Err(ConfigError::Validation(format!(
            "{name} must be at least {min}, got {value}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_database_path() -> String {
    "~/.ai-sprint/state.db".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_max_workers")]
    pub max_developers: u32,
    #[serde(default = "default_max_workers")]
    pub max_testers: u32,
    #[serde(default = "default_polling_interval_secs")]
    pub polling_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// argv of the worker process; empty disables respawning.
    #[serde(default)]
    pub worker_command: Vec<String>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_developers: default_max_workers(),
            max_testers: default_max_workers(),
            polling_interval_secs: default_polling_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            worker_command: Vec::new(),
        }
    }
}

impl AgentsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("agents.max_developers", self.max_developers, 1, 10)?;
        check_range("agents.max_testers", self.max_testers, 1, 10)?;
        check_min("agents.polling_interval_secs", self.polling_interval_secs, 1)?;
        check_min("agents.heartbeat_interval_secs", self.heartbeat_interval_secs, 10)?;
        Ok(())
    }
}

fn default_max_workers() -> u32 {
    3
}
fn default_polling_interval_secs() -> u64 {
    30
}
fn default_heartbeat_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_agent_hung_secs")]
    pub agent_hung_secs: u64,
    #[serde(default = "default_task_max_duration_secs")]
    pub task_max_duration_secs: u64,
    #[serde(default = "default_merge_timeout_secs")]
    pub merge_timeout_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            agent_hung_secs: default_agent_hung_secs(),
            task_max_duration_secs: default_task_max_duration_secs(),
            merge_timeout_secs: default_merge_timeout_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_min("timeouts.agent_hung_secs", self.agent_hung_secs, 60)?;
        check_min("timeouts.task_max_duration_secs", self.task_max_duration_secs, 60)?;
        check_min("timeouts.merge_timeout_secs", self.merge_timeout_secs, 30)?;
        Ok(())
    }
}

fn default_agent_hung_secs() -> u64 {
    300
}
fn default_task_max_duration_secs() -> u64 {
    7200
}
fn default_merge_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_percent_threshold")]
    pub coverage_threshold: f64,
    #[serde(default = "default_percent_threshold")]
    pub mutation_threshold: f64,
    #[serde(default = "default_complexity_flag")]
    pub complexity_flag: u32,
    #[serde(default = "default_complexity_max")]
    pub complexity_max: u32,
    #[serde(default = "default_ac_satisfied_percent")]
    pub ac_satisfied_percent: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            coverage_threshold: default_percent_threshold(),
            mutation_threshold: default_percent_threshold(),
            complexity_flag: default_complexity_flag(),
            complexity_max: default_complexity_max(),
            ac_satisfied_percent: default_ac_satisfied_percent(),
        }
    }
}

impl QualityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("quality.coverage_threshold", self.coverage_threshold, 0.0, 100.0)?;
        check_range("quality.mutation_threshold", self.mutation_threshold, 0.0, 100.0)?;
        check_range("quality.ac_satisfied_percent", self.ac_satisfied_percent, 0.0, 100.0)?;
        if self.complexity_flag > self.complexity_max {
            return Err(ConfigError::Validation(format!(
                "quality.complexity_flag ({}) must not exceed quality.complexity_max ({})",
                self.complexity_flag, self.complexity_max
            )));
        }
        Ok(())
    }
}

fn default_percent_threshold() -> f64 {
    80.0
}
fn default_complexity_flag() -> u32 {
    10
}
fn default_complexity_max() -> u32 {
    15
}
fn default_ac_satisfied_percent() -> f64 {
    100.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub critical_cve_max: u32,
    #[serde(default)]
    pub high_cve_max: u32,
    #[serde(default = "default_medium_cve_max")]
    pub medium_cve_max: u32,
    #[serde(default)]
    pub secret_max: u32,
    #[serde(default)]
    pub sast_high_max: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            critical_cve_max: 0,
            high_cve_max: 0,
            medium_cve_max: default_medium_cve_max(),
            secret_max: 0,
            sast_high_max: 0,
        }
    }
}

fn default_medium_cve_max() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_restart_limit")]
    pub restart_limit: u32,
    /// Human-review mailbox.
    #[serde(default = "default_escalation_target")]
    pub target: String,
    #[serde(default = "default_coordinator_target")]
    pub coordinator_target: String,
    #[serde(default = "default_docs_target")]
    pub docs_target: String,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            restart_limit: default_restart_limit(),
            target: default_escalation_target(),
            coordinator_target: default_coordinator_target(),
            docs_target: default_docs_target(),
        }
    }
}

impl EscalationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_min("escalation.failure_threshold", self.failure_threshold, 1)?;
        check_min("escalation.restart_limit", self.restart_limit, 1)?;
        for (name, value) in [
            ("escalation.target", &self.target),
            ("escalation.coordinator_target", &self.coordinator_target),
            ("escalation.docs_target", &self.docs_target),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Validation(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_restart_limit() -> u32 {
    3
}
fn default_escalation_target() -> String {
    "human-review".into()
}
fn default_coordinator_target() -> String {
    "manager".into()
}
fn default_docs_target() -> String {
    "librarian".into()
}
