//! Configuration loading, validation, and management for Cadence.
//!
//! Loads configuration from `~/.cadence/config.toml` with environment
//! variable overrides. Every field has a default, so a missing file is a
//! valid configuration. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.cadence/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    /// Acceptance threshold and hard constraints
    #[serde(default)]
    pub decision: DecisionConfig,

    /// Fallback chain and circuit breaker
    #[serde(default)]
    pub backends: BackendsConfig,

    /// Jitter and fatigue model
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Dispatch retries
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Per-session loop timing
    #[serde(default)]
    pub session: SessionConfig,

    /// Safety ceilings
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Audit trail destinations
    #[serde(default)]
    pub audit: AuditConfig,

    /// Explicit session definitions (one per target)
    #[serde(default)]
    pub sessions: Vec<SessionSpecConfig>,

    /// Simulated collaborators used by `cadence run`
    #[serde(default)]
    pub simulation: SimulationConfig,
}

fn default_true() -> bool {
    true
}

// ── Decision ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Minimum confidence for a candidate to become a plan
    #[serde(default = "default_acceptance_threshold")]
    pub acceptance_threshold: f64,

    /// Action kinds rejected for every session
    #[serde(default)]
    pub disallowed_kinds: Vec<String>,

    /// How many backends are consulted per observation
    #[serde(default)]
    pub consult: ConsultMode,
}

fn default_acceptance_threshold() -> f64 {
    0.6
}

/// How the decision stage queries the fallback chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultMode {
    /// Stop at the first backend that answers (pure failover)
    #[default]
    FirstAvailable,
    /// Ask every available backend and keep the best candidate
    AllAvailable,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: default_acceptance_threshold(),
            disallowed_kinds: vec![],
            consult: ConsultMode::default(),
        }
    }
}

// ── Backends ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// Backend ids in priority order (first = preferred)
    #[serde(default = "default_fallback_chain")]
    pub fallback_chain: Vec<String>,

    /// Consecutive failures before a circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit waits before a half-open probe
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Upper bound on a single backend call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Rule-table backend definitions
    #[serde(default = "default_rule_tables")]
    pub rule_tables: Vec<RuleTableConfig>,
}

fn default_fallback_chain() -> Vec<String> {
    vec!["primary".into(), "fallback".into()]
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_cooldown_ms() -> u64 {
    30_000
}
fn default_call_timeout_ms() -> u64 {
    2_000
}

fn default_rule_tables() -> Vec<RuleTableConfig> {
    vec![
        RuleTableConfig {
            id: "primary".into(),
            fallback_kind: default_fallback_kind(),
            rules: vec![
                RuleConfig {
                    feature: 0,
                    op: ComparisonOp::Gt,
                    threshold: 0.8,
                    kind: "reel".into(),
                    confidence: 0.9,
                    parameters: serde_json::Map::new(),
                },
                RuleConfig {
                    feature: 1,
                    op: ComparisonOp::Lt,
                    threshold: 0.2,
                    kind: "cast".into(),
                    confidence: 0.75,
                    parameters: serde_json::Map::new(),
                },
            ],
        },
        RuleTableConfig {
            id: "fallback".into(),
            fallback_kind: default_fallback_kind(),
            rules: vec![RuleConfig {
                feature: 0,
                op: ComparisonOp::Ge,
                threshold: 0.5,
                kind: "reel".into(),
                confidence: 0.65,
                parameters: serde_json::Map::new(),
            }],
        },
    ]
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            fallback_chain: default_fallback_chain(),
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            rule_tables: default_rule_tables(),
        }
    }
}

/// A rule-table backend: the first matching rule wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTableConfig {
    pub id: String,

    /// Kind proposed (with zero confidence) when no rule matches
    #[serde(default = "default_fallback_kind")]
    pub fallback_kind: String,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

fn default_fallback_kind() -> String {
    "wait".into()
}

/// One row of a rule table: `features[feature] <op> threshold => kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub feature: usize,
    pub op: ComparisonOp,
    pub threshold: f64,
    pub kind: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOp {
    Gt,
    Ge,
    Lt,
    Le,
}

impl ComparisonOp {
    pub fn evaluate(self, value: f64, threshold: f64) -> bool {
        match self {
            ComparisonOp::Gt => value > threshold,
            ComparisonOp::Ge => value >= threshold,
            ComparisonOp::Lt => value < threshold,
            ComparisonOp::Le => value <= threshold,
        }
    }
}

// ── Scheduler ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Distribution the dispatch delay is drawn from
    #[serde(default)]
    pub jitter: JitterKind,

    /// Fatigue added per scheduled action
    #[serde(default = "default_fatigue_increment")]
    pub fatigue_increment: f64,

    /// Fatigue removed per idle second
    #[serde(default = "default_fatigue_decay_per_sec")]
    pub fatigue_decay_per_sec: f64,

    /// Fatigue level that forces a break
    #[serde(default = "default_fatigue_threshold")]
    pub fatigue_threshold: f64,

    /// How strongly fatigue stretches the sampled delay toward max_delay
    #[serde(default = "default_fatigue_slowdown")]
    pub fatigue_slowdown: f64,

    /// Extra delay added when a break is forced
    #[serde(default = "default_break_extension_ms")]
    pub break_extension_ms: u64,

    /// Maximum observation-to-dispatch latency
    #[serde(default = "default_latency_budget_ms")]
    pub latency_budget_ms: u64,

    /// Minimum pause between cycles
    #[serde(default = "default_base_cooldown_ms")]
    pub base_cooldown_ms: u64,

    /// Additional pause at full fatigue
    #[serde(default = "default_fatigue_cooldown_ms")]
    pub fatigue_cooldown_ms: u64,
}

fn default_min_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    900
}
fn default_fatigue_increment() -> f64 {
    0.05
}
fn default_fatigue_decay_per_sec() -> f64 {
    0.01
}
fn default_fatigue_threshold() -> f64 {
    0.9
}
fn default_fatigue_slowdown() -> f64 {
    0.5
}
fn default_break_extension_ms() -> u64 {
    15_000
}
fn default_latency_budget_ms() -> u64 {
    20_000
}
fn default_base_cooldown_ms() -> u64 {
    500
}
fn default_fatigue_cooldown_ms() -> u64 {
    2_000
}

/// Jitter distribution for dispatch delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterKind {
    /// Uniform within `[min_delay, max_delay]`
    #[default]
    Uniform,
    /// Peaked at the midpoint of `[min_delay, max_delay]`
    Triangular,
    /// No randomization: always the midpoint
    None,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: JitterKind::default(),
            fatigue_increment: default_fatigue_increment(),
            fatigue_decay_per_sec: default_fatigue_decay_per_sec(),
            fatigue_threshold: default_fatigue_threshold(),
            fatigue_slowdown: default_fatigue_slowdown(),
            break_extension_ms: default_break_extension_ms(),
            latency_budget_ms: default_latency_budget_ms(),
            base_cooldown_ms: default_base_cooldown_ms(),
            fatigue_cooldown_ms: default_fatigue_cooldown_ms(),
        }
    }
}

// ── Executor ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Retries after the first attempt for recoverable failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// A dispatch that runs longer counts as a recoverable failure
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_dispatch_timeout_ms() -> u64 {
    5_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
        }
    }
}

// ── Session ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long to wait for an observation before the cycle is missed
    #[serde(default = "default_observation_timeout_ms")]
    pub observation_timeout_ms: u64,

    /// Consecutive missed cycles tolerated before a safety stop
    #[serde(default = "default_missed_cycle_ceiling")]
    pub missed_cycle_ceiling: u32,

    /// Upper bound on stop-signal latency for polled stop sources
    #[serde(default = "default_stop_quantum_ms")]
    pub stop_quantum_ms: u64,

    /// Cycles per session before it finishes on its own (0 = unbounded)
    #[serde(default)]
    pub max_cycles: u64,
}

fn default_observation_timeout_ms() -> u64 {
    3_000
}
fn default_missed_cycle_ceiling() -> u32 {
    10
}
fn default_stop_quantum_ms() -> u64 {
    250
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            observation_timeout_ms: default_observation_timeout_ms(),
            missed_cycle_ceiling: default_missed_cycle_ceiling(),
            stop_quantum_ms: default_stop_quantum_ms(),
            max_cycles: 0,
        }
    }
}

// ── Safety ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Failures tolerated inside the window; one more stops the session
    #[serde(default = "default_failure_ceiling")]
    pub failure_ceiling: u32,

    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
}

fn default_failure_ceiling() -> u32 {
    5
}
fn default_failure_window_ms() -> u64 {
    60_000
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            failure_ceiling: default_failure_ceiling(),
            failure_window_ms: default_failure_window_ms(),
        }
    }
}

// ── Audit ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Append audit entries as JSON lines to this file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonl_path: Option<String>,

    /// Log every entry through tracing
    #[serde(default = "default_true")]
    pub log_entries: bool,

    /// Keep every entry in memory for replay. Off by default: a long run
    /// would grow the buffer without bound.
    #[serde(default)]
    pub retain_in_memory: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            jsonl_path: None,
            log_entries: true,
            retain_in_memory: false,
        }
    }
}

// ── Sessions ────────────────────────────────────────────────────────────────

/// One explicitly configured session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSpecConfig {
    pub id: String,

    /// Extra kinds disallowed for this session only
    #[serde(default)]
    pub disallowed_kinds: Vec<String>,
}

// ── Simulation ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Sessions to create when none are configured explicitly
    #[serde(default = "default_sim_sessions")]
    pub sessions: u32,

    /// Interval between synthetic observations
    #[serde(default = "default_observation_interval_ms")]
    pub observation_interval_ms: u64,

    /// Probability a dispatch fails recoverably
    #[serde(default = "default_sink_failure_rate")]
    pub sink_failure_rate: f64,

    /// Probability a dispatch fails fatally
    #[serde(default)]
    pub sink_fatal_rate: f64,

    /// Per-backend probability of a failed prediction
    #[serde(default)]
    pub backend_failure_rates: HashMap<String, f64>,
}

fn default_sim_sessions() -> u32 {
    2
}
fn default_observation_interval_ms() -> u64 {
    800
}
fn default_sink_failure_rate() -> f64 {
    0.05
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            sessions: default_sim_sessions(),
            observation_interval_ms: default_observation_interval_ms(),
            sink_failure_rate: default_sink_failure_rate(),
            sink_fatal_rate: 0.0,
            backend_failure_rates: HashMap::new(),
        }
    }
}

// ── Loading ─────────────────────────────────────────────────────────────────

impl CadenceConfig {
    /// Load configuration from the default path (~/.cadence/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `CADENCE_ACCEPTANCE_THRESHOLD`
    /// - `CADENCE_FALLBACK_CHAIN` (comma-separated backend ids)
    /// - `CADENCE_NO_JITTER` (any value except "0"/"false")
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_with_env(&config_path)
    }

    /// Load from a specific file, then apply environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("CADENCE_ACCEPTANCE_THRESHOLD") {
            self.decision.acceptance_threshold = raw.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "CADENCE_ACCEPTANCE_THRESHOLD is not a number: {raw}"
                ))
            })?;
        }

        if let Some(raw) = lookup("CADENCE_FALLBACK_CHAIN") {
            self.backends.fallback_chain = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(raw) = lookup("CADENCE_NO_JITTER") {
            let raw = raw.trim().to_ascii_lowercase();
            if raw != "0" && raw != "false" {
                self.scheduler.jitter = JitterKind::None;
            }
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".cadence")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.decision.acceptance_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::ValidationError(
                "decision.acceptance_threshold must be between 0.0 and 1.0".into(),
            ));
        }

        if self.backends.fallback_chain.is_empty() {
            return Err(ConfigError::ValidationError(
                "backends.fallback_chain must name at least one backend".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for id in &self.backends.fallback_chain {
            if !seen.insert(id) {
                return Err(ConfigError::ValidationError(format!(
                    "backend '{id}' appears twice in backends.fallback_chain"
                )));
            }
        }
        if self.backends.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "backends.failure_threshold must be at least 1".into(),
            ));
        }
        if self.backends.call_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "backends.call_timeout_ms must be > 0".into(),
            ));
        }

        let s = &self.scheduler;
        if s.min_delay_ms > s.max_delay_ms {
            return Err(ConfigError::ValidationError(
                "scheduler.min_delay_ms must not exceed scheduler.max_delay_ms".into(),
            ));
        }
        if !(s.fatigue_threshold > 0.0 && s.fatigue_threshold <= 1.0) {
            return Err(ConfigError::ValidationError(
                "scheduler.fatigue_threshold must be in (0.0, 1.0]".into(),
            ));
        }
        if s.fatigue_increment < 0.0 || s.fatigue_decay_per_sec < 0.0 || s.fatigue_slowdown < 0.0
        {
            return Err(ConfigError::ValidationError(
                "scheduler fatigue rates must not be negative".into(),
            ));
        }
        // A forced break must always fit, otherwise fatigue could never reset.
        if s.latency_budget_ms < s.max_delay_ms.saturating_add(s.break_extension_ms) {
            return Err(ConfigError::ValidationError(
                "scheduler.latency_budget_ms must be >= max_delay_ms + break_extension_ms".into(),
            ));
        }

        if self.session.stop_quantum_ms == 0 {
            return Err(ConfigError::ValidationError(
                "session.stop_quantum_ms must be > 0".into(),
            ));
        }
        if self.session.observation_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "session.observation_timeout_ms must be > 0".into(),
            ));
        }

        for rate in [self.simulation.sink_failure_rate, self.simulation.sink_fatal_rate]
            .into_iter()
            .chain(self.simulation.backend_failure_rates.values().copied())
        {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::ValidationError(
                    "simulation rates must be between 0.0 and 1.0".into(),
                ));
            }
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `cadence config --defaults`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            decision: DecisionConfig::default(),
            backends: BackendsConfig::default(),
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            session: SessionConfig::default(),
            safety: SafetyConfig::default(),
            audit: AuditConfig::default(),
            sessions: vec![],
            simulation: SimulationConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
