//! quotawatch.toml configuration parser.
//!
//! The raw [`WatchConfig`] mirrors the file. [`WatchConfig::validate`]
//! turns it into [`Settings`], the immutable policy values the engines are
//! constructed with. Any validation failure is fatal at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::duration::parse_duration;

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("failed to read config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("invalid config: {0}")]
    Parse(String),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },

    #[error("{field} must be strictly descending, got {values:?}")]
    Ordering { field: &'static str, values: Vec<f64> },

    #[error("{0}")]
    Invalid(String),
}

// ── File layout ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub quota: QuotaConfig,
    pub services: ServicesConfig,
    pub history: HistoryConfig,
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval: String,
    pub fetch_timeout: String,
    pub retries: u32,
    pub retry_backoff: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: "60s".to_string(),
            fetch_timeout: "60s".to_string(),
            retries: 2,
            retry_backoff: "2s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl: String,
    pub short_ttl: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: "30m".to_string(),
            short_ttl: "5m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Quota cards to sample each tick.
    pub entities: Vec<String>,
    /// The card whose remaining balance drives the phase engine.
    pub balance_entity: String,
    pub threshold: f64,
    pub milestones: Vec<f64>,
    pub milestone_policy: MilestonePolicy,
    pub notify_limit: u32,
    pub loud_budget: u32,
    /// File backing the manual override channel.
    pub control_path: PathBuf,
    pub api_url: String,
    pub token: Option<String>,
    pub token_env: String,
    /// Browser-automation command printing the API token. Consulted
    /// when the token env var holds no key.
    pub token_command: Vec<String>,
    /// Browser-automation command printing quota cards as JSON. When a
    /// token is also available the HTTP API answers for cards the
    /// command missed.
    pub command: Vec<String>,
    /// Working directory for `command` and `token_command`.
    pub command_dir: Option<PathBuf>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            entities: vec!["CodeX 专用福利".to_string()],
            balance_entity: "CodeX 专用福利".to_string(),
            threshold: 5.0,
            milestones: vec![50.0, 20.0, 10.0, 5.0],
            milestone_policy: MilestonePolicy::Lowest,
            notify_limit: 5,
            loud_budget: 1,
            control_path: PathBuf::from("quota_override.txt"),
            api_url: "https://jp.duckcoding.com/api/usage/token/".to_string(),
            token: None,
            token_env: "DUCKCODING_TOKEN".to_string(),
            token_command: Vec::new(),
            command: Vec::new(),
            command_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub watch: Vec<String>,
    pub down: Vec<f64>,
    pub up: f64,
    /// Browser-automation command printing `[{name, percent_24h}]`.
    pub command: Vec<String>,
    /// Working directory for `command`.
    pub command_dir: Option<PathBuf>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            watch: vec![
                "日本线路（CodeX）".to_string(),
                "日本线路（Claude Code）".to_string(),
            ],
            down: vec![70.0, 60.0, 50.0, 30.0, 10.0],
            up: 80.0,
            command: vec![
                "node".to_string(),
                "scripts/fetch_status_services.js".to_string(),
            ],
            command_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Directory for the CSV history files. `None` disables history.
    pub dir: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            dir: Some(PathBuf::from("history")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// redb file for restart continuity. `None` keeps state in memory only.
    pub path: Option<PathBuf>,
}

// ── Validated policies ────────────────────────────────────────────

/// Fetch timeout and linear retry backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `attempt * backoff`,
    /// saturating at `Duration::MAX`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.checked_mul(attempt).unwrap_or(Duration::MAX)
    }
}

/// Long and short TTLs for the last-known-good cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub short_ttl: Duration,
}

/// Which milestone fires when one tick jumps across several.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestonePolicy {
    /// Deepest newly crossed milestone.
    #[default]
    Lowest,
    /// Shallowest newly crossed milestone.
    Highest,
}

/// Phase A/B hysteresis parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaPolicy {
    pub threshold: f64,
    /// Strictly descending, all `>= threshold`.
    pub milestones: Vec<f64>,
    pub milestone_policy: MilestonePolicy,
    /// Phase A reminders before escalating to phase B.
    pub notify_limit: u32,
    /// Loud phase A reminders per episode.
    pub loud_budget: u32,
}

impl QuotaPolicy {
    pub fn new(
        threshold: f64,
        milestones: Vec<f64>,
        milestone_policy: MilestonePolicy,
        notify_limit: u32,
        loud_budget: u32,
    ) -> Result<Self, ConfigError> {
        if !threshold.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "quota.threshold must be finite, got {threshold}"
            )));
        }
        ensure_descending("quota.milestones", &milestones)?;
        if let Some(m) = milestones.iter().find(|m| **m < threshold) {
            return Err(ConfigError::Invalid(format!(
                "quota milestone {m} is below the base threshold {threshold}"
            )));
        }
        if notify_limit == 0 {
            return Err(ConfigError::NonPositive {
                field: "quota.notify_limit",
            });
        }
        Ok(Self {
            threshold,
            milestones,
            milestone_policy,
            notify_limit,
            loud_budget,
        })
    }
}

/// Down/up thresholds for service availability.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdPolicy {
    /// Strictly descending, non-empty.
    pub down: Vec<f64>,
    pub up: f64,
}

impl ThresholdPolicy {
    pub fn new(down: Vec<f64>, up: f64) -> Result<Self, ConfigError> {
        if down.is_empty() {
            return Err(ConfigError::Invalid(
                "services.down needs at least one threshold".to_string(),
            ));
        }
        ensure_descending("services.down", &down)?;
        for t in down.iter().chain(std::iter::once(&up)) {
            if !(*t > 0.0 && *t <= 100.0) {
                return Err(ConfigError::Invalid(format!(
                    "service threshold {t} is outside (0, 100]"
                )));
            }
        }
        Ok(Self { down, up })
    }

    /// The deepest down threshold. Crossing it arms recovery alerts.
    pub fn floor(&self) -> f64 {
        self.down[self.down.len() - 1]
    }
}

/// Everything the engines need, validated.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub interval: Duration,
    pub retry: RetryPolicy,
    pub cache: CachePolicy,
    pub quota: QuotaPolicy,
    pub thresholds: ThresholdPolicy,
}

impl WatchConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config = Self::from_toml(&content)?;
        debug!(?path, "config loaded");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check ordering and ranges, and parse durations.
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let interval = duration_field("scheduler.interval", &self.scheduler.interval)?;
        let timeout = duration_field("scheduler.fetch_timeout", &self.scheduler.fetch_timeout)?;
        let backoff = duration_field("scheduler.retry_backoff", &self.scheduler.retry_backoff)?;
        if interval.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "scheduler.interval",
            });
        }
        if timeout.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "scheduler.fetch_timeout",
            });
        }

        let ttl = duration_field("cache.ttl", &self.cache.ttl)?;
        let short_ttl = duration_field("cache.short_ttl", &self.cache.short_ttl)?;
        if short_ttl > ttl {
            return Err(ConfigError::Invalid(format!(
                "cache.short_ttl ({short_ttl:?}) exceeds cache.ttl ({ttl:?})"
            )));
        }

        let q = &self.quota;
        if !q.entities.is_empty() && !q.entities.contains(&q.balance_entity) {
            return Err(ConfigError::Invalid(format!(
                "quota.balance_entity {:?} is not listed in quota.entities",
                q.balance_entity
            )));
        }
        let quota = QuotaPolicy::new(
            q.threshold,
            q.milestones.clone(),
            q.milestone_policy,
            q.notify_limit,
            q.loud_budget,
        )?;
        let thresholds = ThresholdPolicy::new(self.services.down.clone(), self.services.up)?;

        Ok(Settings {
            interval,
            retry: RetryPolicy {
                timeout,
                retries: self.scheduler.retries,
                backoff,
            },
            cache: CachePolicy { ttl, short_ttl },
            quota,
            thresholds,
        })
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field,
        value: value.to_string(),
    })
}

fn ensure_descending(field: &'static str, values: &[f64]) -> Result<(), ConfigError> {
    if values.windows(2).all(|w| w[0] > w[1]) && values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(ConfigError::Ordering {
            field,
            values: values.to_vec(),
        })
    }
}
