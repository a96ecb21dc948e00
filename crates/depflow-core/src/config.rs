use crate::actor::{ActorSettings, RetryPolicy};
use crate::dispatch::DispatcherConfig;
use crate::error::{FlowError, Result};
use crate::paths;
use crate::policy::EmptyPolicyOutcome;
use crate::types::UpdateFrequency;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long an idle worker waits before polling again.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a dequeued item stays hidden before it is redelivered.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Hide time for items put back because their actor was busy or the
    /// outcome could not be stored.
    #[serde(default = "default_nack_delay_ms")]
    pub nack_delay_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_nack_delay_ms() -> u64 {
    2_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            nack_delay_ms: default_nack_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// LeaseConfig / RetryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_lease_ttl_secs() -> u64 {
    600
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base of every minted `retryUrl`.
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

fn default_port() -> u16 {
    3150
}

fn default_public_url() -> String {
    "http://localhost:3150".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            public_url: default_public_url(),
        }
    }
}

// ---------------------------------------------------------------------------
// ScheduleConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Run the periodic sweeps in `serve`. The new-build trigger is
    /// unaffected.
    #[serde(default = "default_periodic_sweeps")]
    pub periodic_sweeps: bool,
    #[serde(default = "default_every_day_hours")]
    pub every_day_hours: u64,
    #[serde(default = "default_twice_daily_hours")]
    pub twice_daily_hours: u64,
    #[serde(default = "default_every_week_hours")]
    pub every_week_hours: u64,
}

fn default_periodic_sweeps() -> bool {
    true
}

fn default_every_day_hours() -> u64 {
    24
}

fn default_twice_daily_hours() -> u64 {
    12
}

fn default_every_week_hours() -> u64 {
    7 * 24
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            periodic_sweeps: default_periodic_sweeps(),
            every_day_hours: default_every_day_hours(),
            twice_daily_hours: default_twice_daily_hours(),
            every_week_hours: default_every_week_hours(),
        }
    }
}

impl ScheduleConfig {
    pub fn period_hours(&self, frequency: UpdateFrequency) -> Option<u64> {
        match frequency {
            UpdateFrequency::EveryDay => Some(self.every_day_hours),
            UpdateFrequency::TwiceDaily => Some(self.twice_daily_hours),
            UpdateFrequency::EveryWeek => Some(self.every_week_hours),
            UpdateFrequency::None | UpdateFrequency::EveryBuild => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Outcome for subscriptions that configure no merge policies.
    #[serde(default)]
    pub empty_policy_outcome: EmptyPolicyOutcome,
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Number of concurrent queue consumers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub merge: MergeConfig,
}

fn default_version() -> u32 {
    1
}

fn default_workers() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            workers: default_workers(),
            queue: QueueConfig::default(),
            lease: LeaseConfig::default(),
            retry: RetryConfig::default(),
            server: ServerConfig::default(),
            schedule: ScheduleConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(FlowError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: EngineConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        let dir = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data.as_bytes())?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn actor_settings(&self) -> ActorSettings {
        ActorSettings {
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts.max(1),
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
            },
            empty_policy_outcome: self.merge.empty_policy_outcome,
            public_url: self.server.public_url.clone(),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.workers.max(1),
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
            visibility_timeout: Duration::from_secs(self.queue.visibility_timeout_secs),
            lease_ttl: Duration::from_secs(self.lease.ttl_secs),
            nack_delay: Duration::from_millis(self.queue.nack_delay_ms),
        }
    }

    /// Sweep period per periodic frequency; empty when sweeps are off.
    pub fn sweep_periods(&self) -> Vec<(UpdateFrequency, Duration)> {
        if !self.schedule.periodic_sweeps {
            return Vec::new();
        }
        UpdateFrequency::periodic()
            .iter()
            .filter_map(|f| {
                let hours = self.schedule.period_hours(*f)?;
                (hours > 0).then(|| (*f, Duration::from_secs(hours * 60 * 60)))
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.workers == 0 {
            warnings.push(ConfigWarning::error("workers must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            warnings.push(ConfigWarning::error(
                "retry.max_attempts must be at least 1 (it counts the first attempt)",
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            warnings.push(ConfigWarning::warning(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }

        // Four host calls per item, each retried up to max_attempts times.
        let worst_case_ms = 4 * u64::from(self.retry.max_attempts) * self.retry.max_delay_ms;
        if self.lease.ttl_secs * 1000 < worst_case_ms {
            warnings.push(ConfigWarning::warning(format!(
                "lease.ttl_secs ({}) is shorter than the worst-case retry time ({}s); \
                 a slow actor may lose its lease mid-run",
                self.lease.ttl_secs,
                worst_case_ms / 1000
            )));
        }
        if self.queue.visibility_timeout_secs == 0 {
            warnings.push(ConfigWarning::error(
                "queue.visibility_timeout_secs must be greater than 0",
            ));
        }

        let url = self.server.public_url.trim();
        if url.is_empty() {
            warnings.push(ConfigWarning::error(
                "server.public_url is empty; retry URLs cannot be minted",
            ));
        } else if !url.starts_with("http://") && !url.starts_with("https://") {
            warnings.push(ConfigWarning::warning(format!(
                "server.public_url '{url}' is not an http(s) URL"
            )));
        }

        for frequency in UpdateFrequency::periodic() {
            if self.schedule.period_hours(*frequency) == Some(0) {
                warnings.push(ConfigWarning::error(format!(
                    "schedule period for '{frequency}' must be greater than 0"
                )));
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_warnings() {
        let warnings = EngineConfig::default().validate();
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: EngineConfig = serde_yaml::from_str("workers: 2\nserver:\n  port: 8080\n").unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.public_url, "http://localhost:3150");
        assert_eq!(cfg.queue, QueueConfig::default());
        assert!(cfg.schedule.periodic_sweeps);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = EngineConfig::default();
        cfg.merge.empty_policy_outcome = EmptyPolicyOutcome::Pending;
        cfg.save(dir.path()).unwrap();
        assert_eq!(EngineConfig::load(dir.path()).unwrap(), cfg);
    }

    #[test]
    fn load_missing_is_not_initialized() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            EngineConfig::load(dir.path()),
            Err(FlowError::NotInitialized)
        ));
    }

    #[test]
    fn disabled_sweeps_yield_no_periods() {
        let mut cfg = EngineConfig::default();
        assert_eq!(cfg.sweep_periods().len(), 3);
        cfg.schedule.periodic_sweeps = false;
        assert!(cfg.sweep_periods().is_empty());
    }

    #[test]
    fn validate_flags_zero_workers_and_bad_url() {
        let mut cfg = EngineConfig::default();
        cfg.workers = 0;
        cfg.server.public_url = "localhost".into();
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("workers")));
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains("public_url")));
    }

    #[test]
    fn validate_flags_short_lease() {
        let mut cfg = EngineConfig::default();
        cfg.lease.ttl_secs = 10;
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.message.contains("lease.ttl_secs")));
    }

    #[test]
    fn empty_policy_outcome_reaches_actor_settings() {
        let mut cfg = EngineConfig::default();
        cfg.merge.empty_policy_outcome = EmptyPolicyOutcome::Pending;
        cfg.server.public_url = "https://flow.example".into();
        let settings = cfg.actor_settings();
        assert_eq!(settings.empty_policy_outcome, EmptyPolicyOutcome::Pending);
        assert_eq!(settings.public_url, "https://flow.example");
    }
}
