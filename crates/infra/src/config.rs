//! Recovery runtime configuration.
//!
//! Every field has a default, so a deployment only sets what it wants to
//! change. Values come from `DOCFLOW_*` environment variables
//! ([`RecoveryConfig::from_env`]) or from a JSON document
//! ([`RecoveryConfig::from_json`]).

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use docflow_core::{TenantId, UserId};
use docflow_documents::DocumentStatus;

use crate::retry::RetryPolicy;

pub const ENV_STUCK_THRESHOLD_MINUTES: &str = "DOCFLOW_STUCK_THRESHOLD_MINUTES";
pub const ENV_RETRY_CEILING: &str = "DOCFLOW_RETRY_CEILING";
pub const ENV_POLL_INTERVAL_SECS: &str = "DOCFLOW_POLL_INTERVAL_SECS";
pub const ENV_MONITOR_TIMEOUT_SECS: &str = "DOCFLOW_MONITOR_TIMEOUT_SECS";
pub const ENV_LEASE_TTL_SECS: &str = "DOCFLOW_LEASE_TTL_SECS";
pub const ENV_DISPATCH_MAX_RETRIES: &str = "DOCFLOW_DISPATCH_MAX_RETRIES";
pub const ENV_SCHEDULER_PERIOD_SECS: &str = "DOCFLOW_SCHEDULER_PERIOD_SECS";
pub const ENV_MAX_PER_TICK: &str = "DOCFLOW_MAX_PER_TICK";
pub const ENV_MAX_CONCURRENCY: &str = "DOCFLOW_MAX_CONCURRENCY";
pub const ENV_SCHEDULER_TENANT: &str = "DOCFLOW_SCHEDULER_TENANT";
pub const ENV_SYSTEM_ACTOR: &str = "DOCFLOW_SYSTEM_ACTOR";
pub const ENV_LEASE_HOLDER: &str = "DOCFLOW_LEASE_HOLDER";

/// Largest accepted stuck threshold (ten years).
pub const MAX_THRESHOLD_MINUTES: u64 = 60 * 24 * 365 * 10;
/// Largest accepted poll interval, monitor timeout, lease TTL or scheduler period (one year).
pub const MAX_INTERVAL_SECS: u64 = 60 * 60 * 24 * 365;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),

    #[error("failed to parse configuration document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level configuration for the recovery runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub detector: DetectorConfig,
    pub coordinator: CoordinatorConfig,
    pub scheduler: SchedulerConfig,
    /// Backoff for transient store failures (applied by `RetryingStore`).
    pub store_retry: StoreRetryConfig,
}

/// Staleness thresholds for the stuck-item detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Threshold applied to every resumable status without an override.
    pub threshold_minutes: u64,
    /// Per-status overrides, keyed by canonical status name.
    pub threshold_overrides_minutes: BTreeMap<DocumentStatus, u64>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold_minutes: 30,
            threshold_overrides_minutes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Restarts allowed before a document is marked `PERMANENTLY_FAILED`.
    pub retry_ceiling: u32,
    pub poll_interval_secs: u64,
    pub monitor_timeout_secs: u64,
    /// Must exceed the monitor timeout.
    pub lease_ttl_secs: u64,
    pub dispatch_max_retries: u32,
    pub dispatch_base_backoff_ms: u64,
    pub dispatch_max_backoff_ms: u64,
    /// Name written into leases so operators can tell coordinators apart.
    pub lease_holder: String,
    /// Actor used for dispatch when a document has no owner.
    pub system_actor: UserId,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 5,
            poll_interval_secs: 10,
            monitor_timeout_secs: 120,
            lease_ttl_secs: 600,
            dispatch_max_retries: 3,
            dispatch_base_backoff_ms: 500,
            dispatch_max_backoff_ms: 8_000,
            lease_holder: "docflow-coordinator".to_string(),
            system_actor: UserId::from_uuid(Uuid::nil()),
        }
    }
}

impl CoordinatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn monitor_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn dispatch_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.dispatch_max_retries,
            Duration::from_millis(self.dispatch_base_backoff_ms),
            Duration::from_millis(self.dispatch_max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub period_secs: u64,
    /// Candidates dispatched per tick; the rest wait for the next tick.
    pub max_per_tick: usize,
    pub max_concurrency: usize,
    /// Restrict scans to one tenant. `None` scans every tenant.
    pub tenant: Option<TenantId>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            period_secs: 60,
            max_per_tick: 50,
            max_concurrency: 8,
            tenant: None,
        }
    }
}

impl SchedulerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreRetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl StoreRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl RecoveryConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        set(&lookup, ENV_STUCK_THRESHOLD_MINUTES, &mut cfg.detector.threshold_minutes)?;
        set(&lookup, ENV_RETRY_CEILING, &mut cfg.coordinator.retry_ceiling)?;
        set(&lookup, ENV_POLL_INTERVAL_SECS, &mut cfg.coordinator.poll_interval_secs)?;
        set(&lookup, ENV_MONITOR_TIMEOUT_SECS, &mut cfg.coordinator.monitor_timeout_secs)?;
        set(&lookup, ENV_LEASE_TTL_SECS, &mut cfg.coordinator.lease_ttl_secs)?;
        set(&lookup, ENV_DISPATCH_MAX_RETRIES, &mut cfg.coordinator.dispatch_max_retries)?;
        set(&lookup, ENV_SYSTEM_ACTOR, &mut cfg.coordinator.system_actor)?;
        set(&lookup, ENV_SCHEDULER_PERIOD_SECS, &mut cfg.scheduler.period_secs)?;
        set(&lookup, ENV_MAX_PER_TICK, &mut cfg.scheduler.max_per_tick)?;
        set(&lookup, ENV_MAX_CONCURRENCY, &mut cfg.scheduler.max_concurrency)?;

        if let Some(holder) = lookup(ENV_LEASE_HOLDER).filter(|v| !v.trim().is_empty()) {
            cfg.coordinator.lease_holder = holder.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_SCHEDULER_TENANT).filter(|v| !v.trim().is_empty()) {
            let tenant = raw.parse::<TenantId>().map_err(|e| ConfigError::InvalidValue {
                key: ENV_SCHEDULER_TENANT,
                value: raw.clone(),
                reason: e.to_string(),
            })?;
            cfg.scheduler.tenant = Some(tenant);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.coordinator;

        if self.detector.threshold_minutes == 0
            || self.detector.threshold_overrides_minutes.values().any(|m| *m == 0)
        {
            return Err(ConfigError::Inconsistent(
                "stuck thresholds must be at least one minute".into(),
            ));
        }
        if self.detector.threshold_minutes > MAX_THRESHOLD_MINUTES
            || self
                .detector
                .threshold_overrides_minutes
                .values()
                .any(|m| *m > MAX_THRESHOLD_MINUTES)
        {
            return Err(ConfigError::Inconsistent(format!(
                "stuck thresholds must not exceed {MAX_THRESHOLD_MINUTES} minutes"
            )));
        }
        if let Some(status) = self
            .detector
            .threshold_overrides_minutes
            .keys()
            .find(|s| !s.is_resumable())
        {
            return Err(ConfigError::Inconsistent(format!(
                "threshold override for {status}, which is not a resumable status"
            )));
        }
        if c.poll_interval_secs == 0 {
            return Err(ConfigError::Inconsistent("poll interval must be non-zero".into()));
        }
        if c.monitor_timeout_secs < c.poll_interval_secs {
            return Err(ConfigError::Inconsistent(format!(
                "monitor timeout ({}s) is shorter than the poll interval ({}s)",
                c.monitor_timeout_secs, c.poll_interval_secs
            )));
        }
        if c.lease_ttl_secs <= c.monitor_timeout_secs {
            return Err(ConfigError::Inconsistent(format!(
                "lease TTL ({}s) must exceed the monitor timeout ({}s)",
                c.lease_ttl_secs, c.monitor_timeout_secs
            )));
        }
        for (name, secs) in [
            ("poll interval", c.poll_interval_secs),
            ("monitor timeout", c.monitor_timeout_secs),
            ("lease TTL", c.lease_ttl_secs),
            ("scheduler period", self.scheduler.period_secs),
        ] {
            if secs > MAX_INTERVAL_SECS {
                return Err(ConfigError::Inconsistent(format!(
                    "{name} ({secs}s) exceeds {MAX_INTERVAL_SECS}s"
                )));
            }
        }
        if self.scheduler.period_secs == 0 {
            return Err(ConfigError::Inconsistent("scheduler period must be non-zero".into()));
        }
        if self.scheduler.max_concurrency == 0 || self.scheduler.max_per_tick == 0 {
            return Err(ConfigError::Inconsistent(
                "scheduler concurrency and per-tick cap must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn set<T, F>(lookup: &F, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    *slot = trimmed.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value: raw.clone(),
        reason: e.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RecoveryConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.detector.threshold_minutes, 30);
        assert_eq!(cfg.coordinator.retry_ceiling, 5);
        assert_eq!(cfg.coordinator.poll_interval(), Duration::from_secs(10));
        assert_eq!(cfg.coordinator.monitor_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.coordinator.lease_ttl(), Duration::from_secs(600));
        assert_eq!(cfg.coordinator.dispatch_max_retries, 3);
        assert_eq!(cfg.scheduler.period(), Duration::from_secs(60));
        assert_eq!(cfg.scheduler.max_per_tick, 50);
        assert_eq!(cfg.scheduler.max_concurrency, 8);
    }

    #[test]
    fn env_values_override_defaults() {
        let tenant = TenantId::new();
        let tenant_str = tenant.to_string();
        let cfg = RecoveryConfig::from_lookup(lookup(&[
            (ENV_STUCK_THRESHOLD_MINUTES, "45"),
            (ENV_RETRY_CEILING, " 2 "),
            (ENV_MAX_CONCURRENCY, "3"),
            (ENV_SCHEDULER_TENANT, tenant_str.as_str()),
            (ENV_LEASE_HOLDER, "worker-7"),
        ]))
        .unwrap();

        assert_eq!(cfg.detector.threshold_minutes, 45);
        assert_eq!(cfg.coordinator.retry_ceiling, 2);
        assert_eq!(cfg.scheduler.max_concurrency, 3);
        assert_eq!(cfg.scheduler.tenant, Some(tenant));
        assert_eq!(cfg.coordinator.lease_holder, "worker-7");
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = RecoveryConfig::from_lookup(lookup(&[(ENV_RETRY_CEILING, "five")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value, .. } => {
                assert_eq!(key, ENV_RETRY_CEILING);
                assert_eq!(value, "five");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn lease_ttl_must_outlive_the_monitor() {
        let err = RecoveryConfig::from_lookup(lookup(&[
            (ENV_MONITOR_TIMEOUT_SECS, "300"),
            (ENV_LEASE_TTL_SECS, "300"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err =
            RecoveryConfig::from_lookup(lookup(&[(ENV_POLL_INTERVAL_SECS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn oversized_thresholds_are_rejected() {
        let err = RecoveryConfig::from_lookup(lookup(&[(
            ENV_STUCK_THRESHOLD_MINUTES,
            "1000000000000000",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));

        let err = RecoveryConfig::from_json(
            r#"{ "detector": { "threshold_overrides_minutes": { "running": 18446744073709551615 } } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));

        let at_limit = MAX_THRESHOLD_MINUTES.to_string();
        let cfg = RecoveryConfig::from_lookup(lookup(&[(
            ENV_STUCK_THRESHOLD_MINUTES,
            at_limit.as_str(),
        )]))
        .unwrap();
        assert_eq!(cfg.detector.threshold_minutes, MAX_THRESHOLD_MINUTES);
    }

    #[test]
    fn oversized_lease_ttl_is_rejected() {
        let err = RecoveryConfig::from_lookup(lookup(&[(
            ENV_LEASE_TTL_SECS,
            "18446744073709551615",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn json_documents_fill_missing_fields_with_defaults() {
        let cfg = RecoveryConfig::from_json(
            r#"{
                "detector": { "threshold_overrides_minutes": { "processing": 90 } },
                "scheduler": { "max_per_tick": 10 }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.detector.threshold_minutes, 30);
        assert_eq!(
            cfg.detector.threshold_overrides_minutes.get(&DocumentStatus::Processing),
            Some(&90)
        );
        assert_eq!(cfg.scheduler.max_per_tick, 10);
        assert_eq!(cfg.scheduler.period_secs, 60);
    }

    #[test]
    fn overrides_for_terminal_statuses_are_rejected() {
        let err = RecoveryConfig::from_json(
            r#"{ "detector": { "threshold_overrides_minutes": { "FINISHED": 5 } } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }
}
