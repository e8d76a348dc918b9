//! Worker configuration
//!
//! Read from the process environment after loading `.env`, if present.

use crate::core::PlanLimits;
use crate::scheduler::SchedulerConfig;
use crate::vault::KmsSettings;
use std::time::Duration;

/// Process-wide settings
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Master key provider selection
    pub kms: KmsSettings,

    /// SQLite URL (e.g., "sqlite:/var/lib/stepiq/worker.db")
    pub database_url: Option<String>,

    /// Redis URL for the queue and scheduler lock; in-process fallback when unset
    pub redis_url: Option<String>,

    /// Model gateway base URL
    pub model_gateway_url: Option<String>,

    pub model_timeout_secs: u64,

    pub scheduler: SchedulerConfig,

    /// Plan applied to every user by the scheduler
    pub plan: PlanLimits,

    pub webhook_max_attempts: u32,

    pub webhook_timeout: Duration,

    /// Runs executed concurrently by this process
    pub worker_concurrency: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            kms: KmsSettings::default(),
            database_url: None,
            redis_url: None,
            model_gateway_url: None,
            model_timeout_secs: 300,
            scheduler: SchedulerConfig::default(),
            plan: PlanLimits::default(),
            webhook_max_attempts: 3,
            webhook_timeout: Duration::from_millis(10_000),
            worker_concurrency: 4,
        }
    }
}

fn non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    non_empty(name).and_then(|v| v.trim().parse().ok())
}

impl WorkerSettings {
    /// Load `.env` and read `STEPIQ_*` variables
    ///
    /// - STEPIQ_MASTER_KEY, STEPIQ_MASTER_KEY_VERSION (default: 1)
    /// - STEPIQ_KMS_ENDPOINT, STEPIQ_KMS_TOKEN, STEPIQ_KMS_SECRET_PATH
    /// - STEPIQ_DATABASE_URL
    /// - STEPIQ_REDIS_URL
    /// - STEPIQ_MODEL_GATEWAY_URL, STEPIQ_MODEL_TIMEOUT_SECS (default: 300)
    /// - STEPIQ_SCHEDULER_POLL_SECS (default: 30)
    /// - STEPIQ_SCHEDULER_LOCK_TTL_SECS (default: 25)
    /// - STEPIQ_SCHEDULER_BATCH_SIZE (default: 100)
    /// - STEPIQ_PLAN_CRON_ENABLED (default: false)
    /// - STEPIQ_PLAN_MAX_RUNS_PER_DAY (default: 10, "unlimited" for no cap)
    /// - STEPIQ_WEBHOOK_MAX_ATTEMPTS (default: 3)
    /// - STEPIQ_WEBHOOK_TIMEOUT_MS (default: 10000)
    /// - STEPIQ_WORKER_CONCURRENCY (default: 4)
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let scheduler = SchedulerConfig {
            poll_interval: parsed::<u64>("STEPIQ_SCHEDULER_POLL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.scheduler.poll_interval),
            lock_ttl: parsed::<u64>("STEPIQ_SCHEDULER_LOCK_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.scheduler.lock_ttl),
            batch_size: parsed("STEPIQ_SCHEDULER_BATCH_SIZE")
                .unwrap_or(defaults.scheduler.batch_size),
        };

        let plan = PlanLimits {
            cron_enabled: parsed("STEPIQ_PLAN_CRON_ENABLED")
                .unwrap_or(defaults.plan.cron_enabled),
            max_runs_per_day: match non_empty("STEPIQ_PLAN_MAX_RUNS_PER_DAY") {
                Some(v) if v.trim().eq_ignore_ascii_case("unlimited") => None,
                Some(v) => v.trim().parse().ok().or(defaults.plan.max_runs_per_day),
                None => defaults.plan.max_runs_per_day,
            },
        };

        Self {
            kms: KmsSettings::from_env(),
            database_url: non_empty("STEPIQ_DATABASE_URL"),
            redis_url: non_empty("STEPIQ_REDIS_URL"),
            model_gateway_url: non_empty("STEPIQ_MODEL_GATEWAY_URL"),
            model_timeout_secs: parsed("STEPIQ_MODEL_TIMEOUT_SECS")
                .unwrap_or(defaults.model_timeout_secs),
            scheduler,
            plan,
            webhook_max_attempts: parsed("STEPIQ_WEBHOOK_MAX_ATTEMPTS")
                .unwrap_or(defaults.webhook_max_attempts)
                .max(1),
            webhook_timeout: parsed::<u64>("STEPIQ_WEBHOOK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.webhook_timeout),
            worker_concurrency: parsed("STEPIQ_WORKER_CONCURRENCY")
                .unwrap_or(defaults.worker_concurrency)
                .max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = WorkerSettings::default();
        assert_eq!(settings.scheduler.poll_interval, Duration::from_secs(30));
        assert_eq!(settings.scheduler.lock_ttl, Duration::from_secs(25));
        assert_eq!(settings.scheduler.batch_size, 100);
        assert_eq!(settings.webhook_max_attempts, 3);
        assert_eq!(settings.webhook_timeout, Duration::from_millis(10_000));
        assert!(settings.redis_url.is_none());
        assert!(!settings.plan.cron_enabled);
        assert_eq!(settings.plan.max_runs_per_day, Some(10));
    }
}
