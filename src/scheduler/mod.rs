//! Cron scheduler
//!
//! One tick runs at startup and then every poll interval. A tick only does
//! work while holding the distributed lock, so at most one worker process
//! creates cron runs at a time.

pub mod cron;
pub mod lock;

pub use cron::{parse_timezone, CronExpression, CronParseError};
pub use lock::{lock_token, DistributedLock, MemoryLock, SCHEDULER_LOCK_KEY};
#[cfg(feature = "redis")]
pub use lock::RedisLock;

use crate::core::{PlanLimits, Schedule, TriggerType};
use crate::execution::create_and_enqueue_run;
use crate::persistence::Store;
use crate::queue::JobQueue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-schedule failures; logged, the tick moves on
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    InvalidCron(#[from] CronParseError),

    #[error("{0}")]
    InvalidTimezone(String),

    #[error("Pipeline {0} not found")]
    PipelineNotFound(Uuid),

    #[error("{0:#}")]
    Store(#[from] anyhow::Error),
}

/// Source of a user's plan limits
#[async_trait]
pub trait PlanLimitsProvider: Send + Sync {
    async fn limits_for(&self, user_id: &str) -> anyhow::Result<PlanLimits>;
}

/// Fixed limits with optional per-user overrides
#[derive(Debug, Clone, Default)]
pub struct StaticPlanLimits {
    default: PlanLimits,
    overrides: HashMap<String, PlanLimits>,
}

impl StaticPlanLimits {
    pub fn new(default: PlanLimits) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>, limits: PlanLimits) -> Self {
        self.overrides.insert(user_id.into(), limits);
        self
    }
}

#[async_trait]
impl PlanLimitsProvider for StaticPlanLimits {
    async fn limits_for(&self, user_id: &str) -> anyhow::Result<PlanLimits> {
        Ok(self.overrides.get(user_id).copied().unwrap_or(self.default))
    }
}

/// Scheduler tuning
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub lock_ttl: Duration,
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(25),
            batch_size: 100,
        }
    }
}

/// What a tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub lock_acquired: bool,
    pub due: usize,
    pub runs_created: usize,
    /// Advanced without a run (plan disabled or daily cap reached)
    pub skipped: usize,
    pub failed: usize,
}

enum ScheduleAction {
    Created(Uuid),
    Skipped(&'static str),
}

pub struct CronScheduler {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    lock: Arc<dyn DistributedLock>,
    plans: Arc<dyn PlanLimitsProvider>,
    config: SchedulerConfig,
}

impl CronScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        lock: Arc<dyn DistributedLock>,
        plans: Arc<dyn PlanLimitsProvider>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            lock,
            plans,
            config,
        }
    }

    /// Tick immediately, then every poll interval, until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Scheduler started (poll every {:?}, lock TTL {:?})",
            self.config.poll_interval, self.config.lock_ttl
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report.due > 0 => info!(
                            "Scheduler tick: {} due, {} created, {} skipped, {} failed",
                            report.due, report.runs_created, report.skipped, report.failed
                        ),
                        Ok(_) => {}
                        Err(e) => error!("Scheduler tick failed: {:#}", e),
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// Run one tick as of `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<TickReport> {
        let token = lock_token();
        if !self
            .lock
            .try_acquire(SCHEDULER_LOCK_KEY, &token, self.config.lock_ttl)
            .await?
        {
            debug!("Scheduler lock held elsewhere; skipping tick");
            return Ok(TickReport::default());
        }

        let result = self.process_due(now).await;

        match self.lock.release(SCHEDULER_LOCK_KEY, &token).await {
            Ok(true) => {}
            Ok(false) => warn!("Scheduler lock expired before release"),
            Err(e) => warn!("Failed to release scheduler lock: {:#}", e),
        }

        result
    }

    async fn process_due(&self, now: DateTime<Utc>) -> anyhow::Result<TickReport> {
        let schedules = self.store.due_schedules(now, self.config.batch_size).await?;
        let mut report = TickReport {
            lock_acquired: true,
            due: schedules.len(),
            ..Default::default()
        };

        for schedule in &schedules {
            match self.process_schedule(schedule, now).await {
                Ok(ScheduleAction::Created(run_id)) => {
                    info!(schedule_id = %schedule.id, run_id = %run_id, "Created cron run");
                    report.runs_created += 1;
                }
                Ok(ScheduleAction::Skipped(reason)) => {
                    info!(schedule_id = %schedule.id, "Skipped cron run: {}", reason);
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(schedule_id = %schedule.id, "Failed to process schedule: {}", e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn process_schedule(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<ScheduleAction, SchedulerError> {
        let pipeline = self
            .store
            .get_pipeline(schedule.pipeline_id)
            .await?
            .ok_or(SchedulerError::PipelineNotFound(schedule.pipeline_id))?;
        let limits = self.plans.limits_for(&pipeline.user_id).await?;

        let expression = CronExpression::parse(&schedule.cron_expression)?;
        let timezone = parse_timezone(&schedule.timezone).map_err(SchedulerError::InvalidTimezone)?;
        let next_run_at = expression.next_after(now, timezone);

        if !limits.cron_enabled {
            self.store
                .advance_schedule(schedule.id, next_run_at, None)
                .await?;
            return Ok(ScheduleAction::Skipped("cron is not enabled on the user's plan"));
        }

        if let Some(max_runs) = limits.max_runs_per_day {
            let runs_today = self
                .store
                .count_runs_since(&pipeline.user_id, start_of_day(now))
                .await?;
            if runs_today >= u64::from(max_runs) {
                self.store
                    .advance_schedule(schedule.id, next_run_at, None)
                    .await?;
                return Ok(ScheduleAction::Skipped("daily run limit reached"));
            }
        }

        let run = create_and_enqueue_run(
            self.store.as_ref(),
            self.queue.as_ref(),
            schedule.pipeline_id,
            TriggerType::Cron,
            schedule.input_data.clone(),
        )
        .await?;

        self.store
            .advance_schedule(schedule.id, next_run_at, Some(now))
            .await?;

        Ok(ScheduleAction::Created(run.id))
    }
}

/// Midnight UTC of the day containing `now`
fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}
