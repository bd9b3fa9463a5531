//! Scheduler tunables.
//!
//! `SchedulerConfig` can be embedded in a host configuration file (serde,
//! every field optional) and overridden from `FLOWEXEC_*` environment
//! variables. Durations are given in milliseconds in the environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::jobs::{BackoffPolicy, JobType};

/// Invalid scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Tunables of one per-tenant scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Lock TTL written into claimed async jobs
    pub async_job_lock_time: Duration,
    /// Lock TTL written into claimed timer jobs
    pub timer_lock_time: Duration,
    /// Wait after an async cycle that claimed nothing
    pub default_async_job_acquire_wait: Duration,
    /// Wait after a timer cycle that claimed nothing
    pub default_timer_job_acquire_wait: Duration,
    /// How long a claimed job may wait for room in the execution queue
    pub default_queue_size_full_wait: Duration,
    /// Wait after losing a claim race
    pub retry_wait: Duration,
    pub max_async_jobs_due_per_acquisition: usize,
    pub max_timer_jobs_per_acquisition: usize,
    /// Worker threads executing jobs
    pub pool_size: usize,
    /// Claimed jobs waiting for a worker
    pub queue_capacity: usize,
    /// How long shutdown waits for in-flight jobs before detaching workers
    pub shutdown_wait: Duration,
    /// Delay before a failed job is due again
    pub failure_backoff: BackoffPolicy,
    /// Prefix of every thread the scheduler spawns
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            async_job_lock_time: Duration::from_secs(5 * 60),
            timer_lock_time: Duration::from_secs(5 * 60),
            default_async_job_acquire_wait: Duration::from_secs(10),
            default_timer_job_acquire_wait: Duration::from_secs(10),
            default_queue_size_full_wait: Duration::from_secs(1),
            retry_wait: Duration::from_millis(500),
            max_async_jobs_due_per_acquisition: 1,
            max_timer_jobs_per_acquisition: 1,
            pool_size: 4,
            queue_capacity: 100,
            shutdown_wait: Duration::from_secs(60),
            failure_backoff: BackoffPolicy::default(),
            thread_name_prefix: "flowexec".to_string(),
        }
    }
}

/// Values one acquisition cycle works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AcquireSettings {
    pub max_jobs: usize,
    pub lock_time: Duration,
    pub acquire_wait: Duration,
    pub queue_full_wait: Duration,
    pub retry_wait: Duration,
}

impl SchedulerConfig {
    /// Defaults overridden from the process environment.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `FLOWEXEC_*` overrides from `lookup`. Unparsable values are
    /// logged and ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |key: &str, target: &mut Duration| {
            if let Some(v) = parse_override::<u64>(&lookup, key) {
                *target = Duration::from_millis(v);
            }
        };
        millis("FLOWEXEC_ASYNC_JOB_LOCK_TIME_MS", &mut self.async_job_lock_time);
        millis("FLOWEXEC_TIMER_LOCK_TIME_MS", &mut self.timer_lock_time);
        millis("FLOWEXEC_ASYNC_JOB_ACQUIRE_WAIT_MS", &mut self.default_async_job_acquire_wait);
        millis("FLOWEXEC_TIMER_JOB_ACQUIRE_WAIT_MS", &mut self.default_timer_job_acquire_wait);
        millis("FLOWEXEC_QUEUE_FULL_WAIT_MS", &mut self.default_queue_size_full_wait);
        millis("FLOWEXEC_RETRY_WAIT_MS", &mut self.retry_wait);
        millis("FLOWEXEC_SHUTDOWN_WAIT_MS", &mut self.shutdown_wait);

        let count = |key: &str, target: &mut usize| {
            if let Some(v) = parse_override::<usize>(&lookup, key) {
                *target = v;
            }
        };
        count("FLOWEXEC_MAX_ASYNC_JOBS_PER_ACQUISITION", &mut self.max_async_jobs_due_per_acquisition);
        count("FLOWEXEC_MAX_TIMER_JOBS_PER_ACQUISITION", &mut self.max_timer_jobs_per_acquisition);
        count("FLOWEXEC_POOL_SIZE", &mut self.pool_size);
        count("FLOWEXEC_QUEUE_CAPACITY", &mut self.queue_capacity);

        if let Some(prefix) = lookup("FLOWEXEC_THREAD_NAME_PREFIX").filter(|p| !p.trim().is_empty()) {
            self.thread_name_prefix = prefix;
        }

        self
    }

    /// Reject values that would stall the scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Zero("pool_size"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        if self.max_async_jobs_due_per_acquisition == 0 {
            return Err(ConfigError::Zero("max_async_jobs_due_per_acquisition"));
        }
        if self.max_timer_jobs_per_acquisition == 0 {
            return Err(ConfigError::Zero("max_timer_jobs_per_acquisition"));
        }
        Ok(())
    }

    pub(crate) fn acquire_settings(&self, job_type: JobType) -> AcquireSettings {
        let (max_jobs, lock_time, acquire_wait) = match job_type {
            JobType::AsyncContinuation => (
                self.max_async_jobs_due_per_acquisition,
                self.async_job_lock_time,
                self.default_async_job_acquire_wait,
            ),
            JobType::Timer => (
                self.max_timer_jobs_per_acquisition,
                self.timer_lock_time,
                self.default_timer_job_acquire_wait,
            ),
        };

        AcquireSettings {
            // Setters are infallible; a zero slipped in at runtime still claims one.
            max_jobs: max_jobs.max(1),
            lock_time,
            acquire_wait,
            queue_full_wait: self.default_queue_size_full_wait,
            retry_wait: self.retry_wait,
        }
    }

    pub(crate) fn lock_time(&self, job_type: JobType) -> Duration {
        match job_type {
            JobType::AsyncContinuation => self.async_job_lock_time,
            JobType::Timer => self.timer_lock_time,
        }
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable scheduler override");
            None
        }
    }
}
