//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flowexec_core::{JobId, LockOwner, TenantId, TenantScoped};

/// Number of retries a job gets when none is specified.
pub const DEFAULT_JOB_RETRIES: u32 = 3;

/// Which acquisition loop picks a job up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Fire-and-forget continuation, due as soon as it is created.
    AsyncContinuation,
    /// Timer-triggered event, due at a point in time.
    Timer,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::AsyncContinuation => "async",
            JobType::Timer => "timer",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock written into a job when a scheduler claims it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub owner: LockOwner,
    pub expires_at: DateTime<Utc>,
}

impl JobLock {
    /// Lock held by `owner` for `ttl` starting at `now`.
    pub fn new(owner: LockOwner, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            owner,
            expires_at: saturating_after(now, ttl),
        }
    }
}

/// `now + delay`, clamped to the latest representable instant.
pub fn saturating_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Backoff strategy for failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// How long a failed job waits before it becomes acquirable again.
///
/// The number of attempts is bounded by the job's own retry counter, not
/// by the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to spread retries of jobs failing together
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Retry as soon as the lock is released.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }
}

/// A persisted unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job ID
    pub id: JobId,
    /// Tenant scope
    pub tenant_id: TenantId,
    /// Acquisition loop responsible for the job
    pub job_type: JobType,
    /// Routing key for the business logic that runs the job
    pub handler_type: String,
    /// Handler configuration
    pub payload: serde_json::Value,
    /// Earliest time the job may run
    pub due_at: DateTime<Utc>,
    /// Scheduler instance currently holding the job
    pub lock_owner: Option<LockOwner>,
    /// When the current lock stops protecting the job
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Remaining retries; the job is dead-lettered when a failure hits zero
    pub retries: u32,
    /// Number of executions started
    pub attempt: u32,
    /// Error of the last failed execution
    pub last_error: Option<String>,
    /// Bumped on every write; claims are conditioned on it
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    fn new(
        tenant_id: TenantId,
        job_type: JobType,
        handler_type: impl Into<String>,
        payload: serde_json::Value,
        due_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            tenant_id,
            job_type,
            handler_type: handler_type.into(),
            payload,
            due_at,
            lock_owner: None,
            lock_expires_at: None,
            retries: DEFAULT_JOB_RETRIES,
            attempt: 0,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create an async continuation that is due immediately.
    pub fn async_continuation(
        tenant_id: TenantId,
        handler_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(tenant_id, JobType::AsyncContinuation, handler_type, payload, Utc::now())
    }

    /// Create a timer job firing at `due_at`.
    pub fn timer(
        tenant_id: TenantId,
        handler_type: impl Into<String>,
        payload: serde_json::Value,
        due_at: DateTime<Utc>,
    ) -> Self {
        Self::new(tenant_id, JobType::Timer, handler_type, payload, due_at)
    }

    /// Set the retry budget.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Move the due time by `delay` from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.due_at = saturating_after(Utc::now(), delay);
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at <= now
    }

    /// Whether an unexpired lock protects the job at `now`.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expires_at.is_some_and(|at| at > now)
    }

    /// Whether `owner` holds an unexpired lock at `now`.
    pub fn is_locked_by(&self, owner: &LockOwner, now: DateTime<Utc>) -> bool {
        self.is_locked_at(now) && self.lock_owner.as_ref() == Some(owner)
    }

    /// Due and either unlocked or holding an expired lock.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && !self.is_locked_at(now)
    }

    pub(crate) fn apply_lock(&mut self, lock: &JobLock, now: DateTime<Utc>) {
        self.lock_owner = Some(lock.owner.clone());
        self.lock_expires_at = Some(lock.expires_at);
        self.attempt += 1;
        self.touch(now);
    }

    pub(crate) fn release_lock(&mut self, now: DateTime<Utc>) {
        self.lock_owner = None;
        self.lock_expires_at = None;
        self.touch(now);
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

impl TenantScoped for JobRecord {
    fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}

/// Result of running a job's business logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed successfully
    Success,
    /// Job failed with an error; retried after the executor's backoff
    Failure(String),
    /// Job should be retried immediately (transient failure)
    RetryNow,
    /// Job should be retried after a delay
    RetryAfter(Duration),
}

/// What a recorded failure did to the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Retries remain; the lock was released and the job is due again at `retry_at`.
    Rescheduled {
        retries_left: u32,
        retry_at: DateTime<Utc>,
    },
    /// Retries exhausted; the job now lives in the dead-letter queue.
    DeadLettered,
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: JobRecord,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: JobRecord, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}
