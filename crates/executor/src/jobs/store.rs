//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use flowexec_core::{JobId, LockOwner, TenantId, TenantScoped};

use super::types::{DeadLetterEntry, FailureOutcome, JobLock, JobRecord, JobType};

/// Filter for jobs an acquisition cycle may claim.
#[derive(Debug, Clone)]
pub struct AcquireQuery {
    pub job_type: JobType,
    /// `None` acquires across tenants (unbound scheduler).
    pub tenant_id: Option<TenantId>,
    pub now: DateTime<Utc>,
    pub limit: usize,
}

/// Job persistence abstraction.
///
/// Every write that follows a claim is conditioned on the caller still
/// being the lock owner, so a scheduler whose lock expired and was taken
/// over cannot clobber the new owner's work.
pub trait JobStore: Send + Sync {
    /// Insert a new job.
    fn insert(&self, job: JobRecord) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, tenant_id: &TenantId, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Due jobs of the query's type that are unlocked or hold an expired
    /// lock, oldest due time first.
    fn find_acquirable(&self, query: &AcquireQuery) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Claim a job, provided nobody wrote it since `expected_version` was read
    /// and no unexpired lock protects it.
    fn try_lock(
        &self,
        job_id: JobId,
        expected_version: u64,
        lock: &JobLock,
    ) -> Result<JobRecord, JobStoreError>;

    /// Release a claim without consuming a retry.
    fn unlock(&self, job_id: JobId, owner: &LockOwner) -> Result<(), JobStoreError>;

    /// Remove a successfully executed job.
    fn complete(&self, job_id: JobId, owner: &LockOwner) -> Result<(), JobStoreError>;

    /// Consume one retry. Reschedules the job at `retry_at`, or moves it to
    /// the dead-letter queue when no retries remain.
    fn record_failure(
        &self,
        job_id: JobId,
        owner: &LockOwner,
        error: String,
        retry_at: DateTime<Utc>,
    ) -> Result<FailureOutcome, JobStoreError>;

    /// List dead-lettered jobs.
    fn list_dead_letters(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Move a dead-lettered job back to the live table with a fresh retry budget.
    fn retry_dead_letter(
        &self,
        tenant_id: &TenantId,
        job_id: JobId,
        retries: u32,
    ) -> Result<JobRecord, JobStoreError>;

    /// Delete a dead-lettered job.
    fn delete_dead_letter(&self, tenant_id: &TenantId, job_id: JobId) -> Result<(), JobStoreError>;

    /// Get job statistics.
    fn stats(&self, tenant_id: &TenantId) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// Another worker wrote or locked the job first (optimistic concurrency).
    #[error("job {0} was claimed concurrently")]
    ClaimConflict(JobId),
    /// The caller no longer owns the job's lock.
    #[error("lock on job {0} is no longer held by this owner")]
    LockLost(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics for one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    /// Due and claimable now
    pub acquirable: usize,
    /// Protected by an unexpired lock
    pub locked: usize,
    /// Not yet due (timers, backoff)
    pub waiting: usize,
    /// Live jobs that failed at least once
    pub failed: usize,
    pub dead_lettered: usize,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs_read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, JobRecord>>, JobStoreError> {
        self.jobs.read().map_err(|_| poisoned("jobs"))
    }

    fn jobs_write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, JobRecord>>, JobStoreError> {
        self.jobs.write().map_err(|_| poisoned("jobs"))
    }

    fn dead_letters_read(
        &self,
    ) -> Result<RwLockReadGuard<'_, HashMap<JobId, DeadLetterEntry>>, JobStoreError> {
        self.dead_letters.read().map_err(|_| poisoned("dead letters"))
    }

    fn dead_letters_write(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<JobId, DeadLetterEntry>>, JobStoreError> {
        self.dead_letters.write().map_err(|_| poisoned("dead letters"))
    }
}

fn poisoned(table: &str) -> JobStoreError {
    JobStoreError::Storage(format!("{table} table lock poisoned"))
}

fn owned_job<'a>(
    jobs: &'a mut HashMap<JobId, JobRecord>,
    job_id: JobId,
    owner: &LockOwner,
) -> Result<&'a mut JobRecord, JobStoreError> {
    let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
    if job.lock_owner.as_ref() != Some(owner) {
        return Err(JobStoreError::LockLost(job_id));
    }
    Ok(job)
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: JobRecord) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs_write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, tenant_id: &TenantId, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let jobs = self.jobs_read()?;
        match jobs.get(&job_id) {
            Some(job) if job.belongs_to(tenant_id) => Ok(Some(job.clone())),
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn find_acquirable(&self, query: &AcquireQuery) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.jobs_read()?;

        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.job_type == query.job_type
                    && j.is_acquirable(query.now)
                    && query.tenant_id.as_ref().is_none_or(|t| j.belongs_to(t))
            })
            .cloned()
            .collect();

        candidates.sort_by_key(|j| (j.due_at, j.created_at));
        candidates.truncate(query.limit);
        Ok(candidates)
    }

    fn try_lock(
        &self,
        job_id: JobId,
        expected_version: u64,
        lock: &JobLock,
    ) -> Result<JobRecord, JobStoreError> {
        let mut jobs = self.jobs_write()?;
        let now = Utc::now();

        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.version != expected_version || job.is_locked_at(now) {
            return Err(JobStoreError::ClaimConflict(job_id));
        }

        job.apply_lock(lock, now);
        Ok(job.clone())
    }

    fn unlock(&self, job_id: JobId, owner: &LockOwner) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs_write()?;
        owned_job(&mut jobs, job_id, owner)?.release_lock(Utc::now());
        Ok(())
    }

    fn complete(&self, job_id: JobId, owner: &LockOwner) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs_write()?;
        owned_job(&mut jobs, job_id, owner)?;
        jobs.remove(&job_id);
        Ok(())
    }

    fn record_failure(
        &self,
        job_id: JobId,
        owner: &LockOwner,
        error: String,
        retry_at: DateTime<Utc>,
    ) -> Result<FailureOutcome, JobStoreError> {
        let mut jobs = self.jobs_write()?;
        let now = Utc::now();

        let job = owned_job(&mut jobs, job_id, owner)?;
        job.retries = job.retries.saturating_sub(1);
        job.last_error = Some(error.clone());
        job.release_lock(now);

        if job.retries > 0 {
            job.due_at = retry_at;
            return Ok(FailureOutcome::Rescheduled {
                retries_left: job.retries,
                retry_at,
            });
        }

        let mut dls = self.dead_letters_write()?;
        if let Some(job) = jobs.remove(&job_id) {
            dls.insert(job_id, DeadLetterEntry::new(job, error));
        }
        Ok(FailureOutcome::DeadLettered)
    }

    fn list_dead_letters(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let dls = self.dead_letters_read()?;
        let mut result: Vec<_> = dls
            .values()
            .filter(|e| e.job.belongs_to(tenant_id))
            .cloned()
            .collect();

        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(
        &self,
        tenant_id: &TenantId,
        job_id: JobId,
        retries: u32,
    ) -> Result<JobRecord, JobStoreError> {
        let mut jobs = self.jobs_write()?;
        let mut dls = self.dead_letters_write()?;

        match dls.get(&job_id) {
            None => return Err(JobStoreError::NotFound(job_id)),
            Some(entry) if !entry.job.belongs_to(tenant_id) => {
                return Err(JobStoreError::TenantIsolation);
            }
            Some(_) => {}
        }

        let now = Utc::now();
        let mut job = dls.remove(&job_id).ok_or(JobStoreError::NotFound(job_id))?.job;
        job.retries = retries;
        job.due_at = now;
        job.release_lock(now);

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn delete_dead_letter(&self, tenant_id: &TenantId, job_id: JobId) -> Result<(), JobStoreError> {
        let mut dls = self.dead_letters_write()?;

        let entry = dls.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if !entry.job.belongs_to(tenant_id) {
            return Err(JobStoreError::TenantIsolation);
        }

        dls.remove(&job_id);
        Ok(())
    }

    fn stats(&self, tenant_id: &TenantId) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs_read()?;
        let dls = self.dead_letters_read()?;
        let now = Utc::now();

        let mut stats = JobStats::default();

        for job in jobs.values().filter(|j| j.belongs_to(tenant_id)) {
            if job.is_locked_at(now) {
                stats.locked += 1;
            } else if job.is_due(now) {
                stats.acquirable += 1;
            } else {
                stats.waiting += 1;
            }
            if job.last_error.is_some() {
                stats.failed += 1;
            }
        }

        stats.dead_lettered = dls.values().filter(|e| e.job.belongs_to(tenant_id)).count();

        Ok(stats)
    }
}
