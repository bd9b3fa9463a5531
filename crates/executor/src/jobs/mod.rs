//! Persisted jobs and the storage contract the schedulers claim them through.
//!
//! ## Design
//!
//! - Jobs are tenant-scoped and typed (async continuation or timer)
//! - Claims are optimistic: a lock is written only if the job's version is
//!   unchanged since it was read
//! - Locks are TTLs; an expired lock makes the job claimable again
//! - Retries are counted down per job; exhausted jobs go to a dead-letter
//!   queue for inspection or manual retry
//!
//! ## Components
//!
//! - `JobRecord`: the persisted unit of work with its lock and retry state
//! - `JobStore`: persistence contract (`InMemoryJobStore` for tests/dev)
//! - `BackoffPolicy`: delay before a failed job is due again
//! - `DeadLetterEntry`: failed jobs for inspection/replay

pub mod store;
pub mod types;

pub use store::{AcquireQuery, InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffPolicy, BackoffStrategy, DEFAULT_JOB_RETRIES, DeadLetterEntry, FailureOutcome, JobLock,
    JobRecord, JobResult, JobType,
};
