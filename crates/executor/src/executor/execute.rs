use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, warn};

use super::default::ExecutorShared;
use super::pool::Task;
use crate::command::CommandExecutor;
use crate::context::ExecutionContext;
use crate::jobs::types::saturating_after;
use crate::jobs::{FailureOutcome, JobRecord, JobResult, JobStoreError};

/// A claimed job on its way through the execution pool.
pub(super) struct ExecuteJob {
    job: JobRecord,
    context: ExecutionContext,
    command_executor: Arc<dyn CommandExecutor>,
    shared: Arc<ExecutorShared>,
}

impl ExecuteJob {
    pub(super) fn new(
        job: JobRecord,
        context: ExecutionContext,
        command_executor: Arc<dyn CommandExecutor>,
        shared: Arc<ExecutorShared>,
    ) -> Self {
        Self {
            job,
            context,
            command_executor,
            shared,
        }
    }

    pub(super) fn job(&self) -> &JobRecord {
        &self.job
    }

    /// Give the claim back without running the job or consuming a retry.
    pub(super) fn release(self, reason: &str) {
        match self.shared.store.unlock(self.job.id, &self.shared.lock_owner) {
            Ok(()) => debug!(job_id = %self.job.id, reason, "released job lock"),
            Err(e) => warn!(job_id = %self.job.id, reason, error = %e, "failed to release job lock"),
        }
    }

    fn finish(&self, result: JobResult, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            JobResult::Success => match self.shared.store.complete(self.job.id, &self.shared.lock_owner) {
                Ok(()) => {
                    self.shared.record(|s| s.jobs_succeeded += 1);
                    debug!(job_id = %self.job.id, elapsed_ms, "job completed successfully");
                }
                Err(e) => self.store_failed(e, "complete"),
            },
            JobResult::Failure(error) => {
                let delay = self
                    .shared
                    .config()
                    .failure_backoff
                    .delay_for_attempt(self.job.attempt);
                self.fail(error, delay);
            }
            JobResult::RetryNow => self.fail("retry requested".to_string(), Duration::ZERO),
            JobResult::RetryAfter(delay) => self.fail("retry after delay".to_string(), delay),
        }
    }

    fn fail(&self, error: String, delay: Duration) {
        let retry_at = saturating_after(Utc::now(), delay);
        let outcome = self.shared.store.record_failure(
            self.job.id,
            &self.shared.lock_owner,
            error.clone(),
            retry_at,
        );

        match outcome {
            Ok(FailureOutcome::Rescheduled { retries_left, retry_at }) => {
                self.shared.record(|s| s.jobs_failed += 1);
                debug!(
                    job_id = %self.job.id,
                    error = %error,
                    retries_left,
                    %retry_at,
                    "job failed; rescheduled"
                );
            }
            Ok(FailureOutcome::DeadLettered) => {
                self.shared.record(|s| {
                    s.jobs_failed += 1;
                    s.jobs_dead_lettered += 1;
                });
                warn!(job_id = %self.job.id, error = %error, "retries exhausted; job dead-lettered");
            }
            Err(e) => self.store_failed(e, "record failure"),
        }
    }

    fn store_failed(&self, e: JobStoreError, action: &str) {
        match e {
            // Another scheduler owns the job now and will run it again.
            JobStoreError::LockLost(_) => warn!(
                job_id = %self.job.id,
                action,
                "job lock expired during execution; result discarded"
            ),
            e => error!(job_id = %self.job.id, action, error = %e, "failed to store job result"),
        }
    }
}

impl Task for ExecuteJob {
    fn run(self) {
        let _scope = self.context.enter();
        self.shared.record(|s| s.current_running += 1);
        let started = Instant::now();

        let result = catch_unwind(AssertUnwindSafe(|| {
            self.command_executor.execute(&self.job, &self.context)
        }))
        .unwrap_or_else(|panic| JobResult::Failure(format!("job panicked: {}", panic_message(&*panic))));

        self.shared
            .record(|s| s.current_running = s.current_running.saturating_sub(1));
        self.finish(result, started);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
