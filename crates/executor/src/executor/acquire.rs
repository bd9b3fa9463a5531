//! Acquisition loops.
//!
//! Each cycle checks for room in the execution queue, asks the store for
//! due jobs, claims them one by one and submits them. The wait before the
//! next cycle depends on how the cycle ended:
//!
//! | cycle outcome           | wait                  |
//! |-------------------------|-----------------------|
//! | claimed at least one    | none                  |
//! | nothing due             | acquire wait          |
//! | lost a claim race       | `retry_wait`          |
//! | execution queue full    | queue-size-full wait  |
//! | submission timed out    | none                  |
//!
//! A submission that times out has already blocked for the queue-size-full
//! wait, so the loop only polls for a stop signal before the next cycle.

use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::default::ExecutorShared;
use super::execute::ExecuteJob;
use super::pool::{ExecutionPool, SubmitError};
use crate::config::AcquireSettings;
use crate::context::ExecutionContext;
use crate::jobs::{AcquireQuery, JobLock, JobStoreError, JobType};

/// Floor for every wait so a zero tunable cannot spin a core.
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Handle to a running acquisition loop.
#[derive(Debug)]
pub(super) struct AcquireLoopHandle {
    job_type: JobType,
    stop: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl AcquireLoopHandle {
    /// Ask the loop to stop; it notices immediately, even mid-wait.
    pub(super) fn signal_stop(&self) {
        let _ = self.stop.send(());
    }

    pub(super) fn join(mut self) {
        self.signal_stop();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!(job_type = %self.job_type, "acquisition loop panicked");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    Claimed(usize),
    Idle,
    Conflict,
    Saturated,
    SubmitTimedOut,
    Stopping,
}

impl Cycle {
    /// How long to wait before the next cycle; `None` means poll only.
    fn wait(self, settings: &AcquireSettings) -> Option<Duration> {
        match self {
            Cycle::Claimed(_) | Cycle::SubmitTimedOut | Cycle::Stopping => None,
            Cycle::Idle => Some(settings.acquire_wait),
            Cycle::Conflict => Some(settings.retry_wait),
            Cycle::Saturated => Some(settings.queue_full_wait),
        }
    }
}

pub(super) struct AcquireJobs {
    job_type: JobType,
    shared: Arc<ExecutorShared>,
    pool: Arc<ExecutionPool<ExecuteJob>>,
    context: ExecutionContext,
    stop: mpsc::Receiver<()>,
}

impl AcquireJobs {
    pub(super) fn spawn(
        name: &str,
        job_type: JobType,
        shared: Arc<ExecutorShared>,
        pool: Arc<ExecutionPool<ExecuteJob>>,
    ) -> io::Result<AcquireLoopHandle> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let acquire = Self {
            job_type,
            context: shared.execution_context(),
            shared,
            pool,
            stop: stop_rx,
        };

        let join = thread::Builder::new()
            .name(format!("{name}-{job_type}-acquire"))
            .spawn(move || acquire.run())?;

        Ok(AcquireLoopHandle {
            job_type,
            stop: stop_tx,
            join: Some(join),
        })
    }

    fn run(self) {
        let _scope = self.context.enter();
        let tenant = self.shared.tenant_label();
        info!(tenant = %tenant, job_type = %self.job_type, "acquisition loop started");

        loop {
            let settings = self.shared.acquire_settings(self.job_type);
            let cycle = self.acquire_cycle(&settings);
            match cycle {
                Cycle::Stopping => break,
                Cycle::Claimed(claimed) => {
                    debug!(tenant = %tenant, job_type = %self.job_type, claimed, "acquired jobs");
                }
                _ => {}
            }

            if self.stop_requested(cycle.wait(&settings)) {
                break;
            }
        }

        info!(tenant = %tenant, job_type = %self.job_type, "acquisition loop stopped");
    }

    /// Wait for a stop signal, or just poll for one when `wait` is `None`.
    /// A dropped handle counts as a stop.
    fn stop_requested(&self, wait: Option<Duration>) -> bool {
        match wait {
            None => !matches!(self.stop.try_recv(), Err(TryRecvError::Empty)),
            Some(wait) => !matches!(
                self.stop.recv_timeout(wait.max(MIN_WAIT)),
                Err(RecvTimeoutError::Timeout)
            ),
        }
    }

    fn acquire_cycle(&self, settings: &AcquireSettings) -> Cycle {
        if self.pool.is_closed() {
            return Cycle::Stopping;
        }
        if self.pool.remaining_capacity() == 0 {
            debug!(job_type = %self.job_type, "execution queue full; skipping acquisition");
            return Cycle::Saturated;
        }
        let Some(command_executor) = self.shared.command_executor() else {
            return Cycle::Idle;
        };

        let query = AcquireQuery {
            job_type: self.job_type,
            tenant_id: self.context.tenant_id().cloned(),
            now: Utc::now(),
            limit: settings.max_jobs,
        };
        let candidates = match self.shared.store.find_acquirable(&query) {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(job_type = %self.job_type, error = %e, "failed to query acquirable jobs");
                return Cycle::Idle;
            }
        };

        let mut claimed = 0;
        for candidate in candidates {
            let lock = JobLock::new(self.shared.lock_owner.clone(), Utc::now(), settings.lock_time);
            let job = match self.shared.store.try_lock(candidate.id, candidate.version, &lock) {
                Ok(job) => job,
                Err(JobStoreError::ClaimConflict(id)) => {
                    self.shared.record(|s| s.claim_conflicts += 1);
                    debug!(job_id = %id, job_type = %self.job_type, "job claimed by another executor");
                    return Cycle::Conflict;
                }
                // Completed elsewhere between the query and the claim.
                Err(JobStoreError::NotFound(_)) => continue,
                Err(e) => {
                    error!(job_id = %candidate.id, error = %e, "failed to claim job");
                    continue;
                }
            };
            claimed += 1;
            self.shared.record(|s| s.jobs_acquired += 1);

            let task = ExecuteJob::new(
                job,
                self.context.clone(),
                command_executor.clone(),
                self.shared.clone(),
            );
            match self.pool.submit_timeout(task, settings.queue_full_wait) {
                Ok(()) => {}
                Err(SubmitError::Full(task)) => {
                    self.shared.record(|s| s.queue_full_events += 1);
                    warn!(
                        job_id = %task.job().id,
                        job_type = %self.job_type,
                        "execution queue full; job stays locked until its lock expires"
                    );
                    return Cycle::SubmitTimedOut;
                }
                Err(SubmitError::Closed(task)) => {
                    task.release("executor shutting down");
                    return Cycle::Stopping;
                }
            }
        }

        if claimed == 0 { Cycle::Idle } else { Cycle::Claimed(claimed) }
    }
}
