//! Per-tenant job schedulers.
//!
//! ## Design
//!
//! - One acquisition loop per job type (async continuations, timers) claims
//!   due jobs and feeds a bounded execution pool
//! - A claimed job that cannot enter the full queue keeps its lock and is
//!   left for lock expiry
//! - Losing a claim race backs off for `retry_wait` before the next cycle
//! - Shutdown releases the locks of queued jobs that never started
//!
//! ## Components
//!
//! - `AsyncExecutor`: the scheduler contract the multi-tenant executor routes to
//! - `DefaultAsyncJobExecutor`: thread-based implementation
//! - `TenantBindable`: capability of schedulers that can be bound to one tenant
//! - `AsyncExecutorFactory`: produces a scheduler per tenant

mod acquire;
mod default;
mod execute;
mod pool;

use std::sync::Arc;

use flowexec_core::{LockOwner, TenantId};

use crate::command::CommandExecutor;
use crate::config::SchedulerConfig;
use crate::context::TenantBinding;
use crate::error::ExecutorError;
use crate::jobs::JobRecord;

pub use default::DefaultAsyncJobExecutor;

/// A job scheduler: acquires due jobs from the store and executes them.
pub trait AsyncExecutor: Send + Sync {
    /// Start the acquisition loops and the execution pool. Starting a running
    /// scheduler is a no-op.
    fn start(&self) -> Result<(), ExecutorError>;

    /// Stop acquiring, release queued jobs and wait for in-flight ones.
    /// Stopping a stopped scheduler is a no-op.
    fn shutdown(&self);

    fn is_active(&self) -> bool;

    /// Hand a job straight to the execution pool. Returns `false` when the
    /// scheduler is not running, the job could not be claimed, or the queue
    /// is full; the job is left unlocked in those cases.
    fn execute_async_job(&self, job: JobRecord) -> bool;

    fn set_command_executor(&self, command_executor: Arc<dyn CommandExecutor>);

    fn command_executor(&self) -> Result<Arc<dyn CommandExecutor>, ExecutorError>;

    /// Identity written into the locks this scheduler takes.
    fn lock_owner(&self) -> LockOwner;

    /// Snapshot of the current tunables.
    fn config(&self) -> SchedulerConfig;

    /// Change tunables in place. Running loops pick the new values up on
    /// their next cycle.
    fn update_config(&self, update: &dyn Fn(&mut SchedulerConfig));

    fn stats(&self) -> ExecutorStats {
        ExecutorStats::default()
    }

    /// Downcast to the tenant-binding capability, if supported.
    fn as_tenant_bindable(&self) -> Option<&dyn TenantBindable> {
        None
    }
}

/// Capability of schedulers that can be dedicated to one tenant.
///
/// A bound scheduler only acquires the tenant's jobs and makes the tenant
/// ambient on every thread it runs.
pub trait TenantBindable {
    fn bind_tenant(&self, binding: TenantBinding);
}

/// Creates the scheduler for a newly registered tenant.
pub trait AsyncExecutorFactory: Send + Sync {
    fn create(&self, tenant_id: &TenantId) -> Arc<dyn AsyncExecutor>;
}

impl<F> AsyncExecutorFactory for F
where
    F: Fn(&TenantId) -> Arc<dyn AsyncExecutor> + Send + Sync,
{
    fn create(&self, tenant_id: &TenantId) -> Arc<dyn AsyncExecutor> {
        self(tenant_id)
    }
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_acquired: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    /// Claims lost to another scheduler
    pub claim_conflicts: u64,
    /// Claimed jobs that timed out waiting for queue space
    pub queue_full_events: u64,
    /// Direct submissions refused by `execute_async_job`
    pub rejected_submissions: u64,
    pub current_running: usize,
}
