use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use tracing::{debug, info, warn};

use flowexec_core::{LockOwner, TenantId, TenantScoped};

use super::acquire::{AcquireJobs, AcquireLoopHandle};
use super::execute::ExecuteJob;
use super::pool::{ExecutionPool, SubmitError};
use super::{AsyncExecutor, ExecutorStats, TenantBindable};
use crate::command::CommandExecutor;
use crate::config::{AcquireSettings, SchedulerConfig};
use crate::context::{ExecutionContext, TenantBinding};
use crate::error::ExecutorError;
use crate::jobs::{JobLock, JobRecord, JobStore, JobStoreError, JobType};

/// State shared by the scheduler handle, its acquisition loops and the
/// tasks running on its pool.
pub(super) struct ExecutorShared {
    pub(super) store: Arc<dyn JobStore>,
    pub(super) lock_owner: LockOwner,
    config: RwLock<SchedulerConfig>,
    command_executor: RwLock<Option<Arc<dyn CommandExecutor>>>,
    binding: RwLock<Option<TenantBinding>>,
    stats: Mutex<ExecutorStats>,
}

impl ExecutorShared {
    pub(super) fn config(&self) -> SchedulerConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(super) fn acquire_settings(&self, job_type: JobType) -> AcquireSettings {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .acquire_settings(job_type)
    }

    pub(super) fn command_executor(&self) -> Option<Arc<dyn CommandExecutor>> {
        self.command_executor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(super) fn binding(&self) -> Option<TenantBinding> {
        self.binding.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(super) fn execution_context(&self) -> ExecutionContext {
        ExecutionContext::new(self.binding(), self.lock_owner.clone())
    }

    /// Bound tenant for logs and thread names; `*` for an unbound scheduler.
    pub(super) fn tenant_label(&self) -> String {
        self.binding()
            .map(|b| b.tenant_id().to_string())
            .unwrap_or_else(|| "*".to_string())
    }

    pub(super) fn record(&self, update: impl FnOnce(&mut ExecutorStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct RunningState {
    pool: Arc<ExecutionPool<ExecuteJob>>,
    loops: Vec<AcquireLoopHandle>,
}

/// Thread-based [`AsyncExecutor`].
///
/// Runs one acquisition thread per job type plus a fixed worker pool. When
/// bound to a tenant it only acquires that tenant's jobs and every thread
/// it owns carries the tenant as ambient context; unbound it acquires
/// across all tenants.
///
/// ```no_run
/// use std::sync::Arc;
/// use flowexec_executor::{
///     AsyncExecutor, DefaultAsyncJobExecutor, HandlerRegistry, InMemoryJobStore, JobResult,
///     SchedulerConfig,
/// };
///
/// let handlers = HandlerRegistry::new().with("*", |_, _| JobResult::Success);
/// let executor = DefaultAsyncJobExecutor::new(Arc::new(InMemoryJobStore::new()), SchedulerConfig::default())
///     .with_command_executor(Arc::new(handlers));
/// executor.start().unwrap();
/// executor.shutdown();
/// ```
pub struct DefaultAsyncJobExecutor {
    shared: Arc<ExecutorShared>,
    lifecycle: Mutex<Option<RunningState>>,
    pool: RwLock<Option<Arc<ExecutionPool<ExecuteJob>>>>,
    active: AtomicBool,
}

impl DefaultAsyncJobExecutor {
    pub fn new(store: Arc<dyn JobStore>, config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(ExecutorShared {
                store,
                lock_owner: LockOwner::generate(),
                config: RwLock::new(config),
                command_executor: RwLock::new(None),
                binding: RwLock::new(None),
                stats: Mutex::new(ExecutorStats::default()),
            }),
            lifecycle: Mutex::new(None),
            pool: RwLock::new(None),
            active: AtomicBool::new(false),
        }
    }

    pub fn with_command_executor(self, command_executor: Arc<dyn CommandExecutor>) -> Self {
        self.set_command_executor(command_executor);
        self
    }

    /// Tenant this scheduler is bound to, if any.
    pub fn bound_tenant(&self) -> Option<TenantId> {
        self.shared.binding().map(|b| b.tenant_id().clone())
    }

    fn lifecycle(&self) -> MutexGuard<'_, Option<RunningState>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running_pool(&self) -> Option<Arc<ExecutionPool<ExecuteJob>>> {
        self.pool.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Stop the loops, drain the pool and release whatever never started.
    fn stop(&self, state: RunningState) {
        let shutdown_wait = self.shared.config().shutdown_wait;

        for handle in &state.loops {
            handle.signal_stop();
        }
        // Closing the pool also wakes a loop blocked on a full queue.
        let report = state.pool.shutdown(shutdown_wait);
        for handle in state.loops {
            handle.join();
        }

        let abandoned = report.abandoned.len();
        for task in report.abandoned {
            task.release("executor shut down before the job started");
        }
        if abandoned > 0 {
            info!(tenant = %self.shared.tenant_label(), abandoned, "released queued jobs");
        }
        if report.still_running > 0 {
            warn!(
                tenant = %self.shared.tenant_label(),
                still_running = report.still_running,
                wait_ms = shutdown_wait.as_millis() as u64,
                "jobs still running after shutdown wait; detaching workers"
            );
        }
    }
}

impl AsyncExecutor for DefaultAsyncJobExecutor {
    fn start(&self) -> Result<(), ExecutorError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.is_some() {
            return Ok(());
        }

        let config = self.shared.config();
        config.validate()?;
        if self.shared.command_executor().is_none() {
            return Err(ExecutorError::MissingCommandExecutor);
        }

        let name = format!("{}-{}", config.thread_name_prefix, self.shared.tenant_label());
        let pool = Arc::new(ExecutionPool::spawn(&name, config.pool_size, config.queue_capacity)?);

        let mut loops = Vec::with_capacity(2);
        for job_type in [JobType::AsyncContinuation, JobType::Timer] {
            match AcquireJobs::spawn(&name, job_type, self.shared.clone(), pool.clone()) {
                Ok(handle) => loops.push(handle),
                Err(e) => {
                    self.stop(RunningState { pool, loops });
                    return Err(e.into());
                }
            }
        }

        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(pool.clone());
        self.active.store(true, Ordering::SeqCst);
        *lifecycle = Some(RunningState { pool, loops });

        info!(
            tenant = %self.shared.tenant_label(),
            lock_owner = %self.shared.lock_owner,
            pool_size = config.pool_size,
            queue_capacity = config.queue_capacity,
            "job executor started"
        );
        Ok(())
    }

    fn shutdown(&self) {
        let mut lifecycle = self.lifecycle();
        let Some(state) = lifecycle.take() else {
            return;
        };

        self.active.store(false, Ordering::SeqCst);
        self.pool.write().unwrap_or_else(PoisonError::into_inner).take();

        info!(tenant = %self.shared.tenant_label(), "shutting down job executor");
        self.stop(state);
        info!(tenant = %self.shared.tenant_label(), "job executor stopped");
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn execute_async_job(&self, job: JobRecord) -> bool {
        let Some(pool) = self.running_pool() else {
            debug!(job_id = %job.id, "executor not running; job not accepted");
            return false;
        };
        let Some(command_executor) = self.shared.command_executor() else {
            return false;
        };
        if let Some(binding) = self.shared.binding() {
            if !job.belongs_to(binding.tenant_id()) {
                warn!(
                    job_id = %job.id,
                    job_tenant = %job.tenant_id,
                    tenant = %binding.tenant_id(),
                    "refusing job of another tenant"
                );
                return false;
            }
        }

        let now = Utc::now();
        let owner = &self.shared.lock_owner;
        let job = if job.is_locked_by(owner, now) {
            job
        } else {
            let lock = JobLock::new(owner.clone(), now, self.shared.config().lock_time(job.job_type));
            match self.shared.store.try_lock(job.id, job.version, &lock) {
                Ok(claimed) => {
                    self.shared.record(|s| s.jobs_acquired += 1);
                    claimed
                }
                Err(e) => {
                    if matches!(e, JobStoreError::ClaimConflict(_)) {
                        self.shared.record(|s| s.claim_conflicts += 1);
                    }
                    debug!(job_id = %job.id, error = %e, "could not claim job for direct execution");
                    return false;
                }
            }
        };

        let task = ExecuteJob::new(
            job,
            self.shared.execution_context(),
            command_executor,
            self.shared.clone(),
        );
        match pool.try_submit(task) {
            Ok(()) => true,
            Err(SubmitError::Full(task) | SubmitError::Closed(task)) => {
                self.shared.record(|s| s.rejected_submissions += 1);
                task.release("execution queue rejected the job");
                false
            }
        }
    }

    fn set_command_executor(&self, command_executor: Arc<dyn CommandExecutor>) {
        *self
            .shared
            .command_executor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(command_executor);
    }

    fn command_executor(&self) -> Result<Arc<dyn CommandExecutor>, ExecutorError> {
        self.shared
            .command_executor()
            .ok_or(ExecutorError::MissingCommandExecutor)
    }

    fn lock_owner(&self) -> LockOwner {
        self.shared.lock_owner.clone()
    }

    fn config(&self) -> SchedulerConfig {
        self.shared.config()
    }

    fn update_config(&self, update: &dyn Fn(&mut SchedulerConfig)) {
        update(&mut self.shared.config.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn stats(&self) -> ExecutorStats {
        self.shared.stats()
    }

    fn as_tenant_bindable(&self) -> Option<&dyn TenantBindable> {
        Some(self)
    }
}

impl TenantBindable for DefaultAsyncJobExecutor {
    fn bind_tenant(&self, binding: TenantBinding) {
        *self.shared.binding.write().unwrap_or_else(PoisonError::into_inner) = Some(binding);
    }
}

impl Drop for DefaultAsyncJobExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DefaultAsyncJobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultAsyncJobExecutor")
            .field("tenant", &self.shared.tenant_label())
            .field("lock_owner", &self.shared.lock_owner)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
