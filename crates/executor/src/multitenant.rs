//! Multi-tenant job executor: one isolated scheduler per tenant.
//!
//! ## Routing and fan-out
//!
//! Reads and writes deliberately behave differently:
//!
//! - **Setters fan out.** A tunable set on [`MultiTenantJobExecutor`] is
//!   applied to every scheduler registered *at that moment*. It is not
//!   remembered: a tenant added later starts from the default
//!   configuration.
//! - **Getters route.** A tunable read resolves the ambient tenant and
//!   returns that tenant's value, or [`ExecutorError::UnknownTenant`] when no
//!   tenant is ambient or the ambient tenant is not registered.
//!
//! ## Locking
//!
//! A lifecycle mutex serializes every registry mutation, start, shutdown and
//! fan-out. The tenant map sits behind an `RwLock` that is only written
//! while the lifecycle mutex is held; routing takes a short read lock and
//! calls the scheduler after releasing it, so a job calling back into the
//! executor during a long shutdown never deadlocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::{error, info};

use flowexec_core::{LockOwner, TenantId};

use crate::command::CommandExecutor;
use crate::config::SchedulerConfig;
use crate::context::{TenantBinding, TenantContextProvider};
use crate::error::ExecutorError;
use crate::executor::{AsyncExecutor, AsyncExecutorFactory, DefaultAsyncJobExecutor, ExecutorStats};
use crate::jobs::{JobRecord, JobStore};

type Registry = HashMap<TenantId, Arc<dyn AsyncExecutor>>;

/// State only touched under the lifecycle mutex.
#[derive(Default)]
struct Lifecycle {
    command_executor: Option<Arc<dyn CommandExecutor>>,
}

/// Owns one [`AsyncExecutor`] per tenant and routes calls by ambient tenant.
pub struct MultiTenantJobExecutor {
    tenant_context: Arc<dyn TenantContextProvider>,
    store: Arc<dyn JobStore>,
    factory: Option<Arc<dyn AsyncExecutorFactory>>,
    default_config: SchedulerConfig,
    lifecycle: Mutex<Lifecycle>,
    executors: RwLock<Registry>,
    active: AtomicBool,
    auto_activate: AtomicBool,
}

impl MultiTenantJobExecutor {
    pub fn new(tenant_context: Arc<dyn TenantContextProvider>, store: Arc<dyn JobStore>) -> Self {
        Self {
            tenant_context,
            store,
            factory: None,
            default_config: SchedulerConfig::default(),
            lifecycle: Mutex::new(Lifecycle::default()),
            executors: RwLock::new(HashMap::new()),
            active: AtomicBool::new(false),
            auto_activate: AtomicBool::new(false),
        }
    }

    /// Create tenant schedulers with `factory` instead of [`DefaultAsyncJobExecutor`].
    pub fn with_factory(mut self, factory: Arc<dyn AsyncExecutorFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Configuration given to every scheduler created by default.
    pub fn with_default_config(mut self, config: SchedulerConfig) -> Self {
        self.default_config = config;
        self
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_executors(&self) -> RwLockReadGuard<'_, Registry> {
        self.executors.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_executors(&self) -> RwLockWriteGuard<'_, Registry> {
        self.executors.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registered schedulers, ordered by tenant id.
    fn snapshot(&self) -> Vec<(TenantId, Arc<dyn AsyncExecutor>)> {
        let mut entries: Vec<_> = self
            .read_executors()
            .iter()
            .map(|(id, executor)| (id.clone(), executor.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn create_executor(&self, tenant_id: &TenantId, lifecycle: &Lifecycle) -> Arc<dyn AsyncExecutor> {
        let executor: Arc<dyn AsyncExecutor> = match &self.factory {
            Some(factory) => factory.create(tenant_id),
            None => Arc::new(DefaultAsyncJobExecutor::new(
                self.store.clone(),
                self.default_config.clone(),
            )),
        };

        if let Some(command_executor) = &lifecycle.command_executor {
            executor.set_command_executor(command_executor.clone());
        }
        if let Some(bindable) = executor.as_tenant_bindable() {
            bindable.bind_tenant(TenantBinding::new(tenant_id.clone(), self.tenant_context.clone()));
        }
        executor
    }

    /// Register a scheduler for `tenant_id`, starting it if `start` is set.
    ///
    /// A tenant that is already registered is rejected with
    /// [`ExecutorError::DuplicateTenant`]; its scheduler keeps running. If
    /// the new scheduler fails to start it stays registered (stopped) and
    /// the error is returned.
    pub fn add_tenant(&self, tenant_id: TenantId, start: bool) -> Result<(), ExecutorError> {
        let lifecycle = self.lifecycle();
        if self.read_executors().contains_key(&tenant_id) {
            return Err(ExecutorError::DuplicateTenant(tenant_id));
        }

        let executor = self.create_executor(&tenant_id, &lifecycle);
        self.write_executors().insert(tenant_id.clone(), executor.clone());
        info!(tenant = %tenant_id, lock_owner = %executor.lock_owner(), "tenant registered");

        if start {
            executor.start()?;
        }
        Ok(())
    }

    /// Register a fresh scheduler for `tenant_id`, shutting down the one it
    /// replaces first.
    pub fn replace_tenant(&self, tenant_id: TenantId, start: bool) -> Result<(), ExecutorError> {
        let lifecycle = self.lifecycle();

        let previous = self.read_executors().get(&tenant_id).cloned();
        if let Some(previous) = previous {
            info!(tenant = %tenant_id, "shutting down replaced job executor");
            previous.shutdown();
        }

        let executor = self.create_executor(&tenant_id, &lifecycle);
        self.write_executors().insert(tenant_id.clone(), executor.clone());
        info!(tenant = %tenant_id, lock_owner = %executor.lock_owner(), "tenant executor replaced");

        if start {
            executor.start()?;
        }
        Ok(())
    }

    /// Shut down and unregister `tenant_id`. Unknown tenants are ignored.
    pub fn remove_tenant(&self, tenant_id: &TenantId) {
        let _lifecycle = self.lifecycle();

        let Some(executor) = self.read_executors().get(tenant_id).cloned() else {
            return;
        };
        info!(tenant = %tenant_id, "shutting down job executor for removed tenant");
        executor.shutdown();
        self.write_executors().remove(tenant_id);
    }

    pub fn tenant_ids(&self) -> Vec<TenantId> {
        self.snapshot().into_iter().map(|(id, _)| id).collect()
    }

    /// Start every registered scheduler. Every tenant is attempted; the
    /// first failure is returned.
    pub fn start(&self) -> Result<(), ExecutorError> {
        let _lifecycle = self.lifecycle();

        let mut first_error = None;
        for (tenant_id, executor) in self.snapshot() {
            info!(tenant = %tenant_id, "starting job executor");
            if let Err(e) = executor.start() {
                error!(tenant = %tenant_id, error = %e, "failed to start job executor");
                first_error.get_or_insert(e);
            }
        }
        self.active.store(true, Ordering::SeqCst);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every registered scheduler. Idempotent.
    pub fn shutdown(&self) {
        let _lifecycle = self.lifecycle();

        for (tenant_id, executor) in self.snapshot() {
            info!(tenant = %tenant_id, "shutting down job executor");
            executor.shutdown();
        }
        self.active.store(false, Ordering::SeqCst);
    }

    /// Hand `job` to the ambient tenant's scheduler. Never falls back to
    /// another tenant.
    pub fn execute_job_for_current_tenant(&self, job: JobRecord) -> Result<bool, ExecutorError> {
        Ok(self.current_executor()?.execute_async_job(job))
    }

    fn current_executor(&self) -> Result<Arc<dyn AsyncExecutor>, ExecutorError> {
        let tenant_id = self
            .tenant_context
            .current_tenant()
            .ok_or(ExecutorError::UnknownTenant(None))?;
        let executor = self.read_executors().get(&tenant_id).cloned();
        executor.ok_or(ExecutorError::UnknownTenant(Some(tenant_id)))
    }

    fn fan_out(&self, update: &dyn Fn(&mut SchedulerConfig)) {
        let _lifecycle = self.lifecycle();
        for (_, executor) in self.snapshot() {
            executor.update_config(update);
        }
    }

    fn current_config(&self) -> Result<SchedulerConfig, ExecutorError> {
        Ok(self.current_executor()?.config())
    }

    pub fn set_async_job_lock_time(&self, lock_time: Duration) {
        self.fan_out(&|c| c.async_job_lock_time = lock_time);
    }

    pub fn async_job_lock_time(&self) -> Result<Duration, ExecutorError> {
        Ok(self.current_config()?.async_job_lock_time)
    }

    pub fn set_timer_lock_time(&self, lock_time: Duration) {
        self.fan_out(&|c| c.timer_lock_time = lock_time);
    }

    pub fn timer_lock_time(&self) -> Result<Duration, ExecutorError> {
        Ok(self.current_config()?.timer_lock_time)
    }

    pub fn set_default_async_job_acquire_wait(&self, wait: Duration) {
        self.fan_out(&|c| c.default_async_job_acquire_wait = wait);
    }

    pub fn default_async_job_acquire_wait(&self) -> Result<Duration, ExecutorError> {
        Ok(self.current_config()?.default_async_job_acquire_wait)
    }

    pub fn set_default_timer_job_acquire_wait(&self, wait: Duration) {
        self.fan_out(&|c| c.default_timer_job_acquire_wait = wait);
    }

    pub fn default_timer_job_acquire_wait(&self) -> Result<Duration, ExecutorError> {
        Ok(self.current_config()?.default_timer_job_acquire_wait)
    }

    pub fn set_default_queue_size_full_wait(&self, wait: Duration) {
        self.fan_out(&|c| c.default_queue_size_full_wait = wait);
    }

    pub fn default_queue_size_full_wait(&self) -> Result<Duration, ExecutorError> {
        Ok(self.current_config()?.default_queue_size_full_wait)
    }

    pub fn set_retry_wait(&self, wait: Duration) {
        self.fan_out(&|c| c.retry_wait = wait);
    }

    pub fn retry_wait(&self) -> Result<Duration, ExecutorError> {
        Ok(self.current_config()?.retry_wait)
    }

    /// Running loops treat zero as one; `start()` rejects it.
    pub fn set_max_async_jobs_due_per_acquisition(&self, max: usize) {
        self.fan_out(&|c| c.max_async_jobs_due_per_acquisition = max);
    }

    pub fn max_async_jobs_due_per_acquisition(&self) -> Result<usize, ExecutorError> {
        Ok(self.current_config()?.max_async_jobs_due_per_acquisition)
    }

    /// Running loops treat zero as one; `start()` rejects it.
    pub fn set_max_timer_jobs_per_acquisition(&self, max: usize) {
        self.fan_out(&|c| c.max_timer_jobs_per_acquisition = max);
    }

    pub fn max_timer_jobs_per_acquisition(&self) -> Result<usize, ExecutorError> {
        Ok(self.current_config()?.max_timer_jobs_per_acquisition)
    }

    /// Lock owner of the ambient tenant's scheduler.
    pub fn lock_owner(&self) -> Result<LockOwner, ExecutorError> {
        Ok(self.current_executor()?.lock_owner())
    }

    /// Statistics of the ambient tenant's scheduler.
    pub fn stats(&self) -> Result<ExecutorStats, ExecutorError> {
        Ok(self.current_executor()?.stats())
    }

    /// Always fails: each tenant's scheduler holds its own command executor.
    pub fn command_executor(&self) -> Result<Arc<dyn CommandExecutor>, ExecutorError> {
        Err(ExecutorError::UnsupportedOperation(
            "command_executor is only defined per tenant",
        ))
    }

    /// Install `command_executor` on every scheduler, including those
    /// registered later.
    pub fn set_command_executor(&self, command_executor: Arc<dyn CommandExecutor>) {
        let mut lifecycle = self.lifecycle();
        for (_, executor) in self.snapshot() {
            executor.set_command_executor(command_executor.clone());
        }
        lifecycle.command_executor = Some(command_executor);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_auto_activate(&self) -> bool {
        self.auto_activate.load(Ordering::SeqCst)
    }

    pub fn set_auto_activate(&self, auto_activate: bool) {
        self.auto_activate.store(auto_activate, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for MultiTenantJobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiTenantJobExecutor")
            .field("tenants", &self.tenant_ids())
            .field("active", &self.is_active())
            .field("auto_activate", &self.is_auto_activate())
            .finish_non_exhaustive()
    }
}
