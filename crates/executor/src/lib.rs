//! Multi-tenant asynchronous job executor.
//!
//! Discovers due jobs (async continuations and timers), claims them under a
//! TTL lock and executes them with bounded concurrency, retry and
//! backpressure. [`MultiTenantJobExecutor`] keeps one isolated scheduler per
//! tenant and routes calls by the caller's ambient tenant.

pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod multitenant;

mod integration_tests;

pub use command::{CommandExecutor, HandlerRegistry, JobHandler};
pub use config::{ConfigError, SchedulerConfig};
pub use context::{
    ExecutionContext, TenantBinding, TenantContextProvider, TenantScope, ThreadLocalTenantContext,
};
pub use error::ExecutorError;
pub use executor::{
    AsyncExecutor, AsyncExecutorFactory, DefaultAsyncJobExecutor, ExecutorStats, TenantBindable,
};
pub use jobs::{
    AcquireQuery, BackoffPolicy, BackoffStrategy, DeadLetterEntry, FailureOutcome, InMemoryJobStore,
    JobLock, JobRecord, JobResult, JobStats, JobStore, JobStoreError, JobType,
};
pub use multitenant::MultiTenantJobExecutor;
