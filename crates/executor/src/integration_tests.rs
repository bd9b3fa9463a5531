//! End-to-end tests for the multi-tenant executor.
//!
//! Real schedulers, real threads, in-memory store:
//! MultiTenantJobExecutor → DefaultAsyncJobExecutor → acquisition loop →
//! execution pool → CommandExecutor → JobStore
//!
//! Verifies:
//! - Tenant isolation of acquisition, execution and ambient context
//! - Registry semantics (duplicates, unknown tenants, fan-out)
//! - Claim races, queue-full backpressure, lifecycle idempotency

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Condvar, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use flowexec_core::{JobId, LockOwner, TenantId};

    use crate::command::CommandExecutor;
    use crate::config::SchedulerConfig;
    use crate::context::{
        ExecutionContext, TenantBinding, TenantContextProvider, TenantScope, ThreadLocalTenantContext,
    };
    use crate::error::ExecutorError;
    use crate::executor::{AsyncExecutor, DefaultAsyncJobExecutor, TenantBindable};
    use crate::jobs::{
        BackoffPolicy, InMemoryJobStore, JobLock, JobRecord, JobResult, JobStore, JobStoreError,
    };
    use crate::multitenant::MultiTenantJobExecutor;

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).unwrap()
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            default_async_job_acquire_wait: Duration::from_millis(20),
            default_timer_job_acquire_wait: Duration::from_millis(20),
            default_queue_size_full_wait: Duration::from_millis(50),
            retry_wait: Duration::from_millis(20),
            max_async_jobs_due_per_acquisition: 4,
            max_timer_jobs_per_acquisition: 4,
            pool_size: 2,
            queue_capacity: 8,
            shutdown_wait: Duration::from_secs(5),
            failure_backoff: BackoffPolicy::immediate(),
            ..Default::default()
        }
    }

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn insert_jobs(store: &InMemoryJobStore, tenant_id: &str, count: usize) -> Vec<JobId> {
        (0..count)
            .map(|i| {
                store
                    .insert(JobRecord::async_continuation(
                        tenant(tenant_id),
                        "step",
                        serde_json::json!({ "i": i }),
                    ))
                    .unwrap()
            })
            .collect()
    }

    #[derive(Debug, Clone)]
    struct Seen {
        job_id: JobId,
        job_tenant: TenantId,
        context_tenant: Option<TenantId>,
        ambient_tenant: Option<TenantId>,
        lock_owner: LockOwner,
    }

    /// Command executor that records what it saw and succeeds.
    struct Recorder {
        provider: Arc<dyn TenantContextProvider>,
        seen: Mutex<Vec<Seen>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                provider: ThreadLocalTenantContext::arc(),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }

        fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl CommandExecutor for Recorder {
        fn execute(&self, job: &JobRecord, context: &ExecutionContext) -> JobResult {
            self.seen.lock().unwrap().push(Seen {
                job_id: job.id,
                job_tenant: job.tenant_id.clone(),
                context_tenant: context.tenant_id().cloned(),
                ambient_tenant: self.provider.current_tenant(),
                lock_owner: context.lock_owner().clone(),
            });
            JobResult::Success
        }
    }

    /// Latch that holds jobs until opened.
    #[derive(Default)]
    struct Gate {
        open: Mutex<bool>,
        opened: Condvar,
    }

    impl Gate {
        fn wait(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.opened.wait(open).unwrap();
            }
        }

        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.opened.notify_all();
        }
    }

    fn orchestrator(store: &Arc<InMemoryJobStore>) -> MultiTenantJobExecutor {
        MultiTenantJobExecutor::new(ThreadLocalTenantContext::arc(), store.clone())
            .with_default_config(fast_config())
    }

    #[test]
    fn jobs_run_only_through_their_tenants_command_executor() {
        flowexec_observability::init_for_tests();

        let store = Arc::new(InMemoryJobStore::new());
        let recorders: Arc<Mutex<HashMap<TenantId, Arc<Recorder>>>> = Arc::default();

        let factory = {
            let store = store.clone();
            let recorders = recorders.clone();
            move |tenant_id: &TenantId| -> Arc<dyn AsyncExecutor> {
                let recorder = Recorder::new();
                recorders.lock().unwrap().insert(tenant_id.clone(), recorder.clone());
                Arc::new(
                    DefaultAsyncJobExecutor::new(store.clone(), fast_config())
                        .with_command_executor(recorder),
                )
            }
        };
        let executor = MultiTenantJobExecutor::new(ThreadLocalTenantContext::arc(), store.clone())
            .with_factory(Arc::new(factory));

        executor.add_tenant(tenant("t1"), true).unwrap();
        executor.add_tenant(tenant("t2"), true).unwrap();
        insert_jobs(&store, "t1", 5);
        insert_jobs(&store, "t2", 5);

        let recorders = recorders.lock().unwrap().clone();
        let (t1, t2) = (&recorders[&tenant("t1")], &recorders[&tenant("t2")]);
        assert!(wait_until(Duration::from_secs(10), || t1.count() == 5 && t2.count() == 5));
        executor.shutdown();

        for (name, recorder) in [("t1", t1), ("t2", t2)] {
            for seen in recorder.seen() {
                assert_eq!(seen.job_tenant, tenant(name));
                assert_eq!(seen.context_tenant, Some(tenant(name)));
                assert_eq!(seen.ambient_tenant, Some(tenant(name)));
            }
        }
    }

    #[test]
    fn duplicate_add_never_leaves_two_live_schedulers() {
        flowexec_observability::init_for_tests();

        let store = Arc::new(InMemoryJobStore::new());
        let recorder = Recorder::new();
        let executor = orchestrator(&store);
        executor.set_command_executor(recorder.clone());

        executor.add_tenant(tenant("t1"), true).unwrap();
        assert!(matches!(
            executor.add_tenant(tenant("t1"), true),
            Err(ExecutorError::DuplicateTenant(_))
        ));

        insert_jobs(&store, "t1", 10);
        assert!(wait_until(Duration::from_secs(10), || recorder.count() == 10));

        let owner = {
            let _scope = TenantScope::enter(ThreadLocalTenantContext::arc(), tenant("t1"));
            executor.lock_owner().unwrap()
        };
        executor.shutdown();

        assert!(recorder.seen().iter().all(|s| s.lock_owner == owner));
    }

    #[test]
    fn removing_a_ghost_tenant_leaves_others_running() {
        flowexec_observability::init_for_tests();

        let store = Arc::new(InMemoryJobStore::new());
        let recorder = Recorder::new();
        let executor = orchestrator(&store);
        executor.set_command_executor(recorder.clone());
        executor.add_tenant(tenant("t1"), true).unwrap();
        executor.add_tenant(tenant("t2"), true).unwrap();

        executor.remove_tenant(&tenant("ghost"));

        assert_eq!(executor.tenant_ids(), vec![tenant("t1"), tenant("t2")]);
        insert_jobs(&store, "t1", 1);
        insert_jobs(&store, "t2", 1);
        assert!(wait_until(Duration::from_secs(10), || recorder.count() == 2));
        executor.shutdown();
    }

    #[test]
    fn fan_out_updates_registered_tenants_and_late_tenants_get_defaults() {
        flowexec_observability::init_for_tests();

        let store = Arc::new(InMemoryJobStore::new());
        let executor = MultiTenantJobExecutor::new(ThreadLocalTenantContext::arc(), store);
        executor.add_tenant(tenant("t1"), false).unwrap();
        executor.add_tenant(tenant("t2"), false).unwrap();

        executor.set_max_async_jobs_due_per_acquisition(5);
        executor.add_tenant(tenant("t3"), false).unwrap();

        let provider = ThreadLocalTenantContext::arc();
        let read = |name: &str| {
            let _scope = TenantScope::enter(provider.clone(), tenant(name));
            executor.max_async_jobs_due_per_acquisition().unwrap()
        };
        assert_eq!(read("t1"), 5);
        assert_eq!(read("t2"), 5);
        assert_eq!(read("t3"), SchedulerConfig::default().max_async_jobs_due_per_acquisition);

        // Re-applying the fan-out reaches the late tenant too.
        executor.set_max_async_jobs_due_per_acquisition(5);
        assert_eq!(read("t3"), 5);
    }

    #[test]
    fn no_ambient_tenant_never_falls_back_to_a_registered_scheduler() {
        flowexec_observability::init_for_tests();

        let store = Arc::new(InMemoryJobStore::new());
        let recorder = Recorder::new();
        let executor = orchestrator(&store);
        executor.set_command_executor(recorder.clone());
        executor.add_tenant(tenant("t1"), true).unwrap();

        let job = JobRecord::async_continuation(tenant("t1"), "step", serde_json::json!({}))
            .delayed(Duration::from_secs(3600));
        store.insert(job.clone()).unwrap();

        assert!(matches!(
            executor.execute_job_for_current_tenant(job.clone()),
            Err(ExecutorError::UnknownTenant(None))
        ));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(recorder.count(), 0);

        // With the tenant ambient the same call goes through.
        {
            let _scope = TenantScope::enter(ThreadLocalTenantContext::arc(), tenant("t1"));
            assert!(executor.execute_job_for_current_tenant(job.clone()).unwrap());
        }
        assert!(wait_until(Duration::from_secs(10), || recorder.count() == 1));
        executor.shutdown();

        let seen = &recorder.seen()[0];
        assert_eq!(seen.job_id, job.id);
        assert_eq!(seen.ambient_tenant, Some(tenant("t1")));
    }

    #[test]
    fn racing_schedulers_claim_each_job_once() {
        flowexec_observability::init_for_tests();

        let store = Arc::new(InMemoryJobStore::new());
        let executions: Arc<Mutex<HashMap<JobId, usize>>> = Arc::default();
        let counted = executions.clone();
        let command: Arc<dyn CommandExecutor> = Arc::new(move |job: &JobRecord, _: &ExecutionContext| {
            *counted.lock().unwrap().entry(job.id).or_default() += 1;
            JobResult::Success
        });

        let config = SchedulerConfig {
            max_async_jobs_due_per_acquisition: 8,
            ..fast_config()
        };
        let a = DefaultAsyncJobExecutor::new(store.clone(), config.clone())
            .with_command_executor(command.clone());
        let b = DefaultAsyncJobExecutor::new(store.clone(), config).with_command_executor(command);

        let ids = insert_jobs(&store, "t1", 50);
        a.start().unwrap();
        b.start().unwrap();

        assert!(wait_until(Duration::from_secs(10), || executions.lock().unwrap().len() == 50));

        // Both loops survived whatever races they lost.
        let late = insert_jobs(&store, "t1", 1)[0];
        assert!(wait_until(Duration::from_secs(10), || {
            executions.lock().unwrap().contains_key(&late)
        }));
        a.shutdown();
        b.shutdown();

        let executions = executions.lock().unwrap();
        for id in ids.iter().chain([&late]) {
            assert_eq!(executions[id], 1, "job {id} ran more than once");
        }
        let stats = (a.stats(), b.stats());
        assert_eq!(stats.0.jobs_acquired + stats.1.jobs_acquired, 51);
    }

    #[test]
    fn exactly_one_of_two_claims_on_the_same_version_wins() {
        let store = InMemoryJobStore::new();
        let id = insert_jobs(&store, "t1", 1)[0];
        let job = store.get(&tenant("t1"), id).unwrap().unwrap();

        let now = chrono::Utc::now();
        let ttl = Duration::from_secs(60);
        let first = store.try_lock(id, job.version, &JobLock::new(LockOwner::generate(), now, ttl));
        let second = store.try_lock(id, job.version, &JobLock::new(LockOwner::generate(), now, ttl));

        assert!(first.is_ok());
        assert!(matches!(second, Err(JobStoreError::ClaimConflict(_))));
    }

    #[test]
    fn full_queue_blocks_acquisition_and_keeps_the_lock() {
        flowexec_observability::init_for_tests();

        let store = Arc::new(InMemoryJobStore::new());
        let gate = Arc::new(Gate::default());
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let command: Arc<dyn CommandExecutor> = {
            let (gate, started, finished) = (gate.clone(), started.clone(), finished.clone());
            Arc::new(move |_: &JobRecord, _: &ExecutionContext| {
                started.fetch_add(1, Ordering::SeqCst);
                gate.wait();
                finished.fetch_add(1, Ordering::SeqCst);
                JobResult::Success
            })
        };

        let executor = DefaultAsyncJobExecutor::new(
            store.clone(),
            SchedulerConfig {
                pool_size: 1,
                queue_capacity: 1,
                max_async_jobs_due_per_acquisition: 3,
                default_queue_size_full_wait: Duration::from_millis(300),
                async_job_lock_time: Duration::from_secs(2),
                ..fast_config()
            },
        )
        .with_command_executor(command);
        executor.bind_tenant(TenantBinding::new(tenant("t1"), ThreadLocalTenantContext::arc()));

        let ids = insert_jobs(&store, "t1", 3);
        executor.start().unwrap();
        let owner = executor.lock_owner();

        // One job blocks the only worker, one fills the queue, the third
        // waits for room in the acquisition loop.
        assert!(wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst) == 1));
        let all_locked = || {
            ids.iter().all(|id| {
                store
                    .get(&tenant("t1"), *id)
                    .unwrap()
                    .is_some_and(|job| job.lock_owner.as_ref() == Some(&owner))
            })
        };
        let sampling_until = Instant::now() + Duration::from_millis(500);
        while Instant::now() < sampling_until {
            assert!(all_locked(), "a claimed job lost its lock while waiting for the queue");
            thread::sleep(Duration::from_millis(25));
        }
        assert!(executor.stats().queue_full_events >= 1);
        assert_eq!(started.load(Ordering::SeqCst), 1);

        // The job left behind is picked up again once its lock expires.
        gate.open();
        assert!(wait_until(Duration::from_secs(10), || finished.load(Ordering::SeqCst) == 3));
        executor.shutdown();

        let stats = store.stats(&tenant("t1")).unwrap();
        assert_eq!(stats.acquirable + stats.locked + stats.waiting, 0);
    }

    #[test]
    fn shutdown_twice_then_start_restarts_every_tenant() {
        flowexec_observability::init_for_tests();

        let store = Arc::new(InMemoryJobStore::new());
        let recorder = Recorder::new();
        let executor = orchestrator(&store);
        executor.set_command_executor(recorder.clone());
        executor.add_tenant(tenant("t1"), false).unwrap();
        executor.add_tenant(tenant("t2"), false).unwrap();

        executor.start().unwrap();
        assert!(executor.is_active());
        executor.shutdown();
        executor.shutdown();
        assert!(!executor.is_active());

        insert_jobs(&store, "t1", 2);
        insert_jobs(&store, "t2", 2);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(recorder.count(), 0, "stopped schedulers must not acquire");

        executor.start().unwrap();
        assert!(wait_until(Duration::from_secs(10), || recorder.count() == 4));
        executor.shutdown();
    }

    #[test]
    fn dead_lettered_jobs_can_be_retried() {
        flowexec_observability::init_for_tests();

        let store = Arc::new(InMemoryJobStore::new());
        let healthy = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicUsize::new(0));
        let executor = orchestrator(&store);
        executor.set_command_executor({
            let (healthy, done) = (healthy.clone(), done.clone());
            Arc::new(move |_: &JobRecord, _: &ExecutionContext| {
                if healthy.load(Ordering::SeqCst) {
                    done.fetch_add(1, Ordering::SeqCst);
                    JobResult::Success
                } else {
                    JobResult::Failure("downstream unavailable".into())
                }
            })
        });
        executor.add_tenant(tenant("t1"), true).unwrap();

        let id = store
            .insert(
                JobRecord::async_continuation(tenant("t1"), "notify", serde_json::json!({}))
                    .with_retries(1),
            )
            .unwrap();
        assert!(wait_until(Duration::from_secs(10), || {
            store.list_dead_letters(&tenant("t1"), 10).unwrap().len() == 1
        }));

        healthy.store(true, Ordering::SeqCst);
        store.retry_dead_letter(&tenant("t1"), id, 3).unwrap();
        assert!(wait_until(Duration::from_secs(10), || done.load(Ordering::SeqCst) == 1));

        let stats = {
            let _scope = TenantScope::enter(ThreadLocalTenantContext::arc(), tenant("t1"));
            executor.stats().unwrap()
        };
        executor.shutdown();

        assert_eq!(stats.jobs_dead_lettered, 1);
        assert!(store.list_dead_letters(&tenant("t1"), 10).unwrap().is_empty());
    }

    #[test]
    fn timers_fire_once_due() {
        flowexec_observability::init_for_tests();

        let store = Arc::new(InMemoryJobStore::new());
        let recorder = Recorder::new();
        let executor = orchestrator(&store);
        executor.set_command_executor(recorder.clone());
        executor.add_tenant(tenant("t1"), true).unwrap();

        let due_at = chrono::Utc::now() + chrono::Duration::milliseconds(200);
        store
            .insert(JobRecord::timer(tenant("t1"), "reminder", serde_json::json!({}), due_at))
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(recorder.count(), 0);
        assert!(wait_until(Duration::from_secs(10), || recorder.count() == 1));
        assert!(chrono::Utc::now() >= due_at);
        executor.shutdown();
    }
}
