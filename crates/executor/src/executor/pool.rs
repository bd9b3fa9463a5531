//! Fixed-size worker pool fed by a bounded queue.

use std::collections::VecDeque;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::error;

/// Unit of work run on a pool thread.
pub(crate) trait Task: Send + 'static {
    fn run(self);
}

/// A task the pool did not accept, handed back to the caller.
#[derive(Debug)]
pub(crate) enum SubmitError<T> {
    /// The queue stayed full for the whole wait.
    Full(T),
    /// The pool is shutting down.
    Closed(T),
}

/// What `shutdown` left behind.
#[derive(Debug)]
pub(crate) struct PoolShutdown<T> {
    /// Queued tasks that never started.
    pub abandoned: Vec<T>,
    /// Tasks still running when the wait ran out; their workers were detached.
    pub still_running: usize,
}

struct Queue<T> {
    items: VecDeque<T>,
    closed: bool,
    running: usize,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    idle: Condvar,
    capacity: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) -> Vec<T> {
        let abandoned = {
            let mut queue = self.lock();
            queue.closed = true;
            queue.items.drain(..).collect()
        };
        self.not_empty.notify_all();
        self.not_full.notify_all();
        abandoned
    }
}

/// Bounded execution pool.
///
/// Submissions never drop a task: a rejected task is returned inside the
/// error so the caller can keep or release whatever it claimed.
pub(crate) struct ExecutionPool<T: Task> {
    shared: Arc<Shared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Task> ExecutionPool<T> {
    /// Spawn `size` workers named `{name}-worker-{i}`.
    pub fn spawn(name: &str, size: usize, capacity: usize) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                running: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            idle: Condvar::new(),
            capacity: capacity.max(1),
        });

        let mut workers = Vec::with_capacity(size);
        for i in 0..size.max(1) {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || worker_loop(worker_shared));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shared.close();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Enqueue without waiting.
    pub fn try_submit(&self, task: T) -> Result<(), SubmitError<T>> {
        self.submit_timeout(task, Duration::ZERO)
    }

    /// Enqueue, waiting up to `wait` for room in the queue.
    pub fn submit_timeout(&self, task: T, wait: Duration) -> Result<(), SubmitError<T>> {
        let deadline = Instant::now() + wait;
        let mut queue = self.shared.lock();

        loop {
            if queue.closed {
                return Err(SubmitError::Closed(task));
            }
            if queue.items.len() < self.shared.capacity {
                queue.items.push_back(task);
                drop(queue);
                self.shared.not_empty.notify_one();
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SubmitError::Full(task));
            }
            queue = self
                .shared
                .not_full
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn remaining_capacity(&self) -> usize {
        let queue = self.shared.lock();
        self.shared.capacity.saturating_sub(queue.items.len())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Close the queue, wake blocked submitters, hand back tasks that never
    /// started, and wait up to `wait` for running tasks. Workers still busy
    /// after that are detached rather than aborted.
    pub fn shutdown(&self, wait: Duration) -> PoolShutdown<T> {
        let abandoned = self.shared.close();

        let deadline = Instant::now() + wait;
        let mut queue = self.shared.lock();
        while queue.running > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            queue = self
                .shared
                .idle
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let still_running = queue.running;
        drop(queue);

        let handles: Vec<_> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if still_running == 0 {
            for handle in handles {
                let _ = handle.join();
            }
        }

        PoolShutdown {
            abandoned,
            still_running,
        }
    }
}

impl<T: Task> Drop for ExecutionPool<T> {
    fn drop(&mut self) {
        // Let idle workers exit even if nobody called shutdown.
        self.shared.close();
    }
}

fn worker_loop<T: Task>(shared: Arc<Shared<T>>) {
    loop {
        let task = {
            let mut queue = shared.lock();
            loop {
                if let Some(task) = queue.items.pop_front() {
                    queue.running += 1;
                    break task;
                }
                if queue.closed {
                    return;
                }
                queue = shared
                    .not_empty
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        shared.not_full.notify_one();

        if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            error!("task panicked on execution pool worker");
        }

        let mut queue = shared.lock();
        queue.running -= 1;
        if queue.running == 0 {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use super::*;

    struct Probe<F: FnOnce() + Send + 'static>(F);

    impl<F: FnOnce() + Send + 'static> Task for Probe<F> {
        fn run(self) {
            (self.0)()
        }
    }

    type BoxedProbe = Probe<Box<dyn FnOnce() + Send>>;

    fn probe(f: impl FnOnce() + Send + 'static) -> BoxedProbe {
        Probe(Box::new(f))
    }

    #[test]
    fn runs_submitted_tasks() {
        let pool: ExecutionPool<BoxedProbe> = ExecutionPool::spawn("test", 2, 8).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = counter.clone();
            pool.try_submit(probe(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap_or_else(|_| panic!("queue has room"));
        }

        let report = pool.shutdown(Duration::from_secs(5));
        assert_eq!(report.still_running, 0);
        assert_eq!(counter.load(Ordering::SeqCst) + report.abandoned.len(), 5);
    }

    #[test]
    fn full_queue_blocks_for_the_wait_then_returns_the_task() {
        let pool: ExecutionPool<BoxedProbe> = ExecutionPool::spawn("test", 1, 1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        // Occupy the only worker.
        pool.try_submit(probe(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
        }))
        .unwrap_or_else(|_| panic!("queue has room"));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Fill the queue.
        pool.try_submit(probe(|| {})).unwrap_or_else(|_| panic!("queue has room"));
        assert_eq!(pool.remaining_capacity(), 0);

        let started = Instant::now();
        let rejected = pool.submit_timeout(probe(|| {}), Duration::from_millis(150));
        assert!(matches!(rejected, Err(SubmitError::Full(_))));
        assert!(started.elapsed() >= Duration::from_millis(150));

        release_tx.send(()).unwrap();
        let report = pool.shutdown(Duration::from_secs(5));
        assert_eq!(report.still_running, 0);
    }

    #[test]
    fn shutdown_wakes_blocked_submitters() {
        let pool: Arc<ExecutionPool<BoxedProbe>> = Arc::new(ExecutionPool::spawn("test", 1, 1).unwrap());
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        pool.try_submit(probe(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
        }))
        .unwrap_or_else(|_| panic!("queue has room"));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.try_submit(probe(|| {})).unwrap_or_else(|_| panic!("queue has room"));

        let submitter = {
            let pool = pool.clone();
            thread::spawn(move || pool.submit_timeout(probe(|| {}), Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(50));

        let closer = {
            let pool = pool.clone();
            thread::spawn(move || pool.shutdown(Duration::from_secs(5)))
        };

        let outcome = submitter.join().unwrap();
        assert!(matches!(outcome, Err(SubmitError::Closed(_))));

        release_tx.send(()).unwrap();
        let report = closer.join().unwrap();
        assert_eq!(report.abandoned.len(), 1);
        assert_eq!(report.still_running, 0);
    }

    #[test]
    fn a_panicking_task_does_not_kill_the_worker() {
        let pool: ExecutionPool<BoxedProbe> = ExecutionPool::spawn("test", 1, 4).unwrap();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        pool.try_submit(probe(|| panic!("boom"))).unwrap_or_else(|_| panic!("queue has room"));
        pool.try_submit(probe(move || {
            let _ = done_tx.send(());
        }))
        .unwrap_or_else(|_| panic!("queue has room"));

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        pool.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn shutdown_detaches_workers_that_outlive_the_wait() {
        let pool: ExecutionPool<BoxedProbe> = ExecutionPool::spawn("test", 1, 1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        pool.try_submit(probe(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
        }))
        .unwrap_or_else(|_| panic!("queue has room"));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let report = pool.shutdown(Duration::from_millis(50));
        assert_eq!(report.still_running, 1);
        assert!(pool.is_closed());
        release_tx.send(()).unwrap();
    }
}
