//! Worker pools used by producers and consumers.
//!
//! A pool of size 0 runs every job inline on the submitting thread; any
//! other size hands jobs to a `threadpool::ThreadPool` with that many
//! named workers.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
};

use threadpool::ThreadPool;
use tracing::error;

pub struct WorkerPool {
    inner: Option<ThreadPool>,
    name: String,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Self {
        let inner = (threads > 0).then(|| {
            threadpool::Builder::new()
                .num_threads(threads)
                .thread_name(format!("eventflux-{name}"))
                .build()
        });
        WorkerPool {
            inner,
            name: name.to_string(),
        }
    }

    /// True when jobs run on the caller's thread.
    pub fn is_inline(&self) -> bool {
        self.inner.is_none()
    }

    pub fn threads(&self) -> usize {
        self.inner.as_ref().map_or(0, ThreadPool::max_count)
    }

    /// Runs `job` on a worker, or immediately when the pool is inline.
    ///
    /// Panics inside a job are caught and logged so one failing job cannot
    /// take a worker down with it.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = self.name.clone();
        let guarded = move || {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("job on pool {} panicked", name);
            }
        };
        match &self.inner {
            Some(pool) => pool.execute(guarded),
            None => guarded(),
        }
    }

    /// Blocks until every queued job has finished.
    pub fn join(&self) {
        if let Some(pool) = &self.inner {
            pool.join();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("threads", &self.threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
    };

    use super::*;

    #[test]
    fn inline_pool_runs_on_caller() {
        let pool = WorkerPool::new("inline", 0);
        assert!(pool.is_inline());
        let caller = thread::current().id();
        let (tx, rx) = crossbeam::channel::bounded(1);
        pool.execute(move || tx.send(thread::current().id()).expect("send"));
        assert_eq!(rx.try_recv().expect("ran synchronously"), caller);
    }

    #[test]
    fn threaded_pool_runs_everything() {
        let pool = WorkerPool::new("test", 3);
        assert_eq!(pool.threads(), 3);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let count = count.clone();
            pool.execute(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert_eq!(count.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn panicking_job_does_not_poison_pool() {
        let pool = WorkerPool::new("panics", 1);
        pool.execute(|| panic!("boom"));
        let (tx, rx) = crossbeam::channel::bounded(1);
        pool.execute(move || tx.send(7).expect("send"));
        assert_eq!(rx.recv().expect("worker alive"), 7);
    }
}
