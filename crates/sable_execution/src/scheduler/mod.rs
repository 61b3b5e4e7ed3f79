use std::fmt;
use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};
use sable_error::{Result, ResultExt};

/// Scheduler for executing query tasks.
///
/// Wraps an OS-thread backed pool. Operators size their internal state off of
/// `num_threads`.
pub struct Scheduler {
    pool: Arc<ThreadPool>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("num_threads", &self.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn try_new(num_threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|idx| format!("sable-worker-{idx}"))
            .build()
            .context("Failed to build worker thread pool")?;

        Ok(Scheduler {
            pool: Arc::new(pool),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Spawn a task on the pool.
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        self.pool.spawn(task)
    }

    /// Run tasks for each worker, blocking until all complete.
    ///
    /// `task` receives the worker index.
    pub fn run_workers<F>(&self, task: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        let num_threads = self.num_threads();
        self.pool.scope(|scope| {
            for idx in 0..num_threads {
                let task = &task;
                scope.spawn(move |_| task(idx));
            }
        });
    }
}
