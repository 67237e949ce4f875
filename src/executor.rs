//! Execution of asynchronous gap-fill work.
//!
//! The cache never spawns threads for population itself; callers supply an
//! [`Executor`] (typically a pool sized for bulk remote fetches) and the
//! cache submits one unit of work per claimed gap. A failing or panicking
//! task only affects the gap it was filling — failure is reported through
//! the gap's listeners, never by tearing down the executor.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use crossbeam::channel::{unbounded, Sender};
use tracing::warn;

/// A unit of asynchronous work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Something that can run units of work, typically on a thread pool.
pub trait Executor: Send + Sync + fmt::Debug {
    /// Submits `task` for execution. Implementations must eventually run
    /// the task or drop it; dropping abandons the gap it was filling.
    fn execute(&self, task: Task);
}

/// Runs every task synchronously on the calling thread.
///
/// Useful in tests and for callers that want fully synchronous population.
#[derive(Debug, Default, Clone, Copy)]
pub struct SameThreadExecutor;

impl Executor for SameThreadExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

/// Fixed-size pool of worker threads draining a shared task channel.
///
/// Workers survive panicking tasks. Dropping the pool closes the channel
/// and joins the workers; tasks still queued at that point are dropped.
pub struct ThreadPoolExecutor {
    sender: Option<Sender<Task>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPoolExecutor {
    /// Spawns a pool of `threads` workers.
    pub fn new(threads: usize) -> std::io::Result<Self> {
        assert!(threads > 0, "a pool needs at least one worker");
        let (sender, receiver) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("frozen-cache-{i}"))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        if catch_unwind(AssertUnwindSafe(task)).is_err() {
                            warn!("cache fill task panicked");
                        }
                    }
                })?;
            workers.push(handle);
        }
        Ok(ThreadPoolExecutor {
            sender: Some(sender),
            workers,
        })
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Task) {
        if let Some(sender) = &self.sender {
            if sender.send(task).is_err() {
                warn!("task submitted to a shut-down executor was dropped");
            }
        }
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("workers", &self.workers.len())
            .finish()
    }
}
