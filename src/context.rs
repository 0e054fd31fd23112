//! Execution contexts for deferred listener callbacks.
//!
//! A [`ProgressListener`](crate::ProgressListener) built with a context does not run its
//! callback on the reporting thread (unless that thread already *is* the context). It
//! schedules one deferred invocation instead, and coalesces any reports that arrive before
//! the invocation runs into the latest value.
//!
//! Contexts are passed explicitly through [`ListenerBuilder::with_context`]; there is no
//! ambient "current context" lookup.
//!
//! [`ListenerBuilder::with_context`]: crate::ListenerBuilder::with_context

use std::{collections::VecDeque, fmt, thread::ThreadId};

use parking_lot::Mutex;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A place deferred callbacks can be sent to (a UI thread, an event loop, a worker queue).
pub trait ExecutionContext: Send + Sync {
    /// Returns `true` if the calling thread is currently executing on this context, in
    /// which case callbacks run inline.
    fn is_current(&self) -> bool;

    /// Enqueues `task` to run on this context.
    fn schedule(&self, task: Task);
}

/// A FIFO [`ExecutionContext`] drained manually with [`run_pending`](Self::run_pending).
///
/// The thread calling `run_pending` is considered "on" the queue for the duration of the
/// call.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use progress_flow::{ProgressListener, context::TaskQueue};
///
/// let queue = Arc::new(TaskQueue::new());
/// let listener = ProgressListener::builder(|value| println!("{value}"))
///     .with_context(queue.clone())
///     .build();
///
/// listener.token().report(0.5);
/// assert_eq!(queue.len(), 1);
/// assert_eq!(queue.run_pending(), 1);
/// # let _ = listener.dispose();
/// ```
#[derive(Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    runner: Mutex<Option<ThreadId>>,
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl TaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Returns `true` if no task is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Runs queued tasks on the calling thread until the queue is empty, including tasks
    /// enqueued while draining. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let previous = self.runner.lock().replace(std::thread::current().id());
        let _restore = RestoreRunner {
            runner: &self.runner,
            previous,
        };
        let mut ran = 0;
        loop {
            // Pop under the lock, run outside it.
            let Some(task) = self.tasks.lock().pop_front() else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }
}

/// Puts the previous runner back when draining ends, including by a panicking task.
struct RestoreRunner<'a> {
    runner: &'a Mutex<Option<ThreadId>>,
    previous: Option<ThreadId>,
}

impl Drop for RestoreRunner<'_> {
    fn drop(&mut self) {
        *self.runner.lock() = self.previous;
    }
}

impl ExecutionContext for TaskQueue {
    fn is_current(&self) -> bool {
        *self.runner.lock() == Some(std::thread::current().id())
    }

    fn schedule(&self, task: Task) {
        self.tasks.lock().push_back(task);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use super::{ExecutionContext, TaskQueue};

    /// Queue Draining
    /// Verifies tasks run in FIFO order and that tasks scheduled while draining also run.
    #[test]
    fn test_run_pending() {
        let queue = Arc::new(TaskQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let (q, c) = (queue.clone(), counter.clone());
        queue.schedule(Box::new(move || {
            assert!(q.is_current());
            c.fetch_add(1, Ordering::SeqCst);
            let c = c.clone();
            q.schedule(Box::new(move || {
                c.fetch_add(10, Ordering::SeqCst);
            }));
        }));

        assert!(!queue.is_current());
        assert_eq!(queue.run_pending(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 11);
        assert!(queue.is_empty());
        assert!(!queue.is_current());
    }

    /// Panicking Task
    /// Verifies a task that panics does not leave the thread marked as running the queue.
    #[test]
    fn test_runner_restored_after_panic() {
        let queue = TaskQueue::new();
        queue.schedule(Box::new(|| panic!("task failed")));
        queue.schedule(Box::new(|| {}));

        let result = panic::catch_unwind(AssertUnwindSafe(|| queue.run_pending()));
        assert!(result.is_err());
        assert!(!queue.is_current());

        // The remaining task is still queued and runs normally.
        assert_eq!(queue.run_pending(), 1);
    }
}
