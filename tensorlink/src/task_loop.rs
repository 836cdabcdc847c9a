//! Thread-borrowing serial executor.
//!
//! Every long-lived object that coordinates asynchronous callbacks owns a
//! [`TaskLoop`]. Tasks deferred to the same loop run serially, in
//! submission order, but the loop owns no thread of its own: the first
//! thread to submit while the loop is idle is borrowed to drain the queue,
//! and later submitters return immediately. This gives each object
//! single-threaded-mutator semantics without a dedicated thread per object
//! and without cross-thread handoff on the fast path.
//!
//! The flip side of thread borrowing is that under contention the thread
//! that claimed the queue keeps draining submissions that arrive while it
//! runs, so a caller that appears to only schedule one task may end up
//! executing arbitrarily many.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread::{self, ThreadId};

type Task = Box<dyn FnOnce() + Send>;

/// A serial executor that borrows the submitting thread.
pub struct TaskLoop {
    state: Mutex<LoopState>,
}

struct LoopState {
    pending: VecDeque<Task>,
    /// Thread currently draining the queue, if any.
    active: Option<ThreadId>,
}

impl TaskLoop {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopState {
                pending: VecDeque::new(),
                active: None,
            }),
        }
    }

    /// Returns true iff the calling thread is currently draining this loop.
    pub fn in_loop(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.active == Some(thread::current().id())
    }

    /// Schedules `task` to run on the loop.
    ///
    /// If the loop is idle, the calling thread claims it and drains the
    /// queue (including tasks submitted meanwhile) before returning.
    /// Otherwise the task is queued behind whatever the active thread is
    /// running and `defer` returns immediately. Submitting from inside a
    /// running task is legal: the new task runs after the current one
    /// returns, before the claiming `defer` call unwinds.
    pub fn defer(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.state.lock().unwrap();
            state.pending.push_back(Box::new(task));
            if state.active.is_some() {
                return;
            }
            state.active = Some(thread::current().id());
        }

        loop {
            let task = {
                let mut state = self.state.lock().unwrap();
                match state.pending.pop_front() {
                    Some(task) => task,
                    None => {
                        state.active = None;
                        return;
                    }
                }
            };
            task();
        }
    }
}

impl Default for TaskLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runs_in_submission_order() {
        let task_loop = TaskLoop::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = seen.clone();
            task_loop.defer(move || seen.lock().unwrap().push(i));
        }
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_in_loop_only_inside_tasks() {
        let task_loop = Arc::new(TaskLoop::new());
        assert!(!task_loop.in_loop());
        let inner = task_loop.clone();
        let observed = Arc::new(Mutex::new(None));
        let observed2 = observed.clone();
        task_loop.defer(move || {
            *observed2.lock().unwrap() = Some(inner.in_loop());
        });
        assert_eq!(*observed.lock().unwrap(), Some(true));
        assert!(!task_loop.in_loop());
    }

    #[test]
    fn test_reentrant_defer_runs_before_return() {
        let task_loop = Arc::new(TaskLoop::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner_loop = task_loop.clone();
        let inner_seen = seen.clone();
        task_loop.defer(move || {
            inner_seen.lock().unwrap().push("outer");
            let nested_seen = inner_seen.clone();
            inner_loop.defer(move || nested_seen.lock().unwrap().push("nested"));
            // The nested task must not have run yet: it waits for us.
            assert_eq!(inner_seen.lock().unwrap().len(), 1);
        });
        assert_eq!(*seen.lock().unwrap(), vec!["outer", "nested"]);
    }

    #[test]
    fn test_concurrent_submissions_serialize() {
        let task_loop = Arc::new(TaskLoop::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let task_loop = task_loop.clone();
            let running = running.clone();
            let max_running = max_running.clone();
            let total = total.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let running = running.clone();
                    let max_running = max_running.clone();
                    let total = total.clone();
                    task_loop.defer(move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_running.fetch_max(now, Ordering::SeqCst);
                        running.fetch_sub(1, Ordering::SeqCst);
                        total.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(total.load(Ordering::SeqCst), 400);
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
    }
}
