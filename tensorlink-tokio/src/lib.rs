//! tensorlink-tokio - the deferred-function contract on a tokio loop.
//!
//! Where the shared-memory transport owns a raw epoll loop, transports
//! built on an external event library get the same contract from this
//! adapter: a background thread runs a current-thread tokio runtime, an
//! unbounded channel plays the role of the async wakeup handle, and
//! [`TokioLoop::defer_to_loop`] enqueues callables that the loop task
//! drains in submission order.
//!
//! Shutdown runs in two phases. First a deferred task fires the adapter's
//! closing emitter, so live subordinate handles (connections, listeners)
//! close from the loop thread. Then the channel's sender side is dropped;
//! the receiver keeps yielding everything already queued before it
//! reports disconnection, which guarantees no deferred function submitted
//! before `close` is lost. Once the queue is dry the runtime returns and
//! the thread exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tokio::sync::mpsc;

use tensorlink::callback::ClosingEmitter;
use tensorlink::error::{Error, Result};

type Task = Box<dyn FnOnce() + Send>;

/// A serial executor on a dedicated tokio loop thread.
pub struct TokioLoop {
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    emitter: Arc<ClosingEmitter>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    closed: AtomicBool,
    joined: AtomicBool,
}

impl TokioLoop {
    pub fn new() -> Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|err| Error::system_io("tokio", &err))?;
        let thread = thread::Builder::new()
            .name("tensorlink-tokio-loop".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(task) = receiver.recv().await {
                        task();
                    }
                });
            })
            .map_err(|err| Error::system_io("thread", &err))?;
        let thread_id = thread.thread().id();
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            emitter: Arc::new(ClosingEmitter::new()),
            thread: Mutex::new(Some(thread)),
            thread_id,
            closed: AtomicBool::new(false),
            joined: AtomicBool::new(false),
        })
    }

    fn submit(&self, task: Task) -> bool {
        let sender = self.sender.lock().unwrap();
        match &*sender {
            Some(sender) => sender.send(task).is_ok(),
            None => false,
        }
    }

    /// Schedules `task` on the loop thread. Tasks run in submission
    /// order. After `close`, tasks are dropped.
    pub fn defer_to_loop(&self, task: impl FnOnce() + Send + 'static) {
        if !self.submit(Box::new(task)) {
            tracing::debug!("deferred function dropped: loop already closed");
        }
    }

    /// Runs `task` on the loop thread and waits for it; executes inline
    /// when already called from the loop. Returns without running the
    /// task when the loop is closed.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.in_loop() {
            task();
            return;
        }
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&done);
        let submitted = self.submit(Box::new(move || {
            task();
            let (lock, condvar) = &*signal;
            *lock.lock().unwrap() = true;
            condvar.notify_all();
        }));
        if !submitted {
            return;
        }
        let (lock, condvar) = &*done;
        let mut finished = lock.lock().unwrap();
        while !*finished {
            finished = condvar.wait(finished).unwrap();
        }
    }

    /// True iff called from the loop thread.
    pub fn in_loop(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// The close fan-out for handles living on this loop. Subscribers are
    /// closed from the loop thread during the first shutdown phase.
    pub fn closing_emitter(&self) -> &Arc<ClosingEmitter> {
        &self.emitter
    }

    /// Starts shutdown. Everything already queued still runs; new work is
    /// dropped. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Phase one: close live handles from the loop thread.
            let emitter = Arc::clone(&self.emitter);
            let _ = self.submit(Box::new(move || emitter.close()));
            // Phase two: the disconnect is the loop's exit signal, after
            // the queue is drained.
            *self.sender.lock().unwrap() = None;
        }
    }

    /// Closes, then waits for the loop thread to drain and exit.
    pub fn join(&self) {
        self.close();
        if !self.joined.swap(true, Ordering::AcqRel) {
            let thread = self.thread.lock().unwrap().take();
            if let Some(thread) = thread {
                if thread.join().is_err() {
                    tracing::warn!("tokio loop thread panicked");
                }
            }
        }
    }
}

impl Drop for TokioLoop {
    fn drop(&mut self) {
        if !self.joined.load(Ordering::Acquire) {
            tracing::warn!("tokio loop dropped without join(); joining in drop");
            self.join();
        }
    }
}
