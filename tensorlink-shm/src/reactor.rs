//! The reactor: a serial executor with a dedicated thread.
//!
//! Two kinds of work flow through it. Deferred functions are one-shot
//! callables submitted from any thread. Reactions are re-runnable
//! callables registered under a token and executed every time the token
//! is triggered; the event loop uses one to pump epoll events. Both kinds
//! run on the reactor thread, one at a time, so an fd handler and a
//! user-submitted callable can never race on per-connection state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tensorlink::error::{Error, Result};

/// Identifies a registered reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(u64);

type Deferred = Box<dyn FnOnce() + Send>;
type Reaction = Arc<dyn Fn() + Send + Sync>;

struct ReactorState {
    deferred: VecDeque<Deferred>,
    triggered: VecDeque<u64>,
    reactions: HashMap<u64, Reaction>,
    next_token: u64,
    closed: bool,
}

struct ReactorShared {
    state: Mutex<ReactorState>,
    condvar: Condvar,
}

/// Serial executor backing an event loop.
pub struct Reactor {
    shared: Arc<ReactorShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let shared = Arc::new(ReactorShared {
            state: Mutex::new(ReactorState {
                deferred: VecDeque::new(),
                triggered: VecDeque::new(),
                reactions: HashMap::new(),
                next_token: 1,
                closed: false,
            }),
            condvar: Condvar::new(),
        });
        let run_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("tensorlink-shm-reactor".to_string())
            .spawn(move || Self::run(&run_shared))
            .map_err(|err| Error::system_io("thread", &err))?;
        let thread_id = thread.thread().id();
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
            thread_id,
        })
    }

    fn run(shared: &ReactorShared) {
        let mut state = shared.state.lock().unwrap();
        loop {
            if let Some(task) = state.deferred.pop_front() {
                drop(state);
                task();
                state = shared.state.lock().unwrap();
                continue;
            }
            if let Some(token) = state.triggered.pop_front() {
                let reaction = state.reactions.get(&token).cloned();
                drop(state);
                if let Some(reaction) = reaction {
                    reaction();
                }
                state = shared.state.lock().unwrap();
                continue;
            }
            if state.closed {
                return;
            }
            state = shared.condvar.wait(state).unwrap();
        }
    }

    /// Schedules a one-shot callable on the reactor thread.
    pub fn defer(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        state.deferred.push_back(Box::new(task));
        self.shared.condvar.notify_one();
    }

    /// Registers a re-runnable reaction and returns its token.
    pub fn add_reaction(&self, reaction: impl Fn() + Send + Sync + 'static) -> Token {
        let mut state = self.shared.state.lock().unwrap();
        let token = state.next_token;
        state.next_token += 1;
        state.reactions.insert(token, Arc::new(reaction));
        Token(token)
    }

    /// Removes a reaction. Pending triggers for it become no-ops.
    pub fn remove_reaction(&self, token: Token) {
        let mut state = self.shared.state.lock().unwrap();
        state.reactions.remove(&token.0);
    }

    /// Schedules one execution of the reaction behind `token`.
    pub fn trigger(&self, token: Token) {
        let mut state = self.shared.state.lock().unwrap();
        state.triggered.push_back(token.0);
        self.shared.condvar.notify_one();
    }

    /// True iff the calling thread is the reactor thread.
    pub fn in_reactor_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Asks the reactor thread to exit once its queues are drained.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.closed = true;
        self.shared.condvar.notify_all();
    }

    /// Closes, then waits for the reactor thread.
    pub fn join(&self) {
        self.close();
        let thread = self.thread.lock().unwrap().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::warn!("reactor thread panicked");
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_deferred_run_in_order() {
        let reactor = Reactor::new().unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            reactor.defer(move || {
                let _ = tx.send(i);
            });
        }
        for expected in 0..10 {
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(1)).unwrap(),
                expected
            );
        }
        reactor.join();
    }

    #[test]
    fn test_deferred_runs_on_reactor_thread() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&reactor);
        reactor.defer(move || {
            let _ = tx.send(inner.in_reactor_thread());
        });
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        assert!(!reactor.in_reactor_thread());
        reactor.join();
    }

    #[test]
    fn test_reaction_triggering() {
        let reactor = Reactor::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&count);
        let token = reactor.add_reaction(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        reactor.trigger(token);
        reactor.trigger(token);

        // Synchronise on a deferred task queued after the triggers.
        let (tx, rx) = mpsc::channel();
        reactor.defer(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);

        reactor.remove_reaction(token);
        reactor.trigger(token);
        let (tx, rx) = mpsc::channel();
        reactor.defer(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        reactor.join();
    }

    #[test]
    fn test_join_drains_pending_work() {
        let reactor = Reactor::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counted = Arc::clone(&count);
            reactor.defer(move || {
                counted.fetch_add(1, Ordering::SeqCst);
            });
        }
        reactor.join();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_join_idempotent() {
        let reactor = Reactor::new().unwrap();
        reactor.join();
        reactor.join();
    }
}
