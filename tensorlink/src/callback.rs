//! Callback lifetime machinery.
//!
//! Two concerns live here. The wrapper functions bridge transport-layer
//! callbacks into the owning object's deferred loop and centralise the
//! first-error policy, in two flavors:
//!
//! - [`wrap_lazy`] holds a weak reference. If the subject is gone by the
//!   time the callback fires, the callback is a no-op; if the subject is
//!   in the error state, the inner callable is suppressed (the error was
//!   already handled centrally). Use it for pure progress notifications.
//! - [`wrap_eager`] holds a strong reference, keeping the subject alive
//!   until the callback fires, and always runs the inner callable, error
//!   state or not. Use it whenever a resource (a caller's buffer) was
//!   handed down and the inner callable is what releases it.
//!
//! The wrappers are the only place where transport errors become channel
//! errors; protocol code never inspects transport results directly.
//!
//! The second concern is close fan-out: a [`ClosingEmitter`] owned by each
//! context, and one [`ClosingReceiver`] per subordinate object that must
//! be closed when the context closes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::task_loop::TaskLoop;

/// An object whose callbacks are routed through a deferred loop and whose
/// first observed error is sticky.
pub trait CallbackSubject: Send + Sync + 'static {
    /// The loop all callbacks of this subject are serialised onto.
    fn task_loop(&self) -> &TaskLoop;

    /// The sticky error, if one has been recorded.
    fn sticky_error(&self) -> Option<Error>;

    /// Records `error` if none is recorded yet. Returns true iff this
    /// call was the one that recorded it.
    fn record_error(&self, error: Error) -> bool;

    /// Invoked exactly once, from inside the loop, right after the first
    /// error was recorded. Typically closes the underlying resources and
    /// drains pending operations.
    fn handle_error(this: &Arc<Self>)
    where
        Self: Sized;
}

/// Applies the first-error policy from inside the subject's loop.
///
/// Returns true when the subject is in the error state after the call,
/// i.e. when a lazy-wrapped inner callable must be suppressed.
fn absorb_error<S: CallbackSubject>(subject: &Arc<S>, error: Option<Error>) -> bool {
    if subject.sticky_error().is_some() {
        return true;
    }
    match error {
        None => false,
        Some(error) => {
            if subject.record_error(error) {
                S::handle_error(subject);
            }
            true
        }
    }
}

/// Wraps `inner` with weak lifetime and suppress-on-error policy.
pub fn wrap_lazy<S, T, F>(subject: &Arc<S>, inner: F) -> impl FnOnce(Result<T>) + Send + 'static
where
    S: CallbackSubject,
    T: Send + 'static,
    F: FnOnce(&Arc<S>, T) + Send + 'static,
{
    let weak = Arc::downgrade(subject);
    move |result: Result<T>| {
        let subject = match weak.upgrade() {
            Some(subject) => subject,
            None => return,
        };
        let task_subject = Arc::clone(&subject);
        subject.task_loop().defer(move || match result {
            Err(error) => {
                absorb_error(&task_subject, Some(error));
            }
            Ok(value) => {
                if !absorb_error(&task_subject, None) {
                    inner(&task_subject, value);
                }
            }
        });
    }
}

/// Wraps `inner` with strong lifetime and always-run policy.
///
/// The success payload is dropped: eager inner callables only release the
/// resource whose handoff they were armed for, keyed by state captured at
/// wrap time.
pub fn wrap_eager<S, T, F>(subject: &Arc<S>, inner: F) -> impl FnOnce(Result<T>) + Send + 'static
where
    S: CallbackSubject,
    T: Send + 'static,
    F: FnOnce(&Arc<S>) + Send + 'static,
{
    let strong = Arc::clone(subject);
    move |result: Result<T>| {
        let task_subject = Arc::clone(&strong);
        strong.task_loop().defer(move || {
            absorb_error(&task_subject, result.err());
            inner(&task_subject);
        });
    }
}

/// Fan-out of a "context is closing" signal to subordinate objects.
///
/// Contexts own one emitter; channels and connections subscribe a close
/// thunk on activation and unsubscribe on destruction (through
/// [`ClosingReceiver`]). `close` runs every registered thunk under the
/// emitter's mutex.
pub struct ClosingEmitter {
    state: Mutex<EmitterState>,
}

struct EmitterState {
    next_token: u64,
    thunks: HashMap<u64, Box<dyn Fn() + Send>>,
}

impl ClosingEmitter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EmitterState {
                next_token: 1,
                thunks: HashMap::new(),
            }),
        }
    }

    fn subscribe(&self, thunk: Box<dyn Fn() + Send>) -> u64 {
        let mut state = self.state.lock().unwrap();
        let token = state.next_token;
        state.next_token += 1;
        state.thunks.insert(token, thunk);
        token
    }

    fn unsubscribe(&self, token: u64) {
        let mut state = self.state.lock().unwrap();
        state.thunks.remove(&token);
    }

    /// Invokes every registered close thunk.
    pub fn close(&self) {
        let state = self.state.lock().unwrap();
        for thunk in state.thunks.values() {
            thunk();
        }
    }
}

impl Default for ClosingEmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription guard pairing with [`ClosingEmitter`].
///
/// The thunk normally holds a `Weak` to the subordinate and calls its
/// `close()` on upgrade. Dropping the receiver unsubscribes.
pub struct ClosingReceiver {
    emitter: Arc<ClosingEmitter>,
    token: u64,
}

impl ClosingReceiver {
    pub fn new(emitter: &Arc<ClosingEmitter>, thunk: impl Fn() + Send + 'static) -> Self {
        let token = emitter.subscribe(Box::new(thunk));
        Self {
            emitter: Arc::clone(emitter),
            token,
        }
    }
}

impl Drop for ClosingReceiver {
    fn drop(&mut self) {
        self.emitter.unsubscribe(self.token);
    }
}

/// A weak-upgrading close thunk for a [`CallbackSubject`]-style object.
///
/// Helper for the common receiver pattern: keep the subordinate weakly so
/// the emitter does not extend its lifetime.
pub fn closing_thunk<S, F>(subject: &Arc<S>, close: F) -> impl Fn() + Send + 'static
where
    S: Send + Sync + 'static,
    F: Fn(&Arc<S>) + Send + 'static,
{
    let weak: Weak<S> = Arc::downgrade(subject);
    move || {
        if let Some(subject) = weak.upgrade() {
            close(&subject);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestSubject {
        task_loop: TaskLoop,
        error: Mutex<Option<Error>>,
        handled: AtomicUsize,
    }

    impl TestSubject {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                task_loop: TaskLoop::new(),
                error: Mutex::new(None),
                handled: AtomicUsize::new(0),
            })
        }
    }

    impl CallbackSubject for TestSubject {
        fn task_loop(&self) -> &TaskLoop {
            &self.task_loop
        }

        fn sticky_error(&self) -> Option<Error> {
            self.error.lock().unwrap().clone()
        }

        fn record_error(&self, error: Error) -> bool {
            let mut slot = self.error.lock().unwrap();
            if slot.is_some() {
                return false;
            }
            *slot = Some(error);
            true
        }

        fn handle_error(this: &Arc<Self>) {
            this.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_lazy_runs_on_success() {
        let subject = TestSubject::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let cb = wrap_lazy(&subject, move |_subject, value: u32| {
            assert_eq!(value, 7);
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        cb(Ok(7));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_noop_after_subject_dropped() {
        let subject = TestSubject::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let cb = wrap_lazy(&subject, move |_subject, _: ()| {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        drop(subject);
        cb(Ok(()));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_lazy_suppressed_in_error_state() {
        let subject = TestSubject::new();
        subject.record_error(Error::ChannelClosed);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let cb = wrap_lazy(&subject, move |_subject, _: ()| {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        cb(Ok(()));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_first_error_wins_and_handles_once() {
        let subject = TestSubject::new();
        let cb1 = wrap_lazy(&subject, |_subject, _: ()| {});
        let cb2 = wrap_lazy(&subject, |_subject, _: ()| {});
        cb1(Err(Error::ConnectionClosed));
        cb2(Err(Error::Eof));
        assert_eq!(subject.sticky_error(), Some(Error::ConnectionClosed));
        assert_eq!(subject.handled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_eager_runs_despite_error() {
        let subject = TestSubject::new();
        subject.record_error(Error::ChannelClosed);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let cb = wrap_eager(&subject, move |_subject| {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        cb(Err::<(), _>(Error::ConnectionClosed));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        // The pre-existing error is kept.
        assert_eq!(subject.sticky_error(), Some(Error::ChannelClosed));
    }

    #[test]
    fn test_eager_keeps_subject_alive() {
        let subject = TestSubject::new();
        let weak = Arc::downgrade(&subject);
        let cb = wrap_eager(&subject, |_subject| {});
        drop(subject);
        assert!(weak.upgrade().is_some());
        cb(Ok(()));
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_emitter_close_runs_thunks() {
        let emitter = Arc::new(ClosingEmitter::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let c2 = count.clone();
        let _r1 = ClosingReceiver::new(&emitter, move || {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let _r2 = ClosingReceiver::new(&emitter, move || {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        emitter.close();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_receiver_drop_unsubscribes() {
        let emitter = Arc::new(ClosingEmitter::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let receiver = ClosingReceiver::new(&emitter, move || {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        drop(receiver);
        emitter.close();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_closing_thunk_weak() {
        let subject = TestSubject::new();
        let closed = Arc::new(AtomicUsize::new(0));
        let closed2 = closed.clone();
        let thunk = closing_thunk(&subject, move |_subject| {
            closed2.fetch_add(1, Ordering::SeqCst);
        });
        thunk();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        drop(subject);
        thunk();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
