//! The epoll event loop.
//!
//! One thread blocks in `epoll_wait`; a non-blocking eventfd interrupts
//! it whenever another thread needs its attention (close, deferred work,
//! the last handler going away). The loop never dispatches events itself:
//! it stashes them and triggers the [`Reactor`], then waits on a condvar
//! until the reactor thread has drained the stash. That way fd handlers
//! and deferred functions share one serial executor.
//!
//! The handler table is a dense fd-indexed array of weak handles. Holding
//! handlers weakly lets their owners drop them at any time; the table
//! lock is never held while a handler runs or is destroyed.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};

use tensorlink::error::{Error, Result};

use crate::reactor::{Reactor, Token};

/// Receives readiness events for one registered descriptor.
///
/// Invoked on the reactor thread, without any loop lock held.
pub trait EventHandler: Send + Sync {
    fn handle_events_from_loop(&self, events: EpollFlags);
}

/// Event loop tunables.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Capacity of the per-wakeup epoll event buffer.
    pub max_events: usize,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self { max_events: 64 }
    }
}

struct HandlerTable {
    slots: Vec<Option<Weak<dyn EventHandler>>>,
    count: usize,
}

impl HandlerTable {
    fn store(&mut self, fd: RawFd, handler: Weak<dyn EventHandler>) {
        let index = fd as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        if self.slots[index].is_none() {
            self.count += 1;
        }
        self.slots[index] = Some(handler);
    }

    /// Clears the slot; true iff it was occupied.
    fn clear(&mut self, fd: RawFd) -> bool {
        let index = fd as usize;
        if index < self.slots.len() && self.slots[index].is_some() {
            self.slots[index] = None;
            self.count -= 1;
            true
        } else {
            false
        }
    }

    fn get(&self, data: u64) -> Option<Weak<dyn EventHandler>> {
        self.slots.get(data as usize).and_then(|slot| slot.clone())
    }
}

struct LoopInner {
    reactor: Reactor,
    epoll: Epoll,
    wakeup_fd: EventFd,
    handlers: Mutex<HandlerTable>,
    /// Events stashed by the epoll thread for the reactor to dispatch.
    pending: Mutex<Vec<(u64, EpollFlags)>>,
    drained: Condvar,
    closed: AtomicBool,
    epoll_token: OnceLock<Token>,
    max_events: usize,
}

impl LoopInner {
    fn wake(&self) {
        if let Err(errno) = self.wakeup_fd.write(1) {
            tracing::warn!("wakeup eventfd write failed: {}", errno);
        }
    }

    fn drain_wakeup(&self) {
        // Reading resets the eventfd counter; EAGAIN means it was already
        // clear.
        while self.wakeup_fd.read().is_ok() {}
    }

    fn register_descriptor(
        &self,
        fd: RawFd,
        events: EpollFlags,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        {
            let mut table = self.handlers.lock().unwrap();
            table.store(fd, Arc::downgrade(&handler));
        }
        // SAFETY: the caller owns the fd and keeps it open for as long as
        // it stays registered.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut event = EpollEvent::new(events, fd as u64);
        let added = match self.epoll.add(borrowed, event) {
            Ok(()) => Ok(()),
            // Re-registering an armed fd updates it in place.
            Err(Errno::EEXIST) => self
                .epoll
                .modify(borrowed, &mut event)
                .map_err(|errno| Error::system("epoll", errno)),
            Err(errno) => Err(Error::system("epoll", errno)),
        };
        if added.is_err() {
            let mut table = self.handlers.lock().unwrap();
            table.clear(fd);
        }
        added
    }

    fn unregister_descriptor(&self, fd: RawFd) -> Result<()> {
        // SAFETY: see `register_descriptor`.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.epoll.delete(borrowed) {
            Ok(()) => {}
            // Unregistering twice, or after the fd was closed, is a no-op.
            Err(Errno::ENOENT) | Err(Errno::EBADF) => {}
            Err(errno) => return Err(Error::system("epoll", errno)),
        }
        let should_wake = {
            let mut table = self.handlers.lock().unwrap();
            table.clear(fd) && table.count <= 1
        };
        // The loop may be waiting for the last handler to go away.
        if should_wake {
            self.wake();
        }
        Ok(())
    }

    /// Runs on the reactor thread; dispatches the stashed events and lets
    /// the epoll thread resume by clearing the stash.
    fn dispatch_pending_events(&self) {
        let events: Vec<(u64, EpollFlags)> = self.pending.lock().unwrap().clone();
        for (data, flags) in events {
            let handler = {
                let table = self.handlers.lock().unwrap();
                table.get(data).and_then(|weak| weak.upgrade())
            };
            // The strong handle lives only for this dispatch and is never
            // held under the table lock, so handler destructors can run
            // while other threads register or unregister.
            if let Some(handler) = handler {
                handler.handle_events_from_loop(flags);
            }
        }
        let mut pending = self.pending.lock().unwrap();
        pending.clear();
        self.drained.notify_all();
    }

    fn run_loop(inner: &Arc<LoopInner>) {
        let token = match inner.epoll_token.get() {
            Some(token) => *token,
            None => return,
        };

        // Monitor the eventfd for readability and always drain it, so it
        // is quiet again by the next epoll_wait.
        let wakeup_handler: Arc<dyn EventHandler> = Arc::new(WakeupHandler {
            inner: Arc::downgrade(inner),
        });
        let wakeup_raw = inner.wakeup_fd.as_fd().as_raw_fd();
        if let Err(error) =
            inner.register_descriptor(wakeup_raw, EpollFlags::EPOLLIN, Arc::clone(&wakeup_handler))
        {
            tracing::warn!("failed to register the wakeup eventfd: {}", error);
            return;
        }

        let mut events = vec![EpollEvent::empty(); inner.max_events];
        loop {
            // Stop once close was requested and every handler except the
            // wakeup one is unregistered.
            {
                let table = inner.handlers.lock().unwrap();
                if inner.closed.load(Ordering::Acquire) && table.count <= 1 {
                    break;
                }
            }

            let n = match inner.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    tracing::warn!("epoll_wait failed: {}", errno);
                    break;
                }
            };

            // Hand the events to the reactor and wait until it drained
            // them, so at most one batch is ever in flight.
            let mut pending = inner.pending.lock().unwrap();
            pending.extend(events[..n].iter().map(|event| (event.data(), event.events())));
            inner.reactor.trigger(token);
            while !pending.is_empty() {
                pending = inner.drained.wait(pending).unwrap();
            }
        }

        let _ = inner.unregister_descriptor(wakeup_raw);
        inner.reactor.remove_reaction(token);
    }
}

struct WakeupHandler {
    inner: Weak<LoopInner>,
}

impl EventHandler for WakeupHandler {
    fn handle_events_from_loop(&self, _events: EpollFlags) {
        if let Some(inner) = self.inner.upgrade() {
            inner.drain_wakeup();
        }
    }
}

/// The epoll-backed event loop of the shared-memory transport.
pub struct EventLoop {
    inner: Arc<LoopInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
    joined: AtomicBool,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        Self::with_options(LoopOptions::default())
    }

    pub fn with_options(options: LoopOptions) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::empty())
            .map_err(|errno| Error::system("epoll", errno))?;
        let wakeup_fd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK)
            .map_err(|errno| Error::system("eventfd", errno))?;
        let reactor = Reactor::new()?;

        let inner = Arc::new(LoopInner {
            reactor,
            epoll,
            wakeup_fd,
            handlers: Mutex::new(HandlerTable {
                slots: Vec::new(),
                count: 0,
            }),
            pending: Mutex::new(Vec::new()),
            drained: Condvar::new(),
            closed: AtomicBool::new(false),
            epoll_token: OnceLock::new(),
            max_events: options.max_events.max(1),
        });

        let reaction_inner = Arc::downgrade(&inner);
        let token = inner.reactor.add_reaction(move || {
            if let Some(inner) = reaction_inner.upgrade() {
                inner.dispatch_pending_events();
            }
        });
        let _ = inner.epoll_token.set(token);

        let thread_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("tensorlink-shm-epoll".to_string())
            .spawn(move || LoopInner::run_loop(&thread_inner))
            .map_err(|err| Error::system_io("thread", &err))?;

        Ok(Self {
            inner,
            thread: Mutex::new(Some(thread)),
            joined: AtomicBool::new(false),
        })
    }

    /// Schedules `task` on the loop's serial executor.
    pub fn defer_to_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.reactor.defer(task);
        self.inner.wake();
    }

    /// Runs `task` on the loop's serial executor and waits for it;
    /// executes inline when already called from the loop.
    ///
    /// Must not be called after `join`.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.in_loop() {
            task();
            return;
        }
        let done = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&done);
        self.defer_to_loop(move || {
            task();
            let (lock, condvar) = &*signal;
            *lock.lock().unwrap() = true;
            condvar.notify_all();
        });
        let (lock, condvar) = &*done;
        let mut finished = lock.lock().unwrap();
        while !*finished {
            finished = condvar.wait(finished).unwrap();
        }
    }

    /// True iff called from the loop's serial executor.
    pub fn in_loop(&self) -> bool {
        self.inner.reactor.in_reactor_thread()
    }

    /// Registers `handler` for `events` on `fd`. The table keeps only a
    /// weak handle; exactly one handler is registered per fd at a time,
    /// and re-registering replaces it.
    pub fn register_descriptor(
        &self,
        fd: RawFd,
        events: EpollFlags,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        self.inner.register_descriptor(fd, events, handler)
    }

    /// Unregisters `fd`. Idempotent.
    pub fn unregister_descriptor(&self, fd: RawFd) -> Result<()> {
        self.inner.unregister_descriptor(fd)
    }

    /// Asks the loop to shut down. It exits once every handler except the
    /// internal wakeup one is unregistered. Idempotent.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.wake();
        }
    }

    /// Closes, then waits for the epoll and reactor threads.
    pub fn join(&self) {
        self.close();
        if !self.joined.swap(true, Ordering::AcqRel) {
            let thread = self.thread.lock().unwrap().take();
            if let Some(thread) = thread {
                if thread.join().is_err() {
                    tracing::warn!("epoll thread panicked");
                }
            }
            self.inner.reactor.join();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.join();
    }
}
