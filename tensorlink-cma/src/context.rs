//! The CMA channel context.
//!
//! One worker thread owns the kernel copies. Channels enqueue
//! [`CopyRequest`]s into an unbounded FIFO mailbox; the worker pops one at
//! a time and performs a single-segment `process_vm_readv`. A kernel copy
//! is synchronous and CPU-bound, so serialising through one thread bounds
//! resource usage and yields FIFO completion for free.

use std::io::IoSliceMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;

use tensorlink::callback::ClosingEmitter;
use tensorlink::channel::{ChannelContext, CompletionCallback};
use tensorlink::connection::{Connection, Endpoint, RecvBuffer};
use tensorlink::error::{Error, Result};

use crate::channel::CmaChannel;
use crate::identity::Identity;

/// One queued bulk copy.
pub(crate) struct CopyRequest {
    pub remote_pid: i32,
    pub remote_addr: u64,
    pub buffer: RecvBuffer,
    pub on_complete: CompletionCallback,
}

/// Maps a `process_vm_readv` outcome onto the error model.
fn classify_copy(result: nix::Result<usize>, expected: usize) -> Result<()> {
    match result {
        Err(errno) => Err(Error::system("cma", errno)),
        Ok(got) if got < expected => Err(Error::ShortRead { expected, got }),
        Ok(_) => Ok(()),
    }
}

fn copy_once(request: &CopyRequest) -> Result<()> {
    // SAFETY: the recv-buffer contract guarantees the region stays valid
    // and untouched by the caller until the completion fires.
    let local = unsafe {
        std::slice::from_raw_parts_mut(request.buffer.as_mut_ptr(), request.buffer.len())
    };
    let mut local_iov = [IoSliceMut::new(local)];
    let remote_iov = [RemoteIoVec {
        base: request.remote_addr as usize,
        len: request.buffer.len(),
    }];
    let result = process_vm_readv(
        Pid::from_raw(request.remote_pid),
        &mut local_iov,
        &remote_iov,
    );
    classify_copy(result, request.buffer.len())
}

fn run_worker(receiver: mpsc::Receiver<CopyRequest>) {
    // The mailbox delivers everything queued before the disconnect, so
    // dropping the sender acts as the tombstone.
    while let Ok(request) = receiver.recv() {
        let result = copy_once(&request);
        (request.on_complete)(result);
    }
}

pub(crate) struct ContextInner {
    domain_descriptor: String,
    requests: Mutex<Option<mpsc::Sender<CopyRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    joined: AtomicBool,
    emitter: Arc<ClosingEmitter>,
}

impl ContextInner {
    pub(crate) fn emitter(&self) -> &Arc<ClosingEmitter> {
        &self.emitter
    }

    pub(crate) fn request_copy(
        &self,
        remote_pid: i32,
        remote_addr: u64,
        buffer: RecvBuffer,
        on_complete: CompletionCallback,
    ) {
        let requests = self.requests.lock().unwrap();
        match &*requests {
            Some(sender) => {
                // The worker outlives every sender, so this cannot fail.
                let _ = sender.send(CopyRequest {
                    remote_pid,
                    remote_addr,
                    buffer,
                    on_complete,
                });
            }
            None => {
                drop(requests);
                on_complete(Err(Error::ChannelClosed));
            }
        }
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.emitter.close();
            // The tombstone: the worker drains what was queued first,
            // then observes the disconnect and exits.
            *self.requests.lock().unwrap() = None;
        }
    }

    pub(crate) fn join(&self) {
        self.close();
        if !self.joined.swap(true, Ordering::AcqRel) {
            let worker = self.worker.lock().unwrap().take();
            if let Some(worker) = worker {
                if worker.join().is_err() {
                    tracing::warn!("cma copy worker panicked");
                }
            }
        }
    }

    fn joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }
}

/// Per-process factory and lifetime owner for CMA channels.
pub struct CmaContext {
    inner: Arc<ContextInner>,
}

impl CmaContext {
    /// Creates a context with the identity of the running process.
    pub fn new() -> Result<Self> {
        Self::with_identity(Identity::system()?)
    }

    /// Creates a context with an explicit identity. Domain matching tests
    /// inject fakes through this; the copies themselves are unaffected.
    pub fn with_identity(identity: Identity) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("tensorlink-cma".to_string())
            .spawn(move || run_worker(receiver))
            .map_err(|err| Error::system_io("thread", &err))?;
        Ok(Self {
            inner: Arc::new(ContextInner {
                domain_descriptor: identity.domain_descriptor(),
                requests: Mutex::new(Some(sender)),
                worker: Mutex::new(Some(worker)),
                closed: AtomicBool::new(false),
                joined: AtomicBool::new(false),
                emitter: Arc::new(ClosingEmitter::new()),
            }),
        })
    }

    /// Creates a channel over `connection`.
    ///
    /// # Panics
    /// Panics if the context was already joined.
    pub fn create_channel<C: Connection>(
        &self,
        connection: C,
        _endpoint: Endpoint,
    ) -> CmaChannel<C> {
        assert!(!self.inner.joined(), "context already joined");
        CmaChannel::new(&self.inner, connection)
    }

    /// Enqueues a bulk copy from `remote_pid`'s address space into
    /// `buffer`. Returns immediately; `on_complete` fires from the worker
    /// with success, `ShortRead` on a partial transfer, or `System` with
    /// the kernel's errno.
    pub fn request_copy(
        &self,
        remote_pid: i32,
        remote_addr: u64,
        buffer: RecvBuffer,
        on_complete: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        self.inner
            .request_copy(remote_pid, remote_addr, buffer, Box::new(on_complete));
    }
}

impl ChannelContext for CmaContext {
    fn domain_descriptor(&self) -> &str {
        &self.inner.domain_descriptor
    }

    fn closing_emitter(&self) -> &Arc<ClosingEmitter> {
        &self.inner.emitter
    }

    fn close(&self) {
        self.inner.close();
    }

    fn join(&self) {
        self.inner.join();
    }
}

impl Drop for CmaContext {
    fn drop(&mut self) {
        if !self.inner.joined() {
            tracing::warn!("cma context dropped without join(); joining in drop");
            self.inner.join();
        }
    }
}
