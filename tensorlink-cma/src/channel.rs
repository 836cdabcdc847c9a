//! The CMA channel.
//!
//! Payload bytes never touch the connection. A send publishes the
//! buffer's address in the descriptor; the receiving side pulls the bytes
//! straight out of the sender's address space through the context's copy
//! worker and then posts a notification packet, which is what completes
//! the send. The connection only ever carries notifications.

use std::sync::{Arc, Mutex};

use tensorlink::callback::{
    closing_thunk, wrap_eager, wrap_lazy, CallbackSubject, ClosingReceiver,
};
use tensorlink::channel::{CompletionCallback, DescriptorCallback};
use tensorlink::connection::{Connection, RecvBuffer, SendBuffer};
use tensorlink::encoding::Packet;
use tensorlink::error::{Error, Result};
use tensorlink::task_loop::TaskLoop;
use tensorlink::Descriptor;

use crate::context::ContextInner;
use crate::encoding::{self, CmaDescriptor};

struct SendOperation {
    id: u64,
    on_complete: CompletionCallback,
}

struct RecvOperation {
    id: u64,
    on_complete: CompletionCallback,
}

struct CmaState {
    error: Option<Error>,
    next_id: u64,
    send_ops: Vec<SendOperation>,
    recv_ops: Vec<RecvOperation>,
    closing: Option<ClosingReceiver>,
}

struct CmaChannelCore<C: Connection> {
    connection: C,
    context: Arc<ContextInner>,
    task_loop: TaskLoop,
    state: Mutex<CmaState>,
}

/// A tensor-exchange endpoint whose payloads move by cross-process read.
pub struct CmaChannel<C: Connection> {
    core: Arc<CmaChannelCore<C>>,
}

impl<C: Connection> CmaChannel<C> {
    pub(crate) fn new(context: &Arc<ContextInner>, connection: C) -> Self {
        let core = Arc::new(CmaChannelCore {
            connection,
            context: Arc::clone(context),
            task_loop: TaskLoop::new(),
            state: Mutex::new(CmaState {
                error: None,
                next_id: 0,
                send_ops: Vec::new(),
                recv_ops: Vec::new(),
                closing: None,
            }),
        });
        let init_core = Arc::clone(&core);
        core.task_loop
            .defer(move || CmaChannelCore::init_from_loop(&init_core));
        Self { core }
    }

    /// Registers a send operation for `buffer` and produces a descriptor
    /// naming its address. The buffer must stay valid (and unchanged)
    /// until `on_complete` fires; the peer reads it remotely.
    pub fn send(
        &self,
        buffer: SendBuffer,
        on_descriptor: impl FnOnce(Result<Descriptor>) + Send + 'static,
        on_complete: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let core = Arc::clone(&self.core);
        self.core.task_loop.defer(move || {
            CmaChannelCore::send_from_loop(
                &core,
                buffer,
                Box::new(on_descriptor),
                Box::new(on_complete),
            );
        });
    }

    /// Pulls the payload named by `descriptor` into `buffer`.
    pub fn recv(
        &self,
        descriptor: Descriptor,
        buffer: RecvBuffer,
        on_complete: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let core = Arc::clone(&self.core);
        self.core.task_loop.defer(move || {
            CmaChannelCore::recv_from_loop(&core, descriptor, buffer, Box::new(on_complete));
        });
    }

    /// Closes the channel. Idempotent.
    pub fn close(&self) {
        CmaChannelCore::close(&self.core);
    }
}

impl<C: Connection> Drop for CmaChannel<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: Connection> CmaChannelCore<C> {
    fn init_from_loop(core: &Arc<Self>) {
        let receiver = ClosingReceiver::new(core.context.emitter(), closing_thunk(core, Self::close));
        core.state.lock().unwrap().closing = Some(receiver);
        Self::arm_packet_read(core);
    }

    fn close(core: &Arc<Self>) {
        let task_core = Arc::clone(core);
        core.task_loop
            .defer(move || Self::fail_from_loop(&task_core, Error::ChannelClosed));
    }

    fn fail_from_loop(core: &Arc<Self>, error: Error) {
        if core.record_error(error) {
            Self::handle_error(core);
        }
    }

    fn arm_packet_read(core: &Arc<Self>) {
        let on_packet = wrap_lazy(core, |core, packet| Self::on_packet(core, packet));
        core.connection.read_packet(Box::new(on_packet));
    }

    fn on_packet(core: &Arc<Self>, packet: Packet) {
        match packet {
            Packet::Notification { operation_id } => Self::on_notification(core, operation_id),
            Packet::Request { .. } | Packet::Reply { .. } => {
                Self::fail_from_loop(
                    core,
                    Error::Protocol("packet is not a notification".to_string()),
                );
            }
        }
        if core.sticky_error().is_none() {
            Self::arm_packet_read(core);
        }
    }

    /// The peer finished copying the payload of send operation `id`.
    fn on_notification(core: &Arc<Self>, id: u64) {
        let completion = {
            let mut state = core.state.lock().unwrap();
            match state.send_ops.iter().position(|op| op.id == id) {
                Some(index) => {
                    let op = state.send_ops.remove(index);
                    Some((op.on_complete, state.error.clone()))
                }
                None => None,
            }
        };
        match completion {
            Some((on_complete, error)) => on_complete(match error {
                Some(error) => Err(error),
                None => Ok(()),
            }),
            None => {
                Self::fail_from_loop(
                    core,
                    Error::Protocol(format!("no send operation with id {}", id)),
                );
            }
        }
    }

    fn send_from_loop(
        core: &Arc<Self>,
        buffer: SendBuffer,
        on_descriptor: DescriptorCallback,
        on_complete: CompletionCallback,
    ) {
        let mut state = core.state.lock().unwrap();
        if let Some(error) = state.error.clone() {
            drop(state);
            on_descriptor(Err(error.clone()));
            on_complete(Err(error));
            return;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.send_ops.push(SendOperation { id, on_complete });
        drop(state);

        let descriptor = CmaDescriptor {
            operation_id: id,
            pid: nix::unistd::getpid().as_raw(),
            addr: buffer.as_ptr() as u64,
            len: buffer.len() as u64,
        };
        on_descriptor(Ok(encoding::encode_descriptor(&descriptor)));
    }

    fn recv_from_loop(
        core: &Arc<Self>,
        descriptor: Descriptor,
        buffer: RecvBuffer,
        on_complete: CompletionCallback,
    ) {
        let mut state = core.state.lock().unwrap();
        if let Some(error) = state.error.clone() {
            drop(state);
            on_complete(Err(error));
            return;
        }
        let parsed = match encoding::decode_descriptor(&descriptor) {
            Ok(parsed) if parsed.len != buffer.len() as u64 => Err(Error::Protocol(format!(
                "descriptor names {} bytes but the target buffer holds {}",
                parsed.len,
                buffer.len()
            ))),
            other => other,
        };
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(error) => {
                drop(state);
                on_complete(Err(error.clone()));
                Self::fail_from_loop(core, error);
                return;
            }
        };
        let id = parsed.operation_id;
        state.recv_ops.push(RecvOperation { id, on_complete });
        drop(state);

        // The copy worker releases the buffer through this callback, so
        // it must keep the channel alive and run even on error.
        let on_copied = wrap_eager(core, move |core| Self::copy_finished(core, id));
        core.context
            .request_copy(parsed.pid, parsed.addr, buffer, Box::new(on_copied));
    }

    /// The worker finished (or failed) the copy for recv operation `id`.
    fn copy_finished(core: &Arc<Self>, id: u64) {
        if core.sticky_error().is_none() {
            // Let the peer know its buffer can be released.
            core.connection.write_packet(
                Packet::Notification { operation_id: id },
                Box::new(wrap_lazy(core, |_core, _: ()| {})),
            );
        }
        let completion = {
            let mut state = core.state.lock().unwrap();
            match state.recv_ops.iter().position(|op| op.id == id) {
                Some(index) => {
                    let op = state.recv_ops.remove(index);
                    Some((op.on_complete, state.error.clone()))
                }
                // Already drained by the error path.
                None => None,
            }
        };
        if let Some((on_complete, error)) = completion {
            on_complete(match error {
                Some(error) => Err(error),
                None => Ok(()),
            });
        }
    }
}

impl<C: Connection> CallbackSubject for CmaChannelCore<C> {
    fn task_loop(&self) -> &TaskLoop {
        &self.task_loop
    }

    fn sticky_error(&self) -> Option<Error> {
        self.state.lock().unwrap().error.clone()
    }

    fn record_error(&self, error: Error) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.error.is_some() {
            return false;
        }
        state.error = Some(error);
        true
    }

    fn handle_error(this: &Arc<Self>) {
        let (error, send_ops, recv_ops) = {
            let mut state = this.state.lock().unwrap();
            let error = state.error.clone().unwrap_or(Error::ChannelClosed);
            (
                error,
                std::mem::take(&mut state.send_ops),
                std::mem::take(&mut state.recv_ops),
            )
        };
        tracing::debug!("cma channel entering error state: {}", error);

        this.connection.close();

        for op in send_ops {
            (op.on_complete)(Err(error.clone()));
        }
        for op in recv_ops {
            (op.on_complete)(Err(error.clone()));
        }
    }
}
