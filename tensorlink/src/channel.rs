//! The basic channel: request/reply correlation over a reliable connection.
//!
//! `send` registers the caller's buffer and hands back a descriptor; no
//! bytes move until the peer's `recv` posts a `Request` naming the
//! operation. The sender answers with a `Reply` packet followed
//! immediately by the payload, and the connection's FIFO guarantee makes
//! the peer's exact-length read consume precisely that payload. Sends and
//! recvs may be posted in any order on either side; pairing is purely by
//! operation id.
//!
//! This is the reference channel: metadata and payload both ride the
//! connection. Faster channels (e.g. cross-process memory access) keep
//! the same out-of-band descriptor shape and move the payload elsewhere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::callback::{
    closing_thunk, wrap_eager, wrap_lazy, CallbackSubject, ClosingEmitter, ClosingReceiver,
};
use crate::connection::{Connection, Endpoint, RecvBuffer, SendBuffer};
use crate::encoding::{self, Descriptor, Packet};
use crate::error::{Error, Result};
use crate::task_loop::TaskLoop;

/// Completion callback for a send or recv operation.
pub type CompletionCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Callback receiving the descriptor produced by a send operation.
pub type DescriptorCallback = Box<dyn FnOnce(Result<Descriptor>) + Send>;

/// The part of the context contract channels and their owners share,
/// regardless of channel kind.
pub trait ChannelContext {
    /// Two contexts can pair their channels iff their domain descriptors
    /// compare byte-equal.
    fn domain_descriptor(&self) -> &str;

    /// The close fan-out subordinate objects subscribe to.
    fn closing_emitter(&self) -> &Arc<ClosingEmitter>;

    /// Closes the context and every subordinate object. Idempotent.
    fn close(&self);

    /// Closes, then waits for any context-owned resources to wind down.
    fn join(&self);
}

struct SendOperation {
    id: u64,
    buffer: SendBuffer,
    on_complete: CompletionCallback,
}

struct RecvOperation {
    id: u64,
    buffer: RecvBuffer,
    on_complete: CompletionCallback,
}

struct ChannelState {
    error: Option<Error>,
    next_id: u64,
    send_ops: Vec<SendOperation>,
    recv_ops: Vec<RecvOperation>,
    /// Keeps the subscription to the owning context alive; dropped (and
    /// thereby unsubscribed) together with the core.
    closing: Option<ClosingReceiver>,
}

struct ChannelCore<C: Connection> {
    connection: C,
    task_loop: TaskLoop,
    state: Mutex<ChannelState>,
}

/// A single bidirectional tensor-exchange endpoint over one connection.
pub struct BasicChannel<C: Connection> {
    core: Arc<ChannelCore<C>>,
}

impl<C: Connection> BasicChannel<C> {
    fn new(emitter: &Arc<ClosingEmitter>, connection: C) -> Self {
        let core = Arc::new(ChannelCore {
            connection,
            task_loop: TaskLoop::new(),
            state: Mutex::new(ChannelState {
                error: None,
                next_id: 0,
                send_ops: Vec::new(),
                recv_ops: Vec::new(),
                closing: None,
            }),
        });
        let init_core = Arc::clone(&core);
        let emitter = Arc::clone(emitter);
        core.task_loop
            .defer(move || ChannelCore::init_from_loop(&init_core, &emitter));
        Self { core }
    }

    /// Registers a send operation for `buffer`.
    ///
    /// `on_descriptor` fires with the descriptor bytes to hand to the
    /// peer out of band; `on_complete` fires once the payload has been
    /// fully handed to the transport, or with the channel's sticky error.
    /// The buffer must stay valid until `on_complete` fires.
    pub fn send(
        &self,
        buffer: SendBuffer,
        on_descriptor: impl FnOnce(Result<Descriptor>) + Send + 'static,
        on_complete: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let core = Arc::clone(&self.core);
        self.core.task_loop.defer(move || {
            ChannelCore::send_from_loop(
                &core,
                buffer,
                Box::new(on_descriptor),
                Box::new(on_complete),
            );
        });
    }

    /// Registers a recv operation pairing with the peer send that
    /// produced `descriptor`, targeting `buffer`.
    ///
    /// The buffer must stay valid (and untouched) until `on_complete`
    /// fires.
    pub fn recv(
        &self,
        descriptor: Descriptor,
        buffer: RecvBuffer,
        on_complete: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let core = Arc::clone(&self.core);
        self.core.task_loop.defer(move || {
            ChannelCore::recv_from_loop(&core, descriptor, buffer, Box::new(on_complete));
        });
    }

    /// Closes the channel. Pending operations complete with
    /// [`Error::ChannelClosed`]; further sends and recvs fail fast with
    /// the sticky error. Idempotent.
    pub fn close(&self) {
        ChannelCore::close(&self.core);
    }
}

impl<C: Connection> Drop for BasicChannel<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: Connection> ChannelCore<C> {
    fn init_from_loop(core: &Arc<Self>, emitter: &Arc<ClosingEmitter>) {
        let receiver = ClosingReceiver::new(emitter, closing_thunk(core, Self::close));
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

    /// Arms the single outstanding packet read.
    fn arm_packet_read(core: &Arc<Self>) {
        let on_packet = wrap_lazy(core, |core, packet| Self::on_packet(core, packet));
        core.connection.read_packet(Box::new(on_packet));
    }

    fn on_packet(core: &Arc<Self>, packet: Packet) {
        match packet {
            Packet::Request { operation_id } => Self::on_request(core, operation_id),
            Packet::Reply { operation_id } => Self::on_reply(core, operation_id),
            Packet::Notification { .. } => {
                Self::fail_from_loop(
                    core,
                    Error::Protocol("packet is not a request nor a reply".to_string()),
                );
            }
        }
        // Wait for the next packet, unless a handler just errored out.
        if core.sticky_error().is_none() {
            Self::arm_packet_read(core);
        }
    }

    /// The peer posted its recv and asks for the payload of `id`.
    fn on_request(core: &Arc<Self>, id: u64) {
        let buffer = {
            let state = core.state.lock().unwrap();
            state
                .send_ops
                .iter()
                .find(|op| op.id == id)
                .map(|op| op.buffer)
        };
        let buffer = match buffer {
            Some(buffer) => buffer,
            None => {
                Self::fail_from_loop(
                    core,
                    Error::Protocol(format!("no send operation with id {}", id)),
                );
                return;
            }
        };

        // Announce the payload, then stream it. The connection preserves
        // write order, so the peer's exact-length read lines up.
        core.connection.write_packet(
            Packet::Reply { operation_id: id },
            Box::new(wrap_lazy(core, |_core, _: ()| {})),
        );
        core.connection.write_exact(
            buffer,
            Box::new(wrap_eager(core, move |core| Self::send_completed(core, id))),
        );
    }

    /// The peer announced the payload for recv operation `id`.
    fn on_reply(core: &Arc<Self>, id: u64) {
        let buffer = {
            let state = core.state.lock().unwrap();
            state
                .recv_ops
                .iter()
                .find(|op| op.id == id)
                .map(|op| op.buffer)
        };
        let buffer = match buffer {
            Some(buffer) => buffer,
            None => {
                Self::fail_from_loop(
                    core,
                    Error::Protocol(format!("no recv operation with id {}", id)),
                );
                return;
            }
        };

        core.connection.read_exact(
            buffer,
            Box::new(wrap_eager(core, move |core| Self::recv_completed(core, id))),
        );
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
            // Fail fast: the operation is still observed exactly once.
            on_descriptor(Err(error.clone()));
            on_complete(Err(error));
            return;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.send_ops.push(SendOperation {
            id,
            buffer,
            on_complete,
        });
        drop(state);

        // No network action yet: the descriptor travels out of band and
        // the peer's request pulls the payload.
        on_descriptor(Ok(encoding::encode_descriptor(id)));
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
        let id = match encoding::decode_descriptor(&descriptor) {
            Ok(id) => id,
            Err(error) => {
                drop(state);
                // A mangled descriptor is as fatal as an unknown id.
                on_complete(Err(error.clone()));
                Self::fail_from_loop(core, error);
                return;
            }
        };
        state.recv_ops.push(RecvOperation {
            id,
            buffer,
            on_complete,
        });
        drop(state);

        // Ask the peer to start streaming now that we have a target.
        core.connection.write_packet(
            Packet::Request { operation_id: id },
            Box::new(wrap_lazy(core, |_core, _: ()| {})),
        );
    }

    fn send_completed(core: &Arc<Self>, id: u64) {
        let completion = {
            let mut state = core.state.lock().unwrap();
            match state.send_ops.iter().position(|op| op.id == id) {
                Some(index) => {
                    let op = state.send_ops.remove(index);
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

    fn recv_completed(core: &Arc<Self>, id: u64) {
        let completion = {
            let mut state = core.state.lock().unwrap();
            match state.recv_ops.iter().position(|op| op.id == id) {
                Some(index) => {
                    let op = state.recv_ops.remove(index);
                    Some((op.on_complete, state.error.clone()))
                }
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

impl<C: Connection> CallbackSubject for ChannelCore<C> {
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
        tracing::debug!("basic channel entering error state: {}", error);

        // Closing the connection aborts whatever transport operations are
        // still in flight; their wrapped callbacks observe the sticky
        // error and stand down.
        this.connection.close();

        // Flush every outstanding operation with the sticky error, in
        // arrival order. Late transport completions for these ids find
        // nothing and do nothing.
        for op in send_ops {
            (op.on_complete)(Err(error.clone()));
        }
        for op in recv_ops {
            (op.on_complete)(Err(error.clone()));
        }
    }
}

/// Factory and lifetime owner for [`BasicChannel`]s.
pub struct BasicContext {
    domain_descriptor: String,
    emitter: Arc<ClosingEmitter>,
    closed: AtomicBool,
}

impl BasicContext {
    pub fn new() -> Self {
        Self {
            // The basic channel works between any two processes that can
            // share a connection.
            domain_descriptor: "any".to_string(),
            emitter: Arc::new(ClosingEmitter::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn create_channel<C: Connection>(
        &self,
        connection: C,
        _endpoint: Endpoint,
    ) -> BasicChannel<C> {
        BasicChannel::new(&self.emitter, connection)
    }
}

impl Default for BasicContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelContext for BasicContext {
    fn domain_descriptor(&self) -> &str {
        &self.domain_descriptor
    }

    fn closing_emitter(&self) -> &Arc<ClosingEmitter> {
        &self.emitter
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.emitter.close();
        }
    }

    fn join(&self) {
        // The basic context owns no threads; closing is all there is.
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::decode_descriptor;
    use crate::loopback;
    use std::sync::mpsc;
    use std::time::Duration;

    fn descriptor_of(
        channel: &BasicChannel<loopback::LoopbackConnection>,
        buffer: SendBuffer,
    ) -> (Descriptor, mpsc::Receiver<Result<()>>) {
        let (desc_tx, desc_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        channel.send(
            buffer,
            move |descriptor| {
                let _ = desc_tx.send(descriptor);
            },
            move |result| {
                let _ = done_tx.send(result);
            },
        );
        let descriptor = desc_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("descriptor callback did not fire")
            .expect("descriptor callback failed");
        (descriptor, done_rx)
    }

    #[test]
    fn test_descriptor_ids_increase() {
        let context = BasicContext::new();
        let (a, _b) = loopback::pair();
        let channel = context.create_channel(a, Endpoint::Connect);
        let payload = [0u8; 4];
        let buffer = unsafe { SendBuffer::new(payload.as_ptr(), payload.len()) };
        let (first, _rx1) = descriptor_of(&channel, buffer);
        let (second, _rx2) = descriptor_of(&channel, buffer);
        assert_eq!(decode_descriptor(&first).unwrap(), 0);
        assert_eq!(decode_descriptor(&second).unwrap(), 1);
        channel.close();
    }

    #[test]
    fn test_send_fails_fast_after_close() {
        let context = BasicContext::new();
        let (a, _b) = loopback::pair();
        let channel = context.create_channel(a, Endpoint::Connect);
        channel.close();

        let payload = [0u8; 4];
        let buffer = unsafe { SendBuffer::new(payload.as_ptr(), payload.len()) };
        let (desc_tx, desc_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        channel.send(
            buffer,
            move |descriptor| {
                let _ = desc_tx.send(descriptor);
            },
            move |result| {
                let _ = done_tx.send(result);
            },
        );
        assert_eq!(
            desc_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Err(Error::ChannelClosed)
        );
        assert_eq!(
            done_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Err(Error::ChannelClosed)
        );
    }

    #[test]
    fn test_context_close_closes_channels() {
        let context = BasicContext::new();
        let (a, _b) = loopback::pair();
        let channel = context.create_channel(a, Endpoint::Connect);

        let payload = [7u8; 16];
        let buffer = unsafe { SendBuffer::new(payload.as_ptr(), payload.len()) };
        let (_descriptor, done_rx) = descriptor_of(&channel, buffer);

        context.close();
        assert_eq!(
            done_rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Err(Error::ChannelClosed)
        );
    }
}
