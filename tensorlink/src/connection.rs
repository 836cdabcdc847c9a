//! The transport connection capability seam.
//!
//! Channels are generic over [`Connection`]: a message-oriented reliable
//! duplex pipe that can read/write one protocol packet or an exact number
//! of raw bytes, and that aborts every in-flight callback with an error
//! when closed. The concrete transport (socket, shared-memory ring,
//! in-process queue) is invisible to the channel.

use crate::encoding::Packet;
use crate::error::Result;

/// Completion callback for byte-level reads and writes.
pub type IoCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Completion callback for packet reads.
pub type PacketCallback = Box<dyn FnOnce(Result<Packet>) + Send>;

/// A non-owning view of a caller buffer handed to `send`.
///
/// The caller keeps ownership and must keep the memory valid and unchanged
/// until the operation's completion callback fires; the library never
/// touches the buffer afterwards.
#[derive(Debug, Clone, Copy)]
pub struct SendBuffer {
    ptr: *const u8,
    len: usize,
}

impl SendBuffer {
    /// Wraps a raw caller buffer.
    ///
    /// # Safety
    /// `ptr` must point to `len` readable bytes that stay valid until the
    /// completion callback of the operation this buffer is passed to has
    /// fired.
    pub unsafe fn new(ptr: *const u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// SAFETY: the buffer is a borrowed view whose validity across threads is
// the caller's contract (see `SendBuffer::new`); the pointer itself is
// just an address.
unsafe impl Send for SendBuffer {}

/// A non-owning view of a writable caller buffer handed to `recv`.
///
/// Same ownership contract as [`SendBuffer`], and additionally the caller
/// must not read the contents until the completion callback fires.
#[derive(Debug, Clone, Copy)]
pub struct RecvBuffer {
    ptr: *mut u8,
    len: usize,
}

impl RecvBuffer {
    /// Wraps a raw writable caller buffer.
    ///
    /// # Safety
    /// `ptr` must point to `len` writable bytes that stay valid, and that
    /// the caller neither reads nor writes, until the completion callback
    /// of the operation this buffer is passed to has fired.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// SAFETY: see `SendBuffer`.
unsafe impl Send for RecvBuffer {}

/// Which side of the pipe created the channel. The protocol engines do not
/// currently distinguish the two, but transports may.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Listen,
    Connect,
}

/// A reliable, packet-framed duplex connection.
///
/// All operations are asynchronous and complete through their callback
/// exactly once. Within one connection, reads complete in the order they
/// were issued against the byte stream, and writes are transmitted in
/// issue order; the transport guarantees FIFO between the two endpoints.
/// `close` aborts every in-flight operation with an error; operations
/// issued after `close` fail the same way.
pub trait Connection: Send + Sync + 'static {
    /// Reads the next length-framed protocol packet.
    fn read_packet(&self, on_done: PacketCallback);

    /// Reads exactly `buffer.len()` bytes into the buffer, or fails.
    fn read_exact(&self, buffer: RecvBuffer, on_done: IoCallback);

    /// Writes one protocol packet.
    fn write_packet(&self, packet: Packet, on_done: IoCallback);

    /// Writes exactly `buffer.len()` bytes from the buffer, or fails.
    fn write_exact(&self, buffer: SendBuffer, on_done: IoCallback);

    /// Closes the connection, aborting in-flight operations.
    fn close(&self);
}
