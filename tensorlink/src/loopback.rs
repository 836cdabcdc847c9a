//! In-process connection pair.
//!
//! [`pair`] returns two connected [`Connection`] endpoints backed by a
//! mutexed duplex queue. This is the transport used to wire two channel
//! endpoints living in the same process (and the workhorse of the test
//! suites): frames written on one side are read on the other in FIFO
//! order, packet and byte frames interleaved exactly as written.
//!
//! Closing either endpoint kills the pair: every pending read on both
//! sides aborts, and later operations fail with
//! [`Error::ConnectionClosed`]. A byte read that already consumed part of
//! its payload when the connection dies aborts with [`Error::ShortRead`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::connection::{Connection, IoCallback, PacketCallback, RecvBuffer, SendBuffer};
use crate::encoding::Packet;
use crate::error::Error;

/// Creates a connected pair of in-process endpoints.
pub fn pair() -> (LoopbackConnection, LoopbackConnection) {
    let shared = Arc::new(Mutex::new(PairState {
        a_to_b: DirectionState::new(),
        b_to_a: DirectionState::new(),
        closed: false,
    }));
    (
        LoopbackConnection {
            shared: Arc::clone(&shared),
            side: Side::A,
        },
        LoopbackConnection { shared, side: Side::B },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

enum Frame {
    Packet(Packet),
    Bytes { data: Vec<u8>, offset: usize },
}

enum PendingRead {
    Packet(PacketCallback),
    Bytes {
        buffer: RecvBuffer,
        filled: usize,
        on_done: IoCallback,
    },
}

/// A callback due to fire, staged so it runs outside the pair mutex.
enum Completion {
    Packet(PacketCallback, crate::error::Result<Packet>),
    Io(IoCallback, crate::error::Result<()>),
}

impl Completion {
    fn fire(self) {
        match self {
            Completion::Packet(on_done, result) => on_done(result),
            Completion::Io(on_done, result) => on_done(result),
        }
    }
}

struct DirectionState {
    frames: VecDeque<Frame>,
    pending: VecDeque<PendingRead>,
}

impl DirectionState {
    fn new() -> Self {
        Self {
            frames: VecDeque::new(),
            pending: VecDeque::new(),
        }
    }

    /// Matches pending reads against queued frames, staging completions.
    fn service(&mut self, completions: &mut Vec<Completion>) {
        while let Some(pending) = self.pending.pop_front() {
            match pending {
                PendingRead::Packet(on_done) => match self.frames.pop_front() {
                    Some(Frame::Packet(packet)) => {
                        completions.push(Completion::Packet(on_done, Ok(packet)));
                    }
                    Some(frame @ Frame::Bytes { .. }) => {
                        self.frames.push_front(frame);
                        completions.push(Completion::Packet(
                            on_done,
                            Err(Error::Protocol(
                                "expected a packet on the stream".to_string(),
                            )),
                        ));
                    }
                    None => {
                        self.pending.push_front(PendingRead::Packet(on_done));
                        return;
                    }
                },
                PendingRead::Bytes {
                    buffer,
                    mut filled,
                    on_done,
                } => loop {
                    if filled == buffer.len() {
                        completions.push(Completion::Io(on_done, Ok(())));
                        break;
                    }
                    match self.frames.front_mut() {
                        Some(Frame::Bytes { data, offset }) => {
                            let take = (buffer.len() - filled).min(data.len() - *offset);
                            // SAFETY: the reader guaranteed the buffer
                            // stays valid until its completion fires, and
                            // it has not fired yet.
                            unsafe {
                                std::ptr::copy_nonoverlapping(
                                    data.as_ptr().add(*offset),
                                    buffer.as_mut_ptr().add(filled),
                                    take,
                                );
                            }
                            *offset += take;
                            filled += take;
                            if *offset == data.len() {
                                self.frames.pop_front();
                            }
                        }
                        Some(Frame::Packet(_)) => {
                            completions.push(Completion::Io(
                                on_done,
                                Err(Error::Protocol(
                                    "expected payload bytes on the stream".to_string(),
                                )),
                            ));
                            break;
                        }
                        None => {
                            self.pending.push_front(PendingRead::Bytes {
                                buffer,
                                filled,
                                on_done,
                            });
                            return;
                        }
                    }
                },
            }
        }
    }

    /// Aborts every pending read, e.g. on close.
    fn abort_pending(&mut self, completions: &mut Vec<Completion>) {
        while let Some(pending) = self.pending.pop_front() {
            match pending {
                PendingRead::Packet(on_done) => {
                    completions.push(Completion::Packet(on_done, Err(Error::ConnectionClosed)));
                }
                PendingRead::Bytes {
                    buffer,
                    filled,
                    on_done,
                } => {
                    let error = if filled > 0 {
                        Error::ShortRead {
                            expected: buffer.len(),
                            got: filled,
                        }
                    } else {
                        Error::ConnectionClosed
                    };
                    completions.push(Completion::Io(on_done, Err(error)));
                }
            }
        }
    }
}

struct PairState {
    a_to_b: DirectionState,
    b_to_a: DirectionState,
    closed: bool,
}

impl PairState {
    fn outbound(&mut self, side: Side) -> &mut DirectionState {
        match side {
            Side::A => &mut self.a_to_b,
            Side::B => &mut self.b_to_a,
        }
    }

    fn inbound(&mut self, side: Side) -> &mut DirectionState {
        match side {
            Side::A => &mut self.b_to_a,
            Side::B => &mut self.a_to_b,
        }
    }
}

/// One endpoint of an in-process connection pair.
///
/// Cloning yields another handle to the same endpoint.
#[derive(Clone)]
pub struct LoopbackConnection {
    shared: Arc<Mutex<PairState>>,
    side: Side,
}

impl Connection for LoopbackConnection {
    fn read_packet(&self, on_done: PacketCallback) {
        let mut completions = Vec::new();
        {
            let mut state = self.shared.lock().unwrap();
            if state.closed {
                completions.push(Completion::Packet(on_done, Err(Error::ConnectionClosed)));
            } else {
                let inbound = state.inbound(self.side);
                inbound.pending.push_back(PendingRead::Packet(on_done));
                inbound.service(&mut completions);
            }
        }
        for completion in completions {
            completion.fire();
        }
    }

    fn read_exact(&self, buffer: RecvBuffer, on_done: IoCallback) {
        let mut completions = Vec::new();
        {
            let mut state = self.shared.lock().unwrap();
            if state.closed {
                completions.push(Completion::Io(on_done, Err(Error::ConnectionClosed)));
            } else {
                let inbound = state.inbound(self.side);
                inbound.pending.push_back(PendingRead::Bytes {
                    buffer,
                    filled: 0,
                    on_done,
                });
                inbound.service(&mut completions);
            }
        }
        for completion in completions {
            completion.fire();
        }
    }

    fn write_packet(&self, packet: Packet, on_done: IoCallback) {
        let mut completions = Vec::new();
        {
            let mut state = self.shared.lock().unwrap();
            if state.closed {
                completions.push(Completion::Io(on_done, Err(Error::ConnectionClosed)));
            } else {
                let outbound = state.outbound(self.side);
                outbound.frames.push_back(Frame::Packet(packet));
                outbound.service(&mut completions);
                completions.push(Completion::Io(on_done, Ok(())));
            }
        }
        for completion in completions {
            completion.fire();
        }
    }

    fn write_exact(&self, buffer: SendBuffer, on_done: IoCallback) {
        let mut completions = Vec::new();
        {
            let mut state = self.shared.lock().unwrap();
            if state.closed {
                completions.push(Completion::Io(on_done, Err(Error::ConnectionClosed)));
            } else {
                // The handoff copies: completion of a write only promises
                // the transport took the bytes.
                // SAFETY: the writer guaranteed the buffer is valid until
                // its completion fires.
                let data =
                    unsafe { std::slice::from_raw_parts(buffer.as_ptr(), buffer.len()) }.to_vec();
                let outbound = state.outbound(self.side);
                if !data.is_empty() {
                    outbound.frames.push_back(Frame::Bytes { data, offset: 0 });
                    outbound.service(&mut completions);
                }
                completions.push(Completion::Io(on_done, Ok(())));
            }
        }
        for completion in completions {
            completion.fire();
        }
    }

    fn close(&self) {
        let mut completions = Vec::new();
        {
            let mut state = self.shared.lock().unwrap();
            if !state.closed {
                state.closed = true;
                state.a_to_b.abort_pending(&mut completions);
                state.b_to_a.abort_pending(&mut completions);
            }
        }
        for completion in completions {
            completion.fire();
        }
    }
}

/// Writes a partial byte frame on this endpoint, bypassing the
/// exact-length contract. Lets tests stage a peer that dies mid-payload.
#[doc(hidden)]
pub fn write_raw_bytes(connection: &LoopbackConnection, data: &[u8]) {
    let mut completions = Vec::new();
    {
        let mut state = connection.shared.lock().unwrap();
        if !state.closed && !data.is_empty() {
            let outbound = state.outbound(connection.side);
            outbound.frames.push_back(Frame::Bytes {
                data: data.to_vec(),
                offset: 0,
            });
            outbound.service(&mut completions);
        }
    }
    for completion in completions {
        completion.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::mpsc;
    use std::time::Duration;

    fn recv_result<T>(rx: &mpsc::Receiver<T>) -> T {
        rx.recv_timeout(Duration::from_secs(1))
            .expect("callback did not fire")
    }

    #[test]
    fn test_packet_write_then_read() {
        let (a, b) = pair();
        let (tx, rx) = mpsc::channel();
        a.write_packet(Packet::Request { operation_id: 3 }, Box::new(|_result| {}));
        b.read_packet(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        assert_eq!(recv_result(&rx).unwrap(), Packet::Request { operation_id: 3 });
    }

    #[test]
    fn test_packet_read_then_write() {
        let (a, b) = pair();
        let (tx, rx) = mpsc::channel();
        b.read_packet(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        a.write_packet(Packet::Reply { operation_id: 9 }, Box::new(|_result| {}));
        assert_eq!(recv_result(&rx).unwrap(), Packet::Reply { operation_id: 9 });
    }

    #[test]
    fn test_bytes_roundtrip() {
        let (a, b) = pair();
        let payload = b"HELLO".to_vec();
        let send = unsafe { SendBuffer::new(payload.as_ptr(), payload.len()) };
        a.write_exact(send, Box::new(|_result| {}));

        let mut out = vec![0u8; 5];
        let recv = unsafe { RecvBuffer::new(out.as_mut_ptr(), out.len()) };
        let (tx, rx) = mpsc::channel();
        b.read_exact(
            recv,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        recv_result(&rx).unwrap();
        assert_eq!(out, b"HELLO");
    }

    #[test]
    fn test_read_spans_two_writes() {
        let (a, b) = pair();
        let first = b"HEL".to_vec();
        let second = b"LO".to_vec();
        let mut out = vec![0u8; 5];
        let recv = unsafe { RecvBuffer::new(out.as_mut_ptr(), out.len()) };
        let (tx, rx) = mpsc::channel();
        b.read_exact(
            recv,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let buf = unsafe { SendBuffer::new(first.as_ptr(), first.len()) };
        a.write_exact(buf, Box::new(|_result| {}));
        assert!(rx.try_recv().is_err());
        let buf = unsafe { SendBuffer::new(second.as_ptr(), second.len()) };
        a.write_exact(buf, Box::new(|_result| {}));
        recv_result(&rx).unwrap();
        assert_eq!(out, b"HELLO");
    }

    #[test]
    fn test_close_aborts_pending_read() {
        let (a, b) = pair();
        let (tx, rx) = mpsc::channel();
        b.read_packet(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        a.close();
        assert_eq!(recv_result(&rx), Err(Error::ConnectionClosed));
    }

    #[test]
    fn test_close_with_partial_payload_is_short_read() {
        let (a, b) = pair();
        let mut out = vec![0u8; 8];
        let recv = unsafe { RecvBuffer::new(out.as_mut_ptr(), out.len()) };
        let (tx, rx) = mpsc::channel();
        b.read_exact(
            recv,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        write_raw_bytes(&a, b"abc");
        a.close();
        assert_eq!(
            recv_result(&rx),
            Err(Error::ShortRead {
                expected: 8,
                got: 3
            })
        );
    }

    #[test]
    fn test_operations_after_close_fail() {
        let (a, b) = pair();
        b.close();
        let (tx, rx) = mpsc::channel::<Result<()>>();
        a.write_packet(
            Packet::Request { operation_id: 0 },
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        assert_eq!(recv_result(&rx), Err(Error::ConnectionClosed));
    }

    #[test]
    fn test_close_idempotent() {
        let (a, _b) = pair();
        a.close();
        a.close();
    }

    #[test]
    fn test_fifo_across_frame_kinds() {
        let (a, b) = pair();
        a.write_packet(Packet::Reply { operation_id: 1 }, Box::new(|_result| {}));
        let payload = b"DATA".to_vec();
        let buf = unsafe { SendBuffer::new(payload.as_ptr(), payload.len()) };
        a.write_exact(buf, Box::new(|_result| {}));

        let (ptx, prx) = mpsc::channel();
        b.read_packet(Box::new(move |result| {
            let _ = ptx.send(result);
        }));
        assert_eq!(recv_result(&prx).unwrap(), Packet::Reply { operation_id: 1 });

        let mut out = vec![0u8; 4];
        let recv = unsafe { RecvBuffer::new(out.as_mut_ptr(), out.len()) };
        let (tx, rx) = mpsc::channel();
        b.read_exact(
            recv,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        recv_result(&rx).unwrap();
        assert_eq!(out, b"DATA");
    }
}
