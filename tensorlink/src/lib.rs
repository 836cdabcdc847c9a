//! tensorlink - point-to-point tensor exchange over pluggable transports.
//!
//! A tensor exchange is split in two: a small out-of-band *descriptor*
//! (correlation metadata, moved by whatever control plane connects the two
//! processes) and the in-band *payload* (the bulk bytes, moved by the
//! fastest path the two endpoints share).
//!
//! ```text
//!   sender                                   receiver
//!   ──────                                   ────────
//!   send(buf) ──descriptor──▶ (out of band) ──▶ recv(descriptor, buf)
//!        ▲                                        │
//!        │          Request { id }                │
//!        │◀───────────────────────────────────────┘
//!        │          Reply { id } + payload
//!        └───────────────────────────────────────▶│
//!                                                 ▼
//!                                          completion callbacks
//! ```
//!
//! This crate holds the channel protocol core: the error model, the
//! deferred-loop primitive serialising each object's callbacks, the
//! lazy/eager callback wrappers carrying the first-error policy across
//! asynchronous boundaries, the close fan-out, the wire codec, the
//! transport capability trait, the reference ("basic") channel, and an
//! in-process loopback transport. Sibling crates provide the
//! cross-process-memory channel (`tensorlink-cma`), the epoll reactor
//! (`tensorlink-shm`) and the tokio loop adapter (`tensorlink-tokio`).

pub mod callback;
pub mod channel;
pub mod connection;
pub mod encoding;
pub mod error;
pub mod loopback;
pub mod task_loop;

pub use callback::{CallbackSubject, ClosingEmitter, ClosingReceiver};
pub use channel::{BasicChannel, BasicContext, ChannelContext, CompletionCallback};
pub use connection::{Connection, Endpoint, RecvBuffer, SendBuffer};
pub use encoding::{Descriptor, Packet};
pub use error::{Error, Result};
pub use task_loop::TaskLoop;
