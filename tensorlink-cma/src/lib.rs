//! tensorlink-cma - cross-memory-attach channel.
//!
//! Moves tensor payloads with `process_vm_readv`: the receiving process
//! reads the sender's buffer directly out of its address space, bypassing
//! the connection for bulk data. Only same-domain contexts may pair (same
//! kernel boot, same effective uid/gid), which is exactly what the kernel
//! demands of the underlying ptrace access check.
//!
//! The context owns one worker thread servicing queued copies; channels
//! created from it share that worker and complete sends through
//! notification packets on their connection.

pub mod channel;
pub mod context;
pub mod encoding;
pub mod identity;

pub use channel::CmaChannel;
pub use context::CmaContext;
pub use identity::Identity;
