//! # kos-core
//!
//! Shared plumbing for the KOS kernel simulation. This crate is free of
//! protocol and scheduling logic; the network stack (`kos-net`) and the
//! scheduler (`kos-sched`) both build on it.
//!
//! ## Modules
//!
//! - `error` - kernel-wide error kinds and result alias
//! - `id` - handle newtypes (`TaskId`, `SocketId`)
//! - `clock` - shared time source, system or manually advanced
//! - `bytes` - bounds-checked wire codec and internet checksum
//! - `pktbuf` - packet buffer with head/tail cursors and layer offsets
//! - `stats` - advisory atomic counters
//! - `timer` - background timer worker and the `TimerSweep` trait

pub mod bytes;
pub mod clock;
pub mod error;
pub mod id;
pub mod pktbuf;
pub mod stats;
pub mod timer;

// Re-exports for convenience
pub use bytes::{inet_checksum, ByteReader, ByteWriter};
pub use clock::Clock;
pub use error::{KernelError, KernelResult};
pub use id::{SocketId, TaskId};
pub use pktbuf::{Layer, PacketBuffer};
pub use stats::{Counter, DirStats};
pub use timer::{TimerSweep, TimerWorker, TimerWorkerConfig, TimerWorkerStats};
