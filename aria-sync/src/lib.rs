//! Platform primitives for the Aria signal-processing runtime.
//!
//! This crate is the bottom of the stack: a condition-variable backed
//! 32-bit [`Signal`] word, the [`Channel`] wait point that multiplexes up
//! to 32 of them, pooled non-blocking [`Queue`]s that raise channel bits
//! while non-empty, recursive locking, and per-heap memory accounting.
//! Everything above (wire protocol, container engine) builds on these.

pub mod channel;
pub mod error;
pub mod memory;
pub mod mutex;
pub mod pool;
pub mod queue;
pub mod signal;

pub use channel::{CHANNEL_ALL_BITS, Channel, ChannelSignal};
pub use error::{Error, Result};
pub use memory::{AlignedBuf, HeapId, MemTracker};
pub use mutex::{RecursiveGuard, RecursiveMutex};
pub use pool::{BufPool, QueuePools};
pub use queue::{Queue, QueueAttr};
pub use signal::Signal;
