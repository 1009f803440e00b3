//! Shared-memory endpoint wire protocol for the Aria runtime.
//!
//! Everything a client on the far side of the shared-memory boundary
//! sees lives here: the data-buffer-v2 request/response layouts, opcode
//! and parameter ids, wire status codes, the memory-map handle registry,
//! the explicit cache-coherence operations and the metadata region
//! format. The engine crate consumes these; nothing here depends on the
//! engine.

pub mod cache;
pub mod mdwire;
pub mod memmap;
pub mod packet;
pub mod status;

pub use cache::CacheOps;
pub use memmap::{MappedRange, MemMapRegistry, SHM_ALIGNMENT};
pub use packet::{ClientId, Packet};
