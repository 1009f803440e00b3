//! Container data-processing engine for the Aria signal-processing
//! runtime.
//!
//! A container hosts a topology of signal-processing modules on one
//! worker thread, stages data between external endpoints and the
//! topology, and speaks the shared-memory data-buffer protocol to
//! external clients. The platform primitives live in `aria-sync`; the
//! wire surface lives in `aria-wire`.

pub mod config;
pub mod container;
pub mod events;
pub mod media_format;
pub mod metadata;
pub mod msg;
pub mod placeholder;
pub mod ports;
pub mod sched;
pub mod timestamp;
pub mod topo;

pub use aria_sync::{Error, Result};

pub use config::EngineConfig;
pub use container::{ChainSpec, Container, ContainerBuilder, ContainerHandle, ContainerIo, OutSpec, Services};
pub use events::{EventRegistry, PacketSink};
pub use media_format::{FormatKind, Interleaving, MediaFormat, PcmFormat};
pub use metadata::{EosPolicy, Metadata, Tracking, TrackingEvent, TrackingMode};
pub use msg::{CmdAck, CmdMsg, DataBuffer, DataMsg, GraphOp, OutBuf, QueueMsg};
pub use placeholder::{ModuleDb, Placeholder};
pub use ports::ext_in::{ExtInPort, InFlavour};
pub use ports::ext_out::{ExtOutPort, FramesPerBuf, IcbInfo, OutFlavour, RdEpCfg};
pub use timestamp::{Clock, MonotonicClock, TimestampInfo, TsExtrapolator};
pub use topo::{Chain, Module, ModuleHost, ModuleSlot, PortState, ProcCtx, ProcessEvents};
