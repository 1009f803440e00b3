//! External ports: the container's edges.
//!
//! An external input port owns an ingress queue and stages arriving
//! bytes into the first module's input; an external output port drains
//! the last module's output into peer messages or client shared memory.

pub mod ext_in;
pub mod ext_out;

pub use ext_in::ExtInPort;
pub use ext_out::ExtOutPort;
