use thiserror::Error;

/// Error taxonomy shared by every layer of the runtime.
///
/// These are the only failure kinds the data path produces. They travel
/// unchanged from queue primitives up to the wire acks, so the set is
/// deliberately closed and copyable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    #[error("operation failed")]
    Failed,

    #[error("bad parameter")]
    BadParam,

    #[error("operation not supported")]
    Unsupported,

    #[error("out of memory")]
    NoMemory,

    #[error("needs more resources or data")]
    NeedMore,

    #[error("unexpected internal state")]
    Unexpected,

    #[error("not ready")]
    NotReady,

    #[error("end of stream")]
    Eof,

    #[error("operation continues asynchronously")]
    Continue,
}

pub type Result<T> = std::result::Result<T, Error>;
