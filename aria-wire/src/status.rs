//! Wire status codes.
//!
//! `data_status` / `md_status` fields on acknowledgements carry these
//! `u32` values. The numbering is part of the protocol and must not
//! change.

use aria_sync::Error;

pub const STATUS_OK: u32 = 0;
pub const STATUS_FAILED: u32 = 1;
pub const STATUS_BAD_PARAM: u32 = 2;
pub const STATUS_UNSUPPORTED: u32 = 3;
pub const STATUS_NO_MEMORY: u32 = 4;
pub const STATUS_NEED_MORE: u32 = 5;
pub const STATUS_UNEXPECTED: u32 = 6;
pub const STATUS_NOT_READY: u32 = 7;
pub const STATUS_EOF: u32 = 8;
pub const STATUS_CONTINUE: u32 = 9;

/// Encode an operation result as a wire status.
pub fn status_of(result: &Result<(), Error>) -> u32 {
    match result {
        Ok(()) => STATUS_OK,
        Err(e) => status_of_err(*e),
    }
}

pub fn status_of_err(e: Error) -> u32 {
    match e {
        Error::Failed => STATUS_FAILED,
        Error::BadParam => STATUS_BAD_PARAM,
        Error::Unsupported => STATUS_UNSUPPORTED,
        Error::NoMemory => STATUS_NO_MEMORY,
        Error::NeedMore => STATUS_NEED_MORE,
        Error::Unexpected => STATUS_UNEXPECTED,
        Error::NotReady => STATUS_NOT_READY,
        Error::Eof => STATUS_EOF,
        Error::Continue => STATUS_CONTINUE,
    }
}

/// Decode a wire status back into an operation result.
pub fn result_of_status(status: u32) -> Result<(), Error> {
    match status {
        STATUS_OK => Ok(()),
        STATUS_BAD_PARAM => Err(Error::BadParam),
        STATUS_UNSUPPORTED => Err(Error::Unsupported),
        STATUS_NO_MEMORY => Err(Error::NoMemory),
        STATUS_NEED_MORE => Err(Error::NeedMore),
        STATUS_UNEXPECTED => Err(Error::Unexpected),
        STATUS_NOT_READY => Err(Error::NotReady),
        STATUS_EOF => Err(Error::Eof),
        STATUS_CONTINUE => Err(Error::Continue),
        _ => Err(Error::Failed),
    }
}
