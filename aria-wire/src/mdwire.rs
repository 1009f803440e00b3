//! Metadata region marshalling.
//!
//! A metadata region is a count-prefixed sequence of objects, each a
//! fixed header, an optional tracking block, and a 4-byte padded payload.
//! The layout is client-visible and fixed.

use aria_sync::{Error, Result};

use crate::packet::{join_addr, split_addr};

// Metadata ids understood by the framework. Module-private ids pass
// through untouched.
pub const MD_ID_EOS: u32 = 0x0700_0001;
pub const MD_ID_DFG: u32 = 0x0700_0002;
pub const MD_ID_BUFFER_END: u32 = 0x0700_0003;
pub const MD_ID_ENCODER_FRAME_INFO: u32 = 0x0700_0004;
pub const MD_ID_MEDIA_FORMAT: u32 = 0x0700_0005;

// Header flag bits.
pub const MD_FLAG_OUT_OF_BAND: u32 = 1 << 0;
pub const MD_FLAG_SAMPLE_ASSOCIATED: u32 = 1 << 1;
pub const MD_FLAG_CLIENT: u32 = 1 << 2;
pub const MD_FLAG_NEEDS_CLIENT_PROPAGATION: u32 = 1 << 3;
pub const MD_FLAG_TRACKING: u32 = 1 << 4;

// Tracking block flag bits.
pub const TRACK_MODE_DROP_ONLY: u32 = 1 << 0;
pub const TRACK_MODE_ALWAYS: u32 = 1 << 1;
pub const TRACK_POLICY_EACH: u32 = 1 << 2;

const HEADER_WORDS: usize = 4;
const TRACKING_WORDS: usize = 7;

/// Tracking block: who to tell when this metadata is rendered or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireTracking {
    pub src_domain: u32,
    pub dst_domain: u32,
    pub src_port: u32,
    pub dst_port: u32,
    pub token: u64,
    pub flags: u32,
}

/// One metadata object in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMetadata {
    pub id: u32,
    pub flags: u32,
    /// Byte offset into the accompanying data buffer this object is
    /// anchored at.
    pub offset: u32,
    pub tracking: Option<WireTracking>,
    pub payload: Vec<u8>,
}

fn padded(len: usize) -> usize {
    len.div_ceil(4) * 4
}

impl WireMetadata {
    /// Bytes this object occupies in a region.
    pub fn wire_size(&self) -> usize {
        let tracking = if self.tracking.is_some() {
            TRACKING_WORDS * 4
        } else {
            0
        };
        HEADER_WORDS * 4 + tracking + padded(self.payload.len())
    }
}

/// Bytes needed to carry `mds` plus the count prefix.
pub fn region_size(mds: &[WireMetadata]) -> usize {
    4 + mds.iter().map(WireMetadata::wire_size).sum::<usize>()
}

/// Serialize `mds` into `out`. Returns bytes written, or `NeedMore`
/// when the region is too small - in that case nothing is written, so
/// the caller can report the required size and retry with a larger
/// buffer.
pub fn write_region(mds: &[WireMetadata], out: &mut [u8]) -> Result<usize> {
    let need = region_size(mds);
    if out.len() < need {
        return Err(Error::NeedMore);
    }
    let mut pos = 0usize;
    let mut put = |bytes: &[u8], pos: &mut usize| {
        out[*pos..*pos + bytes.len()].copy_from_slice(bytes);
        *pos += bytes.len();
    };
    put(&(mds.len() as u32).to_le_bytes(), &mut pos);
    for md in mds {
        let mut flags = md.flags;
        if md.tracking.is_some() {
            flags |= MD_FLAG_TRACKING;
        } else {
            flags &= !MD_FLAG_TRACKING;
        }
        put(&md.id.to_le_bytes(), &mut pos);
        put(&flags.to_le_bytes(), &mut pos);
        put(&md.offset.to_le_bytes(), &mut pos);
        put(&(md.payload.len() as u32).to_le_bytes(), &mut pos);
        if let Some(t) = &md.tracking {
            let (token_lsw, token_msw) = split_addr(t.token);
            for v in [
                t.src_domain,
                t.dst_domain,
                t.src_port,
                t.dst_port,
                token_lsw,
                token_msw,
                t.flags,
            ] {
                put(&v.to_le_bytes(), &mut pos);
            }
        }
        put(&md.payload, &mut pos);
        let pad = padded(md.payload.len()) - md.payload.len();
        put(&[0u8; 3][..pad], &mut pos);
    }
    Ok(pos)
}

/// Parse a metadata region. Objects that run past the region end fail
/// the whole parse with `NeedMore`.
pub fn parse_region(bytes: &[u8]) -> Result<Vec<WireMetadata>> {
    let mut pos = 0usize;
    let mut take_u32 = |pos: &mut usize| -> Result<u32> {
        let end = *pos + 4;
        let chunk = bytes.get(*pos..end).ok_or(Error::NeedMore)?;
        *pos = end;
        Ok(u32::from_le_bytes(chunk.try_into().map_err(|_| Error::Unexpected)?))
    };
    let count = take_u32(&mut pos)?;
    let mut mds = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = take_u32(&mut pos)?;
        let flags = take_u32(&mut pos)?;
        let offset = take_u32(&mut pos)?;
        let size = take_u32(&mut pos)? as usize;
        let tracking = if flags & MD_FLAG_TRACKING != 0 {
            let src_domain = take_u32(&mut pos)?;
            let dst_domain = take_u32(&mut pos)?;
            let src_port = take_u32(&mut pos)?;
            let dst_port = take_u32(&mut pos)?;
            let token_lsw = take_u32(&mut pos)?;
            let token_msw = take_u32(&mut pos)?;
            let tflags = take_u32(&mut pos)?;
            Some(WireTracking {
                src_domain,
                dst_domain,
                src_port,
                dst_port,
                token: join_addr(token_lsw, token_msw),
                flags: tflags,
            })
        } else {
            None
        };
        let payload = bytes.get(pos..pos + size).ok_or(Error::NeedMore)?.to_vec();
        pos += padded(size);
        if pos > bytes.len() {
            return Err(Error::NeedMore);
        }
        mds.push(WireMetadata {
            id,
            flags,
            offset,
            tracking,
            payload,
        });
    }
    Ok(mds)
}

/// Per-frame record written by the read endpoint when encoder frame
/// metadata is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct EncoderFrameInfo {
    pub frame_size: u32,
    pub flags: u32,
    pub timestamp_lsw: u32,
    pub timestamp_msw: u32,
}

impl EncoderFrameInfo {
    pub const WIRE_SIZE: usize = 4 * 4;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        for v in [self.frame_size, self.flags, self.timestamp_lsw, self.timestamp_msw] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::WIRE_SIZE {
            return Err(Error::NeedMore);
        }
        let word = |i: usize| {
            u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
        };
        Ok(Self {
            frame_size: word(0),
            flags: word(1),
            timestamp_lsw: word(2),
            timestamp_msw: word(3),
        })
    }
}
