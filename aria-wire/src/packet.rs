//! Data-buffer-v2 wire packets.
//!
//! Field order and width are the interoperability contract: a client on
//! the far side of the shared-memory boundary lays these structures out
//! byte-for-byte. Codecs below read and write little-endian `u32` words
//! in declaration order.

use aria_sync::{Error, Result};

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

/// Write-endpoint ingress data buffer, v2 layout.
pub const DATA_CMD_WR_EP_DATA_BUFFER_V2: u32 = 0x0400_1001;
/// Ack for [`DATA_CMD_WR_EP_DATA_BUFFER_V2`].
pub const DATA_RSP_WR_EP_DATA_BUFFER_DONE_V2: u32 = 0x0400_1002;
/// Write-endpoint input media format (data path).
pub const DATA_CMD_WR_EP_MEDIA_FORMAT: u32 = 0x0400_1003;
/// Write-endpoint end-of-stream marker.
pub const DATA_CMD_WR_EP_EOS: u32 = 0x0400_1004;

/// Read-endpoint egress data buffer, v2 layout.
pub const DATA_CMD_RD_EP_DATA_BUFFER_V2: u32 = 0x0400_2001;
/// Response for [`DATA_CMD_RD_EP_DATA_BUFFER_V2`].
pub const DATA_RSP_RD_EP_DATA_BUFFER_DONE_V2: u32 = 0x0400_2002;

// Events raised to registered clients.
pub const EVENT_RD_EP_MEDIA_FORMAT: u32 = 0x0500_2001;
pub const EVENT_RD_EP_EOS: u32 = 0x0500_2002;
pub const EVENT_RD_EP_TIMESTAMP_DISC: u32 = 0x0500_2003;
pub const EVENT_EP_OPERATING_FRAME_SIZE: u32 = 0x0500_2004;
/// Generic drop-tracking event carrying a metadata token.
pub const EVENT_MD_TRACKING: u32 = 0x0500_2005;

// Parameters consumed by the framework (not module-specific).
pub const PARAM_ID_RD_EP_CFG: u32 = 0x0600_2001;
pub const PARAM_ID_PEER_CLIENT_PROPERTY: u32 = 0x0600_2002;
pub const PARAM_ID_MEDIA_FORMAT: u32 = 0x0600_2003;
pub const PARAM_ID_REAL_MODULE_ID: u32 = 0x0600_2004;
pub const PARAM_ID_MODULE_ENABLE: u32 = 0x0600_2005;
pub const PARAM_ID_RESET_PLACEHOLDER_MODULE: u32 = 0x0600_2006;

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

pub const FLAG_TIMESTAMP_VALID: u32 = 1 << 0;
pub const FLAG_TIMESTAMP_CONTINUE: u32 = 1 << 1;
pub const FLAG_EOF: u32 = 1 << 2;
pub const FLAG_LAST_BUFFER: u32 = 1 << 3;

// ---------------------------------------------------------------------------
// Packet envelope
// ---------------------------------------------------------------------------

/// Identity of a packet originator; doubles as the event-client identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClientId {
    pub src_domain: u8,
    pub dst_domain: u8,
    pub src_port: u32,
    pub dst_port: u32,
}

/// An owned packet as exchanged with external clients.
///
/// The transport header is out of scope; only opcode, token, originator
/// and payload reach the engine.
#[derive(Debug, Clone)]
pub struct Packet {
    pub opcode: u32,
    pub token: u32,
    pub client: ClientId,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(opcode: u32, token: u32, client: ClientId, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            token,
            client,
            payload,
        }
    }

    /// Build the ack for this packet, echoing token and originator.
    pub fn ack(&self, opcode: u32, payload: Vec<u8>) -> Packet {
        Packet {
            opcode,
            token: self.token,
            client: self.client,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Codec helpers
// ---------------------------------------------------------------------------

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn u32(&mut self) -> Result<u32> {
        let end = self.pos + 4;
        let chunk = self.bytes.get(self.pos..end).ok_or(Error::NeedMore)?;
        self.pos = end;
        Ok(u32::from_le_bytes(chunk.try_into().map_err(|_| Error::Unexpected)?))
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Join an (lsw, msw) pair into the 64-bit value it transports.
pub fn join_addr(lsw: u32, msw: u32) -> u64 {
    ((msw as u64) << 32) | lsw as u64
}

/// Split a 64-bit value into its wire (lsw, msw) pair.
pub fn split_addr(addr: u64) -> (u32, u32) {
    (addr as u32, (addr >> 32) as u32)
}

// ---------------------------------------------------------------------------
// Write endpoint
// ---------------------------------------------------------------------------

/// Payload of [`DATA_CMD_WR_EP_DATA_BUFFER_V2`].
///
/// With `md_mem_map_handle == 0` the metadata region is carried in-band,
/// immediately following this structure in the packet payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct WrEpDataBufferV2 {
    pub data_buf_addr_lsw: u32,
    pub data_buf_addr_msw: u32,
    pub data_mem_map_handle: u32,
    pub data_buf_size: u32,
    pub md_buf_addr_lsw: u32,
    pub md_buf_addr_msw: u32,
    pub md_mem_map_handle: u32,
    pub md_buf_size: u32,
    pub flags: u32,
    pub timestamp_lsw: u32,
    pub timestamp_msw: u32,
}

impl WrEpDataBufferV2 {
    pub const WIRE_SIZE: usize = 11 * 4;

    pub fn timestamp(&self) -> u64 {
        join_addr(self.timestamp_lsw, self.timestamp_msw)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        for v in [
            self.data_buf_addr_lsw,
            self.data_buf_addr_msw,
            self.data_mem_map_handle,
            self.data_buf_size,
            self.md_buf_addr_lsw,
            self.md_buf_addr_msw,
            self.md_mem_map_handle,
            self.md_buf_size,
            self.flags,
            self.timestamp_lsw,
            self.timestamp_msw,
        ] {
            put_u32(&mut out, v);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            data_buf_addr_lsw: r.u32()?,
            data_buf_addr_msw: r.u32()?,
            data_mem_map_handle: r.u32()?,
            data_buf_size: r.u32()?,
            md_buf_addr_lsw: r.u32()?,
            md_buf_addr_msw: r.u32()?,
            md_mem_map_handle: r.u32()?,
            md_buf_size: r.u32()?,
            flags: r.u32()?,
            timestamp_lsw: r.u32()?,
            timestamp_msw: r.u32()?,
        })
    }
}

/// Payload of [`DATA_RSP_WR_EP_DATA_BUFFER_DONE_V2`]: addresses echoed,
/// one status per region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct WrEpDataBufferDoneV2 {
    pub data_buf_addr_lsw: u32,
    pub data_buf_addr_msw: u32,
    pub data_mem_map_handle: u32,
    pub data_status: u32,
    pub md_buf_addr_lsw: u32,
    pub md_buf_addr_msw: u32,
    pub md_mem_map_handle: u32,
    pub md_status: u32,
}

impl WrEpDataBufferDoneV2 {
    pub const WIRE_SIZE: usize = 8 * 4;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        for v in [
            self.data_buf_addr_lsw,
            self.data_buf_addr_msw,
            self.data_mem_map_handle,
            self.data_status,
            self.md_buf_addr_lsw,
            self.md_buf_addr_msw,
            self.md_mem_map_handle,
            self.md_status,
        ] {
            put_u32(&mut out, v);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            data_buf_addr_lsw: r.u32()?,
            data_buf_addr_msw: r.u32()?,
            data_mem_map_handle: r.u32()?,
            data_status: r.u32()?,
            md_buf_addr_lsw: r.u32()?,
            md_buf_addr_msw: r.u32()?,
            md_mem_map_handle: r.u32()?,
            md_status: r.u32()?,
        })
    }
}

/// Payload of [`DATA_CMD_WR_EP_EOS`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct WrEpEos {
    pub flags: u32,
    pub policy: u32,
}

/// EOS drains every module on the way out.
pub const EOS_FLAG_FLUSHING: u32 = 1 << 0;
/// One tracking event for the whole stream.
pub const EOS_POLICY_LAST: u32 = 0;
/// One tracking event per split path.
pub const EOS_POLICY_EACH: u32 = 1;

impl WrEpEos {
    pub const WIRE_SIZE: usize = 2 * 4;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        put_u32(&mut out, self.flags);
        put_u32(&mut out, self.policy);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            flags: r.u32()?,
            policy: r.u32()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Read endpoint
// ---------------------------------------------------------------------------

/// Payload of [`DATA_CMD_RD_EP_DATA_BUFFER_V2`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RdEpDataBufferV2 {
    pub data_buf_addr_lsw: u32,
    pub data_buf_addr_msw: u32,
    pub data_mem_map_handle: u32,
    pub data_buf_size: u32,
    pub md_buf_addr_lsw: u32,
    pub md_buf_addr_msw: u32,
    pub md_mem_map_handle: u32,
    pub md_buf_size: u32,
}

impl RdEpDataBufferV2 {
    pub const WIRE_SIZE: usize = 8 * 4;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        for v in [
            self.data_buf_addr_lsw,
            self.data_buf_addr_msw,
            self.data_mem_map_handle,
            self.data_buf_size,
            self.md_buf_addr_lsw,
            self.md_buf_addr_msw,
            self.md_mem_map_handle,
            self.md_buf_size,
        ] {
            put_u32(&mut out, v);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            data_buf_addr_lsw: r.u32()?,
            data_buf_addr_msw: r.u32()?,
            data_mem_map_handle: r.u32()?,
            data_buf_size: r.u32()?,
            md_buf_addr_lsw: r.u32()?,
            md_buf_addr_msw: r.u32()?,
            md_mem_map_handle: r.u32()?,
            md_buf_size: r.u32()?,
        })
    }
}

/// Payload of [`DATA_RSP_RD_EP_DATA_BUFFER_DONE_V2`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RdEpDataBufferDoneV2 {
    pub data_buf_addr_lsw: u32,
    pub data_buf_addr_msw: u32,
    pub data_mem_map_handle: u32,
    pub data_size: u32,
    pub num_frames: u32,
    pub md_buf_addr_lsw: u32,
    pub md_buf_addr_msw: u32,
    pub md_mem_map_handle: u32,
    pub md_size: u32,
    pub timestamp_lsw: u32,
    pub timestamp_msw: u32,
    pub flags: u32,
    pub data_status: u32,
    pub md_status: u32,
}

impl RdEpDataBufferDoneV2 {
    pub const WIRE_SIZE: usize = 14 * 4;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        for v in [
            self.data_buf_addr_lsw,
            self.data_buf_addr_msw,
            self.data_mem_map_handle,
            self.data_size,
            self.num_frames,
            self.md_buf_addr_lsw,
            self.md_buf_addr_msw,
            self.md_mem_map_handle,
            self.md_size,
            self.timestamp_lsw,
            self.timestamp_msw,
            self.flags,
            self.data_status,
            self.md_status,
        ] {
            put_u32(&mut out, v);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        Ok(Self {
            data_buf_addr_lsw: r.u32()?,
            data_buf_addr_msw: r.u32()?,
            data_mem_map_handle: r.u32()?,
            data_size: r.u32()?,
            num_frames: r.u32()?,
            md_buf_addr_lsw: r.u32()?,
            md_buf_addr_msw: r.u32()?,
            md_mem_map_handle: r.u32()?,
            md_size: r.u32()?,
            timestamp_lsw: r.u32()?,
            timestamp_msw: r.u32()?,
            flags: r.u32()?,
            data_status: r.u32()?,
            md_status: r.u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wr_request_codec_is_bit_exact() {
        let req = WrEpDataBufferV2 {
            data_buf_addr_lsw: 0x1000,
            data_buf_addr_msw: 0x1,
            data_mem_map_handle: 8,
            data_buf_size: 960,
            md_buf_addr_lsw: 0x2000,
            md_buf_addr_msw: 0,
            md_mem_map_handle: 16,
            md_buf_size: 64,
            flags: FLAG_TIMESTAMP_VALID | FLAG_EOF,
            timestamp_lsw: 1000,
            timestamp_msw: 0,
        };
        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), WrEpDataBufferV2::WIRE_SIZE);
        // Field order is the contract: first word is the data address LSW.
        assert_eq!(&bytes[0..4], &0x1000u32.to_le_bytes());
        assert_eq!(&bytes[32..36], &(FLAG_TIMESTAMP_VALID | FLAG_EOF).to_le_bytes());
        assert_eq!(WrEpDataBufferV2::from_bytes(&bytes).unwrap(), req);
    }

    #[test]
    fn short_buffer_is_need_more() {
        let bytes = [0u8; WrEpDataBufferV2::WIRE_SIZE - 1];
        assert_eq!(
            WrEpDataBufferV2::from_bytes(&bytes).unwrap_err(),
            Error::NeedMore
        );
    }

    #[test]
    fn rd_done_codec_roundtrip() {
        let done = RdEpDataBufferDoneV2 {
            data_buf_addr_lsw: 0xabc0,
            data_mem_map_handle: 24,
            data_size: 480,
            num_frames: 1,
            timestamp_lsw: 123,
            flags: FLAG_TIMESTAMP_VALID,
            ..Default::default()
        };
        let decoded = RdEpDataBufferDoneV2::from_bytes(&done.to_bytes()).unwrap();
        assert_eq!(decoded, done);
    }

    #[test]
    fn addr_split_join() {
        let (lsw, msw) = split_addr(0x1234_5678_9abc_def0);
        assert_eq!(lsw, 0x9abc_def0);
        assert_eq!(msw, 0x1234_5678);
        assert_eq!(join_addr(lsw, msw), 0x1234_5678_9abc_def0);
    }
}
