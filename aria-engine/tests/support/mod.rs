//! Shared harness for container behaviour tests: a capturing packet
//! sink, a passthrough module, and shared-memory client helpers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use aria_engine::events::PacketSink;
use aria_engine::topo::{Module, ProcCtx};
use aria_sync::Result;
use aria_wire::memmap::MemMapRegistry;
use aria_wire::packet::{ClientId, Packet, WrEpDataBufferV2, split_addr};

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

/// Install the test tracing subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    Lazy::force(&TRACING);
}

/// Captures every packet the container emits; tests wait on it.
#[derive(Default)]
pub struct SinkState {
    packets: Mutex<Vec<Packet>>,
    cond: Condvar,
}

impl SinkState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait for (and remove) the first packet matching `pred`.
    pub fn wait_for(&self, timeout: Duration, mut pred: impl FnMut(&Packet) -> bool) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        let mut packets = self.packets.lock();
        loop {
            if let Some(idx) = packets.iter().position(|p| pred(p)) {
                return Some(packets.remove(idx));
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.cond.wait_for(&mut packets, deadline - now);
        }
    }

    /// Non-destructive check without waiting.
    pub fn contains(&self, mut pred: impl FnMut(&Packet) -> bool) -> bool {
        self.packets.lock().iter().any(|p| pred(p))
    }
}

pub struct TestSink(pub Arc<SinkState>);

impl PacketSink for TestSink {
    fn send(&self, packet: Packet) {
        let mut packets = self.0.packets.lock();
        packets.push(packet);
        self.0.cond.notify_all();
    }
}

/// Copies input to output verbatim, with an optional fixed threshold so
/// it acts as a buffering point.
pub struct Passthrough {
    pub threshold: Option<usize>,
}

impl Passthrough {
    pub fn boxed() -> Box<dyn Module> {
        Box::new(Self { threshold: None })
    }

    pub fn with_threshold(threshold: usize) -> Box<dyn Module> {
        Box::new(Self {
            threshold: Some(threshold),
        })
    }
}

impl Module for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn process(&mut self, ctx: &mut ProcCtx<'_>) -> Result<()> {
        let space = ctx.output.bufs.free_space();
        for (src, dst) in ctx.input.bufs.bufs.iter_mut().zip(ctx.output.bufs.bufs.iter_mut()) {
            let n = space.min(src.len());
            dst.extend(src.drain(..n));
        }
        ctx.output.sdata = ctx.input.sdata;
        Ok(())
    }

    fn threshold_bytes(&self) -> Option<usize> {
        self.threshold
    }
}

pub fn test_client() -> ClientId {
    ClientId {
        src_domain: 1,
        dst_domain: 2,
        src_port: 0x1001,
        dst_port: 0x2002,
    }
}

/// Write bytes into a mapped region the way a client would.
pub fn client_write(memmap: &MemMapRegistry, handle: u32, offset: u64, bytes: &[u8]) {
    let (lsw, msw) = split_addr(offset);
    let range = memmap.resolve(handle, lsw, msw, bytes.len()).expect("resolve for write");
    memmap.write(&range, 0, bytes).expect("client write");
    memmap.release(&range);
}

/// Read bytes back out of a mapped region.
pub fn client_read(memmap: &MemMapRegistry, handle: u32, offset: u64, len: usize) -> Vec<u8> {
    let (lsw, msw) = split_addr(offset);
    let range = memmap.resolve(handle, lsw, msw, len).expect("resolve for read");
    let out = memmap.read_vec(&range).expect("client read");
    memmap.release(&range);
    out
}

/// Build a write-endpoint data-buffer-v2 packet.
pub fn wr_data_packet(
    token: u32,
    data_handle: u32,
    data_offset: u64,
    data_size: u32,
    timestamp_us: Option<i64>,
    flags_extra: u32,
) -> Packet {
    let (data_lsw, data_msw) = split_addr(data_offset);
    let (ts_lsw, ts_msw) = split_addr(timestamp_us.unwrap_or(0) as u64);
    let req = WrEpDataBufferV2 {
        data_buf_addr_lsw: data_lsw,
        data_buf_addr_msw: data_msw,
        data_mem_map_handle: data_handle,
        data_buf_size: data_size,
        md_buf_addr_lsw: 0,
        md_buf_addr_msw: 0,
        md_mem_map_handle: 0,
        md_buf_size: 0,
        flags: if timestamp_us.is_some() {
            aria_wire::packet::FLAG_TIMESTAMP_VALID | flags_extra
        } else {
            flags_extra
        },
        timestamp_lsw: ts_lsw,
        timestamp_msw: ts_msw,
    };
    Packet::new(
        aria_wire::packet::DATA_CMD_WR_EP_DATA_BUFFER_V2,
        token,
        test_client(),
        req.to_bytes(),
    )
}

/// Build a read-endpoint data-buffer-v2 packet.
pub fn rd_buffer_packet(
    token: u32,
    data_handle: u32,
    data_offset: u64,
    data_size: u32,
    md_handle: u32,
    md_offset: u64,
    md_size: u32,
) -> Packet {
    let (data_lsw, data_msw) = split_addr(data_offset);
    let (md_lsw, md_msw) = split_addr(md_offset);
    let req = aria_wire::packet::RdEpDataBufferV2 {
        data_buf_addr_lsw: data_lsw,
        data_buf_addr_msw: data_msw,
        data_mem_map_handle: data_handle,
        data_buf_size: data_size,
        md_buf_addr_lsw: md_lsw,
        md_buf_addr_msw: md_msw,
        md_mem_map_handle: md_handle,
        md_buf_size: md_size,
    };
    Packet::new(
        aria_wire::packet::DATA_CMD_RD_EP_DATA_BUFFER_V2,
        token,
        test_client(),
        req.to_bytes(),
    )
}
