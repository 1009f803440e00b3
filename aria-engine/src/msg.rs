//! Intra-process messages.
//!
//! Every queue in the container carries [`QueueMsg`]: data-path messages
//! from peers, raw client packets, command-path messages, and returned
//! output buffers. The set is closed; queues never carry raw pointers.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use aria_sync::{Error, Queue, Result};
use aria_wire::packet::{ClientId, Packet};

use crate::media_format::MediaFormat;
use crate::metadata::{EosPolicy, Metadata};
use crate::timestamp::TimestampInfo;
use crate::topo::PortState;

/// A reusable output message buffer owned by an output port's buffer
/// queue. Downstream returns it through [`BufReturn`] when drained.
#[derive(Debug, Default)]
pub struct OutBuf {
    /// One entry for packed/raw data, N for per-channel layouts.
    pub bufs: Vec<Vec<u8>>,
    /// Shared per-buffer capacity.
    pub max_data_len: usize,
}

impl OutBuf {
    pub fn with_layout(num_bufs: usize, max_data_len: usize) -> Self {
        Self {
            bufs: (0..num_bufs).map(|_| Vec::with_capacity(max_data_len)).collect(),
            max_data_len,
        }
    }

    /// True when the buffer no longer matches the negotiated layout and
    /// must be recreated.
    pub fn is_stale(&self, num_bufs: usize, max_data_len: usize) -> bool {
        self.bufs.len() != num_bufs || self.max_data_len != max_data_len
    }

    pub fn clear(&mut self) {
        for b in &mut self.bufs {
            b.clear();
        }
    }

    /// Bytes currently carried, channel-0 convention.
    pub fn actual_len(&self) -> usize {
        self.bufs.first().map(Vec::len).unwrap_or(0)
    }
}

/// Where a data buffer goes when its consumer drains it.
#[derive(Clone)]
pub struct BufReturn {
    pub queue: Weak<Queue<QueueMsg>>,
}

impl BufReturn {
    /// Hand `buf` back to its owning pool queue, if it still exists.
    pub fn give_back(&self, mut buf: OutBuf) {
        buf.clear();
        if let Some(q) = self.queue.upgrade()
            && let Err(e) = q.push_back(QueueMsg::BufReturn(buf))
        {
            tracing::warn!(error = %e, "output buffer lost on return");
        }
    }
}

impl fmt::Debug for BufReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufReturn").finish_non_exhaustive()
    }
}

/// A data buffer travelling a peer link.
#[derive(Debug)]
pub struct DataBuffer {
    pub bufs: Vec<Vec<u8>>,
    pub timestamp: TimestampInfo,
    pub eof: bool,
    pub md: Vec<Metadata>,
    /// Present on buffers drawn from an upstream buffer queue.
    pub return_to: Option<BufReturn>,
}

/// Peer-port property update pushed by the connected container.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerPortProperty {
    pub state: Option<PortState>,
    pub is_real_time: Option<bool>,
    pub frame_len_us: Option<u32>,
}

/// Data-path messages between containers.
#[derive(Debug)]
pub enum DataMsg {
    /// Single contiguous buffer, optional inline metadata.
    BufferV1(DataBuffer),
    /// Per-channel / per-stream buffers plus a separate metadata list.
    BufferV2(DataBuffer),
    MediaFormat {
        format: MediaFormat,
        upstream_frame_len_us: u32,
    },
    Eos {
        flushing: bool,
        policy: EosPolicy,
    },
    DataFlowGap,
    PeerProperty(PeerPortProperty),
}

/// Graph-management transitions the data path reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphOp {
    Open,
    Prepare,
    Start,
    Stop,
    Close,
}

struct AckInner {
    state: Mutex<Option<Result<()>>>,
    cond: Condvar,
}

/// One-shot acknowledgement for a command. Exactly one completion is
/// delivered; extras are logged and ignored.
#[derive(Clone)]
pub struct CmdAck {
    inner: Arc<AckInner>,
}

impl CmdAck {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AckInner {
                state: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn complete(&self, result: Result<()>) {
        let mut state = self.inner.state.lock();
        if state.is_some() {
            tracing::warn!("duplicate command ack suppressed");
            return;
        }
        *state = Some(result);
        self.inner.cond.notify_all();
    }

    /// Block until the command is acked.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        while state.is_none() {
            self.inner.cond.wait(&mut state);
        }
        state.unwrap_or(Err(Error::Unexpected))
    }

    pub fn try_result(&self) -> Option<Result<()>> {
        *self.inner.state.lock()
    }
}

impl Default for CmdAck {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CmdAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdAck").field("done", &self.try_result().is_some()).finish()
    }
}

/// Command-path messages.
#[derive(Debug)]
pub enum CmdMsg {
    /// Raw client packet routed to the addressed endpoint module.
    Gpr(Packet),
    SetCfg {
        module_id: u32,
        param_id: u32,
        payload: Vec<u8>,
        ack: CmdAck,
    },
    RegisterEvent {
        module_id: u32,
        event_id: u32,
        client: ClientId,
        config: Option<Vec<u8>>,
        register: bool,
        ack: CmdAck,
    },
    /// Control-path input media format, addressed to a write endpoint.
    MediaFormat {
        module_id: u32,
        format: MediaFormat,
        upstream_frame_len_us: u32,
        ack: CmdAck,
    },
    GraphMgmt {
        op: GraphOp,
        ack: CmdAck,
    },
}

/// The single element type every container queue carries.
#[derive(Debug)]
pub enum QueueMsg {
    Data(DataMsg),
    Packet(Packet),
    Cmd(CmdMsg),
    BufReturn(OutBuf),
}
