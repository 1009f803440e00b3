//! External output port: peer-link egress and the shared-memory read
//! endpoint.
//!
//! One interface, two flavours. The peer flavour recycles message
//! buffers through its own buffer queue under inter-container-buffering
//! (ICB) negotiation; the client flavour fills a posted shared-memory
//! buffer and answers with a data-buffer-done-v2 response.

use std::sync::Arc;

use aria_sync::{Error, Queue, Result};
use aria_wire::mdwire;
use aria_wire::memmap::MappedRange;
use aria_wire::packet::{
    DATA_CMD_RD_EP_DATA_BUFFER_V2, DATA_RSP_RD_EP_DATA_BUFFER_DONE_V2, EVENT_RD_EP_EOS,
    EVENT_RD_EP_MEDIA_FORMAT, EVENT_RD_EP_TIMESTAMP_DISC, FLAG_TIMESTAMP_VALID, Packet,
    RdEpDataBufferDoneV2, RdEpDataBufferV2, split_addr,
};
use aria_wire::status::{STATUS_NEED_MORE, STATUS_OK, status_of_err};

use crate::container::Services;
use crate::media_format::{MediaFormat, unpacked_to_packed};
use crate::metadata::{self, MdValue, Metadata};
use crate::msg::{BufReturn, DataBuffer, DataMsg, OutBuf, QueueMsg};
use crate::timestamp::{TimestampInfo, TsExtrapolator};
use crate::topo::{Chain, PortState};

/// How many frames one client buffer accumulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramesPerBuf {
    Count(u32),
    /// Fill as much as possible; the cap is locked from the first frame.
    FillBuffer,
}

/// Inter-container-buffering negotiation outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcbInfo {
    pub downstream_frame_len_us: u32,
    pub downstream_period_us: u32,
    pub num_reg_bufs: u32,
    pub num_reg_prebufs: u32,
}

/// Peer-link egress state.
pub struct PeerOut {
    /// Our buffer queue: recycled [`OutBuf`] nodes come back here.
    pub buf_q: Arc<Queue<QueueMsg>>,
    /// Downstream container's data queue.
    pub data_tx: Option<Arc<Queue<QueueMsg>>>,
    pub held: Option<OutBuf>,
    pub icb: IcbInfo,
    pub is_prebuffer_sent: bool,
    /// Format the downstream last heard about.
    pub mf_sent: Option<MediaFormat>,
}

/// Read-endpoint client configuration (PARAM_ID_RD_EP_CFG).
#[derive(Debug, Clone, Copy)]
pub struct RdEpCfg {
    pub frames_per_buffer: FramesPerBuf,
    pub per_frame_md_enable: bool,
    pub md_mf_enable: bool,
}

impl Default for RdEpCfg {
    fn default() -> Self {
        Self {
            frames_per_buffer: FramesPerBuf::Count(1),
            per_frame_md_enable: false,
            md_mf_enable: false,
        }
    }
}

impl RdEpCfg {
    /// Wire layout: frames (0 = fill), per-frame-md enable, mf-as-md
    /// enable; three little-endian words.
    pub fn from_wire(payload: &[u8]) -> Result<Self> {
        if payload.len() < 12 {
            return Err(Error::NeedMore);
        }
        let word = |i: usize| {
            u32::from_le_bytes([payload[i * 4], payload[i * 4 + 1], payload[i * 4 + 2], payload[i * 4 + 3]])
        };
        let frames = word(0);
        Ok(Self {
            frames_per_buffer: if frames == 0 {
                FramesPerBuf::FillBuffer
            } else {
                FramesPerBuf::Count(frames)
            },
            per_frame_md_enable: word(1) != 0,
            md_mf_enable: word(2) != 0,
        })
    }
}

/// A client read buffer currently being filled.
pub struct HeldClientBuf {
    pub packet: Packet,
    pub req: RdEpDataBufferV2,
    pub data_range: Option<MappedRange>,
    pub md_range: Option<MappedRange>,
    /// Staged bytes mirroring the link layout; converted to the packed
    /// client layout at delivery.
    pub staging: Vec<Vec<u8>>,
    /// (bytes, timestamp) per collected frame for per-frame records.
    pub frames: Vec<(usize, TimestampInfo)>,
    pub data_status: u32,
    pub md_status: u32,
}

impl HeldClientBuf {
    fn staged_total(&self) -> usize {
        self.staging.iter().map(Vec::len).sum()
    }
}

/// Shared-memory read-endpoint state.
pub struct ClientOut {
    pub out_q: Arc<Queue<QueueMsg>>,
    pub held: Option<HeldClientBuf>,
    pub cfg: RdEpCfg,
    /// After an md-too-small rejection, the next buffer must offer at
    /// least this much metadata room.
    pub min_md_size_in_next_buffer: usize,
    /// A media-format change to be stored as metadata in the next client
    /// buffer (when `md_mf_enable`).
    pub pending_mf_as_md: Option<MediaFormat>,
}

pub enum OutFlavour {
    Peer(PeerOut),
    Client(ClientOut),
}

/// Reserved metadata room assumed when sizing fill-mode frame caps.
const FILL_MODE_MD_RESERVE: usize = 64;

/// External output port state.
pub struct ExtOutPort {
    pub name: String,
    /// Framework module instance id of this endpoint.
    pub module_id: u32,
    pub bit: u32,
    pub flavour: OutFlavour,
    pub chain_idx: usize,
    pub state: PortState,
    pub media_fmt: Option<MediaFormat>,
    pub num_frames_in_buf: u32,
    /// Fill-mode cap decided from the first frame of the current buffer.
    pub frames_cap_this_buf: Option<u32>,
    pub ts: TsExtrapolator,
    pub held_md: Vec<Metadata>,
    pub overrun_count: u64,
    pub downstream_real_time: bool,
    /// Deliver-time observation that a flushing EOS left through here.
    pub eos_delivered: bool,
    /// First timestamp of the buffer being accumulated.
    buf_ts: Option<TimestampInfo>,
}

impl std::fmt::Debug for ExtOutPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtOutPort")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("frames", &self.num_frames_in_buf)
            .field("has_buffer", &self.has_buffer())
            .finish()
    }
}

impl ExtOutPort {
    pub fn new(name: impl Into<String>, module_id: u32, flavour: OutFlavour, bit: u32, chain_idx: usize) -> Self {
        Self {
            name: name.into(),
            module_id,
            bit,
            flavour,
            chain_idx,
            state: PortState::Stopped,
            media_fmt: None,
            num_frames_in_buf: 0,
            frames_cap_this_buf: None,
            ts: TsExtrapolator::new(),
            held_md: Vec::new(),
            overrun_count: 0,
            downstream_real_time: false,
            eos_delivered: false,
            buf_ts: None,
        }
    }

    pub fn has_buffer(&self) -> bool {
        match &self.flavour {
            OutFlavour::Peer(p) => p.held.is_some(),
            OutFlavour::Client(c) => c.held.is_some(),
        }
    }

    /// Frames the current buffer may take.
    fn frames_cap(&self) -> u32 {
        if let Some(cap) = self.frames_cap_this_buf {
            return cap;
        }
        match &self.flavour {
            OutFlavour::Client(c) => match c.cfg.frames_per_buffer {
                FramesPerBuf::Count(n) => n.max(1),
                FramesPerBuf::FillBuffer => u32::MAX,
            },
            // Peer links deliver one frame per message.
            OutFlavour::Peer(_) => 1,
        }
    }

    /// Readiness: full frame count, or metadata with zero frames.
    pub fn is_ready(&self) -> bool {
        if !self.has_buffer() {
            return false;
        }
        if self.num_frames_in_buf >= self.frames_cap() {
            return true;
        }
        self.num_frames_in_buf == 0 && !self.held_md.is_empty()
    }

    /// Buffer layout the current media format implies for the peer path.
    fn peer_layout(&self) -> (usize, usize) {
        let num_bufs = self.media_fmt.as_ref().map(MediaFormat::num_bufs).unwrap_or(1);
        let max_len = match &self.flavour {
            OutFlavour::Peer(p) => {
                let frame_ms = (p.icb.downstream_frame_len_us.max(1_000) as u64).div_ceil(1000);
                self.media_fmt
                    .as_ref()
                    .and_then(MediaFormat::bytes_per_ms)
                    .map(|b| (b * frame_ms) as usize)
                    .unwrap_or(2048)
            }
            OutFlavour::Client(_) => 0,
        };
        (num_bufs, max_len)
    }

    /// Acquire an output buffer if none is held. Peer: pop a recycled
    /// node, recreating a stale one. Client: pop and validate a posted
    /// data-buffer-v2 request.
    pub fn setup_bufs(&mut self, svc: &Services) -> Result<()> {
        if self.has_buffer() {
            return Ok(());
        }
        if matches!(self.flavour, OutFlavour::Peer(_)) {
            self.setup_peer_buf()
        } else {
            self.setup_client_buf(svc)
        }
    }

    fn setup_peer_buf(&mut self) -> Result<()> {
        let (num_bufs, max_len) = self.peer_layout();
        let OutFlavour::Peer(peer) = &mut self.flavour else {
            return Err(Error::Unexpected);
        };
        let buf = match peer.buf_q.pop_front() {
            Ok(QueueMsg::BufReturn(buf)) => {
                if buf.is_stale(num_bufs, max_len) {
                    tracing::debug!(port = %self.name, "stale output buffer recreated");
                    OutBuf::with_layout(num_bufs, max_len)
                } else {
                    buf
                }
            }
            Ok(other) => {
                tracing::warn!(port = %self.name, ?other, "unexpected message on buffer queue");
                return Err(Error::Unexpected);
            }
            Err(e) => return Err(e),
        };
        peer.held = Some(buf);
        Ok(())
    }

    fn setup_client_buf(&mut self, svc: &Services) -> Result<()> {
        let num_bufs = self.media_fmt.as_ref().map(MediaFormat::num_bufs).unwrap_or(1);
        let name = self.name.clone();
        let OutFlavour::Client(client) = &mut self.flavour else {
            return Err(Error::Unexpected);
        };
        let pkt = match client.out_q.pop_front() {
            Ok(QueueMsg::Packet(pkt)) if pkt.opcode == DATA_CMD_RD_EP_DATA_BUFFER_V2 => pkt,
            Ok(QueueMsg::Packet(pkt)) => {
                tracing::error!(port = %name, opcode = format_args!("{:#x}", pkt.opcode), "unsupported client opcode");
                svc.sink
                    .send(pkt.ack(pkt.opcode, status_of_err(Error::Unsupported).to_le_bytes().to_vec()));
                return Err(Error::NeedMore);
            }
            Ok(other) => {
                tracing::warn!(port = %name, ?other, "unexpected message on output queue");
                return Err(Error::Unexpected);
            }
            Err(e) => return Err(e),
        };
        let req = match RdEpDataBufferV2::from_bytes(&pkt.payload) {
            Ok(r) => r,
            Err(e) => {
                respond_client(svc, &pkt, &RdEpDataBufferV2::default(), ClientResponse::error(e));
                return Err(Error::NeedMore);
            }
        };

        // A previously-rejected metadata size gates acceptance.
        if client.min_md_size_in_next_buffer > 0
            && (req.md_buf_size as usize) < client.min_md_size_in_next_buffer
        {
            tracing::debug!(
                port = %name,
                md_size = req.md_buf_size,
                need = client.min_md_size_in_next_buffer,
                "client metadata region still too small"
            );
            respond_client(svc, &pkt, &req, ClientResponse::md_need_more());
            return Err(Error::NeedMore);
        }

        let data_range = if req.data_buf_size > 0 {
            match svc.memmap.resolve(
                req.data_mem_map_handle,
                req.data_buf_addr_lsw,
                req.data_buf_addr_msw,
                req.data_buf_size as usize,
            ) {
                Ok(r) => Some(r),
                Err(e) => {
                    respond_client(svc, &pkt, &req, ClientResponse::error(e));
                    return Err(Error::NeedMore);
                }
            }
        } else {
            None
        };
        let md_range = if req.md_buf_size > 0 {
            match svc.memmap.resolve(
                req.md_mem_map_handle,
                req.md_buf_addr_lsw,
                req.md_buf_addr_msw,
                req.md_buf_size as usize,
            ) {
                Ok(r) => Some(r),
                Err(e) => {
                    if let Some(r) = data_range {
                        svc.memmap.release(&r);
                    }
                    respond_client(svc, &pkt, &req, ClientResponse::error(e));
                    return Err(Error::NeedMore);
                }
            }
        } else {
            None
        };

        // A pending media-format-as-metadata must fit before any data
        // lands in this buffer.
        if let Some(mf) = client.pending_mf_as_md {
            let need = mdwire::region_size(&[
                Metadata::new(mdwire::MD_ID_MEDIA_FORMAT, 0, MdValue::MediaFormat(mf)).to_wire(),
            ]);
            if (req.md_buf_size as usize) < need {
                client.min_md_size_in_next_buffer = need;
                if let Some(r) = data_range {
                    svc.memmap.release(&r);
                }
                if let Some(r) = md_range {
                    svc.memmap.release(&r);
                }
                tracing::debug!(port = %name, need, "md region cannot hold media format; rejecting buffer");
                respond_client(svc, &pkt, &req, ClientResponse::md_need_more());
                return Err(Error::NeedMore);
            }
        }
        client.min_md_size_in_next_buffer = 0;

        client.held = Some(HeldClientBuf {
            packet: pkt,
            req,
            data_range,
            md_range,
            staging: (0..num_bufs).map(|_| Vec::new()).collect(),
            frames: Vec::new(),
            data_status: STATUS_OK,
            md_status: STATUS_OK,
        });
        if let Some(mf) = client.pending_mf_as_md.take() {
            let mut md = Metadata::new(mdwire::MD_ID_MEDIA_FORMAT, 0, MdValue::MediaFormat(mf));
            md.needs_client_propagation = true;
            self.held_md.push(md);
        }
        Ok(())
    }

    /// Move one produced frame from the chain output into the held
    /// buffer. Returns bytes moved (channel-0 convention).
    pub fn collect_from_chain(&mut self, chain: &mut Chain, svc: &Services) -> Result<usize> {
        let link = chain.output_link();
        let frame = link.bufs.actual_len();
        let has_md = !link.md.is_empty();
        if frame == 0 && !has_md && !link.sdata.marker_eos {
            return Ok(0);
        }
        let link_ts = link.sdata.timestamp;
        let marker_eos = link.sdata.marker_eos;

        let mut reject_too_small = false;
        let mut buffer_full = false;
        let mut moved = 0usize;
        let mut md_base = 0usize;
        let mut fill_cap = None;

        match &mut self.flavour {
            OutFlavour::Peer(peer) => {
                let Some(held) = &mut peer.held else {
                    return Err(Error::NotReady);
                };
                let before = held.actual_len();
                let space = held.max_data_len.saturating_sub(before);
                let n = frame.min(space);
                for (src, dst) in link.bufs.bufs.iter_mut().zip(held.bufs.iter_mut()) {
                    let take = n.min(src.len());
                    dst.extend(src.drain(..take));
                }
                md_base = before;
                moved = n;
            }
            OutFlavour::Client(client) => {
                let Some(held) = &mut client.held else {
                    return Err(Error::NotReady);
                };
                let capacity = held.req.data_buf_size as usize;
                let staged_total = held.staged_total();
                let total_frame = link.bufs.total_actual();
                if total_frame > 0 && staged_total + total_frame > capacity {
                    if self.num_frames_in_buf == 0 {
                        tracing::debug!(
                            port = %self.name,
                            capacity,
                            frame = total_frame,
                            "client buffer smaller than one frame"
                        );
                        reject_too_small = true;
                    } else {
                        buffer_full = true;
                    }
                } else {
                    md_base = held.staging.first().map(Vec::len).unwrap_or(0);
                    for (src, dst) in link.bufs.bufs.iter_mut().zip(held.staging.iter_mut()) {
                        dst.extend(src.drain(..));
                    }
                    if total_frame > 0 {
                        held.frames.push((total_frame, link_ts));
                        if client.cfg.frames_per_buffer == FramesPerBuf::FillBuffer
                            && self.frames_cap_this_buf.is_none()
                        {
                            // First frame decides how many fit; later
                            // bigger frames release the buffer short.
                            let usable = capacity.saturating_sub(FILL_MODE_MD_RESERVE);
                            fill_cap = Some((usable / total_frame).max(1) as u32);
                        }
                    }
                    moved = frame;
                }
            }
        }

        if reject_too_small {
            self.release_client(svc, ClientResponse::data_need_more())?;
            return Err(Error::NeedMore);
        }
        if buffer_full {
            return Ok(0);
        }

        let taken = metadata::split_at(&mut link.md, moved);
        for mut md in taken {
            md.offset += md_base;
            self.held_md.push(md);
        }

        if moved > 0 {
            if self.num_frames_in_buf == 0 {
                self.buf_ts = Some(link_ts);
            }
            self.num_frames_in_buf += 1;
            if let Some(cap) = fill_cap {
                self.frames_cap_this_buf = Some(cap);
            }
        }
        if marker_eos {
            link.sdata.marker_eos = false;
            self.eos_delivered = true;
        }
        Ok(moved)
    }

    /// Deliver the held buffer downstream / to the client.
    pub fn write_data(&mut self, svc: &Services) -> Result<()> {
        let buf_ts = self.buf_ts.unwrap_or_default();
        let delivered = if matches!(self.flavour, OutFlavour::Peer(_)) {
            self.write_data_peer()?
        } else {
            self.write_data_client(svc)?
        };
        if buf_ts.valid && !self.ts.is_valid() {
            self.ts.set(buf_ts.value_us);
        }
        if let Some(mf) = &self.media_fmt {
            self.ts.advance(delivered, mf);
        }
        self.num_frames_in_buf = 0;
        self.frames_cap_this_buf = None;
        self.buf_ts = None;
        if self.eos_delivered {
            self.eos_delivered = false;
            self.after_flushing_eos(svc);
        }
        Ok(())
    }

    fn write_data_peer(&mut self) -> Result<usize> {
        let mf = self.media_fmt;
        let buf_ts = self.buf_ts.unwrap_or_default();
        let name = self.name.clone();
        let md: Vec<Metadata> = self.held_md.drain(..).collect();
        let OutFlavour::Peer(peer) = &mut self.flavour else {
            return Err(Error::Unexpected);
        };
        let Some(held) = peer.held.take() else {
            // Nothing held; keep the metadata for the next buffer.
            self.held_md = md;
            return Err(Error::NotReady);
        };
        let Some(data_tx) = peer.data_tx.clone() else {
            peer.held = Some(held);
            self.held_md = md;
            return Err(Error::NotReady);
        };

        // Downstream hears the format strictly before data produced
        // under it.
        if let Some(mf) = mf
            && peer.mf_sent != Some(mf)
        {
            data_tx.push_back(QueueMsg::Data(DataMsg::MediaFormat {
                format: mf,
                upstream_frame_len_us: peer.icb.downstream_frame_len_us,
            }))?;
            peer.mf_sent = Some(mf);
        }

        // One-shot prebuffer at data-flow begin absorbs downstream
        // jitter.
        if !peer.is_prebuffer_sent && peer.icb.num_reg_prebufs > 0 {
            let mut bufs: Vec<Vec<u8>> = (0..held.bufs.len()).map(|_| Vec::new()).collect();
            for b in &mut bufs {
                b.resize(held.max_data_len, 0);
            }
            let msg = DataMsg::BufferV1(DataBuffer {
                bufs,
                timestamp: TimestampInfo::default(),
                eof: false,
                md: Vec::new(),
                return_to: None,
            });
            if data_tx.push_back(QueueMsg::Data(msg)).is_ok() {
                peer.is_prebuffer_sent = true;
                tracing::debug!(port = %name, "prebuffer inserted");
            }
        }

        let delivered = held.actual_len() * held.bufs.len().max(1);
        let v2 = held.bufs.len() > 1;
        let buffer = DataBuffer {
            bufs: held.bufs,
            timestamp: buf_ts,
            eof: false,
            md,
            return_to: Some(BufReturn {
                queue: Arc::downgrade(&peer.buf_q),
            }),
        };
        let msg = if v2 {
            DataMsg::BufferV2(buffer)
        } else {
            DataMsg::BufferV1(buffer)
        };
        data_tx.push_back(QueueMsg::Data(msg)).map_err(|e| {
            tracing::warn!(port = %name, error = %e, "downstream data queue rejected buffer");
            e
        })?;
        Ok(delivered)
    }

    fn write_data_client(&mut self, svc: &Services) -> Result<usize> {
        let buf_ts = self.buf_ts.unwrap_or_default();
        let num_frames = self.num_frames_in_buf;
        let ep_id = self.module_id;
        let name = self.name.clone();
        let mut md: Vec<Metadata> = self.held_md.drain(..).collect();
        let OutFlavour::Client(client) = &mut self.flavour else {
            return Err(Error::Unexpected);
        };
        let Some(mut held) = client.held.take() else {
            self.held_md = md;
            return Err(Error::NotReady);
        };

        // Per-frame encoder records ride ahead of the rest of the list.
        if client.cfg.per_frame_md_enable {
            let mut offset = 0usize;
            for (bytes, ts) in &held.frames {
                let (lsw, msw) = split_addr(ts.value_us as u64);
                md.push(Metadata::new(
                    mdwire::MD_ID_ENCODER_FRAME_INFO,
                    offset,
                    MdValue::EncoderFrameInfo(mdwire::EncoderFrameInfo {
                        frame_size: *bytes as u32,
                        flags: if ts.valid { FLAG_TIMESTAMP_VALID } else { 0 },
                        timestamp_lsw: lsw,
                        timestamp_msw: msw,
                    }),
                ));
                offset += bytes;
            }
        }

        // Data into shared memory; caches flushed before the response
        // makes it visible.
        let data = if held.staging.len() > 1 {
            unpacked_to_packed(&held.staging)?
        } else {
            held.staging.first().cloned().unwrap_or_default()
        };
        let data_size = data.len();
        if let Some(range) = &held.data_range {
            svc.memmap.write(range, 0, &data)?;
            svc.cache.flush(range);
        }

        // Metadata region.
        let mut md_size = 0usize;
        if !md.is_empty() {
            let wire: Vec<_> = md.iter().map(Metadata::to_wire).collect();
            let need = mdwire::region_size(&wire);
            match &held.md_range {
                Some(range) if need <= range.len => {
                    let mut region = vec![0u8; need];
                    mdwire::write_region(&wire, &mut region)?;
                    svc.memmap.write(range, 0, &region)?;
                    svc.cache.flush(range);
                    md_size = need;
                }
                _ => {
                    client.min_md_size_in_next_buffer = need;
                    held.md_status = STATUS_NEED_MORE;
                    tracing::debug!(port = %name, need, "metadata did not fit client region");
                }
            }
        }

        let (ts_lsw, ts_msw) = split_addr(buf_ts.value_us as u64);
        let done = RdEpDataBufferDoneV2 {
            data_buf_addr_lsw: held.req.data_buf_addr_lsw,
            data_buf_addr_msw: held.req.data_buf_addr_msw,
            data_mem_map_handle: held.req.data_mem_map_handle,
            data_size: data_size as u32,
            num_frames,
            md_buf_addr_lsw: held.req.md_buf_addr_lsw,
            md_buf_addr_msw: held.req.md_buf_addr_msw,
            md_mem_map_handle: held.req.md_mem_map_handle,
            md_size: md_size as u32,
            timestamp_lsw: ts_lsw,
            timestamp_msw: ts_msw,
            flags: if buf_ts.valid && num_frames > 0 && data_size > 0 {
                FLAG_TIMESTAMP_VALID
            } else {
                0
            },
            data_status: held.data_status,
            md_status: held.md_status,
        };
        svc.sink
            .send(held.packet.ack(DATA_RSP_RD_EP_DATA_BUFFER_DONE_V2, done.to_bytes()));
        if let Some(r) = held.data_range {
            svc.memmap.release(&r);
        }
        if let Some(r) = held.md_range {
            svc.memmap.release(&r);
        }

        // Metadata written to the client is rendered; a list that did
        // not fit is dropped.
        let rendered = done.md_status == STATUS_OK;
        metadata::destroy_list(&mut md, !rendered, ep_id, &mut |e| svc.raise_tracking(e));
        Ok(data_size)
    }

    /// Flushing EOS left the container: reset the port and tell
    /// registered clients.
    fn after_flushing_eos(&mut self, svc: &Services) {
        tracing::debug!(port = %self.name, "flushing EOS rendered; resetting port");
        self.ts.invalidate();
        self.buf_ts = None;
        if matches!(self.flavour, OutFlavour::Client(_)) {
            svc.raise_event(EVENT_RD_EP_EOS, &[]);
        }
        if let OutFlavour::Peer(peer) = &mut self.flavour {
            peer.is_prebuffer_sent = false;
        }
    }

    /// Bytes currently accumulated toward the next delivery.
    pub fn get_filled_size(&self) -> usize {
        match &self.flavour {
            OutFlavour::Peer(p) => p.held.as_ref().map(OutBuf::actual_len).unwrap_or(0),
            OutFlavour::Client(c) => c.held.as_ref().map(HeldClientBuf::staged_total).unwrap_or(0),
        }
    }

    /// Media format reached this port: snapshot it, notify the client,
    /// and stage MF-as-metadata when enabled.
    pub fn prop_media_fmt(&mut self, mf: MediaFormat, svc: &Services) {
        if self.media_fmt == Some(mf) {
            return;
        }
        self.media_fmt = Some(mf);
        self.ts.on_media_format_change();
        if let OutFlavour::Client(client) = &mut self.flavour {
            svc.raise_event(EVENT_RD_EP_MEDIA_FORMAT, &mf.to_wire());
            if client.cfg.md_mf_enable {
                client.pending_mf_as_md = Some(mf);
            }
        }
    }

    /// Detected output timestamp discontinuity: tell the client.
    pub fn raise_ts_disc(&self, expected_us: i64, stamped_us: i64, svc: &Services) {
        if !matches!(self.flavour, OutFlavour::Client(_)) {
            return;
        }
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&expected_us.to_le_bytes());
        payload.extend_from_slice(&stamped_us.to_le_bytes());
        svc.raise_event(EVENT_RD_EP_TIMESTAMP_DISC, &payload);
    }

    /// Signal-triggered overrun: no buffer, data produced. Drop data and
    /// metadata to keep cadence.
    pub fn overrun_drop(&mut self, chain: &mut Chain, svc: &Services) {
        let link = chain.output_link();
        let dropped = link.bufs.total_actual();
        link.bufs.clear();
        metadata::destroy_list(&mut link.md, true, 0, &mut |e| svc.raise_tracking(e));
        link.sdata.marker_eos = false;
        self.overrun_count += 1;
        tracing::warn!(port = %self.name, dropped, count = self.overrun_count, "output overrun; data dropped");
    }

    /// Drop everything held (stop/flush path).
    pub fn flush(&mut self, svc: &Services) {
        metadata::destroy_list(&mut self.held_md, true, 0, &mut |e| svc.raise_tracking(e));
        self.num_frames_in_buf = 0;
        self.frames_cap_this_buf = None;
        self.buf_ts = None;
        if let OutFlavour::Peer(peer) = &mut self.flavour {
            if let Some(mut held) = peer.held.take() {
                held.clear();
                if peer.buf_q.push_back(QueueMsg::BufReturn(held)).is_err() {
                    tracing::warn!(port = %self.name, "output buffer lost on flush");
                }
            }
            peer.is_prebuffer_sent = false;
        } else {
            let _ = self.release_client(svc, ClientResponse::flushed());
        }
    }

    /// Fill the peer buffer queue up to the ICB-negotiated count of
    /// regular plus pre-buffers. No-op for the client flavour.
    pub(crate) fn prefill_peer_bufs(&mut self) {
        let (num_bufs, max_len) = self.peer_layout();
        let OutFlavour::Peer(peer) = &mut self.flavour else {
            return;
        };
        let want = (peer.icb.num_reg_bufs + peer.icb.num_reg_prebufs).max(1);
        let have = peer.buf_q.fullness();
        for _ in have..want {
            if peer
                .buf_q
                .push_back(QueueMsg::BufReturn(OutBuf::with_layout(num_bufs, max_len)))
                .is_err()
            {
                tracing::warn!("buffer queue full during prefill");
                break;
            }
        }
    }

    /// ICB renegotiation: remember the new counts and drop a stale held
    /// buffer so the next setup recreates it.
    pub fn recreate_out_buf(&mut self, icb: IcbInfo) {
        {
            let OutFlavour::Peer(peer) = &mut self.flavour else {
                return;
            };
            peer.icb = icb;
        }
        let (num_bufs, max_len) = self.peer_layout();
        if let OutFlavour::Peer(peer) = &mut self.flavour
            && peer.held.as_ref().is_some_and(|h| h.is_stale(num_bufs, max_len))
        {
            peer.held = None;
            tracing::debug!(port = %self.name, "held buffer dropped for recreate");
        }
    }

    /// Answer the held client buffer without data (errors, flush).
    fn release_client(&mut self, svc: &Services, response: ClientResponse) -> Result<()> {
        let OutFlavour::Client(client) = &mut self.flavour else {
            return Err(Error::Unexpected);
        };
        let Some(held) = client.held.take() else {
            return Ok(());
        };
        respond_client(svc, &held.packet, &held.req, response);
        if let Some(r) = held.data_range {
            svc.memmap.release(&r);
        }
        if let Some(r) = held.md_range {
            svc.memmap.release(&r);
        }
        Ok(())
    }
}

/// Status pair for a data-less client response.
struct ClientResponse {
    data_status: u32,
    md_status: u32,
}

impl ClientResponse {
    fn error(e: Error) -> Self {
        Self {
            data_status: status_of_err(e),
            md_status: STATUS_OK,
        }
    }

    fn data_need_more() -> Self {
        Self {
            data_status: STATUS_NEED_MORE,
            md_status: STATUS_OK,
        }
    }

    fn md_need_more() -> Self {
        Self {
            data_status: STATUS_OK,
            md_status: STATUS_NEED_MORE,
        }
    }

    fn flushed() -> Self {
        Self {
            data_status: STATUS_OK,
            md_status: STATUS_OK,
        }
    }
}

fn respond_client(svc: &Services, pkt: &Packet, req: &RdEpDataBufferV2, response: ClientResponse) {
    let done = RdEpDataBufferDoneV2 {
        data_buf_addr_lsw: req.data_buf_addr_lsw,
        data_buf_addr_msw: req.data_buf_addr_msw,
        data_mem_map_handle: req.data_mem_map_handle,
        data_size: 0,
        num_frames: 0,
        md_buf_addr_lsw: req.md_buf_addr_lsw,
        md_buf_addr_msw: req.md_buf_addr_msw,
        md_mem_map_handle: req.md_mem_map_handle,
        md_size: 0,
        timestamp_lsw: 0,
        timestamp_msw: 0,
        flags: 0,
        data_status: response.data_status,
        md_status: response.md_status,
    };
    svc.sink.send(pkt.ack(DATA_RSP_RD_EP_DATA_BUFFER_DONE_V2, done.to_bytes()));
}
