//! External input port: ingress staging for peer links and
//! shared-memory write-endpoint clients.

use std::sync::Arc;

use aria_sync::{Error, Queue, Result};
use aria_wire::mdwire;
use aria_wire::memmap::MappedRange;
use aria_wire::packet::{
    self, DATA_CMD_WR_EP_DATA_BUFFER_V2, DATA_CMD_WR_EP_EOS, DATA_CMD_WR_EP_MEDIA_FORMAT,
    DATA_RSP_WR_EP_DATA_BUFFER_DONE_V2, EOS_FLAG_FLUSHING, EOS_POLICY_EACH, Packet, WrEpDataBufferDoneV2,
    WrEpDataBufferV2, WrEpEos,
};
use aria_wire::status::{STATUS_OK, status_of_err};

use crate::container::Services;
use crate::media_format::MediaFormat;
use crate::metadata::{self, EosPolicy, Metadata};
use crate::msg::{BufReturn, DataBuffer, DataMsg, OutBuf, PeerPortProperty, QueueMsg};
use crate::timestamp::{TimestampInfo, TsExtrapolator};
use crate::topo::{Chain, DataFlowState, PortState};

/// Which kind of producer feeds this port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlavour {
    /// Upstream container on an intra-process link.
    Peer,
    /// Shared-memory write-endpoint client.
    Client,
}

/// Where a fully-drained staged buffer is returned to.
enum StagedRelease {
    Peer {
        return_to: Option<BufReturn>,
    },
    Client {
        packet: Packet,
        req: WrEpDataBufferV2,
        data_range: Option<MappedRange>,
        md_range: Option<MappedRange>,
        md_status: u32,
    },
}

/// Bytes (and side metadata) staged from one ingress message, drained
/// into the first module's input across preprocess calls.
struct Staged {
    /// External layout: one buffer, or one per channel/stream.
    bufs: Vec<Vec<u8>>,
    /// Bytes consumed so far, channel-0 convention.
    consumed: usize,
    eof: bool,
    ts: TimestampInfo,
    /// Offsets are channel-0 bytes relative to the staged start.
    md: Vec<Metadata>,
    release: StagedRelease,
}

impl Staged {
    /// Channel-0 bytes left to copy.
    fn remaining(&self) -> usize {
        self.per_ch_len().saturating_sub(self.consumed)
    }

    /// Channel-0 length under the consumer's channel count.
    fn per_ch_len(&self) -> usize {
        self.bufs.first().map(Vec::len).unwrap_or(0)
    }
}

/// Deferred input media format.
#[derive(Debug, Clone, Copy)]
struct PendingMf {
    format: MediaFormat,
    upstream_frame_len_us: u32,
}

/// External input port state.
pub struct ExtInPort {
    pub name: String,
    /// Framework module instance id of this endpoint.
    pub module_id: u32,
    pub queue: Arc<Queue<QueueMsg>>,
    pub bit: u32,
    pub flavour: InFlavour,
    pub chain_idx: usize,
    pub state: PortState,
    pub data_flow: DataFlowState,
    pub media_fmt: Option<MediaFormat>,
    pub upstream_frame_len_us: u32,
    pub upstream_real_time: bool,
    /// Raised when the engine must re-propagate formats and thresholds.
    pub media_fmt_event: bool,
    pub discontinuity: bool,
    pub underrun_count: u64,
    staged: Option<Staged>,
    pending_mf: Option<PendingMf>,
    ts_track: TsExtrapolator,
}

impl std::fmt::Debug for ExtInPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtInPort")
            .field("name", &self.name)
            .field("flavour", &self.flavour)
            .field("state", &self.state)
            .field("staged", &self.staged.is_some())
            .finish()
    }
}

impl ExtInPort {
    pub fn new(
        name: impl Into<String>,
        module_id: u32,
        flavour: InFlavour,
        queue: Arc<Queue<QueueMsg>>,
        bit: u32,
        chain_idx: usize,
    ) -> Self {
        Self {
            name: name.into(),
            module_id,
            queue,
            bit,
            flavour,
            chain_idx,
            state: PortState::Stopped,
            data_flow: DataFlowState::AtGap,
            media_fmt: None,
            upstream_frame_len_us: 0,
            upstream_real_time: false,
            media_fmt_event: false,
            discontinuity: false,
            underrun_count: 0,
            staged: None,
            pending_mf: None,
            ts_track: TsExtrapolator::new(),
        }
    }

    pub fn has_staged_data(&self) -> bool {
        self.staged.as_ref().is_some_and(|s| s.remaining() > 0)
    }

    /// A message is held, drained or not. A drained one still owes its
    /// release on the next preprocess pass.
    pub fn has_staged_msg(&self) -> bool {
        self.staged.is_some()
    }

    /// One wake-up's worth of ingress work: dequeue a message and
    /// classify it. Data messages stage; control-ish messages apply.
    pub fn handle_trigger(&mut self, chain: &mut Chain, svc: &Services, tolerance_us: u64) -> Result<()> {
        if self.staged.is_some() {
            // Still draining the previous message.
            return Ok(());
        }
        let msg = match self.queue.pop_front() {
            Ok(m) => m,
            Err(Error::NeedMore) => return Ok(()),
            Err(e) => return Err(e),
        };
        match msg {
            QueueMsg::Data(data) => self.handle_peer_msg(data, chain, tolerance_us),
            QueueMsg::Packet(pkt) => self.handle_client_packet(pkt, chain, svc, tolerance_us),
            other => {
                tracing::warn!(port = %self.name, ?other, "unexpected message on data queue");
                Ok(())
            }
        }
    }

    fn handle_peer_msg(&mut self, msg: DataMsg, chain: &mut Chain, tolerance_us: u64) -> Result<()> {
        match msg {
            DataMsg::BufferV1(b) | DataMsg::BufferV2(b) => self.stage_peer_buffer(b, chain, tolerance_us),
            DataMsg::MediaFormat {
                format,
                upstream_frame_len_us,
            } => self.accept_media_format(format, upstream_frame_len_us, chain),
            DataMsg::Eos { flushing, policy } => {
                self.stage_eos(chain, flushing, policy, None);
                Ok(())
            }
            DataMsg::DataFlowGap => {
                self.stage_dfg(chain);
                Ok(())
            }
            DataMsg::PeerProperty(prop) => {
                self.apply_peer_property(prop, chain);
                Ok(())
            }
        }
    }

    fn stage_peer_buffer(&mut self, buffer: DataBuffer, chain: &mut Chain, tolerance_us: u64) -> Result<()> {
        let DataBuffer {
            bufs,
            timestamp,
            eof,
            mut md,
            return_to,
        } = buffer;
        let bufs = self.normalize_layout(bufs, &mut md, chain)?;
        self.note_new_data(chain, timestamp, tolerance_us);
        self.staged = Some(Staged {
            bufs,
            consumed: 0,
            eof,
            ts: timestamp,
            md,
            release: StagedRelease::Peer { return_to },
        });
        self.data_flow = DataFlowState::Flowing;
        Ok(())
    }

    /// Re-shape a single packed-deinterleaved buffer into the internal
    /// per-channel layout so consumed-byte accounting stays channel-0
    /// based throughout. Metadata offsets scale down with it.
    fn normalize_layout(
        &self,
        bufs: Vec<Vec<u8>>,
        md: &mut [Metadata],
        chain: &Chain,
    ) -> Result<Vec<Vec<u8>>> {
        let n_link = chain.links[0].bufs.num_bufs();
        if n_link <= 1 || bufs.len() != 1 {
            return Ok(bufs);
        }
        let Some(pcm) = self.media_fmt.as_ref().and_then(|m| m.as_pcm()) else {
            return Ok(bufs);
        };
        let split = crate::media_format::packed_to_unpacked(&bufs[0], pcm)?;
        for m in md.iter_mut() {
            m.offset /= n_link;
        }
        Ok(split)
    }

    fn handle_client_packet(
        &mut self,
        pkt: Packet,
        chain: &mut Chain,
        svc: &Services,
        tolerance_us: u64,
    ) -> Result<()> {
        match pkt.opcode {
            DATA_CMD_WR_EP_DATA_BUFFER_V2 => self.stage_client_buffer(pkt, chain, svc, tolerance_us),
            DATA_CMD_WR_EP_MEDIA_FORMAT => {
                match MediaFormat::from_wire(&pkt.payload) {
                    Ok(mf) => self.accept_media_format(mf, 0, chain)?,
                    Err(e) => {
                        tracing::error!(port = %self.name, error = %e, "bad client media format");
                    }
                }
                Ok(())
            }
            DATA_CMD_WR_EP_EOS => {
                let eos = WrEpEos::from_bytes(&pkt.payload).unwrap_or_default();
                self.stage_eos(
                    chain,
                    eos.flags & EOS_FLAG_FLUSHING != 0,
                    if eos.policy == EOS_POLICY_EACH {
                        EosPolicy::Each
                    } else {
                        EosPolicy::Last
                    },
                    None,
                );
                Ok(())
            }
            other => {
                tracing::error!(port = %self.name, opcode = format_args!("{other:#x}"), "unsupported data opcode");
                svc.sink.send(pkt.ack(other, status_of_err(Error::Unsupported).to_le_bytes().to_vec()));
                Ok(())
            }
        }
    }

    /// §data-buffer-v2 arrival: validate, resolve, invalidate caches,
    /// parse metadata, stage bytes.
    fn stage_client_buffer(
        &mut self,
        pkt: Packet,
        chain: &mut Chain,
        svc: &Services,
        tolerance_us: u64,
    ) -> Result<()> {
        let req = match WrEpDataBufferV2::from_bytes(&pkt.payload) {
            Ok(r) => r,
            Err(e) => {
                self.nack_client(&pkt, &WrEpDataBufferV2::default(), status_of_err(e), STATUS_OK, svc);
                return Ok(());
            }
        };

        // Nothing in either region: hand it straight back.
        if req.data_buf_size == 0 && req.md_buf_size == 0 {
            tracing::debug!(port = %self.name, "zero-size client buffer returned");
            self.nack_client(&pkt, &req, STATUS_OK, STATUS_OK, svc);
            return Ok(());
        }

        // PCM buffers must carry whole sample units.
        if let Some(pcm) = self.media_fmt.as_ref().and_then(|m| m.as_pcm())
            && req.data_buf_size as usize % pcm.unit_size() != 0
        {
            tracing::error!(
                port = %self.name,
                size = req.data_buf_size,
                unit = pcm.unit_size(),
                "client buffer does not hold whole PCM units"
            );
            self.nack_client(&pkt, &req, status_of_err(Error::BadParam), STATUS_OK, svc);
            return Ok(());
        }

        let mut data = Vec::new();
        let mut data_range = None;
        if req.data_buf_size > 0 {
            match svc.memmap.resolve(
                req.data_mem_map_handle,
                req.data_buf_addr_lsw,
                req.data_buf_addr_msw,
                req.data_buf_size as usize,
            ) {
                Ok(range) => {
                    svc.cache.invalidate(&range);
                    data = svc.memmap.read_vec(&range)?;
                    data_range = Some(range);
                }
                Err(e) => {
                    self.nack_client(&pkt, &req, status_of_err(e), STATUS_OK, svc);
                    return Ok(());
                }
            }
        }

        // Metadata region: failures here still deliver the data.
        let mut md = Vec::new();
        let mut md_range = None;
        let mut md_status = STATUS_OK;
        if req.md_buf_size > 0 {
            match svc.memmap.resolve(
                req.md_mem_map_handle,
                req.md_buf_addr_lsw,
                req.md_buf_addr_msw,
                req.md_buf_size as usize,
            ) {
                Ok(range) => {
                    svc.cache.invalidate(&range);
                    let region = svc.memmap.read_vec(&range)?;
                    match mdwire::parse_region(&region) {
                        Ok(wire_mds) => {
                            for wmd in &wire_mds {
                                match Metadata::from_wire(wmd) {
                                    Ok(m) => md.push(m),
                                    Err(e) => md_status = status_of_err(e),
                                }
                            }
                        }
                        Err(e) => md_status = status_of_err(e),
                    }
                    md_range = Some(range);
                }
                Err(e) => md_status = status_of_err(e),
            }
        }

        let ts = TimestampInfo {
            value_us: req.timestamp() as i64,
            valid: req.flags & packet::FLAG_TIMESTAMP_VALID != 0,
            continue_flag: req.flags & packet::FLAG_TIMESTAMP_CONTINUE != 0,
        };
        let eof = req.flags & packet::FLAG_EOF != 0;

        let bufs = match self.normalize_layout(vec![data], &mut md, chain) {
            Ok(bufs) => bufs,
            Err(e) => {
                self.nack_client(&pkt, &req, status_of_err(e), md_status, svc);
                if let Some(r) = data_range {
                    svc.memmap.release(&r);
                }
                if let Some(r) = md_range {
                    svc.memmap.release(&r);
                }
                return Ok(());
            }
        };
        self.note_new_data(chain, ts, tolerance_us);
        self.staged = Some(Staged {
            bufs,
            consumed: 0,
            eof,
            ts,
            md,
            release: StagedRelease::Client {
                packet: pkt,
                req,
                data_range,
                md_range,
                md_status,
            },
        });
        self.data_flow = DataFlowState::Flowing;
        Ok(())
    }

    /// Bookkeeping shared by both flavours when a data buffer arrives:
    /// discontinuity detection and demotion of a pending flushing EOS.
    fn note_new_data(&mut self, chain: &mut Chain, ts: TimestampInfo, tolerance_us: u64) {
        if ts.valid && !ts.continue_flag && self.ts_track.is_discontinuous(ts.value_us, tolerance_us) {
            tracing::debug!(
                port = %self.name,
                stamped = ts.value_us,
                expected = self.ts_track.current_us(),
                "input timestamp discontinuity"
            );
            self.discontinuity = true;
        }
        let link = &mut chain.links[0];
        if metadata::has_flushing_eos(&link.md) {
            let gaps = metadata::modify_on_new_data(&mut link.md);
            for gap in gaps {
                gap.destroy(true, 0, &mut |_e| {});
            }
        }
    }

    pub(crate) fn accept_media_format(
        &mut self,
        format: MediaFormat,
        upstream_frame_len_us: u32,
        chain: &mut Chain,
    ) -> Result<()> {
        format.validate()?;
        let at_gap = matches!(self.data_flow, DataFlowState::AtGap | DataFlowState::PreFlow);
        let can_apply_now =
            matches!(self.state, PortState::Prepared) || (self.state == PortState::Started && at_gap);
        let is_noop = self.media_fmt == Some(format);
        if is_noop {
            return Ok(());
        }
        if can_apply_now && !self.has_staged_data() && chain.links[0].bufs.is_empty() {
            self.apply_media_format(format, upstream_frame_len_us, chain);
        } else {
            tracing::debug!(port = %self.name, "media format deferred until in-flight data drains");
            self.pending_mf = Some(PendingMf {
                format,
                upstream_frame_len_us,
            });
            // Old-format bytes must flush out of the modules first.
            chain.links[0].sdata.eof = true;
        }
        Ok(())
    }

    fn apply_media_format(&mut self, format: MediaFormat, upstream_frame_len_us: u32, chain: &mut Chain) {
        self.media_fmt = Some(format);
        if upstream_frame_len_us != 0 {
            self.upstream_frame_len_us = upstream_frame_len_us;
        }
        chain.links[0].media_fmt = Some(format);
        self.media_fmt_event = true;
        self.ts_track.on_media_format_change();
        tracing::debug!(port = %self.name, ?format, "input media format applied");
    }

    /// Convert an EOS message into list metadata at the end of pending
    /// bytes.
    fn stage_eos(&mut self, chain: &mut Chain, flushing: bool, policy: EosPolicy, tracking: Option<crate::metadata::Tracking>) {
        let link = &mut chain.links[0];
        let offset = link.bufs.actual_len();
        let mut md = Metadata::eos(offset, flushing, policy);
        if let Some(t) = tracking {
            md = md.with_tracking(t);
        }
        link.md.push(md);
        if flushing {
            self.data_flow = DataFlowState::AtGap;
        }
        tracing::debug!(port = %self.name, flushing, offset, "EOS staged");
    }

    fn stage_dfg(&mut self, chain: &mut Chain) {
        let link = &mut chain.links[0];
        let offset = link.bufs.actual_len();
        link.md.push(Metadata::dfg(offset));
        self.data_flow = DataFlowState::AtGap;
    }

    fn apply_peer_property(&mut self, prop: PeerPortProperty, chain: &mut Chain) {
        if let Some(state) = prop.state {
            self.state = state;
            chain.links[0].state = state;
        }
        if let Some(rt) = prop.is_real_time {
            self.upstream_real_time = rt;
        }
        if let Some(len) = prop.frame_len_us {
            self.upstream_frame_len_us = len;
        }
    }

    /// Copy staged bytes into the first module's input, bounded by the
    /// link's free space and the non-blocking-chain end. Returns bytes
    /// copied (channel-0 convention).
    pub fn preprocess(&mut self, chain: &mut Chain, svc: &Services) -> Result<usize> {
        // A message fully drained on a previous pass acks now, after the
        // frame it fed has been delivered; only then may a flushing EOS
        // right behind it be pulled in.
        if self.staged.as_ref().is_some_and(|s| s.remaining() == 0) {
            self.release_drained(chain, svc)?;
        }

        // A deferred format applies once everything old has drained.
        if self.staged.is_none()
            && let Some(pending) = self.pending_mf
            && chain.links[0].bufs.is_empty()
        {
            self.pending_mf = None;
            chain.links[0].sdata.eof = false;
            self.apply_media_format(pending.format, pending.upstream_frame_len_us, chain);
            return Ok(0);
        }

        let Some(staged) = &mut self.staged else {
            return Ok(0);
        };
        let nblc_free = {
            let first_free = chain.links[0].bufs.free_space();
            chain.nblc_free_space().min(first_free)
        };
        let link = &mut chain.links[0];

        if self.discontinuity && !link.bufs.is_empty() {
            // Old-stamp bytes drain before new-stamp bytes mix in.
            return Ok(0);
        }

        let mut to_copy = staged.remaining().min(nblc_free);
        if let Some(pcm) = self.media_fmt.as_ref().and_then(|m| m.as_pcm()) {
            let unit = if link.bufs.num_bufs() > 1 {
                pcm.bytes_per_sample()
            } else {
                pcm.unit_size()
            };
            if unit > 0 {
                to_copy -= to_copy % unit;
            }
        }
        if to_copy == 0 {
            return Ok(0);
        }

        let link_was_empty = link.bufs.is_empty();
        let link_bytes_before = link.bufs.actual_len();
        copy_staged(staged, link, to_copy)?;

        // Metadata anchored inside the copied span migrates with it.
        // Staged offsets are kept relative to the unconsumed region, so
        // the split boundary is the bytes moving right now.
        let consumed_before = staged.consumed;
        staged.consumed += to_copy;
        let crossing = metadata::split_at(&mut staged.md, to_copy);
        for mut md in crossing {
            md.offset += link_bytes_before;
            link.md.push(md);
        }

        if link_was_empty && staged.ts.valid {
            let mut adopted = staged.ts;
            if consumed_before > 0
                && let Some(bps) = self.media_fmt.as_ref().and_then(MediaFormat::bytes_per_ms)
            {
                let total = consumed_before * link.bufs.num_bufs().max(1);
                adopted.value_us += (total as u64 * 1000 / bps.max(1)) as i64;
            }
            link.sdata.timestamp = adopted;
            self.ts_track.set(adopted.value_us);
            self.discontinuity = false;
        }
        if let Some(mf) = &self.media_fmt {
            self.ts_track.advance(to_copy * link.bufs.num_bufs().max(1), mf);
        }

        if staged.remaining() == 0 && staged.eof {
            link.sdata.eof = true;
        }
        Ok(to_copy)
    }

    /// Ack / return a fully-drained message, then pop a directly
    /// following flushing EOS so gapless boundaries land in the same
    /// frame.
    fn release_drained(&mut self, chain: &mut Chain, svc: &Services) -> Result<()> {
        let Some(staged) = self.staged.take() else {
            return Ok(());
        };
        match staged.release {
            StagedRelease::Peer { return_to } => {
                if let Some(ret) = return_to {
                    let max = staged.bufs.iter().map(Vec::capacity).max().unwrap_or(0);
                    ret.give_back(OutBuf {
                        bufs: staged.bufs,
                        max_data_len: max,
                    });
                }
            }
            StagedRelease::Client {
                packet,
                req,
                data_range,
                md_range,
                md_status,
            } => {
                let done = WrEpDataBufferDoneV2 {
                    data_buf_addr_lsw: req.data_buf_addr_lsw,
                    data_buf_addr_msw: req.data_buf_addr_msw,
                    data_mem_map_handle: req.data_mem_map_handle,
                    data_status: STATUS_OK,
                    md_buf_addr_lsw: req.md_buf_addr_lsw,
                    md_buf_addr_msw: req.md_buf_addr_msw,
                    md_mem_map_handle: req.md_mem_map_handle,
                    md_status,
                };
                svc.sink
                    .send(packet.ack(DATA_RSP_WR_EP_DATA_BUFFER_DONE_V2, done.to_bytes()));
                if let Some(r) = data_range {
                    svc.memmap.release(&r);
                }
                if let Some(r) = md_range {
                    svc.memmap.release(&r);
                }
            }
        }
        self.pop_immediate_eos(chain)
    }

    /// The fused pop: a flushing EOS sitting right behind the drained
    /// buffer is consumed now, before any further DATA is looked at.
    /// Gapless decoders depend on seeing the boundary in the same frame.
    fn pop_immediate_eos(&mut self, chain: &mut Chain) -> Result<()> {
        let is_flushing_eos = self
            .queue
            .peek_front(|msg| match msg {
                QueueMsg::Data(DataMsg::Eos { flushing, .. }) => *flushing,
                QueueMsg::Packet(pkt) if pkt.opcode == DATA_CMD_WR_EP_EOS => WrEpEos::from_bytes(&pkt.payload)
                    .map(|eos| eos.flags & EOS_FLAG_FLUSHING != 0)
                    .unwrap_or(false),
                _ => false,
            })
            .unwrap_or(false);
        if !is_flushing_eos {
            return Ok(());
        }
        match self.queue.pop_front() {
            Ok(QueueMsg::Data(DataMsg::Eos { flushing, policy })) => {
                self.stage_eos(chain, flushing, policy, None);
            }
            Ok(QueueMsg::Packet(pkt)) => {
                let eos = WrEpEos::from_bytes(&pkt.payload).unwrap_or_default();
                self.stage_eos(
                    chain,
                    eos.flags & EOS_FLAG_FLUSHING != 0,
                    if eos.policy == EOS_POLICY_EACH {
                        EosPolicy::Each
                    } else {
                        EosPolicy::Last
                    },
                    None,
                );
            }
            Ok(other) => {
                tracing::error!(port = %self.name, ?other, "peeked EOS vanished");
            }
            Err(_) => {}
        }
        Ok(())
    }

    /// Zero-fill up to `threshold` bytes on underrun so a signal-driven
    /// topology keeps cadence; the frames are marked as erasure.
    pub fn underrun_fill(&mut self, chain: &mut Chain, threshold: usize) {
        let link = &mut chain.links[0];
        let have = link.bufs.actual_len();
        if have >= threshold {
            return;
        }
        let fill = (threshold - have).min(link.bufs.free_space());
        for buf in &mut link.bufs.bufs {
            buf.extend(std::iter::repeat_n(0u8, fill));
        }
        link.sdata.erasure = true;
        self.underrun_count += 1;
        tracing::debug!(port = %self.name, fill, count = self.underrun_count, "underrun zero-fill");
    }

    /// Flush everything staged and pending (stop path). Metadata is
    /// destroyed as dropped.
    pub fn flush(&mut self, chain: &mut Chain, svc: &Services) {
        if let Some(mut staged) = self.staged.take() {
            metadata::destroy_list(&mut staged.md, true, 0, &mut |e| svc.raise_tracking(e));
            match staged.release {
                StagedRelease::Peer { return_to } => {
                    if let Some(ret) = return_to {
                        let max = staged.bufs.iter().map(Vec::capacity).max().unwrap_or(0);
                        ret.give_back(OutBuf {
                            bufs: staged.bufs,
                            max_data_len: max,
                        });
                    }
                }
                StagedRelease::Client {
                    packet,
                    req,
                    data_range,
                    md_range,
                    md_status,
                } => {
                    self.nack_with(&packet, &req, STATUS_OK, md_status, svc);
                    if let Some(r) = data_range {
                        svc.memmap.release(&r);
                    }
                    if let Some(r) = md_range {
                        svc.memmap.release(&r);
                    }
                }
            }
        }
        let link = &mut chain.links[0];
        link.bufs.clear();
        metadata::destroy_list(&mut link.md, true, 0, &mut |e| svc.raise_tracking(e));
        link.sdata = Default::default();
        self.pending_mf = None;
        self.discontinuity = false;
        self.ts_track.invalidate();
    }

    fn nack_client(&self, pkt: &Packet, req: &WrEpDataBufferV2, data_status: u32, md_status: u32, svc: &Services) {
        self.nack_with(pkt, req, data_status, md_status, svc);
    }

    fn nack_with(&self, pkt: &Packet, req: &WrEpDataBufferV2, data_status: u32, md_status: u32, svc: &Services) {
        let done = WrEpDataBufferDoneV2 {
            data_buf_addr_lsw: req.data_buf_addr_lsw,
            data_buf_addr_msw: req.data_buf_addr_msw,
            data_mem_map_handle: req.data_mem_map_handle,
            data_status,
            md_buf_addr_lsw: req.md_buf_addr_lsw,
            md_buf_addr_msw: req.md_buf_addr_msw,
            md_mem_map_handle: req.md_mem_map_handle,
            md_status,
        };
        svc.sink
            .send(pkt.ack(DATA_RSP_WR_EP_DATA_BUFFER_DONE_V2, done.to_bytes()));
    }
}

/// Copy `to_copy` channel-0 bytes from staged layout into link layout,
/// converting packed-deinterleaved to unpacked when the channel counts
/// differ.
fn copy_staged(staged: &mut Staged, link: &mut crate::topo::LinkState, to_copy: usize) -> Result<usize> {
    let n_link = link.bufs.num_bufs().max(1);
    let n_staged = staged.bufs.len();
    if n_staged == n_link {
        // Same layout: per-buffer append.
        for (src, dst) in staged.bufs.iter().zip(link.bufs.bufs.iter_mut()) {
            let start = staged.consumed;
            let end = (start + to_copy).min(src.len());
            dst.extend_from_slice(&src[start..end]);
        }
        Ok(to_copy)
    } else if n_staged == 1 && n_link > 1 {
        // Packed-deinterleaved source: whole-channel runs inside one
        // buffer, split into per-channel destinations.
        let src = &staged.bufs[0];
        if src.len() % n_link != 0 {
            return Err(Error::BadParam);
        }
        let per_ch = src.len() / n_link;
        for (ch, dst) in link.bufs.bufs.iter_mut().enumerate() {
            let start = ch * per_ch + staged.consumed;
            let end = (start + to_copy).min((ch + 1) * per_ch);
            dst.extend_from_slice(&src[start..end]);
        }
        Ok(to_copy)
    } else {
        tracing::error!(n_staged, n_link, "unsupported layout conversion");
        Err(Error::Unsupported)
    }
}
