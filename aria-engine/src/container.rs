//! The generic container: composition root and worker lifecycle.
//!
//! A container owns one channel, its queues, a topology of chains and
//! the external ports, and runs one worker thread that blocks only in
//! the channel wait. Commands arrive on a priority queue and are acked
//! exactly once; a placeholder bind that needs a bigger stack makes the
//! worker re-launch itself and resume from an explicit continuation.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use aria_sync::{
    Channel, ChannelSignal, Error, HeapId, MemTracker, Queue, QueueAttr, QueuePools, Result,
};
use aria_wire::cache::CacheOps;
use aria_wire::memmap::MemMapRegistry;
use aria_wire::packet::{
    ClientId, EVENT_EP_OPERATING_FRAME_SIZE, EVENT_MD_TRACKING, EVENT_RD_EP_MEDIA_FORMAT, Packet,
    PARAM_ID_MEDIA_FORMAT, PARAM_ID_MODULE_ENABLE, PARAM_ID_PEER_CLIENT_PROPERTY, PARAM_ID_RD_EP_CFG,
    PARAM_ID_REAL_MODULE_ID, PARAM_ID_RESET_PLACEHOLDER_MODULE,
};
use aria_wire::status::status_of_err;

use crate::config::EngineConfig;
use crate::events::{EventRegistry, PacketSink};
use crate::media_format::MediaFormat;
use crate::metadata::{self, TrackingEvent};
use crate::msg::{CmdAck, CmdMsg, GraphOp, PeerPortProperty, QueueMsg};
use crate::placeholder::{CachedEventReg, ModuleDb};
use crate::ports::ext_in::{ExtInPort, InFlavour};
use crate::ports::ext_out::{ClientOut, ExtOutPort, IcbInfo, OutFlavour, PeerOut, RdEpCfg};
use crate::sched::ProcessInfo;
use crate::timestamp::{Clock, MonotonicClock};
use crate::topo::propagation::Votes;
use crate::topo::{Chain, DataFlowState, ModuleHost, ModuleSlot, PortState};

/// Shared infrastructure the data path consumes. Constructed once per
/// container; nothing here is a global.
pub struct Services {
    pub memmap: Arc<MemMapRegistry>,
    pub cache: CacheOps,
    pub sink: Box<dyn PacketSink>,
    pub tracker: Arc<MemTracker>,
    pub pools: Arc<QueuePools<QueueMsg>>,
    pub clock: Arc<dyn Clock>,
    pub events: Mutex<EventRegistry>,
}

impl Services {
    /// Fan an event out to its registered clients.
    pub fn raise_event(&self, event_id: u32, payload: &[u8]) -> usize {
        self.events.lock().raise(event_id, payload, self.sink.as_ref())
    }

    /// Deliver a metadata tracking event to the interested client.
    pub fn raise_tracking(&self, ev: TrackingEvent) {
        let t = ev.tracking;
        let client = ClientId {
            src_domain: t.src_domain as u8,
            dst_domain: t.dst_domain as u8,
            src_port: t.src_port,
            dst_port: t.dst_port,
        };
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&t.token.to_le_bytes());
        payload.extend_from_slice(&(ev.is_dropped as u32).to_le_bytes());
        payload.extend_from_slice(&ev.rendered_port_id.to_le_bytes());
        self.sink.send(Packet::new(EVENT_MD_TRACKING, 0, client, payload));
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}

/// Work resumed at the top of the worker loop, typically across a
/// thread re-launch.
#[derive(Debug)]
pub enum PendingWork {
    FinishBind {
        chain_idx: usize,
        module_idx: usize,
        ack: CmdAck,
    },
}

/// Why the worker function returned.
pub enum WorkerExit {
    Done,
    /// Re-launch on a bigger stack and keep going.
    Relaunch { stack: usize, container: Box<Container> },
}

enum CmdOutcome {
    Continue,
    Exit,
    Relaunch(usize),
}

/// The generic container engine.
pub struct Container {
    pub config: EngineConfig,
    pub services: Services,
    pub channel: Arc<Channel>,
    pub(crate) cmd_q: Arc<Queue<QueueMsg>>,
    pub(crate) cmd_bit: u32,
    pub(crate) signal_trigger: Option<Arc<ChannelSignal>>,
    pub chains: Vec<Chain>,
    pub ext_in: Vec<ExtInPort>,
    pub ext_out: Vec<ExtOutPort>,
    pub process_info: ProcessInfo,
    pub votes: Votes,
    pub(crate) graph_state: PortState,
    pub(crate) module_db: Arc<dyn ModuleDb>,
    pub(crate) pending: Option<PendingWork>,
    pub(crate) current_stack: usize,
    pub(crate) cur_priority: i32,
    opened: bool,
}

impl Container {
    /// Worker entry point. Returns when the graph closes or a re-launch
    /// is required.
    pub fn run(mut self) -> WorkerExit {
        tracing::debug!(name = %self.config.name, "container worker running");
        loop {
            if let Some(pending) = self.pending.take() {
                self.resume_pending(pending);
            }
            let mask = self.compute_wait_mask();
            let fired = self.channel.wait(mask);
            if fired & self.cmd_bit != 0 {
                match self.handle_commands() {
                    CmdOutcome::Continue => {}
                    CmdOutcome::Exit => {
                        tracing::debug!(name = %self.config.name, "container worker exiting");
                        return WorkerExit::Done;
                    }
                    CmdOutcome::Relaunch(stack) => {
                        tracing::debug!(stack, "worker re-launch for module stack");
                        return WorkerExit::Relaunch {
                            stack,
                            container: Box::new(self),
                        };
                    }
                }
            }
            let data_fired = fired & !self.cmd_bit;
            if data_fired != 0 && self.graph_state == PortState::Started {
                self.data_process_outer(data_fired);
            }
        }
    }

    fn resume_pending(&mut self, pending: PendingWork) {
        match pending {
            PendingWork::FinishBind {
                chain_idx,
                module_idx,
                ack,
            } => {
                let result = self.finish_module_bind(chain_idx, module_idx);
                ack.complete(result);
            }
        }
    }

    // -----------------------------------------------------------------
    // Command path
    // -----------------------------------------------------------------

    fn handle_commands(&mut self) -> CmdOutcome {
        loop {
            let msg = match self.cmd_q.pop_front() {
                Ok(m) => m,
                Err(_) => return CmdOutcome::Continue,
            };
            let QueueMsg::Cmd(cmd) = msg else {
                tracing::warn!("non-command message on command queue");
                continue;
            };
            match cmd {
                CmdMsg::GraphMgmt { op, ack } => {
                    let result = self.apply_graph_op(op);
                    let exit = op == GraphOp::Close && result.is_ok();
                    ack.complete(result);
                    if exit {
                        return CmdOutcome::Exit;
                    }
                }
                CmdMsg::SetCfg {
                    module_id,
                    param_id,
                    payload,
                    ack,
                } => {
                    if let Some(stack) = self.handle_set_cfg(module_id, param_id, &payload, ack) {
                        return CmdOutcome::Relaunch(stack);
                    }
                }
                CmdMsg::RegisterEvent {
                    module_id,
                    event_id,
                    client,
                    config,
                    register,
                    ack,
                } => {
                    let result = self.handle_register_event(module_id, event_id, client, config, register);
                    ack.complete(result);
                }
                CmdMsg::MediaFormat {
                    module_id,
                    format,
                    upstream_frame_len_us,
                    ack,
                } => {
                    let result = self.handle_cmd_media_format(module_id, format, upstream_frame_len_us);
                    ack.complete(result);
                }
                CmdMsg::Gpr(pkt) => {
                    tracing::warn!(opcode = format_args!("{:#x}", pkt.opcode), "unsupported GPR command");
                    self.services
                        .sink
                        .send(pkt.ack(pkt.opcode, status_of_err(Error::Unsupported).to_le_bytes().to_vec()));
                }
            }
        }
    }

    fn apply_graph_op(&mut self, op: GraphOp) -> Result<()> {
        tracing::debug!(?op, state = ?self.graph_state, "graph command");
        match op {
            GraphOp::Open => {
                if self.opened {
                    return Err(Error::Unexpected);
                }
                self.opened = true;
                Ok(())
            }
            GraphOp::Prepare => {
                if !self.opened {
                    return Err(Error::Unexpected);
                }
                self.set_all_states(PortState::Prepared);
                for ci in 0..self.chains.len() {
                    if self.chains[ci].links[0].media_fmt.is_some() {
                        self.handle_media_fmt_event(ci, 0);
                    }
                }
                self.graph_state = PortState::Prepared;
                Ok(())
            }
            GraphOp::Start => {
                if !self.opened {
                    return Err(Error::Unexpected);
                }
                self.set_all_states(PortState::Started);
                for port in &mut self.ext_in {
                    port.data_flow = DataFlowState::PreFlow;
                }
                for port in &mut self.ext_out {
                    port.prefill_peer_bufs();
                }
                self.graph_state = PortState::Started;
                let frame_us = self.config.effective_operating_frame_us();
                self.services
                    .raise_event(EVENT_EP_OPERATING_FRAME_SIZE, &frame_us.to_le_bytes());
                Ok(())
            }
            GraphOp::Stop => {
                self.flush_everything();
                self.set_all_states(PortState::Stopped);
                self.graph_state = PortState::Stopped;
                Ok(())
            }
            GraphOp::Close => {
                if self.graph_state == PortState::Started {
                    self.flush_everything();
                    self.set_all_states(PortState::Stopped);
                }
                self.graph_state = PortState::Stopped;
                Ok(())
            }
        }
    }

    fn set_all_states(&mut self, state: PortState) {
        for chain in &mut self.chains {
            for link in &mut chain.links {
                link.state = state;
            }
        }
        for port in &mut self.ext_in {
            port.state = state;
        }
        for port in &mut self.ext_out {
            port.state = state;
        }
    }

    fn flush_everything(&mut self) {
        for ii in 0..self.ext_in.len() {
            let ci = self.ext_in[ii].chain_idx;
            self.ext_in[ii].flush(&mut self.chains[ci], &self.services);
        }
        for port in &mut self.ext_out {
            port.flush(&self.services);
        }
        for chain in &mut self.chains {
            for link in &mut chain.links {
                link.bufs.clear();
                metadata::destroy_list(&mut link.md, true, 0, &mut |e| self.services.raise_tracking(e));
                link.sdata = Default::default();
            }
        }
    }

    /// Apply one set-config. Returns the required stack when a
    /// placeholder bind needs a re-launch (the ack is then owed by the
    /// pending continuation).
    fn handle_set_cfg(&mut self, module_id: u32, param_id: u32, payload: &[u8], ack: CmdAck) -> Option<usize> {
        match param_id {
            PARAM_ID_REAL_MODULE_ID => {
                let real_id = match read_u32(payload) {
                    Ok(v) => v,
                    Err(e) => {
                        ack.complete(Err(e));
                        return None;
                    }
                };
                let Some((ci, mi)) = self.find_slot(module_id) else {
                    ack.complete(Err(Error::BadParam));
                    return None;
                };
                let stack = {
                    let ModuleHost::Placeholder(ph) = &mut self.chains[ci].modules[mi].host else {
                        ack.complete(Err(Error::Unsupported));
                        return None;
                    };
                    match ph.begin_bind(real_id, self.module_db.as_ref()) {
                        Ok(stack) => stack,
                        Err(e) => {
                            ack.complete(Err(e));
                            return None;
                        }
                    }
                };
                if stack > self.current_stack {
                    tracing::debug!(stack, current = self.current_stack, "module needs a bigger worker stack");
                    self.pending = Some(PendingWork::FinishBind {
                        chain_idx: ci,
                        module_idx: mi,
                        ack,
                    });
                    return Some(stack);
                }
                ack.complete(self.finish_module_bind(ci, mi));
                None
            }
            PARAM_ID_MODULE_ENABLE => {
                ack.complete(self.handle_module_enable(module_id, payload));
                None
            }
            PARAM_ID_RESET_PLACEHOLDER_MODULE => {
                ack.complete(self.handle_placeholder_reset(module_id));
                None
            }
            PARAM_ID_RD_EP_CFG => {
                ack.complete(self.handle_rd_ep_cfg(module_id, payload));
                None
            }
            PARAM_ID_PEER_CLIENT_PROPERTY => {
                ack.complete(self.handle_peer_client_property(module_id, payload));
                None
            }
            PARAM_ID_MEDIA_FORMAT => {
                let result = MediaFormat::from_wire(payload)
                    .and_then(|mf| self.handle_cmd_media_format(module_id, mf, 0));
                ack.complete(result);
                None
            }
            _ => {
                let result = (|| {
                    let (ci, mi) = self.find_slot(module_id).ok_or(Error::BadParam)?;
                    match &mut self.chains[ci].modules[mi].host {
                        ModuleHost::Real(m) => m.set_param(param_id, payload),
                        ModuleHost::Placeholder(ph) => ph.set_param(param_id, payload),
                    }
                })();
                ack.complete(result);
                None
            }
        }
    }

    fn handle_module_enable(&mut self, module_id: u32, payload: &[u8]) -> Result<()> {
        let enable = read_u32(payload)? != 0;
        let (ci, mi) = self.find_slot(module_id).ok_or(Error::BadParam)?;
        let slot = &mut self.chains[ci].modules[mi];
        if enable
            && let ModuleHost::Placeholder(ph) = &slot.host
            && !ph.may_enable()
        {
            tracing::error!(module_id, "placeholder cannot be enabled without a real module");
            return Err(Error::Failed);
        }
        if slot.enabled != enable {
            slot.enabled = enable;
            slot.pending_event = true;
            self.handle_media_fmt_event(ci, 0);
        }
        Ok(())
    }

    fn handle_placeholder_reset(&mut self, module_id: u32) -> Result<()> {
        if self.graph_state != PortState::Stopped {
            tracing::error!(state = ?self.graph_state, "placeholder reset outside stopped state");
            return Err(Error::Unsupported);
        }
        let (ci, mi) = self.find_slot(module_id).ok_or(Error::BadParam)?;
        let ModuleHost::Placeholder(ph) = &mut self.chains[ci].modules[mi].host else {
            return Err(Error::Unsupported);
        };
        ph.reset();
        Ok(())
    }

    fn handle_rd_ep_cfg(&mut self, module_id: u32, payload: &[u8]) -> Result<()> {
        let cfg = RdEpCfg::from_wire(payload)?;
        for port in &mut self.ext_out {
            if port.module_id == module_id {
                if let OutFlavour::Client(client) = &mut port.flavour {
                    tracing::debug!(port = %port.name, ?cfg, "read endpoint reconfigured");
                    client.cfg = cfg;
                    port.frames_cap_this_buf = None;
                    return Ok(());
                }
                return Err(Error::Unsupported);
            }
        }
        Err(Error::BadParam)
    }

    fn handle_peer_client_property(&mut self, module_id: u32, payload: &[u8]) -> Result<()> {
        if payload.len() < 12 {
            return Err(Error::NeedMore);
        }
        let word = |i: usize| {
            u32::from_le_bytes([payload[i * 4], payload[i * 4 + 1], payload[i * 4 + 2], payload[i * 4 + 3]])
        };
        let upstream_rt = word(0) != 0;
        let downstream_rt = word(1) != 0;
        let frame_len_us = word(2);
        let mut matched = false;
        for ii in 0..self.ext_in.len() {
            if self.ext_in[ii].module_id == module_id {
                matched = true;
                self.ext_in[ii].upstream_real_time = upstream_rt;
                if frame_len_us != 0 {
                    self.ext_in[ii].upstream_frame_len_us = frame_len_us;
                }
            }
        }
        for oi in 0..self.ext_out.len() {
            if self.ext_out[oi].module_id == module_id {
                matched = true;
                self.ext_out[oi].downstream_real_time = downstream_rt;
                // Propagate the property across the container boundary.
                if let OutFlavour::Peer(peer) = &self.ext_out[oi].flavour
                    && let Some(tx) = &peer.data_tx
                {
                    let _ = tx.push_back(QueueMsg::Data(crate::msg::DataMsg::PeerProperty(PeerPortProperty {
                        state: None,
                        is_real_time: Some(upstream_rt || downstream_rt),
                        frame_len_us: (frame_len_us != 0).then_some(frame_len_us),
                    })));
                }
            }
        }
        if matched { Ok(()) } else { Err(Error::BadParam) }
    }

    fn handle_cmd_media_format(&mut self, module_id: u32, format: MediaFormat, upstream_frame_len_us: u32) -> Result<()> {
        for ii in 0..self.ext_in.len() {
            if self.ext_in[ii].module_id == module_id {
                let ci = self.ext_in[ii].chain_idx;
                self.ext_in[ii].accept_media_format(format, upstream_frame_len_us, &mut self.chains[ci])?;
                if self.ext_in[ii].media_fmt_event {
                    self.ext_in[ii].media_fmt_event = false;
                    self.handle_media_fmt_event(ci, 0);
                }
                return Ok(());
            }
        }
        Err(Error::BadParam)
    }

    fn handle_register_event(
        &mut self,
        module_id: u32,
        event_id: u32,
        client: ClientId,
        config: Option<Vec<u8>>,
        register: bool,
    ) -> Result<()> {
        if let Some((ci, mi)) = self.find_slot(module_id)
            && let ModuleHost::Placeholder(ph) = &mut self.chains[ci].modules[mi].host
            && !ph.is_bound()
        {
            if register {
                ph.cache_event(CachedEventReg {
                    event_id,
                    client,
                    config,
                });
                return Ok(());
            }
            return Err(Error::Failed);
        }
        if register {
            self.services.events.lock().add_client(event_id, client, config);
            Ok(())
        } else {
            self.services.events.lock().delete_client(event_id, &client)
        }
    }

    /// Replay a bound placeholder's caches and fold it into the running
    /// topology.
    fn finish_module_bind(&mut self, ci: usize, mi: usize) -> Result<()> {
        let out_mf = self.chains[ci].output_link_ref().media_fmt;
        let services = &self.services;
        {
            let ModuleHost::Placeholder(ph) = &mut self.chains[ci].modules[mi].host else {
                return Err(Error::Unexpected);
            };
            ph.finish_bind(|reg| {
                services
                    .events
                    .lock()
                    .add_client(reg.event_id, reg.client, reg.config.clone());
                if reg.event_id == EVENT_RD_EP_MEDIA_FORMAT
                    && let Some(mf) = out_mf
                {
                    services.raise_event(EVENT_RD_EP_MEDIA_FORMAT, &mf.to_wire());
                }
            })?;
        }
        self.chains[ci].modules[mi].pending_event = true;
        self.handle_media_fmt_event(ci, 0);
        Ok(())
    }

    /// Apply set-configs sitting at the head of the command queue
    /// without leaving the inner loop (placeholder binds wait for the
    /// command turn since they may re-launch the worker).
    pub(crate) fn poll_ctrl_params(&mut self) {
        loop {
            let applicable = self
                .cmd_q
                .peek_front(|m| {
                    matches!(
                        m,
                        QueueMsg::Cmd(CmdMsg::SetCfg { param_id, .. }) if *param_id != PARAM_ID_REAL_MODULE_ID
                    )
                })
                .unwrap_or(false);
            if !applicable {
                return;
            }
            match self.cmd_q.pop_front() {
                Ok(QueueMsg::Cmd(CmdMsg::SetCfg {
                    module_id,
                    param_id,
                    payload,
                    ack,
                })) => {
                    let relaunch = self.handle_set_cfg(module_id, param_id, &payload, ack);
                    debug_assert!(relaunch.is_none());
                }
                _ => return,
            }
        }
    }

    fn find_slot(&self, module_id: u32) -> Option<(usize, usize)> {
        for (ci, chain) in self.chains.iter().enumerate() {
            for (mi, slot) in chain.modules.iter().enumerate() {
                if slot.instance_id == module_id {
                    return Some((ci, mi));
                }
            }
        }
        None
    }

    /// Raise worker priority to the configured ceiling for the duration
    /// of event handling; returns the previous value for the paired
    /// restore.
    pub(crate) fn enter_event_handling(&mut self) -> i32 {
        let prev = self.cur_priority;
        let ceiling = self.config.worker.priority_ceiling;
        if prev != ceiling {
            tracing::trace!(from = prev, to = ceiling, "worker priority raised");
            self.cur_priority = ceiling;
        }
        prev
    }

    pub(crate) fn exit_event_handling(&mut self, prev: i32) {
        if self.cur_priority != prev {
            tracing::trace!(to = prev, "worker priority restored");
            self.cur_priority = prev;
        }
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.config.name)
            .field("state", &self.graph_state)
            .field("chains", &self.chains.len())
            .finish()
    }
}

fn read_u32(payload: &[u8]) -> Result<u32> {
    payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(Error::NeedMore)
}

// ---------------------------------------------------------------------
// Builder and handle
// ---------------------------------------------------------------------

/// Egress side of one chain.
pub enum OutSpec {
    Peer {
        data_tx: Option<Arc<Queue<QueueMsg>>>,
        icb: IcbInfo,
    },
    Client {
        cfg: RdEpCfg,
    },
}

/// One linear path through the container.
pub struct ChainSpec {
    pub modules: Vec<ModuleSlot>,
    pub input: InFlavour,
    pub output: OutSpec,
    /// Instance id of the ingress endpoint module.
    pub wr_ep_module_id: u32,
    /// Instance id of the egress endpoint module.
    pub rd_ep_module_id: u32,
}

struct NullModuleDb;

impl ModuleDb for NullModuleDb {
    fn load(&self, module_id: u32) -> Result<Box<dyn crate::topo::Module>> {
        tracing::error!(module_id, "no module database configured");
        Err(Error::Unsupported)
    }
}

struct NullSink;

impl PacketSink for NullSink {
    fn send(&self, packet: Packet) {
        tracing::debug!(opcode = format_args!("{:#x}", packet.opcode), "packet dropped: no sink configured");
    }
}

/// Builds and launches a container.
pub struct ContainerBuilder {
    config: EngineConfig,
    module_db: Arc<dyn ModuleDb>,
    sink: Box<dyn PacketSink>,
    memmap: Arc<MemMapRegistry>,
    chains: Vec<ChainSpec>,
    with_signal_trigger: bool,
}

impl ContainerBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            module_db: Arc::new(NullModuleDb),
            sink: Box::new(NullSink),
            memmap: MemMapRegistry::new(),
            chains: Vec::new(),
            with_signal_trigger: false,
        }
    }

    pub fn module_db(mut self, db: Arc<dyn ModuleDb>) -> Self {
        self.module_db = db;
        self
    }

    pub fn sink(mut self, sink: Box<dyn PacketSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn memmap(mut self, memmap: Arc<MemMapRegistry>) -> Self {
        self.memmap = memmap;
        self
    }

    pub fn chain(mut self, spec: ChainSpec) -> Self {
        self.chains.push(spec);
        self
    }

    /// Add an interrupt-style trigger bit the embedder fires to drive
    /// signal-triggered processing.
    pub fn signal_trigger(mut self) -> Self {
        self.with_signal_trigger = true;
        self
    }

    /// Create every queue and port, then launch the worker (under a
    /// supervisor that re-launches it when a module needs more stack).
    pub fn launch(self) -> Result<(ContainerHandle, ContainerIo)> {
        let name = if self.config.name.is_empty() {
            "aria-cntr".to_string()
        } else {
            self.config.name.clone()
        };
        let tracker = MemTracker::new();
        let pools: Arc<QueuePools<QueueMsg>> = QueuePools::new(&tracker);
        let pool = pools.setup(
            HeapId::Default,
            self.config.queue_pool.max_arrays,
            self.config.queue_pool.nodes_per_array,
        );
        let channel = Channel::new();

        let cmd_q = Arc::new(Queue::new(
            &pool,
            QueueAttr {
                name: format!("{name}-cmd"),
                max_nodes: 32,
                prealloc_nodes: 0,
                is_priority: true,
            },
        )?);
        let cmd_bit = cmd_q.bind(&channel, 0)?;

        let mut chains = Vec::new();
        let mut ext_in = Vec::new();
        let mut ext_out = Vec::new();
        let mut in_queues = Vec::new();
        let mut out_queues = Vec::new();

        for (ci, spec) in self.chains.into_iter().enumerate() {
            let in_q = Arc::new(Queue::new(&pool, QueueAttr::named(format!("{name}-in{ci}"), 64))?);
            let in_bit = in_q.bind(&channel, 0)?;
            ext_in.push(ExtInPort::new(
                format!("{name}-in{ci}"),
                spec.wr_ep_module_id,
                spec.input,
                Arc::clone(&in_q),
                in_bit,
                ci,
            ));
            in_queues.push(in_q);

            let (flavour, q) = match spec.output {
                OutSpec::Peer { data_tx, icb } => {
                    let buf_q =
                        Arc::new(Queue::new(&pool, QueueAttr::named(format!("{name}-buf{ci}"), 32))?);
                    let bit = buf_q.bind(&channel, 0)?;
                    (
                        (
                            OutFlavour::Peer(PeerOut {
                                buf_q: Arc::clone(&buf_q),
                                data_tx,
                                held: None,
                                icb,
                                is_prebuffer_sent: false,
                                mf_sent: None,
                            }),
                            bit,
                        ),
                        buf_q,
                    )
                }
                OutSpec::Client { cfg } => {
                    let out_q =
                        Arc::new(Queue::new(&pool, QueueAttr::named(format!("{name}-out{ci}"), 64))?);
                    let bit = out_q.bind(&channel, 0)?;
                    (
                        (
                            OutFlavour::Client(ClientOut {
                                out_q: Arc::clone(&out_q),
                                held: None,
                                cfg,
                                min_md_size_in_next_buffer: 0,
                                pending_mf_as_md: None,
                            }),
                            bit,
                        ),
                        out_q,
                    )
                }
            };
            let (flavour, bit) = flavour;
            ext_out.push(ExtOutPort::new(
                format!("{name}-out{ci}"),
                spec.rd_ep_module_id,
                flavour,
                bit,
                ci,
            ));
            out_queues.push(q);
            chains.push(Chain::new(spec.modules));
        }

        let signal_trigger = if self.with_signal_trigger {
            Some(Arc::new(channel.add_signal(0)?))
        } else {
            None
        };

        let services = Services {
            memmap: Arc::clone(&self.memmap),
            cache: CacheOps::new(),
            sink: self.sink,
            tracker,
            pools,
            clock: Arc::new(MonotonicClock::default()),
            events: Mutex::new(EventRegistry::new()),
        };

        let stack = self.config.worker.stack_bytes.max(64 * 1024);
        let priority = self.config.worker.priority;
        let container = Container {
            config: self.config,
            services,
            channel: Arc::clone(&channel),
            cmd_q: Arc::clone(&cmd_q),
            cmd_bit,
            signal_trigger: signal_trigger.clone(),
            chains,
            ext_in,
            ext_out,
            process_info: ProcessInfo::default(),
            votes: Votes::default(),
            graph_state: PortState::Stopped,
            module_db: self.module_db,
            pending: None,
            current_stack: stack,
            cur_priority: priority,
            opened: false,
        };

        let supervisor = thread::Builder::new()
            .name(format!("{name}-sup"))
            .spawn(move || supervise(container, stack))
            .map_err(|e| {
                tracing::error!(error = %e, "failed to spawn supervisor");
                Error::Failed
            })?;

        let handle = ContainerHandle {
            cmd_q,
            supervisor: Some(supervisor),
        };
        let io = ContainerIo {
            in_queues,
            out_queues,
            signal_trigger,
            memmap: self.memmap,
        };
        Ok((handle, io))
    }
}

/// Worker respawn loop: each re-launch gets a fresh thread with the
/// requested stack, and the container state carries over.
fn supervise(container: Container, initial_stack: usize) {
    let mut stack = initial_stack;
    let mut container = container;
    loop {
        let name = container.config.name.clone();
        let worker = thread::Builder::new()
            .name(if name.is_empty() { "aria-cntr".into() } else { name })
            .stack_size(stack)
            .spawn(move || container.run());
        let worker = match worker {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn container worker");
                return;
            }
        };
        match worker.join() {
            Ok(WorkerExit::Done) => return,
            Ok(WorkerExit::Relaunch {
                stack: new_stack,
                container: boxed,
            }) => {
                stack = new_stack;
                let mut inner = *boxed;
                inner.current_stack = new_stack;
                container = inner;
                tracing::debug!(stack, "re-launching container worker");
            }
            Err(_) => {
                tracing::error!("container worker panicked");
                return;
            }
        }
    }
}

/// External queues the embedder pushes into and pulls from.
pub struct ContainerIo {
    /// Per-chain ingress data queues.
    pub in_queues: Vec<Arc<Queue<QueueMsg>>>,
    /// Per-chain egress queues: the client output-request queue, or the
    /// peer buffer-recycle queue.
    pub out_queues: Vec<Arc<Queue<QueueMsg>>>,
    /// The interrupt-style trigger, when configured.
    pub signal_trigger: Option<Arc<ChannelSignal>>,
    pub memmap: Arc<MemMapRegistry>,
}

impl std::fmt::Debug for ContainerIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerIo")
            .field("chains", &self.in_queues.len())
            .finish()
    }
}

/// Command-side handle to a running container.
pub struct ContainerHandle {
    cmd_q: Arc<Queue<QueueMsg>>,
    supervisor: Option<thread::JoinHandle<()>>,
}

impl ContainerHandle {
    /// Queue a command without waiting for its ack.
    pub fn send(&self, cmd: CmdMsg) -> Result<()> {
        self.cmd_q.push_back(QueueMsg::Cmd(cmd))
    }

    /// Run one graph-management command to completion.
    pub fn graph(&self, op: GraphOp) -> Result<()> {
        let ack = CmdAck::new();
        self.send(CmdMsg::GraphMgmt {
            op,
            ack: ack.clone(),
        })?;
        ack.wait()
    }

    /// Apply one module parameter and wait for the ack.
    pub fn set_cfg(&self, module_id: u32, param_id: u32, payload: Vec<u8>) -> Result<()> {
        let ack = CmdAck::new();
        self.send(CmdMsg::SetCfg {
            module_id,
            param_id,
            payload,
            ack: ack.clone(),
        })?;
        ack.wait()
    }

    /// Register (or deregister) an event client and wait for the ack.
    pub fn register_event(
        &self,
        module_id: u32,
        event_id: u32,
        client: ClientId,
        config: Option<Vec<u8>>,
        register: bool,
    ) -> Result<()> {
        let ack = CmdAck::new();
        self.send(CmdMsg::RegisterEvent {
            module_id,
            event_id,
            client,
            config,
            register,
            ack: ack.clone(),
        })?;
        ack.wait()
    }

    /// Push a control-path input media format and wait for the ack.
    pub fn send_media_format(&self, module_id: u32, format: MediaFormat) -> Result<()> {
        let ack = CmdAck::new();
        self.send(CmdMsg::MediaFormat {
            module_id,
            format,
            upstream_frame_len_us: 0,
            ack: ack.clone(),
        })?;
        ack.wait()
    }

    /// Close the graph and join the worker.
    pub fn close(mut self) -> Result<()> {
        self.graph(GraphOp::Close)?;
        if let Some(sup) = self.supervisor.take() {
            sup.join().map_err(|_| Error::Failed)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("running", &self.supervisor.is_some())
            .finish()
    }
}
