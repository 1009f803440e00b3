//! Module topology: ports, links, and the process walk.
//!
//! A container hosts parallel chains of modules. Each link between
//! modules owns its buffers, stream flags and metadata list; the process
//! walk hands a module its input and output link and inspects the event
//! bitfield it raised.

pub mod propagation;

use aria_sync::{Error, Result};

use crate::media_format::MediaFormat;
use crate::metadata::{self, Metadata};
use crate::placeholder::Placeholder;
use crate::timestamp::TimestampInfo;

/// Lifecycle state of a port or sub-graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortState {
    #[default]
    Stopped,
    Prepared,
    Started,
    Suspended,
}

/// Where a port sits relative to data flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFlowState {
    /// No data expected until further notice.
    #[default]
    AtGap,
    /// Upstream opened but first byte not seen yet.
    PreFlow,
    Flowing,
}

/// Per-buffer stream flags and timestamp.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamData {
    pub timestamp: TimestampInfo,
    pub marker_eos: bool,
    pub eof: bool,
    pub erasure: bool,
}

/// Data buffers of one port. One entry for packed or raw layouts, one
/// per channel for unpacked PCM; every entry shares `max_len`, and the
/// channel-0 length is the port's actual length.
#[derive(Debug, Default)]
pub struct PortBufs {
    pub bufs: Vec<Vec<u8>>,
    pub max_len: usize,
}

impl PortBufs {
    pub fn with_layout(num_bufs: usize, max_len: usize) -> Self {
        Self {
            bufs: (0..num_bufs).map(|_| Vec::with_capacity(max_len)).collect(),
            max_len,
        }
    }

    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    /// Bytes per buffer, channel-0 convention.
    pub fn actual_len(&self) -> usize {
        self.bufs.first().map(Vec::len).unwrap_or(0)
    }

    /// Bytes across every buffer.
    pub fn total_actual(&self) -> usize {
        self.bufs.iter().map(Vec::len).sum()
    }

    pub fn free_space(&self) -> usize {
        self.max_len.saturating_sub(self.actual_len())
    }

    pub fn is_empty(&self) -> bool {
        self.actual_len() == 0
    }

    pub fn clear(&mut self) {
        for b in &mut self.bufs {
            b.clear();
        }
    }

    /// Drop the first `bytes` of every buffer (data was consumed).
    pub fn consume(&mut self, bytes: usize) {
        for b in &mut self.bufs {
            let n = bytes.min(b.len());
            b.drain(..n);
        }
    }
}

/// Event bitfield a module raises from `process`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessEvents {
    pub media_fmt: bool,
    pub port_thresh: bool,
    pub process_state: bool,
    pub kpps: bool,
    pub bw: bool,
    pub hw_acc_proc_delay: bool,
}

impl ProcessEvents {
    pub fn any(&self) -> bool {
        self.media_fmt || self.port_thresh || self.process_state || self.kpps || self.bw || self.hw_acc_proc_delay
    }

    pub fn merge(&mut self, other: &ProcessEvents) {
        self.media_fmt |= other.media_fmt;
        self.port_thresh |= other.port_thresh;
        self.process_state |= other.process_state;
        self.kpps |= other.kpps;
        self.bw |= other.bw;
        self.hw_acc_proc_delay |= other.hw_acc_proc_delay;
    }
}

/// State of one link (a connected output/input port pair).
#[derive(Debug, Default)]
pub struct LinkState {
    pub bufs: PortBufs,
    pub sdata: StreamData,
    pub md: Vec<Metadata>,
    pub media_fmt: Option<MediaFormat>,
    pub state: PortState,
    pub data_flow: DataFlowState,
}

impl LinkState {
    /// Drain `bytes` from the head of the link, keeping metadata offsets
    /// anchored.
    pub fn consume(&mut self, bytes: usize) {
        self.bufs.consume(bytes);
        metadata::adjust_after_consume(&mut self.md, bytes);
    }
}

/// Context a module processes in: its input link, its output link, and
/// the event bitfield it reports through.
pub struct ProcCtx<'a> {
    pub input: &'a mut LinkState,
    pub output: &'a mut LinkState,
    pub events: &'a mut ProcessEvents,
}

/// A signal-processing module hosted by the container.
///
/// Modules run cooperatively on the worker thread and never block; one
/// that must wait raises its channel bit and returns.
pub trait Module: Send {
    fn name(&self) -> &str;

    /// Consume input, produce output. Return value reports module
    /// failure; the engine logs and keeps walking the chain.
    fn process(&mut self, ctx: &mut ProcCtx<'_>) -> Result<()>;

    fn set_param(&mut self, _param_id: u32, _payload: &[u8]) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Fixed bytes-per-call requirement at the input, if the module has
    /// one. A port with a threshold is a buffering point.
    fn threshold_bytes(&self) -> Option<usize> {
        None
    }

    fn output_media_format(&self, input: &MediaFormat) -> MediaFormat {
        *input
    }

    fn kpps(&self) -> u32 {
        0
    }

    fn bandwidth_bps(&self) -> u32 {
        0
    }

    fn hw_acc_proc_delay_us(&self) -> u32 {
        0
    }

    /// Worst-case stack the module needs under `process`.
    fn stack_bytes(&self) -> usize {
        16 * 1024
    }
}

/// Module hosting: a loaded implementation or a placeholder awaiting its
/// real module id.
pub enum ModuleHost {
    Real(Box<dyn Module>),
    Placeholder(Placeholder),
}

impl std::fmt::Debug for ModuleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleHost::Real(m) => f.debug_tuple("Real").field(&m.name()).finish(),
            ModuleHost::Placeholder(p) => f.debug_tuple("Placeholder").field(p).finish(),
        }
    }
}

/// One position in a chain.
#[derive(Debug)]
pub struct ModuleSlot {
    pub instance_id: u32,
    pub host: ModuleHost,
    pub enabled: bool,
    /// Restart the inner-loop walk from here.
    pub pending_event: bool,
}

impl ModuleSlot {
    pub fn new(instance_id: u32, module: Box<dyn Module>) -> Self {
        Self {
            instance_id,
            host: ModuleHost::Real(module),
            enabled: true,
            pending_event: false,
        }
    }

    pub fn placeholder(instance_id: u32) -> Self {
        Self {
            instance_id,
            host: ModuleHost::Placeholder(Placeholder::new(instance_id)),
            enabled: true,
            pending_event: false,
        }
    }

    /// The runnable module, if any: a real module, or a bound placeholder.
    pub fn active_module(&mut self) -> Option<&mut dyn Module> {
        match &mut self.host {
            ModuleHost::Real(m) => Some(m.as_mut()),
            ModuleHost::Placeholder(p) => p.bound_module(),
        }
    }

    pub fn active_module_ref(&self) -> Option<&dyn Module> {
        match &self.host {
            ModuleHost::Real(m) => Some(m.as_ref()),
            ModuleHost::Placeholder(p) => p.bound_module_ref(),
        }
    }

    /// Does processing run through this slot at all.
    pub fn is_processing(&self) -> bool {
        self.enabled && self.active_module_ref().is_some()
    }

    pub fn threshold_bytes(&self) -> Option<usize> {
        self.active_module_ref().and_then(|m| m.threshold_bytes())
    }
}

/// One linear path from an external input to an external output.
///
/// `links[i]` is module `i`'s input; `links[len]` is the chain output
/// staging the external output port drains.
#[derive(Debug, Default)]
pub struct Chain {
    pub modules: Vec<ModuleSlot>,
    pub links: Vec<LinkState>,
}

impl Chain {
    pub fn new(modules: Vec<ModuleSlot>) -> Self {
        let links = (0..=modules.len()).map(|_| LinkState::default()).collect();
        Self { modules, links }
    }

    pub fn input_link(&mut self) -> &mut LinkState {
        &mut self.links[0]
    }

    pub fn output_link(&mut self) -> &mut LinkState {
        self.links.last_mut().expect("chain always has links")
    }

    pub fn output_link_ref(&self) -> &LinkState {
        self.links.last().expect("chain always has links")
    }

    /// Free space at the non-blocking-chain end: the first buffering
    /// module's input governs how much may accumulate upstream of it.
    pub fn nblc_free_space(&self) -> usize {
        for (idx, slot) in self.modules.iter().enumerate() {
            if slot.is_processing() && slot.threshold_bytes().is_some() {
                return self.links[idx].bufs.free_space();
            }
        }
        self.output_link_ref().bufs.free_space()
    }

    /// First module with a pending event, if any.
    pub fn first_pending(&self) -> Option<usize> {
        self.modules.iter().position(|m| m.pending_event)
    }
}

/// Outcome of one chain walk.
#[derive(Debug, Default)]
pub struct TopoResult {
    pub events: ProcessEvents,
    /// Index of the module that raised `media_fmt`, for forward-only
    /// re-propagation.
    pub media_fmt_raised_by: Option<usize>,
    pub data_moved: bool,
}

/// Walk `chain` from module `start`, invoking process on each runnable
/// module and bypassing disabled ones.
///
/// A module returning an error does not stop the walk; the failure is
/// logged and the rest of the sorted list still runs.
pub fn process_chain(chain: &mut Chain, start: usize) -> Result<TopoResult> {
    let mut result = TopoResult::default();
    for idx in start..chain.modules.len() {
        let (before, after) = chain.links.split_at_mut(idx + 1);
        let input = &mut before[idx];
        let output = &mut after[0];

        if input.state == PortState::Stopped {
            continue;
        }

        let in_before = input.bufs.actual_len();
        let out_before = output.bufs.actual_len();

        let slot = &mut chain.modules[idx];
        slot.pending_event = false;
        let mut events = ProcessEvents::default();

        if slot.enabled
            && let Some(module) = slot.active_module()
        {
            let mut ctx = ProcCtx {
                input,
                output,
                events: &mut events,
            };
            if let Err(e) = module.process(&mut ctx) {
                tracing::warn!(module = slot.instance_id, error = %e, "module process failed; continuing chain");
            }
        } else {
            bypass(input, output);
        }

        let consumed = in_before.saturating_sub(input.bufs.actual_len());
        let produced = output.bufs.actual_len().saturating_sub(out_before);
        let moved_bytes = consumed > 0 || produced > 0;
        // Metadata stranded behind fully-drained data (an EOS at offset
        // zero, say) still has to cross.
        if moved_bytes || (input.bufs.is_empty() && !input.md.is_empty()) {
            let md_before = output.md.len();
            carry_metadata(input, output, consumed, out_before, produced);
            if moved_bytes || output.md.len() != md_before {
                result.data_moved = true;
            }
        }

        if events.media_fmt && result.media_fmt_raised_by.is_none() {
            result.media_fmt_raised_by = Some(idx);
        }
        result.events.merge(&events);
    }
    Ok(result)
}

/// Disabled module: pass input through untouched.
fn bypass(input: &mut LinkState, output: &mut LinkState) {
    let space = output.bufs.free_space();
    if space == 0 {
        return;
    }
    for (src, dst) in input.bufs.bufs.iter_mut().zip(output.bufs.bufs.iter_mut()) {
        let n = space.min(src.len());
        dst.extend(src.drain(..n));
    }
    output.sdata = input.sdata;
    if input.media_fmt.is_some() && output.media_fmt != input.media_fmt {
        output.media_fmt = input.media_fmt;
    }
}

/// Migrate metadata whose anchor has been consumed onto the output list.
///
/// Consumed offsets map into the produced region; a flushing EOS that
/// crosses sets the output's EOS marker.
fn carry_metadata(
    input: &mut LinkState,
    output: &mut LinkState,
    consumed: usize,
    out_before: usize,
    produced: usize,
) {
    let crossing = metadata::split_at(&mut input.md, consumed);
    for mut md in crossing {
        if md.is_flushing_eos() {
            output.sdata.marker_eos = true;
        }
        let rel = if consumed == 0 {
            0
        } else {
            md.offset.min(consumed) * produced / consumed
        };
        md.offset = out_before + rel;
        output.md.push(md);
    }
    if input.sdata.eof && input.bufs.is_empty() {
        output.sdata.eof = true;
        input.sdata.eof = false;
    }
}
