//! Data-process scheduler: wait-mask computation, trigger
//! classification, and the outer/inner processing loops.
//!
//! The worker blocks only in the channel wait. Every wake-up runs the
//! outer loop: drain triggers, drive the topology, deliver output, and
//! re-evaluate until the trigger is satisfied. Hard iteration caps
//! guarantee forward progress against buggy modules.

use crate::container::Container;
use crate::topo::{PortState, propagation};

/// Scratch state the scheduler carries across one wake-up.
#[derive(Debug, Default)]
pub struct ProcessInfo {
    pub anything_changed: bool,
    pub port_thresh_event: bool,
    /// Frames completed for trigger-policy bookkeeping this wake-up.
    pub num_data_tpm_done: u32,
    /// Set while probing whether a trigger-policy module still has work.
    pub probing_for_tpm_activity: bool,
    /// Aggregated votes must be re-published after the inner loop.
    pub votes_dirty: bool,
}

/// What woke the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Data,
    Signal,
    Invalid,
}

impl Container {
    /// Which channel bits the worker should sleep on right now.
    pub(crate) fn compute_wait_mask(&self) -> u32 {
        let mut mask = self.cmd_bit;
        if self.graph_state != PortState::Started {
            return mask;
        }
        for port in &self.ext_in {
            if port.state == PortState::Started && !port.has_staged_data() {
                mask |= port.bit;
            }
        }
        for port in &self.ext_out {
            if port.state == PortState::Started && !port.has_buffer() {
                mask |= port.bit;
            }
        }
        if let Some(sig) = &self.signal_trigger {
            mask |= sig.bit();
        }
        mask
    }

    pub(crate) fn classify_trigger(&self, fired: u32) -> TriggerKind {
        if let Some(sig) = &self.signal_trigger
            && fired & sig.bit() != 0
        {
            return TriggerKind::Signal;
        }
        let data_bits = self
            .ext_in
            .iter()
            .map(|p| p.bit)
            .chain(self.ext_out.iter().map(|p| p.bit))
            .fold(0u32, |m, b| m | b);
        if fired & data_bits != 0 {
            return TriggerKind::Data;
        }
        TriggerKind::Invalid
    }

    /// One wake-up's outer loop.
    pub(crate) fn data_process_outer(&mut self, mut fired: u32) {
        let outer_max = self.config.scheduler.outer_loop_max_iters;
        let data_mask = self.compute_wait_mask() & !self.cmd_bit;
        let mut iter = 0u32;
        loop {
            iter += 1;
            if iter > outer_max {
                self.watchdog_trip("outer loop runaway");
                break;
            }
            let trigger = self.classify_trigger(fired);

            // Clear the signal-trigger bit; it re-arms externally.
            if trigger == TriggerKind::Signal
                && let Some(sig) = &self.signal_trigger
            {
                sig.clear();
            }

            // Ingress: every input whose bit fired (or that still holds a
            // partially-drained message) gets its on-trigger pass.
            for i in 0..self.ext_in.len() {
                let port_bit = self.ext_in[i].bit;
                if fired & port_bit != 0 || self.ext_in[i].has_staged_data() {
                    let chain_idx = self.ext_in[i].chain_idx;
                    let tol = self.config.ts_disc_tolerance_us;
                    if let Err(e) =
                        self.ext_in[i].handle_trigger(&mut self.chains[chain_idx], &self.services, tol)
                    {
                        tracing::warn!(error = %e, "input trigger handling failed");
                    }
                }
            }

            // Egress: pop a buffer for every output whose bit fired.
            for i in 0..self.ext_out.len() {
                let port_bit = self.ext_out[i].bit;
                if fired & port_bit != 0 && !self.ext_out[i].has_buffer() {
                    match self.ext_out[i].setup_bufs(&self.services) {
                        Ok(()) | Err(aria_sync::Error::NeedMore) => {}
                        Err(e) => tracing::warn!(error = %e, "output buffer setup failed"),
                    }
                }
            }

            // Signal trigger with no input: keep cadence with erasure.
            if trigger == TriggerKind::Signal {
                self.fill_underruns();
            }

            self.data_process_frames(trigger);
            self.deliver_outputs(trigger);
            self.run_deferred_events();

            // Satisfied when nothing is signalled and no message is held
            // (a drained one still owes its ack).
            fired = self.channel.poll(data_mask);
            let staged_work = self.ext_in.iter().any(|p| p.has_staged_msg());
            if fired == 0 && !staged_work {
                break;
            }
            if self.channel.poll(self.cmd_bit) != 0 {
                // Commands take the next turn of the worker loop.
                break;
            }
        }
    }

    /// The inner topology loop.
    pub(crate) fn data_process_frames(&mut self, trigger: TriggerKind) {
        let inner_max = self.config.scheduler.inner_loop_max_iters;
        let mut iter = 0u32;
        loop {
            iter += 1;
            if iter > inner_max {
                self.watchdog_trip("inner loop runaway");
                break;
            }
            self.process_info.anything_changed = false;

            for ci in 0..self.chains.len() {
                // Stage pending external bytes into the first module.
                for ii in 0..self.ext_in.len() {
                    if self.ext_in[ii].chain_idx != ci {
                        continue;
                    }
                    match self.ext_in[ii].preprocess(&mut self.chains[ci], &self.services) {
                        Ok(n) if n > 0 => self.process_info.anything_changed = true,
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "input preprocess failed"),
                    }
                    if self.ext_in[ii].media_fmt_event {
                        self.ext_in[ii].media_fmt_event = false;
                        self.handle_media_fmt_event(ci, 0);
                    }
                }

                let start = self.chains[ci].first_pending().unwrap_or(0);
                match crate::topo::process_chain(&mut self.chains[ci], start) {
                    Ok(result) => {
                        if result.data_moved {
                            self.process_info.anything_changed = true;
                            self.process_info.num_data_tpm_done += 1;
                        }
                        if result.events.media_fmt {
                            // Re-propagate from the module after the one
                            // that raised, to keep its own output intact.
                            let from = result.media_fmt_raised_by.map(|i| i + 1).unwrap_or(0);
                            self.handle_media_fmt_event(ci, from);
                        }
                        if result.events.port_thresh {
                            self.handle_thresh_event(ci);
                        }
                        if result.events.process_state {
                            // A module flipped enabled/disabled: restart
                            // propagation and re-vote.
                            self.handle_media_fmt_event(ci, 0);
                            self.process_info.anything_changed = true;
                        }
                        if result.events.kpps || result.events.bw || result.events.hw_acc_proc_delay {
                            self.process_info.votes_dirty = true;
                        }
                    }
                    Err(e) => tracing::warn!(chain = ci, error = %e, "chain walk failed"),
                }

                // Drain produced frames into the output port.
                for oi in 0..self.ext_out.len() {
                    if self.ext_out[oi].chain_idx != ci || !self.ext_out[oi].has_buffer() {
                        continue;
                    }
                    self.check_output_ts_disc(ci, oi);
                    match self.ext_out[oi].collect_from_chain(&mut self.chains[ci], &self.services) {
                        Ok(n) if n > 0 => self.process_info.anything_changed = true,
                        Ok(_) => {}
                        Err(aria_sync::Error::NeedMore) => {}
                        Err(aria_sync::Error::NotReady) => {}
                        Err(e) => tracing::warn!(error = %e, "output collect failed"),
                    }
                }
            }

            // Control-port params apply mid-loop so signal-triggered
            // paths stay periodic.
            self.poll_ctrl_params();

            let any_output_pending = self.ext_out.iter().any(|o| o.has_buffer() && !o.is_ready());
            let cmd_waiting = self.channel.poll(self.cmd_bit) != 0;
            if cmd_waiting && !self.topo_is_real_time() {
                // Commands must not starve behind a non-real-time topo.
                break;
            }
            if !(self.process_info.anything_changed && any_output_pending) {
                break;
            }
        }
    }

    /// Deliver every output that reached readiness; apply the overrun
    /// policy to the rest.
    pub(crate) fn deliver_outputs(&mut self, trigger: TriggerKind) {
        for oi in 0..self.ext_out.len() {
            let ci = self.ext_out[oi].chain_idx;
            let upstream_rt = self
                .ext_in
                .iter()
                .any(|p| p.chain_idx == ci && p.upstream_real_time);
            let may_drop = trigger == TriggerKind::Signal || upstream_rt;

            // Downstream not started: data either waits or, on real-time
            // paths, is dropped to keep cadence.
            if self.ext_out[oi].state != PortState::Started {
                if may_drop && !self.chains[ci].output_link_ref().bufs.is_empty() {
                    let (outs, chains) = (&mut self.ext_out, &mut self.chains);
                    outs[oi].overrun_drop(&mut chains[ci], &self.services);
                }
                continue;
            }

            // Produced data with no buffer to put it in.
            if !self.ext_out[oi].has_buffer() {
                let produced = !self.chains[ci].output_link_ref().bufs.is_empty();
                if produced && may_drop {
                    let (outs, chains) = (&mut self.ext_out, &mut self.chains);
                    outs[oi].overrun_drop(&mut chains[ci], &self.services);
                }
                continue;
            }

            if self.ext_out[oi].is_ready() {
                if let Err(e) = self.ext_out[oi].write_data(&self.services) {
                    tracing::warn!(error = %e, "output delivery failed");
                }
                self.process_info.votes_dirty = true;
            }
        }
    }

    /// Zero-fill signal-triggered inputs that came up short.
    fn fill_underruns(&mut self) {
        for ii in 0..self.ext_in.len() {
            if self.ext_in[ii].state != PortState::Started || self.ext_in[ii].has_staged_data() {
                continue;
            }
            let ci = self.ext_in[ii].chain_idx;
            let threshold = self.chains[ci]
                .modules
                .iter()
                .find_map(crate::topo::ModuleSlot::threshold_bytes)
                .unwrap_or(self.chains[ci].links[0].bufs.max_len);
            if threshold > 0 {
                self.ext_in[ii].underrun_fill(&mut self.chains[ci], threshold);
                self.process_info.anything_changed = true;
            }
        }
    }

    /// Output timestamp discontinuity check ahead of collecting a frame.
    fn check_output_ts_disc(&mut self, ci: usize, oi: usize) {
        let link = self.chains[ci].output_link_ref();
        let stamped = link.sdata.timestamp;
        if !stamped.valid || stamped.continue_flag || link.bufs.is_empty() {
            return;
        }
        let out = &self.ext_out[oi];
        if out.ts.is_valid() && out.ts.is_discontinuous(stamped.value_us, self.config.ts_disc_tolerance_us) {
            tracing::debug!(
                expected = out.ts.current_us(),
                stamped = stamped.value_us,
                "output timestamp discontinuity"
            );
            out.raise_ts_disc(out.ts.current_us(), stamped.value_us, &self.services);
        }
    }

    /// Media format or process-state change: bump priority, propagate,
    /// resize, notify outputs.
    pub(crate) fn handle_media_fmt_event(&mut self, ci: usize, from: usize) {
        let prev_priority = self.enter_event_handling();
        let changed = propagation::propagate_media_format(&mut self.chains[ci], from);
        if let Err(e) = propagation::recompute_thresholds(
            &mut self.chains[ci],
            self.config.effective_operating_frame_us(),
        ) {
            tracing::error!(chain = ci, error = %e, "threshold recompute rejected");
        }
        if changed {
            let out_mf = self.chains[ci].output_link_ref().media_fmt;
            if let Some(mf) = out_mf {
                for oi in 0..self.ext_out.len() {
                    if self.ext_out[oi].chain_idx == ci {
                        self.ext_out[oi].prop_media_fmt(mf, &self.services);
                    }
                }
            }
            self.process_info.votes_dirty = true;
        }
        self.process_info.anything_changed = true;
        self.exit_event_handling(prev_priority);
    }

    /// A module moved its threshold: re-derive every buffer size.
    pub(crate) fn handle_thresh_event(&mut self, ci: usize) {
        let prev_priority = self.enter_event_handling();
        self.process_info.port_thresh_event = true;
        if let Err(e) = propagation::recompute_thresholds(
            &mut self.chains[ci],
            self.config.effective_operating_frame_us(),
        ) {
            tracing::error!(chain = ci, error = %e, "threshold recompute rejected");
        }
        self.process_info.anything_changed = true;
        self.exit_event_handling(prev_priority);
    }

    /// Re-publish aggregated votes if the inner loop dirtied them.
    pub(crate) fn run_deferred_events(&mut self) {
        if !self.process_info.votes_dirty {
            return;
        }
        self.process_info.votes_dirty = false;
        let votes = propagation::aggregate_votes(&self.chains);
        if votes != self.votes {
            tracing::debug!(?votes, "processing votes updated");
            self.votes = votes;
        }
    }

    fn topo_is_real_time(&self) -> bool {
        self.signal_trigger.is_some() || self.ext_in.iter().any(|p| p.upstream_real_time)
    }

    /// Watchdog cap breached: crash in simulation, degrade on device.
    pub(crate) fn watchdog_trip(&mut self, what: &str) {
        #[cfg(feature = "sim")]
        panic!("scheduler watchdog: {what}");
        #[cfg(not(feature = "sim"))]
        {
            tracing::error!(what, "scheduler watchdog tripped; draining commands only");
        }
    }
}
