//! Media-format and threshold propagation, and vote aggregation.

use aria_sync::{Error, Result};

use crate::media_format::MediaFormat;
use crate::topo::{Chain, PortState};

/// Propagate media format forward from module index `from`.
///
/// Each runnable module maps its input format to an output format;
/// disabled or unbound slots pass the format through. Propagation stops
/// at a stopped port. Returns true when the chain-output format changed,
/// so the caller can re-vote and notify downstream.
pub fn propagate_media_format(chain: &mut Chain, from: usize) -> bool {
    let out_before = chain.output_link_ref().media_fmt;
    for idx in from..chain.modules.len() {
        if chain.links[idx].state == PortState::Stopped {
            tracing::debug!(module_idx = idx, "media format propagation stopped at stopped port");
            break;
        }
        let Some(in_mf) = chain.links[idx].media_fmt else {
            break;
        };
        if in_mf.validate().is_err() {
            tracing::warn!(module_idx = idx, "invalid media format not propagated");
            break;
        }
        let slot = &chain.modules[idx];
        let out_mf = if slot.enabled {
            slot.active_module_ref()
                .map(|m| m.output_media_format(&in_mf))
                .unwrap_or(in_mf)
        } else {
            in_mf
        };
        if chain.links[idx + 1].media_fmt != Some(out_mf) {
            chain.links[idx + 1].media_fmt = Some(out_mf);
        }
    }
    chain.output_link_ref().media_fmt != out_before
}

/// Recompute every link's buffer size for a new operating frame.
///
/// The endpoint threshold at a link is `bytes_per_ms x frame_ms` of that
/// link's format. Every module threshold must divide the endpoint
/// threshold at its input; a configuration that breaks that is rejected
/// whole, leaving buffers untouched.
pub fn recompute_thresholds(chain: &mut Chain, operating_frame_us: u32) -> Result<()> {
    let frame_ms = (operating_frame_us as u64).div_ceil(1000).max(1);

    // Validate first: no partial resize on failure.
    for (idx, slot) in chain.modules.iter().enumerate() {
        let Some(thresh) = slot.threshold_bytes() else {
            continue;
        };
        let Some(mf) = &chain.links[idx].media_fmt else {
            continue;
        };
        let Some(bytes_per_ms) = mf.bytes_per_ms() else {
            continue;
        };
        let endpoint_thresh = (bytes_per_ms * frame_ms) as usize;
        if thresh == 0 || endpoint_thresh % thresh != 0 {
            tracing::error!(
                module = slot.instance_id,
                thresh,
                endpoint_thresh,
                "module threshold does not divide endpoint threshold"
            );
            return Err(Error::BadParam);
        }
    }

    for idx in 0..chain.links.len() {
        let Some(mf) = chain.links[idx].media_fmt else {
            continue;
        };
        let max_len = mf
            .bytes_per_ms()
            .map(|b| (b * frame_ms) as usize)
            .unwrap_or(chain.links[idx].bufs.max_len.max(DEFAULT_RAW_BUF_LEN));
        let num_bufs = mf.num_bufs();
        let bufs = &mut chain.links[idx].bufs;
        if bufs.max_len == max_len && bufs.num_bufs() == num_bufs {
            continue;
        }
        if !bufs.is_empty() {
            tracing::warn!(link = idx, bytes = bufs.total_actual(), "dropping data on buffer recreate");
        }
        *bufs = crate::topo::PortBufs::with_layout(num_bufs, max_len);
    }
    Ok(())
}

const DEFAULT_RAW_BUF_LEN: usize = 2048;

/// Aggregated processing votes published after event handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Votes {
    pub kpps: u32,
    pub bw_bps: u32,
    pub hw_acc_proc_delay_us: u32,
}

/// Sum KPPS and bandwidth over every enabled module; delay is the worst
/// single module.
pub fn aggregate_votes(chains: &[Chain]) -> Votes {
    let mut votes = Votes::default();
    for chain in chains {
        for slot in &chain.modules {
            if !slot.enabled {
                continue;
            }
            if let Some(module) = slot.active_module_ref() {
                votes.kpps += module.kpps();
                votes.bw_bps += module.bandwidth_bps();
                votes.hw_acc_proc_delay_us = votes.hw_acc_proc_delay_us.max(module.hw_acc_proc_delay_us());
            }
        }
    }
    votes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_format::Interleaving;
    use crate::topo::{Module, ModuleSlot, PortBufs, ProcCtx};

    struct Fixed {
        thresh: Option<usize>,
        kpps: u32,
    }

    impl Module for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn process(&mut self, _ctx: &mut ProcCtx<'_>) -> aria_sync::Result<()> {
            Ok(())
        }
        fn threshold_bytes(&self) -> Option<usize> {
            self.thresh
        }
        fn kpps(&self) -> u32 {
            self.kpps
        }
    }

    fn chain_with(thresh: Option<usize>) -> Chain {
        let mut chain = Chain::new(vec![ModuleSlot::new(1, Box::new(Fixed { thresh, kpps: 100 }))]);
        for link in &mut chain.links {
            link.state = PortState::Started;
            link.bufs = PortBufs::with_layout(1, 0);
        }
        chain.links[0].media_fmt = Some(MediaFormat::pcm(48_000, 16, 2, Interleaving::Interleaved));
        chain
    }

    #[test]
    fn propagation_fills_downstream_formats() {
        let mut chain = chain_with(None);
        let changed = propagate_media_format(&mut chain, 0);
        assert!(changed);
        assert_eq!(chain.links[1].media_fmt, chain.links[0].media_fmt);
        // Second run is a no-op.
        assert!(!propagate_media_format(&mut chain, 0));
    }

    #[test]
    fn threshold_divisor_rule_enforced() {
        // 5 ms at 192 bytes/ms = 960 bytes endpoint threshold.
        let mut ok_chain = chain_with(Some(480));
        propagate_media_format(&mut ok_chain, 0);
        recompute_thresholds(&mut ok_chain, 5_000).unwrap();
        assert_eq!(ok_chain.links[0].bufs.max_len, 960);

        let mut bad_chain = chain_with(Some(700));
        propagate_media_format(&mut bad_chain, 0);
        assert_eq!(
            recompute_thresholds(&mut bad_chain, 5_000).unwrap_err(),
            Error::BadParam
        );
        // Rejected whole: nothing resized.
        assert_eq!(bad_chain.links[0].bufs.max_len, 0);
    }

    #[test]
    fn votes_sum_over_enabled_modules() {
        let mut chain = chain_with(None);
        chain
            .modules
            .push(ModuleSlot::new(2, Box::new(Fixed { thresh: None, kpps: 50 })));
        chain.links.push(Default::default());
        let votes = aggregate_votes(std::slice::from_ref(&chain));
        assert_eq!(votes.kpps, 150);
        chain.modules[1].enabled = false;
        let votes = aggregate_votes(std::slice::from_ref(&chain));
        assert_eq!(votes.kpps, 100);
    }
}
