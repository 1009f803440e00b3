//! Placeholder binding: cached params, cached event registrations, and
//! the worker re-launch when the real module wants a bigger stack.

mod support;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use aria_engine::{
    ChainSpec, ContainerBuilder, EngineConfig, GraphOp, InFlavour, MediaFormat, Module, ModuleDb,
    ModuleSlot, OutSpec, ProcCtx, QueueMsg, RdEpCfg,
};
use aria_engine::media_format::Interleaving;
use aria_sync::{Error, Result};
use aria_wire::memmap::MemMapRegistry;
use aria_wire::packet::{
    DATA_RSP_RD_EP_DATA_BUFFER_DONE_V2, EVENT_RD_EP_MEDIA_FORMAT, PARAM_ID_REAL_MODULE_ID,
    PARAM_ID_RESET_PLACEHOLDER_MODULE,
};

use support::{SinkState, TestSink, client_write, rd_buffer_packet, test_client, wr_data_packet};

const WR_EP_ID: u32 = 0x100;
const RD_EP_ID: u32 = 0x200;
const PLACEHOLDER_ID: u32 = 5;
const REAL_MODULE: u32 = 0xabcd;
const TIMEOUT: Duration = Duration::from_secs(5);

/// Passthrough that records every param it receives and demands a large
/// stack, forcing a worker re-launch at bind time.
struct BigStackRecorder {
    applied: Arc<Mutex<Vec<u32>>>,
}

impl Module for BigStackRecorder {
    fn name(&self) -> &str {
        "big-stack-recorder"
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

    fn set_param(&mut self, param_id: u32, _payload: &[u8]) -> Result<()> {
        self.applied.lock().push(param_id);
        Ok(())
    }

    fn stack_bytes(&self) -> usize {
        8 * 1024 * 1024
    }
}

struct OneModuleDb {
    applied: Arc<Mutex<Vec<u32>>>,
}

impl ModuleDb for OneModuleDb {
    fn load(&self, module_id: u32) -> Result<Box<dyn Module>> {
        if module_id == REAL_MODULE {
            Ok(Box::new(BigStackRecorder {
                applied: Arc::clone(&self.applied),
            }))
        } else {
            Err(Error::Failed)
        }
    }
}

#[test]
fn bind_replays_params_in_order_and_reraises_media_format() {
    support::init_tracing();
    let applied = Arc::new(Mutex::new(Vec::new()));
    let sink = SinkState::new();
    let memmap = MemMapRegistry::new();
    let data_handle = memmap.map(4096).unwrap();
    let rd_handle = memmap.map(4096).unwrap();

    let mut cfg = EngineConfig::named("ph-test");
    cfg.operating_frame_us = 10_000;

    let (handle, io) = ContainerBuilder::new(cfg)
        .module_db(Arc::new(OneModuleDb {
            applied: Arc::clone(&applied),
        }))
        .sink(Box::new(TestSink(sink.clone())))
        .memmap(memmap)
        .chain(ChainSpec {
            modules: vec![ModuleSlot::placeholder(PLACEHOLDER_ID)],
            input: InFlavour::Client,
            output: OutSpec::Client { cfg: RdEpCfg::default() },
            wr_ep_module_id: WR_EP_ID,
            rd_ep_module_id: RD_EP_ID,
        })
        .launch()
        .expect("launch");

    handle.graph(GraphOp::Open).expect("open");

    // Placeholder reset is legal while the graph is stopped.
    handle
        .set_cfg(PLACEHOLDER_ID, PARAM_ID_RESET_PLACEHOLDER_MODULE, Vec::new())
        .expect("reset while stopped");

    handle.graph(GraphOp::Prepare).expect("prepare");
    let mf = MediaFormat::pcm(24_000, 16, 1, Interleaving::Interleaved);
    handle.send_media_format(WR_EP_ID, mf).expect("media format");
    handle.graph(GraphOp::Start).expect("start");

    // Reset is refused once started.
    assert_eq!(
        handle
            .set_cfg(PLACEHOLDER_ID, PARAM_ID_RESET_PLACEHOLDER_MODULE, Vec::new())
            .unwrap_err(),
        Error::Unsupported
    );

    // Params cached in arrival order, event registration cached too.
    handle.set_cfg(PLACEHOLDER_ID, 0xa1, vec![1]).expect("param a");
    handle.set_cfg(PLACEHOLDER_ID, 0xa2, vec![2]).expect("param b");
    handle.set_cfg(PLACEHOLDER_ID, 0xa3, vec![3]).expect("param c");
    handle
        .register_event(PLACEHOLDER_ID, EVENT_RD_EP_MEDIA_FORMAT, test_client(), None, true)
        .expect("cache mf event");
    assert!(applied.lock().is_empty());

    // Binding needs an 8 MiB stack: the worker re-launches and the
    // command still acks exactly once.
    handle
        .set_cfg(
            PLACEHOLDER_ID,
            PARAM_ID_REAL_MODULE_ID,
            REAL_MODULE.to_le_bytes().to_vec(),
        )
        .expect("bind real module");

    assert_eq!(*applied.lock(), vec![0xa1, 0xa2, 0xa3]);

    // The cached registration was replayed with the known output format.
    let evt = sink
        .wait_for(TIMEOUT, |p| p.opcode == EVENT_RD_EP_MEDIA_FORMAT)
        .expect("media format re-raised");
    assert_eq!(MediaFormat::from_wire(&evt.payload).unwrap(), mf);

    // The re-launched worker still moves data.
    client_write(&io.memmap, data_handle, 0, &[0x66; 480]);
    io.out_queues[0]
        .push_back(QueueMsg::Packet(rd_buffer_packet(50, rd_handle, 0, 2048, 0, 0, 0)))
        .unwrap();
    io.in_queues[0]
        .push_back(QueueMsg::Packet(wr_data_packet(1, data_handle, 0, 480, None, 0)))
        .unwrap();
    let done = sink
        .wait_for(TIMEOUT, |p| p.opcode == DATA_RSP_RD_EP_DATA_BUFFER_DONE_V2)
        .expect("post-relaunch data");
    let done = aria_wire::packet::RdEpDataBufferDoneV2::from_bytes(&done.payload).unwrap();
    assert_eq!(done.data_size, 480);

    handle.close().expect("close");
}

#[test]
fn unknown_real_module_fails_and_placeholder_stays_unbound() {
    let sink = SinkState::new();
    let (handle, _io) = ContainerBuilder::new(EngineConfig::named("ph-fail"))
        .module_db(Arc::new(OneModuleDb {
            applied: Arc::new(Mutex::new(Vec::new())),
        }))
        .sink(Box::new(TestSink(sink)))
        .chain(ChainSpec {
            modules: vec![ModuleSlot::placeholder(PLACEHOLDER_ID)],
            input: InFlavour::Client,
            output: OutSpec::Client { cfg: RdEpCfg::default() },
            wr_ep_module_id: WR_EP_ID,
            rd_ep_module_id: RD_EP_ID,
        })
        .launch()
        .expect("launch");

    handle.graph(GraphOp::Open).expect("open");
    assert_eq!(
        handle
            .set_cfg(PLACEHOLDER_ID, PARAM_ID_REAL_MODULE_ID, 0x1u32.to_le_bytes().to_vec())
            .unwrap_err(),
        Error::Failed
    );

    // A later bind with the right id still works.
    handle
        .set_cfg(
            PLACEHOLDER_ID,
            PARAM_ID_REAL_MODULE_ID,
            REAL_MODULE.to_le_bytes().to_vec(),
        )
        .expect("second bind");

    handle.close().expect("close");
}
