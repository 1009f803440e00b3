//! Signal-triggered cadence: underrun zero-fill with erasure, and the
//! overrun drop policy when no output buffer is available.

mod support;

use std::time::Duration;

use aria_engine::{
    ChainSpec, ContainerBuilder, EngineConfig, GraphOp, InFlavour, MediaFormat, ModuleSlot, OutSpec,
    QueueMsg, RdEpCfg,
};
use aria_engine::media_format::Interleaving;
use aria_wire::memmap::MemMapRegistry;
use aria_wire::packet::{
    DATA_RSP_RD_EP_DATA_BUFFER_DONE_V2, DATA_RSP_WR_EP_DATA_BUFFER_DONE_V2, RdEpDataBufferDoneV2,
};
use aria_wire::status::STATUS_OK;

use support::{SinkState, TestSink, client_read, client_write, rd_buffer_packet, wr_data_packet};

const WR_EP_ID: u32 = 0x100;
const RD_EP_ID: u32 = 0x200;
const TIMEOUT: Duration = Duration::from_secs(5);

fn launch_signal_chain() -> (
    aria_engine::ContainerHandle,
    aria_engine::ContainerIo,
    std::sync::Arc<SinkState>,
    u32,
    u32,
) {
    support::init_tracing();
    let sink = SinkState::new();
    let memmap = MemMapRegistry::new();
    let data_handle = memmap.map(4096).unwrap();
    let rd_handle = memmap.map(4096).unwrap();

    let mut cfg = EngineConfig::named("sig-test");
    cfg.operating_frame_us = 10_000; // 480 bytes at 48 bytes/ms

    let (handle, io) = ContainerBuilder::new(cfg)
        .sink(Box::new(TestSink(sink.clone())))
        .memmap(memmap)
        .signal_trigger()
        .chain(ChainSpec {
            modules: vec![ModuleSlot::new(1, support::Passthrough::with_threshold(480))],
            input: InFlavour::Client,
            output: OutSpec::Client { cfg: RdEpCfg::default() },
            wr_ep_module_id: WR_EP_ID,
            rd_ep_module_id: RD_EP_ID,
        })
        .launch()
        .expect("launch");

    handle.graph(GraphOp::Open).expect("open");
    handle.graph(GraphOp::Prepare).expect("prepare");
    handle
        .send_media_format(WR_EP_ID, MediaFormat::pcm(24_000, 16, 1, Interleaving::Interleaved))
        .expect("media format");
    handle.graph(GraphOp::Start).expect("start");

    (handle, io, sink, data_handle, rd_handle)
}

#[test]
fn underrun_zero_fills_to_threshold() {
    let (handle, io, sink, _data_handle, rd_handle) = launch_signal_chain();

    // Output buffer ready, no input: firing the trigger must still
    // produce a full frame of silence.
    io.out_queues[0]
        .push_back(QueueMsg::Packet(rd_buffer_packet(60, rd_handle, 0, 2048, 0, 0, 0)))
        .unwrap();
    io.signal_trigger.as_ref().expect("signal trigger").set();

    let done = sink
        .wait_for(TIMEOUT, |p| p.opcode == DATA_RSP_RD_EP_DATA_BUFFER_DONE_V2)
        .expect("underrun frame");
    let done = RdEpDataBufferDoneV2::from_bytes(&done.payload).unwrap();
    assert_eq!(done.data_size, 480);
    assert_eq!(done.num_frames, 1);
    assert!(client_read(&io.memmap, rd_handle, 0, 480).iter().all(|&b| b == 0));

    handle.close().expect("close");
}

#[test]
fn overrun_drops_data_to_keep_cadence() {
    let (handle, io, sink, data_handle, rd_handle) = launch_signal_chain();

    // Data arrives but the client posted no read buffer: the trigger
    // fires and the frame is dropped rather than blocking the worker.
    client_write(&io.memmap, data_handle, 0, &[0xaa; 480]);
    io.in_queues[0]
        .push_back(QueueMsg::Packet(wr_data_packet(1, data_handle, 0, 480, None, 0)))
        .unwrap();
    io.signal_trigger.as_ref().expect("signal trigger").set();

    let ack = sink
        .wait_for(TIMEOUT, |p| p.opcode == DATA_RSP_WR_EP_DATA_BUFFER_DONE_V2)
        .expect("write ack despite overrun");
    let ack = aria_wire::packet::WrEpDataBufferDoneV2::from_bytes(&ack.payload).unwrap();
    assert_eq!(ack.data_status, STATUS_OK);

    // The next frame flows normally: the dropped bytes never show up.
    client_write(&io.memmap, data_handle, 0, &[0xbb; 480]);
    io.out_queues[0]
        .push_back(QueueMsg::Packet(rd_buffer_packet(61, rd_handle, 0, 2048, 0, 0, 0)))
        .unwrap();
    io.in_queues[0]
        .push_back(QueueMsg::Packet(wr_data_packet(2, data_handle, 0, 480, None, 0)))
        .unwrap();
    io.signal_trigger.as_ref().expect("signal trigger").set();

    let done = sink
        .wait_for(TIMEOUT, |p| p.opcode == DATA_RSP_RD_EP_DATA_BUFFER_DONE_V2)
        .expect("post-overrun frame");
    let done = RdEpDataBufferDoneV2::from_bytes(&done.payload).unwrap();
    assert_eq!(done.data_size, 480);
    assert_eq!(client_read(&io.memmap, rd_handle, 0, 480), vec![0xbb; 480]);

    handle.close().expect("close");
}
