//! End-to-end data-path behaviour through shared-memory endpoints.

mod support;

use std::time::Duration;

use aria_engine::{
    ChainSpec, ContainerBuilder, EngineConfig, GraphOp, InFlavour, MediaFormat, ModuleSlot, OutSpec,
    QueueMsg, RdEpCfg,
};
use aria_engine::media_format::Interleaving;
use aria_wire::mdwire;
use aria_wire::memmap::MemMapRegistry;
use aria_wire::packet::{
    DATA_CMD_WR_EP_EOS, DATA_RSP_RD_EP_DATA_BUFFER_DONE_V2, DATA_RSP_WR_EP_DATA_BUFFER_DONE_V2,
    EOS_FLAG_FLUSHING, EOS_POLICY_LAST, EVENT_RD_EP_EOS, EVENT_RD_EP_TIMESTAMP_DISC,
    FLAG_TIMESTAMP_VALID, Packet, RdEpDataBufferDoneV2, WrEpDataBufferDoneV2, WrEpEos,
};
use aria_wire::status::{STATUS_NEED_MORE, STATUS_OK};

use support::{SinkState, TestSink, client_read, client_write, rd_buffer_packet, test_client, wr_data_packet};

const WR_EP_ID: u32 = 0x100;
const RD_EP_ID: u32 = 0x200;
const TIMEOUT: Duration = Duration::from_secs(5);

/// 24 kHz mono 16-bit: 48 bytes per millisecond, so 960 bytes is 20 ms.
fn mono_24k() -> MediaFormat {
    MediaFormat::pcm(24_000, 16, 1, Interleaving::Interleaved)
}

fn engine_config() -> EngineConfig {
    let mut cfg = EngineConfig::named("gc-test");
    cfg.operating_frame_us = 20_000;
    cfg
}

struct ClientHarness {
    handle: aria_engine::ContainerHandle,
    io: aria_engine::ContainerIo,
    sink: std::sync::Arc<SinkState>,
    data_handle: u32,
    rd_handle: u32,
    md_handle: u32,
}

fn launch_client_chain(cfg: EngineConfig, rd_cfg: RdEpCfg) -> ClientHarness {
    support::init_tracing();
    let sink = SinkState::new();
    let memmap = MemMapRegistry::new();
    let data_handle = memmap.map(8192).unwrap();
    let rd_handle = memmap.map(8192).unwrap();
    let md_handle = memmap.map(1024).unwrap();

    let (handle, io) = ContainerBuilder::new(cfg)
        .sink(Box::new(TestSink(sink.clone())))
        .memmap(memmap)
        .chain(ChainSpec {
            modules: vec![ModuleSlot::new(1, support::Passthrough::boxed())],
            input: InFlavour::Client,
            output: OutSpec::Client { cfg: rd_cfg },
            wr_ep_module_id: WR_EP_ID,
            rd_ep_module_id: RD_EP_ID,
        })
        .launch()
        .expect("launch");

    handle.graph(GraphOp::Open).expect("open");
    handle.graph(GraphOp::Prepare).expect("prepare");
    handle.send_media_format(WR_EP_ID, mono_24k()).expect("media format");
    handle.graph(GraphOp::Start).expect("start");

    ClientHarness {
        handle,
        io,
        sink,
        data_handle,
        rd_handle,
        md_handle,
    }
}

fn wr_done(pkt: &Packet) -> Option<WrEpDataBufferDoneV2> {
    (pkt.opcode == DATA_RSP_WR_EP_DATA_BUFFER_DONE_V2)
        .then(|| WrEpDataBufferDoneV2::from_bytes(&pkt.payload).unwrap())
}

fn rd_done(pkt: &Packet) -> Option<RdEpDataBufferDoneV2> {
    (pkt.opcode == DATA_RSP_RD_EP_DATA_BUFFER_DONE_V2)
        .then(|| RdEpDataBufferDoneV2::from_bytes(&pkt.payload).unwrap())
}

#[test]
fn two_frame_relay_with_timestamps() {
    let h = launch_client_chain(engine_config(), RdEpCfg::default());
    h.handle
        .register_event(RD_EP_ID, EVENT_RD_EP_TIMESTAMP_DISC, test_client(), None, true)
        .expect("register disc event");

    // First 960-byte buffer stamped at 1000 us.
    let pattern: Vec<u8> = (0..960u32).map(|i| (i % 251) as u8).collect();
    client_write(&h.io.memmap, h.data_handle, 0, &pattern);
    h.io.out_queues[0]
        .push_back(QueueMsg::Packet(rd_buffer_packet(10, h.rd_handle, 0, 2048, 0, 0, 0)))
        .unwrap();
    h.io.in_queues[0]
        .push_back(QueueMsg::Packet(wr_data_packet(1, h.data_handle, 0, 960, Some(1000), 0)))
        .unwrap();

    let ack = h
        .sink
        .wait_for(TIMEOUT, |p| wr_done(p).is_some())
        .expect("write ack");
    let ack = wr_done(&ack).unwrap();
    assert_eq!(ack.data_status, STATUS_OK);
    assert_eq!(ack.data_mem_map_handle, h.data_handle);

    let done = h
        .sink
        .wait_for(TIMEOUT, |p| rd_done(p).is_some())
        .expect("read response");
    let done = rd_done(&done).unwrap();
    assert_eq!(done.data_size, 960);
    assert_eq!(done.num_frames, 1);
    assert_eq!(done.timestamp_lsw, 1000);
    assert_ne!(done.flags & FLAG_TIMESTAMP_VALID, 0);
    assert_eq!(client_read(&h.io.memmap, h.rd_handle, 0, 960), pattern);

    // Second buffer at 21000 us: exactly the extrapolated stamp, so no
    // discontinuity event fires.
    client_write(&h.io.memmap, h.data_handle, 0, &pattern);
    h.io.out_queues[0]
        .push_back(QueueMsg::Packet(rd_buffer_packet(11, h.rd_handle, 0, 2048, 0, 0, 0)))
        .unwrap();
    h.io.in_queues[0]
        .push_back(QueueMsg::Packet(wr_data_packet(2, h.data_handle, 0, 960, Some(21_000), 0)))
        .unwrap();

    let done = h
        .sink
        .wait_for(TIMEOUT, |p| rd_done(p).is_some())
        .expect("second read response");
    let done = rd_done(&done).unwrap();
    assert_eq!(done.data_size, 960);
    assert_eq!(done.timestamp_lsw, 21_000);
    assert!(!h.sink.contains(|p| p.opcode == EVENT_RD_EP_TIMESTAMP_DISC));

    h.handle.close().expect("close");
}

#[test]
fn flushing_eos_renders_after_all_data() {
    let h = launch_client_chain(engine_config(), RdEpCfg::default());
    h.handle
        .register_event(RD_EP_ID, EVENT_RD_EP_EOS, test_client(), None, true)
        .expect("register eos event");

    // Three read buffers up front: two for data, one for the EOS-only
    // delivery.
    for (token, off) in [(20u32, 0u64), (21, 2048), (22, 4096)] {
        h.io.out_queues[0]
            .push_back(QueueMsg::Packet(rd_buffer_packet(
                token,
                h.rd_handle,
                off,
                960,
                h.md_handle,
                0,
                256,
            )))
            .unwrap();
    }

    client_write(&h.io.memmap, h.data_handle, 0, &[0x11; 480]);
    client_write(&h.io.memmap, h.data_handle, 480, &[0x22; 480]);
    h.io.in_queues[0]
        .push_back(QueueMsg::Packet(wr_data_packet(1, h.data_handle, 0, 480, None, 0)))
        .unwrap();
    h.io.in_queues[0]
        .push_back(QueueMsg::Packet(wr_data_packet(2, h.data_handle, 480, 480, None, 0)))
        .unwrap();
    h.io.in_queues[0]
        .push_back(QueueMsg::Packet(Packet::new(
            DATA_CMD_WR_EP_EOS,
            3,
            test_client(),
            WrEpEos {
                flags: EOS_FLAG_FLUSHING,
                policy: EOS_POLICY_LAST,
            }
            .to_bytes(),
        )))
        .unwrap();

    let first = rd_done(&h.sink.wait_for(TIMEOUT, |p| rd_done(p).is_some()).expect("first")).unwrap();
    assert_eq!(first.data_size, 480);
    let second = rd_done(&h.sink.wait_for(TIMEOUT, |p| rd_done(p).is_some()).expect("second")).unwrap();
    assert_eq!(second.data_size, 480);

    // Third delivery is metadata-only and carries the EOS.
    let third = rd_done(&h.sink.wait_for(TIMEOUT, |p| rd_done(p).is_some()).expect("third")).unwrap();
    assert_eq!(third.num_frames, 0);
    assert_eq!(third.data_size, 0);
    assert!(third.md_size > 0);
    assert_eq!(third.md_status, STATUS_OK);

    let region = client_read(&h.io.memmap, h.md_handle, 0, third.md_size as usize);
    let mds = mdwire::parse_region(&region).expect("md parse");
    assert!(mds.iter().any(|m| m.id == mdwire::MD_ID_EOS));

    h.sink
        .wait_for(TIMEOUT, |p| p.opcode == EVENT_RD_EP_EOS)
        .expect("eos rendered event");

    h.handle.close().expect("close");
}

#[test]
fn oversize_frame_gets_need_more() {
    let h = launch_client_chain(engine_config(), RdEpCfg::default());

    // A 100-byte read buffer cannot hold a 480-byte frame.
    h.io.out_queues[0]
        .push_back(QueueMsg::Packet(rd_buffer_packet(30, h.rd_handle, 0, 100, 0, 0, 0)))
        .unwrap();
    client_write(&h.io.memmap, h.data_handle, 0, &[0x33; 480]);
    h.io.in_queues[0]
        .push_back(QueueMsg::Packet(wr_data_packet(1, h.data_handle, 0, 480, None, 0)))
        .unwrap();

    let done = rd_done(&h.sink.wait_for(TIMEOUT, |p| rd_done(p).is_some()).expect("reject")).unwrap();
    assert_eq!(done.data_status, STATUS_NEED_MORE);
    assert_eq!(done.data_size, 0);
    assert_eq!(done.num_frames, 0);

    // The data was retained; an adequate buffer picks it up.
    h.io.out_queues[0]
        .push_back(QueueMsg::Packet(rd_buffer_packet(31, h.rd_handle, 0, 2048, 0, 0, 0)))
        .unwrap();
    let done = rd_done(&h.sink.wait_for(TIMEOUT, |p| rd_done(p).is_some()).expect("retry")).unwrap();
    assert_eq!(done.data_status, STATUS_OK);
    assert_eq!(done.data_size, 480);
    assert_eq!(client_read(&h.io.memmap, h.rd_handle, 0, 480), vec![0x33; 480]);

    h.handle.close().expect("close");
}

#[test]
fn media_format_as_metadata_requires_room() {
    let rd_cfg = RdEpCfg {
        md_mf_enable: true,
        ..RdEpCfg::default()
    };
    let h = launch_client_chain(engine_config(), rd_cfg);

    // The pending media-format metadata does not fit an 8-byte region:
    // the buffer bounces immediately with NEED_MORE on the md side.
    h.io.out_queues[0]
        .push_back(QueueMsg::Packet(rd_buffer_packet(70, h.rd_handle, 0, 2048, h.md_handle, 0, 8)))
        .unwrap();
    let rejected = rd_done(&h.sink.wait_for(TIMEOUT, |p| rd_done(p).is_some()).expect("bounce")).unwrap();
    assert_eq!(rejected.md_status, STATUS_NEED_MORE);
    assert_eq!(rejected.data_size, 0);

    // A buffer with enough metadata room is accepted and carries the
    // format inline.
    h.io.out_queues[0]
        .push_back(QueueMsg::Packet(rd_buffer_packet(71, h.rd_handle, 0, 2048, h.md_handle, 0, 512)))
        .unwrap();
    client_write(&h.io.memmap, h.data_handle, 0, &[0x77; 480]);
    h.io.in_queues[0]
        .push_back(QueueMsg::Packet(wr_data_packet(1, h.data_handle, 0, 480, None, 0)))
        .unwrap();

    let done = rd_done(&h.sink.wait_for(TIMEOUT, |p| rd_done(p).is_some()).expect("accepted")).unwrap();
    assert_eq!(done.data_size, 480);
    assert_eq!(done.md_status, STATUS_OK);
    assert!(done.md_size > 0);
    let region = client_read(&h.io.memmap, h.md_handle, 0, done.md_size as usize);
    let mds = mdwire::parse_region(&region).expect("md parse");
    assert!(mds.iter().any(|m| m.id == mdwire::MD_ID_MEDIA_FORMAT));

    h.handle.close().expect("close");
}

#[test]
fn frames_accumulate_to_configured_count() {
    let rd_cfg = RdEpCfg {
        frames_per_buffer: aria_engine::FramesPerBuf::Count(2),
        ..RdEpCfg::default()
    };
    let h = launch_client_chain(engine_config(), rd_cfg);

    h.io.out_queues[0]
        .push_back(QueueMsg::Packet(rd_buffer_packet(40, h.rd_handle, 0, 4096, 0, 0, 0)))
        .unwrap();
    client_write(&h.io.memmap, h.data_handle, 0, &[0x44; 480]);
    client_write(&h.io.memmap, h.data_handle, 480, &[0x55; 480]);
    h.io.in_queues[0]
        .push_back(QueueMsg::Packet(wr_data_packet(1, h.data_handle, 0, 480, None, 0)))
        .unwrap();
    h.io.in_queues[0]
        .push_back(QueueMsg::Packet(wr_data_packet(2, h.data_handle, 480, 480, None, 0)))
        .unwrap();

    let done = rd_done(&h.sink.wait_for(TIMEOUT, |p| rd_done(p).is_some()).expect("response")).unwrap();
    assert_eq!(done.num_frames, 2);
    assert_eq!(done.data_size, 960);
    let bytes = client_read(&h.io.memmap, h.rd_handle, 0, 960);
    assert_eq!(&bytes[..480], &[0x44; 480][..]);
    assert_eq!(&bytes[480..], &[0x55; 480][..]);

    h.handle.close().expect("close");
}
