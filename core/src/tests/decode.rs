use std::thread;
use std::time::{Duration, Instant};

use mfc_hal::sim::SimConfig;
use mfc_hal::{CodecKind, Geometry, HwErrorCode, OpenParams, ReasonCode, StreamInfo};
use mfc_instance::{FrameFlags, QueueKind, State};

use super::{dst, src, Rig};
use crate::DeviceConfig;

#[test]
fn test_decode_1080p_stream() {
    let rig = Rig::new();
    let mut s = rig.running_decoder(CodecKind::H264, 0, 4);
    assert_eq!(rig.device.geometry(s.handle).unwrap(), Geometry::new(1920, 1080));

    for i in 1..=10 {
        s.source(src(i));
    }

    // Hand every displayed picture straight back, like a renderer would
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut returned = 0;
    while s.displayed().len() < 10 {
        assert!(Instant::now() < deadline, "decode stalled");
        s.poll();
        let shown = s.displayed();
        for c in &shown[returned..] {
            s.dest(dst(c.buffer.cookie - 1_000_000));
        }
        returned = shown.len();
        thread::sleep(Duration::from_millis(1));
    }
    assert!(s.poll_until(|s| s.sources_done() == 11));

    let shown = s.displayed();
    let frame = Geometry::new(1920, 1080).frame_size();
    for (n, c) in shown.iter().take(10).enumerate() {
        assert!(c.is_done());
        assert_eq!(c.buffer.bytes_used, frame);
        assert_eq!(c.buffer.timestamp, n as u64 + 1);
    }

    let stats = rig.device.instance_stats(s.handle).unwrap();
    assert_eq!(stats.frames_decoded, 10);

    s.close();
    assert_eq!(rig.sim.resident_instances(), 0);
    assert!(!rig.sim.powered());
    assert_eq!(rig.device.pool().bytes_in_use, 0);
}

#[test]
fn test_resolution_change() {
    let rig = Rig::new();
    let mut s = rig.running_decoder(CodecKind::H264, 0, 4);
    s.source(src(1));
    s.source(src(2));
    assert!(s.poll_until(|s| s.displayed().len() == 2));

    rig.sim.set_stream(StreamInfo {
        geometry: Geometry::new(1280, 720),
        dpb_count: 3,
    });
    rig.sim.inject_next(ReasonCode::ResolutionChanged, HwErrorCode::NONE);
    s.source(src(3));

    // Old DPB flushed, header re-parsed from the same source
    assert!(super::wait_until(|| {
        rig.device.geometry(s.handle).ok() == Some(Geometry::new(1280, 720))
    }));
    assert_eq!(s.state(), State::ResChangeEnd);
    s.poll();
    let flushed = s
        .done
        .iter()
        .filter(|c| c.queue == QueueKind::Destination && !c.is_done())
        .count();
    assert_eq!(flushed, 2);

    for i in 10..13 {
        s.dest(dst(i));
    }
    assert!(s.wait_state(State::Running));

    s.source(src(4));
    assert!(s.poll_until(|s| s.displayed().len() == 3));
    let last = s.displayed()[2];
    assert_eq!(last.buffer.bytes_used, Geometry::new(1280, 720).frame_size());
    assert_eq!(last.buffer.timestamp, 4);
    assert_eq!(rig.device.instance_stats(s.handle).unwrap().resolution_changes, 1);

    s.close();
}

#[test]
fn test_packed_source_continues_in_one_job() {
    let rig = Rig::new();
    let mut s = rig.running_decoder(CodecKind::Mpeg4, 0, 4);
    let jobs_before = rig.device.stats().jobs;

    rig.sim.set_bytes_per_frame(Some(1000));
    s.source(src(1).with_payload(3000));
    assert!(s.poll_until(|s| s.sources_done() == 2));

    assert_eq!(s.displayed().len(), 3);
    assert_eq!(rig.device.stats().resubmits, 2);
    // One dispatch, three hardware passes
    assert_eq!(rig.device.stats().jobs - jobs_before, 1);
    assert_eq!(rig.sim.stats().max_in_flight, 1);

    s.close();
}

#[test]
fn test_close_drains_held_pictures() {
    let sim = SimConfig {
        display_delay: 1,
        ..SimConfig::default()
    };
    let rig = Rig::with(DeviceConfig::default(), sim);
    let mut s = rig.running_decoder(CodecKind::H264, 0, 4);

    for i in 1..=3 {
        s.source(src(i));
    }
    assert!(s.poll_until(|s| s.sources_done() == 4));
    assert_eq!(s.displayed().len(), 2);

    let done = s.close();
    let last = done
        .iter()
        .rev()
        .find(|c| c.flags.contains(FrameFlags::DISPLAYED))
        .copied()
        .unwrap();
    assert_eq!(last.buffer.timestamp, 3);
    assert!(last.is_done());
}

#[test]
fn test_flush_drops_queue_and_dpb() {
    let rig = Rig::new();
    let mut s = rig.running_decoder(CodecKind::H264, 0, 4);

    rig.device.suspend().unwrap();
    for i in 1..=3 {
        s.source(src(i));
    }
    rig.device.flush(s.handle).unwrap();
    rig.device.resume().unwrap();

    assert!(s.wait_state(State::HeaderParsed));
    s.poll();
    assert_eq!(s.done.iter().filter(|c| !c.is_done()).count(), 7);

    for i in 0..4 {
        s.dest(dst(i));
    }
    assert!(s.wait_state(State::Running));
    s.source(src(4));
    assert!(s.poll_until(|s| s.displayed().len() == 1));
    assert_eq!(rig.device.instance_stats(s.handle).unwrap().flushes, 1);

    s.close();
}

#[test]
fn test_warning_completes_frame_concealed() {
    let rig = Rig::new();
    let mut s = rig.running_decoder(CodecKind::H264, 0, 4);

    rig.sim.set_next_error(HwErrorCode::CONCEALED_MB);
    s.source(src(1));
    assert!(s.poll_until(|s| s.displayed().len() == 1));
    assert!(s.displayed()[0].flags.contains(FrameFlags::CONCEALED));
    assert_eq!(s.state(), State::Running);

    s.source(src(2));
    assert!(s.poll_until(|s| s.displayed().len() == 2));
    assert!(!s.displayed()[1].flags.contains(FrameFlags::CONCEALED));

    s.close();
}

#[test]
fn test_zero_geometry_fails_instance() {
    let rig = Rig::new();
    rig.sim.set_stream(StreamInfo {
        geometry: Geometry::new(0, 0),
        dpb_count: 4,
    });
    let mut s = rig.open(OpenParams::decoder(CodecKind::H264));
    rig.device.suspend().unwrap();
    s.source(src(0));
    s.source(src(1));
    rig.device.resume().unwrap();
    assert!(s.wait_state(State::Error));

    s.poll();
    assert_eq!(s.done.len(), 2);
    assert!(s.done[0].is_done());
    assert!(!s.done[1].is_done());

    // Firmware instance still resident: close goes through the core
    s.close();
    assert_eq!(rig.sim.resident_instances(), 0);
}
