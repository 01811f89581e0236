use std::sync::Arc;
use std::thread;

use mfc_hal::sim::SimConfig;
use mfc_hal::{CodecKind, Error, HwErrorCode, OpenParams, ReasonCode};
use mfc_instance::{QueueKind, State};

use super::{src, wait_until, Rig};
use crate::{DeviceConfig, Watchdog};

fn watchdog_config(threshold: u32) -> DeviceConfig {
    DeviceConfig {
        watchdog_threshold: threshold,
        ..DeviceConfig::default()
    }
}

#[test]
fn test_watchdog_recovers_stalled_core() {
    let rig = Rig::with(watchdog_config(3), SimConfig::default());
    let mut s = rig.running_decoder(CodecKind::H264, 0, 4);

    rig.sim.set_hung(true);
    s.source(src(1));
    assert!(!rig.device.watchdog_tick());
    assert!(!rig.device.watchdog_tick());
    assert!(rig.device.watchdog_tick());
    rig.sim.set_hung(false);

    assert_eq!(s.state(), State::Error);
    s.poll();
    // The stalled source and the whole DPB come back failed
    assert_eq!(s.done.iter().filter(|c| !c.is_done()).count(), 5);

    let stats = rig.device.stats();
    assert_eq!(stats.recoveries, 1);
    assert_eq!(rig.sim.stats().firmware_loads, 2);
    assert!(!rig.device.watchdog_tick());

    // Already released by the reset: no firmware round trip
    let closes = rig.sim.stats().closes;
    s.close();
    assert_eq!(rig.sim.stats().closes, closes);
    assert!(!rig.sim.powered());

    let s = rig.running_decoder(CodecKind::H264, 10, 4);
    assert_eq!(s.state(), State::Running);
    s.close();
}

#[test]
fn test_watchdog_idle_core_never_trips() {
    let rig = Rig::with(watchdog_config(1), SimConfig::default());
    let s = rig.running_decoder(CodecKind::H264, 0, 4);
    for _ in 0..5 {
        assert!(!rig.device.watchdog_tick());
    }
    assert_eq!(rig.device.stats().recoveries, 0);
    s.close();
}

#[test]
fn test_watchdog_thread() {
    let config = DeviceConfig {
        watchdog_period_ms: 5,
        ..watchdog_config(2)
    };
    let rig = Rig::with(config, SimConfig::default());
    let mut s = rig.running_decoder(CodecKind::H264, 0, 4);
    let watchdog = Watchdog::spawn(Arc::clone(&rig.device));

    rig.sim.set_hung(true);
    s.source(src(1));
    assert!(s.wait_state(State::Error));
    drop(watchdog);
    rig.sim.set_hung(false);

    assert!(rig.device.stats().recoveries >= 1);
    s.close();
}

#[test]
fn test_close_racing_recovery() {
    let rig = Rig::with(watchdog_config(1), SimConfig::default());
    let mut s = rig.running_decoder(CodecKind::H264, 0, 4);
    let handle = s.handle;

    rig.sim.set_hung(true);
    s.source(src(1));

    let first = thread::scope(|scope| {
        let closer = scope.spawn(|| rig.device.close(handle));
        // Close found the decode in flight
        assert!(wait_until(|| s.state() == State::Abort));
        assert!(rig.device.watchdog_tick());
        closer.join().unwrap()
    });
    rig.sim.set_hung(false);

    assert_eq!(first, Err(Error::HardwareFault));
    assert_eq!(s.state(), State::Error);
    s.close();
}

#[test]
fn test_open_timeout() {
    let config = DeviceConfig {
        ack_timeout_ms: 100,
        ..DeviceConfig::default()
    };
    let rig = Rig::with(config, SimConfig::default());

    rig.sim.set_hung(true);
    let err = rig.device.open(OpenParams::decoder(CodecKind::H264));
    assert_eq!(err, Err(Error::HardwareFault));
    rig.sim.set_hung(false);

    let stats = rig.device.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.open_instances, 0);
    assert!(!rig.sim.powered());

    let s = rig.open(OpenParams::decoder(CodecKind::H264));
    assert_eq!(s.state(), State::GotInstance);
    s.close();
}

#[test]
fn test_close_timeout_recovers() {
    let config = DeviceConfig {
        ack_timeout_ms: 100,
        ..DeviceConfig::default()
    };
    let rig = Rig::with(config, SimConfig::default());
    let mut s = rig.running_decoder(CodecKind::H264, 0, 4);

    // The drain job never answers
    rig.sim.set_hung(true);
    assert_eq!(rig.device.close(s.handle), Err(Error::HardwareFault));
    rig.sim.set_hung(false);

    let stats = rig.device.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.recoveries, 1);
    assert_eq!(s.state(), State::Error);

    let closes = rig.sim.stats().closes;
    let done = s.close();
    assert_eq!(rig.sim.stats().closes, closes);
    assert!(done.iter().filter(|c| c.queue == QueueKind::Destination).all(|c| !c.is_done()));
    assert!(!rig.sim.powered());
}

#[test]
fn test_instance_error_spares_siblings() {
    let rig = Rig::new();
    let mut a = rig.running_decoder(CodecKind::H264, 0, 4);
    let mut b = rig.running_decoder(CodecKind::H264, 100, 4);

    rig.sim.inject_next(ReasonCode::Error, HwErrorCode::HEADER_CORRUPT);
    a.source(src(1));
    assert!(a.wait_state(State::Error));

    b.source(src(101));
    assert!(b.poll_until(|s| s.displayed().len() == 1));
    assert_eq!(b.state(), State::Running);
    assert_eq!(rig.device.stats().recoveries, 0);

    // Core still knows the failed instance: close releases it there
    let closes = rig.sim.stats().closes;
    a.close();
    assert_eq!(rig.sim.stats().closes, closes + 1);
    b.close();
}

#[test]
fn test_unknown_reason_is_protocol_error() {
    let rig = Rig::new();
    let mut s = rig.running_decoder(CodecKind::H264, 0, 4);

    rig.sim.inject_raw(99);
    s.source(src(1));
    assert!(s.wait_state(State::Error));
    assert_eq!(rig.device.stats().protocol_errors, 1);
    s.close();
}

#[test]
fn test_command_failure_fails_only_its_instance() {
    let rig = Rig::new();
    let mut a = rig.running_decoder(CodecKind::H264, 0, 4);
    let mut b = rig.running_decoder(CodecKind::H264, 100, 4);

    rig.sim.fail_next_command();
    a.source(src(1));
    assert_eq!(a.state(), State::Error);
    assert_eq!(rig.device.stats().sync_failures, 1);

    b.source(src(101));
    assert!(b.poll_until(|s| s.displayed().len() == 1));
    a.close();
    b.close();
}

#[test]
fn test_shutdown_returns_every_buffer() {
    let rig = Rig::new();
    let mut s = rig.running_decoder(CodecKind::H264, 0, 4);

    rig.device.suspend().unwrap();
    for i in 1..=3 {
        s.source(src(i));
    }
    let returned = rig.device.shutdown();

    assert_eq!(s.done.len() + returned.len(), s.queued);
    assert!(returned.iter().all(|c| !c.is_done()));
    assert_eq!(returned.iter().filter(|c| c.queue == QueueKind::Source).count(), 3);
    assert_eq!(rig.device.state(s.handle), Err(Error::InvalidHandle));
    assert!(!rig.sim.powered());
    assert_eq!(rig.device.pool().bytes_in_use, 0);

    // Usable again afterwards
    let s = rig.running_decoder(CodecKind::H264, 10, 4);
    s.close();
}
