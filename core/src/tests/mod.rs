//! Scenario tests against the simulated core.
//!
//! A [`Rig`] wires a [`Device`] to a [`SimCodec`] and runs an interrupt pump
//! thread that feeds every latched completion to the device, the way the
//! platform's interrupt line would.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mfc_hal::sim::{SimCodec, SimConfig};
use mfc_hal::{CodecKind, OpenParams, PhysAddr};
use mfc_instance::{Buffer, Completion, FrameFlags, QueueKind, State};
use mfc_memory::CarveoutAllocator;

use crate::{Device, DeviceConfig, InstanceHandle, Platform};

mod decode;
mod recovery;

const WAIT: Duration = Duration::from_secs(5);

pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Source buffer `i` carrying `4096` bytes, timestamp `i`
pub(crate) fn src(i: u64) -> Buffer {
    Buffer::new(i, PhysAddr::new(0x1_0000_0000 + i * 0x10_0000), 0x10_0000)
        .with_payload(4096)
        .with_timestamp(i)
}

/// Destination buffer `i`, large enough for a 1080p NV12 picture
pub(crate) fn dst(i: u64) -> Buffer {
    Buffer::new(1_000_000 + i, PhysAddr::new(0x4_0000_0000 + i * 0x80_0000), 0x80_0000)
}

pub(crate) struct Rig {
    pub(crate) device: Arc<Device>,
    pub(crate) sim: Arc<SimCodec>,
    stop: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl Rig {
    pub(crate) fn new() -> Self {
        Self::with(DeviceConfig::default(), SimConfig::default())
    }

    pub(crate) fn with(config: DeviceConfig, sim_config: SimConfig) -> Self {
        let sim = Arc::new(SimCodec::new(sim_config));
        let platform = Platform {
            hw: sim.clone(),
            power: sim.clone(),
            allocator: Arc::new(CarveoutAllocator::default()),
        };
        let device = Arc::new(Device::new(config, platform, vec![0xa5; 8192]).unwrap());

        let stop = Arc::new(AtomicBool::new(false));
        let pump = {
            let (device, sim, stop) = (device.clone(), sim.clone(), stop.clone());
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    if sim.take_interrupt() {
                        device.handle_interrupt();
                    } else {
                        thread::sleep(Duration::from_micros(100));
                    }
                }
            })
        };

        Self {
            device,
            sim,
            stop,
            pump: Some(pump),
        }
    }

    pub(crate) fn open(&self, params: OpenParams) -> Session<'_> {
        let handle = self.device.open(params).unwrap();
        Session {
            rig: self,
            handle,
            queued: 0,
            done: Vec::new(),
        }
    }

    /// Decoder past header parsing and DPB setup, with `dpb` buffers from
    /// `dst(base..)`
    pub(crate) fn running_decoder(&self, codec: CodecKind, base: u64, dpb: u64) -> Session<'_> {
        let mut session = self.open(OpenParams::decoder(codec));
        session.source(src(base));
        assert!(session.wait_state(State::HeaderParsed));
        for i in 0..dpb {
            session.dest(dst(base + i));
        }
        assert!(session.wait_state(State::Running));
        session.poll();
        session
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

/// Client side of one instance: counts what it queued and what came back
pub(crate) struct Session<'a> {
    rig: &'a Rig,
    pub(crate) handle: InstanceHandle,
    pub(crate) queued: usize,
    pub(crate) done: Vec<Completion>,
}

impl Session<'_> {
    pub(crate) fn source(&mut self, buffer: Buffer) {
        self.rig.device.enqueue_source(self.handle, buffer).unwrap();
        self.queued += 1;
    }

    pub(crate) fn dest(&mut self, buffer: Buffer) {
        self.rig.device.enqueue_dest(self.handle, buffer).unwrap();
        self.queued += 1;
    }

    pub(crate) fn poll(&mut self) -> Vec<Completion> {
        let new = self.rig.device.poll_completions(self.handle).unwrap();
        self.done.extend(new.iter().copied());
        new
    }

    pub(crate) fn state(&self) -> State {
        self.rig.device.state(self.handle).unwrap()
    }

    pub(crate) fn wait_state(&self, state: State) -> bool {
        wait_until(|| self.state() == state)
    }

    /// Displayed pictures seen so far
    pub(crate) fn displayed(&self) -> Vec<Completion> {
        self.done
            .iter()
            .filter(|c| c.queue == QueueKind::Destination && c.flags.contains(FrameFlags::DISPLAYED))
            .copied()
            .collect()
    }

    /// Sources returned `Done` so far
    pub(crate) fn sources_done(&self) -> usize {
        self.done
            .iter()
            .filter(|c| c.queue == QueueKind::Source && c.is_done())
            .count()
    }

    /// Poll until `cond` holds on the completions seen so far
    pub(crate) fn poll_until(&mut self, mut cond: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        loop {
            self.poll();
            if cond(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Close and check that every queued buffer came back exactly once
    pub(crate) fn close(mut self) -> Vec<Completion> {
        let rest = self.rig.device.close(self.handle).unwrap();
        self.done.extend(rest.iter().copied());
        assert_eq!(self.done.len(), self.queued, "buffers lost or duplicated");
        self.done
    }
}
