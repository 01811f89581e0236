//! # Simulated Codec Core
//!
//! A software model of the codec core that implements [`HardwareOps`] and
//! [`PowerControl`]. It understands just enough of the job protocol to drive
//! the scheduler end to end: instances, header parse, DPB slots with a
//! sliding reference window, display delay, packed source buffers, slice
//! split encoding, drain and flush.
//!
//! Submitting a job queues its completion. The platform side (a test's
//! interrupt pump) calls [`SimCodec::take_interrupt`] to latch the next
//! completion into the `read_*` registers and then invokes the device's
//! interrupt handler.
//!
//! Fault injection:
//! - [`SimCodec::set_hung`] swallows completions (watchdog tests)
//! - [`SimCodec::inject_next`] replaces the next job's completion
//! - [`SimCodec::set_next_error`] tags the next completion with an error code
//! - [`SimCodec::fail_next_command`] makes the next command fail synchronously

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::ops::{HardwareOps, PowerControl};
use crate::reason::{DisplayStatus, FrameStatus, HwErrorCode, Interrupt, ReasonCode};
use crate::types::{CodecKind, Geometry, HwInstanceId, OpenParams, PhysAddr, Role, StreamInfo};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Behaviour of the simulated core
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// What the next header parse reports
    pub stream: StreamInfo,
    /// Decoded pictures kept as reference (sliding window)
    pub ref_depth: usize,
    /// Pictures held back before display
    pub display_delay: usize,
    /// Bytes consumed per decode job (`None` = whole buffer)
    pub bytes_per_frame: Option<usize>,
    /// Bytes consumed by a header parse (0 = whole buffer)
    pub header_bytes: usize,
    /// Bytes produced per encoded frame
    pub encoded_size: usize,
    /// Bytes produced by encoder header generation
    pub header_size: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            stream: StreamInfo {
                geometry: Geometry::new(1920, 1080),
                dpb_count: 4,
            },
            ref_depth: 2,
            display_delay: 0,
            bytes_per_frame: None,
            header_bytes: 0,
            encoded_size: 4096,
            header_size: 32,
        }
    }
}

/// Counters kept by the simulated core
#[derive(Debug, Clone, Copy, Default)]
pub struct SimStats {
    /// Jobs submitted (each completes with one interrupt)
    pub jobs: u64,
    /// Jobs currently running
    pub in_flight: u32,
    /// Highest concurrent job count ever observed
    pub max_in_flight: u32,
    /// Firmware loads
    pub firmware_loads: u64,
    /// Core resets
    pub resets: u64,
    /// `open_instance` calls
    pub opens: u64,
    /// `close_instance` calls
    pub closes: u64,
    /// Commands issued while the clock was gated
    pub clock_violations: u64,
    /// Completions swallowed while hung
    pub dropped: u64,
}

// =============================================================================
// INTERNAL STATE
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Latch {
    interrupt: Interrupt,
    stream: StreamInfo,
    consumed: usize,
    mask: u32,
    frame: FrameStatus,
    encoded: usize,
}

impl Latch {
    const fn idle() -> Self {
        Self {
            interrupt: Interrupt::ok(ReasonCode::Error),
            stream: StreamInfo {
                geometry: Geometry::new(0, 0),
                dpb_count: 0,
            },
            consumed: 0,
            mask: 0,
            frame: FrameStatus::empty(),
            encoded: 0,
        }
    }

    fn reason(reason: ReasonCode) -> Self {
        Self {
            interrupt: Interrupt::ok(reason),
            ..Self::idle()
        }
    }
}

#[derive(Debug)]
struct SimInstance {
    role: Role,
    stream: StreamInfo,
    slices_per_frame: u32,
    slice: u32,
    /// (slot, address) of reference pictures, oldest first
    refs: VecDeque<(usize, PhysAddr)>,
    /// Decoded pictures waiting for display
    decoded: VecDeque<PhysAddr>,
}

impl SimInstance {
    fn mask(&self) -> u32 {
        self.refs.iter().fold(0, |m, (slot, _)| m | (1 << slot))
    }
}

#[derive(Debug)]
struct SimState {
    config: SimConfig,
    instances: BTreeMap<u32, SimInstance>,
    next_id: u32,
    pending: VecDeque<Latch>,
    latched: Latch,
    firmware_loaded: bool,
    powered: bool,
    clock: bool,
    hung: bool,
    inject: Option<Interrupt>,
    next_error: Option<HwErrorCode>,
    fail_next: bool,
    job_log: Vec<HwInstanceId>,
    stats: SimStats,
}

impl SimState {
    /// Common gate for every command
    fn command(&mut self) -> Result<()> {
        if !self.clock {
            self.stats.clock_violations += 1;
            return Err(Error::ClockGated);
        }
        if self.fail_next {
            self.fail_next = false;
            return Err(Error::HardwareError(HwErrorCode::INVALID_COMMAND));
        }
        Ok(())
    }

    fn instance(&mut self, id: HwInstanceId) -> Result<&mut SimInstance> {
        self.instances
            .get_mut(&id.0)
            .ok_or(Error::HardwareError(HwErrorCode::INVALID_COMMAND))
    }

    /// Queue the completion of a job just started
    fn complete(&mut self, id: u32, mut latch: Latch) {
        self.stats.jobs += 1;
        self.job_log.push(HwInstanceId(id));
        self.stats.in_flight += 1;
        self.stats.max_in_flight = self.stats.max_in_flight.max(self.stats.in_flight);

        if let Some(interrupt) = self.inject.take() {
            latch = Latch {
                interrupt,
                mask: latch.mask,
                ..Latch::idle()
            };
        } else if let Some(error) = self.next_error.take() {
            latch.interrupt.error = error;
        }

        if self.hung {
            log::trace!("sim: completion for instance {} swallowed", id);
            self.stats.dropped += 1;
            return;
        }
        self.pending.push_back(latch);
    }
}

// =============================================================================
// SIMULATED CORE
// =============================================================================

/// Simulated codec core
#[derive(Debug)]
pub struct SimCodec {
    state: Mutex<SimState>,
}

impl SimCodec {
    /// Create a core with the given behaviour
    pub fn new(config: SimConfig) -> Self {
        Self {
            state: Mutex::new(SimState {
                config,
                instances: BTreeMap::new(),
                next_id: 1,
                pending: VecDeque::new(),
                latched: Latch::idle(),
                firmware_loaded: false,
                powered: false,
                clock: false,
                hung: false,
                inject: None,
                next_error: None,
                fail_next: false,
                job_log: Vec::new(),
                stats: SimStats::default(),
            }),
        }
    }

    /// Latch the next queued completion into the read registers
    ///
    /// Returns `false` when nothing is pending.
    pub fn take_interrupt(&self) -> bool {
        let mut state = self.state.lock();
        match state.pending.pop_front() {
            Some(latch) => {
                state.latched = latch;
                state.stats.in_flight = state.stats.in_flight.saturating_sub(1);
                true
            },
            None => false,
        }
    }

    /// Stop (or restart) raising completions
    pub fn set_hung(&self, hung: bool) {
        log::debug!("sim: hung = {}", hung);
        self.state.lock().hung = hung;
    }

    /// Replace the next job's completion; the job has no other effect
    pub fn inject_next(&self, reason: ReasonCode, error: HwErrorCode) {
        log::debug!("sim: next completion replaced by {:?} ({:?})", reason, error);
        self.state.lock().inject = Some(Interrupt::with_error(reason, error));
    }

    /// Replace the next job's completion with an arbitrary raw reason
    pub fn inject_raw(&self, reason: u32) {
        log::debug!("sim: next completion replaced by raw reason {}", reason);
        self.state.lock().inject = Some(Interrupt {
            reason,
            error: HwErrorCode::NONE,
        });
    }

    /// Run the next job normally but report `error` with its completion
    pub fn set_next_error(&self, error: HwErrorCode) {
        self.state.lock().next_error = Some(error);
    }

    /// Make the next command fail synchronously
    pub fn fail_next_command(&self) {
        log::debug!("sim: next command fails");
        self.state.lock().fail_next = true;
    }

    /// Stream parameters reported by subsequent header parses
    pub fn set_stream(&self, stream: StreamInfo) {
        self.state.lock().config.stream = stream;
    }

    /// Bytes consumed per decode job from now on
    pub fn set_bytes_per_frame(&self, bytes: Option<usize>) {
        self.state.lock().config.bytes_per_frame = bytes;
    }

    /// Counter snapshot
    pub fn stats(&self) -> SimStats {
        self.state.lock().stats
    }

    /// Is the firmware booted?
    pub fn firmware_loaded(&self) -> bool {
        self.state.lock().firmware_loaded
    }

    /// Is the block powered?
    pub fn powered(&self) -> bool {
        self.state.lock().powered
    }

    /// Is the clock ungated?
    pub fn clock_enabled(&self) -> bool {
        self.state.lock().clock
    }

    /// Instance of every job submitted so far, in order
    pub fn job_log(&self) -> Vec<HwInstanceId> {
        self.state.lock().job_log.clone()
    }

    /// Forget the job log
    pub fn clear_job_log(&self) {
        self.state.lock().job_log.clear();
    }

    /// Firmware instances currently resident
    pub fn resident_instances(&self) -> usize {
        self.state.lock().instances.len()
    }
}

impl Default for SimCodec {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl HardwareOps for SimCodec {
    fn load_firmware(&self, blob: &[u8], addr: PhysAddr) -> Result<()> {
        let mut state = self.state.lock();
        state.command()?;
        if blob.is_empty() || addr.is_null() {
            return Err(Error::FirmwareLoadFailed);
        }
        state.firmware_loaded = true;
        state.stats.firmware_loads += 1;
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.command()?;
        state.instances.clear();
        state.pending.clear();
        state.firmware_loaded = false;
        state.stats.in_flight = 0;
        state.stats.resets += 1;
        Ok(())
    }

    fn init_device(&self, ctx: PhysAddr) -> Result<()> {
        let mut state = self.state.lock();
        state.command()?;
        if !state.firmware_loaded || ctx.is_null() {
            return Err(Error::FirmwareLoadFailed);
        }
        Ok(())
    }

    fn open_instance(
        &self,
        _codec: CodecKind,
        params: &OpenParams,
        ctx: PhysAddr,
    ) -> Result<HwInstanceId> {
        let mut state = self.state.lock();
        state.command()?;
        if !state.firmware_loaded || ctx.is_null() {
            return Err(Error::FirmwareLoadFailed);
        }

        let id = state.next_id;
        state.next_id += 1;
        let stream = match params.role {
            Role::Decoder => state.config.stream,
            Role::Encoder => StreamInfo {
                geometry: params.geometry,
                dpb_count: 0,
            },
        };
        state.instances.insert(
            id,
            SimInstance {
                role: params.role,
                stream,
                slices_per_frame: params.encode.slices_per_frame.max(1),
                slice: 0,
                refs: VecDeque::new(),
                decoded: VecDeque::new(),
            },
        );
        state.stats.opens += 1;
        state.complete(id, Latch::reason(ReasonCode::OpenInstanceDone));
        Ok(HwInstanceId(id))
    }

    fn close_instance(&self, id: HwInstanceId) -> Result<()> {
        let mut state = self.state.lock();
        state.command()?;
        state.instance(id)?;
        state.instances.remove(&id.0);
        state.stats.closes += 1;
        state.complete(id.0, Latch::reason(ReasonCode::CloseInstanceDone));
        Ok(())
    }

    fn parse_header(&self, id: HwInstanceId, _src: PhysAddr, len: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.command()?;
        let stream = state.config.stream;
        let header_bytes = state.config.header_bytes;
        let inst = state.instance(id)?;
        inst.stream = stream;
        inst.refs.clear();
        inst.decoded.clear();

        let latch = Latch {
            stream,
            consumed: if header_bytes == 0 { len } else { header_bytes.min(len) },
            ..Latch::reason(ReasonCode::SeqDone)
        };
        state.complete(id.0, latch);
        Ok(())
    }

    fn encode_header(&self, id: HwInstanceId, _dst: PhysAddr, len: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.command()?;
        let header_size = state.config.header_size;
        let inst = state.instance(id)?;
        let stream = inst.stream;

        let latch = Latch {
            stream,
            encoded: header_size.min(len),
            ..Latch::reason(ReasonCode::SeqDone)
        };
        state.complete(id.0, latch);
        Ok(())
    }

    fn init_buffers(
        &self,
        id: HwInstanceId,
        dpb: &[PhysAddr],
        scratch: PhysAddr,
        _scratch_len: usize,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.command()?;
        let inst = state.instance(id)?;
        let too_small = inst.role == Role::Decoder && dpb.len() < inst.stream.dpb_count as usize;

        let latch = if too_small || scratch.is_null() {
            Latch {
                interrupt: Interrupt::with_error(ReasonCode::Error, HwErrorCode::BUFFER_TOO_SMALL),
                ..Latch::idle()
            }
        } else {
            Latch::reason(ReasonCode::InitBuffersDone)
        };
        state.complete(id.0, latch);
        Ok(())
    }

    fn submit_decode(
        &self,
        id: HwInstanceId,
        _src: PhysAddr,
        src_len: usize,
        dst_addrs: &[PhysAddr],
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.command()?;
        let config = state.config;
        let inst = state.instance(id)?;

        // End-of-stream drain: display what is held back, then report the end
        if src_len == 0 {
            let latch = match inst.decoded.pop_front() {
                Some(addr) => Latch {
                    frame: FrameStatus {
                        display: DisplayStatus::DisplayOnly,
                        decoded: None,
                        displayed: Some(addr),
                    },
                    mask: inst.mask(),
                    ..Latch::reason(ReasonCode::FrameDone)
                },
                None => {
                    inst.refs.clear();
                    Latch::reason(ReasonCode::CompleteSeq)
                },
            };
            state.complete(id.0, latch);
            return Ok(());
        }

        let (slot, addr) = dst_addrs
            .iter()
            .enumerate()
            .find(|(_, a)| !a.is_null())
            .map(|(i, a)| (i, *a))
            .ok_or(Error::InvalidBuffer)?;

        inst.refs.push_back((slot, addr));
        while inst.refs.len() > config.ref_depth {
            inst.refs.pop_front();
        }
        inst.decoded.push_back(addr);
        let displayed = if inst.decoded.len() > config.display_delay {
            inst.decoded.pop_front()
        } else {
            None
        };

        let latch = Latch {
            frame: FrameStatus {
                display: if displayed.is_some() {
                    DisplayStatus::DecodeAndDisplay
                } else {
                    DisplayStatus::DecodeOnly
                },
                decoded: Some(addr),
                displayed,
            },
            consumed: config.bytes_per_frame.map_or(src_len, |n| n.min(src_len)),
            mask: inst.mask(),
            ..Latch::reason(ReasonCode::FrameDone)
        };
        state.complete(id.0, latch);
        Ok(())
    }

    fn submit_encode(
        &self,
        id: HwInstanceId,
        src_addrs: &[PhysAddr],
        dst: PhysAddr,
        dst_len: usize,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.command()?;
        if src_addrs.is_empty() || dst.is_null() {
            return Err(Error::InvalidBuffer);
        }
        let encoded_size = state.config.encoded_size;
        let inst = state.instance(id)?;

        inst.slice += 1;
        let latch = if inst.slice < inst.slices_per_frame {
            Latch::reason(ReasonCode::SliceDone)
        } else {
            inst.slice = 0;
            Latch {
                encoded: encoded_size.min(dst_len),
                ..Latch::reason(ReasonCode::FrameDone)
            }
        };
        state.complete(id.0, latch);
        Ok(())
    }

    fn flush_dpb(&self, id: HwInstanceId) -> Result<()> {
        let mut state = self.state.lock();
        state.command()?;
        let inst = state.instance(id)?;
        inst.refs.clear();
        inst.decoded.clear();
        state.complete(id.0, Latch::reason(ReasonCode::DpbFlushDone));
        Ok(())
    }

    fn abort(&self, id: HwInstanceId) -> Result<()> {
        let mut state = self.state.lock();
        state.command()?;
        let inst = state.instance(id)?;
        inst.slice = 0;
        state.complete(id.0, Latch::reason(ReasonCode::AbortDone));
        Ok(())
    }

    fn read_completion_reason(&self) -> Interrupt {
        self.state.lock().latched.interrupt
    }

    fn read_geometry(&self) -> StreamInfo {
        self.state.lock().latched.stream
    }

    fn read_consumed_bytes(&self) -> usize {
        self.state.lock().latched.consumed
    }

    fn read_reference_used_mask(&self) -> u32 {
        self.state.lock().latched.mask
    }

    fn read_frame_status(&self) -> FrameStatus {
        self.state.lock().latched.frame
    }

    fn read_encoded_size(&self) -> usize {
        self.state.lock().latched.encoded
    }
}

impl PowerControl for SimCodec {
    fn power_on(&self) -> Result<()> {
        self.state.lock().powered = true;
        Ok(())
    }

    fn power_off(&self) {
        let mut state = self.state.lock();
        state.powered = false;
        state.firmware_loaded = false;
    }

    fn clock_on(&self) {
        self.state.lock().clock = true;
    }

    fn clock_off(&self) {
        self.state.lock().clock = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booted() -> SimCodec {
        let sim = SimCodec::default();
        sim.power_on().unwrap();
        sim.clock_on();
        sim.reset().unwrap();
        sim.load_firmware(&[1, 2, 3], PhysAddr::new(0x1000)).unwrap();
        sim.init_device(PhysAddr::new(0x2000)).unwrap();
        sim
    }

    fn open(sim: &SimCodec) -> HwInstanceId {
        let params = OpenParams::decoder(CodecKind::H264);
        let id = sim.open_instance(CodecKind::H264, &params, PhysAddr::new(0x3000)).unwrap();
        assert!(sim.take_interrupt());
        id
    }

    #[test]
    fn test_gated_clock_rejects_commands() {
        let sim = booted();
        sim.clock_off();
        assert_eq!(sim.reset(), Err(Error::ClockGated));
        assert_eq!(sim.stats().clock_violations, 1);
    }

    #[test]
    fn test_open_completion_latched() {
        let sim = booted();
        let _ = open(&sim);
        assert_eq!(
            sim.read_completion_reason().reason_code(),
            Some(ReasonCode::OpenInstanceDone)
        );
        assert!(!sim.take_interrupt());
        assert_eq!(sim.stats().max_in_flight, 1);
    }

    #[test]
    fn test_reference_window_mask() {
        let sim = booted();
        let id = open(&sim);
        let slots = [
            PhysAddr::new(0x10_0000),
            PhysAddr::new(0x20_0000),
            PhysAddr::new(0x30_0000),
        ];

        sim.submit_decode(id, PhysAddr::new(0x9000), 100, &slots).unwrap();
        assert!(sim.take_interrupt());
        assert_eq!(sim.read_reference_used_mask(), 0b001);
        assert_eq!(sim.read_frame_status().displayed, Some(slots[0]));

        let table = [PhysAddr::null(), slots[1], slots[2]];
        sim.submit_decode(id, PhysAddr::new(0x9000), 100, &table).unwrap();
        assert!(sim.take_interrupt());
        assert_eq!(sim.read_reference_used_mask(), 0b011);

        let table = [PhysAddr::null(), PhysAddr::null(), slots[2]];
        sim.submit_decode(id, PhysAddr::new(0x9000), 100, &table).unwrap();
        assert!(sim.take_interrupt());
        // Window of two: slot 0 dropped out
        assert_eq!(sim.read_reference_used_mask(), 0b110);
    }

    #[test]
    fn test_hung_core_swallows_completion() {
        let sim = booted();
        sim.set_hung(true);
        let params = OpenParams::decoder(CodecKind::H264);
        sim.open_instance(CodecKind::H264, &params, PhysAddr::new(0x3000)).unwrap();
        assert!(!sim.take_interrupt());
        assert_eq!(sim.stats().in_flight, 1);
        sim.reset().unwrap();
        assert_eq!(sim.stats().in_flight, 0);
    }

    #[test]
    fn test_slice_split_encode() {
        let sim = booted();
        let mut params = OpenParams::encoder(CodecKind::H264, Geometry::new(640, 480));
        params.encode.slices_per_frame = 2;
        let id = sim.open_instance(CodecKind::H264, &params, PhysAddr::new(0x3000)).unwrap();
        assert!(sim.take_interrupt());

        let src = [PhysAddr::new(0x5000)];
        sim.submit_encode(id, &src, PhysAddr::new(0x6000), 8192).unwrap();
        assert!(sim.take_interrupt());
        assert_eq!(sim.read_completion_reason().reason_code(), Some(ReasonCode::SliceDone));
        sim.submit_encode(id, &src, PhysAddr::new(0x6000), 8192).unwrap();
        assert!(sim.take_interrupt());
        assert_eq!(sim.read_completion_reason().reason_code(), Some(ReasonCode::FrameDone));
        assert_eq!(sim.read_encoded_size(), 4096);
    }
}
