//! # Instance
//!
//! State, queues and completions of one session.
//!
//! The scheduler drives an instance in three steps:
//!
//! 1. [`Instance::next_action`] tells whether the instance has work and what
//!    the next hardware job is (pure; used for readiness checks).
//! 2. [`Instance::begin`] records that the job was handed to the hardware.
//! 3. One `on_*` handler consumes the job's completion and returns a
//!    [`Step`] telling the interrupt handler whether the hardware job is
//!    over.
//!
//! Every buffer a client queues is returned through [`Instance::poll`]
//! exactly once.

use alloc::vec::Vec;
use core::mem;

use arrayvec::ArrayVec;
use mfc_hal::{
    CodecKind, Error, FrameStatus, Geometry, HwErrorCode, HwInstanceId, OpenParams, PhysAddr,
    Result, Role, StreamInfo,
};

use crate::buffer::{Buffer, Completion, FrameFlags, QueueKind};
use crate::dpb::{Dpb, MAX_DPB_SLOTS};
use crate::queue::{DestQueue, SourceQueue};
use crate::state::State;

// =============================================================================
// ACTIONS
// =============================================================================

/// One unit of hardware work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Create the firmware instance
    Open,
    /// Parse the stream header at `src`
    ParseHeader {
        /// Header data
        src: PhysAddr,
        /// Bytes available
        len: usize,
    },
    /// Write the encoder stream header into `dst`
    EncodeHeader {
        /// Destination buffer
        dst: PhysAddr,
        /// Destination capacity
        len: usize,
    },
    /// Register the DPB (decoders) or internal references (encoders)
    InitBuffers {
        /// DPB addresses in slot order (empty for encoders)
        dpb: ArrayVec<PhysAddr, MAX_DPB_SLOTS>,
    },
    /// Decode one unit; `len == 0` is an end-of-stream drain
    Decode {
        /// Unconsumed source data
        src: PhysAddr,
        /// Bytes available
        len: usize,
        /// Slot table, null for slots the core must not write
        dst: ArrayVec<PhysAddr, MAX_DPB_SLOTS>,
    },
    /// Encode one picture (or its next slice)
    Encode {
        /// Source picture
        src: PhysAddr,
        /// Destination bitstream buffer
        dst: PhysAddr,
        /// Destination capacity
        len: usize,
    },
    /// Drop the DPB
    FlushDpb,
    /// Abort the in-progress frame
    Abort,
    /// Release the firmware instance
    Close,
}

/// Discriminant of an [`Action`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// [`Action::Open`]
    Open,
    /// [`Action::ParseHeader`]
    ParseHeader,
    /// [`Action::EncodeHeader`]
    EncodeHeader,
    /// [`Action::InitBuffers`]
    InitBuffers,
    /// [`Action::Decode`]
    Decode,
    /// [`Action::Encode`]
    Encode,
    /// [`Action::FlushDpb`]
    FlushDpb,
    /// [`Action::Abort`]
    Abort,
    /// [`Action::Close`]
    Close,
}

impl Action {
    /// Kind of this action
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Open => ActionKind::Open,
            Action::ParseHeader { .. } => ActionKind::ParseHeader,
            Action::EncodeHeader { .. } => ActionKind::EncodeHeader,
            Action::InitBuffers { .. } => ActionKind::InitBuffers,
            Action::Decode { .. } => ActionKind::Decode,
            Action::Encode { .. } => ActionKind::Encode,
            Action::FlushDpb => ActionKind::FlushDpb,
            Action::Abort => ActionKind::Abort,
            Action::Close => ActionKind::Close,
        }
    }
}

/// What happens to the hardware job after a completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Job over; release the hardware
    Finished,
    /// Job over; run this instance next (encoder slice preemption)
    Preempt,
    /// Same job continues with this action; keep the hardware
    Continue(Action),
}

/// Result of a close request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStep {
    /// Nothing resident; the instance can be destroyed now
    Released,
    /// Teardown goes through the hardware; wait for `Free` or `Error`
    Pending,
}

/// Per-instance counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceStats {
    /// Hardware jobs started
    pub jobs: u64,
    /// Pictures written by the decoder
    pub frames_decoded: u64,
    /// Pictures handed out for display
    pub frames_displayed: u64,
    /// Frames encoded
    pub frames_encoded: u64,
    /// Encoder slices
    pub slices: u64,
    /// Same-job continuations of packed sources
    pub resubmits: u64,
    /// In-stream resolution changes
    pub resolution_changes: u64,
    /// DPB flushes completed
    pub flushes: u64,
    /// Transitions into `Error`
    pub errors: u64,
    /// Buffers returned to the client
    pub buffers_returned: u64,
}

// =============================================================================
// INSTANCE
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct EncodeJob {
    src: Buffer,
    dst: Buffer,
    slices: u32,
}

/// One open session
#[derive(Debug)]
pub struct Instance {
    params: OpenParams,
    state: State,
    hw_id: Option<HwInstanceId>,
    stream: StreamInfo,
    src: SourceQueue,
    dst: DestQueue,
    dpb: Dpb,
    header_dst: Option<Buffer>,
    encoding: Option<EncodeJob>,
    completions: Vec<Completion>,
    last_error: Option<Error>,
    job: Option<ActionKind>,
    header_reparsed: bool,
    flush_requested: bool,
    stats: InstanceStats,
}

impl Instance {
    /// Validate open parameters and create an instance in `Init`
    pub fn new(params: OpenParams) -> Result<Self> {
        if params.role == Role::Encoder {
            if !params.codec.can_encode() {
                return Err(Error::UnsupportedCodec);
            }
            if !params.geometry.is_valid() || params.encode.slices_per_frame == 0 {
                return Err(Error::InvalidParameter);
            }
        }
        if params.dynamic_dpb
            && (params.role == Role::Encoder || !params.codec.supports_dynamic_dpb())
        {
            return Err(Error::InvalidParameter);
        }

        let stream = match params.role {
            Role::Decoder => StreamInfo::default(),
            Role::Encoder => StreamInfo {
                geometry: params.geometry,
                dpb_count: 0,
            },
        };

        Ok(Self {
            params,
            state: State::Init,
            hw_id: None,
            stream,
            src: SourceQueue::new(),
            dst: DestQueue::new(),
            dpb: Dpb::new(params.dynamic_dpb),
            header_dst: None,
            encoding: None,
            completions: Vec::new(),
            last_error: None,
            job: None,
            header_reparsed: false,
            flush_requested: false,
            stats: InstanceStats::default(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current state
    pub fn state(&self) -> State {
        self.state
    }

    /// Decoder or encoder
    pub fn role(&self) -> Role {
        self.params.role
    }

    /// Stream format
    pub fn codec(&self) -> CodecKind {
        self.params.codec
    }

    /// Open parameters
    pub fn params(&self) -> &OpenParams {
        &self.params
    }

    /// Protected-memory session?
    pub fn is_secure(&self) -> bool {
        self.params.secure
    }

    /// Firmware instance id once opened
    pub fn hw_id(&self) -> Option<HwInstanceId> {
        self.hw_id
    }

    /// Record the id returned by the open command
    pub fn set_hw_id(&mut self, id: HwInstanceId) {
        self.hw_id = Some(id);
    }

    /// Negotiated picture size
    pub fn geometry(&self) -> Geometry {
        self.stream.geometry
    }

    /// DPB size requested by the stream
    pub fn dpb_count(&self) -> u32 {
        self.stream.dpb_count
    }

    /// Error that moved the instance to `Error`
    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    /// Kind of the job the hardware is running for this instance
    pub fn job(&self) -> Option<ActionKind> {
        self.job
    }

    /// Source buffers owned by the driver
    pub fn sources_queued(&self) -> usize {
        self.src.len() + usize::from(self.encoding.is_some())
    }

    /// Destination buffers owned by the driver
    pub fn dests_queued(&self) -> usize {
        self.dst.len()
            + self.dpb.driver_owned()
            + usize::from(self.encoding.is_some())
            + usize::from(self.header_dst.is_some())
    }

    /// Destination buffers parked until their reference drops
    pub fn references_held(&self) -> usize {
        self.dpb.held()
    }

    /// Completions not yet polled
    pub fn completions_pending(&self) -> usize {
        self.completions.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> InstanceStats {
        self.stats
    }

    fn set_state(&mut self, next: State) {
        if self.state != next {
            log::debug!(
                "instance {:?}: {} -> {}",
                self.hw_id.map(|id| id.0),
                self.state,
                next
            );
            self.state = next;
        }
    }

    fn frame_bytes(&self) -> usize {
        self.stream.geometry.frame_size()
    }

    // =========================================================================
    // Buffer return
    // =========================================================================

    fn push(&mut self, completion: Completion) {
        self.stats.buffers_returned += 1;
        self.completions.push(completion);
    }

    fn fail_buffer(&mut self, buffer: Buffer, queue: QueueKind) {
        self.push(Completion::error(buffer, queue));
    }

    fn fail_sources(&mut self) {
        for buffer in self.src.take_all() {
            self.fail_buffer(buffer, QueueKind::Source);
        }
    }

    /// Hand back the DPB: decoded pictures `Done`, the rest `Error`
    fn return_dpb(&mut self) {
        let frame_bytes = self.frame_bytes();
        for slot in self.dpb.drain() {
            if slot.decoded {
                let buffer = slot.buffer.with_payload(frame_bytes);
                self.push(Completion::done(
                    buffer,
                    QueueKind::Destination,
                    FrameFlags::DISPLAYED,
                ));
            } else {
                self.fail_buffer(slot.buffer, QueueKind::Destination);
            }
        }
    }

    /// Fail every buffer the driver still owns
    fn return_all(&mut self) {
        self.fail_sources();
        for buffer in self.dst.take_all() {
            self.fail_buffer(buffer, QueueKind::Destination);
        }
        for slot in self.dpb.drain() {
            self.fail_buffer(slot.buffer, QueueKind::Destination);
        }
        if let Some(job) = self.encoding.take() {
            self.fail_buffer(job.src, QueueKind::Source);
            self.fail_buffer(job.dst, QueueKind::Destination);
        }
        if let Some(buffer) = self.header_dst.take() {
            self.fail_buffer(buffer, QueueKind::Destination);
        }
    }

    /// Move to `Error`, returning every buffer
    pub fn fail(&mut self, err: Error) {
        log::debug!("instance {:?}: failed in {}: {}", self.hw_id.map(|id| id.0), self.state, err);
        self.return_all();
        self.job = None;
        self.flush_requested = false;
        self.header_reparsed = false;
        self.last_error = Some(err);
        self.stats.errors += 1;
        self.set_state(State::Error);
    }

    /// Take everything returned since the last poll
    pub fn poll(&mut self) -> Vec<Completion> {
        mem::take(&mut self.completions)
    }

    // =========================================================================
    // Client requests
    // =========================================================================

    /// Queue a source buffer
    pub fn enqueue_source(&mut self, buffer: Buffer, max_depth: usize) -> Result<()> {
        if !self.state.accepts_buffers() {
            return Err(Error::InvalidState);
        }
        let valid = match self.params.role {
            Role::Decoder => buffer.bytes_used > 0 && buffer.bytes_used <= buffer.len,
            Role::Encoder => buffer.len > 0,
        };
        if !valid || buffer.addr.is_null() {
            return Err(Error::InvalidBuffer);
        }
        if self.src.len() >= max_depth {
            return Err(Error::QueueFull);
        }
        let in_encoder = self.encoding.is_some_and(|job| job.src.addr == buffer.addr);
        if self.src.contains(buffer.addr) || in_encoder {
            return Err(Error::InvalidBuffer);
        }
        self.src.push(buffer);
        Ok(())
    }

    /// Queue a destination buffer
    pub fn enqueue_dest(&mut self, buffer: Buffer) -> Result<()> {
        let open = self.state.accepts_buffers() || self.state == State::Finishing;
        if !open {
            return Err(Error::InvalidState);
        }
        if buffer.len == 0 || buffer.addr.is_null() {
            return Err(Error::InvalidBuffer);
        }

        let bound = matches!(self.state, State::Running | State::Finishing);
        if self.params.role == Role::Decoder && bound && self.dpb.is_initialized() {
            return self.dpb.enqueue(buffer);
        }

        let in_flight = self.encoding.is_some_and(|job| job.dst.addr == buffer.addr)
            || self.header_dst.is_some_and(|b| b.addr == buffer.addr);
        if self.dst.contains(buffer.addr) || in_flight {
            return Err(Error::InvalidBuffer);
        }
        if self.params.role == Role::Decoder && self.dst.len() >= MAX_DPB_SLOTS {
            return Err(Error::QueueFull);
        }
        self.dst.push(buffer);
        Ok(())
    }

    /// Seek: drop queued sources and the DPB, then wait for a new DPB
    pub fn request_flush(&mut self) -> Result<()> {
        if self.params.role != Role::Decoder || self.state != State::Running {
            return Err(Error::InvalidState);
        }
        if self.job.is_some() {
            self.flush_requested = true;
        } else {
            self.enter_flush();
        }
        Ok(())
    }

    fn enter_flush(&mut self) {
        self.flush_requested = false;
        self.fail_sources();
        self.set_state(State::DpbFlushing);
    }

    /// Start tearing the instance down
    pub fn begin_close(&mut self) -> CloseStep {
        if self.state == State::Free {
            return CloseStep::Released;
        }

        if self.job.is_some() {
            // The in-flight job must finish before anything is released
            if !self.state.is_closing() {
                self.set_state(State::Abort);
            }
            return CloseStep::Pending;
        }

        match self.state {
            State::Error if self.hw_id.is_none() => CloseStep::Released,
            State::Init => {
                self.return_all();
                self.set_state(State::Free);
                CloseStep::Released
            },
            State::Running if self.params.role == Role::Decoder => {
                self.fail_sources();
                self.set_state(State::Finishing);
                CloseStep::Pending
            },
            State::Running if self.encoding.is_some() => {
                self.set_state(State::AbortInstance);
                CloseStep::Pending
            },
            s if s.is_closing() => CloseStep::Pending,
            _ => {
                self.return_all();
                self.set_state(State::ReturnInstance);
                CloseStep::Pending
            },
        }
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    fn decode_action(&self) -> Option<Action> {
        let entry = self.src.front()?;
        if entry.submitted || !self.dpb.has_writable() {
            return None;
        }
        Some(Action::Decode {
            src: entry.data_addr(),
            len: entry.remaining(),
            dst: self.dpb.available_table(),
        })
    }

    fn parse_action(&self) -> Option<Action> {
        let entry = self.src.front()?;
        if entry.submitted {
            return None;
        }
        Some(Action::ParseHeader {
            src: entry.data_addr(),
            len: entry.remaining(),
        })
    }

    fn dpb_action(&self) -> Option<Action> {
        if self.dst.len() < self.stream.dpb_count as usize {
            return None;
        }
        Some(Action::InitBuffers {
            dpb: self.dst.iter().take(MAX_DPB_SLOTS).map(|b| b.addr).collect(),
        })
    }

    /// Next hardware job, if the instance is ready for one
    pub fn next_action(&self) -> Option<Action> {
        if self.job.is_some() {
            return None;
        }
        let decoder = self.params.role == Role::Decoder;

        match self.state {
            State::Init => Some(Action::Open),
            State::GotInstance if decoder => self.parse_action(),
            State::GotInstance => self.dst.front().map(|b| Action::EncodeHeader {
                dst: b.addr,
                len: b.len,
            }),
            State::HeaderParsed if decoder => self.dpb_action(),
            State::HeaderParsed => Some(Action::InitBuffers {
                dpb: ArrayVec::new(),
            }),
            State::Running if decoder => self.decode_action(),
            State::Running => match (&self.encoding, self.src.front(), self.dst.front()) {
                (Some(job), _, _) => Some(Action::Encode {
                    src: job.src.addr,
                    dst: job.dst.addr,
                    len: job.dst.len,
                }),
                (None, Some(src), Some(dst)) => Some(Action::Encode {
                    src: src.buffer.addr,
                    dst: dst.addr,
                    len: dst.len,
                }),
                _ => None,
            },
            State::ResChangeInit | State::DpbFlushing => Some(Action::FlushDpb),
            State::ResChangeEnd if !self.header_reparsed => self.parse_action(),
            State::ResChangeEnd => self.dpb_action(),
            State::Finishing => Some(Action::Decode {
                src: PhysAddr::null(),
                len: 0,
                dst: self.dpb.available_table(),
            }),
            State::AbortInstance => Some(Action::Abort),
            State::ReturnInstance => Some(Action::Close),
            State::ResChangeFlush | State::Abort | State::Free | State::Error => None,
        }
    }

    /// Has work for the hardware?
    pub fn is_ready(&self) -> bool {
        self.next_action().is_some()
    }

    fn mark_source_submitted(&mut self) {
        if let Some(entry) = self.src.front_mut() {
            entry.submitted = true;
        }
    }

    /// Record that `action` was handed to the hardware
    pub fn begin(&mut self, action: &Action) {
        match action {
            Action::ParseHeader { .. } => self.mark_source_submitted(),
            Action::Decode { len, .. } if *len > 0 => self.mark_source_submitted(),
            Action::EncodeHeader { .. } => self.header_dst = self.dst.pop(),
            Action::InitBuffers { dpb } if self.params.role == Role::Decoder => {
                let buffers: Vec<Buffer> = (0..dpb.len()).filter_map(|_| self.dst.pop()).collect();
                for rejected in self.dpb.init(buffers) {
                    self.fail_buffer(rejected, QueueKind::Destination);
                }
            },
            Action::Encode { .. } if self.encoding.is_none() => {
                if !self.src.is_empty() && !self.dst.is_empty() {
                    self.encoding = self.src.pop().zip(self.dst.pop()).map(|(src, dst)| EncodeJob {
                        src: src.buffer,
                        dst,
                        slices: 0,
                    });
                }
            },
            Action::FlushDpb if self.state == State::ResChangeInit => {
                self.set_state(State::ResChangeFlush);
            },
            _ => {}
        }
        self.job = Some(action.kind());
        self.stats.jobs += 1;
    }

    // =========================================================================
    // Completions
    // =========================================================================

    fn end_job(&mut self) {
        self.job = None;
    }

    /// `OpenInstanceDone`
    pub fn on_open_done(&mut self) {
        self.end_job();
        self.set_state(State::GotInstance);
    }

    /// Decoder `SeqDone`: the header at the front source was parsed
    pub fn on_header_parsed(&mut self, info: StreamInfo, consumed: usize) {
        self.end_job();

        if let Some(entry) = self.src.front_mut() {
            entry.submitted = false;
            let remaining = entry.remaining();
            if consumed == 0 || consumed >= remaining {
                if let Some(done) = self.src.pop() {
                    self.push(Completion::done(done.buffer, QueueKind::Source, FrameFlags::empty()));
                }
            } else {
                entry.offset += consumed;
            }
        }

        let dpb_ok = info.dpb_count > 0 && info.dpb_count as usize <= MAX_DPB_SLOTS;
        if !info.geometry.is_valid() || !dpb_ok {
            log::warn!(
                "instance {:?}: bad stream geometry {} dpb {}",
                self.hw_id.map(|id| id.0),
                info.geometry,
                info.dpb_count
            );
            self.fail(Error::GeometryError);
            return;
        }

        log::info!(
            "instance {:?}: {} stream {} dpb {}",
            self.hw_id.map(|id| id.0),
            self.params.codec.name(),
            info.geometry,
            info.dpb_count
        );
        self.stream = info;
        match self.state {
            State::GotInstance => self.set_state(State::HeaderParsed),
            State::ResChangeEnd => self.header_reparsed = true,
            _ => {}
        }
    }

    /// Encoder `SeqDone`: the stream header was written
    pub fn on_header_encoded(&mut self, size: usize) {
        self.end_job();
        if let Some(buffer) = self.header_dst.take() {
            let buffer = buffer.with_payload(size);
            self.push(Completion::done(buffer, QueueKind::Destination, FrameFlags::HEADER));
        }
        self.set_state(State::HeaderParsed);
    }

    /// `InitBuffersDone`
    pub fn on_buffers_ready(&mut self) {
        self.end_job();
        self.header_reparsed = false;
        self.set_state(State::Running);
    }

    /// Decoder `FrameDone` / `FieldDone`
    pub fn on_frame_decoded(
        &mut self,
        status: FrameStatus,
        consumed: usize,
        mask: u32,
        concealed: bool,
    ) -> Step {
        let running = self.state == State::Running;
        let timestamp = match self.src.front() {
            Some(entry) if running => entry.buffer.timestamp,
            _ => 0,
        };

        if let (true, Some(addr)) = (status.display.decoded(), status.decoded) {
            if let Err(err) = self.dpb.mark_decoded(addr, timestamp) {
                log::warn!("instance {:?}: core wrote unknown picture {}", self.hw_id.map(|id| id.0), addr);
                self.fail(err);
                return Step::Finished;
            }
            self.stats.frames_decoded += 1;
        }

        let reclaimed = self.dpb.update_references(mask);
        if reclaimed > 0 {
            log::trace!("instance {:?}: {} references reclaimed", self.hw_id.map(|id| id.0), reclaimed);
        }

        if let (true, Some(addr)) = (status.display.displayed(), status.displayed) {
            match self.dpb.take_displayed(addr) {
                Ok(buffer) => {
                    let mut flags = FrameFlags::DISPLAYED;
                    if self.dpb.is_referenced(addr) {
                        flags |= FrameFlags::REFERENCE;
                    }
                    if concealed {
                        flags |= FrameFlags::CONCEALED;
                    }
                    let buffer = buffer.with_payload(self.frame_bytes());
                    self.push(Completion::done(buffer, QueueKind::Destination, flags));
                    self.stats.frames_displayed += 1;
                },
                Err(err) => {
                    self.fail(err);
                    return Step::Finished;
                },
            }
        }

        if running {
            if let Some(action) = self.advance_source(consumed) {
                self.stats.resubmits += 1;
                return Step::Continue(action);
            }
        }

        self.end_job();
        if self.flush_requested {
            self.enter_flush();
        }
        Step::Finished
    }

    /// Retire or advance the front source after a decode
    ///
    /// Returns the continuation when a packed source still holds data and a
    /// slot is free for it.
    fn advance_source(&mut self, consumed: usize) -> Option<Action> {
        let packed = self.params.codec.supports_packed_frames();
        let entry = self.src.front_mut()?;
        entry.submitted = false;
        let remaining = entry.remaining();

        if packed && consumed > 0 && consumed < remaining {
            entry.offset += consumed;
            if self.flush_requested {
                return None;
            }
            let action = self.decode_action()?;
            self.mark_source_submitted();
            return Some(action);
        }

        if let Some(done) = self.src.pop() {
            self.push(Completion::done(done.buffer, QueueKind::Source, FrameFlags::empty()));
        }
        None
    }

    /// Encoder `FrameDone`
    pub fn on_frame_encoded(&mut self, size: usize) -> Step {
        self.end_job();
        if let Some(job) = self.encoding.take() {
            let mut dst = job.dst.with_payload(size);
            dst.timestamp = job.src.timestamp;
            self.push(Completion::done(job.src, QueueKind::Source, FrameFlags::empty()));
            self.push(Completion::done(dst, QueueKind::Destination, FrameFlags::empty()));
            self.stats.frames_encoded += 1;
        }
        Step::Finished
    }

    /// Encoder `SliceDone`: the frame stays submitted
    pub fn on_slice_encoded(&mut self) -> Step {
        self.end_job();
        if let Some(job) = self.encoding.as_mut() {
            job.slices += 1;
        }
        self.stats.slices += 1;
        Step::Preempt
    }

    /// `CompleteSeq` during a close drain
    pub fn on_drained(&mut self) {
        self.end_job();
        self.return_dpb();
        self.return_all();
        self.set_state(State::ReturnInstance);
    }

    /// `DpbFlushDone`
    pub fn on_dpb_flushed(&mut self) {
        self.end_job();
        self.return_dpb();
        self.stats.flushes += 1;
        match self.state {
            State::ResChangeFlush => {
                self.header_reparsed = false;
                self.set_state(State::ResChangeEnd);
            },
            State::DpbFlushing => self.set_state(State::HeaderParsed),
            _ => {}
        }
    }

    /// Completion of the job interrupted by a close, or `AbortDone`
    pub fn on_aborted(&mut self) {
        self.end_job();
        self.return_all();
        self.set_state(State::ReturnInstance);
    }

    /// `CloseInstanceDone`
    pub fn on_closed(&mut self) {
        self.end_job();
        self.return_all();
        self.hw_id = None;
        self.set_state(State::Free);
    }

    /// `ResolutionChanged`: the source stays queued for re-parsing
    ///
    /// A seek requested during the job still drops every queued source; the
    /// header is then parsed from the first source queued after it.
    pub fn on_resolution_change(&mut self) {
        self.end_job();
        if self.flush_requested {
            self.flush_requested = false;
            self.fail_sources();
        } else if let Some(entry) = self.src.front_mut() {
            entry.submitted = false;
        }
        self.stats.resolution_changes += 1;
        self.set_state(State::ResChangeInit);
    }

    /// Fatal error code from the core
    pub fn on_hw_error(&mut self, code: HwErrorCode) {
        self.end_job();
        match self.state {
            State::Abort | State::AbortInstance => self.on_aborted(),
            State::ReturnInstance => {
                self.hw_id = None;
                self.fail(Error::HardwareError(code));
            },
            _ => self.fail(Error::HardwareError(code)),
        }
    }

    /// Completion that makes no sense in the current state
    pub fn on_unexpected(&mut self) {
        self.fail(Error::ProtocolError);
    }

    /// Device-wide recovery: the core was reset under this instance
    pub fn on_device_fault(&mut self) {
        self.hw_id = None;
        if self.state != State::Free {
            self.fail(Error::HardwareFault);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferStatus;
    use mfc_hal::DisplayStatus;

    const DEPTH: usize = 32;

    fn src(i: u64) -> Buffer {
        Buffer::new(i, PhysAddr::new(0x1000_0000 + i * 0x10_0000), 0x10_0000)
            .with_payload(1000)
            .with_timestamp(i * 33)
    }

    fn dst(i: u64) -> Buffer {
        Buffer::new(100 + i, PhysAddr::new(0x8000_0000 + i * 0x40_0000), 0x40_0000)
    }

    fn info(w: u32, h: u32, dpb: u32) -> StreamInfo {
        StreamInfo {
            geometry: Geometry::new(w, h),
            dpb_count: dpb,
        }
    }

    fn shown(addr: PhysAddr) -> FrameStatus {
        FrameStatus {
            display: DisplayStatus::DecodeAndDisplay,
            decoded: Some(addr),
            displayed: Some(addr),
        }
    }

    fn run(inst: &mut Instance) -> Action {
        let action = inst.next_action().expect("instance should be ready");
        inst.begin(&action);
        action
    }

    fn opened(params: OpenParams) -> Instance {
        let mut inst = Instance::new(params).unwrap();
        assert_eq!(run(&mut inst), Action::Open);
        inst.set_hw_id(HwInstanceId(1));
        inst.on_open_done();
        assert_eq!(inst.state(), State::GotInstance);
        inst
    }

    fn running_decoder(codec: CodecKind, dpb: u32) -> Instance {
        let mut inst = opened(OpenParams::decoder(codec));
        inst.enqueue_source(src(0), DEPTH).unwrap();
        assert!(matches!(run(&mut inst), Action::ParseHeader { .. }));
        inst.on_header_parsed(info(1920, 1080, dpb), 0);
        assert_eq!(inst.state(), State::HeaderParsed);

        for i in 0..dpb as u64 {
            assert!(!inst.is_ready());
            inst.enqueue_dest(dst(i)).unwrap();
        }
        match run(&mut inst) {
            Action::InitBuffers { dpb: addrs } => assert_eq!(addrs.len(), dpb as usize),
            other => panic!("unexpected {:?}", other),
        }
        inst.on_buffers_ready();
        assert_eq!(inst.state(), State::Running);
        inst.poll();
        inst
    }

    fn conserved(completions: &[Completion], queued: usize) {
        assert_eq!(completions.len(), queued);
        for (i, a) in completions.iter().enumerate() {
            for b in &completions[i + 1..] {
                assert!(
                    a.buffer.cookie != b.buffer.cookie || a.queue != b.queue,
                    "buffer {} returned twice",
                    a.buffer.cookie
                );
            }
        }
    }

    #[test]
    fn test_open_validation() {
        let vc1 = OpenParams::encoder(CodecKind::Vc1, Geometry::new(640, 480));
        assert_eq!(Instance::new(vc1).err(), Some(Error::UnsupportedCodec));

        let no_size = OpenParams::encoder(CodecKind::H264, Geometry::new(0, 0));
        assert_eq!(Instance::new(no_size).err(), Some(Error::InvalidParameter));

        let dyn_mpeg2 = OpenParams::decoder(CodecKind::Mpeg2).with_dynamic_dpb(true);
        assert_eq!(Instance::new(dyn_mpeg2).err(), Some(Error::InvalidParameter));
    }

    #[test]
    fn test_decoder_setup_returns_header_source() {
        let mut inst = opened(OpenParams::decoder(CodecKind::H264));
        assert!(!inst.is_ready());
        inst.enqueue_source(src(0), DEPTH).unwrap();
        run(&mut inst);
        inst.on_header_parsed(info(1920, 1080, 4), 0);

        assert_eq!(inst.geometry(), Geometry::new(1920, 1080));
        assert_eq!(inst.dpb_count(), 4);
        let done = inst.poll();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].queue, QueueKind::Source);
        assert!(done[0].is_done());

        // Three buffers are not enough for a DPB of four
        for i in 0..3 {
            inst.enqueue_dest(dst(i)).unwrap();
        }
        assert!(!inst.is_ready());
        inst.enqueue_dest(dst(3)).unwrap();
        assert!(matches!(inst.next_action(), Some(Action::InitBuffers { .. })));
    }

    #[test]
    fn test_zero_geometry_is_error() {
        let mut inst = opened(OpenParams::decoder(CodecKind::H264));
        inst.enqueue_source(src(0), DEPTH).unwrap();
        inst.enqueue_source(src(1), DEPTH).unwrap();
        run(&mut inst);
        inst.on_header_parsed(info(0, 1080, 4), 0);

        assert_eq!(inst.state(), State::Error);
        assert_eq!(inst.last_error(), Some(Error::GeometryError));
        assert!(!inst.is_ready());
        let done = inst.poll();
        assert_eq!(done.len(), 2);
        assert_eq!(done[1].status, BufferStatus::Error);
        assert_eq!(inst.enqueue_source(src(2), DEPTH), Err(Error::InvalidState));
    }

    #[test]
    fn test_decode_one_frame() {
        let mut inst = running_decoder(CodecKind::H264, 4);
        assert!(!inst.is_ready());
        inst.enqueue_source(src(1), DEPTH).unwrap();

        let target = match run(&mut inst) {
            Action::Decode { src: s, len, dst: table } => {
                assert_eq!(s, src(1).addr);
                assert_eq!(len, 1000);
                assert_eq!(table.len(), 4);
                table[0]
            },
            other => panic!("unexpected {:?}", other),
        };
        assert!(!inst.is_ready());

        let step = inst.on_frame_decoded(shown(target), 0, 0b1, false);
        assert_eq!(step, Step::Finished);

        let done = inst.poll();
        assert_eq!(done.len(), 2);
        let picture = done.iter().find(|c| c.queue == QueueKind::Destination).unwrap();
        assert_eq!(picture.buffer.addr, target);
        assert_eq!(picture.buffer.timestamp, 33);
        assert_eq!(picture.buffer.bytes_used, Geometry::new(1920, 1080).frame_size());
        assert!(picture.flags.contains(FrameFlags::DISPLAYED | FrameFlags::REFERENCE));
        assert_eq!(inst.stats().frames_decoded, 1);
    }

    #[test]
    fn test_warning_marks_concealed() {
        let mut inst = running_decoder(CodecKind::H264, 2);
        inst.enqueue_source(src(1), DEPTH).unwrap();
        run(&mut inst);
        inst.on_frame_decoded(shown(dst(0).addr), 0, 0, true);
        let done = inst.poll();
        let picture = done.iter().find(|c| c.queue == QueueKind::Destination).unwrap();
        assert!(picture.flags.contains(FrameFlags::CONCEALED));
        assert!(!picture.flags.contains(FrameFlags::REFERENCE));
    }

    #[test]
    fn test_reference_hold_and_reclaim() {
        let mut inst = running_decoder(CodecKind::H264, 2);
        inst.enqueue_source(src(1), DEPTH).unwrap();
        inst.enqueue_source(src(2), DEPTH).unwrap();

        run(&mut inst);
        inst.on_frame_decoded(shown(dst(0).addr), 0, 0b01, false);
        inst.poll();

        // Client gives the picture back while it is still a reference
        inst.enqueue_dest(dst(0)).unwrap();
        assert_eq!(inst.references_held(), 1);
        match run(&mut inst) {
            Action::Decode { dst: table, .. } => {
                assert!(table[0].is_null());
                assert_eq!(table[1], dst(1).addr);
            },
            other => panic!("unexpected {:?}", other),
        }

        // Second picture replaces the first as the only reference
        inst.on_frame_decoded(shown(dst(1).addr), 0, 0b10, false);
        assert_eq!(inst.references_held(), 0);
        inst.enqueue_source(src(3), DEPTH).unwrap();
        match inst.next_action() {
            Some(Action::Decode { dst: table, .. }) => assert_eq!(table[0], dst(0).addr),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_static_dpb_rejects_foreign_buffer() {
        let mut inst = running_decoder(CodecKind::H264, 2);
        assert_eq!(inst.enqueue_dest(dst(9)), Err(Error::InvalidBuffer));
        // Still owned by the driver
        assert_eq!(inst.enqueue_dest(dst(0)), Err(Error::InvalidBuffer));
    }

    #[test]
    fn test_dynamic_dpb_accepts_new_buffer() {
        let params = OpenParams::decoder(CodecKind::H264).with_dynamic_dpb(true);
        let mut inst = opened(params);
        inst.enqueue_source(src(0), DEPTH).unwrap();
        run(&mut inst);
        inst.on_header_parsed(info(640, 480, 1), 0);
        inst.enqueue_dest(dst(0)).unwrap();
        run(&mut inst);
        inst.on_buffers_ready();

        inst.enqueue_dest(dst(9)).unwrap();
        assert_eq!(inst.dests_queued(), 2);
    }

    #[test]
    fn test_packed_source_continues_same_job() {
        let mut inst = running_decoder(CodecKind::Mpeg4, 2);
        inst.enqueue_source(src(1).with_payload(200), DEPTH).unwrap();
        run(&mut inst);

        let step = inst.on_frame_decoded(shown(dst(0).addr), 120, 0, false);
        match step {
            Step::Continue(Action::Decode { src: s, len, .. }) => {
                assert_eq!(s, src(1).addr.offset(120));
                assert_eq!(len, 80);
            },
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(inst.job(), Some(ActionKind::Decode));
        // Source not returned yet
        assert_eq!(inst.poll().len(), 1);

        let step = inst.on_frame_decoded(shown(dst(1).addr), 80, 0, false);
        assert_eq!(step, Step::Finished);
        let done = inst.poll();
        assert!(done.iter().any(|c| c.queue == QueueKind::Source && c.is_done()));
        assert_eq!(inst.stats().resubmits, 1);
    }

    #[test]
    fn test_non_packed_source_always_retired() {
        let mut inst = running_decoder(CodecKind::H264, 2);
        inst.enqueue_source(src(1), DEPTH).unwrap();
        run(&mut inst);
        let step = inst.on_frame_decoded(shown(dst(0).addr), 10, 0, false);
        assert_eq!(step, Step::Finished);
        assert_eq!(inst.sources_queued(), 0);
    }

    #[test]
    fn test_resolution_change_cycle() {
        let mut inst = running_decoder(CodecKind::H264, 2);
        inst.enqueue_source(src(1), DEPTH).unwrap();
        run(&mut inst);
        inst.on_frame_decoded(shown(dst(0).addr), 0, 0, false);
        inst.enqueue_source(src(2), DEPTH).unwrap();
        run(&mut inst);
        inst.on_resolution_change();
        assert_eq!(inst.state(), State::ResChangeInit);

        assert_eq!(run(&mut inst), Action::FlushDpb);
        assert_eq!(inst.state(), State::ResChangeFlush);
        assert!(!inst.is_ready());

        inst.on_dpb_flushed();
        assert_eq!(inst.state(), State::ResChangeEnd);
        // dst(1) was never written; dst(0) is with the client
        let returned = inst.poll();
        let flushed: Vec<_> = returned
            .iter()
            .filter(|c| c.queue == QueueKind::Destination)
            .collect();
        assert_eq!(flushed.len(), 2);
        assert_eq!(inst.dests_queued(), 0);

        match run(&mut inst) {
            Action::ParseHeader { src: s, .. } => assert_eq!(s, src(2).addr),
            other => panic!("unexpected {:?}", other),
        }
        inst.on_header_parsed(info(1280, 720, 3), 0);
        assert_eq!(inst.state(), State::ResChangeEnd);
        assert!(!inst.is_ready());

        for i in 10..13 {
            inst.enqueue_dest(dst(i)).unwrap();
        }
        run(&mut inst);
        inst.on_buffers_ready();
        assert_eq!(inst.state(), State::Running);
        assert_eq!(inst.geometry(), Geometry::new(1280, 720));
        assert_eq!(inst.stats().resolution_changes, 1);
    }

    #[test]
    fn test_close_drains_decoder() {
        let mut inst = running_decoder(CodecKind::H264, 2);
        inst.enqueue_source(src(1), DEPTH).unwrap();
        run(&mut inst);
        // Decoded but held back for display
        let held = FrameStatus {
            display: DisplayStatus::DecodeOnly,
            decoded: Some(dst(0).addr),
            displayed: None,
        };
        inst.on_frame_decoded(held, 0, 0b01, false);
        inst.enqueue_source(src(2), DEPTH).unwrap();

        assert_eq!(inst.begin_close(), CloseStep::Pending);
        assert_eq!(inst.state(), State::Finishing);

        match run(&mut inst) {
            Action::Decode { len, .. } => assert_eq!(len, 0),
            other => panic!("unexpected {:?}", other),
        }
        let drain = FrameStatus {
            display: DisplayStatus::DisplayOnly,
            decoded: None,
            displayed: Some(dst(0).addr),
        };
        inst.on_frame_decoded(drain, 0, 0, false);
        assert_eq!(inst.state(), State::Finishing);

        run(&mut inst);
        inst.on_drained();
        assert_eq!(inst.state(), State::ReturnInstance);
        assert_eq!(run(&mut inst), Action::Close);
        inst.on_closed();
        assert_eq!(inst.state(), State::Free);
        assert_eq!(inst.hw_id(), None);

        // src 1, src 2, dst 0, dst 1
        let done = inst.poll();
        conserved(&done, 4);
        let displayed = done.iter().find(|c| c.buffer.cookie == 100).unwrap();
        assert!(displayed.is_done());
        let unused = done.iter().find(|c| c.buffer.cookie == 101).unwrap();
        assert_eq!(unused.status, BufferStatus::Error);
        let dropped = done.iter().find(|c| c.buffer.cookie == 2).unwrap();
        assert_eq!(dropped.status, BufferStatus::Error);
    }

    #[test]
    fn test_close_with_job_in_flight_aborts() {
        let mut inst = running_decoder(CodecKind::H264, 2);
        inst.enqueue_source(src(1), DEPTH).unwrap();
        run(&mut inst);

        assert_eq!(inst.begin_close(), CloseStep::Pending);
        assert_eq!(inst.state(), State::Abort);
        assert!(!inst.is_ready());

        inst.on_aborted();
        assert_eq!(inst.state(), State::ReturnInstance);
        let done = inst.poll();
        conserved(&done, 3);
        assert!(done.iter().all(|c| c.status == BufferStatus::Error));
    }

    #[test]
    fn test_close_before_open_is_immediate() {
        let mut inst = Instance::new(OpenParams::decoder(CodecKind::H264)).unwrap();
        assert_eq!(inst.begin_close(), CloseStep::Released);
        assert_eq!(inst.state(), State::Free);
    }

    #[test]
    fn test_error_close_paths() {
        let mut inst = running_decoder(CodecKind::H264, 2);
        inst.fail(Error::HardwareError(HwErrorCode::new(3)));
        // Firmware instance still resident: release it
        assert_eq!(inst.begin_close(), CloseStep::Pending);
        assert_eq!(inst.next_action(), Some(Action::Close));

        let mut inst = running_decoder(CodecKind::H264, 2);
        inst.on_device_fault();
        assert_eq!(inst.last_error(), Some(Error::HardwareFault));
        assert_eq!(inst.begin_close(), CloseStep::Released);
    }

    #[test]
    fn test_flush_returns_to_header_parsed() {
        let mut inst = running_decoder(CodecKind::H264, 2);
        inst.enqueue_source(src(1), DEPTH).unwrap();
        inst.enqueue_source(src(2), DEPTH).unwrap();
        run(&mut inst);

        // Deferred until the running job ends
        inst.request_flush().unwrap();
        assert_eq!(inst.state(), State::Running);
        inst.on_frame_decoded(shown(dst(0).addr), 0, 0, false);
        assert_eq!(inst.state(), State::DpbFlushing);

        assert_eq!(run(&mut inst), Action::FlushDpb);
        inst.on_dpb_flushed();
        assert_eq!(inst.state(), State::HeaderParsed);
        assert_eq!(inst.sources_queued(), 0);
        assert_eq!(inst.dests_queued(), 0);
        // src 1 done, src 2 dropped, dst 0 shown, dst 1 flushed
        conserved(&inst.poll(), 4);
    }

    #[test]
    fn test_flush_survives_resolution_change() {
        let mut inst = running_decoder(CodecKind::H264, 2);
        inst.enqueue_source(src(1), DEPTH).unwrap();
        inst.enqueue_source(src(2), DEPTH).unwrap();
        run(&mut inst);

        inst.request_flush().unwrap();
        inst.on_resolution_change();
        assert_eq!(inst.state(), State::ResChangeInit);
        assert_eq!(inst.sources_queued(), 0);

        assert_eq!(run(&mut inst), Action::FlushDpb);
        inst.on_dpb_flushed();
        assert_eq!(inst.state(), State::ResChangeEnd);
        // Nothing from before the seek is left to parse
        assert!(!inst.is_ready());

        inst.enqueue_source(src(3), DEPTH).unwrap();
        match run(&mut inst) {
            Action::ParseHeader { src: s, .. } => assert_eq!(s, src(3).addr),
            other => panic!("unexpected {:?}", other),
        }

        // src 1 and 2 dropped, dst 0 and 1 flushed unwritten
        let returned = inst.poll();
        assert!(returned.iter().all(|c| !c.is_done()));
        conserved(&returned, 4);
    }

    #[test]
    fn test_encoder_header_and_slices() {
        let params = OpenParams::encoder(CodecKind::H264, Geometry::new(640, 480)).with_encode(
            mfc_hal::EncodeParams {
                slices_per_frame: 2,
                ..mfc_hal::EncodeParams::default()
            },
        );
        let mut inst = opened(params);
        assert!(!inst.is_ready());

        inst.enqueue_dest(dst(0)).unwrap();
        assert!(matches!(run(&mut inst), Action::EncodeHeader { .. }));
        inst.on_header_encoded(32);
        let header = inst.poll();
        assert_eq!(header[0].buffer.bytes_used, 32);
        assert!(header[0].flags.contains(FrameFlags::HEADER));

        assert_eq!(run(&mut inst), Action::InitBuffers { dpb: ArrayVec::new() });
        inst.on_buffers_ready();
        assert_eq!(inst.state(), State::Running);

        inst.enqueue_source(src(5), DEPTH).unwrap();
        assert!(!inst.is_ready());
        inst.enqueue_dest(dst(1)).unwrap();
        let first = run(&mut inst);
        assert_eq!(inst.on_slice_encoded(), Step::Preempt);
        // Same buffers for the next slice
        assert_eq!(run(&mut inst), first);
        assert_eq!(inst.on_frame_encoded(4096), Step::Finished);

        let done = inst.poll();
        conserved(&done, 2);
        let out = done.iter().find(|c| c.queue == QueueKind::Destination).unwrap();
        assert_eq!(out.buffer.bytes_used, 4096);
        assert_eq!(out.buffer.timestamp, src(5).timestamp);
    }

    #[test]
    fn test_encoder_close_mid_frame_aborts_instance() {
        let params = OpenParams::encoder(CodecKind::H264, Geometry::new(640, 480));
        let mut inst = opened(params);
        inst.enqueue_dest(dst(0)).unwrap();
        run(&mut inst);
        inst.on_header_encoded(32);
        run(&mut inst);
        inst.on_buffers_ready();
        inst.enqueue_source(src(1), DEPTH).unwrap();
        inst.enqueue_dest(dst(1)).unwrap();
        run(&mut inst);
        inst.on_slice_encoded();

        assert_eq!(inst.begin_close(), CloseStep::Pending);
        assert_eq!(inst.state(), State::AbortInstance);
        assert_eq!(run(&mut inst), Action::Abort);
        inst.on_aborted();
        assert_eq!(inst.state(), State::ReturnInstance);
        assert_eq!(inst.sources_queued(), 0);
    }

    #[test]
    fn test_queue_depth_limit() {
        let mut inst = running_decoder(CodecKind::H264, 2);
        inst.enqueue_source(src(1), 2).unwrap();
        inst.enqueue_source(src(2), 2).unwrap();
        assert_eq!(inst.enqueue_source(src(3), 2), Err(Error::QueueFull));
        assert_eq!(inst.enqueue_source(src(1), DEPTH), Err(Error::InvalidBuffer));
    }

    #[test]
    fn test_unknown_picture_is_protocol_error() {
        let mut inst = running_decoder(CodecKind::H264, 2);
        inst.enqueue_source(src(1), DEPTH).unwrap();
        run(&mut inst);
        let bogus = shown(PhysAddr::new(0xdead_0000));
        assert_eq!(inst.on_frame_decoded(bogus, 0, 0, false), Step::Finished);
        assert_eq!(inst.last_error(), Some(Error::ProtocolError));
    }
}
