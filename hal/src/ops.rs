//! # Hardware Contracts
//!
//! Traits the platform implements so the scheduler can drive a codec core.
//!
//! ## Job model
//!
//! ```text
//!   scheduler                    HardwareOps                 codec core
//!   ─────────                    ───────────                 ──────────
//!   clock_on()  ───────────────────────────────────────────▶ clock ungated
//!   submit_decode(..) ─────────▶ program registers ────────▶ run job
//!                                                               │
//!   irq handler ◀──────────────── interrupt line ◀──────────────┘
//!   read_completion_reason()
//!   read_frame_status() ...
//!   clock_off() ───────────────────────────────────────────▶ clock gated
//! ```
//!
//! Every [`HardwareOps`] call assumes the caller holds the device's hardware
//! lock. The `read_*` accessors return what the most recent interrupt
//! latched and are only meaningful inside the interrupt handler.

use crate::error::Result;
use crate::reason::{FrameStatus, Interrupt};
use crate::types::{CodecKind, HwInstanceId, OpenParams, PhysAddr, StreamInfo};

// =============================================================================
// HARDWARE OPERATIONS
// =============================================================================

/// Register-level programming of one codec core
pub trait HardwareOps: Send + Sync {
    // =========================================================================
    // Device lifecycle
    // =========================================================================

    /// Copy the firmware image into its buffer and boot it
    fn load_firmware(&self, blob: &[u8], addr: PhysAddr) -> Result<()>;

    /// Reset the core (drops every resident instance)
    fn reset(&self) -> Result<()>;

    /// Hand the global device context to the firmware
    fn init_device(&self, ctx: PhysAddr) -> Result<()>;

    // =========================================================================
    // Instance commands (each completes with one interrupt)
    // =========================================================================

    /// Create a firmware instance; completes with `OpenInstanceDone`
    fn open_instance(
        &self,
        codec: CodecKind,
        params: &OpenParams,
        ctx: PhysAddr,
    ) -> Result<HwInstanceId>;

    /// Release a firmware instance; completes with `CloseInstanceDone`
    fn close_instance(&self, id: HwInstanceId) -> Result<()>;

    /// Parse a stream header; completes with `SeqDone`
    fn parse_header(&self, id: HwInstanceId, src: PhysAddr, len: usize) -> Result<()>;

    /// Generate an encoder stream header into `dst`; completes with `SeqDone`
    fn encode_header(&self, id: HwInstanceId, dst: PhysAddr, len: usize) -> Result<()>;

    /// Register DPB / reference buffers; completes with `InitBuffersDone`
    fn init_buffers(
        &self,
        id: HwInstanceId,
        dpb: &[PhysAddr],
        scratch: PhysAddr,
        scratch_len: usize,
    ) -> Result<()>;

    /// Decode one unit from `src`
    ///
    /// `dst_addrs` is the DPB slot table: index `i` is slot `i`, a null
    /// address marks a slot the core must not write. A `src_len` of zero is
    /// an end-of-stream drain.
    fn submit_decode(
        &self,
        id: HwInstanceId,
        src: PhysAddr,
        src_len: usize,
        dst_addrs: &[PhysAddr],
    ) -> Result<()>;

    /// Encode one picture (or the next slice of it) into `dst`
    fn submit_encode(
        &self,
        id: HwInstanceId,
        src_addrs: &[PhysAddr],
        dst: PhysAddr,
        dst_len: usize,
    ) -> Result<()>;

    /// Drop all DPB state; completes with `DpbFlushDone`
    fn flush_dpb(&self, id: HwInstanceId) -> Result<()>;

    /// Abort the instance's in-progress frame; completes with `AbortDone`
    fn abort(&self, id: HwInstanceId) -> Result<()>;

    // =========================================================================
    // Completion registers
    // =========================================================================

    /// Reason and error code of the latched interrupt
    fn read_completion_reason(&self) -> Interrupt;

    /// Geometry and DPB count after `SeqDone` or `ResolutionChanged`
    fn read_geometry(&self) -> StreamInfo;

    /// Source bytes consumed by the last decode job (0 = all)
    fn read_consumed_bytes(&self) -> usize;

    /// DPB slots still used as reference, bit `i` = slot `i`
    fn read_reference_used_mask(&self) -> u32;

    /// Destination-side result of the last decode job
    fn read_frame_status(&self) -> FrameStatus;

    /// Bytes written by the last encode job
    fn read_encoded_size(&self) -> usize;

    // =========================================================================
    // Power management
    // =========================================================================

    /// Park the firmware before the clock is removed for a long period
    fn sleep(&self) -> Result<()> {
        Ok(())
    }

    /// Wake the firmware after [`sleep`](Self::sleep)
    fn wakeup(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// POWER CONTROL
// =============================================================================

/// Clock and power gating for the codec block
///
/// Power brackets firmware residency; the clock brackets every hardware lock
/// hold. Submitting work with the clock gated is a usage error.
pub trait PowerControl: Send + Sync {
    /// Power the codec block up
    fn power_on(&self) -> Result<()>;

    /// Power the codec block down
    fn power_off(&self);

    /// Ungate the codec clock
    fn clock_on(&self);

    /// Gate the codec clock
    fn clock_off(&self);
}
