//! # Completion Reasons
//!
//! What the codec core reports when it raises an interrupt.
//!
//! Every hardware job ends with exactly one interrupt carrying a raw reason
//! and an error code. The reason says which step finished; the error code is
//! zero on success, a warning (`>= 145`) when the picture was produced with
//! concealment, or a fatal code otherwise.

use core::fmt;

use crate::types::PhysAddr;

// =============================================================================
// REASON CODES
// =============================================================================

/// Completion reason reported by the codec core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ReasonCode {
    /// Firmware created the instance
    OpenInstanceDone   = 1,
    /// Firmware released the instance
    CloseInstanceDone  = 2,
    /// Sequence header parsed (decoder) or generated (encoder)
    SeqDone            = 3,
    /// DPB / reference buffers accepted
    InitBuffersDone    = 4,
    /// One picture decoded or encoded
    FrameDone          = 5,
    /// One field of an interlaced picture decoded
    FieldDone          = 6,
    /// One slice of a split encoder frame produced
    SliceDone          = 7,
    /// End of stream reached, nothing left to display
    CompleteSeq        = 8,
    /// DPB flushed
    DpbFlushDone       = 9,
    /// In-progress job aborted
    AbortDone          = 10,
    /// Stream changed resolution
    ResolutionChanged  = 11,
    /// Job failed, see the error code
    Error              = 12,
}

impl ReasonCode {
    /// Decode a raw reason register value
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::OpenInstanceDone,
            2 => Self::CloseInstanceDone,
            3 => Self::SeqDone,
            4 => Self::InitBuffersDone,
            5 => Self::FrameDone,
            6 => Self::FieldDone,
            7 => Self::SliceDone,
            8 => Self::CompleteSeq,
            9 => Self::DpbFlushDone,
            10 => Self::AbortDone,
            11 => Self::ResolutionChanged,
            12 => Self::Error,
            _ => return None,
        })
    }

    /// Raw register value
    pub const fn raw(self) -> u32 {
        self as u32
    }
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Error code register value accompanying a completion
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct HwErrorCode(u32);

impl HwErrorCode {
    /// No error
    pub const NONE: Self = Self(0);
    /// Firmware rejected the command
    pub const INVALID_COMMAND: Self = Self(2);
    /// Header could not be parsed
    pub const HEADER_CORRUPT: Self = Self(9);
    /// Unsupported stream feature
    pub const UNSUPPORTED_FEATURE: Self = Self(20);
    /// Buffer too small for the picture
    pub const BUFFER_TOO_SMALL: Self = Self(33);
    /// First warning-class code; anything at or above is non-fatal
    pub const WARNINGS_START: Self = Self(145);
    /// Picture decoded with concealed macroblocks
    pub const CONCEALED_MB: Self = Self(150);

    /// Wrap a raw code
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw register value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Zero code
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Warning-class code: the picture is usable but was concealed
    pub const fn is_warning(self) -> bool {
        self.0 >= Self::WARNINGS_START.0
    }
}

impl fmt::Debug for HwErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HwErrorCode({})", self.0)
    }
}

/// One latched interrupt: raw reason plus error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupt {
    /// Raw reason register value
    pub reason: u32,
    /// Error code register value
    pub error: HwErrorCode,
}

impl Interrupt {
    /// Successful completion
    pub const fn ok(reason: ReasonCode) -> Self {
        Self {
            reason: reason.raw(),
            error: HwErrorCode::NONE,
        }
    }

    /// Completion carrying an error code
    pub const fn with_error(reason: ReasonCode, error: HwErrorCode) -> Self {
        Self {
            reason: reason.raw(),
            error,
        }
    }

    /// Decoded reason, `None` for a value the scheduler does not know
    pub const fn reason_code(&self) -> Option<ReasonCode> {
        ReasonCode::from_raw(self.reason)
    }
}

// =============================================================================
// FRAME STATUS
// =============================================================================

/// What the decoder did with the destination side of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    /// A picture was decoded but nothing is ready for display yet
    DecodeOnly,
    /// A previously decoded picture is ready, nothing new was decoded
    DisplayOnly,
    /// A picture was decoded and one (possibly the same) is ready for display
    DecodeAndDisplay,
    /// Nothing left to display (end of drain)
    NoMoreDisplay,
}

impl DisplayStatus {
    /// Was a new picture written?
    pub const fn decoded(self) -> bool {
        matches!(self, Self::DecodeOnly | Self::DecodeAndDisplay)
    }

    /// Is a picture ready for display?
    pub const fn displayed(self) -> bool {
        matches!(self, Self::DisplayOnly | Self::DecodeAndDisplay)
    }
}

/// Destination-side result of a decode job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStatus {
    /// Decode/display classification
    pub display: DisplayStatus,
    /// Address the new picture was written to
    pub decoded: Option<PhysAddr>,
    /// Address of the picture ready for display
    pub displayed: Option<PhysAddr>,
}

impl FrameStatus {
    /// Status of a job that produced nothing
    pub const fn empty() -> Self {
        Self {
            display: DisplayStatus::NoMoreDisplay,
            decoded: None,
            displayed: None,
        }
    }
}
