//! # MFC Error Handling
//!
//! Unified error type for the codec scheduler stack.
//!
//! Errors local to one instance never fail its siblings. Only
//! [`Error::HardwareFault`] is device-wide.

use core::fmt;

use crate::reason::HwErrorCode;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// MFC Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// MFC unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Scheduler Errors
    // =========================================================================
    /// Resource pool exhausted
    AllocationFailure,
    /// Hardware returned a completion the current state cannot accept
    ProtocolError,
    /// Hardware stalled or missed an acknowledgment deadline
    HardwareFault,
    /// Header parse reported zero width, height or DPB count
    GeometryError,
    /// Secure and non-secure sessions cannot be resident together
    ConcurrencyViolation,

    // =========================================================================
    // Client Errors
    // =========================================================================
    /// Handle does not name a live instance
    InvalidHandle,
    /// Operation not allowed in the instance's current state
    InvalidState,
    /// Buffer address unknown to this instance or already queued
    InvalidBuffer,
    /// Invalid parameter provided
    InvalidParameter,
    /// Every instance slot is in use
    TooManyInstances,
    /// No CPU view exists for this buffer
    AccessDenied,
    /// Codec not supported in the requested role
    UnsupportedCodec,
    /// Source queue is at its configured depth
    QueueFull,
    /// Device is suspended
    Suspended,
    /// Wait expired
    Timeout,

    // =========================================================================
    // Hardware Errors
    // =========================================================================
    /// Hardware command issued with the clock gated
    ClockGated,
    /// Firmware could not be loaded
    FirmwareLoadFailed,
    /// Error code reported by the codec core
    HardwareError(HwErrorCode),
}

impl Error {
    /// Is this error fatal to the whole device rather than one instance?
    pub const fn is_device_wide(&self) -> bool {
        matches!(self, Self::HardwareFault | Self::FirmwareLoadFailed)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Scheduler
            Self::AllocationFailure => write!(f, "allocation failure"),
            Self::ProtocolError => write!(f, "unexpected completion from hardware"),
            Self::HardwareFault => write!(f, "hardware fault"),
            Self::GeometryError => write!(f, "invalid stream geometry"),
            Self::ConcurrencyViolation => write!(f, "secure/non-secure instance conflict"),

            // Client
            Self::InvalidHandle => write!(f, "invalid instance handle"),
            Self::InvalidState => write!(f, "operation invalid in current state"),
            Self::InvalidBuffer => write!(f, "invalid buffer"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::TooManyInstances => write!(f, "too many instances"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::UnsupportedCodec => write!(f, "unsupported codec"),
            Self::QueueFull => write!(f, "queue full"),
            Self::Suspended => write!(f, "device suspended"),
            Self::Timeout => write!(f, "operation timed out"),

            // Hardware
            Self::ClockGated => write!(f, "hardware accessed with clock gated"),
            Self::FirmwareLoadFailed => write!(f, "firmware load failed"),
            Self::HardwareError(code) => write!(f, "hardware error code {}", code.raw()),
        }
    }
}
