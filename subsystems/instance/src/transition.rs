//! # Completion Dispatch
//!
//! Maps `(state, role, reason)` to the kind of transition a completion
//! causes. Every combination the protocol does not allow is
//! [`Transition::Unexpected`], which the interrupt handler turns into a
//! `ProtocolError`.

use mfc_hal::{ReasonCode, Role};

use crate::state::State;

/// What a completion means for the instance that owns the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `Init → GotInstance`
    InstanceOpened,
    /// Decoder header parsed (first time or after a resolution change)
    HeaderParsed,
    /// Encoder stream header written
    HeaderEncoded,
    /// DPB / reference buffers accepted
    BuffersReady,
    /// Decoder produced and/or displayed a picture
    Decoded,
    /// Encoder finished a frame
    Encoded,
    /// Encoder finished one slice of a frame
    SliceEncoded,
    /// Drain reached the end of the stream
    Drained,
    /// DPB flush acknowledged
    Flushed,
    /// In-flight job ended after a close request, or abort acknowledged
    Aborted,
    /// Firmware instance released
    Released,
    /// Stream changed resolution
    ResolutionChanged,
    /// Fatal error code reported
    HardwareError,
    /// Reason not legal in this state
    Unexpected,
}

/// Classify a completion
pub fn transition(state: State, role: Role, reason: ReasonCode) -> Transition {
    use ReasonCode as R;
    use Role::{Decoder, Encoder};
    use State as S;

    match (state, role, reason) {
        // Abort swallows whatever the in-flight job produced
        (S::Abort, _, _) => Transition::Aborted,
        (_, _, R::Error) => Transition::HardwareError,

        (S::Init, _, R::OpenInstanceDone) => Transition::InstanceOpened,

        (S::GotInstance | S::ResChangeEnd, Decoder, R::SeqDone) => Transition::HeaderParsed,
        (S::GotInstance, Encoder, R::SeqDone) => Transition::HeaderEncoded,

        (S::HeaderParsed, _, R::InitBuffersDone) => Transition::BuffersReady,
        (S::ResChangeEnd, Decoder, R::InitBuffersDone) => Transition::BuffersReady,

        (S::Running | S::Finishing, Decoder, R::FrameDone | R::FieldDone) => Transition::Decoded,
        (S::Running, Decoder, R::ResolutionChanged) => Transition::ResolutionChanged,
        (S::Finishing, Decoder, R::CompleteSeq) => Transition::Drained,

        (S::Running, Encoder, R::FrameDone) => Transition::Encoded,
        (S::Running, Encoder, R::SliceDone) => Transition::SliceEncoded,

        (S::ResChangeFlush | S::DpbFlushing, Decoder, R::DpbFlushDone) => Transition::Flushed,
        (S::AbortInstance, _, R::AbortDone) => Transition::Aborted,
        (S::ReturnInstance, _, R::CloseInstanceDone) => Transition::Released,

        _ => Transition::Unexpected,
    }
}
