//! Instance states.

use core::fmt;

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Created, firmware instance not yet acknowledged
    Init,
    /// Firmware instance exists
    GotInstance,
    /// Stream header known (decoder) or generated (encoder)
    HeaderParsed,
    /// Processing frames
    Running,
    /// Resolution change reported, DPB flush pending
    ResChangeInit,
    /// DPB flush for a resolution change in flight
    ResChangeFlush,
    /// Old DPB returned, waiting for the new header and DPB
    ResChangeEnd,
    /// Close requested, draining held pictures
    Finishing,
    /// Releasing the firmware instance
    ReturnInstance,
    /// Released, safe to destroy
    Free,
    /// Inert after an unrecoverable error, waiting to be closed
    Error,
    /// Close requested with a job in flight
    Abort,
    /// Explicit DPB flush in flight
    DpbFlushing,
    /// Aborting a slice-split encoder frame before release
    AbortInstance,
}

impl State {
    /// Is a close in progress?
    pub const fn is_closing(self) -> bool {
        matches!(
            self,
            State::Finishing | State::ReturnInstance | State::Abort | State::AbortInstance
        )
    }

    /// Will the instance never run another job without a close?
    pub const fn is_terminal(self) -> bool {
        matches!(self, State::Free | State::Error)
    }

    /// Can clients queue new buffers?
    pub const fn accepts_buffers(self) -> bool {
        !self.is_closing() && !self.is_terminal()
    }

    /// Name for logs
    pub const fn name(self) -> &'static str {
        match self {
            State::Init => "init",
            State::GotInstance => "got-instance",
            State::HeaderParsed => "header-parsed",
            State::Running => "running",
            State::ResChangeInit => "res-change-init",
            State::ResChangeFlush => "res-change-flush",
            State::ResChangeEnd => "res-change-end",
            State::Finishing => "finishing",
            State::ReturnInstance => "return-instance",
            State::Free => "free",
            State::Error => "error",
            State::Abort => "abort",
            State::DpbFlushing => "dpb-flushing",
            State::AbortInstance => "abort-instance",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
