//! # MFC Instance State Machine
//!
//! One [`Instance`] per open encode or decode session.
//!
//! ## Lifecycle
//!
//! ```text
//!  Init ──open ack──▶ GotInstance ──header──▶ HeaderParsed ──DPB──▶ Running
//!                                                                   │  ▲
//!           ┌───────────── resolution change ───────────────────────┘  │
//!           ▼                                                          │
//!     ResChangeInit ──▶ ResChangeFlush ──flush ack──▶ ResChangeEnd ────┘
//!
//!  Running ──close──▶ Finishing ──drained──▶ ReturnInstance ──ack──▶ Free
//!
//!  any ──fatal error / watchdog──▶ Error
//! ```
//!
//! The instance never talks to hardware. The scheduler asks it for the next
//! [`Action`], issues it, and feeds the completion back through one of the
//! `on_*` handlers chosen by [`transition`].

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod buffer;
pub mod dpb;
pub mod instance;
pub mod queue;
pub mod sizes;
pub mod state;
pub mod transition;

pub use buffer::{Buffer, BufferStatus, Completion, FrameFlags, QueueKind};
pub use dpb::{Dpb, MAX_DPB_SLOTS};
pub use instance::{Action, ActionKind, CloseStep, Instance, InstanceStats, Step};
pub use state::State;
pub use transition::{transition, Transition};
