//! # MFC Core
//!
//! Shares one multi-format codec core between many encode and decode
//! sessions.
//!
//! ## Control flow
//!
//! ```text
//!  client ──open/enqueue──▶ Device ──kick──▶ Scheduler ──command──▶ codec core
//!                             ▲                  ▲                      │
//!                             │                  │ run_one              │ interrupt
//!                             │                  │                      ▼
//!                      poll/close ◀── Instance ◀─┴──── Completion handler
//!
//!  Watchdog ──stall──▶ recover(): all instances Error, lock cleared, reboot
//! ```
//!
//! ## Components
//!
//! - **Device**: firmware residency, instance table, client surface
//! - **Scheduler**: round-robin over pending instances, one job at a time
//! - **Completion handler**: feeds interrupts to the owning instance
//! - **Watchdog**: recovers a core that stopped answering
//!
//! The crate never installs a logger; it reports through the `log` facade.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod device;
mod hwlock;
mod irq;
mod scheduler;
pub mod stats;
mod table;
mod wait;
pub mod watchdog;

#[cfg(test)]
mod tests;

pub use config::{DeviceConfig, MAX_INSTANCES};
pub use device::{Device, Platform};
pub use stats::DeviceStats;
pub use table::InstanceHandle;
pub use watchdog::Watchdog;

pub use mfc_instance::{Buffer, BufferStatus, Completion, FrameFlags, QueueKind, State};
