//! # MFC Hardware Abstraction Layer
//!
//! Contracts between the codec scheduler and the platform it runs on.
//!
//! The scheduler never touches codec registers. Everything it needs from the
//! physical core, the clock/power controller and the physical memory
//! allocator is expressed here as a trait, together with the plain data
//! types that cross those boundaries.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          mfc-hal                             │
//! │  ┌────────────┐  ┌─────────────┐  ┌────────────────────────┐ │
//! │  │   types    │  │   reason    │  │          ops           │ │
//! │  │ (PhysAddr, │  │ (ReasonCode,│  │ (HardwareOps,          │ │
//! │  │  Geometry) │  │  HwError)   │  │  PowerControl)         │ │
//! │  └────────────┘  └─────────────┘  └────────────────────────┘ │
//! │  ┌────────────┐  ┌─────────────┐  ┌────────────────────────┐ │
//! │  │   error    │  │   memory    │  │     sim (feature)      │ │
//! │  └────────────┘  └─────────────┘  └────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod error;
pub mod memory;
pub mod ops;
pub mod reason;
#[cfg(feature = "sim")]
pub mod sim;
pub mod types;

pub use error::{Error, Result};
pub use memory::{AllocFlags, Allocation, MemoryAllocator};
pub use ops::{HardwareOps, PowerControl};
pub use reason::{DisplayStatus, FrameStatus, HwErrorCode, Interrupt, ReasonCode};
pub use types::*;
