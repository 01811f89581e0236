//! # Device Configuration
//!
//! Tunables of one [`Device`](crate::Device). Values can be given in code or
//! parsed from a boot-parameter style string:
//!
//! ```text
//! mfc.max_instances=4 mfc.ack_timeout_ms=500 mfc.watchdog_threshold=3
//! ```
//!
//! Tokens without the `mfc.` prefix are ignored so the full kernel command
//! line can be passed as is.

use std::time::Duration;

use mfc_hal::{Error, Result};

/// Upper bound on simultaneously open instances (one pending bit each)
pub const MAX_INSTANCES: usize = 32;

static_assertions::const_assert!(MAX_INSTANCES <= u32::BITS as usize);

const PREFIX: &str = "mfc.";

/// Device tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Open instances allowed at once
    pub max_instances: usize,
    /// Deadline for open/close acknowledgments
    pub ack_timeout_ms: u64,
    /// Watchdog tick period
    pub watchdog_period_ms: u64,
    /// Ticks with the hardware held and no interrupt before recovery
    pub watchdog_threshold: u32,
    /// Source buffers queued per instance
    pub max_source_queue: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_instances: 16,
            ack_timeout_ms: 2000,
            watchdog_period_ms: 1000,
            watchdog_threshold: 10,
            max_source_queue: 32,
        }
    }
}

impl DeviceConfig {
    /// Acknowledgment deadline
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Watchdog period
    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms)
    }

    /// Check ranges
    pub fn validate(&self) -> Result<()> {
        let ok = (1..=MAX_INSTANCES).contains(&self.max_instances)
            && self.ack_timeout_ms > 0
            && self.watchdog_period_ms > 0
            && self.watchdog_threshold > 0
            && self.max_source_queue > 0;
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidParameter)
        }
    }

    /// Defaults overridden by `mfc.<key>=<value>` tokens
    pub fn from_cmdline(cmdline: &str) -> Result<Self> {
        let mut config = Self::default();

        for token in cmdline.split_whitespace() {
            let Some(param) = token.strip_prefix(PREFIX) else {
                continue;
            };
            let Some((key, value)) = param.split_once('=') else {
                log::warn!("config: ignoring '{}' without a value", token);
                continue;
            };
            config.set(key, value)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "max_instances" => self.max_instances = parse(value)?,
            "ack_timeout_ms" => self.ack_timeout_ms = parse(value)?,
            "watchdog_period_ms" => self.watchdog_period_ms = parse(value)?,
            "watchdog_threshold" => self.watchdog_threshold = parse(value)?,
            "max_source_queue" => self.max_source_queue = parse(value)?,
            _ => log::warn!("config: unknown parameter '{}{}'", PREFIX, key),
        }
        Ok(())
    }
}

fn parse<T: core::str::FromStr>(value: &str) -> Result<T> {
    value.parse().map_err(|_| Error::InvalidParameter)
}
