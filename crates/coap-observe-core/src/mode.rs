//! Resource mode and the process-wide cell that holds it.
//!
//! The mode is written by the `/tick` and `/time` command handlers and read by
//! every running notification loop, so it lives in an atomic that is shared by
//! reference instead of behind a lock.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// What the observable resource reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceMode {
    /// Time since the subscription started.
    ElapsedTime,
    /// Index of the current notification.
    #[default]
    TickCount,
}

impl ResourceMode {
    fn to_u8(self) -> u8 {
        match self {
            ResourceMode::ElapsedTime => 0,
            ResourceMode::TickCount => 1,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ResourceMode::ElapsedTime,
            _ => ResourceMode::TickCount,
        }
    }
}

impl fmt::Display for ResourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceMode::ElapsedTime => write!(f, "time"),
            ResourceMode::TickCount => write!(f, "tick"),
        }
    }
}

impl FromStr for ResourceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time" | "elapsedTime" => Ok(ResourceMode::ElapsedTime),
            "tick" | "tickCount" => Ok(ResourceMode::TickCount),
            other => Err(format!("unknown resource mode: {other}")),
        }
    }
}

/// Shared, lock-free holder of the current [`ResourceMode`].
#[derive(Debug)]
pub struct ModeCell {
    raw: AtomicU8,
}

impl ModeCell {
    /// Create a cell holding `mode`.
    pub fn new(mode: ResourceMode) -> Self {
        Self {
            raw: AtomicU8::new(mode.to_u8()),
        }
    }

    /// Read the mode in effect right now.
    pub fn get(&self) -> ResourceMode {
        ResourceMode::from_u8(self.raw.load(Ordering::Relaxed))
    }

    /// Replace the mode, returning the previous one.
    pub fn set(&self, mode: ResourceMode) -> ResourceMode {
        ResourceMode::from_u8(self.raw.swap(mode.to_u8(), Ordering::Relaxed))
    }
}

impl Default for ModeCell {
    fn default() -> Self {
        Self::new(ResourceMode::default())
    }
}
