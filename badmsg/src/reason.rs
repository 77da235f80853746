//! Bad-message reason codes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a message was rejected.
///
/// The codes are owned by the subsystems that validate messages. This crate
/// only logs and counts them, so the set stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BadMessageReason(u32);

impl BadMessageReason {
    pub const fn new(code: u32) -> Self {
        Self(code)
    }

    pub const fn code(self) -> u32 {
        self.0
    }
}

impl From<u32> for BadMessageReason {
    fn from(code: u32) -> Self {
        Self(code)
    }
}

impl fmt::Display for BadMessageReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
