//! Low-number suppression and rounding.
//!
//! Every count that could reveal node-level granularity passes through here before it is returned
//! to anything outside the relay.

use serde::{Deserialize, Serialize};

/// Suppress values below `low_threshold` to zero, then round to the nearest multiple of
/// `round_target` (halves round up). A non-positive threshold or target disables that stage.
pub fn obfuscate(value: i64, low_threshold: i64, round_target: i64) -> i64 {
    let value = if low_threshold > 0 && value < low_threshold {
        0
    } else {
        value
    };

    if round_target <= 0 {
        return value;
    }

    let rem = value.rem_euclid(round_target);
    let floor = value - rem;
    if rem.saturating_mul(2) >= round_target {
        floor.saturating_add(round_target)
    } else {
        floor
    }
}

/// Obfuscation settings applied by the aggregators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obfuscator {
    pub low_number_suppression_threshold: i64,
    pub rounding_target: i64,
}

impl Obfuscator {
    pub fn new(low_number_suppression_threshold: i64, rounding_target: i64) -> Self {
        Self {
            low_number_suppression_threshold,
            rounding_target,
        }
    }

    /// No suppression and no rounding.
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    pub fn apply(&self, value: i64) -> i64 {
        obfuscate(
            value,
            self.low_number_suppression_threshold,
            self.rounding_target,
        )
    }
}

impl Default for Obfuscator {
    fn default() -> Self {
        Self::new(10, 10)
    }
}
