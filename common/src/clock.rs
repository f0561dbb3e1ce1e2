//! Wrapping millisecond timestamps.
//!
//! The device clock is a free-running `u32` millisecond counter that overflows
//! roughly every 49.7 days. Deadlines live in the same domain, so every
//! comparison goes through a wrapping difference interpreted as signed. Two
//! timestamps compare correctly as long as they are less than half a period
//! (~24.8 days) apart.

use serde::{Deserialize, Serialize};

/// Number of distinct clock readings before the counter wraps.
pub const CLOCK_PERIOD_MS: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Millis(u32);

impl Millis {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Reduces a wider counter reading onto the device clock.
    pub const fn from_counter(counter_ms: u64) -> Self {
        Self(counter_ms as u32)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn forward_by(self, delta_ms: i64) -> Self {
        Self(self.0.wrapping_add(delta_ms as u32))
    }

    pub const fn back_by(self, delta_ms: i64) -> Self {
        Self(self.0.wrapping_sub(delta_ms as u32))
    }

    /// Signed distance from `earlier` to `self`.
    pub const fn signed_since(self, earlier: Millis) -> i32 {
        self.0.wrapping_sub(earlier.0) as i32
    }

    /// Unsigned distance from `earlier` to `self`, modulo the clock period.
    pub const fn wrapping_since(self, earlier: Millis) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    pub const fn is_before(self, other: Millis) -> bool {
        self.signed_since(other) < 0
    }

    pub const fn is_after(self, other: Millis) -> bool {
        other.is_before(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_survives_wraparound() {
        let before_wrap = Millis::new(u32::MAX - 9);
        let after_wrap = Millis::new(5);

        assert!(before_wrap.is_before(after_wrap));
        assert!(after_wrap.is_after(before_wrap));
        assert_eq!(after_wrap.signed_since(before_wrap), 15);
        assert_eq!(before_wrap.signed_since(after_wrap), -15);
    }

    #[test]
    fn equal_instants_are_neither_before_nor_after() {
        let now = Millis::new(42);
        assert!(!now.is_before(now));
        assert!(!now.is_after(now));
    }

    #[test]
    fn offsets_wrap_in_both_directions() {
        let now = Millis::new(u32::MAX - 1);
        assert_eq!(now.forward_by(5), Millis::new(3));
        assert_eq!(Millis::new(3).back_by(5), now);
        assert_eq!(Millis::new(1_000).back_by(-2_000), Millis::new(3_000));
    }

    #[test]
    fn counter_readings_reduce_modulo_period() {
        assert_eq!(Millis::from_counter(CLOCK_PERIOD_MS + 7), Millis::new(7));
    }
}
