//! Millisecond clock with a 32-bit wrapping counter.
//!
//! Every timer in the node is a recorded [`Millis`] compared against the
//! current one with wrapping subtraction, so a counter rollover (every
//! ~49.7 days) never sticks a timer open or fires it early.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use serde::Serialize;

/// Longest interval that any timer in the node may use.  Elapsed time is
/// computed modulo 2^32, so intervals must stay below half the counter
/// range to remain unambiguous.
pub const MAX_INTERVAL_MS: u32 = i32::MAX as u32;

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// A point on the wrapping millisecond counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Millis(pub u32);

impl Millis {
    /// Milliseconds elapsed from `earlier` to `self`, across at most one
    /// counter wrap.
    pub fn since(self, earlier: Millis) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// True once at least `interval_ms` have passed since `earlier`.
    pub fn has_elapsed(self, earlier: Millis, interval_ms: u32) -> bool {
        self.since(earlier) >= interval_ms
    }

    pub fn wrapping_add(self, ms: u32) -> Millis {
        Millis(self.0.wrapping_add(ms))
    }
}

// ---------------------------------------------------------------------------
// Clock sources
// ---------------------------------------------------------------------------

pub trait Clock {
    /// Milliseconds since boot, wrapping at 2^32.
    fn now(&self) -> Millis;
}

/// Wall clock backed by [`Instant`], truncated to 32 bits.
pub struct MonotonicClock {
    started: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Millis {
        // Truncation is the wrap.
        Millis(self.started.elapsed().as_millis() as u32)
    }
}

/// Hand-driven clock.  Clones share the same counter, so a test can keep one
/// handle and give the other to the node.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u32>>,
}

impl ManualClock {
    pub fn starting_at(ms: u32) -> Self {
        Self {
            now: Rc::new(Cell::new(ms)),
        }
    }

    pub fn set(&self, ms: u32) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Millis {
        Millis(self.now.get())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn since_without_wrap() {
        assert_eq!(Millis(1_500).since(Millis(1_000)), 500);
    }

    #[test]
    fn since_across_wrap() {
        let before = Millis(u32::MAX - 99);
        let after = Millis(200);
        assert_eq!(after.since(before), 300);
    }

    #[test]
    fn has_elapsed_boundary_is_inclusive() {
        assert!(Millis(1_000).has_elapsed(Millis(0), 1_000));
        assert!(!Millis(999).has_elapsed(Millis(0), 1_000));
    }

    #[test]
    fn manual_clock_handles_share_counter() {
        let clock = ManualClock::starting_at(10);
        let handle = clock.clone();
        handle.advance(5);
        assert_eq!(clock.now(), Millis(15));
    }

    #[test]
    fn manual_clock_wraps() {
        let clock = ManualClock::starting_at(u32::MAX);
        clock.advance(2);
        assert_eq!(clock.now(), Millis(1));
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b.0 >= a.0);
    }

    proptest! {
        /// Elapsed time is exact for any start point, including those near
        /// the top of the counter, as long as the gap fits in an interval.
        #[test]
        fn elapsed_is_exact_across_wrap(start in any::<u32>(), gap in 0..=MAX_INTERVAL_MS) {
            let earlier = Millis(start);
            let later = earlier.wrapping_add(gap);
            prop_assert_eq!(later.since(earlier), gap);
            prop_assert!(later.has_elapsed(earlier, gap));
        }
    }
}
