//! The simulated cycle counter.
//!
//! AppMgr has no notion of wall-clock time (spec Non-goals): the only clock
//! is `Cycle`, a monotonically increasing counter supplied by the host
//! simulator. This mirrors `shadow-shadow`'s `EmulatedTime`/`SimulationTime`
//! pair, collapsed into a single type since we don't need the
//! simulation-start-epoch translation that emulated wall-clock time requires.

use std::ops::{Add, Sub};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Cycle(pub u64);

impl Cycle {
    pub const ZERO: Cycle = Cycle(0);

    pub fn saturating_sub(self, other: Cycle) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Add<u64> for Cycle {
    type Output = Cycle;
    fn add(self, rhs: u64) -> Cycle {
        Cycle(self.0 + rhs)
    }
}

impl Sub<Cycle> for Cycle {
    type Output = i64;
    fn sub(self, rhs: Cycle) -> i64 {
        self.0 as i64 - rhs.0 as i64
    }
}

impl std::fmt::Display for Cycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
