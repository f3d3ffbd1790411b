//! Monotonic time primitives.
//!
//! All runtime timestamps live on a single process-relative monotonic
//! timeline measured in nanoseconds. Wall-clock time never enters the
//! scheduling path; the host time-sync offset is tracked separately by the
//! host adapter.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A point or span on the runtime's monotonic timeline.
///
/// Copy is fine here - it's just a measurement, not an identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nanoseconds(pub u64);

impl Nanoseconds {
    pub const ZERO: Nanoseconds = Nanoseconds(0);

    pub fn from_micros(micros: u64) -> Self {
        Nanoseconds(micros.saturating_mul(1_000))
    }

    pub fn from_millis(millis: u64) -> Self {
        Nanoseconds(millis.saturating_mul(1_000_000))
    }

    pub fn from_secs(secs: u64) -> Self {
        Nanoseconds(secs.saturating_mul(1_000_000_000))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: Nanoseconds) -> Nanoseconds {
        Nanoseconds(self.0.saturating_sub(other.0))
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_nanos(self.0)
    }
}

impl Add for Nanoseconds {
    type Output = Nanoseconds;

    fn add(self, rhs: Nanoseconds) -> Nanoseconds {
        Nanoseconds(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Nanoseconds {
    fn add_assign(&mut self, rhs: Nanoseconds) {
        *self = *self + rhs;
    }
}

impl Sub for Nanoseconds {
    type Output = Nanoseconds;

    fn sub(self, rhs: Nanoseconds) -> Nanoseconds {
        Nanoseconds(self.0.saturating_sub(rhs.0))
    }
}

impl From<Duration> for Nanoseconds {
    fn from(d: Duration) -> Nanoseconds {
        Nanoseconds(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for Nanoseconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// Source of monotonic time.
///
/// Injected everywhere a component needs "now" so tests can step time
/// manually instead of sleeping.
pub trait ClockSource: Send + Sync {
    fn now(&self) -> Nanoseconds;
}

pub type SharedClock = Arc<dyn ClockSource>;

/// Production clock: nanoseconds since the clock was created.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for MonotonicClock {
    fn now(&self) -> Nanoseconds {
        Nanoseconds(u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX))
    }
}
