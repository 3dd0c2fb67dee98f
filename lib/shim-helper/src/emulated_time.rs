/*!
Instants of time in an umbra simulation.
*/

use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::simulation_time::SimulationTime;

/// An instant in time (analogous to `std::time::Instant`) in the simulation.
/// Internally represented as nanoseconds since the Unix epoch, so that
/// wall-clock syscalls made by managed processes return stable values.
#[derive(Copy, Clone, Eq, PartialEq, Debug, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct EmulatedTime(u64);

/// The number of seconds from the Unix epoch to 00:00:00 UTC on 1 January
/// 2000, the instant at which every simulation starts. Applications observe
/// a fixed recent date rather than the real wall clock.
pub const SIMULATION_START_SEC: u64 = 946_684_800;

impl EmulatedTime {
    /// The start time of the simulation: 00:00:00 UTC on 1 January, 2000.
    pub const SIMULATION_START: Self = Self(SIMULATION_START_SEC * 1_000_000_000);
    /// The Unix epoch (00:00:00 UTC on 1 January 1970).
    pub const UNIX_EPOCH: Self = Self(0);

    pub const MAX: Self = Self(u64::MAX);
    pub const MIN: Self = Self(0);

    /// The instant corresponding to `val` time units since the simulation began.
    pub fn from_abs_simtime(val: SimulationTime) -> Self {
        Self::SIMULATION_START + val
    }

    /// Convert to the simulation time since the simulation began.
    pub fn to_abs_simtime(self) -> SimulationTime {
        self.duration_since(&Self::SIMULATION_START)
    }

    /// Nanoseconds since the Unix epoch.
    pub fn to_nanos(self) -> u64 {
        self.0
    }

    /// The instant `nanos` nanoseconds after the Unix epoch.
    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Returns the duration since `earlier`, or panics if `earlier` is after `self`.
    pub fn duration_since(&self, earlier: &EmulatedTime) -> SimulationTime {
        self.checked_duration_since(earlier).unwrap()
    }

    /// Returns the duration since `earlier`, or `None` if `earlier` is after `self`.
    pub fn checked_duration_since(&self, earlier: &EmulatedTime) -> Option<SimulationTime> {
        self.0.checked_sub(earlier.0).map(SimulationTime::from_nanos)
    }

    /// Returns the duration since `earlier`, or 0 if `earlier` is after `self`.
    pub fn saturating_duration_since(&self, earlier: &EmulatedTime) -> SimulationTime {
        self.checked_duration_since(earlier)
            .unwrap_or(SimulationTime::ZERO)
    }

    pub fn checked_add(&self, duration: SimulationTime) -> Option<EmulatedTime> {
        self.0
            .checked_add(duration.as_nanos() as u64)
            .map(EmulatedTime)
    }

    pub fn checked_sub(&self, duration: SimulationTime) -> Option<EmulatedTime> {
        self.0
            .checked_sub(duration.as_nanos() as u64)
            .map(EmulatedTime)
    }

    pub fn saturating_add(&self, duration: SimulationTime) -> EmulatedTime {
        match self.checked_add(duration) {
            Some(later) => later,
            None => EmulatedTime::MAX,
        }
    }

    pub fn saturating_sub(&self, duration: SimulationTime) -> EmulatedTime {
        match self.checked_sub(duration) {
            Some(earlier) => earlier,
            None => EmulatedTime::SIMULATION_START,
        }
    }
}

impl std::ops::Add<SimulationTime> for EmulatedTime {
    type Output = EmulatedTime;

    fn add(self, other: SimulationTime) -> Self {
        self.checked_add(other).unwrap()
    }
}

impl std::ops::AddAssign<SimulationTime> for EmulatedTime {
    fn add_assign(&mut self, rhs: SimulationTime) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub<SimulationTime> for EmulatedTime {
    type Output = EmulatedTime;

    fn sub(self, other: SimulationTime) -> Self {
        self.checked_sub(other).unwrap()
    }
}

impl std::ops::Sub<EmulatedTime> for EmulatedTime {
    type Output = SimulationTime;

    fn sub(self, other: EmulatedTime) -> Self::Output {
        self.duration_since(&other)
    }
}

/// An [`EmulatedTime`] that can be updated and read across threads and across
/// processes through shared memory. The engine advances it; the shim reads it
/// to answer time fast-paths without a syscall round trip.
#[repr(transparent)]
pub struct AtomicEmulatedTime(AtomicU64);

impl AtomicEmulatedTime {
    pub fn new(t: EmulatedTime) -> Self {
        Self(AtomicU64::new(t.0))
    }

    pub fn load(&self, order: Ordering) -> EmulatedTime {
        EmulatedTime(self.0.load(order))
    }

    pub fn store(&self, val: EmulatedTime, order: Ordering) {
        self.0.store(val.0, order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulation_start() {
        assert_eq!(
            EmulatedTime::SIMULATION_START
                .duration_since(&EmulatedTime::UNIX_EPOCH)
                .as_secs(),
            SIMULATION_START_SEC
        );
    }

    #[test]
    fn test_abs_simtime_roundtrip() {
        assert_eq!(
            EmulatedTime::from_abs_simtime(SimulationTime::ZERO),
            EmulatedTime::SIMULATION_START
        );
        assert_eq!(
            EmulatedTime::from_abs_simtime(SimulationTime::SECOND).to_abs_simtime(),
            SimulationTime::SECOND
        );
    }

    #[test]
    fn test_duration_since() {
        let t0 = EmulatedTime::SIMULATION_START;
        let t1 = t0 + SimulationTime::from_millis(250);
        assert_eq!(t1.duration_since(&t0), SimulationTime::from_millis(250));
        assert_eq!(t0.checked_duration_since(&t1), None);
        assert_eq!(t0.saturating_duration_since(&t1), SimulationTime::ZERO);
    }

    #[test]
    fn test_atomic() {
        let t = AtomicEmulatedTime::new(EmulatedTime::SIMULATION_START);
        let later = EmulatedTime::SIMULATION_START + SimulationTime::SECOND;
        t.store(later, Ordering::Relaxed);
        assert_eq!(t.load(Ordering::Relaxed), later);
    }
}
