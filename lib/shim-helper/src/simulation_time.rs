/*!
Values for working with a simulated duration. Use
[`EmulatedTime`](crate::emulated_time::EmulatedTime) to represent an instant
in time.
*/

use std::time::Duration;

use bytemuck::{Pod, Zeroable};

/// An interval of simulated time, measured in nanoseconds.
#[derive(Copy, Clone, Eq, PartialEq, Debug, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct SimulationTime(u64);

impl SimulationTime {
    pub const MAX: SimulationTime = SimulationTime(u64::MAX);
    pub const ZERO: SimulationTime = SimulationTime(0);
    pub const NANOSECOND: SimulationTime = SimulationTime(1);
    pub const MICROSECOND: SimulationTime = SimulationTime(1_000);
    pub const MILLISECOND: SimulationTime = SimulationTime(1_000_000);
    pub const SECOND: SimulationTime = SimulationTime(1_000_000_000);

    /// Convert a [`Duration`] to a [`SimulationTime`]. This function exists as a `const`
    /// alternative to `SimulationTime::try_from(duration)`. Panics if the duration is too large.
    pub const fn from_duration(val: Duration) -> Self {
        let val = val.as_nanos();
        if val > u64::MAX as u128 {
            panic!("Duration is larger than SimulationTime::MAX");
        }
        Self(val as u64)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn as_secs(&self) -> u64 {
        self.0 / Self::SECOND.0
    }

    pub fn as_millis(&self) -> u64 {
        self.0 / Self::MILLISECOND.0
    }

    pub fn as_micros(&self) -> u64 {
        self.0 / Self::MICROSECOND.0
    }

    pub fn as_nanos(&self) -> u128 {
        self.0.into()
    }

    pub fn as_nanos_f64(&self) -> f64 {
        self.0 as f64
    }

    pub fn subsec_nanos(&self) -> u32 {
        (self.0 % Self::SECOND.0).try_into().unwrap()
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn checked_mul(self, other: u64) -> Option<Self> {
        self.0.checked_mul(other).map(Self)
    }

    pub fn checked_div(self, other: u64) -> Option<Self> {
        self.0.checked_div(other).map(Self)
    }

    pub fn checked_rem(self, other: Self) -> Option<Self> {
        self.0.checked_rem(other.0).map(Self)
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    pub fn saturating_mul(self, other: u64) -> Self {
        Self(self.0.saturating_mul(other))
    }

    pub fn try_from_secs(s: u64) -> Option<Self> {
        Self::SECOND.checked_mul(s)
    }

    pub fn from_secs(s: u64) -> Self {
        Self::try_from_secs(s).unwrap()
    }

    pub fn try_from_millis(s: u64) -> Option<Self> {
        Self::MILLISECOND.checked_mul(s)
    }

    pub fn from_millis(s: u64) -> Self {
        Self::try_from_millis(s).unwrap()
    }

    pub fn try_from_micros(s: u64) -> Option<Self> {
        Self::MICROSECOND.checked_mul(s)
    }

    pub fn from_micros(s: u64) -> Self {
        Self::try_from_micros(s).unwrap()
    }

    pub fn from_nanos(s: u64) -> Self {
        Self(s)
    }
}

impl std::ops::Add<SimulationTime> for SimulationTime {
    type Output = SimulationTime;

    fn add(self, other: Self) -> Self::Output {
        self.checked_add(other).unwrap()
    }
}

impl std::ops::AddAssign<SimulationTime> for SimulationTime {
    fn add_assign(&mut self, rhs: SimulationTime) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub<SimulationTime> for SimulationTime {
    type Output = SimulationTime;

    fn sub(self, other: Self) -> Self::Output {
        self.checked_sub(other).unwrap()
    }
}

impl std::ops::SubAssign<SimulationTime> for SimulationTime {
    fn sub_assign(&mut self, rhs: SimulationTime) {
        *self = *self - rhs;
    }
}

impl std::ops::Mul<u32> for SimulationTime {
    type Output = SimulationTime;

    fn mul(self, other: u32) -> Self::Output {
        self.checked_mul(other.into()).unwrap()
    }
}

impl std::ops::Div<u32> for SimulationTime {
    type Output = SimulationTime;

    fn div(self, other: u32) -> Self::Output {
        self.checked_div(other.into()).unwrap()
    }
}

impl std::ops::Rem<SimulationTime> for SimulationTime {
    type Output = SimulationTime;

    fn rem(self, other: SimulationTime) -> Self::Output {
        self.checked_rem(other).unwrap()
    }
}

impl std::convert::TryFrom<Duration> for SimulationTime {
    type Error = ();

    fn try_from(val: Duration) -> Result<Self, Self::Error> {
        let val = val.as_nanos();
        if val > u64::MAX as u128 {
            return Err(());
        }
        Ok(Self(val as u64))
    }
}

impl From<SimulationTime> for Duration {
    fn from(val: SimulationTime) -> Self {
        Duration::from_nanos(val.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(SimulationTime::SECOND, SimulationTime::MILLISECOND * 1_000);
        assert_eq!(
            SimulationTime::MILLISECOND,
            SimulationTime::MICROSECOND * 1_000
        );
        assert_eq!(
            SimulationTime::MICROSECOND,
            SimulationTime::NANOSECOND * 1_000
        );
    }

    #[test]
    fn test_conversions() {
        let t = SimulationTime::from_secs(2) + SimulationTime::from_millis(500);
        assert_eq!(t.as_secs(), 2);
        assert_eq!(t.as_millis(), 2_500);
        assert_eq!(t.as_nanos(), 2_500_000_000);
        assert_eq!(t.subsec_nanos(), 500_000_000);

        assert_eq!(Duration::from(t), Duration::from_millis(2_500));
        assert_eq!(
            SimulationTime::try_from(Duration::from_millis(2_500)).unwrap(),
            t
        );
    }

    #[test]
    fn test_saturating_arithmetic() {
        assert_eq!(
            SimulationTime::MAX.saturating_add(SimulationTime::SECOND),
            SimulationTime::MAX
        );
        assert_eq!(
            SimulationTime::ZERO.saturating_sub(SimulationTime::SECOND),
            SimulationTime::ZERO
        );
        assert_eq!(
            SimulationTime::MAX.saturating_mul(2),
            SimulationTime::MAX
        );
    }

    #[test]
    fn test_checked_arithmetic() {
        assert_eq!(SimulationTime::MAX.checked_add(SimulationTime::NANOSECOND), None);
        assert_eq!(SimulationTime::ZERO.checked_sub(SimulationTime::NANOSECOND), None);
        assert_eq!(SimulationTime::SECOND.checked_div(0), None);
        assert_eq!(
            SimulationTime::SECOND.checked_mul(3),
            Some(SimulationTime::from_secs(3))
        );
    }

    #[test]
    #[should_panic]
    fn test_add_overflow_panics() {
        let _ = SimulationTime::MAX + SimulationTime::NANOSECOND;
    }

    #[test]
    fn test_ordering() {
        assert!(SimulationTime::NANOSECOND < SimulationTime::MICROSECOND);
        assert!(SimulationTime::SECOND > SimulationTime::MILLISECOND);
        assert!(SimulationTime::ZERO < SimulationTime::MAX);
    }
}
