// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Quantum accounting for the scheduler.

use crate::{Duration, NANOSECONDS_PER_TICK};
use core::ops::{Add, AddAssign};

/// The number of system timer ticks a task has left on the CPU
/// before the next scheduling decision.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSlice(u64);

impl TimeSlice {
    /// The empty time slice.
    ///
    pub const ZERO: TimeSlice = TimeSlice(0);

    /// Returns a time slice of the given number of ticks.
    ///
    pub const fn from_ticks(ticks: u64) -> Self {
        TimeSlice(ticks)
    }

    /// Returns the smallest time slice no shorter than the given
    /// duration.
    ///
    pub const fn from_duration(duration: &Duration) -> Self {
        // Round up if necessary.
        let nanos = duration.as_nanos() + (NANOSECONDS_PER_TICK - 1) as u128;
        TimeSlice((nanos / (NANOSECONDS_PER_TICK as u128)) as u64)
    }

    /// Returns the slice's remaining tick count.
    ///
    pub const fn ticks(&self) -> u64 {
        self.0
    }

    /// Decrements the time slice by a single tick, returning
    /// true if the time slice is now zero.
    ///
    pub fn tick(&mut self) -> bool {
        self.0 = self.0.saturating_sub(1);
        self.0 == 0
    }

    /// Returns true if the time slice is zero.
    ///
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Add<TimeSlice> for TimeSlice {
    type Output = Self;

    #[inline]
    fn add(self, rhs: TimeSlice) -> Self {
        TimeSlice(self.0 + rhs.0)
    }
}

impl AddAssign<TimeSlice> for TimeSlice {
    #[inline]
    fn add_assign(&mut self, rhs: TimeSlice) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_down_to_zero() {
        let mut slice = TimeSlice::from_ticks(3);
        assert!(!slice.tick());
        assert!(!slice.tick());
        assert!(slice.tick());
        assert!(slice.tick());
        assert!(slice.is_zero());
    }

    #[test]
    fn from_duration_rounds_up() {
        let slice = TimeSlice::from_duration(&Duration::from_nanos(NANOSECONDS_PER_TICK * 2 + 1));
        assert_eq!(slice.ticks(), 3);
        assert_eq!(
            TimeSlice::from_duration(&Duration::from_millis(5)).ticks(),
            5
        );
    }
}
