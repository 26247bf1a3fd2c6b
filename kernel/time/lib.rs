// Copyright 2026 The Kestrel Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! The kernel's monotonic clock.
//!
//! Time advances in fixed ticks, driven by the external timer
//! interrupt shim calling [`tick`] once per interrupt. The crate keeps
//! a monotonic tick counter, converts between ticks, [`Duration`]s and
//! [`Instant`]s, and provides the [`TimeSlice`] quantum accounting used
//! by the scheduler.
//!
//! Wall-clock time is the monotonic clock plus a boot-time offset,
//! which the (external) RTC driver records once with
//! [`set_boot_wall_clock_nanos`].

#![no_std]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![forbid(unsafe_code)]

mod slice;

pub use core::time::Duration;
pub use slice::TimeSlice;

use core::sync::atomic::{AtomicU64, Ordering};

/// The number of ticks per second.
///
/// One tick is one millisecond, which is also the granularity of
/// the scheduler's quantum table.
///
pub const TICKS_PER_SECOND: u64 = 1000;

/// The number of nanoseconds in one tick.
///
pub const NANOSECONDS_PER_TICK: u64 = 1_000_000_000 / TICKS_PER_SECOND;

static TICKS: AtomicU64 = AtomicU64::new(0);
static BOOT_WALL_CLOCK_NANOS: AtomicU64 = AtomicU64::new(0);

/// Advances the monotonic clock by one tick.
///
/// Called by the timer interrupt shim, once per interrupt.
///
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Returns the number of ticks since boot.
///
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Returns the number of nanoseconds since boot.
///
pub fn monotonic_nanos() -> u64 {
    ticks() * NANOSECONDS_PER_TICK
}

/// Records the wall-clock time at boot, in nanoseconds since the
/// Unix epoch.
///
pub fn set_boot_wall_clock_nanos(nanos: u64) {
    BOOT_WALL_CLOCK_NANOS.store(nanos, Ordering::SeqCst);
}

/// Returns the current wall-clock time, in nanoseconds since the
/// Unix epoch. Zero until the RTC driver has recorded boot time.
///
pub fn wall_clock_nanos() -> u64 {
    let boot = BOOT_WALL_CLOCK_NANOS.load(Ordering::Relaxed);
    if boot == 0 {
        0
    } else {
        boot + monotonic_nanos()
    }
}

/// Returns an [`Instant`] representing the current time.
///
pub fn now() -> Instant {
    Instant::new(ticks())
}

/// Returns an [`Instant`] that will occur after the given
/// [`Duration`].
///
pub fn after(wait: Duration) -> Instant {
    let delta = wait.as_nanos() / (NANOSECONDS_PER_TICK as u128);
    Instant::new(ticks() + delta as u64)
}

/// Represents a single point in the kernel's monotonically
/// nondecreasing clock.
///
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Instant(u64);

impl Instant {
    /// Returns an `Instant` representing the given number of
    /// ticks since boot.
    ///
    pub const fn new(ticks: u64) -> Self {
        Instant(ticks)
    }

    /// Returns the instant's tick count.
    ///
    pub const fn ticks(&self) -> u64 {
        self.0
    }

    /// Returns the amount of time elapsed from the `earlier`
    /// instant to this one.
    ///
    /// # Panics
    ///
    /// `duration_since` panics if `earlier` is later than this
    /// instant.
    ///
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        assert!(earlier.0 <= self.0, "duration_since with a later instant");
        Duration::from_nanos((self.0 - earlier.0) * NANOSECONDS_PER_TICK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instants() {
        let earlier = Instant::new(10);
        let later = Instant::new(1510);
        assert_eq!(
            later.duration_since(earlier),
            Duration::from_nanos(1500 * NANOSECONDS_PER_TICK)
        );
        assert_eq!(later.duration_since(earlier).as_millis(), 1500);
    }

    #[test]
    fn ticks_advance() {
        let before = ticks();
        tick();
        tick();
        assert!(ticks() >= before + 2);
    }
}
