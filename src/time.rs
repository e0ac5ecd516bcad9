//! A monotonic [`Instant`] wrapper used throughout the scheduler, timer wheel,
//! and sleep/alarm events.
//!
//! This is a thin wrapper around [`std::time::Instant`] rather than a raw
//! `Duration` since epoch: unlike the fiber runtime this crate is patterned
//! after, there is no underlying event-loop clock to piggy-back on, so we
//! have no reason to depart from `std`'s own monotonic guarantees.

use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::Duration;

/// A duration considered "forever" for the purposes of timeouts and alarms.
pub const INFINITY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// A measurement of a monotonically nondecreasing clock.
///
/// Opaque and useful only in relation to other `Instant`s or [`Duration`]s.
/// Instants are guaranteed to never go backwards, but are not guaranteed to
/// tick at a uniform rate.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct Instant(pub(crate) std::time::Instant);

impl Instant {
    /// Returns an instant corresponding to "now".
    #[must_use]
    #[inline]
    pub fn now() -> Self {
        Self(std::time::Instant::now())
    }

    /// Returns the amount of time elapsed since this instant was created.
    #[must_use]
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }

    /// Returns `Some(t)` where `t` is `self + duration`, or `None` if the
    /// addition would overflow the underlying representation.
    #[must_use]
    #[inline]
    pub fn checked_add(&self, duration: Duration) -> Option<Instant> {
        self.0.checked_add(duration).map(Instant)
    }

    /// Returns `Some(t)` where `t` is `self - duration`, or `None` if the
    /// subtraction would overflow the underlying representation.
    #[must_use]
    #[inline]
    pub fn checked_sub(&self, duration: Duration) -> Option<Instant> {
        self.0.checked_sub(duration).map(Instant)
    }

    /// Saturating addition. Computes `self + duration`, clamping at the
    /// maximal representable instant on overflow.
    #[must_use]
    #[inline]
    pub fn saturating_add(&self, duration: Duration) -> Instant {
        Self(self.0 + duration)
    }

    /// Saturating subtraction. Computes `self - duration`, clamping at the
    /// minimal representable instant on overflow.
    #[must_use]
    #[inline]
    pub fn saturating_sub(&self, duration: Duration) -> Instant {
        self.checked_sub(duration).unwrap_or(*self)
    }

    /// Returns the amount of time elapsed from `earlier` to `self`, or
    /// `None` if `earlier` is later than `self`.
    #[must_use]
    #[inline]
    pub fn checked_duration_since(&self, earlier: Instant) -> Option<Duration> {
        self.0.checked_duration_since(earlier.0)
    }

    /// Returns the amount of time elapsed from `earlier` to `self`, or a
    /// zero duration if `earlier` is later than `self`.
    #[must_use]
    #[inline]
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }

}

impl Add<Duration> for Instant {
    type Output = Instant;

    /// # Panics
    ///
    /// Panics if the resulting instant would overflow. See
    /// [`Instant::checked_add`] for a non-panicking version.
    fn add(self, other: Duration) -> Instant {
        self.checked_add(other)
            .expect("overflow when adding duration to instant")
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, other: Duration) {
        *self = *self + other;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    /// # Panics
    ///
    /// Panics if the resulting instant would underflow. See
    /// [`Instant::checked_sub`] for a non-panicking version.
    fn sub(self, other: Duration) -> Instant {
        self.checked_sub(other)
            .expect("underflow when subtracting duration from instant")
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, other: Duration) {
        *self = *self - other;
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    /// Returns the amount of time elapsed from `other` to `self`, or a zero
    /// duration if `other` is later than `self`.
    fn sub(self, other: Instant) -> Duration {
        self.duration_since(other)
    }
}
