//! The [`TimeSource`] external-collaborator trait (spec §6) and its default,
//! `std`-backed implementation.
//!
//! The scheduler and timer wheel never call `std::time` directly; they go
//! through a `&dyn TimeSource` so tests can substitute a fake clock that
//! advances on command instead of racing the wall clock.

use crate::time::Instant;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Supplies monotonic and wall-clock time to the runtime, and an optional
/// process-blocking sleep used only when no poller task source is installed.
pub trait TimeSource {
    /// Monotonic time, used as the Timer Wheel's coordinate space.
    fn monotonic(&self) -> Instant;

    /// Wall-clock seconds since the Unix epoch, for [`crate::sleep::Alarm`].
    fn realtime(&self) -> f64;

    /// Blocks the calling OS thread for `dt`. Only ever invoked by
    /// [`crate::scheduler::Scheduler`] when it has no event-waiting task
    /// source registered and must idle until the next wheel deadline.
    fn sleep(&self, dt: Duration) {
        std::thread::sleep(dt);
    }
}

/// The default [`TimeSource`], backed by `std::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    fn realtime(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// A [`TimeSource`] that only moves when told to, for deterministic tests of
/// timer-wheel-driven scenarios. Wall-clock time advances in lockstep with
/// monotonic time, offset from the Unix epoch by an arbitrary fixed point.
#[derive(Clone)]
pub struct FakeClock {
    start: Instant,
    epoch_at_start: f64,
    now: std::rc::Rc<std::cell::RefCell<Instant>>,
}

impl FakeClock {
    pub fn new(start: Instant) -> Self {
        let epoch_at_start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            start,
            epoch_at_start,
            now: std::rc::Rc::new(std::cell::RefCell::new(start)),
        }
    }

    /// Moves the clock forward by `dt`. Never moves it backwards.
    pub fn advance(&self, dt: Duration) {
        let mut now = self.now.borrow_mut();
        *now = now.saturating_add(dt);
    }
}

impl TimeSource for FakeClock {
    fn monotonic(&self) -> Instant {
        *self.now.borrow()
    }

    fn realtime(&self) -> f64 {
        self.epoch_at_start + self.monotonic().duration_since(self.start).as_secs_f64()
    }

    /// A fake clock never blocks; callers are expected to drive it forward
    /// explicitly with [`Self::advance`] between scheduler ticks.
    fn sleep(&self, _dt: Duration) {}
}
