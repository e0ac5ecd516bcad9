//! [`sleep_op`]: a timer event, and [`Alarm`]: a repeating wall-clock-aligned
//! timer built on top of it (spec §4.4's "Timer / Alarm" component).
//!
//! Grounded on the teacher's `fiber::r#async::timeout::timeout`, which races
//! a future against a single deadline; generalized here into a first-class
//! [`Event`] so a timer composes with any other event via `choice` instead
//! of being its own bespoke combinator.

use std::rc::Rc;
use std::time::Duration;

use crate::event::{Event, TryOutcome};
use crate::scheduler::Scheduler;
use crate::time::Instant;

/// An event that commits with `()` once `at` has passed.
pub fn sleep_until(scheduler: &Scheduler, at: Instant) -> Event<()> {
    let scheduler = scheduler.clone();
    Event::base(
        {
            let scheduler = scheduler.clone();
            move || {
                if scheduler.now() >= at {
                    TryOutcome::Committed(())
                } else {
                    TryOutcome::WouldBlock
                }
            }
        },
        move |wake| {
            let token = scheduler.schedule_at_time(at, Box::new(move || wake(())));
            let scheduler = scheduler.clone();
            Box::new(move || scheduler.cancel_timer(token))
        },
    )
}

/// An event that commits with `()` after `dt` elapses from the moment it is
/// performed.
pub fn sleep_op(scheduler: &Scheduler, dt: Duration) -> Event<()> {
    let scheduler = scheduler.clone();
    Event::guard(move || {
        let at = scheduler.now().saturating_add(dt);
        sleep_until(&scheduler, at)
    })
}

/// A repeating timer that fires every `period`, catching up without drift
/// by always scheduling the next deadline relative to the *previous*
/// deadline rather than relative to "now" (so a late tick doesn't push
/// every subsequent tick later too).
pub struct Alarm {
    scheduler: Scheduler,
    period: Duration,
    next_deadline: std::cell::Cell<Instant>,
}

impl Alarm {
    /// Creates an alarm whose first tick fires `period` from now.
    pub fn new(scheduler: &Scheduler, period: Duration) -> Self {
        let first = scheduler.now().saturating_add(period);
        Alarm {
            scheduler: scheduler.clone(),
            period,
            next_deadline: std::cell::Cell::new(first),
        }
    }

    /// The time this alarm will next fire.
    pub fn next_time(&self) -> Instant {
        self.next_deadline.get()
    }

    /// An event that commits with `()` at this alarm's next deadline, then
    /// advances the alarm to the deadline after that. The next deadline is
    /// always the previous deadline plus one period (fixed-rate scheduling)
    /// rather than "now plus one period", so a late tick does not push
    /// every subsequent deadline later by the same amount.
    pub fn tick_op(self: &Rc<Self>) -> Event<()> {
        let this = self.clone();
        let at = self.next_deadline.get();
        sleep_until(&self.scheduler, at).map(move |()| {
            let next = this.next_deadline.get().saturating_add(this.period);
            this.next_deadline.set(next);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::scope::Scope;
    use std::cell::Cell;

    #[test]
    fn sleep_op_commits_after_deadline() {
        let clock = FakeClock::new(Instant::now());
        let sched = Scheduler::with_clock(Rc::new(clock.clone()));
        let scope = Scope::root(sched.clone());
        let woke = Rc::new(Cell::new(false));
        let w = woke.clone();
        let sched_for_body = sched.clone();
        scope
            .spawn(move |fiber| async move {
                fiber.perform(sleep_op(&sched_for_body, Duration::from_millis(10))).await;
                w.set(true);
                Ok(())
            })
            .unwrap();

        sched.run_once();
        assert!(!woke.get());
        clock.advance(Duration::from_millis(20));
        sched.main();
        assert!(woke.get());
    }

    #[test]
    fn alarm_ticks_do_not_drift_on_a_late_first_fire() {
        let clock = FakeClock::new(Instant::now());
        let sched = Scheduler::with_clock(Rc::new(clock.clone()));
        let alarm = Rc::new(Alarm::new(&sched, Duration::from_millis(10)));
        let first_deadline = alarm.next_time();

        clock.advance(Duration::from_millis(25)); // we're already late for tick 1
        let scope = Scope::root(sched.clone());
        let alarm_for_body = alarm.clone();
        scope
            .spawn(move |fiber| async move {
                fiber.perform(alarm_for_body.tick_op()).await;
                Ok(())
            })
            .unwrap();
        sched.main();

        // Next deadline is the fired deadline plus one period, regardless of
        // how late the tick actually fired.
        assert_eq!(alarm.next_time(), first_deadline + Duration::from_millis(10));
    }
}
