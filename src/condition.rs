//! [`Condition`]: a reusable broadcast-wait primitive.
//!
//! Unlike [`crate::oneshot::Oneshot`], a `Condition` is not a permanent
//! latch: each call to [`Condition::signal`] wakes the waiters registered
//! *at that moment* and then resets, ready to be waited on again. This
//! mirrors the teacher's `fiber::Cond`, which exposes the same
//! wait-then-reset contract backed by a libc condvar-like primitive; here
//! it is reimplemented directly atop [`crate::waitset::Waitset`] since
//! there is no OS thread to block.

use crate::event::{Event, TryOutcome};
use crate::waitset::Waitset;
use std::cell::RefCell;
use std::rc::Rc;

/// A broadcast condition variable for single-threaded cooperative code.
/// Cheaply cloneable; clones share the same waiter set.
#[derive(Clone)]
pub struct Condition {
    waiters: Rc<RefCell<Waitset<()>>>,
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Condition {
    pub fn new() -> Self {
        Self {
            waiters: Rc::new(RefCell::new(Waitset::new())),
        }
    }

    /// Wakes every waiter currently registered, then clears the waiter
    /// set. Waiters that register after this call are not affected by it;
    /// they wait for the *next* signal.
    pub fn signal(&self) {
        self.waiters.borrow_mut().notify_all(&());
    }

    /// The number of fibers currently blocked in [`Self::wait_op`].
    pub fn count_live_waiters(&self) -> usize {
        self.waiters.borrow().count_live_waiters(&())
    }

    /// An event that never commits immediately (`try` always fails) and
    /// whose `block` hook registers the suspension to be woken on the next
    /// [`Self::signal`]. Composable with timeouts and cancellation via
    /// `choice`: if this branch loses a race, the unlink hook actually
    /// removes its registration from the waitset rather than leaving a
    /// dead entry behind for a signal that will never come.
    pub fn wait_op(&self) -> Event<()> {
        let waiters = self.waiters.clone();
        Event::base(
            move || TryOutcome::WouldBlock,
            move |wake| {
                let token = waiters
                    .borrow_mut()
                    .add((), Box::new(move || wake(())));
                let waiters = waiters.clone();
                Box::new(move || {
                    waiters.borrow_mut().unlink(token);
                })
            },
        )
    }
}
