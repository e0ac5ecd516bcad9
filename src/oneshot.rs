//! [`Signaller`]/[`Oneshot`]: a one-time latch with multiple waiters.
//!
//! Grounded on the teacher's `fiber::r#async::oneshot` (single-producer,
//! single-receiver `Future`), generalized here to many waiters — a scope's
//! `done` and `not_ok` signals, and `with_nack`'s cleanup signal, all need
//! to notify an arbitrary number of registered observers, not just one
//! `.await`er.

use std::cell::RefCell;
use std::rc::Rc;

type Waiter<T> = Box<dyn FnOnce(T)>;

struct Inner<T: Clone> {
    value: Option<T>,
    waiters: Vec<Option<Waiter<T>>>,
}

/// The triggering half of a one-shot latch. Cloning is not provided; share
/// an `Oneshot` (the observing half) instead, or wrap `Signaller` in an
/// `Rc` at the call site if multiple owners must be able to trigger it
/// (only the first `signal` call has any effect).
pub struct Signaller<T: Clone> {
    inner: Rc<RefCell<Inner<T>>>,
}

/// The observing half of a one-shot latch. Cheaply cloneable; every clone
/// sees the same underlying state.
#[derive(Clone)]
pub struct Oneshot<T: Clone> {
    inner: Rc<RefCell<Inner<T>>>,
}

/// An idempotent handle to a registered waiter, returned by
/// [`Oneshot::add_waiter`]. Cancelling after the latch has already fired is
/// a harmless no-op.
pub struct Canceller<T: Clone> {
    inner: Rc<RefCell<Inner<T>>>,
    index: usize,
}

impl<T: Clone> Canceller<T> {
    pub fn cancel(self) {
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner.waiters.get_mut(self.index) {
            *slot = None;
        }
    }
}

/// Creates a fresh, untriggered latch.
pub fn channel<T: Clone>() -> (Signaller<T>, Oneshot<T>) {
    let inner = Rc::new(RefCell::new(Inner {
        value: None,
        waiters: Vec::new(),
    }));
    (
        Signaller {
            inner: inner.clone(),
        },
        Oneshot { inner },
    )
}

impl<T: Clone> Signaller<T> {
    /// Triggers the latch. Only the first call has any effect; every
    /// registered waiter is run eagerly, in registration order, inline on
    /// this call. Returns whether this call was the one that triggered it.
    pub fn signal(&self, value: T) -> bool {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            if inner.value.is_some() {
                return false;
            }
            inner.value = Some(value.clone());
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters.into_iter().flatten() {
            waiter(value.clone());
        }
        true
    }

    /// Whether [`Self::signal`] has already been called.
    pub fn is_triggered(&self) -> bool {
        self.inner.borrow().value.is_some()
    }
}

impl<T: Clone> Oneshot<T> {
    /// Returns the latched value immediately if already triggered.
    pub fn get(&self) -> Option<T> {
        self.inner.borrow().value.clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.borrow().value.is_some()
    }

    /// Registers `waiter` to run when the latch triggers. If it has already
    /// triggered, `waiter` runs immediately, inline, and the returned
    /// canceller is inert.
    pub fn add_waiter(&self, waiter: Waiter<T>) -> Canceller<T> {
        let mut inner = self.inner.borrow_mut();
        if let Some(value) = inner.value.clone() {
            drop(inner);
            waiter(value);
            return Canceller {
                inner: self.inner.clone(),
                index: usize::MAX,
            };
        }
        let index = inner.waiters.len();
        inner.waiters.push(Some(waiter));
        Canceller {
            inner: self.inner.clone(),
            index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn waiter_registered_before_signal_runs_at_signal_time() {
        let (tx, rx) = channel::<i32>();
        let seen = Rc::new(Cell::new(None));
        let s = seen.clone();
        rx.add_waiter(Box::new(move |v| s.set(Some(v))));
        assert_eq!(seen.get(), None);
        tx.signal(42);
        assert_eq!(seen.get(), Some(42));
    }

    #[test]
    fn waiter_registered_after_signal_runs_immediately() {
        let (tx, rx) = channel::<i32>();
        tx.signal(7);
        let seen = Rc::new(Cell::new(None));
        let s = seen.clone();
        rx.add_waiter(Box::new(move |v| s.set(Some(v))));
        assert_eq!(seen.get(), Some(7));
    }

    #[test]
    fn signal_is_idempotent() {
        let (tx, rx) = channel::<i32>();
        assert!(tx.signal(1));
        assert!(!tx.signal(2));
        assert_eq!(rx.get(), Some(1));
    }

    #[test]
    fn multiple_waiters_all_run_exactly_once() {
        let (tx, rx) = channel::<i32>();
        let count = Rc::new(Cell::new(0));
        for _ in 0..5 {
            let c = count.clone();
            rx.add_waiter(Box::new(move |_| c.set(c.get() + 1)));
        }
        tx.signal(0);
        assert_eq!(count.get(), 5);
    }

    #[test]
    fn cancelled_waiter_does_not_run() {
        let (tx, rx) = channel::<i32>();
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        let canceller = rx.add_waiter(Box::new(move |_| r.set(true)));
        canceller.cancel();
        tx.signal(1);
        assert!(!ran.get());
    }
}
