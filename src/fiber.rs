//! [`Fiber`]: the handle a running body of work uses to perform events.
//!
//! There is no stackful coroutine here. A "fiber" is an ordinary Rust
//! `async` block driven by [`FiberTask`], a [`crate::scheduler::Task`]
//! impl that polls it with a hand-rolled [`std::task::Waker`] — the same
//! `RawWaker`/`RawWakerVTable` technique the teacher crate uses in
//! `fiber::r#async::block_on`, generalized from "park the OS thread until
//! woken" to "re-enqueue this task on the scheduler's ready queue".
//!
//! [`Fiber::perform`] is the *only* way to obtain a [`Perform`] future, and
//! the only place one is ever polled is inside [`FiberTask::run`]. That
//! makes "perform called outside a running fiber" (spec §4.3 misuse case)
//! structurally unrepresentable rather than a runtime check: there is
//! simply no way to get a `Fiber` value without being inside one.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{RawWaker, RawWakerVTable, Waker};

use crate::error::Result;
use crate::event::{Event, Perform};
use crate::scheduler::{Scheduler, Task};
use crate::scope::Scope;

/// Passed by value into a spawned fiber's body closure. Move it into the
/// `async` block; its only job is minting [`Perform`] futures tied to the
/// scope that owns this fiber.
#[derive(Clone)]
pub struct Fiber {
    scope: Scope,
}

impl Fiber {
    pub(crate) fn new(scope: Scope) -> Self {
        Fiber { scope }
    }

    /// The scope this fiber is running inside.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Performs `event`: tries every branch speculatively, and if none
    /// commits, suspends until one does (spec §4.3's negotiation protocol).
    /// `.await` the returned future to drive it.
    pub fn perform<T: 'static>(&self, event: Event<T>) -> Perform<T> {
        Perform::new(event)
    }

    /// Attempts `event` without ever suspending. Returns `None` if no
    /// branch was immediately ready.
    pub fn try_perform<T: 'static>(&self, event: Event<T>) -> Option<T> {
        crate::event::try_once(event)
    }
}

type BoxedFuture = Pin<Box<dyn Future<Output = Result<()>>>>;

/// The [`crate::scheduler::Task`] backing a spawned fiber: a boxed future
/// plus the scope to report the outcome to once it resolves.
pub(crate) struct FiberTask {
    future: RefCell<Option<BoxedFuture>>,
    scope: Scope,
    self_ref: RefCell<Weak<FiberTask>>,
}

impl FiberTask {
    pub(crate) fn spawn(scheduler: &Scheduler, scope: Scope, future: BoxedFuture) {
        let task = Rc::new(FiberTask {
            future: RefCell::new(Some(future)),
            scope,
            self_ref: RefCell::new(Weak::new()),
        });
        *task.self_ref.borrow_mut() = Rc::downgrade(&task);
        scheduler.schedule(task);
    }

    fn waker(self: &Rc<Self>) -> Waker {
        let ptr = Rc::into_raw(self.clone()) as *const ();
        unsafe { Waker::from_raw(RawWaker::new(ptr, &VTABLE)) }
    }
}

impl Task for FiberTask {
    fn run(self: Rc<Self>) {
        let mut slot = self.future.borrow_mut();
        let Some(mut future) = slot.take() else {
            return; // already completed; a stale wake fired after completion.
        };
        let waker = self.waker();
        let mut cx = std::task::Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            std::task::Poll::Ready(result) => {
                drop(slot);
                log::trace!(target: "fibra::scheduler", "fiber completed: {:?}", result.is_ok());
                self.scope.report_fiber_outcome(result);
            }
            std::task::Poll::Pending => {
                *slot = Some(future);
            }
        }
    }
}

fn wake_task(ptr: *const (), drop_original: bool) {
    let task = unsafe { Rc::from_raw(ptr as *const FiberTask) };
    if let Some(strong) = task.self_ref.borrow().upgrade() {
        // Re-resolve through the scheduler stashed on the scope, so waking
        // from anywhere (a waitset callback, a timer) re-enqueues the task.
        strong.scope.scheduler().schedule(strong.clone());
    }
    if drop_original {
        drop(task);
    } else {
        std::mem::forget(task);
    }
}

unsafe fn waker_clone(ptr: *const ()) -> RawWaker {
    let task = Rc::from_raw(ptr as *const FiberTask);
    let cloned = task.clone();
    std::mem::forget(task);
    RawWaker::new(Rc::into_raw(cloned) as *const (), &VTABLE)
}

unsafe fn waker_wake(ptr: *const ()) {
    wake_task(ptr, true);
}

unsafe fn waker_wake_by_ref(ptr: *const ()) {
    wake_task(ptr, false);
}

unsafe fn waker_drop(ptr: *const ()) {
    drop(Rc::from_raw(ptr as *const FiberTask));
}

static VTABLE: RawWakerVTable = RawWakerVTable::new(waker_clone, waker_wake, waker_wake_by_ref, waker_drop);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TryOutcome;

    #[test]
    fn spawned_fiber_runs_to_completion() {
        let sched = Scheduler::new();
        let scope = Scope::root(sched.clone());
        let ran = Rc::new(RefCell::new(false));
        let r = ran.clone();
        scope
            .spawn(move |_fiber| async move {
                *r.borrow_mut() = true;
                Ok(())
            })
            .unwrap();
        sched.run_once();
        assert!(*ran.borrow());
        assert_eq!(scope.status(), Some(crate::scope::ScopeStatus::Ok));
    }

    #[test]
    fn try_perform_returns_none_when_nothing_is_ready() {
        let sched = Scheduler::new();
        let scope = Scope::root(sched.clone());
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        scope
            .spawn(move |fiber| async move {
                let v = fiber.try_perform(Event::<i32>::never());
                *s.borrow_mut() = Some(v);
                Ok(())
            })
            .unwrap();
        sched.run_once();
        assert_eq!(*seen.borrow(), Some(None));
    }

    #[test]
    fn try_perform_returns_some_when_ready() {
        let sched = Scheduler::new();
        let scope = Scope::root(sched.clone());
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        scope
            .spawn(move |fiber| async move {
                let ev = Event::base(|| TryOutcome::Committed(5), |_wake| Box::new(|| {}));
                let v = fiber.try_perform(ev);
                *s.borrow_mut() = Some(v);
                Ok(())
            })
            .unwrap();
        sched.run_once();
        assert_eq!(*seen.borrow(), Some(Some(5)));
    }
}
