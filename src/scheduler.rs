//! The cooperative scheduler: a ready queue of runnable tasks plus a
//! hierarchical timer wheel, driven to quiescence one tick at a time.
//!
//! Grounded on the teacher's `fiber::r#async::block_on`, which drains a
//! single future to completion by alternating "poll" and "park until
//! woken"; generalized here into a multi-task executor since this crate runs
//! many fibers at once rather than blocking on exactly one future.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::clock::{SystemClock, TimeSource};
use crate::time::Instant;
use crate::wheel::{TimerWheel, WheelToken};

/// Something the scheduler can run one step of. Implemented by
/// [`crate::fiber::FiberTask`]; kept as a trait (rather than hardcoding
/// fibers into the ready queue) so other kinds of runnable work could be
/// added later without touching the core loop.
pub trait Task {
    fn run(self: Rc<Self>);
}

/// An external readiness source (spec §6: poller, fd/stream backend,
/// process backend). The scheduler calls [`Self::poll`] once per tick with
/// an upper bound on how long it may block; a real implementation backed by
/// epoll/kqueue/IOCP would sleep for up to that long and then invoke any
/// callbacks registered against the fds/processes that became ready. No
/// concrete backend ships in this crate (spec's external-interfaces are
/// trait-only); tests instead drive timers directly via [`crate::clock::FakeClock`].
pub trait TaskSource {
    /// `budget` is `None` to mean "the scheduler has other runnable work and
    /// this call must not block at all", `Some(d)` to mean "block for at
    /// most `d` before returning if nothing becomes ready sooner".
    fn poll(&self, budget: Option<Duration>);
}

struct Core {
    clock: Rc<dyn TimeSource>,
    wheel: TimerWheel<Box<dyn FnOnce()>>,
    ready: VecDeque<Rc<dyn Task>>,
    sources: Vec<Box<dyn TaskSource>>,
    stopped: bool,
}

/// The runtime's single-threaded executor. Cheaply cloneable; every clone
/// shares the same ready queue, timer wheel, and clock.
#[derive(Clone)]
pub struct Scheduler {
    core: Rc<RefCell<Core>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("Scheduler")
            .field("ready", &core.ready.len())
            .field("timers", &core.wheel.len())
            .field("stopped", &core.stopped)
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// A scheduler backed by the real system clock.
    pub fn new() -> Self {
        Self::with_clock(Rc::new(SystemClock))
    }

    /// A scheduler backed by a custom [`TimeSource`] (typically
    /// [`crate::clock::FakeClock`] in tests).
    pub fn with_clock(clock: Rc<dyn TimeSource>) -> Self {
        let now = clock.monotonic();
        Scheduler {
            core: Rc::new(RefCell::new(Core {
                clock,
                wheel: TimerWheel::new(now),
                ready: VecDeque::new(),
                sources: Vec::new(),
                stopped: false,
            })),
        }
    }

    pub fn now(&self) -> Instant {
        self.core.borrow().clock.monotonic()
    }

    /// Enqueues `task` to run on the next tick. Called both to start a
    /// freshly spawned fiber and to resume one that a waker has woken.
    pub fn schedule(&self, task: Rc<dyn Task>) {
        self.core.borrow_mut().ready.push_back(task);
    }

    /// Arranges for `callback` to run the first time [`Self::run_once`]
    /// advances past absolute time `at`.
    pub fn schedule_at_time(&self, at: Instant, callback: Box<dyn FnOnce()>) -> WheelToken {
        let mut core = self.core.borrow_mut();
        core.wheel.add_absolute(at, callback)
    }

    /// Arranges for `callback` to run `dt` from now.
    pub fn schedule_after_sleep(&self, dt: Duration, callback: Box<dyn FnOnce()>) -> WheelToken {
        let now = self.now();
        self.schedule_at_time(now.saturating_add(dt), callback)
    }

    pub fn cancel_timer(&self, token: WheelToken) {
        self.core.borrow_mut().wheel.cancel(token);
    }

    /// Registers an external readiness source, polled once per tick.
    pub fn add_task_source(&self, source: Box<dyn TaskSource>) {
        self.core.borrow_mut().sources.push(source);
    }

    /// Requests that [`Self::main`] return after the current tick.
    pub fn stop(&self) {
        self.core.borrow_mut().stopped = true;
    }

    /// How long [`Self::main`] may safely block task sources for before the
    /// next timer deadline, or `None` if there are no outstanding timers and
    /// no ready work (the caller may then block indefinitely on a source).
    fn idle_budget(&self) -> Option<Duration> {
        let core = self.core.borrow();
        if !core.ready.is_empty() {
            return Some(Duration::ZERO);
        }
        core.wheel
            .next_entry_time()
            .map(|at| at.duration_since(core.clock.monotonic()))
    }

    /// Runs one scheduling tick: fires any due timers, polls task sources
    /// with no blocking budget, then drains exactly the tasks that were
    /// ready at the start of the tick (so a task that re-enqueues itself
    /// doesn't starve tasks queued after it). Returns whether any work was
    /// done.
    pub fn run_once(&self) -> bool {
        let now = self.now();
        let mut fired = Vec::new();
        self.core.borrow_mut().wheel.advance(now, &mut fired);
        let fired_any = !fired.is_empty();
        for callback in fired {
            callback();
        }

        for source in self.core.borrow().sources.iter() {
            source.poll(Some(Duration::ZERO));
        }

        let batch: Vec<Rc<dyn Task>> = {
            let mut core = self.core.borrow_mut();
            let n = core.ready.len();
            core.ready.drain(..n).collect()
        };
        let ran_any = !batch.is_empty();
        for task in batch {
            log::trace!(target: "fibra::scheduler", "running task");
            task.run();
        }

        fired_any || ran_any
    }

    /// Runs ticks until there is no more runnable or scheduled work, or
    /// until [`Self::stop`] is called. Between ticks with no ready work, it
    /// blocks external task sources for up to the next timer's deadline
    /// (falling back to the clock's own `sleep` if no source is installed).
    pub fn main(&self) {
        loop {
            if self.core.borrow().stopped {
                self.core.borrow_mut().stopped = false;
                return;
            }

            let did_work = self.run_once();
            if did_work {
                continue;
            }

            let budget = self.idle_budget();
            let core = self.core.borrow();
            let quiescent = core.ready.is_empty() && core.wheel.is_empty() && core.sources.is_empty();
            drop(core);
            if quiescent {
                log::debug!(target: "fibra::scheduler", "quiescent, returning from main");
                return;
            }

            match budget {
                Some(dt) if dt > Duration::ZERO => {
                    if self.core.borrow().sources.is_empty() {
                        self.core.borrow().clock.sleep(dt);
                    } else {
                        for source in self.core.borrow().sources.iter() {
                            source.poll(Some(dt));
                        }
                    }
                }
                _ => {}
            }
        }
    }
}
