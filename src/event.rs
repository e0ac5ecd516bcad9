//! The CML-style synchronous event algebra (spec §4.3): a compositional DSL
//! for describing "one synchronous step the current fiber is willing to
//! take", plus the negotiation protocol that commits to exactly one branch
//! of a composite event.
//!
//! There is no stackful coroutine underneath [`crate::fiber::Fiber`]: this
//! module is the "explicit state machine generated at the call sites of
//! perform" strategy from the spec's design notes, built the same way the
//! teacher crate hand-rolls [`Future`] implementations in
//! `fiber::r#async::oneshot`/`fiber::r#async::timeout` instead of reaching
//! for `async-stream` or a generator crate. [`Fiber::perform`] hands back a
//! [`Perform`] future; `.await`ing it drives Phases A-D below to completion.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::oneshot::{self, Oneshot, Signaller};

/// The result of a primitive branch's speculative attempt (spec §4.3 "try").
/// Distinguishing this from a plain `Option<T>` keeps "committed with a
/// falsy/default value" from being confused with "would block".
pub enum TryOutcome<T> {
    Committed(T),
    WouldBlock,
}

/// An idempotent handle returned by a primitive's `block` hook, unregistering
/// its waiter. Calling it twice, or after the waiter already fired, is safe.
pub type Unlink = Box<dyn FnOnce()>;

/// Delivers a branch's committed value to the engine. Boxed as `Rc<dyn Fn>`
/// rather than `FnOnce` so it can be handed to a waitset that only knows how
/// to store a plain callback; the engine still only ever calls it once,
/// enforced by the [`Shared::claimed`] latch.
pub type WakeFn<T> = Rc<dyn Fn(T)>;

type TryFn<T> = Box<dyn FnOnce() -> TryOutcome<T>>;
type BlockFn<T> = Box<dyn FnOnce(WakeFn<T>) -> Unlink>;

struct Base<T> {
    try_fn: TryFn<T>,
    block_fn: BlockFn<T>,
}

enum Kind<T> {
    Base(Base<T>),
    Choice(Vec<Event<T>>),
    Guard(Box<dyn FnOnce() -> Event<T>>),
    WithNack(Box<dyn FnOnce(Oneshot<()>) -> Event<T>>),
}

/// A first-class, side-effect-free description of one synchronous step.
/// Build one with [`Event::base`] or a combinator, then perform it with
/// [`crate::fiber::Fiber::perform`].
pub struct Event<T>(Kind<T>);

impl<T: 'static> Event<T> {
    /// The fundamental constructor (spec §4.3.1 "base"): a single primitive
    /// described by its `try` and `block` hooks. `wrap` is deliberately not
    /// a third hook here; it is the [`Event::map`] combinator instead, kept
    /// structural per the spec's design notes ("combinators are structural
    /// and should not require per-primitive support").
    pub fn base(
        try_fn: impl FnOnce() -> TryOutcome<T> + 'static,
        block_fn: impl FnOnce(WakeFn<T>) -> Unlink + 'static,
    ) -> Self {
        Event(Kind::Base(Base {
            try_fn: Box::new(try_fn),
            block_fn: Box::new(block_fn),
        }))
    }

    /// Commits immediately with `value` the one time it is performed.
    pub fn always(value: T) -> Self {
        Event::base(move || TryOutcome::Committed(value), |_wake| Box::new(|| {}))
    }

    /// Never commits. Its `block` registers nothing; useful as a
    /// placeholder branch or to race something against "nothing".
    pub fn never() -> Self {
        Event::base(|| TryOutcome::WouldBlock, |_wake| Box::new(|| {}))
    }

    /// Commits to exactly one child's commit (spec §4.3.1 "choice"). Ties
    /// are broken by first-try-succeeds in the speculative pass, else by
    /// whichever waitset notifies first in the blocked pass (scheduler FIFO
    /// order, per §9's resolved open question).
    pub fn choice(events: Vec<Event<T>>) -> Self {
        Event(Kind::Choice(events))
    }

    /// At perform-time, evaluates `thunk` to produce an event, then performs
    /// that event. `thunk` runs at most once per perform.
    pub fn guard(thunk: impl FnOnce() -> Event<T> + 'static) -> Self {
        Event(Kind::Guard(Box::new(thunk)))
    }

    /// `choice(self, guard(thunk))`.
    pub fn or_else(self, thunk: impl FnOnce() -> Event<T> + 'static) -> Self {
        Event::choice(vec![self, Event::guard(thunk)])
    }

    /// Invokes `f(nack)` where `nack` is a fresh, untriggered
    /// [`Oneshot`]`<()>`; `f`'s returned event becomes this event's body.
    /// After the whole perform commits, if the winning branch is not one of
    /// this event's own descendants, `nack` is signalled, so the caller can
    /// register cleanup on it via [`Oneshot::add_waiter`].
    pub fn with_nack(f: impl FnOnce(Oneshot<()>) -> Event<T> + 'static) -> Self {
        Event(Kind::WithNack(Box::new(f)))
    }

    /// Same commit behaviour as `self`; when `self` commits with `v`, the
    /// overall event yields `f(v)` (spec §4.3.1 "wrap").
    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Event<U> {
        let f: MapFn<T, U> = Rc::new(RefCell::new(Some(Box::new(f))));
        map_kind(self.0, f)
    }
}

type MapFn<T, U> = Rc<RefCell<Option<Box<dyn FnOnce(T) -> U>>>>;

fn map_kind<T: 'static, U: 'static>(kind: Kind<T>, f: MapFn<T, U>) -> Event<U> {
    match kind {
        Kind::Base(Base { try_fn, block_fn }) => {
            let f_try = f.clone();
            let new_try: TryFn<U> = Box::new(move || match try_fn() {
                TryOutcome::Committed(v) => {
                    let mapped = f_try
                        .borrow_mut()
                        .take()
                        .expect("event map fn invoked more than once")(v);
                    TryOutcome::Committed(mapped)
                }
                TryOutcome::WouldBlock => TryOutcome::WouldBlock,
            });
            let new_block: BlockFn<U> = Box::new(move |wake_u: WakeFn<U>| {
                let f_block = f;
                let wake_t: WakeFn<T> = Rc::new(move |v: T| {
                    let mapped = f_block
                        .borrow_mut()
                        .take()
                        .expect("event map fn invoked more than once")(v);
                    wake_u(mapped);
                });
                block_fn(wake_t)
            });
            Event(Kind::Base(Base {
                try_fn: new_try,
                block_fn: new_block,
            }))
        }
        Kind::Choice(events) => {
            let mapped = events.into_iter().map(|e| map_kind(e.0, f.clone())).collect();
            Event(Kind::Choice(mapped))
        }
        Kind::Guard(thunk) => Event(Kind::Guard(Box::new(move || {
            let inner = thunk();
            map_kind(inner.0, f)
        }))),
        Kind::WithNack(ctor) => Event(Kind::WithNack(Box::new(move |nack| {
            let inner = ctor(nack);
            map_kind(inner.0, f)
        }))),
    }
}

/// Like [`Event::choice`] but yields `(index, value)` of the winning branch
/// (spec §4.3.1 "first_ready").
pub fn first_ready<T: 'static>(events: Vec<Event<T>>) -> Event<(usize, T)> {
    let mapped = events
        .into_iter()
        .enumerate()
        .map(|(i, e)| e.map(move |v| (i, v)))
        .collect();
    Event::choice(mapped)
}

/// Like [`Event::choice`] but branches carry stable string names; yields
/// `(name, value)` of the winner (spec §4.3.1 "named_choice").
pub fn named_choice<T: 'static>(mapping: Vec<(String, Event<T>)>) -> Event<(String, T)> {
    let mapped = mapping
        .into_iter()
        .map(|(name, e)| e.map(move |v| (name, v)))
        .collect();
    Event::choice(mapped)
}

/// Returns `(true, value)` if `e_true` wins, else `(false, value)` (spec
/// §4.3.1 "boolean_choice").
pub fn boolean_choice<T: 'static>(e_true: Event<T>, e_false: Event<T>) -> Event<(bool, T)> {
    Event::choice(vec![e_true.map(|v| (true, v)), e_false.map(|v| (false, v))])
}

/// `choice` with a user-supplied function applied to the winning branch's
/// index and value (spec §4.3.1 "race").
pub fn race<T: 'static, U: 'static>(
    events: Vec<Event<T>>,
    picker: impl Fn(usize, T) -> U + 'static,
) -> Event<U> {
    let picker = Rc::new(picker);
    let mapped = events
        .into_iter()
        .enumerate()
        .map(|(i, e)| {
            let picker = picker.clone();
            e.map(move |v| picker(i, v))
        })
        .collect();
    Event::choice(mapped)
}

/// Acquires a resource, performs `use_fn`'s event with it, and guarantees
/// `release` runs exactly once — on normal commit, or via `with_nack` if the
/// `use_fn` branch loses to a sibling in an enclosing `choice` (spec §4.3.1
/// "bracket"). `use_fn` receives the resource behind an `Rc` since the
/// winning branch is decided at runtime and `release` must still be able to
/// reach it afterwards.
pub fn bracket<R: 'static, T: 'static>(
    acquire: impl FnOnce() -> R + 'static,
    release: impl Fn(&Rc<R>, bool) + 'static,
    use_fn: impl FnOnce(Rc<R>) -> Event<T> + 'static,
) -> Event<T> {
    Event::guard(move || {
        let resource = Rc::new(acquire());
        let release = Rc::new(release);

        let committed = {
            let resource = resource.clone();
            let release = release.clone();
            use_fn(resource.clone()).map(move |v| {
                release(&resource, false);
                v
            })
        };

        Event::with_nack(move |nack| {
            let resource = resource.clone();
            let release = release.clone();
            nack.add_waiter(Box::new(move |()| release(&resource, true)));
            committed
        })
    })
}

// ---------------------------------------------------------------------
// Negotiation engine
// ---------------------------------------------------------------------

struct FlatBranch<T> {
    try_fn: TryFn<T>,
    block_fn: BlockFn<T>,
    nack_ids: Vec<u64>,
}

#[derive(Default)]
struct FlattenCtx {
    next_nack_id: Cell<u64>,
    nacks: RefCell<Vec<(u64, Signaller<()>)>>,
}

fn flatten<T: 'static>(event: Event<T>, enclosing: &[u64], ctx: &FlattenCtx, out: &mut Vec<FlatBranch<T>>) {
    match event.0 {
        Kind::Base(Base { try_fn, block_fn }) => out.push(FlatBranch {
            try_fn,
            block_fn,
            nack_ids: enclosing.to_vec(),
        }),
        Kind::Choice(events) => {
            for e in events {
                flatten(e, enclosing, ctx, out);
            }
        }
        Kind::Guard(thunk) => flatten(thunk(), enclosing, ctx, out),
        Kind::WithNack(ctor) => {
            let id = ctx.next_nack_id.get();
            ctx.next_nack_id.set(id + 1);
            let (signaller, nack) = oneshot::channel::<()>();
            ctx.nacks.borrow_mut().push((id, signaller));
            let mut child_enclosing = enclosing.to_vec();
            child_enclosing.push(id);
            let body = ctor(nack);
            flatten(body, &child_enclosing, ctx, out);
        }
    }
}

fn fire_nacks(nacks: &[(u64, Signaller<()>)], winner_nack_ids: &[u64]) {
    for (id, signaller) in nacks {
        if !winner_nack_ids.contains(id) {
            signaller.signal(());
        }
    }
}

struct Shared<T> {
    claimed: Cell<bool>,
    result: RefCell<Option<T>>,
    unlinks: RefCell<Vec<Unlink>>,
    waker: RefCell<Option<Waker>>,
}

enum PerformState<T> {
    Init(Event<T>),
    Pending(Rc<Shared<T>>),
    Done,
}

/// The future returned by [`crate::fiber::Fiber::perform`]. Polling it for
/// the first time runs Phase A (speculative try) and, failing that, Phase B
/// (block/register); later polls just check whether a branch has won yet.
pub struct Perform<T> {
    state: PerformState<T>,
}

impl<T> Perform<T> {
    pub(crate) fn new(event: Event<T>) -> Self {
        Perform {
            state: PerformState::Init(event),
        }
    }
}

impl<T> Unpin for Perform<T> {}

impl<T: 'static> Future for Perform<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, PerformState::Done) {
            PerformState::Init(event) => {
                let ctx = FlattenCtx::default();
                let mut branches = Vec::new();
                flatten(event, &[], &ctx, &mut branches);

                // Phase A: try branches left-to-right, stop at first commit.
                let mut remaining = Vec::with_capacity(branches.len());
                let mut winner = None;
                let mut branches_iter = branches.into_iter();
                for branch in branches_iter.by_ref() {
                    match (branch.try_fn)() {
                        TryOutcome::Committed(v) => {
                            winner = Some((v, branch.nack_ids));
                            break;
                        }
                        TryOutcome::WouldBlock => remaining.push(branch),
                    }
                }

                let nacks = ctx.nacks.into_inner();
                if let Some((v, nack_ids)) = winner {
                    log::trace!(target: "fibra::event", "perform committed in phase A");
                    fire_nacks(&nacks, &nack_ids);
                    return Poll::Ready(v);
                }

                // Phase B: register every branch, none of which committed.
                let shared = Rc::new(Shared {
                    claimed: Cell::new(false),
                    result: RefCell::new(None),
                    unlinks: RefCell::new(Vec::new()),
                    waker: RefCell::new(Some(cx.waker().clone())),
                });
                let nacks = Rc::new(nacks);

                for branch in remaining {
                    let shared = shared.clone();
                    let nacks = nacks.clone();
                    let nack_ids = branch.nack_ids;
                    let wake: WakeFn<T> = Rc::new(move |v: T| {
                        if shared.claimed.replace(true) {
                            return; // Phase C: a concurrent wake already won; no-op.
                        }
                        *shared.result.borrow_mut() = Some(v);
                        for unlink in shared.unlinks.borrow_mut().drain(..) {
                            unlink();
                        }
                        fire_nacks(&nacks, &nack_ids);
                        if let Some(waker) = shared.waker.borrow_mut().take() {
                            waker.wake();
                        }
                    });
                    let unlink = (branch.block_fn)(wake);
                    shared.unlinks.borrow_mut().push(unlink);
                }

                this.state = PerformState::Pending(shared);
                Poll::Pending
            }
            PerformState::Pending(shared) => {
                if let Some(v) = shared.result.borrow_mut().take() {
                    Poll::Ready(v)
                } else {
                    *shared.waker.borrow_mut() = Some(cx.waker().clone());
                    this.state = PerformState::Pending(shared);
                    Poll::Pending
                }
            }
            PerformState::Done => panic!("Perform polled after completion"),
        }
    }
}

/// Attempts `event`'s speculative (Phase A) pass only, without ever
/// blocking. Returns `None` if no branch was immediately ready, in which
/// case every `with_nack` enclosing a losing branch has already fired,
/// exactly as it would have after a losing blocked perform (spec's
/// "try_perform" variant — useful for a fiber that wants to poll an event
/// without suspending).
pub(crate) fn try_once<T: 'static>(event: Event<T>) -> Option<T> {
    let ctx = FlattenCtx::default();
    let mut branches = Vec::new();
    flatten(event, &[], &ctx, &mut branches);

    let mut winner = None;
    for branch in branches {
        if let TryOutcome::Committed(v) = (branch.try_fn)() {
            winner = Some((v, branch.nack_ids));
            break;
        }
    }

    let nacks = ctx.nacks.into_inner();
    match winner {
        Some((v, nack_ids)) => {
            fire_nacks(&nacks, &nack_ids);
            Some(v)
        }
        None => None,
    }
}

impl<T> Drop for Perform<T> {
    fn drop(&mut self) {
        if let PerformState::Pending(shared) = &self.state {
            if !shared.claimed.replace(true) {
                for unlink in shared.unlinks.borrow_mut().drain(..) {
                    unlink();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::waitset::Waitset;
    use std::cell::Cell;
    use std::time::Duration;

    fn committed_event(v: i32) -> Event<i32> {
        Event::base(move || TryOutcome::Committed(v), |_wake| Box::new(|| {}))
    }

    fn blocking_event(ws: Rc<RefCell<Waitset<&'static str>>>, key: &'static str, v: i32) -> Event<i32> {
        Event::base(
            || TryOutcome::WouldBlock,
            move |wake| {
                let token = ws.borrow_mut().add(key, Box::new(move || wake(v)));
                let ws = ws.clone();
                Box::new(move || {
                    ws.borrow_mut().unlink(token);
                })
            },
        )
    }

    #[test]
    fn always_commits_in_phase_a() {
        let sched = Scheduler::new();
        let scope = crate::scope::Scope::root(sched.clone());
        let seen = Rc::new(Cell::new(None));
        let s = seen.clone();
        scope
            .spawn(move |fiber| async move {
                let v = fiber.perform(Event::always(42)).await;
                s.set(Some(v));
                Ok(())
            })
            .unwrap();
        sched.run_once();
        assert_eq!(seen.get(), Some(42));
    }

    #[test]
    fn choice_commits_to_exactly_one_branch() {
        let sched = Scheduler::new();
        let scope = crate::scope::Scope::root(sched.clone());
        let seen = Rc::new(Cell::new(None));
        let s = seen.clone();
        scope
            .spawn(move |fiber| async move {
                let v = fiber
                    .perform(Event::choice(vec![committed_event(1), committed_event(2)]))
                    .await;
                s.set(Some(v));
                Ok(())
            })
            .unwrap();
        sched.run_once();
        assert_eq!(seen.get(), Some(1));
    }

    #[test]
    fn blocked_branch_wakes_on_notify_and_unlinks_sibling() {
        let sched = Scheduler::new();
        let scope = crate::scope::Scope::root(sched.clone());
        let ws: Rc<RefCell<Waitset<&'static str>>> = Rc::new(RefCell::new(Waitset::new()));
        let seen = Rc::new(Cell::new(None));
        let s = seen.clone();
        let ws1 = ws.clone();
        let ws2 = ws.clone();
        scope
            .spawn(move |fiber| async move {
                let v = fiber
                    .perform(Event::choice(vec![
                        blocking_event(ws1.clone(), "a", 10),
                        blocking_event(ws2.clone(), "b", 20),
                    ]))
                    .await;
                s.set(Some(v));
                Ok(())
            })
            .unwrap();
        sched.run_once();
        assert_eq!(seen.get(), None);
        assert_eq!(ws.borrow().count_live_waiters(&"a"), 1);
        assert_eq!(ws.borrow().count_live_waiters(&"b"), 1);

        ws.borrow_mut().notify_one(&"a");
        assert_eq!(seen.get(), None, "wake only marks ready, doesn't run inline");
        sched.run_once();
        assert_eq!(seen.get(), Some(10));
        assert_eq!(ws.borrow().count_live_waiters(&"b"), 0);
    }

    #[test]
    fn map_transforms_the_committed_value() {
        let sched = Scheduler::new();
        let scope = crate::scope::Scope::root(sched.clone());
        let seen = Rc::new(Cell::new(None));
        let s = seen.clone();
        scope
            .spawn(move |fiber| async move {
                let v = fiber.perform(committed_event(7).map(|x| x * 10)).await;
                s.set(Some(v));
                Ok(())
            })
            .unwrap();
        sched.run_once();
        assert_eq!(seen.get(), Some(70));
    }

    #[test]
    fn with_nack_signals_when_the_body_loses() {
        let sched = Scheduler::new();
        let scope = crate::scope::Scope::root(sched.clone());
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        scope
            .spawn(move |fiber| async move {
                let body = Event::with_nack(move |nack| {
                    nack.add_waiter(Box::new(move |()| f.set(true)));
                    Event::never()
                });
                let _v: i32 = fiber.perform(Event::choice(vec![body, committed_event(1)])).await;
                Ok(())
            })
            .unwrap();
        sched.run_once();
        assert!(fired.get());
    }

    #[test]
    fn with_nack_does_not_signal_when_the_body_wins() {
        let sched = Scheduler::new();
        let scope = crate::scope::Scope::root(sched.clone());
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        scope
            .spawn(move |fiber| async move {
                let body = Event::with_nack(move |nack| {
                    nack.add_waiter(Box::new(move |()| f.set(true)));
                    committed_event(9)
                });
                let v = fiber.perform(Event::choice(vec![body, Event::never()])).await;
                assert_eq!(v, 9);
                Ok(())
            })
            .unwrap();
        sched.run_once();
        assert!(!fired.get());
    }

    #[test]
    fn bracket_releases_exactly_once_on_commit() {
        let sched = Scheduler::new();
        let scope = crate::scope::Scope::root(sched.clone());
        let released = Rc::new(Cell::new(0));
        let r = released.clone();
        scope
            .spawn(move |fiber| async move {
                let ev = bracket(
                    || 5,
                    move |_res, _aborted| r.set(r.get() + 1),
                    |res| committed_event(*res),
                );
                let v = fiber.perform(ev).await;
                assert_eq!(v, 5);
                Ok(())
            })
            .unwrap();
        sched.run_once();
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn named_choice_reports_the_winning_name() {
        let sched = Scheduler::new();
        let scope = crate::scope::Scope::root(sched.clone());
        let seen = Rc::new(Cell::new(None));
        let s = seen.clone();
        scope
            .spawn(move |fiber| async move {
                let ev = named_choice(vec![
                    ("value".to_string(), Event::never()),
                    ("timeout".to_string(), committed_event(0)),
                ]);
                let (name, _v) = fiber.perform(ev).await;
                s.set(Some(name));
                Ok(())
            })
            .unwrap();
        sched.run_once();
        assert_eq!(seen.take(), Some("timeout".to_string()));
    }

    #[test]
    fn round_trips_a_timer_race() {
        use crate::sleep::sleep_op;
        let sched = Scheduler::new();
        let scope = crate::scope::Scope::root(sched.clone());
        let seen = Rc::new(Cell::new(None));
        let s = seen.clone();
        let sched_for_body = sched.clone();
        scope
            .spawn(move |fiber| async move {
                let winner = fiber
                    .perform(Event::choice(vec![
                        sleep_op(&sched_for_body, Duration::from_millis(50)).map(|()| "slow"),
                        sleep_op(&sched_for_body, Duration::from_millis(5)).map(|()| "fast"),
                    ]))
                    .await;
                s.set(Some(winner));
                Ok(())
            })
            .unwrap();
        sched.main();
        sched.stop();
        assert_eq!(seen.get(), Some("fast"));
    }
}
