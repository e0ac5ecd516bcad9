//! A generic keyed multimap of waiters, used by primitives (condition,
//! oneshot bookkeeping, and anything exposing `count_live_waiters` for
//! tests) that don't need a specialized FIFO of their own the way
//! [`crate::channel::Channel`] does.
//!
//! Grounded on the teacher's `fiber::Cond` wait-queue (one condition, many
//! waiting fibers) generalized to an arbitrary key type `K`, in the spirit
//! of the Uringy example's slab-indexed waiter registries.

use slab::Slab;
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;

/// A callback invoked exactly once when a waiter is woken.
type Waker = Box<dyn FnOnce()>;

/// An idempotent handle to a registered waiter. A key's backing slab is torn
/// down and rebuilt once it drains to empty (to avoid unbounded growth for
/// keys that are waited on once and never again); the token therefore
/// carries a per-insertion id rather than a bare slot index so that
/// unlinking a stale token can never remove an unrelated, later waiter that
/// happens to reuse the same slot.
pub struct WaitToken<K> {
    key: K,
    slot: usize,
    id: u64,
}

struct Entry {
    id: u64,
    waker: Waker,
}

/// A multimap from key `K` to a FIFO of pending wakers.
pub struct Waitset<K: Eq + Hash + Clone> {
    waiters: HashMap<K, Slab<Entry>>,
    next_id: u64,
}

impl<K: Eq + Hash + Clone> Default for Waitset<K> {
    fn default() -> Self {
        Self {
            waiters: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<K: Eq + Hash + Clone> Waitset<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `waker` to be called the next time `key` is notified.
    /// Returns a token that can be used to unregister it early.
    pub fn add(&mut self, key: K, waker: Waker) -> WaitToken<K> {
        let id = self.next_id;
        self.next_id += 1;
        let slot = self
            .waiters
            .entry(key.clone())
            .or_insert_with(Slab::new)
            .insert(Entry { id, waker });
        WaitToken { key, slot, id }
    }

    /// Removes a registered waiter without calling it. Idempotent: unlinking
    /// twice, unlinking after the waiter already fired, or unlinking a
    /// token whose slot has since been recycled for an unrelated waiter, are
    /// all safe no-ops.
    ///
    /// Returns whether this call removed `key`'s last live waiter (spec §3:
    /// "unlinking the last waiter for a key reports that fact so lower
    /// layers may drop their subscription", e.g. a poller issuing
    /// `EPOLL_CTL_DEL`). `false` both when nothing else is registered for
    /// `key` to begin with and when other waiters remain after this one is
    /// removed.
    pub fn unlink(&mut self, token: WaitToken<K>) -> bool {
        if let Some(slab) = self.waiters.get_mut(&token.key) {
            if slab.get(token.slot).is_some_and(|e| e.id == token.id) {
                slab.remove(token.slot);
                let now_empty = slab.is_empty();
                if now_empty {
                    self.waiters.remove(&token.key);
                }
                return now_empty;
            }
        }
        false
    }

    /// Wakes and removes exactly the oldest-registered waiter for `key`, if
    /// any.
    ///
    /// Returns whether this call woke `key`'s last live waiter, leaving no
    /// subscription behind (same "report on drain" contract as
    /// [`Self::unlink`]). `false` if `key` had no waiter to wake, or if
    /// other waiters remain registered for it afterwards.
    pub fn notify_one(&mut self, key: &K) -> bool {
        if let Some(slab) = self.waiters.get_mut(key) {
            if let Some((slot, _)) = slab.iter().min_by_key(|(_, e)| e.id) {
                let entry = slab.remove(slot);
                let now_empty = slab.is_empty();
                if now_empty {
                    self.waiters.remove(key);
                }
                (entry.waker)();
                return now_empty;
            }
        }
        false
    }

    /// Wakes and removes every waiter registered for `key`, oldest first.
    ///
    /// Returns whether `key` had any live waiters to drain. Always `true` on
    /// a key that was the last reference to any registration the lower
    /// layer holds on the corresponding resource, since every waiter is
    /// removed unconditionally; `false` only if `key` was already empty.
    pub fn notify_all(&mut self, key: &K) -> bool {
        if let Some(slab) = self.waiters.remove(key) {
            let mut entries: Vec<Entry> = slab.into_iter().map(|(_, e)| e).collect();
            entries.sort_by_key(|e| e.id);
            let drained_any = !entries.is_empty();
            for entry in entries {
                (entry.waker)();
            }
            drained_any
        } else {
            false
        }
    }

    /// The number of live (not yet woken, not unlinked) waiters for `key`.
    /// Used by tests to assert property 2 (unregister-on-win).
    pub fn count_live_waiters(&self, key: &K) -> usize {
        self.waiters.get(key).map_or(0, Slab::len)
    }

    pub fn is_empty_for(&self, key: &K) -> bool {
        self.count_live_waiters(key) == 0
    }
}

/// A shareable waitset, for the common case of a waitset embedded in
/// several `Rc`-cloned handles (e.g. a [`crate::condition::Condition`]).
pub type SharedWaitset<K> = Rc<std::cell::RefCell<Waitset<K>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn notify_one_wakes_oldest_first() {
        let mut ws: Waitset<&'static str> = Waitset::new();
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let o1 = order.clone();
        ws.add("k", Box::new(move || o1.borrow_mut().push(1)));
        let o2 = order.clone();
        ws.add("k", Box::new(move || o2.borrow_mut().push(2)));

        ws.notify_one(&"k");
        assert_eq!(*order.borrow(), vec![1]);
        ws.notify_one(&"k");
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn unlink_is_idempotent_and_leaves_no_ghost() {
        let mut ws: Waitset<&'static str> = Waitset::new();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let token = ws.add("k", Box::new(move || f.set(true)));
        ws.unlink(token);
        assert_eq!(ws.count_live_waiters(&"k"), 0);
        assert!(!ws.notify_one(&"k"));
        assert!(!fired.get());
    }

    #[test]
    fn notify_all_wakes_every_registered_waiter() {
        let mut ws: Waitset<&'static str> = Waitset::new();
        let count = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let c = count.clone();
            ws.add("k", Box::new(move || c.set(c.get() + 1)));
        }
        ws.notify_all(&"k");
        assert_eq!(count.get(), 3);
        assert_eq!(ws.count_live_waiters(&"k"), 0);
    }

    #[test]
    fn stale_token_does_not_unlink_a_reused_slot() {
        let mut ws: Waitset<&'static str> = Waitset::new();
        let fired = Rc::new(Cell::new(false));
        let stale = ws.add("k", Box::new(|| ()));
        ws.notify_one(&"k"); // drains the key's slab entirely
        let f = fired.clone();
        ws.add("k", Box::new(move || f.set(true)));
        ws.unlink(stale); // must not remove the new, unrelated waiter
        assert_eq!(ws.count_live_waiters(&"k"), 1);
        ws.notify_one(&"k");
        assert!(fired.get());
    }
}
