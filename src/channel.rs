//! [`Channel`]: a CML-style synchronous channel (spec §4.5), exposing its
//! send/receive sides as first-class [`Event`]s rather than blocking calls.
//!
//! Grounded on the teacher's `fiber::channel::{Sender, Receiver}` handle
//! pair — a shared `Rc<Channel<T>>` with independent send/receive
//! operations — but reworked from a libc-backed bounded mailbox into a pure
//! event-algebra primitive: with zero capacity it is a true rendezvous (a
//! `put_op` only commits once paired with a waiting `get_op`), and with
//! nonzero capacity a value may sit in the internal buffer between the two.

use std::collections::VecDeque;
use std::cell::RefCell;
use std::rc::Rc;

use crate::event::{Event, TryOutcome};

struct GetWaiter<T> {
    id: u64,
    wake: crate::event::WakeFn<T>,
}

struct PutWaiter<T> {
    id: u64,
    value: RefCell<Option<T>>,
    wake: crate::event::WakeFn<()>,
}

struct Inner<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    pending_gets: VecDeque<GetWaiter<T>>,
    pending_puts: VecDeque<PutWaiter<T>>,
    next_id: u64,
}

/// A shared channel handle. Cheaply cloneable; every clone refers to the
/// same underlying buffer and waiter queues.
pub struct Channel<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Channel<T> {
    /// A rendezvous channel: `put_op` cannot commit until a `get_op` is
    /// ready to receive it, and vice versa.
    pub fn rendezvous() -> Self {
        Self::with_capacity(0)
    }

    /// A channel with an internal buffer of `capacity` slots: `put_op` can
    /// commit immediately while the buffer has room, independent of whether
    /// a receiver is waiting.
    pub fn with_capacity(capacity: usize) -> Self {
        Channel {
            inner: Rc::new(RefCell::new(Inner {
                capacity,
                buffer: VecDeque::new(),
                pending_gets: VecDeque::new(),
                pending_puts: VecDeque::new(),
                next_id: 0,
            })),
        }
    }

    fn next_id(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    /// After taking a value out of the buffer, pull the oldest pending put
    /// (if any) into the freed slot and return its sender's `wake` so the
    /// caller can invoke it once *its own* borrow of `Inner` is released.
    /// Must not call `wake` itself: the sender's unlink hook (registered by
    /// `put_op`'s `block`) takes `chan.inner.borrow_mut()` too, and since
    /// `wake` is called inline on the same stack as a live borrow here, a
    /// second mutable borrow would panic.
    fn admit_one_put(inner: &mut Inner<T>) -> Option<crate::event::WakeFn<()>> {
        while let Some(putter) = inner.pending_puts.pop_front() {
            if let Some(v) = putter.value.borrow_mut().take() {
                inner.buffer.push_back(v);
                return Some(putter.wake);
            }
        }
        None
    }

    /// An event that commits with the next value sent on this channel.
    pub fn get_op(&self) -> Event<T> {
        let chan = self.clone();
        Event::base(
            {
                let chan = chan.clone();
                move || {
                    let mut inner = chan.inner.borrow_mut();
                    if let Some(v) = inner.buffer.pop_front() {
                        let wake = Channel::admit_one_put(&mut inner);
                        drop(inner);
                        if let Some(wake) = wake {
                            wake(());
                        }
                        return TryOutcome::Committed(v);
                    }
                    while let Some(putter) = inner.pending_puts.pop_front() {
                        if let Some(v) = putter.value.borrow_mut().take() {
                            drop(inner);
                            (putter.wake)(());
                            return TryOutcome::Committed(v);
                        }
                    }
                    TryOutcome::WouldBlock
                }
            },
            move |wake| {
                let id = chan.next_id();
                chan.inner.borrow_mut().pending_gets.push_back(GetWaiter { id, wake });
                let chan = chan.clone();
                Box::new(move || {
                    let mut inner = chan.inner.borrow_mut();
                    if let Some(pos) = inner.pending_gets.iter().position(|g| g.id == id) {
                        inner.pending_gets.remove(pos);
                    }
                })
            },
        )
    }

    /// An event that commits with `()` once `value` has been accepted by
    /// the channel, either straight into a waiting `get_op` or into the
    /// internal buffer.
    pub fn put_op(&self, value: T) -> Event<()> {
        let chan = self.clone();
        let value = Rc::new(RefCell::new(Some(value)));
        Event::base(
            {
                let chan = chan.clone();
                let value = value.clone();
                move || {
                    let mut inner = chan.inner.borrow_mut();
                    while let Some(getter) = inner.pending_gets.pop_front() {
                        if let Some(v) = value.borrow_mut().take() {
                            drop(inner);
                            (getter.wake)(v);
                            return TryOutcome::Committed(());
                        } else {
                            unreachable!("put_op try_fn invoked more than once");
                        }
                    }
                    if inner.buffer.len() < inner.capacity {
                        if let Some(v) = value.borrow_mut().take() {
                            inner.buffer.push_back(v);
                            return TryOutcome::Committed(());
                        }
                    }
                    TryOutcome::WouldBlock
                }
            },
            move |wake| {
                let id = chan.next_id();
                let v = value.borrow_mut().take();
                chan.inner.borrow_mut().pending_puts.push_back(PutWaiter {
                    id,
                    value: RefCell::new(v),
                    wake,
                });
                let chan = chan.clone();
                Box::new(move || {
                    let mut inner = chan.inner.borrow_mut();
                    if let Some(pos) = inner.pending_puts.iter().position(|p| p.id == id) {
                        inner.pending_puts.remove(pos);
                    }
                })
            },
        )
    }

    /// The number of values currently buffered (not counting values
    /// pending on a blocked `put_op` waiting for capacity or a receiver).
    pub fn len(&self) -> usize {
        self.inner.borrow().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
