//! # Wait Queues
//!
//! Prepare-to-wait / wake-all bookkeeping embedded in a shard.
//!
//! A [`WaitQueue`] has no lock of its own: it lives inside a shard and is
//! mutated under that shard's lock. A waiter enqueues its waker before it
//! drops the lock and sleeps, so a wake issued by the next holder of the
//! lock always finds it. Wakers are invoked only after the lock has been
//! released.

use alloc::vec::Vec;
use core::task::Waker;

/// Ticket identifying one enqueued waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTicket(u64);

/// Waiters blocked on state guarded by the enclosing lock
#[derive(Debug, Default)]
pub struct WaitQueue {
    next: u64,
    waiters: Vec<(u64, Waker)>,
}

impl WaitQueue {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            next: 0,
            waiters: Vec::new(),
        }
    }

    /// Enqueue `waker` and return the ticket that removes it again
    pub fn prepare(&mut self, waker: Waker) -> WaitTicket {
        let ticket = self.next;
        self.next = self.next.wrapping_add(1);
        self.waiters.push((ticket, waker));
        WaitTicket(ticket)
    }

    /// Remove a waiter; a no-op if it was already taken by a wake
    pub fn cancel(&mut self, ticket: WaitTicket) {
        self.waiters.retain(|(t, _)| *t != ticket.0);
    }

    /// Detach every waiter so they can be woken once the lock is dropped
    pub fn take_all(&mut self) -> Vec<Waker> {
        self.waiters.drain(..).map(|(_, waker)| waker).collect()
    }

    /// Number of enqueued waiters
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Check if no one is waiting
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Wake every waker in `wakers`
#[inline]
pub fn wake_all(wakers: Vec<Waker>) {
    for waker in wakers {
        waker.wake();
    }
}
