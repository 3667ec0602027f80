//! The `WaitQueue` used directly by application code (`sleep`/`wake`) and
//! by a thread's own join queue. Mutex, semaphore and message-queue waiters
//! are gated the same way but need to recheck their own extra condition
//! (lock owner, count, fill level) atomically alongside the ticket order,
//! so those embed [`crate::gate::Fifo`] next to their own state directly
//! instead of going through this type.

use std::sync::{Condvar, Mutex};

struct Inner {
    next_ticket: u64,
    released_through: u64,
    waiting: usize,
}

/// A FIFO queue of parked threads. `park` blocks the caller until a
/// `wake_one`/`wake_all` call releases it; release order matches arrival
/// order.
pub struct WaitQueue {
    state: Mutex<Inner>,
    cv: Condvar,
}

impl WaitQueue {
    pub const fn new() -> Self {
        WaitQueue {
            state: Mutex::new(Inner { next_ticket: 0, released_through: 0, waiting: 0 }),
            cv: Condvar::new(),
        }
    }

    /// Parks the calling thread until released.
    pub fn park(&self) {
        let mut g = self.state.lock().unwrap();
        let ticket = g.next_ticket;
        g.next_ticket += 1;
        g.waiting += 1;
        g = self.cv.wait_while(g, |i| ticket >= i.released_through).unwrap();
        g.waiting -= 1;
    }

    /// Releases the longest-waiting still-parked thread, if any.
    pub fn wake_one(&self) {
        let mut g = self.state.lock().unwrap();
        if g.released_through < g.next_ticket {
            g.released_through += 1;
        }
        drop(g);
        self.cv.notify_all();
    }

    /// Releases every currently parked thread.
    pub fn wake_all(&self) {
        let mut g = self.state.lock().unwrap();
        g.released_through = g.next_ticket;
        drop(g);
        self.cv.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().waiting
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
