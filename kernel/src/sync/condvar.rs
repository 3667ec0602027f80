//! Condition variable paired with [`super::mutex::Mutex`].
//!
//! `wait` must release the caller's mutex and park atomically with respect
//! to `signal`/`broadcast`, or a wakeup between the unlock and the park is
//! lost. The internal state lock is held across the call to
//! [`Mutex::unlock`] and into [`std::sync::Condvar::wait_while`] (which
//! itself releases that lock only once the calling thread is registered to
//! be woken), which is what gives the two steps their atomicity; a signal
//! cannot touch `next_ticket`/`released_through` until it is held.

use std::sync::Condvar as StdCondvar;
use std::sync::Mutex as StdMutex;

use super::mutex::{Holder, Mutex};

struct Inner {
    next_ticket: u64,
    released_through: u64,
    waiting: usize,
}

pub struct Condvar {
    state: StdMutex<Inner>,
    cv: StdCondvar,
}

impl Condvar {
    pub fn new() -> Condvar {
        Condvar {
            state: StdMutex::new(Inner { next_ticket: 0, released_through: 0, waiting: 0 }),
            cv: StdCondvar::new(),
        }
    }

    /// Releases `mx` and parks the caller, in arrival order, until a
    /// matching `signal`/`broadcast`; reacquires `mx` before returning.
    pub fn wait(&self, mx: &Mutex, me: Holder) {
        let mut g = self.state.lock().unwrap();
        let ticket = g.next_ticket;
        g.next_ticket = g.next_ticket.wrapping_add(1);
        g.waiting += 1;
        mx.unlock(me);
        g = self.cv.wait_while(g, |i| ticket >= i.released_through).unwrap();
        g.waiting -= 1;
        drop(g);
        mx.lock(me);
    }

    /// Wakes the longest-waiting parked thread, if any.
    pub fn signal(&self) {
        let mut g = self.state.lock().unwrap();
        if g.released_through < g.next_ticket {
            g.released_through += 1;
        }
        drop(g);
        self.cv.notify_all();
    }

    /// Wakes every currently parked thread.
    pub fn broadcast(&self) {
        let mut g = self.state.lock().unwrap();
        g.released_through = g.next_ticket;
        drop(g);
        self.cv.notify_all();
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().unwrap().waiting
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn holder(id: u64) -> Holder {
        Holder { id, priority: 16 }
    }

    #[test]
    fn wait_blocks_until_signal_and_reacquires_mutex() {
        let mx = Arc::new(Mutex::new());
        let cv = Arc::new(Condvar::new());
        let ready = Arc::new(StdMutex::new(false));

        let me = holder(1);
        mx.lock(me);

        let mx2 = mx.clone();
        let cv2 = cv.clone();
        let ready2 = ready.clone();
        let handle = std::thread::spawn(move || {
            let waiter = holder(2);
            mx2.lock(waiter);
            cv2.wait(&mx2, waiter);
            *ready2.lock().unwrap() = true;
            mx2.unlock(waiter);
        });

        // The waiter can only have reached `cv.wait` by releasing `mx`, so
        // this lock recursion proves the release actually happened.
        std::thread::sleep(Duration::from_millis(30));
        mx.lock(me);
        mx.unlock(me);
        mx.unlock(me);

        cv.signal();
        handle.join().unwrap();
        assert!(*ready.lock().unwrap());
    }

    #[test]
    fn broadcast_releases_every_waiter() {
        let mx = Arc::new(Mutex::new());
        let cv = Arc::new(Condvar::new());

        let mut handles = Vec::new();
        for i in 0..4u64 {
            let mx = mx.clone();
            let cv = cv.clone();
            handles.push(std::thread::spawn(move || {
                let me = holder(10 + i);
                mx.lock(me);
                cv.wait(&mx, me);
                mx.unlock(me);
            }));
        }
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cv.waiting(), 4);
        cv.broadcast();
        for h in handles {
            h.join().unwrap();
        }
    }
}
