//! Counting semaphore.

use std::sync::{Condvar, Mutex};

use crate::gate::Fifo;

struct State {
    count: i64,
    gate: Fifo,
}

pub struct Semaphore {
    state: Mutex<State>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(count: i64) -> Semaphore {
        Semaphore { state: Mutex::new(State { count, gate: Fifo::new() }), cv: Condvar::new() }
    }

    /// Decrements the count, blocking while it is `0`. Waiters are served
    /// in arrival order.
    pub fn wait(&self) {
        let mut s = self.state.lock().unwrap();
        let ticket = s.gate.take_ticket();
        s = self.cv.wait_while(s, |s| !(s.gate.is_front(ticket) && s.count > 0)).unwrap();
        s.count -= 1;
        s.gate.advance();
        drop(s);
        self.cv.notify_all();
    }

    /// Non-blocking `wait`: decrements and returns `true` if the count is
    /// positive and there is nobody ahead in line, otherwise returns
    /// `false` and leaves the count untouched.
    pub fn try_wait(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.gate.len() == 0 && s.count > 0 {
            s.count -= 1;
            true
        } else {
            false
        }
    }

    /// Increments the count and wakes one waiter.
    pub fn signal(&self) {
        let mut s = self.state.lock().unwrap();
        s.count += 1;
        drop(s);
        self.cv.notify_all();
    }

    pub fn count(&self) -> i64 {
        self.state.lock().unwrap().count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn try_wait_fails_at_zero() {
        let s = Semaphore::new(0);
        assert!(!s.try_wait());
        s.signal();
        assert!(s.try_wait());
        assert!(!s.try_wait());
    }

    #[test]
    fn wait_blocks_until_signal() {
        let sem = Arc::new(Semaphore::new(0));
        let s2 = sem.clone();
        let handle = std::thread::spawn(move || {
            s2.wait();
        });
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(sem.count(), 0);
        sem.signal();
        handle.join().unwrap();
    }

    #[test]
    fn count_reflects_pending_signals() {
        let s = Semaphore::new(1);
        assert_eq!(s.count(), 1);
        s.signal();
        assert_eq!(s.count(), 2);
    }
}
