//! Recursive mutex with a priority-inheritance contract.
//!
//! `lock`/`unlock` take a [`Holder`], an opaque identity plus the calling
//! thread's priority, rather than reaching into the thread runtime
//! directly, so this module has no dependency on [`crate::thread`]; the
//! thread runtime is the one that asks a held [`Mutex`] for its
//! [`Mutex::ceiling`] when it computes a thread's effective priority.

use std::sync::Condvar;
use std::sync::Mutex as StdMutex;

use crate::gate::Fifo;

/// Identifies a logical thread to a [`Mutex`]: enough to recognize
/// re-entrant locking by the owner and to track which priority a blocked
/// waiter should lend the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Holder {
    pub id: u64,
    pub priority: u8,
}

struct State {
    owner: Option<Holder>,
    recursion: u32,
    gate: Fifo,
    waiter_priorities: Vec<u8>,
}

pub struct Mutex {
    state: StdMutex<State>,
    cv: Condvar,
}

impl Mutex {
    pub fn new() -> Mutex {
        Mutex {
            state: StdMutex::new(State {
                owner: None,
                recursion: 0,
                gate: Fifo::new(),
                waiter_priorities: Vec::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// Locks the mutex. Re-locking by the current owner increments the
    /// recursion counter instead of blocking. A blocked waiter's priority
    /// is recorded in [`Self::ceiling`] for as long as it is waiting.
    pub fn lock(&self, me: Holder) {
        let mut s = self.state.lock().unwrap();
        if s.owner == Some(me) {
            s.recursion += 1;
            return;
        }
        if s.owner.is_none() {
            s.owner = Some(me);
            s.recursion = 1;
            return;
        }
        let ticket = s.gate.take_ticket();
        s.waiter_priorities.push(me.priority);
        s = self.cv.wait_while(s, |s| !(s.gate.is_front(ticket) && s.owner.is_none())).unwrap();
        s.owner = Some(me);
        s.recursion = 1;
        s.gate.advance();
        remove_one(&mut s.waiter_priorities, me.priority);
    }

    /// Non-blocking `lock`.
    pub fn try_lock(&self, me: Holder) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.owner == Some(me) {
            s.recursion += 1;
            return true;
        }
        if s.owner.is_none() {
            s.owner = Some(me);
            s.recursion = 1;
            return true;
        }
        false
    }

    /// Drops the recursion count; at zero, releases the mutex and wakes
    /// one waiter.
    ///
    /// # Panics
    /// If `me` is not the current owner. Unlocking a mutex you do not
    /// hold is a programmer error.
    pub fn unlock(&self, me: Holder) {
        let mut s = self.state.lock().unwrap();
        if s.owner != Some(me) {
            crate::kpanic!("mutex unlock by non-owner");
        }
        s.recursion -= 1;
        if s.recursion == 0 {
            s.owner = None;
        }
        drop(s);
        self.cv.notify_all();
    }

    pub fn owner(&self) -> Option<Holder> {
        self.state.lock().unwrap().owner
    }

    /// The numerically lowest (highest-urgency) priority among threads
    /// currently blocked on this mutex, if any. The thread runtime reads
    /// this to compute a holding thread's effective, inherited priority.
    pub fn ceiling(&self) -> Option<u8> {
        self.state.lock().unwrap().waiter_priorities.iter().copied().min()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_one(v: &mut Vec<u8>, value: u8) {
    if let Some(pos) = v.iter().position(|&p| p == value) {
        v.remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn holder(id: u64, priority: u8) -> Holder {
        Holder { id, priority }
    }

    #[test]
    fn recursive_lock_unlock_releases_at_zero() {
        let m = Mutex::new();
        let me = holder(1, 16);
        m.lock(me);
        m.lock(me);
        m.lock(me);
        assert_eq!(m.owner(), Some(me));
        m.unlock(me);
        m.unlock(me);
        assert_eq!(m.owner(), Some(me));
        m.unlock(me);
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn try_lock_never_blocks() {
        let m = Mutex::new();
        let a = holder(1, 10);
        let b = holder(2, 10);
        assert!(m.try_lock(a));
        assert!(!m.try_lock(b));
        m.unlock(a);
        assert!(m.try_lock(b));
    }

    #[test]
    fn contended_lock_reports_waiter_priority_as_ceiling() {
        let m = Arc::new(Mutex::new());
        let low = holder(1, 30);
        let high = holder(2, 2);
        m.lock(low);
        assert_eq!(m.ceiling(), None);

        let m2 = m.clone();
        let handle = std::thread::spawn(move || {
            m2.lock(high);
            m2.unlock(high);
        });
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(m.ceiling(), Some(high.priority));

        m.unlock(low);
        handle.join().unwrap();
        assert_eq!(m.ceiling(), None);
    }
}
