//! Bounded message queue: FIFO `send`/`receive` plus a head-of-line `jam`.
//!
//! A full queue parks senders on one ticket gate and an empty queue parks
//! receivers on another; each gate is released in arrival order, matching
//! the FIFO property required of every wait queue in this runtime (see
//! [`crate::gate`]). `jam` breaks delivery order on purpose: it inserts at
//! the head instead of the tail, so it is the one send variant that is not
//! FIFO with respect to other senders.

use std::sync::{Condvar, Mutex};

use crate::gate::Fifo;

pub const NOBLOCK: u32 = 0;
pub const BLOCK: u32 = 1;

struct State<T> {
    storage: Vec<Option<T>>,
    head: usize,
    used: usize,
    send_gate: Fifo,
    receive_gate: Fifo,
}

/// A fixed-capacity ring of slots of type `T`.
pub struct MessageQueue<T> {
    state: Mutex<State<T>>,
    cv: Condvar,
}

impl<T> MessageQueue<T> {
    /// Binds `storage` as the queue's backing ring; `storage.len()` becomes
    /// the capacity. Every slot starts empty regardless of what `storage`
    /// held on entry, matching the console API this mirrors, where `init`
    /// takes ownership of a caller-supplied array rather than allocating
    /// one itself.
    ///
    /// # Panics
    /// If `storage` is empty.
    pub fn from_storage(mut storage: Vec<Option<T>>) -> MessageQueue<T> {
        if storage.is_empty() {
            crate::kpanic!("message queue capacity must be nonzero");
        }
        for slot in storage.iter_mut() {
            *slot = None;
        }
        MessageQueue {
            state: Mutex::new(State {
                storage,
                head: 0,
                used: 0,
                send_gate: Fifo::new(),
                receive_gate: Fifo::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// Allocates `capacity` fresh slots and binds them via
    /// [`Self::from_storage`].
    ///
    /// # Panics
    /// If `capacity` is `0`.
    pub fn new(capacity: usize) -> MessageQueue<T> {
        let mut storage = Vec::with_capacity(capacity);
        storage.resize_with(capacity, || None);
        Self::from_storage(storage)
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().unwrap().storage.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts at the tail, in FIFO order with respect to other `send`
    /// callers. Blocks while full unless `flags` is [`NOBLOCK`], in which
    /// case a full queue returns `msg` back to the caller.
    pub fn send(&self, msg: T, flags: u32) -> Result<(), T> {
        self.insert(msg, flags, false)
    }

    /// Inserts at the head, ahead of everything currently queued. Blocking
    /// behavior is identical to [`Self::send`].
    pub fn jam(&self, msg: T, flags: u32) -> Result<(), T> {
        self.insert(msg, flags, true)
    }

    fn insert(&self, msg: T, flags: u32, at_head: bool) -> Result<(), T> {
        let mut s = self.state.lock().unwrap();
        let cap = s.storage.len();
        if s.used == cap {
            if flags & BLOCK == 0 {
                return Err(msg);
            }
            let ticket = s.send_gate.take_ticket();
            s = self.cv.wait_while(s, |s| !(s.send_gate.is_front(ticket) && s.used < cap)).unwrap();
            s.send_gate.advance();
        }
        let index = if at_head {
            s.head = (s.head + cap - 1) % cap;
            s.head
        } else {
            (s.head + s.used) % cap
        };
        s.storage[index] = Some(msg);
        s.used += 1;
        drop(s);
        self.cv.notify_all();
        Ok(())
    }

    /// Removes from the head. Blocks while empty unless `flags` is
    /// [`NOBLOCK`], in which case an empty queue returns `None`.
    pub fn receive(&self, flags: u32) -> Option<T> {
        let mut s = self.state.lock().unwrap();
        if s.used == 0 {
            if flags & BLOCK == 0 {
                return None;
            }
            let ticket = s.receive_gate.take_ticket();
            s = self.cv.wait_while(s, |s| !(s.receive_gate.is_front(ticket) && s.used > 0)).unwrap();
            s.receive_gate.advance();
        }
        let cap = s.storage.len();
        let msg = s.storage[s.head].take();
        s.head = (s.head + 1) % cap;
        s.used -= 1;
        drop(s);
        self.cv.notify_all();
        msg
    }
}
