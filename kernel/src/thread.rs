//! Thread runtime: logical threads created in a suspended "Ready" state,
//! mapped one-to-one onto host OS threads once their suspend count reaches
//! zero.
//!
//! Two host-scheduler limits shape this module and are worth stating up
//! front rather than discovering by surprise:
//! - [`Thread::suspend`] cannot forcibly halt a thread already running on
//!   the host; it only prevents a not-yet-started thread from starting.
//! - [`Thread::set_priority`] records a logical priority used for
//!   mutex priority inheritance ([`crate::sync::mutex::Mutex::ceiling`])
//!   and reported through [`Thread::host_band`], but `std::thread` exposes
//!   no portable API to change a running thread's OS scheduling priority,
//!   so no such call is made. [`set_switch_hook`] is best-effort for the
//!   same reason: nothing in this runtime can observe a host preemption,
//!   only its own explicit transitions.

use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};

use crate::config::TLS_SLOTS;
use crate::sync::mutex::{Holder, Mutex as PMutex};

pub use crate::waitqueue::WaitQueue;

static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

fn registry() -> &'static Mutex<Vec<Weak<Thread>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Weak<Thread>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

type SwitchHook = dyn Fn(Option<Arc<Thread>>, Arc<Thread>) + Send + Sync;

fn switch_hook_slot() -> &'static Mutex<Option<Box<SwitchHook>>> {
    static HOOK: OnceLock<Mutex<Option<Box<SwitchHook>>>> = OnceLock::new();
    HOOK.get_or_init(|| Mutex::new(None))
}

/// Installs the single user hook invoked immediately before the runtime
/// transitions one thread off-CPU to another. Only fired at the points
/// this runtime itself controls (thread start); see the module note.
pub fn set_switch_hook<F>(hook: F)
where
    F: Fn(Option<Arc<Thread>>, Arc<Thread>) + Send + Sync + 'static,
{
    *switch_hook_slot().lock().unwrap() = Some(Box::new(hook));
}

pub fn clear_switch_hook() {
    *switch_hook_slot().lock().unwrap() = None;
}

fn fire_switch_hook(from: Option<Arc<Thread>>, to: Arc<Thread>) {
    if let Some(hook) = switch_hook_slot().lock().unwrap().as_ref() {
        hook(from, to);
    }
}

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<Thread>>> = const { std::cell::RefCell::new(None) };
}

/// The logical thread record for whichever host thread called this.
/// A host thread that never went through [`Thread::spawn`] (the primordial
/// thread, or any other thread that wanders into this runtime) is lazily
/// given an implicit idle record the first time it asks.
pub fn current() -> Arc<Thread> {
    CURRENT.with(|cell| {
        if let Some(t) = cell.borrow().as_ref() {
            return t.clone();
        }
        let idle = Thread::new(crate::config::MAX_THREAD_PRIORITY, Some("idle".to_string()));
        idle.inner.lock().unwrap().state = ThreadState::Running;
        *cell.borrow_mut() = Some(idle.clone());
        idle
    })
}

fn set_current(t: Arc<Thread>) {
    CURRENT.with(|cell| *cell.borrow_mut() = Some(t));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Waiting,
    Moribund,
}

struct Inner {
    state: ThreadState,
    suspend_count: i32,
    priority: u8,
    exit_value: i64,
    tls: [u64; TLS_SLOTS],
    handle: Option<std::thread::JoinHandle<()>>,
}

/// A logical thread. Cheap to clone (it is an `Arc`); identity is by
/// pointer/`id`, not by value.
pub struct Thread {
    id: u64,
    name: Option<String>,
    inner: Mutex<Inner>,
    cv: Condvar,
    held_mutexes: Mutex<Vec<Arc<PMutex>>>,
    entry: Mutex<Option<Box<dyn FnOnce() -> i64 + Send>>>,
    /// Bookkeeping only: the console wrote a sentinel at the low end of a
    /// thread's stack to detect overflow by inspection. Hosted stacks are
    /// owned by `std::thread` and never inspected, so this is carried
    /// purely so debug dumps can show the value a port expects.
    stack_guard: u32,
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.inner.lock().unwrap().state)
            .finish()
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Thread {}

impl Thread {
    /// Creates a thread in the pre-started Ready state with suspend
    /// count 1. No host thread exists until [`Self::resume`] drops the
    /// count to zero.
    pub fn new(priority: u8, name: Option<String>) -> Arc<Thread> {
        if priority > crate::config::MAX_THREAD_PRIORITY {
            crate::kpanic!("thread priority {} out of range", priority);
        }
        let t = Arc::new(Thread {
            id: NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            name,
            inner: Mutex::new(Inner {
                state: ThreadState::Ready,
                suspend_count: 1,
                priority,
                exit_value: 0,
                tls: [0; TLS_SLOTS],
                handle: None,
            }),
            cv: Condvar::new(),
            held_mutexes: Mutex::new(Vec::new()),
            entry: Mutex::new(None),
            stack_guard: crate::config::STACK_MAGIC,
        });
        registry().lock().unwrap().push(Arc::downgrade(&t));
        t
    }

    /// Creates a thread and binds the routine it will run once started.
    pub fn spawn<F>(priority: u8, name: Option<String>, entry: F) -> Arc<Thread>
    where
        F: FnOnce() -> i64 + Send + 'static,
    {
        let t = Thread::new(priority, name);
        *t.entry.lock().unwrap() = Some(Box::new(entry));
        t
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> ThreadState {
        self.inner.lock().unwrap().state
    }

    fn set_state(&self, state: ThreadState) {
        self.inner.lock().unwrap().state = state;
    }

    pub fn stack_guard(&self) -> u32 {
        self.stack_guard
    }

    pub fn priority(&self) -> u8 {
        self.inner.lock().unwrap().priority
    }

    /// `<8` critical, `<16` above-normal, `>24` below-normal, else normal.
    /// Informational only: see the module note on host priority.
    pub fn host_band(priority: u8) -> &'static str {
        if priority < 8 {
            "critical"
        } else if priority < 16 {
            "above_normal"
        } else if priority > 24 {
            "below_normal"
        } else {
            "normal"
        }
    }

    pub fn set_priority(&self, priority: u8) {
        if priority > crate::config::MAX_THREAD_PRIORITY {
            crate::kpanic!("thread priority {} out of range", priority);
        }
        self.inner.lock().unwrap().priority = priority;
    }

    /// Base priority, lowered (numerically) to match the highest-priority
    /// thread currently blocked on any mutex this thread holds.
    pub fn effective_priority(&self) -> u8 {
        let base = self.priority();
        self.held_mutexes
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| m.ceiling())
            .min()
            .map(|ceiling| ceiling.min(base))
            .unwrap_or(base)
    }

    fn holder(&self) -> Holder {
        Holder { id: self.id, priority: self.priority() }
    }

    pub fn lock_mutex(self: &Arc<Self>, m: &Arc<PMutex>) {
        self.set_state(ThreadState::Waiting);
        m.lock(self.holder());
        self.set_state(ThreadState::Running);
        self.held_mutexes.lock().unwrap().push(m.clone());
    }

    pub fn try_lock_mutex(self: &Arc<Self>, m: &Arc<PMutex>) -> bool {
        if m.try_lock(self.holder()) {
            self.held_mutexes.lock().unwrap().push(m.clone());
            true
        } else {
            false
        }
    }

    pub fn unlock_mutex(self: &Arc<Self>, m: &Arc<PMutex>) {
        m.unlock(self.holder());
        let mut held = self.held_mutexes.lock().unwrap();
        if let Some(pos) = held.iter().position(|x| Arc::ptr_eq(x, m)) {
            held.remove(pos);
        }
    }

    pub fn tls_get(&self, slot: usize) -> u64 {
        self.inner.lock().unwrap().tls[self.check_slot(slot)]
    }

    pub fn tls_set(&self, slot: usize, value: u64) {
        let slot = self.check_slot(slot);
        self.inner.lock().unwrap().tls[slot] = value;
    }

    fn check_slot(&self, slot: usize) -> usize {
        if slot >= TLS_SLOTS {
            crate::kpanic!("tls slot {} out of range", slot);
        }
        slot
    }

    /// Decrements the suspend count; at zero, starts the host thread if
    /// this logical thread is still Ready.
    pub fn resume(self: &Arc<Thread>) {
        let mut g = self.inner.lock().unwrap();
        g.suspend_count -= 1;
        let should_start = g.suspend_count <= 0 && g.state == ThreadState::Ready;
        if should_start {
            self.spawn_host_thread(&mut g);
        }
        drop(g);
        self.cv.notify_all();
    }

    /// Increments the suspend count. Has no effect on a thread already
    /// running on the host; see the module note.
    pub fn suspend(&self) {
        self.inner.lock().unwrap().suspend_count += 1;
    }

    pub fn suspend_count(&self) -> i32 {
        self.inner.lock().unwrap().suspend_count
    }

    fn spawn_host_thread(self: &Arc<Thread>, g: &mut Inner) {
        let entry = self.entry.lock().unwrap().take();
        g.state = ThreadState::Running;
        let this = self.clone();
        let builder = std::thread::Builder::new();
        let builder = match &self.name {
            Some(name) => builder.name(name.clone()),
            None => builder,
        };
        let from = CURRENT.with(|cell| cell.borrow().clone());
        fire_switch_hook(from, self.clone());
        let handle = builder
            .spawn(move || {
                set_current(this.clone());
                let value = match entry {
                    Some(f) => f(),
                    None => 0,
                };
                this.exit(value);
            })
            .expect("failed to spawn host thread");
        g.handle = Some(handle);
    }

    /// Stores the exit value, transitions to Moribund, and wakes every
    /// joiner. Called automatically when a spawned entry routine returns;
    /// may also be called explicitly by the running thread itself.
    pub fn exit(&self, value: i64) {
        let mut g = self.inner.lock().unwrap();
        if g.state == ThreadState::Moribund {
            return;
        }
        g.exit_value = value;
        g.state = ThreadState::Moribund;
        drop(g);
        self.cv.notify_all();
    }

    /// Marks the thread Moribund and wakes joiners without waiting for
    /// the underlying host thread to finish. `std::thread` has no safe
    /// API to kill a running thread, so the host thread is left to run
    /// to completion on its own; documented, per the design contract, as
    /// hazardous for callers that rely on synchronous termination.
    pub fn cancel(&self) {
        let mut g = self.inner.lock().unwrap();
        g.state = ThreadState::Moribund;
        drop(g);
        self.cv.notify_all();
    }

    /// Parks the caller until this thread is Moribund, then returns its
    /// exit value. `self.cv` is this thread's join wait queue: every
    /// parked joiner rechecks the predicate on each notification, so a
    /// join issued after the thread already exited returns immediately
    /// instead of racing the wakeup.
    pub fn join(&self) -> i64 {
        let caller = current();
        caller.set_state(ThreadState::Waiting);
        let g = self.inner.lock().unwrap();
        let g = self.cv.wait_while(g, |g| g.state != ThreadState::Moribund).unwrap();
        caller.set_state(ThreadState::Running);
        g.exit_value
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.get_mut().unwrap().handle.take() {
            let _ = handle.join();
        }
    }
}

/// Asks the host scheduler to run another thread, if one is ready.
pub fn yield_now() {
    std::thread::yield_now();
}

/// Parks the caller on `queue`. Callers are expected to have already
/// released the interrupt-mask surrogate (see [`crate::mask`]) as part of
/// preparing the wait, matching the "only callable under the mask"
/// contract; this function itself only performs the park.
pub fn sleep(queue: &WaitQueue) {
    let t = current();
    t.set_state(ThreadState::Waiting);
    queue.park();
    t.set_state(ThreadState::Running);
}

/// Releases every thread parked on `queue` to Ready.
pub fn wake(queue: &WaitQueue) {
    queue.wake_all();
}

/// Number of thread records still reachable (not yet dropped). A thread
/// that has exited but whose `Arc` a caller still holds is counted.
pub fn thread_count() -> usize {
    let mut reg = registry().lock().unwrap();
    reg.retain(|w| w.strong_count() > 0);
    reg.len()
}

/// Invokes `f` once per live thread record. Intended for diagnostics;
/// order is unspecified.
pub fn for_each_thread(mut f: impl FnMut(&Arc<Thread>)) {
    let reg = registry().lock().unwrap();
    for weak in reg.iter() {
        if let Some(t) = weak.upgrade() {
            f(&t);
        }
    }
}
