//! Alarm scheduler: one process-wide sorted queue of one-shot and periodic
//! timers, serviced by a dedicated worker that sleeps exactly until the
//! next fire time instead of polling.
//!
//! The queue is a plain `Vec<Entry>` kept sorted by ascending `fire_tick`
//! (ties broken by insertion order) rather than the intrusive doubly
//! linked list the data model describes: alarms are `Arc`-shared handles
//! here, not fixed arena storage, so a sorted vector guarded by a
//! [`Mutex`] gives the same ordering guarantees with none of the raw
//! pointer bookkeeping [`crate::heap`] needs for its arena-backed Cells.

use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use crate::clock::now_ticks;

/// `Fn(&Arc<Alarm>)`: the worker thread invokes this outside any lock,
/// once per fire, with the alarm that fired. Handlers may call any
/// non-blocking runtime primitive, including arming another alarm; a
/// handler that blocks stalls every alarm behind it until it returns.
pub type Handler = Arc<dyn Fn(&Arc<Alarm>) + Send + Sync>;

/// Tag `0` is reserved by [`cancel_by_tag`] as a no-op and should not be
/// used to identify a real batch of alarms.
pub const TAG_NONE: u32 = 0;

struct AlarmState {
    /// `Some` iff the alarm is currently on the scheduler's list, the
    /// single source of truth for "is this alarm armed".
    handler: Option<Handler>,
    fire_tick: i64,
    period_ticks: i64,
    start_tick: i64,
    tag: u32,
}

/// An application-owned alarm handle. Cheap to clone (it is an `Arc`).
pub struct Alarm {
    state: Mutex<AlarmState>,
}

impl Alarm {
    pub fn new(tag: u32) -> Arc<Alarm> {
        Arc::new(Alarm {
            state: Mutex::new(AlarmState {
                handler: None,
                fire_tick: 0,
                period_ticks: 0,
                start_tick: 0,
                tag,
            }),
        })
    }

    pub fn tag(&self) -> u32 {
        self.state.lock().unwrap().tag
    }

    /// True iff the alarm currently appears on the scheduler's list.
    pub fn is_armed(&self) -> bool {
        self.state.lock().unwrap().handler.is_some()
    }

    pub fn fire_tick(&self) -> i64 {
        self.state.lock().unwrap().fire_tick
    }

    /// Arms a one-shot alarm at `now + delta_ticks`.
    pub fn set_relative(self: &Arc<Self>, delta_ticks: i64, handler: Handler) {
        self.set_absolute(now_ticks() + delta_ticks, handler);
    }

    /// Arms a one-shot alarm at the absolute tick `when`.
    pub fn set_absolute(self: &Arc<Self>, when: i64, handler: Handler) {
        {
            let mut s = self.state.lock().unwrap();
            s.period_ticks = 0;
            s.start_tick = when;
            s.handler = Some(handler);
        }
        scheduler().arm(self, when);
    }

    /// Arms a periodic alarm whose first fire is computed from `start`
    /// and `period` relative to the current tick (see [`next_periodic_fire`]).
    pub fn set_periodic(self: &Arc<Self>, start: i64, period: i64, handler: Handler) {
        if period <= 0 {
            crate::kpanic!("set_periodic: period must be positive");
        }
        let fire = next_periodic_fire(start, period, now_ticks());
        {
            let mut s = self.state.lock().unwrap();
            s.period_ticks = period;
            s.start_tick = start;
            s.handler = Some(handler);
        }
        scheduler().arm(self, fire);
    }

    /// Unlinks the alarm and clears its handler slot. Idempotent: cancelling
    /// an alarm that is not armed is a no-op. A subsequent `set_*` call
    /// arms it normally.
    pub fn cancel(self: &Arc<Self>) {
        scheduler().cancel(self);
    }
}

/// `start` if it has not yet arrived, otherwise the next period boundary
/// at or after `now`.
fn next_periodic_fire(start: i64, period: i64, now: i64) -> i64 {
    if start >= now {
        start
    } else {
        let elapsed = now - start;
        let periods = (elapsed + period - 1) / period;
        start + periods * period
    }
}

struct Entry {
    fire_tick: i64,
    alarm: Arc<Alarm>,
}

struct SchedulerState {
    list: Vec<Entry>,
}

struct AlarmScheduler {
    state: Mutex<SchedulerState>,
    cv: Condvar,
}

fn scheduler() -> &'static AlarmScheduler {
    static SCHED: OnceLock<AlarmScheduler> = OnceLock::new();
    SCHED.get_or_init(AlarmScheduler::spawn)
}

impl AlarmScheduler {
    fn spawn() -> AlarmScheduler {
        let sched =
            AlarmScheduler { state: Mutex::new(SchedulerState { list: Vec::new() }), cv: Condvar::new() };
        std::thread::Builder::new()
            .name("porpoise-alarm".into())
            .spawn(worker_loop)
            .expect("failed to spawn alarm worker");
        sched
    }

    /// Inserts before the first entry whose `fire_tick` exceeds the new
    /// one; ties are inserted after existing entries, so same-tick alarms
    /// fire in registration order.
    fn insert_locked(state: &mut SchedulerState, alarm: Arc<Alarm>, fire_tick: i64) {
        let pos = state.list.partition_point(|e| e.fire_tick <= fire_tick);
        state.list.insert(pos, Entry { fire_tick, alarm });
    }

    fn arm(&self, alarm: &Arc<Alarm>, fire_tick: i64) {
        let mut s = self.state.lock().unwrap();
        s.list.retain(|e| !Arc::ptr_eq(&e.alarm, alarm));
        Self::insert_locked(&mut s, alarm.clone(), fire_tick);
        let is_head = s.list.first().map(|e| Arc::ptr_eq(&e.alarm, alarm)).unwrap_or(false);
        drop(s);
        if is_head {
            self.cv.notify_all();
        }
    }

    fn cancel(&self, alarm: &Arc<Alarm>) {
        let mut s = self.state.lock().unwrap();
        let was_head = s.list.first().map(|e| Arc::ptr_eq(&e.alarm, alarm)).unwrap_or(false);
        s.list.retain(|e| !Arc::ptr_eq(&e.alarm, alarm));
        drop(s);
        alarm.state.lock().unwrap().handler = None;
        if was_head {
            self.cv.notify_all();
        }
    }

    fn cancel_by_tag(&self, tag: u32) {
        if tag == TAG_NONE {
            return;
        }
        let mut s = self.state.lock().unwrap();
        let was_head_tagged = s.list.first().map(|e| e.alarm.tag() == tag).unwrap_or(false);
        let removed: Vec<Arc<Alarm>> = {
            let mut removed = Vec::new();
            s.list.retain(|e| {
                if e.alarm.tag() == tag {
                    removed.push(e.alarm.clone());
                    false
                } else {
                    true
                }
            });
            removed
        };
        drop(s);
        for a in &removed {
            a.state.lock().unwrap().handler = None;
        }
        if was_head_tagged {
            self.cv.notify_all();
        }
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap().list.len()
    }

    /// The earliest `fire_tick` on the list, if any alarm is armed.
    fn next_fire(&self) -> Option<i64> {
        self.state.lock().unwrap().list.first().map(|e| e.fire_tick)
    }
}

/// Cancels every alarm whose tag equals `tag`. `tag == 0` is reserved and
/// is a no-op (tag `0` means "untagged").
pub fn cancel_by_tag(tag: u32) {
    scheduler().cancel_by_tag(tag);
}

/// Number of alarms currently armed, process-wide. Debug/introspection only.
pub fn alarm_count() -> usize {
    scheduler().len()
}

/// True iff the next-due alarm's `fire_tick` has already arrived, i.e. the
/// worker has something ready to run (or is in the process of running it).
/// Debug/introspection only; racy by nature against the worker thread.
pub fn now_armed() -> bool {
    scheduler().next_fire().map(|fire| fire <= now_ticks()).unwrap_or(false)
}

fn worker_loop() {
    let sched = scheduler();
    loop {
        let mut s = sched.state.lock().unwrap();
        loop {
            let Some(head) = s.list.first() else {
                s = sched.cv.wait(s).unwrap();
                continue;
            };
            let now = now_ticks();
            if head.fire_tick > now {
                let wait_ticks = head.fire_tick - now;
                let wait_ms = crate::clock::ticks_to_ms(wait_ticks).max(0) as u64;
                let (guard, _timeout) =
                    sched.cv.wait_timeout(s, Duration::from_millis(wait_ms.max(1))).unwrap();
                s = guard;
                continue;
            }
            break;
        }
        let entry = s.list.remove(0);
        drop(s);

        let alarm = entry.alarm;
        let mut state = alarm.state.lock().unwrap();
        let handler = state.handler.clone();
        if state.period_ticks > 0 {
            let next = next_periodic_fire(state.start_tick, state.period_ticks, now_ticks() + 1);
            state.fire_tick = next;
            drop(state);
            let mut s = sched.state.lock().unwrap();
            AlarmScheduler::insert_locked(&mut s, alarm.clone(), next);
            drop(s);
        } else {
            state.handler = None;
            drop(state);
        }

        if let Some(h) = handler {
            h(&alarm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn next_periodic_fire_uses_start_when_future() {
        assert_eq!(next_periodic_fire(1_000, 100, 500), 1_000);
    }

    #[test]
    fn next_periodic_fire_advances_by_whole_periods() {
        assert_eq!(next_periodic_fire(0, 100, 250), 300);
        assert_eq!(next_periodic_fire(0, 100, 300), 300);
    }

    #[test]
    fn one_shot_fires_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let a = Alarm::new(TAG_NONE);
        let hits2 = hits.clone();
        a.set_relative(crate::clock::ms_to_ticks(10), Arc::new(move |_: &Arc<Alarm>| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!a.is_armed());
    }

    #[test]
    fn alarm_monotonicity_across_distinct_fire_times() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = Alarm::new(TAG_NONE);
        let b = Alarm::new(TAG_NONE);
        let oa = order.clone();
        let ob = order.clone();
        let now = now_ticks();
        b.set_absolute(now + crate::clock::ms_to_ticks(60), Arc::new(move |_| ob.lock().unwrap().push('b')));
        a.set_absolute(now + crate::clock::ms_to_ticks(20), Arc::new(move |_| oa.lock().unwrap().push('a')));
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock().unwrap(), vec!['a', 'b']);
    }

    #[test]
    fn chained_one_shots_fire_in_sequence() {
        let done = Arc::new(AtomicI64::new(0));
        let start = now_ticks();
        let a1 = Alarm::new(TAG_NONE);
        let a0 = Alarm::new(TAG_NONE);
        let done2 = done.clone();
        let a1_clone = a1.clone();
        a0.set_relative(
            crate::clock::ms_to_ticks(10),
            Arc::new(move |_| {
                let done3 = done2.clone();
                a1_clone.set_relative(
                    crate::clock::ms_to_ticks(10),
                    Arc::new(move |_| {
                        done3.store(now_ticks(), Ordering::SeqCst);
                    }),
                );
            }),
        );
        std::thread::sleep(Duration::from_millis(200));
        let fired_at = done.load(Ordering::SeqCst);
        assert!(fired_at > 0);
        assert!(crate::clock::ticks_to_ms(fired_at - start) >= 20);
    }

    #[test]
    fn cancel_is_idempotent_and_rearmable() {
        let a = Alarm::new(TAG_NONE);
        a.set_relative(crate::clock::ms_to_ticks(500), Arc::new(|_| {}));
        a.cancel();
        a.cancel();
        assert!(!a.is_armed());
        a.set_relative(crate::clock::ms_to_ticks(10), Arc::new(|_| {}));
        assert!(a.is_armed());
        a.cancel();
    }

    #[test]
    fn cancel_by_tag_removes_matching_alarms_only() {
        let hit = Arc::new(AtomicUsize::new(0));
        let a = Alarm::new(7);
        let b = Alarm::new(8);
        let h2 = hit.clone();
        a.set_relative(crate::clock::ms_to_ticks(20), Arc::new(move |_| {
            h2.fetch_add(1, Ordering::SeqCst);
        }));
        let h3 = hit.clone();
        b.set_relative(crate::clock::ms_to_ticks(20), Arc::new(move |_| {
            h3.fetch_add(10, Ordering::SeqCst);
        }));
        cancel_by_tag(7);
        assert!(!a.is_armed());
        assert!(b.is_armed());
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(hit.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn tag_zero_is_a_reserved_no_op() {
        let a = Alarm::new(TAG_NONE);
        a.set_relative(crate::clock::ms_to_ticks(500), Arc::new(|_| {}));
        cancel_by_tag(TAG_NONE);
        assert!(a.is_armed());
        a.cancel();
    }
}
