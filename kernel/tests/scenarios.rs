//! End-to-end scenarios exercised through the public API only, one per
//! named scenario in the design's testable-properties section.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use porpoise::alarm::{Alarm, TAG_NONE};
use porpoise::clock::{ms_to_ticks, now_ticks, ticks_to_ms};
use porpoise::heap::Allocator;
use porpoise::message::{MessageQueue, BLOCK};
use porpoise::reset::{reboot, register_hook, set_exit_hook, unregister_hook};
use porpoise::sram::{SramStore, VideoMode};
use porpoise::sync::Mutex as PMutex;
use porpoise::thread::Thread;

#[test]
fn scenario_heap_split_and_coalesce() {
    let a = Allocator::new(1 << 20, 4).unwrap();
    let (lo, _) = a.arena_range();
    let h = a.create_heap(lo, lo + 65536).unwrap();

    let p1 = a.alloc(h, 100);
    let p2 = a.alloc(h, 200);
    let p3 = a.alloc(h, 100);
    assert!(!p1.is_null() && !p2.is_null() && !p3.is_null());

    a.free(h, p1);
    a.free(h, p3);
    assert!(a.check_heap(h).is_some());

    a.free(h, p2);
    assert_eq!(a.check_heap(h), Some(65536));
}

#[test]
fn scenario_queue_backpressure() {
    let q = Arc::new(MessageQueue::new(2));
    q.send(1u32, BLOCK).unwrap();
    q.send(2u32, BLOCK).unwrap();

    let q2 = q.clone();
    let sender = std::thread::spawn(move || {
        q2.send(3u32, BLOCK).unwrap();
    });
    std::thread::sleep(Duration::from_millis(50));
    // The third send is still blocked; the queue is still full at 2/2.
    assert_eq!(q.len(), 2);

    assert_eq!(q.receive(BLOCK), Some(1));
    sender.join().unwrap();

    assert_eq!(q.receive(BLOCK), Some(2));
    assert_eq!(q.receive(BLOCK), Some(3));
}

#[test]
fn scenario_priority_inherited_mutex() {
    let m = Arc::new(PMutex::new());

    let low = Thread::new(30, Some("low".into()));
    low.resume();
    low.lock_mutex(&m);
    assert_eq!(low.effective_priority(), 30);

    let high = Thread::spawn(2, Some("high".into()), || 0);
    let m2 = m.clone();
    let high2 = high.clone();
    high.resume();
    let blocker = std::thread::spawn(move || {
        high2.lock_mutex(&m2);
        high2.unlock_mutex(&m2);
    });

    std::thread::sleep(Duration::from_millis(50));
    // While H is blocked on M, L's effective priority is lent up to H's.
    assert_eq!(low.effective_priority(), 2);

    low.unlock_mutex(&m);
    blocker.join().unwrap();
    // Back to L's own base priority once nobody is blocked on M.
    assert_eq!(low.effective_priority(), 30);
}

#[test]
fn scenario_alarm_chain() {
    let start = now_ticks();
    let fired_at = Arc::new(AtomicI64::new(0));

    let a0 = Alarm::new(TAG_NONE);
    let a1 = Alarm::new(TAG_NONE);
    let a1_for_handler = a1.clone();
    let fired_at2 = fired_at.clone();

    a0.set_relative(
        ms_to_ticks(10),
        Arc::new(move |_: &Arc<Alarm>| {
            let fired_at3 = fired_at2.clone();
            a1_for_handler.set_relative(
                ms_to_ticks(10),
                Arc::new(move |_| {
                    fired_at3.store(now_ticks(), Ordering::SeqCst);
                }),
            );
        }),
    );

    std::thread::sleep(Duration::from_millis(300));
    let elapsed_ms = ticks_to_ms(fired_at.load(Ordering::SeqCst) - start);
    assert!(elapsed_ms >= 20, "expected >= 20ms, got {elapsed_ms}ms");
}

#[test]
fn scenario_shutdown_hook_order() {
    set_exit_hook(|_| {});
    let order = Arc::new(StdMutex::new(Vec::new()));
    let not_ready_seen_on_final = Arc::new(AtomicUsize::new(0));

    let mk = |priority: u32, label: &'static str| {
        let order = order.clone();
        register_hook(priority, move |_event, is_final| {
            order.lock().unwrap().push((priority, label, is_final));
            true
        })
    };

    let h127 = mk(127, "p127");
    let h5 = mk(5, "p5");
    let h10 = mk(10, "p10");

    // A hook that reports not-ready on prepare must still run on final.
    let nr = not_ready_seen_on_final.clone();
    let h_not_ready = register_hook(5, move |_event, is_final| {
        if is_final {
            nr.fetch_add(1, Ordering::SeqCst);
        }
        !is_final
    });

    order.lock().unwrap().clear();
    reboot();

    let got = order.lock().unwrap().clone();
    let prepare: Vec<_> = got.iter().filter(|(_, _, f)| !f).map(|(p, l, _)| (*p, *l)).collect();
    let finale: Vec<_> = got.iter().filter(|(_, _, f)| *f).map(|(p, l, _)| (*p, *l)).collect();

    assert_eq!(prepare, vec![(5, "p5"), (10, "p10"), (127, "p127")]);
    assert_eq!(finale, vec![(5, "p5"), (10, "p10"), (127, "p127")]);
    assert_eq!(not_ready_seen_on_final.load(Ordering::SeqCst), 1);

    for id in [h127, h5, h10, h_not_ready] {
        unregister_hook(id);
    }
}

#[test]
fn scenario_sram_recovery_from_bad_checksum() {
    let mut path = std::env::temp_dir();
    path.push(format!("porpoise_sram_scenario_{}.cfg", std::process::id()));

    let mut bad = [0u8; 64];
    bad[0] = 0x12;
    bad[1] = 0x34;
    bad[2] = 0x00;
    bad[3] = 0x00;
    std::fs::write(&path, bad).unwrap();

    let store = SramStore::open(&path);
    assert_eq!(store.video_mode(), VideoMode::Ntsc);

    let persisted = std::fs::read(&path).unwrap();
    let sum = u16::from_be_bytes([persisted[0], persisted[1]]);
    let complement = u16::from_be_bytes([persisted[2], persisted[3]]);
    assert_eq!(sum.wrapping_add(complement), 0xFFFF);

    let _ = std::fs::remove_file(&path);
}
