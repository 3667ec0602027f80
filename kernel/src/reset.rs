//! Shutdown/reset coordinator: a priority-ordered list of hooks, run in a
//! two-phase prepare/final protocol from a small set of top-level reset
//! entry points.
//!
//! Like [`crate::alarm`], the hook list is a sorted `Vec` rather than an
//! intrusive list: hooks are registered from arbitrary call sites that
//! have no natural place to embed list links, so a handle-based API
//! (`register_hook`/`unregister_hook`) fits a hosted library better than
//! the original's in-place node.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

pub mod reset_code {
    //! Bit-field constants for the process-wide reset-code word.
    pub const RESTART: u32 = 0x8000_0000;
    pub const SYSTEM: u32 = 0x4000_0000;
    pub const SWITCH: u32 = 0x2000_0000;
    pub const EXEC: u32 = RESTART | SYSTEM;
    pub const LAUNCH: u32 = RESTART | SWITCH;
}

/// The event a hook is invoked for. Hooks do not see `force_menu` or the
/// raw reset code directly; call [`reset_code`] / [`is_restart`] for that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetEvent {
    Reboot,
    Shutdown,
    Restart,
    ReturnToMenu,
    ReturnToDataManager,
    Reset,
}

/// A registered hook's identity, returned by [`register_hook`] and
/// consumed by [`unregister_hook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

type HookFn = dyn FnMut(ResetEvent, bool) -> bool + Send;

struct Entry {
    id: HookId,
    priority: u32,
    hook: Box<HookFn>,
}

struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
}

fn registry() -> &'static Mutex<Registry> {
    static REG: OnceLock<Mutex<Registry>> = OnceLock::new();
    REG.get_or_init(|| Mutex::new(Registry { next_id: 1, entries: Vec::new() }))
}

/// Registers a hook, called as `hook(event, is_final)` during every
/// top-level reset entry point's prepare and final passes. The prepare
/// call's return value is the hook's readiness (`true` = ready); the
/// final call's return value is ignored. Hooks with the numerically
/// lowest priority run first; equal priorities preserve registration
/// order.
pub fn register_hook(
    priority: u32,
    hook: impl FnMut(ResetEvent, bool) -> bool + Send + 'static,
) -> HookId {
    let mut r = registry().lock().unwrap();
    let id = HookId(r.next_id);
    r.next_id += 1;
    let pos = r.entries.iter().position(|e| e.priority > priority).unwrap_or(r.entries.len());
    r.entries.insert(pos, Entry { id, priority, hook: Box::new(hook) });
    id
}

/// Unlinks a hook. A no-op if `id` is not currently registered (already
/// unregistered, or from a different process run).
pub fn unregister_hook(id: HookId) {
    let mut r = registry().lock().unwrap();
    r.entries.retain(|e| e.id != id);
}

/// Runs the prepare pass (`final=false`) then the final pass (`final=true`)
/// over every registered hook, in ascending-priority order both times. A
/// hook that returns `false` (not ready) on prepare is still invoked on
/// the final pass; this simple coordinator does not retry, per the
/// design's documented minimal-conformance option.
fn run_passes(event: ResetEvent) {
    // Snapshot hooks under the lock, then call them without it held: a
    // hook is user code and must not run while holding a list lock the
    // hook itself might try to touch (e.g. by unregistering itself).
    let ids: Vec<HookId> = registry().lock().unwrap().entries.iter().map(|e| e.id).collect();

    for pass_final in [false, true] {
        for id in &ids {
            let mut r = registry().lock().unwrap();
            let Some(pos) = r.entries.iter().position(|e| e.id == *id) else { continue };
            let mut entry = r.entries.remove(pos);
            drop(r);
            let ready = (entry.hook)(event, pass_final);
            if !pass_final && !ready {
                log::warn!("reset hook did not report ready during prepare pass");
            }
            let mut r = registry().lock().unwrap();
            let reinsert_pos =
                r.entries.iter().position(|e| e.priority > entry.priority).unwrap_or(r.entries.len());
            r.entries.insert(reinsert_pos, entry);
        }
    }
}

static RESET_CODE: AtomicU32 = AtomicU32::new(0);
static SAVE_LO: AtomicUsize = AtomicUsize::new(0);
static SAVE_HI: AtomicUsize = AtomicUsize::new(0);
static SAVE_SET: AtomicBool = AtomicBool::new(false);
static SAVED_LO: AtomicU64 = AtomicU64::new(0);
static SAVED_HI: AtomicU64 = AtomicU64::new(0);
static SAVED_SET: AtomicBool = AtomicBool::new(false);

/// Records the application's "save region", a pair of addresses it wants
/// preserved into the "saved region" the next launch reads back. Callers
/// set this before `restart` so the capture below has something to copy.
pub fn set_save_region(lo: usize, hi: usize) {
    SAVE_LO.store(lo, Ordering::SeqCst);
    SAVE_HI.store(hi, Ordering::SeqCst);
    SAVE_SET.store(true, Ordering::SeqCst);
}

pub fn save_region() -> Option<(usize, usize)> {
    SAVE_SET.load(Ordering::SeqCst).then(|| (SAVE_LO.load(Ordering::SeqCst), SAVE_HI.load(Ordering::SeqCst)))
}

/// The save region captured by the most recent `restart`, read by the
/// next launch.
pub fn saved_region() -> Option<(usize, usize)> {
    SAVED_SET
        .load(Ordering::SeqCst)
        .then(|| (SAVED_LO.load(Ordering::SeqCst) as usize, SAVED_HI.load(Ordering::SeqCst) as usize))
}

pub fn reset_code() -> u32 {
    RESET_CODE.load(Ordering::SeqCst)
}

/// True when the stored reset code has the restart bit set.
pub fn is_restart() -> bool {
    reset_code() & reset_code::RESTART != 0
}

fn exit_hook_slot() -> &'static Mutex<Box<dyn Fn(i32) + Send + Sync>> {
    static SLOT: OnceLock<Mutex<Box<dyn Fn(i32) + Send + Sync>>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(Box::new(|code| std::process::exit(code))))
}

/// Overrides what runs after the final pass of a top-level reset entry
/// point. Defaults to [`std::process::exit`]; test code should install a
/// hook that records the call instead of tearing down the test process.
pub fn set_exit_hook(hook: impl Fn(i32) + Send + Sync + 'static) {
    *exit_hook_slot().lock().unwrap() = Box::new(hook);
}

fn do_exit() {
    let hook = exit_hook_slot().lock().unwrap();
    hook(0);
}

pub fn reboot() {
    run_passes(ResetEvent::Reboot);
    do_exit();
}

pub fn shutdown() {
    run_passes(ResetEvent::Shutdown);
    do_exit();
}

/// OR-s the restart bit into `code`, captures the current save region
/// into the saved region, runs the hook passes, then exits.
pub fn restart(code: u32) {
    RESET_CODE.store(code | reset_code::RESTART, Ordering::SeqCst);
    if let Some((lo, hi)) = save_region() {
        SAVED_LO.store(lo as u64, Ordering::SeqCst);
        SAVED_HI.store(hi as u64, Ordering::SeqCst);
        SAVED_SET.store(true, Ordering::SeqCst);
    }
    run_passes(ResetEvent::Restart);
    do_exit();
}

pub fn return_to_menu() {
    run_passes(ResetEvent::ReturnToMenu);
    do_exit();
}

pub fn return_to_data_manager() {
    run_passes(ResetEvent::ReturnToDataManager);
    do_exit();
}

/// `force_menu` is recorded only for the hooks to observe through
/// [`force_menu_requested`]; the coordinator itself does not branch on it.
static FORCE_MENU: AtomicBool = AtomicBool::new(false);

pub fn force_menu_requested() -> bool {
    FORCE_MENU.load(Ordering::SeqCst)
}

pub fn reset(code: u32, force_menu: bool) {
    RESET_CODE.store(code, Ordering::SeqCst);
    FORCE_MENU.store(force_menu, Ordering::SeqCst);
    run_passes(ResetEvent::Reset);
    do_exit();
}
