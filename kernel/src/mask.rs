//! Interrupt-mask surrogate. There is no interrupt controller to disable on
//! a hosted OS; every routine documented as running "under the mask" takes
//! this lock instead. The guard returned by [`disable`] is the mask's
//! ownership token, matching the original `disable()`/`restore(guard)`
//! pair: [`restore`] is just `drop`, spelled out so call sites read the
//! same as the console API they mirror.

use std::sync::{Mutex, MutexGuard, OnceLock};

static MASK: OnceLock<Mutex<()>> = OnceLock::new();

fn mask() -> &'static Mutex<()> {
    MASK.get_or_init(|| Mutex::new(()))
}

pub struct Guard(MutexGuard<'static, ()>);

/// Enters a masked critical section. Must not be held while invoking a
/// user callback (alarm handler, shutdown hook, switch callback, panic).
pub fn disable() -> Guard {
    Guard(mask().lock().unwrap_or_else(|p| p.into_inner()))
}

/// Leaves the masked section. Equivalent to dropping the guard; spelled
/// out so callers can mirror the disable/restore shape explicitly.
pub fn restore(guard: Guard) {
    drop(guard);
}
