//! `porpoise`: a PC re-host of the GameCube/Wii "Dolphin OS" API.
//!
//! This crate gives a game or middleware linking against it the same
//! concurrency, timing, allocation and persistence primitives it would
//! have had on the original console, running as ordinary host OS threads
//! instead of on bare metal. Components, leaves first:
//!
//! - [`clock`]: monotonic tick clock and unit/calendar conversions.
//! - [`primitives`]: `report!`/`kpanic!`, the two primitives that talk to
//!   the terminal directly rather than through [`log`] or any [`heap`].
//! - [`heap`]: arena + multi-heap allocator: 32-byte alignment, first-fit,
//!   split/coalesce.
//! - [`thread`]: logical threads mapped onto host OS threads, with
//!   suspend counts, TLS and a switch-observer hook.
//! - [`sync`]: recursive mutex (with a priority-inheritance contract),
//!   condition variable, counting semaphore.
//! - [`message`]: bounded FIFO message queue with blocking send/receive
//!   and head-of-line jam.
//! - [`alarm`]: one-shot and periodic timers serviced by a dedicated
//!   worker thread.
//! - [`reset`]: shutdown/reset coordinator: priority-ordered, two-phase
//!   hooks.
//! - [`sram`]: persistent settings store: a 64-byte checksummed image
//!   synced to a backing file.
//!
//! Every process-wide piece of state here (the alarm scheduler, the
//! shutdown-hook registry, the thread registry, the SRAM store) is
//! guarded by a lock rather than published lock-free, matching the
//! concurrency model in the design this crate implements: a game links
//! against one `porpoise` per process, not per arena.

pub mod alarm;
pub mod clock;
pub mod config;
pub mod error;
mod gate;
pub mod heap;
pub mod mask;
pub mod message;
pub mod primitives;
pub mod reset;
pub mod sram;
pub mod sync;
pub mod thread;
mod waitqueue;

pub use error::{Error, Result};
pub use heap::{Allocator, HeapHandle, HeapInfo};
pub use thread::{Thread, ThreadState};
pub use waitqueue::WaitQueue;
