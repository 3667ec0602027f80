//! Synchronization primitives built on the thread runtime: recursive
//! mutexes with a priority-inheritance contract, condition variables, and
//! counting semaphores.

pub mod condvar;
pub mod mutex;
pub mod semaphore;

pub use condvar::Condvar;
pub use mutex::{Holder, Mutex};
pub use semaphore::Semaphore;
