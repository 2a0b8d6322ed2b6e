//! Blocking synchronization primitives
//!
//! - `kutex`: address-keyed wait queues, the only place threads block
//! - `mutex`: tri-state sleeping mutex on top of the kutex
//! - `condvar`: FIFO condition variable on top of both

pub mod condvar;
pub mod kutex;
pub mod mutex;

pub use condvar::Condvar;
pub use kutex::Kutex;
pub use mutex::{LockState, Mutex, MutexGuard, RawMutex};
