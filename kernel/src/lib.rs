//! Scheduling, synchronization and signal core of the kernel.
//!
//! The crate is freestanding (`no_std` + `alloc`). Hardware access goes
//! through [`arch_impl::Platform`] and [`arch_impl::ExecutionContext`]; the
//! boot code supplies a platform, calls [`task::init`] and routes the trap
//! vectors in [`config`] to [`task::Cpu::handle_trap`].
//!
//! Host unit tests link `std` and substitute a platform that models each
//! kernel thread as an OS thread handing a single baton around.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch_impl;
pub mod config;
pub mod error;
pub mod logger;
pub mod process;
pub mod signal;
pub mod sync;
pub mod syscall;
pub mod task;

#[cfg(test)]
mod test_harness;

pub use error::Error;
