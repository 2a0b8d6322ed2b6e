//! Signal handling infrastructure
//!
//! This module implements POSIX-compatible signal handling, including:
//! - Signal constants (SIGKILL, SIGTERM, etc.)
//! - Per-process dispositions and per-thread masks and pending sets
//! - Signal delivery to userspace handlers
//! - Forgery-checked return from handlers
//!
//! Signal delivery occurs at the return-to-userspace boundary in
//! [`Cpu::handle_trap`](crate::task::Cpu::handle_trap).

pub mod constants;
pub mod delivery;
pub mod frame;
pub mod sigreturn;
pub mod trampoline;
pub mod types;

pub use delivery::{deliver, deliver_to_process, dispatch, exec_reset};
pub use frame::SignalFrame;
pub use sigreturn::{sigreturn, Forgery};
pub use types::*;

#[cfg(test)]
mod signal_tests;
