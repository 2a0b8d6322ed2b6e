//! Threads, the scheduler and the per-CPU core
//!
//! - `thread`: thread identity, kernel stacks
//! - `scheduler`: the runnable ring and the pick-next policy
//! - `cpu`: context switching, trap handling, thread exit and reclamation

pub mod cpu;
pub mod scheduler;
pub mod thread;

pub use cpu::{bsp, init, Cpu};
pub use scheduler::Scheduler;
pub use thread::{KernelStack, Thread, ThreadId, ThreadState, Tid};
