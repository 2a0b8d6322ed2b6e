//! Process management
//!
//! A process is a named collection of threads that share signal
//! dispositions. The `ProcessManager` table lives in the `Cpu`; nothing
//! here is global.

pub mod manager;
pub mod process;

pub use manager::ProcessManager;
pub use process::{ExitStatus, Process, ProcessId};
