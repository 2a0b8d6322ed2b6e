//! x86_64 architecture implementation.
//!
//! - `context`: trap-frame compatible register snapshot and `sigcontext`
//! - `platform`: interrupt control, software traps and user copies

pub mod context;
pub mod platform;

pub use context::{CpuContext, MContext};
pub use platform::{signal_dispatch_entry, X86Platform};
