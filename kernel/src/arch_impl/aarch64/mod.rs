//! AArch64 (ARM64) architecture implementation.

pub mod context;
pub mod platform;

pub use context::{CpuContext, MContext};
pub use platform::{signal_dispatch_entry, Aarch64Platform};
