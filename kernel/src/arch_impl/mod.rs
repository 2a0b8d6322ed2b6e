//! Architecture abstraction layer.
//!
//! This module provides architecture-agnostic traits and re-exports the current
//! architecture's implementation. Code outside this module should use the traits
//! defined here rather than architecture-specific types directly.
//!
//! # Supported Architectures
//!
//! - `x86_64`: primary target
//! - `aarch64`: ARM64

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64 as current;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use self::aarch64 as current;

pub mod traits;
pub use traits::*;

pub use current::{signal_dispatch_entry, CpuContext, MContext};
