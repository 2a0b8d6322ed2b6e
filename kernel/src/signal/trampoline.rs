//! Signal trampoline for returning from signal handlers
//!
//! The loader maps these bytes read+execute at
//! [`SIGRETURN_TRAMPOLINE`](crate::config::SIGRETURN_TRAMPOLINE) in every
//! user address space. A handler returns into it, and it traps straight into
//! the dedicated sigreturn vector. Sigreturn then only accepts traps whose
//! saved instruction pointer lies just past that trap instruction.

use crate::arch_impl::{CpuContext, ExecutionContext};
use crate::config::SIGRETURN_TRAMPOLINE;

// =============================================================================
// x86_64 Signal Trampoline
// =============================================================================

/// Assembly:
///   int 0x83         ; SIGRETURN_VECTOR
///   ud2              ; Should never reach here
///
/// The handler's `ret` instruction pops the return address and jumps here.
#[cfg(not(target_arch = "aarch64"))]
pub static SIGNAL_TRAMPOLINE: [u8; 4] = [
    0xCD, 0x83, // int 0x83
    0x0F, 0x0B, // ud2 (should never reach here)
];

// =============================================================================
// ARM64 Signal Trampoline
// =============================================================================

/// Assembly (little-endian ARM64):
///   svc #0x83        ; SIGRETURN_VECTOR
///   brk #1           ; Should never reach here
///
/// On ARM64 the handler returns via RET to x30 (link register), which
/// delivery points here.
///
/// Instruction encoding (little-endian):
/// - svc #0x83: 0xD4001061 -> 61 10 00 D4
/// - brk #1:    0xD4200020 -> 20 00 20 D4
#[cfg(target_arch = "aarch64")]
pub static SIGNAL_TRAMPOLINE: [u8; 8] = [
    0x61, 0x10, 0x00, 0xD4, // svc #0x83
    0x20, 0x00, 0x20, 0xD4, // brk #1 (should never reach here)
];

/// Size of the signal trampoline in bytes
pub const SIGNAL_TRAMPOLINE_SIZE: usize = SIGNAL_TRAMPOLINE.len();

/// Saved instruction pointer of a genuine trap from the trampoline
#[inline]
pub const fn return_address() -> u64 {
    SIGRETURN_TRAMPOLINE + <CpuContext as ExecutionContext>::TRAP_INSN_LEN
}
