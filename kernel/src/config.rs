//! Compile-time configuration for the scheduling and signal core.
//!
//! The trap vector numbers are an ABI contract with the low-level trap
//! dispatcher and with the user-space signal trampoline; do not renumber them.

/// Software interrupt used for system calls.
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Voluntary yield: the current thread gives up the CPU.
pub const YIELD_VECTOR: u8 = 0x81;

/// Forced signal dispatch, entered through a synthetic frame built on the
/// incoming thread's kernel stack.
pub const SIGNAL_DISPATCH_VECTOR: u8 = 0x82;

/// Raised by the user-space sigreturn trampoline.
pub const SIGRETURN_VECTOR: u8 = 0x83;

/// Raised by a thread that has committed to exiting.
pub const THREAD_EXIT_VECTOR: u8 = 0x84;

/// Timer interrupt; an involuntary reschedule point.
pub const PREEMPT_VECTOR: u8 = 0x20;

/// Size of every thread's kernel stack (16 KiB)
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Initial capacity of the thread arena
pub const MAX_THREADS: usize = 256;

/// Number of dead threads that may await reclamation at once
pub const DEFERRED_QUEUE_CAPACITY: usize = 64;

/// Fixed user address of the page holding the sigreturn trampoline.
///
/// Mapped read+execute into every user address space by the loader.
pub const SIGRETURN_TRAMPOLINE: u64 = 0x0000_7fff_ffff_e000;

/// Bytes below the interrupted stack pointer that a signal frame must not
/// overwrite. The x86_64 SysV ABI grants leaf functions 128 bytes.
#[cfg(not(target_arch = "aarch64"))]
pub const RED_ZONE: u64 = 128;
#[cfg(target_arch = "aarch64")]
pub const RED_ZONE: u64 = 0;

/// Size of the in-memory log ring (32 KB)
pub const LOG_BUFFER_SIZE: usize = 32 * 1024;
