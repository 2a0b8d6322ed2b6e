//! Architecture-agnostic traits for hardware abstraction.
//!
//! These traits define the interface between architecture-specific code and
//! the rest of the core. All raw register and memory manipulation lives behind
//! them; the scheduler and signal code only ever see these methods.

use crate::error::Error;
use crate::task::Cpu;

/// Saved register state of a suspended thread.
///
/// The same type is used for the live interrupt frame handed to trap
/// handlers, so saving a thread is a plain copy out of the frame and
/// resuming one is a plain copy back in.
pub trait ExecutionContext: Copy + Default + core::fmt::Debug + bytemuck::Pod {
    /// Architecture machine-context record embedded in signal frames.
    type MContext: bytemuck::Pod + Default;

    /// Size in bytes of the instruction used to enter a trap vector from
    /// the trampoline; the saved instruction pointer lands just past it.
    const TRAP_INSN_LEN: u64;

    /// Context for a fresh kernel thread starting at `entry(arg)`.
    fn kernel_thread(entry: u64, stack_top: u64, arg: u64) -> Self;

    /// Context for a fresh user thread starting at `entry`.
    fn user_thread(entry: u64, stack_top: u64) -> Self;

    /// Returns true if this context resumes in user mode.
    fn is_user(&self) -> bool;

    /// Returns the instruction pointer (RIP on x86, PC on ARM).
    fn instruction_pointer(&self) -> u64;

    /// Sets the instruction pointer.
    fn set_instruction_pointer(&mut self, addr: u64);

    /// Returns the stack pointer (RSP on x86, SP on ARM).
    fn stack_pointer(&self) -> u64;

    /// Sets the stack pointer.
    fn set_stack_pointer(&mut self, addr: u64);

    /// Cached "a signal is deliverable" bit for a thread that is not running.
    fn signal_pending(&self) -> bool;

    fn set_signal_pending(&mut self, pending: bool);

    /// System call number of a syscall trap.
    fn syscall_number(&self) -> u64;

    /// Argument `n` (0-based) of a syscall trap.
    fn syscall_arg(&self, n: usize) -> u64;

    /// Store the raw value returned to user space.
    fn set_syscall_return(&mut self, value: u64);

    /// Pick the address of a signal frame of `size` bytes below `sp`.
    ///
    /// Respects the ABI red zone and leaves the stack aligned as the
    /// handler expects at its first instruction.
    fn signal_frame_placement(sp: u64, size: u64) -> u64;

    /// Redirect this context into a user signal handler.
    ///
    /// `frame` becomes the stack pointer, `args` the first three argument
    /// registers, and `trampoline` the return address for architectures that
    /// return through a link register.
    fn enter_signal_handler(&mut self, handler: u64, frame: u64, trampoline: u64, args: [u64; 3]);

    /// Address of the signal frame implied by this context when it traps
    /// through the sigreturn trampoline.
    fn signal_frame_address(&self) -> u64;

    /// Redirect this context into a kernel routine running on `stack`
    /// with interrupts disabled.
    fn enter_kernel_routine(&mut self, entry: u64, stack: u64);

    /// Encode the user-visible registers into a machine-context record.
    fn encode(&self) -> Self::MContext;

    /// Adopt the user-visible registers of a machine-context record.
    ///
    /// Privilege, segment and interrupt-enable state are never taken from
    /// the record: the result always resumes in user mode.
    fn decode(&mut self, mcontext: &Self::MContext);
}

/// Hardware services consumed by the core.
///
/// One instance exists per machine; the host test harness provides its own.
pub trait Platform: Sync {
    /// Returns true if interrupts are currently enabled.
    fn interrupts_enabled(&self) -> bool;

    /// Disable interrupts.
    fn disable_interrupts(&self);

    /// Enable interrupts.
    fn enable_interrupts(&self);

    /// Raise software trap `vector`.
    ///
    /// The trap dispatcher routes it to [`Cpu::handle_trap`]; when this
    /// returns, the caller has been rescheduled.
    fn raise(&self, cpu: &Cpu, vector: u8);

    /// Idle until the next interrupt.
    fn wait_for_interrupt(&self);

    /// Copy `bytes` to user address `addr`.
    fn copy_to_user(&self, addr: u64, bytes: &[u8]) -> Result<(), Error>;

    /// Fill `bytes` from user address `addr`.
    fn copy_from_user(&self, addr: u64, bytes: &mut [u8]) -> Result<(), Error>;

    /// A fresh unpredictable 64-bit value.
    fn entropy(&self) -> u64;
}

impl dyn Platform {
    /// Run `f` with interrupts disabled, restoring the previous state.
    #[inline]
    pub fn without_interrupts<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let were_enabled = self.interrupts_enabled();
        if were_enabled {
            self.disable_interrupts();
        }
        let result = f();
        if were_enabled {
            self.enable_interrupts();
        }
        result
    }
}
