//! x86_64 platform services.
//!
//! Interrupt control goes through the `x86_64` crate; software traps are
//! `int n` with the vector numbers fixed in [`crate::config`]. The IDT
//! entries for those vectors must route to [`Cpu::handle_trap`].

use core::sync::atomic::{AtomicU64, Ordering};

use ::x86_64::instructions::interrupts;
use ::x86_64::instructions::random::RdRand;

use crate::arch_impl::traits::Platform;
use crate::config::{
    PREEMPT_VECTOR, SIGNAL_DISPATCH_VECTOR, SIGRETURN_VECTOR, SYSCALL_VECTOR, THREAD_EXIT_VECTOR,
    YIELD_VECTOR,
};
use crate::error::Error;
use crate::syscall::userptr::validate_user_range;
use crate::task::Cpu;

core::arch::global_asm!(
    ".global kcore_signal_dispatch_entry",
    "kcore_signal_dispatch_entry:",
    // SIGNAL_DISPATCH_VECTOR
    "int 0x82",
    "ud2",
);

extern "C" {
    fn kcore_signal_dispatch_entry();
}

/// Kernel address the synthetic dispatch frame resumes at.
#[inline]
pub fn signal_dispatch_entry() -> u64 {
    kcore_signal_dispatch_entry as *const () as usize as u64
}

/// Read the Time Stamp Counter.
#[inline(always)]
fn read_tsc() -> u64 {
    // SAFETY: rdtsc has no side effects
    unsafe { core::arch::x86_64::_rdtsc() }
}

pub struct X86Platform {
    /// xorshift64* state, used when RDRAND is unavailable
    prng: AtomicU64,
}

impl X86Platform {
    pub const fn new() -> Self {
        X86Platform {
            prng: AtomicU64::new(0),
        }
    }

    fn xorshift(&self) -> u64 {
        let mut x = self.prng.load(Ordering::Relaxed);
        if x == 0 {
            x = read_tsc() | 1;
        }
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.prng.store(x, Ordering::Relaxed);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }
}

impl Platform for X86Platform {
    #[inline]
    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    #[inline]
    fn disable_interrupts(&self) {
        interrupts::disable();
    }

    #[inline]
    fn enable_interrupts(&self) {
        interrupts::enable();
    }

    fn raise(&self, _cpu: &Cpu, vector: u8) {
        // SAFETY: each vector has an IDT gate installed by the trap
        // dispatcher; the handler returns through iretq.
        unsafe {
            match vector {
                SYSCALL_VECTOR => core::arch::asm!("int 0x80"),
                YIELD_VECTOR => core::arch::asm!("int 0x81"),
                SIGNAL_DISPATCH_VECTOR => core::arch::asm!("int 0x82"),
                SIGRETURN_VECTOR => core::arch::asm!("int 0x83"),
                THREAD_EXIT_VECTOR => core::arch::asm!("int 0x84"),
                PREEMPT_VECTOR => core::arch::asm!("int 0x20"),
                other => log::error!("raise: no gate for vector {:#x}", other),
            }
        }
    }

    #[inline]
    fn wait_for_interrupt(&self) {
        interrupts::enable_and_hlt();
    }

    fn copy_to_user(&self, addr: u64, bytes: &[u8]) -> Result<(), Error> {
        validate_user_range(addr, bytes.len() as u64)?;
        // SAFETY: the range lies entirely in the user half; faults on
        // unmapped pages are resolved by the page fault handler.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        Ok(())
    }

    fn copy_from_user(&self, addr: u64, bytes: &mut [u8]) -> Result<(), Error> {
        validate_user_range(addr, bytes.len() as u64)?;
        // SAFETY: as for copy_to_user
        unsafe {
            core::ptr::copy_nonoverlapping(addr as *const u8, bytes.as_mut_ptr(), bytes.len());
        }
        Ok(())
    }

    fn entropy(&self) -> u64 {
        match RdRand::new().and_then(|rng| rng.get_u64()) {
            Some(value) => value,
            None => self.xorshift() ^ read_tsc(),
        }
    }
}
