//! ARM64 platform services.
//!
//! Interrupt control goes through the DAIF register:
//! - `msr daifset, #2`: mask IRQs
//! - `msr daifclr, #2`: unmask IRQs
//! - `mrs reg, daif`: read the mask (bit 7 is I)
//!
//! Software traps are `svc #vector` issued at EL1; the synchronous exception
//! handler reads the immediate from ESR_EL1 and calls [`Cpu::handle_trap`].

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch_impl::traits::Platform;
use crate::config::{
    PREEMPT_VECTOR, SIGNAL_DISPATCH_VECTOR, SIGRETURN_VECTOR, SYSCALL_VECTOR, THREAD_EXIT_VECTOR,
    YIELD_VECTOR,
};
use crate::error::Error;
use crate::syscall::userptr::validate_user_range;
use crate::task::Cpu;

/// I bit of DAIF
const DAIF_IRQ_BIT: u64 = 1 << 7;

core::arch::global_asm!(
    ".global kcore_signal_dispatch_entry",
    "kcore_signal_dispatch_entry:",
    // SIGNAL_DISPATCH_VECTOR
    "svc #0x82",
    "brk #0",
);

extern "C" {
    fn kcore_signal_dispatch_entry();
}

/// Kernel address the synthetic dispatch frame resumes at.
#[inline]
pub fn signal_dispatch_entry() -> u64 {
    kcore_signal_dispatch_entry as *const () as usize as u64
}

/// Read the virtual counter
#[inline(always)]
fn read_cntvct() -> u64 {
    let val: u64;
    // SAFETY: reading CNTVCT_EL0 has no side effects
    unsafe {
        core::arch::asm!("mrs {}, cntvct_el0", out(reg) val, options(nomem, nostack));
    }
    val
}

pub struct Aarch64Platform {
    prng: AtomicU64,
}

impl Aarch64Platform {
    pub const fn new() -> Self {
        Aarch64Platform {
            prng: AtomicU64::new(0),
        }
    }
}

impl Platform for Aarch64Platform {
    #[inline]
    fn interrupts_enabled(&self) -> bool {
        let daif: u64;
        // SAFETY: reading DAIF has no side effects
        unsafe {
            core::arch::asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack));
        }
        (daif & DAIF_IRQ_BIT) == 0
    }

    #[inline]
    fn disable_interrupts(&self) {
        // SAFETY: masking IRQs at EL1 is always permitted
        unsafe {
            core::arch::asm!("msr daifset, #2", options(nomem, nostack));
        }
    }

    #[inline]
    fn enable_interrupts(&self) {
        // SAFETY: the vector table is installed before the core runs
        unsafe {
            core::arch::asm!("msr daifclr, #2", options(nomem, nostack));
        }
    }

    fn raise(&self, _cpu: &Cpu, vector: u8) {
        // SAFETY: the EL1 synchronous handler dispatches every vector below
        unsafe {
            match vector {
                SYSCALL_VECTOR => core::arch::asm!("svc #0x80"),
                YIELD_VECTOR => core::arch::asm!("svc #0x81"),
                SIGNAL_DISPATCH_VECTOR => core::arch::asm!("svc #0x82"),
                SIGRETURN_VECTOR => core::arch::asm!("svc #0x83"),
                THREAD_EXIT_VECTOR => core::arch::asm!("svc #0x84"),
                PREEMPT_VECTOR => core::arch::asm!("svc #0x20"),
                other => log::error!("raise: no handler for vector {:#x}", other),
            }
        }
    }

    #[inline]
    fn wait_for_interrupt(&self) {
        // SAFETY: enable IRQs then WFI so a pending interrupt is never missed
        unsafe {
            core::arch::asm!("msr daifclr, #2", "wfi", options(nomem, nostack));
        }
    }

    fn copy_to_user(&self, addr: u64, bytes: &[u8]) -> Result<(), Error> {
        validate_user_range(addr, bytes.len() as u64)?;
        // SAFETY: range validated to lie in TTBR0 space
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        Ok(())
    }

    fn copy_from_user(&self, addr: u64, bytes: &mut [u8]) -> Result<(), Error> {
        validate_user_range(addr, bytes.len() as u64)?;
        // SAFETY: as above
        unsafe {
            core::ptr::copy_nonoverlapping(addr as *const u8, bytes.as_mut_ptr(), bytes.len());
        }
        Ok(())
    }

    fn entropy(&self) -> u64 {
        // xorshift64* seeded from the counter
        let mut x = self.prng.load(Ordering::Relaxed);
        if x == 0 {
            x = read_cntvct() | 1;
        }
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.prng.store(x, Ordering::Relaxed);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d) ^ read_cntvct()
    }
}
