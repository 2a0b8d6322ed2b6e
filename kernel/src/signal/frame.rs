//! Signal frame pushed to the user stack when a handler is entered
//!
//! Everything sigreturn needs to resume the interrupted code lives here,
//! together with a canary binding the frame to its address and to a
//! per-thread secret. The frame is plain old data: it is built in kernel
//! memory and copied out in one piece.

use bytemuck::{Pod, Zeroable};

use super::types::{SigInfo, StackT};
use crate::arch_impl::MContext;

/// CRITICAL: `ret_addr` MUST be at offset 0. On x86_64 the handler's `ret`
/// pops it; RSP points at the start of the frame on handler entry.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct SignalFrame {
    /// Address of the sigreturn trampoline
    pub ret_addr: u64,
    pub signo: u64,
    /// User address of `info`
    pub info_ptr: u64,
    /// User address of `mcontext`
    pub context_ptr: u64,
    /// `secret ^ frame address`
    pub canary: u64,
    /// Mask to restore on return
    pub saved_mask: u64,
    /// Alternate stack to restore on return
    pub saved_altstack: StackT,
    pub info: SigInfo,
    /// Interrupted user registers
    pub mcontext: MContext,
}

impl SignalFrame {
    /// Size of the signal frame in bytes
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// User address of the `info` field for a frame at `frame`
    pub const fn info_addr(frame: u64) -> u64 {
        frame + core::mem::offset_of!(SignalFrame, info) as u64
    }

    /// User address of the `mcontext` field for a frame at `frame`
    pub const fn context_addr(frame: u64) -> u64 {
        frame + core::mem::offset_of!(SignalFrame, mcontext) as u64
    }

    #[inline]
    pub const fn canary_for(secret: u64, frame: u64) -> u64 {
        secret ^ frame
    }
}
