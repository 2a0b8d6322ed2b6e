//! x86_64 execution context.
//!
//! `CpuContext` is laid out exactly like the trap frame built by the
//! low-level entry stub: general purpose registers first (pushed by
//! software), then the hardware `iretq` frame, then one software-only word
//! caching the thread's "signal pending" bit while it is switched out.

use bytemuck::{Pod, Zeroable};

use crate::arch_impl::traits::ExecutionContext;
use crate::config::RED_ZONE;

/// Kernel code segment selector (GDT index 1, RPL 0)
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data segment selector (GDT index 2, RPL 0)
pub const KERNEL_SS: u64 = 0x10;
/// User data segment selector (GDT index 5, RPL 3)
pub const USER_SS: u64 = 0x2b;
/// User code segment selector (GDT index 6, RPL 3)
pub const USER_CS: u64 = 0x33;

/// Reserved bit 1 of RFLAGS, always set
const RFLAGS_RESERVED: u64 = 1 << 1;
const RFLAGS_TF: u64 = 1 << 8;
const RFLAGS_IF: u64 = 1 << 9;
const RFLAGS_DF: u64 = 1 << 10;

/// Flags user space may change through sigreturn: CF PF AF ZF SF TF DF OF AC
const RFLAGS_USER_MASK: u64 = 0x0004_0dd5;

#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct CpuContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    // Hardware interrupt frame
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,

    /// Nonzero when a signal is deliverable; only meaningful while saved
    pub sigpending: u64,
}

/// Machine context record, in the layout of Linux `struct sigcontext`.
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct MContext {
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rsp: u64,
    pub rip: u64,
    pub eflags: u64,
    pub cs: u16,
    pub gs: u16,
    pub fs: u16,
    pub ss: u16,
    pub err: u64,
    pub trapno: u64,
    pub oldmask: u64,
    pub cr2: u64,
    pub fpstate: u64,
    pub reserved: [u64; 8],
}

impl ExecutionContext for CpuContext {
    type MContext = MContext;

    /// `int imm8` is two bytes (CD ib)
    const TRAP_INSN_LEN: u64 = 2;

    fn kernel_thread(entry: u64, stack_top: u64, arg: u64) -> Self {
        CpuContext {
            rdi: arg,
            rip: entry,
            cs: KERNEL_CS,
            rflags: RFLAGS_RESERVED | RFLAGS_IF,
            // Entry sees the stack as if it had just been called
            rsp: (stack_top & !0xf).wrapping_sub(8),
            ss: KERNEL_SS,
            ..Default::default()
        }
    }

    fn user_thread(entry: u64, stack_top: u64) -> Self {
        CpuContext {
            rip: entry,
            cs: USER_CS,
            rflags: RFLAGS_RESERVED | RFLAGS_IF,
            rsp: stack_top & !0xf,
            ss: USER_SS,
            ..Default::default()
        }
    }

    #[inline]
    fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }

    #[inline]
    fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    #[inline]
    fn set_instruction_pointer(&mut self, addr: u64) {
        self.rip = addr;
    }

    #[inline]
    fn stack_pointer(&self) -> u64 {
        self.rsp
    }

    #[inline]
    fn set_stack_pointer(&mut self, addr: u64) {
        self.rsp = addr;
    }

    #[inline]
    fn signal_pending(&self) -> bool {
        self.sigpending != 0
    }

    #[inline]
    fn set_signal_pending(&mut self, pending: bool) {
        self.sigpending = pending as u64;
    }

    #[inline]
    fn syscall_number(&self) -> u64 {
        self.rax
    }

    fn syscall_arg(&self, n: usize) -> u64 {
        match n {
            0 => self.rdi,
            1 => self.rsi,
            2 => self.rdx,
            3 => self.r10,
            4 => self.r8,
            5 => self.r9,
            _ => 0,
        }
    }

    #[inline]
    fn set_syscall_return(&mut self, value: u64) {
        self.rax = value;
    }

    fn signal_frame_placement(sp: u64, size: u64) -> u64 {
        // Aligned to 16 then offset by 8: the frame's first word is the
        // return address, exactly as after a `call`.
        (sp.wrapping_sub(RED_ZONE).wrapping_sub(size) & !0xf).wrapping_sub(8)
    }

    fn enter_signal_handler(&mut self, handler: u64, frame: u64, _trampoline: u64, args: [u64; 3]) {
        self.rip = handler;
        self.rsp = frame;
        self.rdi = args[0];
        self.rsi = args[1];
        self.rdx = args[2];
        // No vector registers used by a variadic call
        self.rax = 0;
        self.rflags &= !(RFLAGS_DF | RFLAGS_TF);
    }

    #[inline]
    fn signal_frame_address(&self) -> u64 {
        // The handler's `ret` popped the trampoline address off the frame
        self.rsp.wrapping_sub(8)
    }

    fn enter_kernel_routine(&mut self, entry: u64, stack: u64) {
        self.rip = entry;
        self.rsp = stack;
        self.cs = KERNEL_CS;
        self.ss = KERNEL_SS;
        self.rflags = RFLAGS_RESERVED;
    }

    fn encode(&self) -> MContext {
        MContext {
            r8: self.r8,
            r9: self.r9,
            r10: self.r10,
            r11: self.r11,
            r12: self.r12,
            r13: self.r13,
            r14: self.r14,
            r15: self.r15,
            rdi: self.rdi,
            rsi: self.rsi,
            rbp: self.rbp,
            rbx: self.rbx,
            rdx: self.rdx,
            rax: self.rax,
            rcx: self.rcx,
            rsp: self.rsp,
            rip: self.rip,
            eflags: self.rflags,
            cs: self.cs as u16,
            ss: self.ss as u16,
            ..Default::default()
        }
    }

    fn decode(&mut self, mc: &MContext) {
        self.r8 = mc.r8;
        self.r9 = mc.r9;
        self.r10 = mc.r10;
        self.r11 = mc.r11;
        self.r12 = mc.r12;
        self.r13 = mc.r13;
        self.r14 = mc.r14;
        self.r15 = mc.r15;
        self.rdi = mc.rdi;
        self.rsi = mc.rsi;
        self.rbp = mc.rbp;
        self.rbx = mc.rbx;
        self.rdx = mc.rdx;
        self.rax = mc.rax;
        self.rcx = mc.rcx;
        self.rsp = mc.rsp;
        self.rip = mc.rip;
        self.rflags = (mc.eflags & RFLAGS_USER_MASK) | RFLAGS_RESERVED | RFLAGS_IF;
        self.cs = USER_CS;
        self.ss = USER_SS;
    }
}
