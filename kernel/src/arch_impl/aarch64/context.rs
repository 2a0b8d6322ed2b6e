//! ARM64 execution context.
//!
//! Layout matches the exception frame saved by the EL1 vector stub:
//!
//! ```text
//!   Offset   Field
//!   0        x0..x30 (31 x 8 bytes)
//!   248      sp       (SP_EL0 for user frames, SP_EL1 for kernel frames)
//!   256      pc       (ELR_EL1)
//!   264      pstate   (SPSR_EL1)
//!   272      sigpending (software only)
//! ```

use bytemuck::{Pod, Zeroable};

use crate::arch_impl::traits::ExecutionContext;

/// SPSR mode field: EL0 using SP_EL0
const SPSR_EL0T: u64 = 0b0000;
/// SPSR mode field: EL1 using SP_EL1
const SPSR_EL1H: u64 = 0b0101;
const SPSR_MODE_MASK: u64 = 0b1111;
/// D, A, I and F masked
const SPSR_DAIF: u64 = 0xf << 6;
/// Condition flags, the only PSTATE bits user space may set
const SPSR_NZCV: u64 = 0xf << 28;

#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct CpuContext {
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
    pub sigpending: u64,
}

/// Machine context record (Linux `struct sigcontext` without the
/// extension area).
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
#[repr(C)]
pub struct MContext {
    pub fault_address: u64,
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

impl ExecutionContext for CpuContext {
    type MContext = MContext;

    /// `svc #imm16` is one A64 instruction
    const TRAP_INSN_LEN: u64 = 4;

    fn kernel_thread(entry: u64, stack_top: u64, arg: u64) -> Self {
        let mut ctx = CpuContext {
            sp: stack_top & !0xf,
            pc: entry,
            pstate: SPSR_EL1H,
            ..Default::default()
        };
        ctx.x[0] = arg;
        ctx
    }

    fn user_thread(entry: u64, stack_top: u64) -> Self {
        CpuContext {
            sp: stack_top & !0xf,
            pc: entry,
            pstate: SPSR_EL0T,
            ..Default::default()
        }
    }

    #[inline]
    fn is_user(&self) -> bool {
        self.pstate & SPSR_MODE_MASK == SPSR_EL0T
    }

    #[inline]
    fn instruction_pointer(&self) -> u64 {
        self.pc
    }

    #[inline]
    fn set_instruction_pointer(&mut self, addr: u64) {
        self.pc = addr;
    }

    #[inline]
    fn stack_pointer(&self) -> u64 {
        self.sp
    }

    #[inline]
    fn set_stack_pointer(&mut self, addr: u64) {
        self.sp = addr;
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
        self.x[8]
    }

    fn syscall_arg(&self, n: usize) -> u64 {
        if n < 6 {
            self.x[n]
        } else {
            0
        }
    }

    #[inline]
    fn set_syscall_return(&mut self, value: u64) {
        self.x[0] = value;
    }

    fn signal_frame_placement(sp: u64, size: u64) -> u64 {
        sp.wrapping_sub(size) & !0xf
    }

    fn enter_signal_handler(&mut self, handler: u64, frame: u64, trampoline: u64, args: [u64; 3]) {
        self.pc = handler;
        self.sp = frame;
        self.x[0] = args[0];
        self.x[1] = args[1];
        self.x[2] = args[2];
        // Handler returns with `ret`, i.e. to x30
        self.x[30] = trampoline;
    }

    #[inline]
    fn signal_frame_address(&self) -> u64 {
        self.sp
    }

    fn enter_kernel_routine(&mut self, entry: u64, stack: u64) {
        self.pc = entry;
        self.sp = stack;
        self.pstate = SPSR_EL1H | SPSR_DAIF;
    }

    fn encode(&self) -> MContext {
        MContext {
            fault_address: 0,
            regs: self.x,
            sp: self.sp,
            pc: self.pc,
            pstate: self.pstate,
        }
    }

    fn decode(&mut self, mc: &MContext) {
        self.x = mc.regs;
        self.sp = mc.sp;
        self.pc = mc.pc;
        self.pstate = (mc.pstate & SPSR_NZCV) | SPSR_EL0T;
    }
}
