//! System call infrastructure
//!
//! System calls enter through INT 0x80 (Linux-style) with the number in RAX
//! (X8 on ARM64). The trap handler hands the saved frame to [`dispatch`] and
//! stores the returned value back into the frame.

pub mod errno;
pub mod signal;
pub mod userptr;

use crate::arch_impl::{CpuContext, ExecutionContext};
use crate::error::Error;
use crate::task::Cpu;

/// System call numbers following Linux x86_64 conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallNumber {
    RtSigaction = 13,
    RtSigprocmask = 14,
    RtSigreturn = 15,
    SchedYield = 24,
    GetPid = 39,
    Exit = 60,
    Kill = 62,
    RtSigpending = 127,
    RtSigsuspend = 130,
    Sigaltstack = 131,
    GetTid = 186,
    Tkill = 200,
}

impl SyscallNumber {
    /// Try to convert a u64 to a SyscallNumber
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            13 => Some(Self::RtSigaction),
            14 => Some(Self::RtSigprocmask),
            15 => Some(Self::RtSigreturn),
            24 => Some(Self::SchedYield),
            39 => Some(Self::GetPid),
            60 => Some(Self::Exit),
            62 => Some(Self::Kill),
            127 => Some(Self::RtSigpending),
            130 => Some(Self::RtSigsuspend),
            131 => Some(Self::Sigaltstack),
            186 => Some(Self::GetTid),
            200 => Some(Self::Tkill),
            _ => None,
        }
    }
}

/// System call result type; `Err` carries a positive errno
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallResult {
    Ok(u64),
    Err(u64),
}

impl SyscallResult {
    /// Value placed in the return register: the result, or `-errno`
    pub fn into_raw(self) -> u64 {
        match self {
            SyscallResult::Ok(value) => value,
            SyscallResult::Err(errno) => (errno as i64).wrapping_neg() as u64,
        }
    }
}

impl From<Result<u64, Error>> for SyscallResult {
    fn from(result: Result<u64, Error>) -> Self {
        match result {
            Ok(value) => SyscallResult::Ok(value),
            // Advisory: the signal was already pending
            Err(Error::Duplicate) => SyscallResult::Ok(0),
            Err(err) => SyscallResult::Err(err.to_errno() as u64),
        }
    }
}

/// Run the system call described by `frame`.
pub fn dispatch(cpu: &Cpu, frame: &CpuContext) -> SyscallResult {
    let number = frame.syscall_number();
    let arg = |n| frame.syscall_arg(n);

    let syscall = match SyscallNumber::from_u64(number) {
        Some(syscall) => syscall,
        None => {
            log::warn!("Unknown syscall number {}", number);
            return SyscallResult::Err(errno::ENOSYS as u64);
        }
    };

    match syscall {
        SyscallNumber::RtSigaction => signal::sys_sigaction(cpu, arg(0) as i32, arg(1), arg(2), arg(3)),
        SyscallNumber::RtSigprocmask => {
            signal::sys_sigprocmask(cpu, arg(0) as i32, arg(1), arg(2), arg(3))
        }
        SyscallNumber::RtSigreturn => {
            // Taken by the trap handler before we get here
            log::warn!("rt_sigreturn reached the syscall table");
            SyscallResult::Err(errno::ENOSYS as u64)
        }
        SyscallNumber::SchedYield => {
            cpu.yield_now();
            SyscallResult::Ok(0)
        }
        SyscallNumber::GetPid => SyscallResult::Ok(cpu.current_process().pid().as_u64()),
        SyscallNumber::Exit => cpu.exit_thread(arg(0) as i32),
        SyscallNumber::Kill => signal::sys_kill(cpu, arg(0) as i64, arg(1) as i32),
        SyscallNumber::RtSigpending => signal::sys_sigpending(cpu, arg(0), arg(1)),
        SyscallNumber::RtSigsuspend => signal::sys_sigsuspend(cpu, arg(0), arg(1)),
        SyscallNumber::Sigaltstack => {
            signal::sys_sigaltstack(cpu, arg(0), arg(1), frame.stack_pointer())
        }
        SyscallNumber::GetTid => SyscallResult::Ok(cpu.current_thread().tid().0),
        SyscallNumber::Tkill => signal::sys_tkill(cpu, arg(0) as i64, arg(1) as i32),
    }
}
