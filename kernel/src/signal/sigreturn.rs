//! Return from a signal handler
//!
//! A signal frame sits in user memory, so user code can forge one and ask
//! the kernel to "restore" arbitrary registers (sigreturn-oriented
//! programming). A return is only honoured if it arrives through the
//! trampoline, a handler is actually in flight, the frame is where delivery
//! put it and its canary matches the thread's secret. Anything else kills
//! the process with SIGABRT without adopting any register state.

use core::fmt;

use bytemuck::Zeroable;

use super::constants::*;
use super::delivery::{dispatch, recompute_pending, with_signals};
use super::frame::SignalFrame;
use super::trampoline;
use super::types::{AltStack, SigSet};
use crate::arch_impl::{CpuContext, ExecutionContext};
use crate::syscall::userptr::{read_user, write_user};
use crate::task::Cpu;

/// Reason a sigreturn was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forgery {
    /// The trap did not come from the trampoline
    BadReturnAddress { ip: u64 },
    /// No handler is running
    NothingInFlight,
    /// The stack pointer does not match the only in-flight frame
    StackMismatch { expected: u64, found: u64 },
    /// The frame could not be read
    Unreadable { frame: u64 },
    /// The canary does not match
    BadCanary { frame: u64 },
    /// The saved alternate stack is malformed
    BadAltStack { frame: u64 },
    /// The frame could not be scrubbed
    Unwritable { frame: u64 },
}

impl fmt::Display for Forgery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Forgery::BadReturnAddress { ip } => {
                write!(f, "return address {:#x} is not the trampoline", ip)
            }
            Forgery::NothingInFlight => f.write_str("no signal handler in flight"),
            Forgery::StackMismatch { expected, found } => write!(
                f,
                "frame at {:#x} but the handler frame is at {:#x}",
                found, expected
            ),
            Forgery::Unreadable { frame } => write!(f, "frame at {:#x} is unreadable", frame),
            Forgery::BadCanary { frame } => write!(f, "canary mismatch in frame at {:#x}", frame),
            Forgery::BadAltStack { frame } => {
                write!(f, "malformed alternate stack in frame at {:#x}", frame)
            }
            Forgery::Unwritable { frame } => write!(f, "frame at {:#x} is unwritable", frame),
        }
    }
}

/// Handle a trap through the sigreturn trampoline.
///
/// On success the live frame resumes the interrupted code; signals that
/// became deliverable meanwhile (for example through the restored mask) are
/// dispatched before returning.
pub fn sigreturn(cpu: &Cpu, frame: &mut CpuContext) {
    let thread = cpu.current_thread();
    let process = thread.process().clone();

    if let Err(forgery) = restore(cpu, frame) {
        log::error!(
            "sigreturn: forged signal frame in process {} ('{}'), thread {}: {}",
            process.pid(),
            process.name(),
            thread.tid(),
            forgery
        );
        cpu.terminate_process(&process, SIGABRT);
    }

    drop(thread);
    dispatch(cpu, frame);
}

fn restore(cpu: &Cpu, frame: &mut CpuContext) -> Result<(), Forgery> {
    let ip = frame.instruction_pointer();
    if ip != trampoline::return_address() {
        return Err(Forgery::BadReturnAddress { ip });
    }

    let thread = cpu.current_thread();
    let process = thread.process();
    let id = thread.id();
    let addr = frame.signal_frame_address();

    with_signals(cpu, process, |state| {
        let t = state.thread_mut(id).ok_or(Forgery::NothingInFlight)?;
        if t.in_flight == 0 {
            return Err(Forgery::NothingInFlight);
        }
        if t.in_flight == 1 {
            if let Some(expected) = t.single_frame {
                if expected != addr {
                    return Err(Forgery::StackMismatch {
                        expected,
                        found: addr,
                    });
                }
            }
        }

        let saved: SignalFrame =
            read_user(cpu, addr).map_err(|_| Forgery::Unreadable { frame: addr })?;
        let secret = t.secret.ok_or(Forgery::BadCanary { frame: addr })?;
        if saved.canary != SignalFrame::canary_for(secret, addr) {
            return Err(Forgery::BadCanary { frame: addr });
        }
        let altstack =
            AltStack::from_saved(&saved.saved_altstack).ok_or(Forgery::BadAltStack { frame: addr })?;

        // A frame is good for exactly one return
        write_user(cpu, addr, &SignalFrame::zeroed())
            .map_err(|_| Forgery::Unwritable { frame: addr })?;

        t.set_mask(SigSet::from_bits(saved.saved_mask));
        t.altstack = altstack;
        t.in_flight -= 1;
        t.single_frame = None;
        frame.decode(&saved.mcontext);

        log::debug!(
            "process {}: sigreturn from {} frame at {:#x}",
            process.pid(),
            signal_name(saved.signo as u32),
            addr
        );
        recompute_pending(cpu, process, state, id);
        Ok(())
    })
}
