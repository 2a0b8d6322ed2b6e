//! Signal-related system calls
//!
//! This module implements the signal syscalls:
//! - kill(pid, sig) - Send signal to a process or process group
//! - tkill(tid, sig) - Send signal to a thread of the caller's process
//! - sigaction(sig, act, oldact, sigsetsize) - Set signal handler
//! - sigprocmask(how, set, oldset, sigsetsize) - Block/unblock signals
//! - sigpending(set, sigsetsize) - Query blocked pending signals
//! - sigsuspend(mask, sigsetsize) - Wait for a signal with a temporary mask
//! - sigaltstack(ss, old_ss) - Configure the alternate signal stack
//!
//! rt_sigreturn never gets here; the trap handler routes it straight to
//! [`crate::signal::sigreturn`], which needs the live frame.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::errno::{EINTR, EINVAL, ESRCH};
use super::userptr::{read_user, write_user};
use super::SyscallResult;
use crate::error::Error;
use crate::process::{Process, ProcessId};
use crate::signal::constants::*;
use crate::signal::delivery::{recompute_all, recompute_pending, with_signals};
use crate::signal::types::{AltStack, SigOrigin, SigSet, SignalAction, StackT};
use crate::signal::{deliver, deliver_to_process};
use crate::task::{Cpu, ThreadState};

/// Size in bytes of the kernel's sigset_t
const SIGSET_SIZE: u64 = 8;

/// kill(pid, sig) - Send signal to a process
///
/// # Arguments
/// * `pid` - Target process ID (positive), or special values:
///   * pid > 0: Send to process with that PID
///   * pid == 0: Send to all processes in caller's process group
///   * pid == -1: Send to every process except the caller
///   * pid < -1: Send to process group -pid
/// * `sig` - Signal number to send (1-64), or 0 to check if the target exists
///
/// # Returns
/// * 0 on success
/// * -EINVAL (22) for invalid signal number
/// * -ESRCH (3) if no such process
pub fn sys_kill(cpu: &Cpu, pid: i64, sig: i32) -> SyscallResult {
    if sig < 0 || sig as u32 > NSIG {
        log::warn!("sys_kill: invalid signal number {}", sig);
        return SyscallResult::Err(EINVAL as u64);
    }
    let sig = sig as u32;

    let me = cpu.current_process();
    let targets: Vec<Arc<Process>> = if pid > 0 {
        cpu.process(ProcessId::new(pid as u64)).into_iter().collect()
    } else if pid == 0 {
        cpu.processes_in_group(me.pgid())
    } else if pid == -1 {
        cpu.all_processes()
            .into_iter()
            .filter(|p| p.pid() != me.pid())
            .collect()
    } else {
        cpu.processes_in_group(ProcessId::new(pid.unsigned_abs()))
    };

    let origin = SigOrigin::user(me.pid().as_u64());
    let mut delivered = false;
    for process in &targets {
        match deliver_to_process(cpu, process, sig, origin) {
            Ok(()) | Err(Error::Duplicate) => delivered = true,
            Err(err) => log::debug!(
                "sys_kill: {} to process {} failed: {}",
                signal_name(sig),
                process.pid(),
                err
            ),
        }
    }

    if delivered {
        log::debug!("sys_kill: {} sent to pid {}", signal_name(sig), pid);
        SyscallResult::Ok(0)
    } else {
        SyscallResult::Err(ESRCH as u64)
    }
}

/// tkill(tid, sig) - Send signal to one thread of the calling process
///
/// # Returns
/// * 0 on success
/// * -EINVAL (22) for invalid arguments
/// * -ESRCH (3) if the caller's process has no live thread `tid`
pub fn sys_tkill(cpu: &Cpu, tid: i64, sig: i32) -> SyscallResult {
    if tid <= 0 || sig < 0 || sig as u32 > NSIG {
        return SyscallResult::Err(EINVAL as u64);
    }

    let me = cpu.current_process();
    let target = me.threads().into_iter().find(|t| {
        t.tid().0 == tid as u64
            && matches!(
                cpu.thread_state(t.id()),
                Some(ThreadState::Runnable) | Some(ThreadState::Blocked)
            )
    });
    let target = match target {
        Some(thread) => thread,
        None => return SyscallResult::Err(ESRCH as u64),
    };

    deliver(cpu, &target, sig as u32, SigOrigin::user(me.pid().as_u64()))
        .map(|()| 0)
        .into()
}

/// rt_sigaction(sig, act, oldact, sigsetsize) - Set signal handler
///
/// # Arguments
/// * `sig` - Signal number (1-64, cannot be SIGKILL or SIGSTOP)
/// * `new_act` - Pointer to new SignalAction, or 0 to query current
/// * `old_act` - Pointer to store old SignalAction, or 0 to not store
/// * `sigsetsize` - Size of signal set (must be 8)
///
/// # Returns
/// * 0 on success
/// * -EINVAL (22) for invalid arguments
/// * -EFAULT (14) for bad pointers
pub fn sys_sigaction(
    cpu: &Cpu,
    sig: i32,
    new_act: u64,
    old_act: u64,
    sigsetsize: u64,
) -> SyscallResult {
    if sig <= 0 || sig as u32 > NSIG || sigsetsize != SIGSET_SIZE {
        return SyscallResult::Err(EINVAL as u64);
    }
    let sig = sig as u32;

    // Cannot change handler for SIGKILL or SIGSTOP
    if new_act != 0 && !is_catchable(sig) {
        log::warn!(
            "sys_sigaction: cannot set handler for {} (uncatchable)",
            signal_name(sig)
        );
        return SyscallResult::Err(EINVAL as u64);
    }

    let new_action = if new_act != 0 {
        match read_user::<SignalAction>(cpu, new_act) {
            Ok(action) => Some(action),
            Err(err) => return Err(err).into(),
        }
    } else {
        None
    };

    let process = cpu.current_process();
    let old_action = with_signals(cpu, &process, |state| {
        let old = state.action(sig);
        if let Some(action) = new_action {
            // Sanitize the mask - cannot block SIGKILL or SIGSTOP
            let sanitized = SignalAction {
                handler: action.handler,
                flags: action.flags & SA_KNOWN_FLAGS,
                restorer: action.restorer,
                mask: action.mask & !UNCATCHABLE_SIGNALS,
            };
            state.set_action(sig, sanitized);
            log::debug!(
                "Signal {} ({}) handler set to {:#x} for process {}",
                sig,
                signal_name(sig),
                sanitized.handler,
                process.pid()
            );
            // Ignoring a signal discards it if pending
            recompute_all(cpu, &process, state);
        }
        old
    });

    if old_act != 0 {
        if let Err(err) = write_user(cpu, old_act, &old_action) {
            return Err(err).into();
        }
    }
    SyscallResult::Ok(0)
}

/// rt_sigprocmask(how, set, oldset, sigsetsize) - Block/unblock signals
///
/// # Arguments
/// * `how` - SIG_BLOCK (0), SIG_UNBLOCK (1), or SIG_SETMASK (2)
/// * `new_set` - Pointer to u64 signal mask, or 0 to not change
/// * `old_set` - Pointer to store old mask, or 0 to not store
/// * `sigsetsize` - Size of signal set (must be 8)
///
/// # Returns
/// * 0 on success
/// * -EINVAL (22) for invalid arguments
/// * -EFAULT (14) for bad pointers
pub fn sys_sigprocmask(
    cpu: &Cpu,
    how: i32,
    new_set: u64,
    old_set: u64,
    sigsetsize: u64,
) -> SyscallResult {
    if sigsetsize != SIGSET_SIZE {
        return SyscallResult::Err(EINVAL as u64);
    }
    if new_set != 0 && how != SIG_BLOCK && how != SIG_UNBLOCK && how != SIG_SETMASK {
        log::warn!("sys_sigprocmask: invalid 'how' value {}", how);
        return SyscallResult::Err(EINVAL as u64);
    }

    let set = if new_set != 0 {
        match read_user::<u64>(cpu, new_set) {
            Ok(bits) => Some(SigSet::from_bits(bits)),
            Err(err) => return Err(err).into(),
        }
    } else {
        None
    };

    let thread = cpu.current_thread();
    let process = thread.process();
    let id = thread.id();
    let old = with_signals(cpu, process, |state| {
        let t = state.thread_mut(id)?;
        let old = t.mask;
        if let Some(set) = set {
            let mask = match how {
                SIG_BLOCK => old.union(set),
                SIG_UNBLOCK => old.difference(set),
                _ => set,
            };
            t.set_mask(mask);
            recompute_pending(cpu, process, state, id);
        }
        Some(old)
    });

    let old = match old {
        Some(old) => old,
        None => return SyscallResult::Err(ESRCH as u64),
    };
    if old_set != 0 {
        if let Err(err) = write_user(cpu, old_set, &old.bits()) {
            return Err(err).into();
        }
    }
    SyscallResult::Ok(0)
}

/// rt_sigpending(set, sigsetsize) - Signals pending while blocked
///
/// Reports thread- and process-directed pending signals that the calling
/// thread currently blocks.
pub fn sys_sigpending(cpu: &Cpu, set_ptr: u64, sigsetsize: u64) -> SyscallResult {
    if sigsetsize != SIGSET_SIZE {
        return SyscallResult::Err(EINVAL as u64);
    }

    let thread = cpu.current_thread();
    let id = thread.id();
    let pending = with_signals(cpu, thread.process(), |state| {
        state.thread(id).map(|t| {
            t.pending
                .set()
                .union(state.pending.set())
                .intersect(t.mask)
        })
    });

    match pending {
        Some(set) => write_user(cpu, set_ptr, &set.bits()).map(|()| 0).into(),
        None => SyscallResult::Err(ESRCH as u64),
    }
}

/// rt_sigsuspend(mask, sigsetsize) - Wait for a signal
///
/// Replaces the mask until a signal is delivered. The original mask goes
/// into the handler's frame (and comes back with sigreturn), or is restored
/// directly if no handler runs. Always fails with -EINTR.
pub fn sys_sigsuspend(cpu: &Cpu, mask_ptr: u64, sigsetsize: u64) -> SyscallResult {
    if sigsetsize != SIGSET_SIZE {
        return SyscallResult::Err(EINVAL as u64);
    }
    let mask = match read_user::<u64>(cpu, mask_ptr) {
        Ok(bits) => SigSet::from_bits(bits),
        Err(err) => return Err(err).into(),
    };

    let thread = cpu.current_thread();
    let process = thread.process();
    let id = thread.id();
    with_signals(cpu, process, |state| {
        if let Some(t) = state.thread_mut(id) {
            t.saved_mask = Some(t.mask);
            t.set_mask(mask);
        }
        recompute_pending(cpu, process, state, id);
    });

    // Nobody wakes the sleep word; only a signal ends the wait
    while !cpu.signal_pending() {
        thread.sleep_word.store(0, core::sync::atomic::Ordering::Release);
        if let Err(Error::Interrupted) = cpu.kutex().wait(cpu, &thread.sleep_word, 0, true) {
            break;
        }
    }

    SyscallResult::Err(EINTR as u64)
}

/// sigaltstack(ss, old_ss) - Set and/or get the alternate signal stack
///
/// # Arguments
/// * `ss` - Pointer to the new stack_t, or 0 to leave it unchanged
/// * `old_ss` - Pointer to store the current stack_t, or 0
/// * `sp` - The caller's user stack pointer
///
/// # Returns
/// * 0 on success
/// * -EPERM (1) when changing the stack while executing on it
/// * -ENOMEM (12) if the new stack is smaller than MINSIGSTKSZ
/// * -EINVAL (22) for unknown flags
/// * -EFAULT (14) for bad pointers
pub fn sys_sigaltstack(cpu: &Cpu, ss: u64, old_ss: u64, sp: u64) -> SyscallResult {
    let new_stack = if ss != 0 {
        match read_user::<StackT>(cpu, ss) {
            Ok(stack) => Some(stack),
            Err(err) => return Err(err).into(),
        }
    } else {
        None
    };

    let thread = cpu.current_thread();
    let id = thread.id();
    let result = with_signals(cpu, thread.process(), |state| {
        let t = state.thread_mut(id).ok_or(Error::NoSuchProcess)?;
        let old = t.altstack.to_user(sp);

        if let Some(stack) = new_stack {
            if t.altstack.contains(sp) {
                return Err(Error::PermissionDenied);
            }
            // SS_ONSTACK is accepted and ignored, as on Linux
            let flags = stack.ss_flags & !SS_ONSTACK;
            t.altstack = if flags & SS_DISABLE != 0 {
                AltStack::default()
            } else if flags & !SS_AUTODISARM != 0 {
                return Err(Error::InvalidArgument);
            } else if stack.ss_size < MINSIGSTKSZ {
                return Err(Error::NoMemory);
            } else if stack.ss_sp.checked_add(stack.ss_size).is_none() {
                return Err(Error::InvalidArgument);
            } else {
                AltStack {
                    base: stack.ss_sp,
                    size: stack.ss_size,
                    flags,
                }
            };
        }
        Ok(old)
    });

    let old = match result {
        Ok(old) => old,
        Err(err) => return Err(err).into(),
    };
    if old_ss != 0 {
        if let Err(err) = write_user(cpu, old_ss, &old) {
            return Err(err).into();
        }
    }
    SyscallResult::Ok(0)
}
