//! Signal delivery, handler frames and sigreturn on the host harness
//!
//! User threads here run closures standing in for user code; handlers are
//! closures registered at `HANDLER` and `OTHER_HANDLER`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use super::constants::*;
use super::delivery::{deliverable, recompute_all, with_signals};
use super::frame::SignalFrame;
use super::trampoline;
use super::types::{SigInfo, SigOrigin, SigSet, SignalAction, StackT};
use crate::arch_impl::ExecutionContext;
use crate::config::SIGRETURN_VECTOR;
use crate::process::{ExitStatus, Process};
use crate::syscall::errno::*;
use crate::syscall::SyscallNumber;
use crate::task::Thread;
use crate::test_harness::{Harness, UserCpu, SCRATCH};

const HANDLER: u64 = 0x40_1000;
const OTHER_HANDLER: u64 = 0x40_2000;

const ACT: u64 = SCRATCH;
const OLD_ACT: u64 = SCRATCH + 0x40;
const SET: u64 = SCRATCH + 0x80;
const OLD_SET: u64 = SCRATCH + 0x88;
const SS: u64 = SCRATCH + 0xc0;
const OLD_SS: u64 = SCRATCH + 0xe0;

const ALT_BASE: u64 = 0x3000_0000;
const ALT_SIZE: u64 = 0x4000;

/// Distance from a signal frame to the stack pointer after the handler's
/// return popped into the trampoline
#[cfg(not(target_arch = "aarch64"))]
const RETURN_SP_OFFSET: u64 = 8;
#[cfg(target_arch = "aarch64")]
const RETURN_SP_OFFSET: u64 = 0;

type Log = Arc<StdMutex<Vec<String>>>;

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn note(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

fn err(errno: i32) -> i64 {
    -(errno as i64)
}

// ----------------------------------------------------------------------
// User-side helpers
// ----------------------------------------------------------------------

fn sigaction(user: &mut UserCpu, sig: u32, handler: u64, flags: u64, mask: SigSet) -> i64 {
    let action = SignalAction {
        handler,
        flags,
        restorer: 0,
        mask: mask.bits(),
    };
    user.harness().write(ACT, &action);
    user.syscall(SyscallNumber::RtSigaction, &[sig as u64, ACT, 0, 8])
}

fn action_of(user: &mut UserCpu, sig: u32) -> SignalAction {
    assert_eq!(
        user.syscall(SyscallNumber::RtSigaction, &[sig as u64, 0, OLD_ACT, 8]),
        0
    );
    user.harness().read(OLD_ACT)
}

fn sigprocmask(user: &mut UserCpu, how: i32, set: SigSet) -> i64 {
    user.harness().write(SET, &set.bits());
    user.syscall(SyscallNumber::RtSigprocmask, &[how as u64, SET, 0, 8])
}

fn blocked(user: &mut UserCpu) -> SigSet {
    assert_eq!(
        user.syscall(SyscallNumber::RtSigprocmask, &[0, 0, OLD_SET, 8]),
        0
    );
    SigSet::from_bits(user.harness().read(OLD_SET))
}

fn sigpending(user: &mut UserCpu) -> SigSet {
    assert_eq!(user.syscall(SyscallNumber::RtSigpending, &[OLD_SET, 8]), 0);
    SigSet::from_bits(user.harness().read(OLD_SET))
}

fn getpid(user: &mut UserCpu) -> i64 {
    user.syscall(SyscallNumber::GetPid, &[])
}

fn kill(user: &mut UserCpu, pid: i64, sig: u32) -> i64 {
    user.syscall(SyscallNumber::Kill, &[pid as u64, sig as u64])
}

fn raise(user: &mut UserCpu, sig: u32) -> i64 {
    let pid = getpid(user);
    kill(user, pid, sig)
}

fn sigaltstack(user: &mut UserCpu, new: Option<StackT>) -> (i64, StackT) {
    let ss = match new {
        Some(stack) => {
            user.harness().write(SS, &stack);
            SS
        }
        None => 0,
    };
    let result = user.syscall(SyscallNumber::Sigaltstack, &[ss, OLD_SS]);
    (result, user.harness().read(OLD_SS))
}

fn stack(ss_sp: u64, ss_size: u64, ss_flags: i32) -> StackT {
    StackT {
        ss_sp,
        ss_flags,
        _pad: 0,
        ss_size,
    }
}

/// Trap through the trampoline as if a handler running on the frame at
/// `frame` had returned.
fn fake_trampoline_return(user: &mut UserCpu, frame: u64) {
    let mut regs = user.regs();
    regs.set_stack_pointer(frame + RETURN_SP_OFFSET);
    regs.set_instruction_pointer(trampoline::return_address());
    user.set_regs(regs);
    user.trap(SIGRETURN_VECTOR);
}

// ----------------------------------------------------------------------
// Kernel-side inspection
// ----------------------------------------------------------------------

fn thread_pending(h: &Harness, thread: &Thread) -> SigSet {
    with_signals(h.cpu, thread.process(), |state| {
        state
            .thread(thread.id())
            .map_or(SigSet::EMPTY, |t| t.pending.set())
    })
}

fn process_pending(h: &Harness, process: &Process) -> SigSet {
    with_signals(h.cpu, process, |state| state.pending.set())
}

fn sleeper(h: &'static Harness, process: &Arc<Process>) -> Arc<Thread> {
    h.spawn_kernel(process, "sleeper", |cpu| cpu.block_current())
}

// ----------------------------------------------------------------------
// Handler entry and return
// ----------------------------------------------------------------------

#[test]
fn handler_runs_and_sigreturn_resumes_the_interrupted_code() {
    let h = Harness::new();
    let process = h.process("handled");
    let seen: Arc<StdMutex<Vec<(u32, SigInfo, SigSet)>>> = Arc::default();
    let finished = Arc::new(AtomicBool::new(false));

    let s = seen.clone();
    h.on_signal(HANDLER, move |user, sig, info, _context| {
        let info: SigInfo = user.harness().read(info);
        let mask = blocked(user);
        s.lock().unwrap().push((sig, info, mask));
    });

    let f = finished.clone();
    h.spawn_user(&process, "main", move |user| {
        assert_eq!(
            sigaction(user, SIGUSR1, HANDLER, SA_SIGINFO, SigSet::of(SIGUSR2)),
            0
        );
        let before = user.regs();
        assert_eq!(raise(user, SIGUSR1), 0);
        let after = user.regs();

        assert_eq!(after.stack_pointer(), before.stack_pointer());
        assert_eq!(after.instruction_pointer(), before.instruction_pointer());
        assert!(blocked(user).is_empty());
        f.store(true, Ordering::SeqCst);
    });
    h.run();

    assert!(finished.load(Ordering::SeqCst));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (sig, info, mask) = seen[0];
    assert_eq!(sig, SIGUSR1);
    assert_eq!(info.si_signo, SIGUSR1 as i32);
    assert_eq!(info.si_code, SI_USER);
    assert_eq!(info.si_pid as u64, process.pid().as_u64());
    assert_eq!(mask, SigSet::of(SIGUSR1).union(SigSet::of(SIGUSR2)));
    assert_eq!(process.exit_status(), Some(ExitStatus::Exited(0)));
}

#[test]
fn blocked_signal_waits_until_unblocked() {
    let h = Harness::new();
    let process = h.process("blocker");
    let count = Arc::new(AtomicU32::new(0));

    let c = count.clone();
    h.on_signal(HANDLER, move |_, _, _, _| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    let c = count.clone();
    h.spawn_user(&process, "main", move |user| {
        sigaction(user, SIGUSR1, HANDLER, 0, SigSet::EMPTY);
        assert_eq!(sigprocmask(user, SIG_BLOCK, SigSet::of(SIGUSR1)), 0);

        assert_eq!(raise(user, SIGUSR1), 0);
        // Standard signals do not queue
        assert_eq!(raise(user, SIGUSR1), 0);
        assert_eq!(c.load(Ordering::SeqCst), 0);
        assert_eq!(sigpending(user), SigSet::of(SIGUSR1));

        assert_eq!(sigprocmask(user, SIG_UNBLOCK, SigSet::of(SIGUSR1)), 0);
        assert_eq!(c.load(Ordering::SeqCst), 1);
        assert!(sigpending(user).is_empty());
    });
    h.run();

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(process.exit_status(), Some(ExitStatus::Exited(0)));
}

#[test]
fn resethand_handler_runs_once() {
    let h = Harness::new();
    let process = h.process("oneshot");
    let count = Arc::new(AtomicU32::new(0));
    let survived = Arc::new(AtomicBool::new(false));

    let c = count.clone();
    h.on_signal(HANDLER, move |_, _, _, _| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    let s = survived.clone();
    h.spawn_user(&process, "main", move |user| {
        sigaction(user, SIGUSR1, HANDLER, SA_RESETHAND, SigSet::EMPTY);
        raise(user, SIGUSR1);
        assert!(action_of(user, SIGUSR1).is_default());

        // Default action now: terminate
        raise(user, SIGUSR1);
        s.store(true, Ordering::SeqCst);
    });
    h.run();

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!survived.load(Ordering::SeqCst));
    assert_eq!(process.exit_status(), Some(ExitStatus::Signaled(SIGUSR1)));
}

fn nesting_order(flags: u64) -> Vec<String> {
    let h = Harness::new();
    let process = h.process("nest");
    let log: Log = Arc::default();
    let depth = Arc::new(AtomicU32::new(0));

    let l = log.clone();
    h.on_signal(HANDLER, move |user, _, _, _| {
        let n = depth.fetch_add(1, Ordering::SeqCst) + 1;
        note(&l, format!("enter {}", n));
        if n == 1 {
            assert_eq!(raise(user, SIGUSR1), 0);
        }
        note(&l, format!("exit {}", n));
    });

    h.spawn_user(&process, "main", move |user| {
        sigaction(user, SIGUSR1, HANDLER, flags, SigSet::EMPTY);
        raise(user, SIGUSR1);
        assert!(blocked(user).is_empty());
    });
    h.run();
    assert_eq!(process.exit_status(), Some(ExitStatus::Exited(0)));
    entries(&log)
}

#[test]
fn handled_signal_is_deferred_while_its_handler_runs() {
    assert_eq!(nesting_order(0), ["enter 1", "exit 1", "enter 2", "exit 2"]);
}

#[test]
fn nodefer_lets_a_handler_interrupt_itself() {
    assert_eq!(
        nesting_order(SA_NODEFER),
        ["enter 1", "enter 2", "exit 2", "exit 1"]
    );
}

#[test]
fn different_signals_nest() {
    let h = Harness::new();
    let process = h.process("two");
    let log: Log = Arc::default();

    let l = log.clone();
    h.on_signal(HANDLER, move |user, sig, _, _| {
        note(&l, signal_name(sig));
        assert_eq!(raise(user, SIGUSR2), 0);
        note(&l, "back in SIGUSR1");
    });
    let l = log.clone();
    h.on_signal(OTHER_HANDLER, move |user, sig, _, _| {
        note(&l, signal_name(sig));
        let mask = blocked(user);
        assert!(mask.contains(SIGUSR1) && mask.contains(SIGUSR2));
    });

    h.spawn_user(&process, "main", move |user| {
        sigaction(user, SIGUSR1, HANDLER, 0, SigSet::EMPTY);
        sigaction(user, SIGUSR2, OTHER_HANDLER, 0, SigSet::EMPTY);
        raise(user, SIGUSR1);

        assert!(blocked(user).is_empty());
        let cpu = user.cpu();
        let id = cpu.current_id();
        let in_flight = with_signals(cpu, &cpu.current_process(), |state| {
            state.thread(id).map(|t| t.in_flight)
        });
        assert_eq!(in_flight, Some(0));
    });
    h.run();

    assert_eq!(entries(&log), ["SIGUSR1", "SIGUSR2", "back in SIGUSR1"]);
    assert_eq!(process.exit_status(), Some(ExitStatus::Exited(0)));
}

#[test]
fn syscalls_inside_a_handler_do_not_reenter_it() {
    let h = Harness::new();
    let process = h.process("busy");
    let entered = Arc::new(AtomicU32::new(0));

    let e = entered.clone();
    h.on_signal(HANDLER, move |user, _, _, _| {
        e.fetch_add(1, Ordering::SeqCst);
        let pid = getpid(user);
        assert!(pid > 0);
        assert!(blocked(user).contains(SIGUSR1));
        assert!(sigpending(user).is_empty());
        assert_eq!(getpid(user), pid);
    });

    h.spawn_user(&process, "main", move |user| {
        sigaction(user, SIGUSR1, HANDLER, 0, SigSet::EMPTY);
        assert_eq!(raise(user, SIGUSR1), 0);
        assert!(blocked(user).is_empty());
    });
    h.run();

    assert_eq!(entered.load(Ordering::SeqCst), 1);
    assert_eq!(process.exit_status(), Some(ExitStatus::Exited(0)));
}

#[test]
fn ignored_and_default_ignored_signals_vanish() {
    let h = Harness::new();
    let process = h.process("deaf");

    h.spawn_user(&process, "main", move |user| {
        sigaction(user, SIGUSR1, SIG_IGN, 0, SigSet::EMPTY);
        assert_eq!(raise(user, SIGUSR1), 0);
        assert_eq!(raise(user, SIGCHLD), 0);

        // Not even held while blocked
        sigprocmask(user, SIG_BLOCK, SigSet::of(SIGUSR1).union(SigSet::of(SIGCHLD)));
        raise(user, SIGUSR1);
        raise(user, SIGCHLD);
        assert!(sigpending(user).is_empty());
    });
    h.run();

    assert_eq!(process.exit_status(), Some(ExitStatus::Exited(0)));
}

// ----------------------------------------------------------------------
// Termination and the synthetic dispatch frame
// ----------------------------------------------------------------------

#[test]
fn sigkill_reaches_a_thread_switched_out_in_user_mode() {
    let h = Harness::new();
    let victim_process = h.process("victim");
    let killer_process = h.process("killer");

    let victim = h.spawn_user(&victim_process, "victim", |user| loop {
        user.preempt();
    });
    let target = victim_process.clone();
    h.spawn_kernel(&killer_process, "killer", move |cpu| {
        super::deliver_to_process(cpu, &target, SIGKILL, SigOrigin::KERNEL).unwrap();
    });
    h.run();

    assert_eq!(h.state_of(&victim), None);
    assert!(victim_process.has_exited());
    assert_eq!(
        victim_process.exit_status(),
        Some(ExitStatus::Signaled(SIGKILL))
    );
}

#[test]
fn switched_out_thread_enters_its_handler_when_resumed() {
    let h = Harness::new();
    let target_process = h.process("target");
    let sender_process = h.process("sender");
    let handled = Arc::new(AtomicBool::new(false));
    let code = Arc::new(AtomicU32::new(0));

    let (flag, c) = (handled.clone(), code.clone());
    h.on_signal(HANDLER, move |user, _, info, _| {
        let info: SigInfo = user.harness().read(info);
        c.store(info.si_code as u32, Ordering::SeqCst);
        flag.store(true, Ordering::SeqCst);
    });

    let flag = handled.clone();
    h.spawn_user(&target_process, "target", move |user| {
        sigaction(user, SIGUSR1, HANDLER, SA_SIGINFO, SigSet::EMPTY);
        while !flag.load(Ordering::SeqCst) {
            user.preempt();
        }
    });
    let target = target_process.clone();
    h.spawn_kernel(&sender_process, "sender", move |cpu| {
        super::deliver_to_process(cpu, &target, SIGUSR1, SigOrigin::KERNEL).unwrap();
    });
    h.run();

    assert!(handled.load(Ordering::SeqCst));
    assert_eq!(code.load(Ordering::SeqCst) as i32, SI_KERNEL);
    assert_eq!(target_process.exit_status(), Some(ExitStatus::Exited(0)));
}

#[test]
fn sigkill_cannot_be_blocked_or_caught() {
    let h = Harness::new();
    let process = h.process("doomed");
    let survived = Arc::new(AtomicBool::new(false));

    let s = survived.clone();
    h.spawn_user(&process, "main", move |user| {
        assert_eq!(sigaction(user, SIGKILL, HANDLER, 0, SigSet::EMPTY), err(EINVAL));
        assert_eq!(sigaction(user, SIGSTOP, SIG_IGN, 0, SigSet::EMPTY), err(EINVAL));

        assert_eq!(sigprocmask(user, SIG_SETMASK, SigSet::from_bits(!0)), 0);
        let mask = blocked(user);
        assert!(!mask.contains(SIGKILL) && !mask.contains(SIGSTOP));
        assert!(mask.contains(SIGTERM));

        raise(user, SIGKILL);
        s.store(true, Ordering::SeqCst);
    });
    h.run();

    assert!(!survived.load(Ordering::SeqCst));
    assert_eq!(process.exit_status(), Some(ExitStatus::Signaled(SIGKILL)));
}

#[test]
fn unwritable_signal_stack_ends_in_sigsegv() {
    let h = Harness::new();
    let process = h.process("nostack");
    let count = Arc::new(AtomicU32::new(0));

    let c = count.clone();
    h.on_signal(HANDLER, move |_, _, _, _| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    h.spawn_user(&process, "main", move |user| {
        sigaction(user, SIGUSR1, HANDLER, 0, SigSet::EMPTY);
        sigaction(user, SIGSEGV, HANDLER, 0, SigSet::EMPTY);
        let mut regs = user.regs();
        regs.set_stack_pointer(0x5000_0000);
        user.set_regs(regs);
        raise(user, SIGUSR1);
    });
    h.run();

    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(process.exit_status(), Some(ExitStatus::Signaled(SIGSEGV)));
}

// ----------------------------------------------------------------------
// Forged returns
// ----------------------------------------------------------------------

/// Run a thread whose SIGUSR1 handler calls `tamper` with its frame address
/// before returning.
///
/// Returns the harness, the process, the frame address and whether the
/// interrupted code ever resumed.
fn run_tampered(
    tamper: impl Fn(&mut UserCpu, u64) + Send + Sync + 'static,
) -> (&'static Harness, Arc<Process>, u64, bool) {
    let h = Harness::new();
    let process = h.process("forger");
    let frame = Arc::new(AtomicU64::new(0));
    let resumed = Arc::new(AtomicBool::new(false));

    let f = frame.clone();
    h.on_signal(HANDLER, move |user, _, _, _| {
        let addr = user.regs().stack_pointer();
        f.store(addr, Ordering::SeqCst);
        tamper(user, addr);
    });

    let r = resumed.clone();
    h.spawn_user(&process, "main", move |user| {
        sigaction(user, SIGUSR1, HANDLER, 0, SigSet::EMPTY);
        raise(user, SIGUSR1);
        r.store(true, Ordering::SeqCst);
    });
    h.run();

    let frame = frame.load(Ordering::SeqCst);
    assert_ne!(frame, 0, "handler never ran");
    (h, process, frame, resumed.load(Ordering::SeqCst))
}

fn assert_aborted(process: &Process, resumed: bool) {
    assert!(!resumed, "forged sigreturn resumed user code");
    assert_eq!(process.exit_status(), Some(ExitStatus::Signaled(SIGABRT)));
}

#[test]
fn untampered_frame_returns_and_is_scrubbed() {
    let (h, process, frame, resumed) = run_tampered(|_, _| {});
    assert!(resumed);
    assert_eq!(process.exit_status(), Some(ExitStatus::Exited(0)));
    let scrubbed: SignalFrame = h.read(frame);
    assert_eq!(scrubbed.canary, 0);
    assert_eq!(scrubbed.signo, 0);
}

#[test]
fn corrupted_canary_aborts() {
    let (h, process, frame, resumed) = run_tampered(|user, frame| {
        let at = frame + core::mem::offset_of!(SignalFrame, canary) as u64;
        let canary: u64 = user.harness().read(at);
        user.harness().write(at, &(canary ^ 1));
    });
    assert_aborted(&process, resumed);

    // A rejected frame is left as it was
    let kept: SignalFrame = h.read(frame);
    assert_eq!(kept.signo, SIGUSR1 as u64);
    assert_ne!(kept.canary, 0);
}

#[test]
fn moved_stack_pointer_aborts() {
    let (_, process, _, resumed) = run_tampered(|user, frame| {
        // Point the return at another spot that still holds a plausible
        // trampoline address
        let elsewhere = frame - 64;
        user.harness().write(elsewhere, &crate::config::SIGRETURN_TRAMPOLINE);
        let mut regs = user.regs();
        regs.set_stack_pointer(elsewhere);
        user.set_regs(regs);
    });
    assert_aborted(&process, resumed);
}

#[test]
fn malformed_saved_altstack_aborts() {
    let (h, process, frame, resumed) = run_tampered(|user, frame| {
        let at = frame
            + core::mem::offset_of!(SignalFrame, saved_altstack) as u64
            + core::mem::offset_of!(StackT, ss_flags) as u64;
        user.harness().write(at, &0x40i32);
    });
    assert_aborted(&process, resumed);
    let kept: SignalFrame = h.read(frame);
    assert_eq!(kept.signo, SIGUSR1 as u64);
}

#[test]
fn sigreturn_through_the_syscall_gate_aborts() {
    let (_, process, _, resumed) = run_tampered(|user, _| {
        user.syscall(SyscallNumber::RtSigreturn, &[]);
        unreachable!("forged sigreturn came back");
    });
    assert_aborted(&process, resumed);
}

#[test]
fn sigreturn_without_a_handler_aborts() {
    let h = Harness::new();
    let process = h.process("nohandler");
    let resumed = Arc::new(AtomicBool::new(false));

    let r = resumed.clone();
    h.spawn_user(&process, "main", move |user| {
        let frame = user.regs().stack_pointer() - 0x400;
        fake_trampoline_return(user, frame);
        r.store(true, Ordering::SeqCst);
    });
    h.run();

    assert_aborted(&process, resumed.load(Ordering::SeqCst));
}

#[test]
fn replayed_frame_aborts() {
    let h = Harness::new();
    let process = h.process("replay");
    let copy: Arc<StdMutex<Option<(u64, SignalFrame)>>> = Arc::default();
    let resumed = Arc::new(AtomicBool::new(false));

    let c = copy.clone();
    h.on_signal(HANDLER, move |user, _, _, _| {
        let addr = user.regs().stack_pointer();
        let frame: SignalFrame = user.harness().read(addr);
        *c.lock().unwrap() = Some((addr, frame));
    });

    let (c, r) = (copy.clone(), resumed.clone());
    h.spawn_user(&process, "main", move |user| {
        sigaction(user, SIGUSR1, HANDLER, 0, SigSet::EMPTY);
        raise(user, SIGUSR1);

        let (addr, frame) = c.lock().unwrap().expect("handler ran");
        let scrubbed: SignalFrame = user.harness().read(addr);
        assert_eq!(scrubbed.canary, 0);

        // Put the genuine frame back and return through it a second time
        user.harness().write(addr, &frame);
        fake_trampoline_return(user, addr);
        r.store(true, Ordering::SeqCst);
    });
    h.run();

    assert_aborted(&process, resumed.load(Ordering::SeqCst));
}

#[test]
fn unreadable_frame_aborts() {
    const UNMAPPED: u64 = 0x7000_0000;

    let h = Harness::new();
    let process = h.process("unreadable");
    let resumed = Arc::new(AtomicBool::new(false));

    h.on_signal(HANDLER, move |user, _, _, _| {
        raise(user, SIGUSR2);
        unreachable!("nested handler returned through an unmapped frame");
    });
    h.on_signal(OTHER_HANDLER, move |user, _, _, _| {
        // Two frames are in flight, so only the read itself can fail
        fake_trampoline_return(user, UNMAPPED);
        unreachable!("sigreturn through an unmapped frame came back");
    });

    let r = resumed.clone();
    h.spawn_user(&process, "main", move |user| {
        sigaction(user, SIGUSR1, HANDLER, 0, SigSet::EMPTY);
        sigaction(user, SIGUSR2, OTHER_HANDLER, 0, SigSet::EMPTY);
        raise(user, SIGUSR1);
        r.store(true, Ordering::SeqCst);
    });
    h.run();

    assert_aborted(&process, resumed.load(Ordering::SeqCst));
}

// ----------------------------------------------------------------------
// Alternate signal stack
// ----------------------------------------------------------------------

#[test]
fn sigaltstack_validates_requests() {
    let h = Harness::new();
    let process = h.process("alt");
    h.map(ALT_BASE, ALT_SIZE);

    h.spawn_user(&process, "main", move |user| {
        let (result, old) = sigaltstack(user, None);
        assert_eq!(result, 0);
        assert_eq!(old.ss_flags, SS_DISABLE);

        let (result, _) = sigaltstack(user, Some(stack(ALT_BASE, 1024, 0)));
        assert_eq!(result, err(ENOMEM));
        let (result, _) = sigaltstack(user, Some(stack(ALT_BASE, ALT_SIZE, 0x40)));
        assert_eq!(result, err(EINVAL));

        let (result, _) = sigaltstack(user, Some(stack(ALT_BASE, ALT_SIZE, 0)));
        assert_eq!(result, 0);
        let (_, current) = sigaltstack(user, None);
        assert_eq!((current.ss_sp, current.ss_size, current.ss_flags), (ALT_BASE, ALT_SIZE, 0));

        let (result, _) = sigaltstack(user, Some(stack(0, 0, SS_DISABLE)));
        assert_eq!(result, 0);
        assert_eq!(sigaltstack(user, None).1.ss_flags, SS_DISABLE);
    });
    h.run();
    assert_eq!(process.exit_status(), Some(ExitStatus::Exited(0)));
}

#[test]
fn onstack_handler_runs_on_the_alternate_stack() {
    let h = Harness::new();
    let process = h.process("onstack");
    h.map(ALT_BASE, ALT_SIZE);
    let checked = Arc::new(AtomicBool::new(false));

    let c = checked.clone();
    h.on_signal(HANDLER, move |user, _, _, _| {
        let sp = user.regs().stack_pointer();
        assert!(sp > ALT_BASE && sp <= ALT_BASE + ALT_SIZE);

        let (_, current) = sigaltstack(user, None);
        assert_eq!(current.ss_flags, SS_ONSTACK);
        let (result, _) = sigaltstack(user, Some(stack(0, 0, SS_DISABLE)));
        assert_eq!(result, err(EPERM));
        c.store(true, Ordering::SeqCst);
    });

    h.spawn_user(&process, "main", move |user| {
        sigaltstack(user, Some(stack(ALT_BASE, ALT_SIZE, 0)));
        sigaction(user, SIGUSR1, HANDLER, SA_ONSTACK, SigSet::EMPTY);
        let sp = user.regs().stack_pointer();
        raise(user, SIGUSR1);

        assert_eq!(user.regs().stack_pointer(), sp);
        let (_, current) = sigaltstack(user, None);
        assert_eq!((current.ss_sp, current.ss_flags), (ALT_BASE, 0));
    });
    h.run();

    assert!(checked.load(Ordering::SeqCst));
    assert_eq!(process.exit_status(), Some(ExitStatus::Exited(0)));
}

#[test]
fn autodisarm_clears_the_stack_until_the_handler_returns() {
    let h = Harness::new();
    let process = h.process("disarm");
    h.map(ALT_BASE, ALT_SIZE);
    let checked = Arc::new(AtomicBool::new(false));

    let c = checked.clone();
    h.on_signal(HANDLER, move |user, _, _, _| {
        let sp = user.regs().stack_pointer();
        assert!(sp > ALT_BASE && sp <= ALT_BASE + ALT_SIZE);
        assert_eq!(sigaltstack(user, None).1.ss_flags, SS_DISABLE);
        c.store(true, Ordering::SeqCst);
    });

    h.spawn_user(&process, "main", move |user| {
        sigaltstack(user, Some(stack(ALT_BASE, ALT_SIZE, SS_AUTODISARM)));
        sigaction(user, SIGUSR1, HANDLER, SA_ONSTACK, SigSet::EMPTY);
        raise(user, SIGUSR1);

        let (_, restored) = sigaltstack(user, None);
        assert_eq!(
            (restored.ss_sp, restored.ss_size, restored.ss_flags),
            (ALT_BASE, ALT_SIZE, SS_AUTODISARM)
        );
    });
    h.run();

    assert!(checked.load(Ordering::SeqCst));
    assert_eq!(process.exit_status(), Some(ExitStatus::Exited(0)));
}

// ----------------------------------------------------------------------
// sigsuspend, sigaction and sigprocmask
// ----------------------------------------------------------------------

#[test]
fn sigsuspend_swaps_the_mask_for_one_delivery() {
    let h = Harness::new();
    let process = h.process("suspender");
    let sender_process = h.process("sender");
    let log: Log = Arc::default();

    let l = log.clone();
    h.on_signal(HANDLER, move |user, sig, _, _| {
        let mask = blocked(user);
        note(&l, format!("{} with mask {:?}", signal_name(sig), mask));
    });

    let l = log.clone();
    h.spawn_user(&process, "suspender", move |user| {
        sigaction(user, SIGUSR1, HANDLER, 0, SigSet::EMPTY);
        sigprocmask(user, SIG_BLOCK, SigSet::of(SIGUSR1));

        user.harness().write(SET, &0u64);
        let result = user.syscall(SyscallNumber::RtSigsuspend, &[SET, 8]);
        assert_eq!(result, err(EINTR));
        note(&l, format!("returned with mask {:?}", blocked(user)));
    });
    let target = process.clone();
    h.spawn_kernel(&sender_process, "sender", move |cpu| {
        super::deliver_to_process(cpu, &target, SIGUSR1, SigOrigin::KERNEL).unwrap();
    });
    h.run();

    let usr1 = SigSet::of(SIGUSR1);
    assert_eq!(
        entries(&log),
        [
            format!("SIGUSR1 with mask {:?}", usr1),
            format!("returned with mask {:?}", usr1),
        ]
    );
}

#[test]
fn sigaction_sanitizes_and_reports_the_old_action() {
    let h = Harness::new();
    let process = h.process("actions");

    h.spawn_user(&process, "main", move |user| {
        assert!(action_of(user, SIGTERM).is_default());
        assert!(action_of(user, SIGKILL).is_default());

        let junk_flags = 0xdead_0000_0000 | SA_SIGINFO;
        assert_eq!(
            sigaction(user, SIGUSR1, HANDLER, junk_flags, SigSet::from_bits(!0)),
            0
        );
        let action = action_of(user, SIGUSR1);
        assert_eq!(action.handler, HANDLER);
        assert_eq!(action.flags, SA_SIGINFO);
        assert_eq!(action.mask & UNCATCHABLE_SIGNALS, 0);

        for sig in [0u64, 65] {
            assert_eq!(
                user.syscall(SyscallNumber::RtSigaction, &[sig, 0, OLD_ACT, 8]),
                err(EINVAL)
            );
        }
        assert_eq!(
            user.syscall(SyscallNumber::RtSigaction, &[SIGUSR1 as u64, 0, OLD_ACT, 4]),
            err(EINVAL)
        );
        assert_eq!(
            user.syscall(SyscallNumber::RtSigaction, &[SIGUSR1 as u64, 0x9999_0000, 0, 8]),
            err(EFAULT)
        );
        assert_eq!(sigprocmask(user, 7, SigSet::EMPTY), err(EINVAL));
    });
    h.run();
    assert_eq!(process.exit_status(), Some(ExitStatus::Exited(0)));
}

#[test]
fn exec_reset_reverts_handlers_but_keeps_ignores_and_mask() {
    let h = Harness::new();
    let process = h.process("exec");
    h.map(ALT_BASE, ALT_SIZE);

    h.spawn_user(&process, "main", move |user| {
        sigaction(user, SIGUSR1, HANDLER, SA_NODEFER, SigSet::EMPTY);
        sigaction(user, SIGUSR2, SIG_IGN, 0, SigSet::EMPTY);
        sigprocmask(user, SIG_BLOCK, SigSet::of(SIGTERM));
        sigaltstack(user, Some(stack(ALT_BASE, ALT_SIZE, 0)));

        let cpu = user.cpu();
        super::exec_reset(cpu, &cpu.current_process());

        assert!(action_of(user, SIGUSR1).is_default());
        assert!(action_of(user, SIGUSR2).is_ignore());
        assert_eq!(blocked(user), SigSet::of(SIGTERM));
        assert_eq!(sigaltstack(user, None).1.ss_flags, SS_DISABLE);
    });
    h.run();
    assert_eq!(process.exit_status(), Some(ExitStatus::Exited(0)));
}

// ----------------------------------------------------------------------
// Routing
// ----------------------------------------------------------------------

#[test]
fn kill_addresses_processes_and_groups() {
    let h = Harness::new();
    // Keep the leader's pid, and so its group id, away from 1
    let _init = h.process("init");
    let leader = h.process("leader");
    let child = h.child_process("child", &leader);
    let stranger = h.process("stranger");
    let caller = h.process("caller");

    let leader_thread = sleeper(h, &leader);
    let child_thread = sleeper(h, &child);
    let stranger_thread = sleeper(h, &stranger);

    let group = leader.pgid().as_u64() as i64;
    assert!(group > 1);
    h.spawn_user(&caller, "caller", move |user| {
        assert_eq!(kill(user, 999_999, SIGTERM), err(ESRCH));
        assert_eq!(kill(user, group, 0), 0);
        assert_eq!(kill(user, group, 65), err(EINVAL));
        assert_eq!(kill(user, -999_999, SIGUSR1), err(ESRCH));

        assert_eq!(kill(user, -group, SIGUSR1), 0);

        // Everyone but the caller
        sigprocmask(user, SIG_BLOCK, SigSet::of(SIGUSR2));
        assert_eq!(kill(user, -1, SIGUSR2), 0);
        assert!(sigpending(user).is_empty());
    });
    h.run();

    let usr1 = SigSet::of(SIGUSR1);
    let usr2 = SigSet::of(SIGUSR2);
    assert_eq!(thread_pending(h, &leader_thread), usr1.union(usr2));
    assert_eq!(thread_pending(h, &child_thread), usr1.union(usr2));
    assert_eq!(thread_pending(h, &stranger_thread), usr2);
    assert_eq!(child.pgid(), leader.pgid());
}

#[test]
fn kill_zero_targets_the_callers_group() {
    let h = Harness::new();
    let leader = h.process("leader");
    let stranger = h.process("stranger");
    let member = h.child_process("member", &leader);

    let leader_thread = sleeper(h, &leader);
    let stranger_thread = sleeper(h, &stranger);

    h.spawn_user(&member, "member", move |user| {
        sigprocmask(user, SIG_BLOCK, SigSet::of(SIGUSR1));
        assert_eq!(kill(user, 0, SIGUSR1), 0);
        assert_eq!(sigpending(user), SigSet::of(SIGUSR1));
    });
    h.run();

    assert!(thread_pending(h, &leader_thread).contains(SIGUSR1));
    assert!(thread_pending(h, &stranger_thread).is_empty());
}

#[test]
fn tkill_targets_one_thread_of_the_caller() {
    let h = Harness::new();
    let process = h.process("threads");
    let other = h.process("other");

    let peer = sleeper(h, &process);
    let foreign = sleeper(h, &other);
    let (peer_tid, foreign_tid) = (peer.tid().0 as i64, foreign.tid().0 as i64);

    h.spawn_user(&process, "main", move |user| {
        let tkill = |user: &mut UserCpu, tid: i64, sig: u32| {
            user.syscall(SyscallNumber::Tkill, &[tid as u64, sig as u64])
        };
        assert_eq!(tkill(user, peer_tid, SIGUSR1), 0);
        assert_eq!(tkill(user, foreign_tid, SIGUSR1), err(ESRCH));
        assert_eq!(tkill(user, 0, SIGUSR1), err(EINVAL));

        let me = user.syscall(SyscallNumber::GetTid, &[]);
        sigprocmask(user, SIG_BLOCK, SigSet::of(SIGUSR2));
        assert_eq!(tkill(user, me, SIGUSR2), 0);
        assert_eq!(sigpending(user), SigSet::of(SIGUSR2));
    });
    h.run();

    assert_eq!(thread_pending(h, &peer), SigSet::of(SIGUSR1));
    assert!(process_pending(h, &process).is_empty());
    assert!(thread_pending(h, &foreign).is_empty());
}

#[test]
fn process_signal_waits_for_a_thread_that_accepts_it() {
    let h = Harness::new();
    let process = h.process("parked");
    let thread = sleeper(h, &process);
    h.run();

    let id = thread.id();
    with_signals(h.cpu, &process, |state| {
        if let Some(t) = state.thread_mut(id) {
            t.set_mask(SigSet::of(SIGUSR1));
        }
    });

    super::deliver_to_process(h.cpu, &process, SIGUSR1, SigOrigin::KERNEL).unwrap();
    assert_eq!(process_pending(h, &process), SigSet::of(SIGUSR1));
    assert!(thread_pending(h, &thread).is_empty());
    assert_eq!(
        super::deliver_to_process(h.cpu, &process, SIGUSR1, SigOrigin::KERNEL),
        Err(crate::error::Error::Duplicate)
    );

    let now = with_signals(h.cpu, &process, |state| {
        let before = deliverable(state, id);
        if let Some(t) = state.thread_mut(id) {
            t.set_mask(SigSet::EMPTY);
        }
        recompute_all(h.cpu, &process, state);
        (before, deliverable(state, id))
    });
    assert_eq!(now, (SigSet::EMPTY, SigSet::of(SIGUSR1)));
}

#[test]
fn stop_and_continue_cancel_each_other() {
    let h = Harness::new();
    let process = h.process("stopcont");
    let thread = sleeper(h, &process);
    h.run();

    let deliver = |sig| super::deliver(h.cpu, &thread, sig, SigOrigin::KERNEL);
    deliver(SIGTSTP).unwrap();
    assert_eq!(thread_pending(h, &thread), SigSet::of(SIGTSTP));
    assert_eq!(deliver(SIGTSTP), Err(crate::error::Error::Duplicate));

    // SIGCONT clears pending stops, and is itself ignored by default
    deliver(SIGCONT).unwrap();
    assert!(thread_pending(h, &thread).is_empty());

    with_signals(h.cpu, &process, |state| {
        state.set_action(
            SIGCONT,
            SignalAction {
                handler: HANDLER,
                ..Default::default()
            },
        )
    });
    deliver(SIGCONT).unwrap();
    deliver(SIGTTOU).unwrap();
    assert_eq!(thread_pending(h, &thread), SigSet::of(SIGTTOU));
}

#[test]
fn orphaned_process_discards_terminal_stops() {
    let h = Harness::new();
    let parent = h.process("parent");
    let orphan = h.child_process("orphan", &parent);
    let adopted = h.process("rooted");

    h.spawn_kernel(&parent, "parent", |_| {});
    let orphan_thread = sleeper(h, &orphan);
    let rooted_thread = sleeper(h, &adopted);
    h.run();

    assert!(parent.has_exited());
    assert!(orphan.is_orphaned());
    assert!(!adopted.is_orphaned());

    for process in [&orphan, &adopted] {
        super::deliver_to_process(h.cpu, process, SIGTSTP, SigOrigin::KERNEL).unwrap();
    }
    assert!(thread_pending(h, &orphan_thread).is_empty());
    assert_eq!(thread_pending(h, &rooted_thread), SigSet::of(SIGTSTP));

    // SIGSTOP is never discarded
    super::deliver_to_process(h.cpu, &orphan, SIGSTOP, SigOrigin::KERNEL).unwrap();
    assert_eq!(thread_pending(h, &orphan_thread), SigSet::of(SIGSTOP));
}

#[test]
fn delivery_checks_its_arguments() {
    let h = Harness::new();
    let process = h.process("args");
    let thread = sleeper(h, &process);
    let empty = h.process("empty");
    h.run();

    use crate::error::Error;
    assert_eq!(
        super::deliver(h.cpu, &thread, 65, SigOrigin::KERNEL),
        Err(Error::InvalidArgument)
    );
    assert_eq!(super::deliver(h.cpu, &thread, 0, SigOrigin::KERNEL), Ok(()));
    assert!(thread_pending(h, &thread).is_empty());
    assert_eq!(
        super::deliver_to_process(h.cpu, &empty, SIGTERM, SigOrigin::KERNEL),
        Err(Error::NoThreads)
    );
}
