//! Signal delivery to userspace
//!
//! Raising a signal only marks it pending and refreshes the target thread's
//! cached "signal pending" bit. The actual work happens in [`dispatch`],
//! which the scheduler runs on the way back to user mode whenever that bit
//! is set for the thread about to resume.

use alloc::sync::Arc;

use super::constants::*;
use super::frame::SignalFrame;
use super::types::*;
use crate::arch_impl::{CpuContext, ExecutionContext};
use crate::config::SIGRETURN_TRAMPOLINE;
use crate::error::Error;
use crate::process::Process;
use crate::syscall::userptr::write_user;
use crate::task::{Cpu, Thread, ThreadId, ThreadState};

/// Run `f` on `process`' signal state under its signal lock.
pub(crate) fn with_signals<R>(
    cpu: &Cpu,
    process: &Process,
    f: impl FnOnce(&mut SignalState) -> R,
) -> R {
    cpu.platform()
        .without_interrupts(|| f(&mut process.signals.lock()))
}

/// Signals `id` could take right now
pub(crate) fn deliverable(state: &SignalState, id: ThreadId) -> SigSet {
    match state.thread(id) {
        Some(thread) => thread
            .pending
            .set()
            .union(state.pending.set())
            .intersect(thread.mask.complement().union(UNBLOCKABLE)),
        None => SigSet::EMPTY,
    }
}

/// Drop signals that would be discarded anyway, then republish the cached
/// "signal pending" bit of thread `id`.
///
/// A thread that just became signalable while sleeping interruptibly is
/// kicked out of its wait.
pub(crate) fn recompute_pending(cpu: &Cpu, process: &Process, state: &mut SignalState, id: ThreadId) {
    let discarded = state.discarded(process.is_orphaned());
    if !discarded.is_empty() {
        state.pending.discard(discarded);
        if let Some(thread) = state.thread_mut(id) {
            thread.pending.discard(discarded);
        }
    }

    let pending = !deliverable(state, id).is_empty();
    cpu.publish_signal_pending(id, pending);
    if pending && id != cpu.current_id() {
        cpu.kutex().interrupt(cpu, id);
    }
}

/// `recompute_pending` for every thread of the process
pub(crate) fn recompute_all(cpu: &Cpu, process: &Process, state: &mut SignalState) {
    let ids: alloc::vec::Vec<ThreadId> = state.threads.keys().copied().collect();
    for id in ids {
        recompute_pending(cpu, process, state, id);
    }
}

fn is_alive(cpu: &Cpu, id: ThreadId) -> bool {
    matches!(
        cpu.thread_state(id),
        Some(ThreadState::Runnable) | Some(ThreadState::Blocked)
    )
}

/// Mark `sig` pending for `thread`.
///
/// Signal 0 only checks the arguments. Returns `Error::Duplicate` if the
/// signal was already pending; standard signals do not queue.
pub fn deliver(cpu: &Cpu, thread: &Thread, sig: u32, origin: SigOrigin) -> Result<(), Error> {
    if sig > NSIG {
        return Err(Error::InvalidArgument);
    }
    if sig == 0 {
        return Ok(());
    }

    let process = thread.process();
    let id = thread.id();
    with_signals(cpu, process, |state| {
        if !state.threads.contains_key(&id) {
            return Err(Error::NoSuchProcess);
        }
        if state.thread(id).map_or(false, |t| t.pending.contains(sig)) {
            return Err(Error::Duplicate);
        }

        // A stop and a continue cancel each other
        if DEFAULT_STOP.contains(sig) {
            state.pending.take(SIGCONT);
        } else if sig == SIGCONT {
            state.pending.discard(DEFAULT_STOP);
        }
        if let Some(target) = state.thread_mut(id) {
            if DEFAULT_STOP.contains(sig) {
                target.pending.take(SIGCONT);
            } else if sig == SIGCONT {
                target.pending.discard(DEFAULT_STOP);
            }
            target.pending.add(sig, origin);
        }

        log::trace!(
            "signal {} ({}) pending for thread {} of process {}",
            sig,
            signal_name(sig),
            thread.tid(),
            process.pid()
        );
        recompute_pending(cpu, process, state, id);
        Ok(())
    })
}

/// Send `sig` to a process.
///
/// KILL, STOP and CONT reach every thread. Anything else goes to the
/// calling thread if it belongs to the process, otherwise to the first
/// thread; if that thread blocks the signal it waits process-wide until some
/// thread unblocks it.
pub fn deliver_to_process(
    cpu: &Cpu,
    process: &Arc<Process>,
    sig: u32,
    origin: SigOrigin,
) -> Result<(), Error> {
    if sig > NSIG {
        return Err(Error::InvalidArgument);
    }

    let threads: alloc::vec::Vec<Arc<Thread>> = process
        .threads()
        .into_iter()
        .filter(|t| is_alive(cpu, t.id()))
        .collect();
    if threads.is_empty() {
        return Err(Error::NoThreads);
    }
    if sig == 0 {
        return Ok(());
    }

    if sig == SIGKILL || sig == SIGSTOP || sig == SIGCONT {
        let mut result = Err(Error::Duplicate);
        for thread in &threads {
            match deliver(cpu, thread, sig, origin) {
                Ok(()) => result = Ok(()),
                Err(Error::Duplicate) => {}
                Err(err) => log::warn!(
                    "signal {} to thread {} failed: {}",
                    signal_name(sig),
                    thread.tid(),
                    err
                ),
            }
        }
        return result;
    }

    let current = cpu.current_id();
    let target = threads
        .iter()
        .find(|t| t.id() == current)
        .unwrap_or(&threads[0]);

    let parked = with_signals(cpu, process, |state| {
        let blocked = state
            .thread(target.id())
            .map_or(false, |t| t.mask.contains(sig));
        if !blocked {
            return None;
        }
        if !state.pending.add(sig, origin) {
            return Some(Err(Error::Duplicate));
        }
        log::trace!(
            "signal {} blocked by thread {}, pending on process {}",
            signal_name(sig),
            target.tid(),
            process.pid()
        );
        recompute_all(cpu, process, state);
        Some(Ok(()))
    });

    match parked {
        Some(result) => result,
        None => deliver(cpu, target, sig, origin),
    }
}

/// What the dispatch loop does with the chosen signal
enum Step {
    Done,
    Kill,
    Stop(u32),
    Ignore(u32),
    Terminate(u32),
    Handle(u32, SignalAction, SigOrigin),
}

/// KILL, then STOP, then the lowest-numbered signal
fn most_important(deliverable: SigSet) -> Option<u32> {
    if deliverable.contains(SIGKILL) {
        Some(SIGKILL)
    } else if deliverable.contains(SIGSTOP) {
        Some(SIGSTOP)
    } else {
        deliverable.lowest()
    }
}

fn next_step(cpu: &Cpu, process: &Process, state: &mut SignalState, id: ThreadId) -> Step {
    let sig = match most_important(deliverable(state, id)) {
        Some(sig) => sig,
        None => return Step::Done,
    };

    let from_thread = state.thread_mut(id).and_then(|t| t.pending.take(sig));
    let origin = match from_thread {
        Some(origin) => origin,
        None => state.pending.take(sig).unwrap_or_default(),
    };
    recompute_pending(cpu, process, state, id);

    if sig == SIGKILL {
        return Step::Kill;
    }
    let action = state.action(sig);
    if sig == SIGSTOP {
        return Step::Stop(sig);
    }
    if action.is_ignore() {
        return Step::Ignore(sig);
    }
    if action.is_default() {
        return match default_action(sig) {
            SignalDefaultAction::Stop => Step::Stop(sig),
            SignalDefaultAction::Ignore | SignalDefaultAction::Continue => Step::Ignore(sig),
            SignalDefaultAction::Terminate | SignalDefaultAction::CoreDump => Step::Terminate(sig),
        };
    }
    Step::Handle(sig, action, origin)
}

/// Deliver everything deliverable to the current thread, which is about to
/// resume user mode through `frame`.
///
/// Loops until nothing is deliverable. Each handled signal stacks one
/// handler frame; the last one set up runs first.
pub fn dispatch(cpu: &Cpu, frame: &mut CpuContext) {
    if !frame.is_user() {
        return;
    }

    let thread = cpu.current_thread();
    let process = thread.process().clone();
    let id = thread.id();

    loop {
        match with_signals(cpu, &process, |state| next_step(cpu, &process, state, id)) {
            Step::Done => break,
            Step::Kill => {
                log::debug!(
                    "thread {} of process {} killed",
                    thread.tid(),
                    process.pid()
                );
                drop(thread);
                cpu.kill_current(frame);
                return;
            }
            Step::Stop(sig) => {
                log::info!(
                    "process {}: {} received; stop is not supported, continuing",
                    process.pid(),
                    signal_name(sig)
                );
            }
            Step::Ignore(sig) => {
                log::trace!("process {}: {} ignored", process.pid(), signal_name(sig));
            }
            Step::Terminate(sig) => {
                cpu.terminate_process(&process, sig);
            }
            Step::Handle(sig, action, origin) => {
                let entered = with_signals(cpu, &process, |state| {
                    enter_handler(cpu, &process, state, id, frame, sig, &action, origin)
                });
                if let Err(err) = entered {
                    log::warn!(
                        "process {}: cannot set up frame for {}: {}",
                        process.pid(),
                        signal_name(sig),
                        err
                    );
                    if sig == SIGSEGV {
                        cpu.terminate_process(&process, SIGSEGV);
                    } else {
                        force_segv(cpu, &process, id);
                    }
                }
            }
        }
    }

    // sigsuspend without a handler frame to carry the old mask
    with_signals(cpu, &process, |state| {
        let restore = state.thread_mut(id).and_then(|t| t.saved_mask.take());
        if let Some(mask) = restore {
            if let Some(t) = state.thread_mut(id) {
                t.set_mask(mask);
            }
            recompute_pending(cpu, &process, state, id);
        }
    });
}

/// Make SIGSEGV deliverable to `id` regardless of its mask
fn force_segv(cpu: &Cpu, process: &Process, id: ThreadId) {
    with_signals(cpu, process, |state| {
        if let Some(t) = state.thread_mut(id) {
            t.mask.remove(SIGSEGV);
            t.pending.add(SIGSEGV, SigOrigin::KERNEL);
        }
        let mut action = state.action(SIGSEGV);
        if action.is_ignore() {
            action.handler = SIG_DFL;
            state.set_action(SIGSEGV, action);
        }
        recompute_pending(cpu, process, state, id);
    });
}

/// Build a handler frame on the user stack and redirect `frame` into the
/// handler. Nothing is changed if the frame cannot be written.
#[allow(clippy::too_many_arguments)]
fn enter_handler(
    cpu: &Cpu,
    process: &Process,
    state: &mut SignalState,
    id: ThreadId,
    frame: &mut CpuContext,
    sig: u32,
    action: &SignalAction,
    origin: SigOrigin,
) -> Result<(), Error> {
    let t = state.thread_mut(id).ok_or(Error::NoSuchProcess)?;
    let secret = match t.secret {
        Some(secret) => secret,
        None => {
            let secret = cpu.platform().entropy();
            t.secret = Some(secret);
            secret
        }
    };

    let sp = frame.stack_pointer();
    let on_altstack = t.altstack.contains(sp);
    let switch_stack = action.flags & SA_ONSTACK != 0 && t.altstack.is_enabled() && !on_altstack;
    let base_sp = if switch_stack { t.altstack.top() } else { sp };

    let addr = CpuContext::signal_frame_placement(base_sp, SignalFrame::SIZE as u64);
    if (switch_stack || on_altstack) && addr < t.altstack.base {
        // Alternate stack overflow
        return Err(Error::Fault);
    }

    let signal_frame = SignalFrame {
        ret_addr: SIGRETURN_TRAMPOLINE,
        signo: sig as u64,
        info_ptr: SignalFrame::info_addr(addr),
        context_ptr: SignalFrame::context_addr(addr),
        canary: SignalFrame::canary_for(secret, addr),
        saved_mask: t.saved_mask.unwrap_or(t.mask).bits(),
        saved_altstack: t.altstack.to_user(sp),
        info: SigInfo::new(sig, origin),
        mcontext: frame.encode(),
    };
    write_user(cpu, addr, &signal_frame)?;

    // The frame is out; commit
    t.saved_mask = None;
    let mut mask = t.mask.union(SigSet::from_bits(action.mask));
    if action.flags & SA_NODEFER == 0 {
        mask.insert(sig);
    }
    t.set_mask(mask);
    if switch_stack && t.altstack.flags & SS_AUTODISARM != 0 {
        t.altstack = AltStack::default();
    }
    t.in_flight += 1;
    t.single_frame = if t.in_flight == 1 { Some(addr) } else { None };

    frame.enter_signal_handler(
        action.handler,
        addr,
        SIGRETURN_TRAMPOLINE,
        [sig as u64, signal_frame.info_ptr, signal_frame.context_ptr],
    );

    if action.flags & SA_RESETHAND != 0 {
        state.set_action(sig, SignalAction::default());
    }

    log::debug!(
        "process {}: entering handler {:#x} for {} with frame at {:#x}",
        process.pid(),
        action.handler,
        signal_name(sig),
        addr
    );
    recompute_pending(cpu, process, state, id);
    Ok(())
}

/// Reset dispositions for a new program image.
///
/// Caught signals revert to SIG_DFL, ignored ones stay ignored; masks and
/// pending signals are kept.
pub fn exec_reset(cpu: &Cpu, process: &Process) {
    with_signals(cpu, process, |state| {
        state.exec_reset();
        recompute_all(cpu, process, state);
    });
    log::debug!("process {}: signal state reset for exec", process.pid());
}
