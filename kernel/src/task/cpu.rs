//! The per-CPU core: scheduler, kutex, process table and trap handling
//!
//! There is exactly one logical CPU. Everything that the scheduler,
//! synchronization and signal code need to share hangs off one `Cpu`
//! value which is passed around explicitly.
//!
//! The low-level trap stubs save the interrupted registers into a
//! [`CpuContext`] and call [`Cpu::handle_trap`] with it. A context switch
//! swaps the contents of that live frame; the stub then resumes whatever
//! the frame holds.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use conquer_once::spin::OnceCell;
use crossbeam_queue::ArrayQueue;
use spin::Mutex;

use super::scheduler::Scheduler;
use super::thread::{allocate_tid, KernelStack, Thread, ThreadId, ThreadState, Tid};
use crate::arch_impl::{signal_dispatch_entry, CpuContext, ExecutionContext, Platform};
use crate::config::{
    DEFERRED_QUEUE_CAPACITY, KERNEL_STACK_SIZE, MAX_THREADS, PREEMPT_VECTOR,
    SIGNAL_DISPATCH_VECTOR, SIGRETURN_VECTOR, SYSCALL_VECTOR, THREAD_EXIT_VECTOR, YIELD_VECTOR,
};
use crate::error::Error;
use crate::process::{ExitStatus, Process, ProcessId, ProcessManager};
use crate::signal::{self, constants::*, delivery::with_signals, SigOrigin};
use crate::sync::Kutex;
use crate::syscall::{self, SyscallNumber};

/// The boot CPU
static BSP: OnceCell<Cpu> = OnceCell::uninit();

/// Create the boot CPU. Later calls return the existing instance.
pub fn init(platform: &'static dyn Platform) -> &'static Cpu {
    if BSP.try_init_once(|| Cpu::new(platform)).is_err() {
        log::warn!("cpu: init called twice, keeping the first instance");
    }
    bsp()
}

/// The boot CPU; panics before [`init`]
pub fn bsp() -> &'static Cpu {
    match BSP.try_get() {
        Ok(cpu) => cpu,
        Err(_) => panic!("cpu: used before init"),
    }
}

/// Entry point for the low-level trap stubs
#[no_mangle]
pub extern "C" fn kcore_handle_trap(vector: u64, frame: *mut CpuContext) {
    // SAFETY: the stub passes the frame it just saved on the current stack
    let frame = unsafe { &mut *frame };
    bsp().handle_trap(vector as u8, frame);
}

pub struct Cpu {
    platform: &'static dyn Platform,

    /// Only locked with interrupts disabled
    sched: Mutex<Scheduler>,

    kutex: Kutex,

    /// "A signal is deliverable" for the current thread
    signal_pending: AtomicBool,

    /// Dead threads awaiting reclamation by the idle loop
    deferred: ArrayQueue<ThreadId>,

    /// Set when `deferred` was full; the idle loop then sweeps the arena
    deferred_overflow: AtomicBool,

    processes: Mutex<ProcessManager>,
}

impl Cpu {
    /// Bring up the CPU. The caller's flow of execution becomes the idle
    /// thread.
    pub fn new(platform: &'static dyn Platform) -> Self {
        let processes = ProcessManager::new();
        let kernel = processes.kernel_process();
        let sched = Scheduler::new(MAX_THREADS, |id| {
            Arc::new(Thread::new(
                id,
                Tid(0),
                String::from("idle"),
                kernel,
                KERNEL_STACK_SIZE,
            ))
        });

        log::info!("cpu: scheduler initialized, idle thread is slot {}", sched.idle().index());

        Cpu {
            platform,
            sched: Mutex::new(sched),
            kutex: Kutex::new(),
            signal_pending: AtomicBool::new(false),
            deferred: ArrayQueue::new(DEFERRED_QUEUE_CAPACITY),
            deferred_overflow: AtomicBool::new(false),
            processes: Mutex::new(processes),
        }
    }

    #[inline]
    pub fn platform(&self) -> &'static dyn Platform {
        self.platform
    }

    #[inline]
    pub fn kutex(&self) -> &Kutex {
        &self.kutex
    }

    /// Run `f` on the scheduler with interrupts disabled
    pub(crate) fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
        self.platform.without_interrupts(|| f(&mut self.sched.lock()))
    }

    pub fn current_id(&self) -> ThreadId {
        self.with_scheduler(|sched| sched.current())
    }

    pub fn current_thread(&self) -> Arc<Thread> {
        self.with_scheduler(|sched| sched.slot(sched.current()).thread.clone())
    }

    pub fn current_process(&self) -> Arc<Process> {
        self.current_thread().process().clone()
    }

    pub fn idle_id(&self) -> ThreadId {
        self.with_scheduler(|sched| sched.idle())
    }

    pub fn thread(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.with_scheduler(|sched| sched.thread(id).cloned())
    }

    pub fn thread_state(&self, id: ThreadId) -> Option<ThreadState> {
        self.with_scheduler(|sched| sched.state(id))
    }

    /// Cached "signal deliverable" bit of the current thread
    #[inline]
    pub fn signal_pending(&self) -> bool {
        self.signal_pending.load(Ordering::Acquire)
    }

    /// Store thread `id`'s cached "signal deliverable" bit: in the per-CPU
    /// flag if it is running, in its saved context otherwise.
    pub(crate) fn publish_signal_pending(&self, id: ThreadId, pending: bool) {
        self.with_scheduler(|sched| {
            if id == sched.current() {
                self.signal_pending.store(pending, Ordering::Release);
            } else if sched.state(id).is_some() {
                sched.slot_mut(id).context.set_signal_pending(pending);
            }
        });
    }

    // ------------------------------------------------------------------
    // Thread lifecycle
    // ------------------------------------------------------------------

    /// Create a runnable kernel thread in `process` starting at `entry(arg)`.
    pub fn spawn_kernel_thread(
        &self,
        process: &Arc<Process>,
        name: &str,
        entry: u64,
        arg: u64,
    ) -> Result<Arc<Thread>, Error> {
        self.spawn(process, name, |stack| {
            CpuContext::kernel_thread(entry, stack.top(), arg)
        })
    }

    /// Create a runnable user thread in `process` starting at `entry` with
    /// user stack `stack_top`.
    pub fn spawn_user_thread(
        &self,
        process: &Arc<Process>,
        name: &str,
        entry: u64,
        stack_top: u64,
    ) -> Result<Arc<Thread>, Error> {
        self.spawn(process, name, |_| CpuContext::user_thread(entry, stack_top))
    }

    fn spawn(
        &self,
        process: &Arc<Process>,
        name: &str,
        context: impl FnOnce(&KernelStack) -> CpuContext,
    ) -> Result<Arc<Thread>, Error> {
        self.platform.without_interrupts(|| {
            let id = self.sched.lock().next_id();
            let thread = Arc::new(Thread::new(
                id,
                allocate_tid(),
                String::from(name),
                process.clone(),
                KERNEL_STACK_SIZE,
            ));
            process.attach_thread(&thread)?;

            let context = context(thread.kernel_stack());
            let mut sched = self.sched.lock();
            sched.insert(thread.clone(), context);
            sched.set_state(id, ThreadState::Runnable);
            log::debug!(
                "cpu: spawned thread {} '{}' (tid {}) in process {}",
                id.index(),
                name,
                thread.tid(),
                process.pid()
            );
            Ok(thread)
        })
    }

    /// Raise software trap `vector` on this CPU
    #[inline]
    pub fn raise(&self, vector: u8) {
        self.platform.raise(self, vector);
    }

    /// Give up the CPU to the next thread in round-robin order.
    pub fn yield_now(&self) {
        self.with_scheduler(|sched| sched.set_yield_hint(None));
        self.raise(YIELD_VECTOR);
    }

    /// Give up the CPU, preferring `target` if it is runnable.
    pub fn yield_to(&self, target: ThreadId) {
        self.with_scheduler(|sched| sched.set_yield_hint(Some(target)));
        self.raise(YIELD_VECTOR);
    }

    /// Hand the CPU back to the owner of the current time slice after a
    /// yield-to.
    pub fn schedule_true_thread(&self) {
        if self.hint_true_thread() {
            self.raise(YIELD_VECTOR);
        }
    }

    /// Arrange for the next voluntary yield to go to the true thread.
    ///
    /// Returns false (and makes the current thread the true thread) if no
    /// hand-back is needed.
    fn hint_true_thread(&self) -> bool {
        self.with_scheduler(|sched| {
            let owner = sched.true_thread();
            if owner != sched.current() && sched.state(owner) == Some(ThreadState::Runnable) {
                sched.set_yield_hint(Some(owner));
                true
            } else {
                let current = sched.current();
                sched.set_true_thread(current);
                false
            }
        })
    }

    /// Suspend the current thread until [`Cpu::wake`].
    pub fn block_current(&self) {
        self.with_scheduler(|sched| {
            let me = sched.current();
            assert!(me != sched.idle(), "cpu: the idle thread cannot block");
            sched.set_state(me, ThreadState::Blocked);
        });
        self.raise(YIELD_VECTOR);
    }

    /// Make a thread suspended by [`Cpu::block_current`] runnable again.
    ///
    /// Threads waiting on a kutex are left alone; only their kutex wakes
    /// them. Returns true if the thread was woken.
    pub fn wake(&self, id: ThreadId) -> bool {
        self.with_scheduler(|sched| {
            if sched.state(id) != Some(ThreadState::Blocked) || sched.slot(id).wait.key.is_some() {
                return false;
            }
            sched.set_state(id, ThreadState::Runnable);
            true
        })
    }

    /// Terminate the calling thread.
    ///
    /// The last thread of a process to get here tears the process down.
    pub fn exit_thread(&self, status: i32) -> ! {
        let thread = self.current_thread();
        let id = thread.id();
        assert!(id != self.idle_id(), "cpu: the idle thread cannot exit");

        self.commit_exit(&thread, ExitStatus::Exited(status));
        log::debug!("cpu: thread {} (tid {}) exiting", id.index(), thread.tid());
        drop(thread);

        self.mark_dead(id);
        self.raise(THREAD_EXIT_VECTOR);

        loop {
            self.platform.wait_for_interrupt();
        }
    }

    /// Terminate the current thread from trap context and switch away.
    pub(crate) fn kill_current(&self, frame: &mut CpuContext) {
        let thread = self.current_thread();
        let id = thread.id();
        self.commit_exit(&thread, ExitStatus::Signaled(SIGKILL));
        drop(thread);

        self.mark_dead(id);
        self.reschedule(frame, false);
    }

    fn mark_dead(&self, id: ThreadId) {
        self.with_scheduler(|sched| sched.set_state(id, ThreadState::Dead));
        if self.deferred.push(id).is_err() {
            log::warn!("cpu: deferred queue full, thread {} reclaimed by sweep", id.index());
            self.deferred_overflow.store(true, Ordering::Release);
        }
    }

    /// Count `thread` out of its process; the last one runs teardown.
    pub(crate) fn commit_exit(&self, thread: &Thread, status: ExitStatus) {
        let process = thread.process();
        if !process.commit_exit(status) {
            return;
        }

        with_signals(self, process, |state| state.teardown());
        log::info!(
            "Process {} ('{}') exited: {:?}",
            process.pid(),
            process.name(),
            process.exit_status().unwrap_or(status)
        );
    }

    /// Kill every thread of `process` on behalf of `sig`.
    pub fn terminate_process(&self, process: &Arc<Process>, sig: u32) {
        process.set_exit_status_if_unset(ExitStatus::Signaled(sig));
        log::info!(
            "Process {} ('{}') terminated by {}",
            process.pid(),
            process.name(),
            signal_name(sig)
        );
        match signal::deliver_to_process(self, process, SIGKILL, SigOrigin::KERNEL) {
            Ok(()) | Err(Error::Duplicate) | Err(Error::NoThreads) => {}
            Err(err) => log::warn!("cpu: killing process {} failed: {}", process.pid(), err),
        }
    }

    /// Reclaim threads that have finished exiting.
    ///
    /// Returns the number of threads reclaimed.
    pub fn run_deferred(&self) -> usize {
        let mut reclaimed = 0;
        while let Some(id) = self.deferred.pop() {
            if self.reclaim(id) {
                reclaimed += 1;
            }
        }

        if self.deferred_overflow.swap(false, Ordering::AcqRel) {
            for id in self.with_scheduler(|sched| sched.dead_threads()) {
                if self.reclaim(id) {
                    reclaimed += 1;
                }
            }
        }
        reclaimed
    }

    fn reclaim(&self, id: ThreadId) -> bool {
        let thread = match self.with_scheduler(|sched| sched.remove(id)) {
            Some(thread) => thread,
            None => {
                log::warn!("cpu: refusing to reclaim thread {}: not dead", id.index());
                return false;
            }
        };

        let process = thread.process().clone();
        self.platform.without_interrupts(|| process.detach_thread(id));
        log::trace!("cpu: reclaimed thread {} (tid {})", id.index(), thread.tid());
        drop(thread);

        if process.is_reapable() {
            self.platform
                .without_interrupts(|| self.processes.lock().reap(process.pid()));
        }
        true
    }

    /// Body of the idle thread.
    pub fn idle_loop(&self) -> ! {
        loop {
            self.run_deferred();
            if self.with_scheduler(|sched| sched.has_runnable()) {
                self.yield_now();
            } else {
                self.platform.wait_for_interrupt();
            }
        }
    }

    // ------------------------------------------------------------------
    // Trap handling
    // ------------------------------------------------------------------

    /// Handle software trap or interrupt `vector` taken with `frame`.
    pub fn handle_trap(&self, vector: u8, frame: &mut CpuContext) {
        match vector {
            SYSCALL_VECTOR => {
                if SyscallNumber::from_u64(frame.syscall_number()) == Some(SyscallNumber::RtSigreturn) {
                    signal::sigreturn(self, frame);
                    return;
                }
                let result = syscall::dispatch(self, frame);
                frame.set_syscall_return(result.into_raw());
                self.return_to_user(frame);
            }
            YIELD_VECTOR => self.reschedule(frame, true),
            PREEMPT_VECTOR => self.reschedule(frame, false),
            SIGNAL_DISPATCH_VECTOR => self.signal_dispatch_trap(frame),
            SIGRETURN_VECTOR => signal::sigreturn(self, frame),
            THREAD_EXIT_VECTOR => {
                let dead = self.with_scheduler(|sched| {
                    sched.state(sched.current()) == Some(ThreadState::Dead)
                });
                if dead {
                    self.reschedule(frame, false);
                } else {
                    log::warn!("cpu: thread-exit trap from a live thread ignored");
                }
            }
            _ => log::warn!("cpu: unexpected trap vector {:#x}", vector),
        }
    }

    /// Last stop before a syscall returns to user mode.
    fn return_to_user(&self, frame: &mut CpuContext) {
        if !frame.is_user() {
            return;
        }
        if self.hint_true_thread() {
            self.reschedule(frame, true);
            return;
        }
        if self.signal_pending() {
            signal::dispatch(self, frame);
        }
    }

    /// Entered through the synthetic frame built by `switch_locked`: the
    /// interrupted user registers sit at the stack pointer.
    fn signal_dispatch_trap(&self, frame: &mut CpuContext) {
        let thread = self.current_thread();
        let saved: Option<CpuContext> = thread.kernel_stack().read(frame.stack_pointer());
        match saved {
            Some(user) if user.is_user() => {
                *frame = user;
                drop(thread);
                signal::dispatch(self, frame);
            }
            _ => panic!(
                "cpu: signal dispatch trap without a saved user frame (thread {})",
                thread.tid()
            ),
        }
    }

    /// Pick the next thread and switch the live frame to it.
    pub(crate) fn reschedule(&self, frame: &mut CpuContext, voluntary: bool) {
        let dispatch_now = self.platform.without_interrupts(|| {
            let mut sched = self.sched.lock();
            let next = sched.pick_next(voluntary);
            self.switch_locked(&mut sched, frame, next)
        });
        if dispatch_now {
            signal::dispatch(self, frame);
        }
    }

    /// Swap `frame` over to `next`.
    ///
    /// Returns true if the caller must run signal dispatch on `frame`
    /// directly. When a different thread comes in with a signal pending,
    /// dispatch is instead arranged on that thread's own kernel stack: its
    /// user registers are pushed there and the frame is redirected to the
    /// dispatch entry stub.
    fn switch_locked(&self, sched: &mut Scheduler, frame: &mut CpuContext, next: ThreadId) -> bool {
        let prev = sched.current();
        if next != prev {
            if sched.state(prev) != Some(ThreadState::Dead) {
                let slot = sched.slot_mut(prev);
                slot.context = *frame;
                slot.context.set_signal_pending(self.signal_pending());
            }

            *frame = sched.slot(next).context;
            self.signal_pending
                .store(frame.signal_pending(), Ordering::Release);
            sched.set_current(next);
            log::trace!("cpu: switch {} -> {}", prev.index(), next.index());
        }

        if !frame.is_user() || !self.signal_pending() {
            return false;
        }
        if next == prev {
            return true;
        }

        let user = *frame;
        let stack = sched.slot(next).thread.kernel_stack().push_top(&user);
        frame.enter_kernel_routine(signal_dispatch_entry(), stack);
        false
    }

    // ------------------------------------------------------------------
    // Processes
    // ------------------------------------------------------------------

    pub fn create_process(&self, name: &str, parent: Option<&Arc<Process>>) -> Arc<Process> {
        self.platform.without_interrupts(|| {
            self.processes
                .lock()
                .create_process(String::from(name), parent)
        })
    }

    pub fn kernel_process(&self) -> Arc<Process> {
        self.platform
            .without_interrupts(|| self.processes.lock().kernel_process())
    }

    pub fn process(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.platform
            .without_interrupts(|| self.processes.lock().get(pid))
    }

    pub fn processes_in_group(&self, pgid: ProcessId) -> Vec<Arc<Process>> {
        self.platform
            .without_interrupts(|| self.processes.lock().in_group(pgid))
    }

    pub fn all_processes(&self) -> Vec<Arc<Process>> {
        self.platform
            .without_interrupts(|| self.processes.lock().all())
    }
}
