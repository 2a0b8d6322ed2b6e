//! Host test harness
//!
//! Runs the real `Cpu` on top of OS threads. Every kernel thread gets its
//! own OS thread, but only the holder of the baton executes; a context
//! switch hands the baton, together with the frame the incoming thread
//! resumes with, to the next thread and parks the outgoing one. The test's
//! own thread plays the idle thread.
//!
//! User threads run a closure standing in for user code. Signal handlers
//! are closures registered under a fake code address; whenever a trap
//! returns with the instruction pointer at one of them the harness runs it
//! and then performs the handler's return through the sigreturn trampoline.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, LockResult, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use bytemuck::Pod;
use log::LevelFilter;

use crate::arch_impl::{signal_dispatch_entry, CpuContext, ExecutionContext, Platform};
use crate::config::{PREEMPT_VECTOR, SIGNAL_DISPATCH_VECTOR, SIGRETURN_VECTOR, SYSCALL_VECTOR};
use crate::error::Error;
use crate::process::Process;
use crate::syscall::SyscallNumber;
use crate::task::{Cpu, Thread, ThreadId, ThreadState};

/// Base of the user stacks handed out by `spawn_user`
const USER_STACK_BASE: u64 = 0x1000_0000;
const USER_STACK_SIZE: u64 = 0x10000;
/// Scratch user memory every harness maps
pub const SCRATCH: u64 = 0x2000_0000;
pub const SCRATCH_SIZE: u64 = 0x10000;

thread_local! {
    /// Registers of the emulated thread owning this OS thread
    static REGS: Cell<CpuContext> = Cell::new(CpuContext::default());
    /// This OS thread is inside a trap
    static IN_TRAP: Cell<bool> = Cell::new(false);
}

/// Unwind payload of an emulated thread that exited or was killed
struct ThreadExited;

type Handler = Arc<dyn Fn(&mut UserCpu, u32, u64, u64) + Send + Sync>;

struct Baton {
    holder: Option<ThreadId>,
    idle: Option<ThreadId>,
    /// Frame each thread resumes with once it gets the baton
    handoff: HashMap<ThreadId, CpuContext>,
    /// First panic message of any emulated thread
    failure: Option<String>,
}

pub struct HostPlatform {
    irq: AtomicBool,
    baton: Mutex<Baton>,
    turn: Condvar,
    memory: Mutex<BTreeMap<u64, Vec<u8>>>,
    seed: AtomicU64,
}

fn relock<'a, T>(result: LockResult<MutexGuard<'a, T>>) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

impl HostPlatform {
    pub fn new() -> Self {
        HostPlatform {
            irq: AtomicBool::new(true),
            baton: Mutex::new(Baton {
                holder: None,
                idle: None,
                handoff: HashMap::new(),
                failure: None,
            }),
            turn: Condvar::new(),
            memory: Mutex::new(BTreeMap::new()),
            seed: AtomicU64::new(0x9e37_79b9_7f4a_7c15),
        }
    }

    fn trap(&self, cpu: &Cpu, vector: u8) {
        let me = cpu.current_id();
        let nested = IN_TRAP.with(|t| t.replace(true));
        let were_enabled = self.irq.swap(false, Ordering::SeqCst);

        let mut frame = if nested {
            CpuContext::kernel_thread(0, 0, 0)
        } else {
            REGS.with(Cell::get)
        };
        cpu.handle_trap(vector, &mut frame);
        let frame = self.settle(cpu, me, frame);

        if !nested {
            REGS.with(|r| r.set(frame));
        }
        self.irq.store(were_enabled, Ordering::SeqCst);
        IN_TRAP.with(|t| t.set(nested));
    }

    /// Follow the live frame until `me` owns it again.
    fn settle(&self, cpu: &Cpu, me: ThreadId, mut frame: CpuContext) -> CpuContext {
        loop {
            let next = cpu.current_id();
            if next != me {
                let gone = matches!(cpu.thread_state(me), Some(ThreadState::Dead) | None);
                self.hand_over(next, frame);
                if gone {
                    panic::resume_unwind(Box::new(ThreadExited));
                }
                frame = self.wait_turn(me);
            }

            // The synthetic frame traps straight back in
            if !frame.is_user() && frame.instruction_pointer() == signal_dispatch_entry() {
                cpu.handle_trap(SIGNAL_DISPATCH_VECTOR, &mut frame);
                continue;
            }
            return frame;
        }
    }

    fn hand_over(&self, next: ThreadId, frame: CpuContext) {
        let mut baton = relock(self.baton.lock());
        baton.handoff.insert(next, frame);
        baton.holder = Some(next);
        self.turn.notify_all();
    }

    fn wait_turn(&self, me: ThreadId) -> CpuContext {
        let mut baton = relock(self.baton.lock());
        loop {
            if let Some(failure) = baton.failure.clone() {
                let idle = baton.idle == Some(me);
                drop(baton);
                if idle {
                    panic!("emulated thread panicked: {}", failure);
                }
                panic::resume_unwind(Box::new(ThreadExited));
            }
            if baton.holder == Some(me) {
                if let Some(frame) = baton.handoff.remove(&me) {
                    return frame;
                }
            }
            baton = relock(self.turn.wait(baton));
        }
    }

    fn fail(&self, message: String) {
        let mut baton = relock(self.baton.lock());
        baton.failure.get_or_insert(message);
        self.turn.notify_all();
    }

    fn region<R>(&self, addr: u64, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, Error> {
        let mut memory = relock(self.memory.lock());
        let (base, bytes) = memory.range_mut(..=addr).next_back().ok_or(Error::Fault)?;
        let offset = (addr - *base) as usize;
        let end = offset.checked_add(len).ok_or(Error::Fault)?;
        let slice = bytes.get_mut(offset..end).ok_or(Error::Fault)?;
        Ok(f(slice))
    }
}

impl Platform for HostPlatform {
    fn interrupts_enabled(&self) -> bool {
        self.irq.load(Ordering::SeqCst)
    }

    fn disable_interrupts(&self) {
        self.irq.store(false, Ordering::SeqCst);
    }

    fn enable_interrupts(&self) {
        self.irq.store(true, Ordering::SeqCst);
    }

    fn raise(&self, cpu: &Cpu, vector: u8) {
        self.trap(cpu, vector);
    }

    fn wait_for_interrupt(&self) {
        std::thread::yield_now();
    }

    fn copy_to_user(&self, addr: u64, bytes: &[u8]) -> Result<(), Error> {
        self.region(addr, bytes.len(), |dst| dst.copy_from_slice(bytes))
    }

    fn copy_from_user(&self, addr: u64, bytes: &mut [u8]) -> Result<(), Error> {
        self.region(addr, bytes.len(), |src| bytes.copy_from_slice(src))
    }

    fn entropy(&self) -> u64 {
        let mut x = self.seed.load(Ordering::Relaxed);
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.seed.store(x, Ordering::Relaxed);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }
}

pub struct Harness {
    pub cpu: &'static Cpu,
    platform: &'static HostPlatform,
    handlers: Mutex<HashMap<u64, Handler>>,
    os_threads: Mutex<Vec<JoinHandle<()>>>,
    next_stack: AtomicU64,
}

impl Harness {
    /// Fresh CPU with the calling OS thread as its idle thread.
    pub fn new() -> &'static Harness {
        crate::logger::init(LevelFilter::Debug);

        let platform: &'static HostPlatform = Box::leak(Box::new(HostPlatform::new()));
        let cpu: &'static Cpu = Box::leak(Box::new(Cpu::new(platform)));
        {
            let mut baton = relock(platform.baton.lock());
            baton.holder = Some(cpu.idle_id());
            baton.idle = Some(cpu.idle_id());
        }
        REGS.with(|r| r.set(CpuContext::default()));
        IN_TRAP.with(|t| t.set(false));

        let harness = Box::leak(Box::new(Harness {
            cpu,
            platform,
            handlers: Mutex::new(HashMap::new()),
            os_threads: Mutex::new(Vec::new()),
            next_stack: AtomicU64::new(0),
        }));
        harness.map(SCRATCH, SCRATCH_SIZE);
        harness
    }

    /// Back `[base, base + size)` with zeroed user memory.
    pub fn map(&self, base: u64, size: u64) {
        relock(self.platform.memory.lock()).insert(base, vec![0u8; size as usize]);
    }

    pub fn read<T: Pod>(&self, addr: u64) -> T {
        let mut value = T::zeroed();
        self.platform
            .copy_from_user(addr, bytemuck::bytes_of_mut(&mut value))
            .expect("harness read of unmapped user memory");
        value
    }

    pub fn write<T: Pod>(&self, addr: u64, value: &T) {
        self.platform
            .copy_to_user(addr, bytemuck::bytes_of(value))
            .expect("harness write to unmapped user memory");
    }

    pub fn process(&self, name: &str) -> Arc<Process> {
        self.cpu.create_process(name, None)
    }

    pub fn child_process(&self, name: &str, parent: &Arc<Process>) -> Arc<Process> {
        self.cpu.create_process(name, Some(parent))
    }

    /// Register `f` as the user code found at `addr`.
    pub fn on_signal(
        &self,
        addr: u64,
        f: impl Fn(&mut UserCpu, u32, u64, u64) + Send + Sync + 'static,
    ) {
        relock(self.handlers.lock()).insert(addr, Arc::new(f));
    }

    fn handler_at(&self, addr: u64) -> Option<Handler> {
        relock(self.handlers.lock()).get(&addr).cloned()
    }

    pub fn spawn_kernel(
        &'static self,
        process: &Arc<Process>,
        name: &str,
        body: impl FnOnce(&'static Cpu) + Send + 'static,
    ) -> Arc<Thread> {
        let thread = self
            .cpu
            .spawn_kernel_thread(process, name, 0, 0)
            .expect("spawn kernel thread");
        let cpu = self.cpu;
        self.start(thread.id(), name, move || {
            body(cpu);
            cpu.exit_thread(0);
        });
        thread
    }

    pub fn spawn_user(
        &'static self,
        process: &Arc<Process>,
        name: &str,
        body: impl FnOnce(&mut UserCpu) + Send + 'static,
    ) -> Arc<Thread> {
        let n = self.next_stack.fetch_add(1, Ordering::Relaxed);
        let base = USER_STACK_BASE + n * USER_STACK_SIZE;
        self.map(base, USER_STACK_SIZE);

        let thread = self
            .cpu
            .spawn_user_thread(process, name, 0x40_0000, base + USER_STACK_SIZE)
            .expect("spawn user thread");
        self.start(thread.id(), name, move || {
            let mut user = UserCpu { harness: self };
            body(&mut user);
            user.exit(0);
        });
        thread
    }

    fn start(&'static self, id: ThreadId, name: &str, body: impl FnOnce() + Send + 'static) {
        let platform = self.platform;
        let cpu = self.cpu;
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let frame = platform.wait_turn(id);
                    IN_TRAP.with(|t| t.set(true));
                    let frame = platform.settle(cpu, id, frame);
                    IN_TRAP.with(|t| t.set(false));
                    REGS.with(|r| r.set(frame));
                    platform.irq.store(true, Ordering::SeqCst);
                    body();
                }));
                if let Err(payload) = outcome {
                    if payload.is::<ThreadExited>() {
                        return;
                    }
                    let message = payload
                        .downcast_ref::<String>()
                        .cloned()
                        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                        .unwrap_or_else(|| "non-string panic".to_string());
                    platform.fail(message);
                }
            })
            .expect("spawn OS thread");
        relock(self.os_threads.lock()).push(handle);
    }

    /// Play the idle thread until nothing is runnable.
    pub fn run(&self) {
        loop {
            self.cpu.run_deferred();
            if !self.cpu.with_scheduler(|sched| sched.has_runnable()) {
                break;
            }
            self.cpu.yield_now();
        }

        let failure = relock(self.platform.baton.lock()).failure.clone();
        if let Some(failure) = failure {
            panic!("emulated thread panicked: {}", failure);
        }

        // Threads still blocked keep their OS threads parked
        let mut threads = relock(self.os_threads.lock());
        let (done, parked): (Vec<_>, Vec<_>) = threads.drain(..).partition(|h| h.is_finished());
        *threads = parked;
        drop(threads);
        for handle in done {
            let _ = handle.join();
        }
    }

    /// Scheduler state of `thread`; None once reclaimed
    pub fn state_of(&self, thread: &Thread) -> Option<ThreadState> {
        self.cpu.thread_state(thread.id())
    }
}

/// The user-mode view of the emulated thread running on this OS thread
pub struct UserCpu {
    harness: &'static Harness,
}

impl UserCpu {
    pub fn cpu(&self) -> &'static Cpu {
        self.harness.cpu
    }

    pub fn harness(&self) -> &'static Harness {
        self.harness
    }

    pub fn regs(&self) -> CpuContext {
        REGS.with(Cell::get)
    }

    pub fn set_regs(&mut self, regs: CpuContext) {
        REGS.with(|r| r.set(regs));
    }

    /// Issue system call `number` and return the raw result.
    pub fn syscall(&mut self, number: SyscallNumber, args: &[u64]) -> i64 {
        self.syscall_raw(number as u64, args)
    }

    pub fn syscall_raw(&mut self, number: u64, args: &[u64]) -> i64 {
        let mut regs = self.regs();
        arch::load_syscall(&mut regs, number, args);
        self.set_regs(regs);
        self.trap(SYSCALL_VECTOR);
        arch::syscall_return(&self.regs()) as i64
    }

    /// Take a timer interrupt.
    pub fn preempt(&mut self) {
        self.trap(PREEMPT_VECTOR);
    }

    /// Enter the kernel through `vector` and run any handlers the return
    /// lands in.
    pub fn trap(&mut self, vector: u8) {
        let caller_sp = self.regs().stack_pointer();
        self.cpu().raise(vector);
        self.run_handlers(caller_sp);
    }

    /// Run handlers for as long as the trap left a fresh frame below
    /// `caller_sp`. A trap made from inside a handler comes back with the
    /// handler's own stack pointer unless a nested frame was pushed.
    fn run_handlers(&mut self, caller_sp: u64) {
        while self.regs().stack_pointer() != caller_sp {
            let Some(handler) = self.harness.handler_at(self.regs().instruction_pointer()) else {
                break;
            };
            let [sig, info, context] = arch::handler_args(&self.regs());
            handler(self, sig as u32, info, context);
            self.return_from_handler();
        }
    }

    /// Return from the running handler: `ret` into the trampoline, which
    /// traps into sigreturn.
    pub fn return_from_handler(&mut self) {
        let mut regs = self.regs();
        arch::handler_return(self.harness, &mut regs);
        self.set_regs(regs);
        self.cpu().raise(SIGRETURN_VECTOR);
    }

    pub fn exit(&mut self, code: i32) -> ! {
        self.syscall(SyscallNumber::Exit, &[code as u64]);
        unreachable!("exit returned");
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::Harness;
    use crate::arch_impl::{CpuContext, ExecutionContext};

    pub fn load_syscall(regs: &mut CpuContext, number: u64, args: &[u64]) {
        let mut slots = [0u64; 6];
        slots[..args.len()].copy_from_slice(args);
        regs.rax = number;
        regs.rdi = slots[0];
        regs.rsi = slots[1];
        regs.rdx = slots[2];
        regs.r10 = slots[3];
        regs.r8 = slots[4];
        regs.r9 = slots[5];
    }

    pub fn syscall_return(regs: &CpuContext) -> u64 {
        regs.rax
    }

    pub fn handler_args(regs: &CpuContext) -> [u64; 3] {
        [regs.rdi, regs.rsi, regs.rdx]
    }

    pub fn handler_return(harness: &Harness, regs: &mut CpuContext) {
        let ret: u64 = harness.read(regs.rsp);
        regs.rsp += 8;
        regs.rip = ret + CpuContext::TRAP_INSN_LEN;
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::Harness;
    use crate::arch_impl::{CpuContext, ExecutionContext};

    pub fn load_syscall(regs: &mut CpuContext, number: u64, args: &[u64]) {
        regs.x[8] = number;
        regs.x[..args.len()].copy_from_slice(args);
    }

    pub fn syscall_return(regs: &CpuContext) -> u64 {
        regs.x[0]
    }

    pub fn handler_args(regs: &CpuContext) -> [u64; 3] {
        [regs.x[0], regs.x[1], regs.x[2]]
    }

    pub fn handler_return(_harness: &Harness, regs: &mut CpuContext) {
        regs.pc = regs.x[30] + CpuContext::TRAP_INSN_LEN;
    }
}
