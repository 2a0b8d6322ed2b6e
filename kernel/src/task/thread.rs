//! Thread records
//!
//! A `Thread` is the shared, mostly immutable half of a thread: identity,
//! owning process and kernel stack. Everything the scheduler mutates
//! (state, ring links, saved context) lives in the scheduler's arena slot
//! instead, so it is only ever touched under the scheduler lock.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytemuck::Pod;
use spin::Mutex;

use crate::process::Process;

/// Global thread ID counter
static NEXT_TID: AtomicU64 = AtomicU64::new(1); // 0 is reserved for the idle thread

/// Allocate a new user-visible thread ID
pub fn allocate_tid() -> Tid {
    Tid(NEXT_TID.fetch_add(1, Ordering::SeqCst))
}

/// Index of a thread in the scheduler arena.
///
/// Stable for the thread's whole life: the slot is only released by
/// deferred reclamation after the thread is `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(usize);

impl ThreadId {
    #[inline]
    pub(crate) const fn from_index(index: usize) -> Self {
        ThreadId(index)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// User-visible thread id (what `gettid` and `tkill` use)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u64);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// The per-CPU idle thread; never in the runnable ring
    Idle,
    /// In the runnable ring (including the thread currently on the CPU)
    Runnable,
    /// Removed from the ring by a synchronization primitive
    Blocked,
    /// Terminated; context is invalid and reclamation is pending
    Dead,
}

/// A thread's kernel stack.
///
/// Besides being the stack the thread's kernel code runs on, the scheduler
/// writes synthetic frames onto it while the thread is switched out.
pub struct KernelStack {
    memory: Mutex<Box<[u8]>>,
}

impl KernelStack {
    pub fn new(size: usize) -> Self {
        KernelStack {
            memory: Mutex::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    fn base(memory: &[u8]) -> u64 {
        memory.as_ptr() as u64
    }

    /// Highest address of the stack (exclusive)
    pub fn top(&self) -> u64 {
        let memory = self.memory.lock();
        Self::base(&memory) + memory.len() as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        let memory = self.memory.lock();
        let base = Self::base(&memory);
        addr >= base && addr < base + memory.len() as u64
    }

    /// Store `value` 16-byte aligned at the top of the stack.
    ///
    /// Only valid while the owning thread is switched out with no kernel
    /// frames of its own, i.e. it was suspended in user mode.
    pub fn push_top<T: Pod>(&self, value: &T) -> u64 {
        let mut memory = self.memory.lock();
        let base = Self::base(&memory);
        let size = core::mem::size_of::<T>() as u64;
        let addr = (base + memory.len() as u64 - size) & !0xf;
        assert!(addr >= base, "kernel stack too small for a {} byte frame", size);

        let offset = (addr - base) as usize;
        memory[offset..offset + size as usize].copy_from_slice(bytemuck::bytes_of(value));
        addr
    }

    /// Read back a value previously stored at `addr`.
    pub fn read<T: Pod>(&self, addr: u64) -> Option<T> {
        let memory = self.memory.lock();
        let offset = addr.checked_sub(Self::base(&memory))? as usize;
        let end = offset.checked_add(core::mem::size_of::<T>())?;
        let bytes = memory.get(offset..end)?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }
}

pub struct Thread {
    id: ThreadId,
    tid: Tid,
    name: String,
    process: Arc<Process>,
    kernel_stack: KernelStack,
    /// Wait word of a condition-variable waiter: 1 once signalled
    pub(crate) cond_woken: AtomicU32,
    /// Wait word for sleeps only a signal can end (sigsuspend)
    pub(crate) sleep_word: AtomicU32,
}

impl Thread {
    pub(crate) fn new(
        id: ThreadId,
        tid: Tid,
        name: String,
        process: Arc<Process>,
        stack_size: usize,
    ) -> Self {
        Thread {
            id,
            tid,
            name,
            process,
            kernel_stack: KernelStack::new(stack_size),
            cond_woken: AtomicU32::new(0),
            sleep_word: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub fn kernel_stack(&self) -> &KernelStack {
        &self.kernel_stack
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("pid", &self.process.pid())
            .finish()
    }
}
