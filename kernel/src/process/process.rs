//! Process structure and lifecycle

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::error::Error;
use crate::signal::{SignalState, ThreadSignals};
use crate::task::{Thread, ThreadId};

/// Process ID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    pub const KERNEL: ProcessId = ProcessId(0);

    pub const fn new(id: u64) -> Self {
        ProcessId(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The last thread called exit with this code
    Exited(i32),
    /// Terminated by a signal
    Signaled(u32),
}

/// Exit bookkeeping, guarded by its own lock
#[derive(Debug)]
struct ExitState {
    /// Threads that have not yet committed to exiting
    live: usize,
    status: Option<ExitStatus>,
    /// Teardown has run
    torn_down: bool,
}

/// A named group of threads sharing signal dispositions
pub struct Process {
    pid: ProcessId,

    /// Process group ID; equals the pid unless inherited from the parent
    pgid: ProcessId,

    name: String,

    /// None for processes created directly by the kernel
    parent: Option<Weak<Process>>,

    threads: Mutex<Vec<Arc<Thread>>>,

    /// Dispositions, pending sets and per-thread masks.
    ///
    /// Only taken with interrupts disabled.
    pub(crate) signals: Mutex<SignalState>,

    exit: Mutex<ExitState>,
}

impl Process {
    pub(crate) fn new(
        pid: ProcessId,
        pgid: ProcessId,
        name: String,
        parent: Option<Weak<Process>>,
    ) -> Self {
        Process {
            pid,
            pgid,
            name,
            parent,
            threads: Mutex::new(Vec::new()),
            signals: Mutex::new(SignalState::new()),
            exit: Mutex::new(ExitState {
                live: 0,
                status: None,
                torn_down: false,
            }),
        }
    }

    #[inline]
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    #[inline]
    pub fn pgid(&self) -> ProcessId {
        self.pgid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Register a freshly created thread.
    ///
    /// Fails once the process has been torn down.
    pub(crate) fn attach_thread(&self, thread: &Arc<Thread>) -> Result<(), Error> {
        let mut exit = self.exit.lock();
        if exit.torn_down {
            return Err(Error::NoSuchProcess);
        }
        exit.live += 1;
        self.threads.lock().push(thread.clone());
        self.signals
            .lock()
            .threads
            .insert(thread.id(), ThreadSignals::new());
        Ok(())
    }

    /// Forget a reclaimed thread, breaking the thread/process reference cycle.
    pub(crate) fn detach_thread(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.signals.lock().threads.remove(&id);
        let mut threads = self.threads.lock();
        let index = threads.iter().position(|t| t.id() == id)?;
        Some(threads.remove(index))
    }

    /// Record that one thread has committed to exiting.
    ///
    /// Returns true exactly once: for the last thread, which must then run
    /// process teardown.
    pub(crate) fn commit_exit(&self, status: ExitStatus) -> bool {
        let mut exit = self.exit.lock();
        assert!(exit.live > 0, "process {}: more exits than threads", self.pid);
        exit.live -= 1;
        if exit.status.is_none() {
            exit.status = Some(status);
        }
        // The kernel process outlives all of its threads
        if exit.live == 0 && !exit.torn_down && self.pid != ProcessId::KERNEL {
            exit.torn_down = true;
            return true;
        }
        false
    }

    /// Record `status` unless an earlier one already won.
    pub(crate) fn set_exit_status_if_unset(&self, status: ExitStatus) {
        let mut exit = self.exit.lock();
        if exit.status.is_none() {
            exit.status = Some(status);
        }
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit.lock().status
    }

    /// Returns true once every thread has exited and teardown has run
    pub fn has_exited(&self) -> bool {
        self.exit.lock().torn_down
    }

    /// Threads that have not committed to exiting
    pub fn live_threads(&self) -> usize {
        self.exit.lock().live
    }

    /// Torn down and all threads reclaimed
    pub(crate) fn is_reapable(&self) -> bool {
        self.has_exited() && self.threads.lock().is_empty()
    }

    /// A process whose parent has exited.
    ///
    /// Processes without a parent belong to the kernel and are never orphaned.
    pub fn is_orphaned(&self) -> bool {
        match &self.parent {
            None => false,
            Some(parent) => match parent.upgrade() {
                Some(parent) => parent.has_exited(),
                None => true,
            },
        }
    }

    pub fn first_thread(&self) -> Option<Arc<Thread>> {
        self.threads.lock().first().cloned()
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().clone()
    }

    pub fn contains_thread(&self, id: ThreadId) -> bool {
        self.threads.lock().iter().any(|t| t.id() == id)
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("pgid", &self.pgid)
            .field("name", &self.name)
            .finish()
    }
}
