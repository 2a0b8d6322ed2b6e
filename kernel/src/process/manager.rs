//! Process manager - the pid-indexed table of live processes

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{Process, ProcessId};

/// Process manager handles all processes in the system
pub struct ProcessManager {
    /// All processes indexed by PID
    processes: BTreeMap<ProcessId, Arc<Process>>,

    /// Next available PID
    next_pid: u64,
}

impl ProcessManager {
    /// Create a manager holding only the kernel process (pid 0)
    pub fn new() -> Self {
        let mut processes = BTreeMap::new();
        let kernel = Arc::new(Process::new(
            ProcessId::KERNEL,
            ProcessId::KERNEL,
            String::from("kernel"),
            None,
        ));
        processes.insert(ProcessId::KERNEL, kernel);
        ProcessManager {
            processes,
            next_pid: 1, // PIDs start at 1 (0 is kernel)
        }
    }

    /// Create a new, threadless process.
    ///
    /// A child inherits its parent's process group; a parentless process
    /// leads a new group.
    pub fn create_process(&mut self, name: String, parent: Option<&Arc<Process>>) -> Arc<Process> {
        let pid = ProcessId::new(self.next_pid);
        self.next_pid += 1;

        let pgid = parent.map_or(pid, |p| p.pgid());
        let process = Arc::new(Process::new(pid, pgid, name, parent.map(Arc::downgrade)));
        self.processes.insert(pid, process.clone());

        log::info!(
            "Created process '{}' pid {} (pgid {})",
            process.name(),
            pid,
            pgid
        );
        process
    }

    pub fn kernel_process(&self) -> Arc<Process> {
        match self.processes.get(&ProcessId::KERNEL) {
            Some(process) => process.clone(),
            None => panic!("kernel process missing from the process table"),
        }
    }

    pub fn get(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.processes.get(&pid).cloned()
    }

    /// Members of process group `pgid`, excluding the kernel process
    pub fn in_group(&self, pgid: ProcessId) -> Vec<Arc<Process>> {
        self.processes
            .values()
            .filter(|p| p.pid() != ProcessId::KERNEL && p.pgid() == pgid)
            .cloned()
            .collect()
    }

    /// Every user process
    pub fn all(&self) -> Vec<Arc<Process>> {
        self.processes
            .values()
            .filter(|p| p.pid() != ProcessId::KERNEL)
            .cloned()
            .collect()
    }

    /// Drop `pid` from the table if it has fully exited.
    pub fn reap(&mut self, pid: ProcessId) -> bool {
        let reapable = self
            .processes
            .get(&pid)
            .map_or(false, |p| pid != ProcessId::KERNEL && p.is_reapable());
        if reapable {
            self.processes.remove(&pid);
            log::debug!("Reaped process {}", pid);
        }
        reapable
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
