//! Round-robin scheduler over a circular runnable ring.
//!
//! Threads live in a `Slab` arena and are named by `ThreadId` (the arena
//! index). Runnable threads are linked into a circular doubly linked ring
//! through `prev`/`next` indices; there is no sentinel. The thread currently
//! on the CPU stays in the ring while it is runnable, and picking a thread
//! advances the ring head past it, which gives round robin.
//!
//! The scheduler itself never touches hardware. `Cpu` owns it behind a spin
//! lock taken with interrupts disabled and performs the actual frame swap.

use alloc::sync::Arc;
use alloc::vec::Vec;

use slab::Slab;

use super::thread::{Thread, ThreadId, ThreadState};
use crate::arch_impl::CpuContext;

/// Ring neighbours of a runnable thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Links {
    pub prev: ThreadId,
    pub next: ThreadId,
}

/// Kutex bookkeeping for a blocked thread
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WaitState {
    /// Address the thread is queued on, if any
    pub key: Option<usize>,
    /// Set by the waking side
    pub woken: bool,
    /// A deliverable signal may end the wait
    pub interruptible: bool,
}

/// Arena slot: everything the scheduler mutates about a thread
pub(crate) struct ThreadSlot {
    pub thread: Arc<Thread>,
    pub state: ThreadState,
    pub links: Option<Links>,
    pub context: CpuContext,
    pub yield_to: Option<ThreadId>,
    pub wait: WaitState,
}

pub struct Scheduler {
    slots: Slab<ThreadSlot>,

    /// Next thread round robin will pick; None when the ring is empty
    head: Option<ThreadId>,

    /// Thread whose context is in the live frame
    current: ThreadId,

    /// Thread that owns the current time slice. Differs from `current`
    /// only while a yield-to hand-off is in effect.
    true_thread: ThreadId,

    /// Idle thread (runs when no other threads are runnable)
    idle: ThreadId,
}

impl Scheduler {
    /// Create a scheduler whose idle thread is the caller's flow of execution.
    ///
    /// `make_idle` receives the id reserved for the idle thread.
    pub fn new(capacity: usize, make_idle: impl FnOnce(ThreadId) -> Arc<Thread>) -> Self {
        let mut slots = Slab::with_capacity(capacity);
        let entry = slots.vacant_entry();
        let idle = ThreadId::from_index(entry.key());
        entry.insert(ThreadSlot {
            thread: make_idle(idle),
            state: ThreadState::Idle,
            links: None,
            context: CpuContext::default(),
            yield_to: None,
            wait: WaitState::default(),
        });

        Scheduler {
            slots,
            head: None,
            current: idle,
            true_thread: idle,
            idle,
        }
    }

    /// Id the next `insert` will use
    pub fn next_id(&self) -> ThreadId {
        ThreadId::from_index(self.slots.vacant_key())
    }

    /// Add a thread in the `Blocked` state with its initial context.
    ///
    /// The thread must have been built with the id from `next_id`.
    pub fn insert(&mut self, thread: Arc<Thread>, context: CpuContext) -> ThreadId {
        let id = ThreadId::from_index(self.slots.insert(ThreadSlot {
            thread,
            state: ThreadState::Blocked,
            links: None,
            context,
            yield_to: None,
            wait: WaitState::default(),
        }));
        assert_eq!(
            self.slots[id.index()].thread.id(),
            id,
            "thread built for a different arena slot"
        );
        id
    }

    /// Remove a dead thread from the arena, returning it.
    pub fn remove(&mut self, id: ThreadId) -> Option<Arc<Thread>> {
        match self.slots.get(id.index()) {
            Some(slot) if slot.state == ThreadState::Dead && id != self.current => {
                // The slot may be reused; a lent slice falls back to its borrower
                if self.true_thread == id {
                    self.true_thread = self.current;
                }
                Some(self.slots.remove(id.index()).thread)
            }
            _ => None,
        }
    }

    #[inline]
    pub fn current(&self) -> ThreadId {
        self.current
    }

    #[inline]
    pub fn idle(&self) -> ThreadId {
        self.idle
    }

    #[inline]
    pub fn true_thread(&self) -> ThreadId {
        self.true_thread
    }

    pub(crate) fn set_true_thread(&mut self, id: ThreadId) {
        self.true_thread = id;
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Arc<Thread>> {
        self.slots.get(id.index()).map(|slot| &slot.thread)
    }

    pub fn state(&self, id: ThreadId) -> Option<ThreadState> {
        self.slots.get(id.index()).map(|slot| slot.state)
    }

    pub(crate) fn slot(&self, id: ThreadId) -> &ThreadSlot {
        match self.slots.get(id.index()) {
            Some(slot) => slot,
            None => panic!("scheduler: no thread in slot {}", id.index()),
        }
    }

    pub(crate) fn slot_mut(&mut self, id: ThreadId) -> &mut ThreadSlot {
        match self.slots.get_mut(id.index()) {
            Some(slot) => slot,
            None => panic!("scheduler: no thread in slot {}", id.index()),
        }
    }

    /// Returns true if any thread besides idle can run
    pub fn has_runnable(&self) -> bool {
        self.head.is_some()
    }

    /// Ids of all dead threads still in the arena
    pub fn dead_threads(&self) -> Vec<ThreadId> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.state == ThreadState::Dead)
            .map(|(index, _)| ThreadId::from_index(index))
            .collect()
    }

    /// Change a thread's state, keeping ring membership in sync.
    ///
    /// Must be called with interrupts disabled.
    pub fn set_state(&mut self, id: ThreadId, state: ThreadState) {
        let old = self.slot(id).state;
        assert!(
            (id == self.idle) == (state == ThreadState::Idle),
            "scheduler: only the idle thread may be Idle ({:?} -> {:?})",
            old,
            state
        );
        if old == state {
            return;
        }
        assert!(old != ThreadState::Dead, "scheduler: dead thread revived");

        if old == ThreadState::Runnable {
            self.unlink(id);
        }
        self.slot_mut(id).state = state;
        if state == ThreadState::Runnable {
            self.link(id);
        }

        let slot = self.slot(id);
        match slot.state {
            ThreadState::Runnable => assert!(slot.links.is_some(), "runnable thread unlinked"),
            _ => assert!(slot.links.is_none(), "non-runnable thread still linked"),
        }

        #[cfg(any(test, feature = "ring_checks"))]
        if let Err(err) = self.check_ring() {
            panic!("scheduler: ring corrupt after set_state: {}", err);
        }
    }

    /// Insert before the head, i.e. at the tail of round-robin order.
    fn link(&mut self, id: ThreadId) {
        match self.head {
            None => {
                self.slot_mut(id).links = Some(Links { prev: id, next: id });
                self.head = Some(id);
            }
            Some(head) => {
                let tail = self.links_of(head).prev;
                self.slot_mut(id).links = Some(Links { prev: tail, next: head });
                self.links_mut(tail).next = id;
                self.links_mut(head).prev = id;
            }
        }
    }

    fn unlink(&mut self, id: ThreadId) {
        let links = match self.slot_mut(id).links.take() {
            Some(links) => links,
            None => panic!("scheduler: unlinking thread {} that is not in the ring", id.index()),
        };

        if links.next == id {
            assert_eq!(links.prev, id, "scheduler: half-linked singleton");
            self.head = None;
            return;
        }

        self.links_mut(links.prev).next = links.next;
        self.links_mut(links.next).prev = links.prev;
        if self.head == Some(id) {
            self.head = Some(links.next);
        }
    }

    fn links_of(&self, id: ThreadId) -> Links {
        match self.slot(id).links {
            Some(links) => links,
            None => panic!("scheduler: ring points at unlinked thread {}", id.index()),
        }
    }

    fn links_mut(&mut self, id: ThreadId) -> &mut Links {
        match self.slot_mut(id).links.as_mut() {
            Some(links) => links,
            None => panic!("scheduler: ring points at unlinked thread {}", id.index()),
        }
    }

    /// Choose the thread to run next.
    ///
    /// On a voluntary yield the current thread's yield-to hint is consumed
    /// and honoured if the hinted thread is runnable. Otherwise the ring head
    /// is picked and the head advances past it. An empty ring picks idle.
    pub fn pick_next(&mut self, voluntary: bool) -> ThreadId {
        if voluntary {
            let current = self.current;
            if let Some(hint) = self.slot_mut(current).yield_to.take() {
                if self.state(hint) == Some(ThreadState::Runnable) {
                    // The slice still belongs to whoever was running it
                    if self.state(self.true_thread) != Some(ThreadState::Runnable) {
                        self.true_thread = current;
                    }
                    return hint;
                }
                log::trace!("yield-to hint {} not runnable, using round robin", hint.index());
            }
        }

        let next = match self.head {
            Some(head) => {
                self.head = Some(self.links_of(head).next);
                head
            }
            None => self.idle,
        };
        self.true_thread = next;
        next
    }

    /// Record a yield-to hint for the current thread.
    pub fn set_yield_hint(&mut self, hint: Option<ThreadId>) {
        let current = self.current;
        self.slot_mut(current).yield_to = hint;
    }

    pub(crate) fn set_current(&mut self, id: ThreadId) {
        self.current = id;
    }

    /// Walk the ring and verify it is a well-formed circle containing
    /// exactly the runnable threads.
    pub fn check_ring(&self) -> Result<(), &'static str> {
        let runnable = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.state == ThreadState::Runnable)
            .count();

        let head = match self.head {
            None if runnable == 0 => return Ok(()),
            None => return Err("runnable threads but no ring head"),
            Some(head) => head,
        };

        let mut seen = 0usize;
        let mut cursor = head;
        loop {
            let slot = self.slots.get(cursor.index()).ok_or("ring links to an empty slot")?;
            if slot.state != ThreadState::Runnable {
                return Err("non-runnable thread reachable from the ring");
            }
            let links = slot.links.ok_or("ring member without links")?;
            let next = self.slots.get(links.next.index()).ok_or("next links to an empty slot")?;
            if next.links.map(|l| l.prev) != Some(cursor) {
                return Err("next.prev does not point back");
            }
            seen += 1;
            if seen > runnable {
                return Err("runnable thread reachable twice");
            }
            cursor = links.next;
            if cursor == head {
                break;
            }
        }

        if seen == runnable {
            Ok(())
        } else {
            Err("runnable thread missing from the ring")
        }
    }

    /// Ring order starting at the head (for diagnostics and tests)
    pub fn ring(&self) -> Vec<ThreadId> {
        let mut order = Vec::new();
        if let Some(head) = self.head {
            let mut cursor = head;
            loop {
                order.push(cursor);
                cursor = self.links_of(cursor).next;
                if cursor == head {
                    break;
                }
            }
        }
        order
    }
}
