//! Kutex: the in-kernel address-keyed wait/wake primitive
//!
//! Everything that blocks inside the kernel goes through here. A waiter is
//! queued under the address of a 32-bit word and suspended only if the word
//! still holds the value the caller expected; wakers change the word first
//! and then call `wake`, so a wake can never slip in between the check and
//! the sleep.
//!
//! The queues are guarded by a spin lock taken with interrupts disabled,
//! never by the blocking mutex, which is itself built on this module.

use alloc::collections::{BTreeMap, VecDeque};
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::config::YIELD_VECTOR;
use crate::error::Error;
use crate::task::scheduler::WaitState;
use crate::task::{Cpu, ThreadId, ThreadState};

/// Wait queues keyed by word address
pub struct Kutex {
    queues: Mutex<BTreeMap<usize, VecDeque<ThreadId>>>,
}

#[inline]
fn key_of(word: &AtomicU32) -> usize {
    word as *const AtomicU32 as usize
}

impl Kutex {
    pub const fn new() -> Self {
        Kutex {
            queues: Mutex::new(BTreeMap::new()),
        }
    }

    /// Block the current thread until woken through `word`.
    ///
    /// Returns immediately with `Ok` if `word` no longer holds `expected`.
    /// An interruptible wait fails with `Error::Interrupted` if a signal is
    /// or becomes deliverable to the caller before it is woken.
    pub fn wait(
        &self,
        cpu: &Cpu,
        word: &AtomicU32,
        expected: u32,
        interruptible: bool,
    ) -> Result<(), Error> {
        let key = key_of(word);

        let queued = cpu.platform().without_interrupts(|| {
            let mut queues = self.queues.lock();
            if word.load(Ordering::Acquire) != expected {
                return Ok(false);
            }
            if interruptible && cpu.signal_pending() {
                return Err(Error::Interrupted);
            }

            cpu.with_scheduler(|sched| {
                let me = sched.current();
                assert!(me != sched.idle(), "kutex: the idle thread cannot block");
                queues.entry(key).or_default().push_back(me);
                sched.slot_mut(me).wait = WaitState {
                    key: Some(key),
                    woken: false,
                    interruptible,
                };
                sched.set_state(me, ThreadState::Blocked);
            });
            Ok(true)
        })?;

        if !queued {
            return Ok(());
        }

        cpu.raise(YIELD_VECTOR);

        // Back on the CPU: either a wake or a signal made us runnable
        let wait = cpu.with_scheduler(|sched| {
            let me = sched.current();
            core::mem::take(&mut sched.slot_mut(me).wait)
        });

        if wait.woken {
            Ok(())
        } else {
            log::debug!("kutex: wait on {:#x} interrupted", key);
            Err(Error::Interrupted)
        }
    }

    /// Wake up to `count` threads waiting on `word`, oldest first.
    ///
    /// Returns the number of threads woken.
    pub fn wake(&self, cpu: &Cpu, word: &AtomicU32, count: usize) -> usize {
        let key = key_of(word);

        cpu.platform().without_interrupts(|| {
            let mut queues = self.queues.lock();
            let queue = match queues.get_mut(&key) {
                Some(queue) => queue,
                None => return 0,
            };

            let mut woken = 0;
            cpu.with_scheduler(|sched| {
                while woken < count {
                    let id = match queue.pop_front() {
                        Some(id) => id,
                        None => break,
                    };
                    let slot = sched.slot_mut(id);
                    slot.wait.woken = true;
                    slot.wait.key = None;
                    sched.set_state(id, ThreadState::Runnable);
                    woken += 1;
                }
            });

            if queue.is_empty() {
                queues.remove(&key);
            }
            woken
        })
    }

    /// End an interruptible wait of `id` because a signal became deliverable.
    ///
    /// The thread leaves its queue unwoken and is made runnable. Returns
    /// false if it was not in an interruptible wait.
    pub fn interrupt(&self, cpu: &Cpu, id: ThreadId) -> bool {
        cpu.platform().without_interrupts(|| {
            let mut queues = self.queues.lock();
            cpu.with_scheduler(|sched| {
                if sched.state(id) != Some(ThreadState::Blocked) {
                    return false;
                }
                let wait = sched.slot(id).wait;
                let key = match wait.key {
                    Some(key) if wait.interruptible => key,
                    _ => return false,
                };

                if let Some(queue) = queues.get_mut(&key) {
                    queue.retain(|&waiter| waiter != id);
                    if queue.is_empty() {
                        queues.remove(&key);
                    }
                }
                sched.slot_mut(id).wait.key = None;
                sched.set_state(id, ThreadState::Runnable);
                true
            })
        })
    }

    /// Number of threads queued on `word`
    pub fn waiters(&self, cpu: &Cpu, word: &AtomicU32) -> usize {
        cpu.platform().without_interrupts(|| {
            self.queues
                .lock()
                .get(&key_of(word))
                .map_or(0, VecDeque::len)
        })
    }
}
