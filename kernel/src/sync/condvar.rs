//! Condition variable with strict FIFO wakeup
//!
//! Waiters queue in arrival order; `signal` always wakes the oldest. Each
//! waiter sleeps on its own thread's `cond_woken` word, so a wakeup targets
//! exactly one thread instead of racing every waiter for the lock.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use spin::Mutex as SpinMutex;

use super::mutex::MutexGuard;
use crate::error::Error;
use crate::task::{Cpu, Thread};

pub struct Condvar {
    waiters: SpinMutex<VecDeque<Arc<Thread>>>,
}

impl Condvar {
    pub const fn new() -> Self {
        Condvar {
            waiters: SpinMutex::new(VecDeque::new()),
        }
    }

    /// Release `guard`, sleep until signalled, then re-acquire.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let (guard, result) = self.wait_inner(guard, false);
        if let Err(err) = result {
            panic!("uninterruptible condvar wait failed: {}", err);
        }
        guard
    }

    /// Like `wait`, but a deliverable signal ends the sleep early.
    ///
    /// The mutex is re-acquired in either case; the result says whether the
    /// caller was signalled (`Ok`) or interrupted.
    pub fn wait_interruptible<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
    ) -> (MutexGuard<'a, T>, Result<(), Error>) {
        self.wait_inner(guard, true)
    }

    fn wait_inner<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        interruptible: bool,
    ) -> (MutexGuard<'a, T>, Result<(), Error>) {
        let cpu = guard.cpu();
        let mutex = guard.mutex();
        let me = cpu.current_thread();

        me.cond_woken.store(0, Ordering::Release);
        cpu.platform()
            .without_interrupts(|| self.waiters.lock().push_back(me.clone()));
        drop(guard);

        let mut result = Ok(());
        while me.cond_woken.load(Ordering::Acquire) == 0 {
            if let Err(err) = cpu.kutex().wait(cpu, &me.cond_woken, 0, interruptible) {
                result = Err(err);
                break;
            }
        }

        if result.is_err() && !self.remove(cpu, &me) {
            // A signal() already dequeued us; take the wakeup
            result = Ok(());
        }

        (mutex.lock(cpu), result)
    }

    fn remove(&self, cpu: &Cpu, thread: &Arc<Thread>) -> bool {
        cpu.platform().without_interrupts(|| {
            let mut waiters = self.waiters.lock();
            match waiters.iter().position(|t| Arc::ptr_eq(t, thread)) {
                Some(index) => {
                    waiters.remove(index);
                    true
                }
                None => false,
            }
        })
    }

    /// Wake the oldest waiter. Returns false if nobody was waiting.
    pub fn signal(&self, cpu: &Cpu) -> bool {
        let waiter = cpu
            .platform()
            .without_interrupts(|| self.waiters.lock().pop_front());
        match waiter {
            Some(thread) => {
                thread.cond_woken.store(1, Ordering::Release);
                cpu.kutex().wake(cpu, &thread.cond_woken, 1);
                true
            }
            None => false,
        }
    }

    /// Wake every waiter, oldest first. Returns how many were woken.
    pub fn broadcast(&self, cpu: &Cpu) -> usize {
        let mut woken = 0;
        while self.signal(cpu) {
            woken += 1;
        }
        woken
    }

    pub fn waiter_count(&self, cpu: &Cpu) -> usize {
        cpu.platform()
            .without_interrupts(|| self.waiters.lock().len())
    }
}
