//! Blocking kernel mutex
//!
//! A tri-state word: `UNLOCKED`, `LOCKED` (held, nobody waiting) and
//! `CONTENDED` (held, waiters may be queued on the kutex). Uncontended
//! lock and unlock are a single atomic operation each; only `CONTENDED`
//! costs a trip through the kutex.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::Error;
use crate::task::Cpu;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Observable mutex state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
    Contended,
}

pub struct RawMutex {
    state: AtomicU32,
}

impl RawMutex {
    pub const fn new() -> Self {
        RawMutex {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    pub fn state(&self) -> LockState {
        match self.state.load(Ordering::Acquire) {
            UNLOCKED => LockState::Unlocked,
            LOCKED => LockState::Locked,
            _ => LockState::Contended,
        }
    }

    /// Acquire without blocking.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire, sleeping while the mutex is held.
    pub fn lock(&self, cpu: &Cpu) {
        if let Err(err) = self.acquire(cpu, false) {
            panic!("uninterruptible mutex wait failed: {}", err);
        }
    }

    /// Acquire, giving up with `Error::Interrupted` if a signal becomes
    /// deliverable to the caller while it sleeps.
    pub fn lock_interruptible(&self, cpu: &Cpu) -> Result<(), Error> {
        self.acquire(cpu, true)
    }

    fn acquire(&self, cpu: &Cpu, interruptible: bool) -> Result<(), Error> {
        // A thread that has slept cannot know whether others still wait,
        // so from then on it takes the lock as CONTENDED.
        let mut take_as = LOCKED;
        loop {
            match self
                .state
                .compare_exchange(UNLOCKED, take_as, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return Ok(()),
                Err(LOCKED) => {
                    if self
                        .state
                        .compare_exchange(LOCKED, CONTENDED, Ordering::Relaxed, Ordering::Relaxed)
                        .is_err()
                    {
                        // Unlocked or contended meanwhile: start over
                        continue;
                    }
                }
                Err(_) => {}
            }

            cpu.kutex().wait(cpu, &self.state, CONTENDED, interruptible)?;
            take_as = CONTENDED;
        }
    }

    /// The kutex word waiters sleep on
    #[cfg(test)]
    pub(crate) fn word(&self) -> &AtomicU32 {
        &self.state
    }

    /// Release; wakes one waiter if the mutex was contended.
    pub fn unlock(&self, cpu: &Cpu) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            cpu.kutex().wake(cpu, &self.state, 1);
        }
    }
}

/// Mutex protecting a `T`, released when the guard drops.
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `raw`
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Mutex {
            raw: RawMutex::new(),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock<'a>(&'a self, cpu: &'a Cpu) -> MutexGuard<'a, T> {
        self.raw.lock(cpu);
        MutexGuard { mutex: self, cpu }
    }

    pub fn lock_interruptible<'a>(&'a self, cpu: &'a Cpu) -> Result<MutexGuard<'a, T>, Error> {
        self.raw.lock_interruptible(cpu)?;
        Ok(MutexGuard { mutex: self, cpu })
    }

    pub fn try_lock<'a>(&'a self, cpu: &'a Cpu) -> Option<MutexGuard<'a, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard { mutex: self, cpu })
        } else {
            None
        }
    }

    pub fn state(&self) -> LockState {
        self.raw.state()
    }

    #[cfg(test)]
    pub(crate) fn raw(&self) -> &RawMutex {
        &self.raw
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    cpu: &'a Cpu,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(crate) fn cpu(&self) -> &'a Cpu {
        self.cpu
    }

    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held, and &mut self makes
        // this the only reference
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock(self.cpu);
    }
}
