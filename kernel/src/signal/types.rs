//! Signal-related data structures

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::fmt;

use bytemuck::{Pod, Zeroable};

use super::constants::*;
use crate::task::ThreadId;

/// Set of signals; bit `n - 1` stands for signal `n`
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SigSet(u64);

impl SigSet {
    pub const EMPTY: SigSet = SigSet(0);

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        SigSet(bits)
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Set holding only `sig`; empty for invalid numbers
    #[inline]
    pub const fn of(sig: u32) -> Self {
        SigSet(sig_mask(sig))
    }

    #[inline]
    pub const fn union(self, other: SigSet) -> Self {
        SigSet(self.0 | other.0)
    }

    #[inline]
    pub const fn intersect(self, other: SigSet) -> Self {
        SigSet(self.0 & other.0)
    }

    #[inline]
    pub const fn difference(self, other: SigSet) -> Self {
        SigSet(self.0 & !other.0)
    }

    #[inline]
    pub const fn complement(self) -> Self {
        SigSet(!self.0)
    }

    #[inline]
    pub const fn contains(self, sig: u32) -> bool {
        self.0 & sig_mask(sig) != 0
    }

    #[inline]
    pub fn insert(&mut self, sig: u32) {
        self.0 |= sig_mask(sig);
    }

    #[inline]
    pub fn remove(&mut self, sig: u32) {
        self.0 &= !sig_mask(sig);
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Lowest-numbered member
    #[inline]
    pub const fn lowest(self) -> Option<u32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() + 1)
        }
    }
}

impl fmt::Debug for SigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigSet({:#x})", self.0)
    }
}

/// Signals whose default action is to do nothing
pub const DEFAULT_IGNORED: SigSet = SigSet::of(SIGCHLD)
    .union(SigSet::of(SIGURG))
    .union(SigSet::of(SIGWINCH))
    .union(SigSet::of(SIGCONT));

/// Signals whose default action is to stop the process
pub const DEFAULT_STOP: SigSet = SigSet::of(SIGSTOP)
    .union(SigSet::of(SIGTSTP))
    .union(SigSet::of(SIGTTIN))
    .union(SigSet::of(SIGTTOU));

/// Signals that cannot be blocked, caught or ignored
pub const UNBLOCKABLE: SigSet = SigSet::from_bits(UNCATCHABLE_SIGNALS);

/// Stop signals an orphaned process discards under the default disposition
pub const ORPHAN_DISCARDED: SigSet = DEFAULT_STOP.difference(SigSet::of(SIGSTOP));

/// Default action for a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDefaultAction {
    /// Terminate the process
    Terminate,
    /// Ignore the signal
    Ignore,
    /// Terminate with core dump (no dump is written)
    CoreDump,
    /// Stop (pause) the process
    Stop,
    /// Continue a stopped process
    Continue,
}

/// Get the default action for a signal
pub fn default_action(sig: u32) -> SignalDefaultAction {
    match sig {
        // Core dump
        SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGBUS | SIGFPE | SIGSEGV | SIGXCPU | SIGXFSZ
        | SIGSYS => SignalDefaultAction::CoreDump,

        // Ignore
        SIGCHLD | SIGURG | SIGWINCH => SignalDefaultAction::Ignore,

        // Stop
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => SignalDefaultAction::Stop,

        // Continue
        SIGCONT => SignalDefaultAction::Continue,

        // Everything else, real-time signals included
        _ => SignalDefaultAction::Terminate,
    }
}

/// Signal handler configuration (matches Linux sigaction structure layout)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SignalAction {
    /// Handler address (SIG_DFL, SIG_IGN, or user function pointer)
    pub handler: u64,
    /// Flags (SA_NODEFER, SA_ONSTACK, etc.)
    pub flags: u64,
    /// Restorer function; accepted but unused
    pub restorer: u64,
    /// Signals to block during handler execution
    pub mask: u64,
}

impl Default for SignalAction {
    fn default() -> Self {
        SignalAction {
            handler: SIG_DFL,
            flags: 0,
            restorer: 0,
            mask: 0,
        }
    }
}

impl SignalAction {
    /// Check if handler is the default action
    #[inline]
    pub fn is_default(&self) -> bool {
        self.handler == SIG_DFL
    }

    /// Check if handler ignores the signal
    #[inline]
    pub fn is_ignore(&self) -> bool {
        self.handler == SIG_IGN
    }

    /// Check if handler is a user function
    #[inline]
    pub fn is_user_handler(&self) -> bool {
        self.handler > SIG_IGN
    }
}

/// Alternate signal stack configuration (matches Linux stack_t)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct StackT {
    /// Base address of the alternate stack
    pub ss_sp: u64,
    /// Flags (SS_ONSTACK, SS_DISABLE, SS_AUTODISARM)
    pub ss_flags: i32,
    /// Padding for alignment
    pub _pad: i32,
    /// Size of the alternate stack in bytes
    pub ss_size: u64,
}

impl Default for StackT {
    fn default() -> Self {
        StackT {
            ss_sp: 0,
            ss_flags: SS_DISABLE,
            _pad: 0,
            ss_size: 0,
        }
    }
}

/// Per-thread alternate signal stack state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AltStack {
    /// Base address of the alternate stack
    pub base: u64,
    /// Size of the alternate stack in bytes
    pub size: u64,
    /// SS_DISABLE, or 0 optionally combined with SS_AUTODISARM
    pub flags: i32,
}

impl Default for AltStack {
    fn default() -> Self {
        AltStack {
            base: 0,
            size: 0,
            flags: SS_DISABLE,
        }
    }
}

impl AltStack {
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.flags & SS_DISABLE == 0
    }

    /// Returns true if `sp` points into this stack
    pub fn contains(&self, sp: u64) -> bool {
        self.is_enabled() && sp > self.base && sp - self.base <= self.size
    }

    /// Highest address of the stack
    #[inline]
    pub fn top(&self) -> u64 {
        self.base.wrapping_add(self.size)
    }

    /// User-visible descriptor; `sp` decides SS_ONSTACK
    pub fn to_user(&self, sp: u64) -> StackT {
        if !self.is_enabled() {
            return StackT::default();
        }
        let on_stack = if self.contains(sp) { SS_ONSTACK } else { 0 };
        StackT {
            ss_sp: self.base,
            ss_flags: (self.flags & SS_AUTODISARM) | on_stack,
            _pad: 0,
            ss_size: self.size,
        }
    }

    /// Rebuild from a descriptor saved in a signal frame.
    ///
    /// Returns None if the descriptor is malformed.
    pub fn from_saved(saved: &StackT) -> Option<AltStack> {
        let flags = saved.ss_flags & !SS_ONSTACK;
        if flags & SS_DISABLE != 0 {
            return Some(AltStack::default());
        }
        if flags & !SS_AUTODISARM != 0 || saved.ss_size < MINSIGSTKSZ {
            return None;
        }
        saved.ss_sp.checked_add(saved.ss_size)?;
        Some(AltStack {
            base: saved.ss_sp,
            size: saved.ss_size,
            flags,
        })
    }
}

/// Signal information passed to SA_SIGINFO handlers (128-byte siginfo_t)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SigInfo {
    pub si_signo: i32,
    pub si_errno: i32,
    pub si_code: i32,
    pub _pad: i32,
    pub si_pid: i32,
    pub si_uid: u32,
    pub _rest: [u64; 13],
}

impl SigInfo {
    pub fn new(sig: u32, origin: SigOrigin) -> Self {
        SigInfo {
            si_signo: sig as i32,
            si_code: origin.code,
            si_pid: origin.pid as i32,
            ..Default::default()
        }
    }
}

/// Who raised a pending signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigOrigin {
    /// SI_USER or SI_KERNEL
    pub code: i32,
    /// Sender pid (0 for the kernel)
    pub pid: u64,
}

impl SigOrigin {
    pub const KERNEL: SigOrigin = SigOrigin {
        code: SI_KERNEL,
        pid: 0,
    };

    pub const fn user(pid: u64) -> Self {
        SigOrigin { code: SI_USER, pid }
    }
}

impl Default for SigOrigin {
    fn default() -> Self {
        SigOrigin::KERNEL
    }
}

/// Pending signals plus the origin of each
#[derive(Debug, Clone, Copy)]
pub struct PendingSet {
    set: SigSet,
    origins: [SigOrigin; NSIG as usize],
}

impl Default for PendingSet {
    fn default() -> Self {
        PendingSet {
            set: SigSet::EMPTY,
            origins: [SigOrigin::KERNEL; NSIG as usize],
        }
    }
}

impl PendingSet {
    #[inline]
    pub fn set(&self) -> SigSet {
        self.set
    }

    #[inline]
    pub fn contains(&self, sig: u32) -> bool {
        self.set.contains(sig)
    }

    /// Mark `sig` pending. Returns false if it already was.
    pub fn add(&mut self, sig: u32, origin: SigOrigin) -> bool {
        if !is_valid_signal(sig) || self.set.contains(sig) {
            return false;
        }
        self.set.insert(sig);
        self.origins[(sig - 1) as usize] = origin;
        true
    }

    /// Clear `sig`, returning its origin if it was pending
    pub fn take(&mut self, sig: u32) -> Option<SigOrigin> {
        if !self.set.contains(sig) {
            return None;
        }
        self.set.remove(sig);
        Some(self.origins[(sig - 1) as usize])
    }

    /// Clear every signal in `signals`
    pub fn discard(&mut self, signals: SigSet) {
        self.set = self.set.difference(signals);
    }

    pub fn clear(&mut self) {
        self.set = SigSet::EMPTY;
    }
}

/// Per-thread signal state, owned by the process and guarded by its
/// signal lock
#[derive(Debug, Clone, Default)]
pub struct ThreadSignals {
    /// Blocked signals (never contains KILL or STOP)
    pub mask: SigSet,
    /// Signals directed at this thread
    pub pending: PendingSet,
    pub altstack: AltStack,
    /// Canary key; generated on first delivery
    pub secret: Option<u64>,
    /// Handlers entered and not yet returned from
    pub in_flight: u32,
    /// Frame address of the only in-flight handler
    pub single_frame: Option<u64>,
    /// Mask to record in the next frame instead of the live one (sigsuspend)
    pub saved_mask: Option<SigSet>,
}

impl ThreadSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the mask, dropping unblockable signals
    #[inline]
    pub fn set_mask(&mut self, mask: SigSet) {
        self.mask = mask.difference(UNBLOCKABLE);
    }
}

/// Per-process signal state
///
/// Note: actions are boxed; the 64-element array is 2KB.
pub struct SignalState {
    /// Signal actions (indices 0-63 for signals 1-64)
    actions: Box<[SignalAction; NSIG as usize]>,
    /// Signals directed at the process that no thread could take yet
    pub pending: PendingSet,
    /// Per-thread masks, pending sets and delivery bookkeeping
    pub threads: BTreeMap<ThreadId, ThreadSignals>,
}

impl Default for SignalState {
    fn default() -> Self {
        SignalState {
            actions: Box::new([SignalAction::default(); NSIG as usize]),
            pending: PendingSet::default(),
            threads: BTreeMap::new(),
        }
    }
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the action for a signal
    ///
    /// Returns the default action for invalid signal numbers
    pub fn action(&self, sig: u32) -> SignalAction {
        if is_valid_signal(sig) {
            self.actions[(sig - 1) as usize]
        } else {
            SignalAction::default()
        }
    }

    /// Set the action for a signal
    ///
    /// Does nothing for invalid signal numbers
    pub fn set_action(&mut self, sig: u32, action: SignalAction) {
        if is_valid_signal(sig) {
            self.actions[(sig - 1) as usize] = action;
        }
    }

    pub fn thread(&self, id: ThreadId) -> Option<&ThreadSignals> {
        self.threads.get(&id)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut ThreadSignals> {
        self.threads.get_mut(&id)
    }

    /// Signals a delivery to this process would silently drop
    pub fn discarded(&self, orphaned: bool) -> SigSet {
        let mut discarded = SigSet::EMPTY;
        for sig in 1..=NSIG {
            if UNBLOCKABLE.contains(sig) {
                continue;
            }
            let action = self.action(sig);
            let dropped = action.is_ignore()
                || (action.is_default() && DEFAULT_IGNORED.contains(sig))
                || (action.is_default() && orphaned && ORPHAN_DISCARDED.contains(sig));
            if dropped {
                discarded.insert(sig);
            }
        }
        discarded
    }

    /// Reset signal state for a new program image
    ///
    /// Per POSIX, caught signals are reset to SIG_DFL, ignored signals stay
    /// ignored, and masks and pending signals survive. Alternate stacks and
    /// handler frames belong to the old image and are forgotten.
    pub fn exec_reset(&mut self) {
        for action in self.actions.iter_mut() {
            if action.is_user_handler() {
                *action = SignalAction::default();
            } else {
                action.flags = 0;
                action.mask = 0;
                action.restorer = 0;
            }
        }
        for thread in self.threads.values_mut() {
            thread.altstack = AltStack::default();
            thread.secret = None;
            thread.in_flight = 0;
            thread.single_frame = None;
            thread.saved_mask = None;
        }
    }

    /// Drop dispositions and pending signals once the process has exited
    pub fn teardown(&mut self) {
        *self.actions = [SignalAction::default(); NSIG as usize];
        self.pending.clear();
        for thread in self.threads.values_mut() {
            thread.pending.clear();
        }
    }
}
