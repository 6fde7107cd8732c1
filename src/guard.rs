//! Interrupt reentry guard and preemption lock
//!
//! Tracks how deeply timer interrupts are nested and whether the
//! foreground dispatcher may run. Past the nesting limit the guard trips
//! once and stays tripped: every later interrupt is a no-op.
//!
//! Lock-free: all counters are atomics, so the interrupt side needs only
//! a shared reference.
//!
//! Author: Moroya Sakamoto

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::config::MAX_REENTER;
use crate::error::SchedError;

/// Nesting-depth counter and critical-section suppression
#[derive(Debug)]
pub struct InterruptGuard {
    /// Interrupt nesting level right now
    depth: AtomicU32,
    /// Deepest nesting observed
    max_depth: AtomicU32,
    /// Nesting limit
    limit: u32,
    /// Outstanding `prevent_preemption` calls
    preemption_locks: AtomicU32,
    /// Set once the nesting limit was exceeded
    tripped: AtomicBool,
    /// Interrupt entries, dispatched or not
    runs: AtomicU64,
}

/// What a timer interrupt may do at this nesting level.
#[derive(Debug)]
pub enum IsrEntry<'g> {
    /// Run the foreground dispatcher.
    Dispatch(IsrFrame<'g>),
    /// A critical section is open; skip dispatch.
    Suppressed(IsrFrame<'g>),
    /// The guard tripped earlier; do nothing.
    Disabled(IsrFrame<'g>),
}

impl<'g> IsrEntry<'g> {
    /// Nesting level of this entry
    pub fn level(&self) -> u32 {
        match self {
            IsrEntry::Dispatch(f) | IsrEntry::Suppressed(f) | IsrEntry::Disabled(f) => f.level,
        }
    }
}

/// Per-nesting-level interrupt context.
///
/// Holds one level of nesting; dropping it leaves that level.
#[derive(Debug)]
pub struct IsrFrame<'g> {
    guard: &'g InterruptGuard,
    level: u32,
}

impl IsrFrame<'_> {
    /// 1 for the outermost interrupt
    pub fn level(&self) -> u32 {
        self.level
    }
}

impl Drop for IsrFrame<'_> {
    fn drop(&mut self) {
        self.guard.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Open critical section; foreground dispatch is skipped until dropped.
#[derive(Debug)]
pub struct PreemptionLock<'g> {
    guard: &'g InterruptGuard,
}

impl Drop for PreemptionLock<'_> {
    fn drop(&mut self) {
        self.guard.allow_preemption();
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new(MAX_REENTER)
    }
}

impl InterruptGuard {
    /// Guard allowing `limit` nested interrupts
    pub const fn new(limit: u32) -> Self {
        Self {
            depth: AtomicU32::new(0),
            max_depth: AtomicU32::new(0),
            limit,
            preemption_locks: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
            runs: AtomicU64::new(0),
        }
    }

    /// Enter one interrupt nesting level.
    ///
    /// Exceeding the limit trips the guard and returns the fatal error
    /// exactly once; afterwards every entry is `Disabled`.
    pub fn enter(&self) -> Result<IsrEntry<'_>, SchedError> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let level = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_depth.fetch_max(level, Ordering::AcqRel);
        let frame = IsrFrame { guard: self, level };

        if self.tripped.load(Ordering::Acquire) {
            return Ok(IsrEntry::Disabled(frame));
        }
        if level > self.limit {
            if self.tripped.swap(true, Ordering::AcqRel) {
                return Ok(IsrEntry::Disabled(frame));
            }
            return Err(SchedError::ReentryLimit {
                depth: level,
                max: self.limit,
            });
        }
        if self.preemption_locks.load(Ordering::Acquire) > 0 {
            return Ok(IsrEntry::Suppressed(frame));
        }
        Ok(IsrEntry::Dispatch(frame))
    }

    /// Open a critical section
    pub fn prevent_preemption(&self) -> PreemptionLock<'_> {
        self.preemption_locks.fetch_add(1, Ordering::AcqRel);
        PreemptionLock { guard: self }
    }

    fn allow_preemption(&self) {
        // never below zero
        let _ = self
            .preemption_locks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Critical sections currently open
    pub fn preemption_locks(&self) -> u32 {
        self.preemption_locks.load(Ordering::Acquire)
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Acquire)
    }

    /// Deepest nesting observed
    pub fn max_depth(&self) -> u32 {
        self.max_depth.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Interrupt entries so far
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Has the nesting limit been exceeded?
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }
}
