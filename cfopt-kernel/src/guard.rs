/**
 * EXECUTION GUARD - single-flight admission for speed-test runs
 *
 * ROLE:
 * Every trigger (cron tick, heartbeat failure, manual API call) must pass here
 * before the external tool is spawned. Two tools writing the same result.csv
 * would corrupt it.
 *
 * OPERATION:
 * - try_acquire() never blocks: false means a run is already in flight
 * - a refused trigger is dropped, not queued
 * - GuardPermit releases on drop, so early returns, errors and panics all
 *   free the guard
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Non-blocking mutual exclusion. Implemented as a trait so tests can force contention.
pub trait ExecutionGuard: Send + Sync {
    fn try_acquire(&self) -> bool;
    fn release(&self);
    fn is_held(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct AtomicRunGuard {
    held: AtomicBool,
}

impl AtomicRunGuard {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionGuard for AtomicRunGuard {
    fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Ownership of the guard for the duration of one run.
pub struct GuardPermit {
    guard: Arc<dyn ExecutionGuard>,
}

impl GuardPermit {
    /// Returns `None` when another run holds the guard.
    pub fn try_acquire(guard: &Arc<dyn ExecutionGuard>) -> Option<Self> {
        if guard.try_acquire() {
            Some(Self { guard: guard.clone() })
        } else {
            None
        }
    }
}

impl Drop for GuardPermit {
    fn drop(&mut self) {
        self.guard.release();
    }
}

impl std::fmt::Debug for GuardPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardPermit").finish_non_exhaustive()
    }
}
