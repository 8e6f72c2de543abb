//! Per-reactor worker accounting.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::sync::Mutex;

/// Counts the workers of one reactor.
///
/// - *scheduled* workers have been handed to the executor but haven't started yet,
/// - *active* workers are background workers currently draining the queue,
/// - *borrowed* workers are caller threads running the foreground path,
/// - *total* is active plus borrowed, used for diagnostics.
///
/// Reads are lock-free. Every transition happens under a narrow lock that is never held across
/// user code. That keeps `active + scheduled` within the budget a reservation was checked
/// against, and orders a worker's exit against a concurrent push: either the push sees the
/// worker gone and schedules a replacement, or the exiting worker sees the pushed item.
///
/// The canceled flag lives here too. Setting it under the same lock means that once the ledger
/// is both canceled and idle, no new worker can be reserved or borrowed.
#[derive(Debug, Default)]
pub(crate) struct WorkerLedger {
    lock: Mutex<()>,
    canceled: AtomicBool,
    active: AtomicUsize,
    scheduled: AtomicUsize,
    borrowed: AtomicUsize,
    total: AtomicUsize,
}

/// Counts observed when a worker enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entered {
    /// Workers of the entering kind, including the new one.
    pub(crate) active: usize,
    /// All running workers, including the new one.
    pub(crate) total: usize,
}

impl WorkerLedger {
    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn scheduled(&self) -> usize {
        self.scheduled.load(Ordering::Acquire)
    }

    pub(crate) fn borrowed(&self) -> usize {
        self.borrowed.load(Ordering::Acquire)
    }

    pub(crate) fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Sets the canceled flag. Returns `true` for the call that set it.
    pub(crate) fn cancel(&self) -> bool {
        let _guard = self.lock.lock();
        !self.canceled.swap(true, Ordering::AcqRel)
    }

    /// Whether no worker of any kind is scheduled or running.
    pub(crate) fn is_idle(&self) -> bool {
        let _guard = self.lock.lock();
        self.active() == 0 && self.scheduled() == 0 && self.borrowed() == 0
    }

    /// Reserves a background worker slot if fewer than `budget` workers are running or scheduled
    /// and the ledger isn't canceled.
    ///
    /// Borrowed threads count against the budget, but the budget never stops a thread from being
    /// borrowed.
    pub(crate) fn try_reserve(&self, budget: usize) -> bool {
        let _guard = self.lock.lock();
        if self.is_canceled() {
            return false;
        }
        let workers = self.active() + self.scheduled() + self.borrowed();
        if workers < budget {
            self.scheduled.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Gives back a reservation whose worker never started.
    pub(crate) fn release_reservation(&self) {
        let _guard = self.lock.lock();
        self.scheduled.fetch_sub(1, Ordering::AcqRel);
    }

    /// Turns a reservation into an active background worker.
    pub(crate) fn enter_background(&self) -> Entered {
        let _guard = self.lock.lock();
        self.scheduled.fetch_sub(1, Ordering::AcqRel);
        Entered {
            active: self.active.fetch_add(1, Ordering::AcqRel) + 1,
            total: self.total.fetch_add(1, Ordering::AcqRel) + 1,
        }
    }

    /// Records a background worker exiting. Returns the number of workers still running.
    pub(crate) fn exit_background(&self) -> usize {
        let _guard = self.lock.lock();
        let active = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        self.total.fetch_sub(1, Ordering::AcqRel);
        active + self.borrowed()
    }

    /// Records a caller thread being borrowed, unless the ledger is canceled.
    pub(crate) fn enter_foreground(&self) -> Option<Entered> {
        let _guard = self.lock.lock();
        if self.is_canceled() {
            return None;
        }
        Some(Entered {
            active: self.borrowed.fetch_add(1, Ordering::AcqRel) + 1,
            total: self.total.fetch_add(1, Ordering::AcqRel) + 1,
        })
    }

    /// Records a borrowed thread returning to its caller. Returns the number of workers still
    /// running.
    pub(crate) fn exit_foreground(&self) -> usize {
        let _guard = self.lock.lock();
        let borrowed = self.borrowed.fetch_sub(1, Ordering::AcqRel) - 1;
        self.total.fetch_sub(1, Ordering::AcqRel);
        borrowed + self.active()
    }
}
