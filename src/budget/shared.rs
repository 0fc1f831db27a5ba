//! One budget shared by every traversal spending the same credential.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::config::BudgetConfig;
use super::parser::RateLimitSnapshot;
use super::tracker::{Admission, BudgetTracker, BudgetWindow, Cost, Reservation};

/// Cloneable handle to a [`BudgetTracker`].
///
/// GitHub caps the credential, not the organization, so engines reading
/// through one token hold clones of the same handle. The lock is only taken
/// for the bookkeeping calls and never across a fetch.
#[derive(Debug, Clone)]
pub struct SharedBudget {
    tracker: Arc<Mutex<BudgetTracker>>,
}

impl SharedBudget {
    pub fn new(tracker: BudgetTracker) -> Self {
        Self {
            tracker: Arc::new(Mutex::new(tracker)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BudgetTracker> {
        // Tracker updates are single assignments; a panicked holder leaves it usable.
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reserve(&self, estimate: Cost) -> Admission {
        self.lock().reserve(estimate)
    }

    pub fn commit(&self, reservation: Reservation, actual: Cost) {
        self.lock().commit(reservation, actual);
    }

    pub fn release(&self, reservation: Reservation) {
        self.lock().release(reservation);
    }

    pub fn remaining(&self) -> BudgetWindow {
        self.lock().remaining()
    }

    pub fn observe(&self, snapshot: RateLimitSnapshot) {
        self.lock().observe(snapshot);
    }

    pub fn last_observed(&self) -> Option<RateLimitSnapshot> {
        self.lock().last_observed().cloned()
    }

    pub fn config(&self) -> BudgetConfig {
        self.lock().config().clone()
    }

    /// Whether both handles point at the same tracker.
    pub fn same_budget(&self, other: &SharedBudget) -> bool {
        Arc::ptr_eq(&self.tracker, &other.tracker)
    }
}

impl From<BudgetTracker> for SharedBudget {
    fn from(tracker: BudgetTracker) -> Self {
        Self::new(tracker)
    }
}
