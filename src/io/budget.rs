//! Process-wide IO budget
//!
//! Tracks how many concurrent IO slots all open files have reserved. It is
//! shared explicitly (usually through the file factory) and only ever updated
//! with atomics. An optional limit turns it into an admission check at open.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared counter of reserved IO slots
#[derive(Debug, Default)]
pub struct IoBudget {
    reserved: AtomicUsize,
    limit: Option<usize>,
}

impl IoBudget {
    /// Budget without an admission limit
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Budget that refuses reservations beyond `limit` slots in total
    pub fn with_limit(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            reserved: AtomicUsize::new(0),
            limit: Some(limit),
        })
    }

    /// Slots currently reserved across all files
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Admission limit, if any
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Reserve `slots`, returning a guard that gives them back unless committed
    ///
    /// Returns `None` when the reservation would exceed the limit.
    pub fn try_reserve(self: &Arc<Self>, slots: usize) -> Option<BudgetReservation> {
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(slots)?;
            if self.limit.is_some_and(|limit| next > limit) {
                return None;
            }
            match self.reserved.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(BudgetReservation {
                        budget: Arc::clone(self),
                        slots,
                        committed: false,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Return slots reserved by a committed reservation
    pub fn release(&self, slots: usize) {
        let previous = self.reserved.fetch_sub(slots, Ordering::AcqRel);
        debug_assert!(previous >= slots, "IO budget underflow");
    }
}

/// Scoped reservation against an [`IoBudget`]
///
/// Dropping an uncommitted reservation releases its slots, so every failure
/// path during open gives the budget back.
#[derive(Debug)]
pub struct BudgetReservation {
    budget: Arc<IoBudget>,
    slots: usize,
    committed: bool,
}

impl BudgetReservation {
    /// Keep the slots reserved; the owner must call [`IoBudget::release`]
    pub fn commit(mut self) -> usize {
        self.committed = true;
        self.slots
    }
}

impl Drop for BudgetReservation {
    fn drop(&mut self) {
        if !self.committed {
            self.budget.release(self.slots);
        }
    }
}
