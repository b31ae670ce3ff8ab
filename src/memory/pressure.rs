//! Memory pressure controller
//!
//! Owns the process-wide cache budget and broadcasts low-memory warnings to
//! registered observers. Observers are held weakly: the controller never keeps
//! a component alive, and observers that have been dropped are pruned on the
//! next broadcast.

use log::{debug, info, warn};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::budget::{budget_for, clamp_to_floor, BudgetLevels};
use crate::catalog::{ChipTier, MB};

/// Anything holding memory that can be released on request
pub trait MemoryPressureObserver: Send + Sync {
    /// Called once per low-memory warning with the new budget
    fn on_memory_pressure(&self, budget_bytes: u64);
}

/// Handle returned by `add_observer`, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

/// Outcome of one low-memory warning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PressureReport {
    /// Live observers that were called
    pub notified: usize,
    /// Observers found dropped and removed
    pub pruned: usize,
    /// Observers that panicked
    pub failed: usize,
    /// Budget in effect after the warning
    pub budget: u64,
}

type ObserverEntry = (ObserverId, Weak<dyn MemoryPressureObserver>);

pub struct MemoryPressureController {
    levels: BudgetLevels,
    budget: AtomicU64,
    observers: Mutex<Vec<ObserverEntry>>,
    next_id: AtomicU64,
}

impl MemoryPressureController {
    pub fn new(tier: ChipTier) -> Self {
        Self::with_levels(budget_for(tier))
    }

    pub fn with_levels(levels: BudgetLevels) -> Self {
        let levels = BudgetLevels {
            normal: clamp_to_floor(levels.normal),
            pressure: clamp_to_floor(levels.pressure),
        };
        Self {
            levels,
            budget: AtomicU64::new(levels.normal),
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn levels(&self) -> BudgetLevels {
        self.levels
    }

    pub fn current_budget(&self) -> u64 {
        self.budget.load(Ordering::SeqCst)
    }

    /// Overwrite the budget, clamped to the platform floor
    pub fn set_budget(&self, bytes: u64) -> u64 {
        let bytes = clamp_to_floor(bytes);
        self.budget.store(bytes, Ordering::SeqCst);
        bytes
    }

    /// Restore the normal ceiling once the pressure has passed
    pub fn reset_budget(&self) -> u64 {
        info!("Memory budget reset to {} MB", self.levels.normal / MB);
        self.set_budget(self.levels.normal)
    }

    pub fn add_observer<T>(&self, observer: &Arc<T>) -> ObserverId
    where
        T: MemoryPressureObserver + 'static,
    {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let weak = Arc::downgrade(observer);
        let weak: Weak<dyn MemoryPressureObserver> = weak;
        self.lock_observers().push((id, weak));
        debug!("Registered memory pressure observer {:?}", id);
        id
    }

    /// Returns false if the id was not registered (or already pruned)
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.lock_observers();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        before != observers.len()
    }

    /// Number of registered observers, live or not yet pruned
    pub fn observer_count(&self) -> usize {
        self.lock_observers().len()
    }

    /// Shrink the budget and notify every live observer exactly once.
    ///
    /// The registry lock is released before observers run so an observer may
    /// add or remove observers from inside its callback.
    pub fn handle_memory_warning(&self) -> PressureReport {
        let budget = self.set_budget(self.current_budget().min(self.levels.pressure));

        let (live, pruned) = {
            let mut observers = self.lock_observers();
            let before = observers.len();
            let mut live = Vec::with_capacity(before);
            observers.retain(|(_, weak)| match weak.upgrade() {
                Some(observer) => {
                    live.push(observer);
                    true
                }
                None => false,
            });
            (live, before - observers.len())
        };

        let mut failed = 0;
        for observer in &live {
            let result = catch_unwind(AssertUnwindSafe(|| observer.on_memory_pressure(budget)));
            if result.is_err() {
                failed += 1;
                warn!("Memory pressure observer panicked, continuing with the rest");
            }
        }

        let report = PressureReport {
            notified: live.len(),
            pruned,
            failed,
            budget,
        };
        warn!(
            "Memory warning handled: budget {} MB, {} notified, {} pruned, {} failed",
            budget / MB,
            report.notified,
            report.pruned,
            report.failed
        );
        report
    }

    /// Forward platform low-memory signals to `handle_memory_warning` until
    /// the sender side is closed
    pub fn spawn_listener(self: &Arc<Self>, mut signals: mpsc::Receiver<()>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            while signals.recv().await.is_some() {
                controller.handle_memory_warning();
            }
            debug!("Memory warning listener stopped");
        })
    }

    fn lock_observers(&self) -> std::sync::MutexGuard<'_, Vec<ObserverEntry>> {
        // A poisoned registry is still structurally valid
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
