//! Memory budget and low-memory handling
//!
//! Module structure:
//! - `budget`: per-tier cache ceilings and the platform floor
//! - `pressure`: the controller that shrinks the budget and notifies observers

pub mod budget;
pub mod pressure;

pub use budget::{budget_for, BudgetLevels, MEMORY_BUDGET_FLOOR};
pub use pressure::{MemoryPressureController, MemoryPressureObserver, ObserverId, PressureReport};
