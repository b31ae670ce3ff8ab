//! Per-tier cache budgets for the inference backend

use serde::Serialize;

use crate::catalog::{ChipTier, MB};

/// The backend cache ceiling is never set below this
pub const MEMORY_BUDGET_FLOOR: u64 = 64 * MB;

/// Cache ceilings for one chip tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetLevels {
    /// Ceiling used while the system is not under pressure
    pub normal: u64,
    /// Ceiling applied after a low-memory warning
    pub pressure: u64,
}

/// Budget levels for a chip tier. Newer chips ship with more RAM so they keep
/// a larger working set for the KV cache.
pub fn budget_for(tier: ChipTier) -> BudgetLevels {
    let (normal_mb, pressure_mb) = match tier {
        ChipTier::Tier1 => (128, 64),
        ChipTier::Tier2 => (256, 96),
        ChipTier::Tier3 => (512, 128),
        ChipTier::Tier4 => (1024, 256),
    };

    BudgetLevels {
        normal: normal_mb * MB,
        pressure: pressure_mb * MB,
    }
}

/// Clamp a requested ceiling to the platform floor
pub fn clamp_to_floor(bytes: u64) -> u64 {
    bytes.max(MEMORY_BUDGET_FLOOR)
}
