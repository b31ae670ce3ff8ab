use log::{info, warn};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use sysinfo::System;

use crate::catalog::{ChipTier, MB};

/// Environment variable a host app can set to pass the platform hardware
/// identifier (e.g. `iPhone15,2`) when it cannot be queried from Rust.
pub const HARDWARE_ID_ENV: &str = "POCKET_LLM_HARDWARE_ID";

/// Set by the iOS simulator to the identifier of the simulated device
const SIMULATOR_ID_ENV: &str = "SIMULATOR_MODEL_IDENTIFIER";

/// Hardware capabilities relevant to on-device inference
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProfile {
    pub hardware_identifier: String,
    pub tier: ChipTier,
    pub total_memory_bytes: u64,
    pub is_simulator: bool,
}

/// Hardware identifier -> (chip, tier). Loaded once on first lookup.
static TIER_TABLE: Lazy<HashMap<&'static str, (&'static str, ChipTier)>> = Lazy::new(|| {
    let entries: &[(&str, &str, ChipTier)] = &[
        // A13
        ("iPhone12,1", "A13 Bionic", ChipTier::Tier1),
        ("iPhone12,3", "A13 Bionic", ChipTier::Tier1),
        ("iPhone12,5", "A13 Bionic", ChipTier::Tier1),
        ("iPhone12,8", "A13 Bionic", ChipTier::Tier1),
        // A14
        ("iPhone13,1", "A14 Bionic", ChipTier::Tier2),
        ("iPhone13,2", "A14 Bionic", ChipTier::Tier2),
        ("iPhone13,3", "A14 Bionic", ChipTier::Tier2),
        ("iPhone13,4", "A14 Bionic", ChipTier::Tier2),
        // A15
        ("iPhone14,2", "A15 Bionic", ChipTier::Tier2),
        ("iPhone14,3", "A15 Bionic", ChipTier::Tier2),
        ("iPhone14,4", "A15 Bionic", ChipTier::Tier2),
        ("iPhone14,5", "A15 Bionic", ChipTier::Tier2),
        ("iPhone14,6", "A15 Bionic", ChipTier::Tier2),
        ("iPhone14,7", "A15 Bionic", ChipTier::Tier2),
        ("iPhone14,8", "A15 Bionic", ChipTier::Tier2),
        // A16
        ("iPhone15,2", "A16 Bionic", ChipTier::Tier3),
        ("iPhone15,3", "A16 Bionic", ChipTier::Tier3),
        ("iPhone15,4", "A16 Bionic", ChipTier::Tier3),
        ("iPhone15,5", "A16 Bionic", ChipTier::Tier3),
        // A17 Pro
        ("iPhone16,1", "A17 Pro", ChipTier::Tier4),
        ("iPhone16,2", "A17 Pro", ChipTier::Tier4),
        // A18
        ("iPhone17,1", "A18 Pro", ChipTier::Tier4),
        ("iPhone17,2", "A18 Pro", ChipTier::Tier4),
        ("iPhone17,3", "A18", ChipTier::Tier4),
        ("iPhone17,4", "A18", ChipTier::Tier4),
        // iPad M1 / M2
        ("iPad13,4", "M1", ChipTier::Tier4),
        ("iPad13,8", "M1", ChipTier::Tier4),
        ("iPad13,16", "M1", ChipTier::Tier4),
        ("iPad14,3", "M2", ChipTier::Tier4),
        ("iPad14,5", "M2", ChipTier::Tier4),
        // Desktop development hosts
        ("macos-aarch64", "Apple Silicon", ChipTier::Tier4),
    ];

    entries
        .iter()
        .map(|(id, chip, tier)| (*id, (*chip, *tier)))
        .collect()
});

static DEVICE_PROFILE: OnceLock<DeviceProfile> = OnceLock::new();

impl DeviceProfile {
    /// Get the detected device profile (cached after first call)
    pub fn detect() -> &'static DeviceProfile {
        DEVICE_PROFILE.get_or_init(|| {
            let profile = Self::detect_hardware();
            info!("Detected device profile: {:?}", profile);
            profile
        })
    }

    /// Build a profile from values queried by the host platform
    pub fn from_platform(hardware_identifier: &str, total_memory_bytes: u64, is_simulator: bool) -> Self {
        let tier = Self::lookup_tier(hardware_identifier)
            .unwrap_or_else(|| Self::tier_for_memory(total_memory_bytes));

        DeviceProfile {
            hardware_identifier: hardware_identifier.to_string(),
            tier,
            total_memory_bytes,
            is_simulator,
        }
    }

    fn detect_hardware() -> DeviceProfile {
        let (identifier, is_simulator) = Self::detect_identifier();
        let total_memory_bytes = Self::detect_memory_bytes();
        Self::from_platform(&identifier, total_memory_bytes, is_simulator)
    }

    fn detect_identifier() -> (String, bool) {
        if let Ok(id) = std::env::var(SIMULATOR_ID_ENV) {
            return (id, true);
        }
        if let Ok(id) = std::env::var(HARDWARE_ID_ENV) {
            return (id, false);
        }
        (
            format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            false,
        )
    }

    fn detect_memory_bytes() -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            warn!("Could not read total memory, assuming 4 GB");
            return 4096 * MB;
        }
        info!("Detected system memory: {} MB", total / MB);
        total
    }

    /// Exact lookup in the hardware table
    pub fn lookup_tier(hardware_identifier: &str) -> Option<ChipTier> {
        TIER_TABLE.get(hardware_identifier).map(|(_, tier)| *tier)
    }

    /// Chip name for a known identifier, for display
    pub fn chip_name(&self) -> Option<&'static str> {
        TIER_TABLE
            .get(self.hardware_identifier.as_str())
            .map(|(chip, _)| *chip)
    }

    /// Fallback classification for identifiers missing from the table
    fn tier_for_memory(total_memory_bytes: u64) -> ChipTier {
        let mb = total_memory_bytes / MB;
        if mb >= 12 * 1024 {
            ChipTier::Tier4
        } else if mb >= 8 * 1024 {
            ChipTier::Tier3
        } else if mb >= 6 * 1024 {
            ChipTier::Tier2
        } else {
            ChipTier::Tier1
        }
    }
}
