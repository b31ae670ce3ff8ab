//! Model compatibility scoring based on the device profile
//!
//! Tells the user, before any download, how likely a model is to run
//! comfortably on this device. Only `Unsupported` blocks a model; the other
//! tiers are advisory.

use serde::Serialize;

use super::hardware_detector::DeviceProfile;
use crate::catalog::{available_models, ModelDescriptor, MB};

/// OS + app baseline that must stay resident alongside the model
pub const SYSTEM_RESERVE_BYTES: u64 = 2000 * MB;

/// Extra headroom required before a model is called `Recommended`
pub const SAFETY_MARGIN_BYTES: u64 = 1000 * MB;

/// Pre-flight risk signal, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityTier {
    Recommended,
    Compatible,
    Risky,
    Unsupported,
}

impl CompatibilityTier {
    pub fn is_blocking(&self) -> bool {
        matches!(self, CompatibilityTier::Unsupported)
    }

    /// Status copy for the model picker. Derived only from the tier so the
    /// text can never disagree with the scorer.
    pub fn warning(&self) -> Option<&'static str> {
        match self {
            CompatibilityTier::Recommended => None,
            CompatibilityTier::Compatible => {
                Some("This model will run, but other apps may be closed to make room.")
            }
            CompatibilityTier::Risky => Some(
                "This model may run out of memory on this device and the app could be closed.",
            ),
            CompatibilityTier::Unsupported => Some("This model is not supported on this device."),
        }
    }
}

/// Byte thresholds used by the scorer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringThresholds {
    pub system_reserve_bytes: u64,
    pub safety_margin_bytes: u64,
}

impl Default for ScoringThresholds {
    fn default() -> Self {
        Self {
            system_reserve_bytes: SYSTEM_RESERVE_BYTES,
            safety_margin_bytes: SAFETY_MARGIN_BYTES,
        }
    }
}

/// Score a model against a device with the default thresholds
pub fn score(device: &DeviceProfile, model: &ModelDescriptor) -> CompatibilityTier {
    score_with(&ScoringThresholds::default(), device, model)
}

/// Score a model against a device.
///
/// The chip tier is a hard gate. Past it, the model needs twice its weight
/// footprint (weights plus KV cache and activations) on top of the system
/// reserve. All comparisons are inclusive.
pub fn score_with(
    thresholds: &ScoringThresholds,
    device: &DeviceProfile,
    model: &ModelDescriptor,
) -> CompatibilityTier {
    if device.tier < model.minimum_tier {
        return CompatibilityTier::Unsupported;
    }

    let memory = device.total_memory_bytes;
    let footprint = model.memory_footprint_bytes;
    let required = footprint
        .saturating_mul(2)
        .saturating_add(thresholds.system_reserve_bytes);

    if memory >= required.saturating_add(thresholds.safety_margin_bytes) {
        CompatibilityTier::Recommended
    } else if memory >= required {
        CompatibilityTier::Compatible
    } else if memory >= footprint.saturating_add(thresholds.system_reserve_bytes) {
        CompatibilityTier::Risky
    } else {
        CompatibilityTier::Unsupported
    }
}

/// Individual model recommendation
#[derive(Debug, Clone, Serialize)]
pub struct ModelRecommendation {
    pub model_id: &'static str,
    pub tier: CompatibilityTier,
    pub reason: String,
}

impl DeviceProfile {
    pub fn compatibility(&self, model: &ModelDescriptor) -> CompatibilityTier {
        score(self, model)
    }

    /// Score every catalog model for this device
    pub fn recommend_models(&self, thresholds: &ScoringThresholds) -> Vec<ModelRecommendation> {
        available_models()
            .iter()
            .map(|model| {
                let tier = score_with(thresholds, self, model);
                ModelRecommendation {
                    model_id: model.id,
                    tier,
                    reason: self.reason_for(model, tier),
                }
            })
            .collect()
    }

    /// Largest model that is `Recommended`, else the smallest `Compatible` one
    pub fn best_model(&self, thresholds: &ScoringThresholds) -> Option<&'static ModelDescriptor> {
        let models = available_models();

        let recommended = models
            .iter()
            .filter(|m| score_with(thresholds, self, m) == CompatibilityTier::Recommended)
            .max_by_key(|m| m.memory_footprint_bytes);
        if recommended.is_some() {
            return recommended;
        }

        models
            .iter()
            .filter(|m| score_with(thresholds, self, m) == CompatibilityTier::Compatible)
            .min_by_key(|m| m.memory_footprint_bytes)
    }

    fn reason_for(&self, model: &ModelDescriptor, tier: CompatibilityTier) -> String {
        let ram_mb = self.total_memory_bytes / MB;
        match tier {
            CompatibilityTier::Recommended => "Good fit for your device".to_string(),
            CompatibilityTier::Compatible => "Fits, with little headroom to spare".to_string(),
            CompatibilityTier::Risky => {
                format!("Needs more memory than is comfortable (you have {} MB)", ram_mb)
            }
            CompatibilityTier::Unsupported if self.tier < model.minimum_tier => {
                format!("Requires a {} chip or newer", model.minimum_tier)
            }
            CompatibilityTier::Unsupported => {
                format!("Requires more RAM (you have {} MB)", ram_mb)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{find_model, ChatTemplate, ChipTier, ModelCategory, Quantization};

    fn device(tier: ChipTier, memory_mb: u64) -> DeviceProfile {
        DeviceProfile {
            hardware_identifier: "test".to_string(),
            tier,
            total_memory_bytes: memory_mb * MB,
            is_simulator: false,
        }
    }

    fn model(footprint_mb: u64, minimum_tier: ChipTier) -> ModelDescriptor {
        ModelDescriptor {
            id: "test-model",
            display_name: "Test",
            description: "",
            category: ModelCategory::General,
            parameters: "1B",
            memory_footprint_bytes: footprint_mb * MB,
            download_size_bytes: footprint_mb * MB,
            minimum_tier,
            quantization: Quantization::Q4KM,
            source: "",
            context_length: 2048,
            template: ChatTemplate::ChatMl,
        }
    }

    #[test]
    fn test_recommended_scenario() {
        // required = 800*2 + 2000 = 3600; 6144 >= 4600
        let m = model(800, ChipTier::Tier2);
        assert_eq!(score(&device(ChipTier::Tier3, 6144), &m), CompatibilityTier::Recommended);
    }

    #[test]
    fn test_tier_gate_ignores_memory() {
        let m = model(800, ChipTier::Tier2);
        assert_eq!(
            score(&device(ChipTier::Tier1, 64 * 1024), &m),
            CompatibilityTier::Unsupported
        );
    }

    #[test]
    fn test_exact_thresholds_are_inclusive() {
        let m = model(800, ChipTier::Tier1);

        assert_eq!(score(&device(ChipTier::Tier1, 4600), &m), CompatibilityTier::Recommended);
        assert_eq!(score(&device(ChipTier::Tier1, 4599), &m), CompatibilityTier::Compatible);

        assert_eq!(score(&device(ChipTier::Tier1, 3600), &m), CompatibilityTier::Compatible);
        assert_eq!(score(&device(ChipTier::Tier1, 3599), &m), CompatibilityTier::Risky);

        assert_eq!(score(&device(ChipTier::Tier1, 2800), &m), CompatibilityTier::Risky);
        assert_eq!(score(&device(ChipTier::Tier1, 2799), &m), CompatibilityTier::Unsupported);
    }

    #[test]
    fn test_byte_level_boundary() {
        let m = model(800, ChipTier::Tier1);
        let mut d = device(ChipTier::Tier1, 3600);
        d.total_memory_bytes -= 1;
        assert_eq!(score(&d, &m), CompatibilityTier::Risky);
    }

    #[test]
    fn test_non_decreasing_in_memory() {
        for footprint in [400, 800, 1600, 2300] {
            let m = model(footprint, ChipTier::Tier2);
            let mut previous = CompatibilityTier::Unsupported;
            for memory_mb in (0..16 * 1024).step_by(128) {
                let tier = score(&device(ChipTier::Tier3, memory_mb), &m);
                assert!(tier <= previous, "tier got worse as memory grew at {} MB", memory_mb);
                assert_eq!(tier, score(&device(ChipTier::Tier3, memory_mb), &m));
                previous = tier;
            }
        }
    }

    #[test]
    fn test_custom_thresholds() {
        let thresholds = ScoringThresholds {
            system_reserve_bytes: 1000 * MB,
            safety_margin_bytes: 0,
        };
        let m = model(800, ChipTier::Tier1);
        assert_eq!(
            score_with(&thresholds, &device(ChipTier::Tier1, 2600), &m),
            CompatibilityTier::Recommended
        );
    }

    #[test]
    fn test_warning_copy_follows_tier() {
        assert!(CompatibilityTier::Recommended.warning().is_none());
        assert!(CompatibilityTier::Risky.warning().is_some());
        assert!(CompatibilityTier::Unsupported.is_blocking());
        assert!(!CompatibilityTier::Risky.is_blocking());
    }

    #[test]
    fn test_recommendations_cover_catalog() {
        let d = device(ChipTier::Tier2, 6144);
        let recs = d.recommend_models(&ScoringThresholds::default());
        assert_eq!(recs.len(), available_models().len());

        let phi = recs.iter().find(|r| r.model_id == "phi-3.5-mini").unwrap();
        assert_eq!(phi.tier, CompatibilityTier::Unsupported);
        assert!(phi.reason.contains("Tier 4"));
    }

    #[test]
    fn test_best_model_prefers_largest_recommended() {
        let d = device(ChipTier::Tier4, 8 * 1024);
        let best = d.best_model(&ScoringThresholds::default()).unwrap();
        // 8192 >= 2*2300 + 3000 = 7600
        assert_eq!(best.id, "phi-3.5-mini");

        let small = device(ChipTier::Tier1, 3 * 1024);
        // 3072 >= 2*400 + 2000 but < 3800
        let best = small.best_model(&ScoringThresholds::default()).unwrap();
        assert_eq!(best.id, find_model("qwen-2.5-0.5b-instruct").unwrap().id);
    }
}
