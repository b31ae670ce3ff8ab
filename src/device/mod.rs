//! Device detection and model compatibility scoring
//!
//! Module structure:
//! - `hardware_detector`: platform identity, chip tier and memory (computed once)
//! - `compatibility`: pre-flight scorer mapping (device, model) to a risk tier

pub mod compatibility;
pub mod hardware_detector;

pub use compatibility::{
    score, score_with, CompatibilityTier, ModelRecommendation, ScoringThresholds,
    SAFETY_MARGIN_BYTES, SYSTEM_RESERVE_BYTES,
};
pub use hardware_detector::{DeviceProfile, HARDWARE_ID_ENV};
