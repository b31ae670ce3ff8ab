//! Model Catalog Types

use serde::Serialize;
use std::fmt;

/// Ordered classification of device hardware capability.
///
/// Used as a hard compatibility gate: a model whose `minimum_tier` is above the
/// device tier is never offered, regardless of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipTier {
    Tier1,
    Tier2,
    Tier3,
    Tier4,
}

impl ChipTier {
    pub fn all() -> [ChipTier; 4] {
        [ChipTier::Tier1, ChipTier::Tier2, ChipTier::Tier3, ChipTier::Tier4]
    }
}

impl fmt::Display for ChipTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChipTier::Tier1 => write!(f, "Tier 1"),
            ChipTier::Tier2 => write!(f, "Tier 2"),
            ChipTier::Tier3 => write!(f, "Tier 3"),
            ChipTier::Tier4 => write!(f, "Tier 4"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCategory {
    General,
    Coding,
    Reasoning,
    Small,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Quantization {
    Q4KM,
    Q5KM,
    Q8,
    F16,
}

impl Quantization {
    pub fn label(&self) -> &'static str {
        match self {
            Quantization::Q4KM => "Q4_K_M",
            Quantization::Q5KM => "Q5_K_M",
            Quantization::Q8 => "Q8_0",
            Quantization::F16 => "F16",
        }
    }
}

/// Prompt layout expected by a model family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTemplate {
    ChatMl,
    Llama3,
    Phi3,
    Gemma,
}

/// Information about a downloadable model.
///
/// Descriptors are created at compile time and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    /// Stable identifier (also used as the artifact filename stem)
    pub id: &'static str,
    /// Human-readable name
    pub display_name: &'static str,
    pub description: &'static str,
    pub category: ModelCategory,
    /// Parameter count, for display
    pub parameters: &'static str,
    /// Estimated resident size of the weights once loaded
    pub memory_footprint_bytes: u64,
    /// Size of the artifact on the wire
    pub download_size_bytes: u64,
    pub minimum_tier: ChipTier,
    pub quantization: Quantization,
    /// Remote location of the artifact (opaque to everything but the transport)
    pub source: &'static str,
    pub context_length: u32,
    pub template: ChatTemplate,
}

impl ModelDescriptor {
    pub fn footprint_mb(&self) -> u64 {
        self.memory_footprint_bytes / (1024 * 1024)
    }

    /// Filename of the artifact inside the models directory
    pub fn artifact_file_name(&self) -> String {
        format!("{}.gguf", self.id)
    }
}
