//! Model Registry - built-in catalog of models available for download

use super::types::{ChatTemplate, ChipTier, ModelCategory, ModelDescriptor, Quantization};

pub const MB: u64 = 1024 * 1024;

/// Curated list of small instruction-tuned GGUF models that fit on phones.
/// Footprints are the measured resident size of the 4-bit weights.
static CATALOG: [ModelDescriptor; 7] = [
    ModelDescriptor {
        id: "qwen-2.5-0.5b-instruct",
        display_name: "Qwen 2.5 0.5B Instruct",
        description: "Tiny and fast. Runs on every supported device.",
        category: ModelCategory::Small,
        parameters: "0.5B",
        memory_footprint_bytes: 400 * MB,
        download_size_bytes: 398 * MB,
        minimum_tier: ChipTier::Tier1,
        quantization: Quantization::Q4KM,
        source: "https://huggingface.co/Qwen/Qwen2.5-0.5B-Instruct-GGUF/resolve/main/qwen2.5-0.5b-instruct-q4_k_m.gguf",
        context_length: 32768,
        template: ChatTemplate::ChatMl,
    },
    ModelDescriptor {
        id: "llama-3.2-1b-instruct",
        display_name: "Llama 3.2 1B Instruct",
        description: "Smallest Llama model, fast and lightweight.",
        category: ModelCategory::General,
        parameters: "1B",
        memory_footprint_bytes: 800 * MB,
        download_size_bytes: 770 * MB,
        minimum_tier: ChipTier::Tier2,
        quantization: Quantization::Q4KM,
        source: "https://huggingface.co/bartowski/Llama-3.2-1B-Instruct-GGUF/resolve/main/Llama-3.2-1B-Instruct-Q4_K_M.gguf",
        context_length: 131072,
        template: ChatTemplate::Llama3,
    },
    ModelDescriptor {
        id: "qwen-2.5-coder-1.5b-instruct",
        display_name: "Qwen 2.5 Coder 1.5B",
        description: "Code-specialized model for snippets and explanations.",
        category: ModelCategory::Coding,
        parameters: "1.5B",
        memory_footprint_bytes: 1100 * MB,
        download_size_bytes: 1066 * MB,
        minimum_tier: ChipTier::Tier2,
        quantization: Quantization::Q4KM,
        source: "https://huggingface.co/Qwen/Qwen2.5-Coder-1.5B-Instruct-GGUF/resolve/main/qwen2.5-coder-1.5b-instruct-q4_k_m.gguf",
        context_length: 32768,
        template: ChatTemplate::ChatMl,
    },
    ModelDescriptor {
        id: "deepseek-r1-distill-qwen-1.5b",
        display_name: "DeepSeek R1 Distill 1.5B",
        description: "Step-by-step reasoning in a small package.",
        category: ModelCategory::Reasoning,
        parameters: "1.5B",
        memory_footprint_bytes: 1200 * MB,
        download_size_bytes: 1120 * MB,
        minimum_tier: ChipTier::Tier3,
        quantization: Quantization::Q4KM,
        source: "https://huggingface.co/bartowski/DeepSeek-R1-Distill-Qwen-1.5B-GGUF/resolve/main/DeepSeek-R1-Distill-Qwen-1.5B-Q4_K_M.gguf",
        context_length: 32768,
        template: ChatTemplate::ChatMl,
    },
    ModelDescriptor {
        id: "gemma-2-2b-it",
        display_name: "Gemma 2 2B",
        description: "Google's compact model with strong writing quality.",
        category: ModelCategory::General,
        parameters: "2B",
        memory_footprint_bytes: 1600 * MB,
        download_size_bytes: 1630 * MB,
        minimum_tier: ChipTier::Tier2,
        quantization: Quantization::Q4KM,
        source: "https://huggingface.co/bartowski/gemma-2-2b-it-GGUF/resolve/main/gemma-2-2b-it-Q4_K_M.gguf",
        context_length: 8192,
        template: ChatTemplate::Gemma,
    },
    ModelDescriptor {
        id: "llama-3.2-3b-instruct",
        display_name: "Llama 3.2 3B Instruct",
        description: "Meta's latest small model, great for summarization and chat.",
        category: ModelCategory::General,
        parameters: "3B",
        memory_footprint_bytes: 2000 * MB,
        download_size_bytes: 2020 * MB,
        minimum_tier: ChipTier::Tier3,
        quantization: Quantization::Q4KM,
        source: "https://huggingface.co/bartowski/Llama-3.2-3B-Instruct-GGUF/resolve/main/Llama-3.2-3B-Instruct-Q4_K_M.gguf",
        context_length: 131072,
        template: ChatTemplate::Llama3,
    },
    ModelDescriptor {
        id: "phi-3.5-mini",
        display_name: "Phi 3.5 Mini",
        description: "Microsoft's efficient small model.",
        category: ModelCategory::General,
        parameters: "3.8B",
        memory_footprint_bytes: 2300 * MB,
        download_size_bytes: 2390 * MB,
        minimum_tier: ChipTier::Tier4,
        quantization: Quantization::Q4KM,
        source: "https://huggingface.co/bartowski/Phi-3.5-mini-instruct-GGUF/resolve/main/Phi-3.5-mini-instruct-Q4_K_M.gguf",
        context_length: 131072,
        template: ChatTemplate::Phi3,
    },
];

/// Get list of available models for download
pub fn available_models() -> &'static [ModelDescriptor] {
    &CATALOG
}

/// Look up a model by id
pub fn find_model(model_id: &str) -> Option<&'static ModelDescriptor> {
    CATALOG.iter().find(|m| m.id == model_id)
}

/// The model offered first on a fresh install
pub fn default_model() -> &'static ModelDescriptor {
    &CATALOG[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let ids: HashSet<_> = available_models().iter().map(|m| m.id).collect();
        assert_eq!(ids.len(), available_models().len());
    }

    #[test]
    fn test_find_known_model() {
        let model = find_model("llama-3.2-1b-instruct").unwrap();
        assert_eq!(model.footprint_mb(), 800);
        assert_eq!(model.minimum_tier, ChipTier::Tier2);
        assert!(find_model("not-a-model").is_none());
    }

    #[test]
    fn test_default_model_runs_everywhere() {
        assert_eq!(default_model().minimum_tier, ChipTier::Tier1);
    }

    #[test]
    fn test_artifact_file_name() {
        let model = find_model("phi-3.5-mini").unwrap();
        assert_eq!(model.artifact_file_name(), "phi-3.5-mini.gguf");
    }
}
