//! Model Catalog
//!
//! Static registry of the models this build knows how to download and run.
//!
//! Module structure:
//! - types.rs: ModelDescriptor, ChipTier, ModelCategory, Quantization, ChatTemplate
//! - registry.rs: The built-in catalog and lookup helpers

pub mod registry;
pub mod types;

pub use registry::{available_models, default_model, find_model, MB};
pub use types::{ChatTemplate, ChipTier, ModelCategory, ModelDescriptor, Quantization};
