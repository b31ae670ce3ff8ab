//! Streaming text generation over the resident model
//!
//! Module structure:
//! - `types`: transcript messages, options and session outcome
//! - `prompt`: chat template rendering
//! - `engine`: the single-session streaming loop

pub mod engine;
pub mod prompt;
pub mod types;

pub use engine::{GenerationEngine, GenerationStream};
pub use prompt::render_prompt;
pub use types::{
    ChatMessage, FinishReason, GenerationOptions, GenerationOutcome, MessageRole,
    DEFAULT_MAX_TOKENS, DEFAULT_PUBLISH_EVERY,
};
