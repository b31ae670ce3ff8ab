//! Inference backend capability
//!
//! The numeric kernels live outside this crate. The loader and the generation
//! engine only see these traits.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::catalog::ModelDescriptor;
use crate::error::{CoreError, GenerationFailure, LoadFailure};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("Model file is corrupt: {0}")]
    Corrupt(String),
    #[error("Unsupported model format: {0}")]
    UnsupportedFormat(String),
    #[error("Out of memory: {0}")]
    OutOfMemory(String),
    #[error("Inference error: {0}")]
    Inference(String),
}

impl BackendError {
    /// Map a failure raised while materialising weights
    pub fn into_load_error(self) -> CoreError {
        let kind = match &self {
            BackendError::Corrupt(_) | BackendError::Inference(_) => LoadFailure::Corrupt,
            BackendError::UnsupportedFormat(_) => LoadFailure::UnsupportedFormat,
            BackendError::OutOfMemory(_) => LoadFailure::OutOfMemory,
        };
        CoreError::load(kind, self.to_string())
    }

    /// Map a failure raised while producing tokens
    pub fn into_generation_error(self) -> CoreError {
        CoreError::generation(GenerationFailure::Backend, self.to_string())
    }
}

/// Load progress callback, fraction in [0, 1]
pub type LoadProgress<'a> = &'a (dyn Fn(f64) + Send + Sync);

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Materialise the weights at `path`
    async fn load(
        &self,
        model: &'static ModelDescriptor,
        path: &Path,
        on_progress: LoadProgress<'_>,
    ) -> Result<Arc<dyn LoadedModel>, BackendError>;

    /// Release a model returned by `load`
    async fn unload(&self, model: Arc<dyn LoadedModel>);

    /// Ceiling for the working-set cache (KV cache, scratch buffers)
    fn set_cache_limit(&self, bytes: u64);

    /// Drop cached buffers without touching the weights
    fn clear_cache(&self);
}

/// A resident model
pub trait LoadedModel: Send + Sync {
    fn model_id(&self) -> &str;

    /// Begin sampling after `prompt`. Called on the thread that starts the
    /// session; tokens are then pulled on a blocking thread.
    fn start(
        &self,
        prompt: &str,
        seed: u64,
        max_tokens: usize,
    ) -> Result<Box<dyn TokenStream>, BackendError>;

    /// Detokenize a full token buffer
    fn decode(&self, tokens: &[u32]) -> String;
}

/// Pull-based token source for one session
pub trait TokenStream: Send {
    /// `Ok(None)` is the backend's stop signal
    fn next_token(&mut self) -> Result<Option<u32>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_mapping() {
        assert!(matches!(
            BackendError::OutOfMemory("4 GB needed".into()).into_load_error(),
            CoreError::LoadFailed {
                kind: LoadFailure::OutOfMemory,
                ..
            }
        ));
        assert!(matches!(
            BackendError::UnsupportedFormat("ggml v1".into()).into_load_error(),
            CoreError::LoadFailed {
                kind: LoadFailure::UnsupportedFormat,
                ..
            }
        ));
        assert!(matches!(
            BackendError::Inference("nan logits".into()).into_generation_error(),
            CoreError::GenerationFailed {
                kind: GenerationFailure::Backend,
                ..
            }
        ));
    }
}
