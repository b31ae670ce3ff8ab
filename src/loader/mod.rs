//! Model loading
//!
//! Module structure:
//! - `backend`: capability traits implemented by the inference runtime
//! - `handle`: cloneable capability to the resident model
//! - `model_loader`: one-resident-model state machine with shared loads

pub mod backend;
pub mod handle;
pub mod model_loader;

pub use backend::{BackendError, InferenceBackend, LoadedModel, TokenStream};
pub use handle::ModelHandle;
pub use model_loader::{LoadState, ModelLoader, ResidencyLease};
