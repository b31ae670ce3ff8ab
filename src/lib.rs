// Pocket LLM core - on-device model lifecycle and generation
//
// Lets a memory-constrained device download, load and run one local language
// model at a time:
// - Catalog of downloadable models and device compatibility scoring
// - Single-flight downloads and loads
// - Streaming generation with cooperative cancellation
// - Memory pressure handling for the inference cache

// Performance logging macros - exported for use by other modules
#[macro_use]
pub mod macros;

pub mod catalog;
pub mod config;
pub mod device;
pub mod download;
pub mod error;
pub mod generation;
pub mod loader;
pub mod memory;
pub mod preferences;
pub mod state;
pub mod testing;

pub use catalog::{available_models, find_model, ChipTier, ModelDescriptor};
pub use config::RuntimeConfig;
pub use device::{CompatibilityTier, DeviceProfile};
pub use download::{DeleteReport, DownloadState};
pub use error::{CoreError, DownloadFailure, GenerationFailure, LoadFailure};
pub use generation::{ChatMessage, FinishReason, GenerationOutcome, GenerationStream};
pub use loader::{InferenceBackend, LoadState, ModelHandle};
pub use memory::{MemoryPressureObserver, ObserverId, PressureReport};
pub use state::ModelRuntime;

/// Initialize env_logger to output to stderr (reads RUST_LOG env var).
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
