//! Error types for the model lifecycle core
//!
//! Every public operation returns one of these instead of panicking. Internal
//! failures (io, network, sqlite, backend) are converted at the component
//! boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a download ended in the `Failed` state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadFailure {
    /// Transport error, bad status code, truncated body
    Network,
    /// Disk full, permission denied, rename failed
    Storage,
    /// Cancelled by the user or by a delete
    Cancelled,
}

impl fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadFailure::Network => write!(f, "network"),
            DownloadFailure::Storage => write!(f, "storage"),
            DownloadFailure::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a load ended in the `Failed` state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadFailure {
    Corrupt,
    UnsupportedFormat,
    OutOfMemory,
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadFailure::Corrupt => write!(f, "corrupt"),
            LoadFailure::UnsupportedFormat => write!(f, "unsupported format"),
            LoadFailure::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationFailure {
    /// No model is resident
    ModelUnavailable,
    /// The backend reported an error mid-stream
    Backend,
}

impl fmt::Display for GenerationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationFailure::ModelUnavailable => write!(f, "model unavailable"),
            GenerationFailure::Backend => write!(f, "backend"),
        }
    }
}

/// Error taxonomy exposed at the core boundary
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CoreError {
    #[error("No model selected")]
    NoModelSelected,

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Carries the id of the download currently holding the slot
    #[error("Another download is already in progress: {0}")]
    AlreadyDownloading(String),

    #[error("Model already downloaded: {0}")]
    AlreadyDownloaded(String),

    #[error("Download failed ({kind}): {message}")]
    DownloadFailed {
        kind: DownloadFailure,
        message: String,
    },

    #[error("Model is not downloaded: {0}")]
    ModelNotDownloaded(String),

    #[error("Failed to load model ({kind}): {message}")]
    LoadFailed { kind: LoadFailure, message: String },

    #[error("Generation failed ({kind}): {message}")]
    GenerationFailed {
        kind: GenerationFailure,
        message: String,
    },

    #[error("A generation is already running")]
    GenerationBusy,

    #[error("Preferences error: {0}")]
    Preferences(String),
}

impl CoreError {
    pub fn download(kind: DownloadFailure, message: impl Into<String>) -> Self {
        CoreError::DownloadFailed {
            kind,
            message: message.into(),
        }
    }

    pub fn load(kind: LoadFailure, message: impl Into<String>) -> Self {
        CoreError::LoadFailed {
            kind,
            message: message.into(),
        }
    }

    pub fn generation(kind: GenerationFailure, message: impl Into<String>) -> Self {
        CoreError::GenerationFailed {
            kind,
            message: message.into(),
        }
    }

    /// Download and load failures always offer a retry in the UI
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::DownloadFailed { .. }
                | CoreError::LoadFailed { .. }
                | CoreError::ModelNotDownloaded(_)
        )
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(e: anyhow::Error) -> Self {
        CoreError::Preferences(format!("{:#}", e))
    }
}
