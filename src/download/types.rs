//! Download state types

use serde::Serialize;

use crate::error::{CoreError, DownloadFailure};

/// Per-model download state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DownloadState {
    NotStarted,
    InProgress { progress: f64 },
    Completed,
    Failed { reason: DownloadFailure, message: String },
}

impl DownloadState {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, DownloadState::InProgress { .. })
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DownloadState::Completed)
    }

    /// Fraction in [0, 1] for a progress bar
    pub fn progress(&self) -> f64 {
        match self {
            DownloadState::NotStarted | DownloadState::Failed { .. } => 0.0,
            DownloadState::InProgress { progress } => *progress,
            DownloadState::Completed => 1.0,
        }
    }

    pub(crate) fn failed(err: &CoreError) -> Self {
        match err {
            CoreError::DownloadFailed { kind, message } => DownloadState::Failed {
                reason: *kind,
                message: message.clone(),
            },
            other => DownloadState::Failed {
                reason: DownloadFailure::Storage,
                message: other.to_string(),
            },
        }
    }
}

/// Result of a bulk delete: every id is attempted, failures are collected
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, CoreError)>,
}

impl DeleteReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
