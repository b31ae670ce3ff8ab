//! Model artifact downloads
//!
//! Module structure:
//! - `types`: per-model download state and the bulk delete report
//! - `transport`: how bytes reach the disk (HTTP in production)
//! - `coordinator`: single-flight state machine over the catalog

pub mod coordinator;
pub mod transport;
pub mod types;

pub use coordinator::{DownloadCoordinator, DownloadOptions};
pub use transport::{ArtifactTransport, HttpTransport, TransportError};
pub use types::{DeleteReport, DownloadState};
