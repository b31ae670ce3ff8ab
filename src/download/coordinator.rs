//! Download coordinator
//!
//! Tracks a download state per catalog model and enforces that at most one
//! transfer runs at a time across all models. The completed set lives in the
//! preferences store; everything else is in memory and rebuilt at cold start,
//! so a restart never shows a stale in-progress download.

use dashmap::DashMap;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use sysinfo::Disks;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::transport::ArtifactTransport;
use super::types::{DeleteReport, DownloadState};
use crate::catalog::{available_models, find_model, ModelDescriptor, MB};
use crate::error::{CoreError, DownloadFailure};
use crate::preferences::PreferencesStore;

/// Tunables for the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Free space required on top of the artifact size
    pub disk_buffer_bytes: u64,
    /// Skip the free-space check when false (e.g. unknown filesystems)
    pub verify_disk_space: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            disk_buffer_bytes: 100 * MB,
            verify_disk_space: true,
        }
    }
}

/// The single in-flight transfer
struct ActiveDownload {
    model_id: &'static str,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

pub struct DownloadCoordinator {
    models_dir: PathBuf,
    transport: Arc<dyn ArtifactTransport>,
    preferences: Arc<dyn PreferencesStore>,
    options: DownloadOptions,
    states: DashMap<&'static str, DownloadState>,
    progress: DashMap<&'static str, watch::Sender<f64>>,
    active: Mutex<Option<ActiveDownload>>,
}

/// Releases the single-flight slot on every exit path, including a dropped
/// `request_download` future
struct SlotGuard<'a> {
    coordinator: &'a DownloadCoordinator,
    model_id: &'static str,
    done: watch::Sender<bool>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut state) = self.coordinator.states.get_mut(self.model_id) {
            if state.is_in_progress() {
                warn!("Download of {} abandoned before completion", self.model_id);
                *state = DownloadState::Failed {
                    reason: DownloadFailure::Cancelled,
                    message: "Download abandoned".to_string(),
                };
            }
        }
        self.coordinator.lock_active().take();
        let _ = self.done.send(true);
    }
}

impl DownloadCoordinator {
    /// Build the coordinator and reconcile the durable completed set with the
    /// artifacts actually present on disk
    pub fn new(
        models_dir: PathBuf,
        transport: Arc<dyn ArtifactTransport>,
        preferences: Arc<dyn PreferencesStore>,
        options: DownloadOptions,
    ) -> Result<Self, CoreError> {
        let coordinator = Self {
            models_dir,
            transport,
            preferences,
            options,
            states: DashMap::new(),
            progress: DashMap::new(),
            active: Mutex::new(None),
        };
        coordinator.reconcile()?;
        Ok(coordinator)
    }

    fn reconcile(&self) -> Result<(), CoreError> {
        for id in self.preferences.completed_downloads()? {
            match find_model(&id) {
                Some(model) if self.artifact_path(model).exists() => {
                    self.states.insert(model.id, DownloadState::Completed);
                }
                Some(_) => {
                    warn!("Artifact for {} is missing, marking as not downloaded", id);
                    self.preferences.remove_completed(&id)?;
                }
                None => {
                    warn!("Dropping completed entry for unknown model {}", id);
                    self.preferences.remove_completed(&id)?;
                }
            }
        }
        info!(
            "Download coordinator ready: {} model(s) on disk in {:?}",
            self.states.len(),
            self.models_dir
        );
        Ok(())
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Final location of a model's artifact
    pub fn artifact_path(&self, model: &ModelDescriptor) -> PathBuf {
        self.models_dir.join(model.artifact_file_name())
    }

    fn partial_path(&self, model: &ModelDescriptor) -> PathBuf {
        self.models_dir
            .join(format!("{}.part", model.artifact_file_name()))
    }

    /// Path of a completed artifact that is still on disk
    pub fn completed_artifact(&self, model_id: &str) -> Result<PathBuf, CoreError> {
        let model = lookup(model_id)?;
        let path = self.artifact_path(model);
        if self.state(model_id).is_completed() && path.exists() {
            Ok(path)
        } else {
            Err(CoreError::ModelNotDownloaded(model_id.to_string()))
        }
    }

    pub fn state(&self, model_id: &str) -> DownloadState {
        self.states
            .get(model_id)
            .map(|s| s.clone())
            .unwrap_or(DownloadState::NotStarted)
    }

    /// Snapshot of every catalog model, in catalog order
    pub fn states(&self) -> Vec<(&'static str, DownloadState)> {
        available_models()
            .iter()
            .map(|m| (m.id, self.state(m.id)))
            .collect()
    }

    /// Id of the download currently holding the slot
    pub fn active_download(&self) -> Option<String> {
        self.lock_active().as_ref().map(|a| a.model_id.to_string())
    }

    /// Progress stream for one model. Values are fractions in [0, 1] and never
    /// decrease within one attempt.
    pub fn download_progress(&self, model_id: &str) -> Result<watch::Receiver<f64>, CoreError> {
        let model = lookup(model_id)?;
        Ok(self.with_progress(model, |sender| sender.subscribe()))
    }

    fn with_progress<R>(
        &self,
        model: &'static ModelDescriptor,
        f: impl FnOnce(&watch::Sender<f64>) -> R,
    ) -> R {
        let initial = self.state(model.id).progress();
        let sender = self
            .progress
            .entry(model.id)
            .or_insert_with(|| watch::channel(initial).0);
        f(&sender)
    }

    /// Download a model and wait for it to finish.
    ///
    /// Rejected without side effects if any download is already running or
    /// the model is already on disk.
    pub async fn request_download(&self, model_id: &str) -> Result<PathBuf, CoreError> {
        let model = lookup(model_id)?;
        let (cancel, guard) = self.claim_slot(model)?;

        info!("Starting download of {} from {}", model.id, model.source);
        let result = self.run_download(model, &cancel).await;

        match &result {
            Ok(path) => {
                self.states.insert(model.id, DownloadState::Completed);
                self.publish_progress(model, 1.0);
                info!("Download of {} complete: {:?}", model.id, path);
            }
            Err(e) => {
                self.states.insert(model.id, DownloadState::failed(e));
                warn!("Download of {} failed: {}", model.id, e);
            }
        }

        drop(guard);
        result
    }

    fn claim_slot(
        &self,
        model: &'static ModelDescriptor,
    ) -> Result<(CancellationToken, SlotGuard<'_>), CoreError> {
        let mut active = self.lock_active();

        if let Some(current) = active.as_ref() {
            return Err(CoreError::AlreadyDownloading(current.model_id.to_string()));
        }
        if self.state(model.id).is_completed() || self.preferences.is_completed(model.id)? {
            return Err(CoreError::AlreadyDownloaded(model.id.to_string()));
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        *active = Some(ActiveDownload {
            model_id: model.id,
            cancel: cancel.clone(),
            done: done_rx,
        });

        // Each attempt starts from zero
        self.states
            .insert(model.id, DownloadState::InProgress { progress: 0.0 });
        self.with_progress(model, |sender| sender.send_replace(0.0));

        Ok((
            cancel,
            SlotGuard {
                coordinator: self,
                model_id: model.id,
                done: done_tx,
            },
        ))
    }

    async fn run_download(
        &self,
        model: &'static ModelDescriptor,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, CoreError> {
        tokio::fs::create_dir_all(&self.models_dir)
            .await
            .map_err(|e| {
                CoreError::download(
                    DownloadFailure::Storage,
                    format!("Failed to create models directory: {}", e),
                )
            })?;

        if self.options.verify_disk_space {
            self.check_disk_space(model)?;
        }

        let partial = self.partial_path(model);
        let dest = self.artifact_path(model);

        let on_progress = |written: u64, total: u64| {
            let fraction = if total == 0 {
                0.0
            } else {
                (written as f64 / total as f64).clamp(0.0, 1.0)
            };
            self.publish_progress(model, fraction);
            perf_trace!("{}: {} / {} bytes", model.id, written, total);
        };

        let bytes = self
            .transport
            .fetch(model, &partial, &on_progress, cancel)
            .await?;
        debug!("Fetched {} bytes for {}", bytes, model.id);

        tokio::fs::rename(&partial, &dest).await.map_err(|e| {
            CoreError::download(
                DownloadFailure::Storage,
                format!("Failed to move artifact into place: {}", e),
            )
        })?;

        self.preferences.insert_completed(model.id)?;

        if self.preferences.active_selection()?.is_none() {
            info!("No active model, selecting {}", model.id);
            self.preferences.set_active_selection(Some(model.id))?;
        }

        Ok(dest)
    }

    /// Raise the progress value, ignoring anything that would move it back
    fn publish_progress(&self, model: &'static ModelDescriptor, fraction: f64) {
        let raised = self.with_progress(model, |sender| {
            sender.send_if_modified(|current| {
                if fraction > *current {
                    *current = fraction;
                    true
                } else {
                    false
                }
            })
        });

        if raised {
            if let Some(mut state) = self.states.get_mut(model.id) {
                if state.is_in_progress() {
                    *state = DownloadState::InProgress { progress: fraction };
                }
            }
        }
    }

    fn check_disk_space(&self, model: &ModelDescriptor) -> Result<(), CoreError> {
        let required = model.download_size_bytes + self.options.disk_buffer_bytes;
        match available_space_at(&self.models_dir) {
            Some(available) if available < required => Err(CoreError::download(
                DownloadFailure::Storage,
                format!(
                    "Not enough free space: {} MB required, {} MB available",
                    required / MB,
                    available / MB
                ),
            )),
            Some(_) => Ok(()),
            None => {
                warn!("Could not determine free space for {:?}", self.models_dir);
                Ok(())
            }
        }
    }

    /// Ask the running download of `model_id` to stop. Returns false if it is
    /// not the one in flight.
    pub fn cancel_download(&self, model_id: &str) -> bool {
        let active = self.lock_active();
        match active.as_ref() {
            Some(current) if current.model_id == model_id => {
                info!("Cancelling download of {}", model_id);
                current.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Remove a model's artifacts and forget that it was downloaded. A
    /// matching in-flight download is cancelled and awaited first.
    pub async fn delete_model(&self, model_id: &str) -> Result<(), CoreError> {
        let model = lookup(model_id)?;

        let in_flight = {
            let active = self.lock_active();
            active
                .as_ref()
                .filter(|a| a.model_id == model.id)
                .map(|a| {
                    a.cancel.cancel();
                    a.done.clone()
                })
        };
        if let Some(mut done) = in_flight {
            debug!("Waiting for cancelled download of {} to stop", model.id);
            let _ = done.wait_for(|finished| *finished).await;
        }

        for path in [self.artifact_path(model), self.partial_path(model)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CoreError::download(
                        DownloadFailure::Storage,
                        format!("Failed to delete {:?}: {}", path, e),
                    ))
                }
            }
        }

        self.preferences.remove_completed(model.id)?;
        if self.preferences.active_selection()?.as_deref() == Some(model.id) {
            info!("Deleted model {} was active, clearing selection", model.id);
            self.preferences.set_active_selection(None)?;
        }

        self.states.insert(model.id, DownloadState::NotStarted);
        self.with_progress(model, |sender| sender.send_replace(0.0));

        info!("Deleted model {}", model.id);
        Ok(())
    }

    /// Delete every catalog model, continuing past individual failures
    pub async fn delete_all(&self) -> DeleteReport {
        let mut report = DeleteReport::default();
        for model in available_models() {
            let had_artifact = self.state(model.id) != DownloadState::NotStarted
                || self.artifact_path(model).exists()
                || self.partial_path(model).exists();
            if !had_artifact {
                continue;
            }

            match self.delete_model(model.id).await {
                Ok(()) => report.deleted.push(model.id.to_string()),
                Err(e) => {
                    warn!("Failed to delete {}: {}", model.id, e);
                    report.failed.push((model.id.to_string(), e));
                }
            }
        }
        report
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveDownload>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn lookup(model_id: &str) -> Result<&'static ModelDescriptor, CoreError> {
    find_model(model_id).ok_or_else(|| CoreError::UnknownModel(model_id.to_string()))
}

/// Free space on the disk holding `path` (longest matching mount point)
fn available_space_at(path: &Path) -> Option<u64> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}
