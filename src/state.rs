// Runtime state for the on-device model core
//
// One explicitly owned object wires the components together. The host app
// creates it once and keeps it for the life of the process.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::catalog::{available_models, find_model, ModelDescriptor};
use crate::config::RuntimeConfig;
use crate::device::{score_with, CompatibilityTier, DeviceProfile, ModelRecommendation, ScoringThresholds};
use crate::download::{ArtifactTransport, DeleteReport, DownloadCoordinator, DownloadState, HttpTransport};
use crate::error::CoreError;
use crate::generation::{ChatMessage, GenerationEngine, GenerationOutcome, GenerationStream};
use crate::loader::{InferenceBackend, LoadState, ModelHandle, ModelLoader};
use crate::memory::{MemoryPressureController, MemoryPressureObserver, ObserverId, PressureReport};
use crate::preferences::{PreferencesStore, SqlitePreferences};

pub struct ModelRuntime {
    device: DeviceProfile,
    thresholds: ScoringThresholds,
    preferences: Arc<dyn PreferencesStore>,
    pressure: Arc<MemoryPressureController>,
    downloads: Arc<DownloadCoordinator>,
    loader: Arc<ModelLoader>,
    engine: GenerationEngine,
    loader_observer: ObserverId,
}

impl ModelRuntime {
    /// Wire the components from explicit collaborators
    pub fn new(
        config: &RuntimeConfig,
        device: DeviceProfile,
        preferences: Arc<dyn PreferencesStore>,
        transport: Arc<dyn ArtifactTransport>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, CoreError> {
        let pressure = Arc::new(MemoryPressureController::new(device.tier));
        let downloads = Arc::new(DownloadCoordinator::new(
            config.models_dir.clone(),
            transport,
            Arc::clone(&preferences),
            config.download_options(),
        )?);
        let loader = Arc::new(ModelLoader::new(
            backend,
            Arc::clone(&downloads),
            Arc::clone(&preferences),
            Arc::clone(&pressure),
        ));
        let loader_observer = pressure.add_observer(&loader);
        let engine = GenerationEngine::new(
            Arc::clone(&loader),
            Arc::clone(&pressure),
            config.generation_options(),
        );

        log::info!(
            "Model runtime ready on {} ({}, {} MB)",
            device.hardware_identifier,
            device.tier,
            device.total_memory_bytes / crate::catalog::MB
        );

        Ok(Self {
            device,
            thresholds: config.thresholds(),
            preferences,
            pressure,
            downloads,
            loader,
            engine,
            loader_observer,
        })
    }

    /// Production wiring: detected device, SQLite preferences, HTTP transport
    pub fn open(config: &RuntimeConfig, backend: Arc<dyn InferenceBackend>) -> Result<Self, CoreError> {
        let preferences = Arc::new(SqlitePreferences::open(&config.database_path)?);
        let transport = Arc::new(HttpTransport::new(config.download_timeout())?);
        Self::new(
            config,
            DeviceProfile::detect().clone(),
            preferences,
            transport,
            backend,
        )
    }

    pub fn device(&self) -> &DeviceProfile {
        &self.device
    }

    pub fn catalog(&self) -> &'static [ModelDescriptor] {
        available_models()
    }

    // ----- compatibility -----

    pub fn compatibility(&self, model_id: &str) -> Result<CompatibilityTier, CoreError> {
        let model = lookup(model_id)?;
        Ok(score_with(&self.thresholds, &self.device, model))
    }

    pub fn recommendations(&self) -> Vec<ModelRecommendation> {
        self.device.recommend_models(&self.thresholds)
    }

    pub fn best_model(&self) -> Option<&'static ModelDescriptor> {
        self.device.best_model(&self.thresholds)
    }

    // ----- downloads -----

    pub async fn request_download(&self, model_id: &str) -> Result<PathBuf, CoreError> {
        self.downloads.request_download(model_id).await
    }

    pub fn download_progress(&self, model_id: &str) -> Result<watch::Receiver<f64>, CoreError> {
        self.downloads.download_progress(model_id)
    }

    pub fn download_state(&self, model_id: &str) -> DownloadState {
        self.downloads.state(model_id)
    }

    pub fn download_states(&self) -> Vec<(&'static str, DownloadState)> {
        self.downloads.states()
    }

    pub fn cancel_download(&self, model_id: &str) -> bool {
        self.downloads.cancel_download(model_id)
    }

    /// Delete a model. If it is resident, the running session is cancelled
    /// and the model unloaded once that session has ended.
    pub async fn delete_model(&self, model_id: &str) -> Result<(), CoreError> {
        let resident = self
            .loader
            .resident_handle()
            .is_some_and(|h| h.model_id() == model_id);
        if resident {
            self.engine.cancel_generation();
            self.loader.unload().await;
        }
        self.downloads.delete_model(model_id).await
    }

    pub async fn delete_all(&self) -> DeleteReport {
        self.engine.cancel_generation();
        self.loader.unload().await;
        self.downloads.delete_all().await
    }

    // ----- selection and loading -----

    pub fn active_selection(&self) -> Result<Option<String>, CoreError> {
        self.preferences.active_selection()
    }

    /// Make `model_id` the model `load()` materialises next
    pub fn select_model(&self, model_id: &str) -> Result<(), CoreError> {
        let model = lookup(model_id)?;
        self.preferences.set_active_selection(Some(model.id))?;
        log::info!("Selected model {}", model.id);
        Ok(())
    }

    /// Load the selected model. Switching away from a resident model first
    /// cancels its running session; the switch waits for that session to end.
    pub async fn load(&self) -> Result<ModelHandle, CoreError> {
        let selected = self.preferences.active_selection()?;
        let switching = selected.is_some()
            && self
                .loader
                .resident_handle()
                .is_some_and(|h| Some(h.model_id()) != selected.as_deref());
        if switching && self.engine.cancel_generation() {
            log::info!("Selection changed, stopping the running session first");
        }
        self.loader.load().await
    }

    pub fn load_progress(&self) -> watch::Receiver<f64> {
        self.loader.load_progress()
    }

    pub fn current_load_state(&self) -> LoadState {
        self.loader.current_load_state()
    }

    pub async fn unload(&self) -> bool {
        self.loader.unload().await
    }

    // ----- generation -----

    pub fn generate(
        &self,
        transcript: &[ChatMessage],
        system_prompt: &str,
    ) -> Result<GenerationStream, CoreError> {
        self.engine.generate(transcript, system_prompt)
    }

    pub async fn generate_with<F>(
        &self,
        transcript: &[ChatMessage],
        system_prompt: &str,
        on_partial: F,
    ) -> Result<GenerationOutcome, CoreError>
    where
        F: FnMut(&str),
    {
        self.engine.generate_with(transcript, system_prompt, on_partial).await
    }

    pub fn cancel_generation(&self) -> bool {
        self.engine.cancel_generation()
    }

    pub fn is_generating(&self) -> bool {
        self.engine.is_running()
    }

    // ----- memory pressure -----

    pub fn add_observer<T>(&self, observer: &Arc<T>) -> ObserverId
    where
        T: MemoryPressureObserver + 'static,
    {
        self.pressure.add_observer(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.pressure.remove_observer(id)
    }

    pub fn handle_memory_warning(&self) -> PressureReport {
        self.pressure.handle_memory_warning()
    }

    /// Feed platform low-memory notifications into the controller
    pub fn spawn_memory_listener(&self, signals: mpsc::Receiver<()>) -> JoinHandle<()> {
        self.pressure.spawn_listener(signals)
    }

    pub fn reset_budget(&self) -> u64 {
        self.pressure.reset_budget()
    }

    pub fn current_budget(&self) -> u64 {
        self.pressure.current_budget()
    }
}

impl Drop for ModelRuntime {
    fn drop(&mut self) {
        self.pressure.remove_observer(self.loader_observer);
    }
}

fn lookup(model_id: &str) -> Result<&'static ModelDescriptor, CoreError> {
    find_model(model_id).ok_or_else(|| CoreError::UnknownModel(model_id.to_string()))
}
