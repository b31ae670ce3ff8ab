//! Model loader
//!
//! Keeps at most one model resident. Concurrent `load()` callers share one
//! in-flight load future, so the backend is asked to materialise weights once
//! no matter how many screens request the model at the same time.
//!
//! A generation session holds a read lease on the resident model for as long
//! as it pulls tokens. Switching models or unloading takes the write side, so
//! the old weights are never released under a running session.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{watch, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use super::backend::{BackendError, InferenceBackend};
use super::handle::ModelHandle;
use crate::catalog::{find_model, ModelDescriptor, MB};
use crate::download::DownloadCoordinator;
use crate::error::CoreError;
use crate::memory::{MemoryPressureController, MemoryPressureObserver};
use crate::preferences::PreferencesStore;

type LoadFuture = Shared<BoxFuture<'static, Result<ModelHandle, CoreError>>>;

/// Held by a generation session for its whole lifetime
pub type ResidencyLease = OwnedRwLockReadGuard<()>;
type ReleaseLease = OwnedRwLockWriteGuard<()>;

/// Observable loader state
#[derive(Debug, Clone, PartialEq)]
pub enum LoadState {
    Idle,
    Loading { model_id: String },
    Loaded(ModelHandle),
    Failed(CoreError),
}

enum Slot {
    Idle,
    Loading {
        model_id: &'static str,
        future: LoadFuture,
    },
    Loaded(ModelHandle),
    Failed(CoreError),
}

/// What `load()` decided to do while holding the slot lock
enum Step {
    Ready(ModelHandle),
    Attach(LoadFuture),
    /// A different model is loading; wait for it and decide again
    WaitFor(LoadFuture),
    /// Another model is resident; its sessions must end before it is released
    NeedLease,
    Missing {
        error: CoreError,
        previous: Option<(ModelHandle, ReleaseLease)>,
    },
}

pub struct ModelLoader {
    backend: Arc<dyn InferenceBackend>,
    downloads: Arc<DownloadCoordinator>,
    preferences: Arc<dyn PreferencesStore>,
    pressure: Arc<MemoryPressureController>,
    slot: Arc<Mutex<Slot>>,
    progress: Arc<watch::Sender<f64>>,
    residency: Arc<RwLock<()>>,
}

impl ModelLoader {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        downloads: Arc<DownloadCoordinator>,
        preferences: Arc<dyn PreferencesStore>,
        pressure: Arc<MemoryPressureController>,
    ) -> Self {
        let (progress, _) = watch::channel(0.0);
        Self {
            backend,
            downloads,
            preferences,
            pressure,
            slot: Arc::new(Mutex::new(Slot::Idle)),
            progress: Arc::new(progress),
            residency: Arc::new(RwLock::new(())),
        }
    }

    pub fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.backend
    }

    /// Pin the resident model for a generation session. Fails while a switch
    /// or unload is waiting for, or holding, the release side.
    pub fn try_lease(&self) -> Option<ResidencyLease> {
        Arc::clone(&self.residency).try_read_owned().ok()
    }

    async fn release_lease(&self) -> ReleaseLease {
        Arc::clone(&self.residency).write_owned().await
    }

    /// Load the selected model, or return it if it is already resident.
    pub async fn load(&self) -> Result<ModelHandle, CoreError> {
        let selected = self
            .preferences
            .active_selection()?
            .ok_or(CoreError::NoModelSelected)?;
        let model =
            find_model(&selected).ok_or_else(|| CoreError::UnknownModel(selected.clone()))?;

        let mut lease = None;
        loop {
            match self.next_step(model, &mut lease) {
                Step::Ready(handle) => return Ok(handle),
                Step::Attach(future) => {
                    drop(lease);
                    return future.await;
                }
                Step::WaitFor(future) => {
                    lease = None;
                    let _ = future.await;
                }
                Step::NeedLease => {
                    debug!("Waiting for sessions on the resident model to end");
                    lease = Some(self.release_lease().await);
                }
                Step::Missing { error, previous } => {
                    if let Some((previous, _lease)) = previous {
                        self.release(previous).await;
                    }
                    return Err(error);
                }
            }
        }
    }

    fn next_step(&self, model: &'static ModelDescriptor, lease: &mut Option<ReleaseLease>) -> Step {
        let mut slot = self.lock_slot();

        match &*slot {
            Slot::Loaded(handle) if handle.model_id() == model.id => {
                return Step::Ready(handle.clone());
            }
            Slot::Loading { model_id, future } if *model_id == model.id => {
                debug!("Attaching to in-flight load of {}", model.id);
                return Step::Attach(future.clone());
            }
            Slot::Loading { future, .. } => return Step::WaitFor(future.clone()),
            Slot::Loaded(_) if lease.is_none() => return Step::NeedLease,
            _ => {}
        }

        let previous = match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Loaded(handle) => lease.take().map(|lease| (handle, lease)),
            _ => None,
        };

        match self.downloads.completed_artifact(model.id) {
            Ok(path) => {
                let future = self.start_load(model, path, previous);
                *slot = Slot::Loading {
                    model_id: model.id,
                    future: future.clone(),
                };
                Step::Attach(future)
            }
            Err(error) => {
                warn!("Cannot load {}: {}", model.id, error);
                *slot = Slot::Failed(error.clone());
                Step::Missing { error, previous }
            }
        }
    }

    /// Build the shared load future and drive it on the runtime so it
    /// completes even if every caller goes away
    fn start_load(
        &self,
        model: &'static ModelDescriptor,
        path: PathBuf,
        previous: Option<(ModelHandle, ReleaseLease)>,
    ) -> LoadFuture {
        let backend = Arc::clone(&self.backend);
        let slot = Arc::clone(&self.slot);
        let progress = Arc::clone(&self.progress);
        let budget = self.pressure.current_budget();

        let future = async move {
            if let Some((previous, _lease)) = previous {
                info!("Releasing {} before loading {}", previous.model_id(), model.id);
                backend.unload(previous.into_model()).await;
            }

            backend.set_cache_limit(budget);
            progress.send_replace(0.0);
            info!(
                "Loading model {} from {:?} (cache budget {} MB)",
                model.id,
                path,
                budget / MB
            );

            let on_progress = |fraction: f64| {
                let fraction = fraction.clamp(0.0, 1.0);
                progress.send_if_modified(|current| {
                    if fraction > *current {
                        *current = fraction;
                        true
                    } else {
                        false
                    }
                });
            };

            let started = Instant::now();
            let result = backend
                .load(model, &path, &on_progress)
                .await
                .map(|loaded| ModelHandle::new(loaded, model))
                .map_err(BackendError::into_load_error);

            match &result {
                Ok(_) => {
                    progress.send_replace(1.0);
                    info!("Model {} loaded in {:?}", model.id, started.elapsed());
                }
                Err(e) => warn!("Failed to load {}: {}", model.id, e),
            }

            let mut current = slot.lock().unwrap_or_else(|e| e.into_inner());
            *current = match &result {
                Ok(handle) => Slot::Loaded(handle.clone()),
                Err(e) => Slot::Failed(e.clone()),
            };

            result
        }
        .boxed()
        .shared();

        tokio::spawn(future.clone());
        future
    }

    /// Progress of the current (or most recent) load
    pub fn load_progress(&self) -> watch::Receiver<f64> {
        self.progress.subscribe()
    }

    pub fn current_load_state(&self) -> LoadState {
        match &*self.lock_slot() {
            Slot::Idle => LoadState::Idle,
            Slot::Loading { model_id, .. } => LoadState::Loading {
                model_id: model_id.to_string(),
            },
            Slot::Loaded(handle) => LoadState::Loaded(handle.clone()),
            Slot::Failed(error) => LoadState::Failed(error.clone()),
        }
    }

    pub fn resident_handle(&self) -> Option<ModelHandle> {
        match &*self.lock_slot() {
            Slot::Loaded(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Release the resident model and return to `Idle`. An in-flight load is
    /// allowed to finish first, and a running session must end before the
    /// model is released. Returns true if a model was released.
    pub async fn unload(&self) -> bool {
        let pending = match &*self.lock_slot() {
            Slot::Loading { future, .. } => Some(future.clone()),
            _ => None,
        };
        if let Some(future) = pending {
            let _ = future.await;
        }

        let _lease = self.release_lease().await;
        let previous = {
            let mut slot = self.lock_slot();
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Loaded(handle) => Some(handle),
                loading @ Slot::Loading { .. } => {
                    // Someone started a new load meanwhile; leave it alone
                    *slot = loading;
                    return false;
                }
                Slot::Idle | Slot::Failed(_) => None,
            }
        };

        match previous {
            Some(handle) => {
                self.release(handle).await;
                true
            }
            None => false,
        }
    }

    async fn release(&self, handle: ModelHandle) {
        info!("Unloading model {}", handle.model_id());
        self.backend.unload(handle.into_model()).await;
        self.progress.send_replace(0.0);
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MemoryPressureObserver for ModelLoader {
    fn on_memory_pressure(&self, budget_bytes: u64) {
        self.backend.set_cache_limit(budget_bytes);
        if let Some(handle) = self.resident_handle() {
            info!(
                "Memory pressure: clearing caches of {} (budget {} MB)",
                handle.model_id(),
                budget_bytes / MB
            );
            self.backend.clear_cache();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ChipTier;
    use crate::download::DownloadOptions;
    use crate::error::LoadFailure;
    use crate::preferences::MemoryPreferences;
    use crate::testing::{MockBackend, MockTransport};
    use futures_util::future::join_all;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const SMALL: &str = "qwen-2.5-0.5b-instruct";
    const LLAMA: &str = "llama-3.2-1b-instruct";

    struct Fixture {
        _dir: TempDir,
        prefs: Arc<MemoryPreferences>,
        backend: Arc<MockBackend>,
        pressure: Arc<MemoryPressureController>,
        loader: Arc<ModelLoader>,
    }

    /// Loader with the given models already on disk
    fn fixture(backend: MockBackend, on_disk: &[&str]) -> Fixture {
        let dir = tempdir().unwrap();
        let models_dir = dir.path().join("models");
        std::fs::create_dir_all(&models_dir).unwrap();

        let prefs = Arc::new(MemoryPreferences::new());
        for id in on_disk {
            std::fs::write(models_dir.join(format!("{}.gguf", id)), b"weights").unwrap();
            prefs.insert_completed(id).unwrap();
        }

        let downloads = Arc::new(
            DownloadCoordinator::new(
                models_dir,
                Arc::new(MockTransport::new()),
                prefs.clone(),
                DownloadOptions {
                    verify_disk_space: false,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let backend = Arc::new(backend);
        let pressure = Arc::new(MemoryPressureController::new(ChipTier::Tier3));
        let loader = Arc::new(ModelLoader::new(
            backend.clone(),
            downloads,
            prefs.clone(),
            pressure.clone(),
        ));

        Fixture {
            _dir: dir,
            prefs,
            backend,
            pressure,
            loader,
        }
    }

    #[tokio::test]
    async fn test_no_selection_does_no_io() {
        let f = fixture(MockBackend::new(), &[LLAMA]);
        assert_eq!(f.loader.load().await, Err(CoreError::NoModelSelected));
        assert_eq!(f.backend.load_count(), 0);
        assert_eq!(f.loader.current_load_state(), LoadState::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_backend_load() {
        let f = fixture(
            MockBackend::new().with_load_delay(Duration::from_millis(30)),
            &[LLAMA],
        );
        f.prefs.set_active_selection(Some(LLAMA)).unwrap();

        let results = join_all((0..8).map(|_| f.loader.load())).await;

        assert_eq!(f.backend.load_count(), 1);
        let first = results[0].clone().unwrap();
        assert_eq!(first.model_id(), LLAMA);
        for result in &results {
            assert!(result.as_ref().unwrap().same_model(&first));
        }
        assert_eq!(f.loader.current_load_state(), LoadState::Loaded(first));
    }

    #[tokio::test]
    async fn test_loaded_model_is_reused() {
        let f = fixture(MockBackend::new(), &[LLAMA]);
        f.prefs.set_active_selection(Some(LLAMA)).unwrap();

        let a = f.loader.load().await.unwrap();
        let b = f.loader.load().await.unwrap();
        assert!(a.same_model(&b));
        assert_eq!(f.backend.load_count(), 1);
        assert_eq!(*f.loader.load_progress().borrow(), 1.0);
    }

    #[tokio::test]
    async fn test_switching_releases_previous_first() {
        let f = fixture(MockBackend::new(), &[SMALL, LLAMA]);
        f.prefs.set_active_selection(Some(SMALL)).unwrap();
        f.loader.load().await.unwrap();

        f.prefs.set_active_selection(Some(LLAMA)).unwrap();
        let handle = f.loader.load().await.unwrap();

        assert_eq!(handle.model_id(), LLAMA);
        assert_eq!(
            f.backend.events(),
            vec![
                format!("load {}", SMALL),
                format!("unload {}", SMALL),
                format!("load {}", LLAMA),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_without_backend_io() {
        let f = fixture(MockBackend::new(), &[]);
        f.prefs.set_active_selection(Some(LLAMA)).unwrap();

        let err = f.loader.load().await.unwrap_err();
        assert_eq!(err, CoreError::ModelNotDownloaded(LLAMA.to_string()));
        assert_eq!(f.backend.load_count(), 0);
        assert_eq!(f.loader.current_load_state(), LoadState::Failed(err));
    }

    #[tokio::test]
    async fn test_backend_failure_then_retry() {
        let f = fixture(MockBackend::new(), &[LLAMA]);
        f.prefs.set_active_selection(Some(LLAMA)).unwrap();
        f.backend
            .fail_next_load(BackendError::OutOfMemory("weights too large".into()));

        let err = f.loader.load().await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::LoadFailed {
                kind: LoadFailure::OutOfMemory,
                ..
            }
        ));
        assert!(matches!(f.loader.current_load_state(), LoadState::Failed(_)));

        let handle = f.loader.load().await.unwrap();
        assert_eq!(handle.model_id(), LLAMA);
        assert_eq!(f.backend.load_count(), 2);
    }

    #[tokio::test]
    async fn test_pre_load_writes_budget() {
        let f = fixture(MockBackend::new(), &[LLAMA]);
        f.prefs.set_active_selection(Some(LLAMA)).unwrap();
        f.pressure.set_budget(300 * MB);

        f.loader.load().await.unwrap();
        assert_eq!(f.backend.cache_limit(), 300 * MB);
    }

    #[tokio::test]
    async fn test_pressure_clears_resident_cache() {
        let f = fixture(MockBackend::new(), &[LLAMA]);
        f.pressure.add_observer(&f.loader);

        // Nothing resident: only the ceiling moves
        f.pressure.handle_memory_warning();
        assert_eq!(f.backend.clear_count(), 0);

        f.prefs.set_active_selection(Some(LLAMA)).unwrap();
        f.loader.load().await.unwrap();

        let report = f.pressure.handle_memory_warning();
        assert_eq!(report.notified, 1);
        assert_eq!(f.backend.clear_count(), 1);
        assert_eq!(f.backend.cache_limit(), report.budget);
        assert!(f.loader.resident_handle().is_some());
    }

    #[tokio::test]
    async fn test_unload_returns_to_idle() {
        let f = fixture(MockBackend::new(), &[LLAMA]);
        f.prefs.set_active_selection(Some(LLAMA)).unwrap();
        f.loader.load().await.unwrap();

        assert!(f.loader.unload().await);
        assert_eq!(f.loader.current_load_state(), LoadState::Idle);
        assert_eq!(f.backend.unload_count(), 1);
        assert!(!f.loader.unload().await);
    }

    #[tokio::test]
    async fn test_switch_waits_for_leased_model() {
        let f = fixture(MockBackend::new(), &[SMALL, LLAMA]);
        f.prefs.set_active_selection(Some(SMALL)).unwrap();
        f.loader.load().await.unwrap();
        let lease = f.loader.try_lease().unwrap();

        f.prefs.set_active_selection(Some(LLAMA)).unwrap();
        let loader = f.loader.clone();
        let switch = tokio::spawn(async move { loader.load().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            f.loader.current_load_state(),
            LoadState::Loaded(ref h) if h.model_id() == SMALL
        ));
        assert_eq!(f.backend.unload_count(), 0);

        drop(lease);
        let handle = switch.await.unwrap().unwrap();
        assert_eq!(handle.model_id(), LLAMA);
        assert_eq!(
            f.backend.events(),
            vec![
                format!("load {}", SMALL),
                format!("unload {}", SMALL),
                format!("load {}", LLAMA),
            ]
        );
    }

    #[tokio::test]
    async fn test_unload_waits_for_leased_model() {
        let f = fixture(MockBackend::new(), &[LLAMA]);
        f.prefs.set_active_selection(Some(LLAMA)).unwrap();
        f.loader.load().await.unwrap();
        let lease = f.loader.try_lease().unwrap();

        let loader = f.loader.clone();
        let unload = tokio::spawn(async move { loader.unload().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.loader.resident_handle().is_some());
        assert_eq!(f.backend.unload_count(), 0);

        drop(lease);
        assert!(unload.await.unwrap());
        assert_eq!(f.loader.current_load_state(), LoadState::Idle);
        assert_eq!(f.backend.unload_count(), 1);
    }
}
