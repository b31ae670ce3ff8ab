//! Generation engine
//!
//! Runs one streaming session at a time over the resident model. Tokens are
//! pulled on a blocking thread, decoded in batches and published as growing
//! prefixes of the reply. Cancellation is cooperative and only honoured at
//! batch boundaries, so published text is never retracted.
//!
//! Each session holds the loader's residency lease, so the model cannot be
//! switched or unloaded underneath it.

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::prompt::render_prompt;
use super::types::{ChatMessage, FinishReason, GenerationOptions, GenerationOutcome};
use crate::error::{CoreError, GenerationFailure};
use crate::loader::{LoadedModel, ModelHandle, ModelLoader, TokenStream};
use crate::memory::MemoryPressureController;

type CurrentSession = Arc<Mutex<Option<CancellationToken>>>;

pub struct GenerationEngine {
    loader: Arc<ModelLoader>,
    pressure: Arc<MemoryPressureController>,
    options: GenerationOptions,
    running: Arc<AtomicBool>,
    current: CurrentSession,
}

/// Clears the running flag on every exit path of a session
struct RunningGuard {
    running: Arc<AtomicBool>,
    current: CurrentSession,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock_current(&self.current).take();
        self.running.store(false, Ordering::SeqCst);
    }
}

/// A running session: partial replies as they are published, then the outcome
pub struct GenerationStream {
    session_id: Uuid,
    partials: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    task: JoinHandle<Result<GenerationOutcome, CoreError>>,
}

impl GenerationStream {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Next published prefix, or `None` once the session has ended
    pub async fn next_partial(&mut self) -> Option<String> {
        self.partials.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session to end. Cancellation is reported through
    /// `FinishReason::Cancelled`, not as an error.
    pub async fn finish(self) -> Result<GenerationOutcome, CoreError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(CoreError::generation(
                GenerationFailure::Backend,
                format!("Generation task failed: {}", e),
            )),
        }
    }
}

impl GenerationEngine {
    pub fn new(
        loader: Arc<ModelLoader>,
        pressure: Arc<MemoryPressureController>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            loader,
            pressure,
            options,
            running: Arc::new(AtomicBool::new(false)),
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn options(&self) -> GenerationOptions {
        self.options
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start a session over the resident model. Must be called from within a
    /// tokio runtime.
    pub fn generate(
        &self,
        transcript: &[ChatMessage],
        system_prompt: &str,
    ) -> Result<GenerationStream, CoreError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::GenerationBusy);
        }
        let guard = RunningGuard {
            running: Arc::clone(&self.running),
            current: Arc::clone(&self.current),
        };

        // Registered before any setup so an early cancel is not lost
        let cancel = CancellationToken::new();
        *lock_current(&self.current) = Some(cancel.clone());

        let unavailable =
            || CoreError::generation(GenerationFailure::ModelUnavailable, "No model is loaded");
        let lease = self.loader.try_lease().ok_or_else(unavailable)?;
        let handle = self.loader.resident_handle().ok_or_else(unavailable)?;

        self.loader
            .backend()
            .set_cache_limit(self.pressure.current_budget());

        let prompt = render_prompt(handle.descriptor().template, system_prompt, transcript);
        let seed = clock_seed();
        perf_debug!("Starting {} with seed {}", handle.model_id(), seed);
        let stream = handle
            .model()
            .start(&prompt, seed, self.options.max_tokens)
            .map_err(|e| e.into_generation_error())?;

        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let options = self.options;
        let token = cancel.clone();

        info!(
            "Generation {} started on {} ({} prompt chars)",
            session_id,
            handle.model_id(),
            prompt.len()
        );

        let task = tokio::task::spawn_blocking(move || {
            // The flag clears before the lease is released
            let _lease = lease;
            let _guard = guard;
            run_session(session_id, handle, stream, options, token, tx)
        });

        Ok(GenerationStream {
            session_id,
            partials: rx,
            cancel,
            task,
        })
    }

    /// Run a session to completion, handing each published prefix to
    /// `on_partial`
    pub async fn generate_with<F>(
        &self,
        transcript: &[ChatMessage],
        system_prompt: &str,
        mut on_partial: F,
    ) -> Result<GenerationOutcome, CoreError>
    where
        F: FnMut(&str),
    {
        let mut stream = self.generate(transcript, system_prompt)?;
        while let Some(partial) = stream.next_partial().await {
            on_partial(&partial);
        }
        stream.finish().await
    }

    /// Ask the running session to stop at its next batch boundary
    pub fn cancel_generation(&self) -> bool {
        match lock_current(&self.current).as_ref() {
            Some(token) => {
                info!("Cancelling generation");
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Sampler seed from the wall clock; replies are not meant to be reproducible
fn clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn lock_current(current: &CurrentSession) -> MutexGuard<'_, Option<CancellationToken>> {
    current.lock().unwrap_or_else(|e| e.into_inner())
}

fn run_session(
    session_id: Uuid,
    handle: ModelHandle,
    mut stream: Box<dyn TokenStream>,
    options: GenerationOptions,
    cancel: CancellationToken,
    partials: mpsc::UnboundedSender<String>,
) -> Result<GenerationOutcome, CoreError> {
    let model = handle.model();
    let batch = options.publish_every.max(1);
    let started = Instant::now();

    let mut tokens: Vec<u32> = Vec::with_capacity(options.max_tokens.min(4096));
    let mut published = String::new();
    let mut finish = FinishReason::Length;

    while tokens.len() < options.max_tokens {
        match stream.next_token() {
            Ok(Some(token)) => tokens.push(token),
            Ok(None) => {
                finish = FinishReason::Stop;
                break;
            }
            Err(e) => {
                warn!("Generation {} failed after {} tokens: {}", session_id, tokens.len(), e);
                return Err(e.into_generation_error());
            }
        }

        if tokens.len() % batch == 0 {
            publish(&**model, &tokens, &mut published, &partials);
            if cancel.is_cancelled() {
                finish = FinishReason::Cancelled;
                break;
            }
        }
    }

    let text = model.decode(&tokens);
    if text.len() > published.len() && text.starts_with(published.as_str()) {
        let _ = partials.send(text.clone());
    }

    let elapsed = started.elapsed();
    let tokens_per_sec = if elapsed.as_secs_f64() > 0.0 {
        tokens.len() as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    info!(
        "Generation {} finished ({:?}): {} tokens in {:.2?} ({:.1} tok/s)",
        session_id,
        finish,
        tokens.len(),
        elapsed,
        tokens_per_sec
    );

    Ok(GenerationOutcome {
        session_id,
        text,
        tokens: tokens.len(),
        finish,
    })
}

/// Publish the decoded buffer if it extends what was already published.
///
/// A batch can end inside a multi-byte character, which lossy decoders render
/// as trailing U+FFFD. That tail is never published: the next batch decodes
/// it to the real character, so committing it would break the prefix chain.
/// Batches the decoder rewrote in some other way are held back until the text
/// grows past them again.
fn publish(
    model: &dyn LoadedModel,
    tokens: &[u32],
    published: &mut String,
    partials: &mpsc::UnboundedSender<String>,
) {
    let decoded = model.decode(tokens);
    let stable = decoded.trim_end_matches(char::REPLACEMENT_CHARACTER);
    if stable.len() > published.len() && stable.starts_with(published.as_str()) {
        perf_trace!("Publishing {} chars after {} tokens", stable.len(), tokens.len());
        // The receiver may be gone; the session still runs to its outcome
        let _ = partials.send(stable.to_string());
        *published = stable.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ChipTier, MB};
    use crate::download::{DownloadCoordinator, DownloadOptions};
    use crate::loader::BackendError;
    use crate::preferences::{MemoryPreferences, PreferencesStore};
    use crate::testing::{MockBackend, MockTransport};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const LLAMA: &str = "llama-3.2-1b-instruct";

    struct Fixture {
        _dir: TempDir,
        backend: Arc<MockBackend>,
        pressure: Arc<MemoryPressureController>,
        loader: Arc<ModelLoader>,
        engine: Arc<GenerationEngine>,
    }

    fn fixture(backend: MockBackend) -> Fixture {
        let dir = tempdir().unwrap();
        let models_dir = dir.path().join("models");
        std::fs::create_dir_all(&models_dir).unwrap();
        std::fs::write(models_dir.join(format!("{}.gguf", LLAMA)), b"weights").unwrap();

        let prefs = Arc::new(MemoryPreferences::new());
        prefs.insert_completed(LLAMA).unwrap();
        prefs.set_active_selection(Some(LLAMA)).unwrap();

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
            prefs,
            pressure.clone(),
        ));
        let engine = Arc::new(GenerationEngine::new(
            loader.clone(),
            pressure.clone(),
            GenerationOptions::default(),
        ));

        Fixture {
            _dir: dir,
            backend,
            pressure,
            loader,
            engine,
        }
    }

    fn expected_text(count: u32) -> String {
        (0..count).map(|t| format!("w{} ", t)).collect()
    }

    async fn drain(stream: &mut GenerationStream) -> Vec<String> {
        let mut partials = Vec::new();
        while let Some(partial) = stream.next_partial().await {
            partials.push(partial);
        }
        partials
    }

    #[tokio::test]
    async fn test_requires_loaded_model() {
        let f = fixture(MockBackend::new());
        let err = f.engine.generate(&[ChatMessage::user("Hi")], "").err().unwrap();
        assert!(matches!(
            err,
            CoreError::GenerationFailed {
                kind: GenerationFailure::ModelUnavailable,
                ..
            }
        ));
        assert!(!f.engine.is_running());
    }

    #[tokio::test]
    async fn test_token_cap_is_exact() {
        let f = fixture(MockBackend::new());
        f.loader.load().await.unwrap();

        let mut stream = f.engine.generate(&[ChatMessage::user("Hi")], "").unwrap();
        let partials = drain(&mut stream).await;
        let outcome = stream.finish().await.unwrap();

        assert_eq!(outcome.tokens, 2048);
        assert_eq!(outcome.finish, FinishReason::Length);
        assert_eq!(outcome.text, expected_text(2048));
        assert_eq!(partials.len(), 2048 / 4);
        assert_eq!(partials.last(), Some(&outcome.text));
    }

    #[tokio::test]
    async fn test_published_prefixes_are_monotonic() {
        let f = fixture(MockBackend::new().stop_after(10));
        f.loader.load().await.unwrap();

        let mut stream = f.engine.generate(&[ChatMessage::user("Hi")], "Be brief.").unwrap();
        let partials = drain(&mut stream).await;
        let outcome = stream.finish().await.unwrap();

        assert_eq!(outcome.finish, FinishReason::Stop);
        assert_eq!(outcome.tokens, 10);
        assert_eq!(outcome.text, expected_text(10));

        // Batches at 4 and 8, then the final flush
        assert_eq!(
            partials,
            vec![expected_text(4), expected_text(8), expected_text(10)]
        );
        for pair in partials.windows(2) {
            assert!(pair[1].starts_with(&pair[0]));
        }
    }

    #[tokio::test]
    async fn test_no_duplicate_flush_on_batch_boundary() {
        let f = fixture(MockBackend::new().stop_after(8));
        f.loader.load().await.unwrap();

        let mut stream = f.engine.generate(&[ChatMessage::user("Hi")], "").unwrap();
        let partials = drain(&mut stream).await;
        stream.finish().await.unwrap();
        assert_eq!(partials, vec![expected_text(4), expected_text(8)]);
    }

    #[tokio::test]
    async fn test_cancel_stops_at_batch_boundary() {
        let f = fixture(MockBackend::new().with_token_delay(Duration::from_millis(1)));
        f.loader.load().await.unwrap();

        let mut stream = f.engine.generate(&[ChatMessage::user("Hi")], "").unwrap();
        let first = stream.next_partial().await.unwrap();
        assert_eq!(first, expected_text(4));
        assert!(f.engine.cancel_generation());

        let rest = drain(&mut stream).await;
        let outcome = stream.finish().await.unwrap();

        assert_eq!(outcome.finish, FinishReason::Cancelled);
        assert_eq!(outcome.tokens % 4, 0);
        assert!(outcome.tokens < 2048);
        assert_eq!(outcome.text, expected_text(outcome.tokens as u32));
        assert!(outcome.text.starts_with(&first));
        if let Some(last) = rest.last() {
            assert_eq!(*last, outcome.text);
        }
        assert!(!f.engine.is_running());
        assert!(!f.engine.cancel_generation());
    }

    #[tokio::test]
    async fn test_second_session_is_rejected_while_running() {
        let f = fixture(MockBackend::new().with_token_delay(Duration::from_millis(1)));
        f.loader.load().await.unwrap();

        let stream = f.engine.generate(&[ChatMessage::user("Hi")], "").unwrap();
        assert!(f.engine.is_running());
        assert_eq!(
            f.engine.generate(&[ChatMessage::user("Again")], "").err(),
            Some(CoreError::GenerationBusy)
        );

        stream.cancel();
        stream.finish().await.unwrap();
        assert!(!f.engine.is_running());

        // The flag is released, so a new session may start
        let stream = f.engine.generate(&[ChatMessage::user("Again")], "").unwrap();
        stream.cancel();
        assert_eq!(stream.finish().await.unwrap().finish, FinishReason::Cancelled);
    }

    #[tokio::test]
    async fn test_backend_error_clears_running_flag() {
        let f = fixture(MockBackend::new().error_after(6));
        f.loader.load().await.unwrap();

        let mut stream = f.engine.generate(&[ChatMessage::user("Hi")], "").unwrap();
        let partials = drain(&mut stream).await;
        let err = stream.finish().await.unwrap_err();

        assert_eq!(partials, vec![expected_text(4)]);
        assert!(matches!(
            err,
            CoreError::GenerationFailed {
                kind: GenerationFailure::Backend,
                ..
            }
        ));
        assert!(!f.engine.is_running());
    }

    #[tokio::test]
    async fn test_setup_writes_current_budget() {
        let f = fixture(MockBackend::new().stop_after(4));
        f.loader.load().await.unwrap();
        f.pressure.set_budget(200 * MB);

        let stream = f.engine.generate(&[ChatMessage::user("Hi")], "").unwrap();
        stream.finish().await.unwrap();
        assert_eq!(f.backend.cache_limit(), 200 * MB);
    }

    #[tokio::test]
    async fn test_generate_with_callback() {
        let f = fixture(MockBackend::new().stop_after(5));
        f.loader.load().await.unwrap();

        let mut seen = Vec::new();
        let outcome = f
            .engine
            .generate_with(&[ChatMessage::user("Hi")], "", |partial| seen.push(partial.to_string()))
            .await
            .unwrap();

        assert_eq!(seen, vec![expected_text(4), expected_text(5)]);
        assert_eq!(outcome.text, expected_text(5));
        assert_eq!(f.backend.last_prompt().unwrap(), "<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\nHi<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n");
    }

    #[tokio::test]
    async fn test_cancel_during_setup_is_not_lost() {
        let f = fixture(MockBackend::new().with_start_delay(Duration::from_millis(100)));
        f.loader.load().await.unwrap();

        let engine = f.engine.clone();
        let starting =
            tokio::task::spawn_blocking(move || engine.generate(&[ChatMessage::user("Hi")], ""));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(f.engine.is_running());
        assert!(f.engine.cancel_generation());

        let stream = starting.await.unwrap().unwrap();
        let outcome = stream.finish().await.unwrap();
        assert_eq!(outcome.finish, FinishReason::Cancelled);
        assert_eq!(outcome.tokens, 4);
        assert!(!f.engine.is_running());
    }

    #[tokio::test]
    async fn test_session_blocks_unload_until_it_ends() {
        let f = fixture(MockBackend::new().with_token_delay(Duration::from_millis(1)));
        f.loader.load().await.unwrap();

        let mut stream = f.engine.generate(&[ChatMessage::user("Hi")], "").unwrap();
        stream.next_partial().await.unwrap();

        let loader = f.loader.clone();
        let unload = tokio::spawn(async move { loader.unload().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.backend.unload_count(), 0);
        assert!(f.loader.resident_handle().is_some());

        stream.cancel();
        drain(&mut stream).await;
        assert_eq!(stream.finish().await.unwrap().finish, FinishReason::Cancelled);

        assert!(unload.await.unwrap());
        assert_eq!(
            f.backend.events(),
            vec![
                format!("load {}", LLAMA),
                format!("end {}", LLAMA),
                format!("unload {}", LLAMA),
            ]
        );
    }

    /// Detokenizes raw bytes the way byte-level vocabularies do, rendering an
    /// incomplete trailing sequence as U+FFFD
    struct ByteModel;

    impl LoadedModel for ByteModel {
        fn model_id(&self) -> &str {
            "bytes"
        }

        fn start(&self, _: &str, _: u64, _: usize) -> Result<Box<dyn TokenStream>, BackendError> {
            Ok(Box::new(ByteStream(Vec::new().into_iter())))
        }

        fn decode(&self, tokens: &[u32]) -> String {
            let bytes: Vec<u8> = tokens.iter().map(|t| *t as u8).collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }

    struct ByteStream(std::vec::IntoIter<u8>);

    impl TokenStream for ByteStream {
        fn next_token(&mut self) -> Result<Option<u32>, BackendError> {
            Ok(self.0.next().map(u32::from))
        }
    }

    #[test]
    fn test_split_multibyte_char_keeps_prefix_chain() {
        // The first batch ends between the two bytes of 'é'
        let mut bytes = b"abc".to_vec();
        bytes.extend_from_slice("é".as_bytes());
        bytes.extend_from_slice(b"defghijklmno");

        let descriptor = crate::catalog::find_model(LLAMA).unwrap();
        let handle = ModelHandle::new(Arc::new(ByteModel), descriptor);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = run_session(
            Uuid::new_v4(),
            handle,
            Box::new(ByteStream(bytes.into_iter())),
            GenerationOptions::default(),
            CancellationToken::new(),
            tx,
        )
        .unwrap();

        let mut partials = Vec::new();
        while let Ok(partial) = rx.try_recv() {
            partials.push(partial);
        }

        assert_eq!(outcome.text, "abcédefghijklmno");
        assert_eq!(outcome.finish, FinishReason::Stop);
        assert_eq!(
            partials,
            vec!["abc", "abcédef", "abcédefghij", "abcédefghijklmn", "abcédefghijklmno"]
        );
        assert!(partials
            .iter()
            .all(|p| !p.contains(char::REPLACEMENT_CHARACTER)));
    }

    #[test]
    fn test_backend_error_type_is_mapped() {
        let err = BackendError::Inference("kv cache overflow".into()).into_generation_error();
        assert_eq!(
            err.to_string(),
            "Generation failed (backend): Inference error: kv cache overflow"
        );
    }
}
