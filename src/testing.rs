//! In-process test doubles for the transport and inference capabilities

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::catalog::ModelDescriptor;
use crate::download::transport::{ArtifactTransport, ByteProgress, TransportError};
use crate::loader::backend::{BackendError, InferenceBackend, LoadProgress, LoadedModel, TokenStream};

/// Writes a small fake artifact in a few chunks
pub struct MockTransport {
    payload_len: u64,
    chunks: u64,
    delay: Duration,
    failures: Mutex<VecDeque<TransportError>>,
    fetches: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            payload_len: 4096,
            chunks: 4,
            delay: Duration::ZERO,
            failures: Mutex::new(VecDeque::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Sleep before each chunk (cancellable)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `times` fetches with `error`
    pub fn fail_times(self, times: usize, error: TransportError) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.extend(std::iter::repeat(error).take(times));
        }
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactTransport for MockTransport {
    async fn fetch(
        &self,
        _model: &'static ModelDescriptor,
        dest: &Path,
        on_progress: ByteProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let failure = self.failures.lock().ok().and_then(|mut f| f.pop_front());
        if let Some(error) = failure {
            return Err(error);
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| TransportError::Storage(e.to_string()))?;

        let chunk = vec![0u8; (self.payload_len / self.chunks) as usize];
        let mut written = 0;
        on_progress(0, self.payload_len);

        for _ in 0..self.chunks {
            if self.delay.is_zero() {
                if cancel.is_cancelled() {
                    return Err(TransportError::Cancelled);
                }
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(self.delay) => {}
                }
            }

            file.write_all(&chunk)
                .await
                .map_err(|e| TransportError::Storage(e.to_string()))?;
            written += chunk.len() as u64;
            on_progress(written, self.payload_len);
        }

        file.flush()
            .await
            .map_err(|e| TransportError::Storage(e.to_string()))?;
        Ok(written)
    }
}

/// Inference backend producing the token sequence 0, 1, 2, ... which decodes
/// to "w0 w1 w2 ..."
pub struct MockBackend {
    load_delay: Duration,
    start_delay: Duration,
    token_delay: Duration,
    stop_after: Option<usize>,
    error_after: Option<usize>,
    pending_failures: Mutex<VecDeque<BackendError>>,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    clears: AtomicUsize,
    cache_limit: AtomicU64,
    events: Arc<Mutex<Vec<String>>>,
    last_prompt: Arc<Mutex<Option<String>>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            load_delay: Duration::ZERO,
            start_delay: Duration::ZERO,
            token_delay: Duration::ZERO,
            stop_after: None,
            error_after: None,
            pending_failures: Mutex::new(VecDeque::new()),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
            cache_limit: AtomicU64::new(0),
            events: Arc::new(Mutex::new(Vec::new())),
            last_prompt: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Block the caller of `start` before the stream is returned
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Sleep on the blocking thread before each token
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Emit the stop signal after `tokens` tokens
    pub fn stop_after(mut self, tokens: usize) -> Self {
        self.stop_after = Some(tokens);
        self
    }

    /// Fail mid-stream after `tokens` tokens
    pub fn error_after(mut self, tokens: usize) -> Self {
        self.error_after = Some(tokens);
        self
    }

    pub fn fail_next_load(&self, error: BackendError) {
        if let Ok(mut failures) = self.pending_failures.lock() {
            failures.push_back(error);
        }
    }

    /// Number of load attempts, failed ones included
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub fn cache_limit(&self) -> u64 {
        self.cache_limit.load(Ordering::SeqCst)
    }

    /// "load <id>" / "unload <id>" / "end <id>" (a token stream dropped) in
    /// call order
    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().ok().and_then(|p| p.clone())
    }

    fn record(&self, event: String) {
        record(&self.events, event);
    }
}

fn record(events: &Mutex<Vec<String>>, event: String) {
    if let Ok(mut events) = events.lock() {
        events.push(event);
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn load(
        &self,
        model: &'static ModelDescriptor,
        _path: &Path,
        on_progress: LoadProgress<'_>,
    ) -> Result<Arc<dyn LoadedModel>, BackendError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.record(format!("load {}", model.id));

        on_progress(0.25);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }

        let failure = self.pending_failures.lock().ok().and_then(|mut f| f.pop_front());
        if let Some(error) = failure {
            return Err(error);
        }
        on_progress(1.0);

        Ok(Arc::new(MockModel {
            id: model.id.to_string(),
            start_delay: self.start_delay,
            token_delay: self.token_delay,
            stop_after: self.stop_after,
            error_after: self.error_after,
            last_prompt: Arc::clone(&self.last_prompt),
            events: Arc::clone(&self.events),
        }))
    }

    async fn unload(&self, model: Arc<dyn LoadedModel>) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        self.record(format!("unload {}", model.model_id()));
    }

    fn set_cache_limit(&self, bytes: u64) {
        self.cache_limit.store(bytes, Ordering::SeqCst);
    }

    fn clear_cache(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockModel {
    id: String,
    start_delay: Duration,
    token_delay: Duration,
    stop_after: Option<usize>,
    error_after: Option<usize>,
    last_prompt: Arc<Mutex<Option<String>>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl LoadedModel for MockModel {
    fn model_id(&self) -> &str {
        &self.id
    }

    fn start(
        &self,
        prompt: &str,
        _seed: u64,
        _max_tokens: usize,
    ) -> Result<Box<dyn TokenStream>, BackendError> {
        if let Ok(mut last) = self.last_prompt.lock() {
            *last = Some(prompt.to_string());
        }
        if !self.start_delay.is_zero() {
            std::thread::sleep(self.start_delay);
        }
        Ok(Box::new(MockStream {
            model_id: self.id.clone(),
            events: Arc::clone(&self.events),
            next: 0,
            token_delay: self.token_delay,
            stop_after: self.stop_after,
            error_after: self.error_after,
        }))
    }

    fn decode(&self, tokens: &[u32]) -> String {
        tokens.iter().map(|t| format!("w{} ", t)).collect()
    }
}

struct MockStream {
    model_id: String,
    events: Arc<Mutex<Vec<String>>>,
    next: usize,
    token_delay: Duration,
    stop_after: Option<usize>,
    error_after: Option<usize>,
}

impl TokenStream for MockStream {
    fn next_token(&mut self) -> Result<Option<u32>, BackendError> {
        if self.error_after.is_some_and(|n| self.next >= n) {
            return Err(BackendError::Inference("mock stream failure".to_string()));
        }
        if self.stop_after.is_some_and(|n| self.next >= n) {
            return Ok(None);
        }
        if !self.token_delay.is_zero() {
            std::thread::sleep(self.token_delay);
        }
        let token = self.next as u32;
        self.next += 1;
        Ok(Some(token))
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        record(&self.events, format!("end {}", self.model_id));
    }
}
