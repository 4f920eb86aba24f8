//! Generation Scheduler: the only path into the synthesis gateway.
//!
//! Submissions land on a FIFO queue drained by one dedicated worker thread,
//! so inferences never overlap and are serviced in submission order. Each
//! caller awaits its own reply with a bounded wait.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::backends::SynthesisRequest;
use crate::config_loader::SUPPORTED_LANGUAGES;
use crate::error::{Error, Result};
use crate::gateway::SynthesisGateway;
use crate::profiles::ProfileStore;

/// What a caller asks for: speak `text` in the voice of `profile_id`
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub profile_id: String,
    pub text: String,
    pub language: String,
}

impl GenerationRequest {
    pub fn new(profile_id: &str, text: &str, language: &str) -> Self {
        Self {
            profile_id: profile_id.to_string(),
            text: text.to_string(),
            language: language.to_string(),
        }
    }
}

struct Job {
    ticket: u64,
    profile_id: String,
    request: SynthesisRequest,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

pub struct GenerationScheduler {
    queue: mpsc::UnboundedSender<Job>,
    store: Arc<ProfileStore>,
    max_wait: Duration,
    pending: Arc<AtomicUsize>,
    next_ticket: AtomicU64,
}

impl GenerationScheduler {
    /// Spawn the worker. It exits once the scheduler is dropped and the
    /// queue has drained.
    pub fn start(
        gateway: Arc<SynthesisGateway>,
        store: Arc<ProfileStore>,
        max_wait: Duration,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_store = store.clone();
        let worker_pending = pending.clone();
        std::thread::Builder::new()
            .name("synthesis-worker".to_string())
            .spawn(move || run_worker(rx, gateway, worker_store, worker_pending))?;

        Ok(Self {
            queue: tx,
            store,
            max_wait,
            pending,
            next_ticket: AtomicU64::new(1),
        })
    }

    /// Requests queued or in flight
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub async fn submit(&self, request: GenerationRequest) -> Result<Vec<u8>> {
        self.submit_with_timeout(request, self.max_wait).await
    }

    /// Queue one generation and wait for its audio.
    ///
    /// References are resolved here, against the committed registry, so the
    /// worker never reads a profile that is being rewritten.
    pub async fn submit_with_timeout(
        &self,
        request: GenerationRequest,
        max_wait: Duration,
    ) -> Result<Vec<u8>> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(Error::Validation("text must not be empty".to_string()));
        }
        let language = request.language.trim().to_lowercase();
        if !SUPPORTED_LANGUAGES.contains(&language.as_str()) {
            return Err(Error::Validation(format!(
                "unsupported language '{}'",
                request.language
            )));
        }

        let profile = self.store.get(&request.profile_id)?;
        let references = self.store.sample_paths(&profile);
        if references.is_empty() {
            return Err(Error::InsufficientSamples(profile.profile_id));
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            ticket,
            profile_id: profile.profile_id.clone(),
            request: SynthesisRequest {
                references,
                text: text.to_string(),
                language,
            },
            reply: reply_tx,
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(job).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::EngineUnavailable(
                "generation worker has stopped".to_string(),
            ));
        }
        tracing::debug!(ticket, profile_id = %profile.profile_id, queued = self.pending(), "generation queued");

        match tokio::time::timeout(max_wait, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::EngineUnavailable(
                "generation worker dropped the request".to_string(),
            )),
            Err(_) => {
                tracing::warn!(ticket, wait = ?max_wait, "generation wait bound exceeded");
                Err(Error::Timeout(max_wait))
            }
        }
    }
}

fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    gateway: Arc<SynthesisGateway>,
    store: Arc<ProfileStore>,
    pending: Arc<AtomicUsize>,
) {
    tracing::info!("synthesis worker started");

    while let Some(job) = rx.blocking_recv() {
        let Job {
            ticket,
            profile_id,
            request,
            reply,
        } = job;

        // Caller already gave up; do not spend an inference on it
        if reply.is_closed() {
            pending.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(ticket, "skipping abandoned generation");
            continue;
        }

        let start = Instant::now();
        let result = process(&gateway, &store, &profile_id, request);
        pending.fetch_sub(1, Ordering::SeqCst);

        match &result {
            Ok(audio) => {
                tracing::info!(ticket, profile_id = %profile_id, bytes = audio.len(), elapsed = ?start.elapsed(), "generation complete")
            }
            Err(e) => {
                tracing::warn!(ticket, profile_id = %profile_id, error = %e, "generation failed")
            }
        }

        if reply.send(result).is_err() {
            tracing::debug!(ticket, "caller left before the result was ready; discarded");
        }
    }

    tracing::info!("synthesis worker stopped");
}

fn process(
    gateway: &SynthesisGateway,
    store: &ProfileStore,
    profile_id: &str,
    mut request: SynthesisRequest,
) -> Result<Vec<u8>> {
    if !store.contains(profile_id) {
        return Err(Error::StaleProfile(profile_id.to_string()));
    }

    // Samples removed while queued drop out of the conditioning set
    let before = request.references.len();
    request.references.retain(|p: &PathBuf| p.is_file());
    if request.references.is_empty() {
        return Err(Error::InsufficientSamples(profile_id.to_string()));
    }
    if request.references.len() < before {
        tracing::debug!(profile_id, dropped = before - request.references.len(), "references vanished while queued");
    }

    gateway.synthesize(&request)
}
