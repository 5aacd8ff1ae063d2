use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::agents::backend::{parse_fragment, GenerationBackend, LineStream};
use crate::agents::events::StreamEvent;
use crate::agents::phase_splitter::PhaseSplitter;
use crate::agents::prompt::PromptBuilder;
use crate::error::{log_error, AppError, Result};
use crate::index::Retriever;
use crate::models::ContextSource;

// ============================================================================
// CANCELLATION TOKEN
// ============================================================================

#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// True when both handles belong to the same request.
    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// REQUEST MANAGER
// ============================================================================

/// Live requests by id. Callers may reuse an id, so one id can name several
/// running requests; cancelling it cancels all of them.
#[derive(Default)]
pub struct RequestManager {
    active_requests: RwLock<HashMap<String, Vec<CancellationToken>>>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, request_id: String) -> CancellationToken {
        let token = CancellationToken::new();
        let mut requests = self.active_requests.write().await;
        requests.entry(request_id).or_default().push(token.clone());
        token
    }

    pub async fn cancel(&self, request_id: &str) -> bool {
        let requests = self.active_requests.read().await;
        match requests.get(request_id) {
            Some(tokens) if !tokens.is_empty() => {
                tokens.iter().for_each(CancellationToken::cancel);
                true
            }
            _ => false,
        }
    }

    /// Drops only `token`; other requests sharing the id stay registered.
    pub async fn unregister(&self, request_id: &str, token: &CancellationToken) {
        let mut requests = self.active_requests.write().await;
        if let Some(tokens) = requests.get_mut(request_id) {
            tokens.retain(|t| !t.same_as(token));
            if tokens.is_empty() {
                requests.remove(request_id);
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active_requests.read().await.values().map(Vec::len).sum()
    }
}

// ============================================================================
// AGENT
// ============================================================================

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub top_k: usize,
    pub context_limit: usize,
    pub stream_delay: Duration,
    pub channel_capacity: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            top_k: 3,
            context_limit: 800,
            stream_delay: Duration::from_millis(30),
            channel_capacity: 100,
        }
    }
}

/// Events of one request, in emission order.
pub struct RequestStream {
    pub request_id: String,
    pub events: mpsc::Receiver<StreamEvent>,
}

/// How a streamed request ended, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed { events: usize },
    /// The model produced no text at all.
    Empty,
    Cancelled { events: usize },
    Disconnected { events: usize },
    Failed { events: usize },
}

pub struct RagAgent {
    backend: Arc<dyn GenerationBackend>,
    prompt_builder: PromptBuilder,
    request_manager: Arc<RequestManager>,
    settings: AgentSettings,
}

impl RagAgent {
    pub fn new(backend: Arc<dyn GenerationBackend>, settings: AgentSettings) -> Self {
        Self {
            backend,
            prompt_builder: PromptBuilder::new(settings.context_limit),
            request_manager: Arc::new(RequestManager::new()),
            settings,
        }
    }

    pub fn request_manager(&self) -> &Arc<RequestManager> {
        &self.request_manager
    }

    /// Retrieve, prompt and start streaming.
    ///
    /// Errors returned here happen before any event exists: index not ready,
    /// retrieval failure or a rejected backend call. Once this returns `Ok`,
    /// the request runs on its own task until the stream ends, the caller
    /// disconnects or the request is cancelled.
    pub async fn handle_request_stream(
        &self,
        retriever: Arc<dyn Retriever>,
        request_id: String,
        query: &str,
    ) -> Result<RequestStream> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::validation("Prompt must not be empty"));
        }

        let passages = retriever.search(query, self.settings.top_k).await?;
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));

        if passages.is_empty() {
            log::info!("[{}] no passages retrieved, sending refusal", request_id);
            if let Err(e) = tx.try_send(StreamEvent::refusal()) {
                log::warn!("[{}] refusal not queued: {}", request_id, e);
            }
            return Ok(RequestStream {
                request_id,
                events: rx,
            });
        }

        log::info!("[{}] retrieved {} passages", request_id, passages.len());
        let prompt = self.prompt_builder.build(query, &passages);
        let lines = self.backend.generate(&prompt).await?;

        let sources: Vec<ContextSource> = passages.iter().map(ContextSource::from).collect();
        let token = self.request_manager.register(request_id.clone()).await;
        let request_manager = self.request_manager.clone();
        let delay = self.settings.stream_delay;
        let task_request_id = request_id.clone();

        tokio::spawn(async move {
            let splitter = PhaseSplitter::new(sources);
            let outcome = pump_fragments(lines, splitter, tx, token.clone(), delay).await;
            match outcome {
                StreamOutcome::Empty => {
                    log::warn!("[{}] backend produced no output", task_request_id)
                }
                other => log::info!("[{}] stream finished: {:?}", task_request_id, other),
            }
            request_manager.unregister(&task_request_id, &token).await;
        });

        Ok(RequestStream {
            request_id,
            events: rx,
        })
    }

    pub async fn cancel_request(&self, request_id: &str) -> bool {
        self.request_manager.cancel(request_id).await
    }
}

/// Drive one request: read backend lines, step the splitter, forward events.
async fn pump_fragments(
    mut lines: LineStream,
    mut splitter: PhaseSplitter,
    tx: mpsc::Sender<StreamEvent>,
    token: CancellationToken,
    delay: Duration,
) -> StreamOutcome {
    let mut failed = false;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return StreamOutcome::Cancelled { events: splitter.events_emitted() };
            }
            _ = tx.closed() => {
                return StreamOutcome::Disconnected { events: splitter.events_emitted() };
            }
            next = lines.next() => next,
        };

        let line = match next {
            None => break,
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                log_error(&e);
                failed = true;
                break;
            }
        };

        let Some(fragment) = parse_fragment(&line) else {
            continue;
        };
        if let Some(error) = fragment.error {
            log::warn!("Generation backend reported: {}", error);
            break;
        }

        // Empty text (e.g. the closing `done` record) changes nothing.
        if !fragment.response.is_empty() {
            if let Some(event) = splitter.push(&fragment.response) {
                if tx.send(event).await.is_err() {
                    return StreamOutcome::Disconnected { events: splitter.events_emitted() };
                }
            }
        }
        if fragment.done {
            break;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    // Text received before a transport failure is still delivered.
    if let Some(event) = splitter.finish() {
        if tx.send(event).await.is_err() {
            return StreamOutcome::Disconnected { events: splitter.events_emitted() };
        }
    }

    match (failed, splitter.events_emitted()) {
        (true, events) => StreamOutcome::Failed { events },
        (false, 0) => StreamOutcome::Empty,
        (false, events) => StreamOutcome::Completed { events },
    }
}

// ============================================================================
// TESTS
// ============================================================================
