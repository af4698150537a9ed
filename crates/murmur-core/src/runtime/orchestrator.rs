use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

use crate::backend::SpeechBackend;
use crate::runtime::admission::WorkerSlots;
use crate::runtime::dedup::DedupIndex;
use crate::runtime::dispatcher::{self, DispatchCommand, Dispatcher, QueueEntry, Shared};
use crate::runtime::retry::RetryPolicy;
use crate::runtime::storage::{TaskFilter, TaskStore};
use crate::runtime::task::Task;
use crate::runtime::types::{
    CoreError, Fingerprint, TaskId, TaskStatus, VoiceParams, normalize_text,
};
use crate::sink::AudioSink;

/// Tunables for [`Orchestrator::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Maximum number of concurrent synthesis attempts.
    pub workers: usize,
    /// Maximum number of tasks waiting for a worker before `submit` answers
    /// with [`CoreError::QueueFull`].
    pub queue_capacity: usize,
    /// Maximum length of the normalized text, in characters.
    pub max_text_chars: usize,
    pub max_label_chars: usize,
    pub max_batch_items: usize,
    pub retry: RetryPolicy,
    /// How long [`Orchestrator::shutdown`] waits for running attempts.
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            queue_capacity: 1024,
            max_text_chars: 10_000,
            max_label_chars: 255,
            max_batch_items: 100,
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Point-in-time counters reported by [`Orchestrator::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Entries waiting for a worker, retries in backoff included.
    pub queue_depth: usize,
    /// Entries waiting out a retry backoff.
    pub retry_pending: usize,
    /// Attempts currently running on a worker.
    pub in_flight: usize,
    pub workers: usize,
    pub backend: String,
    pub device: String,
}

struct Inner {
    config: OrchestratorConfig,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<DispatchCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Public entry point of the runtime.
///
/// Accepts submissions, collapses duplicates through the [`DedupIndex`],
/// answers status queries from the [`TaskStore`] and forwards work to the
/// dispatch loop, which alone mutates task records after creation.
///
/// # Usage
///
/// ```rust,ignore
/// let orchestrator = Orchestrator::start(config, backend, store, sink).await?;
/// let task = orchestrator.submit("Hello world", VoiceParams::default(), None).await?;
/// let task = orchestrator.get_status(&task.id).await?;
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("backend", &self.inner.shared.backend.name())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Start the orchestrator.
    ///
    /// Rebuilds the dedup index from the store, re-queues unfinished tasks
    /// and spawns the dispatch loop.
    pub async fn start(
        config: OrchestratorConfig,
        backend: Arc<dyn SpeechBackend>,
        store: Arc<dyn TaskStore>,
        sink: Arc<dyn AudioSink>,
    ) -> Result<Self, CoreError> {
        let shared = Arc::new(Shared {
            backend,
            store,
            sink,
            dedup: DedupIndex::new(),
            retry: config.retry.clone(),
            slots: WorkerSlots::new(config.workers),
            pending: AtomicUsize::new(0),
            delayed: AtomicUsize::new(0),
        });

        let recovered = dispatcher::recover(&shared).await?;
        if !recovered.ready.is_empty() || !recovered.delayed.is_empty() || recovered.failed > 0 {
            info!(
                requeued = recovered.ready.len(),
                retrying = recovered.delayed.len(),
                failed = recovered.failed,
                "recovered unfinished tasks"
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(Arc::clone(&shared), rx, tx.downgrade(), recovered);
        let handle = tokio::spawn(dispatcher.run().in_current_span());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                shared,
                tx,
                handle: Mutex::new(Some(handle)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Submit one text for synthesis.
    ///
    /// Returns the existing task when an identical submission is still
    /// `queued` or `processing`; otherwise creates and queues a new one.
    pub async fn submit(
        &self,
        text: &str,
        params: VoiceParams,
        custom_label: Option<String>,
    ) -> Result<Task, CoreError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CoreError::Shutdown);
        }
        let text = self.validate(text, &params, custom_label.as_deref())?;
        let fingerprint = Fingerprint::compute(&text, &params);
        let shared = &self.inner.shared;

        // Held until the new task is registered and enqueued.
        let mut dedup = shared.dedup.lock().await;
        if let Some(owner) = dedup.owner(&fingerprint).cloned() {
            match shared.store.get(&owner).await? {
                Some(existing) if existing.status.is_active() => {
                    debug!(task_id = %existing.id, "duplicate submission");
                    return Ok(existing);
                }
                _ => {
                    dedup.evict(&fingerprint);
                }
            }
        }

        // Stamped under the guard so `submitted_at` follows queue order.
        let task = Task::new(text, params, custom_label, Utc::now());
        shared.reserve(self.inner.config.queue_capacity)?;
        if let Err(err) = shared.store.put(task.clone()).await {
            shared.unreserve();
            return Err(err);
        }
        dedup.register(task.fingerprint.clone(), task.id.clone());

        let command = DispatchCommand::Enqueue {
            entry: QueueEntry {
                task_id: task.id.clone(),
                expected_attempts: 0,
            },
            eligible_at: None,
        };
        let sent = self.inner.tx.send(command);
        drop(dedup);
        if sent.is_err() {
            // Left `queued` in the store; recovery picks it up on restart.
            shared.unreserve();
            return Err(CoreError::Shutdown);
        }

        info!(
            task_id = %task.id,
            language = %task.params.language,
            chars = task.input_text.chars().count(),
            "task queued"
        );
        Ok(task)
    }

    /// Submit every text independently; one result per input, in order.
    ///
    /// Fails as a whole only when the batch is empty or too large.
    pub async fn submit_batch(
        &self,
        texts: &[String],
        params: VoiceParams,
    ) -> Result<Vec<Result<Task, CoreError>>, CoreError> {
        if texts.is_empty() {
            return Err(CoreError::Validation("batch must not be empty".into()));
        }
        let max = self.inner.config.max_batch_items;
        if texts.len() > max {
            return Err(CoreError::Validation(format!(
                "batch has {} items, maximum is {max}",
                texts.len()
            )));
        }

        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.submit(text, params.clone(), None).await);
        }
        Ok(results)
    }

    pub async fn get_status(&self, id: &TaskId) -> Result<Task, CoreError> {
        self.inner
            .shared
            .store
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound {
                task_id: id.clone(),
            })
    }

    /// Tasks matching `filter`, oldest submission first.
    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, CoreError> {
        self.inner.shared.store.list(filter).await
    }

    /// Cancel a task that is still `queued`.
    pub async fn cancel(&self, id: &TaskId) -> Result<Task, CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .tx
            .send(DispatchCommand::Cancel {
                task_id: id.clone(),
                reply_tx,
            })
            .map_err(|_| CoreError::Shutdown)?;
        reply_rx.await.map_err(|_| CoreError::Shutdown)?
    }

    pub fn supported_languages(&self) -> &[String] {
        self.inner.shared.backend.supported_languages()
    }

    pub async fn stats(&self) -> Result<OrchestratorStats, CoreError> {
        let shared = &self.inner.shared;
        let tasks = shared.store.list(TaskFilter::default()).await?;

        let mut stats = OrchestratorStats {
            total: tasks.len(),
            queue_depth: shared.pending.load(Ordering::SeqCst),
            retry_pending: shared.delayed.load(Ordering::SeqCst),
            in_flight: shared.slots.in_flight(),
            workers: shared.slots.capacity(),
            backend: shared.backend.name().to_owned(),
            device: shared.backend.device().to_owned(),
            ..Default::default()
        };
        for task in &tasks {
            match task.status {
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    /// Stop dispatching and wait up to `shutdown_grace` for running
    /// attempts. Tasks that never reached a worker stay `queued`.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.tx.send(DispatchCommand::Shutdown);
        if let Some(handle) = self.inner.handle.lock().await.take() {
            let _ = handle.await;
        }

        let grace = self.inner.config.shutdown_grace;
        if self.inner.shared.slots.drain(grace).await {
            info!("orchestrator stopped");
        } else {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "shutdown grace elapsed with attempts still running"
            );
        }
    }

    /// Normalize `text` and check every submission limit.
    fn validate(
        &self,
        text: &str,
        params: &VoiceParams,
        custom_label: Option<&str>,
    ) -> Result<String, CoreError> {
        let config = &self.inner.config;
        let text = normalize_text(text);
        if text.is_empty() {
            return Err(CoreError::Validation("text must not be empty".into()));
        }
        let chars = text.chars().count();
        if chars > config.max_text_chars {
            return Err(CoreError::Validation(format!(
                "text has {chars} characters, maximum is {}",
                config.max_text_chars
            )));
        }

        if custom_label.is_some_and(|l| l.chars().count() > config.max_label_chars) {
            return Err(CoreError::Validation(format!(
                "custom_label exceeds {} characters",
                config.max_label_chars
            )));
        }

        if !self
            .supported_languages()
            .iter()
            .any(|l| l == &params.language)
        {
            return Err(CoreError::Validation(format!(
                "unsupported language '{}'",
                params.language
            )));
        }
        if let Some(voice) = params.voice.as_deref() {
            if voice.trim().is_empty() {
                return Err(CoreError::Validation("voice must not be blank".into()));
            }
            self.inner
                .shared
                .backend
                .check_voice(voice)
                .map_err(CoreError::Validation)?;
        }
        Ok(text)
    }
}
