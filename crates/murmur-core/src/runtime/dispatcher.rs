use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::{UnboundedReceiver, WeakUnboundedSender};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use crate::backend::{SpeechBackend, SynthesizedAudio};
use crate::runtime::admission::{Permit, WorkerSlots};
use crate::runtime::dedup::DedupIndex;
use crate::runtime::retry::{RetryDecision, RetryPolicy};
use crate::runtime::storage::{TaskMutator, TaskStore};
use crate::runtime::task::{AudioMeta, Task};
use crate::runtime::types::{BackendError, CoreError, ErrorInfo, ErrorKind, TaskId, TaskStatus};
use crate::sink::AudioSink;

/// Commands understood by the dispatch loop.
#[derive(Debug)]
pub(crate) enum DispatchCommand {
    /// Make a task available to workers, optionally not before `eligible_at`.
    Enqueue {
        entry: QueueEntry,
        eligible_at: Option<Instant>,
    },
    /// Cancel a queued task. Routed through the loop so the task leaves the
    /// ready queue in the same step that marks it cancelled.
    Cancel {
        task_id: TaskId,
        reply_tx: oneshot::Sender<Result<Task, CoreError>>,
    },
    /// Stop dispatching. Running attempts are left to finish.
    Shutdown,
}

/// One pending synthesis attempt.
///
/// `expected_attempts` is the task's attempt count when the entry was
/// created; a claim with a different count is stale and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub task_id: TaskId,
    pub expected_attempts: u32,
}

#[derive(Debug)]
struct DelayedEntry {
    eligible_at: Instant,
    seq: u64,
    entry: QueueEntry,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.eligible_at == other.eligible_at && self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.eligible_at
            .cmp(&other.eligible_at)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// State shared by the dispatch loop, its workers and the orchestrator handle.
pub(crate) struct Shared {
    pub backend: Arc<dyn SpeechBackend>,
    pub store: Arc<dyn TaskStore>,
    pub sink: Arc<dyn AudioSink>,
    pub dedup: DedupIndex,
    pub retry: RetryPolicy,
    pub slots: WorkerSlots,
    /// Entries waiting for a worker (ready plus delayed), including ones
    /// still in the command channel.
    pub pending: AtomicUsize,
    /// Entries waiting out a retry backoff.
    pub delayed: AtomicUsize,
}

impl Shared {
    /// Reserve a queue position for a new submission unless `capacity`
    /// entries are already waiting.
    pub fn reserve(&self, capacity: usize) -> Result<(), CoreError> {
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| CoreError::QueueFull { capacity })
    }

    pub fn unreserve(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// Work found in the store at startup.
#[derive(Debug, Default)]
pub(crate) struct Recovered {
    pub ready: Vec<QueueEntry>,
    pub delayed: Vec<(QueueEntry, Instant)>,
    pub failed: usize,
}

/// Rebuild the dedup index from the store and collect every non-terminal
/// task that still needs an attempt.
///
/// `queued` tasks go back on the ready queue. A `processing` task with a
/// pending retry keeps its eligible-at. A `processing` task without one was
/// interrupted mid-attempt: it is retried if attempts remain, else failed.
pub(crate) async fn recover(shared: &Shared) -> Result<Recovered, CoreError> {
    let tasks = shared.store.list(Default::default()).await?;
    shared.dedup.rebuild(&tasks).await;

    let mut recovered = Recovered::default();
    for task in tasks.into_iter().filter(|t| t.status.is_active()) {
        let entry = QueueEntry {
            task_id: task.id.clone(),
            expected_attempts: task.attempt_count,
        };
        match (task.status, task.next_attempt_at) {
            (TaskStatus::Queued, _) => recovered.ready.push(entry),
            (TaskStatus::Processing, Some(at)) => {
                let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                recovered.delayed.push((entry, Instant::now() + wait));
            }
            (TaskStatus::Processing, None) => {
                let err = BackendError::transient("attempt interrupted by restart");
                match shared.retry.decide(err.kind, task.attempt_count) {
                    RetryDecision::Retry { delay } => {
                        schedule_retry(shared, &task.id, &err, delay, || false).await?;
                        recovered.delayed.push((entry, Instant::now() + delay));
                    }
                    RetryDecision::Fail => {
                        fail_task(shared, &task, &err, || false).await?;
                        recovered.failed += 1;
                    }
                }
            }
            _ => {}
        }
    }

    shared.pending.fetch_add(
        recovered.ready.len() + recovered.delayed.len(),
        Ordering::SeqCst,
    );
    Ok(recovered)
}

/// The dispatch loop.
///
/// Owns the ready queue (FIFO) and the delayed heap (ordered by eligible-at).
/// Entries move to the ready queue once due, and each ready entry is handed
/// to a worker as soon as a slot is free. A task in backoff never holds a
/// slot.
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    rx: UnboundedReceiver<DispatchCommand>,
    tx: WeakUnboundedSender<DispatchCommand>,
    ready: VecDeque<QueueEntry>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    seq: u64,
}

impl Dispatcher {
    pub fn new(
        shared: Arc<Shared>,
        rx: UnboundedReceiver<DispatchCommand>,
        tx: WeakUnboundedSender<DispatchCommand>,
        recovered: Recovered,
    ) -> Self {
        let mut dispatcher = Self {
            shared,
            rx,
            tx,
            ready: recovered.ready.into_iter().collect(),
            delayed: BinaryHeap::new(),
            seq: 0,
        };
        for (entry, eligible_at) in recovered.delayed {
            dispatcher.push_delayed(entry, eligible_at);
        }
        dispatcher
    }

    pub async fn run(mut self) {
        info!(
            workers = self.shared.slots.capacity(),
            backend = self.shared.backend.name(),
            ready = self.ready.len(),
            delayed = self.delayed.len(),
            "dispatcher started"
        );

        loop {
            self.promote_due();
            let next_due = self.delayed.peek().map(|Reverse(d)| d.eligible_at);

            tokio::select! {
                biased;

                cmd = self.rx.recv() => match cmd {
                    Some(DispatchCommand::Enqueue { entry, eligible_at }) => {
                        self.enqueue(entry, eligible_at);
                    }
                    Some(DispatchCommand::Cancel { task_id, reply_tx }) => {
                        let result = self.cancel(&task_id).await;
                        let _ = reply_tx.send(result);
                    }
                    Some(DispatchCommand::Shutdown) | None => break,
                },

                permit = self.shared.slots.acquire(), if !self.ready.is_empty() => {
                    let Ok(permit) = permit else { break };
                    if let Some(entry) = self.ready.pop_front() {
                        self.shared.unreserve();
                        self.spawn_worker(entry, permit);
                    }
                }

                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)),
                    if next_due.is_some() => {}
            }
        }

        info!(
            left_queued = self.ready.len(),
            left_delayed = self.delayed.len(),
            "dispatcher stopped"
        );
    }

    fn enqueue(&mut self, entry: QueueEntry, eligible_at: Option<Instant>) {
        match eligible_at {
            Some(at) if at > Instant::now() => self.push_delayed(entry, at),
            _ => self.ready.push_back(entry),
        }
    }

    fn push_delayed(&mut self, entry: QueueEntry, eligible_at: Instant) {
        self.seq += 1;
        self.delayed.push(Reverse(DelayedEntry {
            eligible_at,
            seq: self.seq,
            entry,
        }));
        self.shared.delayed.fetch_add(1, Ordering::SeqCst);
    }

    fn promote_due(&mut self) {
        let now = Instant::now();
        while self
            .delayed
            .peek()
            .is_some_and(|Reverse(d)| d.eligible_at <= now)
        {
            if let Some(Reverse(due)) = self.delayed.pop() {
                self.shared.delayed.fetch_sub(1, Ordering::SeqCst);
                self.ready.push_back(due.entry);
            }
        }
    }

    async fn cancel(&mut self, task_id: &TaskId) -> Result<Task, CoreError> {
        let task = self
            .shared
            .store
            .update(task_id, Box::new(|t| t.mark_cancelled(Utc::now())))
            .await?;
        self.shared.dedup.release(&task.fingerprint, &task.id).await;

        if let Some(pos) = self.ready.iter().position(|e| &e.task_id == task_id) {
            self.ready.remove(pos);
            self.shared.unreserve();
        }
        info!(task_id = %task_id, "task cancelled");
        Ok(task)
    }

    fn spawn_worker(&self, entry: QueueEntry, permit: Permit) {
        let shared = Arc::clone(&self.shared);
        let tx = self.tx.clone();
        tokio::spawn(
            async move {
                run_attempt(shared, tx, entry).await;
                drop(permit);
            }
            .in_current_span(),
        );
    }
}

/// Execute one attempt for `entry` and record its outcome.
async fn run_attempt(
    shared: Arc<Shared>,
    tx: WeakUnboundedSender<DispatchCommand>,
    entry: QueueEntry,
) {
    let device = shared.backend.device().to_owned();
    let expected = entry.expected_attempts;
    let claimed = shared
        .store
        .update(
            &entry.task_id,
            Box::new(move |t| t.begin_attempt(expected, &device, Utc::now())),
        )
        .await;

    let task = match claimed {
        Ok(task) => task,
        Err(CoreError::InvalidState { status, .. }) => {
            debug!(task_id = %entry.task_id, %status, "dropping stale queue entry");
            return;
        }
        Err(CoreError::NotFound { .. }) => {
            warn!(task_id = %entry.task_id, "queued task vanished from store");
            return;
        }
        Err(err) => {
            warn!(task_id = %entry.task_id, error = %err, "claim failed; requeueing");
            let delay = shared.retry.base_delay;
            requeue(&shared, &tx, entry, delay);
            return;
        }
    };

    info!(
        task_id = %task.id,
        attempt = task.attempt_count,
        device = shared.backend.device(),
        "task claimed"
    );

    // No lock is held across the backend call.
    let outcome = match shared
        .backend
        .synthesize(&task.input_text, &task.params)
        .await
    {
        Ok(audio) if audio.pcm.is_empty() => {
            Err(BackendError::permanent("backend returned no audio"))
        }
        Ok(audio) => persist(&shared, &task, &audio).await,
        Err(err) => Err(err),
    };

    let keep_trying = || dispatcher_alive(&tx);
    let recorded = match outcome {
        Ok((result_ref, meta)) => {
            complete_task(&shared, &task, result_ref, meta, keep_trying).await
        }
        Err(err) => handle_failure(&shared, &tx, &task, err, keep_trying).await,
    };

    if let Err(err) = recorded {
        error!(
            task_id = %task.id,
            error = %err,
            "failed to record attempt outcome; task is recovered on restart"
        );
    }
}

/// Hand the audio to the sink. A sink error counts as a failed attempt.
async fn persist(
    shared: &Shared,
    task: &Task,
    audio: &SynthesizedAudio,
) -> Result<(String, AudioMeta), BackendError> {
    let result_ref = shared.sink.persist(task, audio).await?;
    let meta = AudioMeta {
        sample_rate: audio.sample_rate,
        byte_len: audio.pcm.len() as u64,
        duration_secs: audio.duration_secs(),
    };
    Ok((result_ref, meta))
}

/// Apply an outcome write to the store.
///
/// Store errors are retried with the retry policy's backoff for as long as
/// `keep_trying` holds, so a task is never left `processing` without a
/// pending retry while the dispatcher runs. Any other error is returned
/// at once.
async fn record(
    shared: &Shared,
    task_id: &TaskId,
    mut mutator: impl FnMut() -> TaskMutator,
    keep_trying: impl Fn() -> bool,
) -> Result<Task, CoreError> {
    let mut failures = 0u32;
    loop {
        match shared.store.update(task_id, mutator()).await {
            Err(CoreError::Store(message)) if keep_trying() => {
                failures += 1;
                let delay = shared.retry.backoff(failures);
                warn!(
                    task_id = %task_id,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "store write failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

/// Whether the dispatch loop still accepts commands.
fn dispatcher_alive(tx: &WeakUnboundedSender<DispatchCommand>) -> bool {
    tx.upgrade().is_some_and(|tx| !tx.is_closed())
}

async fn complete_task(
    shared: &Shared,
    task: &Task,
    result_ref: String,
    meta: AudioMeta,
    keep_trying: impl Fn() -> bool,
) -> Result<(), CoreError> {
    let done = record(
        shared,
        &task.id,
        || {
            let result_ref = result_ref.clone();
            let meta = meta.clone();
            Box::new(move |t: &mut Task| t.mark_completed(result_ref, meta, Utc::now()))
        },
        keep_trying,
    )
    .await?;
    shared.dedup.release(&done.fingerprint, &done.id).await;
    info!(
        task_id = %done.id,
        attempt = done.attempt_count,
        result_ref = done.result_ref.as_deref().unwrap_or_default(),
        "task completed"
    );
    Ok(())
}

async fn handle_failure(
    shared: &Shared,
    tx: &WeakUnboundedSender<DispatchCommand>,
    task: &Task,
    err: BackendError,
    keep_trying: impl Fn() -> bool,
) -> Result<(), CoreError> {
    match shared.retry.decide(err.kind, task.attempt_count) {
        RetryDecision::Retry { delay } => {
            schedule_retry(shared, &task.id, &err, delay, keep_trying).await?;
            warn!(
                task_id = %task.id,
                attempt = task.attempt_count,
                kind = %err.kind,
                delay_ms = delay.as_millis() as u64,
                error = %err.message,
                "attempt failed; retry scheduled"
            );
            let entry = QueueEntry {
                task_id: task.id.clone(),
                expected_attempts: task.attempt_count,
            };
            requeue(shared, tx, entry, delay);
            Ok(())
        }
        RetryDecision::Fail => fail_task(shared, task, &err, keep_trying).await,
    }
}

async fn schedule_retry(
    shared: &Shared,
    task_id: &TaskId,
    err: &BackendError,
    delay: Duration,
    keep_trying: impl Fn() -> bool,
) -> Result<Task, CoreError> {
    let info = ErrorInfo::from(err);
    let eligible_at = Utc::now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    record(
        shared,
        task_id,
        || {
            let info = info.clone();
            Box::new(move |t: &mut Task| t.schedule_retry(info, eligible_at))
        },
        keep_trying,
    )
    .await
}

async fn fail_task(
    shared: &Shared,
    task: &Task,
    err: &BackendError,
    keep_trying: impl Fn() -> bool,
) -> Result<(), CoreError> {
    let info = ErrorInfo::from(err);
    record(
        shared,
        &task.id,
        || {
            let info = info.clone();
            Box::new(move |t: &mut Task| t.mark_failed(info, Utc::now()))
        },
        keep_trying,
    )
    .await?;
    shared.dedup.release(&task.fingerprint, &task.id).await;
    error!(
        task_id = %task.id,
        attempt = task.attempt_count,
        kind = %err.kind,
        permanent = err.kind == ErrorKind::Permanent,
        error = %err.message,
        "task failed"
    );
    Ok(())
}

/// Put `entry` back on the dispatcher, eligible after `delay`.
///
/// If the dispatcher is gone the task stays in the store as it is and is
/// picked up again by recovery on the next start.
fn requeue(
    shared: &Shared,
    tx: &WeakUnboundedSender<DispatchCommand>,
    entry: QueueEntry,
    delay: Duration,
) {
    let Some(tx) = tx.upgrade() else {
        debug!(task_id = %entry.task_id, "dispatcher gone; leaving task for recovery");
        return;
    };
    shared.pending.fetch_add(1, Ordering::SeqCst);
    let command = DispatchCommand::Enqueue {
        entry,
        eligible_at: Some(Instant::now() + delay),
    };
    if tx.send(command).is_err() {
        shared.unreserve();
    }
}
