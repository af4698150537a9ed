use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Unique identifier for a submitted synthesis task.
///
/// A UUIDv7 rendered as a string: the leading bits are a millisecond
/// timestamp, so lexical order follows submission order, and the tail is
/// random.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Lifecycle state of a task.
///
/// ```text
/// queued ──► processing ──► completed
///    │                 └──► failed
///    └──► cancelled
/// ```
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// `completed`, `failed` and `cancelled` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// A task in an active status owns its fingerprint in the dedup index.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Processing)
                | (TaskStatus::Queued, TaskStatus::Cancelled)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
        )
    }
}

/// Classification of a backend failure; drives the retry policy.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Network, timeout, rate limit.
    Transient,
    /// Invalid input, unsupported language, rejected credentials.
    Permanent,
    /// Device or memory pressure.
    ResourceExhausted,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }
}

/// Failure reason recorded on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&BackendError> for ErrorInfo {
    fn from(err: &BackendError) -> Self {
        Self {
            kind: err.kind,
            message: err.message.clone(),
        }
    }
}

/// Parameters that affect the synthesized audio and therefore the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoiceParams {
    /// Short language code as accepted by the backend, e.g. `"fi"`.
    pub language: String,
    /// Explicit voice name; `None` lets the backend choose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl VoiceParams {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            voice: None,
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self::new("fi")
    }
}

/// Deterministic digest of a submission's semantic inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// `normalized_text` must already have gone through [`normalize_text`].
    pub fn compute(normalized_text: &str, params: &VoiceParams) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalized_text.as_bytes());
        hasher.update([0u8]);
        hasher.update(params.language.as_bytes());
        hasher.update([0u8]);
        hasher.update(params.voice.as_deref().unwrap_or_default().as_bytes());
        let digest = hasher.finalize();

        let mut hex = String::with_capacity(64);
        for byte in digest.as_slice() {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Trim and collapse every whitespace run to a single space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Failure reported by a backend adapter (or the audio sink).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} backend error: {message}")]
pub struct BackendError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Errors returned synchronously by the orchestrator and the task store.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Bad input; never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced task does not exist.
    #[error("task not found: {task_id}")]
    NotFound { task_id: TaskId },

    /// The requested transition is not allowed from the task's current status.
    #[error("cannot {operation} task {task_id} while it is {status}")]
    InvalidState {
        task_id: TaskId,
        status: TaskStatus,
        operation: &'static str,
    },

    /// Too many tasks are waiting for a worker.
    #[error("dispatch queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The task store failed to read or write.
    #[error("task store error: {0}")]
    Store(String),

    /// The dispatcher has stopped accepting work.
    #[error("orchestrator is shut down")]
    Shutdown,
}
