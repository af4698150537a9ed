//! murmur-core – text-to-speech task orchestration.
//!
//! Callers construct a backend with [`select_backend`], pick a [`TaskStore`]
//! and an [`AudioSink`], and hand all three to [`Orchestrator::start`].
//! Everything after that goes through the orchestrator handle.

pub mod backend;
mod runtime;
pub mod sink;

pub use backend::azure::AzureConfig;
pub use backend::gcp::GcpConfig;
pub use backend::local::{Device, LocalConfig};
pub use backend::selector::{
    BackendConfig, ConfigError, Credential, Provider, ProviderConfig, select_backend,
};
pub use backend::{SpeechBackend, SynthesizedAudio};
pub use runtime::dedup::DedupIndex;
pub use runtime::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorStats};
pub use runtime::retry::{RetryDecision, RetryPolicy};
pub use runtime::storage::{MemoryTaskStore, TaskFilter, TaskMutator, TaskStore};
pub use runtime::task::{AudioMeta, Task};
pub use runtime::types::{
    BackendError, CoreError, ErrorInfo, ErrorKind, Fingerprint, TaskId, TaskStatus, VoiceParams,
    normalize_text,
};
pub use sink::{AudioSink, WavFileSink};
