use murmur_core::{AudioMeta, CoreError, ErrorInfo, Task, VoiceParams};
use serde::{Deserialize, Serialize};

use crate::error::core_status;

#[derive(Debug, Deserialize)]
pub struct ConvertRequest {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub custom_label: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConvertMultipleRequest {
    pub texts: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
}

/// Build voice parameters from the optional request fields.
pub fn voice_params(language: Option<String>, voice: Option<String>) -> VoiceParams {
    VoiceParams {
        language: language.unwrap_or_else(|| VoiceParams::default().language),
        voice,
    }
}

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    /// Newest tasks to return, `1..=1000`.
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub status: String,
    pub input_text: String,
    pub language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    pub custom_label: Option<String>,
    pub attempt_count: u32,
    pub result_ref: Option<String>,
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorInfo>,
    pub device: Option<String>,
    pub audio: Option<AudioMeta>,
    pub submitted_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<String>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id.to_string(),
            status: task.status.to_string(),
            input_text: task.input_text,
            language: task.params.language,
            voice: task.params.voice,
            custom_label: task.custom_label,
            attempt_count: task.attempt_count,
            result_ref: task.result_ref,
            error: task.error_info,
            last_error: task.last_error,
            device: task.device,
            audio: task.audio,
            submitted_at: task.submitted_at.to_rfc3339(),
            started_at: task.started_at.map(|t| t.to_rfc3339()),
            completed_at: task.completed_at.map(|t| t.to_rfc3339()),
            next_attempt_at: task.next_attempt_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ItemError {
    pub code: &'static str,
    pub message: String,
}

/// One entry of a `convert-multiple` response.
#[derive(Debug, Serialize)]
pub struct BatchItemResponse {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
}

impl BatchItemResponse {
    pub fn new(index: usize, result: Result<Task, CoreError>) -> Self {
        match result {
            Ok(task) => Self {
                index,
                task: Some(task.into()),
                error: None,
            },
            Err(e) => {
                let (_, code, message) = core_status(&e);
                Self {
                    index,
                    task: None,
                    error: Some(ItemError { code, message }),
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LanguagesResponse {
    pub languages: Vec<String>,
}

/// Download filename for a task's audio: the custom label when present,
/// reduced to filename-safe characters, with a `.wav` suffix.
pub fn download_filename(task: &Task) -> String {
    let stem: String = task
        .custom_label
        .as_deref()
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(|label| {
            label
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect()
        })
        .unwrap_or_else(|| format!("tts_{}", task.id));
    if stem.ends_with(".wav") {
        stem
    } else {
        format!("{stem}.wav")
    }
}
