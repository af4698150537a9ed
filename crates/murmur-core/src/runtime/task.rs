use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::types::{
    CoreError, ErrorInfo, Fingerprint, TaskId, TaskStatus, VoiceParams,
};

/// Metadata about the audio artifact of a completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMeta {
    pub sample_rate: u32,
    /// Size of the raw PCM payload in bytes.
    pub byte_len: u64,
    pub duration_secs: f64,
}

/// The unit of work: one text to synthesize, tracked from submission to a
/// terminal status.
///
/// Field mutation goes through the `mark_*` / `begin_attempt` methods, which
/// reject any transition the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub input_text: String,
    pub params: VoiceParams,
    pub fingerprint: Fingerprint,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub result_ref: Option<String>,
    pub error_info: Option<ErrorInfo>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub custom_label: Option<String>,
    /// Label of the backend/device that processed the task.
    pub device: Option<String>,
    pub audio: Option<AudioMeta>,
    /// Most recent retryable failure while a retry is pending.
    pub last_error: Option<ErrorInfo>,
    /// Eligible-at of the pending retry, if any.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a fresh `queued` task. `input_text` must already be normalized.
    pub fn new(
        input_text: String,
        params: VoiceParams,
        custom_label: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let fingerprint = Fingerprint::compute(&input_text, &params);
        Self {
            id: TaskId::generate(),
            input_text,
            params,
            fingerprint,
            status: TaskStatus::Queued,
            attempt_count: 0,
            result_ref: None,
            error_info: None,
            submitted_at: now,
            started_at: None,
            completed_at: None,
            custom_label,
            device: None,
            audio: None,
            last_error: None,
            next_attempt_at: None,
        }
    }

    fn invalid(&self, operation: &'static str) -> CoreError {
        CoreError::InvalidState {
            task_id: self.id.clone(),
            status: self.status,
            operation,
        }
    }

    /// Claim the task for one synthesis attempt.
    ///
    /// A `queued` task moves to `processing`; a `processing` task (waiting
    /// for a retry) stays there. `expected_attempts` must equal the attempt
    /// count recorded when the task was queued, so a stale queue entry can
    /// never run the same attempt twice.
    pub fn begin_attempt(
        &mut self,
        expected_attempts: u32,
        device: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if self.attempt_count != expected_attempts {
            return Err(self.invalid("claim"));
        }
        match self.status {
            TaskStatus::Queued => {
                self.status = TaskStatus::Processing;
                self.started_at = Some(now);
            }
            TaskStatus::Processing if self.next_attempt_at.is_some() => {
                self.next_attempt_at = None;
            }
            _ => return Err(self.invalid("claim")),
        }
        self.attempt_count += 1;
        self.device = Some(device.to_owned());
        Ok(())
    }

    /// Record a retryable failure; the task stays `processing`.
    pub fn schedule_retry(
        &mut self,
        error: ErrorInfo,
        eligible_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if self.status != TaskStatus::Processing {
            return Err(self.invalid("retry"));
        }
        self.last_error = Some(error);
        self.next_attempt_at = Some(eligible_at);
        Ok(())
    }

    pub fn mark_completed(
        &mut self,
        result_ref: String,
        audio: AudioMeta,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        self.transition(TaskStatus::Completed, "complete", now)?;
        self.result_ref = Some(result_ref);
        self.audio = Some(audio);
        self.last_error = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: ErrorInfo, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.transition(TaskStatus::Failed, "fail", now)?;
        self.error_info = Some(error);
        self.last_error = None;
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.transition(TaskStatus::Cancelled, "cancel", now)
    }

    fn transition(
        &mut self,
        next: TaskStatus,
        operation: &'static str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(self.invalid(operation));
        }
        self.status = next;
        self.next_attempt_at = None;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }
}
