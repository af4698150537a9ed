//! Where finished audio goes.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::backend::SynthesizedAudio;
use crate::runtime::task::Task;
use crate::runtime::types::BackendError;

/// Persists synthesized audio and returns a reference to it.
///
/// Errors use the backend taxonomy so a failed write goes through the same
/// retry policy as a failed synthesis call.
#[async_trait]
pub trait AudioSink: Send + Sync + 'static {
    async fn persist(&self, task: &Task, audio: &SynthesizedAudio) -> Result<String, BackendError>;
}

/// Writes one 16-bit mono WAV file per task: `<dir>/tts_<task id>.wav`.
#[derive(Debug, Clone)]
pub struct WavFileSink {
    dir: PathBuf,
}

impl WavFileSink {
    /// Create the sink, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, task: &Task) -> PathBuf {
        self.dir.join(format!("tts_{}.wav", task.id))
    }
}

#[async_trait]
impl AudioSink for WavFileSink {
    async fn persist(&self, task: &Task, audio: &SynthesizedAudio) -> Result<String, BackendError> {
        let path = self.path_for(task);
        let pcm = audio.pcm.clone();
        let sample_rate = audio.sample_rate;

        let written = path.clone();
        tokio::task::spawn_blocking(move || write_wav(&written, &pcm, sample_rate))
            .await
            .map_err(|e| BackendError::transient(format!("wav writer task failed: {e}")))??;

        debug!(task_id = %task.id, path = %path.display(), "audio persisted");
        Ok(path.to_string_lossy().into_owned())
    }
}

fn write_wav(path: &Path, pcm: &[u8], sample_rate: u32) -> Result<(), BackendError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    // Write to a temporary name so a half-written file is never visible.
    let partial = path.with_extension("wav.part");
    let mut writer = hound::WavWriter::create(&partial, spec).map_err(classify_wav)?;
    for sample in pcm.chunks_exact(2) {
        writer
            .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
            .map_err(classify_wav)?;
    }
    writer.finalize().map_err(classify_wav)?;
    std::fs::rename(&partial, path).map_err(classify_io)
}

fn classify_wav(err: hound::Error) -> BackendError {
    match err {
        hound::Error::IoError(e) => classify_io(e),
        other => BackendError::permanent(format!("cannot encode WAV: {other}")),
    }
}

fn classify_io(err: io::Error) -> BackendError {
    match err.kind() {
        io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded | io::ErrorKind::OutOfMemory => {
            BackendError::resource_exhausted(format!("cannot write audio: {err}"))
        }
        _ => BackendError::transient(format!("cannot write audio: {err}")),
    }
}
