//! Local, device-bound synthesis.
//!
//! A [`LocalModel`] is synchronous and owns the device exclusively, so
//! [`LocalBackend`] keeps it behind a mutex and runs each call on the blocking
//! pool. Workers may call the backend concurrently; calls queue on the mutex.

use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::backend::selector::ConfigError;
use crate::backend::{SpeechBackend, SynthesizedAudio};
use crate::runtime::types::{BackendError, VoiceParams};

/// Device preference for the local model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    /// CUDA device 0 when one is visible, CPU otherwise.
    #[default]
    Auto,
    Cpu,
    Cuda(u32),
}

impl Device {
    /// Replace [`Device::Auto`] with the concrete device to use.
    pub fn resolve(self) -> Device {
        match self {
            Device::Auto => match std::env::var("CUDA_VISIBLE_DEVICES") {
                Ok(v) if !v.trim().is_empty() && v.trim() != "-1" => Device::Cuda(0),
                _ => Device::Cpu,
            },
            other => other,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Auto => f.write_str("auto"),
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

impl FromStr for Device {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "auto" => Ok(Device::Auto),
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|index| index.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| ConfigError::InvalidDevice(other.to_owned())),
        }
    }
}

/// A synchronous speech model with exclusive use of its device.
pub trait LocalModel: Send + 'static {
    fn synthesize(
        &mut self,
        text: &str,
        params: &VoiceParams,
    ) -> Result<SynthesizedAudio, BackendError>;
}

/// Settings for the command-driven local model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    /// Program that reads text on stdin and writes a WAV file to stdout.
    pub program: String,
    /// Arguments; `{language}`, `{voice}` and `{device}` are substituted.
    pub args: Vec<String>,
    pub device: Device,
    /// Voice used when a submission names none.
    pub default_voice: Option<String>,
    /// Voices a submission may name. Empty accepts any plain voice name.
    pub voices: Vec<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            program: "espeak-ng".into(),
            args: vec!["--stdout".into(), "-v".into(), "{language}".into()],
            device: Device::Auto,
            default_voice: None,
            voices: Vec::new(),
        }
    }
}

/// Runs an external speech command once per call.
#[derive(Debug)]
pub struct CommandModel {
    program: String,
    args: Vec<String>,
    device: Device,
    default_voice: Option<String>,
}

impl CommandModel {
    pub fn new(config: LocalConfig) -> Result<Self, ConfigError> {
        if config.program.trim().is_empty() {
            return Err(ConfigError::MissingSetting("local speech command"));
        }
        Ok(Self {
            program: config.program,
            args: config.args,
            device: config.device.resolve(),
            default_voice: config.default_voice,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn render_args(&self, params: &VoiceParams) -> Vec<String> {
        let voice = params
            .voice
            .as_deref()
            .or(self.default_voice.as_deref())
            .unwrap_or(&params.language);
        let device = self.device.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{language}", &params.language)
                    .replace("{voice}", voice)
                    .replace("{device}", &device)
            })
            .collect()
    }
}

impl LocalModel for CommandModel {
    fn synthesize(
        &mut self,
        text: &str,
        params: &VoiceParams,
    ) -> Result<SynthesizedAudio, BackendError> {
        let args = self.render_args(params);
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| classify_io(&self.program, e))?;

        // Feed stdin from a separate thread so a chatty child cannot block on
        // a full stdout pipe while we are still writing.
        let writer = child.stdin.take().map(|mut stdin| {
            let text = text.to_owned();
            std::thread::spawn(move || {
                let _ = stdin.write_all(text.as_bytes());
            })
        });

        let output = child
            .wait_with_output()
            .map_err(|e| classify_io(&self.program, e))?;
        if let Some(writer) = writer {
            let _ = writer.join();
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
            let lower = stderr.to_lowercase();
            return Err(if lower.contains("out of memory") {
                BackendError::resource_exhausted(message)
            } else if output.status.code().is_none() {
                BackendError::transient(message)
            } else {
                BackendError::permanent(message)
            });
        }

        decode_wav(&output.stdout)
    }
}

fn classify_io(program: &str, err: io::Error) -> BackendError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            BackendError::permanent(format!("cannot run {program}: {err}"))
        }
        io::ErrorKind::OutOfMemory => {
            BackendError::resource_exhausted(format!("{program}: {err}"))
        }
        _ => BackendError::transient(format!("{program}: {err}")),
    }
}

/// Read a WAV stream into 16-bit mono PCM.
///
/// Streamed WAV output often carries a placeholder data length, so a stream
/// that ends early is accepted as complete.
fn decode_wav(bytes: &[u8]) -> Result<SynthesizedAudio, BackendError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| BackendError::permanent(format!("unreadable WAV output: {e}")))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => collect_samples(reader.into_samples::<i16>())?,
        (hound::SampleFormat::Int, bits) if bits <= 32 => {
            let bits = u32::from(bits);
            collect_samples(reader.into_samples::<i32>())?
                .into_iter()
                .map(|s| {
                    if bits >= 16 {
                        (s >> (bits - 16)) as i16
                    } else {
                        (s << (16 - bits)) as i16
                    }
                })
                .collect()
        }
        (hound::SampleFormat::Float, 32) => collect_samples(reader.into_samples::<f32>())?
            .into_iter()
            .map(|s| (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16)
            .collect(),
        (format, bits) => {
            return Err(BackendError::permanent(format!(
                "unsupported WAV sample format {format:?}/{bits}"
            )));
        }
    };

    let mut pcm = Vec::with_capacity(samples.len() / channels * 2);
    for frame in samples.chunks(channels) {
        let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
        let mono = (sum / frame.len() as i32) as i16;
        pcm.extend_from_slice(&mono.to_le_bytes());
    }
    Ok(SynthesizedAudio::new(pcm, spec.sample_rate))
}

fn collect_samples<S, R>(samples: hound::WavIntoSamples<R, S>) -> Result<Vec<S>, BackendError>
where
    S: hound::Sample,
    R: Read,
{
    let mut out = Vec::new();
    for sample in samples {
        match sample {
            Ok(s) => out.push(s),
            Err(hound::Error::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                return Err(BackendError::permanent(format!("corrupt WAV output: {e}")));
            }
        }
    }
    Ok(out)
}

/// Whether `voice` can be placed on the command line as-is: no leading `-`,
/// no path separators or `..`, only ASCII letters, digits and `_ - . +`.
fn is_plain_voice_name(voice: &str) -> bool {
    !voice.starts_with('-')
        && !voice.contains("..")
        && voice
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+'))
}

/// [`SpeechBackend`] over a [`LocalModel`].
pub struct LocalBackend {
    model: Arc<Mutex<Box<dyn LocalModel>>>,
    device: String,
    languages: Vec<String>,
    voices: Vec<String>,
}

impl LocalBackend {
    pub fn new(model: Box<dyn LocalModel>, device: Device, languages: Vec<String>) -> Self {
        let device = device.resolve().to_string();
        info!(device = %device, "local speech model ready");
        Self {
            model: Arc::new(Mutex::new(model)),
            device,
            languages,
            voices: Vec::new(),
        }
    }

    /// Restrict caller-supplied voices to `voices`.
    pub fn with_voices(mut self, voices: Vec<String>) -> Self {
        self.voices = voices;
        self
    }
}

#[async_trait]
impl SpeechBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn device(&self) -> &str {
        &self.device
    }

    fn supported_languages(&self) -> &[String] {
        &self.languages
    }

    fn check_voice(&self, voice: &str) -> Result<(), String> {
        if !self.voices.is_empty() {
            if self.voices.iter().any(|v| v == voice) {
                return Ok(());
            }
            return Err(format!("voice '{voice}' is not available"));
        }
        if is_plain_voice_name(voice) {
            Ok(())
        } else {
            Err(format!("voice '{voice}' is not a valid voice name"))
        }
    }

    async fn synthesize(
        &self,
        text: &str,
        params: &VoiceParams,
    ) -> Result<SynthesizedAudio, BackendError> {
        let model = Arc::clone(&self.model);
        let text = text.to_owned();
        let params = params.clone();

        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| BackendError::permanent("local model lock poisoned"))?;
            debug!(chars = text.chars().count(), "local synthesis");
            model.synthesize(&text, &params)
        })
        .await
        .map_err(|e| BackendError::transient(format!("local synthesis task failed: {e}")))?
    }
}
