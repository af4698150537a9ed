//! Speech synthesis backends.
//!
//! Every provider is wrapped in a [`SpeechBackend`]. Exactly one backend is
//! active per process; [`selector::select_backend`] builds it from a
//! [`selector::BackendConfig`] at startup.

pub mod azure;
pub mod gcp;
mod http;
pub mod local;
pub mod selector;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::runtime::types::{BackendError, VoiceParams};

/// Raw audio returned by a backend: 16-bit little-endian mono PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    pub pcm: Bytes,
    pub sample_rate: u32,
}

impl SynthesizedAudio {
    pub fn new(pcm: impl Into<Bytes>, sample_rate: u32) -> Self {
        Self {
            pcm: pcm.into(),
            sample_rate,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        (self.pcm.len() / 2) as f64 / f64::from(self.sample_rate)
    }
}

/// Uniform interface over one synthesis provider.
///
/// `synthesize` may be called concurrently by several workers. A provider
/// that cannot serve concurrent calls serializes them internally.
#[async_trait]
pub trait SpeechBackend: Send + Sync + 'static {
    /// Short provider name, e.g. `"local"`.
    fn name(&self) -> &str;

    /// Label recorded on processed tasks, e.g. `"cuda:0"` or `"azure-speech-api"`.
    fn device(&self) -> &str;

    /// Language codes accepted in [`VoiceParams::language`].
    fn supported_languages(&self) -> &[String];

    /// Reject a caller-supplied [`VoiceParams::voice`] this backend cannot
    /// use safely. Runs before a task is created.
    fn check_voice(&self, _voice: &str) -> Result<(), String> {
        Ok(())
    }

    async fn synthesize(
        &self,
        text: &str,
        params: &VoiceParams,
    ) -> Result<SynthesizedAudio, BackendError>;
}

/// Split `text` on word boundaries into pieces of at most `max_chars`
/// characters. A single word longer than `max_chars` is split inside.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in text.split_whitespace() {
        let mut word = word;
        let mut word_len = word.chars().count();

        while word_len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let split = word
                .char_indices()
                .nth(max_chars)
                .map_or(word.len(), |(i, _)| i);
            chunks.push(word[..split].to_owned());
            word = &word[split..];
            word_len -= max_chars;
        }
        if word.is_empty() {
            continue;
        }

        let needed = if current.is_empty() { word_len } else { word_len + 1 };
        if current_len + needed > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += word_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Pick a voice from `pool` as a function of `text`, so the same text always
/// gets the same voice. `pool` must not be empty.
pub fn pick_voice<'a>(text: &str, pool: &'a [String]) -> Option<&'a str> {
    if pool.is_empty() {
        return None;
    }
    let digest = Sha256::digest(text.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_slice()[..8]);
    let index = u64::from_be_bytes(prefix) % pool.len() as u64;
    pool.get(index as usize).map(String::as_str)
}

/// Expand a short language code to a locale, e.g. `"fi"` → `"fi-FI"`.
/// Codes that already carry a region are returned unchanged.
pub fn locale_for(language: &str) -> String {
    if language.contains('-') {
        language.to_owned()
    } else {
        format!("{}-{}", language.to_lowercase(), language.to_uppercase())
    }
}

/// Synthesize `chunks` one after another and concatenate their PCM.
///
/// All chunks must come back at the same sample rate.
pub(crate) async fn synthesize_chunks<F, Fut>(
    chunks: &[String],
    mut synthesize_one: F,
) -> Result<SynthesizedAudio, BackendError>
where
    F: FnMut(&str) -> Fut,
    Fut: std::future::Future<Output = Result<SynthesizedAudio, BackendError>>,
{
    let mut pcm = BytesMut::new();
    let mut sample_rate = None;
    for chunk in chunks {
        let audio = synthesize_one(chunk).await?;
        match sample_rate {
            None => sample_rate = Some(audio.sample_rate),
            Some(rate) if rate != audio.sample_rate => {
                return Err(BackendError::permanent(format!(
                    "sample rate changed between chunks ({rate} Hz vs {} Hz)",
                    audio.sample_rate
                )));
            }
            Some(_) => {}
        }
        pcm.extend_from_slice(&audio.pcm);
    }
    let sample_rate =
        sample_rate.ok_or_else(|| BackendError::permanent("nothing to synthesize"))?;
    Ok(SynthesizedAudio::new(pcm.freeze(), sample_rate))
}
