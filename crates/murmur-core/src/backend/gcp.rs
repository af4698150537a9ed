//! Google Cloud Text-to-Speech over REST.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::http::{self, DEFAULT_TIMEOUT};
use crate::backend::selector::{ConfigError, Credential};
use crate::backend::{
    SpeechBackend, SynthesizedAudio, chunk_text, locale_for, pick_voice, synthesize_chunks,
};
use crate::runtime::types::{BackendError, VoiceParams};

const PROVIDER: &str = "gcp";
const DEVICE: &str = "google-tts-api";
const DEFAULT_ENDPOINT: &str = "https://texttospeech.googleapis.com";

const CHIRP3_HD_VOICES: &[&str] = &[
    "Achernar",
    "Achird",
    "Algenib",
    "Algieba",
    "Alnilam",
    "Aoede",
    "Autonoe",
    "Callirrhoe",
    "Charon",
    "Despina",
    "Enceladus",
    "Erinome",
    "Fenrir",
    "Gacrux",
    "Iapetus",
    "Kore",
    "Laomedeia",
    "Leda",
    "Orus",
    "Puck",
    "Pulcherrima",
    "Rasalgethi",
    "Sadachbia",
    "Sadaltager",
    "Schedar",
    "Sulafat",
    "Umbriel",
    "Vindemiatrix",
    "Zephyr",
    "Zubenelgenubi",
];

/// The default Finnish voice pool: one WaveNet voice plus every Chirp3-HD voice.
pub fn default_voices() -> Vec<String> {
    std::iter::once("fi-FI-Wavenet-B".to_owned())
        .chain(
            CHIRP3_HD_VOICES
                .iter()
                .map(|name| format!("fi-FI-Chirp3-HD-{name}")),
        )
        .collect()
}

/// Settings for [`GcpBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct GcpConfig {
    pub api_key: Credential,
    /// Base URL; `/v1/text:synthesize` is appended.
    pub endpoint: String,
    pub voices: Vec<String>,
    pub sample_rate: u32,
    pub speaking_rate: f32,
    pub pitch: f32,
    pub volume_gain_db: f32,
    pub max_chars_per_request: usize,
    pub timeout: Duration,
}

impl GcpConfig {
    pub fn new(api_key: Credential) -> Self {
        Self {
            api_key,
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            voices: default_voices(),
            sample_rate: 24_000,
            speaking_rate: 1.0,
            pitch: 0.0,
            volume_gain_db: 0.0,
            max_chars_per_request: 4500,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    input: TextInput<'a>,
    voice: VoiceSelection<'a>,
    #[serde(rename = "audioConfig")]
    audio_config: AudioConfig,
}

#[derive(Serialize)]
struct TextInput<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceSelection<'a> {
    language_code: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioConfig {
    audio_encoding: &'static str,
    sample_rate_hertz: u32,
    speaking_rate: f32,
    pitch: f32,
    volume_gain_db: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    audio_content: String,
}

pub struct GcpBackend {
    client: Client,
    url: String,
    key: Credential,
    config: GcpConfig,
    languages: Vec<String>,
}

impl GcpBackend {
    pub fn new(config: GcpConfig, languages: Vec<String>) -> Result<Self, ConfigError> {
        if config.api_key.is_empty() {
            return Err(ConfigError::MissingSetting("gcp api key"));
        }
        if config.voices.is_empty() {
            return Err(ConfigError::EmptyVoicePool(PROVIDER));
        }
        if !(8_000..=48_000).contains(&config.sample_rate) {
            return Err(ConfigError::UnsupportedSampleRate {
                provider: PROVIDER,
                sample_rate: config.sample_rate,
            });
        }
        let client = http::build_client(config.timeout)
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        let url = format!("{}/v1/text:synthesize", config.endpoint.trim_end_matches('/'));

        Ok(Self {
            client,
            url,
            key: config.api_key.clone(),
            config,
            languages,
        })
    }

    async fn request(
        &self,
        text: &str,
        locale: &str,
        voice: &str,
    ) -> Result<SynthesizedAudio, BackendError> {
        let body = SynthesizeRequest {
            input: TextInput { text },
            voice: VoiceSelection {
                language_code: locale,
                name: voice,
            },
            audio_config: AudioConfig {
                audio_encoding: "LINEAR16",
                sample_rate_hertz: self.config.sample_rate,
                speaking_rate: self.config.speaking_rate,
                pitch: self.config.pitch,
                volume_gain_db: self.config.volume_gain_db,
            },
        };

        let resp = self
            .client
            .post(&self.url)
            .header("x-goog-api-key", self.key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| http::classify_transport(PROVIDER, &e))?;
        let resp = http::check_status(PROVIDER, resp).await?;
        let payload: SynthesizeResponse = resp
            .json()
            .await
            .map_err(|e| http::classify_transport(PROVIDER, &e))?;

        let audio = STANDARD
            .decode(payload.audio_content.as_bytes())
            .map_err(|e| BackendError::permanent(format!("gcp: invalid audioContent: {e}")))?;
        Ok(SynthesizedAudio::new(
            strip_riff_header(audio),
            self.config.sample_rate,
        ))
    }
}

#[async_trait]
impl SpeechBackend for GcpBackend {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn device(&self) -> &str {
        DEVICE
    }

    fn supported_languages(&self) -> &[String] {
        &self.languages
    }

    async fn synthesize(
        &self,
        text: &str,
        params: &VoiceParams,
    ) -> Result<SynthesizedAudio, BackendError> {
        let locale = locale_for(&params.language);
        let voice = match params.voice.as_deref() {
            Some(voice) => voice,
            None => pick_voice(text, &self.config.voices)
                .ok_or_else(|| BackendError::permanent("no gcp voice configured"))?,
        };
        let chunks = chunk_text(text, self.config.max_chars_per_request.max(1));
        debug!(voice, chunks = chunks.len(), "gcp synthesis");

        let this = self;
        synthesize_chunks(&chunks, move |chunk| {
            let chunk = chunk.to_owned();
            let locale = locale.clone();
            async move { this.request(&chunk, &locale, voice).await }
        })
        .await
    }
}

/// LINEAR16 responses arrive as a WAV file; keep only the samples.
fn strip_riff_header(bytes: Vec<u8>) -> Vec<u8> {
    if bytes.len() < 12 || &bytes[..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return bytes;
    }
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        let start = offset + 8;
        if id == b"data" {
            let end = start.saturating_add(size).min(bytes.len());
            return bytes[start..end].to_vec();
        }
        offset = start.saturating_add(size + (size & 1));
    }
    bytes
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::runtime::types::ErrorKind;

    fn wav(samples: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + samples.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&[1, 0, 1, 0]);
        out.extend_from_slice(&24_000u32.to_le_bytes());
        out.extend_from_slice(&48_000u32.to_le_bytes());
        out.extend_from_slice(&[2, 0, 16, 0]);
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(samples.len() as u32).to_le_bytes());
        out.extend_from_slice(samples);
        out
    }

    fn backend(server: &MockServer) -> GcpBackend {
        let config = GcpConfig {
            endpoint: server.uri(),
            ..GcpConfig::new(Credential::new("gcp-key"))
        };
        GcpBackend::new(config, vec!["fi".into()]).expect("backend")
    }

    #[test]
    fn riff_header_is_stripped() {
        assert_eq!(strip_riff_header(wav(&[1, 2, 3, 4])), vec![1, 2, 3, 4]);
        assert_eq!(strip_riff_header(vec![9, 9, 9]), vec![9, 9, 9]);
    }

    #[test]
    fn default_pool_has_wavenet_and_chirp_voices() {
        let voices = default_voices();
        assert_eq!(voices.len(), 31);
        assert_eq!(voices[0], "fi-FI-Wavenet-B");
        assert!(voices.contains(&"fi-FI-Chirp3-HD-Zephyr".to_string()));
    }

    #[tokio::test]
    async fn decodes_linear16_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/text:synthesize"))
            .and(header("x-goog-api-key", "gcp-key"))
            .and(body_partial_json(json!({
                "input": { "text": "Hei maailma" },
                "voice": { "languageCode": "fi-FI", "name": "fi-FI-Wavenet-B" },
                "audioConfig": { "audioEncoding": "LINEAR16", "sampleRateHertz": 24000 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "audioContent": STANDARD.encode(wav(&[5, 0, 6, 0]))
            })))
            .expect(1)
            .mount(&server)
            .await;

        let audio = backend(&server)
            .synthesize(
                "Hei maailma",
                &VoiceParams::new("fi").with_voice("fi-FI-Wavenet-B"),
            )
            .await
            .expect("synthesize");
        assert_eq!(&audio.pcm[..], &[5, 0, 6, 0]);
        assert_eq!(audio.sample_rate, 24_000);
    }

    #[tokio::test]
    async fn server_errors_are_transient_and_garbage_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "input": { "text": "down" } })))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "input": { "text": "garbage" } })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "audioContent": "%%%" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "input": { "text": "denied" } })))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let backend = backend(&server);
        let params = VoiceParams::default();
        assert_eq!(
            backend.synthesize("down", &params).await.unwrap_err().kind,
            ErrorKind::Transient
        );
        assert_eq!(
            backend.synthesize("garbage", &params).await.unwrap_err().kind,
            ErrorKind::Permanent
        );
        assert_eq!(
            backend.synthesize("denied", &params).await.unwrap_err().kind,
            ErrorKind::Permanent
        );
    }
}
