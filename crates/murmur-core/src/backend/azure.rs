//! Azure Cognitive Services text-to-speech over REST.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::backend::http::{self, DEFAULT_TIMEOUT};
use crate::backend::selector::{ConfigError, Credential};
use crate::backend::{
    SpeechBackend, SynthesizedAudio, chunk_text, locale_for, pick_voice, synthesize_chunks,
};
use crate::runtime::types::{BackendError, VoiceParams};

const PROVIDER: &str = "azure";
const DEVICE: &str = "azure-speech-api";

/// Settings for [`AzureBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureConfig {
    pub region: String,
    pub subscription_key: Credential,
    /// Full synthesis URL; derived from `region` when unset.
    pub endpoint: Option<String>,
    /// Voices picked from when a submission names none.
    pub voices: Vec<String>,
    /// One of 8000, 16000, 24000 or 48000.
    pub sample_rate: u32,
    pub max_chars_per_request: usize,
    pub timeout: Duration,
}

impl AzureConfig {
    pub fn new(region: impl Into<String>, subscription_key: Credential) -> Self {
        Self {
            region: region.into(),
            subscription_key,
            endpoint: None,
            voices: vec![
                "fi-FI-HarriNeural".into(),
                "fi-FI-NooraNeural".into(),
                "fi-FI-SelmaNeural".into(),
            ],
            sample_rate: 24_000,
            max_chars_per_request: 4500,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub struct AzureBackend {
    client: Client,
    url: String,
    key: Credential,
    voices: Vec<String>,
    output_format: &'static str,
    sample_rate: u32,
    max_chars: usize,
    languages: Vec<String>,
}

impl AzureBackend {
    pub fn new(config: AzureConfig, languages: Vec<String>) -> Result<Self, ConfigError> {
        if config.subscription_key.is_empty() {
            return Err(ConfigError::MissingSetting("azure subscription key"));
        }
        let url = match config.endpoint {
            Some(endpoint) if !endpoint.trim().is_empty() => endpoint,
            _ if config.region.trim().is_empty() => {
                return Err(ConfigError::MissingSetting("azure region"));
            }
            _ => format!(
                "https://{}.tts.speech.microsoft.com/cognitiveservices/v1",
                config.region.trim()
            ),
        };
        if config.voices.is_empty() {
            return Err(ConfigError::EmptyVoicePool(PROVIDER));
        }
        let output_format = match config.sample_rate {
            8_000 => "raw-8khz-16bit-mono-pcm",
            16_000 => "raw-16khz-16bit-mono-pcm",
            24_000 => "raw-24khz-16bit-mono-pcm",
            48_000 => "raw-48khz-16bit-mono-pcm",
            other => {
                return Err(ConfigError::UnsupportedSampleRate {
                    provider: PROVIDER,
                    sample_rate: other,
                });
            }
        };
        let client = http::build_client(config.timeout)
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            url,
            key: config.subscription_key,
            voices: config.voices,
            output_format,
            sample_rate: config.sample_rate,
            max_chars: config.max_chars_per_request.max(1),
            languages,
        })
    }

    async fn request(&self, ssml: String) -> Result<SynthesizedAudio, BackendError> {
        let resp = self
            .client
            .post(&self.url)
            .header("Ocp-Apim-Subscription-Key", self.key.expose())
            .header("Content-Type", "application/ssml+xml")
            .header("X-Microsoft-OutputFormat", self.output_format)
            .body(ssml)
            .send()
            .await
            .map_err(|e| http::classify_transport(PROVIDER, &e))?;
        let resp = http::check_status(PROVIDER, resp).await?;
        let pcm = resp
            .bytes()
            .await
            .map_err(|e| http::classify_transport(PROVIDER, &e))?;
        Ok(SynthesizedAudio::new(pcm, self.sample_rate))
    }
}

#[async_trait]
impl SpeechBackend for AzureBackend {
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
            None => pick_voice(text, &self.voices)
                .ok_or_else(|| BackendError::permanent("no azure voice configured"))?,
        };
        let chunks = chunk_text(text, self.max_chars);
        debug!(voice, chunks = chunks.len(), "azure synthesis");

        let this = self;
        synthesize_chunks(&chunks, move |chunk| {
            this.request(build_ssml(chunk, &locale, voice))
        })
        .await
    }
}

fn build_ssml(text: &str, locale: &str, voice: &str) -> String {
    format!(
        "<speak version='1.0' xml:lang='{locale}'><voice xml:lang='{locale}' name='{}'>{}</voice></speak>",
        escape_xml(voice),
        escape_xml(text)
    )
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::runtime::types::ErrorKind;

    fn config(server: &MockServer) -> AzureConfig {
        AzureConfig {
            endpoint: Some(format!("{}/cognitiveservices/v1", server.uri())),
            max_chars_per_request: 12,
            ..AzureConfig::new("westeurope", Credential::new("secret-key"))
        }
    }

    fn backend(server: &MockServer) -> AzureBackend {
        AzureBackend::new(config(server), vec!["fi".into()]).expect("backend")
    }

    #[test]
    fn ssml_escapes_text() {
        let ssml = build_ssml("a < b & 'c'", "fi-FI", "fi-FI-NooraNeural");
        assert!(ssml.contains("a &lt; b &amp; &apos;c&apos;"));
        assert!(ssml.contains("name='fi-FI-NooraNeural'"));
        assert!(ssml.contains("xml:lang='fi-FI'"));
    }

    #[test]
    fn rejects_unsupported_sample_rate_and_missing_key() {
        let mut cfg = AzureConfig::new("westeurope", Credential::new("k"));
        cfg.sample_rate = 22_050;
        assert!(matches!(
            AzureBackend::new(cfg, vec!["fi".into()]),
            Err(ConfigError::UnsupportedSampleRate { .. })
        ));

        let cfg = AzureConfig::new("westeurope", Credential::new(""));
        assert!(matches!(
            AzureBackend::new(cfg, vec!["fi".into()]),
            Err(ConfigError::MissingSetting(_))
        ));
    }

    #[tokio::test]
    async fn posts_ssml_and_concatenates_chunks() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cognitiveservices/v1"))
            .and(header("Ocp-Apim-Subscription-Key", "secret-key"))
            .and(header("X-Microsoft-OutputFormat", "raw-24khz-16bit-mono-pcm"))
            .and(body_string_contains("fi-FI-HarriNeural"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 0, 2, 0]))
            .expect(2)
            .mount(&server)
            .await;

        let audio = backend(&server)
            .synthesize(
                "Hyvää huomenta",
                &VoiceParams::new("fi").with_voice("fi-FI-HarriNeural"),
            )
            .await
            .expect("synthesize");

        assert_eq!(audio.sample_rate, 24_000);
        assert_eq!(audio.pcm.len(), 8);
    }

    #[tokio::test]
    async fn throttling_is_transient_and_bad_request_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("kiire"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("huono"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad ssml"))
            .mount(&server)
            .await;

        let backend = backend(&server);
        let params = VoiceParams::default();

        let err = backend.synthesize("kiire", &params).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);

        let err = backend.synthesize("huono", &params).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Permanent);
        assert!(err.message.contains("bad ssml"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        let mut cfg = AzureConfig::new("westeurope", Credential::new("k"));
        cfg.endpoint = Some("http://127.0.0.1:9/cognitiveservices/v1".into());
        cfg.timeout = Duration::from_secs(2);
        let backend = AzureBackend::new(cfg, vec!["fi".into()]).expect("backend");

        let err = backend
            .synthesize("hei", &VoiceParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
    }
}
