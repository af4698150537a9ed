use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::backend::SpeechBackend;
use crate::backend::azure::{AzureBackend, AzureConfig};
use crate::backend::gcp::{GcpBackend, GcpConfig};
use crate::backend::local::{CommandModel, LocalBackend, LocalConfig};

/// Invalid or incomplete backend configuration. The process refuses to start.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown TTS provider '{0}' (expected local, azure or gcp)")]
    UnknownProvider(String),

    #[error("at least one supported language must be configured")]
    NoLanguages,

    #[error("missing required setting: {0}")]
    MissingSetting(&'static str),

    #[error("{0} voice pool is empty")]
    EmptyVoicePool(&'static str),

    #[error("{provider} does not support a sample rate of {sample_rate} Hz")]
    UnsupportedSampleRate {
        provider: &'static str,
        sample_rate: u32,
    },

    #[error("invalid device '{0}' (expected auto, cpu or cuda[:N])")]
    InvalidDevice(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// The closed set of synthesis providers.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Provider {
    Local,
    Azure,
    #[strum(to_string = "gcp", serialize = "google")]
    Gcp,
}

impl Provider {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::UnknownProvider(value.to_owned()))
    }

    /// Worker pool size when none is configured: one per CPU core for the
    /// device-bound local provider, more for network-bound remote ones.
    pub fn default_workers(self) -> usize {
        match self {
            Provider::Local => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            Provider::Azure | Provider::Gcp => 8,
        }
    }
}

/// Provider-specific settings.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderConfig {
    Local(LocalConfig),
    Azure(AzureConfig),
    Gcp(GcpConfig),
}

impl ProviderConfig {
    pub fn provider(&self) -> Provider {
        match self {
            ProviderConfig::Local(_) => Provider::Local,
            ProviderConfig::Azure(_) => Provider::Azure,
            ProviderConfig::Gcp(_) => Provider::Gcp,
        }
    }
}

/// Everything needed to construct the active backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    /// Language codes accepted by submissions, e.g. `["fi"]`.
    pub supported_languages: Vec<String>,
    pub provider: ProviderConfig,
}

/// A secret string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Credential(<empty>)")
        } else {
            f.write_str("Credential(<redacted>)")
        }
    }
}

/// Build the one backend this process will use.
pub fn select_backend(config: &BackendConfig) -> Result<Arc<dyn SpeechBackend>, ConfigError> {
    let languages: Vec<String> = config
        .supported_languages
        .iter()
        .map(|l| l.trim().to_owned())
        .filter(|l| !l.is_empty())
        .collect();
    if languages.is_empty() {
        return Err(ConfigError::NoLanguages);
    }

    let backend: Arc<dyn SpeechBackend> = match &config.provider {
        ProviderConfig::Local(local) => {
            let model = CommandModel::new(local.clone())?;
            let device = model.device();
            Arc::new(
                LocalBackend::new(Box::new(model), device, languages)
                    .with_voices(local.voices.clone()),
            )
        }
        ProviderConfig::Azure(azure) => Arc::new(AzureBackend::new(azure.clone(), languages)?),
        ProviderConfig::Gcp(gcp) => Arc::new(GcpBackend::new(gcp.clone(), languages)?),
    };

    info!(
        provider = %config.provider.provider(),
        device = backend.device(),
        languages = ?backend.supported_languages(),
        "speech backend selected"
    );
    Ok(backend)
}
