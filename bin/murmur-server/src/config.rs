//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;
use std::time::Duration;

use murmur_core::{
    AzureConfig, BackendConfig, ConfigError, Credential, Device, GcpConfig, LocalConfig,
    OrchestratorConfig, Provider, ProviderConfig, RetryPolicy,
};

/// Runtime configuration for murmur-server.
///
/// Everything except remote provider credentials has a default, so the
/// server starts with the local speech command and no variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// sqlx SQLite URL (default: `"sqlite://murmur.db?mode=rwc"`).
    pub database_url: String,

    /// Directory the WAV files are written to (default: `"audio"`).
    pub audio_dir: PathBuf,

    /// `tracing` filter string, e.g. `"info"` or `"debug,sqlx=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// When set, logs are also written to a daily rolling file here.
    pub log_dir: Option<PathBuf>,

    /// Largest accepted request body, in bytes.
    pub max_body_bytes: usize,

    pub orchestrator: OrchestratorConfig,
    pub backend: BackendConfig,
}

impl Config {
    /// Build [`Config`] from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build [`Config`] from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let provider = Provider::parse(&env.or("MURMUR_TTS_PROVIDER", "local"))?;
        let backend = BackendConfig {
            supported_languages: env.list("MURMUR_LANGUAGES").unwrap_or_else(|| vec!["fi".into()]),
            provider: provider_config(provider, &env)?,
        };

        let defaults = OrchestratorConfig::default();
        let retry_defaults = RetryPolicy::default();
        let orchestrator = OrchestratorConfig {
            workers: env.parse("MURMUR_WORKERS", provider.default_workers()),
            queue_capacity: env.parse("MURMUR_QUEUE_CAPACITY", defaults.queue_capacity),
            max_text_chars: env.parse("MURMUR_MAX_TEXT_CHARS", defaults.max_text_chars),
            max_label_chars: defaults.max_label_chars,
            max_batch_items: env.parse("MURMUR_MAX_BATCH_ITEMS", defaults.max_batch_items),
            retry: RetryPolicy {
                max_attempts: env.parse("MURMUR_MAX_ATTEMPTS", retry_defaults.max_attempts),
                base_delay: env.millis("MURMUR_RETRY_BASE_MS", retry_defaults.base_delay),
                max_delay: env.millis("MURMUR_RETRY_MAX_MS", retry_defaults.max_delay),
            },
            shutdown_grace: Duration::from_secs(
                env.parse("MURMUR_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace.as_secs()),
            ),
        };

        Ok(Self {
            bind_address: env.or("MURMUR_BIND", "0.0.0.0:3000"),
            database_url: env.or("MURMUR_DATABASE_URL", "sqlite://murmur.db?mode=rwc"),
            audio_dir: PathBuf::from(env.or("MURMUR_AUDIO_DIR", "audio")),
            log_level: env.or("MURMUR_LOG", "info"),
            log_json: env.flag("MURMUR_LOG_JSON"),
            log_dir: env.get("MURMUR_LOG_DIR").map(PathBuf::from),
            max_body_bytes: env.parse("MURMUR_MAX_BODY_BYTES", 1024 * 1024),
            orchestrator,
            backend,
        })
    }
}

fn provider_config(provider: Provider, env: &Env<'_>) -> Result<ProviderConfig, ConfigError> {
    let config = match provider {
        Provider::Local => {
            let mut local = LocalConfig::default();
            if let Some(program) = env.get("MURMUR_LOCAL_COMMAND") {
                local.program = program;
            }
            if let Some(args) = env.get("MURMUR_LOCAL_ARGS") {
                local.args = args.split_whitespace().map(str::to_owned).collect();
            }
            if let Some(device) = env.get("MURMUR_DEVICE") {
                local.device = device.parse::<Device>()?;
            }
            local.default_voice = env.get("MURMUR_LOCAL_VOICE");
            if let Some(voices) = env.list("MURMUR_LOCAL_VOICES") {
                local.voices = voices;
            }
            ProviderConfig::Local(local)
        }
        Provider::Azure => {
            let mut azure = AzureConfig::new(
                env.or("MURMUR_AZURE_REGION", ""),
                Credential::new(env.or("MURMUR_AZURE_KEY", "")),
            );
            azure.endpoint = env.get("MURMUR_AZURE_ENDPOINT");
            if let Some(voices) = env.list("MURMUR_AZURE_VOICES") {
                azure.voices = voices;
            }
            azure.sample_rate = env.parse("MURMUR_AZURE_SAMPLE_RATE", azure.sample_rate);
            azure.max_chars_per_request =
                env.parse("MURMUR_MAX_CHARS_PER_REQUEST", azure.max_chars_per_request);
            azure.timeout = env.millis("MURMUR_HTTP_TIMEOUT_MS", azure.timeout);
            ProviderConfig::Azure(azure)
        }
        Provider::Gcp => {
            let mut gcp = GcpConfig::new(Credential::new(env.or("MURMUR_GCP_API_KEY", "")));
            if let Some(endpoint) = env.get("MURMUR_GCP_ENDPOINT") {
                gcp.endpoint = endpoint;
            }
            if let Some(voices) = env.list("MURMUR_GCP_VOICES") {
                gcp.voices = voices;
            }
            gcp.sample_rate = env.parse("MURMUR_GCP_SAMPLE_RATE", gcp.sample_rate);
            gcp.speaking_rate = env.parse("MURMUR_GCP_SPEAKING_RATE", gcp.speaking_rate);
            gcp.pitch = env.parse("MURMUR_GCP_PITCH", gcp.pitch);
            gcp.volume_gain_db = env.parse("MURMUR_GCP_VOLUME_GAIN_DB", gcp.volume_gain_db);
            gcp.max_chars_per_request =
                env.parse("MURMUR_MAX_CHARS_PER_REQUEST", gcp.max_chars_per_request);
            gcp.timeout = env.millis("MURMUR_HTTP_TIMEOUT_MS", gcp.timeout);
            ProviderConfig::Gcp(gcp)
        }
    };
    Ok(config)
}

// ── private helpers ──────────────────────────────────────────────────────────

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    /// Non-blank value of `key`.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_owned())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Comma-separated list; `None` when unset or empty.
    fn list(&self, key: &str) -> Option<Vec<String>> {
        let items: Vec<String> = self
            .get(key)?
            .split(',')
            .map(|item| item.trim().to_owned())
            .filter(|item| !item.is_empty())
            .collect();
        (!items.is_empty()).then_some(items)
    }
}
