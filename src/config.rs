use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `VOICE_CONSOLE__BACKEND__BASE_URL`
const ENV_PREFIX: &str = "VOICE_CONSOLE";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub session: SessionDefaults,
    pub transport: TransportConfig,
    pub audio: AudioConfig,
    pub speech: SpeechConfig,
    pub http: HttpConfig,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the console REST API
    pub base_url: String,
    /// Path (relative to `base_url`) of the test-call session resource
    pub sessions_path: String,
    /// Bearer token sent with session requests
    pub auth_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            sessions_path: "test-calls/sessions".to_string(),
            auth_token: None,
        }
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("sessions_path", &self.sessions_path)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    /// Used when the backend does not grant an explicit max duration
    pub default_max_duration_secs: u64,
    /// Agent to call when none is given on the command line
    pub agent_id: Option<String>,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            default_max_duration_secs: 300,
            agent_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub keepalive_interval_secs: u64,
    /// Format tag attached to outbound audio frames (omitted when empty)
    pub audio_format: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 20,
            audio_format: "pcm16le".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Samples per outbound frame
    pub block_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { block_size: 4096 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// Local text-to-speech program; the utterance is passed as the last argument
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        let program = if cfg!(target_os = "macos") { "say" } else { "espeak-ng" };
        Self {
            program: program.to_string(),
            args: Vec::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 7410,
        }
    }
}

impl Config {
    /// Load configuration from an optional file (extension optional) and
    /// `VOICE_CONSOLE__*` environment variables
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path.to_string_lossy()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let config: Self = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.base_url.trim().is_empty() {
            anyhow::bail!("backend.base_url must not be empty");
        }
        if self.audio.block_size == 0 {
            anyhow::bail!("audio.block_size must be greater than zero");
        }
        if self.session.default_max_duration_secs == 0 {
            anyhow::bail!("session.default_max_duration_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.transport.keepalive_interval_secs.max(1))
    }
}
