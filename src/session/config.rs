use crate::config::Config;
use crate::transport::TransportOptions;
use std::time::Duration;

/// Settings for one test call
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Used when the backend grants no max duration (or zero)
    pub default_max_duration: Duration,

    /// Samples per outbound frame
    pub block_size: usize,

    pub transport: TransportOptions,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            default_max_duration: Duration::from_secs(300),
            block_size: 4096,
            transport: TransportOptions::default(),
        }
    }
}

impl From<&Config> for CallConfig {
    fn from(config: &Config) -> Self {
        let audio_format = config.transport.audio_format.trim();
        Self {
            default_max_duration: Duration::from_secs(config.session.default_max_duration_secs),
            block_size: config.audio.block_size,
            transport: TransportOptions {
                keepalive_interval: config.keepalive_interval(),
                audio_format: (!audio_format.is_empty()).then(|| audio_format.to_string()),
            },
        }
    }
}

impl CallConfig {
    /// Max duration to enforce for a grant carrying `granted` seconds
    pub fn max_duration(&self, granted: Option<u64>) -> Duration {
        match granted {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => self.default_max_duration,
        }
    }
}
