use crate::audio::{pcm, AudioFrame};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Messages sent to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Audio {
        /// Base64-encoded PCM16LE bytes
        audio: String,
        sample_rate: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
    Ping,
}

impl ClientMessage {
    pub fn audio(frame: &AudioFrame, format: Option<&str>) -> Self {
        Self::Audio {
            audio: base64::engine::general_purpose::STANDARD.encode(pcm::to_le_bytes(&frame.samples)),
            sample_rate: frame.sample_rate,
            format: format.filter(|f| !f.is_empty()).map(str::to_string),
        }
    }
}

/// Messages received from the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Audio { audio: String, sample_rate: u32 },
    TextFallback { text: String },
    Interrupt,
    MaxDurationReached,
    Error {
        #[serde(default)]
        message: String,
    },
    Pong,
}

impl ServerMessage {
    /// Message kind as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Audio { .. } => "AUDIO",
            Self::TextFallback { .. } => "TEXT_FALLBACK",
            Self::Interrupt => "INTERRUPT",
            Self::MaxDurationReached => "MAX_DURATION_REACHED",
            Self::Error { .. } => "ERROR",
            Self::Pong => "PONG",
        }
    }
}

/// Decode the base64 payload of an inbound `AUDIO` message
pub fn decode_audio(audio: &str, sample_rate: u32, sequence: u64) -> Result<AudioFrame, String> {
    if sample_rate == 0 {
        return Err("sample rate must be greater than zero".to_string());
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(audio)
        .map_err(|e| format!("invalid base64 audio: {}", e))?;
    if bytes.len() % 2 != 0 {
        tracing::warn!("Audio payload has an odd byte count ({}), dropping the last byte", bytes.len());
    }
    Ok(AudioFrame {
        samples: pcm::from_le_bytes(&bytes),
        sample_rate,
        sequence,
    })
}
