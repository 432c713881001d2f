use thiserror::Error;

/// Errors that end a test call.
///
/// Every variant is terminal for the session it occurs in. A fresh call has to
/// be started explicitly, which re-runs microphone acquisition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("No audio device found: {0}")]
    DeviceNotFound(String),

    #[error("Audio capture unsupported: {0}")]
    CaptureUnsupported(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Agent error: {0}")]
    BackendError(String),

    #[error("Session request failed: {0}")]
    SessionRequest(String),

    #[error("Audio output error: {0}")]
    Playback(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CallError {
    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "permission_denied",
            Self::DeviceNotFound(_) => "device_not_found",
            Self::CaptureUnsupported(_) => "capture_unsupported",
            Self::TransportFailure(_) => "transport_failure",
            Self::BackendError(_) => "backend_error",
            Self::SessionRequest(_) => "session_request",
            Self::Playback(_) => "playback",
            Self::Config(_) => "config",
        }
    }
}

pub type Result<T, E = CallError> = std::result::Result<T, E>;
