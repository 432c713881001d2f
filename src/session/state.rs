use crate::error::CallError;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::time::Duration;

/// Lifecycle of one test call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AcquiringPermission,
    Connecting,
    Active,
    Ended,
    Failed(CallError),
}

impl SessionState {
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (AcquiringPermission, Connecting) | (Connecting, Active) => true,
            (AcquiringPermission | Connecting | Active, Ended | Failed(_)) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AcquiringPermission => "acquiring_permission",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Failed(_) => "failed",
        }
    }

    pub fn error(&self) -> Option<&CallError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "failed ({})", e),
            other => f.write_str(other.name()),
        }
    }
}

impl Serialize for SessionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Backend session backing a call
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    /// Resolved transport endpoint
    pub ws_url: String,
    pub max_duration: Duration,
    pub created_at: DateTime<Utc>,
}
