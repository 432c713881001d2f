use super::state::SessionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use tracing::info;

/// Latency milestones of one call.
///
/// Each milestone is written once; later writes are ignored.
#[derive(Debug, Clone, Default)]
pub struct LatencyMetrics {
    transport_open: Option<Instant>,
    first_inbound: Option<Instant>,
    last_inbound: Option<Instant>,
    inbound_frames: u64,
}

impl LatencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_transport_open(&mut self, at: Instant) {
        if self.transport_open.is_none() {
            self.transport_open = Some(at);
        }
    }

    /// Count an inbound frame; returns true for the first one
    pub fn record_inbound(&mut self, at: Instant) -> bool {
        self.inbound_frames += 1;
        self.last_inbound = Some(at);

        if self.first_inbound.is_some() {
            return false;
        }
        self.first_inbound = Some(at);

        if let Some(open) = self.transport_open {
            info!(
                "First agent audio {}ms after transport open",
                at.saturating_duration_since(open).as_millis()
            );
        }
        true
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let since_open = |at: Option<Instant>| {
            self.transport_open
                .zip(at)
                .map(|(open, at)| at.saturating_duration_since(open).as_millis() as u64)
        };

        LatencySnapshot {
            transport_open: self.transport_open.is_some(),
            first_inbound_ms: since_open(self.first_inbound),
            last_inbound_ms: since_open(self.last_inbound),
            inbound_frames: self.inbound_frames,
        }
    }
}

/// Latency milestones in milliseconds since transport open
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LatencySnapshot {
    pub transport_open: bool,
    pub first_inbound_ms: Option<u64>,
    pub last_inbound_ms: Option<u64>,
    pub inbound_frames: u64,
}

/// Point-in-time view of a call, published on every change
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: uuid::Uuid,
    pub agent_id: String,
    pub state: SessionState,
    /// Human-readable failure, set once the call has failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: u64,
    pub max_duration_secs: Option<u64>,
    pub latency: LatencySnapshot,
}

impl CallSnapshot {
    pub fn new(call_id: uuid::Uuid, agent_id: impl Into<String>) -> Self {
        Self {
            call_id,
            agent_id: agent_id.into(),
            state: SessionState::AcquiringPermission,
            error: None,
            session_id: None,
            started_at: Utc::now(),
            elapsed_secs: 0,
            max_duration_secs: None,
            latency: LatencySnapshot::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_inbound_recorded_once() {
        let open = Instant::now();
        let mut metrics = LatencyMetrics::new();
        metrics.mark_transport_open(open);

        assert!(metrics.record_inbound(open + Duration::from_millis(120)));
        assert!(!metrics.record_inbound(open + Duration::from_millis(200)));
        assert!(!metrics.record_inbound(open + Duration::from_millis(260)));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.first_inbound_ms, Some(120));
        assert_eq!(snapshot.last_inbound_ms, Some(260));
        assert_eq!(snapshot.inbound_frames, 3);
    }

    #[test]
    fn test_transport_open_is_write_once() {
        let open = Instant::now();
        let mut metrics = LatencyMetrics::new();
        metrics.mark_transport_open(open);
        metrics.mark_transport_open(open + Duration::from_secs(5));
        metrics.record_inbound(open + Duration::from_millis(40));

        assert_eq!(metrics.snapshot().first_inbound_ms, Some(40));
    }

    #[test]
    fn test_no_latency_before_open() {
        let mut metrics = LatencyMetrics::new();
        metrics.record_inbound(Instant::now());
        let snapshot = metrics.snapshot();
        assert!(!snapshot.transport_open);
        assert_eq!(snapshot.first_inbound_ms, None);
        assert_eq!(snapshot.inbound_frames, 1);
    }
}
