use serde::Serialize;
use tracing::{info, warn};

/// Teardown steps in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStep {
    EndNotify,
    CaptureStop,
    TrackStop,
    ContextClose,
    TransportClose,
}

impl TeardownStep {
    pub const ORDER: [TeardownStep; 5] = [
        TeardownStep::EndNotify,
        TeardownStep::CaptureStop,
        TeardownStep::TrackStop,
        TeardownStep::ContextClose,
        TeardownStep::TransportClose,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum StepOutcome {
    Ok,
    Failed(String),
    /// The resource was never acquired
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub steps: Vec<(TeardownStep, StepOutcome)>,
}

impl TeardownReport {
    /// Record the result of `step`; `None` means it had nothing to release
    pub fn record(&mut self, step: TeardownStep, result: Option<anyhow::Result<()>>) {
        let outcome = match result {
            None => StepOutcome::Skipped,
            Some(Ok(())) => {
                info!("Teardown {:?} done", step);
                StepOutcome::Ok
            }
            Some(Err(e)) => {
                warn!("Teardown {:?} failed: {:#}", step, e);
                StepOutcome::Failed(format!("{:#}", e))
            }
        };
        self.steps.push((step, outcome));
    }

    pub fn order(&self) -> Vec<TeardownStep> {
        self.steps.iter().map(|(step, _)| *step).collect()
    }

    pub fn outcome(&self, step: TeardownStep) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|(s, _)| *s == step)
            .map(|(_, outcome)| outcome)
    }

    /// True when no step failed
    pub fn is_clean(&self) -> bool {
        !self
            .steps
            .iter()
            .any(|(_, outcome)| matches!(outcome, StepOutcome::Failed(_)))
    }
}
