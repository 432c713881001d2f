use crate::session::{CallHandle, CallOutcome};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Starts a call with the given agent id
pub type CallStarter = dyn Fn(&str) -> anyhow::Result<CallHandle> + Send + Sync;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub start_call: Arc<CallStarter>,

    /// Agent used when a start request names none
    pub default_agent: Option<String>,

    /// Latest call, live or finished
    pub current: Arc<RwLock<Option<CallHandle>>>,
}

impl AppState {
    pub fn new(start_call: Arc<CallStarter>, default_agent: Option<String>) -> Self {
        Self {
            start_call,
            default_agent,
            current: Arc::new(RwLock::new(None)),
        }
    }

    /// The current call, if it has not finished yet
    pub async fn live_call(&self) -> Option<CallHandle> {
        let current = self.current.read().await;
        current.as_ref().filter(|call| !call.is_finished()).cloned()
    }

    /// End the live call, if any, and wait for its teardown
    pub async fn end_live_call(&self) -> Option<CallOutcome> {
        let call = self.live_call().await?;
        info!("Ending call {}", call.id());
        call.end();

        let outcome = call.wait().await;
        if outcome.is_none() {
            warn!("Call {} stopped without an outcome", call.id());
        }
        outcome
    }
}
