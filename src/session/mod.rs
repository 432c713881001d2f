//! Test-call session management
//!
//! The `SessionController` owns one call end to end:
//! - Microphone acquisition and the audio processing context
//! - Backend session start/end over REST
//! - The agent transport and the capture/playback wiring
//! - Elapsed-time watchdog and latency milestones
//! - Ordered, run-once teardown

mod config;
mod controller;
mod state;
mod stats;
mod teardown;
mod watchdog;

pub use config::CallConfig;
pub use controller::{CallDeps, CallHandle, CallOutcome, EndReason, SessionController};
pub use state::{Session, SessionState};
pub use stats::{CallSnapshot, LatencyMetrics, LatencySnapshot};
pub use teardown::{StepOutcome, TeardownReport, TeardownStep};
pub use watchdog::{Watchdog, WatchdogTick};
