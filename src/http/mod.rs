//! Local HTTP API for driving test calls
//!
//! - POST /calls/start - Start a call (409 while one is live)
//! - POST /calls/end - End the live call and return its outcome
//! - GET /calls/status - Snapshot of the latest call
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::{AppState, CallStarter};
