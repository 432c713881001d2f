pub mod api;
pub mod audio;
pub mod config;
pub mod error;
pub mod http;
pub mod session;
pub mod speech;
pub mod transport;

pub use api::{BackendClient, SessionApi, SessionGrant};
pub use audio::{AudioBackend, AudioFrame, AudioOutput, InputTrack};
pub use config::Config;
pub use error::CallError;
pub use http::{create_router, AppState};
pub use session::{
    CallConfig, CallDeps, CallHandle, CallOutcome, CallSnapshot, SessionController, SessionState,
};
pub use transport::{TransportSession, TransportState};
