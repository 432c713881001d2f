//! Console backend REST calls used by a test call

pub mod client;

pub use client::{resolve_ws_url, BackendClient, SessionApi, SessionGrant};
