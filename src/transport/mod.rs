//! Duplex control + media channel to the agent

pub mod client;
pub mod messages;

pub use client::{TransportEvent, TransportOptions, TransportSender, TransportSession, TransportState};
pub use messages::{ClientMessage, ServerMessage};
