//! WebSocket transport to the agent.
//!
//! One connection carries both audio and control messages. The socket is
//! split into a writer task (outbound messages, keep-alive pings, explicit
//! close) and a reader task (inbound messages forwarded as
//! [`TransportEvent`]s). The connection only closes when
//! [`TransportSession::close`] is called, or when the peer or the network
//! ends it.

use super::messages::{ClientMessage, ServerMessage};
use crate::audio::AudioFrame;
use crate::error::{CallError, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl TransportState {
    pub fn can_transition_to(self, next: TransportState) -> bool {
        use TransportState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Open)
                | (Connecting, Closed)
                | (Open, Closing)
                | (Open, Closed)
                | (Closing, Closed)
        )
    }
}

/// Apply `next` if it is a legal transition from the current state
fn transition(state: &watch::Sender<TransportState>, next: TransportState) -> bool {
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            debug!("Transport {:?} -> {:?}", current, next);
            *current = next;
            true
        } else {
            false
        }
    })
}

/// Events delivered to the session controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(ServerMessage),
    /// The peer or the network closed the connection
    Closed { reason: String },
}

enum Outbound {
    Message(ClientMessage),
    Close(oneshot::Sender<()>),
}

/// Write side of the transport, shared with the capture pipeline.
///
/// Dropping it never closes the connection.
#[derive(Clone)]
pub struct TransportSender {
    tx: mpsc::UnboundedSender<Outbound>,
    state: watch::Receiver<TransportState>,
    audio_format: Option<Arc<str>>,
}

impl TransportSender {
    /// Send one captured frame; returns false when it was discarded because
    /// the transport is not open
    pub fn send_audio(&self, frame: &AudioFrame) -> bool {
        if !self.is_open() {
            return false;
        }
        let message = ClientMessage::audio(frame, self.audio_format.as_deref());
        self.tx.send(Outbound::Message(message)).is_ok()
    }

    pub fn is_open(&self) -> bool {
        *self.state.borrow() == TransportState::Open
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub keepalive_interval: Duration,
    /// Format tag attached to outbound audio
    pub audio_format: Option<String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(20),
            audio_format: Some("pcm16le".to_string()),
        }
    }
}

pub struct TransportSession {
    sender: TransportSender,
    state: Arc<watch::Sender<TransportState>>,
    opened_at: Instant,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl TransportSession {
    /// Dial `url` and wait for the handshake to complete.
    ///
    /// Inbound messages arrive on the returned receiver in wire order.
    pub async fn connect(
        url: &str,
        options: TransportOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let state = Arc::new(watch::channel(TransportState::Idle).0);
        transition(&state, TransportState::Connecting);

        info!("Connecting to agent transport at {}", url);

        let ws = match connect_async(url).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                transition(&state, TransportState::Closed);
                return Err(CallError::TransportFailure(format!(
                    "Failed to connect to {}: {}",
                    url, e
                )));
            }
        };

        let opened_at = Instant::now();
        transition(&state, TransportState::Open);
        info!("Agent transport open");

        let (sink, source) = ws.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(
            sink,
            out_rx,
            Arc::clone(&state),
            event_tx.clone(),
            options.keepalive_interval,
        ));
        let reader = tokio::spawn(read_loop(source, Arc::clone(&state), event_tx));

        let sender = TransportSender {
            tx: out_tx,
            state: state.subscribe(),
            audio_format: options.audio_format.map(Arc::from),
        };

        Ok((
            Self {
                sender,
                state,
                opened_at,
                writer: Some(writer),
                reader: Some(reader),
            },
            event_rx,
        ))
    }

    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Instant the handshake completed
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Close the connection and wait for the close frame to be written
    pub async fn close(&mut self) -> Result<()> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.sender.tx.send(Outbound::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        if let Err(e) = writer.await {
            error!("Transport writer panicked: {}", e);
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        transition(&self.state, TransportState::Closed);
        info!("Agent transport closed");
        Ok(())
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    state: Arc<watch::Sender<TransportState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    keepalive_interval: Duration,
) {
    let mut keepalive = tokio::time::interval(keepalive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the immediate first tick
    keepalive.tick().await;

    let mut frames: u64 = 0;

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(Outbound::Message(message)) => {
                    if matches!(message, ClientMessage::Audio { .. }) {
                        frames += 1;
                    }
                    if let Err(e) = send_json(&mut sink, &message).await {
                        fail(&state, &events, format!("send failed: {}", e));
                        break;
                    }
                }
                Some(Outbound::Close(ack)) => {
                    transition(&state, TransportState::Closing);
                    if let Err(e) = sink.close().await {
                        debug!("Close handshake did not complete cleanly: {}", e);
                    }
                    transition(&state, TransportState::Closed);
                    let _ = ack.send(());
                    break;
                }
                None => {
                    debug!("All transport senders dropped, closing");
                    transition(&state, TransportState::Closing);
                    let _ = sink.close().await;
                    transition(&state, TransportState::Closed);
                    break;
                }
            },
            _ = keepalive.tick() => {
                if *state.borrow() != TransportState::Open {
                    continue;
                }
                if let Err(e) = send_json(&mut sink, &ClientMessage::Ping).await {
                    fail(&state, &events, format!("keep-alive failed: {}", e));
                    break;
                }
            }
        }
    }

    debug!("Transport writer stopped after {} audio frames", frames);
}

async fn read_loop(
    mut source: WsSource,
    state: Arc<watch::Sender<TransportState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let reason = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(message) => {
                        if events.send(TransportEvent::Message(message)).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("Failed to parse agent message: {}", e),
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => format!("closed by agent ({}: {})", frame.code, frame.reason.as_str()),
                    None => "closed by agent".to_string(),
                };
            }
            Some(Ok(Message::Binary(bytes))) => {
                warn!("Ignoring unexpected binary frame ({} bytes)", bytes.len());
            }
            // Ping/pong frames are answered by the protocol layer
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("receive failed: {}", e),
            None => break "connection ended".to_string(),
        }
    };

    fail(&state, &events, reason);
}

/// Report an unrequested closure; a close we initiated is not reported
fn fail(
    state: &watch::Sender<TransportState>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    reason: String,
) {
    let lost = state.send_if_modified(|current| {
        if matches!(current, TransportState::Connecting | TransportState::Open) {
            *current = TransportState::Closed;
            true
        } else {
            false
        }
    });
    if lost {
        warn!("Agent transport lost: {}", reason);
        let _ = events.send(TransportEvent::Closed { reason });
    }
}

async fn send_json<T: Serialize>(sink: &mut WsSink, message: &T) -> anyhow::Result<()> {
    let payload = serde_json::to_string(message)?;
    sink.send(Message::Text(payload.into())).await?;
    Ok(())
}
