//! Session controller: the single task that owns a test call.
//!
//! Every state transition happens on that task. Commands from
//! [`CallHandle`]s, transport events and the watchdog tick are multiplexed in
//! one event loop, so the end sequence can only ever run once.

use super::config::CallConfig;
use super::state::{Session, SessionState};
use super::stats::{CallSnapshot, LatencyMetrics, LatencySnapshot};
use super::teardown::{TeardownReport, TeardownStep};
use super::watchdog::{self, Watchdog, WatchdogTick};
use crate::api::{resolve_ws_url, SessionApi};
use crate::audio::{AudioBackend, AudioContext, CapturePipeline, InputTrack};
use crate::error::{CallError, Result};
use crate::speech::SpeechSynthesizer;
use crate::transport::messages::decode_audio;
use crate::transport::{ServerMessage, TransportEvent, TransportSession};
use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// External collaborators of a call
pub struct CallDeps {
    pub api: Arc<dyn SessionApi>,
    pub audio: Box<dyn AudioBackend>,
    pub speech: Arc<dyn SpeechSynthesizer>,
}

#[derive(Debug)]
enum Command {
    End,
}

/// Why a call ended normally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserRequested,
    /// The agent sent `MAX_DURATION_REACHED`
    MaxDurationReached,
    /// The local elapsed-time watchdog fired
    WatchdogExpired,
}

/// Result of a finished call
#[derive(Debug, Clone, Serialize)]
pub struct CallOutcome {
    pub call_id: Uuid,
    pub state: SessionState,
    /// `None` when the call failed
    pub reason: Option<EndReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub teardown: TeardownReport,
    pub latency: LatencySnapshot,
}

/// Handle to a running call.
///
/// Cloneable; dropping every handle ends the call.
#[derive(Clone)]
pub struct CallHandle {
    call_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
    level: watch::Receiver<f32>,
    outcome: watch::Receiver<Option<CallOutcome>>,
}

impl CallHandle {
    pub fn id(&self) -> Uuid {
        self.call_id
    }

    /// Request the end sequence; repeated calls are harmless
    pub fn end(&self) {
        let _ = self.commands.send(Command::End);
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Snapshot stream, updated on every change
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// RMS level of the microphone, 0.0 to 1.0
    pub fn input_level(&self) -> watch::Receiver<f32> {
        self.level.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Wait for the call to finish.
    ///
    /// Returns `None` only if the call task died without reporting.
    pub async fn wait(&self) -> Option<CallOutcome> {
        let mut outcome = self.outcome.clone();
        loop {
            let done = outcome.borrow_and_update().clone();
            if done.is_some() {
                return done;
            }
            if outcome.changed().await.is_err() {
                return outcome.borrow().clone();
            }
        }
    }
}

pub struct SessionController {
    config: CallConfig,
    deps: CallDeps,
}

impl SessionController {
    pub fn new(config: CallConfig, deps: CallDeps) -> Self {
        Self { config, deps }
    }

    /// Start a call with `agent_id` on a new task
    pub fn spawn(self, agent_id: impl Into<String>) -> CallHandle {
        let agent_id = agent_id.into();
        let call_id = Uuid::new_v4();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::new(call_id, &agent_id));
        let (level_tx, level_rx) = watch::channel(0.0_f32);
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let call = Call {
            call_id,
            agent_id,
            config: self.config,
            api: self.deps.api,
            audio: self.deps.audio,
            speech: self.deps.speech,
            snapshot: snapshot_tx,
            state: SessionState::AcquiringPermission,
            session: None,
            track: None,
            context: None,
            capture: None,
            transport: None,
            metrics: LatencyMetrics::new(),
            inbound_sequence: 0,
        };

        tokio::spawn(async move {
            let outcome = call.run(command_rx, level_tx).await;
            outcome_tx.send_replace(Some(outcome));
        });

        CallHandle {
            call_id,
            commands: command_tx,
            snapshot: snapshot_rx,
            level: level_rx,
            outcome: outcome_rx,
        }
    }
}

enum Started {
    Running {
        events: mpsc::UnboundedReceiver<TransportEvent>,
        watchdog: Watchdog,
    },
    /// An end request arrived between start steps
    Cancelled,
}

struct Call {
    call_id: Uuid,
    agent_id: String,
    config: CallConfig,
    api: Arc<dyn SessionApi>,
    audio: Box<dyn AudioBackend>,
    speech: Arc<dyn SpeechSynthesizer>,
    snapshot: watch::Sender<CallSnapshot>,
    state: SessionState,
    session: Option<Session>,
    track: Option<InputTrack>,
    context: Option<AudioContext>,
    capture: Option<CapturePipeline>,
    transport: Option<TransportSession>,
    metrics: LatencyMetrics,
    inbound_sequence: u64,
}

impl Call {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        level_tx: watch::Sender<f32>,
    ) -> CallOutcome {
        info!(
            "Starting test call {} with agent {}",
            self.call_id, self.agent_id
        );

        let result = match self.start(&mut commands, level_tx).await {
            Ok(Started::Running { events, watchdog }) => {
                self.serve(&mut commands, events, watchdog).await
            }
            Ok(Started::Cancelled) => {
                info!("Call {} ended before it became active", self.call_id);
                Ok(EndReason::UserRequested)
            }
            Err(e) => Err(e),
        };

        self.finish(result).await
    }

    async fn start(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        level_tx: watch::Sender<f32>,
    ) -> Result<Started> {
        info!("Requesting microphone access via {}", self.audio.name());
        let track = self.audio.open_input().await?;
        let track = self.track.insert(track);
        let sample_rate = track.sample_rate();
        let samples = track.take_samples().ok_or_else(|| {
            CallError::CaptureUnsupported("input track has no sample stream".to_string())
        })?;
        if sample_rate == 0 {
            return Err(CallError::CaptureUnsupported(format!(
                "input '{}' reports no sample rate",
                track.label()
            )));
        }
        info!("Microphone '{}' open at {}Hz", track.label(), sample_rate);
        if end_requested(commands) {
            return Ok(Started::Cancelled);
        }

        let output = self.audio.open_output().await?;
        self.context = Some(AudioContext::open(
            samples,
            sample_rate,
            output,
            Arc::clone(&self.speech),
            level_tx,
        ));
        if end_requested(commands) {
            return Ok(Started::Cancelled);
        }

        self.transition(SessionState::Connecting);
        let grant = self.api.start_session(&self.agent_id).await?;
        let ws_url = resolve_ws_url(self.api.base_url(), &grant.ws_url)?;
        let max_duration = self.config.max_duration(grant.max_duration);
        self.snapshot.send_modify(|s| {
            s.session_id = Some(grant.session_id.clone());
            s.max_duration_secs = Some(max_duration.as_secs());
        });
        self.session = Some(Session {
            id: grant.session_id,
            ws_url: ws_url.clone(),
            max_duration,
            created_at: Utc::now(),
        });
        if end_requested(commands) {
            return Ok(Started::Cancelled);
        }

        let (transport, events) =
            TransportSession::connect(&ws_url, self.config.transport.clone()).await?;
        self.metrics.mark_transport_open(transport.opened_at());
        let sink = transport.sender();
        self.transport = Some(transport);
        if end_requested(commands) {
            return Ok(Started::Cancelled);
        }

        self.transition(SessionState::Active);
        if let Some(context) = &self.context {
            let tap = context.connect_capture();
            self.capture = Some(CapturePipeline::start(
                tap,
                sample_rate,
                self.config.block_size,
                sink,
            ));
        }
        let latency = self.metrics.snapshot();
        self.snapshot.send_modify(|s| s.latency = latency);

        info!(
            "Call {} active, limited to {}s",
            self.call_id,
            max_duration.as_secs()
        );
        Ok(Started::Running {
            events,
            watchdog: Watchdog::new(max_duration),
        })
    }

    /// Event loop of an active call
    async fn serve(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut watchdog: Watchdog,
    ) -> Result<EndReason> {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + watchdog::TICK,
            watchdog::TICK,
        );

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::End) => info!("End of call {} requested", self.call_id),
                        None => info!("All handles of call {} dropped, ending it", self.call_id),
                    }
                    return Ok(EndReason::UserRequested);
                }
                event = events.recv() => match event {
                    Some(TransportEvent::Message(message)) => {
                        if let Some(end) = self.dispatch(message) {
                            return end;
                        }
                    }
                    Some(TransportEvent::Closed { reason }) => {
                        return Err(CallError::TransportFailure(reason));
                    }
                    None => {
                        return Err(CallError::TransportFailure(
                            "transport stopped delivering events".to_string(),
                        ));
                    }
                },
                _ = ticker.tick() => match watchdog.on_tick() {
                    WatchdogTick::Running(elapsed) => {
                        self.snapshot.send_modify(|s| s.elapsed_secs = elapsed.as_secs());
                    }
                    WatchdogTick::Expired => {
                        let elapsed = watchdog.elapsed().as_secs();
                        info!("Call {} reached its max duration of {}s", self.call_id, elapsed);
                        self.snapshot.send_modify(|s| s.elapsed_secs = elapsed);
                        return Ok(EndReason::WatchdogExpired);
                    }
                },
            }
        }
    }

    /// Handle one agent message; returns how the call ends, if it does
    fn dispatch(&mut self, message: ServerMessage) -> Option<Result<EndReason>> {
        match message {
            ServerMessage::Audio { audio, sample_rate } => {
                let sequence = self.inbound_sequence;
                self.inbound_sequence += 1;

                let frame = match decode_audio(&audio, sample_rate, sequence) {
                    Ok(frame) if frame.samples.is_empty() => {
                        warn!("Dropping empty agent audio frame {}", sequence);
                        return None;
                    }
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Dropping agent audio frame {}: {}", sequence, e);
                        return None;
                    }
                };

                self.metrics.record_inbound(std::time::Instant::now());
                let latency = self.metrics.snapshot();
                self.snapshot.send_modify(|s| s.latency = latency);

                debug!(
                    "Agent audio frame {} ({} samples at {}Hz)",
                    sequence,
                    frame.samples.len(),
                    frame.sample_rate
                );
                if let Some(context) = &self.context {
                    context.enqueue_playback(frame);
                }
                None
            }
            ServerMessage::TextFallback { text } => {
                info!("Agent sent text instead of audio ({} chars)", text.chars().count());
                if let Some(context) = &self.context {
                    context.speak(text);
                }
                None
            }
            ServerMessage::Interrupt => {
                info!("Agent interrupted, flushing playback");
                if let Some(context) = &self.context {
                    context.flush_playback();
                }
                None
            }
            ServerMessage::MaxDurationReached => {
                info!("Agent reports max duration reached");
                Some(Ok(EndReason::MaxDurationReached))
            }
            ServerMessage::Error { message } => {
                error!("Agent reported an error: {}", message);
                Some(Err(CallError::BackendError(message)))
            }
            ServerMessage::Pong => {
                debug!("Keep-alive acknowledged");
                None
            }
        }
    }

    async fn finish(mut self, result: Result<EndReason>) -> CallOutcome {
        if let Err(e) = &result {
            error!("Call {} failed: {}", self.call_id, e);
        }

        let teardown = self.teardown().await;

        let (next, reason) = match result {
            Ok(reason) => (SessionState::Ended, Some(reason)),
            Err(e) => (SessionState::Failed(e), None),
        };
        self.transition(next);

        let latency = self.metrics.snapshot();
        info!(
            "Call {} finished: {} ({} agent frames, first after {:?}ms)",
            self.call_id, self.state, latency.inbound_frames, latency.first_inbound_ms
        );

        CallOutcome {
            call_id: self.call_id,
            error: self.state.error().map(ToString::to_string),
            state: self.state,
            reason,
            teardown,
            latency,
        }
    }

    /// Release everything in a fixed order; no step aborts the others
    async fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();

        // The backend must hear about the end before the transport drops
        let notify = match &self.session {
            Some(session) => Some(
                self.api
                    .end_session(&session.id)
                    .await
                    .with_context(|| format!("Failed to notify end of session {}", session.id)),
            ),
            None => None,
        };
        report.record(TeardownStep::EndNotify, notify);

        let capture = match self.capture.take() {
            Some(mut capture) => {
                if let Some(context) = &self.context {
                    context.disconnect_capture();
                }
                Some(capture.stop().await)
            }
            None => None,
        };
        report.record(TeardownStep::CaptureStop, capture);

        let track = self.track.take().map(|mut track| {
            track.stop();
            Ok(())
        });
        report.record(TeardownStep::TrackStop, track);

        let context = match self.context.take() {
            Some(mut context) => Some(context.close().await),
            None => None,
        };
        report.record(TeardownStep::ContextClose, context);

        let transport = match self.transport.take() {
            Some(mut transport) => {
                debug!("Closing agent transport ({:?})", transport.state());
                Some(
                    transport
                        .close()
                        .await
                        .context("Failed to close agent transport"),
                )
            }
            None => None,
        };
        report.record(TeardownStep::TransportClose, transport);

        report
    }

    fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(&next) {
            error!("Ignoring illegal transition {} -> {}", self.state, next);
            return;
        }
        info!("Call {}: {} -> {}", self.call_id, self.state, next);
        self.state = next;

        let state = self.state.clone();
        self.snapshot.send_modify(|s| {
            s.error = state.error().map(ToString::to_string);
            s.state = state;
        });
    }
}

fn end_requested(commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    match commands.try_recv() {
        Ok(Command::End) => true,
        Err(TryRecvError::Disconnected) => true,
        Err(TryRecvError::Empty) => false,
    }
}
