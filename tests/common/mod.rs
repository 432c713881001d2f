// Shared fixtures for integration tests
//
// - `MockBackend`: axum server playing the console REST API and the agent's
//   WebSocket, scripted from the test
// - `MockAudio`: microphone fed from the test, output that records playback
// - `MockSpeech`: records fallback utterances

#![allow(dead_code)]

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use voice_console::audio::{
    pcm, ActiveBuffer, AudioBackend, AudioOutput, EndedSignal, InputTrack, PlaybackBuffer,
};
use voice_console::config::BackendConfig;
use voice_console::error::{CallError, Result};
use voice_console::session::{CallConfig, CallDeps, CallHandle, SessionController, SessionState};
use voice_console::speech::SpeechSynthesizer;
use voice_console::BackendClient;

/// Ordered log shared by every mock
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn log(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.starts_with(prefix))
    }
}

/// Poll `condition` every 10ms for up to 5 seconds
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(call: &CallHandle, state: SessionState) {
    let mut snapshots = call.subscribe();
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        snapshots
            .wait_for(|s| s.state == state || s.state.is_terminal())
            .await
            .is_ok()
    })
    .await
    .unwrap_or(false);
    assert!(reached, "timed out waiting for {:?}", state);
    assert_eq!(call.snapshot().state, state);
}

// ============================================================================
// Backend
// ============================================================================

/// What the agent side of the socket should do next
pub enum AgentAction {
    Send(Value),
    Close,
}

#[derive(Clone)]
pub struct MockOptions {
    pub max_duration: Option<u64>,
    pub start_status: StatusCode,
    pub end_status: StatusCode,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            max_duration: Some(300),
            start_status: StatusCode::OK,
            end_status: StatusCode::OK,
        }
    }
}

#[derive(Clone)]
struct MockState {
    options: MockOptions,
    journal: Journal,
    client_messages: Arc<Mutex<Vec<Value>>>,
    script: Arc<Mutex<Option<mpsc::UnboundedReceiver<AgentAction>>>>,
}

pub struct MockBackend {
    pub base_url: String,
    pub journal: Journal,
    client_messages: Arc<Mutex<Vec<Value>>>,
    script: mpsc::UnboundedSender<AgentAction>,
}

impl MockBackend {
    pub async fn start(options: MockOptions, journal: Journal) -> Self {
        let (script_tx, script_rx) = mpsc::unbounded_channel();
        let client_messages = Arc::new(Mutex::new(Vec::new()));

        let state = MockState {
            options,
            journal: journal.clone(),
            client_messages: Arc::clone(&client_messages),
            script: Arc::new(Mutex::new(Some(script_rx))),
        };

        let app = Router::new()
            .route("/api/test-calls/sessions", post(start_session))
            .route("/api/test-calls/sessions/:id/end", post(end_session))
            .route("/ws/:id", get(agent_socket))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}/api", addr),
            journal,
            client_messages,
            script: script_tx,
        }
    }

    pub fn client(&self) -> BackendClient {
        BackendClient::new(&BackendConfig {
            base_url: self.base_url.clone(),
            ..BackendConfig::default()
        })
        .unwrap()
    }

    pub fn send(&self, message: Value) {
        self.script.send(AgentAction::Send(message)).unwrap();
    }

    pub fn send_audio(&self, samples: &[i16], sample_rate: u32) {
        self.send(json!({
            "type": "AUDIO",
            "audio": encode_pcm(samples),
            "sampleRate": sample_rate,
        }));
    }

    pub fn close_socket(&self) {
        self.script.send(AgentAction::Close).unwrap();
    }

    /// Messages the client sent on the socket, in order
    pub fn client_messages(&self) -> Vec<Value> {
        self.client_messages.lock().unwrap().clone()
    }
}

pub fn encode_pcm(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

async fn start_session(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    if state.options.start_status != StatusCode::OK {
        return (state.options.start_status, "session start refused").into_response();
    }

    let agent = body["agentId"].as_str().unwrap_or_default().to_string();
    state.journal.log(format!("session_start:{}", agent));

    let mut grant = json!({
        "sessionId": "sess-1",
        "wsUrl": "/ws/sess-1",
    });
    if let Some(max) = state.options.max_duration {
        grant["maxDuration"] = json!(max);
    }
    Json(grant).into_response()
}

async fn end_session(State(state): State<MockState>, Path(id): Path<String>) -> StatusCode {
    state.journal.log(format!("session_end:{}", id));
    state.options.end_status
}

async fn agent_socket(ws: WebSocketUpgrade, State(state): State<MockState>) -> Response {
    ws.on_upgrade(move |socket| run_agent(socket, state))
}

async fn run_agent(socket: WebSocket, state: MockState) {
    state.journal.log("ws_open");
    let script = state.script.lock().unwrap().take();
    let Some(mut script) = script else {
        state.journal.log("ws_rejected");
        return;
    };

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            action = script.recv() => match action {
                Some(AgentAction::Send(message)) => {
                    if sink.send(Message::Text(message.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(AgentAction::Close) => {
                    let _ = sink.send(Message::Close(None)).await;
                    state.journal.log("ws_dropped");
                    return;
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        if value["type"] == "PING" {
                            let _ = sink.send(Message::Text(json!({"type": "PONG"}).to_string())).await;
                        }
                        state.client_messages.lock().unwrap().push(value);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    state.journal.log("ws_closed");
}

// ============================================================================
// Audio
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayEvent {
    Started {
        id: u64,
        samples: usize,
        sample_rate: u32,
        /// First sample as PCM16, to tell frames apart
        first: Option<i16>,
    },
    Finished {
        id: u64,
    },
    Stopped {
        id: u64,
    },
    Closed,
}

#[derive(Clone, Default)]
pub struct PlayLog(Arc<Mutex<Vec<PlayEvent>>>);

impl PlayLog {
    pub fn events(&self) -> Vec<PlayEvent> {
        self.0.lock().unwrap().clone()
    }

    pub fn started(&self) -> usize {
        self.count(|e| matches!(e, PlayEvent::Started { .. }))
    }

    pub fn finished(&self) -> usize {
        self.count(|e| matches!(e, PlayEvent::Finished { .. }))
    }

    pub fn stopped(&self) -> usize {
        self.count(|e| matches!(e, PlayEvent::Stopped { .. }))
    }

    fn count(&self, pred: impl Fn(&PlayEvent) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    fn push(&self, event: PlayEvent) {
        self.0.lock().unwrap().push(event);
    }
}

/// Scripted host audio
pub struct MockAudio {
    pub sample_rate: u32,
    /// Returned from `open_input` instead of a track
    pub input_error: Option<CallError>,
    /// How long each buffer plays; `None` holds it until stopped
    pub play_time: Option<Duration>,
    pub journal: Journal,
    pub plays: PlayLog,
    /// Feeds the open microphone track
    pub mic: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>>,
}

impl MockAudio {
    pub fn new(journal: Journal) -> Self {
        Self {
            sample_rate: 48000,
            input_error: None,
            play_time: Some(Duration::from_millis(20)),
            journal,
            plays: PlayLog::default(),
            mic: Arc::new(Mutex::new(None)),
        }
    }

    /// Push a chunk of microphone samples; false when no track is open
    pub fn speak_into_mic(mic: &Arc<Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>>, chunk: Vec<f32>) -> bool {
        match mic.lock().unwrap().as_ref() {
            Some(tx) => tx.send(chunk).is_ok(),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl AudioBackend for MockAudio {
    async fn open_input(&mut self) -> Result<InputTrack> {
        if let Some(e) = self.input_error.clone() {
            self.journal.log("mic_denied");
            return Err(e);
        }

        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        *self.mic.lock().unwrap() = Some(samples_tx);
        self.journal.log("mic_open");

        let journal = self.journal.clone();
        let mic = Arc::clone(&self.mic);
        tokio::spawn(async move {
            let _ = stop_rx.await;
            mic.lock().unwrap().take();
            journal.log("track_stop");
        });

        Ok(InputTrack::new("mock-mic", self.sample_rate, samples_rx, stop_tx))
    }

    async fn open_output(&mut self) -> Result<Box<dyn AudioOutput>> {
        Ok(Box::new(MockOutput {
            play_time: self.play_time,
            plays: self.plays.clone(),
            journal: self.journal.clone(),
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct MockOutput {
    play_time: Option<Duration>,
    plays: PlayLog,
    journal: Journal,
}

struct MockActive {
    id: u64,
    plays: PlayLog,
    timer: Option<tokio::task::JoinHandle<()>>,
}

impl ActiveBuffer for MockActive {
    fn stop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.plays.push(PlayEvent::Stopped { id: self.id });
    }
}

impl AudioOutput for MockOutput {
    fn start(&mut self, buffer: PlaybackBuffer, ended: EndedSignal) -> Result<Box<dyn ActiveBuffer>> {
        let id = buffer.id;
        self.plays.push(PlayEvent::Started {
            id,
            samples: buffer.samples.len(),
            sample_rate: buffer.sample_rate,
            first: buffer.samples.first().map(|&s| pcm::f32_to_pcm16(s)),
        });

        let timer = self.play_time.map(|play_time| {
            let plays = self.plays.clone();
            tokio::spawn(async move {
                tokio::time::sleep(play_time).await;
                plays.push(PlayEvent::Finished { id });
                ended.fire();
            })
        });

        Ok(Box::new(MockActive {
            id,
            plays: self.plays.clone(),
            timer,
        }))
    }

    fn close(&mut self) {
        self.plays.push(PlayEvent::Closed);
        self.journal.log("output_closed");
    }

    fn name(&self) -> &str {
        "mock-output"
    }
}

// ============================================================================
// Speech
// ============================================================================

#[derive(Clone, Default)]
pub struct MockSpeech {
    pub spoken: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl SpeechSynthesizer for MockSpeech {
    async fn speak(&self, text: &str) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "mock-speech"
    }
}

// ============================================================================
// Calls
// ============================================================================

pub fn spawn_call(
    backend: &MockBackend,
    audio: MockAudio,
    speech: MockSpeech,
    config: CallConfig,
) -> CallHandle {
    let deps = CallDeps {
        api: Arc::new(backend.client()),
        audio: Box::new(audio),
        speech: Arc::new(speech),
    };
    SessionController::new(config, deps).spawn("agent-7")
}
