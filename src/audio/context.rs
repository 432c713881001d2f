//! Audio processing context for one call.
//!
//! Owns the routing task that drains the microphone track (metering every
//! chunk for UI feedback and forwarding it to the capture pipeline once one is
//! connected), plus both output paths: the playback queue worker and the
//! speech fallback worker. Everything talks to it through channels; nothing
//! here blocks the controller.

use super::backend::{AudioFrame, AudioOutput};
use super::playback::{self, PlaybackQueue, PlaybackSender};
use super::pcm;
use crate::speech::{SpeechQueue, SpeechSynthesizer};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Route {
    Connect(mpsc::UnboundedSender<Vec<f32>>),
    Disconnect,
}

pub struct AudioContext {
    sample_rate: u32,
    route_tx: mpsc::UnboundedSender<Route>,
    router: Option<JoinHandle<()>>,
    playback: PlaybackSender,
    playback_task: Option<JoinHandle<()>>,
    speech: Option<SpeechQueue>,
}

impl AudioContext {
    /// Start routing `samples` (recorded at `sample_rate`) and open the output paths
    pub fn open(
        samples: mpsc::UnboundedReceiver<Vec<f32>>,
        sample_rate: u32,
        output: Box<dyn AudioOutput>,
        speech: Arc<dyn SpeechSynthesizer>,
        level_tx: watch::Sender<f32>,
    ) -> Self {
        let (route_tx, route_rx) = mpsc::unbounded_channel();
        let router = tokio::spawn(route_input(samples, route_rx, level_tx));

        let (queue, ended_rx) = PlaybackQueue::new(output);
        let (playback, playback_task) = playback::spawn_worker(queue, ended_rx);

        info!("Audio context opened ({}Hz input)", sample_rate);

        Self {
            sample_rate,
            route_tx,
            router: Some(router),
            playback,
            playback_task: Some(playback_task),
            speech: Some(SpeechQueue::spawn(speech)),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_open(&self) -> bool {
        self.router.is_some()
    }

    /// Tap the microphone for the capture pipeline; replaces any previous tap
    pub fn connect_capture(&self) -> mpsc::UnboundedReceiver<Vec<f32>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.route_tx.send(Route::Connect(tx)).is_err() {
            warn!("Input router is gone, capture tap will stay silent");
        }
        rx
    }

    pub fn disconnect_capture(&self) {
        let _ = self.route_tx.send(Route::Disconnect);
    }

    pub fn enqueue_playback(&self, frame: AudioFrame) {
        self.playback.enqueue(frame);
    }

    pub fn flush_playback(&self) {
        self.playback.flush();
    }

    /// Speak `text` through the local fallback path
    pub fn speak(&self, text: String) {
        match &self.speech {
            Some(speech) => speech.say(text),
            None => warn!("Audio context closed, dropping fallback text"),
        }
    }

    /// Stop routing, flush and release the output, cancel pending speech
    pub async fn close(&mut self) -> anyhow::Result<()> {
        if let Some(router) = self.router.take() {
            router.abort();
        }

        self.playback.close().await;
        if let Some(task) = self.playback_task.take() {
            task.await
                .map_err(|e| anyhow::anyhow!("Playback worker panicked: {}", e))?;
        }

        if let Some(speech) = self.speech.take() {
            speech.cancel();
        }

        info!("Audio context closed");
        Ok(())
    }
}

async fn route_input(
    mut samples: mpsc::UnboundedReceiver<Vec<f32>>,
    mut route_rx: mpsc::UnboundedReceiver<Route>,
    level_tx: watch::Sender<f32>,
) {
    let mut tap: Option<mpsc::UnboundedSender<Vec<f32>>> = None;

    loop {
        tokio::select! {
            biased;

            route = route_rx.recv() => match route {
                Some(Route::Connect(tx)) => {
                    debug!("Capture tap connected");
                    tap = Some(tx);
                }
                Some(Route::Disconnect) => {
                    debug!("Capture tap disconnected");
                    tap = None;
                }
                None => break,
            },
            chunk = samples.recv() => {
                let Some(chunk) = chunk else {
                    debug!("Input track ended");
                    break;
                };

                level_tx.send_replace(pcm::rms_level(&chunk));

                if let Some(tx) = &tap {
                    if tx.send(chunk).is_err() {
                        tap = None;
                    }
                }
            }
        }
    }

    level_tx.send_replace(0.0);
}
