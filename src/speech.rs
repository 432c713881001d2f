//! Local text-to-speech used when the agent sends `TEXT_FALLBACK`.
//!
//! Utterances are spoken one after another by a dedicated worker so the
//! inbound dispatcher never waits on synthesis. Speech runs alongside the
//! playback queue and never interrupts it.

use crate::config::SpeechConfig;
use crate::error::{CallError, Result};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Maximum utterance size accepted for local synthesis (16 KiB)
const MAX_UTTERANCE_BYTES: usize = 16 * 1024;

#[async_trait::async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Speak `text` on the local output, returning once it has been spoken
    async fn speak(&self, text: &str) -> Result<()>;

    fn name(&self) -> &str;
}

/// Speaks through a system TTS program (`say` on macOS, `espeak-ng` elsewhere)
#[derive(Debug, Clone)]
pub struct SystemSpeech {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl SystemSpeech {
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }
}

#[async_trait::async_trait]
impl SpeechSynthesizer for SystemSpeech {
    async fn speak(&self, text: &str) -> Result<()> {
        if text.len() > MAX_UTTERANCE_BYTES {
            return Err(CallError::Playback(format!(
                "utterance exceeds maximum size: {} bytes (limit: {} bytes)",
                text.len(),
                MAX_UTTERANCE_BYTES
            )));
        }

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CallError::Playback(format!("Failed to spawn {}: {}", self.program, e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                CallError::Playback(format!(
                    "{} timed out after {} seconds",
                    self.program,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| CallError::Playback(format!("Failed to wait for {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CallError::Playback(format!(
                "{} failed: {}",
                self.program,
                stderr.trim()
            )));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        &self.program
    }
}

/// Sequential speech worker
pub struct SpeechQueue {
    tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl SpeechQueue {
    pub fn spawn(synth: Arc<dyn SpeechSynthesizer>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let task = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                debug!("Speaking fallback text via {} ({} chars)", synth.name(), text.len());
                if let Err(e) = synth.speak(&text).await {
                    error!("Speech fallback failed: {}", e);
                }
            }
        });

        Self { tx, task }
    }

    pub fn say(&self, text: String) {
        if self.tx.send(text).is_err() {
            error!("Speech worker is gone, dropping fallback text");
        }
    }

    /// Cancel the current utterance and everything pending
    pub fn cancel(self) {
        self.task.abort();
        info!("Speech fallback cancelled");
    }
}
