use crate::error::Result;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// PCM16 audio block (mono, little-endian on the wire)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, mono)
    pub samples: Vec<i16>,
    /// Sample rate in Hz, as produced by the device or declared by the agent
    pub sample_rate: u32,
    /// Position in capture order (outbound) or arrival order (inbound)
    pub sequence: u64,
}

impl AudioFrame {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / u64::from(self.sample_rate)
    }
}

/// A live microphone track.
///
/// Samples arrive as normalized mono float chunks of whatever size the device
/// delivers. Stopping the track releases the device; it never restarts.
pub struct InputTrack {
    sample_rate: u32,
    samples: Option<mpsc::UnboundedReceiver<Vec<f32>>>,
    stop_tx: Option<oneshot::Sender<()>>,
    label: String,
}

impl InputTrack {
    /// Create a track fed by `samples`; sending on (or dropping) the
    /// counterpart of `stop_tx` is how the device side learns to release
    pub fn new(
        label: impl Into<String>,
        sample_rate: u32,
        samples: mpsc::UnboundedReceiver<Vec<f32>>,
        stop_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            sample_rate,
            samples: Some(samples),
            stop_tx: Some(stop_tx),
            label: label.into(),
        }
    }

    /// Native sample rate of the device
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Take the sample stream; it can only be routed once
    pub fn take_samples(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<f32>>> {
        self.samples.take()
    }

    /// Stop the track and release the device
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            // The device side may already be gone
            let _ = tx.send(());
            debug!("Input track '{}' stopped", self.label);
        }
    }
}

impl Drop for InputTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A playable buffer handed to an output device
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    pub id: u64,
    /// Normalized mono samples
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Fires once when the output is ready for the next buffer: when a buffer
/// finishes on its own, or shortly before on outputs that render ahead.
///
/// A stopped buffer must not fire.
#[derive(Debug)]
pub struct EndedSignal {
    id: u64,
    tx: mpsc::UnboundedSender<u64>,
}

impl EndedSignal {
    pub fn new(id: u64, tx: mpsc::UnboundedSender<u64>) -> Self {
        Self { id, tx }
    }

    pub fn fire(self) {
        // Receiver gone means the queue was closed
        let _ = self.tx.send(self.id);
    }
}

/// Handle to the buffer currently playing on an output device
pub trait ActiveBuffer: Send {
    /// Stop immediately and disconnect from the output
    fn stop(&mut self);
}

/// Output device the playback queue renders into
pub trait AudioOutput: Send {
    /// Start playing `buffer` right after anything still sounding; `ended`
    /// fires once the next buffer may be started
    fn start(
        &mut self,
        buffer: PlaybackBuffer,
        ended: EndedSignal,
    ) -> Result<Box<dyn ActiveBuffer>>;

    /// Release the device
    fn close(&mut self) {}

    fn name(&self) -> &str;
}

/// Host audio environment.
///
/// Platform-specific implementations:
/// - cpal: default input and output devices (feature `device-audio`)
/// - tests: scripted tracks and recording outputs
#[async_trait::async_trait]
pub trait AudioBackend: Send {
    /// Request microphone access and open the input at its native rate
    async fn open_input(&mut self) -> Result<InputTrack>;

    /// Open the output device used for agent speech
    async fn open_output(&mut self) -> Result<Box<dyn AudioOutput>>;

    /// Get backend name for logging
    fn name(&self) -> &str;
}
