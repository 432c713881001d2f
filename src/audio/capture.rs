//! Capture pipeline: microphone chunks → fixed-size PCM16 frames → transport.

use super::backend::AudioFrame;
use super::pcm;
use crate::transport::TransportSender;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Cuts an arbitrary stream of float chunks into fixed-size PCM16 frames
#[derive(Debug)]
pub struct FrameAssembler {
    block_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    next_sequence: u64,
}

impl FrameAssembler {
    pub fn new(block_size: usize, sample_rate: u32) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            sample_rate,
            pending: Vec::with_capacity(block_size),
            next_sequence: 0,
        }
    }

    /// Append `chunk`, returning every frame it completes, in order
    pub fn push(&mut self, chunk: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while !rest.is_empty() {
            let room = self.block_size - self.pending.len();
            let take = room.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.block_size {
                frames.push(AudioFrame {
                    samples: pcm::encode_samples(&self.pending),
                    sample_rate: self.sample_rate,
                    sequence: self.next_sequence,
                });
                self.next_sequence += 1;
                self.pending.clear();
            }
        }

        frames
    }

    /// Samples waiting for a full block
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Frames produced so far
    pub fn produced(&self) -> u64 {
        self.next_sequence
    }
}

/// Running capture pipeline feeding one transport
pub struct CapturePipeline {
    task: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Start converting `tap` into frames and sending them on `sink`.
    ///
    /// Frames produced while the transport is not open are discarded; the
    /// pipeline keeps running so capture never has to be re-acquired.
    pub fn start(
        mut tap: mpsc::UnboundedReceiver<Vec<f32>>,
        sample_rate: u32,
        block_size: usize,
        sink: TransportSender,
    ) -> Self {
        info!(
            "Capture pipeline started ({}Hz, {} samples per frame)",
            sample_rate, block_size
        );

        let task = tokio::spawn(async move {
            let mut assembler = FrameAssembler::new(block_size, sample_rate);
            let mut sent: u64 = 0;
            let mut discarded: u64 = 0;

            while let Some(chunk) = tap.recv().await {
                for frame in assembler.push(&chunk) {
                    if sink.send_audio(&frame) {
                        sent += 1;
                    } else {
                        discarded += 1;
                    }
                }
            }

            debug!(
                "Capture pipeline drained ({} frames sent, {} discarded, {} samples left over)",
                sent,
                discarded,
                assembler.pending()
            );
        });

        Self { task: Some(task) }
    }

    /// Wait for the pipeline to drain after its tap was disconnected
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| anyhow::anyhow!("Capture task panicked: {}", e))?;
            info!("Capture pipeline stopped");
        }
        Ok(())
    }
}
