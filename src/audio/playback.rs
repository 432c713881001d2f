//! Gapless, in-order playback of agent speech with instant flush.
//!
//! `PlaybackQueue` is a plain state machine: `enqueue` starts the head frame
//! when idle, and the completion signal of the playing buffer starts the next
//! one. Each started buffer carries an id, and only the completion matching
//! the current id advances the chain, so a flush can never leave a second
//! "play next" pending. `spawn_worker` runs the queue in one task.

use super::backend::{ActiveBuffer, AudioFrame, AudioOutput, EndedSignal, PlaybackBuffer};
use super::pcm;
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Current {
    id: u64,
    sequence: u64,
    handle: Box<dyn ActiveBuffer>,
}

pub struct PlaybackQueue {
    output: Box<dyn AudioOutput>,
    queue: VecDeque<AudioFrame>,
    current: Option<Current>,
    next_id: u64,
    ended_tx: mpsc::UnboundedSender<u64>,
    played: u64,
    flushed: u64,
}

impl PlaybackQueue {
    /// Completion ids arrive on the returned receiver and must be fed back
    /// through [`PlaybackQueue::on_ended`]
    pub fn new(output: Box<dyn AudioOutput>) -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let queue = Self {
            output,
            queue: VecDeque::new(),
            current: None,
            next_id: 0,
            ended_tx,
            played: 0,
            flushed: 0,
        };
        (queue, ended_rx)
    }

    pub fn enqueue(&mut self, frame: AudioFrame) {
        self.queue.push_back(frame);
        if !self.is_playing() {
            self.play_next();
        }
    }

    /// Completion of buffer `id`; stale ids are ignored
    pub fn on_ended(&mut self, id: u64) {
        match &self.current {
            Some(current) if current.id == id => {
                debug!("Playback of frame {} finished", current.sequence);
                self.current = None;
                self.play_next();
            }
            _ => debug!("Ignoring stale completion for buffer {}", id),
        }
    }

    /// Drop everything queued and stop the playing buffer
    pub fn flush(&mut self) {
        let dropped = self.queue.len();
        self.queue.clear();
        if let Some(mut current) = self.current.take() {
            current.handle.stop();
            self.flushed += 1;
            debug!("Stopped frame {} mid-playback", current.sequence);
        }
        self.flushed += dropped as u64;
        if dropped > 0 {
            debug!("Flushed {} queued frames", dropped);
        }
    }

    pub fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Frames started so far
    pub fn played(&self) -> u64 {
        self.played
    }

    /// Frames discarded by flushes, including interrupted ones
    pub fn flushed(&self) -> u64 {
        self.flushed
    }

    /// Flush and release the output device
    pub fn close(&mut self) {
        self.flush();
        self.output.close();
    }

    fn play_next(&mut self) {
        while let Some(frame) = self.queue.pop_front() {
            let id = self.next_id;
            self.next_id += 1;

            let sequence = frame.sequence;
            let duration_ms = frame.duration_ms();
            let buffer = PlaybackBuffer {
                id,
                samples: pcm::decode_samples(&frame.samples),
                sample_rate: frame.sample_rate,
            };
            let ended = EndedSignal::new(id, self.ended_tx.clone());

            match self.output.start(buffer, ended) {
                Ok(handle) => {
                    debug!("Playing frame {} ({}ms)", sequence, duration_ms);
                    self.played += 1;
                    self.current = Some(Current {
                        id,
                        sequence,
                        handle,
                    });
                    return;
                }
                Err(e) => {
                    error!("Failed to play frame {} on {}: {}", sequence, self.output.name(), e);
                }
            }
        }
    }
}

enum PlaybackCommand {
    Enqueue(AudioFrame),
    Flush,
    Close(oneshot::Sender<()>),
}

/// Cloneable handle feeding the playback worker
#[derive(Clone)]
pub struct PlaybackSender {
    tx: mpsc::UnboundedSender<PlaybackCommand>,
}

impl PlaybackSender {
    pub fn enqueue(&self, frame: AudioFrame) {
        if self.tx.send(PlaybackCommand::Enqueue(frame)).is_err() {
            warn!("Playback worker is gone, dropping frame");
        }
    }

    pub fn flush(&self) {
        // Nothing to flush once the worker has closed
        let _ = self.tx.send(PlaybackCommand::Flush);
    }

    /// Flush, release the output and wait for the worker to finish
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PlaybackCommand::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Run `queue` in its own task
pub fn spawn_worker(
    mut queue: PlaybackQueue,
    mut ended_rx: mpsc::UnboundedReceiver<u64>,
) -> (PlaybackSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        debug!("Playback worker started on {}", queue.output.name());

        loop {
            tokio::select! {
                biased;

                command = rx.recv() => match command {
                    Some(PlaybackCommand::Enqueue(frame)) => queue.enqueue(frame),
                    Some(PlaybackCommand::Flush) => queue.flush(),
                    Some(PlaybackCommand::Close(ack)) => {
                        queue.close();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        queue.close();
                        break;
                    }
                },
                Some(id) = ended_rx.recv() => queue.on_ended(id),
            }
        }

        info!(
            "Playback worker stopped ({} frames played, {} flushed)",
            queue.played(),
            queue.flushed()
        );
    });

    (PlaybackSender { tx }, task)
}
