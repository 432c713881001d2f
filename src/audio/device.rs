//! cpal audio backend: default microphone and speakers.
//!
//! cpal streams are not `Send`, so each stream lives on its own thread for
//! the lifetime of the call. Input callbacks downmix to mono and forward
//! chunks over an unbounded channel; they never block.

use super::backend::{ActiveBuffer, AudioBackend, AudioOutput, EndedSignal, InputTrack, PlaybackBuffer};
use crate::error::{CallError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, DefaultStreamConfigError, FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Audio backend for the host's default devices
#[derive(Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl AudioBackend for CpalBackend {
    async fn open_input(&mut self) -> Result<InputTrack> {
        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let (info_tx, info_rx) = oneshot::channel();

        let stop_tx = spawn_stream_thread("mic-capture", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| CallError::DeviceNotFound("no input device available".to_string()))?;
            let name = device.name().unwrap_or_else(|_| "default input".to_string());

            let supported = device.default_input_config().map_err(config_error)?;
            let format = supported.sample_format();
            let config: StreamConfig = supported.config();

            let stream = match format {
                SampleFormat::F32 => build_input::<f32>(&device, &config, samples_tx),
                SampleFormat::I16 => build_input::<i16>(&device, &config, samples_tx),
                SampleFormat::U16 => build_input::<u16>(&device, &config, samples_tx),
                other => {
                    return Err(CallError::CaptureUnsupported(format!(
                        "unsupported input sample format {:?}",
                        other
                    )))
                }
            }
            .map_err(build_error)?;

            let _ = info_tx.send((name, config.sample_rate.0, config.channels));
            Ok(stream)
        })
        .await?;

        let (name, sample_rate, channels) = info_rx
            .await
            .map_err(|_| CallError::CaptureUnsupported("input stream did not report its format".to_string()))?;

        info!(
            "Microphone '{}' opened ({}Hz, {} channels, downmixed to mono)",
            name, sample_rate, channels
        );

        Ok(InputTrack::new(name, sample_rate, samples_rx, stop_tx))
    }

    async fn open_output(&mut self) -> Result<Box<dyn AudioOutput>> {
        let renderer = Arc::new(Mutex::new(Renderer::new(0)));
        let (info_tx, info_rx) = oneshot::channel();

        let callback_renderer = Arc::clone(&renderer);
        let stop_tx = spawn_stream_thread("speaker-playback", move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| CallError::DeviceNotFound("no output device available".to_string()))?;
            let name = device.name().unwrap_or_else(|_| "default output".to_string());

            let supported = device.default_output_config().map_err(config_error)?;
            let format = supported.sample_format();
            let config: StreamConfig = supported.config();

            lock(&callback_renderer).lead = lead_samples(config.sample_rate.0);
            let stream = match format {
                SampleFormat::F32 => build_output::<f32>(&device, &config, callback_renderer),
                SampleFormat::I16 => build_output::<i16>(&device, &config, callback_renderer),
                SampleFormat::U16 => build_output::<u16>(&device, &config, callback_renderer),
                other => {
                    return Err(CallError::Playback(format!(
                        "unsupported output sample format {:?}",
                        other
                    )))
                }
            }
            .map_err(build_error)?;

            let _ = info_tx.send((name, config.sample_rate.0));
            Ok(stream)
        })
        .await?;

        let (name, device_rate) = info_rx
            .await
            .map_err(|_| CallError::Playback("output stream did not report its format".to_string()))?;

        info!("Speaker '{}' opened ({}Hz)", name, device_rate);

        Ok(Box::new(CpalOutput {
            name,
            device_rate,
            renderer,
            stop_tx: Some(stop_tx),
        }))
    }

    fn name(&self) -> &str {
        "cpal"
    }
}

/// Build and play a stream on a dedicated thread.
///
/// Returns the sender that stops the stream; dropping it stops it too.
async fn spawn_stream_thread<F>(name: &str, build: F) -> Result<oneshot::Sender<()>>
where
    F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let thread_name = name.to_string();

    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let stream = match build() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(classify_backend(&e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Either an explicit stop or the owner going away ends the stream
            let _ = stop_rx.blocking_recv();
            drop(stream);
            debug!("Stream thread '{}' released its device", thread_name);
        })
        .map_err(|e| CallError::CaptureUnsupported(format!("Failed to spawn audio thread: {}", e)))?;

    ready_rx
        .await
        .map_err(|_| CallError::CaptureUnsupported(format!("{} thread exited during setup", name)))??;

    Ok(stop_tx)
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    tx: mpsc::UnboundedSender<Vec<f32>>,
) -> std::result::Result<cpal::Stream, BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = data
                .chunks(channels)
                .map(|frame| {
                    let sum: f32 = frame.iter().map(|&s| f32::from_sample(s)).sum();
                    sum / frame.len() as f32
                })
                .collect();
            // Receiver gone means the call is tearing down
            let _ = tx.send(mono);
        },
        |err| {
            error!(error = %err, "audio capture error");
        },
        None,
    )
}

/// How long before a buffer runs out the next one is requested
const PLAYBACK_LEAD: std::time::Duration = std::time::Duration::from_millis(50);

fn lead_samples(device_rate: u32) -> usize {
    (u128::from(device_rate) * PLAYBACK_LEAD.as_millis() / 1000) as usize
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    renderer: Arc<Mutex<Renderer>>,
) -> std::result::Result<cpal::Stream, BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels.max(1));

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut renderer = lock(&renderer);
            for frame in data.chunks_mut(channels) {
                let value = renderer.next_sample();
                for out in frame.iter_mut() {
                    *out = T::from_sample(value);
                }
            }
        },
        |err| {
            error!(error = %err, "audio playback error");
        },
        None,
    )
}

/// A buffer handed to the output callback
struct Voice {
    id: u64,
    samples: Vec<f32>,
    position: usize,
    ended: Option<EndedSignal>,
}

impl Voice {
    fn remaining(&self) -> usize {
        self.samples.len() - self.position
    }

    fn report_ended(&mut self) {
        if let Some(ended) = self.ended.take() {
            ended.fire();
        }
    }
}

/// What the output callback renders.
///
/// A voice reports completion once fewer than `lead` samples are left, so
/// the queue can hand over the next buffer while the tail still plays. That
/// buffer waits in `pending` and takes over on the very next sample.
/// Completion is only reported for `current`, so `pending` holds at most one
/// voice.
struct Renderer {
    current: Option<Voice>,
    pending: Option<Voice>,
    lead: usize,
}

impl Renderer {
    fn new(lead: usize) -> Self {
        Self {
            current: None,
            pending: None,
            lead,
        }
    }

    fn push(&mut self, voice: Voice) -> Result<()> {
        if self.current.is_none() {
            self.current = Some(voice);
        } else if self.pending.is_none() {
            self.pending = Some(voice);
        } else {
            return Err(CallError::Playback(format!(
                "output already has a buffer queued behind the playing one (buffer {})",
                voice.id
            )));
        }
        Ok(())
    }

    fn next_sample(&mut self) -> f32 {
        loop {
            let Some(voice) = self.current.as_mut() else {
                match self.pending.take() {
                    Some(next) => {
                        self.current = Some(next);
                        continue;
                    }
                    None => return 0.0,
                }
            };

            if let Some(&sample) = voice.samples.get(voice.position) {
                voice.position += 1;
                if voice.remaining() <= self.lead {
                    voice.report_ended();
                }
                return sample;
            }

            // Exhausted; an empty voice may not have reported yet
            if let Some(mut done) = self.current.take() {
                done.report_ended();
            }
            self.current = self.pending.take();
            if self.current.is_none() {
                return 0.0;
            }
        }
    }

    /// Silence immediately if `id` is playing or queued, without firing
    /// its completion; a finished tail still playing goes too
    fn stop(&mut self, id: u64) {
        let holds = |voice: &Option<Voice>| voice.as_ref().is_some_and(|v| v.id == id);
        if holds(&self.current) || holds(&self.pending) {
            self.clear();
        }
    }

    fn clear(&mut self) {
        self.current = None;
        self.pending = None;
    }
}

fn lock(renderer: &Mutex<Renderer>) -> MutexGuard<'_, Renderer> {
    renderer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct CpalOutput {
    name: String,
    device_rate: u32,
    renderer: Arc<Mutex<Renderer>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl AudioOutput for CpalOutput {
    fn start(&mut self, buffer: PlaybackBuffer, ended: EndedSignal) -> Result<Box<dyn ActiveBuffer>> {
        if self.stop_tx.is_none() {
            return Err(CallError::Playback("output device is closed".to_string()));
        }

        // Resampled here so the callback only ever copies samples
        let samples = resample(&buffer.samples, buffer.sample_rate, self.device_rate)?;
        lock(&self.renderer).push(Voice {
            id: buffer.id,
            samples,
            position: 0,
            ended: Some(ended),
        })?;

        Ok(Box::new(CpalActive {
            id: buffer.id,
            renderer: Arc::clone(&self.renderer),
        }))
    }

    fn close(&mut self) {
        lock(&self.renderer).clear();
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
            debug!("Speaker '{}' released", self.name);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct CpalActive {
    id: u64,
    renderer: Arc<Mutex<Renderer>>,
}

impl ActiveBuffer for CpalActive {
    fn stop(&mut self) {
        lock(&self.renderer).stop(self.id);
    }
}

/// Resample a mono buffer to the device rate
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let mut resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, samples.len(), 1)
        .map_err(|e| CallError::Playback(format!("Resampler init failed: {}", e)))?;
    let delay = resampler.output_delay();

    let mut output = resampler
        .process(&[samples], None)
        .map_err(|e| CallError::Playback(format!("Resample failed: {}", e)))?
        .remove(0);
    let tail = resampler
        .process_partial(None::<&[&[f32]]>, None)
        .map_err(|e| CallError::Playback(format!("Resample failed: {}", e)))?;
    output.extend_from_slice(&tail[0]);

    let expected = (samples.len() as f64 * ratio).round() as usize;
    Ok(output.into_iter().skip(delay).take(expected).collect())
}

fn config_error(e: DefaultStreamConfigError) -> CallError {
    match e {
        DefaultStreamConfigError::DeviceNotAvailable => {
            CallError::DeviceNotFound("audio device is no longer available".to_string())
        }
        DefaultStreamConfigError::StreamTypeNotSupported => {
            CallError::CaptureUnsupported("device does not support streaming".to_string())
        }
        DefaultStreamConfigError::BackendSpecific { err } => classify_backend(&err.description),
    }
}

fn build_error(e: BuildStreamError) -> CallError {
    match e {
        BuildStreamError::DeviceNotAvailable => {
            CallError::DeviceNotFound("audio device is no longer available".to_string())
        }
        BuildStreamError::BackendSpecific { err } => classify_backend(&err.description),
        other => CallError::CaptureUnsupported(other.to_string()),
    }
}

/// Host backends report access problems as free-form text
fn classify_backend(description: &str) -> CallError {
    let lower = description.to_lowercase();
    if ["permission", "denied", "not authorized", "not permitted"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        CallError::PermissionDenied(description.to_string())
    } else {
        CallError::CaptureUnsupported(description.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(id: u64, samples: &[f32], tx: &mpsc::UnboundedSender<u64>) -> Voice {
        Voice {
            id,
            samples: samples.to_vec(),
            position: 0,
            ended: Some(EndedSignal::new(id, tx.clone())),
        }
    }

    #[test]
    fn test_voice_fires_once_after_last_sample() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut renderer = Renderer::new(0);
        renderer.push(voice(7, &[0.25, -0.25], &tx)).unwrap();

        assert_eq!(renderer.next_sample(), 0.25);
        assert!(rx.try_recv().is_err());
        assert_eq!(renderer.next_sample(), -0.25);
        assert_eq!(rx.try_recv().ok(), Some(7));

        assert_eq!(renderer.next_sample(), 0.0);
        assert!(renderer.current.is_none());
        assert_eq!(renderer.next_sample(), 0.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_next_voice_follows_without_silence() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut renderer = Renderer::new(2);
        renderer.push(voice(0, &[0.1, 0.2, 0.3, 0.4], &tx)).unwrap();

        let mut rendered = vec![renderer.next_sample()];
        assert!(rx.try_recv().is_err());
        rendered.push(renderer.next_sample());

        // Two samples left: the queue is asked for the next buffer
        assert_eq!(rx.try_recv().ok(), Some(0));
        renderer.push(voice(1, &[0.5, 0.6, 0.7], &tx)).unwrap();

        for _ in 0..5 {
            rendered.push(renderer.next_sample());
        }
        assert_eq!(rendered, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7]);
        assert_eq!(rx.try_recv().ok(), Some(1));
        assert!(rx.try_recv().is_err());

        assert_eq!(renderer.next_sample(), 0.0);
    }

    #[test]
    fn test_short_voices_chain_back_to_back() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut renderer = Renderer::new(480);

        renderer.push(voice(0, &[0.1], &tx)).unwrap();
        assert_eq!(renderer.next_sample(), 0.1);
        assert_eq!(rx.try_recv().ok(), Some(0));

        // A second waiting buffer is refused until the first one hands over
        renderer.push(voice(1, &[0.2], &tx)).unwrap();
        assert!(renderer.push(voice(2, &[0.3], &tx)).is_err());

        assert_eq!(renderer.next_sample(), 0.2);
        assert_eq!(rx.try_recv().ok(), Some(1));
    }

    #[test]
    fn test_stop_silences_pending_and_tail() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut renderer = Renderer::new(4);
        renderer.push(voice(0, &[0.1; 6], &tx)).unwrap();
        renderer.next_sample();
        renderer.next_sample();
        assert_eq!(rx.try_recv().ok(), Some(0));
        renderer.push(voice(1, &[0.5; 6], &tx)).unwrap();

        // Unknown ids leave playback alone
        renderer.stop(42);
        assert!(renderer.pending.is_some());

        renderer.stop(1);
        assert_eq!(renderer.next_sample(), 0.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_lead_covers_fifty_milliseconds() {
        assert_eq!(lead_samples(48000), 2400);
        assert_eq!(lead_samples(44100), 2205);
    }

    #[test]
    fn test_resample_scales_length() {
        let samples = vec![0.1; 1000];
        let out = resample(&samples, 24000, 48000).unwrap();
        assert!((out.len() as i64 - 2000).abs() <= 2, "got {} samples", out.len());

        let same = resample(&samples, 48000, 48000).unwrap();
        assert_eq!(same.len(), 1000);
    }

    #[test]
    fn test_permission_text_is_classified() {
        assert!(matches!(
            classify_backend("Permission denied (os error 13)"),
            CallError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_backend("ALSA function 'snd_pcm_open' failed"),
            CallError::CaptureUnsupported(_)
        ));
    }
}
