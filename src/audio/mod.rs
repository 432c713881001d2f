pub mod backend;
pub mod capture;
pub mod context;
#[cfg(feature = "device-audio")]
pub mod device;
pub mod pcm;
pub mod playback;

pub use backend::{ActiveBuffer, AudioBackend, AudioFrame, AudioOutput, EndedSignal, InputTrack, PlaybackBuffer};
pub use capture::{CapturePipeline, FrameAssembler};
pub use context::AudioContext;
#[cfg(feature = "device-audio")]
pub use device::CpalBackend;
pub use playback::{PlaybackQueue, PlaybackSender};
