//! Audio pipeline
//!
//! PCM conversion, microphone capture, and gapless playback scheduling.

pub mod capture;
pub mod codec;
pub mod playback;
pub mod scheduler;

pub use capture::{
    CapturePipeline, CaptureStream, ChunkSink, FRAME_SIZE, FrameAssembler, InputDevice,
    MicrophoneInput, SAMPLE_RATE,
};
pub use codec::{
    AudioFormat, AudioFrame, EncodedChunk, Encoding, decode, encode, frames_to_wav,
    resample_linear,
};
pub use playback::{OutputDevice, PLAYBACK_SAMPLE_RATE, PlaybackEvent, SegmentId, SpeakerOutput};
pub use scheduler::{PlaybackScheduler, ScheduledSegment};
