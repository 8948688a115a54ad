//! Audio capture from microphone
//!
//! The device callback pushes raw samples into a [`CapturePipeline`], which
//! cuts them into fixed-size frames, encodes each one and hands it to a
//! [`ChunkSink`] without blocking.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use super::codec::{self, AudioFrame, EncodedChunk};
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per outbound frame
pub const FRAME_SIZE: usize = 4096;

/// Receives encoded capture frames; must not block
pub trait ChunkSink: Send {
    fn deliver(&self, chunk: EncodedChunk);
}

impl<F> ChunkSink for F
where
    F: Fn(EncodedChunk) + Send,
{
    fn deliver(&self, chunk: EncodedChunk) {
        self(chunk);
    }
}

/// Cuts a sample stream into fixed-size mono frames
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameAssembler {
    #[must_use]
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            sample_rate,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Append interleaved samples, returning every frame completed by them
    ///
    /// Multi-channel input is averaged down to mono.
    #[allow(clippy::cast_precision_loss)]
    pub fn push(&mut self, data: &[f32], channels: usize) -> Vec<AudioFrame> {
        if channels <= 1 {
            self.pending.extend_from_slice(data);
        } else {
            self.pending.extend(
                data.chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
            );
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let samples: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            frames.push(AudioFrame::from_f32(&samples, self.sample_rate));
        }
        frames
    }

    /// Samples waiting for a full frame
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

struct PipelineState {
    active: bool,
    assembler: FrameAssembler,
    sink: Option<Box<dyn ChunkSink>>,
    delivered: u64,
}

/// Push-driven capture pipeline shared with the input device callback
#[derive(Clone)]
pub struct CapturePipeline {
    state: Arc<Mutex<PipelineState>>,
}

impl CapturePipeline {
    /// Create an active pipeline delivering to `sink`
    #[must_use]
    pub fn new(frame_size: usize, sample_rate: u32, sink: impl ChunkSink + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(PipelineState {
                active: true,
                assembler: FrameAssembler::new(frame_size, sample_rate),
                sink: Some(Box::new(sink)),
                delivered: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed interleaved samples from the device
    ///
    /// Complete frames are encoded and delivered in order. Nothing is
    /// delivered once [`Self::stop`] has returned.
    pub fn push_samples(&self, data: &[f32], channels: usize) {
        let frames = {
            let mut state = self.lock();
            if !state.active {
                return;
            }
            state.assembler.push(data, channels)
        };

        for frame in frames {
            let chunk = codec::encode(&frame);

            // Delivery and stop share the lock, so a frame that was in
            // flight when stop ran is dropped here
            let mut state = self.lock();
            if !state.active {
                tracing::trace!("dropping capture frame after stop");
                return;
            }
            if let Some(sink) = &state.sink {
                sink.deliver(chunk);
                state.delivered += 1;
            }
        }
    }

    /// Stop delivering frames and release the sink; idempotent
    pub fn stop(&self) {
        let mut state = self.lock();
        if !state.active {
            return;
        }
        state.active = false;
        state.sink = None;
        state.assembler.clear();
        tracing::debug!(delivered = state.delivered, "capture pipeline stopped");
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Number of frames handed to the sink so far
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }
}

/// Handle to a running input stream
pub trait CaptureStream: Send {
    /// Stop capture and release the device; idempotent
    fn stop(&mut self);
}

/// Source of microphone audio
pub trait InputDevice: Send + Sync {
    /// Acquire the device and start feeding `pipeline`
    ///
    /// # Errors
    ///
    /// Returns `Device` if the microphone cannot be acquired
    fn open(&self, pipeline: CapturePipeline) -> Result<Box<dyn CaptureStream>>;
}

/// Captures audio from the default input device
#[derive(Debug, Clone, Copy)]
pub struct MicrophoneInput {
    sample_rate: u32,
}

impl MicrophoneInput {
    #[must_use]
    pub const fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Default for MicrophoneInput {
    fn default() -> Self {
        Self::new(SAMPLE_RATE)
    }
}

impl InputDevice for MicrophoneInput {
    fn open(&self, pipeline: CapturePipeline) -> Result<Box<dyn CaptureStream>> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
        let sample_rate = self.sample_rate;
        let worker_pipeline = pipeline.clone();

        let worker = std::thread::Builder::new()
            .name("kiosk-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(sample_rate, worker_pipeline) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("audio capture stopped");
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Device("capture thread exited during startup".to_string()))??;

        tracing::debug!(sample_rate, "audio capture started");

        Ok(Box::new(MicrophoneStream {
            pipeline,
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        }))
    }
}

struct MicrophoneStream {
    pipeline: CapturePipeline,
    shutdown: Option<std::sync::mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureStream for MicrophoneStream {
    fn stop(&mut self) {
        // Gate first so frames still inside the callback are dropped
        self.pipeline.stop();
        self.shutdown.take();
        if let Some(worker) = self.worker.take() {
            join_worker(worker);
        }
    }
}

/// Join the capture thread, on the blocking pool when inside a runtime
fn join_worker(worker: JoinHandle<()>) {
    let join = move || {
        if worker.join().is_err() {
            tracing::warn!("audio capture thread panicked");
        }
    };

    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Find a mono config at `sample_rate`, else any channel count at that rate
fn select_input_config(device: &cpal::Device, sample_rate: u32) -> Result<StreamConfig> {
    let rate = SampleRate(sample_rate);
    let configs: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| Error::Device(e.to_string()))?
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .collect();

    configs
        .iter()
        .find(|c| c.channels() == 1)
        .or_else(|| configs.first())
        .cloned()
        .map(|c| c.with_sample_rate(rate).config())
        .ok_or_else(|| Error::Device("no suitable audio config found".to_string()))
}

fn build_input_stream(sample_rate: u32, pipeline: CapturePipeline) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Device("no input device available".to_string()))?;

    let config = select_input_config(&device, sample_rate)?;
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio capture initialized"
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                pipeline.push_samples(data, channels);
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))?;

    stream.play().map_err(|e| Error::Device(e.to_string()))?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use super::*;

    /// Stream whose worker takes `linger` to exit after shutdown
    fn lingering_stream(linger: Duration) -> (MicrophoneStream, Arc<AtomicBool>) {
        let pipeline = CapturePipeline::new(2, 16_000, |_: EncodedChunk| {});
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let exited = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exited);
        let worker = std::thread::spawn(move || {
            let _ = shutdown_rx.recv();
            std::thread::sleep(linger);
            flag.store(true, Ordering::SeqCst);
        });

        let stream = MicrophoneStream {
            pipeline,
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        };
        (stream, exited)
    }

    #[test]
    fn test_assembler_emits_full_frames_only() {
        let mut assembler = FrameAssembler::new(4, 16_000);

        assert!(assembler.push(&[0.1, 0.2, 0.3], 1).is_empty());
        assert_eq!(assembler.pending(), 3);

        let frames = assembler.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9], 1);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == 4));
        assert_eq!(assembler.pending(), 1);
    }

    #[test]
    fn test_assembler_downmixes_stereo() {
        let mut assembler = FrameAssembler::new(2, 16_000);
        let frames = assembler.push(&[1.0, 0.0, -0.5, -0.5], 2);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples(), &[16384, -16384]);
    }

    #[test]
    fn test_pipeline_delivers_in_order() {
        let (tx, rx) = mpsc::channel();
        let pipeline = CapturePipeline::new(2, 16_000, move |chunk: EncodedChunk| {
            let _ = tx.send(chunk);
        });

        pipeline.push_samples(&[0.0, 0.1, 0.2, 0.3, 0.4], 1);

        let first = codec::decode(&rx.try_recv().unwrap(), 16_000).unwrap();
        let second = codec::decode(&rx.try_recv().unwrap(), 16_000).unwrap();
        assert_eq!(first.samples(), &[0, 3277]);
        assert_eq!(second.samples(), &[6553, 9830]);
        assert!(rx.try_recv().is_err());
        assert_eq!(pipeline.delivered(), 2);
    }

    #[test]
    fn test_no_delivery_after_stop() {
        let (tx, rx) = mpsc::channel();
        let pipeline = CapturePipeline::new(2, 16_000, move |chunk: EncodedChunk| {
            let _ = tx.send(chunk);
        });

        pipeline.push_samples(&[0.0], 1);
        pipeline.stop();
        pipeline.stop();
        pipeline.push_samples(&[0.1, 0.2, 0.3], 1);

        assert!(!pipeline.is_active());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_inside_runtime_does_not_wait_for_worker() {
        let (mut stream, exited) = lingering_stream(Duration::from_millis(300));
        let pipeline = stream.pipeline.clone();

        let started = Instant::now();
        stream.stop();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!pipeline.is_active());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(exited.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_outside_runtime_joins_worker() {
        let (mut stream, exited) = lingering_stream(Duration::from_millis(20));
        stream.stop();
        stream.stop();
        assert!(exited.load(Ordering::SeqCst));
    }
}
