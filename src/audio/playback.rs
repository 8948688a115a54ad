//! Audio playback to speakers
//!
//! Playback is timeline based: segments are placed at absolute device times
//! and mixed by the output callback, which also advances the device clock.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::codec::{AudioFrame, resample_linear};
use crate::{Error, Result};

/// Sample rate for playback (matches live and TTS output)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Identifier of one scheduled playback segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub u64);

/// Completion notifications raised by an output device
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackEvent {
    /// A segment played to its end at device time `at`
    SegmentEnded { id: SegmentId, at: f64 },
}

/// A device that plays frames at absolute times on its own clock
///
/// Implementations report natural completion of each segment as
/// [`PlaybackEvent::SegmentEnded`]. Segments removed by `stop_all` never
/// report completion.
pub trait OutputDevice: Send {
    /// Rate frames must be decoded to before scheduling
    fn sample_rate(&self) -> u32;

    /// Current device time in seconds
    fn current_time(&self) -> f64;

    /// Queue `frame` to begin at device time `at`
    fn start_at(&mut self, id: SegmentId, frame: AudioFrame, at: f64);

    /// Stop the playing segment and discard queued ones, returning how many were removed
    fn stop_all(&mut self) -> usize;
}

impl<T: OutputDevice + ?Sized> OutputDevice for Box<T> {
    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn current_time(&self) -> f64 {
        (**self).current_time()
    }

    fn start_at(&mut self, id: SegmentId, frame: AudioFrame, at: f64) {
        (**self).start_at(id, frame, at);
    }

    fn stop_all(&mut self) -> usize {
        (**self).stop_all()
    }
}

struct ActiveSegment {
    id: SegmentId,
    start: u64,
    samples: Vec<f32>,
}

impl ActiveSegment {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

/// Shared state between the output callback and the scheduler side
struct Timeline {
    clock: u64,
    sample_rate: u32,
    segments: Vec<ActiveSegment>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl Timeline {
    #[allow(clippy::cast_precision_loss)]
    fn seconds(&self, frames: u64) -> f64 {
        frames as f64 / f64::from(self.sample_rate.max(1))
    }

    /// Mix active segments into an interleaved output buffer
    fn render(&mut self, data: &mut [f32], channels: usize) {
        for frame in data.chunks_mut(channels.max(1)) {
            let t = self.clock;
            let mut mixed = 0.0f32;
            for seg in &self.segments {
                if t >= seg.start
                    && let Some(sample) = usize::try_from(t - seg.start)
                        .ok()
                        .and_then(|offset| seg.samples.get(offset))
                {
                    mixed += sample;
                }
            }

            let mixed = mixed.clamp(-1.0, 1.0);
            for out in frame.iter_mut() {
                *out = mixed;
            }
            self.clock += 1;
        }

        let clock = self.clock;
        let rate = self.sample_rate.max(1);
        let events = &self.events;
        self.segments.retain(|seg| {
            let end = seg.end();
            if end > clock {
                return true;
            }
            #[allow(clippy::cast_precision_loss)]
            let at = end as f64 / f64::from(rate);
            let _ = events.send(PlaybackEvent::SegmentEnded { id: seg.id, at });
            false
        });
    }
}

/// Plays scheduled frames to the default output device
pub struct SpeakerOutput {
    timeline: Arc<Mutex<Timeline>>,
    sample_rate: u32,
    shutdown: Option<std::sync::mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl SpeakerOutput {
    /// Open the default output device
    ///
    /// The stream lives on a dedicated thread; `events` receives segment
    /// completions from the output callback.
    ///
    /// # Errors
    ///
    /// Returns error if the audio device cannot be opened
    pub fn open(
        preferred_rate: u32,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Result<Self> {
        let timeline = Arc::new(Mutex::new(Timeline {
            clock: 0,
            sample_rate: preferred_rate,
            segments: Vec::new(),
            events,
        }));

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<u32>>();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
        let worker_timeline = Arc::clone(&timeline);

        let worker = std::thread::Builder::new()
            .name("kiosk-playback".to_string())
            .spawn(move || {
                let stream = match build_output_stream(preferred_rate, worker_timeline) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Blocks until shutdown is signalled or the sender is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("audio playback stopped");
            })?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| Error::Device("playback thread exited during startup".to_string()))??;

        Ok(Self {
            timeline,
            sample_rate,
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OutputDevice for SpeakerOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        let timeline = self.lock();
        timeline.seconds(timeline.clock)
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn start_at(&mut self, id: SegmentId, frame: AudioFrame, at: f64) {
        let samples = if frame.sample_rate() == self.sample_rate {
            frame.to_f32()
        } else {
            let resampled =
                resample_linear(frame.samples(), frame.sample_rate(), self.sample_rate);
            AudioFrame::new(resampled, self.sample_rate).to_f32()
        };

        let start = (at.max(0.0) * f64::from(self.sample_rate)).round() as u64;
        self.lock().segments.push(ActiveSegment { id, start, samples });
    }

    fn stop_all(&mut self) -> usize {
        let mut timeline = self.lock();
        let removed = timeline.segments.len();
        timeline.segments.clear();
        removed
    }
}

impl Drop for SpeakerOutput {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Find a config at `preferred_rate`, mono first then stereo, else the device default
fn select_output_config(device: &cpal::Device, preferred_rate: u32) -> Result<StreamConfig> {
    let rate = SampleRate(preferred_rate);
    let supports = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
        })
    };

    if let Some(config) = supports(1).or_else(|| supports(2)) {
        return Ok(config.with_sample_rate(rate).config());
    }

    let fallback = device
        .default_output_config()
        .map_err(|e| Error::Device(e.to_string()))?;
    tracing::warn!(
        preferred_rate,
        device_rate = fallback.sample_rate().0,
        "preferred playback rate unsupported, using device default"
    );
    Ok(fallback.config())
}

/// Build and start the output stream, returning it with its sample rate
fn build_output_stream(
    preferred_rate: u32,
    timeline: Arc<Mutex<Timeline>>,
) -> Result<(Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Device("no output device available".to_string()))?;

    let config = select_output_config(&device, preferred_rate)?;
    let channels = usize::from(config.channels);
    let sample_rate = config.sample_rate.0;

    timeline
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .sample_rate = sample_rate;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio playback initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if let Ok(mut timeline) = timeline.lock() {
                    timeline.render(data, channels);
                } else {
                    data.fill(0.0);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))?;

    stream.play().map_err(|e| Error::Device(e.to_string()))?;
    Ok((stream, sample_rate))
}
