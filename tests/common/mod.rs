//! Shared test utilities
//!
//! In-memory stand-ins for the audio devices and remote services, so the
//! engine can be driven without hardware or network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use kiosk_voice::audio::{
    AudioFormat, AudioFrame, CapturePipeline, CaptureStream, EncodedChunk, InputDevice,
    OutputDevice, PlaybackEvent, SegmentId, encode,
};
use kiosk_voice::config::LiveConfig;
use kiosk_voice::live::{
    Connector, InboundMessage, OutboundMessage, Transport, TransportSink, TransportSource,
};
use kiosk_voice::speech::{ChatTurn, SpeechSynthesizer, TextGenerator};
use kiosk_voice::{Collaborators, Config, Engine, Error, Result};

/// Device rate used by [`ManualOutput`]; the lowest rate a peer may declare
pub const TEST_RATE: u32 = 8000;

/// PCM chunk of `ms` milliseconds at [`TEST_RATE`]
pub fn chunk_ms(ms: usize) -> EncodedChunk {
    encode(&AudioFrame::new(vec![1000; ms * 8], TEST_RATE))
}

/// Chunk whose payload is one byte, which no PCM frame can be
pub fn malformed_chunk() -> EncodedChunk {
    EncodedChunk::new("AA==".to_string(), AudioFormat::pcm(TEST_RATE))
}

/// Engine configuration sized for tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.live.frame_size = 4;
    config.live.outbound_queue_limit = 3;
    config.live.close_grace = Duration::from_millis(50);
    config.live.output_sample_rate = TEST_RATE;
    config.text.system_prompt = Some("be brief".to_string());
    config.text.fallback_message = "Sorry, please ask again.".to_string();
    config
}

/// A segment placed on the [`ManualOutput`] timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placed {
    pub id: SegmentId,
    pub start: f64,
    pub end: f64,
}

struct ManualState {
    clock: f64,
    pending: Vec<Placed>,
    history: Vec<Placed>,
}

/// Output device whose clock only moves when the test says so
#[derive(Clone)]
pub struct ManualOutput {
    state: Arc<Mutex<ManualState>>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl ManualOutput {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let output = Self {
            state: Arc::new(Mutex::new(ManualState {
                clock: 0.0,
                pending: Vec::new(),
                history: Vec::new(),
            })),
            events,
        };
        (output, rx)
    }

    /// Move the clock and report every segment that has finished by `t`
    pub fn advance_to(&self, t: f64) {
        let mut state = self.state.lock().unwrap();
        state.clock = t;

        let mut finished: Vec<Placed> = Vec::new();
        state.pending.retain(|seg| {
            if seg.end <= t + 1e-9 {
                finished.push(*seg);
                false
            } else {
                true
            }
        });
        finished.sort_by(|a, b| a.end.total_cmp(&b.end));

        for seg in finished {
            let _ = self.events.send(PlaybackEvent::SegmentEnded {
                id: seg.id,
                at: seg.end,
            });
        }
    }

    /// Every segment ever started, in scheduling order
    pub fn started(&self) -> Vec<Placed> {
        self.state.lock().unwrap().history.clone()
    }

    /// Segments queued or playing
    pub fn pending(&self) -> Vec<Placed> {
        self.state.lock().unwrap().pending.clone()
    }
}

impl OutputDevice for ManualOutput {
    fn sample_rate(&self) -> u32 {
        TEST_RATE
    }

    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().clock
    }

    fn start_at(&mut self, id: SegmentId, frame: AudioFrame, at: f64) {
        let placed = Placed {
            id,
            start: at,
            end: at + frame.duration(),
        };
        let mut state = self.state.lock().unwrap();
        state.pending.push(placed);
        state.history.push(placed);
    }

    fn stop_all(&mut self) -> usize {
        let mut state = self.state.lock().unwrap();
        let removed = state.pending.len();
        state.pending.clear();
        removed
    }
}

/// Microphone driven by [`FakeInput::feed`]
#[derive(Clone, Default)]
pub struct FakeInput {
    pipeline: Arc<Mutex<Option<CapturePipeline>>>,
    fail: Arc<AtomicBool>,
    delay: Arc<Mutex<Duration>>,
    opened: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl FakeInput {
    pub fn failing() -> Self {
        let input = Self::default();
        input.set_failing(true);
        input
    }

    /// Device whose open blocks the calling thread for `delay`
    pub fn slow(delay: Duration) -> Self {
        let input = Self::default();
        *input.delay.lock().unwrap() = delay;
        input
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Push mono samples as if the device callback fired
    pub fn feed(&self, samples: &[f32]) {
        if let Some(pipeline) = self.pipeline.lock().unwrap().as_ref() {
            pipeline.push_samples(samples, 1);
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

struct FakeStream {
    pipeline: CapturePipeline,
    released: Arc<AtomicUsize>,
    stopped: bool,
}

impl CaptureStream for FakeStream {
    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.pipeline.stop();
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl InputDevice for FakeInput {
    fn open(&self, pipeline: CapturePipeline) -> Result<Box<dyn CaptureStream>> {
        std::thread::sleep(*self.delay.lock().unwrap());
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Device("no microphone attached".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.pipeline.lock().unwrap() = Some(pipeline.clone());
        Ok(Box::new(FakeStream {
            pipeline,
            released: Arc::clone(&self.released),
            stopped: false,
        }))
    }
}

/// Test-side ends of one fake live connection
pub struct Remote {
    /// Messages the "server" sends to the engine
    pub inbound: mpsc::UnboundedSender<Result<InboundMessage>>,
    /// Messages the engine sent to the "server"
    pub sent: mpsc::UnboundedReceiver<OutboundMessage>,
    pub sink_closed: Arc<AtomicBool>,
}

impl Remote {
    pub fn send(&self, message: InboundMessage) {
        self.inbound.send(Ok(message)).unwrap();
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    closed: Arc<AtomicBool>,
    stalled: bool,
}

#[async_trait]
impl TransportSink for ChannelSink {
    async fn send(&mut self, message: OutboundMessage) -> Result<()> {
        if self.stalled {
            std::future::pending::<()>().await;
        }
        self.tx
            .send(message)
            .map_err(|_| Error::Connection("remote gone".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<InboundMessage>>,
}

#[async_trait]
impl TransportSource for ChannelSource {
    async fn recv(&mut self) -> Option<Result<InboundMessage>> {
        self.rx.recv().await
    }
}

/// Connector handing out in-memory channels
#[derive(Default)]
pub struct FakeConnector {
    remotes: Mutex<VecDeque<Remote>>,
    reject: AtomicBool,
    stall: AtomicBool,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn rejecting() -> Self {
        let connector = Self::default();
        connector.reject.store(true, Ordering::SeqCst);
        connector
    }

    /// Connections whose sends never complete
    pub fn stalling() -> Self {
        let connector = Self::default();
        connector.stall.store(true, Ordering::SeqCst);
        connector
    }

    /// Remote ends of the oldest connection not yet taken
    pub fn take_remote(&self) -> Remote {
        self.remotes
            .lock()
            .unwrap()
            .pop_front()
            .expect("no connection was made")
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _config: &LiveConfig) -> Result<Transport> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(Error::Connection("handshake rejected".to_string()));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        self.remotes.lock().unwrap().push_back(Remote {
            inbound: inbound_tx,
            sent: sent_rx,
            sink_closed: Arc::clone(&closed),
        });

        Ok(Transport {
            sink: Box::new(ChannelSink {
                tx: sent_tx,
                closed,
                stalled: self.stall.load(Ordering::SeqCst),
            }),
            source: Box::new(ChannelSource { rx: inbound_rx }),
        })
    }
}

/// Canned reply generator that records what it was asked
pub struct FakeGenerator {
    reply: std::result::Result<String, String>,
    calls: Mutex<Vec<(Vec<ChatTurn>, Option<String>)>>,
}

impl FakeGenerator {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            reply: Err(reason.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(Vec<ChatTurn>, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn generate(
        &self,
        history: &[ChatTurn],
        system_instruction: Option<&str>,
    ) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((history.to_vec(), system_instruction.map(ToString::to_string)));
        self.reply.clone().map_err(Error::Generation)
    }
}

/// Canned synthesizer
pub struct FakeSynth {
    reply: std::result::Result<EncodedChunk, String>,
    texts: Mutex<Vec<String>>,
}

impl FakeSynth {
    pub fn speaking(chunk: EncodedChunk) -> Self {
        Self {
            reply: Ok(chunk),
            texts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            reply: Err(reason.to_string()),
            texts: Mutex::new(Vec::new()),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynth {
    async fn synthesize(&self, text: &str) -> Result<EncodedChunk> {
        self.texts.lock().unwrap().push(text.to_string());
        self.reply.clone().map_err(Error::Synthesis)
    }
}

/// An engine wired to fakes, with handles on each fake
pub struct Harness {
    pub engine: Engine,
    pub output: ManualOutput,
    pub connector: Arc<FakeConnector>,
    pub input: FakeInput,
    pub generator: Arc<FakeGenerator>,
    pub synth: Arc<FakeSynth>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(
            FakeConnector::default(),
            FakeInput::default(),
            FakeGenerator::replying("The lift is on your left."),
            FakeSynth::speaking(chunk_ms(500)),
        )
    }

    pub fn with(
        connector: FakeConnector,
        input: FakeInput,
        generator: FakeGenerator,
        synth: FakeSynth,
    ) -> Self {
        let (output, playback_events) = ManualOutput::new();
        let connector = Arc::new(connector);
        let generator = Arc::new(generator);
        let synth = Arc::new(synth);

        let engine = Engine::new(
            test_config(),
            Box::new(output.clone()),
            playback_events,
            Collaborators {
                connector: connector.clone(),
                input: Arc::new(input.clone()),
                generator: generator.clone(),
                synthesizer: synth.clone(),
            },
        );

        Self {
            engine,
            output,
            connector,
            input,
            generator,
            synth,
        }
    }
}
