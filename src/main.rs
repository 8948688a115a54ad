use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use kiosk_voice::audio::{
    self, AudioFrame, CapturePipeline, CaptureStream, EncodedChunk, InputDevice,
    MicrophoneInput, PlaybackEvent, PlaybackScheduler, SpeakerOutput,
};
use kiosk_voice::config::file;
use kiosk_voice::live::WebSocketConnector;
use kiosk_voice::speech::{ChatCompletionsClient, SpeechSynthesizer, TextToSpeech};
use kiosk_voice::{Collaborators, Config, Engine, EngineNotice, SessionState};

/// Kiosk - real-time voice session engine for kiosk assistants
#[derive(Parser)]
#[command(name = "kiosk", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/kiosk-voice/config.toml)
    #[arg(short, long, env = "KIOSK_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open a live voice session on the default microphone and speaker
    Live,
    /// Answer one text turn through text-to-speech
    Say {
        /// Text to submit
        text: String,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Write the captured audio to a WAV file
        #[arg(short, long)]
        record: Option<PathBuf>,
    },
    /// Play three back-to-back tones through the scheduler
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,kiosk_voice=info",
        1 => "info,kiosk_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_sources(file::load_config_from(path), |key| {
            std::env::var(key).ok()
        })?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Live => live(config).await,
        Command::Say { text } => say(config, &text).await,
        Command::TestMic { duration, record } => test_mic(&config, duration, record).await,
        Command::TestSpeaker => test_speaker(&config).await,
    }
}

/// Stand-in when no TTS provider is configured; text turns fail with the reason
struct NoSynthesizer(String);

#[async_trait]
impl SpeechSynthesizer for NoSynthesizer {
    async fn synthesize(&self, _text: &str) -> kiosk_voice::Result<EncodedChunk> {
        Err(kiosk_voice::Error::Synthesis(self.0.clone()))
    }
}

/// Wire the engine to the default devices and HTTP/WebSocket collaborators
fn build_engine(config: Config) -> anyhow::Result<Engine> {
    let (playback_tx, playback_rx) = mpsc::unbounded_channel();
    let output = SpeakerOutput::open(config.playback.sample_rate, playback_tx)?;

    let synthesizer: Arc<dyn SpeechSynthesizer> = match TextToSpeech::from_config(&config.tts) {
        Ok(tts) => Arc::new(tts),
        Err(e) => {
            tracing::warn!(error = %e, "text-to-speech unavailable");
            Arc::new(NoSynthesizer(e.to_string()))
        }
    };

    let collaborators = Collaborators {
        connector: Arc::new(WebSocketConnector::new()),
        input: Arc::new(MicrophoneInput::new(config.live.input_sample_rate)),
        generator: Arc::new(ChatCompletionsClient::new(&config.text)),
        synthesizer,
    };

    Ok(Engine::new(config, Box::new(output), playback_rx, collaborators))
}

fn print_notice(notice: &EngineNotice) {
    match notice {
        EngineNotice::Backpressure { limit } => {
            println!("! network is slow, {limit} frames waiting");
        }
        EngineNotice::Drained => println!("! network caught up"),
        EngineNotice::Interrupted { discarded } => {
            println!("! interrupted ({discarded} segments discarded)");
        }
        EngineNotice::Reply(text) | EngineNotice::Transcript(text) => println!("> {text}"),
        EngineNotice::TurnFailed { error, fallback } => {
            eprintln!("turn failed: {error}");
            println!("> {fallback}");
        }
        EngineNotice::SessionClosed { reason } => {
            println!(
                "session closed: {}",
                reason.as_deref().unwrap_or("connection ended")
            );
        }
    }
}

/// Run a live session until Ctrl-C or the server ends it
async fn live(config: Config) -> anyhow::Result<()> {
    let handle = build_engine(config)?.spawn();
    let mut state = handle.state();
    let mut notices = handle.notices();

    let session = handle.open().await?;
    println!("Live session {session} open. Speak to the kiosk; Ctrl-C to stop.\n");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("[{}]", *state.borrow_and_update());
            }
            notice = notices.recv() => match notice {
                Ok(notice) => {
                    print_notice(&notice);
                    if matches!(notice, EngineNotice::SessionClosed { .. }) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "notice receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    handle.close().await?;
    handle.shutdown().await;
    Ok(())
}

/// Run one text-mode turn and wait for playback to finish
async fn say(config: Config, text: &str) -> anyhow::Result<()> {
    let handle = build_engine(config)?.spawn();
    let mut state = handle.state();
    let mut notices = handle.notices();

    handle.send_text(text).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() || *state.borrow_and_update() == SessionState::Idle {
                    break;
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) => print_notice(&notice),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    // Notices that raced with the final state change
    while let Ok(notice) = notices.try_recv() {
        print_notice(&notice);
    }

    handle.shutdown().await;
    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Capture for `duration` seconds, printing a level meter per frame
async fn test_mic(config: &Config, duration: u64, record: Option<PathBuf>) -> anyhow::Result<()> {
    let rate = config.live.input_sample_rate;
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (tx, mut rx) = mpsc::unbounded_channel::<EncodedChunk>();
    let pipeline = CapturePipeline::new(config.live.frame_size, rate, move |chunk: EncodedChunk| {
        let _ = tx.send(chunk);
    });
    let mut stream = MicrophoneInput::new(rate).open(pipeline.clone())?;

    println!("Sample rate: {rate} Hz, frame: {} samples", config.live.frame_size);
    println!("---");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut frames: Vec<AudioFrame> = Vec::new();
    let mut index = 0usize;

    while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        let frame = audio::decode(&chunk, rate)?;
        let samples = frame.to_f32();
        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        index += 1;
        println!("[{index:3}] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]");

        if record.is_some() {
            frames.push(frame);
        }
    }

    stream.stop();
    println!("\n---");
    println!("{} frames captured", pipeline.delivered());

    if let Some(path) = record {
        let wav = audio::frames_to_wav(&frames)?;
        std::fs::write(&path, wav)?;
        println!("Recorded {} frames to {}", frames.len(), path.display());
    }

    if index == 0 {
        println!("No frames arrived. Check:");
        println!("  1. Is your mic plugged in?");
        println!("  2. Run: pactl info | grep 'Default Source'");
        println!("  3. Run: arecord -l (to list devices)");
    }

    Ok(())
}

/// Schedule three tones back to back; any gap between them is audible
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear three rising tones with no gaps between them\n");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let output = SpeakerOutput::open(config.playback.sample_rate, tx)?;
    let mut scheduler = PlaybackScheduler::with_epsilon(output, config.playback.drain_epsilon);
    let rate = scheduler.sample_rate();

    for frequency in [440.0f32, 554.37, 659.25] {
        let frame = tone(frequency, rate, 0.6);
        let segment = scheduler.schedule(frame);
        println!(
            "{frequency:7.2} Hz  start {:.3}s  end {:.3}s",
            segment.start, segment.end
        );
    }

    let mut remaining = 3;
    while remaining > 0 {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(PlaybackEvent::SegmentEnded { id, at })) => {
                println!("segment {} ended at {at:.3}s", id.0);
                remaining -= 1;
            }
            Ok(None) | Err(_) => anyhow::bail!("playback did not complete"),
        }
    }

    println!("\n---");
    println!("If you heard the tones, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Sine tone at 30% volume
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn tone(frequency: f32, sample_rate: u32, seconds: f32) -> AudioFrame {
    let num_samples = (sample_rate as f32 * seconds) as usize;
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();
    AudioFrame::from_f32(&samples, sample_rate)
}
