//! Configuration management for the kiosk voice engine
//!
//! Values are resolved per field: environment first, then the TOML file,
//! then built-in defaults.

pub mod file;

use std::time::Duration;

use crate::audio::scheduler::DEFAULT_DRAIN_EPSILON;
use crate::audio::{FRAME_SIZE, PLAYBACK_SAMPLE_RATE, SAMPLE_RATE};
use crate::live::outbound::DEFAULT_QUEUE_LIMIT;
use crate::{Error, Result};

use file::KioskConfigFile;

/// Default live WebSocket endpoint
pub const DEFAULT_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default live model
pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.0-flash-exp";

/// Default OpenAI-compatible base URL for text generation
pub const DEFAULT_TEXT_URL: &str = "https://api.openai.com/v1";

/// Default chat model
pub const DEFAULT_TEXT_MODEL: &str = "gpt-4o-mini";

/// How long a closing session may spend flushing queued frames
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Spoken when a text turn cannot be answered
pub const DEFAULT_FALLBACK_MESSAGE: &str = "Sorry, I couldn't answer that just now. Please try again.";

/// Kiosk voice engine configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Live session configuration
    pub live: LiveConfig,

    /// Speaker configuration
    pub playback: PlaybackConfig,

    /// Text-mode generation configuration
    pub text: TextConfig,

    /// Text-to-speech configuration
    pub tts: TtsConfig,
}

/// Live endpoint and capture configuration
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// WebSocket endpoint URL
    pub endpoint: String,

    /// API key appended as the `key` query parameter
    pub api_key: Option<String>,

    /// Live model identifier
    pub model: String,

    /// Prebuilt voice name
    pub voice: Option<String>,

    /// Instruction sent in the setup frame
    pub system_instruction: Option<String>,

    /// Samples per outbound frame
    pub frame_size: usize,

    /// Microphone sample rate
    pub input_sample_rate: u32,

    /// Rate assumed for inbound audio that carries no rate tag
    pub output_sample_rate: u32,

    /// Outbound queue bound
    pub outbound_queue_limit: usize,

    /// Flush window after close before the transport is dropped
    pub close_grace: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LIVE_URL.to_string(),
            api_key: None,
            model: DEFAULT_LIVE_MODEL.to_string(),
            voice: None,
            system_instruction: None,
            frame_size: FRAME_SIZE,
            input_sample_rate: SAMPLE_RATE,
            output_sample_rate: PLAYBACK_SAMPLE_RATE,
            outbound_queue_limit: DEFAULT_QUEUE_LIMIT,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

/// Speaker configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Preferred device sample rate
    pub sample_rate: u32,

    /// Window for deciding that playback has drained (seconds)
    pub drain_epsilon: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: PLAYBACK_SAMPLE_RATE,
            drain_epsilon: DEFAULT_DRAIN_EPSILON,
        }
    }
}

/// Text-mode generation configuration
#[derive(Debug, Clone)]
pub struct TextConfig {
    /// OpenAI-compatible base URL
    pub endpoint: String,

    /// Bearer token for the chat endpoint
    pub api_key: Option<String>,

    /// Chat model identifier
    pub model: String,

    /// System instruction prepended to every request
    pub system_prompt: Option<String>,

    /// Message the caller may show or speak when a turn fails
    pub fallback_message: String,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_TEXT_URL.to_string(),
            api_key: None,
            model: DEFAULT_TEXT_MODEL.to_string(),
            system_prompt: None,
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
        }
    }
}

/// TTS provider backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtsProvider {
    #[default]
    OpenAi,
    ElevenLabs,
}

impl std::str::FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "elevenlabs" | "eleven_labs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Audio container requested from `OpenAI`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenAiFormat {
    /// Raw 24kHz 16-bit mono
    #[default]
    Pcm,
    Mp3,
}

impl std::str::FromStr for OpenAiFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pcm" => Ok(Self::Pcm),
            "mp3" => Ok(Self::Mp3),
            other => Err(Error::Config(format!("unknown TTS format: {other}"))),
        }
    }
}

/// Text-to-speech configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub provider: TtsProvider,

    /// Key for the selected provider
    pub api_key: Option<String>,

    /// Voice identifier (`OpenAI` voice name or ElevenLabs voice id)
    pub voice: String,

    /// Model identifier
    pub model: String,

    /// Speed multiplier (`OpenAI` only)
    pub speed: f32,

    /// Response container (`OpenAI` only)
    pub format: OpenAiFormat,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self::for_provider(TtsProvider::OpenAi)
    }
}

impl TtsConfig {
    /// Provider defaults without credentials
    #[must_use]
    pub fn for_provider(provider: TtsProvider) -> Self {
        let (voice, model) = match provider {
            TtsProvider::OpenAi => ("alloy", "tts-1"),
            TtsProvider::ElevenLabs => ("21m00Tcm4TlvDq8ikWAM", "eleven_turbo_v2"),
        };
        Self {
            provider,
            api_key: None,
            voice: voice.to_string(),
            model: model.to_string(),
            speed: 1.0,
            format: OpenAiFormat::default(),
        }
    }
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn load() -> Result<Self> {
        let file = file::load_config_file();
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns `Config` if a numeric value, the TTS provider or the TTS
    /// format is invalid
    pub fn from_sources<F>(file: KioskConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let system_prompt = env("KIOSK_SYSTEM_PROMPT").or(file.system_prompt);

        let live_defaults = LiveConfig::default();
        let live = LiveConfig {
            endpoint: env("KIOSK_LIVE_URL")
                .or(file.live.url)
                .unwrap_or(live_defaults.endpoint),
            api_key: env("KIOSK_API_KEY")
                .or_else(|| env("GEMINI_API_KEY"))
                .or(file.api_keys.live),
            model: env("KIOSK_LIVE_MODEL")
                .or(file.live.model)
                .unwrap_or(live_defaults.model),
            voice: env("KIOSK_LIVE_VOICE").or(file.live.voice),
            system_instruction: system_prompt.clone(),
            frame_size: parse_env(&env, "KIOSK_FRAME_SIZE")?
                .or(file.live.frame_size)
                .unwrap_or(live_defaults.frame_size),
            input_sample_rate: file
                .live
                .input_sample_rate
                .unwrap_or(live_defaults.input_sample_rate),
            output_sample_rate: file
                .live
                .output_sample_rate
                .unwrap_or(live_defaults.output_sample_rate),
            outbound_queue_limit: parse_env(&env, "KIOSK_OUTBOUND_LIMIT")?
                .or(file.live.outbound_limit)
                .unwrap_or(live_defaults.outbound_queue_limit),
            close_grace: file
                .live
                .close_grace_ms
                .map_or(live_defaults.close_grace, Duration::from_millis),
        };

        if live.frame_size == 0 {
            return Err(Error::Config("frame size must be positive".to_string()));
        }
        if live.outbound_queue_limit == 0 {
            return Err(Error::Config("outbound limit must be positive".to_string()));
        }

        let playback_defaults = PlaybackConfig::default();
        let playback = PlaybackConfig {
            sample_rate: file
                .playback
                .sample_rate
                .unwrap_or(playback_defaults.sample_rate),
            drain_epsilon: file
                .playback
                .drain_epsilon
                .unwrap_or(playback_defaults.drain_epsilon),
        };

        let openai_key = env("OPENAI_API_KEY").or(file.api_keys.openai);
        let elevenlabs_key = env("ELEVENLABS_API_KEY").or(file.api_keys.elevenlabs);

        let text_defaults = TextConfig::default();
        let text = TextConfig {
            endpoint: env("KIOSK_TEXT_URL")
                .or(file.text.url)
                .unwrap_or(text_defaults.endpoint),
            api_key: openai_key.clone(),
            model: env("KIOSK_TEXT_MODEL")
                .or(file.text.model)
                .unwrap_or(text_defaults.model),
            system_prompt,
            fallback_message: file
                .text
                .fallback_message
                .unwrap_or(text_defaults.fallback_message),
        };

        let provider = match env("KIOSK_TTS_PROVIDER").or(file.tts.provider) {
            Some(name) => name.parse()?,
            // Prefer ElevenLabs only when it is the sole configured key
            None if openai_key.is_none() && elevenlabs_key.is_some() => TtsProvider::ElevenLabs,
            None => TtsProvider::OpenAi,
        };
        let tts_defaults = TtsConfig::for_provider(provider);

        #[allow(clippy::cast_possible_truncation)]
        let tts = TtsConfig {
            provider,
            api_key: match provider {
                TtsProvider::OpenAi => openai_key,
                TtsProvider::ElevenLabs => elevenlabs_key,
            },
            voice: env("KIOSK_TTS_VOICE")
                .or(file.tts.voice)
                .unwrap_or(tts_defaults.voice),
            model: env("KIOSK_TTS_MODEL")
                .or(file.tts.model)
                .unwrap_or(tts_defaults.model),
            speed: file.tts.speed.map_or(tts_defaults.speed, |s| s as f32),
            format: match env("KIOSK_TTS_FORMAT").or(file.tts.format) {
                Some(name) => name.parse()?,
                None => tts_defaults.format,
            },
        };

        Ok(Self {
            live,
            playback,
            text,
            tts,
        })
    }
}

fn parse_env<F>(env: &F, key: &str) -> Result<Option<usize>>
where
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{key} must be a positive integer, got {value:?}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(KioskConfigFile::default(), |_| None).unwrap();

        assert_eq!(config.live.frame_size, 4096);
        assert_eq!(config.live.input_sample_rate, 16_000);
        assert_eq!(config.live.output_sample_rate, 24_000);
        assert_eq!(config.live.outbound_queue_limit, 32);
        assert_eq!(config.live.endpoint, DEFAULT_LIVE_URL);
        assert!(config.live.api_key.is_none());
        assert!((config.playback.drain_epsilon - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.tts.provider, TtsProvider::OpenAi);
        assert_eq!(config.tts.voice, "alloy");
        assert_eq!(config.text.fallback_message, DEFAULT_FALLBACK_MESSAGE);
        assert_eq!(config.live.close_grace, DEFAULT_CLOSE_GRACE);
        assert_eq!(config.tts.format, OpenAiFormat::Pcm);
    }

    #[test]
    fn test_tts_format_and_close_grace() {
        let file: KioskConfigFile = toml::from_str(
            r#"
            [live]
            close_grace_ms = 250

            [tts]
            format = "mp3"
            "#,
        )
        .unwrap();
        let config = Config::from_sources(file, |_| None).unwrap();
        assert_eq!(config.tts.format, OpenAiFormat::Mp3);
        assert_eq!(config.live.close_grace, Duration::from_millis(250));

        let config = Config::from_sources(
            KioskConfigFile::default(),
            env_from(&[("KIOSK_TTS_FORMAT", "MP3")]),
        )
        .unwrap();
        assert_eq!(config.tts.format, OpenAiFormat::Mp3);

        let bad = Config::from_sources(
            KioskConfigFile::default(),
            env_from(&[("KIOSK_TTS_FORMAT", "ogg")]),
        );
        assert!(matches!(bad, Err(Error::Config(_))));
    }

    #[test]
    fn test_env_overrides_file_overrides_defaults() {
        let file: KioskConfigFile = toml::from_str(
            r#"
            system_prompt = "from file"

            [live]
            model = "file-model"
            voice = "Kore"
            frame_size = 2048

            [text]
            model = "file-chat"
            "#,
        )
        .unwrap();

        let env = env_from(&[
            ("KIOSK_LIVE_MODEL", "env-model"),
            ("KIOSK_OUTBOUND_LIMIT", "4"),
            ("KIOSK_SYSTEM_PROMPT", "from env"),
        ]);
        let config = Config::from_sources(file, env).unwrap();

        assert_eq!(config.live.model, "env-model");
        assert_eq!(config.live.voice.as_deref(), Some("Kore"));
        assert_eq!(config.live.frame_size, 2048);
        assert_eq!(config.live.outbound_queue_limit, 4);
        assert_eq!(config.live.system_instruction.as_deref(), Some("from env"));
        assert_eq!(config.text.system_prompt.as_deref(), Some("from env"));
        assert_eq!(config.text.model, "file-chat");
    }

    #[test]
    fn test_api_key_fallback() {
        let config = Config::from_sources(
            KioskConfigFile::default(),
            env_from(&[("GEMINI_API_KEY", "gemini")]),
        )
        .unwrap();
        assert_eq!(config.live.api_key.as_deref(), Some("gemini"));

        let config = Config::from_sources(
            KioskConfigFile::default(),
            env_from(&[("GEMINI_API_KEY", "gemini"), ("KIOSK_API_KEY", "kiosk")]),
        )
        .unwrap();
        assert_eq!(config.live.api_key.as_deref(), Some("kiosk"));
    }

    #[test]
    fn test_tts_provider_selection() {
        let config = Config::from_sources(
            KioskConfigFile::default(),
            env_from(&[("ELEVENLABS_API_KEY", "el")]),
        )
        .unwrap();
        assert_eq!(config.tts.provider, TtsProvider::ElevenLabs);
        assert_eq!(config.tts.api_key.as_deref(), Some("el"));
        assert_eq!(config.tts.model, "eleven_turbo_v2");

        let config = Config::from_sources(
            KioskConfigFile::default(),
            env_from(&[
                ("OPENAI_API_KEY", "oa"),
                ("ELEVENLABS_API_KEY", "el"),
                ("KIOSK_TTS_VOICE", "nova"),
            ]),
        )
        .unwrap();
        assert_eq!(config.tts.provider, TtsProvider::OpenAi);
        assert_eq!(config.tts.api_key.as_deref(), Some("oa"));
        assert_eq!(config.tts.voice, "nova");
        assert_eq!(config.text.api_key.as_deref(), Some("oa"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_frame = Config::from_sources(
            KioskConfigFile::default(),
            env_from(&[("KIOSK_FRAME_SIZE", "lots")]),
        );
        assert!(matches!(bad_frame, Err(Error::Config(_))));

        let zero_limit = Config::from_sources(
            KioskConfigFile::default(),
            env_from(&[("KIOSK_OUTBOUND_LIMIT", "0")]),
        );
        assert!(matches!(zero_limit, Err(Error::Config(_))));

        let bad_provider = Config::from_sources(
            KioskConfigFile::default(),
            env_from(&[("KIOSK_TTS_PROVIDER", "espeak")]),
        );
        assert!(matches!(bad_provider, Err(Error::Config(_))));
    }

    #[test]
    fn test_blank_env_values_are_ignored() {
        let config = Config::from_sources(
            KioskConfigFile::default(),
            env_from(&[("KIOSK_LIVE_MODEL", "  ")]),
        )
        .unwrap();
        assert_eq!(config.live.model, DEFAULT_LIVE_MODEL);
    }
}
