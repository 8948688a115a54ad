//! TOML configuration file loading
//!
//! Supports `~/.config/kiosk-voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct KioskConfigFile {
    /// Instruction shared by live and text conversations
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Live endpoint configuration
    #[serde(default)]
    pub live: LiveFileConfig,

    /// Speaker configuration
    #[serde(default)]
    pub playback: PlaybackFileConfig,

    /// Text-mode generation configuration
    #[serde(default)]
    pub text: TextFileConfig,

    /// Text-to-speech configuration
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Live session configuration
#[derive(Debug, Default, Deserialize)]
pub struct LiveFileConfig {
    /// WebSocket endpoint URL
    pub url: Option<String>,

    /// Live model identifier
    pub model: Option<String>,

    /// Prebuilt voice name
    pub voice: Option<String>,

    /// Samples per captured frame
    pub frame_size: Option<usize>,

    /// Microphone sample rate
    pub input_sample_rate: Option<u32>,

    /// Rate assumed for inbound audio without a rate tag
    pub output_sample_rate: Option<u32>,

    /// Outbound queue bound
    pub outbound_limit: Option<usize>,

    /// Flush window after close, in milliseconds
    pub close_grace_ms: Option<u64>,
}

/// Playback configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlaybackFileConfig {
    /// Preferred speaker sample rate
    pub sample_rate: Option<u32>,

    /// Drain detection window in seconds
    pub drain_epsilon: Option<f64>,
}

/// Text generation configuration
#[derive(Debug, Default, Deserialize)]
pub struct TextFileConfig {
    /// OpenAI-compatible base URL
    pub url: Option<String>,

    /// Chat model identifier
    pub model: Option<String>,

    /// Message spoken when a text turn fails
    pub fallback_message: Option<String>,
}

/// Text-to-speech configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// "openai" or "elevenlabs"
    pub provider: Option<String>,

    /// Voice identifier
    pub voice: Option<String>,

    /// Model identifier
    pub model: Option<String>,

    /// Speed multiplier (`OpenAI` only)
    pub speed: Option<f64>,

    /// "pcm" or "mp3" (`OpenAI` only)
    pub format: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub live: Option<String>,
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `KioskConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file() -> KioskConfigFile {
    let Some(path) = config_file_path() else {
        return KioskConfigFile::default();
    };

    if !path.exists() {
        return KioskConfigFile::default();
    }

    load_config_from(&path)
}

/// Load a config file from an explicit path, falling back to defaults on error
#[must_use]
pub fn load_config_from(path: &Path) -> KioskConfigFile {
    match read_config(path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            KioskConfigFile::default()
        }
    }
}

/// Read and parse a config file
///
/// # Errors
///
/// Returns `Io` if the file cannot be read and `Toml` if it does not parse
pub fn read_config(path: &Path) -> Result<KioskConfigFile> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse config file contents
///
/// # Errors
///
/// Returns `Toml` if the contents are not valid for the schema
pub fn parse_config(content: &str) -> Result<KioskConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/kiosk-voice/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("kiosk-voice").join("config.toml"))
}
