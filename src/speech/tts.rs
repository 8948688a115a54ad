//! Text-to-speech (TTS) processing

use async_trait::async_trait;

use crate::audio::{AudioFormat, EncodedChunk, PLAYBACK_SAMPLE_RATE};
use crate::config::{OpenAiFormat, TtsConfig, TtsProvider};
use crate::{Error, Result};

/// Turns reply text into a playable audio payload
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text`
    ///
    /// # Errors
    ///
    /// Returns `Synthesis` if the provider fails
    async fn synthesize(&self, text: &str) -> Result<EncodedChunk>;
}

impl OpenAiFormat {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Pcm => "pcm",
            Self::Mp3 => "mp3",
        }
    }

    const fn audio_format(self) -> AudioFormat {
        match self {
            Self::Pcm => AudioFormat::pcm(PLAYBACK_SAMPLE_RATE),
            Self::Mp3 => AudioFormat::mp3(PLAYBACK_SAMPLE_RATE),
        }
    }
}

/// Synthesizes speech from text
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: String,
    voice: String,
    speed: f32,
    model: String,
    provider: TtsProvider,
    format: OpenAiFormat,
}

impl TextToSpeech {
    /// Create a TTS client for the configured provider
    ///
    /// # Errors
    ///
    /// Returns error if the provider's API key is missing
    pub fn from_config(config: &TtsConfig) -> Result<Self> {
        let api_key = config.api_key.clone().unwrap_or_default();
        match config.provider {
            TtsProvider::OpenAi => Self::new_openai_with_model(
                api_key,
                config.voice.clone(),
                config.speed,
                config.model.clone(),
            )
            .map(|tts| tts.with_openai_format(config.format)),
            TtsProvider::ElevenLabs => Self::new_elevenlabs_with_model(
                api_key,
                config.voice.clone(),
                config.model.clone(),
            ),
        }
    }

    /// Create a new TTS instance using `OpenAI` with custom model
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_openai_with_model(
        api_key: String,
        voice: String,
        speed: f32,
        model: String,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice,
            speed,
            model,
            provider: TtsProvider::OpenAi,
            format: OpenAiFormat::Pcm,
        })
    }

    /// Create a new TTS instance using ElevenLabs with custom model
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new_elevenlabs_with_model(
        api_key: String,
        voice_id: String,
        model: String,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "ElevenLabs API key required for TTS".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice: voice_id,
            speed: 1.0, // ElevenLabs doesn't use speed in the same way
            model,
            provider: TtsProvider::ElevenLabs,
            format: OpenAiFormat::Pcm,
        })
    }

    /// Request MP3 instead of raw PCM from `OpenAI`
    #[must_use]
    pub const fn with_openai_format(mut self, format: OpenAiFormat) -> Self {
        self.format = format;
        self
    }

    /// Synthesize using OpenAI TTS
    async fn synthesize_openai(&self, text: &str) -> Result<EncodedChunk> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: self.format.as_str(),
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Synthesis(format!("OpenAI request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Synthesis(format!("OpenAI TTS body: {e}")))?;
        Ok(EncodedChunk::from_bytes(&audio, self.format.audio_format()))
    }

    /// Synthesize using ElevenLabs TTS
    async fn synthesize_elevenlabs(&self, text: &str) -> Result<EncodedChunk> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}?output_format=pcm_{PLAYBACK_SAMPLE_RATE}",
            self.voice
        );

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Synthesis(format!("ElevenLabs request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("ElevenLabs TTS error {status}: {body}")));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::Synthesis(format!("ElevenLabs TTS body: {e}")))?;
        Ok(EncodedChunk::from_bytes(
            &audio,
            AudioFormat::pcm(PLAYBACK_SAMPLE_RATE),
        ))
    }
}

#[async_trait]
impl SpeechSynthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str) -> Result<EncodedChunk> {
        tracing::debug!(provider = ?self.provider, chars = text.len(), "synthesizing speech");
        match self.provider {
            TtsProvider::OpenAi => self.synthesize_openai(text).await,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text).await,
        }
    }
}
