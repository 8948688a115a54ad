//! Live endpoint wire messages
//!
//! JSON frames exchanged with the bidirectional speech endpoint. Audio
//! travels as base64 PCM tagged with a mime descriptor.

use serde::{Deserialize, Serialize};

use crate::audio::{AudioFormat, EncodedChunk};
use crate::Result;

/// Message sent to the endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// One captured audio frame
    Audio(EncodedChunk),
    /// A complete user text turn
    Text(String),
}

/// Message received from the endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Handshake acknowledged
    SetupComplete,
    /// Synthesized audio payload
    Audio(EncodedChunk),
    /// Model text alongside the audio
    Text(String),
    /// User barged in; in-flight playback must stop
    Interrupted,
    /// Model finished its turn
    TurnComplete,
    /// Server is ending the session
    Close { reason: Option<String> },
}

/// Session parameters sent in the opening frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub model: String,
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Blob {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<Blob>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupFrame<'a> {
    setup: Setup<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: &'a str,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: [&'static str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    speech_config: Option<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputFrame {
    realtime_input: RealtimeInput,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<Blob>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContentFrame {
    client_content: ClientContent,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContent {
    turns: Vec<Content>,
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerFrame {
    #[serde(default)]
    setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    server_content: Option<ServerContent>,
    #[serde(default)]
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    model_turn: Option<Content>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

/// Serialize the opening setup frame
///
/// # Errors
///
/// Returns error if serialization fails
pub fn encode_setup(setup: &SessionSetup) -> Result<String> {
    let speech_config = setup.voice.as_deref().map(|voice| {
        serde_json::json!({
            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
        })
    });

    let frame = SetupFrame {
        setup: Setup {
            model: &setup.model,
            generation_config: GenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config,
            },
            system_instruction: setup.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part {
                    text: Some(text.clone()),
                    inline_data: None,
                }],
            }),
        },
    };

    Ok(serde_json::to_string(&frame)?)
}

/// Serialize an outbound message
///
/// # Errors
///
/// Returns error if serialization fails
pub fn encode_outbound(message: &OutboundMessage) -> Result<String> {
    let json = match message {
        OutboundMessage::Audio(chunk) => serde_json::to_string(&RealtimeInputFrame {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: chunk.mime_type(),
                    data: chunk.data().to_string(),
                }],
            },
        })?,
        OutboundMessage::Text(text) => serde_json::to_string(&ClientContentFrame {
            client_content: ClientContent {
                turns: vec![Content {
                    role: Some("user".to_string()),
                    parts: vec![Part {
                        text: Some(text.clone()),
                        inline_data: None,
                    }],
                }],
                turn_complete: true,
            },
        })?,
    };
    Ok(json)
}

/// Parse one server frame into messages, in dispatch order
///
/// Audio and text parts come first, then interruption, then turn completion.
/// Audio blobs without a `rate` parameter are assumed to be at `default_rate`.
///
/// # Errors
///
/// Returns error if the frame is not valid JSON
pub fn decode_inbound(frame: &str, default_rate: u32) -> Result<Vec<InboundMessage>> {
    let frame: ServerFrame = serde_json::from_str(frame)?;
    let mut messages = Vec::new();

    if frame.setup_complete.is_some() {
        messages.push(InboundMessage::SetupComplete);
    }

    if let Some(content) = frame.server_content {
        for part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
            if let Some(blob) = part.inline_data {
                match AudioFormat::from_mime(&blob.mime_type, default_rate) {
                    Ok(format) => {
                        messages.push(InboundMessage::Audio(EncodedChunk::new(blob.data, format)));
                    }
                    Err(e) => {
                        tracing::warn!(mime = %blob.mime_type, error = %e, "skipping inline data");
                    }
                }
            }
            if let Some(text) = part.text
                && !text.is_empty()
            {
                messages.push(InboundMessage::Text(text));
            }
        }

        if content.interrupted {
            messages.push(InboundMessage::Interrupted);
        }
        if content.turn_complete {
            messages.push(InboundMessage::TurnComplete);
        }
    }

    if let Some(go_away) = frame.go_away {
        let reason = go_away
            .get("reason")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| "server requested disconnect".to_string(), ToString::to_string);
        messages.push(InboundMessage::Close {
            reason: Some(reason),
        });
    }

    Ok(messages)
}

impl OutboundMessage {
    /// Short label for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Audio(_) => "audio",
            Self::Text(_) => "text",
        }
    }
}
