//! Text response generation for text-mode turns

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::TextConfig;
use crate::{Error, Result};

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One entry of the text-mode conversation history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Produces a reply for the conversation so far
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate the assistant's next reply
    ///
    /// # Errors
    ///
    /// Returns `Generation` if no reply could be produced
    async fn generate(&self, history: &[ChatTurn], system_instruction: Option<&str>)
    -> Result<String>;
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint
pub struct ChatCompletionsClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl ChatCompletionsClient {
    /// Create a client from text-mode configuration
    #[must_use]
    pub fn new(config: &TextConfig) -> Self {
        Self {
            client: Client::new(),
            endpoint: format!("{}/chat/completions", config.endpoint.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

fn build_messages<'a>(history: &'a [ChatTurn], system: Option<&'a str>) -> Vec<Message<'a>> {
    system
        .map(|content| Message {
            role: "system",
            content,
        })
        .into_iter()
        .chain(history.iter().map(|turn| Message {
            role: turn.role.as_str(),
            content: &turn.text,
        }))
        .collect()
}

#[async_trait]
impl TextGenerator for ChatCompletionsClient {
    async fn generate(
        &self,
        history: &[ChatTurn],
        system_instruction: Option<&str>,
    ) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: build_messages(history, system_instruction),
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Generation(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Generation(format!("API error {status}: {body}")));
        }

        let result: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Generation(format!("failed to parse response: {e}")))?;

        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| Error::Generation("empty response".to_string()))
    }
}
