//! Text-mode speech collaborators
//!
//! Reply generation and text-to-speech, each behind a trait so the engine
//! can run against canned implementations.

mod generate;
mod tts;

pub use generate::{ChatCompletionsClient, ChatTurn, Role, TextGenerator};
pub use tts::{SpeechSynthesizer, TextToSpeech};
