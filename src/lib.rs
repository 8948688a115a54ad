//! Kiosk Voice - real-time voice session engine for kiosk assistants
//!
//! This library provides the audio and session plumbing behind a kiosk's
//! conversational avatar:
//! - Microphone capture framed and encoded for a live speech endpoint
//! - Gapless playback of streamed synthesized audio
//! - Server-initiated interruption (barge-in)
//! - A session state machine driving the on-screen indicator
//! - One-shot text turns answered through text-to-speech
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Presentation layer                      │
//! │      EngineHandle  │  watch<SessionState>  │ notices │
//! └────────────────────┬────────────────────────────────┘
//!                      │ commands
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Engine task                        │
//! │  StateMachine │ PlaybackScheduler │ LiveSession      │
//! └──────┬──────────────────┬───────────────────┬───────┘
//!        │ events           │ events            │ events
//! ┌──────▼──────┐   ┌───────▼────────┐   ┌──────▼───────┐
//! │  Capture    │   │ Live transport │   │ Text / TTS   │
//! │  (cpal)     │   │ (WebSocket)    │   │ (HTTP)       │
//! └─────────────┘   └────────────────┘   └──────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod live;
pub mod speech;
pub mod state;

pub use config::Config;
pub use engine::{Collaborators, Engine, EngineEvent, EngineHandle, EngineNotice, TurnId};
pub use error::{Error, Result};
pub use live::SessionId;
pub use state::{Mode, SessionState, StateEvent, StateMachine};
