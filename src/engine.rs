//! Engine coordinator
//!
//! A single task owns the state machine, the playback scheduler and the live
//! session. Device callbacks, transport tasks and text-turn calls never touch
//! that state directly; they post [`EngineEvent`]s (or [`PlaybackEvent`]s)
//! which the coordinator handles one at a time, in arrival order.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::audio::{
    self, CapturePipeline, EncodedChunk, InputDevice, OutputDevice, PlaybackEvent,
    PlaybackScheduler, SegmentId,
};
use crate::config::Config;
use crate::live::{
    Admission, Connector, InboundMessage, LiveSession, OutboundMessage, SessionId,
};
use crate::speech::{ChatTurn, Role, SpeechSynthesizer, TextGenerator};
use crate::state::{SessionState, StateEvent, StateMachine};
use crate::{Error, Result};

const COMMAND_CAPACITY: usize = 32;
const NOTICE_CAPACITY: usize = 64;

/// Identifier of one text-mode turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Events posted to the coordinator by capture, transport and text-turn tasks
#[derive(Debug)]
pub enum EngineEvent {
    /// Capture produced a frame
    Captured {
        session: SessionId,
        chunk: EncodedChunk,
    },
    /// Transport delivered a message
    Inbound {
        session: SessionId,
        message: InboundMessage,
    },
    /// Transport ended without an explicit close message
    TransportClosed {
        session: SessionId,
        reason: Option<String>,
    },
    /// Transport failed
    TransportFailed { session: SessionId, error: String },
    /// Text generation finished
    TextResponse { turn: TurnId, result: Result<String> },
    /// Speech synthesis finished
    Speech {
        turn: TurnId,
        result: Result<EncodedChunk>,
    },
}

/// Out-of-band notifications for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotice {
    /// Outbound queue refused a frame; emitted once per episode
    Backpressure { limit: usize },
    /// Outbound queue accepts frames again
    Drained,
    /// Playback was interrupted by the server
    Interrupted { discarded: usize },
    /// Text-mode reply produced by the generator
    Reply(String),
    /// Text accompanying live audio
    Transcript(String),
    /// A text turn failed; `fallback` is the configured substitute reply
    TurnFailed { error: String, fallback: String },
    /// The live session ended
    SessionClosed { reason: Option<String> },
}

/// External collaborators, each behind a trait
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub input: Arc<dyn InputDevice>,
    pub generator: Arc<dyn TextGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// Requests from an [`EngineHandle`]
#[derive(Debug)]
pub enum Command {
    Open {
        reply: oneshot::Sender<Result<SessionId>>,
    },
    Close {
        reply: oneshot::Sender<bool>,
    },
    SendText {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// The voice session coordinator
pub struct Engine {
    config: Config,
    collaborators: Collaborators,
    state: StateMachine,
    scheduler: PlaybackScheduler<Box<dyn OutputDevice>>,
    live: Option<LiveSession>,
    next_session: u64,
    active_turn: Option<TurnId>,
    next_turn: u64,
    history: Vec<ChatTurn>,
    last_segment: Option<SegmentId>,
    retired_through: u64,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    notices: broadcast::Sender<EngineNotice>,
}

impl Engine {
    /// Create an engine around an output device and its completion channel
    #[must_use]
    pub fn new(
        config: Config,
        output: Box<dyn OutputDevice>,
        playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
        collaborators: Collaborators,
    ) -> Self {
        let scheduler = PlaybackScheduler::with_epsilon(output, config.playback.drain_epsilon);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        Self {
            config,
            collaborators,
            state: StateMachine::new(),
            scheduler,
            live: None,
            next_session: 0,
            active_turn: None,
            next_turn: 0,
            history: Vec::new(),
            last_segment: None,
            retired_through: 0,
            events_tx,
            events_rx,
            playback_rx: playback_events,
            notices,
        }
    }

    /// Current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.state()
    }

    /// Observer of state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Receiver for out-of-band notices
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<EngineNotice> {
        self.notices.subscribe()
    }

    /// Id of the open live session, if any
    #[must_use]
    pub fn live_session(&self) -> Option<SessionId> {
        self.live.as_ref().map(LiveSession::id)
    }

    /// Most recently scheduled segment of the live session
    #[must_use]
    pub fn interruptible(&self) -> Option<SegmentId> {
        self.live.as_ref().and_then(LiveSession::interruptible)
    }

    /// Device time at which the next frame would start
    #[must_use]
    pub const fn cursor(&self) -> f64 {
        self.scheduler.cursor()
    }

    /// Text-mode conversation so far
    #[must_use]
    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    fn notify(&self, notice: EngineNotice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }

    /// Open a live session
    ///
    /// Any in-flight text turn is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyOpen` if a session is live, `Connection` if the
    /// endpoint cannot be reached, or `Device` if the microphone cannot be
    /// acquired. On failure nothing stays acquired and the state is Idle.
    pub async fn open(&mut self) -> Result<SessionId> {
        if self.live.is_some() {
            return Err(Error::AlreadyOpen);
        }

        self.cancel_text_turn();
        self.next_session += 1;
        let id = SessionId(self.next_session);
        self.state.apply(StateEvent::LiveStarted);

        tracing::info!(session = %id, endpoint = %self.config.live.endpoint, "opening live session");

        let connector = Arc::clone(&self.collaborators.connector);
        let transport = match connector.connect(&self.config.live).await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "live connection failed");
                self.state.apply(StateEvent::Failed);
                return Err(match e {
                    e @ Error::Connection(_) => e,
                    other => Error::Connection(other.to_string()),
                });
            }
        };

        let mut session = LiveSession::start(
            id,
            transport,
            self.config.live.outbound_queue_limit,
            self.config.live.close_grace,
            self.events_tx.clone(),
        );

        let events = self.events_tx.clone();
        let pipeline = CapturePipeline::new(
            self.config.live.frame_size,
            self.config.live.input_sample_rate,
            move |chunk: EncodedChunk| {
                let _ = events.send(EngineEvent::Captured { session: id, chunk });
            },
        );

        // Device startup blocks; keep it off the engine task
        let input = Arc::clone(&self.collaborators.input);
        let device_pipeline = pipeline.clone();
        let opened = tokio::task::spawn_blocking(move || input.open(device_pipeline))
            .await
            .unwrap_or_else(|e| Err(Error::Device(format!("microphone startup failed: {e}"))));

        match opened {
            Ok(stream) => session.attach_capture(pipeline, stream),
            Err(e) => {
                tracing::warn!(session = %id, error = %e, "microphone unavailable");
                pipeline.stop();
                session.close();
                self.state.apply(StateEvent::Failed);
                return Err(match e {
                    e @ Error::Device(_) => e,
                    other => Error::Device(other.to_string()),
                });
            }
        }

        self.live = Some(session);
        self.state.apply(StateEvent::ConnectionOpened);
        Ok(id)
    }

    /// Close the live session; returns `false` if none was open
    pub fn close(&mut self) -> bool {
        self.teardown_live(None, false)
    }

    /// Release the live session and return to Idle
    ///
    /// `announce` emits [`EngineNotice::SessionClosed`] for closes the
    /// caller did not request.
    fn teardown_live(&mut self, reason: Option<String>, announce: bool) -> bool {
        let Some(mut session) = self.live.take() else {
            return false;
        };

        session.close();
        self.reset_playback();
        self.state.apply(StateEvent::Closed);

        if announce {
            self.notify(EngineNotice::SessionClosed { reason });
        }
        true
    }

    /// Submit user text
    ///
    /// With a live session open the text goes out as a user turn on the live
    /// channel. Otherwise it starts a text-mode turn.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if a text turn is already in progress, or
    /// `Backpressure` if the live outbound queue is throttled
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        if let Some(session) = &self.live {
            session
                .outbound()
                .push(OutboundMessage::Text(text.to_string()))?;
            tracing::debug!(session = %session.id(), chars = text.len(), "live text turn queued");
            return Ok(());
        }

        if self.state.state() != SessionState::Idle {
            return Err(Error::Busy(format!("a turn is in progress ({})", self.state.state())));
        }

        self.next_turn += 1;
        let turn = TurnId(self.next_turn);
        self.active_turn = Some(turn);
        self.history.push(ChatTurn::user(text));
        self.state.apply(StateEvent::TextSubmitted);

        tracing::info!(turn = %turn, chars = text.len(), "text turn started");

        let generator = Arc::clone(&self.collaborators.generator);
        let history = self.history.clone();
        let system = self.config.text.system_prompt.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = generator.generate(&history, system.as_deref()).await;
            let _ = events.send(EngineEvent::TextResponse { turn, result });
        });

        Ok(())
    }

    fn cancel_text_turn(&mut self) {
        if let Some(turn) = self.active_turn.take() {
            tracing::debug!(turn = %turn, "cancelling text turn");
            self.reset_playback();
            self.state.apply(StateEvent::Closed);
        }
    }

    fn fail_turn(&mut self, turn: TurnId, error: &Error) {
        tracing::warn!(turn = %turn, error = %error, "text turn failed");
        self.active_turn = None;
        self.reset_playback();
        // Notice first so observers waiting for Idle have already got it
        self.notify(EngineNotice::TurnFailed {
            error: error.to_string(),
            fallback: self.config.text.fallback_message.clone(),
        });
        self.state.apply(StateEvent::Failed);
    }

    /// Stop playback and mark every segment scheduled so far as stale
    fn reset_playback(&mut self) {
        self.scheduler.reset();
        self.retire_segments();
    }

    fn retire_segments(&mut self) {
        if let Some(last) = self.last_segment {
            self.retired_through = last.0;
        }
    }

    /// Decode and schedule a payload; malformed payloads are skipped
    fn play(&mut self, chunk: &EncodedChunk) -> Result<SegmentId> {
        let frame = audio::decode(chunk, self.scheduler.sample_rate())?;
        let segment = self.scheduler.schedule(frame);
        self.last_segment = Some(segment.id);
        Ok(segment.id)
    }

    /// Handle one coordinator event
    pub fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Captured { session, chunk } => self.handle_captured(session, chunk),
            EngineEvent::Inbound { session, message } => self.handle_inbound(session, message),
            EngineEvent::TransportClosed { session, reason } => {
                if self.is_live(session) {
                    tracing::info!(session = %session, "live transport ended");
                    self.teardown_live(reason, true);
                }
            }
            EngineEvent::TransportFailed { session, error } => {
                if self.is_live(session) {
                    tracing::warn!(session = %session, error = %error, "live transport failed");
                    self.teardown_live(Some(error), true);
                }
            }
            EngineEvent::TextResponse { turn, result } => self.handle_text_response(turn, result),
            EngineEvent::Speech { turn, result } => self.handle_speech(turn, result),
        }
    }

    fn is_live(&self, session: SessionId) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| live.id() == session && !live.is_closed())
    }

    fn handle_captured(&mut self, session: SessionId, chunk: EncodedChunk) {
        if !self.is_live(session) {
            tracing::trace!(session = %session, "dropping frame from closed session");
            return;
        }
        let Some(live) = self.live.as_mut() else {
            return;
        };

        let notice = match live.outbound().push(OutboundMessage::Audio(chunk)) {
            Ok(Admission::Queued) => None,
            Ok(Admission::Resumed) => live.leave_backpressure().then_some(EngineNotice::Drained),
            Err(Error::Backpressure { limit }) => live
                .enter_backpressure()
                .then_some(EngineNotice::Backpressure { limit }),
            Err(e) => {
                tracing::debug!(session = %session, error = %e, "frame not queued");
                None
            }
        };

        if let Some(notice) = notice {
            self.notify(notice);
        }
    }

    fn handle_inbound(&mut self, session: SessionId, message: InboundMessage) {
        if !self.is_live(session) {
            tracing::trace!(session = %session, "ignoring message for closed session");
            return;
        }

        match message {
            InboundMessage::SetupComplete => {
                self.state.apply(StateEvent::ConnectionOpened);
            }
            InboundMessage::Audio(chunk) => match self.play(&chunk) {
                Ok(segment) => {
                    if let Some(live) = self.live.as_mut() {
                        live.set_interruptible(Some(segment));
                    }
                    self.state.apply(StateEvent::AudioArrived);
                }
                Err(e) => tracing::warn!(session = %session, error = %e, "skipping audio chunk"),
            },
            InboundMessage::Text(text) => self.notify(EngineNotice::Transcript(text)),
            InboundMessage::Interrupted => {
                let interrupted = self.interruptible();
                let discarded = self.scheduler.interrupt();
                self.retire_segments();
                if let Some(live) = self.live.as_mut() {
                    live.set_interruptible(None);
                }
                tracing::info!(
                    session = %session,
                    segment = ?interrupted.map(|s| s.0),
                    discarded,
                    "playback interrupted by server"
                );
                self.state.apply(StateEvent::Interrupted);
                self.notify(EngineNotice::Interrupted { discarded });
            }
            InboundMessage::TurnComplete => {
                self.state.apply(StateEvent::TurnComplete);
            }
            InboundMessage::Close { reason } => {
                tracing::info!(session = %session, reason = ?reason, "server closed live session");
                self.teardown_live(reason, true);
            }
        }
    }

    fn handle_text_response(&mut self, turn: TurnId, result: Result<String>) {
        if self.active_turn != Some(turn) {
            tracing::trace!(turn = %turn, "ignoring superseded text response");
            return;
        }

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                // Drop the unanswered user turn so history stays paired
                if self.history.last().is_some_and(|t| t.role == Role::User) {
                    self.history.pop();
                }
                self.fail_turn(turn, &e);
                return;
            }
        };

        self.history.push(ChatTurn::assistant(reply.clone()));
        self.notify(EngineNotice::Reply(reply.clone()));
        self.state.apply(StateEvent::TurnComplete);

        let synthesizer = Arc::clone(&self.collaborators.synthesizer);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = synthesizer.synthesize(&reply).await;
            let _ = events.send(EngineEvent::Speech { turn, result });
        });
    }

    fn handle_speech(&mut self, turn: TurnId, result: Result<EncodedChunk>) {
        if self.active_turn != Some(turn) {
            tracing::trace!(turn = %turn, "ignoring superseded speech");
            return;
        }

        let played = result.and_then(|chunk| self.play(&chunk));
        match played {
            Ok(segment) => {
                tracing::debug!(turn = %turn, segment = segment.0, "reply scheduled");
                self.state.apply(StateEvent::AudioArrived);
            }
            Err(e) => self.fail_turn(turn, &e),
        }
    }

    /// Handle one output-device completion
    pub fn handle_playback(&mut self, event: PlaybackEvent) {
        let PlaybackEvent::SegmentEnded { id, at } = event;

        if id.0 <= self.retired_through {
            tracing::trace!(segment = id.0, "ignoring end of retired segment");
            return;
        }
        if !self.scheduler.is_drained(at) {
            return;
        }

        if self.state.apply(StateEvent::PlaybackDrained) == Some(SessionState::Idle)
            && let Some(turn) = self.active_turn.take()
        {
            tracing::info!(turn = %turn, "text turn finished");
        }
    }

    /// Handle every event that is already waiting, without blocking
    ///
    /// Engine events go before playback events, so audio that is already
    /// waiting extends the cursor before a segment end can drain it.
    /// Returns the number of events handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(event) = self.events_rx.try_recv() {
                self.handle_event(event);
            } else if let Ok(event) = self.playback_rx.try_recv() {
                self.handle_playback(event);
            } else {
                return handled;
            }
            handled += 1;
        }
    }

    /// Wait for the next event and handle it, engine events first
    pub async fn step(&mut self) {
        tokio::select! {
            biased;
            Some(event) = self.events_rx.recv() => self.handle_event(event),
            Some(event) = self.playback_rx.recv() => self.handle_playback(event),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open { reply } => {
                let _ = reply.send(self.open().await);
            }
            Command::Close { reply } => {
                let _ = reply.send(self.close());
            }
            Command::SendText { text, reply } => {
                let _ = reply.send(self.send_text(&text));
            }
            Command::Shutdown => {}
        }
    }

    /// Run until shutdown is requested or every command sender is dropped
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::debug!("engine started");

        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                Some(event) = self.playback_rx.recv() => self.handle_playback(event),
            }
        }

        self.close();
        self.cancel_text_turn();
        tracing::debug!("engine stopped");
    }

    /// Move the engine onto a tokio task
    #[must_use]
    pub fn spawn(self) -> EngineHandle {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let state = self.subscribe();
        let notices = self.notices.clone();
        let task = tokio::spawn(self.run(rx));

        EngineHandle {
            commands,
            state,
            notices,
            task: Some(task),
        }
    }
}

/// Presentation-layer handle to a running [`Engine`]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    notices: broadcast::Sender<EngineNotice>,
    task: Option<JoinHandle<()>>,
}

impl EngineHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| Error::Closed("engine stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Closed("engine stopped".to_string()))
    }

    /// Open a live session
    ///
    /// # Errors
    ///
    /// See [`Engine::open`]; `Closed` if the engine has stopped
    pub async fn open(&self) -> Result<SessionId> {
        self.request(|reply| Command::Open { reply }).await?
    }

    /// Close the live session; `Ok(false)` if none was open
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the engine has stopped
    pub async fn close(&self) -> Result<bool> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Submit user text
    ///
    /// # Errors
    ///
    /// See [`Engine::send_text`]; `Closed` if the engine has stopped
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| Command::SendText { text, reply }).await?
    }

    /// Observer of state changes
    #[must_use]
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Receiver for out-of-band notices
    #[must_use]
    pub fn notices(&self) -> broadcast::Receiver<EngineNotice> {
        self.notices.subscribe()
    }

    /// Stop the engine, closing any live session, and wait for it to finish
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::error!(error = %e, "engine task failed");
        }
    }
}
