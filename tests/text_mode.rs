//! Text-mode turn tests

mod common;

use common::{
    FakeConnector, FakeGenerator, FakeInput, FakeSynth, Harness, chunk_ms, malformed_chunk,
};
use kiosk_voice::audio::{AudioFormat, EncodedChunk};
use kiosk_voice::speech::{ChatTurn, Role};
use kiosk_voice::{EngineNotice, Error, SessionState};

fn harness(generator: FakeGenerator, synth: FakeSynth) -> Harness {
    Harness::with(FakeConnector::default(), FakeInput::default(), generator, synth)
}

#[tokio::test]
async fn test_text_turn_runs_to_idle() {
    let mut h = Harness::new();
    let mut notices = h.engine.notices();

    h.engine.send_text("Where is the lift?").unwrap();
    assert_eq!(h.engine.state(), SessionState::Listening);

    // Reply arrives; synthesis starts
    h.engine.step().await;
    assert_eq!(h.engine.state(), SessionState::Thinking);
    assert_eq!(
        notices.try_recv().unwrap(),
        EngineNotice::Reply("The lift is on your left.".to_string())
    );

    // Speech arrives and is scheduled
    h.engine.step().await;
    assert_eq!(h.engine.state(), SessionState::Speaking);
    assert_eq!(h.output.started().len(), 1);

    h.output.advance_to(0.5);
    h.engine.pump();
    assert_eq!(h.engine.state(), SessionState::Idle);

    assert_eq!(
        h.engine.history(),
        &[
            ChatTurn::user("Where is the lift?"),
            ChatTurn::assistant("The lift is on your left."),
        ]
    );

    let calls = h.generator.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, vec![ChatTurn::user("Where is the lift?")]);
    assert_eq!(calls[0].1.as_deref(), Some("be brief"));
    assert_eq!(h.synth.texts(), vec!["The lift is on your left.".to_string()]);

    // No live resources were touched
    assert_eq!(h.connector.connects(), 0);
    assert_eq!(h.input.opened(), 0);
}

#[tokio::test]
async fn test_second_turn_sees_history() {
    let mut h = Harness::new();

    h.engine.send_text("Where is the lift?").unwrap();
    h.engine.step().await;
    h.engine.step().await;
    h.output.advance_to(0.5);
    h.engine.pump();
    assert_eq!(h.engine.state(), SessionState::Idle);

    h.engine.send_text("And the cafe?").unwrap();
    h.engine.step().await;

    let calls = h.generator.calls();
    let roles: Vec<Role> = calls[1].0.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
    assert_eq!(calls[1].0[2].text, "And the cafe?");
}

#[tokio::test]
async fn test_text_rejected_while_turn_in_progress() {
    let mut h = Harness::new();

    h.engine.send_text("first").unwrap();
    let err = h.engine.send_text("second").unwrap_err();
    assert!(matches!(err, Error::Busy(_)));

    h.engine.step().await;
    assert_eq!(h.generator.calls().len(), 1);
    assert_eq!(h.engine.history().len(), 2);
}

#[tokio::test]
async fn test_blank_text_is_ignored() {
    let mut h = Harness::new();

    h.engine.send_text("   \n").unwrap();

    assert_eq!(h.engine.state(), SessionState::Idle);
    assert!(h.engine.history().is_empty());
    assert_eq!(h.engine.pump(), 0);
}

#[tokio::test]
async fn test_generation_failure_offers_fallback() {
    let mut h = harness(
        FakeGenerator::failing("model overloaded"),
        FakeSynth::speaking(chunk_ms(500)),
    );
    let mut notices = h.engine.notices();

    h.engine.send_text("Where is the lift?").unwrap();
    h.engine.step().await;

    assert_eq!(h.engine.state(), SessionState::Idle);
    assert!(h.engine.history().is_empty());
    assert!(h.synth.texts().is_empty());

    let EngineNotice::TurnFailed { error, fallback } = notices.try_recv().unwrap() else {
        panic!("expected a failed turn");
    };
    assert!(error.contains("model overloaded"));
    assert_eq!(fallback, "Sorry, please ask again.");

    // The engine accepts the next turn
    h.engine.send_text("Hello?").unwrap();
    assert_eq!(h.engine.state(), SessionState::Listening);
}

#[tokio::test]
async fn test_synthesis_failure_returns_to_idle() {
    let mut h = harness(
        FakeGenerator::replying("Second floor."),
        FakeSynth::failing("quota exceeded"),
    );
    let mut notices = h.engine.notices();

    h.engine.send_text("Where is radiology?").unwrap();
    h.engine.step().await;
    h.engine.step().await;

    assert_eq!(h.engine.state(), SessionState::Idle);
    assert!(h.output.started().is_empty());
    assert_eq!(h.engine.history().len(), 2);

    assert_eq!(
        notices.try_recv().unwrap(),
        EngineNotice::Reply("Second floor.".to_string())
    );
    assert!(matches!(
        notices.try_recv().unwrap(),
        EngineNotice::TurnFailed { .. }
    ));
}

#[tokio::test]
async fn test_malformed_speech_fails_turn() {
    let mut h = harness(
        FakeGenerator::replying("Second floor."),
        FakeSynth::speaking(malformed_chunk()),
    );
    let mut notices = h.engine.notices();

    h.engine.send_text("Where is radiology?").unwrap();
    h.engine.step().await;
    h.engine.step().await;

    assert_eq!(h.engine.state(), SessionState::Idle);
    assert!(h.output.started().is_empty());

    let _reply = notices.try_recv().unwrap();
    let EngineNotice::TurnFailed { error, .. } = notices.try_recv().unwrap() else {
        panic!("expected a failed turn");
    };
    assert!(error.contains("malformed"), "{error}");
}

#[tokio::test]
async fn test_opening_live_cancels_text_turn() {
    let mut h = Harness::new();
    let mut notices = h.engine.notices();

    h.engine.send_text("Where is the lift?").unwrap();
    h.engine.open().await.unwrap();
    assert_eq!(h.engine.state(), SessionState::Listening);

    // The superseded reply is dropped
    h.engine.step().await;
    tokio::task::yield_now().await;
    assert_eq!(h.engine.state(), SessionState::Listening);
    assert!(h.synth.texts().is_empty());
    assert!(notices.try_recv().is_err());
    assert!(h.engine.live_session().is_some());
}

#[tokio::test]
async fn test_speech_without_mp3_frames_fails_turn() {
    // A provider error page delivered with an audio/mpeg content type
    let page = EncodedChunk::from_bytes(b"<html>quota exceeded</html>", AudioFormat::mp3(24_000));
    let mut h = harness(FakeGenerator::replying("Second floor."), FakeSynth::speaking(page));
    let mut notices = h.engine.notices();

    h.engine.send_text("Where is radiology?").unwrap();
    h.engine.step().await;
    h.engine.step().await;

    assert_eq!(h.engine.state(), SessionState::Idle);
    assert!(h.output.started().is_empty());

    let _reply = notices.try_recv().unwrap();
    assert!(matches!(
        notices.try_recv().unwrap(),
        EngineNotice::TurnFailed { .. }
    ));
}
