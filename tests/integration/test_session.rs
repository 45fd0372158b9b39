//! Integration tests for exercise sessions against a fake analysis service.
//!
//! These tests run the full stack: handshake, frame production, inbound
//! decoding, progress tracking, and shutdown.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lfk_stream::{
    CloseInitiator, ConnectionState, ErrorKind, SessionContext, SessionEvent, SessionOrchestrator,
    StaticFrame, StepMarker, CLOSE_GRACE, NORMAL_CLOSURE, NORMAL_CLOSURE_REASON,
};
use support::{
    event_matching, next_event, structured_feedback, Script, TestService, BASIC_FEEDBACK,
    GOOD_TOKEN,
};
use tokio::time::{sleep, timeout};

// ============================================================================
// Reference scenarios
// ============================================================================

/// Open, receive the basic feedback message, and check the decoded values.
#[tokio::test]
async fn test_basic_feedback_scenario() {
    let service = TestService::spawn(Script::replies([BASIC_FEEDBACK])).await;
    let orchestrator = SessionOrchestrator::new(service.config());
    let context = SessionContext::new(GOOD_TOKEN, "fist-palm").unwrap();

    let (session, mut events) = orchestrator
        .start_with_channel(context, StaticFrame::dummy())
        .unwrap();

    let connected = next_event(&mut events).await;
    assert!(
        matches!(connected, SessionEvent::Connected(_)),
        "Expected Connected event, got: {connected:?}"
    );

    let feedback = next_event(&mut events).await;
    let SessionEvent::Feedback(payload) = feedback else {
        panic!("Expected Feedback event, got: {feedback:?}");
    };
    assert!(payload.feedback.hand_detected);
    assert_eq!(payload.feedback.raised_fingers, 3);
    assert_eq!(
        payload.feedback.finger_states,
        [true, true, true, false, false]
    );
    assert!(payload.feedback.structured.is_none());
    assert_eq!(payload.progress.active_index, -1);

    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Open);
    assert_eq!(snapshot.last_feedback.unwrap().raised_fingers, 3);

    let summary = session.stop().await;
    assert_eq!(summary.final_state, ConnectionState::Closed);
    assert_eq!(summary.feedback_received, 1);
    assert!(summary.frames.sent >= 1);

    let observed = service.observed.lock().await;
    assert_eq!(observed.exercises, vec!["fist-palm".to_string()]);
    assert_eq!(
        observed.frames[0],
        r#"{"frame":"ZHVtbXk=","exercise_type":"fist-palm"}"#
    );
}

/// A rejected handshake fails the session with exactly one error and no frames.
#[tokio::test]
async fn test_handshake_failure_scenario() {
    let service = TestService::spawn(Script::default()).await;
    let orchestrator = SessionOrchestrator::new(service.config());
    let context = SessionContext::new("wrong-token", "fist").unwrap();

    let (session, mut events) = orchestrator
        .start_with_channel(context, StaticFrame::dummy())
        .unwrap();

    let event = next_event(&mut events).await;
    let SessionEvent::Error(payload) = &event else {
        panic!("Expected Error event, got: {event:?}");
    };
    assert_eq!(payload.kind, ErrorKind::Connect);
    assert!(payload.fatal);
    assert!(!payload.message.contains("wrong-token"));

    sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err(), "Only one error expected");
    assert_eq!(session.state(), ConnectionState::Failed);

    let summary = session.stop().await;
    assert_eq!(summary.frames.ticks, 0);
    assert!(service.observed.lock().await.frames.is_empty());
    assert!(events.recv().await.is_none());
}

// ============================================================================
// Progress
// ============================================================================

/// Structured progress moves the active step; unknown states clear it.
#[tokio::test]
async fn test_progress_follows_structured_state() {
    let script = Script::replies([
        structured_feedback("holding_fist", 1, Some(3)),
        structured_feedback("waiting_palm", 1, None),
        structured_feedback("celebrating", 6, None),
    ]);
    let service = TestService::spawn(script).await;
    let orchestrator = SessionOrchestrator::new(service.config());
    let context = SessionContext::new(GOOD_TOKEN, "fist-palm").unwrap();

    let (session, mut events) = orchestrator
        .start_with_channel(context, StaticFrame::dummy())
        .unwrap();

    let mut views = Vec::new();
    for _ in 0..3 {
        let event = event_matching(&mut events, |e| matches!(e, SessionEvent::Feedback(_))).await;
        if let SessionEvent::Feedback(payload) = event {
            views.push(payload.progress);
        }
    }

    assert_eq!(views[0].active_index, 1);
    assert_eq!(views[0].countdown, Some(3));
    assert_eq!(views[0].steps[0].marker, StepMarker::Done);
    assert_eq!(views[0].steps[1].marker, StepMarker::Active);

    assert_eq!(views[1].active_index, 2);
    assert_eq!(views[1].countdown, None);
    assert_eq!(views[1].steps[3].marker, StepMarker::Pending);

    // Cycle count above the total is passed through.
    assert_eq!(views[2].active_index, -1);
    assert_eq!(views[2].current_cycle, Some(6));

    session.stop().await;
}

// ============================================================================
// Error handling
// ============================================================================

/// A malformed message is reported and the stream carries on.
#[tokio::test]
async fn test_malformed_feedback_is_not_fatal() {
    let script = Script::replies([
        "not json".to_string(),
        r#"{"hand_detected":true,"raised_fingers":1,"finger_states":[true],"message":"","processed_frame":""}"#.to_string(),
        BASIC_FEEDBACK.to_string(),
    ]);
    let service = TestService::spawn(script).await;
    let orchestrator = SessionOrchestrator::new(service.config());
    let context = SessionContext::new(GOOD_TOKEN, "fist").unwrap();

    let (session, mut events) = orchestrator
        .start_with_channel(context, StaticFrame::dummy())
        .unwrap();

    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected(_)));

    for _ in 0..2 {
        let event = next_event(&mut events).await;
        let SessionEvent::Error(payload) = &event else {
            panic!("Expected Error event, got: {event:?}");
        };
        assert_eq!(payload.kind, ErrorKind::Decode);
        assert!(!payload.fatal);
    }

    let event = next_event(&mut events).await;
    assert!(matches!(event, SessionEvent::Feedback(_)));
    assert_eq!(session.state(), ConnectionState::Open);

    let summary = session.stop().await;
    assert_eq!(summary.decode_errors, 2);
    assert_eq!(summary.feedback_received, 1);
}

/// An abnormal close from the service is reported once as connection lost.
#[tokio::test]
async fn test_abnormal_close_is_fatal() {
    let script = Script::replies([BASIC_FEEDBACK]).then_close(1011, "internal error");
    let service = TestService::spawn(script).await;
    let orchestrator = SessionOrchestrator::new(service.config());
    let context = SessionContext::new(GOOD_TOKEN, "fist").unwrap();

    let (session, mut events) = orchestrator
        .start_with_channel(context, StaticFrame::dummy())
        .unwrap();

    let event = event_matching(&mut events, |e| matches!(e, SessionEvent::Error(_))).await;
    let SessionEvent::Error(payload) = &event else {
        unreachable!();
    };
    assert_eq!(payload.kind, ErrorKind::ConnectionLost);
    assert!(payload.fatal);
    assert!(payload.message.contains("1011"));

    timeout(Duration::from_secs(5), async {
        while !session.is_finished() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Session should end after connection loss");

    let summary = session.stop().await;
    assert_eq!(summary.final_state, ConnectionState::Failed);
    while let Ok(event) = events.try_recv() {
        assert!(!event.is_fatal(), "Fatal error reported twice");
    }
}

/// A normal close from the service ends the session cleanly.
#[tokio::test]
async fn test_peer_normal_close() {
    let script = Script::default().then_close(NORMAL_CLOSURE, "exercise complete");
    let service = TestService::spawn(script).await;
    let orchestrator = SessionOrchestrator::new(service.config());
    let context = SessionContext::new(GOOD_TOKEN, "fist").unwrap();

    let (session, mut events) = orchestrator
        .start_with_channel(context, StaticFrame::dummy())
        .unwrap();

    let event = event_matching(&mut events, |e| matches!(e, SessionEvent::Closed(_))).await;
    let SessionEvent::Closed(payload) = event else {
        unreachable!();
    };
    assert_eq!(payload.code, NORMAL_CLOSURE);
    assert_eq!(payload.reason, "exercise complete");
    assert_eq!(payload.initiator, CloseInitiator::Peer);

    let summary = session.stop().await;
    assert_eq!(summary.final_state, ConnectionState::Closed);
}

// ============================================================================
// Shutdown
// ============================================================================

/// Stopping sends a normal closure and silences the callback for good.
#[tokio::test]
async fn test_stop_silences_notifications() {
    let service = TestService::spawn(Script::replies([BASIC_FEEDBACK]).repeating()).await;
    let orchestrator = SessionOrchestrator::new(service.config());
    let context = SessionContext::new(GOOD_TOKEN, "fist").unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let session = orchestrator
        .start(context, StaticFrame::dummy(), move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    timeout(Duration::from_secs(5), async {
        while count.load(Ordering::SeqCst) < 5 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Expected a steady stream of feedback");

    session.stop().await;
    let after_stop = count.load(Ordering::SeqCst);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(count.load(Ordering::SeqCst), after_stop);

    service
        .wait_for("close frame", |o| !o.closes.is_empty())
        .await;
    let observed = service.observed.lock().await;
    assert_eq!(
        observed.closes[0],
        (NORMAL_CLOSURE, NORMAL_CLOSURE_REASON.to_string())
    );
}

/// Dropping the handle also shuts the session down.
#[tokio::test]
async fn test_dropping_handle_closes_channel() {
    let service = TestService::spawn(Script::default()).await;
    let orchestrator = SessionOrchestrator::new(service.config());
    let context = SessionContext::new(GOOD_TOKEN, "fist").unwrap();

    let (session, mut events) = orchestrator
        .start_with_channel(context, StaticFrame::dummy())
        .unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected(_)));

    drop(session);

    service
        .wait_for("close frame", |o| !o.closes.is_empty())
        .await;
}

// ============================================================================
// Session context
// ============================================================================

/// Unknown exercise names fall back to `fist` on the wire.
#[tokio::test]
async fn test_unknown_exercise_falls_back_to_fist() {
    let service = TestService::spawn(Script::default()).await;
    let orchestrator = SessionOrchestrator::new(service.config());
    let context = SessionContext::new(GOOD_TOKEN, "jumping-jacks").unwrap();

    let (session, mut events) = orchestrator
        .start_with_channel(context, StaticFrame::dummy())
        .unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected(_)));

    service.wait_for("a frame", |o| !o.frames.is_empty()).await;
    {
        let observed = service.observed.lock().await;
        assert_eq!(observed.exercises, vec!["fist".to_string()]);
        assert!(observed.frames[0].contains(r#""exercise_type":"fist""#));
    }

    session.stop().await;
}

/// The token travels percent-encoded and arrives intact.
#[tokio::test]
async fn test_token_is_percent_encoded() {
    let service = TestService::spawn(Script::default()).await;
    let orchestrator = SessionOrchestrator::new(service.config());
    let context = SessionContext::new("good a&b=c", "fist-index").unwrap();

    let (session, mut events) = orchestrator
        .start_with_channel(context, StaticFrame::dummy())
        .unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected(_)));

    assert_eq!(
        service.observed.lock().await.tokens,
        vec!["good a&b=c".to_string()]
    );
    session.stop().await;
}

/// Frame counters are published to snapshot subscribers while streaming.
#[tokio::test]
async fn test_subscribers_see_frame_counters() {
    let service = TestService::spawn(Script::default()).await;
    let orchestrator = SessionOrchestrator::new(service.config());
    let context = SessionContext::new(GOOD_TOKEN, "fist").unwrap();

    let (session, mut events) = orchestrator
        .start_with_channel(context, StaticFrame::dummy())
        .unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected(_)));

    let mut snapshots = session.subscribe();
    let snapshot = timeout(
        Duration::from_secs(5),
        snapshots.wait_for(|s| s.frames.sent >= 3),
    )
    .await
    .expect("Frame counters never reached subscribers")
    .unwrap()
    .clone();
    assert!(snapshot.frames.ticks >= 3);
    assert!(snapshot.last_feedback.is_none());
    assert!(session.snapshot().frames.sent >= 3);

    let summary = session.stop().await;
    assert!(summary.frames.sent >= snapshot.frames.sent);
}

/// Stopping returns promptly even when the service stopped reading.
#[tokio::test]
async fn test_stop_with_stalled_peer_returns_promptly() {
    let service = TestService::spawn(Script::stalled()).await;
    let mut config = service.config();
    config.frame_interval_ms = 20;
    let orchestrator = SessionOrchestrator::new(config);
    let context = SessionContext::new(GOOD_TOKEN, "fist").unwrap();

    // Large frames fill the socket buffers within a few ticks.
    let (session, mut events) = orchestrator
        .start_with_channel(context, StaticFrame::new(vec![0u8; 4 * 1024 * 1024]))
        .unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected(_)));

    let mut snapshots = session.subscribe();
    timeout(
        Duration::from_secs(10),
        snapshots.wait_for(|s| s.frames.dropped_busy >= 5),
    )
    .await
    .expect("Sends never stalled")
    .unwrap();

    let started = Instant::now();
    let summary = timeout(CLOSE_GRACE * 3, session.stop())
        .await
        .expect("stop() hung on a stalled connection");

    assert!(started.elapsed() < CLOSE_GRACE * 2);
    assert_eq!(summary.final_state, ConnectionState::Closed);
    assert!(summary.frames.dropped_busy >= 5);
}
