//! Session orchestration: one cancellable streaming unit per exercise.
//!
//! [`SessionOrchestrator::start`] opens the channel, runs the frame producer
//! and the receive loop concurrently, feeds decoded feedback through the
//! progress state machine, and reports everything through a single
//! notification callback carrying a tagged [`SessionEvent`].
//!
//! [`SessionHandle::stop`] guarantees that the callback is never invoked once
//! it returns: the notification gate is closed before the session task is
//! cancelled, and the gate is held for the whole duration of each callback.
//!
//! # Example
//!
//! ```no_run
//! use lfk_stream::{Config, SessionContext, SessionOrchestrator, StaticFrame};
//!
//! # async fn example() -> lfk_stream::Result<()> {
//! let orchestrator = SessionOrchestrator::new(Config::default());
//! let context = SessionContext::new("my-token", "fist-palm")?;
//!
//! let session = orchestrator.start(context, StaticFrame::dummy(), |event| {
//!     println!("{}", event.event_name());
//! })?;
//!
//! tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//! let summary = session.stop().await;
//! println!("sent {} frames", summary.frames.sent);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::backoff::with_retry;
use crate::config::{Config, ExerciseType};
use crate::connection::{
    CloseInitiator, ConnectionHandle, ConnectionManager, ConnectionState, Endpoint, LinkEvent,
};
use crate::error::{ErrorKind, Result, StreamError};
use crate::feedback::{Feedback, FeedbackDecoder};
use crate::producer::{FrameProducer, FrameSource, FrameStats};
use crate::progress::{ProgressStateMachine, ProgressView};

/// Close reason sent when the client stops a session.
pub const NORMAL_CLOSURE_REASON: &str = "Normal closure";

/// Capacity of the channel between the receive loop and the session task.
const LINK_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// SessionContext
// ============================================================================

/// The explicit context of one session: who streams, and which exercise.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionContext {
    token: String,
    exercise: ExerciseType,
}

impl SessionContext {
    /// Creates a context from a token and an exercise name.
    ///
    /// Unknown exercise names fall back to `fist`.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::InvalidSession` if the token is empty.
    pub fn new(token: impl Into<String>, exercise: &str) -> Result<Self> {
        Self::with_exercise(token, ExerciseType::parse_or_default(exercise))
    }

    /// Creates a context for an already-parsed exercise.
    pub fn with_exercise(token: impl Into<String>, exercise: ExerciseType) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(StreamError::InvalidSession(
                "token must not be empty".to_string(),
            ));
        }
        Ok(Self { token, exercise })
    }

    /// Returns the bearer token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Returns the exercise being streamed.
    #[must_use]
    pub const fn exercise(&self) -> ExerciseType {
        self.exercise
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("token", &"***")
            .field("exercise", &self.exercise)
            .finish()
    }
}

// ============================================================================
// Event Payloads
// ============================================================================

/// Payload for the `connected` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedPayload {
    /// Endpoint that was opened, token redacted.
    pub endpoint: String,
    /// Exercise being streamed.
    pub exercise: ExerciseType,
    /// When the handshake completed.
    pub connected_at: DateTime<Utc>,
}

/// Payload for the `feedback` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackPayload {
    /// The decoded analysis result.
    pub feedback: Feedback,
    /// Progress read model after applying this feedback.
    pub progress: ProgressView,
    /// When the message was decoded.
    pub received_at: DateTime<Utc>,
}

/// Payload for the `error` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Coarse error classification.
    pub kind: ErrorKind,
    /// Human-readable error message.
    pub message: String,
    /// `true` if the session ended because of this error.
    pub fatal: bool,
}

/// Payload for the `closed` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPayload {
    /// Close code.
    pub code: u16,
    /// Close reason.
    pub reason: String,
    /// Who started the closure.
    pub initiator: CloseInitiator,
}

// ============================================================================
// Event Enum
// ============================================================================

/// Notification delivered to the session's callback.
///
/// Serialized as JSON objects with "event" and "payload" fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The channel is open and frames are flowing.
    Connected(ConnectedPayload),
    /// A feedback message was decoded.
    Feedback(Box<FeedbackPayload>),
    /// Something went wrong; see `fatal`.
    Error(ErrorPayload),
    /// The peer closed the channel normally.
    Closed(ClosedPayload),
}

impl SessionEvent {
    /// Creates a `Connected` event.
    #[must_use]
    pub fn connected(endpoint: &Endpoint, exercise: ExerciseType) -> Self {
        Self::Connected(ConnectedPayload {
            endpoint: endpoint.redacted(),
            exercise,
            connected_at: Utc::now(),
        })
    }

    /// Creates a `Feedback` event.
    #[must_use]
    pub fn feedback(feedback: Feedback, progress: ProgressView) -> Self {
        Self::Feedback(Box::new(FeedbackPayload {
            feedback,
            progress,
            received_at: Utc::now(),
        }))
    }

    /// Creates an `Error` event from a stream error.
    #[must_use]
    pub fn error(error: &StreamError) -> Self {
        Self::Error(ErrorPayload {
            kind: error.kind(),
            message: error.to_string(),
            fatal: error.is_fatal(),
        })
    }

    /// Creates a `Closed` event.
    #[must_use]
    pub fn closed(code: u16, reason: impl Into<String>, initiator: CloseInitiator) -> Self {
        Self::Closed(ClosedPayload {
            code,
            reason: reason.into(),
            initiator,
        })
    }

    /// Returns the event name as a string.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::Feedback(_) => "feedback",
            Self::Error(_) => "error",
            Self::Closed(_) => "closed",
        }
    }

    /// Returns `true` for an error that ended the session.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Error(ErrorPayload { fatal: true, .. }))
    }
}

// ============================================================================
// Snapshot and Summary
// ============================================================================

/// Consistent view of a running session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Exercise being streamed.
    pub exercise: ExerciseType,
    /// Connection state.
    pub state: ConnectionState,
    /// Most recent successfully decoded feedback.
    pub last_feedback: Option<Feedback>,
    /// Progress read model.
    pub progress: ProgressView,
    /// Frame producer counters.
    pub frames: FrameStats,
    /// Feedback messages decoded.
    pub feedback_received: u64,
    /// Inbound messages that failed to decode.
    pub decode_errors: u64,
}

impl SessionSnapshot {
    fn new(exercise: ExerciseType, progress: ProgressView) -> Self {
        Self {
            exercise,
            state: ConnectionState::Disconnected,
            last_feedback: None,
            progress,
            frames: FrameStats::default(),
            feedback_received: 0,
            decode_errors: 0,
        }
    }
}

/// Final outcome of a session, returned by [`SessionHandle::stop`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Exercise that was streamed.
    pub exercise: ExerciseType,
    /// Connection state when the session ended.
    pub final_state: ConnectionState,
    /// Frame producer counters.
    pub frames: FrameStats,
    /// Feedback messages decoded.
    pub feedback_received: u64,
    /// Inbound messages that failed to decode.
    pub decode_errors: u64,
}

impl From<SessionSnapshot> for SessionSummary {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            exercise: snapshot.exercise,
            final_state: snapshot.state,
            frames: snapshot.frames,
            feedback_received: snapshot.feedback_received,
            decode_errors: snapshot.decode_errors,
        }
    }
}

// ============================================================================
// Notification gate
// ============================================================================

type Notify = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Holds the callback until `stop` takes it away.
#[derive(Clone)]
struct Gate(Arc<Mutex<Option<Notify>>>);

impl Gate {
    fn new(notify: Notify) -> Self {
        Self(Arc::new(Mutex::new(Some(notify))))
    }

    /// Invokes the callback while holding the gate.
    async fn emit(&self, event: SessionEvent) {
        let guard = self.0.lock().await;
        if let Some(notify) = guard.as_ref() {
            notify(event);
        } else {
            debug!(event = event.event_name(), "Session stopped, event suppressed");
        }
    }

    /// Waits for any callback in progress, then disables the gate.
    async fn close(&self) {
        self.0.lock().await.take();
    }
}

// ============================================================================
// SessionOrchestrator
// ============================================================================

/// Starts streaming sessions from a shared configuration.
#[derive(Debug, Clone)]
pub struct SessionOrchestrator {
    config: Arc<Config>,
}

impl SessionOrchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Returns the configuration sessions are started with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts a session and returns immediately.
    ///
    /// The channel is opened in the background; the outcome arrives through
    /// `notify`. A failed handshake produces exactly one fatal `error` event
    /// and the frame producer never runs.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error only if the endpoint cannot be built from the
    /// configured host.
    pub fn start<S, F>(&self, context: SessionContext, source: S, notify: F) -> Result<SessionHandle>
    where
        S: FrameSource,
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        let exercise = context.exercise();
        let endpoint = Endpoint::new(&self.config.host, exercise, context.token())?;
        let progress = ProgressStateMachine::new(self.config.steps_for(exercise).to_vec());

        let (snapshot_tx, snapshot_rx) =
            watch::channel(SessionSnapshot::new(exercise, progress.view()));
        let (stats_tx, _) = watch::channel(FrameStats::default());
        let gate = Gate::new(Arc::new(notify));
        let cancel = CancellationToken::new();

        info!(exercise = %exercise, endpoint = %endpoint, "Starting session");

        let run = SessionRun {
            config: Arc::clone(&self.config),
            exercise,
            endpoint,
            progress,
            gate: gate.clone(),
            snapshot: snapshot_tx,
            stats: Arc::new(stats_tx),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(run.drive(source));

        Ok(SessionHandle {
            exercise,
            gate,
            cancel: cancel.clone(),
            _guard: cancel.drop_guard(),
            task,
            snapshot: snapshot_rx,
        })
    }

    /// Starts a session whose events are delivered on a channel.
    pub fn start_with_channel<S>(
        &self,
        context: SessionContext,
        source: S,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>)>
    where
        S: FrameSource,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.start(context, source, move |event| {
            let _ = tx.send(event);
        })?;
        Ok((handle, rx))
    }
}

// ============================================================================
// Session task
// ============================================================================

struct SessionRun {
    config: Arc<Config>,
    exercise: ExerciseType,
    endpoint: Endpoint,
    progress: ProgressStateMachine,
    gate: Gate,
    snapshot: watch::Sender<SessionSnapshot>,
    stats: Arc<watch::Sender<FrameStats>>,
    cancel: CancellationToken,
}

impl SessionRun {
    async fn drive<S: FrameSource>(mut self, source: S) -> SessionSummary {
        let manager = ConnectionManager::new(self.config.connect_timeout());
        let (link_tx, mut link_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);

        self.set_state(ConnectionState::Connecting);
        let opened = tokio::select! {
            () = self.cancel.cancelled() => {
                manager.abandon();
                self.set_state(manager.state());
                return self.summary();
            }
            opened = with_retry(&self.config.retry, |attempt| {
                if attempt > 0 {
                    info!(attempt, "Retrying connection");
                }
                manager.open(&self.endpoint, link_tx.clone())
            }) => opened,
        };
        drop(link_tx);

        let handle = match opened {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Session could not connect");
                self.set_state(manager.state());
                self.gate.emit(SessionEvent::error(&e)).await;
                return self.summary();
            }
        };

        self.set_state(manager.state());
        self.gate
            .emit(SessionEvent::connected(&self.endpoint, self.exercise))
            .await;

        let producer_cancel = self.cancel.child_token();
        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
        let producer = FrameProducer::new(
            self.config.frame_interval(),
            self.exercise,
            source,
            Arc::new(handle.clone()),
            Arc::clone(&self.stats),
            errors_tx,
        );
        let producer_task = tokio::spawn(producer.run(producer_cancel.clone()));

        self.receive(&handle, &mut link_rx, &mut errors_rx).await;

        producer_cancel.cancel();
        if let Err(e) = producer_task.await {
            warn!(error = %e, "Frame producer task failed");
        }
        self.set_state(manager.state());

        let summary = self.summary();
        info!(
            state = %summary.final_state,
            feedback = summary.feedback_received,
            frames_sent = summary.frames.sent,
            "Session ended"
        );
        summary
    }

    /// Handles inbound traffic until the channel ends or the session is stopped.
    async fn receive(
        &mut self,
        handle: &ConnectionHandle,
        link_rx: &mut mpsc::Receiver<LinkEvent>,
        errors_rx: &mut mpsc::UnboundedReceiver<StreamError>,
    ) {
        let decoder = FeedbackDecoder::new();
        let mut frames_rx = self.stats.subscribe();
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    handle.close(NORMAL_CLOSURE_REASON).await;
                    return;
                }
                Some(error) = errors_rx.recv() => {
                    self.gate.emit(SessionEvent::error(&error)).await;
                }
                Ok(()) = frames_rx.changed() => self.sync_frames(),
                event = link_rx.recv() => match event {
                    Some(LinkEvent::Text(text)) => self.on_message(decoder.decode(&text)).await,
                    Some(LinkEvent::Binary(data)) => {
                        self.on_message(decoder.decode_bytes(&data)).await;
                    }
                    Some(LinkEvent::Closed { code, reason, initiator }) => {
                        self.set_state(handle.state());
                        self.gate.emit(SessionEvent::closed(code, reason, initiator)).await;
                        return;
                    }
                    Some(LinkEvent::Failed(error)) => {
                        self.set_state(handle.state());
                        self.gate.emit(SessionEvent::error(&error)).await;
                        return;
                    }
                    None => return,
                },
            }
        }
    }

    async fn on_message(&mut self, decoded: Result<Feedback>) {
        match decoded {
            Ok(feedback) => {
                let index = self.progress.apply(feedback.structured.as_ref());
                let view = self.progress.view();
                debug!(
                    raised_fingers = feedback.raised_fingers,
                    step = index,
                    "Feedback received"
                );
                self.snapshot.send_modify(|s| {
                    s.last_feedback = Some(feedback.clone());
                    s.progress = view.clone();
                    s.feedback_received += 1;
                });
                self.gate.emit(SessionEvent::feedback(feedback, view)).await;
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed feedback");
                self.snapshot.send_modify(|s| s.decode_errors += 1);
                self.gate.emit(SessionEvent::error(&e)).await;
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.snapshot.send_if_modified(|s| {
            if s.state == state {
                false
            } else {
                s.state = state;
                true
            }
        });
    }

    /// Copies the producer counters into the published snapshot.
    fn sync_frames(&self) {
        let frames = *self.stats.borrow();
        self.snapshot.send_if_modified(|s| {
            if s.frames == frames {
                false
            } else {
                s.frames = frames;
                true
            }
        });
    }

    fn summary(&self) -> SessionSummary {
        self.sync_frames();
        self.snapshot.borrow().clone().into()
    }
}

// ============================================================================
// SessionHandle
// ============================================================================

/// A running session.
///
/// Dropping the handle cancels the session without waiting for it; call
/// [`SessionHandle::stop`] for an orderly shutdown.
pub struct SessionHandle {
    exercise: ExerciseType,
    gate: Gate,
    cancel: CancellationToken,
    _guard: DropGuard,
    task: JoinHandle<SessionSummary>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("exercise", &self.exercise)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Returns the exercise being streamed.
    #[must_use]
    pub const fn exercise(&self) -> ExerciseType {
        self.exercise
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    /// Returns a consistent snapshot of the session.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Subscribes to snapshot changes, frame counters included.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Returns `true` once the session task has ended on its own or was stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the session.
    ///
    /// Cancels the frame producer, closes the channel with a normal closure,
    /// and waits for the session task. No notification is delivered after
    /// this returns.
    pub async fn stop(self) -> SessionSummary {
        info!(exercise = %self.exercise, "Stopping session");
        self.gate.close().await;
        self.cancel.cancel();

        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "Session task failed");
                self.snapshot.borrow().clone().into()
            }
        }
    }
}
