//! LFK Exercise Stream
//!
//! Streams camera frames to the analysis service over a WebSocket, decodes
//! the feedback it sends back, and drives the exercise-progress display.

pub mod api;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod feedback;
pub mod producer;
pub mod progress;
pub mod session;

pub use api::{ApiClient, Exercise, LoginResponse, User};
pub use backoff::{with_retry, RetryPolicy};
pub use config::{Config, ExerciseType, ProgressStep};
pub use connection::{
    CloseInitiator, ConnectionHandle, ConnectionManager, ConnectionState, Endpoint, LinkEvent,
    CLOSE_GRACE, NORMAL_CLOSURE,
};
pub use error::{ErrorKind, Result, StreamError};
pub use feedback::{Feedback, FeedbackDecoder, OutboundFrame, StructuredProgress, FINGER_COUNT};
pub use producer::{
    FileFrame, FrameProducer, FrameSource, FrameStats, FrameTransport, StaticFrame,
};
pub use progress::{ProgressStateMachine, ProgressView, StepMarker, StepView, NO_ACTIVE_STEP};
pub use session::{
    ClosedPayload, ConnectedPayload, ErrorPayload, FeedbackPayload, SessionContext, SessionEvent,
    SessionHandle, SessionOrchestrator, SessionSnapshot, SessionSummary, NORMAL_CLOSURE_REASON,
};
