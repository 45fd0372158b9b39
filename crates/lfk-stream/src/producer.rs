//! Paced frame production with single-slot backpressure.
//!
//! The producer ticks on a fixed interval regardless of network latency. On
//! each tick it skips silently unless the channel is open, pulls the next
//! payload from a [`FrameSource`], and hands it to a [`FrameTransport`]. At
//! most one frame is in flight: if the previous send has not finished, the
//! tick's frame is dropped rather than queued.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ExerciseType;
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::error::{Result, StreamError};
use crate::feedback::OutboundFrame;

// ============================================================================
// Frame sources
// ============================================================================

/// Supplies already-encoded image payloads, one per tick.
pub trait FrameSource: Send + 'static {
    /// Produces the next payload.
    ///
    /// An error skips the current tick only.
    fn next_frame(&mut self) -> Result<Vec<u8>>;
}

impl<F> FrameSource for F
where
    F: FnMut() -> Result<Vec<u8>> + Send + 'static,
{
    fn next_frame(&mut self) -> Result<Vec<u8>> {
        self()
    }
}

/// Repeats the same payload forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFrame {
    bytes: Vec<u8>,
}

impl StaticFrame {
    /// Creates a source that always yields `bytes`.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// The placeholder payload used when no camera is attached.
    #[must_use]
    pub fn dummy() -> Self {
        Self::new(b"dummy".to_vec())
    }
}

impl FrameSource for StaticFrame {
    fn next_frame(&mut self) -> Result<Vec<u8>> {
        Ok(self.bytes.clone())
    }
}

/// Reads an image file on first use and repeats it.
///
/// A failed read skips the tick and is retried on the next one.
#[derive(Debug, Clone)]
pub struct FileFrame {
    path: PathBuf,
    cached: Option<Vec<u8>>,
}

impl FileFrame {
    /// Creates a source backed by the file at `path`.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cached: None,
        }
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSource for FileFrame {
    fn next_frame(&mut self) -> Result<Vec<u8>> {
        if let Some(bytes) = &self.cached {
            return Ok(bytes.clone());
        }
        let bytes = std::fs::read(&self.path).map_err(|e| {
            StreamError::FrameError(format!("cannot read '{}': {e}", self.path.display()))
        })?;
        self.cached = Some(bytes.clone());
        Ok(bytes)
    }
}

// ============================================================================
// Transport seam
// ============================================================================

/// The sending side the producer talks to.
pub trait FrameTransport: Send + Sync + 'static {
    /// Returns the current connection state.
    fn state(&self) -> ConnectionState;

    /// Subscribes to connection state changes.
    fn subscribe(&self) -> watch::Receiver<ConnectionState>;

    /// Starts sending one serialized frame.
    fn send_frame(&self, payload: String) -> BoxFuture<'static, Result<()>>;
}

impl FrameTransport for ConnectionHandle {
    fn state(&self) -> ConnectionState {
        Self::state(self)
    }

    fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        Self::subscribe(self)
    }

    fn send_frame(&self, payload: String) -> BoxFuture<'static, Result<()>> {
        let handle = self.clone();
        async move { handle.send(payload).await }.boxed()
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Counters describing what the producer did with its ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStats {
    /// Ticks fired.
    pub ticks: u64,
    /// Frames delivered to the transport.
    pub sent: u64,
    /// Ticks dropped because the previous frame was still in flight.
    pub dropped_busy: u64,
    /// Ticks skipped because the channel was not open.
    pub skipped_not_open: u64,
    /// Ticks skipped because the frame source failed.
    pub encode_failures: u64,
    /// Frames the transport rejected.
    pub send_failures: u64,
}

// ============================================================================
// FrameProducer
// ============================================================================

/// Fixed-interval frame loop for one session.
pub struct FrameProducer<S, T> {
    interval: Duration,
    exercise: ExerciseType,
    source: S,
    transport: Arc<T>,
    stats: Arc<watch::Sender<FrameStats>>,
    errors: mpsc::UnboundedSender<StreamError>,
}

impl<S: FrameSource, T: FrameTransport> FrameProducer<S, T> {
    /// Creates a producer.
    ///
    /// Non-fatal errors (source failures, rejected sends) are reported on
    /// `errors`; counters are published on `stats`.
    pub fn new(
        interval: Duration,
        exercise: ExerciseType,
        source: S,
        transport: Arc<T>,
        stats: Arc<watch::Sender<FrameStats>>,
        errors: mpsc::UnboundedSender<StreamError>,
    ) -> Self {
        Self {
            interval,
            exercise,
            source,
            transport,
            stats,
            errors,
        }
    }

    /// Runs until `cancel` fires or the channel leaves `Open`.
    ///
    /// Returns the final counters. A frame still in flight on exit is abandoned.
    pub async fn run(mut self, cancel: CancellationToken) -> FrameStats {
        let mut state_rx = self.transport.subscribe();
        if state_rx.borrow_and_update().is_terminal() {
            debug!("Channel already ended, producer not started");
            return *self.stats.borrow();
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<()>> = None;

        info!(
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            exercise = %self.exercise,
            "Frame producer started"
        );

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Frame producer cancelled");
                    break;
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    if state.is_terminal() || state == ConnectionState::Closing {
                        debug!(%state, "Channel left open state, producer stopping");
                        break;
                    }
                }
                _ = ticker.tick() => self.tick(&mut in_flight),
            }
        }

        if let Some(pending) = in_flight {
            pending.abort();
        }

        let stats = *self.stats.borrow();
        info!(
            ticks = stats.ticks,
            sent = stats.sent,
            dropped_busy = stats.dropped_busy,
            "Frame producer stopped"
        );
        stats
    }

    fn tick(&mut self, in_flight: &mut Option<JoinHandle<()>>) {
        self.stats.send_modify(|s| s.ticks += 1);

        let state = self.transport.state();
        if !state.is_open() {
            self.stats.send_modify(|s| s.skipped_not_open += 1);
            return;
        }

        if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
            self.stats.send_modify(|s| s.dropped_busy += 1);
            debug!("Previous frame still in flight, dropping tick");
            return;
        }

        let payload = match self
            .source
            .next_frame()
            .and_then(|bytes| OutboundFrame::new(&bytes, self.exercise).to_json())
        {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.send_modify(|s| s.encode_failures += 1);
                warn!(error = %e, "Frame encoding failed, skipping tick");
                let _ = self.errors.send(e);
                return;
            }
        };

        let send = self.transport.send_frame(payload);
        let stats = Arc::clone(&self.stats);
        let errors = self.errors.clone();
        *in_flight = Some(tokio::spawn(async move {
            match send.await {
                Ok(()) => stats.send_modify(|s| s.sent += 1),
                Err(e) => {
                    stats.send_modify(|s| s.send_failures += 1);
                    warn!(error = %e, "Frame send failed");
                    let _ = errors.send(e);
                }
            }
        }));
    }
}
