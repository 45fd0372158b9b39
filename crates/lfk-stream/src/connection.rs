//! Lifecycle of the bidirectional channel to the analysis service.
//!
//! A [`ConnectionManager`] owns the connection state for one session and is
//! its only writer. `open` performs the WebSocket handshake (bounded by the
//! configured timeout) and spawns a receive loop that forwards every inbound
//! message to a [`LinkEvent`] sink until the channel closes or fails.
//!
//! The manager never reconnects on its own; see [`crate::backoff`].
//!
//! # State machine
//!
//! ```text
//! Disconnected -> Connecting -> Open -> Closing -> Closed
//!                     |           |-------------> Closed   (peer close, code 1000)
//!                     |           `-------------> Failed   (transport error, abnormal close)
//!                     |-------------------------> Failed   (handshake error)
//!                     `-------------------------> Closed   (handshake abandoned)
//! ```
//!
//! `Closed` and `Failed` may move back to `Connecting` when `open` is called
//! again on the same manager.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::ExerciseType;
use crate::error::{Result, StreamError};

/// WebSocket close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code recorded when the peer closed without a status.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Bound on each step of `close`: delivering the close frame, then awaiting the acknowledgement.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

// ============================================================================
// ConnectionState
// ============================================================================

/// State of the channel to the analysis service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No channel has been opened yet.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Channel is usable for sending and receiving.
    Open,
    /// A local normal close is in progress.
    Closing,
    /// The channel ended with a normal closure.
    Closed,
    /// The handshake failed or the channel broke.
    Failed,
}

impl ConnectionState {
    /// Returns `true` once the channel has ended, normally or not.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Returns `true` if frames may be sent.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns `true` if moving from `self` to `to` is allowed.
    #[must_use]
    pub const fn can_transition_to(&self, to: Self) -> bool {
        matches!(
            (self, to),
            (
                Self::Disconnected | Self::Closed | Self::Failed,
                Self::Connecting
            ) | (Self::Connecting, Self::Open | Self::Closed | Self::Failed)
                | (Self::Open, Self::Closing | Self::Closed | Self::Failed)
                | (Self::Closing, Self::Closed)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Applies a validated transition to the shared state.
fn transition(state: &watch::Sender<ConnectionState>, to: ConnectionState) -> Result<()> {
    let mut outcome = Ok(());
    state.send_if_modified(|current| {
        if current.can_transition_to(to) {
            debug!(from = %current, to = %to, "Connection state change");
            *current = to;
            true
        } else {
            outcome = Err(StreamError::invalid_transition(*current, to));
            false
        }
    });
    outcome
}

// ============================================================================
// Endpoint
// ============================================================================

/// The exercise endpoint for one session, with the token as a query parameter.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    /// Builds `ws://{host}/ws/exercise/{exercise}?token={token}`.
    ///
    /// The token is percent-encoded.
    pub fn new(host: &str, exercise: ExerciseType, token: &str) -> Result<Self> {
        let base = format!("ws://{host}/ws/exercise/{}", exercise.as_str());
        let mut url =
            Url::parse(&base).map_err(|e| StreamError::connect(base.clone(), e.to_string()))?;
        url.query_pairs_mut().append_pair("token", token);
        Ok(Self { url })
    }

    /// Returns the full URL, token included.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Returns the URL with the token value masked, for logs and errors.
    #[must_use]
    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        url.set_query(Some("token=***"));
        url.to_string()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Endpoint").field(&self.redacted()).finish()
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

// ============================================================================
// LinkEvent
// ============================================================================

/// Which side started a normal closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseInitiator {
    /// This client called `close`.
    Local,
    /// The analysis service sent the close frame.
    Peer,
}

/// Everything the receive loop reports to its sink.
#[derive(Debug)]
pub enum LinkEvent {
    /// A text message from the service.
    Text(String),
    /// A binary message from the service.
    Binary(Vec<u8>),
    /// The channel ended with a normal closure. Final event.
    Closed {
        /// Close code reported by the peer.
        code: u16,
        /// Close reason.
        reason: String,
        /// Who started the closure.
        initiator: CloseInitiator,
    },
    /// The channel broke. Final event.
    Failed(StreamError),
}

// ============================================================================
// ConnectionManager
// ============================================================================

/// Opens channels and owns the connection state for one session.
#[derive(Debug)]
pub struct ConnectionManager {
    connect_timeout: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionManager {
    /// Creates a manager in the `Disconnected` state.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connect_timeout,
            state: Arc::new(state),
        }
    }

    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to connection state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Marks an interrupted handshake as closed.
    ///
    /// Used when the caller drops an `open` future before it completes.
    pub fn abandon(&self) {
        if self.state() == ConnectionState::Connecting {
            let _ = transition(&self.state, ConnectionState::Closed);
            debug!("Handshake abandoned");
        }
    }

    /// Performs the handshake and starts the receive loop.
    ///
    /// Inbound messages and the final close/failure event are delivered to
    /// `sink`. The handshake is bounded by the connect timeout.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::ConnectError` if the handshake fails or times
    /// out; the state is then `Failed`.
    #[instrument(skip(self, endpoint, sink), fields(endpoint = %endpoint))]
    pub async fn open(
        &self,
        endpoint: &Endpoint,
        sink: mpsc::Sender<LinkEvent>,
    ) -> Result<ConnectionHandle> {
        transition(&self.state, ConnectionState::Connecting)?;
        info!("Connecting to analysis service");

        let handshake = tokio::time::timeout(self.connect_timeout, connect_async(endpoint.as_str()));
        let stream = match handshake.await {
            Ok(Ok((stream, response))) => {
                debug!(status = %response.status(), "Handshake complete");
                stream
            }
            Ok(Err(e)) => {
                transition(&self.state, ConnectionState::Failed)?;
                warn!(error = %e, "Handshake failed");
                return Err(StreamError::connect(endpoint.redacted(), e.to_string()));
            }
            Err(_) => {
                transition(&self.state, ConnectionState::Failed)?;
                warn!(timeout_secs = self.connect_timeout.as_secs(), "Handshake timed out");
                return Err(StreamError::connect(
                    endpoint.redacted(),
                    format!(
                        "handshake timed out after {}s",
                        self.connect_timeout.as_secs()
                    ),
                ));
            }
        };

        let (writer, reader) = stream.split();
        transition(&self.state, ConnectionState::Open)?;
        info!("Channel open");

        let cancel = CancellationToken::new();
        let receiver = tokio::spawn(receive_loop(
            reader,
            sink,
            Arc::clone(&self.state),
            cancel.clone(),
        ));

        Ok(ConnectionHandle {
            writer: Arc::new(Mutex::new(writer)),
            state: Arc::clone(&self.state),
            receiver: Arc::new(Mutex::new(Some(receiver))),
            cancel,
        })
    }
}

/// Forwards inbound messages until the channel ends or `cancel` fires.
async fn receive_loop(
    mut reader: WsSource,
    sink: mpsc::Sender<LinkEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    cancel: CancellationToken,
) {
    let last = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("Receive loop cancelled");
                return;
            }
            msg = reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if sink.send(LinkEvent::Text(text)).await.is_err() {
                            debug!("Link sink dropped, stopping receive loop");
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if sink.send(LinkEvent::Binary(data)).await.is_err() {
                            debug!("Link sink dropped, stopping receive loop");
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame.map_or_else(
                            || (NO_STATUS_RECEIVED, String::new()),
                            |f| (u16::from(f.code), f.reason.into_owned()),
                        );
                        break end_of_stream(&state, code, reason);
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        break end_of_stream_with_error(&state, e.to_string());
                    }
                    None => {
                        break end_of_stream_with_error(&state, "stream ended".to_string());
                    }
                }
            }
        }
    };

    // The sink may already be gone during teardown.
    let _ = sink.send(last).await;
}

/// Resolves a close frame into the final state and event.
fn end_of_stream(
    state: &watch::Sender<ConnectionState>,
    code: u16,
    reason: String,
) -> LinkEvent {
    let closing = *state.borrow() == ConnectionState::Closing;
    if closing || code == NORMAL_CLOSURE {
        let _ = transition(state, ConnectionState::Closed);
        let initiator = if closing {
            CloseInitiator::Local
        } else {
            CloseInitiator::Peer
        };
        info!(code, reason = %reason, ?initiator, "Channel closed");
        LinkEvent::Closed {
            code,
            reason,
            initiator,
        }
    } else {
        let _ = transition(state, ConnectionState::Failed);
        warn!(code, reason = %reason, "Channel closed abnormally");
        LinkEvent::Failed(StreamError::abnormal_close(code, reason))
    }
}

/// Resolves a transport error into the final state and event.
fn end_of_stream_with_error(state: &watch::Sender<ConnectionState>, message: String) -> LinkEvent {
    if *state.borrow() == ConnectionState::Closing {
        let _ = transition(state, ConnectionState::Closed);
        return LinkEvent::Closed {
            code: NORMAL_CLOSURE,
            reason: message,
            initiator: CloseInitiator::Local,
        };
    }
    let _ = transition(state, ConnectionState::Failed);
    warn!(error = %message, "Connection lost");
    LinkEvent::Failed(StreamError::ConnectionLost(message))
}

// ============================================================================
// ConnectionHandle
// ============================================================================

/// Sending half of an open channel. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionHandle {
    writer: Arc<Mutex<WsSink>>,
    state: Arc<watch::Sender<ConnectionState>>,
    receiver: Arc<Mutex<Option<JoinHandle<()>>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Returns the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to connection state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Sends one text message.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::NotConnected` outside `Open` (nothing is sent)
    /// and `StreamError::SendError` if the transport rejects the message.
    /// Neither changes the connection state.
    pub async fn send(&self, payload: String) -> Result<()> {
        let state = self.state();
        if !state.is_open() {
            return Err(StreamError::not_connected(state));
        }
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(payload))
            .await
            .map_err(|e| StreamError::SendError(e.to_string()))
    }

    /// Closes the channel with a normal closure.
    ///
    /// Waits briefly for the peer's acknowledgement, then stops the receive
    /// loop. Delivering the close frame and awaiting the acknowledgement are
    /// each bounded by [`CLOSE_GRACE`]. Calling `close` on a channel that
    /// already ended is a no-op.
    pub async fn close(&self, reason: &str) {
        let mut delivered = true;
        if transition(&self.state, ConnectionState::Closing).is_ok() {
            info!(reason, "Closing channel");
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Owned(reason.to_string()),
            };
            let delivery = tokio::time::timeout(CLOSE_GRACE, async move {
                let mut writer = self.writer.lock().await;
                writer.send(Message::Close(Some(frame))).await
            });
            match delivery.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Close frame not delivered"),
                Err(_) => {
                    warn!("Close frame stalled, peer is not reading");
                    delivered = false;
                }
            }
        }

        let receiver = self.receiver.lock().await.take();
        if let Some(mut receiver) = receiver {
            let finished =
                delivered && tokio::time::timeout(CLOSE_GRACE, &mut receiver).await.is_ok();
            if !finished {
                debug!("Peer did not acknowledge close in time");
                self.cancel.cancel();
                receiver.abort();
                let _ = receiver.await;
            }
        }

        if *self.state.borrow() == ConnectionState::Closing {
            let _ = transition(&self.state, ConnectionState::Closed);
        }
    }

    /// Stops the receive loop without sending a close frame.
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}
