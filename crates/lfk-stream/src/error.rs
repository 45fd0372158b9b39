//! Error types for the LFK exercise stream.
//!
//! This module defines the error hierarchy for every streaming operation,
//! including configuration loading, connection lifecycle, frame transmission,
//! feedback decoding, and the collaborator HTTP calls.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A specialized `Result` type for LFK stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors that can occur while running an exercise session.
///
/// Variants are grouped by subsystem. Connection-level failures end the
/// session; send and decode failures are reported and the stream continues.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in the configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your lfk.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    /// Session context is unusable (for example an empty token).
    #[error("Invalid session: {0}\n\nSuggestion: Log in again to obtain a fresh token")]
    InvalidSession(String),

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// The WebSocket handshake failed or timed out.
    #[error("Failed to connect to '{endpoint}': {message}\n\nSuggestion: Check that the analysis service is reachable and the token is valid")]
    ConnectError {
        /// The endpoint that was dialed, with the token redacted.
        endpoint: String,
        /// Description of the handshake failure.
        message: String,
    },

    /// The transport failed while the channel was open.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The peer closed the channel with a non-normal close code.
    #[error("Connection closed abnormally (code {code}): {reason}")]
    AbnormalClose {
        /// WebSocket close code sent by the peer.
        code: u16,
        /// Close reason sent by the peer.
        reason: String,
    },

    /// An operation that requires an open channel was attempted outside `Open`.
    #[error("Not connected: channel is {state}")]
    NotConnected {
        /// The connection state observed when the operation was attempted.
        state: String,
    },

    // ========================================================================
    // Per-frame Errors
    // ========================================================================
    /// A single outbound frame failed to transmit.
    #[error("Failed to send frame: {0}")]
    SendError(String),

    /// An inbound message did not match the feedback schema.
    #[error("Malformed feedback message: {0}")]
    DecodeError(String),

    /// The frame source could not produce a payload for this tick.
    #[error("Frame source failed: {0}")]
    FrameError(String),

    // ========================================================================
    // Collaborator API Errors
    // ========================================================================
    /// The collaborator API answered with a non-success status.
    #[error("API request failed with status {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message reported by the server.
        message: String,
    },

    /// HTTP transport error while calling the collaborator API.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // ========================================================================
    // General Errors
    // ========================================================================
    /// General I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid connection state transition attempted.
    #[error("Invalid state transition: cannot go from {from} to {to}")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
    },
}

/// Coarse classification of a [`StreamError`], used in session events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Handshake failure on open.
    Connect,
    /// Transport failure or abnormal close while open.
    ConnectionLost,
    /// Operation attempted outside the open state.
    NotConnected,
    /// One frame failed to transmit.
    Send,
    /// One inbound message could not be decoded.
    Decode,
    /// The frame source failed for one tick.
    Frame,
    /// Anything else (configuration, I/O, API).
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::ConnectionLost => write!(f, "connection_lost"),
            Self::NotConnected => write!(f, "not_connected"),
            Self::Send => write!(f, "send"),
            Self::Decode => write!(f, "decode"),
            Self::Frame => write!(f, "frame"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl StreamError {
    /// Creates a new `ConfigParseError` with the given path and message.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError` with the given message and suggestion.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `ConnectError`.
    #[must_use]
    pub fn connect(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectError {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Creates a new `NotConnected` error for the observed state.
    #[must_use]
    pub fn not_connected(state: impl std::fmt::Display) -> Self {
        Self::NotConnected {
            state: state.to_string(),
        }
    }

    /// Creates a new `AbnormalClose` error.
    #[must_use]
    pub fn abnormal_close(code: u16, reason: impl Into<String>) -> Self {
        Self::AbnormalClose {
            code,
            reason: reason.into(),
        }
    }

    /// Creates a new `Api` error.
    #[must_use]
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Creates a new `InvalidStateTransition` error.
    #[must_use]
    pub fn invalid_transition(from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Returns the coarse kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectError { .. } => ErrorKind::Connect,
            Self::ConnectionLost(_) | Self::AbnormalClose { .. } => ErrorKind::ConnectionLost,
            Self::NotConnected { .. } => ErrorKind::NotConnected,
            Self::SendError(_) => ErrorKind::Send,
            Self::DecodeError(_) => ErrorKind::Decode,
            Self::FrameError(_) => ErrorKind::Frame,
            _ => ErrorKind::Other,
        }
    }

    /// Returns `true` if this error is transient and the operation may be retried.
    ///
    /// Handshake failures count as transient so a backoff wrapper can retry
    /// `open`; per-frame glitches are transient by nature.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectError { .. }
                | Self::SendError(_)
                | Self::DecodeError(_)
                | Self::FrameError(_)
                | Self::NotConnected { .. }
        )
    }

    /// Returns `true` if this error ends the session.
    ///
    /// A fatal error means "connection lost": the caller should stop
    /// streaming and offer a reconnect.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigParseError { .. }
                | Self::ConfigValidationError { .. }
                | Self::InvalidSession(_)
                | Self::ConnectError { .. }
                | Self::ConnectionLost(_)
                | Self::AbnormalClose { .. }
                | Self::Api { status: 401 | 403, .. }
        )
    }
}
