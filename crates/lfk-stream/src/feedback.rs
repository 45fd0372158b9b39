//! Wire types for the exercise channel and the feedback decoder.
//!
//! Inbound messages are decoded into the closed [`Feedback`] structure.
//! Required fields must be present with the right shape; optional parts
//! (`structured`, `countdown`, and the service's bookkeeping fields) decode to
//! `None` when absent or `null`. Unknown fields are ignored.
//!
//! # Example
//!
//! ```
//! use lfk_stream::feedback::FeedbackDecoder;
//!
//! let raw = r#"{"hand_detected":true,"raised_fingers":3,
//!     "finger_states":[true,true,true,false,false],
//!     "message":"ok","processed_frame":"","structured":null}"#;
//!
//! let feedback = FeedbackDecoder::new().decode(raw).unwrap();
//! assert_eq!(feedback.raised_fingers, 3);
//! assert!(feedback.structured.is_none());
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::config::ExerciseType;
use crate::error::{Result, StreamError};

/// Number of fingers reported per hand.
pub const FINGER_COUNT: usize = 5;

// ============================================================================
// Inbound
// ============================================================================

/// One decoded analysis result for a single submitted frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    /// Whether a hand was found in the frame.
    pub hand_detected: bool,

    /// Count of raised fingers, in `0..=5`.
    pub raised_fingers: u8,

    /// Raised state per finger, thumb first.
    pub finger_states: [bool; FINGER_COUNT],

    /// Instruction or status text for the user.
    pub message: String,

    /// Annotated frame as base64 JPEG; empty when the service sent none.
    pub processed_frame: String,

    /// Progress summary for exercises with a timed state machine.
    #[serde(default)]
    pub structured: Option<StructuredProgress>,

    /// Exercise the service believes it is analysing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_exercise: Option<String>,

    /// Display name of that exercise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exercise_name: Option<String>,

    /// Service-side timestamp in unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Feedback {
    /// Decodes `processed_frame` into raw image bytes.
    ///
    /// Returns `Ok(None)` when the service sent an empty frame.
    pub fn processed_frame_bytes(&self) -> Result<Option<Vec<u8>>> {
        if self.processed_frame.is_empty() {
            return Ok(None);
        }
        STANDARD
            .decode(self.processed_frame.trim())
            .map(Some)
            .map_err(|e| StreamError::DecodeError(format!("processed_frame is not base64: {e}")))
    }
}

/// The authoritative exercise-progress summary embedded in [`Feedback`].
///
/// `current_cycle > total_cycles` is tolerated and passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredProgress {
    /// Machine-readable state key (e.g. `holding_fist`).
    pub state: String,

    /// Human-readable state name.
    pub state_name: String,

    /// Cycles completed so far.
    pub current_cycle: u32,

    /// Cycles required to finish the exercise.
    pub total_cycles: u32,

    /// Seconds left in the current hold; `None` means no active countdown.
    #[serde(default)]
    pub countdown: Option<u32>,

    /// Progress of the current hold, nominally in `[0, 100]`.
    pub progress_percent: f64,

    /// Step-specific instruction text.
    pub message: String,
}

impl StructuredProgress {
    /// Returns `true` while a hold countdown is running.
    #[must_use]
    pub const fn countdown_active(&self) -> bool {
        self.countdown.is_some()
    }

    /// Returns `progress_percent` as a fraction clamped to `[0, 1]`.
    #[must_use]
    pub fn progress_fraction(&self) -> f64 {
        (self.progress_percent / 100.0).clamp(0.0, 1.0)
    }

    /// Returns `true` if the service reported more cycles than required.
    #[must_use]
    pub const fn cycles_exceeded(&self) -> bool {
        self.current_cycle > self.total_cycles
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// One frame submitted to the analysis service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundFrame {
    /// Base64-encoded image payload. May be empty.
    pub frame: String,
    /// Exercise the frame belongs to.
    pub exercise_type: ExerciseType,
}

impl OutboundFrame {
    /// Wraps an already-encoded image payload.
    #[must_use]
    pub fn new(payload: &[u8], exercise_type: ExerciseType) -> Self {
        Self {
            frame: STANDARD.encode(payload),
            exercise_type,
        }
    }

    /// Returns `true` if the frame carries no image data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    /// Serializes the frame to its JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Parses inbound channel messages into [`Feedback`].
///
/// Decoding is pure; a failure never affects previously decoded values.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackDecoder;

impl FeedbackDecoder {
    /// Creates a decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decodes one raw text message.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::DecodeError` if the message is not JSON, a
    /// required field is missing or mistyped, `finger_states` does not hold
    /// exactly five booleans, or `raised_fingers` exceeds five.
    pub fn decode(&self, raw: &str) -> Result<Feedback> {
        let feedback: Feedback =
            serde_json::from_str(raw).map_err(|e| StreamError::DecodeError(e.to_string()))?;

        if usize::from(feedback.raised_fingers) > FINGER_COUNT {
            return Err(StreamError::DecodeError(format!(
                "raised_fingers must be between 0 and {FINGER_COUNT}, got {}",
                feedback.raised_fingers
            )));
        }

        Ok(feedback)
    }

    /// Decodes a binary message, which must hold UTF-8 JSON.
    pub fn decode_bytes(&self, raw: &[u8]) -> Result<Feedback> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| StreamError::DecodeError(format!("binary message is not UTF-8: {e}")))?;
        self.decode(text)
    }

    /// Encodes feedback back to its wire form.
    pub fn encode(&self, feedback: &Feedback) -> Result<String> {
        Ok(serde_json::to_string(feedback)?)
    }
}
