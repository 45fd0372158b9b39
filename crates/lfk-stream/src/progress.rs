//! Exercise-progress display state derived from feedback.
//!
//! The state machine holds an ordered list of known progress states. Each
//! [`StructuredProgress`] received from the service selects the active step by
//! name; every step before it is done and every step after it is pending. The
//! machine is purely reactive: it never advances without a message.

use serde::{Deserialize, Serialize};

use crate::config::ProgressStep;
use crate::feedback::StructuredProgress;

/// Step index meaning "no active step".
pub const NO_ACTIVE_STEP: isize = -1;

// ============================================================================
// StepMarker
// ============================================================================

/// Display marker for one progress step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMarker {
    /// The step lies before the active one.
    Done,
    /// The step is the active one.
    Active,
    /// The step lies after the active one, or nothing is active.
    Pending,
}

impl StepMarker {
    /// Derives the marker for step `position` given the active index.
    #[must_use]
    pub fn for_position(position: usize, active: isize) -> Self {
        match isize::try_from(position) {
            Ok(p) if p < active => Self::Done,
            Ok(p) if p == active => Self::Active,
            _ => Self::Pending,
        }
    }

    /// Returns the single-character glyph used by text renderers.
    #[must_use]
    pub const fn glyph(&self) -> &'static str {
        match self {
            Self::Done => "✅",
            Self::Active => "⏳",
            Self::Pending => "⬜",
        }
    }
}

impl std::fmt::Display for StepMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Active => write!(f, "active"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

// ============================================================================
// ProgressView
// ============================================================================

/// One row of the progress read model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepView {
    /// Machine-readable state key.
    pub state: String,
    /// Label shown to the user.
    pub label: String,
    /// Done, active, or pending.
    pub marker: StepMarker,
}

/// Read model of the progress state machine at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressView {
    /// Index of the active step, or `-1` when no step is active.
    pub active_index: isize,
    /// Every known step with its marker.
    pub steps: Vec<StepView>,
    /// Cycles completed, when the service reported them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_cycle: Option<u32>,
    /// Cycles required, when the service reported them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cycles: Option<u32>,
    /// Remaining seconds of the active countdown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown: Option<u32>,
    /// Progress of the current hold in `[0, 1]`.
    pub progress: f64,
    /// Step-specific message from the service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressView {
    /// Returns the active step, if any.
    #[must_use]
    pub fn active_step(&self) -> Option<&StepView> {
        usize::try_from(self.active_index)
            .ok()
            .and_then(|i| self.steps.get(i))
    }

    /// Returns `true` if the service reported an exercise state.
    #[must_use]
    pub const fn has_progress(&self) -> bool {
        self.current_cycle.is_some()
    }
}

// ============================================================================
// ProgressStateMachine
// ============================================================================

/// Tracks which progress step is active, driven only by inbound feedback.
#[derive(Debug, Clone)]
pub struct ProgressStateMachine {
    steps: Vec<ProgressStep>,
    active_index: isize,
    last: Option<StructuredProgress>,
}

impl ProgressStateMachine {
    /// Creates a machine over an ordered list of known steps.
    #[must_use]
    pub fn new(steps: Vec<ProgressStep>) -> Self {
        Self {
            steps,
            active_index: NO_ACTIVE_STEP,
            last: None,
        }
    }

    /// Returns the configured steps in order.
    #[must_use]
    pub fn steps(&self) -> &[ProgressStep] {
        &self.steps
    }

    /// Returns the current active index (`-1` when none).
    #[must_use]
    pub const fn active_index(&self) -> isize {
        self.active_index
    }

    /// Looks up the index of a state name, or `-1` if unknown.
    #[must_use]
    pub fn index_of(&self, state: &str) -> isize {
        self.steps
            .iter()
            .position(|step| step.state == state)
            .and_then(|i| isize::try_from(i).ok())
            .unwrap_or(NO_ACTIVE_STEP)
    }

    /// Applies the structured part of one feedback message.
    ///
    /// `None` means the message carried no progress: the active index resets
    /// to `-1`. Returns the new active index.
    pub fn apply(&mut self, structured: Option<&StructuredProgress>) -> isize {
        self.active_index = structured.map_or(NO_ACTIVE_STEP, |s| self.index_of(&s.state));
        self.last = structured.cloned();
        self.active_index
    }

    /// Returns the marker for step `position`.
    #[must_use]
    pub fn marker(&self, position: usize) -> StepMarker {
        StepMarker::for_position(position, self.active_index)
    }

    /// Builds the read model for the current state.
    #[must_use]
    pub fn view(&self) -> ProgressView {
        let steps = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| StepView {
                state: step.state.clone(),
                label: step.label.clone(),
                marker: self.marker(i),
            })
            .collect();

        ProgressView {
            active_index: self.active_index,
            steps,
            current_cycle: self.last.as_ref().map(|s| s.current_cycle),
            total_cycles: self.last.as_ref().map(|s| s.total_cycles),
            countdown: self.last.as_ref().and_then(|s| s.countdown),
            progress: self
                .last
                .as_ref()
                .map_or(0.0, StructuredProgress::progress_fraction),
            message: self.last.as_ref().map(|s| s.message.clone()),
        }
    }
}
