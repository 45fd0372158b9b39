//! Configuration types for the LFK exercise stream.
//!
//! This module provides the configuration used to reach the analysis
//! service, pace the frame producer, bound the handshake, and describe the
//! progress steps shown for each exercise.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;
use crate::error::{Result, StreamError};

/// The default config file name.
const CONFIG_FILE_NAME: &str = "lfk.json";

/// Default analysis service host (the Android emulator's view of localhost).
fn default_host() -> String {
    "10.0.2.2:8080".to_string()
}

/// Default base URL for the login and catalog API.
fn default_api_base_url() -> String {
    "http://10.0.2.2:8080".to_string()
}

/// Default period between two frame-producer ticks.
const fn default_frame_interval_ms() -> u64 {
    300
}

/// Default handshake timeout, aligned with the transport's own timeout.
const fn default_connect_timeout_secs() -> u64 {
    30
}

/// Default ordered progress steps, shared by every exercise unless overridden.
fn default_progress_steps() -> Vec<ProgressStep> {
    vec![
        ProgressStep::new("waiting_fist", "Clench your fist"),
        ProgressStep::new("holding_fist", "Hold the fist"),
        ProgressStep::new("waiting_palm", "Open your palm"),
        ProgressStep::new("holding_palm", "Hold the palm"),
    ]
}

/// Main configuration for an exercise streaming client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Host (and port) of the analysis service WebSocket endpoint.
    #[serde(default = "default_host")]
    pub host: String,

    /// Base URL of the login and exercise catalog API.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Exercise streamed when none is given on the command line.
    #[serde(default)]
    pub default_exercise: ExerciseType,

    /// Period of the frame producer in milliseconds.
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,

    /// Upper bound on the WebSocket handshake in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Backoff applied around `open`. Zero retries by default.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Ordered reference list of progress states.
    #[serde(default = "default_progress_steps")]
    pub progress_steps: Vec<ProgressStep>,

    /// Per-exercise replacements for `progress_steps`.
    #[serde(default)]
    pub exercise_steps: HashMap<ExerciseType, Vec<ProgressStep>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_base_url: default_api_base_url(),
            default_exercise: ExerciseType::default(),
            frame_interval_ms: default_frame_interval_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            retry: RetryPolicy::default(),
            progress_steps: default_progress_steps(),
            exercise_steps: HashMap::new(),
        }
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// Looks for `lfk.json` in the current directory. If not found, returns
    /// the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but contains invalid JSON.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            StreamError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads configuration from `lfk.json` in a specific directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        Self::load_from_file(&config_path)
    }

    /// Loads configuration from a specific file path.
    ///
    /// If the file does not exist, returns default configuration.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::ConfigParseError` if the file exists but contains
    /// invalid JSON or an unknown exercise name.
    ///
    /// Returns `StreamError::ConfigValidationError` if the values are invalid.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(StreamError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| StreamError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::ConfigValidationError` if any check fails.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(StreamError::config_validation(
                "host must not be empty",
                "Set host to the analysis service address, e.g. \"10.0.2.2:8080\"",
            ));
        }

        if self.host.contains("://") {
            return Err(StreamError::config_validation(
                "host must not include a scheme",
                "Use \"example.com:8080\" rather than \"ws://example.com:8080\" for host",
            ));
        }

        if self.api_base_url.trim().is_empty() {
            return Err(StreamError::config_validation(
                "apiBaseUrl must not be empty",
                "Set apiBaseUrl to the login API address, e.g. \"http://10.0.2.2:8080\"",
            ));
        }

        if self.frame_interval_ms == 0 {
            return Err(StreamError::config_validation(
                "frameIntervalMs must be greater than 0",
                "Set frameIntervalMs to at least 1 in your lfk.json (300 is typical)",
            ));
        }

        if self.connect_timeout_secs == 0 {
            return Err(StreamError::config_validation(
                "connectTimeoutSecs must be greater than 0",
                "Set connectTimeoutSecs to at least 1 second in your lfk.json",
            ));
        }

        self.retry.validate()?;

        validate_steps("progressSteps", &self.progress_steps)?;
        for (exercise, steps) in &self.exercise_steps {
            validate_steps(&format!("exerciseSteps.{exercise}"), steps)?;
        }

        Ok(())
    }

    /// Returns the frame producer period.
    #[must_use]
    pub const fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    /// Returns the handshake timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Returns the progress steps for an exercise, honouring overrides.
    #[must_use]
    pub fn steps_for(&self, exercise: ExerciseType) -> &[ProgressStep] {
        self.exercise_steps
            .get(&exercise)
            .map_or(self.progress_steps.as_slice(), Vec::as_slice)
    }
}

fn validate_steps(field: &str, steps: &[ProgressStep]) -> Result<()> {
    let mut seen = HashSet::new();
    for step in steps {
        if step.state.trim().is_empty() {
            return Err(StreamError::config_validation(
                format!("{field} contains a step with an empty state"),
                format!("Give every entry in {field} a non-empty \"state\""),
            ));
        }
        if !seen.insert(step.state.as_str()) {
            return Err(StreamError::config_validation(
                format!("{field} lists state '{}' more than once", step.state),
                format!("Remove the duplicate '{}' entry from {field}", step.state),
            ));
        }
    }
    Ok(())
}

/// Exercises offered by the analysis service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExerciseType {
    /// Clench and release a fist (default).
    #[default]
    Fist,
    /// Fist with the index finger raised.
    FistIndex,
    /// Alternate fist and open palm in timed cycles.
    FistPalm,
}

impl ExerciseType {
    /// All known exercises, in catalog order.
    pub const ALL: [Self; 3] = [Self::Fist, Self::FistIndex, Self::FistPalm];

    /// Returns the path segment used in the WebSocket endpoint.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fist => "fist",
            Self::FistIndex => "fist-index",
            Self::FistPalm => "fist-palm",
        }
    }

    /// Parses a string into an `ExerciseType`, case-insensitively.
    fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fist" => Some(Self::Fist),
            "fist-index" | "fist_index" => Some(Self::FistIndex),
            "fist-palm" | "fist_palm" => Some(Self::FistPalm),
            _ => None,
        }
    }

    /// Parses an exercise name, falling back to the default for unknown values.
    ///
    /// # Examples
    ///
    /// ```
    /// use lfk_stream::ExerciseType;
    ///
    /// assert_eq!(ExerciseType::parse_or_default("FIST-PALM"), ExerciseType::FistPalm);
    /// assert_eq!(ExerciseType::parse_or_default("squats"), ExerciseType::Fist);
    /// ```
    #[must_use]
    pub fn parse_or_default(s: &str) -> Self {
        Self::from_str_case_insensitive(s).unwrap_or_else(|| {
            tracing::warn!(exercise = %s, fallback = %Self::default(), "Unknown exercise type, using default");
            Self::default()
        })
    }
}

impl std::fmt::Display for ExerciseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ExerciseType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str_case_insensitive(&s).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid exercise '{s}': expected one of 'fist', 'fist-index', 'fist-palm'"
            ))
        })
    }
}

impl Serialize for ExerciseType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// One entry of the ordered progress reference list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStep {
    /// State key as sent by the service in `structured.state`.
    pub state: String,
    /// Human-readable label shown next to the marker.
    pub label: String,
}

impl ProgressStep {
    /// Creates a new progress step.
    #[must_use]
    pub fn new(state: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            label: label.into(),
        }
    }
}
