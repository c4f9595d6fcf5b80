//! Error types for the carb_core library.

use chrono::{DateTime, Utc};
use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for carb_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required instant is not covered by any schedule interval
    #[error("Schedule gap: {schedule} has no value at {at}")]
    ScheduleGap {
        schedule: String,
        at: DateTime<Utc>,
    },

    /// No carb entries, counteraction samples or schedule values were given
    #[error("Empty input: {0}")]
    EmptyInput(String),

    /// Query range ends before it starts
    #[error("Invalid range: {to} is before {from}")]
    InvalidRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    /// Counteraction samples overlap while the reject policy is active
    #[error("Overlapping counteraction samples at {at}")]
    OverlappingSamples { at: DateTime<Utc> },

    /// Malformed counteraction sample or series
    #[error("Invalid sample: {0}")]
    InvalidSample(String),

    /// Malformed carb entry
    #[error("Invalid carb entry: {0}")]
    InvalidEntry(String),

    /// Malformed schedule
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Out-of-range tuning parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}
