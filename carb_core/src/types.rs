//! Core domain types for carbohydrate absorption modeling.
//!
//! This module defines the value objects shared by the estimator and the
//! aggregator:
//! - Time intervals over UTC instants
//! - Carb entries and insulin counteraction samples
//! - Fitted absorption points and output COB points

use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Time
// ============================================================================

/// Seconds per minute, for converting chrono durations to fractional minutes
const SECONDS_PER_MINUTE: f64 = 60.0;

/// Fractional minutes in a duration (millisecond precision)
pub fn duration_minutes(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0 / SECONDS_PER_MINUTE
}

/// Build a duration from fractional minutes (millisecond precision)
///
/// Fails when `minutes` is not finite or exceeds the representable range.
pub fn minutes_duration(minutes: f64) -> Result<Duration> {
    let millis = (minutes * SECONDS_PER_MINUTE * 1000.0).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return Err(Error::InvalidParameter(format!(
            "{} minutes is out of range",
            minutes
        )));
    }
    Duration::try_milliseconds(millis as i64).ok_or_else(|| {
        Error::InvalidParameter(format!("{} minutes is out of range", minutes))
    })
}

/// Half-open `[start, end)` range of instants
///
/// `end == start` is an instantaneous interval.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeInterval {
    /// Create an interval, rejecting `end < start`
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end < start {
            return Err(Error::InvalidSample(format!(
                "interval ends at {} before it starts at {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn minutes(&self) -> f64 {
        duration_minutes(self.duration())
    }

    pub fn is_instant(&self) -> bool {
        self.start == self.end
    }

    /// Whether `at` lies in `[start, end)`
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Overlapping part of two intervals, if it has positive length
    pub fn intersect(&self, other: &TimeInterval) -> Option<TimeInterval> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TimeInterval { start, end })
    }
}

// ============================================================================
// Inputs
// ============================================================================

/// A logged carbohydrate entry
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CarbEntry {
    pub start_time: DateTime<Utc>,
    pub grams: f64,
    /// Declared absorption time; the configured default applies when absent
    #[serde(default, with = "optional_minutes")]
    pub absorption_time: Option<Duration>,
}

impl CarbEntry {
    /// Create a validated carb entry
    pub fn new(
        start_time: DateTime<Utc>,
        grams: f64,
        absorption_time: Option<Duration>,
    ) -> Result<Self> {
        if !grams.is_finite() || grams <= 0.0 {
            return Err(Error::InvalidEntry(format!(
                "grams must be positive, got {}",
                grams
            )));
        }
        if let Some(time) = absorption_time {
            if time <= Duration::zero() {
                return Err(Error::InvalidEntry(format!(
                    "absorption time must be positive, got {} minutes",
                    duration_minutes(time)
                )));
            }
        }
        Ok(Self {
            start_time,
            grams,
            absorption_time,
        })
    }

    /// Declared absorption time, or `default` when none was logged
    pub fn absorption_time_or(&self, default: Duration) -> Duration {
        self.absorption_time.unwrap_or(default)
    }
}

/// Observed glucose effect velocity not explained by insulin (ICE)
///
/// `velocity` is in mg/dL per minute and may be negative.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct GlucoseEffectVelocity {
    pub interval: TimeInterval,
    pub velocity: f64,
}

impl GlucoseEffectVelocity {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, velocity: f64) -> Result<Self> {
        if !velocity.is_finite() {
            return Err(Error::InvalidSample(format!(
                "velocity at {} is not finite",
                start
            )));
        }
        Ok(Self {
            interval: TimeInterval::new(start, end)?,
            velocity,
        })
    }

    /// Total glucose effect over the sample (mg/dL)
    pub fn effect(&self) -> f64 {
        self.velocity * self.interval.minutes()
    }
}

// ============================================================================
// Outputs
// ============================================================================

/// One recorded point of an entry's fitted absorption
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AbsorptionPoint {
    pub time: DateTime<Utc>,
    /// Grams attributed from observed counteraction so far
    pub observed_grams: f64,
    /// Grams the curve predicts from the declared absorption time
    pub modeled_grams: f64,
}

/// Remaining carbs on board at one instant
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CobPoint {
    pub time: DateTime<Utc>,
    pub remaining_grams: f64,
}

/// Serde adapter storing optional durations as fractional minutes
mod optional_minutes {
    use super::{duration_minutes, minutes_duration};
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&duration_minutes(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(minutes_duration)
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
