//! Time-keyed therapy schedules (carb ratio, insulin sensitivity).
//!
//! A schedule is an ordered run of values, each valid over an interval.
//! Lookups outside every interval fail with [`Error::ScheduleGap`] naming the
//! schedule and the instant.

use crate::types::TimeInterval;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A value valid over one interval
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScheduleValue<T> {
    pub interval: TimeInterval,
    pub value: T,
}

impl<T> ScheduleValue<T> {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, value: T) -> Result<Self> {
        let interval = TimeInterval::new(start, end)
            .map_err(|_| Error::InvalidSchedule(format!("value ends at {} before {}", end, start)))?;
        Ok(Self { interval, value })
    }
}

/// Non-empty, time-ordered schedule
///
/// Each value covers `[start, end)`; the final value also covers its own end
/// instant, so a schedule spanning a series from its first to its last sample
/// start answers lookups at both ends.
#[derive(Clone, Debug, PartialEq)]
pub struct Schedule<T> {
    name: String,
    values: Vec<ScheduleValue<T>>,
}

/// Grams of carbohydrate covered by one unit of insulin
pub type CarbRatioSchedule = Schedule<f64>;

/// mg/dL drop produced by one unit of insulin
pub type InsulinSensitivitySchedule = Schedule<f64>;

impl<T: Copy> Schedule<T> {
    /// Build a schedule from values sorted by start time
    ///
    /// Gaps between values are allowed here and reported at lookup time.
    pub fn new(name: impl Into<String>, values: Vec<ScheduleValue<T>>) -> Result<Self> {
        let name = name.into();
        if values.is_empty() {
            return Err(Error::EmptyInput(format!("{} schedule has no values", name)));
        }
        for pair in values.windows(2) {
            if pair[1].interval.start < pair[0].interval.end {
                return Err(Error::InvalidSchedule(format!(
                    "{} values overlap or are out of order at {}",
                    name, pair[1].interval.start
                )));
            }
        }
        Ok(Self { name, values })
    }

    /// Single value covering `[start, end]`
    pub fn constant(
        name: impl Into<String>,
        value: T,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self> {
        Self::new(name, vec![ScheduleValue::new(start, end, value)?])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[ScheduleValue<T>] {
        &self.values
    }

    /// Value in effect at `at`
    pub fn value_at(&self, at: DateTime<Utc>) -> Result<T> {
        // First value whose interval starts after `at`; the candidate precedes it
        let idx = self.values.partition_point(|v| v.interval.start <= at);
        let gap = || Error::ScheduleGap {
            schedule: self.name.clone(),
            at,
        };
        let candidate = idx.checked_sub(1).map(|i| &self.values[i]).ok_or_else(gap)?;

        let is_last = idx == self.values.len();
        if candidate.interval.contains(at) || (is_last && at == candidate.interval.end) {
            Ok(candidate.value)
        } else {
            Err(gap())
        }
    }
}

impl Schedule<f64> {
    /// Require every value to be finite and strictly positive
    pub fn ensure_positive(&self) -> Result<()> {
        match self.values.iter().find(|v| !(v.value.is_finite() && v.value > 0.0)) {
            Some(bad) => Err(Error::InvalidSchedule(format!(
                "{} value at {} must be positive, got {}",
                self.name, bad.interval.start, bad.value
            ))),
            None => Ok(()),
        }
    }
}
