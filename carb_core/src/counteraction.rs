//! Insulin counteraction effect (ICE) series.
//!
//! Samples must be sorted by start time. Overlapping samples are resolved by
//! an explicit [`OverlapPolicy`] instead of depending on iteration order.

use crate::types::{GlucoseEffectVelocity, TimeInterval};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How overlapping counteraction samples are handled
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Keep the earlier sample and trim the overlapping head of the later one
    #[default]
    Trim,
    /// Fail with [`Error::OverlappingSamples`]
    Reject,
}

/// Validated, ordered, non-overlapping counteraction samples
#[derive(Clone, Debug, PartialEq)]
pub struct CounteractionSeries {
    samples: Vec<GlucoseEffectVelocity>,
}

impl CounteractionSeries {
    /// Validate and normalize a sample list
    pub fn new(samples: Vec<GlucoseEffectVelocity>, policy: OverlapPolicy) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::EmptyInput("counteraction series has no samples".into()));
        }

        let mut normalized: Vec<GlucoseEffectVelocity> = Vec::with_capacity(samples.len());
        let mut covered_until: Option<DateTime<Utc>> = None;
        let mut last_start: Option<DateTime<Utc>> = None;
        let mut trimmed = 0usize;

        for (idx, sample) in samples.into_iter().enumerate() {
            if sample.interval.end < sample.interval.start || !sample.velocity.is_finite() {
                return Err(Error::InvalidSample(format!(
                    "sample {} starting at {} is malformed",
                    idx, sample.interval.start
                )));
            }
            if let Some(prev) = last_start {
                if sample.interval.start < prev {
                    return Err(Error::InvalidSample(format!(
                        "sample {} starts at {}, before the previous sample at {}",
                        idx, sample.interval.start, prev
                    )));
                }
            }
            last_start = Some(sample.interval.start);

            let mut sample = sample;
            if let Some(until) = covered_until {
                if sample.interval.start < until && !sample.interval.is_instant() {
                    if policy == OverlapPolicy::Reject {
                        return Err(Error::OverlappingSamples {
                            at: sample.interval.start,
                        });
                    }
                    trimmed += 1;
                    if sample.interval.end <= until {
                        tracing::debug!(
                            "Dropping counteraction sample at {} covered by earlier samples",
                            sample.interval.start
                        );
                        continue;
                    }
                    sample.interval = TimeInterval {
                        start: until,
                        end: sample.interval.end,
                    };
                }
            }

            let end = sample.interval.end;
            covered_until = Some(covered_until.map_or(end, |u| u.max(end)));
            normalized.push(sample);
        }

        if trimmed > 0 {
            tracing::warn!(
                "Trimmed {} overlapping counteraction samples; earlier samples take precedence",
                trimmed
            );
        }

        Ok(Self {
            samples: normalized,
        })
    }

    pub fn samples(&self) -> &[GlucoseEffectVelocity] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Span from the first sample start to the last sample end
    pub fn span(&self) -> TimeInterval {
        let start = self.samples[0].interval.start;
        let end = self
            .samples
            .iter()
            .map(|s| s.interval.end)
            .max()
            .unwrap_or(start);
        TimeInterval { start, end }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 24, 12, 0, 0).unwrap()
    }

    fn sample(start_min: i64, end_min: i64, velocity: f64) -> GlucoseEffectVelocity {
        GlucoseEffectVelocity::new(
            t0() + Duration::minutes(start_min),
            t0() + Duration::minutes(end_min),
            velocity,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_series_is_rejected() {
        let err = CounteractionSeries::new(vec![], OverlapPolicy::Trim).unwrap_err();
        assert!(matches!(err, Error::EmptyInput(_)));
    }

    #[test]
    fn test_unsorted_series_is_rejected() {
        let err = CounteractionSeries::new(
            vec![sample(5, 10, 1.0), sample(0, 5, 1.0)],
            OverlapPolicy::Trim,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidSample(_)));
    }

    #[test]
    fn test_trim_keeps_earlier_sample() {
        let series = CounteractionSeries::new(
            vec![sample(0, 10, 1.0), sample(5, 15, 3.0), sample(6, 9, 9.0)],
            OverlapPolicy::Trim,
        )
        .unwrap();

        // Third sample is fully covered and dropped
        assert_eq!(series.len(), 2);
        assert_eq!(series.samples()[1].interval.start, t0() + Duration::minutes(10));
        assert_eq!(series.samples()[1].interval.end, t0() + Duration::minutes(15));
        assert_eq!(series.samples()[1].velocity, 3.0);
    }

    #[test]
    fn test_reject_policy_reports_overlap() {
        let err = CounteractionSeries::new(
            vec![sample(0, 10, 1.0), sample(5, 15, 3.0)],
            OverlapPolicy::Reject,
        )
        .unwrap_err();
        match err {
            Error::OverlappingSamples { at } => assert_eq!(at, t0() + Duration::minutes(5)),
            other => panic!("expected overlap error, got {:?}", other),
        }
    }

    #[test]
    fn test_adjacent_and_instant_samples_are_kept() {
        let series = CounteractionSeries::new(
            vec![sample(0, 5, 1.0), sample(5, 10, 1.0), sample(7, 7, 2.0)],
            OverlapPolicy::Reject,
        )
        .unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series.span().end, t0() + Duration::minutes(10));
    }
}
