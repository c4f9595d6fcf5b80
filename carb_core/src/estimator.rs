//! Carb absorption estimator.
//!
//! Attributes observed insulin counteraction effect to logged carb entries and
//! records, per entry, how many grams have actually been absorbed over time.
//!
//! ## Attribution rules
//!
//! 1. Each entry may claim effect inside its attribution window:
//!    `[start, start + absorption_time × overrun)`.
//! 2. Each entry converts the effect it claims to grams with the carb ratio and
//!    insulin sensitivity in effect at the start of its own overlap with the
//!    sample: `grams = max(velocity, 0) × minutes × carb_ratio / sensitivity`.
//! 3. Entries claim from each sample's effect in start-time order, so a later
//!    entry never receives effect already attributed to an earlier active entry.
//! 4. An entry stops claiming once its full amount is observed.

use crate::curve::AbsorptionCurve;
use crate::counteraction::CounteractionSeries;
use crate::schedule::{CarbRatioSchedule, InsulinSensitivitySchedule};
use crate::types::{duration_minutes, minutes_duration, AbsorptionPoint, CarbEntry, TimeInterval};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};

/// Grams below which an entry counts as fully absorbed
const COMPLETION_TOLERANCE: f64 = 1e-9;

/// Tuning for the estimator
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EstimatorOptions {
    /// Multiplier on the declared absorption time bounding attribution
    pub initial_absorption_time_overrun: f64,
    /// Absorption time for entries logged without one
    pub default_absorption_time: Duration,
}

impl Default for EstimatorOptions {
    fn default() -> Self {
        Self {
            initial_absorption_time_overrun: 2.0,
            default_absorption_time: Duration::hours(3),
        }
    }
}

impl EstimatorOptions {
    fn validate(&self) -> Result<()> {
        let overrun = self.initial_absorption_time_overrun;
        if !overrun.is_finite() || overrun < 1.0 {
            return Err(Error::InvalidParameter(format!(
                "initial absorption time overrun must be at least 1.0, got {}",
                overrun
            )));
        }
        if self.default_absorption_time <= Duration::zero() {
            return Err(Error::InvalidParameter(
                "default absorption time must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Fitted absorption for one carb entry
#[derive(Clone, Debug, PartialEq)]
pub struct AbsorptionStatus {
    pub entry: CarbEntry,
    /// Declared (or default) absorption time used for this entry
    pub absorption_time: Duration,
    /// Attribution window
    pub window: TimeInterval,
    /// Recorded points, starting with `(entry start, 0)`, in time order
    pub points: Vec<AbsorptionPoint>,
}

impl AbsorptionStatus {
    /// Observed grams at the last recorded point
    pub fn observed_grams(&self) -> f64 {
        self.points.last().map_or(0.0, |p| p.observed_grams)
    }

    pub fn is_complete(&self) -> bool {
        self.observed_grams() >= self.entry.grams
    }

    /// First recorded instant at which the full amount was observed
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.points
            .iter()
            .find(|p| p.observed_grams >= self.entry.grams)
            .map(|p| p.time)
    }

    /// Modeled absorption rate (g/min) at `at`, from the declared absorption time
    pub fn modeled_rate_at<C: AbsorptionCurve + ?Sized>(&self, at: DateTime<Utc>, model: &C) -> f64 {
        model.absorption_rate(
            self.entry.grams,
            at - self.entry.start_time,
            self.absorption_time,
        )
    }
}

/// Working state for one entry while samples are attributed
struct StatusBuilder {
    entry: CarbEntry,
    absorption_time: Duration,
    window: TimeInterval,
    observed: f64,
    points: Vec<AbsorptionPoint>,
}

impl StatusBuilder {
    fn new(entry: CarbEntry, options: &EstimatorOptions) -> Result<Self> {
        let absorption_time = entry.absorption_time_or(options.default_absorption_time);
        let window_minutes =
            duration_minutes(absorption_time) * options.initial_absorption_time_overrun;
        let end = entry
            .start_time
            .checked_add_signed(minutes_duration(window_minutes)?)
            .ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "attribution window of {} minutes from {} is out of range",
                    window_minutes, entry.start_time
                ))
            })?;
        let window = TimeInterval {
            start: entry.start_time,
            end,
        };
        let points = vec![AbsorptionPoint {
            time: entry.start_time,
            observed_grams: 0.0,
            modeled_grams: 0.0,
        }];
        Ok(Self {
            entry,
            absorption_time,
            window,
            observed: 0.0,
            points,
        })
    }

    fn is_complete(&self) -> bool {
        self.observed >= self.entry.grams
    }

    fn unabsorbed(&self) -> f64 {
        (self.entry.grams - self.observed).max(0.0)
    }

    /// Add `grams` and record a point at `at`
    fn absorb<C: AbsorptionCurve + ?Sized>(&mut self, grams: f64, at: DateTime<Utc>, model: &C) {
        let was_complete = self.is_complete();
        self.observed += grams;
        if self.entry.grams - self.observed <= COMPLETION_TOLERANCE {
            self.observed = self.entry.grams;
        }
        if self.is_complete() && !was_complete {
            tracing::debug!(
                "Carb entry at {} ({} g) fully absorbed by {}",
                self.entry.start_time,
                self.entry.grams,
                at
            );
        }

        let modeled = model.absorbed_grams(
            self.entry.grams,
            at - self.entry.start_time,
            self.absorption_time,
        );
        self.points.push(AbsorptionPoint {
            time: at,
            observed_grams: self.observed,
            modeled_grams: modeled,
        });
    }

    fn build(self) -> AbsorptionStatus {
        AbsorptionStatus {
            entry: self.entry,
            absorption_time: self.absorption_time,
            window: self.window,
            points: self.points,
        }
    }
}

/// Fit absorption statuses for `entries` against observed counteraction
///
/// Returns one status per entry, ordered by entry start time.
pub fn estimate_absorption<C: AbsorptionCurve + ?Sized>(
    entries: &[CarbEntry],
    counteraction: &CounteractionSeries,
    carb_ratio: &CarbRatioSchedule,
    insulin_sensitivity: &InsulinSensitivitySchedule,
    options: &EstimatorOptions,
    model: &C,
) -> Result<Vec<AbsorptionStatus>> {
    if entries.is_empty() {
        return Err(Error::EmptyInput("no carb entries".into()));
    }
    if counteraction.is_empty() {
        return Err(Error::EmptyInput("counteraction series has no samples".into()));
    }
    options.validate()?;
    carb_ratio.ensure_positive()?;
    insulin_sensitivity.ensure_positive()?;

    let mut sorted = entries.to_vec();
    sorted.sort_by_key(|e| e.start_time);

    let mut builders: Vec<StatusBuilder> = sorted
        .into_iter()
        .map(|entry| StatusBuilder::new(entry, options))
        .collect::<Result<_>>()?;

    for sample in counteraction.samples() {
        if sample.interval.is_instant() {
            continue;
        }

        let overlaps: Vec<(usize, TimeInterval)> = builders
            .iter()
            .enumerate()
            .filter_map(|(idx, b)| sample.interval.intersect(&b.window).map(|o| (idx, o)))
            .collect();
        let velocity = sample.velocity.max(0.0);
        let mut unclaimed_effect = sample.effect().max(0.0);

        for (idx, overlap) in overlaps {
            let builder = &mut builders[idx];
            let grams = if builder.is_complete() {
                0.0
            } else {
                let ratio = carb_ratio.value_at(overlap.start)?;
                let sensitivity = insulin_sensitivity.value_at(overlap.start)?;
                let grams_per_effect = ratio / sensitivity;
                let claim = (velocity * overlap.minutes())
                    .min(unclaimed_effect)
                    .min(builder.unabsorbed() / grams_per_effect)
                    .max(0.0);
                unclaimed_effect -= claim;
                claim * grams_per_effect
            };
            builder.absorb(grams, overlap.end, model);
        }
    }

    let statuses: Vec<AbsorptionStatus> = builders.into_iter().map(StatusBuilder::build).collect();

    tracing::info!(
        "Estimated absorption for {} carb entries from {} counteraction samples",
        statuses.len(),
        counteraction.len()
    );
    for status in &statuses {
        tracing::debug!(
            "Entry at {}: observed {:.2} of {:.2} g",
            status.entry.start_time,
            status.observed_grams(),
            status.entry.grams
        );
    }

    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counteraction::OverlapPolicy;
    use crate::curve::{AbsorptionModel, Linear};
    use crate::schedule::{Schedule, ScheduleValue};
    use crate::types::GlucoseEffectVelocity;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 24, 12, 0, 0).unwrap()
    }

    /// Five-minute samples with constant velocity from `start_min` for `count` samples
    fn constant_series(start_min: i64, count: i64, velocity: f64) -> CounteractionSeries {
        let samples = (0..count)
            .map(|i| {
                let start = t0() + Duration::minutes(start_min + i * 5);
                GlucoseEffectVelocity::new(start, start + Duration::minutes(5), velocity).unwrap()
            })
            .collect();
        CounteractionSeries::new(samples, OverlapPolicy::Trim).unwrap()
    }

    fn schedules(hours: i64) -> (CarbRatioSchedule, InsulinSensitivitySchedule) {
        (
            Schedule::constant("carb ratio", 10.0, t0(), t0() + Duration::hours(hours)).unwrap(),
            Schedule::constant("insulin sensitivity", 50.0, t0(), t0() + Duration::hours(hours))
                .unwrap(),
        )
    }

    fn entry(offset_min: i64, grams: f64, hours: i64) -> CarbEntry {
        CarbEntry::new(
            t0() + Duration::minutes(offset_min),
            grams,
            Some(Duration::hours(hours)),
        )
        .unwrap()
    }

    #[test]
    fn test_constant_effect_saturates_entry() {
        crate::logging::init_test();
        let (cr, isf) = schedules(12);
        // 2 mg/dL/min * 10 / 50 = 0.4 g/min, 2 g per sample
        let series = constant_series(0, 36, 2.0);
        let statuses = estimate_absorption(
            &[entry(0, 30.0, 3)],
            &series,
            &cr,
            &isf,
            &EstimatorOptions::default(),
            &Linear,
        )
        .unwrap();

        let status = &statuses[0];
        assert_eq!(status.window.end, t0() + Duration::hours(6));
        assert_eq!(status.points[0].observed_grams, 0.0);
        assert_relative_eq!(status.points[1].observed_grams, 2.0);
        assert!(status.is_complete());
        assert_eq!(status.completed_at(), Some(t0() + Duration::minutes(75)));
        assert_eq!(status.observed_grams(), 30.0);
    }

    #[test]
    fn test_zero_effect_absorbs_nothing() {
        let (cr, isf) = schedules(12);
        let series = constant_series(0, 36, 0.0);
        let statuses = estimate_absorption(
            &[entry(0, 30.0, 3)],
            &series,
            &cr,
            &isf,
            &EstimatorOptions::default(),
            &Linear,
        )
        .unwrap();
        assert!(statuses[0].points.iter().all(|p| p.observed_grams == 0.0));
        // Modeled grams still follow the curve
        let last = statuses[0].points.last().unwrap();
        assert_relative_eq!(last.modeled_grams, 30.0);
    }

    #[test]
    fn test_negative_effect_is_not_negative_absorption() {
        let (cr, isf) = schedules(12);
        let series = constant_series(0, 12, -3.0);
        let statuses = estimate_absorption(
            &[entry(0, 30.0, 3)],
            &series,
            &cr,
            &isf,
            &EstimatorOptions::default(),
            &Linear,
        )
        .unwrap();
        assert_eq!(statuses[0].observed_grams(), 0.0);
    }

    #[test]
    fn test_earlier_entry_claims_first() {
        let (cr, isf) = schedules(12);
        // 1 mg/dL/min -> 0.2 g/min, 1 g per sample
        let series = constant_series(0, 12, 1.0);
        let statuses = estimate_absorption(
            &[entry(0, 50.0, 3), entry(0, 20.0, 3)],
            &series,
            &cr,
            &isf,
            &EstimatorOptions::default(),
            &Linear,
        )
        .unwrap();

        assert_relative_eq!(statuses[0].observed_grams(), 12.0);
        assert_eq!(statuses[1].observed_grams(), 0.0);
    }

    #[test]
    fn test_leftover_flows_to_later_entry() {
        let (cr, isf) = schedules(12);
        let series = constant_series(0, 12, 1.0);
        let statuses = estimate_absorption(
            &[entry(0, 5.0, 3), entry(0, 20.0, 3)],
            &series,
            &cr,
            &isf,
            &EstimatorOptions::default(),
            &Linear,
        )
        .unwrap();

        assert_eq!(statuses[0].observed_grams(), 5.0);
        assert_relative_eq!(statuses[1].observed_grams(), 7.0, epsilon = 1e-9);
    }

    #[test]
    fn test_entries_are_sorted_by_start() {
        let (cr, isf) = schedules(12);
        let series = constant_series(0, 12, 1.0);
        let statuses = estimate_absorption(
            &[entry(30, 10.0, 3), entry(0, 10.0, 3)],
            &series,
            &cr,
            &isf,
            &EstimatorOptions::default(),
            &Linear,
        )
        .unwrap();
        assert_eq!(statuses[0].entry.start_time, t0());
        assert_relative_eq!(statuses[0].observed_grams(), 10.0);
        assert_relative_eq!(statuses[1].observed_grams(), 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_attribution_stops_at_window_end() {
        let (cr, isf) = schedules(12);
        let series = constant_series(0, 48, 1.0);
        let options = EstimatorOptions {
            initial_absorption_time_overrun: 1.0,
            ..EstimatorOptions::default()
        };
        let statuses = estimate_absorption(
            &[entry(0, 100.0, 1)],
            &series,
            &cr,
            &isf,
            &options,
            &Linear,
        )
        .unwrap();

        // One hour window, 12 samples of 1 g
        assert_relative_eq!(statuses[0].observed_grams(), 12.0, epsilon = 1e-9);
        assert_eq!(statuses[0].points.last().unwrap().time, t0() + Duration::hours(1));
    }

    #[test]
    fn test_schedule_value_changes_conversion() {
        let cr = Schedule::new(
            "carb ratio",
            vec![
                ScheduleValue::new(t0(), t0() + Duration::minutes(30), 10.0).unwrap(),
                ScheduleValue::new(t0() + Duration::minutes(30), t0() + Duration::hours(6), 20.0)
                    .unwrap(),
            ],
        )
        .unwrap();
        let isf =
            Schedule::constant("insulin sensitivity", 50.0, t0(), t0() + Duration::hours(6)).unwrap();
        let series = constant_series(0, 12, 1.0);
        let statuses = estimate_absorption(
            &[entry(0, 100.0, 3)],
            &series,
            &cr,
            &isf,
            &EstimatorOptions::default(),
            &Linear,
        )
        .unwrap();

        // Six samples at 1 g, six at 2 g
        assert_relative_eq!(statuses[0].observed_grams(), 18.0, epsilon = 1e-9);
    }

    #[test]
    fn test_schedule_gap_is_reported() {
        let (cr, _) = schedules(12);
        let isf = Schedule::constant("insulin sensitivity", 50.0, t0(), t0() + Duration::minutes(20))
            .unwrap();
        let series = constant_series(0, 12, 1.0);
        let err = estimate_absorption(
            &[entry(0, 30.0, 3)],
            &series,
            &cr,
            &isf,
            &EstimatorOptions::default(),
            &Linear,
        )
        .unwrap_err();

        match err {
            Error::ScheduleGap { schedule, at } => {
                assert_eq!(schedule, "insulin sensitivity");
                assert_eq!(at, t0() + Duration::minutes(25));
            }
            other => panic!("expected schedule gap, got {:?}", other),
        }
    }

    #[test]
    fn test_samples_outside_windows_need_no_schedule() {
        let (cr, isf) = schedules(1);
        // Samples start long after the entry window closed
        let series = constant_series(600, 4, 1.0);
        let statuses = estimate_absorption(
            &[entry(0, 30.0, 1)],
            &series,
            &cr,
            &isf,
            &EstimatorOptions::default(),
            &Linear,
        )
        .unwrap();
        assert_eq!(statuses[0].points.len(), 1);
    }

    #[test]
    fn test_empty_entries_and_bad_overrun() {
        let (cr, isf) = schedules(12);
        let series = constant_series(0, 12, 1.0);
        assert!(matches!(
            estimate_absorption(&[], &series, &cr, &isf, &EstimatorOptions::default(), &Linear),
            Err(Error::EmptyInput(_))
        ));

        let options = EstimatorOptions {
            initial_absorption_time_overrun: 0.5,
            ..EstimatorOptions::default()
        };
        assert!(matches!(
            estimate_absorption(&[entry(0, 30.0, 3)], &series, &cr, &isf, &options, &Linear),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_modeled_rate_uses_curve() {
        let (cr, isf) = schedules(12);
        let series = constant_series(0, 12, 1.0);
        let statuses = estimate_absorption(
            &[entry(0, 30.0, 3)],
            &series,
            &cr,
            &isf,
            &EstimatorOptions::default(),
            &AbsorptionModel::Parabolic,
        )
        .unwrap();
        let status = &statuses[0];
        // Parabolic peak rate is 2 × the mean rate at half the absorption time
        assert_relative_eq!(
            status.modeled_rate_at(t0() + Duration::minutes(90), &AbsorptionModel::Parabolic),
            2.0 * 30.0 / 180.0
        );
        assert_eq!(
            status.modeled_rate_at(t0() + Duration::hours(4), &AbsorptionModel::Parabolic),
            0.0
        );
    }

    #[test]
    fn test_huge_overrun_is_an_error() {
        let (cr, isf) = schedules(12);
        let series = constant_series(0, 12, 1.0);
        let options = EstimatorOptions {
            initial_absorption_time_overrun: 1e9,
            ..EstimatorOptions::default()
        };
        assert!(matches!(
            estimate_absorption(&[entry(0, 30.0, 3)], &series, &cr, &isf, &options, &Linear),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_huge_absorption_time_is_an_error() {
        let (cr, isf) = schedules(12);
        let series = constant_series(0, 12, 1.0);
        let long = CarbEntry::new(t0(), 30.0, Some(Duration::days(100_000_000))).unwrap();
        assert!(matches!(
            estimate_absorption(
                &[long],
                &series,
                &cr,
                &isf,
                &EstimatorOptions::default(),
                &Linear
            ),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_each_entry_converts_at_its_own_overlap_start() {
        let cr = Schedule::new(
            "carb ratio",
            vec![
                ScheduleValue::new(t0(), t0() + Duration::hours(1), 10.0).unwrap(),
                ScheduleValue::new(t0() + Duration::hours(1), t0() + Duration::hours(6), 20.0)
                    .unwrap(),
            ],
        )
        .unwrap();
        let isf =
            Schedule::constant("insulin sensitivity", 50.0, t0(), t0() + Duration::hours(6)).unwrap();
        // One ten-minute sample spanning the ratio change, 20 mg/dL in total
        let sample = GlucoseEffectVelocity::new(
            t0() + Duration::minutes(55),
            t0() + Duration::minutes(65),
            2.0,
        )
        .unwrap();
        let series = CounteractionSeries::new(vec![sample], OverlapPolicy::Trim).unwrap();

        let statuses = estimate_absorption(
            &[entry(55, 1.0, 3), entry(60, 30.0, 3)],
            &series,
            &cr,
            &isf,
            &EstimatorOptions::default(),
            &Linear,
        )
        .unwrap();

        // First entry takes 5 mg/dL at ratio 10; the second converts its
        // 10 mg/dL from 13:00 at ratio 20
        assert_relative_eq!(statuses[0].observed_grams(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(statuses[1].observed_grams(), 4.0, epsilon = 1e-9);
    }
}
