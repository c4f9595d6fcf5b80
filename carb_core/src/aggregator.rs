//! Dynamic carbs-on-board aggregation.
//!
//! Turns fitted absorption statuses into a remaining-grams series over an
//! arbitrary query range. Between two recorded points of an entry the absorbed
//! amount follows the curve shape, re-anchored so that it passes through both
//! observed fractions.

use crate::curve::AbsorptionCurve;
use crate::estimator::AbsorptionStatus;
use crate::types::{duration_minutes, CobPoint};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What an entry contributes once its attribution window has elapsed
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowExpiry {
    /// The entry is considered consumed and contributes nothing
    #[default]
    Consumed,
    /// Unobserved grams keep absorbing along the curve at the declared rate
    Extend,
}

/// Remaining-grams calculator over a fixed curve and expiry policy
#[derive(Clone, Copy, Debug)]
pub struct CobAggregator<'a, C: ?Sized> {
    model: &'a C,
    expiry: WindowExpiry,
}

impl<'a, C: AbsorptionCurve + ?Sized> CobAggregator<'a, C> {
    pub fn new(model: &'a C) -> Self {
        Self {
            model,
            expiry: WindowExpiry::default(),
        }
    }

    pub fn with_expiry(mut self, expiry: WindowExpiry) -> Self {
        self.expiry = expiry;
        self
    }

    /// Unabsorbed grams of one entry at `at`
    pub fn remaining_at(&self, status: &AbsorptionStatus, at: DateTime<Utc>) -> f64 {
        let total = status.entry.grams;
        if at < status.window.start {
            return 0.0;
        }

        let absorbed = if at < status.window.end {
            self.absorbed_in_window(status, at)
        } else {
            match self.expiry {
                WindowExpiry::Consumed => return 0.0,
                WindowExpiry::Extend => self.absorbed_after_window(status, at),
            }
        };

        (total - absorbed).max(0.0)
    }

    /// Total carbs on board across all statuses at `at`
    pub fn carbs_on_board_at(&self, statuses: &[AbsorptionStatus], at: DateTime<Utc>) -> f64 {
        statuses.iter().map(|s| self.remaining_at(s, at)).sum()
    }

    /// COB at `from`, `to` and every recorded boundary in between
    pub fn series(
        &self,
        statuses: &[AbsorptionStatus],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CobPoint>> {
        if to < from {
            return Err(Error::InvalidRange { from, to });
        }

        if !statuses.iter().any(|s| self.is_active_between(s, from, to)) {
            tracing::debug!("No carb entries active between {} and {}", from, to);
            return Ok(vec![CobPoint {
                time: from,
                remaining_grams: 0.0,
            }]);
        }

        let mut instants = BTreeSet::from([from, to]);
        for status in statuses {
            let boundaries = status
                .points
                .iter()
                .map(|p| p.time)
                .chain([status.window.start, status.window.end]);
            instants.extend(boundaries.filter(|t| *t >= from && *t <= to));
        }

        Ok(self.evaluate(statuses, instants))
    }

    /// COB on a fixed grid `from, from + step, ...`, always ending at `to`
    pub fn stepped_series(
        &self,
        statuses: &[AbsorptionStatus],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<CobPoint>> {
        if to < from {
            return Err(Error::InvalidRange { from, to });
        }
        if step <= Duration::zero() {
            return Err(Error::InvalidParameter(format!(
                "step must be positive, got {} minutes",
                duration_minutes(step)
            )));
        }

        let mut instants = BTreeSet::new();
        let mut at = from;
        while at <= to {
            instants.insert(at);
            match at.checked_add_signed(step) {
                Some(next) => at = next,
                None => break,
            }
        }
        instants.insert(to);

        Ok(self.evaluate(statuses, instants))
    }

    fn evaluate(
        &self,
        statuses: &[AbsorptionStatus],
        instants: BTreeSet<DateTime<Utc>>,
    ) -> Vec<CobPoint> {
        let points: Vec<CobPoint> = instants
            .into_iter()
            .map(|time| CobPoint {
                time,
                remaining_grams: self.carbs_on_board_at(statuses, time),
            })
            .collect();
        tracing::debug!("Computed {} carbs-on-board points", points.len());
        points
    }

    fn is_active_between(
        &self,
        status: &AbsorptionStatus,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> bool {
        status.window.start <= to
            && (self.expiry == WindowExpiry::Extend || status.window.end > from)
    }

    /// Observed absorption, curve-interpolated between recorded points
    fn absorbed_in_window(&self, status: &AbsorptionStatus, at: DateTime<Utc>) -> f64 {
        let total = status.entry.grams;
        let points = &status.points;
        let next = points.partition_point(|p| p.time <= at);
        let Some(before) = next.checked_sub(1).map(|i| &points[i]) else {
            return 0.0;
        };
        let Some(after) = points.get(next) else {
            // No later observation; hold the last observed value
            return before.observed_grams;
        };

        let span = duration_minutes(after.time - before.time);
        if span <= 0.0 {
            return after.observed_grams;
        }
        let progress = duration_minutes(at - before.time) / span;

        let tau_before = self.model.inverse_fraction_absorbed(before.observed_grams / total);
        let tau_after = self.model.inverse_fraction_absorbed(after.observed_grams / total);
        let tau = tau_before + progress * (tau_after - tau_before);
        total * self.model.fraction_absorbed(tau)
    }

    /// Shortfall keeps absorbing from the last observed fraction at the declared rate
    fn absorbed_after_window(&self, status: &AbsorptionStatus, at: DateTime<Utc>) -> f64 {
        let total = status.entry.grams;
        let absorption_minutes = duration_minutes(status.absorption_time);
        let tau_end = self
            .model
            .inverse_fraction_absorbed(status.observed_grams() / total);
        if absorption_minutes <= 0.0 {
            return total;
        }
        let tau = tau_end + duration_minutes(at - status.window.end) / absorption_minutes;
        total * self.model.fraction_absorbed(tau)
    }
}

/// COB series at `from`, `to` and every status boundary in between
pub fn dynamic_carbs_on_board<C: AbsorptionCurve + ?Sized>(
    statuses: &[AbsorptionStatus],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    model: &C,
) -> Result<Vec<CobPoint>> {
    CobAggregator::new(model).series(statuses, from, to)
}

/// COB on a fixed grid of `step`
pub fn dynamic_carbs_on_board_stepped<C: AbsorptionCurve + ?Sized>(
    statuses: &[AbsorptionStatus],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    step: Duration,
    model: &C,
) -> Result<Vec<CobPoint>> {
    CobAggregator::new(model).stepped_series(statuses, from, to, step)
}

/// Total COB at a single instant
pub fn carbs_on_board_at<C: AbsorptionCurve + ?Sized>(
    statuses: &[AbsorptionStatus],
    at: DateTime<Utc>,
    model: &C,
) -> f64 {
    CobAggregator::new(model).carbs_on_board_at(statuses, at)
}
