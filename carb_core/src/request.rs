//! Request bundles and the estimate-then-aggregate pipeline.
//!
//! Two JSON shapes are accepted:
//! - the full bundle ([`CobRequest`]) with explicit schedules and query range
//! - the legacy dynamic-carbs payload ([`LegacyDynamicCarbsInput`]) with a
//!   scalar carb ratio and sensitivity, still produced by older tooling

use crate::aggregator::CobAggregator;
use crate::counteraction::CounteractionSeries;
use crate::curve::AbsorptionModel;
use crate::estimator::{estimate_absorption, AbsorptionStatus};
use crate::schedule::{Schedule, ScheduleValue};
use crate::types::{minutes_duration, CarbEntry, CobPoint, GlucoseEffectVelocity};
use crate::{Config, Error, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

/// Query length used when a request gives no end
const DEFAULT_QUERY_HOURS: i64 = 6;

/// Overrun the legacy payload was always evaluated with
const LEGACY_OVERRUN: f64 = 2.0;

/// Carb entry as it appears in request files (absorption time in minutes)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CarbEntryInput {
    #[serde(deserialize_with = "flexible_timestamp")]
    pub date: DateTime<Utc>,
    pub grams: f64,
    #[serde(default)]
    pub absorption_time: Option<f64>,
}

/// Counteraction sample as it appears in request files (mg/dL per minute)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CounteractionInput {
    #[serde(alias = "start_at", deserialize_with = "flexible_timestamp")]
    pub start_at: DateTime<Utc>,
    #[serde(alias = "end_at", deserialize_with = "flexible_timestamp")]
    pub end_at: DateTime<Utc>,
    pub velocity: f64,
}

/// Schedule value as it appears in request files
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleInput {
    #[serde(deserialize_with = "flexible_timestamp")]
    pub start_date: DateTime<Utc>,
    #[serde(deserialize_with = "flexible_timestamp")]
    pub end_date: DateTime<Utc>,
    pub value: f64,
}

/// Full request bundle
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CobRequest {
    pub carb_entries: Vec<CarbEntryInput>,
    pub counteraction_effects: Vec<CounteractionInput>,
    pub carb_ratio_schedule: Vec<ScheduleInput>,
    pub insulin_sensitivity_schedule: Vec<ScheduleInput>,
    #[serde(default)]
    pub absorption_model: Option<AbsorptionModel>,
    #[serde(default)]
    pub initial_absorption_time_overrun: Option<f64>,
    #[serde(default, deserialize_with = "optional_flexible_timestamp")]
    pub query_from: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "optional_flexible_timestamp")]
    pub query_to: Option<DateTime<Utc>>,
}

/// Legacy ICE sample (snake_case keys)
#[derive(Clone, Debug, Deserialize)]
pub struct LegacyIce {
    pub velocity: f64,
    #[serde(deserialize_with = "flexible_timestamp")]
    pub start_at: DateTime<Utc>,
    #[serde(deserialize_with = "flexible_timestamp")]
    pub end_at: DateTime<Utc>,
}

/// Legacy dynamic-carbs payload
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyDynamicCarbsInput {
    #[serde(rename = "inputICE")]
    pub input_ice: Vec<LegacyIce>,
    pub carb_entries: Vec<CarbEntryInput>,
    pub sensitivity: f64,
    pub carb_ratio: f64,
}

impl LegacyDynamicCarbsInput {
    /// Convert to a full request
    ///
    /// Only the first carb entry is evaluated. Constant schedules span the
    /// first to the last ICE start, and the query covers six hours from the
    /// first ICE start with the piecewise linear curve.
    pub fn into_request(self) -> Result<CobRequest> {
        let (Some(first), Some(last)) = (self.input_ice.first(), self.input_ice.last()) else {
            return Err(Error::EmptyInput("legacy payload has no ICE samples".into()));
        };
        let Some(entry) = self.carb_entries.first().cloned() else {
            return Err(Error::EmptyInput("legacy payload has no carb entries".into()));
        };
        if self.carb_entries.len() > 1 {
            tracing::warn!(
                "Legacy payload has {} carb entries; only the first is evaluated",
                self.carb_entries.len()
            );
        }

        let start = first.start_at;
        let end = last.start_at;
        let constant = |value| {
            vec![ScheduleInput {
                start_date: start,
                end_date: end,
                value,
            }]
        };

        Ok(CobRequest {
            carb_entries: vec![entry],
            counteraction_effects: self
                .input_ice
                .iter()
                .map(|ice| CounteractionInput {
                    start_at: ice.start_at,
                    end_at: ice.end_at,
                    velocity: ice.velocity,
                })
                .collect(),
            carb_ratio_schedule: constant(self.carb_ratio),
            insulin_sensitivity_schedule: constant(self.sensitivity),
            absorption_model: Some(AbsorptionModel::PiecewiseLinear),
            initial_absorption_time_overrun: Some(LEGACY_OVERRUN),
            query_from: Some(start),
            query_to: Some(default_query_end(start)?),
        })
    }
}

/// Parse either request shape from JSON text
pub fn parse_request(json: &str) -> Result<CobRequest> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    if value.get("inputICE").is_some() {
        tracing::debug!("Decoding legacy dynamic-carbs payload");
        let legacy: LegacyDynamicCarbsInput = serde_json::from_value(value)?;
        legacy.into_request()
    } else {
        Ok(serde_json::from_value(value)?)
    }
}

/// Read and parse a request file
pub fn load_request(path: &Path) -> Result<CobRequest> {
    let contents = std::fs::read_to_string(path)?;
    parse_request(&contents)
}

/// Result of one pipeline run
#[derive(Clone, Debug, PartialEq)]
pub struct CobReport {
    pub model: AbsorptionModel,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub statuses: Vec<AbsorptionStatus>,
    pub series: Vec<CobPoint>,
}

impl CobRequest {
    fn entries(&self) -> Result<Vec<CarbEntry>> {
        self.carb_entries
            .iter()
            .map(|e| {
                let absorption_time = e.absorption_time.map(minutes_duration).transpose()?;
                CarbEntry::new(e.date, e.grams, absorption_time)
            })
            .collect()
    }

    fn samples(&self) -> Result<Vec<GlucoseEffectVelocity>> {
        self.counteraction_effects
            .iter()
            .map(|s| GlucoseEffectVelocity::new(s.start_at, s.end_at, s.velocity))
            .collect()
    }
}

fn default_query_end(from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    from.checked_add_signed(Duration::hours(DEFAULT_QUERY_HOURS))
        .ok_or_else(|| Error::InvalidParameter(format!("query start {} is out of range", from)))
}

fn schedule(name: &str, inputs: &[ScheduleInput]) -> Result<Schedule<f64>> {
    let values = inputs
        .iter()
        .map(|v| ScheduleValue::new(v.start_date, v.end_date, v.value))
        .collect::<Result<Vec<_>>>()?;
    let schedule = Schedule::new(name, values)?;
    tracing::debug!(
        "Built {} schedule with {} values",
        schedule.name(),
        schedule.values().len()
    );
    Ok(schedule)
}

/// Estimate absorption and aggregate COB for one request
///
/// Request fields override the config; the config fills in anything absent.
pub fn run(request: &CobRequest, config: &Config) -> Result<CobReport> {
    let entries = request.entries()?;
    if entries.is_empty() {
        return Err(Error::EmptyInput("no carb entries".into()));
    }
    let counteraction =
        CounteractionSeries::new(request.samples()?, config.attribution.overlap_policy)?;
    let carb_ratio = schedule("carb ratio", &request.carb_ratio_schedule)?;
    let insulin_sensitivity =
        schedule("insulin sensitivity", &request.insulin_sensitivity_schedule)?;

    let model = request.absorption_model.unwrap_or(config.absorption.model);
    let mut options = config.estimator_options()?;
    if let Some(overrun) = request.initial_absorption_time_overrun {
        options.initial_absorption_time_overrun = overrun;
    }

    let statuses = estimate_absorption(
        &entries,
        &counteraction,
        &carb_ratio,
        &insulin_sensitivity,
        &options,
        &model,
    )?;

    let from = request.query_from.unwrap_or(counteraction.span().start);
    let to = match request.query_to {
        Some(to) => to,
        None => default_query_end(from)?,
    };

    let aggregator = CobAggregator::new(&model).with_expiry(config.attribution.window_expiry);
    let series = match config.output.step_minutes {
        Some(step) => {
            aggregator.stepped_series(&statuses, from, to, Duration::minutes(i64::from(step)))?
        }
        None => aggregator.series(&statuses, from, to)?,
    };

    tracing::info!(
        "Computed {} COB points from {} to {} with {} model",
        series.len(),
        from,
        to,
        model
    );

    Ok(CobReport {
        model,
        from,
        to,
        statuses,
        series,
    })
}

/// Accept RFC 3339 timestamps, or zone-less ISO 8601 timestamps read as UTC
fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp {:?}: {}", raw, e))
}

fn flexible_timestamp<'de, D>(d: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(d)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

fn optional_flexible_timestamp<'de, D>(
    d: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(d)?
        .map(|raw| parse_timestamp(&raw))
        .transpose()
        .map_err(serde::de::Error::custom)
}
