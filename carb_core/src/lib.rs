#![forbid(unsafe_code)]

//! Core model and algorithms for dynamic carbs-on-board estimation.
//!
//! This crate provides:
//! - Domain types (carb entries, counteraction samples, COB points)
//! - Absorption curves and time-indexed schedules
//! - The absorption estimator and the COB aggregator
//! - Request decoding, configuration and output sinks

pub mod types;
pub mod error;
pub mod curve;
pub mod schedule;
pub mod counteraction;
pub mod estimator;
pub mod aggregator;
pub mod config;
pub mod logging;
pub mod request;
pub mod sink;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use curve::{AbsorptionCurve, AbsorptionModel, Linear, Parabolic, PiecewiseLinear};
pub use schedule::{CarbRatioSchedule, InsulinSensitivitySchedule, Schedule, ScheduleValue};
pub use counteraction::{CounteractionSeries, OverlapPolicy};
pub use estimator::{estimate_absorption, AbsorptionStatus, EstimatorOptions};
pub use aggregator::{
    carbs_on_board_at, dynamic_carbs_on_board, dynamic_carbs_on_board_stepped, CobAggregator,
    WindowExpiry,
};
pub use request::{load_request, parse_request, run, CobReport, CobRequest};
pub use sink::{sink_for, CobSink, CsvSink, JsonSink, OutputFormat};
