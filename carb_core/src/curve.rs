//! Carbohydrate absorption curves.
//!
//! A curve maps normalized time (elapsed ÷ total absorption time) to the
//! normalized fraction absorbed. Every curve saturates at the unit interval:
//! nothing is absorbed before `t = 0` and everything is absorbed at `t = 1`.

use crate::types::duration_minutes;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Capability shared by all absorption curve shapes
pub trait AbsorptionCurve {
    /// Fraction absorbed at normalized time `t`
    fn fraction_absorbed(&self, t: f64) -> f64;

    /// Normalized time at which fraction `a` has been absorbed
    fn inverse_fraction_absorbed(&self, a: f64) -> f64;

    /// Normalized absorption rate at `t`
    fn fraction_rate(&self, t: f64) -> f64;

    /// Grams absorbed `elapsed` after the start of an entry of `total` grams
    fn absorbed_grams(&self, total: f64, elapsed: Duration, absorption_time: Duration) -> f64 {
        total * self.fraction_absorbed(normalized_time(elapsed, absorption_time))
    }

    /// Grams still unabsorbed `elapsed` after the start of an entry
    fn unabsorbed_grams(&self, total: f64, elapsed: Duration, absorption_time: Duration) -> f64 {
        total - self.absorbed_grams(total, elapsed, absorption_time)
    }

    /// Modeled absorption rate in grams per minute
    fn absorption_rate(&self, total: f64, elapsed: Duration, absorption_time: Duration) -> f64 {
        let minutes = duration_minutes(absorption_time);
        if minutes <= 0.0 {
            return 0.0;
        }
        total * self.fraction_rate(normalized_time(elapsed, absorption_time)) / minutes
    }
}

/// `elapsed / absorption_time`, with a zero-length absorption treated as done
fn normalized_time(elapsed: Duration, absorption_time: Duration) -> f64 {
    let total = duration_minutes(absorption_time);
    if total <= 0.0 {
        return 1.0;
    }
    duration_minutes(elapsed) / total
}

// ============================================================================
// Linear
// ============================================================================

/// Constant absorption rate over the whole absorption time
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Linear;

impl AbsorptionCurve for Linear {
    fn fraction_absorbed(&self, t: f64) -> f64 {
        t.clamp(0.0, 1.0)
    }

    fn inverse_fraction_absorbed(&self, a: f64) -> f64 {
        a.clamp(0.0, 1.0)
    }

    fn fraction_rate(&self, t: f64) -> f64 {
        if t > 0.0 && t <= 1.0 {
            1.0
        } else {
            0.0
        }
    }
}

// ============================================================================
// Piecewise linear
// ============================================================================

/// Rate rises linearly, plateaus, then falls linearly to zero
///
/// The absorbed fraction is quadratic during the rise and the fall and linear
/// on the plateau.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PiecewiseLinear {
    pub end_of_rise: f64,
    pub start_of_fall: f64,
}

impl Default for PiecewiseLinear {
    fn default() -> Self {
        Self {
            end_of_rise: 0.15,
            start_of_fall: 0.5,
        }
    }
}

impl PiecewiseLinear {
    /// Plateau rate, chosen so the total area under the rate is 1
    pub fn scale(&self) -> f64 {
        2.0 / (1.0 + self.start_of_fall - self.end_of_rise)
    }
}

impl AbsorptionCurve for PiecewiseLinear {
    fn fraction_absorbed(&self, t: f64) -> f64 {
        let scale = self.scale();
        if t <= 0.0 {
            0.0
        } else if t < self.end_of_rise {
            0.5 * scale * t * t / self.end_of_rise
        } else if t < self.start_of_fall {
            scale * (t - 0.5 * self.end_of_rise)
        } else if t < 1.0 {
            1.0 - 0.5 * scale * (1.0 - t).powi(2) / (1.0 - self.start_of_fall)
        } else {
            1.0
        }
    }

    fn inverse_fraction_absorbed(&self, a: f64) -> f64 {
        let scale = self.scale();
        let rise_area = 0.5 * scale * self.end_of_rise;
        let fall_area = 0.5 * scale * (1.0 - self.start_of_fall);
        if a <= 0.0 {
            0.0
        } else if a < rise_area {
            (2.0 * self.end_of_rise * a / scale).sqrt()
        } else if a < 1.0 - fall_area {
            0.5 * self.end_of_rise + a / scale
        } else if a < 1.0 {
            1.0 - (2.0 * (1.0 - self.start_of_fall) * (1.0 - a) / scale).sqrt()
        } else {
            1.0
        }
    }

    fn fraction_rate(&self, t: f64) -> f64 {
        let scale = self.scale();
        if t <= 0.0 {
            0.0
        } else if t < self.end_of_rise {
            scale * t / self.end_of_rise
        } else if t < self.start_of_fall {
            scale
        } else if t < 1.0 {
            scale * (1.0 - t) / (1.0 - self.start_of_fall)
        } else {
            0.0
        }
    }
}

// ============================================================================
// Parabolic
// ============================================================================

/// Symmetric parabolic rate peaking at half the absorption time
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Parabolic;

impl AbsorptionCurve for Parabolic {
    fn fraction_absorbed(&self, t: f64) -> f64 {
        if t <= 0.0 {
            0.0
        } else if t <= 0.5 {
            2.0 * t * t
        } else if t < 1.0 {
            -1.0 + 2.0 * t * (2.0 - t)
        } else {
            1.0
        }
    }

    fn inverse_fraction_absorbed(&self, a: f64) -> f64 {
        if a <= 0.0 {
            0.0
        } else if a <= 0.5 {
            (a / 2.0).sqrt()
        } else if a < 1.0 {
            1.0 - ((1.0 - a) / 2.0).sqrt()
        } else {
            1.0
        }
    }

    fn fraction_rate(&self, t: f64) -> f64 {
        if t <= 0.0 {
            0.0
        } else if t <= 0.5 {
            4.0 * t
        } else if t < 1.0 {
            4.0 - 4.0 * t
        } else {
            0.0
        }
    }
}

// ============================================================================
// Tagged model selection
// ============================================================================

/// Curve selection as it appears in config files and requests
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbsorptionModel {
    Linear,
    #[default]
    #[serde(alias = "piecewiseLinear")]
    PiecewiseLinear,
    Parabolic,
}

impl AbsorptionCurve for AbsorptionModel {
    fn fraction_absorbed(&self, t: f64) -> f64 {
        match self {
            AbsorptionModel::Linear => Linear.fraction_absorbed(t),
            AbsorptionModel::PiecewiseLinear => PiecewiseLinear::default().fraction_absorbed(t),
            AbsorptionModel::Parabolic => Parabolic.fraction_absorbed(t),
        }
    }

    fn inverse_fraction_absorbed(&self, a: f64) -> f64 {
        match self {
            AbsorptionModel::Linear => Linear.inverse_fraction_absorbed(a),
            AbsorptionModel::PiecewiseLinear => {
                PiecewiseLinear::default().inverse_fraction_absorbed(a)
            }
            AbsorptionModel::Parabolic => Parabolic.inverse_fraction_absorbed(a),
        }
    }

    fn fraction_rate(&self, t: f64) -> f64 {
        match self {
            AbsorptionModel::Linear => Linear.fraction_rate(t),
            AbsorptionModel::PiecewiseLinear => PiecewiseLinear::default().fraction_rate(t),
            AbsorptionModel::Parabolic => Parabolic.fraction_rate(t),
        }
    }
}

impl fmt::Display for AbsorptionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AbsorptionModel::Linear => "linear",
            AbsorptionModel::PiecewiseLinear => "piecewise-linear",
            AbsorptionModel::Parabolic => "parabolic",
        };
        f.write_str(name)
    }
}

impl FromStr for AbsorptionModel {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "linear" => Ok(AbsorptionModel::Linear),
            "piecewise-linear" | "piecewiselinear" => Ok(AbsorptionModel::PiecewiseLinear),
            "parabolic" => Ok(AbsorptionModel::Parabolic),
            other => Err(crate::Error::InvalidParameter(format!(
                "unknown absorption model: {}",
                other
            ))),
        }
    }
}
