// =============================================================================
// Shared types used across the preheat engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Heat emitter class of a zone.  Selects deadtime, thermal-mass bounds and
/// the scheduling defaults used when the config does not set them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatingProfile {
    InfraredAir,
    RadiatorNew,
    RadiatorOld,
    FloorDry,
    FloorConcrete,
}

impl Default for HeatingProfile {
    fn default() -> Self {
        Self::RadiatorNew
    }
}

impl std::fmt::Display for HeatingProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InfraredAir => write!(f, "InfraredAir"),
            Self::RadiatorNew => write!(f, "RadiatorNew"),
            Self::RadiatorOld => write!(f, "RadiatorOld"),
            Self::FloorDry => write!(f, "FloorDry"),
            Self::FloorConcrete => write!(f, "FloorConcrete"),
        }
    }
}

/// Physical parameters attached to a [`HeatingProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProfileParams {
    /// Minutes between valve opening and the first measurable temperature rise.
    pub deadtime: f64,
    /// Lower bound for the learned mass factor (min/K).
    pub mass_min: f64,
    /// Upper bound for the learned mass factor (min/K).
    pub mass_max: f64,
    /// Mass factor used before anything has been learned.
    pub default_mass: f64,
    /// Hard cap on a single preheat run, in hours.
    pub max_duration_hours: f64,
    /// Safety margin added in front of the predicted duration, in minutes.
    pub buffer_minutes: f64,
}

impl HeatingProfile {
    pub fn params(self) -> ProfileParams {
        match self {
            Self::InfraredAir => ProfileParams {
                deadtime: 5.0,
                mass_min: 5.0,
                mass_max: 20.0,
                default_mass: 10.0,
                max_duration_hours: 1.5,
                buffer_minutes: 5.0,
            },
            Self::RadiatorNew => ProfileParams {
                deadtime: 15.0,
                mass_min: 10.0,
                mass_max: 40.0,
                default_mass: 20.0,
                max_duration_hours: 2.5,
                buffer_minutes: 10.0,
            },
            Self::RadiatorOld => ProfileParams {
                deadtime: 30.0,
                mass_min: 20.0,
                mass_max: 60.0,
                default_mass: 30.0,
                max_duration_hours: 3.0,
                buffer_minutes: 15.0,
            },
            Self::FloorDry => ProfileParams {
                deadtime: 45.0,
                mass_min: 30.0,
                mass_max: 90.0,
                default_mass: 50.0,
                max_duration_hours: 4.0,
                buffer_minutes: 20.0,
            },
            Self::FloorConcrete => ProfileParams {
                deadtime: 120.0,
                mass_min: 60.0,
                mass_max: 240.0,
                default_mass: 100.0,
                max_duration_hours: 8.0,
                buffer_minutes: 30.0,
            },
        }
    }
}

/// How the outdoor forecast over a window is collapsed into one number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMode {
    /// Time-weighted mean.
    Balanced,
    /// 10th percentile: assume it gets colder than expected.
    Pessimistic,
    /// 90th percentile.
    Optimistic,
}

impl Default for RiskMode {
    fn default() -> Self {
        Self::Balanced
    }
}

impl std::fmt::Display for RiskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Balanced => write!(f, "Balanced"),
            Self::Pessimistic => write!(f, "Pessimistic"),
            Self::Optimistic => write!(f, "Optimistic"),
        }
    }
}

/// A single outdoor temperature forecast sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
}

impl ForecastPoint {
    pub fn new(timestamp: DateTime<Utc>, temperature: f64) -> Self {
        Self {
            timestamp,
            temperature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_profile_has_consistent_mass_bounds() {
        for profile in [
            HeatingProfile::InfraredAir,
            HeatingProfile::RadiatorNew,
            HeatingProfile::RadiatorOld,
            HeatingProfile::FloorDry,
            HeatingProfile::FloorConcrete,
        ] {
            let p = profile.params();
            assert!(p.mass_min < p.mass_max, "{profile}: min >= max");
            assert!(
                p.default_mass >= p.mass_min && p.default_mass <= p.mass_max,
                "{profile}: default mass outside bounds"
            );
        }
    }

    #[test]
    fn profile_serialises_snake_case() {
        let json = serde_json::to_string(&HeatingProfile::FloorConcrete).unwrap();
        assert_eq!(json, "\"floor_concrete\"");
        let back: HeatingProfile = serde_json::from_str("\"radiator_old\"").unwrap();
        assert_eq!(back, HeatingProfile::RadiatorOld);
    }
}
