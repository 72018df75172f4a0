// =============================================================================
// Zone Configuration — Layered per-zone settings with atomic save
// =============================================================================
//
// Every tunable parameter of a zone lives here.  A handful of values can come
// from three places: an explicit setting in the config file, the heating
// profile, or a hardcoded default.  Those are resolved in exactly that order
// by the `resolve_*` accessors, which also report where the value came from
// so the decision trace can show it.
//
// Persistence uses an atomic tmp + rename pattern.  All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{HeatingProfile, RiskMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_zone_name() -> String {
    "zone".to_string()
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_comfort_min() -> f64 {
    19.0
}

fn default_comfort_fallback() -> f64 {
    21.0
}

fn default_earliest_start_minutes() -> u32 {
    180
}

fn default_arrival_window_start() -> u32 {
    4 * 60
}

fn default_arrival_window_end() -> u32 {
    20 * 60
}

fn default_forecast_cache_ttl_min() -> u64 {
    30
}

fn default_stop_tolerance() -> f64 {
    0.5
}

fn default_max_coast_hours() -> f64 {
    4.0
}

fn default_departure_debounce_min() -> f64 {
    15.0
}

fn default_history_max_entries() -> usize {
    20
}

fn default_history_max_age_days() -> i64 {
    90
}

fn default_frost_temp() -> f64 {
    5.0
}

fn default_frost_hysteresis() -> f64 {
    0.5
}

fn default_gate_min_savings() -> f64 {
    15.0
}

fn default_gate_min_tau_confidence() -> f64 {
    0.6
}

fn default_gate_min_pattern_confidence() -> f64 {
    0.7
}

fn default_deadtime_trust_min_samples() -> u32 {
    5
}

fn default_fast_poll_secs() -> u64 {
    60
}

fn default_slow_poll_secs() -> u64 {
    300
}

fn default_approach_window_min() -> i64 {
    120
}

// =============================================================================
// Resolution
// =============================================================================

/// Where a resolved setting came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Explicit,
    Profile,
    Default,
}

/// A setting together with the layer that supplied it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Resolved<T> {
    pub value: T,
    pub source: ConfigSource,
}

/// Walk explicit → profile → default and return the first layer that is set.
pub fn resolve<T: Copy>(explicit: Option<T>, profile: Option<T>, default: T) -> Resolved<T> {
    if let Some(value) = explicit {
        return Resolved {
            value,
            source: ConfigSource::Explicit,
        };
    }
    if let Some(value) = profile {
        return Resolved {
            value,
            source: ConfigSource::Profile,
        };
    }
    Resolved {
        value: default,
        source: ConfigSource::Default,
    }
}

/// Buffer used when neither the config nor a profile supplies one.
const FALLBACK_BUFFER_MINUTES: f64 = 10.0;
/// Preheat cap used when neither the config nor a profile supplies one.
const FALLBACK_MAX_PREHEAT_HOURS: f64 = 3.0;

// =============================================================================
// ZoneConfig
// =============================================================================

/// Configuration for a single climate zone.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    // --- Identity ------------------------------------------------------------

    /// Human-readable zone name used in logs and traces.
    #[serde(default = "default_zone_name")]
    pub name: String,

    /// Offset of the zone's wall clock from UTC, in minutes.
    #[serde(default)]
    pub utc_offset_minutes: i32,

    // --- Physics -------------------------------------------------------------

    /// Heat emitter class.
    #[serde(default)]
    pub heating_profile: HeatingProfile,

    /// Base learning rate for the thermal model.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Learned deadtime is ignored until this many sessions were learned.
    #[serde(default = "default_deadtime_trust_min_samples")]
    pub deadtime_trust_min_samples: u32,

    // --- Comfort -------------------------------------------------------------

    /// Climate targets below this are treated as eco setbacks, not comfort.
    #[serde(default = "default_comfort_min")]
    pub comfort_min: f64,

    /// Comfort target used when nothing has been observed yet.
    #[serde(default = "default_comfort_fallback")]
    pub comfort_fallback: f64,

    // --- Start scheduling ----------------------------------------------------

    /// Safety margin in minutes.  Unset means "use the profile".
    #[serde(default)]
    pub buffer_minutes: Option<f64>,

    /// Hard cap on a preheat run in hours.  Unset means "use the profile".
    #[serde(default)]
    pub max_preheat_hours: Option<f64>,

    /// Preheat never starts earlier than this many minutes after midnight.
    #[serde(default = "default_earliest_start_minutes")]
    pub earliest_start_minutes: u32,

    /// Arrivals are only learned inside [start, end) minute-of-day.
    #[serde(default = "default_arrival_window_start")]
    pub arrival_window_start: u32,

    #[serde(default = "default_arrival_window_end")]
    pub arrival_window_end: u32,

    /// Skip preheat when the zone is already within 0.2 K of target.
    #[serde(default = "default_true")]
    pub dont_start_if_warm: bool,

    /// Restrict predictions to workdays (Mon–Fri unless the snapshot says otherwise).
    #[serde(default)]
    pub only_on_workdays: bool,

    // --- Forecast ------------------------------------------------------------

    /// Use the outdoor forecast instead of the current outdoor reading.
    #[serde(default)]
    pub use_forecast: bool,

    #[serde(default)]
    pub risk_mode: RiskMode,

    #[serde(default = "default_forecast_cache_ttl_min")]
    pub forecast_cache_ttl_min: u64,

    // --- Optimal stop --------------------------------------------------------

    /// Allow coasting before the scheduled session end.
    #[serde(default)]
    pub enable_optimal_stop: bool,

    /// Kelvin below target the zone may drop to by session end.
    #[serde(default = "default_stop_tolerance")]
    pub stop_tolerance: f64,

    #[serde(default = "default_max_coast_hours")]
    pub max_coast_hours: f64,

    // --- Occupancy history ---------------------------------------------------

    /// Minutes a departure must persist before it is committed.
    #[serde(default = "default_departure_debounce_min")]
    pub departure_debounce_min: f64,

    #[serde(default = "default_history_max_entries")]
    pub history_max_entries: usize,

    #[serde(default = "default_history_max_age_days")]
    pub history_max_age_days: i64,

    // --- Safety & gates ------------------------------------------------------

    /// Below this indoor temperature heating is forced on.
    #[serde(default = "default_frost_temp")]
    pub frost_temp: f64,

    #[serde(default = "default_frost_hysteresis")]
    pub frost_hysteresis: f64,

    /// Minimum coast savings (min) before the learned provider may act.
    #[serde(default = "default_gate_min_savings")]
    pub gate_min_savings: f64,

    #[serde(default = "default_gate_min_tau_confidence")]
    pub gate_min_tau_confidence: f64,

    #[serde(default = "default_gate_min_pattern_confidence")]
    pub gate_min_pattern_confidence: f64,

    // --- Cadence -------------------------------------------------------------

    #[serde(default = "default_fast_poll_secs")]
    pub fast_poll_secs: u64,

    #[serde(default = "default_slow_poll_secs")]
    pub slow_poll_secs: u64,

    /// Poll fast once the next preheat start is closer than this (minutes).
    #[serde(default = "default_approach_window_min")]
    pub approach_window_min: i64,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            name: default_zone_name(),
            utc_offset_minutes: 0,
            heating_profile: HeatingProfile::default(),
            learning_rate: default_learning_rate(),
            deadtime_trust_min_samples: default_deadtime_trust_min_samples(),
            comfort_min: default_comfort_min(),
            comfort_fallback: default_comfort_fallback(),
            buffer_minutes: None,
            max_preheat_hours: None,
            earliest_start_minutes: default_earliest_start_minutes(),
            arrival_window_start: default_arrival_window_start(),
            arrival_window_end: default_arrival_window_end(),
            dont_start_if_warm: true,
            only_on_workdays: false,
            use_forecast: false,
            risk_mode: RiskMode::default(),
            forecast_cache_ttl_min: default_forecast_cache_ttl_min(),
            enable_optimal_stop: false,
            stop_tolerance: default_stop_tolerance(),
            max_coast_hours: default_max_coast_hours(),
            departure_debounce_min: default_departure_debounce_min(),
            history_max_entries: default_history_max_entries(),
            history_max_age_days: default_history_max_age_days(),
            frost_temp: default_frost_temp(),
            frost_hysteresis: default_frost_hysteresis(),
            gate_min_savings: default_gate_min_savings(),
            gate_min_tau_confidence: default_gate_min_tau_confidence(),
            gate_min_pattern_confidence: default_gate_min_pattern_confidence(),
            fast_poll_secs: default_fast_poll_secs(),
            slow_poll_secs: default_slow_poll_secs(),
            approach_window_min: default_approach_window_min(),
        }
    }
}

impl ZoneConfig {
    /// Preheat buffer in minutes: explicit → profile → default.
    pub fn resolve_buffer_minutes(&self) -> Resolved<f64> {
        resolve(
            self.buffer_minutes,
            Some(self.heating_profile.params().buffer_minutes),
            FALLBACK_BUFFER_MINUTES,
        )
    }

    /// Preheat cap in hours: explicit → profile → default.
    pub fn resolve_max_preheat_hours(&self) -> Resolved<f64> {
        resolve(
            self.max_preheat_hours,
            Some(self.heating_profile.params().max_duration_hours),
            FALLBACK_MAX_PREHEAT_HOURS,
        )
    }

    /// Wall-clock offset of the zone.  Out-of-range values fall back to UTC.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read zone config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse zone config from {}", path.display()))?;

        info!(
            path = %path.display(),
            zone = %config.name,
            profile = %config.heating_profile,
            "zone config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise zone config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "zone config saved (atomic)");
        Ok(())
    }
}
