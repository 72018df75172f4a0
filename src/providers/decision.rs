// =============================================================================
// Provider Decisions — Common output of every session-end provider
// =============================================================================

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, FixedOffset, NaiveDate, Utc, Weekday};
use serde::Serialize;

use super::arbitration::ProviderKind;
use super::schedule::ScheduleSnapshot;

/// Why a provider could not produce a usable session end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    Unavailable,
    Off,
    NoNextEvent,
    ParseError,
    InsufficientData,
    BlockedByGates,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unavailable => "unavailable",
            Self::Off => "off",
            Self::NoNextEvent => "no_next_event",
            Self::ParseError => "parse_error",
            Self::InsufficientData => "insufficient_data",
            Self::BlockedByGates => "blocked_by_gates",
        };
        write!(f, "{s}")
    }
}

/// A safety gate that kept a learned decision from being used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    MinSavings,
    TauConfidence,
    PatternConfidence,
    ManualHold,
}

impl std::fmt::Display for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MinSavings => "min_savings",
            Self::TauConfidence => "tau_confidence",
            Self::PatternConfidence => "pattern_confidence",
            Self::ManualHold => "manual_hold",
        };
        write!(f, "{s}")
    }
}

/// Minimums a learned decision has to clear.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GateThresholds {
    /// Minutes of coast savings.
    pub min_savings: f64,
    pub min_tau_confidence: f64,
    pub min_pattern_confidence: f64,
}

/// Output of one provider for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderDecision {
    pub should_stop: bool,
    pub session_end: Option<DateTime<Utc>>,
    pub is_valid: bool,
    /// Evaluated and traced, but never acted on.
    pub is_shadow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_savings: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<InvalidReason>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gates_failed: Vec<Gate>,
    /// Values the gates were evaluated against.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub gate_inputs: BTreeMap<String, f64>,
}

impl ProviderDecision {
    pub fn valid(session_end: DateTime<Utc>, is_shadow: bool) -> Self {
        Self {
            should_stop: false,
            session_end: Some(session_end),
            is_valid: true,
            is_shadow,
            confidence: None,
            predicted_savings: None,
            invalid_reason: None,
            gates_failed: Vec::new(),
            gate_inputs: BTreeMap::new(),
        }
    }

    pub fn invalid(reason: InvalidReason, is_shadow: bool) -> Self {
        Self {
            should_stop: false,
            session_end: None,
            is_valid: false,
            is_shadow,
            confidence: None,
            predicted_savings: None,
            invalid_reason: Some(reason),
            gates_failed: Vec::new(),
            gate_inputs: BTreeMap::new(),
        }
    }
}

/// Everything a provider may look at.
#[derive(Debug, Clone, Copy)]
pub struct ProviderContext<'a> {
    pub now: DateTime<Utc>,
    /// Wall clock of the zone, for naive schedule timestamps and weekdays.
    pub tz: FixedOffset,
    pub schedule: &'a ScheduleSnapshot,
    /// Session end from a valid schedule, if any.
    pub anchor_session_end: Option<DateTime<Utc>>,
    /// Minutes of coasting physically available right now.
    pub potential_savings: f64,
    pub tau_confidence: f64,
    pub blocked_dates: &'a HashSet<NaiveDate>,
    pub allowed_weekdays: Option<&'a HashSet<Weekday>>,
}

/// A source of session-end decisions.
pub trait SessionEndProvider {
    fn kind(&self) -> ProviderKind;
    fn decide(&self, ctx: &ProviderContext<'_>) -> ProviderDecision;
}
