// =============================================================================
// Decision Trace — Auditable record of every heating decision
// =============================================================================
//
// Each control cycle ends in exactly one trace.  It captures which provider
// was selected, what both providers said, which gates failed and why, and the
// running shadow metrics, so that the learned provider can be evaluated after
// the fact without ever having acted.
//
// Traces are plain serialisable values; the zone hands them out as part of
// its cycle output and never keeps more than the latest one.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::optimal_stop::OptimalStopSnapshot;
use crate::providers::{Arbitration, ProviderDecision, ProviderKind};

pub const TRACE_SCHEMA_VERSION: u32 = 1;

/// Both provider outputs for the cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderCandidates {
    pub schedule: ProviderDecision,
    pub learned: ProviderDecision,
}

/// Running counters for the shadow provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShadowMetrics {
    /// Shadow decisions that would have stopped heating below the floor.
    pub safety_violations: u64,
    /// Cycles in which the learned provider produced a valid shadow decision.
    pub shadow_evaluations: u64,
}

impl ShadowMetrics {
    pub fn record(&mut self, arbitration: &Arbitration, learned: &ProviderDecision) {
        if learned.is_valid && learned.is_shadow {
            self.shadow_evaluations += 1;
        }
        if arbitration.shadow_safety_violation {
            self.safety_violations += 1;
        }
    }
}

/// Complete record of one cycle's decision.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionTrace {
    /// Unique identifier for this trace (UUID v4).
    pub id: String,

    pub schema_version: u32,

    /// Zone the decision pertains to.
    pub zone: String,

    /// RFC 3339 timestamp of the cycle.
    pub evaluated_at: String,

    pub provider_selected: ProviderKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_candidates: Option<ProviderCandidates>,

    pub gates_failed: Vec<String>,

    pub reasons: Vec<String>,

    pub shadow_mode: bool,

    /// Frost protection forced heating on.
    pub frost_override: bool,

    /// Final heating command.
    pub heating_on: bool,

    /// Why a preheat started this cycle, if one did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimal_stop: Option<OptimalStopSnapshot>,

    pub metrics: ShadowMetrics,
}

impl DecisionTrace {
    /// Trace of a fully evaluated cycle.  Command fields default to off and
    /// are filled in by the caller once actuation is decided.
    pub fn new(
        zone: impl Into<String>,
        evaluated_at: DateTime<Utc>,
        arbitration: &Arbitration,
        candidates: ProviderCandidates,
        metrics: ShadowMetrics,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            schema_version: TRACE_SCHEMA_VERSION,
            zone: zone.into(),
            evaluated_at: evaluated_at.to_rfc3339(),
            provider_selected: arbitration.selected,
            provider_candidates: Some(candidates),
            gates_failed: arbitration.gates_failed.clone(),
            reasons: arbitration.reasons.clone(),
            shadow_mode: arbitration.shadow_mode,
            frost_override: false,
            heating_on: false,
            start_reason: None,
            optimal_stop: None,
            metrics,
        }
    }

    /// Trace for a cycle that could not be evaluated.
    pub fn fallback(
        zone: impl Into<String>,
        evaluated_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            schema_version: TRACE_SCHEMA_VERSION,
            zone: zone.into(),
            evaluated_at: evaluated_at.to_rfc3339(),
            provider_selected: ProviderKind::None,
            provider_candidates: None,
            gates_failed: Vec::new(),
            reasons: vec![reason.into()],
            shadow_mode: false,
            frost_override: false,
            heating_on: false,
            start_reason: None,
            optimal_stop: None,
            metrics: ShadowMetrics::default(),
        }
    }
}
