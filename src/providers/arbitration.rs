// =============================================================================
// Provider Arbitration — Strict priority selection and frost protection
// =============================================================================
//
// Priority, first match wins:
//
//   1. Manual hold          → manual, heating forced off
//   2. Schedule valid       → schedule
//   3. Learned valid, live  → learned
//   4. Learned valid, shadow→ none (shadow mode, traced only)
//   5. Otherwise            → none, both invalid reasons recorded
//
// Independently of the selection, a learned shadow decision that would have
// stopped heating while the zone is below the comfort floor counts as a
// shadow safety violation.  The counter is what eventually justifies (or
// vetoes) promoting the learned provider out of shadow.
//
// Frost protection sits above everything: below the frost floor heating is
// forced on even under a manual hold, with hysteresis on release.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::decision::{Gate, ProviderDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Manual,
    Schedule,
    Learned,
    None,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "MANUAL"),
            Self::Schedule => write!(f, "SCHEDULE"),
            Self::Learned => write!(f, "LEARNED"),
            Self::None => write!(f, "NONE"),
        }
    }
}

/// Result of one arbitration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Arbitration {
    pub selected: ProviderKind,
    /// Heating should be off for the selected provider.
    pub should_stop: bool,
    pub session_end: Option<DateTime<Utc>>,
    pub gates_failed: Vec<String>,
    pub reasons: Vec<String>,
    pub shadow_mode: bool,
    pub shadow_safety_violation: bool,
}

/// Select the acting provider.  Pure: no state, no side effects.
pub fn arbitrate(
    hold_active: bool,
    schedule: &ProviderDecision,
    learned: &ProviderDecision,
    indoor: f64,
    comfort_floor: f64,
) -> Arbitration {
    let mut gates_failed: Vec<String> = learned.gates_failed.iter().map(Gate::to_string).collect();
    let shadow_safety_violation = !hold_active
        && learned.is_valid
        && learned.is_shadow
        && learned.should_stop
        && indoor < comfort_floor;

    let mut out = Arbitration {
        selected: ProviderKind::None,
        should_stop: false,
        session_end: None,
        gates_failed: Vec::new(),
        reasons: Vec::new(),
        shadow_mode: false,
        shadow_safety_violation,
    };

    if hold_active {
        gates_failed.insert(0, Gate::ManualHold.to_string());
        out.selected = ProviderKind::Manual;
        out.should_stop = true;
        out.reasons.push("manual_hold".to_string());
    } else if schedule.is_valid {
        out.selected = ProviderKind::Schedule;
        out.should_stop = schedule.should_stop;
        out.session_end = schedule.session_end;
    } else if learned.is_valid && !learned.is_shadow {
        out.selected = ProviderKind::Learned;
        out.should_stop = learned.should_stop;
        out.session_end = learned.session_end;
    } else if learned.is_valid {
        out.shadow_mode = true;
        out.reasons.push("shadow_mode".to_string());
    } else {
        out.reasons.extend(
            [schedule, learned]
                .iter()
                .filter_map(|d| d.invalid_reason.map(|r| r.to_string())),
        );
    }

    out.gates_failed = gates_failed;
    out
}

// =============================================================================
// FrostGuard
// =============================================================================

/// Forces heating on below the frost floor, released with hysteresis.
#[derive(Debug, Clone)]
pub struct FrostGuard {
    floor: f64,
    hysteresis: f64,
    active: bool,
}

impl FrostGuard {
    pub fn new(floor: f64, hysteresis: f64) -> Self {
        Self {
            floor,
            hysteresis,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feed the indoor temperature; returns whether frost heating is forced.
    pub fn update(&mut self, indoor: f64) -> bool {
        if !self.active && indoor < self.floor {
            self.active = true;
            warn!(
                indoor = format!("{:.1}", indoor),
                floor = self.floor,
                "Frost protection engaged"
            );
        } else if self.active && indoor >= self.floor + self.hysteresis {
            self.active = false;
            info!(indoor = format!("{:.1}", indoor), "Frost protection released");
        }
        self.active
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::InvalidReason;
    use chrono::TimeZone;

    fn end() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 17, 0, 0).unwrap()
    }

    fn schedule(valid: bool) -> ProviderDecision {
        if valid {
            ProviderDecision::valid(end(), false)
        } else {
            ProviderDecision::invalid(InvalidReason::Off, false)
        }
    }

    fn learned(valid: bool, shadow: bool) -> ProviderDecision {
        if valid {
            ProviderDecision::valid(end(), shadow)
        } else {
            ProviderDecision::invalid(InvalidReason::InsufficientData, shadow)
        }
    }

    fn expected(hold: bool, sched: bool, l_valid: bool, l_shadow: bool) -> ProviderKind {
        if hold {
            ProviderKind::Manual
        } else if sched {
            ProviderKind::Schedule
        } else if l_valid && !l_shadow {
            ProviderKind::Learned
        } else {
            ProviderKind::None
        }
    }

    #[test]
    fn selection_follows_priority_for_every_combination() {
        for mask in 0..16u8 {
            let hold = mask & 1 != 0;
            let sched = mask & 2 != 0;
            let l_valid = mask & 4 != 0;
            let l_shadow = mask & 8 != 0;
            let a = arbitrate(hold, &schedule(sched), &learned(l_valid, l_shadow), 21.0, 20.5);
            assert_eq!(
                a.selected,
                expected(hold, sched, l_valid, l_shadow),
                "hold={hold} sched={sched} valid={l_valid} shadow={l_shadow}"
            );
            let shadow_only = !hold && !sched && l_valid && l_shadow;
            assert_eq!(a.shadow_mode, shadow_only);
        }
    }

    #[test]
    fn hold_forces_off_and_records_gate() {
        let a = arbitrate(true, &schedule(true), &learned(false, true), 21.0, 20.5);
        assert!(a.should_stop);
        assert_eq!(a.gates_failed.first().map(String::as_str), Some("manual_hold"));
    }

    #[test]
    fn both_invalid_records_both_reasons() {
        let a = arbitrate(false, &schedule(false), &learned(false, true), 21.0, 20.5);
        assert_eq!(a.reasons, vec!["off".to_string(), "insufficient_data".to_string()]);
    }

    #[test]
    fn shadow_stop_below_floor_is_a_violation() {
        let mut l = learned(true, true);
        l.should_stop = true;
        let a = arbitrate(false, &schedule(true), &l, 15.0, 20.5);
        assert_eq!(a.selected, ProviderKind::Schedule);
        assert!(a.shadow_safety_violation);

        let a = arbitrate(false, &schedule(false), &l, 21.0, 20.5);
        assert!(!a.shadow_safety_violation);
    }

    #[test]
    fn frost_guard_has_hysteresis() {
        let mut g = FrostGuard::new(5.0, 0.5);
        assert!(!g.update(6.0));
        assert!(g.update(4.9));
        assert!(g.update(5.2));
        assert!(!g.update(5.5));
        assert!(!g.update(5.2));
    }
}
