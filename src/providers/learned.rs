// =============================================================================
// Learned Departure Provider — Session end from departure patterns (shadow)
// =============================================================================
//
// Predicts when the occupants will leave and therefore when heating could
// stop.  Two modes:
//
//   Anchored:   a schedule session end exists: predict the departure on the
//                same local date from that weekday's history.
//   Autonomous: no schedule: look ahead through the departure history.
//
// The provider always runs in shadow: its decisions are traced and scored
// (would it have let the zone get too cold?) but never acted on.  A decision
// is only valid when a prediction exists and every gate passes.
// =============================================================================

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::debug;

use super::arbitration::ProviderKind;
use super::decision::{
    Gate, GateThresholds, InvalidReason, ProviderContext, ProviderDecision, SessionEndProvider,
};
use crate::planner::{local_timestamp, SchedulePlanner};

pub struct LearnedDepartureProvider<'a> {
    planner: &'a SchedulePlanner,
    gates: GateThresholds,
}

impl<'a> LearnedDepartureProvider<'a> {
    pub fn new(planner: &'a SchedulePlanner, gates: GateThresholds) -> Self {
        Self { planner, gates }
    }
}

impl SessionEndProvider for LearnedDepartureProvider<'_> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Learned
    }

    fn decide(&self, ctx: &ProviderContext<'_>) -> ProviderDecision {
        let prediction = match ctx.anchor_session_end {
            Some(anchor) => {
                let date = anchor.with_timezone(&ctx.tz).date_naive();
                self.planner
                    .predict_departure_on(date)
                    .and_then(|(minute, result)| {
                        local_timestamp(&ctx.tz, date, minute)
                            .map(|ts| (ts.with_timezone(&Utc), result))
                    })
            }
            None => self
                .planner
                .next_predicted_departure(
                    &ctx.now.with_timezone(&ctx.tz),
                    ctx.blocked_dates,
                    ctx.allowed_weekdays,
                )
                .map(|(ts, result)| (ts.with_timezone(&Utc), result)),
        };

        let mut gate_inputs = BTreeMap::new();
        gate_inputs.insert("savings_min".to_string(), ctx.potential_savings);
        gate_inputs.insert("tau_confidence".to_string(), ctx.tau_confidence);

        let mut gates_failed = Vec::new();
        if ctx.potential_savings < self.gates.min_savings {
            gates_failed.push(Gate::MinSavings);
        }
        if ctx.tau_confidence < self.gates.min_tau_confidence {
            gates_failed.push(Gate::TauConfidence);
        }
        if let Some((_, result)) = &prediction {
            gate_inputs.insert("pattern_confidence".to_string(), result.confidence);
            if result.confidence < self.gates.min_pattern_confidence {
                gates_failed.push(Gate::PatternConfidence);
            }
        }

        let mut decision = match prediction {
            None => ProviderDecision::invalid(InvalidReason::InsufficientData, true),
            Some(_) if !gates_failed.is_empty() => {
                debug!(gates = ?gates_failed, "Learned departure blocked by gates");
                ProviderDecision::invalid(InvalidReason::BlockedByGates, true)
            }
            Some((end, result)) => {
                let mut d = ProviderDecision::valid(end, true);
                d.confidence = Some(result.confidence);
                d.predicted_savings = Some(ctx.potential_savings);
                let stop_from = end - chrono::Duration::seconds((ctx.potential_savings * 60.0).round() as i64);
                d.should_stop = ctx.now >= stop_from && ctx.now < end;
                d
            }
        };
        decision.gates_failed = gates_failed;
        decision.gate_inputs = gate_inputs;
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use chrono::{DateTime, FixedOffset, TimeZone};

    use crate::providers::ScheduleSnapshot;

    fn at(d: u32, hh: u32, mm: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, hh, mm, 0).unwrap()
    }

    fn gates() -> GateThresholds {
        GateThresholds {
            min_savings: 15.0,
            min_tau_confidence: 0.6,
            min_pattern_confidence: 0.7,
        }
    }

    /// Departures at 17:00 on four Mondays.
    fn planner() -> SchedulePlanner {
        let mut p = SchedulePlanner::default();
        for d in [1, 8, 15, 22] {
            p.record_departure(&at(d, 17, 0));
        }
        p
    }

    fn decide(
        planner: &SchedulePlanner,
        now: DateTime<Utc>,
        anchor: Option<DateTime<Utc>>,
        savings: f64,
        tau_confidence: f64,
    ) -> ProviderDecision {
        let blocked = HashSet::new();
        let schedule = ScheduleSnapshot::default();
        let ctx = ProviderContext {
            now,
            tz: FixedOffset::east_opt(0).unwrap(),
            schedule: &schedule,
            anchor_session_end: anchor,
            potential_savings: savings,
            tau_confidence,
            blocked_dates: &blocked,
            allowed_weekdays: None,
        };
        LearnedDepartureProvider::new(planner, gates()).decide(&ctx)
    }

    #[test]
    fn empty_history_is_insufficient_even_with_failed_gates() {
        let p = SchedulePlanner::default();
        let d = decide(&p, at(29, 12, 0), None, 5.0, 0.1);
        assert!(!d.is_valid);
        assert!(d.is_shadow);
        assert_eq!(d.invalid_reason, Some(InvalidReason::InsufficientData));
        assert_eq!(d.gates_failed, vec![Gate::MinSavings, Gate::TauConfidence]);
    }

    #[test]
    fn low_tau_confidence_blocks() {
        let p = planner();
        let d = decide(&p, at(29, 12, 0), None, 30.0, 0.3);
        assert_eq!(d.invalid_reason, Some(InvalidReason::BlockedByGates));
        assert_eq!(d.gates_failed, vec![Gate::TauConfidence]);
    }

    #[test]
    fn autonomous_prediction_is_valid_shadow() {
        let p = planner();
        let d = decide(&p, at(29, 12, 0), None, 30.0, 0.9);
        assert!(d.is_valid && d.is_shadow);
        assert_eq!(d.session_end, Some(at(29, 17, 0)));
        assert!(!d.should_stop);

        let d = decide(&p, at(29, 16, 40), None, 30.0, 0.9);
        assert!(d.should_stop);
    }

    #[test]
    fn stop_window_rounds_fractional_savings() {
        let p = planner();
        // 15.999 min is 959.94 s; the stop window opens at 16:44:00, not 16:44:01.
        let d = decide(&p, at(29, 16, 44), None, 15.999, 0.9);
        assert!(d.is_valid);
        assert!(d.should_stop);
    }

    #[test]
    fn anchored_mode_uses_schedule_date() {
        let p = planner();
        // Sunday noon, schedule ends Monday: prediction for Monday's bucket.
        let d = decide(&p, at(28, 12, 0), Some(at(29, 18, 0)), 30.0, 0.9);
        assert!(d.is_valid);
        assert_eq!(d.session_end, Some(at(29, 17, 0)));
    }
}
