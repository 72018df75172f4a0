// =============================================================================
// Optimal Stop Engine — Coast to target at session end
// =============================================================================
//
// Near the end of an occupancy session the zone can stop heating early and
// coast on stored heat, arriving at the session end just at the tolerated
// floor temperature instead of at full target.
//
//   floor = target − tolerance
//   coast = −tau · ln((floor − T_out) / (T_indoor − T_out))     [hours]
//   stop  = session_end − coast
//
// State machine:
//
//   Inactive ──session known──▶ Waiting ──now ≥ stop, coast ≥ 10 min──▶ Coasting
//       ▲                                                              │
//       └──── reset (setpoint change, too cold, no session, session over) ───┘
//
// Coasting is latched: once heating stopped, small temperature or forecast
// wiggles must not toggle the valve back on.  Only a reset ends it, and a
// session end that has passed counts as one.  A
// missing session end is tolerated for 120 s so that one missed schedule
// poll does not release the latch.
//
// Safety always wins: below floor − 0.2 K the engine drops out immediately,
// latched or not.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::math::{coast_duration, newton_cooling};

// =============================================================================
// Constants
// =============================================================================

/// Session end may be missing this long before the latch is released.
const LATCH_RESET_DEBOUNCE_SECS: i64 = 120;
/// Coasting shorter than this is not worth stopping for (minutes).
pub const MIN_SAVINGS_MINUTES: f64 = 10.0;
/// A target move larger than this restarts the evaluation (K).
const SETPOINT_CHANGE_K: f64 = 0.1;
/// Absorbs float noise in setpoint comparisons, e.g. 21.1 − 21.0.
const SETPOINT_EPSILON: f64 = 1e-9;
/// Margin below the floor that trips the safety break (K).
const SAFETY_MARGIN_K: f64 = 0.2;

// =============================================================================
// Phase & reason
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopPhase {
    Inactive,
    Waiting,
    Coasting,
}

impl std::fmt::Display for StopPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactive => write!(f, "INACTIVE"),
            Self::Waiting => write!(f, "WAITING"),
            Self::Coasting => write!(f, "COASTING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Init,
    SetpointChange,
    NoSession,
    TooColdSafety,
    TooCold,
    SavingsTooSmall,
    SessionEnded,
    Waiting,
    Coasting,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::SetpointChange => "setpoint_change",
            Self::NoSession => "no_session",
            Self::TooColdSafety => "too_cold_safety",
            Self::TooCold => "too_cold",
            Self::SavingsTooSmall => "savings_too_small",
            Self::SessionEnded => "session_ended",
            Self::Waiting => "waiting",
            Self::Coasting => "coasting",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Inputs
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct StopSettings {
    /// Kelvin the zone may fall below target by session end.
    pub tolerance: f64,
    pub max_coast_hours: f64,
}

/// Per-cycle inputs.
#[derive(Debug, Clone, Copy)]
pub struct StopInput {
    pub indoor: f64,
    pub target: f64,
    pub session_end: Option<DateTime<Utc>>,
    pub tau_hours: f64,
}

/// Diagnostic view, published with every decision trace.
#[derive(Debug, Clone, Serialize)]
pub struct OptimalStopSnapshot {
    pub phase: StopPhase,
    pub active: bool,
    pub reason: StopReason,
    pub stop_time: Option<DateTime<Utc>>,
    pub session_end: Option<DateTime<Utc>>,
    pub savings_total_min: f64,
    pub savings_remaining_min: f64,
    pub target_floor: Option<f64>,
    /// Outdoor temperature assumed over the coast window.
    pub forecast_used: Option<f64>,
    /// Indoor temperature expected at session end if coasting now.
    pub predicted_end_temp: Option<f64>,
}

// =============================================================================
// OptimalStopEngine
// =============================================================================

#[derive(Debug, Clone)]
pub struct OptimalStopEngine {
    settings: StopSettings,
    phase: StopPhase,
    reason: StopReason,
    stop_time: Option<DateTime<Utc>>,
    session_end: Option<DateTime<Utc>>,
    savings_total: f64,
    savings_remaining: f64,
    schedule_off_since: Option<DateTime<Utc>>,
    last_target: Option<f64>,
    target_floor: Option<f64>,
    forecast_used: Option<f64>,
    predicted_end_temp: Option<f64>,
}

impl OptimalStopEngine {
    pub fn new(settings: StopSettings) -> Self {
        Self {
            settings,
            phase: StopPhase::Inactive,
            reason: StopReason::Init,
            stop_time: None,
            session_end: None,
            savings_total: 0.0,
            savings_remaining: 0.0,
            schedule_off_since: None,
            last_target: None,
            target_floor: None,
            forecast_used: None,
            predicted_end_temp: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase == StopPhase::Coasting
    }

    pub fn phase(&self) -> StopPhase {
        self.phase
    }

    pub fn reason(&self) -> StopReason {
        self.reason
    }

    pub fn savings_total(&self) -> f64 {
        self.savings_total
    }

    pub fn savings_remaining(&self) -> f64 {
        self.savings_remaining
    }

    /// Evaluate one cycle.  `outdoor_over(start, end)` returns the effective
    /// outdoor temperature for the window.  Returns whether heating should be
    /// stopped (coasting).
    pub fn update<F>(&mut self, input: &StopInput, now: DateTime<Utc>, outdoor_over: F) -> bool
    where
        F: Fn(DateTime<Utc>, DateTime<Utc>) -> f64,
    {
        // ── 1. Setpoint tracking ───────────────────────────────────────
        let target_changed = self
            .last_target
            .is_some_and(|last| (input.target - last).abs() > SETPOINT_CHANGE_K + SETPOINT_EPSILON);
        self.last_target = Some(input.target);
        if target_changed {
            info!(target = input.target, "Optimal stop reset: setpoint changed");
            self.reset(StopReason::SetpointChange);
            return false;
        }

        let floor = input.target - self.settings.tolerance;
        self.target_floor = Some(floor);

        // ── 2. Safety break (independent of the latch) ─────────────────
        if input.indoor < floor - SAFETY_MARGIN_K {
            let reason = if self.phase == StopPhase::Coasting {
                warn!(
                    indoor = format!("{:.2}", input.indoor),
                    floor = format!("{:.2}", floor),
                    "Optimal stop safety break: zone too cold while coasting"
                );
                StopReason::TooColdSafety
            } else {
                StopReason::TooCold
            };
            self.reset(reason);
            return false;
        }

        // ── 3. Session end ─────────────────────────────────────────────
        let Some(session_end) = input.session_end else {
            if self.phase == StopPhase::Coasting {
                let since = *self.schedule_off_since.get_or_insert(now);
                if now - since <= Duration::seconds(LATCH_RESET_DEBOUNCE_SECS) {
                    debug!("Session end missing, coast latch held");
                    return true;
                }
                info!("Session end missing beyond debounce, coast released");
            }
            self.reset(StopReason::NoSession);
            return false;
        };
        self.schedule_off_since = None;
        if now >= session_end {
            if self.phase == StopPhase::Coasting {
                info!(session_end = %session_end, "Session end passed, coast released");
            }
            self.reset(StopReason::SessionEnded);
            return false;
        }
        self.session_end = Some(session_end);

        // ── 4. Coast computation ───────────────────────────────────────
        let outdoor = outdoor_over(now, session_end);
        let coast = coast_duration(
            input.indoor,
            floor,
            outdoor,
            input.tau_hours,
            self.settings.max_coast_hours * 60.0,
        );
        let to_end_min = (session_end - now).num_seconds() as f64 / 60.0;

        self.forecast_used = Some(outdoor);
        self.predicted_end_temp = Some(newton_cooling(
            input.indoor,
            outdoor,
            input.tau_hours,
            to_end_min.max(0.0),
        ));
        self.savings_total = coast;
        self.savings_remaining = to_end_min.min(coast).max(0.0);

        if self.phase == StopPhase::Coasting {
            self.reason = StopReason::Coasting;
            return true;
        }

        let computed_stop = session_end - Duration::seconds((coast * 60.0).round() as i64);
        self.stop_time = Some(computed_stop);

        if coast < MIN_SAVINGS_MINUTES {
            self.phase = StopPhase::Waiting;
            self.reason = StopReason::SavingsTooSmall;
            return false;
        }

        if now >= computed_stop {
            self.phase = StopPhase::Coasting;
            self.reason = StopReason::Coasting;
            info!(
                stop_time = %computed_stop,
                session_end = %session_end,
                savings_min = format!("{:.1}", coast),
                outdoor = format!("{:.1}", outdoor),
                "Optimal stop engaged, coasting to session end"
            );
            return true;
        }

        self.phase = StopPhase::Waiting;
        self.reason = StopReason::Waiting;
        false
    }

    pub fn snapshot(&self) -> OptimalStopSnapshot {
        OptimalStopSnapshot {
            phase: self.phase,
            active: self.is_active(),
            reason: self.reason,
            stop_time: self.stop_time,
            session_end: self.session_end,
            savings_total_min: self.savings_total,
            savings_remaining_min: self.savings_remaining,
            target_floor: self.target_floor,
            forecast_used: self.forecast_used,
            predicted_end_temp: self.predicted_end_temp,
        }
    }

    fn reset(&mut self, reason: StopReason) {
        self.phase = StopPhase::Inactive;
        self.reason = reason;
        self.stop_time = None;
        self.session_end = None;
        self.savings_total = 0.0;
        self.savings_remaining = 0.0;
        self.schedule_off_since = None;
        self.forecast_used = None;
        self.predicted_end_temp = None;
    }
}
