// =============================================================================
// Zone Controller — One control cycle per climate zone
// =============================================================================
//
// A `Zone` owns every learner and state machine of one climate zone and turns
// a sensor snapshot into a heating decision:
//
//   snapshot ─▶ sensors ─▶ sessions ─▶ window ─▶ history / cooling
//                                                      │
//        ┌─────────────────────────────────────────────┘
//        ▼
//   next arrival ─▶ duration ─▶ providers / optimal stop / frost / arbitration
//                                                      │
//        ┌─────────────────────────────────────────────┘
//        ▼
//   preheat start / stop (+ learning) ─▶ cadence ─▶ CycleOutput + trace
//
// A cycle never fails outward: any error inside is logged and replaced by a
// safe output (heating off, last known duration).  State that should survive
// a restart is flagged dirty and written by the caller through `to_persisted`.
// =============================================================================

use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::cooling_analyzer::{AnalysisStatus, CoolingAnalyzer};
use crate::decision_trace::{DecisionTrace, ProviderCandidates, ShadowMetrics};
use crate::math::{coast_duration, risk_metric, root_find_duration};
use crate::optimal_stop::{OptimalStopEngine, StopInput, StopSettings};
use crate::patterns::PatternResult;
use crate::physics::{DeadtimeAnalyzer, HistoryBuffer, HistoryPoint, ThermalModel, ThermalModelSnapshot};
use crate::planner::{local_timestamp, PlannerSettings, SchedulePlanner};
use crate::providers::{
    arbitrate, FrostGuard, GateThresholds, LearnedDepartureProvider, ProviderContext,
    ScheduleProvider, ScheduleSnapshot, SessionEndProvider,
};
use crate::runtime_config::ZoneConfig;
use crate::session::OccupancySessionManager;
use crate::store::PersistedState;
use crate::types::ForecastPoint;

// =============================================================================
// Constants
// =============================================================================

/// Indoor readings outside this range are treated as sensor faults.
const PLAUSIBLE_INDOOR: (f64, f64) = (-40.0, 80.0);
/// Outdoor temperature assumed when nothing was ever read.
const DEFAULT_OUTDOOR: f64 = 10.0;
/// Within this many Kelvin of target the zone counts as warm.
const WARM_DELTA_K: f64 = 0.2;
/// Minimum spacing between two window-gradient evaluations, in minutes.
const WINDOW_EVAL_MINUTES: f64 = 4.5;
/// Indoor drop over one evaluation that signals an open window.
const WINDOW_DROP_K: f64 = -0.4;
/// Longer gaps between samples reset the reference instead of evaluating.
const WINDOW_MAX_GAP_MINUTES: f64 = 15.0;
const WINDOW_COOLDOWN_MINUTES: i64 = 30;
const COOLING_ANALYSIS_MINUTES: i64 = 30;
/// Predicted durations beyond the cap plus this margin are reported.
const LIMIT_WARN_MARGIN_MINUTES: f64 = 15.0;
/// An occupied session must last this long before its setpoint is learned.
const COMFORT_SETTLE_MINUTES: i64 = 15;
/// History kept in front of a preheat start for deadtime detection.
const DEADTIME_LEAD_MINUTES: i64 = 30;

const DEFAULT_WORKDAYS: [Weekday; 5] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
];

// =============================================================================
// Inputs & outputs
// =============================================================================

/// Everything the zone reads in one cycle.  Missing readings are `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    pub now: DateTime<Utc>,
    #[serde(default)]
    pub indoor_temp: Option<f64>,
    #[serde(default)]
    pub outdoor_temp: Option<f64>,
    /// Target of the climate entity.
    #[serde(default)]
    pub target_temp: Option<f64>,
    /// Valve opening in percent, if the zone has a valve sensor.
    #[serde(default)]
    pub valve_position: Option<f64>,
    #[serde(default)]
    pub occupied: bool,
    /// Window contact, if any.
    #[serde(default)]
    pub window_open: bool,
    /// The climate entity reports it is heating.
    #[serde(default)]
    pub heating_active: bool,
    /// Manual hold: preheat and stop logic are suspended.
    #[serde(default)]
    pub hold_active: bool,
    #[serde(default)]
    pub schedule: ScheduleSnapshot,
    /// Holidays and absences.
    #[serde(default)]
    pub blocked_dates: HashSet<NaiveDate>,
    /// Workdays reported by a calendar, if any.
    #[serde(default)]
    pub allowed_weekdays: Option<HashSet<Weekday>>,
}

impl ZoneSnapshot {
    /// Snapshot with only a timestamp; everything else absent.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            indoor_temp: None,
            outdoor_temp: None,
            target_temp: None,
            valve_position: None,
            occupied: false,
            window_open: false,
            heating_active: false,
            hold_active: false,
            schedule: ScheduleSnapshot::default(),
            blocked_dates: HashSet::new(),
            allowed_weekdays: None,
        }
    }
}

/// Result of one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutput {
    /// Final heating command for the zone.
    pub heating_on: bool,
    pub preheat_active: bool,
    /// Heating is held off (manual hold or optimal stop).
    pub heating_forced_off: bool,
    pub next_arrival: Option<DateTime<Utc>>,
    pub next_start: Option<DateTime<Utc>>,
    /// Predicted preheat duration in minutes.
    pub predicted_duration: f64,
    pub indoor_temp: Option<f64>,
    pub outdoor_temp: Option<f64>,
    pub target_temp: Option<f64>,
    pub window_open: bool,
    pub optimal_stop_active: bool,
    pub coast_tau: f64,
    pub tau_confidence: f64,
    pub pattern: Option<PatternResult>,
    pub model: ThermalModelSnapshot,
    pub schedule_summary: BTreeMap<String, String>,
    /// Seconds until the next cycle should run.
    pub poll_interval_secs: u64,
    pub trace: DecisionTrace,
}

// =============================================================================
// Window detection
// =============================================================================

/// Detects open windows from a sharp indoor temperature drop.
#[derive(Debug, Clone, Default)]
struct WindowDetector {
    reference: Option<(DateTime<Utc>, f64)>,
    open_until: Option<DateTime<Utc>>,
}

impl WindowDetector {
    /// Feed the indoor temperature; returns whether a window is open.
    fn update(&mut self, indoor: f64, now: DateTime<Utc>) -> bool {
        match self.reference {
            None => self.reference = Some((now, indoor)),
            Some((at, temp)) => {
                let elapsed = (now - at).num_seconds() as f64 / 60.0;
                if elapsed > WINDOW_MAX_GAP_MINUTES {
                    self.reference = Some((now, indoor));
                } else if elapsed >= WINDOW_EVAL_MINUTES {
                    let delta = indoor - temp;
                    if delta < WINDOW_DROP_K {
                        info!(
                            drop = format!("{:.2}", delta),
                            minutes = format!("{:.1}", elapsed),
                            "Open window detected"
                        );
                        self.open_until = Some(now + Duration::minutes(WINDOW_COOLDOWN_MINUTES));
                    }
                    self.reference = Some((now, indoor));
                }
            }
        }

        match self.open_until {
            Some(until) if now < until => true,
            Some(_) => {
                info!("Window cooldown finished");
                self.open_until = None;
                false
            }
            None => false,
        }
    }
}

// =============================================================================
// Preheat session
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct PreheatRun {
    started_at: DateTime<Utc>,
    start_temp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    TargetReached,
    Timeout,
    Occupied,
    WindowOpen,
    Hold,
    Disabled,
    Manual,
}

impl StopCause {
    fn learns(self) -> bool {
        matches!(self, Self::TargetReached | Self::Timeout)
    }
}

impl std::fmt::Display for StopCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TargetReached => "target_reached",
            Self::Timeout => "timeout",
            Self::Occupied => "occupied",
            Self::WindowOpen => "window_open",
            Self::Hold => "hold",
            Self::Disabled => "disabled",
            Self::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Zone
// =============================================================================

pub struct Zone {
    config: ZoneConfig,
    tz: FixedOffset,
    model: ThermalModel,
    cooling: CoolingAnalyzer,
    planner: SchedulePlanner,
    sessions: OccupancySessionManager,
    optimal_stop: OptimalStopEngine,
    history: HistoryBuffer,
    deadtime: DeadtimeAnalyzer,
    frost: FrostGuard,
    window: WindowDetector,
    preheat: Option<PreheatRun>,
    metrics: ShadowMetrics,

    enabled: bool,
    bootstrap_done: bool,
    last_comfort_setpoint: Option<f64>,

    last_indoor: Option<f64>,
    last_outdoor: Option<f64>,
    last_duration: f64,
    last_cooling_analysis: Option<DateTime<Utc>>,
    last_prune_date: Option<NaiveDate>,
    limit_exceeded: bool,
    dirty: bool,
}

impl Zone {
    pub fn new(config: ZoneConfig) -> Self {
        let profile = config.heating_profile;
        let planner = SchedulePlanner::new(PlannerSettings {
            max_entries: config.history_max_entries,
            max_age_days: config.history_max_age_days,
            ..PlannerSettings::default()
        });

        info!(
            zone = %config.name,
            profile = %profile,
            buffer = ?config.resolve_buffer_minutes(),
            max_preheat = ?config.resolve_max_preheat_hours(),
            "Zone initialised"
        );

        Self {
            tz: config.utc_offset(),
            model: ThermalModel::new(profile, config.learning_rate, config.deadtime_trust_min_samples),
            cooling: CoolingAnalyzer::default(),
            planner,
            sessions: OccupancySessionManager::with_debounce_minutes(config.departure_debounce_min),
            optimal_stop: OptimalStopEngine::new(StopSettings {
                tolerance: config.stop_tolerance,
                max_coast_hours: config.max_coast_hours,
            }),
            history: HistoryBuffer::default(),
            deadtime: DeadtimeAnalyzer,
            frost: FrostGuard::new(config.frost_temp, config.frost_hysteresis),
            window: WindowDetector::default(),
            preheat: None,
            metrics: ShadowMetrics::default(),
            enabled: true,
            bootstrap_done: false,
            last_comfort_setpoint: None,
            last_indoor: None,
            last_outdoor: None,
            last_duration: 0.0,
            last_cooling_analysis: None,
            last_prune_date: None,
            limit_exceeded: false,
            dirty: false,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    pub fn planner(&self) -> &SchedulePlanner {
        &self.planner
    }

    pub fn model(&self) -> &ThermalModel {
        &self.model
    }

    pub fn metrics(&self) -> ShadowMetrics {
        self.metrics
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn preheat_active(&self) -> bool {
        self.preheat.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    // ── Commands ───────────────────────────────────────────────────────────

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            info!(zone = %self.config.name, enabled, "Zone enable flag changed");
            self.enabled = enabled;
            self.dirty = true;
        }
    }

    /// Start a preheat run now, regardless of the schedule.  Returns `false`
    /// when one is already running or no indoor reading is known yet.
    pub fn force_preheat(&mut self, now: DateTime<Utc>) -> bool {
        if self.preheat.is_some() {
            return false;
        }
        let Some(indoor) = self.last_indoor else {
            warn!(zone = %self.config.name, "Forced preheat ignored: no indoor reading yet");
            return false;
        };
        self.start_preheat(now, indoor, "manual");
        true
    }

    /// Stop a running preheat without learning from it.
    pub fn stop_preheat(&mut self, now: DateTime<Utc>) -> bool {
        if self.preheat.is_none() {
            return false;
        }
        self.finish_preheat(now, StopCause::Manual, 0.0, 0.0, None, false);
        true
    }

    /// Forget everything the thermal model learned.
    pub fn reset_model(&mut self) {
        let c = &self.config;
        self.model = ThermalModel::new(c.heating_profile, c.learning_rate, c.deadtime_trust_min_samples);
        self.dirty = true;
        info!(zone = %self.config.name, "Thermal model reset");
    }

    /// Forget all arrival and departure history.
    pub fn reset_history(&mut self) {
        self.planner.load_from(&Map::new());
        self.dirty = true;
        info!(zone = %self.config.name, "Occupancy history reset");
    }

    // ── Persistence ────────────────────────────────────────────────────────

    pub fn to_persisted(&self) -> Value {
        let mut root = Map::new();
        PersistedState {
            model: self.model.state(),
            cooling: self.cooling.state(),
            enabled: self.enabled,
            bootstrap_done: self.bootstrap_done,
            last_comfort_setpoint: self.last_comfort_setpoint,
            schema_version: crate::store::SCHEMA_VERSION,
        }
        .write_into(&mut root);
        self.planner.write_into(&mut root);
        Value::Object(root)
    }

    /// Restore learned state.  Unreadable parts fall back to defaults.
    pub fn restore(&mut self, value: &Value) {
        let Some(root) = value.as_object() else {
            warn!(zone = %self.config.name, "Persisted state is not an object, ignored");
            return;
        };

        let state = PersistedState::from_map(root, self.config.heating_profile);
        self.model.restore(state.model);
        self.cooling = CoolingAnalyzer::new(state.cooling);
        self.enabled = state.enabled;
        self.bootstrap_done = state.bootstrap_done;
        self.last_comfort_setpoint = state.last_comfort_setpoint;
        let skipped = self.planner.load_from(root);

        info!(
            zone = %self.config.name,
            mass = format!("{:.2}", state.model.mass_factor),
            loss = format!("{:.2}", state.model.loss_factor),
            tau = format!("{:.2}", state.cooling.learned_tau),
            schema = state.schema_version,
            skipped,
            "Zone state restored"
        );
        if state.schema_version < crate::store::SCHEMA_VERSION {
            self.dirty = true;
        }
    }

    /// Seed arrivals from historical presence transitions, once.
    /// Returns the number of arrivals recorded.
    pub fn bootstrap_from_history(&mut self, transitions: &[(DateTime<Utc>, bool)]) -> usize {
        if self.bootstrap_done {
            debug!(zone = %self.config.name, "Bootstrap already done, skipped");
            return 0;
        }

        let mut sorted = transitions.to_vec();
        sorted.sort_by_key(|(at, _)| *at);

        let mut previous = false;
        let mut recorded = 0;
        for (at, occupied) in sorted {
            if occupied && !previous {
                let local = at.with_timezone(&self.tz);
                if self.in_arrival_window(&local) && self.planner.record_arrival(&local) {
                    recorded += 1;
                }
            }
            previous = occupied;
        }

        self.bootstrap_done = true;
        self.dirty = true;
        info!(zone = %self.config.name, recorded, "Arrival history bootstrapped");
        recorded
    }

    // ── Cycle ──────────────────────────────────────────────────────────────

    /// Run one control cycle.  Never fails: errors become a safe output.
    pub fn run_cycle(&mut self, snap: &ZoneSnapshot, forecasts: Option<&[ForecastPoint]>) -> CycleOutput {
        match self.evaluate(snap, forecasts) {
            Ok(out) => out,
            Err(e) => {
                error!(zone = %self.config.name, error = %e, "Cycle failed, heating off");
                self.fallback_output(snap.now, "cycle_error")
            }
        }
    }

    fn evaluate(&mut self, snap: &ZoneSnapshot, forecasts: Option<&[ForecastPoint]>) -> Result<CycleOutput> {
        let now = snap.now;
        let local_now = now.with_timezone(&self.tz);
        let forecasts = forecasts.filter(|f| self.config.use_forecast && !f.is_empty());

        // ── 1. Sensors ─────────────────────────────────────────────────
        let indoor = match snap
            .indoor_temp
            .filter(|t| *t > PLAUSIBLE_INDOOR.0 && *t < PLAUSIBLE_INDOOR.1)
        {
            Some(t) => {
                self.last_indoor = Some(t);
                t
            }
            None => match self.last_indoor {
                Some(t) => {
                    debug!(zone = %self.config.name, "Indoor reading missing, using last known");
                    t
                }
                None => {
                    warn!(zone = %self.config.name, "Indoor sensor unavailable");
                    return Ok(self.fallback_output(now, "sensor_unavailable"));
                }
            },
        };
        let outdoor = match snap.outdoor_temp.filter(|t| t.is_finite()) {
            Some(t) => {
                self.last_outdoor = Some(t);
                t
            }
            None => self.last_outdoor.unwrap_or(DEFAULT_OUTDOOR),
        };
        let target = self.resolve_target(snap.target_temp);

        // ── 2. Occupancy sessions ──────────────────────────────────────
        let update = self.sessions.update(snap.occupied, now);
        let committed = update
            .committed_departure
            .or_else(|| self.sessions.check_debounce(now));
        if let Some(departed) = committed {
            if self.planner.record_departure(&departed.with_timezone(&self.tz)) {
                self.dirty = true;
            }
        }
        if update.new_session
            && self.in_arrival_window(&local_now)
            && self.planner.record_arrival(&local_now)
        {
            self.dirty = true;
        }
        self.learn_comfort(snap, now);

        // ── 3. Window ──────────────────────────────────────────────────
        let window_open = self.window.update(indoor, now) || snap.window_open;

        // ── 4. History & cooling ───────────────────────────────────────
        let preheating = self.preheat.is_some();
        let valve = snap
            .valve_position
            .unwrap_or(if preheating { 100.0 } else { 0.0 });
        self.history.push(HistoryPoint {
            timestamp: now,
            temp: indoor,
            valve,
            heating: preheating,
        });
        let heating_now = preheating || snap.heating_active || snap.valve_position.is_some_and(|v| v > 0.0);
        self.cooling
            .add_data_point(now, indoor, outdoor, heating_now, window_open);
        self.maybe_analyze_cooling(now);
        self.maybe_prune(local_now.date_naive());

        // ── 5. Next arrival ────────────────────────────────────────────
        let allowed = self.allowed_weekdays(snap);
        let next_arrival = self
            .planner
            .get_next_scheduled_event(&local_now, &snap.blocked_dates, allowed.as_ref())
            .map(|ts| ts.with_timezone(&Utc));
        let pattern = next_arrival.and(self.planner.last_pattern().cloned());

        // ── 6. Duration ────────────────────────────────────────────────
        let delta_in = target - indoor;
        let duration = self.predict_duration(now, delta_in, target, outdoor, forecasts);
        self.last_duration = duration;

        // ── 7. Providers, optimal stop, frost, arbitration ─────────────
        let floor = target - self.config.stop_tolerance;
        let tau = self.cooling.learned_tau();
        let risk_mode = self.config.risk_mode;
        let outdoor_over = |start: DateTime<Utc>, end: DateTime<Utc>| {
            forecasts
                .and_then(|f| risk_metric(f, start, end, risk_mode))
                .unwrap_or(outdoor)
        };

        let mut ctx = ProviderContext {
            now,
            tz: self.tz,
            schedule: &snap.schedule,
            anchor_session_end: None,
            potential_savings: coast_duration(
                indoor,
                floor,
                outdoor,
                tau,
                self.config.max_coast_hours * 60.0,
            ),
            tau_confidence: self.cooling.confidence(),
            blocked_dates: &snap.blocked_dates,
            allowed_weekdays: allowed.as_ref(),
        };
        let mut schedule = ScheduleProvider.decide(&ctx);
        ctx.anchor_session_end = schedule.session_end.filter(|_| schedule.is_valid);

        let mut coasting = false;
        if self.config.enable_optimal_stop {
            let input = StopInput {
                indoor,
                target,
                session_end: ctx.anchor_session_end,
                tau_hours: tau,
            };
            coasting = self.optimal_stop.update(&input, now, outdoor_over);
            schedule.should_stop = coasting;
            if schedule.is_valid {
                schedule.predicted_savings = Some(self.optimal_stop.savings_total());
            }
        }

        let gates = GateThresholds {
            min_savings: self.config.gate_min_savings,
            min_tau_confidence: self.config.gate_min_tau_confidence,
            min_pattern_confidence: self.config.gate_min_pattern_confidence,
        };
        let learned = LearnedDepartureProvider::new(&self.planner, gates).decide(&ctx);

        let frost = self.frost.update(indoor);
        let arbitration = arbitrate(snap.hold_active, &schedule, &learned, indoor, floor);
        self.metrics.record(&arbitration, &learned);
        if arbitration.shadow_safety_violation {
            warn!(
                zone = %self.config.name,
                indoor = format!("{:.1}", indoor),
                floor = format!("{:.1}", floor),
                violations = self.metrics.safety_violations,
                "Shadow provider would have stopped below comfort floor"
            );
        }

        // ── 8. Preheat actuation ───────────────────────────────────────
        let buffer = self.config.resolve_buffer_minutes().value;
        let next_start = match next_arrival {
            Some(event) => Some(self.preheat_start(event, duration, buffer)?),
            None => None,
        };

        let mut should_start = match (next_start, next_arrival) {
            (Some(start), Some(event)) => start <= now && now < event,
            _ => false,
        };
        if window_open
            || (self.config.dont_start_if_warm && delta_in < WARM_DELTA_K)
            || snap.occupied
            || !self.enabled
            || snap.hold_active
            || coasting
        {
            should_start = false;
        }

        let mut start_reason = None;
        if should_start && self.preheat.is_none() {
            self.start_preheat(now, indoor, "predicted_arrival");
            start_reason = Some("predicted_arrival".to_string());
        } else if let Some(run) = self.preheat {
            let max_minutes = self.config.resolve_max_preheat_hours().value * 60.0;
            let runtime = (now - run.started_at).num_seconds() as f64 / 60.0;
            let cause = if delta_in <= WARM_DELTA_K {
                Some(StopCause::TargetReached)
            } else if snap.occupied {
                Some(StopCause::Occupied)
            } else if runtime > max_minutes {
                Some(StopCause::Timeout)
            } else if window_open {
                Some(StopCause::WindowOpen)
            } else if snap.hold_active {
                Some(StopCause::Hold)
            } else if !self.enabled {
                Some(StopCause::Disabled)
            } else {
                None
            };
            if let Some(cause) = cause {
                self.finish_preheat(now, cause, indoor, target - outdoor, snap.valve_position, window_open);
            }
        }

        let preheat_active = self.preheat.is_some();
        let heating_on = frost || (preheat_active && !arbitration.should_stop);

        // ── 9. Cadence ─────────────────────────────────────────────────
        let approaching = next_start
            .is_some_and(|s| s - now <= Duration::minutes(self.config.approach_window_min));
        let fast = snap.occupied || preheat_active || window_open || approaching || coasting;
        let poll_interval_secs = if fast {
            self.config.fast_poll_secs
        } else {
            self.config.slow_poll_secs
        };

        // ── Trace ──────────────────────────────────────────────────────
        let mut trace = DecisionTrace::new(
            self.config.name.clone(),
            now,
            &arbitration,
            ProviderCandidates { schedule, learned },
            self.metrics,
        );
        trace.frost_override = frost;
        trace.heating_on = heating_on;
        trace.start_reason = start_reason;
        if self.config.enable_optimal_stop {
            trace.optimal_stop = Some(self.optimal_stop.snapshot());
        }

        debug!(
            zone = %self.config.name,
            indoor = format!("{:.2}", indoor),
            target = format!("{:.1}", target),
            duration = format!("{:.0}", duration),
            provider = %arbitration.selected,
            heating_on,
            poll = poll_interval_secs,
            "Cycle evaluated"
        );

        Ok(CycleOutput {
            heating_on,
            preheat_active,
            heating_forced_off: arbitration.should_stop && !frost,
            next_arrival,
            next_start,
            predicted_duration: duration,
            indoor_temp: Some(indoor),
            outdoor_temp: Some(outdoor),
            target_temp: Some(target),
            window_open,
            optimal_stop_active: coasting,
            coast_tau: tau,
            tau_confidence: self.cooling.confidence(),
            pattern,
            model: self.model.snapshot(),
            schedule_summary: self.planner.schedule_summary(),
            poll_interval_secs,
            trace,
        })
    }

    // ── Cycle helpers ──────────────────────────────────────────────────────

    /// Climate target if it is a comfort value, else the last learned
    /// comfort setpoint, else the configured fallback.
    fn resolve_target(&self, climate_target: Option<f64>) -> f64 {
        climate_target
            .filter(|t| t.is_finite() && *t >= self.config.comfort_min)
            .or(self.last_comfort_setpoint)
            .unwrap_or(self.config.comfort_fallback)
    }

    fn learn_comfort(&mut self, snap: &ZoneSnapshot, now: DateTime<Utc>) {
        let Some(started) = self.sessions.session_start() else {
            return;
        };
        if !snap.occupied || now - started < Duration::minutes(COMFORT_SETTLE_MINUTES) {
            return;
        }
        let Some(target) = snap
            .target_temp
            .filter(|t| t.is_finite() && *t >= self.config.comfort_min)
        else {
            return;
        };
        if self.last_comfort_setpoint != Some(target) {
            info!(zone = %self.config.name, setpoint = target, "Comfort setpoint learned");
            self.last_comfort_setpoint = Some(target);
            self.dirty = true;
        }
    }

    fn in_arrival_window(&self, local: &DateTime<FixedOffset>) -> bool {
        let minute = local.hour() * 60 + local.minute();
        minute >= self.config.arrival_window_start && minute < self.config.arrival_window_end
    }

    fn allowed_weekdays(&self, snap: &ZoneSnapshot) -> Option<HashSet<Weekday>> {
        if !self.config.only_on_workdays {
            return None;
        }
        Some(
            snap.allowed_weekdays
                .clone()
                .unwrap_or_else(|| DEFAULT_WORKDAYS.into_iter().collect()),
        )
    }

    fn maybe_analyze_cooling(&mut self, now: DateTime<Utc>) {
        let due = self
            .last_cooling_analysis
            .map_or(true, |at| now - at >= Duration::minutes(COOLING_ANALYSIS_MINUTES));
        if !due {
            return;
        }
        self.last_cooling_analysis = Some(now);
        let report = self.cooling.analyze();
        if matches!(report.status, AnalysisStatus::Updated | AnalysisStatus::Clamped) {
            self.dirty = true;
        }
    }

    fn maybe_prune(&mut self, today: NaiveDate) {
        if self.last_prune_date == Some(today) {
            return;
        }
        self.last_prune_date = Some(today);
        if self.planner.prune_all_history(today) > 0 {
            self.dirty = true;
        }
    }

    fn predict_duration(
        &mut self,
        now: DateTime<Utc>,
        delta_in: f64,
        target: f64,
        outdoor: f64,
        forecasts: Option<&[ForecastPoint]>,
    ) -> f64 {
        let max_minutes = self.config.resolve_max_preheat_hours().value * 60.0;

        let duration = match forecasts {
            Some(points) => {
                let mode = self.config.risk_mode;
                let model = &self.model;
                let eval = |d: f64| {
                    let end = now + Duration::seconds((d * 60.0).round() as i64);
                    let t_out = risk_metric(points, now, end, mode).unwrap_or(outdoor);
                    model.calculate_duration(delta_in, target - t_out) - d
                };
                let d = root_find_duration(eval, max_minutes);
                let horizon = points.last().map(|p| p.timestamp);
                let end = now + Duration::seconds((d * 60.0).round() as i64);
                if d > LIMIT_WARN_MARGIN_MINUTES && horizon.is_some_and(|h| end > h) {
                    debug!(zone = %self.config.name, "Forecast extrapolated beyond horizon");
                }
                d
            }
            None => self.model.calculate_duration(delta_in, target - outdoor),
        };

        let exceeded = duration > max_minutes + LIMIT_WARN_MARGIN_MINUTES;
        if exceeded && !self.limit_exceeded {
            warn!(
                zone = %self.config.name,
                predicted_h = format!("{:.1}", duration / 60.0),
                limit_h = format!("{:.1}", max_minutes / 60.0),
                "Predicted preheat exceeds configured limit"
            );
        }
        self.limit_exceeded = exceeded;
        duration
    }

    /// Start time for an arrival: duration plus buffer ahead of it, never
    /// before the earliest start after local midnight of the arrival day.
    fn preheat_start(&self, event: DateTime<Utc>, duration: f64, buffer: f64) -> Result<DateTime<Utc>> {
        let lead = Duration::seconds(((duration + buffer) * 60.0).round() as i64);
        let event_date = event.with_timezone(&self.tz).date_naive();
        let midnight = local_timestamp(&self.tz, event_date, 0)
            .with_context(|| format!("local midnight of {event_date} not representable"))?;
        let earliest =
            midnight.with_timezone(&Utc) + Duration::minutes(i64::from(self.config.earliest_start_minutes));
        Ok((event - lead).max(earliest))
    }

    fn start_preheat(&mut self, now: DateTime<Utc>, indoor: f64, reason: &str) {
        self.preheat = Some(PreheatRun {
            started_at: now,
            start_temp: indoor,
        });
        info!(
            zone = %self.config.name,
            temp = format!("{:.1}", indoor),
            reason,
            "Preheat STARTED"
        );
    }

    fn finish_preheat(
        &mut self,
        now: DateTime<Utc>,
        cause: StopCause,
        end_temp: f64,
        delta_out: f64,
        valve_now: Option<f64>,
        window_open: bool,
    ) {
        let Some(run) = self.preheat.take() else {
            return;
        };
        let minutes = (now - run.started_at).num_seconds() as f64 / 60.0;
        info!(
            zone = %self.config.name,
            cause = %cause,
            minutes = format!("{:.1}", minutes),
            "Preheat STOPPED"
        );

        if !cause.learns() {
            return;
        }
        if window_open {
            info!(zone = %self.config.name, "Learning skipped: window open");
            return;
        }

        let window = self
            .history
            .since(run.started_at - Duration::minutes(DEADTIME_LEAD_MINUTES));
        if let Some(measured) = self.deadtime.analyze(&window) {
            self.model.update_deadtime(measured);
            self.dirty = true;
        }

        let valve = self
            .history
            .average_valve(run.started_at, now)
            .or(valve_now);
        if self
            .model
            .update_model(minutes, end_temp - run.start_temp, delta_out, valve)
        {
            self.dirty = true;
        }
    }

    fn fallback_output(&self, now: DateTime<Utc>, reason: &str) -> CycleOutput {
        CycleOutput {
            heating_on: false,
            preheat_active: false,
            heating_forced_off: false,
            next_arrival: None,
            next_start: None,
            predicted_duration: self.last_duration,
            indoor_temp: self.last_indoor,
            outdoor_temp: self.last_outdoor,
            target_temp: None,
            window_open: false,
            optimal_stop_active: false,
            coast_tau: self.cooling.learned_tau(),
            tau_confidence: self.cooling.confidence(),
            pattern: None,
            model: self.model.snapshot(),
            schedule_summary: BTreeMap::new(),
            poll_interval_secs: self.config.fast_poll_secs,
            trace: DecisionTrace::fallback(self.config.name.clone(), now, reason),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn snapshot(now: DateTime<Utc>, indoor: f64, occupied: bool) -> ZoneSnapshot {
        ZoneSnapshot {
            indoor_temp: Some(indoor),
            outdoor_temp: Some(5.0),
            target_temp: Some(21.0),
            occupied,
            ..ZoneSnapshot::at(now)
        }
    }

    /// Arrive 08:00 and leave 17:00 on four consecutive Mondays
    /// (2024-01-01 is a Monday).
    fn zone_with_four_mondays() -> Zone {
        let mut zone = Zone::new(ZoneConfig::default());
        for week in 0..4 {
            let day = 1 + week * 7;
            zone.run_cycle(&snapshot(at(2024, 1, day, 7, 55), 21.0, false), None);
            zone.run_cycle(&snapshot(at(2024, 1, day, 8, 0), 21.0, true), None);
            zone.run_cycle(&snapshot(at(2024, 1, day, 17, 0), 21.0, false), None);
            zone.run_cycle(&snapshot(at(2024, 1, day, 17, 20), 21.0, false), None);
        }
        zone
    }

    #[test]
    fn four_mondays_predict_next_monday_from_sunday_evening() {
        let mut zone = zone_with_four_mondays();
        assert_eq!(zone.planner().arrivals(0).len(), 4);
        assert_eq!(zone.planner().departures(0).len(), 4);

        let out = zone.run_cycle(&snapshot(at(2024, 1, 28, 20, 0), 21.0, false), None);
        assert_eq!(out.next_arrival, Some(at(2024, 1, 29, 8, 0)));
        assert!(zone.is_dirty());
    }

    #[test]
    fn preheat_starts_before_arrival_and_learns_on_target() {
        let mut zone = zone_with_four_mondays();

        // 15 + 20·3 + 5·16 = 155 min, +10 buffer → start 05:15.
        let out = zone.run_cycle(&snapshot(at(2024, 1, 29, 5, 0), 18.0, false), None);
        assert!(!out.preheat_active);
        assert_eq!(out.next_start, Some(at(2024, 1, 29, 5, 15)));
        assert_eq!(out.poll_interval_secs, 60);

        let mut snap = snapshot(at(2024, 1, 29, 5, 20), 18.0, false);
        snap.valve_position = Some(80.0);
        let out = zone.run_cycle(&snap, None);
        assert!(out.preheat_active);
        assert!(out.heating_on);
        assert_eq!(out.trace.start_reason.as_deref(), Some("predicted_arrival"));

        let mut snap = snapshot(at(2024, 1, 29, 7, 0), 21.0, false);
        snap.valve_position = Some(80.0);
        let out = zone.run_cycle(&snap, None);
        assert!(!out.preheat_active);
        assert_eq!(out.model.sample_count, 1);
    }

    #[test]
    fn occupied_zone_never_starts_preheat() {
        let mut zone = zone_with_four_mondays();
        let out = zone.run_cycle(&snapshot(at(2024, 1, 29, 6, 0), 18.0, true), None);
        assert!(!out.preheat_active);
        assert_eq!(out.poll_interval_secs, 60);
    }

    #[test]
    fn hold_forces_off_but_frost_overrides() {
        let mut zone = Zone::new(ZoneConfig::default());
        let mut snap = snapshot(at(2024, 1, 10, 12, 0), 20.0, false);
        snap.hold_active = true;
        let out = zone.run_cycle(&snap, None);
        assert!(!out.heating_on);
        assert!(out.heating_forced_off);
        assert_eq!(out.trace.provider_selected, ProviderKind::Manual);

        snap.now = at(2024, 1, 10, 12, 1);
        snap.indoor_temp = Some(4.0);
        let out = zone.run_cycle(&snap, None);
        assert!(out.heating_on);
        assert!(out.trace.frost_override);
        assert!(!out.heating_forced_off, "frost overrides the hold");
    }

    /// Flat forecast at `temp` from one hour back to six hours ahead.
    fn flat_forecast(now: DateTime<Utc>, temp: f64) -> Vec<ForecastPoint> {
        (-1..=6)
            .map(|h| ForecastPoint::new(now + Duration::hours(h), temp))
            .collect()
    }

    #[test]
    fn cold_forecast_lengthens_predicted_duration() {
        let now = at(2024, 1, 10, 12, 0);
        let forecast = flat_forecast(now, 0.0);

        // 15 + 20·1 + 5·16 = 115 min from the current 5 °C outdoor reading.
        let mut steady = Zone::new(ZoneConfig::default());
        let out = steady.run_cycle(&snapshot(now, 20.0, false), Some(&forecast));
        assert!((out.predicted_duration - 115.0).abs() < 1e-9, "forecast ignored when disabled");

        // 15 + 20·1 + 5·21 = 140 min against the 0 °C forecast.
        let mut forecasting = Zone::new(ZoneConfig {
            use_forecast: true,
            ..ZoneConfig::default()
        });
        let out = forecasting.run_cycle(&snapshot(now, 20.0, false), Some(&forecast));
        assert!(
            (out.predicted_duration - 140.0).abs() < 1e-6,
            "duration = {}",
            out.predicted_duration
        );
    }

    fn coasting_config() -> ZoneConfig {
        ZoneConfig {
            enable_optimal_stop: true,
            dont_start_if_warm: false,
            ..ZoneConfig::default()
        }
    }

    /// Warm zone with the schedule "on" until `end`.
    fn scheduled_snapshot(now: DateTime<Utc>, end: &str) -> ZoneSnapshot {
        let mut snap = snapshot(now, 21.5, false);
        snap.schedule = ScheduleSnapshot::on(end);
        snap
    }

    #[test]
    fn coasting_engages_near_session_end_and_polls_fast() {
        // 21.5 °C, floor 20.5, outdoor 5, tau 4 h: coast ≈ 15 min → stop 16:45.
        let mut zone = Zone::new(coasting_config());
        let out = zone.run_cycle(&scheduled_snapshot(at(2024, 1, 10, 16, 30), "2024-01-10T17:00:00Z"), None);
        assert!(!out.optimal_stop_active);
        assert!(!out.heating_forced_off);
        assert_eq!(out.poll_interval_secs, 300);

        let out = zone.run_cycle(&scheduled_snapshot(at(2024, 1, 10, 16, 50), "2024-01-10T17:00:00Z"), None);
        assert!(out.optimal_stop_active);
        assert!(out.heating_forced_off);
        assert!(!out.heating_on);
        assert_eq!(out.poll_interval_secs, 60);
        assert_eq!(out.trace.provider_selected, ProviderKind::Schedule);
        let savings = out
            .trace
            .provider_candidates
            .as_ref()
            .and_then(|c| c.schedule.predicted_savings)
            .unwrap();
        assert!((savings - 15.0).abs() < 0.1, "savings = {savings}");
        assert!(out.trace.optimal_stop.is_some_and(|s| s.active));
    }

    #[test]
    fn coasting_suppresses_predicted_start() {
        let mondays = |config: ZoneConfig| {
            let mut zone = Zone::new(config);
            for week in 0..4 {
                let day = 1 + week * 7;
                zone.run_cycle(&snapshot(at(2024, 1, day, 7, 55), 21.0, false), None);
                zone.run_cycle(&snapshot(at(2024, 1, day, 8, 0), 21.0, true), None);
                zone.run_cycle(&snapshot(at(2024, 1, day, 17, 0), 21.0, false), None);
                zone.run_cycle(&snapshot(at(2024, 1, day, 17, 20), 21.0, false), None);
            }
            zone
        };
        let snap = scheduled_snapshot(at(2024, 1, 29, 7, 50), "2024-01-29T08:00:00Z");

        // Without optimal stop the 08:00 arrival starts preheat (start 06:15).
        let mut plain = mondays(ZoneConfig {
            enable_optimal_stop: false,
            ..coasting_config()
        });
        let out = plain.run_cycle(&snap, None);
        assert!(out.preheat_active);

        let mut coasting = mondays(coasting_config());
        let out = coasting.run_cycle(&snap, None);
        assert!(out.optimal_stop_active);
        assert!(!out.preheat_active);
        assert!(!out.heating_on);
    }

    #[test]
    fn missing_sensor_on_first_cycle_is_safe_fallback() {
        let mut zone = Zone::new(ZoneConfig::default());
        let out = zone.run_cycle(&ZoneSnapshot::at(at(2024, 1, 10, 12, 0)), None);
        assert!(!out.heating_on);
        assert_eq!(out.trace.reasons, vec!["sensor_unavailable".to_string()]);

        zone.run_cycle(&snapshot(at(2024, 1, 10, 12, 1), 19.5, false), None);
        let out = zone.run_cycle(&ZoneSnapshot::at(at(2024, 1, 10, 12, 2)), None);
        assert_eq!(out.indoor_temp, Some(19.5));
        assert!(out.trace.provider_candidates.is_some());
    }

    #[test]
    fn eco_target_falls_back_to_comfort() {
        let mut zone = Zone::new(ZoneConfig::default());
        let mut snap = snapshot(at(2024, 1, 10, 12, 0), 18.0, false);
        snap.target_temp = Some(16.0);
        let out = zone.run_cycle(&snap, None);
        assert_eq!(out.target_temp, Some(21.0));
    }

    #[test]
    fn temperature_drop_flags_open_window() {
        let mut zone = Zone::new(ZoneConfig::default());
        zone.run_cycle(&snapshot(at(2024, 1, 10, 12, 0), 20.0, false), None);
        let out = zone.run_cycle(&snapshot(at(2024, 1, 10, 12, 5), 19.4, false), None);
        assert!(out.window_open);
        let out = zone.run_cycle(&snapshot(at(2024, 1, 10, 12, 20), 19.4, false), None);
        assert!(out.window_open);
        let out = zone.run_cycle(&snapshot(at(2024, 1, 10, 12, 40), 19.4, false), None);
        assert!(!out.window_open);
    }

    #[test]
    fn idle_zone_polls_slowly() {
        let mut zone = Zone::new(ZoneConfig::default());
        let out = zone.run_cycle(&snapshot(at(2024, 1, 10, 12, 0), 21.0, false), None);
        assert_eq!(out.next_arrival, None);
        assert_eq!(out.poll_interval_secs, 300);
    }

    #[test]
    fn persisted_state_restores_history_and_flags() {
        let mut zone = zone_with_four_mondays();
        zone.set_enabled(false);
        let saved = zone.to_persisted();

        let mut restored = Zone::new(ZoneConfig::default());
        restored.restore(&saved);
        assert!(!restored.is_enabled());
        assert_eq!(restored.planner().arrivals(0).len(), 4);
        assert_eq!(restored.planner().departures(0).len(), 4);
    }

    #[test]
    fn bootstrap_records_on_edges_once() {
        let mut zone = Zone::new(ZoneConfig::default());
        let transitions = vec![
            (at(2024, 1, 1, 8, 0), true),
            (at(2024, 1, 1, 8, 30), true),
            (at(2024, 1, 1, 17, 0), false),
            (at(2024, 1, 2, 2, 0), true),
            (at(2024, 1, 2, 3, 0), false),
            (at(2024, 1, 8, 8, 5), true),
        ];
        assert_eq!(zone.bootstrap_from_history(&transitions), 2);
        assert_eq!(zone.bootstrap_from_history(&transitions), 0);
        assert_eq!(zone.planner().arrivals(0).len(), 2);
    }

    #[test]
    fn forced_preheat_runs_until_stopped() {
        let mut zone = Zone::new(ZoneConfig::default());
        assert!(!zone.force_preheat(at(2024, 1, 10, 12, 0)));
        zone.run_cycle(&snapshot(at(2024, 1, 10, 12, 0), 18.0, false), None);
        assert!(zone.force_preheat(at(2024, 1, 10, 12, 1)));
        let out = zone.run_cycle(&snapshot(at(2024, 1, 10, 12, 2), 18.1, false), None);
        assert!(out.heating_on);
        assert!(zone.stop_preheat(at(2024, 1, 10, 12, 3)));
        assert!(!zone.preheat_active());
        assert_eq!(zone.model().state().sample_count, 0);
    }
}
