// =============================================================================
// Thermal Model — predicted heat-up duration with online learning
// =============================================================================
//
// Duration to lift the zone from its current temperature to target:
//
//   duration = deadtime + mass_factor·ΔT_in + loss_factor·ΔT_out
//
//   ΔT_in  = target − indoor    (K, clamped at 0)
//   ΔT_out = target − outdoor   (K, clamped at 0)
//
// After each completed heating session the observed duration is compared to
// the prediction and the error is split between the mass and loss terms in
// proportion to their share of the prediction.  Noise guards skip sessions
// that carry too little signal (tiny ΔT_in, valve barely open).
//
// Parameters are clamped to the bounds of the zone's heating profile.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{HeatingProfile, ProfileParams};

// =============================================================================
// Constants
// =============================================================================

/// Sessions with a smaller indoor lift carry no usable signal.
pub const MIN_LEARN_DELTA_IN: f64 = 0.2;
/// Below this indoor lift the learning rate is halved.
const SMALL_DELTA_IN: f64 = 0.5;
/// Valve evidence floor: valve must be at least min(15 %, 2·ΔT_in).
const MIN_VALVE_PCT: f64 = 15.0;
/// Smoothing factor of the absolute-error EMA.
const ERROR_EMA_ALPHA: f64 = 0.2;
/// Mass adjustment is only applied above this ΔT_in.
const MASS_ADJUST_MIN_DELTA_IN: f64 = 0.1;
/// Loss adjustment is only applied above this ΔT_out.
const LOSS_ADJUST_MIN_DELTA_OUT: f64 = 1.0;
/// Blend weight of a newly measured deadtime.
const DEADTIME_BLEND_NEW: f64 = 0.2;

const LOSS_MIN: f64 = 0.0;
const LOSS_MAX: f64 = 50.0;
/// Loss factor above this costs health points.
const LOSS_SUSPICIOUS: f64 = 40.0;
/// Average error (minutes) tolerated before health drops.
const HEALTH_ERROR_ALLOWANCE: f64 = 15.0;
/// Sessions needed for full confidence.
const FULL_CONFIDENCE_SAMPLES: f64 = 20.0;
/// Loss factor used before anything has been learned.
const DEFAULT_LOSS: f64 = 5.0;

// =============================================================================
// State
// =============================================================================

/// Persisted learning state of the model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermalModelState {
    /// Minutes per Kelvin of indoor lift.
    pub mass_factor: f64,
    /// Minutes per Kelvin of indoor/outdoor difference.
    pub loss_factor: f64,
    /// Learned deadtime in minutes (0 = nothing learned yet).
    pub deadtime: f64,
    pub sample_count: u32,
    /// EMA of absolute prediction error, in minutes.
    pub avg_error: f64,
}

impl ThermalModelState {
    pub fn for_profile(profile: HeatingProfile) -> Self {
        Self {
            mass_factor: profile.params().default_mass,
            loss_factor: DEFAULT_LOSS,
            deadtime: 0.0,
            sample_count: 0,
            avg_error: 0.0,
        }
    }
}

/// Diagnostic view of the model for traces and the replay summary.
#[derive(Debug, Clone, Serialize)]
pub struct ThermalModelSnapshot {
    pub mass_factor: f64,
    pub loss_factor: f64,
    pub deadtime: f64,
    pub effective_deadtime: f64,
    pub sample_count: u32,
    pub avg_error: f64,
    pub health_score: f64,
    pub confidence: f64,
}

// =============================================================================
// ThermalModel
// =============================================================================

#[derive(Debug, Clone)]
pub struct ThermalModel {
    state: ThermalModelState,
    params: ProfileParams,
    learning_rate: f64,
    deadtime_trust_min_samples: u32,
}

impl ThermalModel {
    pub fn new(profile: HeatingProfile, learning_rate: f64, deadtime_trust_min_samples: u32) -> Self {
        Self {
            state: ThermalModelState::for_profile(profile),
            params: profile.params(),
            learning_rate,
            deadtime_trust_min_samples,
        }
    }

    /// Replace the learning state, e.g. after loading from storage.
    ///
    /// Values are taken as-is so that a model learned under a different
    /// profile shows up in the health score instead of being silently fixed.
    pub fn restore(&mut self, state: ThermalModelState) {
        self.state = state;
    }

    pub fn state(&self) -> ThermalModelState {
        self.state
    }

    /// Deadtime used in predictions.  The profile default wins until enough
    /// sessions have been learned to trust a measured value.
    pub fn effective_deadtime(&self) -> f64 {
        if self.state.deadtime > 0.0 && self.state.sample_count >= self.deadtime_trust_min_samples {
            self.state.deadtime
        } else {
            self.params.deadtime
        }
    }

    /// Predicted minutes to reach target.
    pub fn calculate_duration(&self, delta_in: f64, delta_out: f64) -> f64 {
        let minutes = self.effective_deadtime()
            + self.state.mass_factor * delta_in.max(0.0)
            + self.state.loss_factor * delta_out.max(0.0);
        minutes.max(0.0)
    }

    /// Learn from a completed heating session.  Returns whether the model
    /// changed.
    pub fn update_model(
        &mut self,
        actual_duration: f64,
        delta_in: f64,
        delta_out: f64,
        valve_position: Option<f64>,
    ) -> bool {
        if delta_in < MIN_LEARN_DELTA_IN {
            debug!(
                delta_in = format!("{:.2}", delta_in),
                "Learning skipped: indoor lift too small"
            );
            return false;
        }

        if let Some(valve) = valve_position {
            let required = MIN_VALVE_PCT.min(2.0 * delta_in);
            if valve < required {
                debug!(
                    valve = format!("{:.1}", valve),
                    required = format!("{:.1}", required),
                    "Learning skipped: valve barely open"
                );
                return false;
            }
        }

        let predicted = self.calculate_duration(delta_in, delta_out);
        let error = actual_duration - predicted;

        self.state.avg_error =
            ERROR_EMA_ALPHA * error.abs() + (1.0 - ERROR_EMA_ALPHA) * self.state.avg_error;

        let mut lr = self.learning_rate;
        if delta_in < SMALL_DELTA_IN {
            lr *= 0.5;
        }

        let term_mass = self.state.mass_factor * delta_in.max(0.0);
        let term_loss = self.state.loss_factor * delta_out.max(0.0);
        let total = term_mass + term_loss + 0.001;
        let w_mass = term_mass / total;
        let w_loss = term_loss / total;

        if delta_in > MASS_ADJUST_MIN_DELTA_IN {
            self.state.mass_factor += lr * error * w_mass / delta_in;
        }
        if delta_out > LOSS_ADJUST_MIN_DELTA_OUT {
            self.state.loss_factor += lr * error * w_loss / delta_out;
        }

        self.state.mass_factor = self
            .state
            .mass_factor
            .clamp(self.params.mass_min, self.params.mass_max);
        self.state.loss_factor = self.state.loss_factor.clamp(LOSS_MIN, LOSS_MAX);
        self.state.sample_count += 1;

        info!(
            actual = format!("{:.1}", actual_duration),
            predicted = format!("{:.1}", predicted),
            mass = format!("{:.2}", self.state.mass_factor),
            loss = format!("{:.2}", self.state.loss_factor),
            samples = self.state.sample_count,
            "Thermal model updated"
        );
        true
    }

    /// Fold a measured deadtime into the model.
    pub fn update_deadtime(&mut self, measured: f64) {
        if self.state.deadtime <= 0.0 {
            self.state.deadtime = measured;
        } else {
            self.state.deadtime =
                DEADTIME_BLEND_NEW * measured + (1.0 - DEADTIME_BLEND_NEW) * self.state.deadtime;
        }
        debug!(
            measured = format!("{:.1}", measured),
            deadtime = format!("{:.1}", self.state.deadtime),
            "Deadtime updated"
        );
    }

    /// 0–100 plausibility score of the learned parameters.
    pub fn health_score(&self) -> f64 {
        let mut score = 100.0;
        if self.state.avg_error > HEALTH_ERROR_ALLOWANCE {
            score -= (self.state.avg_error - HEALTH_ERROR_ALLOWANCE) * 2.0;
        }
        if self.state.mass_factor < self.params.mass_min || self.state.mass_factor > self.params.mass_max {
            score -= 20.0;
        }
        if self.state.loss_factor > LOSS_SUSPICIOUS {
            score -= 10.0;
        }
        score.max(0.0)
    }

    /// 0–100, saturating after twenty learned sessions.
    pub fn confidence(&self) -> f64 {
        (self.state.sample_count as f64 / FULL_CONFIDENCE_SAMPLES * 100.0).min(100.0)
    }

    pub fn snapshot(&self) -> ThermalModelSnapshot {
        ThermalModelSnapshot {
            mass_factor: self.state.mass_factor,
            loss_factor: self.state.loss_factor,
            deadtime: self.state.deadtime,
            effective_deadtime: self.effective_deadtime(),
            sample_count: self.state.sample_count,
            avg_error: self.state.avg_error,
            health_score: self.health_score(),
            confidence: self.confidence(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ThermalModel {
        ThermalModel::new(HeatingProfile::RadiatorNew, 0.1, 5)
    }

    #[test]
    fn duration_uses_profile_deadtime_initially() {
        let m = model();
        // 15 deadtime + 20·2 + 5·10
        let d = m.calculate_duration(2.0, 10.0);
        assert!((d - 105.0).abs() < 1e-9, "d = {d}");
    }

    #[test]
    fn duration_is_monotonic_in_both_inputs() {
        let m = model();
        let mut prev = m.calculate_duration(-1.0, 0.0);
        for i in 0..50 {
            let din = -1.0 + i as f64 * 0.2;
            let d = m.calculate_duration(din, 5.0);
            assert!(d >= prev, "not monotonic in delta_in at {din}");
            prev = d;
        }
        let mut prev = m.calculate_duration(2.0, -5.0);
        for i in 0..50 {
            let dout = -5.0 + i as f64 * 0.5;
            let d = m.calculate_duration(2.0, dout);
            assert!(d >= prev, "not monotonic in delta_out at {dout}");
            prev = d;
        }
    }

    #[test]
    fn tiny_lift_is_a_no_op() {
        let mut m = model();
        let before = m.state();
        assert!(!m.update_model(300.0, 0.19, 15.0, Some(100.0)));
        assert_eq!(m.state(), before);
    }

    #[test]
    fn closed_valve_is_a_no_op() {
        let mut m = model();
        let before = m.state();
        assert!(!m.update_model(90.0, 3.0, 15.0, Some(5.0)));
        assert_eq!(m.state(), before);
    }

    #[test]
    fn slower_than_predicted_raises_factors() {
        let mut m = model();
        let before = m.state();
        let predicted = m.calculate_duration(2.0, 12.0);
        assert!(m.update_model(predicted + 60.0, 2.0, 12.0, None));
        let after = m.state();
        assert!(after.mass_factor > before.mass_factor);
        assert!(after.loss_factor > before.loss_factor);
        assert_eq!(after.sample_count, 1);
        assert!(after.avg_error > 0.0);
    }

    #[test]
    fn factors_stay_within_profile_bounds() {
        let mut m = model();
        for _ in 0..200 {
            m.update_model(2000.0, 1.0, 15.0, None);
        }
        let s = m.state();
        assert!(s.mass_factor <= 40.0 + 1e-9);
        assert!(s.loss_factor <= 50.0 + 1e-9);
        for _ in 0..200 {
            m.update_model(0.0, 1.0, 15.0, None);
        }
        let s = m.state();
        assert!(s.mass_factor >= 10.0 - 1e-9);
        assert!(s.loss_factor >= 0.0);
    }

    #[test]
    fn deadtime_first_sets_then_blends() {
        let mut m = model();
        m.update_deadtime(30.0);
        assert!((m.state().deadtime - 30.0).abs() < 1e-9);
        m.update_deadtime(40.0);
        assert!((m.state().deadtime - 32.0).abs() < 1e-9);
    }

    #[test]
    fn learned_deadtime_trusted_only_after_enough_samples() {
        let mut m = model();
        m.update_deadtime(40.0);
        assert!((m.effective_deadtime() - 15.0).abs() < 1e-9);
        let mut state = m.state();
        state.sample_count = 5;
        m.restore(state);
        assert!((m.effective_deadtime() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn health_penalises_error_and_bad_params() {
        let mut m = model();
        m.restore(ThermalModelState {
            mass_factor: 80.0,
            loss_factor: 45.0,
            deadtime: 0.0,
            sample_count: 3,
            avg_error: 25.0,
        });
        // 100 − 20 (error) − 20 (mass) − 10 (loss)
        assert!((m.health_score() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn confidence_saturates_at_twenty_samples() {
        let mut m = model();
        let mut s = m.state();
        s.sample_count = 10;
        m.restore(s);
        assert!((m.confidence() - 50.0).abs() < 1e-9);
        s.sample_count = 40;
        m.restore(s);
        assert!((m.confidence() - 100.0).abs() < 1e-9);
    }
}
