// =============================================================================
// Cooling Analyzer — Thermal time constant (tau) from free cool-down
// =============================================================================
//
// While neither heating nor an open window disturbs the zone, indoor
// temperature decays exponentially towards outdoor:
//
//   T(t) = T_out + (T_0 − T_out) · e^(−t/tau)
//
// Taking logs makes this a straight line:
//
//   ln(T(t) − T_out) = ln(T_0 − T_out) − t/tau
//
// The analyzer collects samples, cuts them into contiguous undisturbed
// segments, fits each segment by least squares, and combines the per-segment
// tau values weighted by fit confidence.
//
// Stability guard: a single analysis may move tau by at most ±20 %.  If the
// raw estimate jumps further it is clamped and the confidence is cut by 20 %,
// so one odd evening (guests, oven) cannot wreck a well-learned model.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::math::linear_fit;

// =============================================================================
// Constants
// =============================================================================

/// Tau assumed before anything has been learned (hours).
pub const DEFAULT_TAU_HOURS: f64 = 4.0;
/// Samples older than this are dropped.
const BUFFER_MAX_AGE_HOURS: i64 = 24;
/// Contiguous undisturbed samples needed to form a segment.
const MIN_SEGMENT_SAMPLES: usize = 60;
/// Points closer to outdoor than this carry mostly sensor noise.
const MIN_FIT_DELTA_K: f64 = 0.3;
/// Points needed for a segment fit after filtering.
const MIN_FIT_POINTS: usize = 20;
/// Plausible tau range (hours), exclusive.
const TAU_MIN_HOURS: f64 = 0.5;
const TAU_MAX_HOURS: f64 = 48.0;
/// Sample count at which the size component of confidence saturates.
const FULL_CONFIDENCE_POINTS: f64 = 80.0;
/// R² mapped to zero / full confidence.
const R2_FLOOR: f64 = 0.6;
const R2_SPAN: f64 = 0.3;
/// Temperature-domain MAE (K) mapped to zero confidence.
const MAE_CEILING: f64 = 0.2;
/// Commit thresholds.
const COMMIT_MIN_CONFIDENCE: f64 = 0.6;
const COMMIT_MIN_SAMPLES: usize = 60;
/// Max relative change of tau per analysis.
const MAX_TAU_STEP: f64 = 0.20;
/// Confidence multiplier applied when the stability clamp fires.
const CLAMP_CONFIDENCE_PENALTY: f64 = 0.8;

// =============================================================================
// Types
// =============================================================================

/// One sample fed into the analyzer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoolingSample {
    pub timestamp: DateTime<Utc>,
    pub indoor: f64,
    pub outdoor: f64,
    /// `false` when heating or an open window disturbed this sample.
    pub valid: bool,
}

/// Outcome of one analysis pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    NoSegments,
    NoValidFits,
    LowConfidence,
    Updated,
    Clamped,
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSegments => write!(f, "NO_SEGMENTS"),
            Self::NoValidFits => write!(f, "NO_VALID_FITS"),
            Self::LowConfidence => write!(f, "LOW_CONFIDENCE"),
            Self::Updated => write!(f, "UPDATED"),
            Self::Clamped => write!(f, "CLAMPED"),
        }
    }
}

/// Diagnostic report of [`CoolingAnalyzer::analyze`].
#[derive(Debug, Clone, Serialize)]
pub struct CoolingReport {
    pub status: AnalysisStatus,
    /// Aggregated estimate before the stability clamp.
    pub raw_tau: Option<f64>,
    pub confidence: f64,
    pub segments: usize,
    pub total_samples: usize,
}

#[derive(Debug, Clone, Copy)]
struct SegmentFit {
    tau: f64,
    confidence: f64,
    samples: usize,
}

/// Persisted cooling state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoolingModelState {
    pub learned_tau: f64,
    pub confidence: f64,
}

impl Default for CoolingModelState {
    fn default() -> Self {
        Self {
            learned_tau: DEFAULT_TAU_HOURS,
            confidence: 0.0,
        }
    }
}

// =============================================================================
// CoolingAnalyzer
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct CoolingAnalyzer {
    samples: VecDeque<CoolingSample>,
    state: CoolingModelState,
}

impl CoolingAnalyzer {
    pub fn new(state: CoolingModelState) -> Self {
        Self {
            samples: VecDeque::new(),
            state,
        }
    }

    pub fn state(&self) -> CoolingModelState {
        self.state
    }

    pub fn learned_tau(&self) -> f64 {
        self.state.learned_tau
    }

    pub fn confidence(&self) -> f64 {
        self.state.confidence
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Record one sample.  Heating or an open window marks it invalid.
    pub fn add_data_point(
        &mut self,
        timestamp: DateTime<Utc>,
        indoor: f64,
        outdoor: f64,
        heating: bool,
        window_open: bool,
    ) {
        self.samples.push_back(CoolingSample {
            timestamp,
            indoor,
            outdoor,
            valid: !heating && !window_open,
        });

        let cutoff = timestamp - Duration::hours(BUFFER_MAX_AGE_HOURS);
        while self.samples.front().is_some_and(|s| s.timestamp < cutoff) {
            self.samples.pop_front();
        }
    }

    /// Fit tau over the buffered samples and commit it when confident.
    pub fn analyze(&mut self) -> CoolingReport {
        let segments = self.extract_segments();
        if segments.is_empty() {
            debug!(samples = self.samples.len(), "Cooling analysis: no segments");
            return self.report(AnalysisStatus::NoSegments, None, 0.0, 0, 0);
        }

        let fits: Vec<SegmentFit> = segments.iter().filter_map(|s| fit_segment(s)).collect();
        let segment_count = segments.len();
        if fits.is_empty() {
            debug!(segments = segment_count, "Cooling analysis: no valid fits");
            return self.report(AnalysisStatus::NoValidFits, None, 0.0, segment_count, 0);
        }

        let total_samples: usize = fits.iter().map(|f| f.samples).sum();
        let weight: f64 = fits.iter().map(|f| f.confidence).sum();
        let confidence = weight / fits.len() as f64;

        if weight <= 0.0 {
            return self.report(
                AnalysisStatus::LowConfidence,
                None,
                confidence,
                segment_count,
                total_samples,
            );
        }

        let raw_tau = fits.iter().map(|f| f.tau * f.confidence).sum::<f64>() / weight;

        if confidence <= COMMIT_MIN_CONFIDENCE || total_samples <= COMMIT_MIN_SAMPLES {
            debug!(
                tau = format!("{:.2}", raw_tau),
                confidence = format!("{:.2}", confidence),
                samples = total_samples,
                "Cooling analysis: confidence too low to commit"
            );
            return self.report(
                AnalysisStatus::LowConfidence,
                Some(raw_tau),
                confidence,
                segment_count,
                total_samples,
            );
        }

        let previous = self.state.learned_tau;
        let lower = previous * (1.0 - MAX_TAU_STEP);
        let upper = previous * (1.0 + MAX_TAU_STEP);

        let status = if raw_tau < lower || raw_tau > upper {
            let clamped = raw_tau.clamp(lower, upper);
            warn!(
                raw_tau = format!("{:.2}", raw_tau),
                previous = format!("{:.2}", previous),
                clamped = format!("{:.2}", clamped),
                "Cooling tau jump clamped"
            );
            self.state.learned_tau = clamped;
            self.state.confidence = confidence * CLAMP_CONFIDENCE_PENALTY;
            AnalysisStatus::Clamped
        } else {
            self.state.learned_tau = raw_tau;
            self.state.confidence = confidence;
            AnalysisStatus::Updated
        };

        info!(
            tau = format!("{:.2}", self.state.learned_tau),
            confidence = format!("{:.2}", self.state.confidence),
            segments = segment_count,
            samples = total_samples,
            status = %status,
            "Cooling tau learned"
        );

        self.report(
            status,
            Some(raw_tau),
            self.state.confidence,
            segment_count,
            total_samples,
        )
    }

    fn report(
        &self,
        status: AnalysisStatus,
        raw_tau: Option<f64>,
        confidence: f64,
        segments: usize,
        total_samples: usize,
    ) -> CoolingReport {
        CoolingReport {
            status,
            raw_tau,
            confidence,
            segments,
            total_samples,
        }
    }

    /// Contiguous valid runs long enough to fit and actually cooling.
    fn extract_segments(&self) -> Vec<Vec<CoolingSample>> {
        let mut segments = Vec::new();
        let mut current: Vec<CoolingSample> = Vec::new();

        let mut flush = |run: &mut Vec<CoolingSample>| {
            if run.len() >= MIN_SEGMENT_SAMPLES {
                let first = run[0].indoor;
                let last = run[run.len() - 1].indoor;
                if last < first {
                    segments.push(std::mem::take(run));
                    return;
                }
            }
            run.clear();
        };

        for sample in &self.samples {
            if sample.valid {
                current.push(*sample);
            } else {
                flush(&mut current);
            }
        }
        flush(&mut current);

        segments
    }
}

/// Least-squares fit of one segment in the log domain.
fn fit_segment(segment: &[CoolingSample]) -> Option<SegmentFit> {
    let avg_outdoor = segment.iter().map(|s| s.outdoor).sum::<f64>() / segment.len() as f64;
    let t0 = segment.first()?.timestamp;

    let mut xs = Vec::with_capacity(segment.len());
    let mut ys = Vec::with_capacity(segment.len());
    for s in segment {
        let delta = s.indoor - avg_outdoor;
        if delta < MIN_FIT_DELTA_K {
            continue;
        }
        xs.push((s.timestamp - t0).num_seconds() as f64 / 3600.0);
        ys.push(delta.ln());
    }
    if xs.len() < MIN_FIT_POINTS {
        return None;
    }

    let fit = linear_fit(&xs, &ys)?;
    if fit.slope >= 0.0 {
        return None;
    }
    let tau = -1.0 / fit.slope;
    if tau <= TAU_MIN_HOURS || tau >= TAU_MAX_HOURS {
        return None;
    }

    let mut residuals: Vec<f64> = xs
        .iter()
        .zip(&ys)
        .map(|(x, y)| ((fit.slope * x + fit.intercept).exp() - y.exp()).abs())
        .collect();
    residuals.sort_by(|a, b| a.total_cmp(b));
    let mae = residuals[residuals.len() / 2];

    let c_samples = (xs.len() as f64 / FULL_CONFIDENCE_POINTS).min(1.0);
    let c_fit = ((fit.r_squared - R2_FLOOR) / R2_SPAN).clamp(0.0, 1.0);
    let c_mae = ((MAE_CEILING - mae) / MAE_CEILING).clamp(0.0, 1.0);

    Some(SegmentFit {
        tau,
        confidence: c_samples * c_fit * c_mae,
        samples: xs.len(),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 18, 0, 0).unwrap()
    }

    /// One sample per minute of a clean exponential decay.
    fn feed_decay(analyzer: &mut CoolingAnalyzer, start: DateTime<Utc>, tau: f64, minutes: i64) {
        for m in 0..minutes {
            let t = m as f64 / 60.0;
            let indoor = 10.0 + 12.0 * (-t / tau).exp();
            analyzer.add_data_point(start + Duration::minutes(m), indoor, 10.0, false, false);
        }
    }

    #[test]
    fn recovers_tau_from_clean_decay() {
        let mut analyzer = CoolingAnalyzer::default();
        feed_decay(&mut analyzer, t0(), 4.0, 120);
        let report = analyzer.analyze();
        assert_eq!(report.status, AnalysisStatus::Updated);
        assert!(
            (analyzer.learned_tau() - 4.0).abs() <= 0.2,
            "tau = {}",
            analyzer.learned_tau()
        );
        assert!(analyzer.confidence() > 0.8, "confidence = {}", analyzer.confidence());
    }

    #[test]
    fn large_jump_is_clamped_with_penalty() {
        let mut analyzer = CoolingAnalyzer::default();
        feed_decay(&mut analyzer, t0(), 8.0, 120);
        let report = analyzer.analyze();
        assert_eq!(report.status, AnalysisStatus::Clamped);
        assert!((analyzer.learned_tau() - 4.8).abs() < 1e-9);
        assert!(analyzer.confidence() <= 0.8 + 1e-9);
    }

    #[test]
    fn heating_breaks_segments() {
        let mut analyzer = CoolingAnalyzer::default();
        for m in 0..120 {
            let heating = m % 30 == 0;
            analyzer.add_data_point(t0() + Duration::minutes(m), 22.0 - m as f64 * 0.01, 10.0, heating, false);
        }
        let report = analyzer.analyze();
        assert_eq!(report.status, AnalysisStatus::NoSegments);
        assert!((analyzer.learned_tau() - DEFAULT_TAU_HOURS).abs() < 1e-9);
    }

    #[test]
    fn warming_segment_is_ignored() {
        let mut analyzer = CoolingAnalyzer::default();
        for m in 0..90 {
            analyzer.add_data_point(t0() + Duration::minutes(m), 18.0 + m as f64 * 0.01, 10.0, false, false);
        }
        assert_eq!(analyzer.analyze().status, AnalysisStatus::NoSegments);
    }

    #[test]
    fn short_segment_has_low_confidence() {
        let mut analyzer = CoolingAnalyzer::default();
        // 60 samples pass segmentation but stay below the commit threshold.
        feed_decay(&mut analyzer, t0(), 4.0, 60);
        let report = analyzer.analyze();
        assert_eq!(report.status, AnalysisStatus::LowConfidence);
        assert!((analyzer.learned_tau() - DEFAULT_TAU_HOURS).abs() < 1e-9);
    }

    #[test]
    fn old_samples_are_pruned() {
        let mut analyzer = CoolingAnalyzer::default();
        feed_decay(&mut analyzer, t0(), 4.0, 30);
        analyzer.add_data_point(t0() + Duration::hours(30), 20.0, 10.0, false, false);
        assert_eq!(analyzer.sample_count(), 1);
    }
}
