// =============================================================================
// Heating History & Deadtime Detection
// =============================================================================
//
// The history buffer keeps the last ~6 hours of per-cycle samples.  Two
// consumers read it when a preheat session ends:
//
//   - the valve average over the session, which tells the thermal model
//     whether the emitter actually delivered heat;
//   - the deadtime analyzer, which finds the last heating start and fits a
//     tangent through the steepest part of the rise:
//
//        temp
//         │            ╱
//         │          ╱  ← max slope (10-sample window)
//         │        ╱
//         │──────●·········  start temperature
//         │      ↑
//         └──────┴──────────── time
//           start  deadtime
//
//     The tangent crosses the start temperature after `deadtime` minutes.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Samples kept in the buffer (one per minute ≈ 6 hours).
pub const HISTORY_CAPACITY: usize = 360;
/// Minimum samples overall and after the heating start.
const MIN_POINTS: usize = 15;
/// Finite-difference window, in samples.
const SLOPE_WINDOW: usize = 10;
/// Windows shorter than this (minutes) are ignored.
const MIN_WINDOW_MINUTES: f64 = 1.0;
/// Rises flatter than this (K/min) are not a heating response.
const MIN_SLOPE_K_PER_MIN: f64 = 0.005;
/// Plausible deadtime range, in minutes.
const MAX_DEADTIME_MINUTES: f64 = 480.0;

/// One control-cycle sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub temp: f64,
    /// Valve opening in percent.
    pub valve: f64,
    /// Whether preheat was actively heating at this sample.
    pub heating: bool,
}

// =============================================================================
// HistoryBuffer
// =============================================================================

#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    points: VecDeque<HistoryPoint>,
    capacity: usize,
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, point: HistoryPoint) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Samples at or after `since`, oldest first.
    pub fn since(&self, since: DateTime<Utc>) -> Vec<HistoryPoint> {
        self.points
            .iter()
            .filter(|p| p.timestamp >= since)
            .copied()
            .collect()
    }

    /// Mean valve opening over `[start, end]`, `None` without samples.
    pub fn average_valve(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
        let (sum, count) = self
            .points
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp <= end)
            .fold((0.0, 0usize), |(s, c), p| (s + p.valve, c + 1));
        (count > 0).then(|| sum / count as f64)
    }
}

// =============================================================================
// DeadtimeAnalyzer
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct DeadtimeAnalyzer;

impl DeadtimeAnalyzer {
    /// Deadtime in minutes of the most recent heating start, if measurable.
    pub fn analyze(&self, points: &[HistoryPoint]) -> Option<f64> {
        if points.len() < MIN_POINTS {
            return None;
        }

        let start_idx = (1..points.len())
            .rev()
            .find(|&i| points[i].heating && !points[i - 1].heating)?;
        let heat = &points[start_idx..];
        if heat.len() < MIN_POINTS {
            debug!(points = heat.len(), "Deadtime: heating phase too short");
            return None;
        }

        let start_time = heat[0].timestamp;
        let start_temp = heat[0].temp;

        let mut best: Option<(f64, &HistoryPoint)> = None;
        for i in 0..heat.len().saturating_sub(SLOPE_WINDOW) {
            let a = &heat[i];
            let b = &heat[i + SLOPE_WINDOW];
            let dt = minutes_between(a.timestamp, b.timestamp);
            if dt < MIN_WINDOW_MINUTES {
                continue;
            }
            let slope = (b.temp - a.temp) / dt;
            if best.map_or(true, |(s, _)| slope > s) {
                best = Some((slope, a));
            }
        }

        let (slope, tangent_point) = best?;
        if slope < MIN_SLOPE_K_PER_MIN {
            debug!(slope = format!("{:.4}", slope), "Deadtime: no clear rise");
            return None;
        }

        let deadtime = minutes_between(start_time, tangent_point.timestamp)
            + (start_temp - tangent_point.temp) / slope;

        if !(0.0..=MAX_DEADTIME_MINUTES).contains(&deadtime) {
            debug!(
                deadtime = format!("{:.1}", deadtime),
                "Deadtime: outside plausible range"
            );
            return None;
        }

        Some(deadtime)
    }
}

fn minutes_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (b - a).num_seconds() as f64 / 60.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 5, 0, 0).unwrap()
    }

    /// Idle for 10 minutes, then heating starts; temperature flat for
    /// `deadtime` minutes and rising at `rate` K/min afterwards.
    fn heat_up(deadtime: i64, rate: f64, heating_minutes: i64) -> Vec<HistoryPoint> {
        let mut pts = Vec::new();
        for m in -10..0 {
            pts.push(HistoryPoint {
                timestamp: t0() + Duration::minutes(m),
                temp: 18.0,
                valve: 0.0,
                heating: false,
            });
        }
        for m in 0..heating_minutes {
            let temp = if m < deadtime {
                18.0
            } else {
                18.0 + rate * (m - deadtime) as f64
            };
            pts.push(HistoryPoint {
                timestamp: t0() + Duration::minutes(m),
                temp,
                valve: 100.0,
                heating: true,
            });
        }
        pts
    }

    #[test]
    fn detects_radiator_deadtime() {
        let pts = heat_up(30, 0.1, 90);
        let d = DeadtimeAnalyzer.analyze(&pts).unwrap();
        assert!((25.0..=35.0).contains(&d), "deadtime = {d}");
    }

    #[test]
    fn detects_slow_floor_deadtime() {
        let pts = heat_up(120, 0.02, 200);
        let d = DeadtimeAnalyzer.analyze(&pts).unwrap();
        assert!((110.0..=130.0).contains(&d), "deadtime = {d}");
    }

    #[test]
    fn flat_response_is_rejected() {
        let pts = heat_up(30, 0.001, 90);
        assert!(DeadtimeAnalyzer.analyze(&pts).is_none());
    }

    #[test]
    fn no_heating_start_returns_none() {
        let pts: Vec<_> = heat_up(30, 0.1, 90)
            .into_iter()
            .map(|mut p| {
                p.heating = false;
                p
            })
            .collect();
        assert!(DeadtimeAnalyzer.analyze(&pts).is_none());
    }

    #[test]
    fn buffer_is_bounded_and_averages_valve() {
        let mut buf = HistoryBuffer::new(5);
        assert!(buf.is_empty());
        for m in 0..8 {
            buf.push(HistoryPoint {
                timestamp: t0() + Duration::minutes(m),
                temp: 20.0,
                valve: m as f64 * 10.0,
                heating: true,
            });
        }
        assert_eq!(buf.len(), 5);
        // Remaining valves 30..70.
        let avg = buf
            .average_valve(t0(), t0() + Duration::minutes(10))
            .unwrap();
        assert!((avg - 50.0).abs() < 1e-9);
        assert!(buf
            .average_valve(t0() + Duration::hours(5), t0() + Duration::hours(6))
            .is_none());
    }
}
