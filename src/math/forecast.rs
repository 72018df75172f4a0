// =============================================================================
// Forecast Math — interpolation, integration and risk percentiles
// =============================================================================
//
// Forecasts arrive as a sorted list of (timestamp, temperature) samples.  The
// controller never needs the raw list: it needs "what will it be at t" and
// "what is the effective temperature over [start, end]".  The effective value
// depends on the risk mode:
//
//   Balanced    → time-weighted mean (trapezoid rule)
//   Pessimistic → P10 of the curve resampled every 5 minutes
//   Optimistic  → P90 of the same curve
//
// Outside the covered range values are clamped to the first / last sample.
// =============================================================================

use chrono::{DateTime, Duration, Utc};

use crate::types::{ForecastPoint, RiskMode};

/// Grid spacing used when a risk percentile needs a uniform curve.
pub const RESAMPLE_STEP_SECS: i64 = 300;

fn seconds(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

/// Linearly interpolated temperature at `at`.  `None` only for an empty list.
pub fn interpolate(points: &[ForecastPoint], at: DateTime<Utc>) -> Option<f64> {
    let first = points.first()?;
    let last = points.last()?;

    if at <= first.timestamp {
        return Some(first.temperature);
    }
    if at >= last.timestamp {
        return Some(last.temperature);
    }

    for pair in points.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if at >= a.timestamp && at <= b.timestamp {
            let span = seconds(b.timestamp - a.timestamp);
            if span <= 0.0 {
                return Some(a.temperature);
            }
            let frac = seconds(at - a.timestamp) / span;
            return Some(a.temperature + frac * (b.temperature - a.temperature));
        }
    }

    Some(last.temperature)
}

/// Time-weighted mean over `[start, end]`.
///
/// Uses interpolated end points plus every sample strictly inside the window.
/// A zero or negative window collapses to the value at `start`.
pub fn integrate(points: &[ForecastPoint], start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
    let start_val = interpolate(points, start)?;
    if start >= end {
        return Some(start_val);
    }
    let end_val = interpolate(points, end)?;

    let mut curve: Vec<(DateTime<Utc>, f64)> = Vec::with_capacity(points.len() + 2);
    curve.push((start, start_val));
    curve.extend(
        points
            .iter()
            .filter(|p| p.timestamp > start && p.timestamp < end)
            .map(|p| (p.timestamp, p.temperature)),
    );
    curve.push((end, end_val));

    let area: f64 = curve
        .windows(2)
        .map(|w| seconds(w[1].0 - w[0].0) * (w[0].1 + w[1].1) / 2.0)
        .sum();

    Some(area / seconds(end - start))
}

/// Uniform resample of the forecast between `start` and `end` (inclusive).
pub fn resample(
    points: &[ForecastPoint],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step: Duration,
) -> Vec<f64> {
    if points.is_empty() || start >= end || step <= Duration::zero() {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut t = start;
    while t <= end {
        if let Some(v) = interpolate(points, t) {
            out.push(v);
        }
        t += step;
    }
    out
}

/// Percentile with linear interpolation between the closest ranks.
/// `pct` is in 0..=100.
pub fn percentile(samples: &[f64], pct: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;

    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Collapse the forecast over a window into a single outdoor temperature.
pub fn risk_metric(
    points: &[ForecastPoint],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    mode: RiskMode,
) -> Option<f64> {
    let pct = match mode {
        RiskMode::Balanced => return integrate(points, start, end),
        RiskMode::Pessimistic => 10.0,
        RiskMode::Optimistic => 90.0,
    };

    let curve = resample(points, start, end, Duration::seconds(RESAMPLE_STEP_SECS));
    percentile(&curve, pct).or_else(|| integrate(points, start, end))
}

/// Fill gaps wider than one hour with linearly interpolated hourly samples.
/// Daily and twice-daily forecasts become usable by the percentile path this way.
pub fn densify_hourly(points: &[ForecastPoint]) -> Vec<ForecastPoint> {
    let Some(last) = points.last() else {
        return Vec::new();
    };

    let hour = Duration::hours(1);
    let mut out = Vec::with_capacity(points.len());
    for pair in points.windows(2) {
        out.push(pair[0]);
        let mut t = pair[0].timestamp + hour;
        while t < pair[1].timestamp {
            if let Some(temp) = interpolate(pair, t) {
                out.push(ForecastPoint::new(t, temp));
            }
            t += hour;
        }
    }
    out.push(*last);
    out
}
