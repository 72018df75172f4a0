// =============================================================================
// Solvers — preheat duration root finding and coast-time inversion
// =============================================================================

/// Grid step of the coarse sign-change search, in minutes.
const GRID_STEP_MINUTES: f64 = 5.0;
/// Bisection refinement iterations after the grid search.
const BISECTION_ITERATIONS: usize = 10;
/// Outdoor must sit at least this far below the floor for coasting to be
/// worth modelling.
const MIN_OUTDOOR_GAP_K: f64 = 2.0;

/// Smallest duration `d` (minutes) with `eval(d) <= 0`.
///
/// `eval(d)` is "required duration if heating started `d` minutes ahead,
/// minus `d`", so it is positive while `d` is too short.  Returns 0 when no
/// time is needed, `max_minutes` when no sign change exists, otherwise the
/// upper bracket after bisection so the result is always sufficient.
pub fn root_find_duration<F>(eval: F, max_minutes: f64) -> f64
where
    F: Fn(f64) -> f64,
{
    if eval(0.0) <= 0.0 {
        return 0.0;
    }

    let mut low = 0.0;
    let mut high = None;
    let mut d = GRID_STEP_MINUTES;
    while d <= max_minutes {
        if eval(d) <= 0.0 {
            high = Some(d);
            break;
        }
        low = d;
        d += GRID_STEP_MINUTES;
    }

    let Some(mut high) = high else {
        return max_minutes;
    };

    for _ in 0..BISECTION_ITERATIONS {
        let mid = (low + high) / 2.0;
        if eval(mid) <= 0.0 {
            high = mid;
        } else {
            low = mid;
        }
    }
    high
}

/// Indoor temperature after coasting `minutes` with no heat input.
pub fn newton_cooling(start: f64, outdoor: f64, tau_hours: f64, minutes: f64) -> f64 {
    if tau_hours <= 0.0 {
        return outdoor;
    }
    outdoor + (start - outdoor) * (-(minutes / 60.0) / tau_hours).exp()
}

/// Minutes the zone can coast from `start` before reaching `floor`.
///
/// Inverse of [`newton_cooling`], clamped to `[0, max_minutes]`.  Zero when
/// already at or below the floor, or when outdoor is too close to the floor.
pub fn coast_duration(start: f64, floor: f64, outdoor: f64, tau_hours: f64, max_minutes: f64) -> f64 {
    if start <= floor || outdoor >= floor - MIN_OUTDOOR_GAP_K || tau_hours <= 0.0 {
        return 0.0;
    }
    let ratio = (floor - outdoor) / (start - outdoor);
    let hours = -tau_hours * ratio.ln();
    (hours * 60.0).clamp(0.0, max_minutes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_zero_when_nothing_required() {
        assert_eq!(root_find_duration(|d| -d, 180.0), 0.0);
    }

    #[test]
    fn root_matches_linear_requirement() {
        // Needs 42 minutes regardless of start offset.
        let d = root_find_duration(|d| 42.0 - d, 180.0);
        assert!(d >= 42.0 && d - 42.0 < 0.01, "d = {d}");
    }

    #[test]
    fn root_saturates_at_max() {
        assert_eq!(root_find_duration(|d| 500.0 - d, 180.0), 180.0);
    }

    #[test]
    fn coast_round_trip() {
        let minutes = coast_duration(22.0, 21.0, 10.0, 4.0, 240.0);
        assert!(minutes > 0.0);
        let end_temp = newton_cooling(22.0, 10.0, 4.0, minutes);
        assert!((end_temp - 21.0).abs() < 1e-6, "end temp {end_temp}");
    }

    #[test]
    fn coast_zero_at_or_below_floor() {
        assert_eq!(coast_duration(21.0, 21.0, 10.0, 4.0, 240.0), 0.0);
        assert_eq!(coast_duration(20.5, 21.0, 10.0, 4.0, 240.0), 0.0);
    }

    #[test]
    fn coast_zero_when_outdoor_near_floor() {
        assert_eq!(coast_duration(22.0, 21.0, 19.5, 4.0, 240.0), 0.0);
    }

    #[test]
    fn coast_clamped_to_max() {
        let minutes = coast_duration(22.0, 21.0, 10.0, 400.0, 240.0);
        assert_eq!(minutes, 240.0);
    }
}
