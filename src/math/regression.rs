// =============================================================================
// Ordinary least-squares line fit
// =============================================================================

/// Result of a `y = slope·x + intercept` fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// Coefficient of determination.  1.0 for a perfect fit.
    pub r_squared: f64,
}

/// Fit a line through `(xs[i], ys[i])`.  `None` for fewer than two points or
/// zero variance in `x`.
pub fn linear_fit(xs: &[f64], ys: &[f64]) -> Option<LinearFit> {
    let len = xs.len().min(ys.len());
    if len < 2 {
        return None;
    }

    let n = len as f64;
    let x_mean = xs[..len].iter().sum::<f64>() / n;
    let y_mean = ys[..len].iter().sum::<f64>() / n;

    // slope = Σ((x-x̄)(y-ȳ)) / Σ((x-x̄)²)
    let mut numerator = 0.0_f64;
    let mut denominator = 0.0_f64;
    for i in 0..len {
        let dx = xs[i] - x_mean;
        numerator += dx * (ys[i] - y_mean);
        denominator += dx * dx;
    }

    if denominator.abs() < f64::EPSILON {
        return None;
    }

    let slope = numerator / denominator;
    let intercept = y_mean - slope * x_mean;

    let mut ss_res = 0.0_f64;
    let mut ss_tot = 0.0_f64;
    for i in 0..len {
        let pred = slope * xs[i] + intercept;
        ss_res += (ys[i] - pred).powi(2);
        ss_tot += (ys[i] - y_mean).powi(2);
    }
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 1.0 };

    Some(LinearFit {
        slope,
        intercept,
        r_squared,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_line_has_unit_r_squared() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys = [1.0, 3.0, 5.0, 7.0];
        let fit = linear_fit(&xs, &ys).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.intercept - 1.0).abs() < 1e-12);
        assert!((fit.r_squared - 1.0).abs() < 1e-12);
    }

    #[test]
    fn degenerate_inputs_return_none() {
        assert!(linear_fit(&[1.0], &[1.0]).is_none());
        assert!(linear_fit(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0]).is_none());
    }
}
