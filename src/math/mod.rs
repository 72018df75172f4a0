// =============================================================================
// Math Module
// =============================================================================
//
// Numerical helpers shared by the thermal model, the cooling analyzer and the
// optimal-stop engine:
// - forecast interpolation, integration, resampling and percentiles
// - monotonic root finding and the closed-form Newton cooling inversion
// - ordinary least-squares line fits

pub mod forecast;
pub mod regression;
pub mod solver;

pub use forecast::{densify_hourly, integrate, interpolate, percentile, resample, risk_metric};
pub use regression::{linear_fit, LinearFit};
pub use solver::{coast_duration, newton_cooling, root_find_duration};
