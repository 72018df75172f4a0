// =============================================================================
// Physics Module
// =============================================================================
//
// Heating-side thermal response of a zone:
// - ThermalModel: deadtime + mass·ΔT_in + loss·ΔT_out duration model with
//   online learning from completed heating sessions
// - HistoryBuffer / DeadtimeAnalyzer: short sample history and detection of
//   the lag between valve opening and the first temperature rise

pub mod deadtime;
pub mod thermal_model;

pub use deadtime::{DeadtimeAnalyzer, HistoryBuffer, HistoryPoint};
pub use thermal_model::{ThermalModel, ThermalModelSnapshot, ThermalModelState};
