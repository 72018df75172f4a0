// =============================================================================
// Preheat Core — Predictive preheat and optimal stop for climate zones
// =============================================================================
//
// Learns when occupants arrive and leave, how fast each zone heats up and
// cools down, and decides when heating should start ahead of an arrival and
// when it may stop ahead of a session end.
//
// Entry points:
//   zone::Zone            one control cycle per snapshot
//   runtime::run_zone     async cycle loop with persistence
//   store::StateStore     where learned state lives between runs
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
pub mod cooling_analyzer;
pub mod decision_trace;
pub mod forecast_cache;
pub mod math;
pub mod optimal_stop;
pub mod patterns;
pub mod physics;
pub mod planner;
pub mod providers;
pub mod runtime;
pub mod runtime_config;
pub mod session;
pub mod store;
pub mod types;
pub mod zone;

pub use runtime_config::ZoneConfig;
pub use zone::{CycleOutput, Zone, ZoneSnapshot};
