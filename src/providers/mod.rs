// =============================================================================
// Providers Module
// =============================================================================
//
// Two sources can tell the zone when the current occupancy session ends:
// - ScheduleProvider: the external schedule entity (authoritative)
// - LearnedDepartureProvider: departure patterns (shadow only)
//
// `arbitrate` merges both into one selection by strict priority, and
// `FrostGuard` forces heating on below the frost floor regardless.

pub mod arbitration;
pub mod decision;
pub mod learned;
pub mod schedule;

pub use arbitration::{arbitrate, Arbitration, FrostGuard, ProviderKind};
pub use decision::{Gate, GateThresholds, InvalidReason, ProviderContext, ProviderDecision, SessionEndProvider};
pub use learned::LearnedDepartureProvider;
pub use schedule::{ScheduleProvider, ScheduleSnapshot};
