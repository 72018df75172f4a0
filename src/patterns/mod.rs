// =============================================================================
// Patterns Module
// =============================================================================
//
// Occupancy pattern learning on minute-of-day samples:
// - gap clustering into arrival (or departure) modes
// - single-mode and weekly-parity hypotheses with backtesting

pub mod detector;

pub use detector::{
    find_clusters, ArrivalCluster, ArrivalPatternDetector, ClusterLabel, PatternResult, PatternType,
};
