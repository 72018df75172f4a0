// =============================================================================
// Arrival Pattern Detector — Modes, weekly parity and backtesting
// =============================================================================
//
// Input is a per-weekday list of (date, minute-of-day) samples.  Minutes are
// clustered by a simple 1-D gap rule: sorted values stay in the same cluster
// while consecutive gaps are ≤ 45 minutes; clusters with fewer than three
// points are noise.
//
// Two hypotheses are tested against the most recent ten samples:
//
//   1. Single mode:   one cluster explains ≥ 70 % of recent arrivals.
//   2. Weekly parity: odd and even ISO weeks each have their own dominant
//      cluster (≥ 80 % purity), e.g. alternating shift work.
//
// A hypothesis is only accepted when predicting the recent window with it
// scores ≥ 60 % hits.  Otherwise the earliest cluster is used as a
// conservative fallback (heating too early beats arriving to a cold house).
// =============================================================================

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use tracing::debug;

// =============================================================================
// Constants
// =============================================================================

/// Consecutive sorted samples further apart than this start a new cluster.
pub const CLUSTER_GAP_MINUTES: u32 = 45;
/// Clusters smaller than this are discarded as noise.
pub const MIN_CLUSTER_POINTS: usize = 3;
/// Samples needed before any prediction is attempted.
pub const MIN_PREDICTION_POINTS: usize = 4;
/// Size of the recent window used for hypothesis testing.
const RECENT_WINDOW: usize = 10;
/// A recent sample further than this from every cluster is unexplained.
const EXPLAIN_RADIUS_MINUTES: f64 = 60.0;
/// Explained recent samples needed to test a hypothesis.
const MIN_EXPLAINED: usize = 3;
/// Share of explained samples one cluster needs for the single-mode rule.
const SINGLE_MODE_SHARE: f64 = 0.70;
/// Purity each parity needs for the weekly-parity rule.
const PARITY_PURITY: f64 = 0.80;
/// Backtest hit radius and acceptance threshold.
const BACKTEST_HIT_MINUTES: f64 = 30.0;
const BACKTEST_MIN_ACCURACY: f64 = 0.60;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterLabel {
    Early,
    Mid,
    Late,
    Regular,
}

impl std::fmt::Display for ClusterLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Early => write!(f, "early"),
            Self::Mid => write!(f, "mid"),
            Self::Late => write!(f, "late"),
            Self::Regular => write!(f, "regular"),
        }
    }
}

/// A mode of the minute-of-day distribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrivalCluster {
    /// Mean minute-of-day of the members.
    pub center: f64,
    pub count: usize,
    pub std_dev: f64,
    pub label: ClusterLabel,
}

impl ArrivalCluster {
    /// Center rounded to a whole minute.
    pub fn center_minute(&self) -> u32 {
        self.center.round().max(0.0) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    SingleMode,
    WeeklyParity,
    Fallback,
    NoClusters,
    InsufficientData,
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleMode => write!(f, "SINGLE_MODE"),
            Self::WeeklyParity => write!(f, "WEEKLY_PARITY"),
            Self::Fallback => write!(f, "FALLBACK"),
            Self::NoClusters => write!(f, "NO_CLUSTERS"),
            Self::InsufficientData => write!(f, "INSUFFICIENT_DATA"),
        }
    }
}

/// Outcome of one prediction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternResult {
    /// Label of the predicted cluster, if any.
    pub prediction: Option<ClusterLabel>,
    /// Predicted minute-of-day.
    pub prediction_time: Option<u32>,
    pub pattern_type: PatternType,
    /// Backtest accuracy of the accepted hypothesis (0 for fallbacks).
    pub confidence: f64,
    /// Purity of the winning cluster(s) in the recent window.
    pub stability: f64,
    pub fallback_used: bool,
    /// Member count per cluster label.
    pub modes_found: BTreeMap<String, usize>,
}

impl PatternResult {
    fn empty(pattern_type: PatternType) -> Self {
        Self {
            prediction: None,
            prediction_time: None,
            pattern_type,
            confidence: 0.0,
            stability: 0.0,
            fallback_used: true,
            modes_found: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Clustering
// =============================================================================

/// Gap-cluster minute-of-day samples.  Output is sorted by center.
pub fn find_clusters(minutes: &[u32]) -> Vec<ArrivalCluster> {
    cluster_with_min(minutes, MIN_CLUSTER_POINTS)
}

/// Same as [`find_clusters`] but with a configurable noise threshold.
pub(crate) fn cluster_with_min(minutes: &[u32], min_points: usize) -> Vec<ArrivalCluster> {
    let mut sorted = minutes.to_vec();
    sorted.sort_unstable();

    let mut groups: Vec<Vec<u32>> = Vec::new();
    for m in sorted {
        match groups.last_mut() {
            Some(group) if group.last().is_some_and(|&prev| m - prev <= CLUSTER_GAP_MINUTES) => {
                group.push(m)
            }
            _ => groups.push(vec![m]),
        }
    }

    let kept: Vec<Vec<u32>> = groups.into_iter().filter(|g| g.len() >= min_points).collect();
    let n = kept.len();

    kept.iter()
        .enumerate()
        .map(|(i, g)| {
            let count = g.len();
            let mean = g.iter().map(|&m| m as f64).sum::<f64>() / count as f64;
            let var = g.iter().map(|&m| (m as f64 - mean).powi(2)).sum::<f64>() / count as f64;
            let label = match (n, i) {
                (1, _) => ClusterLabel::Regular,
                (_, 0) => ClusterLabel::Early,
                (_, i) if i == n - 1 => ClusterLabel::Late,
                _ => ClusterLabel::Mid,
            };
            ArrivalCluster {
                center: mean,
                count,
                std_dev: var.sqrt(),
                label,
            }
        })
        .collect()
}

// =============================================================================
// ArrivalPatternDetector
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ArrivalPatternDetector;

impl ArrivalPatternDetector {
    /// Predict the minute-of-day for `next_date` from `history`.
    ///
    /// `history` may be in any order; recency is judged by date.
    pub fn predict(&self, history: &[(NaiveDate, u32)], next_date: NaiveDate) -> PatternResult {
        if history.len() < MIN_PREDICTION_POINTS {
            return PatternResult::empty(PatternType::InsufficientData);
        }

        let minutes: Vec<u32> = history.iter().map(|&(_, m)| m).collect();
        let clusters = find_clusters(&minutes);
        if clusters.is_empty() {
            return PatternResult::empty(PatternType::NoClusters);
        }

        let mut modes_found = BTreeMap::new();
        for c in &clusters {
            *modes_found.entry(c.label.to_string()).or_insert(0) += c.count;
        }

        let mut by_date = history.to_vec();
        by_date.sort_by_key(|&(d, _)| d);
        let recent = &by_date[by_date.len().saturating_sub(RECENT_WINDOW)..];

        // (date, minute, cluster index) of explained recent samples.
        let explained: Vec<(NaiveDate, u32, usize)> = recent
            .iter()
            .filter_map(|&(d, m)| nearest_cluster(&clusters, m).map(|idx| (d, m, idx)))
            .collect();

        let fallback = || {
            let earliest = &clusters[0];
            PatternResult {
                prediction: Some(earliest.label),
                prediction_time: Some(earliest.center_minute()),
                pattern_type: PatternType::Fallback,
                confidence: 0.0,
                stability: 0.0,
                fallback_used: true,
                modes_found: modes_found.clone(),
            }
        };

        if explained.len() < MIN_EXPLAINED {
            debug!(explained = explained.len(), "Pattern: too few explained samples");
            return fallback();
        }

        if let Some(result) = single_mode(&clusters, recent, &explained, &modes_found) {
            return result;
        }
        if let Some(result) = weekly_parity(&clusters, recent, &explained, next_date, &modes_found) {
            return result;
        }

        fallback()
    }
}

fn nearest_cluster(clusters: &[ArrivalCluster], minute: u32) -> Option<usize> {
    clusters
        .iter()
        .enumerate()
        .map(|(i, c)| (i, (c.center - minute as f64).abs()))
        .filter(|&(_, dist)| dist <= EXPLAIN_RADIUS_MINUTES)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

fn is_hit(predicted: &ArrivalCluster, actual: u32) -> bool {
    (predicted.center - actual as f64).abs() <= BACKTEST_HIT_MINUTES
}

fn iso_parity(date: NaiveDate) -> u32 {
    date.iso_week().week() % 2
}

fn single_mode(
    clusters: &[ArrivalCluster],
    recent: &[(NaiveDate, u32)],
    explained: &[(NaiveDate, u32, usize)],
    modes_found: &BTreeMap<String, usize>,
) -> Option<PatternResult> {
    let mut counts = vec![0usize; clusters.len()];
    for &(_, _, idx) in explained {
        counts[idx] += 1;
    }
    let (top, &top_count) = counts.iter().enumerate().max_by_key(|&(_, c)| *c)?;
    let share = top_count as f64 / explained.len() as f64;
    if share < SINGLE_MODE_SHARE {
        return None;
    }

    let hits = recent.iter().filter(|&&(_, m)| is_hit(&clusters[top], m)).count();
    let accuracy = hits as f64 / recent.len() as f64;
    if accuracy < BACKTEST_MIN_ACCURACY {
        debug!(
            accuracy = format!("{:.2}", accuracy),
            "Pattern: single mode failed backtest"
        );
        return None;
    }

    Some(PatternResult {
        prediction: Some(clusters[top].label),
        prediction_time: Some(clusters[top].center_minute()),
        pattern_type: PatternType::SingleMode,
        confidence: accuracy,
        stability: share,
        fallback_used: false,
        modes_found: modes_found.clone(),
    })
}

fn weekly_parity(
    clusters: &[ArrivalCluster],
    recent: &[(NaiveDate, u32)],
    explained: &[(NaiveDate, u32, usize)],
    next_date: NaiveDate,
    modes_found: &BTreeMap<String, usize>,
) -> Option<PatternResult> {
    if clusters.len() < 2 {
        return None;
    }

    // Dominant cluster and purity for each parity (0 = even, 1 = odd).
    let mut dominant = [(0usize, 0.0f64); 2];
    for (parity, slot) in dominant.iter_mut().enumerate() {
        let mut counts = vec![0usize; clusters.len()];
        let mut total = 0usize;
        for &(d, _, idx) in explained {
            if iso_parity(d) as usize == parity {
                counts[idx] += 1;
                total += 1;
            }
        }
        if total == 0 {
            return None;
        }
        let (idx, &count) = counts.iter().enumerate().max_by_key(|&(_, c)| *c)?;
        let purity = count as f64 / total as f64;
        if purity < PARITY_PURITY {
            return None;
        }
        *slot = (idx, purity);
    }

    if dominant[0].0 == dominant[1].0 {
        return None;
    }

    let hits = recent
        .iter()
        .filter(|&&(d, m)| is_hit(&clusters[dominant[iso_parity(d) as usize].0], m))
        .count();
    let accuracy = hits as f64 / recent.len() as f64;
    if accuracy < BACKTEST_MIN_ACCURACY {
        debug!(
            accuracy = format!("{:.2}", accuracy),
            "Pattern: weekly parity failed backtest"
        );
        return None;
    }

    let chosen = &clusters[dominant[iso_parity(next_date) as usize].0];
    Some(PatternResult {
        prediction: Some(chosen.label),
        prediction_time: Some(chosen.center_minute()),
        pattern_type: PatternType::WeeklyParity,
        confidence: accuracy,
        stability: dominant[0].1.min(dominant[1].1),
        fallback_used: false,
        modes_found: modes_found.clone(),
    })
}
