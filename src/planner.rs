// =============================================================================
// Schedule Planner — Arrival / departure history and next-event projection
// =============================================================================
//
// Keeps one history bucket per weekday (0 = Monday) for arrivals and for
// departures.  The next arrival is projected by scanning today plus the next
// seven days and picking, per day, a candidate minute-of-day:
//
//   samples < 4        → legacy view only (earliest cluster of all minutes
//                        ever seen for the weekday, any cluster size)
//   4 ≤ samples < 10   → linear blend legacy·(1−w) + detector·w,
//                        w = (n − 4) / (10 − 4)
//   samples ≥ 10       → pattern detector alone
//
// The legacy view is the flat minutes list the older single-list history
// format stored, extended by every dated record.  It stays read-only: new
// samples only ever land in the dated buckets.
//
// Persisted history went through several shapes over time.  Loading accepts
// all of them (integer or string weekday keys, `v3_N` / `v2_N` prefixes,
// entries as `[date, minute]`, `{date, minutes, dst_flag}` or bare minutes)
// and skips malformed entries one by one.
// =============================================================================

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::patterns::detector::{cluster_with_min, MIN_PREDICTION_POINTS};
use crate::patterns::{find_clusters, ArrivalPatternDetector, PatternResult};

// =============================================================================
// Constants
// =============================================================================

/// Days scanned by the lookahead: today plus seven.
pub const LOOKAHEAD_DAYS: i64 = 8;
/// Samples at which the detector starts contributing to the blend.
const BLEND_MIN_SAMPLES: usize = MIN_PREDICTION_POINTS;
/// Samples at which the detector alone decides.
const BLEND_FULL_SAMPLES: usize = 10;
const MINUTES_PER_DAY: u32 = 24 * 60;

const WEEKDAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrivalRecord {
    pub date: NaiveDate,
    pub minute: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartureRecord {
    pub date: NaiveDate,
    pub minute: u32,
    /// Departure fell on a local time that is ambiguous or skipped by a DST
    /// change.  Diagnostic only.
    pub dst_flag: bool,
}

trait Dated {
    fn date(&self) -> NaiveDate;
    fn minute(&self) -> u32;
}

impl Dated for ArrivalRecord {
    fn date(&self) -> NaiveDate {
        self.date
    }
    fn minute(&self) -> u32 {
        self.minute
    }
}

impl Dated for DepartureRecord {
    fn date(&self) -> NaiveDate {
        self.date
    }
    fn minute(&self) -> u32 {
        self.minute
    }
}

/// Retention and de-duplication limits.
#[derive(Debug, Clone, Copy)]
pub struct PlannerSettings {
    /// Same-date samples closer than this are one event.
    pub dedupe_minutes: u32,
    pub max_entries: usize,
    pub max_age_days: i64,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            dedupe_minutes: 15,
            max_entries: 20,
            max_age_days: 90,
        }
    }
}

// =============================================================================
// SchedulePlanner
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct SchedulePlanner {
    arrivals: BTreeMap<u32, Vec<ArrivalRecord>>,
    departures: BTreeMap<u32, Vec<DepartureRecord>>,
    legacy: BTreeMap<u32, Vec<u32>>,
    settings: PlannerSettings,
    detector: ArrivalPatternDetector,
    last_pattern: Option<PatternResult>,
}

fn weekday_index(date: NaiveDate) -> u32 {
    date.weekday().num_days_from_monday()
}

fn minute_of_day<Tz: TimeZone>(at: &DateTime<Tz>) -> u32 {
    let local = at.naive_local();
    local.hour() * 60 + local.minute()
}

pub(crate) fn local_timestamp<Tz: TimeZone>(tz: &Tz, date: NaiveDate, minute: u32) -> Option<DateTime<Tz>> {
    let naive = date.and_hms_opt(minute / 60, minute % 60, 0)?;
    tz.from_local_datetime(&naive).earliest()
}

fn format_minute(minute: u32) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

impl SchedulePlanner {
    pub fn new(settings: PlannerSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn arrivals(&self, weekday: u32) -> &[ArrivalRecord] {
        self.arrivals.get(&weekday).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn departures(&self, weekday: u32) -> &[DepartureRecord] {
        self.departures.get(&weekday).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Pattern result behind the last successful lookahead.
    pub fn last_pattern(&self) -> Option<&PatternResult> {
        self.last_pattern.as_ref()
    }

    pub fn total_arrivals(&self) -> usize {
        self.arrivals.values().map(Vec::len).sum()
    }

    // ── Recording ──────────────────────────────────────────────────────────

    /// Record an arrival.  Returns `false` for a same-day duplicate.
    pub fn record_arrival<Tz: TimeZone>(&mut self, at: &DateTime<Tz>) -> bool {
        let date = at.naive_local().date();
        let minute = minute_of_day(at);
        let dedupe = self.settings.dedupe_minutes;
        let max = self.settings.max_entries;

        let bucket = self.arrivals.entry(weekday_index(date)).or_default();
        if is_duplicate(bucket, date, minute, dedupe) {
            debug!(%date, minute, "Arrival suppressed as duplicate");
            return false;
        }
        bucket.push(ArrivalRecord { date, minute });
        enforce_count(bucket, max);

        info!(%date, time = %format_minute(minute), "Arrival recorded");
        true
    }

    /// Record a committed departure.  Returns `false` for a same-day duplicate.
    pub fn record_departure<Tz: TimeZone>(&mut self, at: &DateTime<Tz>) -> bool {
        let local = at.naive_local();
        let date = local.date();
        let minute = minute_of_day(at);
        let dst_flag = at.timezone().from_local_datetime(&local).single().is_none();
        let dedupe = self.settings.dedupe_minutes;
        let max = self.settings.max_entries;

        let bucket = self.departures.entry(weekday_index(date)).or_default();
        if is_duplicate(bucket, date, minute, dedupe) {
            debug!(%date, minute, "Departure suppressed as duplicate");
            return false;
        }
        bucket.push(DepartureRecord {
            date,
            minute,
            dst_flag,
        });
        enforce_count(bucket, max);

        info!(%date, time = %format_minute(minute), dst_flag, "Departure recorded");
        true
    }

    // ── Arrival projection ─────────────────────────────────────────────────

    /// Next expected arrival strictly after `now`.
    ///
    /// Days in `blocked` (holidays, absences) are skipped, and when
    /// `allowed` is given only those weekdays are considered.
    pub fn get_next_scheduled_event<Tz: TimeZone>(
        &mut self,
        now: &DateTime<Tz>,
        blocked: &HashSet<NaiveDate>,
        allowed: Option<&HashSet<Weekday>>,
    ) -> Option<DateTime<Tz>> {
        let tz = now.timezone();
        let today = now.naive_local().date();

        for offset in 0..LOOKAHEAD_DAYS {
            let day = today + Duration::days(offset);
            if blocked.contains(&day) || allowed.is_some_and(|a| !a.contains(&day.weekday())) {
                continue;
            }

            let (primary, pattern) = self.predict_arrival_minute(day);
            let mut candidates: Vec<(u32, bool)> = primary.map(|m| (m, true)).into_iter().collect();
            if offset == 0 {
                // Today may hold several sessions; an earlier upcoming mode wins.
                candidates.extend(self.legacy_centers(weekday_index(day)).into_iter().map(|m| (m, false)));
            }

            let mut best: Option<(DateTime<Tz>, bool)> = None;
            for (minute, is_primary) in candidates {
                let Some(ts) = local_timestamp(&tz, day, minute) else {
                    continue;
                };
                if ts > *now && best.as_ref().map_or(true, |(b, _)| ts < *b) {
                    best = Some((ts, is_primary));
                }
            }

            if let Some((ts, is_primary)) = best {
                self.last_pattern = if is_primary { pattern } else { None };
                return Some(ts);
            }
        }

        None
    }

    /// Candidate minute for `day` plus the detector result that produced it.
    fn predict_arrival_minute(&self, day: NaiveDate) -> (Option<u32>, Option<PatternResult>) {
        let weekday = weekday_index(day);
        let records = self.arrivals(weekday);
        let n = records.len();
        let legacy = self.legacy_centers(weekday).first().copied();

        if n < BLEND_MIN_SAMPLES {
            return (legacy, None);
        }

        let history: Vec<(NaiveDate, u32)> = records.iter().map(|r| (r.date, r.minute)).collect();
        let result = self.detector.predict(&history, day);
        let detected = result.prediction_time;

        let minute = if n >= BLEND_FULL_SAMPLES {
            detected.or(legacy)
        } else {
            match (legacy, detected) {
                (Some(l), Some(d)) => {
                    let w = (n - BLEND_MIN_SAMPLES) as f64
                        / (BLEND_FULL_SAMPLES - BLEND_MIN_SAMPLES) as f64;
                    Some((l as f64 * (1.0 - w) + d as f64 * w).round() as u32)
                }
                (l, d) => d.or(l),
            }
        };

        (minute, Some(result))
    }

    /// Cluster centers of the legacy single-list view, earliest first.
    fn legacy_centers(&self, weekday: u32) -> Vec<u32> {
        let minutes = self.legacy_minutes(weekday);
        cluster_with_min(&minutes, 1)
            .iter()
            .map(|c| c.center_minute())
            .collect()
    }

    fn legacy_minutes(&self, weekday: u32) -> Vec<u32> {
        let mut minutes = self.legacy.get(&weekday).cloned().unwrap_or_default();
        minutes.extend(self.arrivals(weekday).iter().map(|r| r.minute));
        minutes
    }

    // ── Departure projection ───────────────────────────────────────────────

    /// Predicted departure minute on `date` from that weekday's departures.
    pub fn predict_departure_on(&self, date: NaiveDate) -> Option<(u32, PatternResult)> {
        let records = self.departures(weekday_index(date));
        if records.len() < MIN_PREDICTION_POINTS {
            return None;
        }
        let history: Vec<(NaiveDate, u32)> = records.iter().map(|r| (r.date, r.minute)).collect();
        let result = self.detector.predict(&history, date);
        result.prediction_time.map(|m| (m, result))
    }

    /// Next predicted departure strictly after `now`.
    pub fn next_predicted_departure<Tz: TimeZone>(
        &self,
        now: &DateTime<Tz>,
        blocked: &HashSet<NaiveDate>,
        allowed: Option<&HashSet<Weekday>>,
    ) -> Option<(DateTime<Tz>, PatternResult)> {
        let tz = now.timezone();
        let today = now.naive_local().date();

        for offset in 0..LOOKAHEAD_DAYS {
            let day = today + Duration::days(offset);
            if blocked.contains(&day) || allowed.is_some_and(|a| !a.contains(&day.weekday())) {
                continue;
            }
            let Some((minute, result)) = self.predict_departure_on(day) else {
                continue;
            };
            if let Some(ts) = local_timestamp(&tz, day, minute) {
                if ts > *now {
                    return Some((ts, result));
                }
            }
        }
        None
    }

    // ── Maintenance ────────────────────────────────────────────────────────

    /// Drop records older than the age limit, then enforce the count ceiling.
    /// Returns the number of removed records.
    pub fn prune_all_history(&mut self, today: NaiveDate) -> usize {
        let cutoff = today - Duration::days(self.settings.max_age_days);
        let max = self.settings.max_entries;
        let mut removed = 0;

        for bucket in self.arrivals.values_mut() {
            removed += prune_bucket(bucket, cutoff, max);
        }
        for bucket in self.departures.values_mut() {
            removed += prune_bucket(bucket, cutoff, max);
        }

        if removed > 0 {
            info!(removed, "History pruned");
        }
        removed
    }

    /// Learned arrival modes per weekday, e.g. `"Mon" → "07:30, 17:45"`.
    pub fn schedule_summary(&self) -> BTreeMap<String, String> {
        let mut summary = BTreeMap::new();
        for weekday in 0..7u32 {
            let clusters = find_clusters(&self.legacy_minutes(weekday));
            if clusters.is_empty() {
                continue;
            }
            let times: Vec<String> = clusters
                .iter()
                .map(|c| format_minute(c.center_minute()))
                .collect();
            summary.insert(WEEKDAY_NAMES[weekday as usize].to_string(), times.join(", "));
        }
        summary
    }

    // ── Persistence ────────────────────────────────────────────────────────

    /// Write the planner's keys into a persisted state object.
    pub fn write_into(&self, root: &mut Map<String, Value>) {
        root.insert("arrivals".into(), bucket_map_to_value(&self.arrivals));
        root.insert("departures".into(), bucket_map_to_value(&self.departures));
        root.insert("legacy_arrivals".into(), bucket_map_to_value(&self.legacy));
    }

    /// Load history from a persisted state object, migrating older shapes.
    /// Returns the number of entries skipped as malformed.
    pub fn load_from(&mut self, root: &Map<String, Value>) -> usize {
        self.arrivals.clear();
        self.departures.clear();
        self.legacy.clear();

        let mut skipped = 0;
        for key in ["arrivals", "arrival_history_v2"] {
            if let Some(raw) = root.get(key) {
                skipped += self.load_arrival_value(raw);
            }
        }
        if let Some(raw) = root.get("legacy_arrivals") {
            skipped += self.load_arrival_value(raw);
        }
        if let Some(raw) = root.get("departures") {
            skipped += self.load_departure_value(raw);
        }
        if let Some(raw) = root.get("learned_arrivals") {
            self.migrate_learned_averages(raw);
        }

        let max = self.settings.max_entries;
        for bucket in self.arrivals.values_mut() {
            bucket.sort_by_key(|r| r.date);
            enforce_count(bucket, max);
        }
        for bucket in self.departures.values_mut() {
            bucket.sort_by_key(|r| r.date);
            enforce_count(bucket, max);
        }

        if skipped > 0 {
            warn!(skipped, "Malformed history entries skipped");
        }
        info!(
            arrivals = self.total_arrivals(),
            departures = self.departures.values().map(Vec::len).sum::<usize>(),
            legacy = self.legacy.values().map(Vec::len).sum::<usize>(),
            "History loaded"
        );
        skipped
    }

    fn load_arrival_value(&mut self, raw: &Value) -> usize {
        let Some(obj) = raw.as_object() else {
            warn!("Arrival history is not an object, ignored");
            return 1;
        };
        let mut skipped = 0;
        for (key, entries) in obj {
            let Some((weekday, legacy_key)) = parse_weekday_key(key) else {
                debug!(key = %key, "Unknown history key skipped");
                skipped += 1;
                continue;
            };
            let Some(list) = entries.as_array() else {
                skipped += 1;
                continue;
            };
            for entry in list {
                match parse_entry(entry) {
                    Some(Entry::Dated { date, minute, .. }) if !legacy_key => {
                        self.arrivals
                            .entry(weekday)
                            .or_default()
                            .push(ArrivalRecord { date, minute });
                    }
                    Some(Entry::Dated { minute, .. }) | Some(Entry::Bare(minute)) => {
                        self.legacy.entry(weekday).or_default().push(minute);
                    }
                    None => skipped += 1,
                }
            }
        }
        skipped
    }

    fn load_departure_value(&mut self, raw: &Value) -> usize {
        let Some(obj) = raw.as_object() else {
            warn!("Departure history is not an object, ignored");
            return 1;
        };
        let mut skipped = 0;
        for (key, entries) in obj {
            let Some((weekday, _)) = parse_weekday_key(key) else {
                skipped += 1;
                continue;
            };
            let Some(list) = entries.as_array() else {
                skipped += 1;
                continue;
            };
            for entry in list {
                match parse_entry(entry) {
                    Some(Entry::Dated {
                        date,
                        minute,
                        dst_flag,
                    }) => self.departures.entry(weekday).or_default().push(DepartureRecord {
                        date,
                        minute,
                        dst_flag,
                    }),
                    // Undated departures cannot be bucketed by recency.
                    Some(Entry::Bare(_)) | None => skipped += 1,
                }
            }
        }
        skipped
    }

    /// Oldest format: one average minute per weekday.  Seeds the legacy view.
    fn migrate_learned_averages(&mut self, raw: &Value) {
        let Some(obj) = raw.as_object() else {
            return;
        };
        for (key, value) in obj {
            let Some((weekday, _)) = parse_weekday_key(key) else {
                continue;
            };
            let Some(minute) = value.as_f64().filter(|m| (0.0..MINUTES_PER_DAY as f64).contains(m)) else {
                continue;
            };
            let legacy = self.legacy.entry(weekday).or_default();
            if legacy.is_empty() {
                legacy.push(minute.round() as u32);
                info!(weekday, minute = minute.round(), "Migrated learned arrival average");
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn is_duplicate<R: Dated>(bucket: &[R], date: NaiveDate, minute: u32, window: u32) -> bool {
    bucket
        .iter()
        .any(|r| r.date() == date && r.minute().abs_diff(minute) < window)
}

fn enforce_count<R>(bucket: &mut Vec<R>, max: usize) -> usize {
    let excess = bucket.len().saturating_sub(max);
    bucket.drain(..excess);
    excess
}

fn prune_bucket<R: Dated>(bucket: &mut Vec<R>, cutoff: NaiveDate, max: usize) -> usize {
    let before = bucket.len();
    bucket.retain(|r| r.date() >= cutoff);
    let aged = before - bucket.len();
    aged + enforce_count(bucket, max)
}

fn bucket_map_to_value<R: Serialize>(map: &BTreeMap<u32, Vec<R>>) -> Value {
    let obj: Map<String, Value> = map
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.to_string(), serde_json::to_value(v).unwrap_or(Value::Null)))
        .collect();
    Value::Object(obj)
}

/// Weekday from a persisted key, and whether the key marks legacy data.
fn parse_weekday_key(key: &str) -> Option<(u32, bool)> {
    let key = key.trim();
    let (legacy, rest) = if let Some(rest) = key.strip_prefix("v2_") {
        (true, rest)
    } else if let Some(rest) = key.strip_prefix("v3_") {
        (false, rest)
    } else {
        (false, key)
    };
    let weekday: u32 = rest.trim().parse().ok()?;
    (weekday < 7).then_some((weekday, legacy))
}

enum Entry {
    Dated {
        date: NaiveDate,
        minute: u32,
        dst_flag: bool,
    },
    Bare(u32),
}

fn parse_minute(v: &Value) -> Option<u32> {
    let m = v.as_f64()?;
    (0.0..MINUTES_PER_DAY as f64)
        .contains(&m)
        .then(|| m.round() as u32)
        .filter(|&m| m < MINUTES_PER_DAY)
}

fn parse_date(v: &Value) -> Option<NaiveDate> {
    v.as_str()?.trim().parse().ok()
}

fn parse_entry(v: &Value) -> Option<Entry> {
    match v {
        Value::Number(_) => parse_minute(v).map(Entry::Bare),
        Value::Array(items) if items.len() >= 2 => Some(Entry::Dated {
            date: parse_date(&items[0])?,
            minute: parse_minute(&items[1])?,
            dst_flag: items.get(2).and_then(Value::as_bool).unwrap_or(false),
        }),
        Value::Object(obj) => Some(Entry::Dated {
            date: parse_date(obj.get("date")?)?,
            minute: parse_minute(obj.get("minutes").or_else(|| obj.get("minute"))?)?,
            dst_flag: obj.get("dst_flag").and_then(Value::as_bool).unwrap_or(false),
        }),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, hh, mm, 0).unwrap()
    }

    fn no_blocks() -> HashSet<NaiveDate> {
        HashSet::new()
    }

    /// Four Mondays at 08:00 and four Tuesdays at 09:00 in January 2024.
    fn golden_planner() -> SchedulePlanner {
        let mut p = SchedulePlanner::default();
        for week in 0..4 {
            let monday = 1 + week * 7;
            p.record_arrival(&at(2024, 1, monday, 8, 0));
            p.record_arrival(&at(2024, 1, monday + 1, 9, 0));
        }
        p
    }

    #[test]
    fn sunday_evening_predicts_monday_morning() {
        let mut p = golden_planner();
        // 2024-01-28 is a Sunday.
        let next = p
            .get_next_scheduled_event(&at(2024, 1, 28, 20, 0), &no_blocks(), None)
            .unwrap();
        assert_eq!(next, at(2024, 1, 29, 8, 0));
    }

    #[test]
    fn same_day_before_arrival_predicts_today() {
        let mut p = golden_planner();
        let next = p
            .get_next_scheduled_event(&at(2024, 1, 29, 7, 0), &no_blocks(), None)
            .unwrap();
        assert_eq!(next, at(2024, 1, 29, 8, 0));
    }

    #[test]
    fn after_arrival_moves_to_next_weekday() {
        let mut p = golden_planner();
        let next = p
            .get_next_scheduled_event(&at(2024, 1, 29, 9, 0), &no_blocks(), None)
            .unwrap();
        assert_eq!(next, at(2024, 1, 30, 9, 0));
    }

    #[test]
    fn blocked_and_disallowed_days_are_skipped() {
        let mut p = golden_planner();
        let blocked: HashSet<NaiveDate> = [NaiveDate::from_ymd_opt(2024, 1, 29).unwrap()].into();
        let next = p
            .get_next_scheduled_event(&at(2024, 1, 28, 20, 0), &blocked, None)
            .unwrap();
        assert_eq!(next, at(2024, 1, 30, 9, 0));

        let only_monday: HashSet<Weekday> = [Weekday::Mon].into();
        let next = p
            .get_next_scheduled_event(&at(2024, 1, 29, 9, 0), &no_blocks(), Some(&only_monday))
            .unwrap();
        assert_eq!(next, at(2024, 2, 5, 8, 0));
    }

    #[test]
    fn empty_history_has_no_event() {
        let mut p = SchedulePlanner::default();
        assert!(p
            .get_next_scheduled_event(&at(2024, 1, 28, 20, 0), &no_blocks(), None)
            .is_none());
    }

    #[test]
    fn mature_history_uses_detector() {
        let mut p = SchedulePlanner::default();
        for week in 0..12 {
            let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::weeks(week);
            let ts = Utc.from_utc_datetime(&day.and_hms_opt(7, 30, 0).unwrap());
            p.record_arrival(&ts);
        }
        let next = p
            .get_next_scheduled_event(&at(2024, 3, 24, 12, 0), &no_blocks(), None)
            .unwrap();
        assert_eq!(next, at(2024, 3, 25, 7, 30));
        assert!(p.last_pattern().is_some_and(|r| !r.fallback_used));
    }

    #[test]
    fn earlier_session_today_is_not_skipped() {
        let mut p = SchedulePlanner::default();
        let first_monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        for week in 0..12 {
            let day = first_monday + Duration::weeks(week);
            if week < 3 {
                p.record_arrival(&Utc.from_utc_datetime(&day.and_hms_opt(12, 0, 0).unwrap()));
            }
            p.record_arrival(&Utc.from_utc_datetime(&day.and_hms_opt(18, 0, 0).unwrap()));
        }

        // 2024-03-25 is the Monday after the last recorded one.
        let next = p
            .get_next_scheduled_event(&at(2024, 3, 25, 10, 0), &no_blocks(), None)
            .unwrap();
        assert_eq!(next, at(2024, 3, 25, 12, 0), "midday mode is still ahead");
        assert!(p.last_pattern().is_none(), "legacy center won, no detector result");

        let next = p
            .get_next_scheduled_event(&at(2024, 3, 25, 13, 0), &no_blocks(), None)
            .unwrap();
        assert_eq!(next, at(2024, 3, 25, 18, 0));
        assert!(p.last_pattern().is_some_and(|r| !r.fallback_used));
    }

    #[test]
    fn young_history_blends_legacy_and_detector() {
        // Legacy single-list view seeded with 07:00 on Mondays.
        let root = json!({ "arrivals": { "v2_0": [420] } });
        let mut p = SchedulePlanner::default();
        p.load_from(root.as_object().unwrap());

        // Seven Mondays at 08:05: w = (7 - 4) / (10 - 4) = 0.5.
        let first_monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        for week in 0..7 {
            let day = first_monday + Duration::weeks(week);
            p.record_arrival(&Utc.from_utc_datetime(&day.and_hms_opt(8, 5, 0).unwrap()));
        }
        assert_eq!(p.arrivals(0).len(), 7);

        // 420 * 0.5 + 485 * 0.5 = 452.5, rounded to 453 (07:33).
        // 2024-02-18 is a Sunday.
        let next = p
            .get_next_scheduled_event(&at(2024, 2, 18, 20, 0), &no_blocks(), None)
            .unwrap();
        assert_eq!(next, at(2024, 2, 19, 7, 33));
        assert!(p.last_pattern().is_some_and(|r| r.prediction_time == Some(485)));
    }

    #[test]
    fn same_day_duplicates_are_suppressed() {
        let mut p = SchedulePlanner::default();
        assert!(p.record_arrival(&at(2024, 1, 1, 8, 0)));
        assert!(!p.record_arrival(&at(2024, 1, 1, 8, 10)));
        // Second session of the day beyond the window.
        assert!(p.record_arrival(&at(2024, 1, 1, 13, 0)));
        assert_eq!(p.arrivals(0).len(), 2);
    }

    #[test]
    fn count_ceiling_keeps_most_recent_in_order() {
        let mut p = SchedulePlanner::new(PlannerSettings {
            max_entries: 1000,
            ..PlannerSettings::default()
        });
        let first_monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        for week in 0..25 {
            let day = first_monday + Duration::weeks(week);
            let ts = Utc.from_utc_datetime(&day.and_hms_opt(8, 0, 0).unwrap());
            p.record_arrival(&ts);
        }
        p.settings.max_entries = 20;
        p.settings.max_age_days = 10_000;
        let removed = p.prune_all_history(first_monday + Duration::weeks(25));
        assert_eq!(removed, 5);

        let dates: Vec<NaiveDate> = p.arrivals(0).iter().map(|r| r.date).collect();
        let expected: Vec<NaiveDate> = (5..25).map(|w| first_monday + Duration::weeks(w)).collect();
        assert_eq!(dates, expected);
    }

    #[test]
    fn age_cutoff_runs_before_count() {
        let mut p = SchedulePlanner::default();
        p.record_arrival(&at(2023, 1, 2, 8, 0));
        p.record_arrival(&at(2024, 1, 1, 8, 0));
        let removed = p.prune_all_history(NaiveDate::from_ymd_opt(2024, 1, 8).unwrap());
        assert_eq!(removed, 1);
        assert_eq!(p.arrivals(0).len(), 1);
    }

    #[test]
    fn tolerant_loader_accepts_every_known_shape() {
        let root = json!({
            "arrivals": {
                "1": [["2024-01-02", 540], {"date": "2024-01-09", "minutes": 545}],
                "v3_3": [["2024-01-04", 600]],
                " 5 ": [["2024-01-06", 660], "garbage", [1, 2]],
                "v2_4": [540, 545],
                "invalid": [["2024-01-01", 480]],
                "9": [["2024-01-01", 480]]
            },
            "departures": {
                "0": [{"date": "2024-01-01", "minutes": 1020, "dst_flag": true}, 1000]
            }
        });
        let mut p = SchedulePlanner::default();
        let skipped = p.load_from(root.as_object().unwrap());

        assert_eq!(p.arrivals(1).len(), 2);
        assert_eq!(p.arrivals(3).len(), 1);
        assert_eq!(p.arrivals(5).len(), 1);
        assert!(p.arrivals(4).is_empty());
        assert_eq!(p.legacy.get(&4), Some(&vec![540, 545]));
        assert_eq!(p.departures(0).len(), 1);
        assert!(p.departures(0)[0].dst_flag);
        // "garbage", [1, 2], "invalid", "9", bare departure 1000
        assert_eq!(skipped, 5);
    }

    #[test]
    fn legacy_averages_seed_predictions() {
        let root = json!({ "learned_arrivals": { "0": 450.0 } });
        let mut p = SchedulePlanner::default();
        p.load_from(root.as_object().unwrap());
        let next = p
            .get_next_scheduled_event(&at(2024, 1, 28, 20, 0), &no_blocks(), None)
            .unwrap();
        assert_eq!(next, at(2024, 1, 29, 7, 30));
    }

    #[test]
    fn persistence_round_trip_keeps_history() {
        let p = golden_planner();
        let mut root = Map::new();
        p.write_into(&mut root);
        let mut restored = SchedulePlanner::default();
        assert_eq!(restored.load_from(&root), 0);
        assert_eq!(restored.arrivals(0), p.arrivals(0));
        assert_eq!(restored.arrivals(1), p.arrivals(1));
    }

    #[test]
    fn departure_prediction_needs_enough_samples() {
        let mut p = SchedulePlanner::default();
        for week in 0..3 {
            p.record_departure(&at(2024, 1, 1 + week * 7, 17, 0));
        }
        let monday = NaiveDate::from_ymd_opt(2024, 1, 29).unwrap();
        assert!(p.predict_departure_on(monday).is_none());

        p.record_departure(&at(2024, 1, 22, 17, 0));
        let (minute, result) = p.predict_departure_on(monday).unwrap();
        assert_eq!(minute, 17 * 60);
        assert!(result.confidence > 0.9);

        let (ts, _) = p
            .next_predicted_departure(&at(2024, 1, 29, 9, 0), &no_blocks(), None)
            .unwrap();
        assert_eq!(ts, at(2024, 1, 29, 17, 0));
    }

    #[test]
    fn summary_lists_modes_per_weekday() {
        let p = golden_planner();
        let summary = p.schedule_summary();
        assert_eq!(summary.get("Mon").map(String::as_str), Some("08:00"));
        assert_eq!(summary.get("Tue").map(String::as_str), Some("09:00"));
        assert!(!summary.contains_key("Wed"));
    }
}
