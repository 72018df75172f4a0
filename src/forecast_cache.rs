// =============================================================================
// Forecast Cache — TTL cache in front of an outdoor forecast source
// =============================================================================
//
// Forecast sources are slow and rate-limited; the zone asks for a forecast
// every cycle.  The cache holds the last cleaned series for `ttl` and
// collapses concurrent refreshes: the mutex is held across the fetch, so
// callers that arrive during a refresh wait for it and then read the fresh
// entry instead of issuing their own request.
//
// Cleaning: drop non-finite temperatures, sort by timestamp, and densify
// sparse (3-hourly or 6-hourly) series to hourly points.
//
// When the forecast entity itself changes, `notify_source_changed` drops the
// entry, but only if it is older than ten minutes so a chatty source cannot
// defeat the cache.
// =============================================================================

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::math::densify_hourly;
use crate::types::ForecastPoint;

/// Minimum age of a cached entry before a source change may invalidate it.
const MIN_INVALIDATION_AGE_MINUTES: i64 = 10;
/// One week; anything longer is as good as never expiring.
const MAX_TTL_MINUTES: u64 = 7 * 24 * 60;

/// Anything that can produce an outdoor temperature forecast.
pub trait ForecastSource {
    /// `None` when the source is unavailable.
    fn fetch(&self) -> impl Future<Output = Option<Vec<ForecastPoint>>> + Send;
}

/// Source for zones that run without a forecast.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoForecast;

impl ForecastSource for NoForecast {
    fn fetch(&self) -> impl Future<Output = Option<Vec<ForecastPoint>>> + Send {
        std::future::ready(None)
    }
}

#[derive(Debug, Default)]
struct CacheEntry {
    points: Option<Arc<Vec<ForecastPoint>>>,
    fetched_at: Option<DateTime<Utc>>,
}

pub struct ForecastCache<S> {
    source: S,
    ttl: Duration,
    entry: Mutex<CacheEntry>,
}

impl<S: ForecastSource> ForecastCache<S> {
    pub fn new(source: S, ttl_minutes: u64) -> Self {
        Self {
            source,
            ttl: Duration::minutes(ttl_minutes.min(MAX_TTL_MINUTES) as i64),
            entry: Mutex::new(CacheEntry::default()),
        }
    }

    /// Cleaned forecast, refreshed when older than the TTL.  A failed refresh
    /// falls back to the stale entry if there is one.
    pub async fn get(&self, now: DateTime<Utc>) -> Option<Arc<Vec<ForecastPoint>>> {
        let mut entry = self.entry.lock().await;

        if let (Some(points), Some(at)) = (&entry.points, entry.fetched_at) {
            if now - at < self.ttl {
                return Some(Arc::clone(points));
            }
        }

        match self.source.fetch().await {
            Some(raw) => {
                let cleaned = clean(raw);
                if cleaned.is_empty() {
                    warn!("Forecast source returned no usable points");
                    return entry.points.clone();
                }
                info!(points = cleaned.len(), "Forecast refreshed");
                let points = Arc::new(cleaned);
                entry.points = Some(Arc::clone(&points));
                entry.fetched_at = Some(now);
                Some(points)
            }
            None => {
                if entry.points.is_some() {
                    warn!("Forecast fetch failed, serving stale entry");
                } else {
                    debug!("Forecast unavailable");
                }
                entry.points.clone()
            }
        }
    }

    /// Drop the entry after the source changed, if it is old enough.
    /// Returns whether the entry was invalidated.
    pub async fn notify_source_changed(&self, now: DateTime<Utc>) -> bool {
        let mut entry = self.entry.lock().await;
        match entry.fetched_at {
            Some(at) if now - at >= Duration::minutes(MIN_INVALIDATION_AGE_MINUTES) => {
                *entry = CacheEntry::default();
                debug!("Forecast cache invalidated by source change");
                true
            }
            _ => false,
        }
    }
}

fn clean(mut raw: Vec<ForecastPoint>) -> Vec<ForecastPoint> {
    raw.retain(|p| p.temperature.is_finite());
    raw.sort_by_key(|p| p.timestamp);
    raw.dedup_by_key(|p| p.timestamp);
    densify_hourly(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: Arc<AtomicUsize>,
        points: Option<Vec<ForecastPoint>>,
    }

    impl ForecastSource for CountingSource {
        fn fetch(&self) -> impl Future<Output = Option<Vec<ForecastPoint>>> + Send {
            let calls = Arc::clone(&self.calls);
            let points = self.points.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                points
            }
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 6, 0, 0).unwrap()
    }

    fn series() -> Vec<ForecastPoint> {
        vec![
            ForecastPoint::new(t0() + Duration::hours(3), 4.0),
            ForecastPoint::new(t0(), 1.0),
            ForecastPoint::new(t0() + Duration::hours(1), f64::NAN),
        ]
    }

    fn cache(points: Option<Vec<ForecastPoint>>) -> (ForecastCache<CountingSource>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            calls: Arc::clone(&calls),
            points,
        };
        (ForecastCache::new(source, 30), calls)
    }

    #[tokio::test]
    async fn concurrent_gets_fetch_once() {
        let (cache, calls) = cache(Some(series()));
        let (a, b) = tokio::join!(cache.get(t0()), cache.get(t0()));
        assert!(a.is_some() && b.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cleaned_series_is_sorted_finite_and_hourly() {
        let (cache, _) = cache(Some(series()));
        let points = cache.get(t0()).await.unwrap();
        assert_eq!(points.first().map(|p| p.timestamp), Some(t0()));
        assert!(points.iter().all(|p| p.temperature.is_finite()));
        assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(points.len() >= 4, "expected densified series, got {}", points.len());
    }

    #[tokio::test]
    async fn entry_expires_after_ttl() {
        let (cache, calls) = cache(Some(series()));
        cache.get(t0()).await;
        cache.get(t0() + Duration::minutes(29)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        cache.get(t0() + Duration::minutes(31)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn source_change_only_invalidates_old_entries() {
        let (cache, calls) = cache(Some(series()));
        cache.get(t0()).await;
        assert!(!cache.notify_source_changed(t0() + Duration::minutes(5)).await);
        assert!(cache.notify_source_changed(t0() + Duration::minutes(11)).await);
        cache.get(t0() + Duration::minutes(12)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unavailable_source_yields_none() {
        let (cache, _) = cache(None);
        assert!(cache.get(t0()).await.is_none());
    }
}
