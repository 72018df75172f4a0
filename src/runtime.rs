// =============================================================================
// Zone Runtime — Cycle loop driving one zone
// =============================================================================
//
// Runs as a Tokio task per zone:
//   1. Wait for the next snapshot (the source honours the requested cadence).
//   2. Fetch the forecast through the cache when the zone uses one.
//   3. Run one cycle to completion; cycles never overlap.
//   4. Publish the output for readers.
//   5. Persist learned state when the cycle marked it dirty.
//
//   tokio::spawn(run_zone(zone, source, cache, store, Arc::clone(&latest)));
//
// Save failures are logged and retried after the next dirty cycle; they never
// stop the loop.
// =============================================================================

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::Duration;
use tracing::{debug, error, info};

use crate::forecast_cache::{ForecastCache, ForecastSource};
use crate::store::StateStore;
use crate::zone::{CycleOutput, Zone, ZoneSnapshot};

/// Latest cycle output, shared with readers.
pub type LatestOutput = Arc<RwLock<Option<CycleOutput>>>;

pub fn new_latest_output() -> LatestOutput {
    Arc::new(RwLock::new(None))
}

/// Supplies sensor snapshots.
pub trait SnapshotSource {
    /// Next snapshot, taken roughly `interval` after the previous one.
    /// `None` ends the loop.
    fn next_snapshot(&mut self, interval: Duration) -> impl Future<Output = Option<ZoneSnapshot>> + Send;
}

/// Restore a zone from the store.  A missing or unreadable store leaves the
/// zone at its defaults.
pub fn load_state<St: StateStore + ?Sized>(zone: &mut Zone, store: &St) {
    match store.load() {
        Ok(Some(value)) => zone.restore(&value),
        Ok(None) => info!(zone = %zone.name(), "No persisted state, starting fresh"),
        Err(e) => error!(zone = %zone.name(), error = %e, "Failed to load state, starting fresh"),
    }
}

/// Save the zone's state and clear its dirty flag on success.
pub fn persist<St: StateStore + ?Sized>(zone: &mut Zone, store: &St) -> bool {
    match store.save(&zone.to_persisted()) {
        Ok(()) => {
            zone.mark_clean();
            debug!(zone = %zone.name(), "Zone state persisted");
            true
        }
        Err(e) => {
            error!(zone = %zone.name(), error = %e, "Failed to persist zone state");
            false
        }
    }
}

/// Drive `zone` until the snapshot source is exhausted, then hand it back.
pub async fn run_zone<S, F, St>(
    mut zone: Zone,
    mut source: S,
    forecasts: Arc<ForecastCache<F>>,
    store: Arc<St>,
    latest: LatestOutput,
) -> Zone
where
    S: SnapshotSource,
    F: ForecastSource,
    St: StateStore + ?Sized,
{
    let mut interval = Duration::from_secs(zone.config().fast_poll_secs);
    let mut cycles: u64 = 0;

    info!(
        zone = %zone.name(),
        fast_secs = zone.config().fast_poll_secs,
        slow_secs = zone.config().slow_poll_secs,
        "Zone runtime started"
    );

    while let Some(snapshot) = source.next_snapshot(interval).await {
        let points = if zone.config().use_forecast {
            forecasts.get(snapshot.now).await
        } else {
            None
        };

        let output = zone.run_cycle(&snapshot, points.as_deref().map(Vec::as_slice));
        interval = Duration::from_secs(output.poll_interval_secs);
        *latest.write() = Some(output);
        cycles += 1;

        if zone.is_dirty() {
            persist(&mut zone, store.as_ref());
        }
    }

    if zone.is_dirty() {
        persist(&mut zone, store.as_ref());
    }
    info!(zone = %zone.name(), cycles, "Zone runtime stopped: snapshot source exhausted");
    zone
}
