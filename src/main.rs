// =============================================================================
// Preheat Replay — Runs a zone over a recorded snapshot stream
// =============================================================================
//
// Usage:
//
//   preheat-replay snapshots.jsonl
//
// Each line of the input is one `ZoneSnapshot` as JSON.  Learned state is
// loaded from and saved to PREHEAT_STATE, so consecutive replays keep
// learning.  The final cycle output is printed as JSON on stdout.
//
// Environment (a `.env` file is honoured):
//   PREHEAT_CONFIG    zone config JSON     (default: zone_config.json)
//   PREHEAT_STATE     persisted state JSON (default: preheat_state.json)
//   PREHEAT_FORECAST  forecast JSON array  (optional)
//   RUST_LOG          log filter           (default: info)
// =============================================================================

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use preheat_core::forecast_cache::{ForecastCache, ForecastSource};
use preheat_core::runtime::{self, SnapshotSource};
use preheat_core::store::JsonFileStore;
use preheat_core::types::ForecastPoint;
use preheat_core::{Zone, ZoneConfig, ZoneSnapshot};

/// Forecast read from a JSON file on every refresh.
struct FileForecast {
    path: Option<PathBuf>,
}

impl ForecastSource for FileForecast {
    fn fetch(&self) -> impl Future<Output = Option<Vec<ForecastPoint>>> + Send {
        let path = self.path.clone();
        async move {
            let path = path?;
            match read_forecast(&path).await {
                Ok(points) => Some(points),
                Err(e) => {
                    warn!(error = %e, "Forecast file unreadable");
                    None
                }
            }
        }
    }
}

async fn read_forecast(path: &Path) -> Result<Vec<ForecastPoint>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read forecast from {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse forecast from {}", path.display()))
}

/// Recorded snapshots, replayed as fast as they can be evaluated.
struct ReplaySource {
    snapshots: VecDeque<ZoneSnapshot>,
}

impl SnapshotSource for ReplaySource {
    fn next_snapshot(&mut self, _interval: Duration) -> impl Future<Output = Option<ZoneSnapshot>> + Send {
        std::future::ready(self.snapshots.pop_front())
    }
}

async fn read_snapshots(path: &Path) -> Result<VecDeque<ZoneSnapshot>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read snapshots from {}", path.display()))?;

    let mut snapshots = VecDeque::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<ZoneSnapshot>(line) {
            Ok(snap) => snapshots.push_back(snap),
            Err(e) => warn!(line = idx + 1, error = %e, "Malformed snapshot skipped"),
        }
    }
    Ok(snapshots)
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Preheat Replay — Starting Up                     ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let snapshot_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: preheat-replay <snapshots.jsonl>")?;

    let config_path =
        std::env::var("PREHEAT_CONFIG").unwrap_or_else(|_| "zone_config.json".into());
    let config = ZoneConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load zone config, using defaults");
        ZoneConfig::default()
    });

    let state_path =
        std::env::var("PREHEAT_STATE").unwrap_or_else(|_| "preheat_state.json".into());
    let forecast_path = std::env::var("PREHEAT_FORECAST").ok().map(PathBuf::from);

    // ── 2. Zone, store, forecast ─────────────────────────────────────────
    let store = Arc::new(JsonFileStore::new(&state_path));
    let mut zone = Zone::new(config);
    runtime::load_state(&mut zone, store.as_ref());
    info!(
        zone = %zone.name(),
        state = %store.path().display(),
        enabled = zone.is_enabled(),
        "Zone state loaded"
    );

    let ttl = zone.config().forecast_cache_ttl_min;
    let forecasts = Arc::new(ForecastCache::new(FileForecast { path: forecast_path }, ttl));

    let snapshots = read_snapshots(&snapshot_path).await?;
    info!(
        count = snapshots.len(),
        path = %snapshot_path.display(),
        "Snapshots loaded"
    );

    // ── 3. Replay ────────────────────────────────────────────────────────
    let latest = runtime::new_latest_output();
    let zone = tokio::spawn(runtime::run_zone(
        zone,
        ReplaySource { snapshots },
        forecasts,
        store,
        Arc::clone(&latest),
    ))
    .await
    .context("zone runtime task failed")?;

    // ── 4. Summary ───────────────────────────────────────────────────────
    let model = zone.model().snapshot();
    info!(
        mass = format!("{:.2}", model.mass_factor),
        loss = format!("{:.2}", model.loss_factor),
        deadtime = format!("{:.1}", model.effective_deadtime),
        samples = model.sample_count,
        health = format!("{:.0}", model.health_score),
        "Thermal model"
    );
    for (day, times) in zone.planner().schedule_summary() {
        info!(day = %day, arrivals = %times, "Learned schedule");
    }
    let metrics = zone.metrics();
    info!(
        shadow_evaluations = metrics.shadow_evaluations,
        safety_violations = metrics.safety_violations,
        "Shadow provider"
    );

    let output = latest.read().clone();
    match output {
        Some(output) => {
            let json = serde_json::to_string_pretty(&output)
                .context("failed to serialise cycle output")?;
            println!("{json}");
        }
        None => warn!("No cycle ran"),
    }

    info!("Preheat replay complete.");
    Ok(())
}
