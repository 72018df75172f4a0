// =============================================================================
// State Store — Persistence of learned zone state
// =============================================================================
//
// The zone persists one JSON object.  `StateStore` only moves that object in
// and out; what lives inside it is owned by `PersistedState` (model, cooling
// and flags) and by the planner (arrival / departure history), each writing
// its own keys into the same map.
//
// Loading is tolerant: unknown keys are ignored, missing keys take their
// defaults, values of the wrong type are logged and defaulted.  Older layouts
// are migrated here:
//
//   learned_gain          → model_mass_factor   (clamped to 1..120 min/K)
//   arrival_history_v2    → arrivals            (handled by the planner)
//   learned_arrivals      → legacy arrivals     (handled by the planner)
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::cooling_analyzer::CoolingModelState;
use crate::physics::ThermalModelState;
use crate::types::HeatingProfile;

pub const SCHEMA_VERSION: u64 = 3;

const LEGACY_GAIN_MIN: f64 = 1.0;
const LEGACY_GAIN_MAX: f64 = 120.0;

/// Where the persisted JSON object lives.
pub trait StateStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> Result<Option<Value>>;
    fn save(&self, value: &Value) -> Result<()>;
}

// ── JsonFileStore ───────────────────────────────────────────────────────────

/// JSON file with atomic replace on save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<Option<Value>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no persisted state yet");
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read state from {}", self.path.display()))?;

        let value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse state from {}", self.path.display()))?;

        Ok(Some(value))
    }

    fn save(&self, value: &Value) -> Result<()> {
        let content =
            serde_json::to_string_pretty(value).context("failed to serialise state to JSON")?;

        let tmp_path = self.path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp state to {}", self.path.display()))?;

        debug!(path = %self.path.display(), "state saved (atomic)");
        Ok(())
    }
}

// ── MemoryStore ─────────────────────────────────────────────────────────────

/// In-process store for replays and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    value: RwLock<Option<Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: Value) -> Self {
        Self {
            value: RwLock::new(Some(value)),
        }
    }

    pub fn get(&self) -> Option<Value> {
        self.value.read().clone()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<Option<Value>> {
        Ok(self.value.read().clone())
    }

    fn save(&self, value: &Value) -> Result<()> {
        *self.value.write() = Some(value.clone());
        Ok(())
    }
}

// =============================================================================
// PersistedState
// =============================================================================

/// Non-history part of the persisted zone state.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedState {
    pub model: ThermalModelState,
    pub cooling: CoolingModelState,
    pub enabled: bool,
    pub bootstrap_done: bool,
    pub last_comfort_setpoint: Option<f64>,
    pub schema_version: u64,
}

impl PersistedState {
    pub fn for_profile(profile: HeatingProfile) -> Self {
        Self {
            model: ThermalModelState::for_profile(profile),
            cooling: CoolingModelState::default(),
            enabled: true,
            bootstrap_done: false,
            last_comfort_setpoint: None,
            schema_version: SCHEMA_VERSION,
        }
    }

    /// Read from a persisted object.  Missing or malformed keys fall back to
    /// the profile defaults.
    pub fn from_map(root: &Map<String, Value>, profile: HeatingProfile) -> Self {
        let mut out = Self::for_profile(profile);

        let legacy_gain = read_f64(root, "learned_gain").map(|g| {
            let mass = g.clamp(LEGACY_GAIN_MIN, LEGACY_GAIN_MAX);
            info!(gain = format!("{:.2}", g), "Migrated legacy gain to mass factor");
            mass
        });
        if let Some(mass) = read_f64(root, "model_mass_factor").or(legacy_gain) {
            out.model.mass_factor = mass;
        }
        if let Some(loss) = read_f64(root, "model_loss_factor") {
            out.model.loss_factor = loss;
        }
        if let Some(deadtime) = read_f64(root, "deadtime") {
            out.model.deadtime = deadtime;
        }
        if let Some(count) = root.get("sample_count").and_then(Value::as_u64) {
            out.model.sample_count = u32::try_from(count).unwrap_or(u32::MAX);
        }
        if let Some(err) = read_f64(root, "avg_error") {
            out.model.avg_error = err;
        }

        if let Some(tau) = read_f64(root, "model_cooling_tau") {
            out.cooling.learned_tau = tau;
        }
        if let Some(conf) = read_f64(root, "cooling_confidence") {
            out.cooling.confidence = conf.clamp(0.0, 1.0);
        }

        if let Some(enabled) = read_bool(root, "enabled") {
            out.enabled = enabled;
        }
        if let Some(done) = read_bool(root, "bootstrap_done") {
            out.bootstrap_done = done;
        }
        out.last_comfort_setpoint = read_f64(root, "last_comfort_setpoint");
        out.schema_version = root
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(1);

        out
    }

    /// Write this state's keys into a persisted object.
    pub fn write_into(&self, root: &mut Map<String, Value>) {
        root.insert("model_mass_factor".into(), self.model.mass_factor.into());
        root.insert("model_loss_factor".into(), self.model.loss_factor.into());
        root.insert("deadtime".into(), self.model.deadtime.into());
        root.insert("sample_count".into(), self.model.sample_count.into());
        root.insert("avg_error".into(), self.model.avg_error.into());
        root.insert("model_cooling_tau".into(), self.cooling.learned_tau.into());
        root.insert("cooling_confidence".into(), self.cooling.confidence.into());
        root.insert("enabled".into(), self.enabled.into());
        root.insert("bootstrap_done".into(), self.bootstrap_done.into());
        root.insert(
            "last_comfort_setpoint".into(),
            self.last_comfort_setpoint.map_or(Value::Null, Value::from),
        );
        root.insert("schema_version".into(), SCHEMA_VERSION.into());
    }
}

/// Numbers may arrive as JSON numbers or numeric strings.
fn read_f64(root: &Map<String, Value>, key: &str) -> Option<f64> {
    let value = root.get(key)?;
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Null => return None,
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Some(v),
        _ => {
            warn!(key, value = %value, "Unreadable persisted number, using default");
            None
        }
    }
}

fn read_bool(root: &Map<String, Value>, key: &str) -> Option<bool> {
    let value = root.get(key)?;
    let parsed = value.as_bool();
    if parsed.is_none() && !value.is_null() {
        warn!(key, value = %value, "Unreadable persisted flag, using default");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn missing_keys_take_profile_defaults() {
        let state = PersistedState::from_map(&Map::new(), HeatingProfile::FloorDry);
        assert_eq!(state, PersistedState {
            schema_version: 1,
            ..PersistedState::for_profile(HeatingProfile::FloorDry)
        });
    }

    #[test]
    fn legacy_gain_becomes_clamped_mass_factor() {
        let root = map(json!({ "learned_gain": 500.0 }));
        let state = PersistedState::from_map(&root, HeatingProfile::RadiatorNew);
        assert!((state.model.mass_factor - 120.0).abs() < 1e-9);

        let root = map(json!({ "learned_gain": 30.0, "model_mass_factor": 25.0 }));
        let state = PersistedState::from_map(&root, HeatingProfile::RadiatorNew);
        assert!((state.model.mass_factor - 25.0).abs() < 1e-9);
    }

    #[test]
    fn wrong_types_are_defaulted_not_fatal() {
        let root = map(json!({
            "model_loss_factor": "7.5",
            "deadtime": [1, 2],
            "enabled": "yes",
            "unknown_key": 42,
        }));
        let state = PersistedState::from_map(&root, HeatingProfile::RadiatorNew);
        assert!((state.model.loss_factor - 7.5).abs() < 1e-9);
        assert!(state.model.deadtime.abs() < 1e-9);
        assert!(state.enabled);
    }

    #[test]
    fn write_then_read_keeps_values() {
        let mut state = PersistedState::for_profile(HeatingProfile::RadiatorOld);
        state.model.mass_factor = 42.0;
        state.model.sample_count = 7;
        state.cooling.learned_tau = 5.5;
        state.bootstrap_done = true;
        state.last_comfort_setpoint = Some(21.5);

        let mut root = Map::new();
        state.write_into(&mut root);
        assert_eq!(root["schema_version"], json!(SCHEMA_VERSION));

        let back = PersistedState::from_map(&root, HeatingProfile::RadiatorOld);
        assert_eq!(back, state);
    }

    #[test]
    fn memory_store_round_trips_value() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());
        store.save(&json!({ "enabled": false })).unwrap();
        assert_eq!(store.load().unwrap(), Some(json!({ "enabled": false })));
    }

    #[test]
    fn file_store_missing_file_is_empty_then_saves_atomically() {
        let path = std::env::temp_dir().join(format!("preheat-{}.json", uuid::Uuid::new_v4()));
        let store = JsonFileStore::new(&path);
        assert!(store.load().unwrap().is_none());
        store.save(&json!({ "bootstrap_done": true })).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(store.load().unwrap(), Some(json!({ "bootstrap_done": true })));
        let _ = std::fs::remove_file(&path);
    }
}
