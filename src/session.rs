// =============================================================================
// Occupancy Session Manager — Debounced presence edges
// =============================================================================
//
// Presence sensors flap: a door sensor drops for a minute, a motion sensor
// times out while someone sits still.  The manager turns the raw
// level-triggered occupancy signal into committed sessions:
//
//   Unoccupied ──on──▶ Occupied ──off──▶ PendingDeparture
//        ▲                 ▲                   │
//        │                 └──on, < debounce───┤
//        └──────── debounce elapsed (commit) ──┘
//
// A departure is committed at the moment presence first dropped, not when the
// debounce expired.  Commits are idempotent per timestamp and are returned to
// the caller, which records them and schedules persistence.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    Unoccupied,
    Occupied,
    PendingDeparture,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unoccupied => write!(f, "UNOCCUPIED"),
            Self::Occupied => write!(f, "OCCUPIED"),
            Self::PendingDeparture => write!(f, "PENDING_DEPARTURE"),
        }
    }
}

/// What a single `update` produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    /// A new occupancy session started at this update.
    pub new_session: bool,
    /// A departure was committed, stamped with the original off time.
    pub committed_departure: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub session_start: Option<DateTime<Utc>>,
    pub last_departure: Option<DateTime<Utc>>,
    pub candidate_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct OccupancySessionManager {
    phase: SessionPhase,
    debounce: Duration,
    session_start: Option<DateTime<Utc>>,
    last_departure: Option<DateTime<Utc>>,
    candidate_start: Option<DateTime<Utc>>,
    last_committed: Option<DateTime<Utc>>,
}

impl OccupancySessionManager {
    pub fn new(debounce: Duration) -> Self {
        Self {
            phase: SessionPhase::Unoccupied,
            debounce,
            session_start: None,
            last_departure: None,
            candidate_start: None,
            last_committed: None,
        }
    }

    /// Build from a debounce in (possibly fractional) minutes.
    pub fn with_debounce_minutes(minutes: f64) -> Self {
        Self::new(Duration::milliseconds((minutes * 60_000.0).round() as i64))
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_occupied(&self) -> bool {
        self.phase != SessionPhase::Unoccupied
    }

    pub fn session_start(&self) -> Option<DateTime<Utc>> {
        self.session_start
    }

    pub fn last_departure(&self) -> Option<DateTime<Utc>> {
        self.last_departure
    }

    /// Feed the current occupancy level.
    pub fn update(&mut self, occupied: bool, now: DateTime<Utc>) -> SessionUpdate {
        let mut out = SessionUpdate::default();

        match (self.phase, occupied) {
            (SessionPhase::Occupied, false) => {
                self.phase = SessionPhase::PendingDeparture;
                self.candidate_start = Some(now);
                debug!(at = %now, "Presence dropped, departure pending");
            }
            (SessionPhase::PendingDeparture, true) => {
                let candidate = self.candidate_start.unwrap_or(now);
                if now - candidate >= self.debounce {
                    out.committed_departure = self.commit(candidate);
                    out.new_session = self.try_start(now);
                } else {
                    debug!(
                        gap_secs = (now - candidate).num_seconds(),
                        "Presence flap, departure discarded"
                    );
                    self.candidate_start = None;
                    self.phase = SessionPhase::Occupied;
                }
            }
            (SessionPhase::Unoccupied, true) => {
                out.new_session = self.try_start(now);
            }
            _ => {}
        }

        out
    }

    /// Commit a pending departure once the debounce has elapsed.
    pub fn check_debounce(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.phase != SessionPhase::PendingDeparture {
            return None;
        }
        let candidate = self.candidate_start?;
        if now - candidate < self.debounce {
            return None;
        }
        self.commit(candidate)
    }

    /// Seed the last departure, e.g. from a startup state where the zone is
    /// already empty.
    pub fn mark_departure(&mut self, at: DateTime<Utc>) {
        self.last_departure = Some(at);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            session_start: self.session_start,
            last_departure: self.last_departure,
            candidate_start: self.candidate_start,
        }
    }

    fn try_start(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(departed) = self.last_departure {
            if now - departed < self.debounce {
                debug!(
                    gap_secs = (now - departed).num_seconds(),
                    "Re-entry too soon after departure, no new session"
                );
                return false;
            }
        }
        self.phase = SessionPhase::Occupied;
        self.session_start = Some(now);
        info!(at = %now, "Occupancy session started");
        true
    }

    fn commit(&mut self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.phase = SessionPhase::Unoccupied;
        self.candidate_start = None;
        self.session_start = None;

        if self.last_committed == Some(at) {
            return None;
        }
        self.last_committed = Some(at);
        self.last_departure = Some(at);
        info!(at = %at, "Departure committed");
        Some(at)
    }
}
