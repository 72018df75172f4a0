// =============================================================================
// Schedule Provider — Session end from the external schedule entity
// =============================================================================
//
// The schedule is the authoritative source.  While it reports "on", its
// next-event timestamp is the end of the current session.  This provider only
// reports that end; whether to coast towards it is the optimal-stop engine's
// call, layered on top by the zone.
// =============================================================================

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::arbitration::ProviderKind;
use super::decision::{InvalidReason, ProviderContext, ProviderDecision, SessionEndProvider};

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"];

/// Raw state of the schedule entity as polled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSnapshot {
    /// "on", "off", "unavailable", … or absent.
    #[serde(default)]
    pub state: Option<String>,
    /// Next transition as RFC 3339 or naive local time.
    #[serde(default)]
    pub next_event: Option<String>,
}

impl ScheduleSnapshot {
    pub fn on(next_event: impl Into<String>) -> Self {
        Self {
            state: Some("on".to_string()),
            next_event: Some(next_event.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduleProvider;

impl SessionEndProvider for ScheduleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Schedule
    }

    fn decide(&self, ctx: &ProviderContext<'_>) -> ProviderDecision {
        let state = ctx.schedule.state.as_deref().map(str::trim);
        match state {
            None | Some("unavailable") | Some("unknown") | Some("") => {
                return ProviderDecision::invalid(InvalidReason::Unavailable, false)
            }
            Some(s) if !s.eq_ignore_ascii_case("on") => {
                return ProviderDecision::invalid(InvalidReason::Off, false)
            }
            _ => {}
        }

        let Some(raw) = ctx
            .schedule
            .next_event
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return ProviderDecision::invalid(InvalidReason::NoNextEvent, false);
        };

        match parse_event(raw, ctx) {
            Some(end) => ProviderDecision::valid(end, false),
            None => {
                debug!(raw = %raw, "Schedule next_event not parseable");
                ProviderDecision::invalid(InvalidReason::ParseError, false)
            }
        }
    }
}

fn parse_event(raw: &str, ctx: &ProviderContext<'_>) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS.iter().find_map(|fmt| {
        let naive = NaiveDateTime::parse_from_str(raw, fmt).ok()?;
        ctx.tz
            .from_local_datetime(&naive)
            .earliest()
            .map(|ts| ts.with_timezone(&Utc))
    })
}
