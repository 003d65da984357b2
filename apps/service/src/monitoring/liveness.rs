//! Per-site up/down transitions.
//!
//! | current | probe   | next | event     | sample |
//! |---------|---------|------|-----------|--------|
//! | up      | success | up   | -         | yes    |
//! | up      | failure | down | Down      | no     |
//! | down    | success | up   | Recovered | yes    |
//! | down    | failure | down | -         | no     |
//!
//! Failed probes have no response time, so they never produce a sample.

use chrono::{DateTime, Utc};

use super::types::{ProbeOutcome, SiteStatus};
use crate::database::models::{ProbeSample, Site};
use crate::notify::SiteEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SiteStatus,
    pub to: SiteStatus,
    /// Fired only when the status actually changes
    pub event: Option<SiteEvent>,
    pub response_time_ms: Option<u64>,
}

impl Transition {
    pub fn is_change(&self) -> bool {
        self.from != self.to
    }

    /// Apply to `site` as observed at `now`, returning the log sample to append
    ///
    /// Time spent since the previous check counts as downtime when the site
    /// was already down.
    pub fn apply(&self, site: &mut Site, now: DateTime<Utc>) -> Option<ProbeSample> {
        if self.from == SiteStatus::Down {
            let elapsed = (now - site.last_checked).num_milliseconds().max(0) as u64;
            site.downtime_ms = site.downtime_ms.saturating_add(elapsed);
        }
        site.status = self.to;
        site.last_checked = now;

        self.response_time_ms.map(|response_time_ms| ProbeSample {
            site_id: site.id.clone(),
            response_time_ms,
            checked_at: now,
        })
    }
}

pub fn transition(current: SiteStatus, outcome: &ProbeOutcome) -> Transition {
    match (current, outcome) {
        (SiteStatus::Up, Ok(success)) => Transition {
            from: current,
            to: SiteStatus::Up,
            event: None,
            response_time_ms: Some(success.response_time_ms()),
        },
        (SiteStatus::Down, Ok(success)) => Transition {
            from: current,
            to: SiteStatus::Up,
            event: Some(SiteEvent::Recovered),
            response_time_ms: Some(success.response_time_ms()),
        },
        (SiteStatus::Up, Err(_)) => Transition {
            from: current,
            to: SiteStatus::Down,
            event: Some(SiteEvent::Down),
            response_time_ms: None,
        },
        (SiteStatus::Down, Err(_)) => Transition {
            from: current,
            to: SiteStatus::Down,
            event: None,
            response_time_ms: None,
        },
    }
}
