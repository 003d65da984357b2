use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ProbeFailure;

/// Liveness of a monitored site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Up,
    Down,
}

impl std::fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SiteStatus::Up => write!(f, "up"),
            SiteStatus::Down => write!(f, "down"),
        }
    }
}

impl FromStr for SiteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(SiteStatus::Up),
            "down" => Ok(SiteStatus::Down),
            other => Err(format!("unknown site status {other:?}")),
        }
    }
}

/// A probe that got an allowed status code back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSuccess {
    /// Wall-clock time the request was issued
    pub started_at: DateTime<Utc>,

    /// Time until the response head arrived
    pub latency: Duration,

    pub status_code: u16,
}

impl ProbeSuccess {
    /// Response time in milliseconds. Never negative.
    pub fn response_time_ms(&self) -> u64 {
        u64::try_from(self.latency.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.started_at + TimeDelta::from_std(self.latency).unwrap_or(TimeDelta::zero())
    }
}

/// Outcome of one reachability probe
pub type ProbeOutcome = Result<ProbeSuccess, ProbeFailure>;
