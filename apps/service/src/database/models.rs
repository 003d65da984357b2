use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

use crate::monitoring::types::SiteStatus;

/// Opaque identifier handed out at registration
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SiteId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SiteId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Site model - a registered URL and the address to notify about it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub url: String,
    pub email: String,
    pub status: SiteStatus,
    pub last_checked: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Total time observed in the down state
    pub downtime_ms: u64,
}

impl Site {
    /// A freshly registered site. Registration already proved it reachable.
    pub fn new(url: String, email: String, now: DateTime<Utc>) -> Self {
        Self {
            id: SiteId::generate(),
            url,
            email,
            status: SiteStatus::Up,
            last_checked: now,
            created_at: now,
            downtime_ms: 0,
        }
    }
}

/// Position in the check ledger. Keys are microseconds since the epoch and
/// double as the scan cursor. The default is [`LedgerKey::ZERO`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerKey(i64);

impl LedgerKey {
    /// Sorts before every real key; scanning after it yields the whole ledger.
    pub const ZERO: LedgerKey = LedgerKey(0);

    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out strictly increasing, time-derived ledger keys.
#[derive(Debug)]
pub struct LedgerKeys {
    last: AtomicI64,
}

impl LedgerKeys {
    /// Seed from the largest key already in the ledger so keys keep
    /// increasing across restarts even if the wall clock stepped back.
    pub fn seeded(last: Option<LedgerKey>) -> Self {
        Self { last: AtomicI64::new(last.map_or(0, LedgerKey::get)) }
    }

    pub fn next(&self, now: DateTime<Utc>) -> LedgerKey {
        let candidate = now.timestamp_micros();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(candidate.max(last + 1)))
            .unwrap_or_else(|last| last);
        LedgerKey(candidate.max(previous + 1))
    }
}

/// Per-site scheduling marker. Refers to the site, never owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub site_id: SiteId,
    pub last_checked: DateTime<Utc>,
}

/// One successful probe, append-only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSample {
    pub site_id: SiteId,
    pub response_time_ms: u64,
    pub checked_at: DateTime<Utc>,
}

/// Everything one completed probe writes, applied as a unit
#[derive(Debug, Clone)]
pub struct CheckRecord {
    pub ledger_key: LedgerKey,
    pub site: Site,
    pub sample: Option<ProbeSample>,
}

impl CheckRecord {
    pub fn ledger_entry(&self) -> LedgerEntry {
        LedgerEntry { site_id: self.site.id.clone(), last_checked: self.site.last_checked }
    }
}

/// Convert a timestamp to the millisecond integer stored in the database
pub fn timestamp_to_i64(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Convert a stored millisecond integer back to a timestamp
pub fn i64_to_timestamp(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}
