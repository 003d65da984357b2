//! Scheduling state owned by the scheduler loop.
//!
//! Timers live in a min-heap keyed by deadline. Cancelling or re-arming a
//! site only touches the `armed` map; heap entries whose generation no longer
//! matches are discarded lazily when they surface.

use chrono::{DateTime, TimeDelta, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::database::models::{LedgerKey, SiteId};

/// Time until a site is next due, not counting jitter.
///
/// Never negative. A `last_checked` in the future (clock skew) is due now.
pub fn due_in(last_checked: DateTime<Utc>, now: DateTime<Utc>, interval: Duration) -> Duration {
    if last_checked > now {
        return Duration::ZERO;
    }
    let interval = TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX);
    let next = last_checked.checked_add_signed(interval).unwrap_or(DateTime::<Utc>::MAX_UTC);
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone)]
struct Armed {
    generation: u64,
    ledger_key: LedgerKey,
    last_checked: DateTime<Utc>,
    due_at: Instant,
}

/// An armed timer as seen from outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmedTimer {
    pub site_id: SiteId,
    pub ledger_key: LedgerKey,
    pub due_at: Instant,
}

/// Result of asking to arm a site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmResult {
    Armed,
    /// Existing timer was computed from the same ledger state and stays
    Unchanged,
    /// A probe for the site is running; its completion re-arms it
    InFlight,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64, SiteId)>>,
    armed: HashMap<SiteId, Armed>,
    in_flight: HashMap<SiteId, AbortHandle>,
    next_generation: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `site_id` to fire at `due_at`, replacing any previous timer.
    ///
    /// A site never has more than one timer, and never has a timer while a
    /// probe for it is running.
    pub fn arm(
        &mut self,
        site_id: SiteId,
        ledger_key: LedgerKey,
        last_checked: DateTime<Utc>,
        due_at: Instant,
    ) -> ArmResult {
        if self.in_flight.contains_key(&site_id) {
            return ArmResult::InFlight;
        }
        if let Some(existing) = self.armed.get(&site_id) {
            if existing.ledger_key == ledger_key && existing.last_checked == last_checked {
                return ArmResult::Unchanged;
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.heap.push(Reverse((due_at, generation, site_id.clone())));
        self.armed.insert(site_id, Armed { generation, ledger_key, last_checked, due_at });
        ArmResult::Armed
    }

    /// Drop the timer for `site_id` and abort its running probe, if any.
    /// Returns whether anything was cancelled.
    pub fn cancel(&mut self, site_id: &SiteId) -> bool {
        let disarmed = self.armed.remove(site_id).is_some();
        let aborted = match self.in_flight.remove(site_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        };
        disarmed || aborted
    }

    /// Drop the timer for `site_id` only if it belongs to `ledger_key`
    pub fn cancel_entry(&mut self, site_id: &SiteId, ledger_key: LedgerKey) -> bool {
        match self.armed.get(site_id) {
            Some(armed) if armed.ledger_key == ledger_key => self.armed.remove(site_id).is_some(),
            _ => false,
        }
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((_, generation, site_id))) = self.heap.peek() {
            let live = self.armed.get(site_id).is_some_and(|a| a.generation == *generation);
            if live {
                break;
            }
            self.heap.pop();
        }
    }

    /// Earliest live deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((due_at, _, _))| *due_at)
    }

    /// Remove and return every timer due at or before `now`, earliest first
    pub fn pop_due(&mut self, now: Instant) -> Vec<(SiteId, LedgerKey)> {
        let mut due = Vec::new();
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            if let Some(Reverse((_, _, site_id))) = self.heap.pop() {
                if let Some(armed) = self.armed.remove(&site_id) {
                    due.push((site_id, armed.ledger_key));
                }
            }
        }
        due
    }

    pub fn begin_probe(&mut self, site_id: SiteId, handle: AbortHandle) {
        self.armed.remove(&site_id);
        self.in_flight.insert(site_id, handle);
    }

    /// Returns false if the probe was cancelled while running
    pub fn finish_probe(&mut self, site_id: &SiteId) -> bool {
        self.in_flight.remove(site_id).is_some()
    }

    pub fn is_in_flight(&self, site_id: &SiteId) -> bool {
        self.in_flight.contains_key(site_id)
    }

    pub fn armed(&self) -> Vec<ArmedTimer> {
        let mut timers: Vec<ArmedTimer> = self
            .armed
            .iter()
            .map(|(site_id, armed)| ArmedTimer {
                site_id: site_id.clone(),
                ledger_key: armed.ledger_key,
                due_at: armed.due_at,
            })
            .collect();
        timers.sort_by_key(|timer| (timer.due_at, timer.ledger_key));
        timers
    }

    pub fn in_flight(&self) -> Vec<SiteId> {
        let mut sites: Vec<SiteId> = self.in_flight.keys().cloned().collect();
        sites.sort();
        sites
    }
}

/// Position of the reconcile walk over the ledger.
///
/// `round_trip` remembers where the last finished pass stopped. A pass that
/// ends somewhere else saw the ledger grow and is followed by another pass
/// from where it stopped; a pass that ends at the same key parks the walk.
#[derive(Debug, Default, Clone)]
pub struct ScanCursor {
    position: LedgerKey,
    round_trip: Option<LedgerKey>,
    active: bool,
}

impl ScanCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a pass at `from`, abandoning any pass in progress
    pub fn restart(&mut self, from: LedgerKey) {
        self.position = from;
        self.active = true;
    }

    pub fn position(&self) -> LedgerKey {
        self.position
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn advance(&mut self, key: LedgerKey) {
        if key > self.position {
            self.position = key;
        }
    }

    /// Stop walking without touching the round-trip marker
    pub fn suspend(&mut self) {
        self.active = false;
    }

    /// Called when a scan found nothing past the cursor.
    /// Returns true if another pass was started.
    pub fn finish_pass(&mut self) -> bool {
        let end = self.position;
        if self.round_trip != Some(end) {
            self.round_trip = Some(end);
            self.active = true;
            return true;
        }
        self.active = false;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SiteId {
        SiteId::from(s)
    }

    #[test]
    fn test_due_in_clamps_and_handles_skew() {
        let now = Utc::now();
        let interval = Duration::from_secs(60);

        assert_eq!(due_in(now - TimeDelta::seconds(600), now, interval), Duration::ZERO);
        assert_eq!(due_in(now - TimeDelta::seconds(20), now, interval), Duration::from_secs(40));
        assert_eq!(due_in(now, now, interval), interval);
        assert_eq!(due_in(now + TimeDelta::hours(3), now, interval), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_timer() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let checked = Utc::now();

        queue.arm(id("a"), LedgerKey::new(1), checked, now + Duration::from_secs(5));
        let result =
            queue.arm(id("a"), LedgerKey::new(1), checked + TimeDelta::seconds(1), now + Duration::from_secs(9));
        assert_eq!(result, ArmResult::Armed);

        assert_eq!(queue.armed().len(), 1);
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(9)));
        assert!(queue.pop_due(now + Duration::from_secs(5)).is_empty());
        assert_eq!(queue.pop_due(now + Duration::from_secs(9)), vec![(id("a"), LedgerKey::new(1))]);
        assert_eq!(queue.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_ledger_state_keeps_timer() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let checked = Utc::now();

        queue.arm(id("a"), LedgerKey::new(1), checked, now + Duration::from_secs(5));
        let result = queue.arm(id("a"), LedgerKey::new(1), checked, now + Duration::from_secs(50));

        assert_eq!(result, ArmResult::Unchanged);
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_in_flight() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let checked = Utc::now();

        queue.arm(id("a"), LedgerKey::new(1), checked, now);
        queue.arm(id("b"), LedgerKey::new(2), checked, now);
        assert!(queue.cancel(&id("a")));
        assert!(!queue.cancel(&id("a")));

        let due = queue.pop_due(now);
        assert_eq!(due, vec![(id("b"), LedgerKey::new(2))]);

        let task = tokio::spawn(std::future::pending::<()>());
        queue.begin_probe(id("b"), task.abort_handle());
        assert_eq!(
            queue.arm(id("b"), LedgerKey::new(2), checked, now + Duration::from_secs(1)),
            ArmResult::InFlight
        );
        assert!(queue.armed().is_empty());

        assert!(queue.cancel(&id("b")));
        assert!(!queue.finish_probe(&id("b")));
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_entry_only_matches_its_key() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.arm(id("a"), LedgerKey::new(2), Utc::now(), now);

        assert!(!queue.cancel_entry(&id("a"), LedgerKey::new(1)));
        assert!(queue.cancel_entry(&id("a"), LedgerKey::new(2)));
        assert!(queue.armed().is_empty());
    }

    #[test]
    fn test_cursor_round_trip() {
        let mut cursor = ScanCursor::new();
        assert!(!cursor.is_active());

        cursor.restart(LedgerKey::ZERO);
        cursor.advance(LedgerKey::new(30));
        // First pass always takes one more look past where it ended
        assert!(cursor.finish_pass());
        assert_eq!(cursor.position(), LedgerKey::new(30));
        assert!(!cursor.finish_pass());
        assert!(!cursor.is_active());

        // Full rescan that ends at the same key parks immediately
        cursor.restart(LedgerKey::ZERO);
        cursor.advance(LedgerKey::new(30));
        assert!(!cursor.finish_pass());

        // Ledger grew: follow-up pass, then park
        cursor.restart(LedgerKey::ZERO);
        cursor.advance(LedgerKey::new(45));
        assert!(cursor.finish_pass());
        assert!(!cursor.finish_pass());
    }
}
