//! The scheduler loop.
//!
//! One task owns every timer. It walks the check ledger a page at a time,
//! arms one timer per site, spawns a probe when a timer fires and re-arms the
//! site when the probe reports back. Registrations and removals reach it as
//! commands, so no timer state is ever shared.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, error, info, warn};

use super::executor::{ExecutionOutcome, MonitoringExecutor};
use super::queue::{ArmResult, ScanCursor, TimerQueue, due_in};
use crate::config::SchedulerSettings;
use crate::database::Storage;
use crate::database::models::{LedgerKey, SiteId};
use crate::error::StorageError;

/// Reasons to look at the ledger again
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nudge {
    /// A new site and its ledger entry were written
    SiteRegistered(SiteId),
    /// Walk the whole ledger again from the start
    Rescan,
}

enum Command {
    Nudge(Nudge),
    Remove { site_id: SiteId, ack: oneshot::Sender<bool> },
    Snapshot(oneshot::Sender<SchedulerSnapshot>),
    Shutdown,
}

struct ProbeCompletion {
    site_id: SiteId,
    ledger_key: LedgerKey,
    outcome: ExecutionOutcome,
}

/// A timer waiting to fire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledCheck {
    pub site_id: SiteId,
    pub ledger_key: LedgerKey,
    pub due_in: Duration,
}

/// Point-in-time view of the scheduler state
#[derive(Debug, Clone, Default)]
pub struct SchedulerSnapshot {
    /// Soonest first
    pub armed: Vec<ScheduledCheck>,
    pub in_flight: Vec<SiteId>,
    pub cursor: LedgerKey,
    pub scanning: bool,
}

impl SchedulerSnapshot {
    pub fn is_scheduled(&self, site_id: &SiteId) -> bool {
        self.armed.iter().any(|check| &check.site_id == site_id) || self.in_flight.contains(site_id)
    }
}

/// Totals for one reconcile pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub pages: usize,
    pub armed: usize,
    pub orphans_healed: usize,
}

/// Cheap, cloneable way to talk to a running scheduler.
///
/// A detached handle talks to nobody. It is used by one-shot commands that
/// write straight to storage and leave rescheduling to the daemon.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: Option<mpsc::UnboundedSender<Command>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Nudge(nudge) => write!(f, "Nudge({nudge:?})"),
            Command::Remove { site_id, .. } => write!(f, "Remove({site_id})"),
            Command::Snapshot(_) => write!(f, "Snapshot"),
            Command::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl SchedulerHandle {
    pub fn detached() -> Self {
        Self { tx: None }
    }

    fn send(&self, command: Command) -> bool {
        match &self.tx {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    pub fn site_registered(&self, site_id: SiteId) {
        if !self.send(Command::Nudge(Nudge::SiteRegistered(site_id))) {
            debug!("No scheduler running, registration nudge dropped");
        }
    }

    pub fn rescan(&self) {
        self.send(Command::Nudge(Nudge::Rescan));
    }

    /// Cancel the site's timer and abort its running probe.
    ///
    /// Must be called after the site is deleted from storage. Returns once
    /// the scheduler has dropped the site, with whether anything was pending.
    pub async fn site_removed(&self, site_id: SiteId) -> bool {
        let (ack, done) = oneshot::channel();
        if !self.send(Command::Remove { site_id, ack }) {
            return false;
        }
        done.await.unwrap_or(false)
    }

    pub async fn snapshot(&self) -> Option<SchedulerSnapshot> {
        let (tx, rx) = oneshot::channel();
        if !self.send(Command::Snapshot(tx)) {
            return None;
        }
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }
}

/// Monitoring scheduler - owns every timer and the ledger cursor
pub struct MonitoringScheduler {
    settings: SchedulerSettings,
    storage: Arc<dyn Storage>,
    executor: Arc<MonitoringExecutor>,
    queue: TimerQueue,
    cursor: ScanCursor,
    commands: mpsc::UnboundedReceiver<Command>,
    completion_tx: mpsc::UnboundedSender<ProbeCompletion>,
    completion_rx: mpsc::UnboundedReceiver<ProbeCompletion>,
    permits: Arc<Semaphore>,
    /// Set while a failed scan waits to be retried
    resume_at: Option<Instant>,
}

impl MonitoringScheduler {
    pub fn new(
        settings: SchedulerSettings,
        storage: Arc<dyn Storage>,
        executor: Arc<MonitoringExecutor>,
    ) -> (Self, SchedulerHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_probes.max(1)));

        let scheduler = Self {
            settings,
            storage,
            executor,
            queue: TimerQueue::new(),
            cursor: ScanCursor::new(),
            commands,
            completion_tx,
            completion_rx,
            permits,
            resume_at: None,
        };
        (scheduler, SchedulerHandle { tx: Some(command_tx) })
    }

    /// Walk the ledger from `from` until the cursor parks, arming every site
    /// found. Stops at the first storage error and leaves the cursor there,
    /// with a resume scheduled for when [`run`](Self::run) takes over.
    pub async fn reconcile(&mut self, from: LedgerKey) -> Result<ReconcileReport, StorageError> {
        self.cursor.restart(from);
        let mut report = ReconcileReport::default();

        while self.cursor.is_active() {
            match self.reconcile_page().await {
                Ok(page) => {
                    if page.armed + page.orphans_healed + page.skipped > 0 {
                        report.pages += 1;
                    }
                    report.armed += page.armed;
                    report.orphans_healed += page.orphans_healed;
                }
                Err(e) => {
                    self.suspend_scan();
                    return Err(e);
                }
            }
        }

        debug!(
            pages = report.pages,
            armed = report.armed,
            orphans_healed = report.orphans_healed,
            "Reconcile pass finished"
        );
        Ok(report)
    }

    async fn reconcile_page(&mut self) -> Result<PageReport, StorageError> {
        let entries = self
            .storage
            .scan_entries(self.cursor.position(), self.settings.page_size.max(1))
            .await?;

        let mut page = PageReport::default();
        if entries.is_empty() {
            if self.cursor.finish_pass() {
                debug!(cursor = %self.cursor.position(), "Pass ended somewhere new, taking another look");
            }
            return Ok(page);
        }

        // The cursor only moves past an entry once it is handled, so a failed
        // lookup retries the same entry on resume
        for (key, entry) in entries {
            match self.storage.get_site(&entry.site_id).await? {
                None => {
                    // Entry outlived its site; nothing to probe
                    self.storage.delete_entry(key).await?;
                    self.queue.cancel_entry(&entry.site_id, key);
                    info!(site_id = %entry.site_id, ledger_key = %key, "Removed orphaned ledger entry");
                    page.orphans_healed += 1;
                }
                Some(_) if self.queue.is_in_flight(&entry.site_id) => page.skipped += 1,
                Some(_) => {
                    let wait = due_in(entry.last_checked, Utc::now(), self.settings.interval)
                        + self.settings.jitter.sample();
                    match self.queue.arm(entry.site_id.clone(), key, entry.last_checked, Instant::now() + wait) {
                        ArmResult::Armed => {
                            debug!(site_id = %entry.site_id, ledger_key = %key, "Armed check in {:?}", wait);
                            page.armed += 1;
                        }
                        ArmResult::Unchanged | ArmResult::InFlight => page.skipped += 1,
                    }
                }
            }
            self.cursor.advance(key);
        }
        Ok(page)
    }

    fn dispatch_due(&mut self) {
        for (site_id, ledger_key) in self.queue.pop_due(Instant::now()) {
            let executor = self.executor.clone();
            let permits = self.permits.clone();
            let completion_tx = self.completion_tx.clone();
            let probe_site = site_id.clone();

            let task = tokio::spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => executor.execute(&probe_site, ledger_key).await,
                    Err(_) => {
                        error!(site_id = %probe_site, "Probe permits closed, probe skipped");
                        ExecutionOutcome::Unrecorded { checked_at: Utc::now() }
                    }
                };
                // Receiver only goes away with the scheduler itself
                let _ = completion_tx.send(ProbeCompletion { site_id: probe_site, ledger_key, outcome });
            });

            self.queue.begin_probe(site_id, task.abort_handle());
        }
    }

    fn on_completion(&mut self, completion: ProbeCompletion) {
        let ProbeCompletion { site_id, ledger_key, outcome } = completion;
        if !self.queue.finish_probe(&site_id) {
            debug!(%site_id, "Completion for cancelled probe ignored");
            return;
        }

        match outcome {
            ExecutionOutcome::Vanished => debug!(%site_id, "Site gone, not re-arming"),
            ExecutionOutcome::Recorded { checked_at } | ExecutionOutcome::Unrecorded { checked_at } => {
                let wait = self.settings.interval + self.settings.jitter.sample();
                self.queue.arm(site_id, ledger_key, checked_at, Instant::now() + wait);
            }
        }
    }

    fn suspend_scan(&mut self) {
        self.cursor.suspend();
        self.resume_at = Some(Instant::now() + self.settings.interval);
    }

    /// Unless a failed scan is waiting to resume, which rescans anyway
    fn rescan_from_start(&mut self) {
        if self.resume_at.is_none() {
            self.cursor.restart(LedgerKey::ZERO);
        }
    }

    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Nudge(nudge) => {
                match nudge {
                    Nudge::SiteRegistered(site_id) => debug!(%site_id, "Registration nudge"),
                    Nudge::Rescan => debug!("Rescan requested"),
                }
                self.rescan_from_start();
            }
            Command::Remove { site_id, ack } => {
                let cancelled = self.queue.cancel(&site_id);
                debug!(%site_id, cancelled, "Site removed from schedule");
                let _ = ack.send(cancelled);
                self.rescan_from_start();
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => return false,
        }
        true
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let now = Instant::now();
        SchedulerSnapshot {
            armed: self
                .queue
                .armed()
                .into_iter()
                .map(|timer| ScheduledCheck {
                    site_id: timer.site_id,
                    ledger_key: timer.ledger_key,
                    due_in: timer.due_at.saturating_duration_since(now),
                })
                .collect(),
            in_flight: self.queue.in_flight(),
            cursor: self.cursor.position(),
            scanning: self.cursor.is_active(),
        }
    }

    /// Run until shutdown is requested or every handle is dropped.
    ///
    /// Commands go first, then probe completions, then due timers. Reconcile
    /// pages only run when nothing else is ready.
    pub async fn run(mut self) {
        let mut rescan = self.settings.rescan_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        info!(
            interval = ?self.settings.interval,
            max_concurrent_probes = self.settings.max_concurrent_probes,
            "Scheduler started"
        );

        loop {
            let deadline = self.queue.next_deadline();
            let resume_at = self.resume_at;
            let far_future = Instant::now() + Duration::from_secs(86_400);

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(completion) = self.completion_rx.recv() => self.on_completion(completion),
                _ = sleep_until(deadline.unwrap_or(far_future)), if deadline.is_some() => self.dispatch_due(),
                _ = sleep_until(resume_at.unwrap_or(far_future)), if resume_at.is_some() => {
                    self.resume_at = None;
                    info!(cursor = %self.cursor.position(), "Resuming ledger scan");
                    self.cursor.restart(self.cursor.position());
                }
                _ = tick(&mut rescan) => {
                    debug!("Periodic rescan");
                    self.rescan_from_start();
                }
                _ = std::future::ready(()), if self.cursor.is_active() => {
                    if let Err(e) = self.reconcile_page().await {
                        warn!(
                            cursor = %self.cursor.position(),
                            "Ledger scan failed, retrying in {:?}: {}",
                            self.settings.interval,
                            e
                        );
                        self.suspend_scan();
                    }
                }
            }
        }

        for site_id in self.queue.in_flight() {
            self.queue.cancel(&site_id);
        }
        info!("Scheduler stopped");
    }
}

#[derive(Debug, Default)]
struct PageReport {
    armed: usize,
    orphans_healed: usize,
    skipped: usize,
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
