#![allow(dead_code)]

use chrono::{DateTime, SubsecRound, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use uptime_service::config::{JitterRange, SchedulerSettings};
use uptime_service::database::models::{LedgerKey, LedgerKeys, Site};
use uptime_service::database::{MemoryStore, Storage};
use uptime_service::error::ProbeFailure;
use uptime_service::monitoring::{
    Checker, MonitoringExecutor, MonitoringScheduler, ProbeOutcome, ProbeSuccess, SchedulerHandle,
};
use uptime_service::notify::{Notification, SiteEvent};

#[derive(Default)]
struct Script {
    queued: VecDeque<bool>,
    fallback: Option<bool>,
}

/// Checker whose answers are scripted per URL. Unscripted URLs are up.
///
/// Tracks how many probes of the same URL overlap.
#[derive(Default)]
pub struct ScriptedChecker {
    scripts: Mutex<HashMap<String, Script>>,
    delay: Duration,
    active: Mutex<HashMap<String, usize>>,
    calls: Mutex<HashMap<String, usize>>,
    max_overlap: AtomicUsize,
    total_active: AtomicUsize,
    peak_total: AtomicUsize,
}

impl ScriptedChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every probe takes `delay` of (tokio) time
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay, ..Self::default() }
    }

    /// Queue one answer per probe, then fall back to the permanent answer
    pub fn queue(&self, url: &str, answers: impl IntoIterator<Item = bool>) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.entry(url.to_string()).or_default().queued.extend(answers);
    }

    pub fn set_up(&self, url: &str, up: bool) {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(url.to_string()).or_default();
        script.queued.clear();
        script.fallback = Some(up);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn max_overlap(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }

    /// Most probes running at once across all URLs
    pub fn peak_concurrency(&self) -> usize {
        self.peak_total.load(Ordering::SeqCst)
    }

    fn next_answer(&self, url: &str) -> bool {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(url.to_string()).or_default();
        script.queued.pop_front().or(script.fallback).unwrap_or(true)
    }
}

#[async_trait::async_trait]
impl Checker for ScriptedChecker {
    async fn check(&self, target: &str) -> ProbeOutcome {
        {
            let mut active = self.active.lock().unwrap();
            let running = active.entry(target.to_string()).or_default();
            *running += 1;
            self.max_overlap.fetch_max(*running, Ordering::SeqCst);
        }
        *self.calls.lock().unwrap().entry(target.to_string()).or_default() += 1;
        let total = self.total_active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_total.fetch_max(total, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let up = self.next_answer(target);

        if let Some(running) = self.active.lock().unwrap().get_mut(target) {
            *running -= 1;
        }
        self.total_active.fetch_sub(1, Ordering::SeqCst);

        if up {
            Ok(ProbeSuccess { started_at: Utc::now(), latency: Duration::from_millis(25), status_code: 200 })
        } else {
            Err(ProbeFailure::BadStatus(503))
        }
    }
}

pub fn settings(interval: Duration, jitter: Duration) -> SchedulerSettings {
    SchedulerSettings {
        interval,
        jitter: JitterRange::fixed(jitter),
        page_size: 3,
        max_concurrent_probes: 8,
        rescan_interval: None,
    }
}

/// Store a site as if it had been registered and last checked at `last_checked`
pub async fn seed_site(
    store: &MemoryStore,
    keys: &LedgerKeys,
    url: &str,
    last_checked: DateTime<Utc>,
) -> (Site, LedgerKey) {
    let last_checked = last_checked.trunc_subsecs(3);
    let site = Site::new(url.to_string(), "owner@example.com".to_string(), last_checked);
    let key = keys.next(Utc::now());
    store.create_site(key, &site).await.unwrap();
    (site, key)
}

pub struct Running {
    pub handle: SchedulerHandle,
    pub task: JoinHandle<()>,
}

impl Running {
    pub async fn stop(self) {
        self.handle.shutdown();
        self.task.await.unwrap();
    }
}

/// Reconcile the ledger and start the scheduler loop
pub async fn start_scheduler(
    store: Arc<MemoryStore>,
    checker: Arc<ScriptedChecker>,
    notifier: Arc<dyn uptime_service::notify::Notifier>,
    settings: SchedulerSettings,
) -> Running {
    let executor = Arc::new(MonitoringExecutor::new(store.clone(), checker, notifier));
    let (mut scheduler, handle) = MonitoringScheduler::new(settings, store, executor);
    scheduler.reconcile(LedgerKey::ZERO).await.unwrap();
    let task = tokio::spawn(scheduler.run());
    Running { handle, task }
}

/// Everything delivered so far
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut received = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        received.push(notification);
    }
    received
}

pub fn count(notifications: &[Notification], event: SiteEvent) -> usize {
    notifications.iter().filter(|n| n.event == event).count()
}
