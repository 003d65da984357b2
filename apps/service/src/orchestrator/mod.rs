/// Orchestrator module - wires storage, probing, scheduling and notification
///
/// The orchestrator:
/// - Opens the database and brings its schema up to date
/// - Starts the scheduler loop after a full reconcile of the ledger
/// - Runs periodic probe log retention
/// - Exposes the site operations, routed to the running scheduler
pub mod retention;
pub mod sites;

pub use retention::RetentionCleanup;
pub use sites::{CheckStats, SiteService};

use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::database::Storage;
use crate::database::models::LedgerKey;
use crate::monitoring::{Checker, HttpChecker, MonitoringExecutor, MonitoringScheduler, SchedulerHandle};
use crate::notify::{LogNotifier, Notifier};

/// Main orchestrator for the uptime service
pub struct Orchestrator {
    config: Arc<Config>,
    storage: Arc<dyn Storage>,
    checker: Arc<dyn Checker>,
    notifier: Arc<dyn Notifier>,
    sites: SiteService,
    scheduler: Option<SchedulerHandle>,
    task_handles: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Open the configured database with the HTTP checker and log notifier
    pub async fn open(config: Config) -> Result<Self> {
        info!(path = %config.database.path, "Opening database...");
        let storage = Arc::new(crate::database::connect(&config.database).await?);
        let checker = Arc::new(HttpChecker::new(&config.probe)?);

        Self::new(config, storage, checker, Arc::new(LogNotifier)).await
    }

    /// Assemble from explicit collaborators. Nothing runs until [`start`].
    ///
    /// [`start`]: Orchestrator::start
    pub async fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        checker: Arc<dyn Checker>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let sites = SiteService::new(
            storage.clone(),
            checker.clone(),
            notifier.clone(),
            config.scheduler.interval,
        )
        .await?;

        Ok(Self {
            config: Arc::new(config),
            storage,
            checker,
            notifier,
            sites,
            scheduler: None,
            task_handles: Vec::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Site operations. Before [`start`] they only touch storage; a running
    /// daemon picks the changes up on its next rescan.
    ///
    /// [`start`]: Orchestrator::start
    pub fn sites(&self) -> &SiteService {
        &self.sites
    }

    pub fn scheduler(&self) -> Option<&SchedulerHandle> {
        self.scheduler.as_ref()
    }

    /// Reconcile the whole ledger, then start the scheduler and retention tasks.
    /// A storage error during the first pass is retried by the scheduler.
    pub async fn start(&mut self) -> Result<()> {
        if self.scheduler.is_some() {
            warn!("Orchestrator already started");
            return Ok(());
        }

        info!("Starting uptime orchestrator...");

        let executor = Arc::new(MonitoringExecutor::new(
            self.storage.clone(),
            self.checker.clone(),
            self.notifier.clone(),
        ));
        let (mut scheduler, handle) =
            MonitoringScheduler::new(self.config.scheduler.clone(), self.storage.clone(), executor);

        match scheduler.reconcile(LedgerKey::ZERO).await {
            Ok(report) => info!(
                armed = report.armed,
                orphans_healed = report.orphans_healed,
                "Initial reconcile complete"
            ),
            // The scheduler resumes the scan itself once it is running
            Err(e) => warn!(
                "Initial reconcile failed, retrying in {:?}: {}",
                self.config.scheduler.interval, e
            ),
        }

        self.task_handles.push(tokio::spawn(scheduler.run()));

        info!(
            "Starting retention cleanup: keep {} samples per site, max age {}d",
            self.config.retention.max_samples_per_site,
            self.config.retention.max_age.as_secs() / 86_400
        );
        let retention = RetentionCleanup::new(self.storage.clone(), self.config.retention.clone());
        self.task_handles.push(retention.start_periodic_cleanup());

        self.sites = self.sites.clone().with_scheduler(handle.clone());
        self.scheduler = Some(handle);
        info!("Orchestrator started successfully");
        Ok(())
    }

    /// Stop the scheduler (aborting running probes) and background tasks
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.scheduler.take() {
            handle.shutdown();
        }

        // Scheduler first: it stops cleanly on the shutdown command
        let mut handles = self.task_handles.drain(..);
        if let Some(scheduler_task) = handles.next() {
            if let Err(e) = scheduler_task.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }
        for handle in handles {
            handle.abort();
        }
        info!("Orchestrator stopped");
    }
}
