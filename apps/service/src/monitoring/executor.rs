use chrono::{DateTime, SubsecRound, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::checker::Checker;
use super::liveness;
use crate::database::Storage;
use crate::database::models::{CheckRecord, LedgerKey, SiteId};
use crate::notify::Notifier;

/// What happened to one scheduled probe, as far as re-arming is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Probe ran and its result is persisted
    Recorded { checked_at: DateTime<Utc> },
    /// Probe ran but storage refused the write; the next cycle retries
    Unrecorded { checked_at: DateTime<Utc> },
    /// The site no longer exists. Nothing was written.
    Vanished,
}

impl ExecutionOutcome {
    pub fn checked_at(&self) -> Option<DateTime<Utc>> {
        match self {
            ExecutionOutcome::Recorded { checked_at }
            | ExecutionOutcome::Unrecorded { checked_at } => Some(*checked_at),
            ExecutionOutcome::Vanished => None,
        }
    }
}

/// Monitoring executor - runs the probe pipeline for one site
pub struct MonitoringExecutor {
    storage: Arc<dyn Storage>,
    checker: Arc<dyn Checker>,
    notifier: Arc<dyn Notifier>,
}

impl MonitoringExecutor {
    pub fn new(
        storage: Arc<dyn Storage>,
        checker: Arc<dyn Checker>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { storage, checker, notifier }
    }

    /// Probe the site behind `ledger_key`, persist the transition and notify.
    ///
    /// The caller guarantees no other execution for `site_id` is running.
    pub async fn execute(&self, site_id: &SiteId, ledger_key: LedgerKey) -> ExecutionOutcome {
        let mut site = match self.storage.get_site(site_id).await {
            Ok(Some(site)) => site,
            Ok(None) => {
                debug!(%site_id, "Site vanished before probe, skipping");
                return ExecutionOutcome::Vanished;
            }
            Err(e) => {
                error!(%site_id, "Failed to load site for probe: {}", e);
                return ExecutionOutcome::Unrecorded { checked_at: Utc::now() };
            }
        };

        let outcome = self.checker.check(&site.url).await;
        // Stored with millisecond precision; keep the in-memory copy identical
        let checked_at = Utc::now().trunc_subsecs(3);

        match &outcome {
            Ok(success) => debug!(
                %site_id,
                url = %site.url,
                status_code = success.status_code,
                response_time_ms = success.response_time_ms(),
                "Probe succeeded"
            ),
            Err(failure) => debug!(%site_id, url = %site.url, "Probe failed: {}", failure),
        }

        let transition = liveness::transition(site.status, &outcome);
        let sample = transition.apply(&mut site, checked_at);
        let record = CheckRecord { ledger_key, site, sample };

        match self.storage.record_check(&record).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(%site_id, "Site removed during probe, result discarded");
                return ExecutionOutcome::Vanished;
            }
            Err(e) => {
                error!(%site_id, "Failed to persist check result: {}", e);
                return ExecutionOutcome::Unrecorded { checked_at };
            }
        }

        if transition.is_change() {
            info!(
                %site_id,
                url = %record.site.url,
                "Site status changed: {} -> {}",
                transition.from,
                transition.to
            );
        }

        if let Some(event) = transition.event {
            if let Err(e) = self.notifier.notify(&record.site, event).await {
                warn!(%site_id, %event, "Failed to deliver notification: {}", e);
            }
        }

        ExecutionOutcome::Recorded { checked_at }
    }
}
