//! Registration, removal and read-side queries over monitored sites.

use chrono::{SubsecRound, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::database::Storage;
use crate::database::models::{LedgerKeys, ProbeSample, Site, SiteId};
use crate::error::{RegistrationError, StorageError, ValidationError};
use crate::monitoring::{Checker, SchedulerHandle};
use crate::notify::{Notifier, SiteEvent};
use crate::validation::{validate_email, validate_url};

/// Samples returned by [`SiteService::history`] when no limit is given
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

const DAY_MS: u64 = 86_400_000;

/// Projected check volume for the configured interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckStats {
    pub total_sites: u64,
    pub checks_last_day: u64,
    pub checks_last_week: u64,
    pub checks_last_month: u64,
}

impl CheckStats {
    pub fn project(total_sites: u64, interval: Duration) -> Self {
        let interval_ms = (interval.as_millis() as u64).max(1);
        let per_day = (DAY_MS / interval_ms).saturating_mul(total_sites);
        Self {
            total_sites,
            checks_last_day: per_day,
            checks_last_week: per_day.saturating_mul(7),
            checks_last_month: per_day.saturating_mul(30),
        }
    }
}

#[derive(Clone)]
pub struct SiteService {
    storage: Arc<dyn Storage>,
    checker: Arc<dyn Checker>,
    notifier: Arc<dyn Notifier>,
    scheduler: SchedulerHandle,
    keys: Arc<LedgerKeys>,
    interval: Duration,
}

impl SiteService {
    /// Seeds the ledger key sequence from storage, so it must run after
    /// migrations.
    pub async fn new(
        storage: Arc<dyn Storage>,
        checker: Arc<dyn Checker>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
    ) -> Result<Self, StorageError> {
        let keys = LedgerKeys::seeded(storage.last_key().await?);
        Ok(Self {
            storage,
            checker,
            notifier,
            scheduler: SchedulerHandle::detached(),
            keys: Arc::new(keys),
            interval,
        })
    }

    /// Route registrations and removals to a running scheduler
    pub fn with_scheduler(mut self, scheduler: SchedulerHandle) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Validate, probe once, then store the site and its ledger entry.
    ///
    /// Nothing is written unless the URL answers with an allowed status.
    pub async fn register(&self, url: &str, email: &str) -> Result<Site, RegistrationError> {
        let url = validate_url(url)?;
        let email = validate_email(email)?;

        let target = url.as_str().to_string();
        self.checker.check(&target).await.map_err(ValidationError::Unreachable)?;

        let now = Utc::now().trunc_subsecs(3);
        let site = Site::new(target, email.to_string(), now);
        let key = self.keys.next(now);
        self.storage.create_site(key, &site).await?;

        info!(site_id = %site.id, url = %site.url, ledger_key = %key, "Registered site");
        self.scheduler.site_registered(site.id.clone());

        if let Err(e) = self.notifier.notify(&site, SiteEvent::Registered).await {
            warn!(site_id = %site.id, "Failed to deliver welcome notification: {}", e);
        }
        Ok(site)
    }

    /// Delete the site and make sure no probe for it is pending or running.
    ///
    /// Returns whether the site existed.
    pub async fn remove(&self, id: &SiteId) -> Result<bool, StorageError> {
        let existed = self.storage.remove_site(id).await?;
        let cancelled = self.scheduler.site_removed(id.clone()).await;

        if existed {
            info!(site_id = %id, cancelled, "Removed site");
        }
        Ok(existed)
    }

    pub async fn get(&self, id: &SiteId) -> Result<Option<Site>, StorageError> {
        self.storage.get_site(id).await
    }

    pub async fn list(&self) -> Result<Vec<Site>, StorageError> {
        self.storage.list_sites().await
    }

    /// Recent successful probes, newest first
    pub async fn history(
        &self,
        id: &SiteId,
        limit: Option<usize>,
    ) -> Result<Vec<ProbeSample>, StorageError> {
        self.storage.recent_samples(id, limit.unwrap_or(DEFAULT_HISTORY_LIMIT)).await
    }

    pub async fn stats(&self) -> Result<CheckStats, StorageError> {
        let total_sites = self.storage.count_sites().await?;
        Ok(CheckStats::project(total_sites, self.interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::LedgerKey;
    use crate::database::{CheckLedger, MemoryStore};
    use crate::error::ProbeFailure;
    use crate::monitoring::types::{ProbeOutcome, ProbeSuccess};
    use crate::notify::ChannelNotifier;

    struct FixedChecker(ProbeOutcome);

    #[async_trait::async_trait]
    impl Checker for FixedChecker {
        async fn check(&self, _target: &str) -> ProbeOutcome {
            self.0.clone()
        }
    }

    fn reachable() -> Arc<FixedChecker> {
        Arc::new(FixedChecker(Ok(ProbeSuccess {
            started_at: Utc::now(),
            latency: Duration::from_millis(4),
            status_code: 200,
        })))
    }

    #[tokio::test]
    async fn test_register_writes_site_and_entry_and_welcomes() {
        let store = Arc::new(MemoryStore::new());
        let (notifier, mut rx) = ChannelNotifier::new();
        let service =
            SiteService::new(store.clone(), reachable(), Arc::new(notifier), Duration::from_secs(60))
                .await
                .unwrap();

        let site = service.register("https://example.com", "ops@example.com").await.unwrap();

        assert_eq!(service.get(&site.id).await.unwrap(), Some(site.clone()));
        let entries = store.scan_entries(LedgerKey::ZERO, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.site_id, site.id);

        let welcome = rx.recv().await.unwrap();
        assert_eq!(welcome.event, SiteEvent::Registered);
    }

    #[tokio::test]
    async fn test_rejected_registration_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let down = Arc::new(FixedChecker(Err(ProbeFailure::BadStatus(503))));
        let service =
            SiteService::new(store.clone(), down, Arc::new(crate::notify::LogNotifier), Duration::from_secs(60))
                .await
                .unwrap();

        let err = service.register("https://example.com", "ops@example.com").await.unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::Validation(ValidationError::Unreachable(ProbeFailure::BadStatus(503)))
        ));

        let err = service.register("not a url", "ops@example.com").await.unwrap_err();
        assert!(matches!(err, RegistrationError::Validation(ValidationError::BadUrl(_))));

        let err = service.register("https://example.com", "nobody").await.unwrap_err();
        assert!(matches!(err, RegistrationError::Validation(ValidationError::BadEmail(_))));

        assert_eq!(service.list().await.unwrap().len(), 0);
        assert!(store.scan_entries(LedgerKey::ZERO, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_stats() {
        let store = Arc::new(MemoryStore::new());
        let service = SiteService::new(
            store.clone(),
            reachable(),
            Arc::new(crate::notify::LogNotifier),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let a = service.register("https://a.example.com", "ops@example.com").await.unwrap();
        service.register("https://b.example.com", "ops@example.com").await.unwrap();

        let stats = service.stats().await.unwrap();
        assert_eq!(stats.total_sites, 2);
        assert_eq!(stats.checks_last_day, 1440 * 2);
        assert_eq!(stats.checks_last_week, 1440 * 2 * 7);
        assert_eq!(stats.checks_last_month, 1440 * 2 * 30);

        assert!(service.remove(&a.id).await.unwrap());
        assert!(!service.remove(&a.id).await.unwrap());
        assert_eq!(service.get(&a.id).await.unwrap(), None);
        assert_eq!(service.stats().await.unwrap().total_sites, 1);
    }

    #[test]
    fn test_stats_floor_division() {
        let stats = CheckStats::project(3, Duration::from_millis(7_000_000));
        assert_eq!(stats.checks_last_day, 12 * 3);
        assert_eq!(CheckStats::project(0, Duration::from_secs(1)).checks_last_month, 0);
    }
}
