//! Automatic retention of the probe log.
//!
//! Each site keeps at most `max_samples_per_site` samples, and nothing older
//! than `max_age`. Cleanup runs periodically as a background task.

use chrono::{TimeDelta, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RetentionSettings;
use crate::database::Storage;
use crate::error::StorageError;

/// Cleanup manager for old probe samples
pub struct RetentionCleanup {
    storage: Arc<dyn Storage>,
    settings: RetentionSettings,
}

impl RetentionCleanup {
    pub fn new(storage: Arc<dyn Storage>, settings: RetentionSettings) -> Self {
        Self { storage, settings }
    }

    /// Run one cleanup pass, returning the number of samples removed
    pub async fn prune_once(&self) -> Result<u64, StorageError> {
        let max_age = TimeDelta::from_std(self.settings.max_age).unwrap_or(TimeDelta::MAX);
        let cutoff = Utc::now().checked_sub_signed(max_age).unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let removed = self
            .storage
            .prune_samples(self.settings.max_samples_per_site, cutoff)
            .await?;

        if removed > 0 {
            info!(removed, %cutoff, "Pruned probe log");
        } else {
            debug!("Probe log within retention limits");
        }
        Ok(removed)
    }

    /// Start background cleanup task
    pub fn start_periodic_cleanup(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.cleanup_interval);

            loop {
                interval.tick().await;

                if let Err(e) = self.prune_once().await {
                    warn!("Periodic probe log cleanup failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{ProbeSample, SiteId};
    use crate::database::{MemoryStore, ProbeLog};
    use std::time::Duration;

    fn settings(keep: usize, max_age_days: u64) -> RetentionSettings {
        RetentionSettings {
            max_samples_per_site: keep,
            max_age: Duration::from_secs(max_age_days * 24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }

    async fn seed(store: &MemoryStore, site: &str, ages_days: &[i64]) {
        for age in ages_days {
            store
                .append_sample(&ProbeSample {
                    site_id: SiteId::from(site),
                    response_time_ms: 10,
                    checked_at: Utc::now() - TimeDelta::days(*age),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_prune_drops_old_and_excess_samples() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "a", &[0, 1, 2, 3, 40]).await;
        seed(&store, "b", &[0, 50]).await;

        let cleanup = RetentionCleanup::new(store.clone(), settings(3, 30));
        // a: one too old, one over the cap; b: one too old
        assert_eq!(cleanup.prune_once().await.unwrap(), 3);

        assert_eq!(store.recent_samples(&SiteId::from("a"), 10).await.unwrap().len(), 3);
        assert_eq!(store.recent_samples(&SiteId::from("b"), 10).await.unwrap().len(), 1);
        assert_eq!(cleanup.prune_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prune_reports_storage_errors() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);

        let cleanup = RetentionCleanup::new(store, settings(10, 30));
        assert!(matches!(cleanup.prune_once().await, Err(StorageError::Unavailable(_))));
    }
}
