//! In-process storage backend.
//!
//! Holds everything behind one async mutex, so every compound write is
//! trivially atomic. Writes, scans and site lookups can be made to fail on
//! demand to exercise the scheduler's storage-error paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::models::{CheckRecord, LedgerEntry, LedgerKey, ProbeSample, Site, SiteId};
use super::repository::{CheckLedger, ProbeLog, SiteRegistry, Storage};
use crate::error::StorageError;

#[derive(Default)]
struct Inner {
    sites: BTreeMap<SiteId, Site>,
    ledger: BTreeMap<LedgerKey, LedgerEntry>,
    samples: HashMap<SiteId, Vec<ProbeSample>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
    fail_scans: AtomicBool,
    fail_lookups: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every write returns `StorageError::Unavailable`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// While set, ledger scans return `StorageError::Unavailable`
    pub fn set_fail_scans(&self, fail: bool) {
        self.fail_scans.store(fail, Ordering::SeqCst);
    }

    /// While set, `get_site` returns `StorageError::Unavailable`
    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("writes disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

fn raise_entry(ledger: &mut BTreeMap<LedgerKey, LedgerEntry>, key: LedgerKey, entry: &LedgerEntry) {
    ledger
        .entry(key)
        .and_modify(|existing| {
            existing.site_id = entry.site_id.clone();
            existing.last_checked = existing.last_checked.max(entry.last_checked);
        })
        .or_insert_with(|| entry.clone());
}

#[async_trait]
impl SiteRegistry for MemoryStore {
    async fn get_site(&self, id: &SiteId) -> Result<Option<Site>, StorageError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("lookups disabled".to_string()));
        }
        Ok(self.inner.lock().await.sites.get(id).cloned())
    }

    async fn put_site(&self, site: &Site) -> Result<(), StorageError> {
        self.check_writable()?;
        self.inner.lock().await.sites.insert(site.id.clone(), site.clone());
        Ok(())
    }

    async fn delete_site(&self, id: &SiteId) -> Result<bool, StorageError> {
        self.check_writable()?;
        Ok(self.inner.lock().await.sites.remove(id).is_some())
    }

    async fn list_sites(&self) -> Result<Vec<Site>, StorageError> {
        Ok(self.inner.lock().await.sites.values().cloned().collect())
    }

    async fn count_sites(&self) -> Result<u64, StorageError> {
        Ok(self.inner.lock().await.sites.len() as u64)
    }
}

#[async_trait]
impl CheckLedger for MemoryStore {
    async fn put_entry(&self, key: LedgerKey, entry: &LedgerEntry) -> Result<(), StorageError> {
        self.check_writable()?;
        raise_entry(&mut self.inner.lock().await.ledger, key, entry);
        Ok(())
    }

    async fn scan_entries(
        &self,
        after: LedgerKey,
        limit: usize,
    ) -> Result<Vec<(LedgerKey, LedgerEntry)>, StorageError> {
        if self.fail_scans.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("scans disabled".to_string()));
        }
        let inner = self.inner.lock().await;
        Ok(inner
            .ledger
            .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
            .take(limit)
            .map(|(key, entry)| (*key, entry.clone()))
            .collect())
    }

    async fn delete_entry(&self, key: LedgerKey) -> Result<(), StorageError> {
        self.check_writable()?;
        self.inner.lock().await.ledger.remove(&key);
        Ok(())
    }

    async fn last_key(&self) -> Result<Option<LedgerKey>, StorageError> {
        Ok(self.inner.lock().await.ledger.keys().next_back().copied())
    }
}

#[async_trait]
impl ProbeLog for MemoryStore {
    async fn append_sample(&self, sample: &ProbeSample) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        inner.samples.entry(sample.site_id.clone()).or_default().push(sample.clone());
        Ok(())
    }

    async fn recent_samples(
        &self,
        site_id: &SiteId,
        limit: usize,
    ) -> Result<Vec<ProbeSample>, StorageError> {
        let inner = self.inner.lock().await;
        let mut samples = inner.samples.get(site_id).cloned().unwrap_or_default();
        // stable sort keeps append order among equal timestamps
        samples.sort_by_key(|sample| sample.checked_at);
        samples.reverse();
        samples.truncate(limit);
        Ok(samples)
    }

    async fn prune_samples(
        &self,
        keep_per_site: usize,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let mut removed = 0;

        for samples in inner.samples.values_mut() {
            let before = samples.len();
            samples.retain(|sample| sample.checked_at >= older_than);
            samples.sort_by_key(|sample| sample.checked_at);
            let excess = samples.len().saturating_sub(keep_per_site);
            samples.drain(..excess);
            removed += (before - samples.len()) as u64;
        }

        inner.samples.retain(|_, samples| !samples.is_empty());
        Ok(removed)
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn create_site(&self, key: LedgerKey, site: &Site) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        if inner.ledger.contains_key(&key) {
            return Err(StorageError::Conflict(format!("ledger key {key} already in use")));
        }
        inner.sites.insert(site.id.clone(), site.clone());
        inner.ledger.insert(
            key,
            LedgerEntry { site_id: site.id.clone(), last_checked: site.last_checked },
        );
        Ok(())
    }

    async fn record_check(&self, record: &CheckRecord) -> Result<bool, StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;

        let Some(site) = inner.sites.get_mut(&record.site.id) else {
            return Ok(false);
        };
        site.status = record.site.status;
        site.last_checked = record.site.last_checked;
        site.downtime_ms = record.site.downtime_ms;

        raise_entry(&mut inner.ledger, record.ledger_key, &record.ledger_entry());

        if let Some(sample) = &record.sample {
            inner.samples.entry(sample.site_id.clone()).or_default().push(sample.clone());
        }
        Ok(true)
    }

    async fn remove_site(&self, id: &SiteId) -> Result<bool, StorageError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let existed = inner.sites.remove(id).is_some();
        inner.ledger.retain(|_, entry| &entry.site_id != id);
        inner.samples.remove(id);
        Ok(existed)
    }
}
