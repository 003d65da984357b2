use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Row, params};

use super::models::{
    CheckRecord, LedgerEntry, LedgerKey, ProbeSample, Site, SiteId, i64_to_timestamp,
    timestamp_to_i64,
};
use crate::error::StorageError;
use crate::monitoring::types::SiteStatus;
use crate::pool::LibsqlPool;

/// Site-id to site mapping
#[async_trait]
pub trait SiteRegistry: Send + Sync {
    async fn get_site(&self, id: &SiteId) -> Result<Option<Site>, StorageError>;

    /// Insert or replace a site
    async fn put_site(&self, site: &Site) -> Result<(), StorageError>;

    /// Returns whether a site was deleted
    async fn delete_site(&self, id: &SiteId) -> Result<bool, StorageError>;

    /// All sites ordered by id
    async fn list_sites(&self) -> Result<Vec<Site>, StorageError>;

    async fn count_sites(&self) -> Result<u64, StorageError>;
}

/// Ordered per-site "last checked" markers that drive scheduling
#[async_trait]
pub trait CheckLedger: Send + Sync {
    /// Insert an entry, or raise its `last_checked` if the key exists.
    /// `last_checked` never moves backwards.
    async fn put_entry(&self, key: LedgerKey, entry: &LedgerEntry) -> Result<(), StorageError>;

    /// Up to `limit` entries with keys strictly greater than `after`, in key order
    async fn scan_entries(
        &self,
        after: LedgerKey,
        limit: usize,
    ) -> Result<Vec<(LedgerKey, LedgerEntry)>, StorageError>;

    async fn delete_entry(&self, key: LedgerKey) -> Result<(), StorageError>;

    async fn last_key(&self) -> Result<Option<LedgerKey>, StorageError>;
}

/// Append-only log of successful probes
#[async_trait]
pub trait ProbeLog: Send + Sync {
    async fn append_sample(&self, sample: &ProbeSample) -> Result<(), StorageError>;

    /// Most recent first
    async fn recent_samples(
        &self,
        site_id: &SiteId,
        limit: usize,
    ) -> Result<Vec<ProbeSample>, StorageError>;

    /// Drop samples older than `older_than` and everything past the newest
    /// `keep_per_site` of each site. Returns the number removed.
    async fn prune_samples(
        &self,
        keep_per_site: usize,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StorageError>;
}

/// The stores the scheduler needs, plus the compound writes that must be atomic
#[async_trait]
pub trait Storage: SiteRegistry + CheckLedger + ProbeLog {
    /// Write a new site and its ledger entry together
    async fn create_site(&self, key: LedgerKey, site: &Site) -> Result<(), StorageError>;

    /// Persist the outcome of one probe. Only updates an existing site:
    /// returns `Ok(false)` without writing anything if the site is gone.
    async fn record_check(&self, record: &CheckRecord) -> Result<bool, StorageError>;

    /// Delete a site with its ledger entries and samples
    async fn remove_site(&self, id: &SiteId) -> Result<bool, StorageError>;
}

const SITE_COLUMNS: &str = "id, url, email, status, last_checked, created_at, downtime_ms";

/// LibSQL storage implementation
pub struct LibsqlStore {
    pool: LibsqlPool,
}

impl LibsqlStore {
    /// Create a new store from a pool with an initialized schema
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Get a connection from the pool
    async fn get_conn(
        &self,
    ) -> Result<deadpool::managed::Object<crate::pool::LibsqlManager>, StorageError> {
        Ok(self.pool.get().await?)
    }
}

fn timestamp_column(row: &Row, idx: i32) -> Result<DateTime<Utc>, StorageError> {
    let millis: i64 = row.get(idx)?;
    i64_to_timestamp(millis)
        .ok_or_else(|| StorageError::Corrupt(format!("timestamp out of range: {millis}")))
}

fn site_from_row(row: &Row) -> Result<Site, StorageError> {
    let status: String = row.get(3)?;
    Ok(Site {
        id: SiteId::from(row.get::<String>(0)?),
        url: row.get(1)?,
        email: row.get(2)?,
        status: status.parse().map_err(StorageError::Corrupt)?,
        last_checked: timestamp_column(row, 4)?,
        created_at: timestamp_column(row, 5)?,
        downtime_ms: row.get::<i64>(6)?.max(0) as u64,
    })
}

fn entry_from_row(row: &Row) -> Result<(LedgerKey, LedgerEntry), StorageError> {
    Ok((
        LedgerKey::new(row.get(0)?),
        LedgerEntry {
            site_id: SiteId::from(row.get::<String>(1)?),
            last_checked: timestamp_column(row, 2)?,
        },
    ))
}

const UPSERT_LEDGER: &str = "INSERT INTO check_ledger (cursor_key, site_id, last_checked) VALUES (?, ?, ?)
     ON CONFLICT(cursor_key) DO UPDATE SET
         site_id = excluded.site_id,
         last_checked = MAX(check_ledger.last_checked, excluded.last_checked)";

const INSERT_SAMPLE: &str =
    "INSERT INTO probe_log (site_id, response_time_ms, checked_at) VALUES (?, ?, ?)";

#[async_trait]
impl SiteRegistry for LibsqlStore {
    async fn get_site(&self, id: &SiteId) -> Result<Option<Site>, StorageError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(&format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = ?"), params![id.as_str()])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(site_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn put_site(&self, site: &Site) -> Result<(), StorageError> {
        let conn = self.get_conn().await?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO sites ({SITE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"),
            params![
                site.id.as_str(),
                site.url.as_str(),
                site.email.as_str(),
                site.status.to_string(),
                timestamp_to_i64(site.last_checked),
                timestamp_to_i64(site.created_at),
                site.downtime_ms as i64
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_site(&self, id: &SiteId) -> Result<bool, StorageError> {
        let conn = self.get_conn().await?;
        let deleted = conn.execute("DELETE FROM sites WHERE id = ?", params![id.as_str()]).await?;
        Ok(deleted > 0)
    }

    async fn list_sites(&self) -> Result<Vec<Site>, StorageError> {
        let conn = self.get_conn().await?;
        let mut rows =
            conn.query(&format!("SELECT {SITE_COLUMNS} FROM sites ORDER BY id"), ()).await?;

        let mut sites = Vec::new();
        while let Some(row) = rows.next().await? {
            sites.push(site_from_row(&row)?);
        }
        Ok(sites)
    }

    async fn count_sites(&self) -> Result<u64, StorageError> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query("SELECT COUNT(*) FROM sites", ()).await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl CheckLedger for LibsqlStore {
    async fn put_entry(&self, key: LedgerKey, entry: &LedgerEntry) -> Result<(), StorageError> {
        let conn = self.get_conn().await?;
        conn.execute(
            UPSERT_LEDGER,
            params![key.get(), entry.site_id.as_str(), timestamp_to_i64(entry.last_checked)],
        )
        .await?;
        Ok(())
    }

    async fn scan_entries(
        &self,
        after: LedgerKey,
        limit: usize,
    ) -> Result<Vec<(LedgerKey, LedgerEntry)>, StorageError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT cursor_key, site_id, last_checked FROM check_ledger
                 WHERE cursor_key > ? ORDER BY cursor_key ASC LIMIT ?",
                params![after.get(), limit as i64],
            )
            .await?;

        let mut entries = Vec::with_capacity(limit);
        while let Some(row) = rows.next().await? {
            entries.push(entry_from_row(&row)?);
        }
        Ok(entries)
    }

    async fn delete_entry(&self, key: LedgerKey) -> Result<(), StorageError> {
        let conn = self.get_conn().await?;
        conn.execute("DELETE FROM check_ledger WHERE cursor_key = ?", params![key.get()]).await?;
        Ok(())
    }

    async fn last_key(&self) -> Result<Option<LedgerKey>, StorageError> {
        let conn = self.get_conn().await?;
        let mut rows = conn.query("SELECT MAX(cursor_key) FROM check_ledger", ()).await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<Option<i64>>(0)?.map(LedgerKey::new)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ProbeLog for LibsqlStore {
    async fn append_sample(&self, sample: &ProbeSample) -> Result<(), StorageError> {
        let conn = self.get_conn().await?;
        conn.execute(
            INSERT_SAMPLE,
            params![
                sample.site_id.as_str(),
                sample.response_time_ms as i64,
                timestamp_to_i64(sample.checked_at)
            ],
        )
        .await?;
        Ok(())
    }

    async fn recent_samples(
        &self,
        site_id: &SiteId,
        limit: usize,
    ) -> Result<Vec<ProbeSample>, StorageError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT site_id, response_time_ms, checked_at FROM probe_log
                 WHERE site_id = ? ORDER BY checked_at DESC, id DESC LIMIT ?",
                params![site_id.as_str(), limit as i64],
            )
            .await?;

        let mut samples = Vec::new();
        while let Some(row) = rows.next().await? {
            samples.push(ProbeSample {
                site_id: SiteId::from(row.get::<String>(0)?),
                response_time_ms: row.get::<i64>(1)?.max(0) as u64,
                checked_at: timestamp_column(&row, 2)?,
            });
        }
        Ok(samples)
    }

    async fn prune_samples(
        &self,
        keep_per_site: usize,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let conn = self.get_conn().await?;
        let removed = conn
            .execute(
                "DELETE FROM probe_log WHERE checked_at < ?1 OR id IN (
                     SELECT id FROM (
                         SELECT id, ROW_NUMBER() OVER (
                             PARTITION BY site_id ORDER BY checked_at DESC, id DESC
                         ) AS position FROM probe_log
                     ) WHERE position > ?2
                 )",
                params![timestamp_to_i64(older_than), keep_per_site as i64],
            )
            .await?;
        Ok(removed)
    }
}

#[async_trait]
impl Storage for LibsqlStore {
    async fn create_site(&self, key: LedgerKey, site: &Site) -> Result<(), StorageError> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;

        tx.execute(
            &format!("INSERT INTO sites ({SITE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"),
            params![
                site.id.as_str(),
                site.url.as_str(),
                site.email.as_str(),
                site.status.to_string(),
                timestamp_to_i64(site.last_checked),
                timestamp_to_i64(site.created_at),
                site.downtime_ms as i64
            ],
        )
        .await?;
        // Plain insert: a taken key must fail instead of re-pointing the entry
        tx.execute(
            "INSERT INTO check_ledger (cursor_key, site_id, last_checked) VALUES (?, ?, ?)",
            params![key.get(), site.id.as_str(), timestamp_to_i64(site.last_checked)],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_check(&self, record: &CheckRecord) -> Result<bool, StorageError> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        let site = &record.site;

        let updated = tx
            .execute(
                "UPDATE sites SET status = ?, last_checked = ?, downtime_ms = ? WHERE id = ?",
                params![
                    site.status.to_string(),
                    timestamp_to_i64(site.last_checked),
                    site.downtime_ms as i64,
                    site.id.as_str()
                ],
            )
            .await?;

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.execute(
            UPSERT_LEDGER,
            params![record.ledger_key.get(), site.id.as_str(), timestamp_to_i64(site.last_checked)],
        )
        .await?;

        if let Some(sample) = &record.sample {
            tx.execute(
                INSERT_SAMPLE,
                params![
                    sample.site_id.as_str(),
                    sample.response_time_ms as i64,
                    timestamp_to_i64(sample.checked_at)
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn remove_site(&self, id: &SiteId) -> Result<bool, StorageError> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;

        let deleted = tx.execute("DELETE FROM sites WHERE id = ?", params![id.as_str()]).await?;
        tx.execute("DELETE FROM check_ledger WHERE site_id = ?", params![id.as_str()]).await?;
        tx.execute("DELETE FROM probe_log WHERE site_id = ?", params![id.as_str()]).await?;

        tx.commit().await?;
        Ok(deleted > 0)
    }
}
