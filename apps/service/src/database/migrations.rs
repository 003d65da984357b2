use anyhow::Result;
use libsql::Connection;
use tracing::{debug, info};

struct Migration {
    version: i32,
    description: &'static str,
    statements: &'static [&'static str],
}

/// Applied in order, each in its own transaction. Append only.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Sites, check ledger and probe log",
    statements: &[
        "CREATE TABLE IF NOT EXISTS sites (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            email TEXT NOT NULL,
            status TEXT NOT NULL,
            last_checked INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            downtime_ms INTEGER NOT NULL DEFAULT 0
        )",
        // cursor_key doubles as the scan cursor, so it must be the rowid
        "CREATE TABLE IF NOT EXISTS check_ledger (
            cursor_key INTEGER PRIMARY KEY,
            site_id TEXT NOT NULL,
            last_checked INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_check_ledger_site ON check_ledger(site_id)",
        "CREATE TABLE IF NOT EXISTS probe_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            site_id TEXT NOT NULL,
            response_time_ms INTEGER NOT NULL,
            checked_at INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_probe_log_site_checked
            ON probe_log(site_id, checked_at DESC)",
    ],
}];

/// Latest schema version this build knows about
pub fn schema_version() -> i32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Bring the schema up to the latest version. Safe to run on every start.
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current = current_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        debug!(version = current, "Database schema is up to date");
        return Ok(());
    }

    for migration in pending {
        let tx = conn.transaction().await?;
        for statement in migration.statements {
            tx.execute(statement, ()).await?;
        }
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
            libsql::params![migration.version, chrono::Utc::now().timestamp(), migration.description],
        )
        .await?;
        tx.commit().await?;

        info!("Applied migration v{}: {}", migration.version, migration.description);
    }
    Ok(())
}

pub async fn current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;
    match rows.next().await? {
        Some(row) => Ok(row.get::<Option<i32>>(0)?.unwrap_or(0)),
        None => Ok(0),
    }
}
