/// Storage layer
///
/// This module provides the site registry, check ledger and probe log
/// interfaces together with a LibSQL (SQLite) backend and an in-process
/// backend.

pub mod memory;
pub mod migrations;
pub mod models;
pub mod repository;


pub use memory::MemoryStore;
pub use repository::{CheckLedger, LibsqlStore, ProbeLog, SiteRegistry, Storage};

use anyhow::Result;

use crate::config::DatabaseSettings;

/// Initialize database with schema
pub async fn initialize_database(conn: &libsql::Connection) -> Result<()> {
    migrations::run_migrations(conn).await
}

/// Open the configured database, bring its schema up to date and wrap it in a store
pub async fn connect(settings: &DatabaseSettings) -> Result<LibsqlStore> {
    let pool = crate::pool::open(&settings.path, settings.pool_size).await?;

    let conn = pool.get().await?;
    initialize_database(&conn).await?;
    drop(conn);

    Ok(LibsqlStore::new_from_pool(pool))
}
