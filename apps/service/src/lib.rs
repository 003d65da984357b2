//! Scheduled uptime checks for registered sites.
//!
//! Sites are registered with a URL and an owner address. A single scheduler
//! loop walks the check ledger, keeps one pending probe per site and records
//! every result, notifying the owner when a site goes down or comes back.

pub mod config;
pub mod database;
pub mod error;
pub mod monitoring;
pub mod notify;
pub mod orchestrator;
pub mod pool;
pub mod validation;
