/// Monitoring engine module - probes sites and keeps them on schedule
///
/// This module is responsible for:
/// - Executing HTTP/HTTPS reachability probes
/// - Deciding up/down transitions
/// - Keeping exactly one pending check per site
pub mod checker;
pub mod executor;
pub mod liveness;
pub mod queue;
pub mod scheduler;
pub mod types;

pub use checker::{Checker, HttpChecker};
pub use executor::{ExecutionOutcome, MonitoringExecutor};
pub use scheduler::{MonitoringScheduler, SchedulerHandle, SchedulerSnapshot};
pub use types::{ProbeOutcome, ProbeSuccess, SiteStatus};
