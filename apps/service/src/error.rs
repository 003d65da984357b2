use std::time::Duration;

use thiserror::Error;

/// Invalid or missing configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid { key: &'static str, value: String, reason: String },

    #[error("check interval must be greater than zero")]
    ZeroInterval,

    #[error("probe timeout ({timeout_ms}ms) must be shorter than the check interval ({interval_ms}ms)")]
    TimeoutNotBelowInterval { timeout_ms: u64, interval_ms: u64 },

    #[error("jitter range is inverted: min {min_ms}ms > max {max_ms}ms")]
    InvertedJitter { min_ms: u64, max_ms: u64 },

    #[error("allowed status code set is empty")]
    EmptyStatusSet,

    #[error("could not determine a configuration directory")]
    ConfigPathUnavailable,

    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Why a single reachability probe did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("bad url: {0}")]
    InvalidUrl(String),

    #[error("unexpected status code {0}")]
    BadStatus(u16),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unreachable: {0}")]
    Unreachable(String),
}

/// User-correctable registration input problems. Nothing is stored when one
/// of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing url")]
    MissingUrl,

    #[error("bad url: {0}")]
    BadUrl(String),

    #[error("url is not reachable ({0})")]
    Unreachable(ProbeFailure),

    #[error("missing email")]
    MissingEmail,

    #[error("bad email: {0}")]
    BadEmail(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] libsql::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<deadpool::managed::PoolError<libsql::Error>> for StorageError {
    fn from(error: deadpool::managed::PoolError<libsql::Error>) -> Self {
        match error {
            deadpool::managed::PoolError::Backend(e) => StorageError::Database(e),
            other => StorageError::Pool(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification channel closed")]
    ChannelClosed,

    #[error("failed to deliver notification: {0}")]
    Delivery(String),
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("save failed: {0}")]
    Storage(#[from] StorageError),
}
