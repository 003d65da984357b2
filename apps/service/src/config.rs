use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use std::{env, fmt, fs, path};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// HTTP method used for probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeMethod {
    Head,
    Get,
}

impl FromStr for ProbeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HEAD" => Ok(ProbeMethod::Head),
            "GET" => Ok(ProbeMethod::Get),
            other => Err(format!("expected HEAD or GET, got {other}")),
        }
    }
}

impl fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeMethod::Head => write!(f, "HEAD"),
            ProbeMethod::Get => write!(f, "GET"),
        }
    }
}

/// Uniform jitter range added to every armed probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterRange {
    min: Duration,
    max: Duration,
}

impl JitterRange {
    pub fn new(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvertedJitter {
                min_ms: min.as_millis() as u64,
                max_ms: max.as_millis() as u64,
            });
        }
        Ok(Self { min, max })
    }

    /// Always `d`
    pub fn fixed(d: Duration) -> Self {
        Self { min: d, max: d }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample(&self) -> Duration {
        use rand::Rng;

        if self.min == self.max {
            return self.min;
        }
        let millis = rand::thread_rng()
            .gen_range(self.min.as_millis() as u64..=self.max.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub jitter: JitterRange,
    /// Ledger entries read per reconcile page
    pub page_size: usize,
    pub max_concurrent_probes: usize,
    /// Full rescan period; `None` disables it
    pub rescan_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub method: ProbeMethod,
    pub allowed_status_codes: BTreeSet<u16>,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub path: String,
    pub pool_size: usize,
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub max_samples_per_site: usize,
    pub max_age: Duration,
    pub cleanup_interval: Duration,
}

/// Validated configuration. Every value in here has passed the startup checks.
#[derive(Debug, Clone)]
pub struct Config {
    pub scheduler: SchedulerSettings,
    pub probe: ProbeSettings,
    pub database: DatabaseSettings,
    pub retention: RetentionSettings,
}

/// On-disk shape of the config file, every key optional
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub scheduler: FileScheduler,
    pub probe: FileProbe,
    pub database: FileDatabase,
    pub retention: FileRetention,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileScheduler {
    pub interval_ms: Option<u64>,
    pub jitter_min_ms: Option<u64>,
    pub jitter_max_ms: Option<u64>,
    pub page_size: Option<usize>,
    pub max_concurrent_probes: Option<usize>,
    pub rescan_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileProbe {
    pub timeout_ms: Option<u64>,
    pub method: Option<ProbeMethod>,
    pub allowed_status_codes: Option<Vec<u16>>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileDatabase {
    pub path: Option<String>,
    pub pool_size: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileRetention {
    pub max_samples_per_site: Option<usize>,
    pub max_age_days: Option<u64>,
    pub cleanup_interval_ms: Option<u64>,
}

const DEFAULT_PROBE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_JITTER_MIN_MS: u64 = 1_000;
const DEFAULT_JITTER_MAX_MS: u64 = 120_000;
const DEFAULT_PAGE_SIZE: usize = 10;
const DEFAULT_MAX_CONCURRENT_PROBES: usize = 64;
const DEFAULT_RESCAN_INTERVAL_MS: u64 = 60_000;
const DEFAULT_ALLOWED_STATUS_CODES: [u16; 3] = [200, 301, 302];
const DEFAULT_DATABASE_PATH: &str = "uptime.db";
const DEFAULT_POOL_SIZE: usize = 8;
const DEFAULT_MAX_SAMPLES_PER_SITE: usize = 1_000;
const DEFAULT_MAX_AGE_DAYS: u64 = 30;
const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 3_600_000;

fn default_user_agent() -> String {
    format!("uptime-service/{}", env!("CARGO_PKG_VERSION"))
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/uptime/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("uptime/config.toml"))
}

/// Parse an environment override, naming the variable on failure
fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn parse_status_codes(raw: &str) -> Result<Vec<u16>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u16>().map_err(|e| ConfigError::Invalid {
                key: "ALLOWED_STATUS_CODES",
                value: raw.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

fn positive(key: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

impl Config {
    /// Load configuration from the optional file and the process environment
    ///
    /// Without an explicit path the default location is read only if it
    /// exists. Environment variables override the file.
    pub fn load(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let file = match optional_path {
            Some(path) => Some(FileConfig::read(&normalize_toml_path(path.as_ref()))?),
            None => {
                let path = default_config_path()?;
                if path.exists() { Some(FileConfig::read(&path)?) } else { None }
            }
        };

        Self::from_sources(file.unwrap_or_default(), |key| env::var(key).ok())
    }

    /// Merge a file config with environment overrides and validate the result
    pub fn from_sources(
        file: FileConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let interval_ms = parse_var::<u64>(&lookup, "CHECK_INTERVAL_MS")?
            .or(file.scheduler.interval_ms)
            .ok_or(ConfigError::Missing("CHECK_INTERVAL_MS"))?;
        if interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }

        let timeout_ms = parse_var::<u64>(&lookup, "PROBE_TIMEOUT_MS")?
            .or(file.probe.timeout_ms)
            .unwrap_or(DEFAULT_PROBE_TIMEOUT_MS);
        if timeout_ms == 0 || timeout_ms >= interval_ms {
            return Err(ConfigError::TimeoutNotBelowInterval { timeout_ms, interval_ms });
        }

        let jitter = JitterRange::new(
            Duration::from_millis(
                parse_var(&lookup, "JITTER_MIN_MS")?
                    .or(file.scheduler.jitter_min_ms)
                    .unwrap_or(DEFAULT_JITTER_MIN_MS),
            ),
            Duration::from_millis(
                parse_var(&lookup, "JITTER_MAX_MS")?
                    .or(file.scheduler.jitter_max_ms)
                    .unwrap_or(DEFAULT_JITTER_MAX_MS),
            ),
        )?;

        let method = parse_var::<ProbeMethod>(&lookup, "PROBE_METHOD")?
            .or(file.probe.method)
            .unwrap_or(ProbeMethod::Head);

        let codes = match lookup("ALLOWED_STATUS_CODES") {
            Some(raw) if !raw.trim().is_empty() => parse_status_codes(&raw)?,
            _ => file
                .probe
                .allowed_status_codes
                .unwrap_or_else(|| DEFAULT_ALLOWED_STATUS_CODES.to_vec()),
        };
        let allowed_status_codes: BTreeSet<u16> = codes.into_iter().collect();
        if allowed_status_codes.is_empty() {
            return Err(ConfigError::EmptyStatusSet);
        }

        let page_size = positive(
            "SCAN_PAGE_SIZE",
            parse_var(&lookup, "SCAN_PAGE_SIZE")?
                .or(file.scheduler.page_size)
                .unwrap_or(DEFAULT_PAGE_SIZE),
        )?;
        let max_concurrent_probes = positive(
            "MAX_CONCURRENT_PROBES",
            parse_var(&lookup, "MAX_CONCURRENT_PROBES")?
                .or(file.scheduler.max_concurrent_probes)
                .unwrap_or(DEFAULT_MAX_CONCURRENT_PROBES),
        )?;
        let rescan_ms = parse_var::<u64>(&lookup, "RESCAN_INTERVAL_MS")?
            .or(file.scheduler.rescan_interval_ms)
            .unwrap_or(DEFAULT_RESCAN_INTERVAL_MS);

        let user_agent = lookup("USER_AGENT")
            .filter(|ua| !ua.trim().is_empty())
            .or(file.probe.user_agent)
            .unwrap_or_else(default_user_agent);

        let database = DatabaseSettings {
            path: lookup("DATABASE_PATH")
                .filter(|p| !p.trim().is_empty())
                .or(file.database.path)
                .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string()),
            pool_size: positive(
                "DATABASE_POOL_SIZE",
                parse_var(&lookup, "DATABASE_POOL_SIZE")?
                    .or(file.database.pool_size)
                    .unwrap_or(DEFAULT_POOL_SIZE),
            )?,
        };

        let max_age_days = parse_var::<u64>(&lookup, "LOG_MAX_AGE_DAYS")?
            .or(file.retention.max_age_days)
            .unwrap_or(DEFAULT_MAX_AGE_DAYS);
        let retention = RetentionSettings {
            max_samples_per_site: positive(
                "LOG_MAX_SAMPLES_PER_SITE",
                parse_var(&lookup, "LOG_MAX_SAMPLES_PER_SITE")?
                    .or(file.retention.max_samples_per_site)
                    .unwrap_or(DEFAULT_MAX_SAMPLES_PER_SITE),
            )?,
            max_age: Duration::from_secs(max_age_days.checked_mul(86_400).ok_or_else(|| {
                ConfigError::Invalid {
                    key: "LOG_MAX_AGE_DAYS",
                    value: max_age_days.to_string(),
                    reason: "too large".to_string(),
                }
            })?),
            cleanup_interval: Duration::from_millis(
                file.retention.cleanup_interval_ms.unwrap_or(DEFAULT_CLEANUP_INTERVAL_MS).max(1),
            ),
        };

        Ok(Self {
            scheduler: SchedulerSettings {
                interval: Duration::from_millis(interval_ms),
                jitter,
                page_size,
                max_concurrent_probes,
                rescan_interval: (rescan_ms > 0).then(|| Duration::from_millis(rescan_ms)),
            },
            probe: ProbeSettings {
                timeout: Duration::from_millis(timeout_ms),
                method,
                allowed_status_codes,
                user_agent,
            },
            database,
            retention,
        })
    }
}

impl FileConfig {
    fn read(path: &path::Path) -> Result<Self, ConfigError> {
        let raw_string = fs::read_to_string(path)?;
        Ok(toml::from_str(raw_string.as_str())?)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);
        let ms = |d: Duration| format!("{}ms", d.as_millis());

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Scheduler")?;
        write_1(f, "Check Interval", &ms(self.scheduler.interval))?;
        write_1(
            f,
            "Jitter",
            &format!("{}..={}", ms(self.scheduler.jitter.min()), ms(self.scheduler.jitter.max())),
        )?;
        write_1(f, "Page Size", &self.scheduler.page_size)?;
        write_1(f, "Max Concurrent Probes", &self.scheduler.max_concurrent_probes)?;
        write_1(
            f,
            "Rescan Interval",
            &self.scheduler.rescan_interval.map(ms).unwrap_or_else(|| "disabled".into()),
        )?;
        write_title_1(f, "Probe")?;
        write_1(f, "Method", &self.probe.method)?;
        write_1(f, "Timeout", &ms(self.probe.timeout))?;
        let codes: Vec<String> =
            self.probe.allowed_status_codes.iter().map(u16::to_string).collect();
        write_1(f, "Allowed Status Codes", &codes.join(","))?;
        write_1(f, "User Agent", &self.probe.user_agent)?;
        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path)?;
        write_1(f, "Pool Size", &self.database.pool_size)?;
        write_title_1(f, "Retention")?;
        write_1(f, "Max Samples Per Site", &self.retention.max_samples_per_site)?;
        write_1(f, "Max Age", &format!("{}d", self.retention.max_age.as_secs() / 86_400))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_interval_is_required() {
        let err = Config::from_sources(FileConfig::default(), lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CHECK_INTERVAL_MS")));
    }

    #[test]
    fn test_zero_and_negative_interval_rejected() {
        let err = Config::from_sources(FileConfig::default(), lookup(&[("CHECK_INTERVAL_MS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroInterval));

        let err =
            Config::from_sources(FileConfig::default(), lookup(&[("CHECK_INTERVAL_MS", "-5000")]))
                .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CHECK_INTERVAL_MS", .. }));
    }

    #[test]
    fn test_defaults_applied() {
        let config =
            Config::from_sources(FileConfig::default(), lookup(&[("CHECK_INTERVAL_MS", "60000")]))
                .unwrap();

        assert_eq!(config.scheduler.interval, Duration::from_secs(60));
        assert_eq!(config.scheduler.jitter.min(), Duration::from_secs(1));
        assert_eq!(config.scheduler.jitter.max(), Duration::from_secs(120));
        assert_eq!(config.scheduler.page_size, 10);
        assert_eq!(config.probe.method, ProbeMethod::Head);
        assert_eq!(config.probe.timeout, Duration::from_secs(10));
        assert_eq!(config.probe.allowed_status_codes, BTreeSet::from([200, 301, 302]));
        assert_eq!(config.database.path, "uptime.db");
    }

    #[test]
    fn test_timeout_must_be_below_interval() {
        let err = Config::from_sources(
            FileConfig::default(),
            lookup(&[("CHECK_INTERVAL_MS", "5000"), ("PROBE_TIMEOUT_MS", "5000")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::TimeoutNotBelowInterval { .. }));
    }

    #[test]
    fn test_inverted_jitter_rejected() {
        let err = Config::from_sources(
            FileConfig::default(),
            lookup(&[("CHECK_INTERVAL_MS", "60000"), ("JITTER_MIN_MS", "10"), ("JITTER_MAX_MS", "5")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvertedJitter { min_ms: 10, max_ms: 5 }));
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            [scheduler]
            interval_ms = 30000
            page_size = 25

            [probe]
            method = "GET"
            allowed_status_codes = [200]
            "#,
        )
        .unwrap();

        let config = Config::from_sources(
            file,
            lookup(&[("CHECK_INTERVAL_MS", "90000"), ("ALLOWED_STATUS_CODES", "200, 204,301")]),
        )
        .unwrap();

        assert_eq!(config.scheduler.interval, Duration::from_secs(90));
        assert_eq!(config.scheduler.page_size, 25);
        assert_eq!(config.probe.method, ProbeMethod::Get);
        assert_eq!(config.probe.allowed_status_codes, BTreeSet::from([200, 204, 301]));
    }

    #[test]
    fn test_bad_method_and_empty_codes() {
        let err = Config::from_sources(
            FileConfig::default(),
            lookup(&[("CHECK_INTERVAL_MS", "60000"), ("PROBE_METHOD", "POST")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PROBE_METHOD", .. }));

        let file: FileConfig = toml::from_str("[probe]\nallowed_status_codes = []").unwrap();
        let err = Config::from_sources(file, lookup(&[("CHECK_INTERVAL_MS", "60000")])).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyStatusSet));
    }

    #[test]
    fn test_rescan_can_be_disabled() {
        let config = Config::from_sources(
            FileConfig::default(),
            lookup(&[("CHECK_INTERVAL_MS", "60000"), ("RESCAN_INTERVAL_MS", "0")]),
        )
        .unwrap();
        assert!(config.scheduler.rescan_interval.is_none());
        assert!(config.to_string().contains("disabled"));
    }

    #[test]
    fn test_huge_max_age_rejected() {
        let err = Config::from_sources(
            FileConfig::default(),
            lookup(&[("CHECK_INTERVAL_MS", "60000"), ("LOG_MAX_AGE_DAYS", "18446744073709551615")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "LOG_MAX_AGE_DAYS", .. }));
    }

    #[test]
    fn test_jitter_sample_stays_in_range() {
        let jitter = JitterRange::new(Duration::from_millis(5), Duration::from_millis(15)).unwrap();
        for _ in 0..200 {
            let d = jitter.sample();
            assert!(d >= Duration::from_millis(5) && d <= Duration::from_millis(15));
        }
        assert_eq!(JitterRange::fixed(Duration::ZERO).sample(), Duration::ZERO);
    }
}
