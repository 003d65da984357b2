use anyhow::Result;
use chrono::Utc;
use reqwest::{Method, redirect};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use url::Url;

use super::types::{ProbeOutcome, ProbeSuccess};
use crate::config::{ProbeMethod, ProbeSettings};
use crate::error::ProbeFailure;

/// Performs one bounded-time reachability probe.
///
/// Implementations never touch stored state; the caller owns persistence.
#[async_trait::async_trait]
pub trait Checker: Send + Sync {
    async fn check(&self, target: &str) -> ProbeOutcome;
}

/// HTTP/HTTPS checker
pub struct HttpChecker {
    client: reqwest::Client,
    method: Method,
    timeout: Duration,
    allowed_status_codes: BTreeSet<u16>,
}

impl HttpChecker {
    pub fn new(settings: &ProbeSettings) -> Result<Self> {
        // Redirects are answers, not detours: 301/302 count as reachable.
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent.clone())
            .redirect(redirect::Policy::none())
            .no_proxy()
            .build()?;

        let method = match settings.method {
            ProbeMethod::Head => Method::HEAD,
            ProbeMethod::Get => Method::GET,
        };

        Ok(Self {
            client,
            method,
            timeout: settings.timeout,
            allowed_status_codes: settings.allowed_status_codes.clone(),
        })
    }
}

/// Reject anything that is not an absolute http(s) URL with a host
pub fn parse_target(target: &str) -> Result<Url, ProbeFailure> {
    let target = target.trim();
    if target.is_empty() {
        return Err(ProbeFailure::InvalidUrl("missing url".to_string()));
    }

    let url = Url::parse(target).map_err(|e| ProbeFailure::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(ProbeFailure::InvalidUrl(format!("unsupported scheme {other}"))),
    }
    if url.host_str().is_none() {
        return Err(ProbeFailure::InvalidUrl("url has no host".to_string()));
    }
    Ok(url)
}

#[async_trait::async_trait]
impl Checker for HttpChecker {
    async fn check(&self, target: &str) -> ProbeOutcome {
        let url = parse_target(target)?;

        let started_at = Utc::now();
        let start = Instant::now();

        let request = self.client.request(self.method.clone(), url).send();
        let response = match timeout(self.timeout, request).await {
            Err(_) => return Err(ProbeFailure::Timeout(self.timeout)),
            Ok(Err(e)) if e.is_timeout() => return Err(ProbeFailure::Timeout(self.timeout)),
            Ok(Err(e)) if e.is_builder() => return Err(ProbeFailure::InvalidUrl(e.to_string())),
            Ok(Err(e)) => return Err(ProbeFailure::Unreachable(e.to_string())),
            Ok(Ok(response)) => response,
        };

        let latency = start.elapsed();
        let status_code = response.status().as_u16();

        if self.allowed_status_codes.contains(&status_code) {
            Ok(ProbeSuccess { started_at, latency, status_code })
        } else {
            Err(ProbeFailure::BadStatus(status_code))
        }
    }
}
