use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::database::models::Site;
use crate::error::NotifyError;

/// Outward signals about a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteEvent {
    Registered,
    Down,
    Recovered,
}

impl std::fmt::Display for SiteEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SiteEvent::Registered => write!(f, "site.registered"),
            SiteEvent::Down => write!(f, "site.down"),
            SiteEvent::Recovered => write!(f, "site.recovered"),
        }
    }
}

/// A rendered message for the site owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub site: Site,
    pub event: SiteEvent,
}

impl Notification {
    pub fn subject(&self) -> String {
        match self.event {
            SiteEvent::Registered => format!("Your performance url for {}", self.site.url),
            SiteEvent::Down => format!("Your {} is down", self.site.url),
            SiteEvent::Recovered => format!("Your {} is back up", self.site.url),
        }
    }
}

/// Turns site events into messages for the owner.
///
/// Called after the triggering state has been persisted. Failures are logged
/// by the caller and never retried.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, site: &Site, event: SiteEvent) -> Result<(), NotifyError>;
}

/// Writes each notification to the log instead of sending it
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, site: &Site, event: SiteEvent) -> Result<(), NotifyError> {
        let notification = Notification { site: site.clone(), event };
        info!(
            site_id = %site.id,
            to = %site.email,
            %event,
            "{}",
            notification.subject()
        );
        Ok(())
    }
}

/// Forwards notifications over a channel to whoever delivers them
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, site: &Site, event: SiteEvent) -> Result<(), NotifyError> {
        self.tx
            .send(Notification { site: site.clone(), event })
            .map_err(|_| NotifyError::ChannelClosed)
    }
}
