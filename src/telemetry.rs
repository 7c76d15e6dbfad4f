// Status telemetry over Zenoh
//
// Publishing runs on its own task. The director loop only replaces the value
// in a `watch` cell, so a slow `put` never delays a tick.
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zenoh::pubsub::Publisher;

use crate::config::{TOPIC_LINK, TOPIC_STATUS};
use crate::messages::LinkStatus;
use crate::state::DirectorStatus;

pub struct Telemetry {
    _session: zenoh::Session,
    status: Publisher<'static>,
    link: Publisher<'static>,
    last_link: Option<LinkStatus>,
}

impl Telemetry {
    pub async fn open() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        info!("Opening Zenoh session...");
        let session = zenoh::open(zenoh::Config::default()).await?;
        let status = session.declare_publisher(TOPIC_STATUS).await?;
        let link = session.declare_publisher(TOPIC_LINK).await?;
        info!("Publishing to: {}, {}", TOPIC_STATUS, TOPIC_LINK);

        Ok(Self {
            _session: session,
            status,
            link,
            last_link: None,
        })
    }

    pub async fn publish_status(&self, status: &DirectorStatus) {
        match serde_json::to_string(status) {
            Ok(json) => {
                if let Err(e) = self.status.put(json).await {
                    warn!("Failed to publish status: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode status: {}", e),
        }
    }

    /// Publish the link status when it differs from the last one sent
    pub async fn publish_link(&mut self, link: &LinkStatus) {
        if self.last_link.as_ref() == Some(link) {
            return;
        }
        match serde_json::to_string(link) {
            Ok(json) => match self.link.put(json).await {
                Ok(()) => self.last_link = Some(link.clone()),
                Err(e) => warn!("Failed to publish link status: {}", e),
            },
            Err(e) => warn!("Failed to encode link status: {}", e),
        }
    }
}

/// One value to put on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Publication {
    Status(DirectorStatus),
    Link(LinkStatus),
}

/// Telemetry inputs: the director's snapshot cell and the link status cell
pub struct TelemetryFeed {
    status: watch::Receiver<DirectorStatus>,
    link: watch::Receiver<LinkStatus>,
    link_open: bool,
}

impl TelemetryFeed {
    pub fn new(status: watch::Receiver<DirectorStatus>, link: watch::Receiver<LinkStatus>) -> Self {
        Self {
            status,
            link,
            link_open: true,
        }
    }

    /// Wait for the next changed value. `None` once the director drops its
    /// status sender.
    pub async fn next(&mut self) -> Option<Publication> {
        loop {
            tokio::select! {
                changed = self.status.changed() => {
                    changed.ok()?;
                    return Some(Publication::Status(self.status.borrow_and_update().clone()));
                }
                changed = self.link.changed(), if self.link_open => match changed {
                    Ok(()) => return Some(Publication::Link(self.link.borrow_and_update().clone())),
                    // no link threads: keep serving status alone
                    Err(_) => self.link_open = false,
                },
            }
        }
    }
}

/// Open the session and publish until the feed closes
pub fn spawn(mut feed: TelemetryFeed) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut telemetry = match Telemetry::open().await {
            Ok(t) => t,
            Err(e) => {
                warn!("Telemetry disabled: {}", e);
                return;
            }
        };
        // current link state first, then changes
        let link = feed.link.borrow_and_update().clone();
        telemetry.publish_link(&link).await;

        while let Some(publication) = feed.next().await {
            match publication {
                Publication::Status(status) => telemetry.publish_status(&status).await,
                Publication::Link(link) => telemetry.publish_link(&link).await,
            }
        }
        info!("Telemetry stopped");
    })
}
