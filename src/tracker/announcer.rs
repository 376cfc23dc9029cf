use super::{TrackerClient, TrackerEvent, TrackerRequest};
use crate::error::Result;
use crate::session::{SessionContext, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

/// Used until a tracker tells us its interval
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1800);
const MIN_INTERVAL: Duration = Duration::from_secs(30);
/// Cap on the best-effort `completed`/`stopped` announces at shutdown
const FAREWELL_TIMEOUT: Duration = Duration::from_secs(5);

/// Session lifecycle as seen by announcers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceState {
    Downloading,
    Completed,
    Stopping,
}

/// Periodic announce loop for one tracker URL
pub struct Announcer {
    url: String,
    client: TrackerClient,
    ctx: Arc<SessionContext>,
    state: watch::Receiver<AnnounceState>,
    completed_sent: bool,
}

impl Announcer {
    pub fn new(
        url: String,
        client: TrackerClient,
        ctx: Arc<SessionContext>,
        state: watch::Receiver<AnnounceState>,
    ) -> Self {
        Self {
            url,
            client,
            ctx,
            state,
            completed_sent: false,
        }
    }

    pub async fn run(mut self) {
        let mut event = Some(TrackerEvent::Started);
        let mut interval = DEFAULT_INTERVAL;

        loop {
            let wait = match self.announce(event).await {
                Ok(next) => {
                    interval = next;
                    event = None;
                    interval
                }
                // only the initial announce is retried early
                Err(e) if event == Some(TrackerEvent::Started) => {
                    warn!("Announce to {} failed, retrying: {}", self.url, e);
                    self.ctx.config.tracker_backoff
                }
                Err(e) => {
                    warn!("Announce to {} failed: {}", self.url, e);
                    event = None;
                    interval
                }
            };

            tokio::select! {
                _ = time::sleep(wait) => {}
                changed = self.state.changed() => {
                    let state = *self.state.borrow();
                    if changed.is_err() || state == AnnounceState::Stopping {
                        break;
                    }
                    if state == AnnounceState::Completed && !self.completed_sent {
                        event = Some(TrackerEvent::Completed);
                    }
                }
            }
        }

        if self.ctx.left() == 0 && !self.completed_sent {
            self.farewell(TrackerEvent::Completed).await;
        }
        self.farewell(TrackerEvent::Stopped).await;
        debug!("Announcer for {} stopped", self.url);
    }

    /// Announce once, returning the delay the tracker asked for
    async fn announce(&mut self, event: Option<TrackerEvent>) -> Result<Duration> {
        info!("Announcing to tracker: {} (event: {:?})", self.url, event);

        let response = self.client.announce(&self.request(event)).await?;
        if event == Some(TrackerEvent::Completed) {
            self.completed_sent = true;
        }
        if !response.peers.is_empty() {
            self.ctx.emit(SessionEvent::PeersDiscovered(response.peers));
        }
        Ok(Duration::from_secs(response.interval).max(MIN_INTERVAL))
    }

    /// Best-effort announce that is never retried
    async fn farewell(&mut self, event: TrackerEvent) {
        match time::timeout(FAREWELL_TIMEOUT, self.announce(Some(event))).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!("{} announce to {} failed: {}", event.as_str(), self.url, e),
            Err(_) => debug!("{} announce to {} timed out", event.as_str(), self.url),
        }
    }

    fn request(&self, event: Option<TrackerEvent>) -> TrackerRequest {
        TrackerRequest {
            info_hash: self.ctx.info_hash(),
            peer_id: self.ctx.peer_id,
            port: self.ctx.config.listen_port,
            uploaded: self.ctx.uploaded(),
            downloaded: self.ctx.downloaded(),
            left: self.ctx.left(),
            event,
        }
    }
}
