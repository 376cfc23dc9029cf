use super::http::HttpTracker;
use super::udp::UdpTracker;
use super::{TrackerRequest, TrackerResponse};
use crate::error::{BittorrentError, Result};
use tracing::info;
use url::Url;

/// One tracker, reached over whichever transport its URL names
pub enum TrackerClient {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl TrackerClient {
    pub fn from_url(announce: &str) -> Result<Self> {
        let url = Url::parse(announce)?;
        match url.scheme() {
            "http" | "https" => Ok(TrackerClient::Http(HttpTracker::new(url)?)),
            "udp" => Ok(TrackerClient::Udp(UdpTracker::new(&url)?)),
            scheme => Err(BittorrentError::TrackerError(format!(
                "Unsupported tracker scheme '{}'",
                scheme
            ))),
        }
    }

    /// Send a request to a tracker and get the peer list
    pub async fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse> {
        let response = match self {
            TrackerClient::Http(tracker) => tracker.announce(request).await?,
            TrackerClient::Udp(tracker) => tracker.announce(request).await?,
        };

        info!(
            "Received {} peers from tracker (interval: {}s, {} seeders, {} leechers)",
            response.peers.len(),
            response.interval,
            response.seeders,
            response.leechers
        );
        Ok(response)
    }
}
