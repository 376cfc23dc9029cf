mod bitfield;
mod connection;
mod message;
mod protocol;

pub use bitfield::Bitfield;
pub use connection::PeerConnection;
pub use message::{Block, BlockInfo, PeerMessage};
pub use protocol::{Handshake, HANDSHAKE_LEN};

use crate::rate::RateTracker;
use parking_lot::Mutex;
use std::time::Duration;

// Peer connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerState {
    /// Whether we are choking the peer
    pub am_choking: bool,
    /// Whether we are interested in the peer
    pub am_interested: bool,
    /// Whether the peer is choking us
    pub peer_choking: bool,
    /// Whether the peer is interested in us
    pub peer_interested: bool,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Instructions the session sends to a running connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Choke,
    Unchoke,
    /// We completed this piece
    Have(u32),
    Shutdown,
}

/// Connection state readable from outside the connection task
pub struct PeerShared {
    pub state: Mutex<PeerState>,
    /// Bytes received from the peer
    pub download: Mutex<RateTracker>,
    /// Bytes sent to the peer
    pub upload: Mutex<RateTracker>,
}

impl PeerShared {
    pub fn new(rate_window: Duration) -> Self {
        Self {
            state: Mutex::new(PeerState::default()),
            download: Mutex::new(RateTracker::new(rate_window)),
            upload: Mutex::new(RateTracker::new(rate_window)),
        }
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn download_rate(&self) -> f64 {
        self.download.lock().rate()
    }

    pub fn upload_rate(&self) -> f64 {
        self.upload.lock().rate()
    }
}
