use crate::error::BittorrentError;
use crate::peer::{Bitfield, Handshake, PeerCommand, PeerShared};
use crate::piece::{PieceSelector, PieceStore, BLOCK_SIZE};
use crate::rate::RATE_WINDOW;
use crate::torrent::Metainfo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// Protocol tunables for one torrent session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Block requests in flight per peer
    pub pipeline_depth: usize,
    pub keepalive_interval: Duration,
    /// Disconnect a peer that has sent nothing for this long
    pub inactivity_timeout: Duration,
    pub connect_timeout: Duration,
    pub choke_interval: Duration,
    pub rate_window: Duration,
    pub rate_interval: Duration,
    pub tracker_backoff: Duration,
    pub persist_attempts: u32,
    /// Poll period while waiting for pieces to reach disk at shutdown
    pub flush_poll: Duration,
    pub max_peers: usize,
    /// Per-connection caps in bytes/s, 0 = unlimited
    pub upload_limit: u64,
    pub download_limit: u64,
    /// Keep serving after the download completes
    pub seed: bool,
    pub listen_port: u16,
}

impl SessionConfig {
    /// Default depth: one piece's worth of blocks, capped at 64
    pub fn pipeline_depth_for(piece_length: u64) -> usize {
        (piece_length.div_ceil(BLOCK_SIZE as u64) as usize).clamp(1, 64)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 16,
            keepalive_interval: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(100),
            connect_timeout: Duration::from_secs(10),
            choke_interval: Duration::from_secs(10),
            rate_window: RATE_WINDOW,
            rate_interval: Duration::from_secs(1),
            tracker_backoff: Duration::from_secs(10),
            persist_attempts: 3,
            flush_poll: Duration::from_millis(200),
            max_peers: 50,
            upload_limit: 0,
            download_limit: 0,
            seed: false,
            listen_port: 6881,
        }
    }
}

/// Things that happen outside the session task and need its attention
#[derive(Debug)]
pub enum SessionEvent {
    /// A tracker returned these addresses
    PeersDiscovered(Vec<SocketAddr>),
    /// A remote peer connected to us; its handshake is already consumed
    Inbound {
        stream: TcpStream,
        addr: SocketAddr,
        handshake: Handshake,
    },
    PieceCompleted { index: usize, from: SocketAddr },
    PersistFailed { index: usize, error: BittorrentError },
    PeerClosed(SocketAddr),
}

/// Session-side handle on a running connection
pub struct PeerHandle {
    pub commands: mpsc::UnboundedSender<PeerCommand>,
    pub shared: Arc<PeerShared>,
}

/// State shared between the session task and every peer task
pub struct SessionContext {
    pub metainfo: Arc<Metainfo>,
    pub peer_id: [u8; 20],
    pub store: PieceStore,
    pub selector: PieceSelector,
    pub config: SessionConfig,
    peers: Mutex<HashMap<SocketAddr, PeerHandle>>,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionContext {
    pub fn new(
        metainfo: Arc<Metainfo>,
        peer_id: [u8; 20],
        store: PieceStore,
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            metainfo,
            peer_id,
            store,
            selector: PieceSelector::new(),
            config,
            peers: Mutex::new(HashMap::new()),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            events,
        }
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.metainfo.info_hash
    }

    pub fn emit(&self, event: SessionEvent) {
        // the receiver only goes away when the session is finished
        let _ = self.events.send(event);
    }

    /// Add a peer to the peer set. `None` when it is already connected or
    /// the set is full.
    pub fn register_peer(
        &self,
        addr: SocketAddr,
    ) -> Option<(Arc<PeerShared>, mpsc::UnboundedReceiver<PeerCommand>)> {
        let mut peers = self.peers.lock();
        if peers.contains_key(&addr) || peers.len() >= self.config.max_peers {
            return None;
        }

        let (commands, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PeerShared::new(self.config.rate_window));
        peers.insert(
            addr,
            PeerHandle {
                commands,
                shared: shared.clone(),
            },
        );
        Some((shared, rx))
    }

    /// Remove a peer and take back everything it contributed: its rarity
    /// counts and its claim on `active_piece`. Happens under the peer-set
    /// lock so the removal is observed as one step.
    pub fn detach_peer(&self, addr: SocketAddr, bitfield: &Bitfield, active_piece: Option<usize>) {
        let mut peers = self.peers.lock();
        peers.remove(&addr);
        self.store.retract_availability(bitfield);
        if let Some(index) = active_piece {
            self.store.release(index);
        }
        debug!("Peer {} detached ({} remaining)", addr, peers.len());
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Every connected peer with its shared state
    pub fn peers(&self) -> Vec<(SocketAddr, Arc<PeerShared>)> {
        self.peers
            .lock()
            .iter()
            .map(|(addr, handle)| (*addr, handle.shared.clone()))
            .collect()
    }

    pub fn send(&self, addr: &SocketAddr, command: PeerCommand) {
        if let Some(handle) = self.peers.lock().get(addr) {
            let _ = handle.commands.send(command);
        }
    }

    /// Tell every peer except `except` that we have `index`. Each
    /// connection decides whether its remote still needs the `have`.
    pub fn broadcast_have(&self, index: usize, except: Option<SocketAddr>) {
        for (addr, handle) in self.peers.lock().iter() {
            if Some(*addr) != except {
                let _ = handle.commands.send(PeerCommand::Have(index as u32));
            }
        }
    }

    pub fn shutdown_peers(&self) {
        for handle in self.peers.lock().values() {
            let _ = handle.commands.send(PeerCommand::Shutdown);
        }
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Bytes still to verify
    pub fn left(&self) -> u64 {
        self.metainfo
            .total_length
            .saturating_sub(self.store.completed_bytes())
    }
}
