use crate::error::{BittorrentError, Result};
use crate::peer::{Handshake, HANDSHAKE_LEN};
use crate::session::{ProgressObserver, SessionConfig, SessionHandle, TorrentSession};
use crate::storage::StorageManager;
use crate::torrent::{MetadataProvider, Metainfo};
use crate::tracker::generate_peer_id;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Time an inbound peer gets to send its handshake
const INBOUND_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the BitTorrent client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub download_dir: String,
    pub listen_port: u16,
    pub max_peers: usize,
    /// Per-connection caps in bytes/s, 0 = unlimited
    pub upload_limit: u64,
    pub download_limit: u64,
    /// Keep seeding after completion until interrupted
    pub seed: bool,
    /// Peers to dial for every torrent, on top of what trackers return
    pub peers: Vec<SocketAddr>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: "./downloads".to_string(),
            listen_port: 6881,
            max_peers: 50,
            upload_limit: 0,
            download_limit: 0,
            seed: false,
            peers: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn session_config(&self, metainfo: &Metainfo) -> SessionConfig {
        SessionConfig {
            pipeline_depth: SessionConfig::pipeline_depth_for(metainfo.piece_length),
            max_peers: self.max_peers,
            upload_limit: self.upload_limit,
            download_limit: self.download_limit,
            seed: self.seed,
            listen_port: self.listen_port,
            ..SessionConfig::default()
        }
    }
}

type Registry = Arc<Mutex<HashMap<[u8; 20], SessionHandle>>>;

/// Main BitTorrent client: runs any number of torrents and routes inbound
/// peers to the right one by info hash
pub struct TorrentClient {
    config: ClientConfig,
    peer_id: [u8; 20],
    torrents: Registry,
}

impl TorrentClient {
    pub fn new(config: ClientConfig) -> Self {
        let peer_id = generate_peer_id();
        info!("Client initialized with peer_id: {}", hex::encode(peer_id));

        Self {
            config,
            peer_id,
            torrents: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a session for `metainfo`. `None` if the torrent is already
    /// running.
    pub fn add_torrent(
        &self,
        metainfo: Metainfo,
        observer: Arc<dyn ProgressObserver>,
    ) -> Option<JoinHandle<Result<()>>> {
        let info_hash = metainfo.info_hash;
        let mut torrents = self.torrents.lock();
        if torrents.contains_key(&info_hash) {
            info!("Torrent {} is already running", metainfo.info_hash_hex());
            return None;
        }

        let storage = StorageManager::on_disk(&self.config.download_dir, &metainfo);
        let config = self.config.session_config(&metainfo);
        let (session, handle) =
            TorrentSession::new(Arc::new(metainfo), storage, self.peer_id, config, observer);
        if !self.config.peers.is_empty() {
            handle.add_peers(self.config.peers.clone());
        }
        torrents.insert(info_hash, handle);

        let registry = self.torrents.clone();
        Some(tokio::spawn(async move {
            let result = session.run().await;
            registry.lock().remove(&info_hash);
            result
        }))
    }

    /// Load a torrent through `provider` and start it
    pub async fn add_from<P: MetadataProvider>(
        &self,
        provider: &P,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<Option<JoinHandle<Result<()>>>> {
        let metainfo = provider.metadata().await?;
        info!("Torrent: {}", metainfo.name);
        info!("Total size: {} bytes", metainfo.total_length);
        info!("Pieces: {}", metainfo.num_pieces());
        info!("Info hash: {}", metainfo.info_hash_hex());
        Ok(self.add_torrent(metainfo, observer))
    }

    pub fn torrent_count(&self) -> usize {
        self.torrents.lock().len()
    }

    /// Ask every running session to shut down
    pub fn stop_all(&self) {
        for handle in self.torrents.lock().values() {
            handle.stop();
        }
    }

    /// Accept peers on the configured port. Returns the bound address.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port))
            .await
            .map_err(|e| {
                BittorrentError::NetworkError(format!(
                    "Cannot listen on port {}: {}",
                    self.config.listen_port, e
                ))
            })?;
        let local = listener.local_addr()?;
        info!("Listening for peers on {}", local);

        let registry = self.torrents.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        tokio::spawn(dispatch_inbound(stream, addr, registry.clone()));
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok((local, task))
    }
}

impl Default for TorrentClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

/// Read the handshake of an accepted connection and hand the stream to the
/// session serving that info hash
async fn dispatch_inbound(mut stream: TcpStream, addr: SocketAddr, registry: Registry) {
    let read = time::timeout(INBOUND_HANDSHAKE_TIMEOUT, read_handshake(&mut stream));
    let handshake = match read.await {
        Ok(Ok(handshake)) => handshake,
        Ok(Err(e)) => {
            debug!("Bad handshake from {}: {}", addr, e);
            return;
        }
        Err(_) => {
            debug!("Handshake from {} timed out", addr);
            return;
        }
    };

    let handle = registry.lock().get(&handshake.info_hash).cloned();
    match handle {
        Some(handle) => handle.accept(stream, addr, handshake),
        None => warn!(
            "Peer {} asked for unknown torrent {}",
            addr,
            hex::encode(handshake.info_hash)
        ),
    }
}

/// Reads exactly the handshake so no message bytes are consumed
async fn read_handshake(stream: &mut TcpStream) -> Result<Handshake> {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
    loop {
        let needed = match buf.first() {
            Some(&pstrlen) => 49 + pstrlen as usize,
            None => 1,
        };
        if buf.len() >= needed {
            return Handshake::decode(&mut buf)?.ok_or_else(|| {
                BittorrentError::ProtocolFormat("Incomplete handshake".to_string())
            });
        }

        let mut chunk = vec![0u8; needed - buf.len()];
        stream.read_exact(&mut chunk).await?;
        buf.extend_from_slice(&chunk);
    }
}
