mod context;

pub use context::{SessionConfig, SessionContext, SessionEvent};

#[cfg(test)]
pub(crate) use context::testing;

use crate::choke::{ChokeScheduler, PeerSnapshot};
use crate::error::Result;
use crate::peer::{Bitfield, Handshake, PeerCommand, PeerConnection};
use crate::piece::{PieceStore, SessionMode};
use crate::storage::StorageManager;
use crate::torrent::Metainfo;
use crate::tracker::{AnnounceState, Announcer, TrackerClient};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How long shutdown waits for trackers to take the `stopped` announce
const ANNOUNCER_GRACE: Duration = Duration::from_secs(6);

/// Notifications for whatever presents progress to the user
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress { num_done: usize, total: usize },
    RateUpdate { down_speed: f64, up_speed: f64 },
    /// Every piece verified
    Completed,
    /// Every piece on disk and the files closed
    Saved,
}

pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Control surface for a running session
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    stop: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    /// Hand over a connection the listener accepted for this torrent
    pub fn accept(&self, stream: TcpStream, addr: SocketAddr, handshake: Handshake) {
        let _ = self.events.send(SessionEvent::Inbound {
            stream,
            addr,
            handshake,
        });
    }

    pub fn add_peers(&self, peers: Vec<SocketAddr>) {
        let _ = self.events.send(SessionEvent::PeersDiscovered(peers));
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Drives one torrent from first announce to files closed
pub struct TorrentSession {
    ctx: Arc<SessionContext>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    stop: watch::Receiver<bool>,
    observer: Arc<dyn ProgressObserver>,
    choker: ChokeScheduler,
    announce_state: watch::Sender<AnnounceState>,
    announcers: Vec<JoinHandle<()>>,
    /// Pieces whose completion this task has processed
    num_done: usize,
}

impl TorrentSession {
    pub fn new(
        metainfo: Arc<Metainfo>,
        storage: StorageManager,
        peer_id: [u8; 20],
        config: SessionConfig,
        observer: Arc<dyn ProgressObserver>,
    ) -> (Self, SessionHandle) {
        let store = PieceStore::new(&metainfo, Arc::new(storage), config.persist_attempts);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (stop_tx, stop) = watch::channel(false);
        let (announce_state, _) = watch::channel(AnnounceState::Downloading);

        let ctx = SessionContext::new(metainfo, peer_id, store, config, events_tx.clone());
        let session = Self {
            ctx: Arc::new(ctx),
            events,
            stop,
            observer,
            choker: ChokeScheduler::default(),
            announce_state,
            announcers: Vec::new(),
            num_done: 0,
        };
        let handle = SessionHandle {
            events: events_tx,
            stop: Arc::new(stop_tx),
        };
        (session, handle)
    }

    pub async fn run(mut self) -> Result<()> {
        let meta = self.ctx.metainfo.clone();
        info!(
            "Starting {} ({} pieces, info hash {})",
            meta.name,
            meta.num_pieces(),
            meta.info_hash_hex()
        );

        self.ctx.store.storage().open().await?;
        self.start_announcers();

        let result = self.event_loop().await;
        if let Err(e) = &result {
            error!("Session for {} failed: {}", meta.name, e);
        }
        self.shutdown().await;
        result
    }

    fn start_announcers(&mut self) {
        for url in &self.ctx.metainfo.trackers {
            match TrackerClient::from_url(url) {
                Ok(client) => {
                    let announcer = Announcer::new(
                        url.clone(),
                        client,
                        self.ctx.clone(),
                        self.announce_state.subscribe(),
                    );
                    self.announcers.push(tokio::spawn(announcer.run()));
                }
                Err(e) => warn!("Skipping tracker {}: {}", url, e),
            }
        }

        if self.announcers.is_empty() {
            warn!("No usable tracker for {}", self.ctx.metainfo.name);
        }
    }

    async fn event_loop(&mut self) -> Result<()> {
        let config = self.ctx.config.clone();
        let mut choke_tick = time::interval(config.choke_interval);
        choke_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rate_tick = time::interval(config.rate_interval);
        rate_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // a dropped handle only means nobody can stop us any more
        let mut stoppable = true;

        loop {
            tokio::select! {
                Some(event) = self.events.recv() => {
                    if self.handle_event(event)? {
                        return Ok(());
                    }
                }
                _ = choke_tick.tick() => self.rechoke(),
                _ = rate_tick.tick() => self.report_rates(),
                changed = self.stop.changed(), if stoppable => {
                    if changed.is_err() {
                        stoppable = false;
                    } else if *self.stop.borrow() {
                        info!("Stopping {}", self.ctx.metainfo.name);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns true when the session should shut down
    fn handle_event(&mut self, event: SessionEvent) -> Result<bool> {
        match event {
            SessionEvent::PeersDiscovered(peers) => {
                if self.ctx.selector.mode() != SessionMode::Completed {
                    for addr in peers {
                        self.connect(addr);
                    }
                }
            }
            SessionEvent::Inbound {
                stream,
                addr,
                handshake,
            } => match self.ctx.register_peer(addr) {
                Some((shared, commands)) => {
                    debug!("Accepted peer {}", addr);
                    let conn =
                        PeerConnection::new(addr, stream, self.ctx.clone(), shared, commands);
                    tokio::spawn(conn.run(Some(handshake)));
                }
                None => debug!("Refusing inbound peer {}", addr),
            },
            SessionEvent::PieceCompleted { index, from } => {
                self.ctx.broadcast_have(index, Some(from));
                self.ctx.selector.check_endgame(&self.ctx.store);

                // each piece reports completion exactly once
                self.num_done += 1;
                let (num_done, total) = (self.num_done, self.ctx.store.len());
                self.observer.on_event(ProgressEvent::Progress { num_done, total });

                if num_done == total {
                    return Ok(self.on_complete());
                }
            }
            SessionEvent::PersistFailed { index, error } => {
                error!("Piece {} could not be saved: {}", index, error);
                if error.is_fatal() {
                    return Err(error);
                }
            }
            SessionEvent::PeerClosed(addr) => {
                debug!("Peer {} gone, {} connected", addr, self.ctx.peer_count());
            }
        }
        Ok(false)
    }

    /// Every piece is verified. Returns true unless we stay on to seed.
    fn on_complete(&mut self) -> bool {
        info!("Download of {} complete", self.ctx.metainfo.name);
        self.ctx.selector.set_completed();
        let _ = self.announce_state.send(AnnounceState::Completed);
        self.observer.on_event(ProgressEvent::Completed);

        if self.ctx.config.seed {
            info!("Seeding {}", self.ctx.metainfo.name);
            false
        } else {
            true
        }
    }

    fn connect(&self, addr: SocketAddr) {
        let Some((shared, commands)) = self.ctx.register_peer(addr) else {
            return;
        };

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            match time::timeout(ctx.config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!("Connected to peer {}", addr);
                    PeerConnection::new(addr, stream, ctx, shared, commands)
                        .run(None)
                        .await;
                }
                outcome => {
                    let reason = match outcome {
                        Ok(Err(e)) => e.to_string(),
                        _ => "timed out".to_string(),
                    };
                    debug!("Failed to connect to {}: {}", addr, reason);
                    ctx.detach_peer(addr, &Bitfield::new(ctx.store.len()), None);
                    ctx.emit(SessionEvent::PeerClosed(addr));
                }
            }
        });
    }

    fn rechoke(&self) {
        let snapshots: Vec<PeerSnapshot> = self
            .ctx
            .peers()
            .into_iter()
            .map(|(addr, shared)| {
                let state = shared.state();
                PeerSnapshot {
                    addr,
                    am_choking: state.am_choking,
                    peer_interested: state.peer_interested,
                    download_rate: shared.download_rate(),
                    upload_rate: shared.upload_rate(),
                }
            })
            .collect();

        let mode = self.ctx.selector.mode();
        for (addr, unchoke) in self
            .choker
            .decide(&snapshots, mode, &mut rand::thread_rng())
        {
            debug!("{} {}", if unchoke { "Unchoking" } else { "Choking" }, addr);
            let command = if unchoke {
                PeerCommand::Unchoke
            } else {
                PeerCommand::Choke
            };
            self.ctx.send(&addr, command);
        }
    }

    fn report_rates(&self) {
        let (down_speed, up_speed) = self
            .ctx
            .peers()
            .iter()
            .fold((0.0, 0.0), |(down, up), (_, shared)| {
                (down + shared.download_rate(), up + shared.upload_rate())
            });
        self.observer.on_event(ProgressEvent::RateUpdate {
            down_speed,
            up_speed,
        });
    }

    async fn shutdown(&mut self) {
        let _ = self.announce_state.send(AnnounceState::Stopping);
        self.ctx.shutdown_peers();

        // verified pieces may still be on their way to disk
        let mut poll = time::interval(self.ctx.config.flush_poll);
        while self.ctx.store.has_unpersisted() {
            poll.tick().await;
            if let Err(e) = self.ctx.store.flush().await {
                error!("Giving up on unsaved pieces: {}", e);
                break;
            }
        }
        self.ctx.store.storage().close().await;

        if self.ctx.selector.mode() == SessionMode::Completed && !self.ctx.store.has_unpersisted() {
            info!("All data of {} saved", self.ctx.metainfo.name);
            self.observer.on_event(ProgressEvent::Saved);
        }

        for announcer in self.announcers.drain(..) {
            if time::timeout(ANNOUNCER_GRACE, announcer).await.is_err() {
                debug!("Announcer did not stop in time");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Block, PeerMessage, HANDSHAKE_LEN};
    use crate::piece::BLOCK_SIZE;
    use crate::storage::memory::storage_for;
    use bytes::{Bytes, BytesMut};
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const PIECE: u64 = 2 * BLOCK_SIZE as u64;

    async fn read_message(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<PeerMessage> {
        loop {
            if let Some(message) = PeerMessage::decode(buf).unwrap() {
                return Some(message);
            }
            if stream.read_buf(buf).await.ok()? == 0 {
                return None;
            }
        }
    }

    async fn exchange_handshakes(stream: &mut TcpStream, info_hash: [u8; 20], id: u8) {
        let mut theirs = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut theirs).await.unwrap();
        stream
            .write_all(&Handshake::new(info_hash, [id; 20]).to_bytes())
            .await
            .unwrap();
    }

    /// A peer holding all of `data` that serves whatever is requested
    async fn seeder(data: Arc<Vec<u8>>, pieces: usize) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            exchange_handshakes(&mut stream, [7; 20], b's').await;
            stream
                .write_all(&PeerMessage::Bitfield(Bitfield::full(pieces).to_payload()).to_bytes())
                .await
                .unwrap();

            let mut buf = BytesMut::new();
            while let Some(message) = read_message(&mut stream, &mut buf).await {
                let reply = match message {
                    PeerMessage::Interested => PeerMessage::Unchoke,
                    PeerMessage::Request(r) => {
                        let start = (r.piece_index as u64 * PIECE + r.offset as u64) as usize;
                        PeerMessage::Piece(Block {
                            piece_index: r.piece_index,
                            offset: r.offset,
                            data: Bytes::copy_from_slice(&data[start..start + r.length as usize]),
                        })
                    }
                    _ => continue,
                };
                if stream.write_all(&reply.to_bytes()).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    /// A peer with nothing that reports each `have` it receives
    async fn leecher() -> (SocketAddr, mpsc::UnboundedReceiver<Option<u32>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            exchange_handshakes(&mut stream, [7; 20], b'l').await;
            // None marks the handshake as done
            let _ = tx.send(None);

            let mut buf = BytesMut::new();
            while let Some(message) = read_message(&mut stream, &mut buf).await {
                if let PeerMessage::Have { piece_index } = message {
                    let _ = tx.send(Some(piece_index));
                }
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn test_downloads_broadcasts_and_saves() {
        let data: Arc<Vec<u8>> =
            Arc::new((0..2 * PIECE as usize).map(|i| (i % 199) as u8).collect());
        let mut meta = Metainfo::for_content(PIECE, &data, &[data.len() as u64]);
        meta.trackers.clear();
        let (storage, memory) = storage_for(&meta);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer = {
            let seen = seen.clone();
            Arc::new(move |event: ProgressEvent| {
                if !matches!(event, ProgressEvent::RateUpdate { .. }) {
                    seen.lock().push(event);
                }
            })
        };

        let (session, handle) = TorrentSession::new(
            Arc::new(meta),
            storage,
            *b"-PW0001-sessiontest0",
            SessionConfig::default(),
            observer,
        );
        let running = tokio::spawn(session.run());

        let (leecher_addr, mut haves) = leecher().await;
        handle.add_peers(vec![leecher_addr]);
        assert_eq!(haves.recv().await, Some(None));

        handle.add_peers(vec![seeder(data.clone(), 2).await]);
        let mut announced = vec![haves.recv().await, haves.recv().await];
        announced.sort();
        assert_eq!(announced, vec![Some(Some(0)), Some(Some(1))]);

        time::timeout(Duration::from_secs(10), running)
            .await
            .expect("session finishes")
            .unwrap()
            .unwrap();

        assert_eq!(&memory[0].data.lock()[..], &data[..]);
        let seen = seen.lock().clone();
        assert_eq!(
            seen,
            vec![
                ProgressEvent::Progress { num_done: 1, total: 2 },
                ProgressEvent::Progress { num_done: 2, total: 2 },
                ProgressEvent::Completed,
                ProgressEvent::Saved,
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_before_completion() {
        let mut meta = Metainfo::for_content(16, &[1u8; 64], &[64]);
        meta.trackers.clear();
        let (storage, memory) = storage_for(&meta);

        let (session, handle) = TorrentSession::new(
            Arc::new(meta),
            storage,
            [b'x'; 20],
            SessionConfig::default(),
            Arc::new(|_: ProgressEvent| {}),
        );
        let running = tokio::spawn(session.run());
        handle.stop();

        running.await.unwrap().unwrap();
        // files were closed on the way out
        assert!(!*memory[0].open.lock());
    }
}
