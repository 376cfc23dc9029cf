use super::{Bitfield, Block, BlockInfo, Handshake, PeerCommand, PeerMessage, PeerShared};
use crate::error::{BittorrentError, Result};
use crate::piece::{BlockOutcome, BLOCK_SIZE};
use crate::rate::TokenBucket;
use crate::session::{SessionContext, SessionEvent};
use bytes::BytesMut;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Largest upload request we serve
const MAX_REQUEST_LEN: u32 = 2 * BLOCK_SIZE;
/// Upload requests queued beyond this are dropped
const MAX_UPLOAD_QUEUE: usize = 256;

/// Lifecycle of a connection. `Closed` is terminal; retrying a peer means
/// creating a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    HandshakePending,
    Established,
    Closed,
}

/// One peer wire-protocol session over any byte stream.
///
/// All processing for the peer happens on the task running `run`: inbound
/// frames are decoded and handled strictly in arrival order, and outgoing
/// messages are batched in `outbox` and flushed once per event.
pub struct PeerConnection<S> {
    addr: SocketAddr,
    stream: S,
    ctx: Arc<SessionContext>,
    shared: Arc<PeerShared>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    status: ConnectionStatus,
    recv: BytesMut,
    outbox: BytesMut,
    remote: Bitfield,
    /// Piece this peer is currently fetching for us
    active_piece: Option<usize>,
    pending: VecDeque<BlockInfo>,
    in_flight: HashSet<BlockInfo>,
    uploads: VecDeque<BlockInfo>,
    last_activity: Instant,
    upload_limit: TokenBucket,
    download_limit: TokenBucket,
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        addr: SocketAddr,
        stream: S,
        ctx: Arc<SessionContext>,
        shared: Arc<PeerShared>,
        commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Self {
        let piece_count = ctx.store.len();
        let upload_limit = TokenBucket::new(ctx.config.upload_limit);
        let download_limit = TokenBucket::new(ctx.config.download_limit);

        Self {
            addr,
            stream,
            ctx,
            shared,
            commands,
            status: ConnectionStatus::Connecting,
            recv: BytesMut::with_capacity(32 * 1024),
            outbox: BytesMut::new(),
            remote: Bitfield::new(piece_count),
            active_piece: None,
            pending: VecDeque::new(),
            in_flight: HashSet::new(),
            uploads: VecDeque::new(),
            last_activity: Instant::now(),
            upload_limit,
            download_limit,
        }
    }

    /// Drive the connection until it closes, then detach it from the
    /// session. `inbound` carries the remote handshake when the remote
    /// dialed us and the listener already consumed it.
    pub async fn run(mut self, inbound: Option<Handshake>) -> ConnectionStatus {
        match self.drive(inbound).await {
            Ok(()) => debug!("Connection to {} closed", self.addr),
            Err(e @ BittorrentError::ProtocolFormat(_)) => {
                warn!("Dropping {} for protocol violation: {}", self.addr, e)
            }
            Err(e) => info!("Disconnected from {}: {}", self.addr, e),
        }

        self.status = ConnectionStatus::Closed;
        self.ctx
            .detach_peer(self.addr, &self.remote, self.active_piece.take());
        self.ctx.emit(SessionEvent::PeerClosed(self.addr));
        self.status
    }

    async fn drive(&mut self, inbound: Option<Handshake>) -> Result<()> {
        let ours = Handshake::new(self.ctx.info_hash(), self.ctx.peer_id);
        self.stream.write_all(&ours.to_bytes()).await?;
        self.status = ConnectionStatus::HandshakePending;

        let theirs = match inbound {
            Some(handshake) => handshake,
            None => time::timeout(self.ctx.config.connect_timeout, self.read_handshake())
                .await
                .map_err(|_| BittorrentError::NetworkError("Handshake timed out".to_string()))??,
        };

        if theirs.info_hash != self.ctx.info_hash() {
            return Err(BittorrentError::ProtocolFormat(
                "Info hash mismatch".to_string(),
            ));
        }
        self.status = ConnectionStatus::Established;
        debug!(
            "Handshake with {} complete (peer id {})",
            self.addr,
            String::from_utf8_lossy(&theirs.peer_id)
        );

        let ours = self.ctx.store.bitfield();
        if !ours.is_empty() {
            self.queue(PeerMessage::Bitfield(ours.to_payload()));
        }
        // frames that arrived right behind the handshake
        self.process_frames().await?;
        self.flush().await?;

        self.event_loop().await
    }

    async fn read_handshake(&mut self) -> Result<Handshake> {
        loop {
            if let Some(handshake) = Handshake::decode(&mut self.recv)? {
                return Ok(handshake);
            }
            if self.stream.read_buf(&mut self.recv).await? == 0 {
                return Err(BittorrentError::NetworkError(
                    "Connection closed during handshake".to_string(),
                ));
            }
            self.last_activity = Instant::now();
        }
    }

    async fn event_loop(&mut self) -> Result<()> {
        let period = self.ctx.config.keepalive_interval;
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.last_activity + self.ctx.config.inactivity_timeout;
            let can_upload = !self.shared.state().am_choking && !self.uploads.is_empty();

            tokio::select! {
                read = self.stream.read_buf(&mut self.recv) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(());
                    }
                    self.last_activity = Instant::now();
                    self.download_limit.acquire(n).await;
                    self.process_frames().await?;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(PeerCommand::Shutdown) | None => {
                            self.flush().await?;
                            return Ok(());
                        }
                        Some(command) => self.handle_command(command),
                    }
                }
                _ = keepalive.tick() => {
                    self.queue(PeerMessage::KeepAlive);
                }
                _ = time::sleep_until(deadline) => {
                    return Err(BittorrentError::NetworkError(format!(
                        "No data from {} for {:?}",
                        self.addr, self.ctx.config.inactivity_timeout
                    )));
                }
                _ = std::future::ready(()), if can_upload => {
                    self.serve_upload().await?;
                }
            }

            self.flush().await?;
        }
    }

    /// Decode and handle every complete frame in the receive buffer
    async fn process_frames(&mut self) -> Result<()> {
        while let Some(message) = PeerMessage::decode(&mut self.recv)? {
            self.handle_message(message).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: PeerMessage) -> Result<()> {
        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => {
                self.shared.state.lock().peer_choking = true;
                self.abandon_piece();
            }
            PeerMessage::Unchoke => {
                self.shared.state.lock().peer_choking = false;
                self.request_blocks();
            }
            PeerMessage::Interested => self.shared.state.lock().peer_interested = true,
            PeerMessage::NotInterested => self.shared.state.lock().peer_interested = false,
            PeerMessage::Have { piece_index } => {
                let index = self.piece_index(piece_index)?;
                if self.remote.set(index) {
                    self.ctx.store.add_availability(index);
                }
                self.update_interest();
                self.request_blocks();
            }
            PeerMessage::Bitfield(payload) => {
                let bitfield = Bitfield::from_payload(&payload, self.ctx.store.len())?;
                self.ctx.store.retract_availability(&self.remote);
                for index in bitfield.iter_set() {
                    self.ctx.store.add_availability(index);
                }
                self.remote = bitfield;
                self.update_interest();
                self.request_blocks();
            }
            PeerMessage::Request(request) => self.enqueue_upload(request),
            PeerMessage::Piece(block) => self.receive_block(block).await?,
            PeerMessage::Cancel(request) => self.uploads.retain(|queued| *queued != request),
            PeerMessage::Port(_) => {}
        }
        Ok(())
    }

    fn handle_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Choke => {
                let mut state = self.shared.state.lock();
                if !state.am_choking {
                    state.am_choking = true;
                    drop(state);
                    self.queue(PeerMessage::Choke);
                }
            }
            PeerCommand::Unchoke => {
                let mut state = self.shared.state.lock();
                if state.am_choking {
                    state.am_choking = false;
                    drop(state);
                    self.queue(PeerMessage::Unchoke);
                }
            }
            PeerCommand::Have(piece_index) => self.on_piece_completed(piece_index as usize),
            PeerCommand::Shutdown => {}
        }
    }

    /// Another connection finished `index`
    fn on_piece_completed(&mut self, index: usize) {
        self.cancel_requests_for(index);
        if !self.remote.has(index) {
            self.queue(PeerMessage::Have {
                piece_index: index as u32,
            });
        }
        self.update_interest();
        self.request_blocks();
    }

    async fn receive_block(&mut self, block: Block) -> Result<()> {
        let info = block.info();
        self.in_flight.remove(&info);

        let len = block.data.len() as u64;
        self.shared.download.lock().record(len);
        self.ctx.add_downloaded(len);

        let index = self.piece_index(block.piece_index)?;
        let outcome = match self.ctx.store.save_block(index, block.offset, &block.data) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Ignoring block from {}: {}", self.addr, e);
                return Ok(());
            }
        };

        match outcome {
            BlockOutcome::Completed => {
                self.ctx.selector.piece_completed(index);
                self.cancel_requests_for(index);
                self.ctx.emit(SessionEvent::PieceCompleted {
                    index,
                    from: self.addr,
                });
                if let Err(error) = self.ctx.store.persist(index).await {
                    self.ctx.emit(SessionEvent::PersistFailed { index, error });
                }
                self.update_interest();
            }
            BlockOutcome::Corrupt => {
                // the store already dropped every claim on the piece
                if self.active_piece == Some(index) {
                    self.active_piece = None;
                    self.pending.clear();
                }
                self.in_flight.retain(|r| r.piece_index as usize != index);
            }
            BlockOutcome::Stored | BlockOutcome::Duplicate => {}
        }

        self.request_blocks();
        Ok(())
    }

    /// Keep the request pipeline full, claiming a new piece when the
    /// current one has nothing left to ask for
    fn request_blocks(&mut self) {
        if self.shared.state().peer_choking {
            return;
        }

        if self.active_piece.is_none() && self.in_flight.is_empty() {
            if let Some(index) = self.ctx.selector.pick(&self.ctx.store, &self.remote) {
                debug!("Peer {} fetching piece {}", self.addr, index);
                self.active_piece = Some(index);
                self.pending = self.ctx.store.missing_blocks(index).into();
            }
        }

        let depth = self.ctx.config.pipeline_depth.max(1);
        while self.in_flight.len() < depth {
            let Some(request) = self.pending.pop_front() else {
                break;
            };
            if self.in_flight.insert(request) {
                self.queue(PeerMessage::Request(request));
            }
        }

        // every block of the piece has been asked for; the claim ends once
        // the answers are in
        if self.pending.is_empty() && self.in_flight.is_empty() {
            if let Some(index) = self.active_piece.take() {
                self.ctx.store.release(index);
            }
        }
    }

    /// Drop our claim and every outstanding request (the peer choked us)
    fn abandon_piece(&mut self) {
        self.pending.clear();
        self.in_flight.clear();
        if let Some(index) = self.active_piece.take() {
            self.ctx.store.release(index);
        }
    }

    fn cancel_requests_for(&mut self, index: usize) {
        if self.active_piece == Some(index) {
            self.active_piece = None;
            self.pending.clear();
        }

        let cancelled: Vec<BlockInfo> = self
            .in_flight
            .iter()
            .filter(|r| r.piece_index as usize == index)
            .copied()
            .collect();
        for request in cancelled {
            self.in_flight.remove(&request);
            self.queue(PeerMessage::Cancel(request));
        }
    }

    /// Interested exactly while the remote holds a piece we still need
    fn update_interest(&mut self) {
        let store = &self.ctx.store;
        let wanted = self.remote.iter_set().any(|index| !store.is_complete(index));

        let mut state = self.shared.state.lock();
        if wanted != state.am_interested {
            state.am_interested = wanted;
            drop(state);
            self.queue(if wanted {
                PeerMessage::Interested
            } else {
                PeerMessage::NotInterested
            });
        }
    }

    fn enqueue_upload(&mut self, request: BlockInfo) {
        let index = request.piece_index as usize;
        let fits = self
            .ctx
            .store
            .piece_length(index)
            .is_some_and(|len| request.offset as u64 + request.length as u64 <= len as u64);

        if request.length == 0 || request.length > MAX_REQUEST_LEN || !fits {
            debug!("Ignoring invalid request from {}: {:?}", self.addr, request);
            return;
        }
        if self.uploads.len() >= MAX_UPLOAD_QUEUE {
            debug!("Upload queue for {} is full", self.addr);
            return;
        }
        self.uploads.push_back(request);
    }

    async fn serve_upload(&mut self) -> Result<()> {
        let Some(request) = self.uploads.pop_front() else {
            return Ok(());
        };
        let index = request.piece_index as usize;
        if !self.ctx.store.is_complete(index) {
            return Ok(());
        }

        let data = self
            .ctx
            .store
            .get_block(index, request.offset, request.length)
            .await?;
        self.upload_limit.acquire(data.len()).await;

        let len = data.len() as u64;
        self.queue(PeerMessage::Piece(Block {
            piece_index: request.piece_index,
            offset: request.offset,
            data,
        }));
        self.shared.upload.lock().record(len);
        self.ctx.add_uploaded(len);
        Ok(())
    }

    fn piece_index(&self, index: u32) -> Result<usize> {
        let index = index as usize;
        if index >= self.ctx.store.len() {
            return Err(BittorrentError::ProtocolFormat(format!(
                "Piece index {} out of range",
                index
            )));
        }
        Ok(index)
    }

    fn queue(&mut self, message: PeerMessage) {
        message.encode(&mut self.outbox);
    }

    async fn flush(&mut self) -> Result<()> {
        if !self.outbox.is_empty() {
            let out = self.outbox.split();
            self.stream.write_all(&out).await?;
            self.stream.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::HANDSHAKE_LEN;
    use crate::piece::PieceState;
    use crate::session::testing::{context, TEST_PEER_ID};
    use crate::session::SessionConfig;
    use crate::torrent::Metainfo;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    const REMOTE_ID: [u8; 20] = *b"-XX0001-remoteremote";
    const PIECE: u32 = 32 * 1024;

    fn remote_addr() -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 9], 51413))
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    /// The far end of a connection under test
    struct Remote {
        stream: DuplexStream,
        buf: BytesMut,
    }

    impl Remote {
        async fn handshake(&mut self, info_hash: [u8; 20]) {
            let mut theirs = [0u8; HANDSHAKE_LEN];
            self.stream.read_exact(&mut theirs).await.unwrap();
            let theirs = Handshake::from_bytes(&theirs).unwrap();
            assert_eq!(theirs.peer_id, TEST_PEER_ID);
            self.stream
                .write_all(&Handshake::new(info_hash, REMOTE_ID).to_bytes())
                .await
                .unwrap();
        }

        async fn send(&mut self, message: PeerMessage) {
            self.stream.write_all(&message.to_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> PeerMessage {
            loop {
                if let Some(message) = PeerMessage::decode(&mut self.buf).unwrap() {
                    return message;
                }
                let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "connection closed");
            }
        }
    }

    async fn spawn_connection(ctx: &Arc<SessionContext>) -> (Remote, JoinHandle<ConnectionStatus>) {
        let (ours, theirs) = tokio::io::duplex(256 * 1024);
        let (shared, commands) = ctx.register_peer(remote_addr()).unwrap();
        let conn = PeerConnection::new(remote_addr(), ours, ctx.clone(), shared, commands);
        let handle = tokio::spawn(conn.run(None));
        let remote = Remote {
            stream: theirs,
            buf: BytesMut::new(),
        };
        (remote, handle)
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held");
    }

    fn full_bitfield(count: usize) -> Bytes {
        Bitfield::full(count).to_payload()
    }

    #[tokio::test]
    async fn test_downloads_piece_and_reports_completion() {
        let data = content(2 * PIECE as usize);
        let meta = Metainfo::for_content(PIECE as u64, &data, &[data.len() as u64]);
        let config = SessionConfig {
            pipeline_depth: 2,
            ..SessionConfig::default()
        };
        let (ctx, mut events, memory) = context(meta, config).await;
        let (mut remote, _handle) = spawn_connection(&ctx).await;

        remote.handshake([7; 20]).await;
        remote.send(PeerMessage::Bitfield(full_bitfield(2))).await;
        assert_eq!(remote.recv().await, PeerMessage::Interested);

        remote.send(PeerMessage::Unchoke).await;
        let first = remote.recv().await;
        let second = remote.recv().await;
        assert_eq!(first, PeerMessage::Request(BlockInfo::new(0, 0, BLOCK_SIZE)));
        assert_eq!(
            second,
            PeerMessage::Request(BlockInfo::new(0, BLOCK_SIZE, BLOCK_SIZE))
        );

        for offset in [0, BLOCK_SIZE] {
            let start = offset as usize;
            remote
                .send(PeerMessage::Piece(Block {
                    piece_index: 0,
                    offset,
                    data: Bytes::copy_from_slice(&data[start..start + BLOCK_SIZE as usize]),
                }))
                .await;
        }

        match events.recv().await.unwrap() {
            SessionEvent::PieceCompleted { index, from } => {
                assert_eq!(index, 0);
                assert_eq!(from, remote_addr());
            }
            other => panic!("unexpected event {:?}", other),
        }

        // the next piece is requested straight away
        assert_eq!(
            remote.recv().await,
            PeerMessage::Request(BlockInfo::new(1, 0, BLOCK_SIZE))
        );
        assert_eq!(ctx.store.state(0), Some(PieceState::Complete));
        assert_eq!(ctx.downloaded(), PIECE as u64);
        assert_eq!(&memory[0].data.lock()[..PIECE as usize], &data[..PIECE as usize]);
    }

    #[tokio::test]
    async fn test_disconnect_retracts_rarity() {
        let data = content(6 * 16);
        let meta = Metainfo::for_content(16, &data, &[data.len() as u64]);
        let (ctx, mut events, _) = context(meta, SessionConfig::default()).await;
        let (mut remote, handle) = spawn_connection(&ctx).await;

        remote.handshake([7; 20]).await;
        let mut bits = Bitfield::new(6);
        for index in [0, 2, 4] {
            bits.set(index);
        }
        remote.send(PeerMessage::Bitfield(bits.to_payload())).await;
        assert_eq!(remote.recv().await, PeerMessage::Interested);

        let rarity: Vec<u32> = (0..6).map(|i| ctx.store.rarity(i)).collect();
        assert_eq!(rarity, vec![1, 0, 1, 0, 1, 0]);

        drop(remote);
        assert_eq!(handle.await.unwrap(), ConnectionStatus::Closed);
        assert!((0..6).all(|i| ctx.store.rarity(i) == 0));
        assert_eq!(ctx.peer_count(), 0);
        assert!(matches!(
            events.recv().await,
            Some(SessionEvent::PeerClosed(addr)) if addr == remote_addr()
        ));
    }

    #[tokio::test]
    async fn test_serves_requests_once_unchoked() {
        let data = content(PIECE as usize);
        let meta = Metainfo::for_content(PIECE as u64, &data, &[data.len() as u64]);
        let (ctx, _events, _) = context(meta, SessionConfig::default()).await;
        ctx.store.save_block(0, 0, &data[..BLOCK_SIZE as usize]).unwrap();
        ctx.store
            .save_block(0, BLOCK_SIZE, &data[BLOCK_SIZE as usize..])
            .unwrap();

        let (mut remote, _handle) = spawn_connection(&ctx).await;
        remote.handshake([7; 20]).await;
        assert_eq!(remote.recv().await, PeerMessage::Bitfield(full_bitfield(1)));

        remote.send(PeerMessage::Interested).await;
        remote
            .send(PeerMessage::Request(BlockInfo::new(0, 100, 1000)))
            .await;
        ctx.send(&remote_addr(), PeerCommand::Unchoke);

        assert_eq!(remote.recv().await, PeerMessage::Unchoke);
        assert_eq!(
            remote.recv().await,
            PeerMessage::Piece(Block {
                piece_index: 0,
                offset: 100,
                data: Bytes::copy_from_slice(&data[100..1100]),
            })
        );
        assert_eq!(ctx.uploaded(), 1000);
    }

    #[tokio::test]
    async fn test_unservable_requests_are_dropped() {
        let data = content(2 * PIECE as usize);
        let meta = Metainfo::for_content(PIECE as u64, &data, &[data.len() as u64]);
        let (ctx, _events, _) = context(meta, SessionConfig::default()).await;
        ctx.store.save_block(0, 0, &data[..BLOCK_SIZE as usize]).unwrap();
        ctx.store
            .save_block(0, BLOCK_SIZE, &data[BLOCK_SIZE as usize..PIECE as usize])
            .unwrap();

        let (mut remote, handle) = spawn_connection(&ctx).await;
        remote.handshake([7; 20]).await;
        let mut ours = Bitfield::new(2);
        ours.set(0);
        assert_eq!(remote.recv().await, PeerMessage::Bitfield(ours.to_payload()));

        remote.send(PeerMessage::Interested).await;
        for request in [
            BlockInfo::new(1, 0, 16),
            BlockInfo::new(0, 0, 2 * PIECE),
            BlockInfo::new(0, PIECE - 10, 100),
            BlockInfo::new(0, 0, 0),
            BlockInfo::new(0, 0, 16),
        ] {
            remote.send(PeerMessage::Request(request)).await;
        }
        ctx.send(&remote_addr(), PeerCommand::Unchoke);

        assert_eq!(remote.recv().await, PeerMessage::Unchoke);
        assert_eq!(
            remote.recv().await,
            PeerMessage::Piece(Block {
                piece_index: 0,
                offset: 0,
                data: Bytes::copy_from_slice(&data[..16]),
            })
        );
        assert_eq!(ctx.uploaded(), 16);
        assert!(!handle.is_finished());
    }

    #[tokio::test]
    async fn test_have_command_cancels_and_announces() {
        let data = content(2 * PIECE as usize);
        let meta = Metainfo::for_content(PIECE as u64, &data, &[data.len() as u64]);
        let (ctx, _events, _) = context(meta, SessionConfig::default()).await;
        let (mut remote, _handle) = spawn_connection(&ctx).await;

        remote.handshake([7; 20]).await;
        let mut bits = Bitfield::new(2);
        bits.set(0);
        remote.send(PeerMessage::Bitfield(bits.to_payload())).await;
        assert_eq!(remote.recv().await, PeerMessage::Interested);
        remote.send(PeerMessage::Unchoke).await;
        assert!(matches!(remote.recv().await, PeerMessage::Request(_)));
        assert!(matches!(remote.recv().await, PeerMessage::Request(_)));

        // another peer finished piece 0 and piece 1 meanwhile
        ctx.store.save_block(0, 0, &data[..BLOCK_SIZE as usize]).unwrap();
        ctx.store
            .save_block(0, BLOCK_SIZE, &data[BLOCK_SIZE as usize..PIECE as usize])
            .unwrap();
        ctx.send(&remote_addr(), PeerCommand::Have(0));

        let mut cancels = vec![remote.recv().await, remote.recv().await];
        cancels.sort_by_key(|m| match m {
            PeerMessage::Cancel(r) => r.offset,
            _ => u32::MAX,
        });
        assert_eq!(
            cancels,
            vec![
                PeerMessage::Cancel(BlockInfo::new(0, 0, BLOCK_SIZE)),
                PeerMessage::Cancel(BlockInfo::new(0, BLOCK_SIZE, BLOCK_SIZE)),
            ]
        );
        // remote already had it, and now has nothing we need
        assert_eq!(remote.recv().await, PeerMessage::NotInterested);

        ctx.send(&remote_addr(), PeerCommand::Have(1));
        assert_eq!(remote.recv().await, PeerMessage::Have { piece_index: 1 });
    }

    #[tokio::test]
    async fn test_choke_releases_claimed_piece() {
        let data = content(4 * PIECE as usize);
        let meta = Metainfo::for_content(PIECE as u64, &data, &[data.len() as u64]);
        let (ctx, _events, _) = context(meta, SessionConfig::default()).await;
        let (mut remote, _handle) = spawn_connection(&ctx).await;

        remote.handshake([7; 20]).await;
        remote.send(PeerMessage::Bitfield(full_bitfield(4))).await;
        assert_eq!(remote.recv().await, PeerMessage::Interested);
        remote.send(PeerMessage::Unchoke).await;
        assert!(matches!(remote.recv().await, PeerMessage::Request(_)));
        assert_eq!(ctx.store.state(0), Some(PieceState::Active));

        remote.send(PeerMessage::Choke).await;
        eventually(|| ctx.store.state(0) == Some(PieceState::Pending)).await;
        assert_eq!(ctx.store.rarity(0), 1);
    }

    #[tokio::test]
    async fn test_rejects_wrong_info_hash() {
        let meta = Metainfo::for_content(16, &[1u8; 32], &[32]);
        let (ctx, mut events, _) = context(meta, SessionConfig::default()).await;

        let ours = Handshake::new([7; 20], TEST_PEER_ID).to_bytes();
        let theirs = Handshake::new([9; 20], REMOTE_ID).to_bytes();
        let mock = tokio_test::io::Builder::new()
            .write(&ours)
            .read(&theirs)
            .build();

        let (shared, commands) = ctx.register_peer(remote_addr()).unwrap();
        let conn = PeerConnection::new(remote_addr(), mock, ctx.clone(), shared, commands);
        assert_eq!(conn.run(None).await, ConnectionStatus::Closed);

        assert_eq!(ctx.peer_count(), 0);
        assert!(matches!(events.recv().await, Some(SessionEvent::PeerClosed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let meta = Metainfo::for_content(16, &[1u8; 32], &[32]);
        let config = SessionConfig {
            keepalive_interval: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(100),
            ..SessionConfig::default()
        };
        let (ctx, _events, _) = context(meta, config).await;
        let (mut remote, handle) = spawn_connection(&ctx).await;
        remote.handshake([7; 20]).await;

        // we keep talking, the remote never answers
        assert_eq!(remote.recv().await, PeerMessage::KeepAlive);
        assert_eq!(handle.await.unwrap(), ConnectionStatus::Closed);
        assert_eq!(ctx.peer_count(), 0);
    }
}
