use super::{block_count, PieceState, BLOCK_SIZE};
use crate::error::{BittorrentError, Result};
use crate::peer::{Bitfield, BlockInfo};
use crate::storage::StorageManager;
use crate::torrent::{Metainfo, PieceHash};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of handing one received block to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Piece already complete or block already present; nothing changed
    Duplicate,
    /// Block stored, piece still missing blocks
    Stored,
    /// Last block arrived and the piece verified
    Completed,
    /// Last block arrived but the hash did not match; the piece was reset
    Corrupt,
}

pub(super) struct Piece {
    pub index: usize,
    /// Byte offset of the piece within the torrent
    pub offset: u64,
    pub length: u32,
    hash: PieceHash,
    pub state: PieceState,
    blocks: Vec<bool>,
    /// Assembly buffer, allocated on the first block of an attempt
    buffer: Option<BytesMut>,
    /// Verified contents, held until they reach the file store
    verified: Option<Bytes>,
    /// Connected peers advertising this piece
    pub rarity: u32,
    /// Peers currently fetching this piece
    pub claimants: u32,
}

impl Piece {
    fn new(index: usize, offset: u64, length: u32, hash: PieceHash) -> Self {
        Self {
            index,
            offset,
            length,
            hash,
            state: PieceState::Pending,
            blocks: vec![false; block_count(length)],
            buffer: None,
            verified: None,
            rarity: 0,
            claimants: 0,
        }
    }

    fn block_len(&self, block: usize) -> u32 {
        let begin = block as u32 * BLOCK_SIZE;
        BLOCK_SIZE.min(self.length - begin)
    }

    fn save_block(&mut self, begin: u32, data: &[u8]) -> Result<BlockOutcome> {
        if self.state == PieceState::Complete {
            return Ok(BlockOutcome::Duplicate);
        }

        let block = (begin / BLOCK_SIZE) as usize;
        if begin % BLOCK_SIZE != 0
            || block >= self.blocks.len()
            || data.len() != self.block_len(block) as usize
        {
            return Err(BittorrentError::PieceError(format!(
                "Block {}+{} does not fit piece {}",
                begin,
                data.len(),
                self.index
            )));
        }

        if self.blocks[block] {
            return Ok(BlockOutcome::Duplicate);
        }

        let length = self.length as usize;
        let buffer = self
            .buffer
            .get_or_insert_with(|| BytesMut::zeroed(length));
        let start = begin as usize;
        buffer[start..start + data.len()].copy_from_slice(data);
        self.blocks[block] = true;

        if !self.blocks.iter().all(|&b| b) {
            return Ok(BlockOutcome::Stored);
        }

        let buffer = self.buffer.take().unwrap_or_default();
        if Sha1::digest(&buffer).as_slice() == self.hash.as_bytes() {
            self.state = PieceState::Complete;
            self.claimants = 0;
            self.verified = Some(buffer.freeze());
            Ok(BlockOutcome::Completed)
        } else {
            // whole piece is fetched again; no partial salvage
            self.state = PieceState::Pending;
            self.claimants = 0;
            self.blocks.fill(false);
            Ok(BlockOutcome::Corrupt)
        }
    }
}

/// All pieces of a torrent plus the hookup to persistent storage.
///
/// Each piece sits behind its own lock; rarity, state and the block bitmap
/// of a piece are only touched under that lock.
pub struct PieceStore {
    pieces: Vec<Mutex<Piece>>,
    storage: Arc<StorageManager>,
    persist_attempts: u32,
}

impl PieceStore {
    pub fn new(metainfo: &Metainfo, storage: Arc<StorageManager>, persist_attempts: u32) -> Self {
        let pieces = metainfo
            .pieces
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                let offset = index as u64 * metainfo.piece_length;
                let length = metainfo.piece_len(index) as u32;
                Mutex::new(Piece::new(index, offset, length, *hash))
            })
            .collect();

        Self {
            pieces,
            storage,
            persist_attempts: persist_attempts.max(1),
        }
    }

    pub(super) fn piece(&self, index: usize) -> MutexGuard<'_, Piece> {
        self.pieces[index].lock()
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn piece_length(&self, index: usize) -> Option<u32> {
        self.pieces.get(index).map(|p| p.lock().length)
    }

    pub fn state(&self, index: usize) -> Option<PieceState> {
        self.pieces.get(index).map(|p| p.lock().state)
    }

    pub fn is_complete(&self, index: usize) -> bool {
        self.state(index) == Some(PieceState::Complete)
    }

    #[cfg(test)]
    pub fn rarity(&self, index: usize) -> u32 {
        self.pieces.get(index).map_or(0, |p| p.lock().rarity)
    }

    /// (complete, active) piece counts
    pub fn counts(&self) -> (usize, usize) {
        self.pieces.iter().fold((0, 0), |(done, active), p| match p.lock().state {
            PieceState::Complete => (done + 1, active),
            PieceState::Active => (done, active + 1),
            PieceState::Pending => (done, active),
        })
    }

    /// Bytes of verified content
    pub fn completed_bytes(&self) -> u64 {
        self.pieces
            .iter()
            .map(|p| p.lock())
            .filter(|p| p.state == PieceState::Complete)
            .map(|p| p.length as u64)
            .sum()
    }

    /// Our own bitfield, for advertising to peers
    pub fn bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::new(self.len());
        for (index, piece) in self.pieces.iter().enumerate() {
            if piece.lock().state == PieceState::Complete {
                bitfield.set(index);
            }
        }
        bitfield
    }

    /// A peer announced `index`
    pub fn add_availability(&self, index: usize) {
        if let Some(piece) = self.pieces.get(index) {
            piece.lock().rarity += 1;
        }
    }

    /// Take back every contribution a departing peer's bitfield made
    pub fn retract_availability(&self, bitfield: &Bitfield) {
        for index in bitfield.iter_set() {
            if let Some(piece) = self.pieces.get(index) {
                let mut piece = piece.lock();
                piece.rarity = piece.rarity.saturating_sub(1);
            }
        }
    }

    /// A peer stopped fetching `index`. When nobody else is fetching it the
    /// piece returns to `Pending` so another peer can pick it up; blocks
    /// already received are kept.
    pub fn release(&self, index: usize) {
        let Some(piece) = self.pieces.get(index) else {
            return;
        };
        let mut piece = piece.lock();
        piece.claimants = piece.claimants.saturating_sub(1);
        if piece.claimants == 0 && piece.state == PieceState::Active {
            debug!("Piece {} released back to pending", index);
            piece.state = PieceState::Pending;
        }
    }

    /// Requests for every block of `index` not yet received
    pub fn missing_blocks(&self, index: usize) -> Vec<BlockInfo> {
        let Some(piece) = self.pieces.get(index) else {
            return Vec::new();
        };
        let piece = piece.lock();
        if piece.state == PieceState::Complete {
            return Vec::new();
        }

        piece
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, &have)| !have)
            .map(|(block, _)| {
                BlockInfo::new(
                    index as u32,
                    block as u32 * BLOCK_SIZE,
                    piece.block_len(block),
                )
            })
            .collect()
    }

    /// Store one received block. Idempotent for duplicates and for pieces
    /// that are already complete. Verification happens when the final block
    /// lands; persistence is a separate step (`persist`).
    pub fn save_block(&self, index: usize, begin: u32, data: &[u8]) -> Result<BlockOutcome> {
        let piece = self.pieces.get(index).ok_or_else(|| {
            BittorrentError::PieceError(format!("Invalid piece index {}", index))
        })?;

        let outcome = piece.lock().save_block(begin, data)?;
        match outcome {
            BlockOutcome::Completed => info!("Piece {} verified and complete", index),
            BlockOutcome::Corrupt => warn!("{}", BittorrentError::ChecksumMismatch { index }),
            _ => {}
        }
        Ok(outcome)
    }

    /// Write a verified piece to the file store, retrying transient
    /// failures. The in-memory copy is released once the write succeeds.
    pub async fn persist(&self, index: usize) -> Result<()> {
        let (offset, data) = {
            let piece = self.piece(index);
            match &piece.verified {
                Some(data) => (piece.offset, data.clone()),
                None => return Ok(()),
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.storage.write_at(offset, &data).await {
                Ok(()) => break,
                Err(e) if e.is_fatal() || attempt >= self.persist_attempts => {
                    warn!("Failed to persist piece {}: {}", index, e);
                    return Err(e);
                }
                Err(e) => {
                    debug!("Persisting piece {} failed (attempt {}): {}", index, attempt, e);
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
            }
        }

        self.piece(index).verified = None;
        debug!("Piece {} written to disk", index);
        Ok(())
    }

    /// Retry persistence for every verified piece still held in memory
    pub async fn flush(&self) -> Result<()> {
        for index in 0..self.len() {
            self.persist(index).await?;
        }
        Ok(())
    }

    /// Whether any verified piece has yet to reach the file store
    pub fn has_unpersisted(&self) -> bool {
        self.pieces
            .iter()
            .any(|p| p.lock().verified.is_some())
    }

    /// Read part of a complete piece for an upload, from memory if the
    /// piece has not been released yet, otherwise from the file store.
    pub async fn get_block(&self, index: usize, begin: u32, length: u32) -> Result<Bytes> {
        let offset = {
            let piece = self
                .pieces
                .get(index)
                .ok_or_else(|| {
                    BittorrentError::PieceError(format!("Invalid piece index {}", index))
                })?
                .lock();

            if piece.state != PieceState::Complete {
                return Err(BittorrentError::PieceError(format!(
                    "Piece {} is not complete",
                    index
                )));
            }
            let end = begin as u64 + length as u64;
            if end > piece.length as u64 {
                return Err(BittorrentError::PieceError(format!(
                    "Block {}+{} exceeds piece {}",
                    begin, length, index
                )));
            }

            if let Some(data) = &piece.verified {
                return Ok(data.slice(begin as usize..end as usize));
            }
            piece.offset + begin as u64
        };

        let data = self.storage.read_at(offset, length as usize).await?;
        Ok(Bytes::from(data))
    }
}
