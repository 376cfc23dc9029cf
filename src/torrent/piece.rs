use crate::error::{BittorrentError, Result};

/// Expected SHA-1 digest of one piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceHash([u8; 20]);

impl PieceHash {
    #[cfg(test)]
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

/// Ordered piece digests, parsed from the concatenated `pieces` string
#[derive(Debug, Clone, Default)]
pub struct Pieces {
    hashes: Vec<PieceHash>,
}

impl Pieces {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() % 20 != 0 {
            return Err(BittorrentError::InvalidTorrent(
                "Pieces length must be multiple of 20".to_string(),
            ));
        }

        let hashes = data
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                PieceHash(hash)
            })
            .collect();

        Ok(Self { hashes })
    }

    #[cfg(test)]
    pub fn from_hashes(hashes: Vec<PieceHash>) -> Self {
        Self { hashes }
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PieceHash> {
        self.hashes.iter()
    }
}
