mod metainfo;
mod piece;

pub use metainfo::{FileInfo, Metainfo};
pub use piece::{PieceHash, Pieces};

use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Source of the immutable torrent metadata a session is started from
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn metadata(&self) -> Result<Metainfo>;
}

/// Reads metadata from a `.torrent` file on disk
pub struct TorrentFile {
    path: PathBuf,
}

impl TorrentFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl MetadataProvider for TorrentFile {
    async fn metadata(&self) -> Result<Metainfo> {
        let data = fs::read(&self.path).await?;
        Metainfo::parse(&data)
    }
}
