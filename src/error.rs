use thiserror::Error;

#[derive(Error, Debug)]
pub enum BittorrentError {
    #[error("Bencode parsing error: {0}")]
    BencodeError(String),

    #[error("Invalid torrent file: {0}")]
    InvalidTorrent(String),

    #[error("Tracker error: {0}")]
    TrackerError(String),

    #[error("Malformed peer message: {0}")]
    ProtocolFormat(String),

    #[error("Peer connection error: {0}")]
    NetworkError(String),

    #[error("Piece {index} failed hash verification")]
    ChecksumMismatch { index: usize },

    #[error("Piece error: {0}")]
    PieceError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("File store is no longer usable: {0}")]
    StorageLost(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(String),
}

impl BittorrentError {
    /// Whether the error ends the whole transfer rather than one peer,
    /// tracker or piece.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BittorrentError::StorageLost(_))
    }
}

impl From<url::ParseError> for BittorrentError {
    fn from(err: url::ParseError) -> Self {
        BittorrentError::UrlParseError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BittorrentError>;
