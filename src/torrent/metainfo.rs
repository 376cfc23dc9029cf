use crate::bencode::{decode, raw_dict_value, BencodeValue};
use crate::error::{BittorrentError, Result};
use super::Pieces;
use sha1::{Digest, Sha1};

/// One file of the torrent, placed in the torrent's linear byte space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Path relative to the download directory
    pub path: Vec<String>,
    pub length: u64,
    /// Byte offset of the file's first byte within the whole torrent
    pub offset: u64,
}

/// Parsed metadata a session works from. Immutable once built.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub name: String,
    /// SHA-1 of the bencoded info dictionary
    pub info_hash: [u8; 20],
    /// `announce` followed by every `announce-list` entry, without duplicates
    pub trackers: Vec<String>,
    pub piece_length: u64,
    pub total_length: u64,
    pub pieces: Pieces,
    pub files: Vec<FileInfo>,
}

impl Metainfo {
    /// Assemble metadata from its parts; file offsets and the total length
    /// are derived from the ordered `(path, length)` list.
    pub fn new(
        name: String,
        info_hash: [u8; 20],
        trackers: Vec<String>,
        piece_length: u64,
        pieces: Pieces,
        files: Vec<(Vec<String>, u64)>,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(BittorrentError::InvalidTorrent(
                "'piece length' must be positive".to_string(),
            ));
        }
        // pieces and block offsets are addressed with 32-bit fields on the wire
        if piece_length > u32::MAX as u64 {
            return Err(BittorrentError::InvalidTorrent(format!(
                "'piece length' of {} bytes is too large",
                piece_length
            )));
        }

        let mut offset = 0u64;
        let mut layout = Vec::with_capacity(files.len());
        for (path, length) in files {
            layout.push(FileInfo {
                path,
                length,
                offset,
            });
            offset = offset.checked_add(length).ok_or_else(|| {
                BittorrentError::InvalidTorrent("Total length overflows".to_string())
            })?;
        }
        let files = layout;
        let total_length = offset;

        let expected = total_length.div_ceil(piece_length) as usize;
        if expected != pieces.len() {
            return Err(BittorrentError::InvalidTorrent(format!(
                "{} piece hashes for {} bytes of content (expected {})",
                pieces.len(),
                total_length,
                expected
            )));
        }

        Ok(Self {
            name,
            info_hash,
            trackers,
            piece_length,
            total_length,
            pieces,
            files,
        })
    }

    /// Parse the raw bytes of a `.torrent` file
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = decode(data)?;
        if !root.is_dict() {
            return Err(BittorrentError::InvalidTorrent(
                "Torrent must be a dict".to_string(),
            ));
        }

        let info = root
            .dict_get(b"info")
            .filter(|v| v.is_dict())
            .ok_or_else(|| BittorrentError::InvalidTorrent("Missing 'info' field".to_string()))?;

        let info_hash: [u8; 20] = Sha1::digest(raw_dict_value(data, b"info")?).into();

        let name = info
            .dict_get_str(b"name")
            .ok_or_else(|| BittorrentError::InvalidTorrent("Missing 'name' field".to_string()))?
            .to_string();
        if !is_safe_component(&name) {
            return Err(BittorrentError::InvalidTorrent(format!("Unsafe name '{}'", name)));
        }

        let piece_length = info.dict_get_u64(b"piece length").ok_or_else(|| {
            BittorrentError::InvalidTorrent("Missing 'piece length' field".to_string())
        })?;

        let pieces = info
            .dict_get_bytes(b"pieces")
            .ok_or_else(|| BittorrentError::InvalidTorrent("Missing 'pieces' field".to_string()))
            .and_then(Pieces::from_bytes)?;

        let files = if let Some(length) = info.dict_get_u64(b"length") {
            vec![(vec![name.clone()], length)]
        } else if let Some(list) = info.dict_get(b"files").and_then(|v| v.as_list()) {
            list.iter()
                .map(parse_file_entry)
                .map(|entry| {
                    // multi-file torrents live in a directory named after the torrent
                    entry.map(|(path, length)| {
                        let mut full = vec![name.clone()];
                        full.extend(path);
                        (full, length)
                    })
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            return Err(BittorrentError::InvalidTorrent(
                "Missing 'length' or 'files' field".to_string(),
            ));
        };

        Metainfo::new(name, info_hash, parse_trackers(&root), piece_length, pieces, files)
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Length of piece `index`; only the final piece may be short
    pub fn piece_len(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        self.total_length.saturating_sub(start).min(self.piece_length)
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Single-piece-length torrent over `content`, hashes computed from it
    #[cfg(test)]
    pub(crate) fn for_content(piece_length: u64, content: &[u8], file_lengths: &[u64]) -> Self {
        let hashes = content
            .chunks(piece_length as usize)
            .map(|chunk| super::PieceHash::new(Sha1::digest(chunk).into()))
            .collect();
        let files = file_lengths
            .iter()
            .enumerate()
            .map(|(i, len)| (vec![format!("file{}", i)], *len))
            .collect();
        Metainfo::new(
            "test".to_string(),
            [7u8; 20],
            vec!["http://tracker.test/announce".to_string()],
            piece_length,
            Pieces::from_hashes(hashes),
            files,
        )
        .expect("consistent test metadata")
    }
}

fn parse_file_entry(value: &BencodeValue) -> Result<(Vec<String>, u64)> {
    let length = value
        .dict_get_u64(b"length")
        .ok_or_else(|| BittorrentError::InvalidTorrent("Missing file 'length'".to_string()))?;

    let path = value
        .dict_get(b"path")
        .and_then(|v| v.as_list())
        .ok_or_else(|| BittorrentError::InvalidTorrent("Missing file 'path'".to_string()))?
        .iter()
        .map(|component| {
            component
                .as_str()
                .filter(|s| is_safe_component(s))
                .map(String::from)
                .ok_or_else(|| {
                    BittorrentError::InvalidTorrent("Invalid path component".to_string())
                })
        })
        .collect::<Result<Vec<_>>>()?;

    if path.is_empty() {
        return Err(BittorrentError::InvalidTorrent("Empty file path".to_string()));
    }

    Ok((path, length))
}

fn is_safe_component(component: &str) -> bool {
    !component.is_empty()
        && component != "."
        && component != ".."
        && !component.contains(['/', '\\'])
}

fn parse_trackers(root: &BencodeValue) -> Vec<String> {
    let mut trackers: Vec<String> = Vec::new();
    let mut push = |url: &str| {
        if !trackers.iter().any(|t| t == url) {
            trackers.push(url.to_string());
        }
    };

    if let Some(url) = root.dict_get_str(b"announce") {
        push(url);
    }

    let tiers = root.dict_get(b"announce-list").and_then(|v| v.as_list());
    for tier in tiers.unwrap_or_default() {
        for url in tier.as_list().unwrap_or_default() {
            if let Some(url) = url.as_str() {
                push(url);
            }
        }
    }

    trackers
}
