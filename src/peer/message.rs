use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::error::{BittorrentError, Result};

/// Largest frame body we accept. A 16 KiB block plus header is far below
/// this; bitfields for very large torrents are the only big legitimate frames.
pub const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// Coordinates of a block within a piece (payload of request and cancel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }
}

/// Block contents (payload of a piece message)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub piece_index: u32,
    pub offset: u32,
    pub data: Bytes,
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo::new(self.piece_index, self.offset, self.data.len() as u32)
    }
}

/// Messages exchanged between peers after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    /// Packed bitmap, high bit of the first byte is piece 0
    Bitfield(Bytes),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    /// DHT listen port
    Port(u16),
}

impl PeerMessage {
    const CHOKE: u8 = 0;
    const UNCHOKE: u8 = 1;
    const INTERESTED: u8 = 2;
    const NOT_INTERESTED: u8 = 3;
    const HAVE: u8 = 4;
    const BITFIELD: u8 = 5;
    const REQUEST: u8 = 6;
    const PIECE: u8 = 7;
    const CANCEL: u8 = 8;
    const PORT: u8 = 9;

    /// Append the framed message to `dst`.
    /// Format: <4-byte length prefix><message ID><payload>
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            PeerMessage::KeepAlive => dst.put_u32(0),
            PeerMessage::Choke => put_header(dst, Self::CHOKE, 0),
            PeerMessage::Unchoke => put_header(dst, Self::UNCHOKE, 0),
            PeerMessage::Interested => put_header(dst, Self::INTERESTED, 0),
            PeerMessage::NotInterested => put_header(dst, Self::NOT_INTERESTED, 0),
            PeerMessage::Have { piece_index } => {
                put_header(dst, Self::HAVE, 4);
                dst.put_u32(*piece_index);
            }
            PeerMessage::Bitfield(bitfield) => {
                put_header(dst, Self::BITFIELD, bitfield.len());
                dst.put_slice(bitfield);
            }
            PeerMessage::Request(block) => {
                put_header(dst, Self::REQUEST, 12);
                put_block_info(dst, block);
            }
            PeerMessage::Piece(block) => {
                put_header(dst, Self::PIECE, 8 + block.data.len());
                dst.put_u32(block.piece_index);
                dst.put_u32(block.offset);
                dst.put_slice(&block.data);
            }
            PeerMessage::Cancel(block) => {
                put_header(dst, Self::CANCEL, 12);
                put_block_info(dst, block);
            }
            PeerMessage::Port(port) => {
                put_header(dst, Self::PORT, 2);
                dst.put_u16(*port);
            }
        }
    }

    #[cfg(test)]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Take one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched while the buffer holds
    /// less than `4 + declared length` bytes.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(BittorrentError::ProtocolFormat(format!(
                "Frame of {} bytes exceeds limit",
                length
            )));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(length).freeze();
        Self::parse_body(body).map(Some)
    }

    /// Parse a single, complete frame including its length prefix
    #[cfg(test)]
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = BytesMut::from(data);
        let message = Self::decode(&mut buf)?
            .ok_or_else(|| BittorrentError::ProtocolFormat("Incomplete message".to_string()))?;

        if !buf.is_empty() {
            return Err(BittorrentError::ProtocolFormat(
                "Trailing bytes after message".to_string(),
            ));
        }

        Ok(message)
    }

    fn parse_body(mut body: Bytes) -> Result<Self> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let id = body.get_u8();
        let payload_len = body.len();
        let expect_len = |expected: usize| -> Result<()> {
            if payload_len == expected {
                Ok(())
            } else {
                Err(BittorrentError::ProtocolFormat(format!(
                    "Message {} has {} payload bytes, expected {}",
                    id, payload_len, expected
                )))
            }
        };

        match id {
            Self::CHOKE => expect_len(0).map(|_| PeerMessage::Choke),
            Self::UNCHOKE => expect_len(0).map(|_| PeerMessage::Unchoke),
            Self::INTERESTED => expect_len(0).map(|_| PeerMessage::Interested),
            Self::NOT_INTERESTED => expect_len(0).map(|_| PeerMessage::NotInterested),
            Self::HAVE => {
                expect_len(4)?;
                Ok(PeerMessage::Have {
                    piece_index: body.get_u32(),
                })
            }
            Self::BITFIELD => Ok(PeerMessage::Bitfield(body)),
            Self::REQUEST => {
                expect_len(12)?;
                Ok(PeerMessage::Request(get_block_info(&mut body)))
            }
            Self::PIECE => {
                if payload_len < 8 {
                    return Err(BittorrentError::ProtocolFormat(
                        "Piece message shorter than its header".to_string(),
                    ));
                }
                let piece_index = body.get_u32();
                let offset = body.get_u32();
                Ok(PeerMessage::Piece(Block {
                    piece_index,
                    offset,
                    data: body,
                }))
            }
            Self::CANCEL => {
                expect_len(12)?;
                Ok(PeerMessage::Cancel(get_block_info(&mut body)))
            }
            Self::PORT => {
                expect_len(2)?;
                Ok(PeerMessage::Port(body.get_u16()))
            }
            _ => Err(BittorrentError::ProtocolFormat(format!(
                "Unknown message ID: {}",
                id
            ))),
        }
    }
}

fn put_header(dst: &mut BytesMut, id: u8, payload_len: usize) {
    dst.reserve(5 + payload_len);
    dst.put_u32((1 + payload_len) as u32);
    dst.put_u8(id);
}

fn put_block_info(dst: &mut BytesMut, block: &BlockInfo) {
    dst.put_u32(block.piece_index);
    dst.put_u32(block.offset);
    dst.put_u32(block.length);
}

fn get_block_info(src: &mut Bytes) -> BlockInfo {
    let piece_index = src.get_u32();
    let offset = src.get_u32();
    let length = src.get_u32();
    BlockInfo::new(piece_index, offset, length)
}
