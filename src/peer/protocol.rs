use bytes::{Buf, BytesMut};
use crate::error::{BittorrentError, Result};

pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Encoded size of our handshake: 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_LEN: usize = 68;

/// Handshake message for peer wire protocol
/// Format: <pstrlen><pstr><reserved><info_hash><peer_id>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Serialize handshake to bytes; reserved bytes are always zero
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Deserialize a handshake. Fails when fewer than `49 + pstrlen` bytes
    /// are present or the protocol string is not ours.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let pstrlen = *data.first().ok_or_else(|| {
            BittorrentError::ProtocolFormat("Empty handshake".to_string())
        })? as usize;

        if data.len() < 49 + pstrlen {
            return Err(BittorrentError::ProtocolFormat(
                "Handshake too short".to_string(),
            ));
        }

        if &data[1..1 + pstrlen] != PROTOCOL_STRING {
            return Err(BittorrentError::ProtocolFormat(
                "Invalid protocol string".to_string(),
            ));
        }

        let rest = &data[1 + pstrlen + 8..];
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&rest[..20]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&rest[20..40]);

        Ok(Handshake { info_hash, peer_id })
    }

    /// Take a handshake off the front of a receive buffer, or `Ok(None)`
    /// while fewer than `1 + pstrlen + 48` bytes have arrived.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>> {
        let Some(&pstrlen) = src.first() else {
            return Ok(None);
        };

        let needed = 49 + pstrlen as usize;
        if src.len() < needed {
            return Ok(None);
        }

        let handshake = Self::from_bytes(&src[..needed])?;
        src.advance(needed);
        Ok(Some(handshake))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_handshake_serialization() {
        let info_hash = [1u8; 20];
        let peer_id = [2u8; 20];

        let handshake = Handshake::new(info_hash, peer_id);
        let bytes = handshake.to_bytes();

        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL_STRING);
        assert_eq!(&bytes[20..28], &[0u8; 8]);

        let decoded = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn test_rejects_short_handshake() {
        let bytes = Handshake::new([1u8; 20], [2u8; 20]).to_bytes();
        assert!(Handshake::from_bytes(&bytes[..67]).is_err());
        assert!(Handshake::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_rejects_foreign_protocol() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).to_bytes();
        bytes[1] = b'b';
        assert!(Handshake::from_bytes(&bytes).is_err());

        let mut other_len = Handshake::new([1u8; 20], [2u8; 20]).to_bytes();
        other_len[0] = 18;
        assert!(Handshake::from_bytes(&other_len).is_err());
    }

    #[test]
    fn test_decode_leaves_following_messages_in_buffer() {
        let mut buf = BytesMut::new();
        let bytes = Handshake::new([3u8; 20], [4u8; 20]).to_bytes();

        buf.put_slice(&bytes[..40]);
        assert!(Handshake::decode(&mut buf).unwrap().is_none());

        buf.put_slice(&bytes[40..]);
        buf.put_slice(&[0, 0, 0, 1, 2]);
        let handshake = Handshake::decode(&mut buf).unwrap().unwrap();
        assert_eq!(handshake.peer_id, [4u8; 20]);
        assert_eq!(&buf[..], &[0, 0, 0, 1, 2]);
    }
}
