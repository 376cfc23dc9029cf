use crate::bencode::BencodeValue;
use crate::error::{BittorrentError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Announce result, the same whichever transport produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    /// Seconds to wait before the next announce
    pub interval: u64,
    pub seeders: u64,
    pub leechers: u64,
    pub peers: Vec<SocketAddr>,
}

impl TrackerResponse {
    pub fn from_bencode(value: &BencodeValue) -> Result<Self> {
        if !value.is_dict() {
            return Err(BittorrentError::TrackerError(
                "Response must be a dict".to_string(),
            ));
        }

        // Check for failure reason
        if let Some(failure) = value.dict_get(b"failure reason") {
            let reason = failure.as_str().unwrap_or("Unknown failure").to_string();
            return Err(BittorrentError::TrackerError(reason));
        }

        let interval = value.dict_get_u64(b"interval").ok_or_else(|| {
            BittorrentError::TrackerError("Missing 'interval' field".to_string())
        })?;

        let peers = match value.dict_get(b"peers") {
            Some(BencodeValue::String(compact)) => parse_compact_peers(compact),
            Some(BencodeValue::List(list)) => parse_peer_list(list)?,
            Some(_) => {
                return Err(BittorrentError::TrackerError(
                    "Invalid 'peers' format".to_string(),
                ))
            }
            None => Vec::new(),
        };

        Ok(TrackerResponse {
            interval,
            seeders: value.dict_get_u64(b"complete").unwrap_or(0),
            leechers: value.dict_get_u64(b"incomplete").unwrap_or(0),
            peers,
        })
    }
}

/// 6 bytes per peer: IPv4 address then port, both big-endian. A trailing
/// partial entry is ignored.
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

fn parse_peer_list(list: &[BencodeValue]) -> Result<Vec<SocketAddr>> {
    list.iter()
        .map(|peer| {
            let ip: IpAddr = peer
                .dict_get_str(b"ip")
                .and_then(|ip| ip.parse().ok())
                .ok_or_else(|| BittorrentError::TrackerError("Invalid peer 'ip'".to_string()))?;

            let port = peer
                .dict_get_u64(b"port")
                .and_then(|port| u16::try_from(port).ok())
                .ok_or_else(|| BittorrentError::TrackerError("Invalid peer 'port'".to_string()))?;

            Ok(SocketAddr::new(ip, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decode;

    #[test]
    fn test_compact_response() {
        let mut body = b"d8:completei5e10:incompletei3e8:intervali900e5:peers12:".to_vec();
        body.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1, 192, 168, 0, 2, 0, 80]);
        body.push(b'e');

        let response = TrackerResponse::from_bencode(&decode(&body).unwrap()).unwrap();
        assert_eq!(response.interval, 900);
        assert_eq!(response.seeders, 5);
        assert_eq!(response.leechers, 3);
        assert_eq!(
            response.peers,
            vec![
                "10.0.0.1:6881".parse().unwrap(),
                "192.168.0.2:80".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_dict_peer_list() {
        let body = [
            &b"d8:intervali60e5:peersl"[..],
            b"d2:ip9:127.0.0.17:peer id20:aaaaaaaaaaaaaaaaaaaa4:porti6881ee",
            b"ee",
        ]
        .concat();
        let response = TrackerResponse::from_bencode(&decode(&body).unwrap()).unwrap();
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
        assert_eq!(response.seeders, 0);
    }

    #[test]
    fn test_failure_reason() {
        let body = b"d14:failure reason12:unregisterede";
        let err = TrackerResponse::from_bencode(&decode(body).unwrap()).unwrap_err();
        assert!(matches!(err, BittorrentError::TrackerError(reason) if reason == "unregistered"));
    }

    #[test]
    fn test_missing_interval() {
        let body = b"d5:peers0:e";
        assert!(TrackerResponse::from_bencode(&decode(body).unwrap()).is_err());
    }

    #[test]
    fn test_partial_compact_entry_ignored() {
        assert_eq!(parse_compact_peers(&[1, 2, 3, 4, 0, 1, 9, 9]).len(), 1);
    }
}
