use super::response::parse_compact_peers;
use super::{TrackerEvent, TrackerRequest, TrackerResponse};
use crate::error::{BittorrentError, Result};
use bytes::{Buf, BufMut, BytesMut};
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tracing::debug;
use url::Url;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const UDP_TIMEOUT: Duration = Duration::from_secs(15);

/// Announces over the UDP tracker protocol: connect, then announce, on one
/// socket
pub struct UdpTracker {
    host: String,
    port: u16,
}

impl UdpTracker {
    pub fn new(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| BittorrentError::TrackerError(format!("No host in {}", url)))?;
        let port = url
            .port()
            .ok_or_else(|| BittorrentError::TrackerError(format!("No port in {}", url)))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub async fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse> {
        let addr = lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                BittorrentError::TrackerError(format!("Cannot resolve {}", self.host))
            })?;

        timeout(UDP_TIMEOUT, announce_to(addr, request))
            .await
            .map_err(|_| BittorrentError::TrackerError(format!("UDP tracker {} timed out", addr)))?
    }
}

async fn announce_to(addr: SocketAddr, request: &TrackerRequest) -> Result<TrackerResponse> {
    let bind: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    let mut buf = vec![0u8; 2048];

    let transaction_id: u32 = rand::thread_rng().gen();
    socket.send(&connect_request(transaction_id)).await?;
    let n = socket.recv(&mut buf).await?;
    let connection_id = parse_connect_response(&buf[..n], transaction_id)?;
    debug!("UDP tracker {} connection id {:#x}", addr, connection_id);

    let transaction_id: u32 = rand::thread_rng().gen();
    let key: u32 = rand::thread_rng().gen();
    socket
        .send(&announce_request(connection_id, transaction_id, key, request))
        .await?;
    let n = socket.recv(&mut buf).await?;
    parse_announce_response(&buf[..n], transaction_id)
}

pub(crate) fn connect_request(transaction_id: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64(PROTOCOL_ID);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf
}

pub(crate) fn announce_request(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    request: &TrackerRequest,
) -> BytesMut {
    let mut buf = BytesMut::with_capacity(98);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(transaction_id);
    buf.put_slice(&request.info_hash);
    buf.put_slice(&request.peer_id);
    buf.put_u64(request.downloaded);
    buf.put_u64(request.left);
    buf.put_u64(request.uploaded);
    buf.put_u32(TrackerEvent::udp_code(request.event));
    buf.put_u32(0); // IP address (0 = default)
    buf.put_u32(key);
    buf.put_i32(-1); // num_want (-1 = default)
    buf.put_u16(request.port);
    buf
}

/// Action and transaction id common to every response. An error action is
/// turned into the tracker's message.
fn check_header(mut data: &[u8], expected_action: u32, transaction_id: u32) -> Result<&[u8]> {
    if data.len() < 8 {
        return Err(BittorrentError::TrackerError(
            "UDP response too short".to_string(),
        ));
    }

    let action = data.get_u32();
    let received_id = data.get_u32();
    if received_id != transaction_id {
        return Err(BittorrentError::TrackerError(format!(
            "Transaction id mismatch: sent {:#x}, got {:#x}",
            transaction_id, received_id
        )));
    }
    if action == ACTION_ERROR {
        return Err(BittorrentError::TrackerError(
            String::from_utf8_lossy(data).to_string(),
        ));
    }
    if action != expected_action {
        return Err(BittorrentError::TrackerError(format!(
            "Unexpected action {}",
            action
        )));
    }
    Ok(data)
}

pub(crate) fn parse_connect_response(data: &[u8], transaction_id: u32) -> Result<u64> {
    let mut body = check_header(data, ACTION_CONNECT, transaction_id)?;
    if body.len() < 8 {
        return Err(BittorrentError::TrackerError(
            "UDP connect response too short".to_string(),
        ));
    }
    Ok(body.get_u64())
}

pub(crate) fn parse_announce_response(data: &[u8], transaction_id: u32) -> Result<TrackerResponse> {
    let mut body = check_header(data, ACTION_ANNOUNCE, transaction_id)?;
    if body.len() < 12 {
        return Err(BittorrentError::TrackerError(
            "UDP announce response too short".to_string(),
        ));
    }

    let interval = body.get_u32() as u64;
    let leechers = body.get_u32() as u64;
    let seeders = body.get_u32() as u64;

    Ok(TrackerResponse {
        interval,
        seeders,
        leechers,
        peers: parse_compact_peers(body),
    })
}
