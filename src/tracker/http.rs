use super::{TrackerRequest, TrackerResponse};
use crate::bencode::decode;
use crate::error::{BittorrentError, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Announces over HTTP(S) GET
pub struct HttpTracker {
    client: Client,
    url: Url,
}

impl HttpTracker {
    pub fn new(url: Url) -> Result<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { client, url })
    }

    pub async fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse> {
        // set_query would escape our '%' sequences again, so the query is
        // assembled by hand and appended to any the announce URL carries
        let mut url = self.url.clone();
        let query = match self.url.query() {
            Some(existing) if !existing.is_empty() => {
                format!("{}&{}", existing, request.to_query())
            }
            _ => request.to_query(),
        };
        url.set_query(Some(&query));

        debug!("Tracker request URL: {}", url);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        debug!("Tracker response status: {}, body length: {}", status, body.len());

        if !status.is_success() {
            return Err(BittorrentError::TrackerError(format!(
                "HTTP error: {}",
                status
            )));
        }

        TrackerResponse::from_bencode(&decode(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the request line
    async fn serve_once(body: &'static [u8]) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!(
            "http://{}/announce?passkey=abc",
            listener.local_addr().unwrap()
        ))
        .unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();

            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            request.lines().next().unwrap_or_default().to_string()
        });

        (url, handle)
    }

    fn request() -> TrackerRequest {
        TrackerRequest {
            info_hash: [0xab; 20],
            peer_id: *b"-PW0001-000000000000",
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: None,
        }
    }

    #[tokio::test]
    async fn test_announce_round_trip() {
        let (url, server) =
            serve_once(b"d8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e").await;
        let tracker = HttpTracker::new(url).unwrap();

        let response = tracker.announce(&request()).await.unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);

        let request_line = server.await.unwrap();
        assert!(request_line.starts_with("GET /announce?passkey=abc&info_hash=%AB%AB"));
        assert!(request_line.contains("&left=100&compact=1 "));
    }

    #[tokio::test]
    async fn test_failure_reason_is_an_error() {
        let (url, _server) = serve_once(b"d14:failure reason7:go awaye").await;
        let tracker = HttpTracker::new(url).unwrap();

        let err = tracker.announce(&request()).await.unwrap_err();
        assert!(matches!(err, BittorrentError::TrackerError(reason) if reason == "go away"));
    }
}
