/// Events sent to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }

    /// Event field of a UDP announce; 0 means no event
    pub fn udp_code(event: Option<TrackerEvent>) -> u32 {
        match event {
            None => 0,
            Some(TrackerEvent::Completed) => 1,
            Some(TrackerEvent::Started) => 2,
            Some(TrackerEvent::Stopped) => 3,
        }
    }
}

/// Request parameters for tracker communication
#[derive(Debug, Clone)]
pub struct TrackerRequest {
    /// SHA1 hash of the info dictionary
    pub info_hash: [u8; 20],
    /// Unique peer ID
    pub peer_id: [u8; 20],
    /// Port this peer is listening on
    pub port: u16,
    /// Total amount uploaded
    pub uploaded: u64,
    /// Total amount downloaded
    pub downloaded: u64,
    /// Number of bytes left to download
    pub left: u64,
    pub event: Option<TrackerEvent>,
}

impl TrackerRequest {
    /// Query string for an HTTP announce. Binary fields are escaped byte by
    /// byte; `url` must not encode them again.
    pub fn to_query(&self) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            urlencode_bytes(&self.info_hash),
            urlencode_bytes(&self.peer_id),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
        );

        if let Some(event) = self.event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }
        query
    }
}

/// Percent-encode raw bytes, leaving RFC 3986 unreserved characters as is
fn urlencode_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{:02X}", b),
        })
        .collect()
}
