//! HTTP tracker announces with URL building and response parsing

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Deserialize;
use serde_bencode::value::Value;

use super::torrent::TorrentState;
use crate::torrent::{InfoHash, TorrentError};

/// Tracker announce request.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    /// TCP port accepting peer connections
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Bytes remaining to download (0 for seeders)
    pub left: u64,
    pub event: Option<AnnounceEvent>,
}

/// BitTorrent announce events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// Tracker announce response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds until the next announce
    pub interval: u32,
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, Deserialize)]
struct RawAnnounce {
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default)]
    peers: Option<Value>,
}

/// HTTP tracker client.
#[derive(Debug, Clone)]
pub struct HttpTracker {
    announce_url: String,
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(announce_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            announce_url: announce_url.into(),
            client,
        }
    }

    pub fn announce_url(&self) -> &str {
        &self.announce_url
    }

    /// Sends one announce and returns the peers the tracker handed out.
    ///
    /// # Errors
    /// - `TorrentError::TrackerFailed` - Request failed, non-200 status or tracker refused
    /// - `TorrentError::ProtocolError` - Response is not a valid announce dictionary
    pub async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        let url = self.build_announce_url(request);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(self.failed(format!("HTTP {}", response.status())));
        }

        let body = response.bytes().await.map_err(|e| self.failed(e.to_string()))?;
        self.parse_announce_response(&body)
    }

    /// Builds the announce URL. Binary fields are percent-encoded byte by
    /// byte since they are not valid UTF-8.
    pub(crate) fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            url_encode_bytes(request.info_hash.as_bytes()),
            url_encode_bytes(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        if let Some(event) = request.event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }

        let separator = if self.announce_url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.announce_url, separator, query)
    }

    pub(crate) fn parse_announce_response(&self, body: &[u8]) -> Result<AnnounceResponse, TorrentError> {
        let raw: RawAnnounce = serde_bencode::from_bytes(body).map_err(|e| TorrentError::ProtocolError {
            message: format!("Failed to parse tracker response: {e}"),
        })?;

        if let Some(reason) = raw.failure_reason {
            return Err(self.failed(reason));
        }

        let interval = raw
            .interval
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| TorrentError::ProtocolError {
                message: "Missing interval in tracker response".to_string(),
            })?;

        let peers = match raw.peers {
            Some(Value::Bytes(compact)) => parse_compact_peers(&compact)?,
            Some(Value::List(entries)) => parse_dictionary_peers(&entries),
            _ => Vec::new(),
        };

        Ok(AnnounceResponse { interval, peers })
    }

    fn failed(&self, reason: String) -> TorrentError {
        TorrentError::TrackerFailed {
            url: self.announce_url.clone(),
            reason,
        }
    }
}

/// Percent-encodes every byte.
pub(crate) fn url_encode_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| format!("%{b:02X}")).collect()
}

/// Parses the compact peer list: 4 address bytes plus a big-endian port each.
///
/// # Errors
/// - `TorrentError::ProtocolError` - Length is not a multiple of 6
pub(crate) fn parse_compact_peers(peer_bytes: &[u8]) -> Result<Vec<SocketAddr>, TorrentError> {
    if !peer_bytes.len().is_multiple_of(6) {
        return Err(TorrentError::ProtocolError {
            message: "Invalid compact peer data length".to_string(),
        });
    }

    Ok(peer_bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}

fn parse_dictionary_peers(entries: &[Value]) -> Vec<SocketAddr> {
    entries
        .iter()
        .filter_map(|entry| {
            let Value::Dict(dict) = entry else {
                return None;
            };
            let ip = match dict.get(b"ip".as_slice())? {
                Value::Bytes(ip) => std::str::from_utf8(ip).ok()?.parse().ok()?,
                _ => return None,
            };
            let port = match dict.get(b"port".as_slice())? {
                Value::Int(port) => u16::try_from(*port).ok()?,
                _ => return None,
            };
            Some(SocketAddr::new(ip, port))
        })
        .collect()
}

/// Announces to every HTTP tracker of a torrent until it closes.
///
/// Non-HTTP trackers are skipped. Each tracker runs on its own schedule,
/// honouring the interval it returns but never faster than the configured
/// minimum.
pub(crate) async fn announce_loop(state: Arc<TorrentState>) {
    let trackers: Vec<HttpTracker> = state
        .trackers
        .iter()
        .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
        .map(|url| HttpTracker::new(url.clone(), state.context.http.clone()))
        .collect();

    if trackers.is_empty() {
        tracing::debug!("No HTTP trackers for {}", state.info_hash);
        return;
    }

    let tasks: Vec<_> = trackers
        .into_iter()
        .map(|tracker| tokio::spawn(announce_to(state.clone(), tracker)))
        .collect();
    for task in tasks {
        let _ = task.await;
    }
}

async fn announce_to(state: Arc<TorrentState>, tracker: HttpTracker) {
    let mut shutdown = state.shutdown_signal();
    let min_interval = state.context.network.min_announce_interval;
    let mut event = Some(AnnounceEvent::Started);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let request = announce_request(&state, event);
        let wait = match tracker.announce(&request).await {
            Ok(response) => {
                tracing::debug!(
                    "Tracker {} returned {} peers for {}",
                    tracker.announce_url(),
                    response.peers.len(),
                    state.info_hash
                );
                state.add_peers(response.peers);
                event = None;
                Duration::from_secs(u64::from(response.interval)).max(min_interval)
            }
            Err(e) => {
                tracing::warn!("Announce failed: {}", e);
                min_interval
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }
    }

    if event.is_none() {
        let request = announce_request(&state, Some(AnnounceEvent::Stopped));
        let _ = tokio::time::timeout(Duration::from_secs(5), tracker.announce(&request)).await;
    }
}

fn announce_request(state: &TorrentState, event: Option<AnnounceEvent>) -> AnnounceRequest {
    AnnounceRequest {
        info_hash: state.info_hash,
        peer_id: *state.context.peer_id.as_bytes(),
        port: state.context.listen_port,
        uploaded: state.uploaded.load(Ordering::Relaxed),
        downloaded: state.downloaded.load(Ordering::Relaxed),
        left: state.bytes_left(),
        event,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(url: &str) -> HttpTracker {
        HttpTracker::new(url, reqwest::Client::new())
    }

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: InfoHash::new([0xab; 20]),
            peer_id: *b"-TW0001-123456789012",
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            event: Some(AnnounceEvent::Started),
        }
    }

    #[test]
    fn test_build_announce_url() {
        let url = tracker("http://tracker.example.com/announce").build_announce_url(&request());
        assert!(url.starts_with("http://tracker.example.com/announce?info_hash=%AB%AB"));
        assert!(url.contains("&peer_id=%2D%54%57"));
        assert!(url.contains("&port=6881&uploaded=1&downloaded=2&left=3&compact=1"));
        assert!(url.ends_with("&event=started"));
    }

    #[test]
    fn test_build_announce_url_keeps_existing_query() {
        let mut req = request();
        req.event = None;
        let url = tracker("http://t.example/announce?passkey=abc").build_announce_url(&req);
        assert!(url.starts_with("http://t.example/announce?passkey=abc&info_hash="));
        assert!(!url.contains("event="));
    }

    #[test]
    fn test_parse_compact_peers() {
        let peers = parse_compact_peers(&[127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80]).unwrap();
        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.0.0.2:80".parse().unwrap()
            ]
        );
        assert!(parse_compact_peers(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_parse_compact_announce_response() {
        let mut body = b"d8:intervali1800e5:peers6:".to_vec();
        body.extend_from_slice(&[192, 168, 1, 7, 0x1a, 0xe1]);
        body.push(b'e');

        let response = tracker("http://t/announce").parse_announce_response(&body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers, vec!["192.168.1.7:6881".parse().unwrap()]);
    }

    #[test]
    fn test_parse_dictionary_peer_list() {
        let body = b"d8:intervali60e5:peersld2:ip8:10.0.0.94:porti51413eeee";
        let response = tracker("http://t/announce").parse_announce_response(body).unwrap();
        assert_eq!(response.peers, vec!["10.0.0.9:51413".parse().unwrap()]);
    }

    #[test]
    fn test_failure_reason_is_reported() {
        let body = b"d14:failure reason17:torrent not founde";
        match tracker("http://t/announce").parse_announce_response(body) {
            Err(TorrentError::TrackerFailed { url, reason }) => {
                assert_eq!(url, "http://t/announce");
                assert_eq!(reason, "torrent not found");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_missing_interval_is_protocol_error() {
        let result = tracker("http://t/announce").parse_announce_response(b"d5:peers0:e");
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }
}
