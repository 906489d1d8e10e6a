//! Centralized configuration for Tideway.
//!
//! All tunable parameters are defined here so the engine, resolvers and
//! the HTTP layer never carry hard-coded limits of their own.

use std::time::Duration;

/// Central configuration for all Tideway components.
///
/// Groups related settings into sections. Supports environment variable
/// overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct TidewayConfig {
    pub network: NetworkConfig,
    pub engine: EngineConfig,
    pub streaming: StreamingConfig,
}

/// Network communication, descriptor fetching and tracker configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// HTTP request timeout for descriptor downloads
    pub descriptor_timeout: Duration,
    /// Largest descriptor body accepted from a remote server
    pub max_descriptor_bytes: usize,
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// Minimum announce interval regardless of what trackers ask for
    pub min_announce_interval: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// Maximum concurrent peer connections per torrent
    pub max_peer_connections: usize,
    /// TCP connect timeout for outgoing peer connections
    pub peer_connect_timeout: Duration,
    /// Peers silent for longer than this are disconnected
    pub peer_idle_timeout: Duration,
    /// Delay between distributed hash table lookups for one torrent
    pub dht_lookup_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            descriptor_timeout: Duration::from_secs(30),
            max_descriptor_bytes: 16 * 1024 * 1024, // 16 MiB
            tracker_timeout: Duration::from_secs(30),
            min_announce_interval: Duration::from_secs(60),
            user_agent: "tideway/0.1.0",
            max_peer_connections: 50,
            peer_connect_timeout: Duration::from_secs(5),
            peer_idle_timeout: Duration::from_secs(180),
            dht_lookup_interval: Duration::from_secs(300),
        }
    }
}

/// Swarm engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// BitTorrent client identifier prefix
    pub client_id: &'static str,
    /// Size of a single block request
    pub block_size: u32,
    /// Outstanding block requests kept in flight per peer
    pub request_pipeline: usize,
    /// Pieces ahead of a reader that are raised to high priority
    pub readahead_pieces: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client_id: "-TW0001-",
            block_size: 16384, // 16 KiB
            request_pipeline: 16,
            readahead_pieces: 4,
        }
    }
}

/// HTTP streaming configuration.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Bytes read from a file stream per response body chunk
    pub chunk_size: usize,
    /// Longest a single read may wait for missing pieces (None = forever)
    pub read_timeout: Option<Duration>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 65536, // 64 KiB
            read_timeout: None,
        }
    }
}

impl TidewayConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Recognized variables: `TIDEWAY_TRACKER_TIMEOUT` (seconds),
    /// `TIDEWAY_MAX_PEERS`, `TIDEWAY_READAHEAD_PIECES` and
    /// `TIDEWAY_READ_TIMEOUT` (seconds). Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("TIDEWAY_TRACKER_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.network.tracker_timeout = Duration::from_secs(seconds);
        }

        if let Ok(max_peers) = std::env::var("TIDEWAY_MAX_PEERS")
            && let Ok(count) = max_peers.parse::<usize>()
        {
            config.network.max_peer_connections = count;
        }

        if let Ok(readahead) = std::env::var("TIDEWAY_READAHEAD_PIECES")
            && let Ok(count) = readahead.parse::<usize>()
        {
            config.engine.readahead_pieces = count;
        }

        if let Ok(timeout) = std::env::var("TIDEWAY_READ_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.streaming.read_timeout = Some(Duration::from_secs(seconds));
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = TidewayConfig::default();

        assert_eq!(config.engine.client_id, "-TW0001-");
        assert_eq!(config.engine.block_size, 16384);
        assert_eq!(config.network.max_peer_connections, 50);
        assert_eq!(config.network.tracker_timeout, Duration::from_secs(30));
        assert_eq!(config.streaming.chunk_size, 65536);
        assert!(config.streaming.read_timeout.is_none());
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("TIDEWAY_TRACKER_TIMEOUT", "60");
            std::env::set_var("TIDEWAY_MAX_PEERS", "7");
            std::env::set_var("TIDEWAY_READAHEAD_PIECES", "9");
            std::env::set_var("TIDEWAY_READ_TIMEOUT", "15");
        }

        let config = TidewayConfig::from_env();

        assert_eq!(config.network.tracker_timeout, Duration::from_secs(60));
        assert_eq!(config.network.max_peer_connections, 7);
        assert_eq!(config.engine.readahead_pieces, 9);
        assert_eq!(config.streaming.read_timeout, Some(Duration::from_secs(15)));

        unsafe {
            std::env::remove_var("TIDEWAY_TRACKER_TIMEOUT");
            std::env::remove_var("TIDEWAY_MAX_PEERS");
            std::env::remove_var("TIDEWAY_READAHEAD_PIECES");
            std::env::remove_var("TIDEWAY_READ_TIMEOUT");
        }
    }
}
