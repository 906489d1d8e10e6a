//! Bundled swarm engine: listener, torrent registry and background tasks

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::discovery::{self, Discovery};
use super::peer::{self, PeerId, connection};
use super::torrent::{SwarmTorrent, TorrentState};
use super::{EngineError, TorrentClient, TorrentHandle, tracker};
use crate::config::{EngineConfig, NetworkConfig, TidewayConfig};
use crate::torrent::{InfoHash, SeedAddress, TorrentSpec};

const INCOMING_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings shared by every torrent of one client.
pub(crate) struct EngineContext {
    pub peer_id: PeerId,
    pub listen_port: u16,
    pub network: NetworkConfig,
    pub engine: EngineConfig,
    pub read_timeout: Option<Duration>,
    pub data_dir: PathBuf,
    /// Runtime the client was started on, for work spawned from blocking readers
    pub runtime: tokio::runtime::Handle,
    /// Taken on close so the DHT node stops with the client
    pub discovery: Mutex<Option<Discovery>>,
    pub http: reqwest::Client,
}

/// Startup options for [`SwarmClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory torrent content is stored under
    pub data_dir: PathBuf,
    /// `host:port` for incoming peer connections; `:port` binds all interfaces
    pub listen_addr: String,
    /// DHT bootstrap nodes; discovery stays off when empty
    pub seeds: Vec<SeedAddress>,
    pub settings: TidewayConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            listen_addr: "0.0.0.0:0".to_string(),
            seeds: Vec::new(),
            settings: TidewayConfig::default(),
        }
    }
}

/// BitTorrent client downloading torrents into a data directory.
pub struct SwarmClient {
    context: Arc<EngineContext>,
    listen_addr: SocketAddr,
    torrents: Arc<Mutex<HashMap<InfoHash, Arc<TorrentState>>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SwarmClient {
    /// Binds the peer listener, joins the DHT and starts accepting peers.
    ///
    /// # Errors
    /// - `EngineError::ListenFailed` - Listen address unusable or already taken
    /// - `EngineError::Discovery` - DHT node could not start
    pub async fn start(config: ClientConfig) -> Result<Self, EngineError> {
        let bind_addr = normalize_listen_addr(&config.listen_addr);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| EngineError::ListenFailed {
                addr: config.listen_addr.clone(),
                reason: e.to_string(),
            })?;
        let listen_addr = listener.local_addr().map_err(|e| EngineError::ListenFailed {
            addr: config.listen_addr.clone(),
            reason: e.to_string(),
        })?;

        let discovery = if config.seeds.is_empty() {
            tracing::info!("No DHT seed nodes; peer discovery limited to trackers");
            None
        } else {
            Some(Discovery::start(&config.seeds)?)
        };

        let network = config.settings.network;
        let http = reqwest::Client::builder()
            .timeout(network.tracker_timeout)
            .user_agent(network.user_agent)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });

        let context = Arc::new(EngineContext {
            peer_id: PeerId::generate(config.settings.engine.client_id),
            listen_port: listen_addr.port(),
            network,
            engine: config.settings.engine,
            read_timeout: config.settings.streaming.read_timeout,
            data_dir: config.data_dir,
            runtime: tokio::runtime::Handle::current(),
            discovery: Mutex::new(discovery),
            http,
        });

        let torrents: Arc<Mutex<HashMap<InfoHash, Arc<TorrentState>>>> = Arc::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, torrents.clone(), shutdown_rx));

        tracing::info!("Accepting peers on {}", listen_addr);
        Ok(Self {
            context,
            listen_addr,
            torrents,
            shutdown_tx,
        })
    }

    fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl TorrentClient for SwarmClient {
    fn add_torrent(&self, spec: TorrentSpec) -> Result<Arc<dyn TorrentHandle>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }

        let mut torrents = self.torrents.lock();
        if let Some(existing) = torrents.get(&spec.info_hash) {
            return Ok(Arc::new(SwarmTorrent::new(existing.clone())));
        }

        let (state, queued) = TorrentState::new(&spec, self.context.clone());
        if let Some(info) = spec.info.clone() {
            state.install_info(info)?;
        }
        torrents.insert(spec.info_hash, state.clone());
        drop(torrents);

        tokio::spawn(peer::manage_peers(state.clone(), queued));
        tokio::spawn(tracker::announce_loop(state.clone()));
        if let Some(discovery) = self.context.discovery.lock().clone() {
            tokio::spawn(discovery::lookup_loop(state.clone(), discovery));
        }

        tracing::info!(
            "Added torrent {} ({})",
            spec.info_hash,
            spec.name().unwrap_or("unnamed")
        );
        Ok(Arc::new(SwarmTorrent::new(state)))
    }

    fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    fn close(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        for (_, state) in self.torrents.lock().drain() {
            state.close();
        }
        if self.context.discovery.lock().take().is_some() {
            tracing::debug!("DHT node released");
        }
        tracing::info!("Torrent client stopped");
    }
}

impl Drop for SwarmClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// `:port` means every interface, as in `0.0.0.0:port`.
pub fn normalize_listen_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

async fn accept_loop(
    listener: TcpListener,
    torrents: Arc<Mutex<HashMap<InfoHash, Arc<TorrentState>>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, address)) => {
                    tokio::spawn(handle_incoming(stream, address, torrents.clone()));
                }
                Err(e) => {
                    tracing::warn!("Accepting peer connection failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle_incoming(
    mut stream: TcpStream,
    address: SocketAddr,
    torrents: Arc<Mutex<HashMap<InfoHash, Arc<TorrentState>>>>,
) {
    let theirs = match connection::read_handshake(&mut stream, INCOMING_HANDSHAKE_TIMEOUT).await {
        Ok(handshake) => handshake,
        Err(e) => {
            tracing::debug!("Bad handshake from {}: {}", address, e);
            return;
        }
    };

    let state = torrents.lock().get(&theirs.info_hash).cloned();
    match state {
        Some(state) => peer::accept_incoming(state, stream, theirs, address).await,
        None => tracing::debug!("{} asked for unknown torrent {}", address, theirs.info_hash),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::engine::peer::Handshake;
    use crate::fixtures::TorrentBuilder;

    fn config(data_dir: &std::path::Path) -> ClientConfig {
        ClientConfig {
            data_dir: data_dir.to_path_buf(),
            listen_addr: "127.0.0.1:0".to_string(),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn test_normalize_listen_addr() {
        assert_eq!(normalize_listen_addr(":6881"), "0.0.0.0:6881");
        assert_eq!(normalize_listen_addr("127.0.0.1:0"), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_listen_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.listen_addr = "localhost:99999".to_string();
        assert!(matches!(
            SwarmClient::start(config).await,
            Err(EngineError::ListenFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_torrent_is_deduplicated_by_info_hash() {
        let dir = tempfile::tempdir().unwrap();
        let client = SwarmClient::start(config(dir.path())).await.unwrap();
        let fixture = TorrentBuilder::single("movie.bin", 100).piece_length(32).build();

        let first = client.add_torrent(fixture.spec()).unwrap();
        let second = client.add_torrent(fixture.spec()).unwrap();
        assert_eq!(first.info_hash(), second.info_hash());
        assert_eq!(client.torrents.lock().len(), 1);

        client.close();
        client.close();
        assert!(matches!(client.add_torrent(fixture.spec()), Err(EngineError::Closed)));
    }

    #[tokio::test]
    async fn test_existing_data_is_verified_on_add() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = TorrentBuilder::new("album")
            .file("a.txt", 50)
            .file("b.txt", 70)
            .piece_length(32)
            .build();
        fixture.write_to(dir.path());

        let client = SwarmClient::start(config(dir.path())).await.unwrap();
        let torrent = client.add_torrent(fixture.spec()).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let done = torrent
                .files()
                .iter()
                .all(|file| file.piece_states().iter().all(|p| p.complete));
            if done {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "verification did not finish");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        client.close();
    }

    #[tokio::test]
    async fn test_close_releases_dht_node() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.seeds = vec![SeedAddress::new("127.0.0.1:6881".parse().unwrap())];
        let client = SwarmClient::start(config).await.unwrap();
        assert!(client.context.discovery.lock().is_some());

        client.close();
        assert!(client.context.discovery.lock().is_none());

        let fixture = TorrentBuilder::single("late.bin", 10).build();
        assert!(matches!(client.add_torrent(fixture.spec()), Err(EngineError::Closed)));
    }

    #[tokio::test]
    async fn test_incoming_handshake_for_unknown_torrent_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let client = SwarmClient::start(config(dir.path())).await.unwrap();

        let mut stream = TcpStream::connect(client.listen_addr()).await.unwrap();
        let handshake = Handshake::new(InfoHash::new([7; 20]), PeerId::new([1; 20]));
        stream.write_all(&handshake.encode()).await.unwrap();

        let reply = connection::read_handshake(&mut stream, Duration::from_secs(2)).await;
        assert!(reply.is_err());
        client.close();
    }
}
