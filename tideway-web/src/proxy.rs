//! Proxy controller: one torrent, one engine client, one HTTP listener.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use tideway_core::config::StreamingConfig;
use tideway_core::engine::normalize_listen_addr;
use tideway_core::{
    ClientConfig, SpecResolver, SwarmClient, TidewayConfig, TorrentClient, TorrentHandle,
    TorrentSpec, resolve_seed_addresses,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::ProxyError;
use crate::handlers::{ProxyState, router};
use crate::status::TorrentStatus;

/// Process-level settings for a [`TorrentProxy`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Magnet link or descriptor URL
    pub locator: String,
    /// DHT bootstrap `host:port` entries; empty uses the public bootstrap nodes
    pub seed_nodes: Vec<String>,
    /// Address of the HTTP surface
    pub http_listen_addr: String,
    /// Address accepting incoming peer connections
    pub torrent_listen_addr: String,
    pub data_dir: PathBuf,
    pub settings: TidewayConfig,
}

impl ProxyConfig {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            ..Self::default()
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            locator: String::new(),
            seed_nodes: Vec::new(),
            http_listen_addr: "localhost:0".to_string(),
            torrent_listen_addr: "0.0.0.0:0".to_string(),
            data_dir: PathBuf::from("."),
            settings: TidewayConfig::default(),
        }
    }
}

/// Serves the files of a single torrent over HTTP while it downloads.
pub struct TorrentProxy {
    client: Arc<dyn TorrentClient>,
    torrent: Arc<dyn TorrentHandle>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
    closed: AtomicBool,
}

impl TorrentProxy {
    /// Resolves everything, then brings up the engine and the HTTP listener.
    ///
    /// Nothing keeps running when this fails.
    ///
    /// # Errors
    /// - `ProxyError::Seeds` - A seed node entry cannot be resolved
    /// - `ProxyError::Resolve` - The locator does not yield a torrent
    /// - `ProxyError::ListenFailed` - HTTP listen address unusable
    /// - `ProxyError::Engine` - Engine could not start or add the torrent
    pub async fn start(config: ProxyConfig) -> Result<Self, ProxyError> {
        let seeds = resolve_seed_addresses(&config.seed_nodes[..]).await?;
        let spec = SpecResolver::new(&config.settings.network)
            .resolve(&config.locator)
            .await?;
        info!("Resolved torrent {} ({})", spec.info_hash, spec.name().unwrap_or("unnamed"));

        let listener = HttpListener::bind(&config.http_listen_addr).await?;

        let streaming = config.settings.streaming.clone();
        let client = SwarmClient::start(ClientConfig {
            data_dir: config.data_dir,
            listen_addr: config.torrent_listen_addr,
            seeds,
            settings: config.settings,
        })
        .await?;

        Self::with_client(Arc::new(client), spec, listener, &streaming)
    }

    /// Adds `spec` to an already running client and starts serving on `listener`.
    ///
    /// The client is closed if the torrent cannot be added.
    ///
    /// # Errors
    /// - `ProxyError::Engine` - The client refused the torrent
    pub fn with_client(
        client: Arc<dyn TorrentClient>,
        spec: TorrentSpec,
        listener: HttpListener,
        streaming: &StreamingConfig,
    ) -> Result<Self, ProxyError> {
        let HttpListener {
            listener,
            local_addr,
        } = listener;

        let torrent = match client.add_torrent(spec) {
            Ok(torrent) => torrent,
            Err(e) => {
                client.close();
                return Err(e.into());
            }
        };

        let app = router(ProxyState {
            torrent: torrent.clone(),
            last_modified: Utc::now(),
            chunk_size: streaming.chunk_size,
        });

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
        });

        info!("Serving {} on http://{}", torrent.name(), local_addr);
        Ok(Self {
            client,
            torrent,
            local_addr,
            shutdown_tx,
            server: Mutex::new(Some(server)),
            closed: AtomicBool::new(false),
        })
    }

    /// Base URL of the HTTP surface, e.g. `http://127.0.0.1:4242`.
    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current readiness and per-file completion.
    pub fn status(&self) -> TorrentStatus {
        TorrentStatus::snapshot(self.torrent.as_ref())
    }

    /// Waits until the HTTP listener stops.
    ///
    /// Returns immediately if another caller is already waiting.
    ///
    /// # Errors
    /// - `ProxyError::Server` - The listener stopped abnormally
    pub async fn run(&self) -> Result<(), ProxyError> {
        let Some(server) = self.server.lock().take() else {
            return Ok(());
        };

        match server.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProxyError::Server {
                reason: e.to_string(),
            }),
            Err(e) => Err(ProxyError::Server {
                reason: e.to_string(),
            }),
        }
    }

    /// Stops the HTTP listener, the torrent and the engine. Safe to call twice.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        self.torrent.close();
        self.client.close();
        info!("Proxy on {} closed", self.local_addr);
    }
}

impl Drop for TorrentProxy {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bound HTTP socket together with the address it ended up on.
pub struct HttpListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl HttpListener {
    /// Binds `addr`, where `:port` means every interface.
    ///
    /// # Errors
    /// - `ProxyError::ListenFailed` - Carries `addr` as configured
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listen_failed = |e: std::io::Error| ProxyError::ListenFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        };

        let listener = TcpListener::bind(normalize_listen_addr(addr))
            .await
            .map_err(listen_failed)?;
        let local_addr = listener.local_addr().map_err(listen_failed)?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tideway_core::fixtures::{MemoryClient, MemoryTorrent, TorrentBuilder, TorrentFixture};

    use super::*;
    use crate::status::Readiness;

    fn fixture() -> TorrentFixture {
        TorrentBuilder::single("talk.webm", 500).piece_length(128).build()
    }

    async fn proxy_over(client: Arc<MemoryClient>, fixture: &TorrentFixture) -> TorrentProxy {
        let listener = HttpListener::bind("127.0.0.1:0").await.unwrap();
        TorrentProxy::with_client(client, fixture.spec(), listener, &StreamingConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_with_client_adds_spec_and_serves() {
        let fixture = fixture();
        let torrent = MemoryTorrent::new(&fixture);
        let client = MemoryClient::new(torrent.clone());
        let proxy = proxy_over(client.clone(), &fixture).await;

        assert_eq!(client.added().len(), 1);
        assert_eq!(client.added()[0].info_hash, fixture.info_hash);
        assert!(proxy.url().starts_with("http://127.0.0.1:"));

        let status = proxy.status();
        assert_eq!(status.status, Readiness::Ready);
        assert_eq!(status.files[0].complete, 0.0);
        torrent.complete_all();
        assert_eq!(proxy.status().files[0].complete, 1.0);

        let body = reqwest::get(format!("{}/talk.webm", proxy.url()))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&body[..], fixture.file_content(0));
        proxy.close();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_run() {
        let fixture = fixture();
        let torrent = MemoryTorrent::new(&fixture);
        let client = MemoryClient::new(torrent.clone());
        let proxy = proxy_over(client.clone(), &fixture).await;

        proxy.close();
        proxy.close();
        assert!(client.is_closed());
        assert!(torrent.is_closed());

        tokio::time::timeout(Duration::from_secs(5), proxy.run())
            .await
            .expect("listener stopped")
            .unwrap();
        // A second wait has nothing left to wait for
        proxy.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_client_is_reported() {
        let fixture = fixture();
        let client = MemoryClient::new(MemoryTorrent::new(&fixture));
        client.close();

        let listener = HttpListener::bind("127.0.0.1:0").await.unwrap();
        let result =
            TorrentProxy::with_client(client, fixture.spec(), listener, &StreamingConfig::default());
        assert!(matches!(result, Err(ProxyError::Engine(tideway_core::EngineError::Closed))));
    }

    #[tokio::test]
    async fn test_port_shorthand_binds_all_interfaces() {
        let listener = HttpListener::bind(":0").await.unwrap();
        assert!(listener.local_addr().ip().is_unspecified());
    }

    #[tokio::test]
    async fn test_bad_http_port_names_configured_address() {
        match HttpListener::bind("localhost:99999").await {
            Err(ProxyError::ListenFailed { addr, .. }) => assert_eq!(addr, "localhost:99999"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("bound an invalid port"),
        }
    }

    #[tokio::test]
    async fn test_serves_on_the_bound_address() {
        let fixture = fixture();
        let client = MemoryClient::new(MemoryTorrent::new(&fixture));
        let listener = HttpListener::bind("127.0.0.1:0").await.unwrap();
        let bound = listener.local_addr();

        let proxy =
            TorrentProxy::with_client(client, fixture.spec(), listener, &StreamingConfig::default())
                .unwrap();
        assert_eq!(proxy.local_addr(), bound);
        assert_eq!(proxy.url(), format!("http://{bound}"));
        proxy.close();
    }

    #[test]
    fn test_config_defaults() {
        let config = ProxyConfig::new("magnet:?xt=urn:btih:0000000000000000000000000000000000000000");
        assert_eq!(config.http_listen_addr, "localhost:0");
        assert_eq!(config.torrent_listen_addr, "0.0.0.0:0");
        assert_eq!(config.data_dir, PathBuf::from("."));
        assert!(config.seed_nodes.is_empty());
    }
}
