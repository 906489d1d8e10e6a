//! Mainline DHT peer discovery (BEP 5)

use std::net::SocketAddr;
use std::sync::Arc;

use mainline::{Dht, Id};

use super::EngineError;
use super::torrent::TorrentState;
use crate::torrent::{InfoHash, SeedAddress};

/// Well-known routers used when no seed nodes are configured.
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "dht.aelitis.com:6881",
];

/// Handle to a running DHT node. The node stops when the last clone drops.
#[derive(Clone)]
pub struct Discovery {
    dht: Arc<Dht>,
}

impl Discovery {
    /// Joins the DHT through the given seed nodes.
    ///
    /// # Errors
    /// - `EngineError::Discovery` - The DHT socket could not be created
    pub fn start(seeds: &[SeedAddress]) -> Result<Self, EngineError> {
        let bootstrap: Vec<String> = seeds.iter().map(ToString::to_string).collect();
        let dht = Dht::builder()
            .bootstrap(&bootstrap)
            .build()
            .map_err(|e| EngineError::Discovery {
                reason: e.to_string(),
            })?;

        tracing::info!("DHT started with {} seed nodes", bootstrap.len());
        Ok(Self { dht: Arc::new(dht) })
    }

    /// Looks up peers announced for `info_hash`. Blocks until the lookup finishes,
    /// so it runs on the blocking pool.
    pub async fn find_peers(&self, info_hash: InfoHash) -> Vec<SocketAddr> {
        let dht = self.dht.clone();
        let lookup = tokio::task::spawn_blocking(move || {
            let id = match Id::from_bytes(info_hash.as_bytes()) {
                Ok(id) => id,
                Err(e) => {
                    tracing::error!("Failed to convert info hash to DHT id: {}", e);
                    return Vec::new();
                }
            };
            dht.get_peers(id).flatten().map(SocketAddr::V4).collect::<Vec<_>>()
        });

        lookup.await.unwrap_or_else(|e| {
            tracing::warn!("DHT lookup task failed: {}", e);
            Vec::new()
        })
    }

    /// Announces that we serve `info_hash` on `port`.
    pub async fn announce(&self, info_hash: InfoHash, port: u16) {
        let dht = self.dht.clone();
        let result = tokio::task::spawn_blocking(move || {
            let id = Id::from_bytes(info_hash.as_bytes()).map_err(|e| e.to_string())?;
            dht.announce_peer(id, Some(port)).map_err(|e| e.to_string())?;
            Ok::<_, String>(())
        })
        .await;

        match result {
            Ok(Ok(())) => tracing::debug!("Announced {} to the DHT", info_hash),
            Ok(Err(e)) => tracing::debug!("DHT announce for {} failed: {}", info_hash, e),
            Err(e) => tracing::warn!("DHT announce task failed: {}", e),
        }
    }
}

/// Periodically looks up peers for a torrent and announces ourselves.
pub(crate) async fn lookup_loop(state: Arc<TorrentState>, discovery: Discovery) {
    let mut shutdown = state.shutdown_signal();
    let interval = state.context.network.dht_lookup_interval;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let peers = discovery.find_peers(state.info_hash).await;
        tracing::debug!("DHT returned {} peers for {}", peers.len(), state.info_hash);
        state.add_peers(peers);
        discovery.announce(state.info_hash, state.context.listen_port).await;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bootstrap_nodes_have_ports() {
        for node in DEFAULT_BOOTSTRAP_NODES {
            let (host, port) = node.rsplit_once(':').unwrap();
            assert!(!host.is_empty());
            assert_eq!(port.parse::<u16>().unwrap(), 6881);
        }
    }
}
