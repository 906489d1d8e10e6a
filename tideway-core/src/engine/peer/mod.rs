//! Peer connections: outgoing connection management and incoming handoff

pub(crate) mod connection;
pub(crate) mod session;
pub(crate) mod wire;

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

pub(crate) use wire::{Handshake, PeerId};

use super::torrent::TorrentState;
use crate::torrent::TorrentError;

/// How long before an address we already tried is dialled again.
const RETRY_DELAY: Duration = Duration::from_secs(60);

/// Counts against the torrent's connection limit while alive.
struct PeerSlot {
    state: Arc<TorrentState>,
}

impl PeerSlot {
    fn acquire(state: &Arc<TorrentState>) -> Option<Self> {
        let limit = state.context.network.max_peer_connections;
        state
            .active_peers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < limit).then_some(active + 1)
            })
            .ok()?;
        Some(Self {
            state: state.clone(),
        })
    }
}

impl Drop for PeerSlot {
    fn drop(&mut self) {
        self.state.active_peers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Dials peer addresses queued by trackers and the DHT, within the connection limit.
pub(crate) async fn manage_peers(state: Arc<TorrentState>, mut queued: mpsc::UnboundedReceiver<SocketAddr>) {
    let mut shutdown = state.shutdown_signal();
    let connected: Arc<Mutex<HashSet<SocketAddr>>> = Arc::default();
    let mut backlog = VecDeque::new();
    let mut attempted: HashMap<SocketAddr, Instant> = HashMap::new();
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            address = queued.recv() => match address {
                Some(address) => {
                    if !backlog.contains(&address) {
                        backlog.push_back(address);
                    }
                }
                None => break,
            },
            _ = tick.tick() => {}
            _ = shutdown.changed() => break,
        }

        let now = Instant::now();
        attempted.retain(|_, at| now.duration_since(*at) < RETRY_DELAY);
        while let Some(&address) = backlog.front() {
            if attempted.contains_key(&address) || connected.lock().contains(&address) {
                backlog.pop_front();
                continue;
            }
            let Some(slot) = PeerSlot::acquire(&state) else {
                break;
            };
            backlog.pop_front();
            attempted.insert(address, now);

            let state = state.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                connected.lock().insert(address);
                if let Err(e) = connect_peer(&state, address).await {
                    tracing::debug!("Connection to {} failed: {}", address, e);
                }
                connected.lock().remove(&address);
                drop(slot);
            });
        }
    }

    tracing::debug!("Peer manager for {} stopped", state.info_hash);
}

async fn connect_peer(state: &Arc<TorrentState>, address: SocketAddr) -> Result<(), TorrentError> {
    let ours = Handshake::new(state.info_hash, state.context.peer_id);
    let (stream, theirs) =
        connection::connect(address, &ours, state.context.network.peer_connect_timeout).await?;
    if theirs.peer_id == state.context.peer_id {
        return Err(TorrentError::PeerConnectionError {
            reason: "connected to ourselves".to_string(),
        });
    }

    session::run(state.clone(), stream, theirs, address).await;
    Ok(())
}

/// Takes over an incoming connection whose handshake named this torrent.
pub(crate) async fn accept_incoming(
    state: Arc<TorrentState>,
    mut stream: TcpStream,
    theirs: Handshake,
    address: SocketAddr,
) {
    if state.is_closed() || theirs.peer_id == state.context.peer_id {
        return;
    }
    let Some(slot) = PeerSlot::acquire(&state) else {
        tracing::debug!("Refusing {}: connection limit reached", address);
        return;
    };

    let ours = Handshake::new(state.info_hash, state.context.peer_id);
    if let Err(e) = stream.write_all(&ours.encode()).await {
        tracing::debug!("Handshake reply to {} failed: {}", address, e);
        return;
    }

    session::run(state, stream, theirs, address).await;
    drop(slot);
}
