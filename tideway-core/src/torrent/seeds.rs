//! DHT bootstrap node resolution

use std::fmt;
use std::net::SocketAddr;

use crate::engine::discovery::DEFAULT_BOOTSTRAP_NODES;

/// Resolved UDP endpoint of a DHT bootstrap node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeedAddress(SocketAddr);

impl SeedAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for SeedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Bootstrap node list that could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("Error resolving DHT node {entry}: {reason}")]
    InvalidSeedAddress { entry: String, reason: String },
}

/// Resolves user-supplied `host:port` entries into bootstrap addresses.
///
/// An empty list yields the well-known public bootstrap nodes instead. The
/// first entry that fails to resolve aborts the whole call; no partial list
/// is ever returned for user input.
///
/// # Errors
/// - `SeedError::InvalidSeedAddress` - Entry lacks a port, has an out-of-range port or an unresolvable host
pub async fn resolve_seed_addresses<S: AsRef<str>>(
    entries: &[S],
) -> Result<Vec<SeedAddress>, SeedError> {
    if entries.is_empty() {
        return Ok(default_seed_addresses().await);
    }

    let mut seeds = Vec::with_capacity(entries.len());
    for entry in entries {
        let seed = resolve_entry(entry.as_ref()).await?;
        if !seeds.contains(&seed) {
            seeds.push(seed);
        }
    }
    Ok(seeds)
}

/// Resolves the built-in bootstrap nodes, skipping any that do not resolve.
///
/// May return an empty list when there is no name resolution, in which case
/// peer discovery simply stays off.
pub async fn default_seed_addresses() -> Vec<SeedAddress> {
    let mut seeds = Vec::new();
    for node in DEFAULT_BOOTSTRAP_NODES {
        match resolve_entry(node).await {
            Ok(seed) if !seeds.contains(&seed) => seeds.push(seed),
            Ok(_) => {}
            Err(e) => tracing::debug!("Skipping default bootstrap node: {}", e),
        }
    }
    seeds
}

async fn resolve_entry(entry: &str) -> Result<SeedAddress, SeedError> {
    let invalid = |reason: String| SeedError::InvalidSeedAddress {
        entry: entry.to_string(),
        reason,
    };

    let mut addrs = tokio::net::lookup_host(entry)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    addrs
        .next()
        .map(SeedAddress::new)
        .ok_or_else(|| invalid("host resolved to no addresses".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_addresses_resolve_in_order() {
        let seeds = resolve_seed_addresses(&["127.0.0.1:6881", "[::1]:7000"])
            .await
            .unwrap();

        let rendered: Vec<String> = seeds.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["127.0.0.1:6881", "[::1]:7000"]);
    }

    #[tokio::test]
    async fn test_duplicate_entries_collapse() {
        let seeds = resolve_seed_addresses(&["127.0.0.1:1", "127.0.0.1:1"])
            .await
            .unwrap();
        assert_eq!(seeds.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_port_is_rejected() {
        let result = resolve_seed_addresses(&["192.0.2.1"]).await;
        match result {
            Err(SeedError::InvalidSeedAddress { entry, .. }) => assert_eq!(entry, "192.0.2.1"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_out_of_range_port_is_rejected() {
        assert!(resolve_seed_addresses(&["192.0.2.1:99999"]).await.is_err());
    }

    #[tokio::test]
    async fn test_one_bad_entry_fails_the_whole_list() {
        let result = resolve_seed_addresses(&["127.0.0.1:6881", "this_is_invalid"]).await;
        assert!(result.is_err());
    }
}
