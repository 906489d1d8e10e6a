//! Locator to [`TorrentSpec`] resolution
//!
//! Accepts `magnet:` links and `http(s)://` URLs pointing at a torrent
//! descriptor. Anything else is rejected before touching the network.

use reqwest::StatusCode;
use url::Url;

use super::parsing::{MagnetLink, Metainfo, bencode};
use super::{TorrentError, TorrentSpec};
use crate::config::NetworkConfig;

/// Reasons a locator could not be turned into a torrent spec.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("No torrent locator given")]
    EmptyLocator,

    #[error("Invalid torrent URL {locator}: {reason}")]
    UnparseableLocator { locator: String, reason: String },

    #[error("Unknown URL scheme: {scheme}")]
    UnsupportedScheme { scheme: String },

    #[error("Malformed magnet url: {source}")]
    MalformedMagnet {
        #[source]
        source: TorrentError,
    },

    #[error("Failed to fetch {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("Not a valid torrent file: {source}")]
    InvalidDescriptor {
        #[source]
        source: TorrentError,
    },
}

/// Resolves torrent locators, downloading descriptors over HTTP when needed.
#[derive(Debug, Clone)]
pub struct SpecResolver {
    client: reqwest::Client,
    max_descriptor_bytes: usize,
}

impl SpecResolver {
    /// Creates a resolver using the network timeouts and limits in `config`.
    pub fn new(config: &NetworkConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.descriptor_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });

        Self {
            client,
            max_descriptor_bytes: config.max_descriptor_bytes,
        }
    }

    /// Resolves `locator` into a spec the engine can join.
    ///
    /// Magnet links resolve without network access. HTTP(S) locators are
    /// fetched once; the body must be a complete bencoded descriptor.
    ///
    /// # Errors
    /// - `ResolveError::EmptyLocator` - Empty input
    /// - `ResolveError::UnparseableLocator` - Not an absolute URL
    /// - `ResolveError::UnsupportedScheme` - Scheme other than magnet, http or https
    /// - `ResolveError::MalformedMagnet` - Magnet link without a usable info-hash
    /// - `ResolveError::FetchFailed` - Transport error or non-200 response
    /// - `ResolveError::InvalidDescriptor` - Body is not a valid descriptor
    pub async fn resolve(&self, locator: &str) -> Result<TorrentSpec, ResolveError> {
        if locator.is_empty() {
            return Err(ResolveError::EmptyLocator);
        }

        let url = Url::parse(locator).map_err(|e| ResolveError::UnparseableLocator {
            locator: locator.to_string(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "magnet" => {
                let magnet = MagnetLink::from_url(&url)
                    .map_err(|source| ResolveError::MalformedMagnet { source })?;
                tracing::debug!("Resolved magnet link for {}", magnet.info_hash);
                Ok(magnet.into())
            }
            "http" | "https" => self.fetch_descriptor(url).await,
            other => Err(ResolveError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }

    async fn fetch_descriptor(&self, url: Url) -> Result<TorrentSpec, ResolveError> {
        tracing::debug!("Fetching torrent descriptor from {}", url);
        let fetch_failed = |reason: String| ResolveError::FetchFailed {
            url: url.to_string(),
            reason,
        };

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| fetch_failed(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(fetch_failed(status.to_string()));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| fetch_failed(e.to_string()))?
        {
            if body.is_empty() && !chunk.is_empty() && !bencode::looks_like_dictionary(&chunk) {
                return Err(invalid_descriptor("body is not a bencoded dictionary"));
            }
            if body.len() + chunk.len() > self.max_descriptor_bytes {
                return Err(invalid_descriptor(&format!(
                    "body exceeds {} bytes",
                    self.max_descriptor_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        let metainfo =
            Metainfo::from_bytes(&body).map_err(|source| ResolveError::InvalidDescriptor { source })?;
        tracing::info!(
            "Loaded descriptor for '{}' ({} files, {} bytes) from {}",
            metainfo.info.name,
            metainfo.info.files.len(),
            metainfo.info.total_length,
            url
        );

        Ok(metainfo.into())
    }
}

fn invalid_descriptor(reason: &str) -> ResolveError {
    ResolveError::InvalidDescriptor {
        source: TorrentError::InvalidTorrentFile {
            reason: reason.to_string(),
        },
    }
}
