//! Request routing for the proxy
//!
//! One handler covers every path: `/` answers with the status snapshot and
//! anything else is looked up in the torrent's current file list.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use tideway_core::{FileHandle, FileStream, TorrentHandle};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::content::{serve_file, text_plain};
use crate::status::TorrentStatus;

/// Shared by every request handled for one proxy instance.
#[derive(Clone)]
pub struct ProxyState {
    pub torrent: Arc<dyn TorrentHandle>,
    pub last_modified: DateTime<Utc>,
    pub chunk_size: usize,
}

/// Router owned by a single proxy; nothing is registered globally.
pub fn router(state: ProxyState) -> Router {
    Router::new()
        .fallback(handle_request)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn handle_request(
    State(state): State<ProxyState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let raw_path = uri.path();
    let path = urlencoding::decode(raw_path)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw_path.to_string());

    let response = if path == "/" {
        Json(TorrentStatus::snapshot(state.torrent.as_ref())).into_response()
    } else {
        let name = path.strip_prefix('/').unwrap_or(&path);
        match find_file(state.torrent.as_ref(), name) {
            Some(file) => {
                file.download();
                let stream = FileStream::new(state.torrent.new_reader(), file);
                serve_file(stream, &method, &headers, state.last_modified, state.chunk_size)
            }
            None => file_not_found(),
        }
    };

    info!("{} {}", response.status().as_u16(), path);
    response
}

/// Exact match against the display paths of the current file list.
fn find_file(torrent: &dyn TorrentHandle, name: &str) -> Option<Arc<dyn FileHandle>> {
    torrent.files().into_iter().find(|file| file.path() == name)
}

fn file_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, text_plain())],
        "File Not Found",
    )
        .into_response()
}
