//! Random-access content responder
//!
//! Serves a [`FileStream`] with range, conditional and `HEAD` semantics.
//! The stream is driven from a blocking task because reads park the
//! calling thread until the swarm delivers the pieces.

use std::io::{self, Seek, SeekFrom};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tideway_core::{FileStream, StreamError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::range::{RangeRequest, parse_range_header};

/// Body chunks buffered ahead of the client.
const BODY_BUFFER_CHUNKS: usize = 4;

/// Builds the response for `stream` given the request's method and headers.
///
/// `last_modified` drives `Last-Modified` and every date precondition.
/// Byte ranges are served from a fresh seek; whole-file responses read
/// from the stream's initial position, which the stream itself moves to
/// the file start.
pub fn serve_file(
    mut stream: FileStream,
    method: &Method,
    headers: &HeaderMap,
    last_modified: DateTime<Utc>,
    chunk_size: usize,
) -> Response {
    let size = stream.length();
    let modified = last_modified.timestamp();

    if let Some(since) = header_date(headers, header::IF_UNMODIFIED_SINCE)
        && modified > since.timestamp()
    {
        return empty(StatusCode::PRECONDITION_FAILED, last_modified);
    }

    let is_read = method == Method::GET || method == Method::HEAD;
    if is_read
        && let Some(since) = header_date(headers, header::IF_MODIFIED_SINCE)
        && modified <= since.timestamp()
    {
        return empty(StatusCode::NOT_MODIFIED, last_modified);
    }

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) if is_read && range_still_valid(headers, modified) => {
            parse_range_header(value, size)
        }
        _ => RangeRequest::Full,
    };

    let content_type = mime_guess::from_path(stream.path()).first_or_octet_stream();
    let builder = Response::builder()
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::LAST_MODIFIED, http_date(last_modified))
        .header(header::CONTENT_TYPE, content_type.as_ref());

    let (builder, start, length) = match range {
        RangeRequest::Full => (builder.status(StatusCode::OK), 0, size),
        RangeRequest::Partial { start, end } => (
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}")),
            start,
            end - start + 1,
        ),
        RangeRequest::Unsatisfiable => {
            let response = builder
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{size}"))
                .body(Body::empty());
            return finish(response);
        }
    };

    let builder = builder.header(header::CONTENT_LENGTH, length);
    if method == Method::HEAD || length == 0 {
        return finish(builder.body(Body::empty()));
    }

    if start > 0
        && let Err(e) = stream.seek(SeekFrom::Start(start))
    {
        debug!("Seek to {} failed: {}", start, e);
        return empty(StatusCode::INTERNAL_SERVER_ERROR, last_modified);
    }

    finish(builder.body(body_from_stream(stream, length, chunk_size)))
}

/// Streams `length` bytes from the stream's current position.
///
/// A read failure ends the body early; the client sees a short response.
fn body_from_stream(mut stream: FileStream, length: u64, chunk_size: usize) -> Body {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(BODY_BUFFER_CHUNKS);

    tokio::task::spawn_blocking(move || {
        let mut remaining = length;
        while remaining > 0 {
            let mut buf = vec![0u8; (chunk_size as u64).min(remaining) as usize];
            match stream.read_chunk(&mut buf) {
                Ok(read) => {
                    buf.truncate(read);
                    remaining -= read as u64;
                    if tx.blocking_send(Ok(Bytes::from(buf))).is_err() {
                        debug!("Client went away while streaming {}", stream.path());
                        return;
                    }
                }
                Err(StreamError::EndOfFile) => return,
                Err(StreamError::Io(e)) => {
                    debug!("Read of {} failed: {}", stream.path(), e);
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            }
        }
    });

    let chunks = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    Body::from_stream(chunks)
}

/// `If-Range` keeps the range only when its date matches exactly.
/// Entity tags never match since none are issued.
fn range_still_valid(headers: &HeaderMap, modified: i64) -> bool {
    match headers.get(header::IF_RANGE) {
        None => true,
        Some(_) => header_date(headers, header::IF_RANGE)
            .is_some_and(|date| date.timestamp() == modified),
    }
}

fn header_date(headers: &HeaderMap, name: header::HeaderName) -> Option<DateTime<Utc>> {
    let value = headers.get(name)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn empty(status: StatusCode, last_modified: DateTime<Utc>) -> Response {
    finish(
        Response::builder()
            .status(status)
            .header(header::LAST_MODIFIED, http_date(last_modified))
            .body(Body::empty()),
    )
}

fn finish(response: Result<Response, axum::http::Error>) -> Response {
    response.unwrap_or_else(|e| {
        debug!("Failed to build response: {}", e);
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    })
}

/// Header value for `Content-Type: text/plain`.
pub(crate) fn text_plain() -> HeaderValue {
    HeaderValue::from_static("text/plain; charset=utf-8")
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use chrono::TimeZone;
    use tideway_core::TorrentHandle;
    use tideway_core::fixtures::{MemoryTorrent, TorrentBuilder, TorrentFixture};

    use super::*;

    fn modified() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn fixture() -> TorrentFixture {
        TorrentBuilder::new("site")
            .file("index.html", 50)
            .file("video.mp4", 300)
            .piece_length(64)
            .build()
    }

    fn stream_for(torrent: &MemoryTorrent, index: usize) -> FileStream {
        FileStream::new(torrent.new_reader(), torrent.files()[index].clone())
    }

    async fn serve(method: Method, headers: HeaderMap) -> (Response, TorrentFixture) {
        let fixture = fixture();
        let torrent = MemoryTorrent::new(&fixture);
        torrent.complete_all();
        let response = serve_file(stream_for(&torrent, 1), &method, &headers, modified(), 32);
        (response, fixture)
    }

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    async fn body(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn test_full_response() {
        let (response, fixture) = serve(Method::GET, HeaderMap::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        let h = response.headers();
        assert_eq!(h[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(h[header::CONTENT_LENGTH], "300");
        assert_eq!(h[header::ACCEPT_RANGES], "bytes");
        assert_eq!(h[header::LAST_MODIFIED], "Fri, 01 Mar 2024 12:00:00 GMT");
        assert_eq!(body(response).await, fixture.file_content(1));
    }

    #[tokio::test]
    async fn test_range_response() {
        let (response, fixture) =
            serve(Method::GET, headers(&[(header::RANGE, "bytes=100-149")])).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 100-149/300");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "50");
        assert_eq!(body(response).await, &fixture.file_content(1)[100..150]);
    }

    #[tokio::test]
    async fn test_suffix_range() {
        let (response, fixture) = serve(Method::GET, headers(&[(header::RANGE, "bytes=-10")])).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(body(response).await, &fixture.file_content(1)[290..]);
    }

    #[tokio::test]
    async fn test_unsatisfiable_range() {
        let (response, _) = serve(Method::GET, headers(&[(header::RANGE, "bytes=500-")])).await;

        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */300");
    }

    #[tokio::test]
    async fn test_head_has_headers_but_no_body() {
        let (response, _) = serve(Method::HEAD, HeaderMap::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "300");
        assert!(body(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_not_modified() {
        let (response, _) = serve(
            Method::GET,
            headers(&[(header::IF_MODIFIED_SINCE, "Fri, 01 Mar 2024 12:00:00 GMT")]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        let (response, _) = serve(
            Method::GET,
            headers(&[(header::IF_MODIFIED_SINCE, "Thu, 29 Feb 2024 12:00:00 GMT")]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_precondition_failed() {
        let (response, _) = serve(
            Method::GET,
            headers(&[(header::IF_UNMODIFIED_SINCE, "Thu, 29 Feb 2024 12:00:00 GMT")]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn test_if_range_with_stale_date_serves_everything() {
        let (response, _) = serve(
            Method::GET,
            headers(&[
                (header::RANGE, "bytes=0-9"),
                (header::IF_RANGE, "Thu, 29 Feb 2024 12:00:00 GMT"),
            ]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let (response, _) = serve(
            Method::GET,
            headers(&[
                (header::RANGE, "bytes=0-9"),
                (header::IF_RANGE, "Fri, 01 Mar 2024 12:00:00 GMT"),
            ]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    }

    #[tokio::test]
    async fn test_whole_file_uses_implicit_seek() {
        let fixture = fixture();
        let torrent = MemoryTorrent::new(&fixture);
        torrent.complete_all();

        // Small reads force several chunks across piece boundaries
        let response = serve_file(stream_for(&torrent, 1), &Method::GET, &HeaderMap::new(), modified(), 7);
        assert_eq!(body(response).await, fixture.file_content(1));
        assert!(!torrent.prioritized().is_empty());
    }

    #[test]
    fn test_http_date_format() {
        assert_eq!(http_date(modified()), "Fri, 01 Mar 2024 12:00:00 GMT");
    }
}
