//! Per-file seekable streams over a torrent's whole-torrent reader

mod file_stream;

pub use file_stream::{FileStream, StreamError};
