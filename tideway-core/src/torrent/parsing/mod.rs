//! Torrent descriptor and magnet link decoding.
//!
//! Descriptors are decoded with `serde_bencode`; the info-hash is taken over
//! the raw byte span of the `info` value located by [`bencode`].

pub mod bencode;
pub mod magnet;
pub mod metainfo;

pub use magnet::MagnetLink;
pub use metainfo::Metainfo;
