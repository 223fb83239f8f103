//! Torrent metadata module
//!
//! Parses .torrent files and magnet links into descriptors the rest of the
//! crate works from.

pub mod info;
pub mod magnet;
pub mod parser;

pub use info::{sanitize_file_name, TorrentInfo};
pub use magnet::{MagnetInfo, MagnetParser};
pub use parser::TorrentParser;

use crate::error::Result;

/// Either a full descriptor or the partial one a magnet link yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentSource {
    Metainfo(TorrentInfo),
    Magnet(MagnetInfo),
}

impl TorrentSource {
    /// Parse raw `.torrent` bytes
    pub fn from_torrent_file(data: &[u8]) -> Result<Self> {
        TorrentParser::parse_bytes(data).map(TorrentSource::Metainfo)
    }

    /// Parse a magnet URI
    pub fn from_magnet_link(uri: &str) -> Result<Self> {
        MagnetParser::parse(uri).map(TorrentSource::Magnet)
    }

    pub fn info_hash(&self) -> [u8; 20] {
        match self {
            TorrentSource::Metainfo(info) => info.info_hash,
            TorrentSource::Magnet(magnet) => magnet.info_hash,
        }
    }

    pub fn trackers(&self) -> &[String] {
        match self {
            TorrentSource::Metainfo(info) => &info.trackers,
            TorrentSource::Magnet(magnet) => &magnet.trackers,
        }
    }

    /// Best-effort name; magnet links without `dn` fall back to the hex hash
    pub fn display_name(&self) -> String {
        match self {
            TorrentSource::Metainfo(info) => info.name.clone(),
            TorrentSource::Magnet(magnet) => magnet.display_name.clone().unwrap_or_else(|| magnet.info_hash_hex()),
        }
    }

    /// The full descriptor, if piece metadata is known
    pub fn metainfo(&self) -> Option<&TorrentInfo> {
        match self {
            TorrentSource::Metainfo(info) => Some(info),
            TorrentSource::Magnet(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::BencodeValue;

    #[test]
    fn test_magnet_source() {
        let source =
            TorrentSource::from_magnet_link("magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&tr=http://t/a")
                .unwrap();
        assert_eq!(hex::encode(source.info_hash()), "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c");
        assert_eq!(source.trackers(), ["http://t/a".to_string()]);
        assert_eq!(source.display_name(), "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c");
        assert!(source.metainfo().is_none());
    }

    #[test]
    fn test_metainfo_source() {
        let data = BencodeValue::dict()
            .with("announce", "http://t/a".into())
            .with(
                "info",
                BencodeValue::dict()
                    .with("length", 5i64.into())
                    .with("name", "a.mp4".into())
                    .with("piece length", 16384i64.into())
                    .with("pieces", vec![0u8; 20].into()),
            )
            .encode();
        let source = TorrentSource::from_torrent_file(&data).unwrap();
        assert_eq!(source.display_name(), "a.mp4");
        assert_eq!(source.metainfo().map(|i| i.total_size), Some(5));
    }
}
