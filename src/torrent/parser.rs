//! Torrent file parser
//!
//! Handles parsing of .torrent files and extracting metadata.

use std::path::Path;

use tracing::{debug, error, info, trace, warn};

use crate::bencode::{self, BencodeValue};
use crate::error::{Result, TorrentError};
use crate::torrent::info::TorrentInfo;

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = bencode::decode(data).map_err(|e| e.with_context("while parsing torrent file"))?;
        Self::convert_to_torrent_info(&root)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    fn convert_to_torrent_info(root: &BencodeValue) -> Result<TorrentInfo> {
        if root.as_dict().is_none() {
            return Err(TorrentError::decode_error("Torrent root must be a dictionary"));
        }

        let trackers = Self::collect_trackers(root);
        if trackers.is_empty() {
            warn!("Torrent lists no trackers");
        }

        let info_dict = root
            .get_dict(b"info")
            .ok_or_else(|| TorrentError::decode_error("Missing info dictionary"))?;

        if info_dict.get(b"files").is_some() {
            return Err(TorrentError::decode_error("Multi-file torrents are not supported"));
        }

        let name = info_dict
            .get_bytes(b"name")
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or_else(|| TorrentError::decode_error("Missing name field"))?;

        let piece_length = info_dict
            .get_int(b"piece length")
            .ok_or_else(|| TorrentError::decode_error("Missing piece length"))?;
        if piece_length <= 0 {
            return Err(TorrentError::decode_error_with_source(
                "Piece length must be positive",
                piece_length.to_string(),
            ));
        }

        let length = info_dict
            .get_int(b"length")
            .ok_or_else(|| TorrentError::decode_error("Missing length field"))?;
        if length < 0 {
            return Err(TorrentError::decode_error_with_source("Length must not be negative", length.to_string()));
        }

        let pieces_bytes = info_dict
            .get_bytes(b"pieces")
            .ok_or_else(|| TorrentError::decode_error("Missing pieces field"))?;
        let pieces = TorrentInfo::parse_piece_hashes(pieces_bytes)?;

        let info_hash = TorrentInfo::generate_info_hash(&info_dict.encode());

        let torrent = TorrentInfo::new(name, trackers, info_hash, piece_length as u64, pieces, length as u64)?;

        info!(
            "Parsed torrent '{}': {} bytes, {} pieces of {} bytes, info_hash={}",
            torrent.name,
            torrent.total_size,
            torrent.piece_count(),
            torrent.piece_length,
            torrent.info_hash_hex()
        );
        Ok(torrent)
    }

    /// `announce` first, then every `announce-list` tier flattened, without duplicates
    fn collect_trackers(root: &BencodeValue) -> Vec<String> {
        let mut trackers: Vec<String> = Vec::new();
        let mut push = |bytes: &[u8]| {
            let url = String::from_utf8_lossy(bytes).into_owned();
            if !url.is_empty() && !trackers.contains(&url) {
                trackers.push(url);
            }
        };

        if let Some(announce) = root.get_bytes(b"announce") {
            push(announce);
        }

        for tier in root.get_list(b"announce-list").unwrap_or_default() {
            for url in tier.as_list().unwrap_or_default() {
                if let Some(bytes) = url.as_bytes() {
                    push(bytes);
                }
            }
        }

        trackers
    }
}
