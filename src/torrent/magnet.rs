//! Magnet link parser
//!
//! Handles parsing of magnet: URIs into an info hash, a best-effort name and
//! a tracker list. Magnet links carry no piece table or payload size.

use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, TorrentError};

/// Parsed magnet link information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetInfo {
    /// SHA1 info hash from the `xt` parameter
    pub info_hash: [u8; 20],
    /// Display name (`dn` parameter)
    pub display_name: Option<String>,
    /// Tracker URLs (`tr` parameters), in order, deduplicated
    pub trackers: Vec<String>,
    /// Exact length in bytes (`xl` parameter), if advertised
    pub exact_length: Option<u64>,
}

impl MagnetInfo {
    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

/// Parser for magnet links
pub struct MagnetParser;

impl MagnetParser {
    /// Parse a magnet link string
    ///
    /// # Example
    /// ```ignore
    /// let magnet = "magnet:?xt=urn:btih:dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c&dn=Big+Buck+Bunny";
    /// let info = MagnetParser::parse(magnet)?;
    /// ```
    pub fn parse(magnet_uri: &str) -> Result<MagnetInfo> {
        info!("Parsing magnet link");

        let url = Url::parse(magnet_uri.trim()).map_err(|e| {
            warn!("Invalid magnet URL format: {}", e);
            TorrentError::decode_error_with_source("Invalid magnet URL format", e.to_string())
        })?;

        if url.scheme() != "magnet" {
            warn!("URL is not a magnet link: scheme is '{}'", url.scheme());
            return Err(TorrentError::decode_error_with_source(
                "URL is not a magnet link",
                format!("scheme '{}'", url.scheme()),
            ));
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers: Vec<String> = Vec::new();
        let mut exact_length = None;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = Self::extract_info_hash(&value)? {
                        debug!("Extracted info hash: {}", hex::encode(hash));
                        info_hash = Some(hash);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => {
                    if !trackers.iter().any(|t| t == value.as_ref()) {
                        trackers.push(value.into_owned());
                    }
                }
                "xl" => match value.parse::<u64>() {
                    Ok(size) => exact_length = Some(size),
                    Err(_) => warn!("Invalid xl parameter value: {}", value),
                },
                other => debug!("Ignoring magnet parameter: {}", other),
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            warn!("Magnet link missing required info hash (xt parameter)");
            TorrentError::decode_error("Magnet link must contain an info hash (xt=urn:btih:<hash>)")
        })?;

        info!(
            "Parsed magnet link: info_hash={}, name={}, trackers={}",
            hex::encode(info_hash),
            display_name.as_deref().unwrap_or("(none)"),
            trackers.len()
        );

        Ok(MagnetInfo {
            info_hash,
            display_name,
            trackers,
            exact_length,
        })
    }

    /// Extract the info hash from an `xt` value.
    ///
    /// Returns `Ok(None)` for non-BitTorrent URNs so another `xt` can still
    /// supply the hash.
    pub fn extract_info_hash(xt: &str) -> Result<Option<[u8; 20]>> {
        let hash_str = match xt.strip_prefix("urn:btih:") {
            Some(h) => h,
            None => {
                debug!("xt parameter is not a BitTorrent info hash: {}", xt);
                return Ok(None);
            }
        };

        let decoded = match hash_str.len() {
            40 => hex::decode(hash_str).ok().and_then(|bytes| <[u8; 20]>::try_from(bytes).ok()),
            32 => base32_decode(hash_str),
            len => {
                return Err(TorrentError::decode_error_with_source(
                    "Info hash has invalid length",
                    format!("{} (expected 40 for hex or 32 for base32)", len),
                ))
            }
        };

        decoded.map(Some).ok_or_else(|| {
            TorrentError::decode_error_with_source("Info hash is not valid hex or base32", hash_str.to_string())
        })
    }

    /// Check if a string looks like a magnet link
    pub fn is_magnet_link(input: &str) -> bool {
        input.trim().starts_with("magnet:?")
    }
}

/// RFC 4648 base32 without padding, exactly 20 output bytes
fn base32_decode(input: &str) -> Option<[u8; 20]> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut bits = 0u64;
    let mut bit_count = 0u32;
    let mut output = Vec::with_capacity(20);

    for c in input.bytes() {
        let val = ALPHABET.iter().position(|&x| x == c.to_ascii_uppercase())? as u64;
        bits = (bits << 5) | val;
        bit_count += 5;

        while bit_count >= 8 {
            bit_count -= 8;
            output.push((bits >> bit_count) as u8);
            bits &= (1 << bit_count) - 1;
        }
    }

    <[u8; 20]>::try_from(output).ok()
}
