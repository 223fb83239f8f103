//! Torrent information structures
//!
//! The immutable descriptor produced from a `.torrent` file.

use sha1::{Digest, Sha1};

use crate::error::{Result, TorrentError};

/// Length of a SHA-1 digest
pub const HASH_LEN: usize = 20;

/// Parsed single-file torrent descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    /// Tracker announce URLs, primary first, deduplicated
    pub trackers: Vec<String>,
    /// SHA1 hash of the canonical info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes (the last piece may be shorter)
    pub piece_length: u64,
    /// One 20-byte SHA1 hash per piece
    pub pieces: Vec<[u8; 20]>,
    /// Torrent name as given in the info dictionary
    pub name: String,
    /// Total payload size in bytes
    pub total_size: u64,
}

impl TorrentInfo {
    /// Build a descriptor, checking that the piece table matches the payload size
    pub fn new(
        name: String,
        trackers: Vec<String>,
        info_hash: [u8; 20],
        piece_length: u64,
        pieces: Vec<[u8; 20]>,
        total_size: u64,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(TorrentError::decode_error("piece length must be positive"));
        }

        let expected = Self::expected_piece_count(total_size, piece_length);
        if pieces.len() as u64 != expected {
            return Err(TorrentError::decode_error_with_source(
                "Piece hash count does not match payload size",
                format!("expected {} pieces, got {}", expected, pieces.len()),
            ));
        }

        Ok(Self {
            trackers,
            info_hash,
            piece_length,
            pieces,
            name,
            total_size,
        })
    }

    /// `ceil(total_size / piece_length)`
    pub fn expected_piece_count(total_size: u64, piece_length: u64) -> u64 {
        total_size.div_ceil(piece_length)
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Length of piece `index`; only the final piece may be shorter
    pub fn piece_len(&self, index: usize) -> Result<u64> {
        let count = self.piece_count();
        if index >= count {
            return Err(TorrentError::index_out_of_range(index as u64, count as u64));
        }
        if index == count - 1 {
            Ok(self.total_size - self.piece_length * (count as u64 - 1))
        } else {
            Ok(self.piece_length)
        }
    }

    /// Expected SHA1 hash of piece `index`
    pub fn piece_hash(&self, index: usize) -> Result<[u8; 20]> {
        self.pieces
            .get(index)
            .copied()
            .ok_or_else(|| TorrentError::index_out_of_range(index as u64, self.pieces.len() as u64))
    }

    /// Absolute byte range `[start, end)` of piece `index` within the payload
    pub fn piece_range(&self, index: usize) -> Result<(u64, u64)> {
        let len = self.piece_len(index)?;
        let start = index as u64 * self.piece_length;
        Ok((start, start + len))
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Name made safe to use as a single path component
    pub fn sanitized_name(&self) -> String {
        sanitize_file_name(&self.name)
    }

    /// Generate info hash from canonical info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Split the concatenated `pieces` blob into 20-byte hashes
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % HASH_LEN != 0 {
            return Err(TorrentError::decode_error_with_source(
                "Pieces field length must be a multiple of 20",
                format!("got {}", pieces_bytes.len()),
            ));
        }

        Ok(pieces_bytes
            .chunks_exact(HASH_LEN)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }
}

/// Replace path separators, control and reserved characters, and trim
/// leading dots so the result cannot escape its directory
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(total_size: u64, piece_length: u64) -> TorrentInfo {
        let count = TorrentInfo::expected_piece_count(total_size, piece_length) as usize;
        let pieces = (0..count).map(|i| [i as u8; 20]).collect();
        TorrentInfo::new(
            "sample.mp4".to_string(),
            vec!["http://tracker.example.com/announce".to_string()],
            [1u8; 20],
            piece_length,
            pieces,
            total_size,
        )
        .unwrap()
    }

    #[test]
    fn test_piece_count_invariant() {
        let info = sample(1500, 1024);
        assert_eq!(info.piece_count(), 2);
        assert_eq!(TorrentInfo::expected_piece_count(2048, 1024), 2);
        assert_eq!(TorrentInfo::expected_piece_count(0, 1024), 0);
    }

    #[test]
    fn test_new_rejects_mismatched_hash_count() {
        let result = TorrentInfo::new("x".into(), vec![], [0u8; 20], 1024, vec![[0u8; 20]], 4096);
        assert!(matches!(result, Err(TorrentError::DecodeError { .. })));
    }

    #[test]
    fn test_new_rejects_zero_piece_length() {
        assert!(TorrentInfo::new("x".into(), vec![], [0u8; 20], 0, vec![], 0).is_err());
    }

    #[test]
    fn test_piece_len_last_piece_shorter() {
        let info = sample(1500, 1024);
        assert_eq!(info.piece_len(0).unwrap(), 1024);
        assert_eq!(info.piece_len(1).unwrap(), 476);
        assert!(matches!(info.piece_len(2), Err(TorrentError::IndexOutOfRange { index: 2, limit: 2 })));
    }

    #[test]
    fn test_piece_len_exact_multiple() {
        let info = sample(3072, 1024);
        assert_eq!(info.piece_len(2).unwrap(), 1024);
    }

    #[test]
    fn test_piece_hash() {
        let info = sample(2048, 1024);
        assert_eq!(info.piece_hash(0).unwrap(), [0u8; 20]);
        assert_eq!(info.piece_hash(1).unwrap(), [1u8; 20]);
        assert!(info.piece_hash(2).is_err());
    }

    #[test]
    fn test_piece_range() {
        let info = sample(1500, 1024);
        assert_eq!(info.piece_range(0).unwrap(), (0, 1024));
        assert_eq!(info.piece_range(1).unwrap(), (1024, 1500));
        assert!(info.piece_range(2).is_err());
    }

    #[test]
    fn test_info_hash_hex() {
        let info = sample(1024, 1024);
        assert_eq!(info.info_hash_hex(), hex::encode([1u8; 20]));
    }

    #[test]
    fn test_generate_info_hash() {
        // SHA1("abc")
        let hash = TorrentInfo::generate_info_hash(b"abc");
        assert_eq!(hex::encode(hash), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_parse_piece_hashes_valid() {
        let hashes: Vec<u8> = (0..40).map(|i| i as u8).collect();
        let result = TorrentInfo::parse_piece_hashes(&hashes).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[1][0], 20);
    }

    #[test]
    fn test_parse_piece_hashes_invalid() {
        assert!(TorrentInfo::parse_piece_hashes(&[1u8; 21]).is_err());
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("Big Buck Bunny.mp4"), "Big Buck Bunny.mp4");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("a:b*c?"), "a_b_c_");
        assert_eq!(sanitize_file_name("..."), "download");
        assert_eq!(sanitize_file_name(""), "download");
    }
}
