//! Piece bitfield
//!
//! One bit per piece, most significant bit first within each byte, which
//! is also the layout of the wire `bitfield` message.

use crate::error::{Result, TorrentError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
    set_count: usize,
}

impl Bitfield {
    /// All-zero bitfield for `len` pieces
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u8; len.div_ceil(8)],
            len,
            set_count: 0,
        }
    }

    /// Decode a peer's wire bitfield.
    ///
    /// The byte count must match `len` exactly and spare trailing bits must be zero.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(TorrentError::peer_error(format!(
                "Bitfield has {} bytes, expected {}",
                bytes.len(),
                expected
            )));
        }

        let spare = expected * 8 - len;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if bytes[expected - 1] & mask != 0 {
                return Err(TorrentError::peer_error("Bitfield has spare bits set"));
            }
        }

        let set_count = bytes.iter().map(|b| b.count_ones() as usize).sum();
        Ok(Self {
            bits: bytes.to_vec(),
            len,
            set_count,
        })
    }

    /// Wire layout bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Number of pieces tracked
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn has(&self, index: usize) -> bool {
        index < self.len && self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Set bit `index`; setting an already set bit changes nothing
    pub fn set(&mut self, index: usize) -> Result<()> {
        if index >= self.len {
            return Err(TorrentError::index_out_of_range(index as u64, self.len as u64));
        }
        let mask = 0x80 >> (index % 8);
        if self.bits[index / 8] & mask == 0 {
            self.bits[index / 8] |= mask;
            self.set_count += 1;
        }
        Ok(())
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.set_count
    }

    pub fn is_complete(&self) -> bool {
        self.set_count == self.len
    }

    /// Lowest unset index
    pub fn next_missing_piece(&self) -> Option<usize> {
        self.missing_pieces().next()
    }

    /// Unset indices in ascending order
    pub fn missing_pieces(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| !self.has(i))
    }

    /// Percentage of pieces set, in `[0, 100]`; an empty bitfield counts as complete
    pub fn completion_percentage(&self) -> f64 {
        if self.len == 0 {
            return 100.0;
        }
        if self.is_complete() {
            return 100.0;
        }
        self.set_count as f64 / self.len as f64 * 100.0
    }
}
