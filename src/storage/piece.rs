//! Piece storage module
//!
//! Block-level assembly of a single piece in memory, ahead of hash
//! verification and the disk write.

use sha1::{Digest, Sha1};
use tracing::trace;

use crate::error::{Result, TorrentError};

/// Size of a block request
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// One outstanding block request within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// A piece being assembled from blocks
#[derive(Debug, Clone)]
pub struct PieceBuffer {
    index: u32,
    length: u32,
    expected_hash: [u8; 20],
    data: Vec<u8>,
    received: Vec<bool>,
    requested: Vec<bool>,
}

impl PieceBuffer {
    /// Create a buffer for piece `index` of `length` bytes
    pub fn new(index: u32, length: u32, expected_hash: [u8; 20]) -> Self {
        let block_count = length.div_ceil(BLOCK_SIZE) as usize;
        Self {
            index,
            length,
            expected_hash,
            data: vec![0u8; length as usize],
            received: vec![false; block_count],
            requested: vec![false; block_count],
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    /// Get the number of blocks
    pub fn block_count(&self) -> usize {
        self.received.len()
    }

    /// Length of block `block`; only the last block may be shorter
    pub fn block_len(&self, block: usize) -> u32 {
        let begin = block as u32 * BLOCK_SIZE;
        BLOCK_SIZE.min(self.length.saturating_sub(begin))
    }

    /// Store a block received from a peer.
    ///
    /// A block that was already received is left untouched and the call
    /// still succeeds.
    pub fn write_block(&mut self, begin: u32, data: &[u8]) -> Result<()> {
        if begin >= self.length {
            return Err(TorrentError::index_out_of_range(begin as u64, self.length as u64));
        }
        if begin % BLOCK_SIZE != 0 {
            return Err(TorrentError::peer_error(format!(
                "Block offset {} in piece {} is not block aligned",
                begin, self.index
            )));
        }

        let slot = (begin / BLOCK_SIZE) as usize;
        let expected = self.block_len(slot) as usize;
        if data.len() != expected {
            return Err(TorrentError::peer_error(format!(
                "Block {} of piece {} has {} bytes, expected {}",
                slot,
                self.index,
                data.len(),
                expected
            )));
        }

        if self.received[slot] {
            trace!("Duplicate block {} of piece {} ignored", slot, self.index);
            return Ok(());
        }

        let start = begin as usize;
        self.data[start..start + expected].copy_from_slice(data);
        self.received[slot] = true;
        self.requested[slot] = true;
        Ok(())
    }

    /// Whether every block has been received
    pub fn is_complete(&self) -> bool {
        self.received.iter().all(|&r| r)
    }

    /// Number of blocks received so far
    pub fn received_blocks(&self) -> usize {
        self.received.iter().filter(|&&r| r).count()
    }

    /// True only when complete and the SHA-1 matches
    pub fn verify(&self) -> bool {
        if !self.is_complete() {
            return false;
        }
        let digest: [u8; 20] = Sha1::digest(&self.data).into();
        digest == self.expected_hash
    }

    /// Claim the lowest block that is neither received nor requested
    pub fn next_block_request(&mut self) -> Option<BlockRequest> {
        let block = (0..self.block_count()).find(|&b| !self.requested[b] && !self.received[b])?;
        self.requested[block] = true;
        Some(BlockRequest {
            index: self.index,
            begin: block as u32 * BLOCK_SIZE,
            length: self.block_len(block),
        })
    }

    /// Whether some block is still free to be requested
    pub fn has_unrequested(&self) -> bool {
        self.requested.iter().zip(&self.received).any(|(&req, &rec)| !req && !rec)
    }

    /// Return a requested but not yet received block to the pool
    pub fn release_request(&mut self, begin: u32) {
        let block = (begin / BLOCK_SIZE) as usize;
        if block < self.block_count() && !self.received[block] {
            self.requested[block] = false;
        }
    }

    /// Drop everything received after a failed verification
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.received.fill(false);
        self.requested.fill(false);
    }

    /// Assembled piece bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
