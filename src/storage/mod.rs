//! Storage module
//!
//! Piece assembly, the download bitfield and the output file.

pub mod bitfield;
pub mod file;
pub mod piece;

pub use bitfield::Bitfield;
pub use file::OutputFile;
pub use piece::{BlockRequest, PieceBuffer, BLOCK_SIZE};
