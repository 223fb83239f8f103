//! Piece selection
//!
//! Decides which piece a peer should start on next. Pieces already being
//! assembled are never handed out here; a session helps with those before
//! asking for a fresh piece.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::storage::Bitfield;

/// Piece selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PieceSelectionStrategy {
    /// Lowest missing index first, so playback can start early
    #[default]
    Sequential,
    /// Fewest holders among connected peers first
    RarestFirst,
}

/// Chooses the next piece for a peer
#[derive(Debug, Clone, Copy)]
pub struct PiecePicker {
    strategy: PieceSelectionStrategy,
}

impl PiecePicker {
    pub fn new(strategy: PieceSelectionStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> PieceSelectionStrategy {
        self.strategy
    }

    /// Pick a piece we are missing, that `peer` advertises and that `in_progress` does not claim.
    ///
    /// `peer` is `None` when the peer never advertised anything; such a
    /// peer is offered any piece. `availability` holds, per piece, how many
    /// connected peers advertise it and is only consulted for rarest-first.
    pub fn select(
        &self,
        have: &Bitfield,
        peer: Option<&Bitfield>,
        in_progress: impl Fn(usize) -> bool,
        availability: &[u32],
    ) -> Option<usize> {
        let mut candidates = have
            .missing_pieces()
            .filter(|&i| !in_progress(i))
            .filter(|&i| peer.is_none_or(|bf| bf.has(i)));

        match self.strategy {
            PieceSelectionStrategy::Sequential => {
                let picked = candidates.next();
                trace!("Sequential pick: {:?}", picked);
                picked
            }
            PieceSelectionStrategy::RarestFirst => {
                let candidates: Vec<usize> = candidates.collect();
                let rarest = candidates
                    .iter()
                    .copied()
                    .filter(|&i| availability.get(i).copied().unwrap_or(0) > 0)
                    .min_by_key(|&i| (availability[i], i));
                match rarest {
                    Some(index) => {
                        trace!("Rarest pick: {} (held by {})", index, availability[index]);
                        Some(index)
                    }
                    None => {
                        let fallback = candidates.first().copied();
                        if fallback.is_some() {
                            debug!("No availability data for remaining pieces, selecting sequentially");
                        }
                        fallback
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitfield(len: usize, set: &[usize]) -> Bitfield {
        let mut bf = Bitfield::new(len);
        for &i in set {
            bf.set(i).unwrap();
        }
        bf
    }

    #[test]
    fn test_sequential_lowest_missing() {
        let picker = PiecePicker::new(PieceSelectionStrategy::Sequential);
        let have = bitfield(5, &[0, 2]);
        assert_eq!(picker.select(&have, None, |_| false, &[]), Some(1));
    }

    #[test]
    fn test_sequential_skips_in_progress_and_unadvertised() {
        let picker = PiecePicker::new(PieceSelectionStrategy::Sequential);
        let have = bitfield(5, &[0]);
        let peer = bitfield(5, &[1, 2, 4]);
        assert_eq!(picker.select(&have, Some(&peer), |i| i == 1, &[]), Some(2));
        assert_eq!(picker.select(&have, Some(&peer), |i| i <= 2, &[]), Some(4));
    }

    #[test]
    fn test_nothing_left() {
        let picker = PiecePicker::new(PieceSelectionStrategy::Sequential);
        let have = bitfield(3, &[0, 1, 2]);
        assert_eq!(picker.select(&have, None, |_| false, &[]), None);
    }

    #[test]
    fn test_rarest_first_ranking() {
        let picker = PiecePicker::new(PieceSelectionStrategy::RarestFirst);
        let have = bitfield(4, &[]);
        assert_eq!(picker.select(&have, None, |_| false, &[3, 1, 2, 1]), Some(1));
        assert_eq!(picker.select(&have, None, |i| i == 1, &[3, 1, 2, 1]), Some(3));
    }

    #[test]
    fn test_rarest_first_ignores_unheld_pieces() {
        let picker = PiecePicker::new(PieceSelectionStrategy::RarestFirst);
        let have = bitfield(3, &[]);
        assert_eq!(picker.select(&have, None, |_| false, &[0, 2, 1]), Some(2));
    }

    #[test]
    fn test_rarest_first_falls_back_to_sequential() {
        let picker = PiecePicker::new(PieceSelectionStrategy::RarestFirst);
        let have = bitfield(3, &[0]);
        assert_eq!(picker.select(&have, None, |_| false, &[0, 0, 0]), Some(1));
        assert_eq!(picker.select(&have, None, |_| false, &[]), Some(1));
    }

    #[test]
    fn test_strategy_serde_names() {
        assert_eq!(
            serde_json::to_string(&PieceSelectionStrategy::RarestFirst).unwrap(),
            "\"rarest_first\""
        );
        let parsed: PieceSelectionStrategy = serde_json::from_str("\"sequential\"").unwrap();
        assert_eq!(parsed, PieceSelectionStrategy::Sequential);
    }
}
