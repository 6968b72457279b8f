use std::collections::HashMap;

use crate::bag::PieceMask;
use crate::peer::PeerId;

/// Owns piece selection and the in-flight claim map. Lives inside the
/// single scheduler actor of a torrent, which is what keeps any piece
/// from ever having two fetches in flight.
#[derive(Default)]
pub(crate) struct PiecePicker {
    in_flight: HashMap<u32, PeerId>,
}

impl PiecePicker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claims the lowest piece index that is neither verified nor already
    /// claimed, assigning it to `peer`.
    pub(crate) fn claim_next(&mut self, mask: &PieceMask, peer: PeerId) -> Option<u32> {
        let index = mask
            .unset_indices()
            .find(|i| !self.in_flight.contains_key(i))?;
        self.in_flight.insert(index, peer);
        Some(index)
    }

    /// Releases a claim (fetch finished or failed); the index becomes
    /// selectable again unless its mask bit got set.
    pub(crate) fn release(&mut self, index: u32) -> Option<PeerId> {
        self.in_flight.remove(&index)
    }

    pub(crate) fn claimed(&self) -> usize {
        self.in_flight.len()
    }

    #[cfg(test)]
    pub(crate) fn assignee(&self, index: u32) -> Option<PeerId> {
        self.in_flight.get(&index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_lowest_unset_unclaimed() {
        let mut mask = PieceMask::new(5);
        mask.set(0);
        mask.set(2);
        let mut picker = PiecePicker::new();
        let peer = PeerId([1; 32]);

        assert_eq!(picker.claim_next(&mask, peer), Some(1));
        assert_eq!(picker.claim_next(&mask, peer), Some(3));
        assert_eq!(picker.claim_next(&mask, peer), Some(4));
        assert_eq!(picker.claim_next(&mask, peer), None);
        assert_eq!(picker.claimed(), 3);
    }

    #[test]
    fn released_piece_is_reclaimable() {
        let mask = PieceMask::new(2);
        let mut picker = PiecePicker::new();
        let a = PeerId([1; 32]);
        let b = PeerId([2; 32]);

        assert_eq!(picker.claim_next(&mask, a), Some(0));
        assert_eq!(picker.claim_next(&mask, b), Some(1));
        assert_eq!(picker.release(0), Some(a));
        assert_eq!(picker.claim_next(&mask, b), Some(0));
        assert_eq!(picker.assignee(0), Some(b));
    }

    #[test]
    fn never_claims_a_piece_twice() {
        let mask = PieceMask::new(3);
        let mut picker = PiecePicker::new();
        let mut seen = std::collections::HashSet::new();
        while let Some(i) = picker.claim_next(&mask, PeerId([7; 32])) {
            assert!(seen.insert(i));
        }
        assert_eq!(seen.len(), 3);
    }
}
