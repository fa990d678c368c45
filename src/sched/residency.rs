//! On-chip tile residency.
//!
//! Each operand has one recorded tile identity per operand buffer slot.
//! The identity is the tile's DRAM address, so a tile fetched once from an
//! unchanged host buffer is recognised on every later visit to the same
//! slot. [`INVALID_TILE`] means nothing is known about the slot.

use crate::hw::FETCHEXEC_SLOTS;
use crate::shape::Operand;

/// Identity that never matches a real tile.
pub const INVALID_TILE: u64 = u64::MAX;

/// Tile identities currently held in each operand buffer slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidencyTracker {
    lhs: [u64; FETCHEXEC_SLOTS],
    rhs: [u64; FETCHEXEC_SLOTS],
    hits: u64,
    misses: u64,
}

impl Default for ResidencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ResidencyTracker {
    /// A tracker with every slot invalid.
    pub fn new() -> Self {
        Self {
            lhs: [INVALID_TILE; FETCHEXEC_SLOTS],
            rhs: [INVALID_TILE; FETCHEXEC_SLOTS],
            hits: 0,
            misses: 0,
        }
    }

    fn slots(&self, operand: Operand) -> &[u64; FETCHEXEC_SLOTS] {
        match operand {
            Operand::Lhs => &self.lhs,
            Operand::Rhs => &self.rhs,
        }
    }

    fn slots_mut(&mut self, operand: Operand) -> &mut [u64; FETCHEXEC_SLOTS] {
        match operand {
            Operand::Lhs => &mut self.lhs,
            Operand::Rhs => &mut self.rhs,
        }
    }

    /// Forget every slot of one operand.
    pub fn invalidate(&mut self, operand: Operand) {
        log::debug!("residency: invalidate {}", operand.name());
        *self.slots_mut(operand) = [INVALID_TILE; FETCHEXEC_SLOTS];
    }

    /// Forget every slot of both operands.
    pub fn invalidate_all(&mut self) {
        self.invalidate(Operand::Lhs);
        self.invalidate(Operand::Rhs);
    }

    /// Tile recorded in a slot.
    ///
    /// # Panics
    ///
    /// Panics if `slot >= FETCHEXEC_SLOTS`.
    pub fn resident(&self, operand: Operand, slot: usize) -> u64 {
        self.slots(operand)[slot]
    }

    /// Whether `tile` is known to be in `slot`.
    pub fn is_resident(&self, operand: Operand, slot: usize, tile: u64) -> bool {
        tile != INVALID_TILE && self.resident(operand, slot) == tile
    }

    /// Look up `tile` in `slot` and record it there.
    ///
    /// Returns `true` on a hit. On a miss the caller must fetch the tile;
    /// the slot is updated to hold it.
    pub fn access(&mut self, operand: Operand, slot: usize, tile: u64) -> bool {
        if self.is_resident(operand, slot, tile) {
            self.hits += 1;
            true
        } else {
            self.misses += 1;
            self.slots_mut(operand)[slot] = tile;
            false
        }
    }

    /// Hits since construction.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Misses since construction.
    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_invalid() {
        let r = ResidencyTracker::new();
        for slot in 0..FETCHEXEC_SLOTS {
            assert_eq!(r.resident(Operand::Lhs, slot), INVALID_TILE);
            assert_eq!(r.resident(Operand::Rhs, slot), INVALID_TILE);
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let mut r = ResidencyTracker::new();
        assert!(!r.access(Operand::Lhs, 0, 0x1000));
        assert!(r.access(Operand::Lhs, 0, 0x1000));
        // Other slot and other operand are independent.
        assert!(!r.access(Operand::Lhs, 1, 0x1000));
        assert!(!r.access(Operand::Rhs, 0, 0x1000));
        assert_eq!(r.hits(), 1);
        assert_eq!(r.misses(), 3);
    }

    #[test]
    fn test_replace_evicts() {
        let mut r = ResidencyTracker::new();
        r.access(Operand::Rhs, 1, 0x40);
        r.access(Operand::Rhs, 1, 0x80);
        assert!(!r.access(Operand::Rhs, 1, 0x40));
    }

    #[test]
    fn test_invalidate_one_operand() {
        let mut r = ResidencyTracker::new();
        r.access(Operand::Lhs, 0, 0x1000);
        r.access(Operand::Rhs, 0, 0x2000);
        r.invalidate(Operand::Lhs);
        assert!(!r.access(Operand::Lhs, 0, 0x1000));
        assert!(r.access(Operand::Rhs, 0, 0x2000));
    }

    #[test]
    fn test_invalid_sentinel_never_hits() {
        let mut r = ResidencyTracker::new();
        assert!(!r.access(Operand::Lhs, 0, INVALID_TILE));
        assert!(!r.access(Operand::Lhs, 0, INVALID_TILE));
    }
}
