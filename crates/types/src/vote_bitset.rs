//! Compact bitset of voting finalizers, indexed by policy position.

use sbor::prelude::BasicSbor;

#[derive(Debug, Clone, PartialEq, Eq, Hash, BasicSbor)]
pub struct VoteBitset {
    len: u32,
    bits: Vec<u64>,
}

impl VoteBitset {
    pub fn new(len: usize) -> Self {
        Self {
            len: len as u32,
            bits: vec![0; len.div_ceil(64)],
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set bit `index`. Out of range indices are ignored.
    pub fn set(&mut self, index: usize) {
        if index < self.len() {
            self.bits[index / 64] |= 1 << (index % 64);
        }
    }

    pub fn is_set(&self, index: usize) -> bool {
        index < self.len() && self.bits[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).filter(move |&i| self.is_set(i))
    }

    /// True if any bit is set in both sets.
    pub fn intersects(&self, other: &VoteBitset) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| a & b != 0)
    }
}
