/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Dense bitsets over value indices.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

const WORD_BITS: usize = 64;

/// A set of small indices, one bit each. The set grows on insert, so
/// the capacity given at construction is only a hint.
#[derive(Clone, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
}

/// Word holding `el`, and `el`'s bit within it.
#[inline(always)]
fn locate(el: usize) -> (usize, u64) {
    (el / WORD_BITS, 1 << (el % WORD_BITS))
}

impl BitSet {
    pub fn with_capacity(n: usize) -> Self {
        BitSet {
            words: vec![0; (n + WORD_BITS - 1) / WORD_BITS],
        }
    }

    pub fn insert(&mut self, el: usize) {
        let (word, bit) = locate(el);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= bit;
    }

    pub fn remove(&mut self, el: usize) {
        let (word, bit) = locate(el);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !bit;
        }
    }

    pub fn contains(&self, el: usize) -> bool {
        let (word, bit) = locate(el);
        self.words.get(word).map_or(false, |w| w & bit != 0)
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Add every member of `other`. Returns whether anything was added.
    pub fn union_with(&mut self, other: &BitSet) -> bool {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        let mut grew = false;
        for (w, &o) in self.words.iter_mut().zip(other.words.iter()) {
            let merged = *w | o;
            grew |= merged != *w;
            *w = merged;
        }
        grew
    }

    /// Remove every member of `other`.
    pub fn subtract(&mut self, other: &BitSet) {
        for (w, &o) in self.words.iter_mut().zip(other.words.iter()) {
            *w &= !o;
        }
    }

    /// Set equality, whatever the two sets' capacities.
    pub fn same_members(&self, other: &BitSet) -> bool {
        let (short, long) = if self.words.len() <= other.words.len() {
            (&self.words, &other.words)
        } else {
            (&other.words, &self.words)
        };
        short.iter().zip(long.iter()).all(|(a, b)| a == b)
            && long[short.len()..].iter().all(|&w| w == 0)
    }

    pub fn iter(&self) -> BitSetIter<'_> {
        BitSetIter {
            words: self.words.iter(),
            base: 0,
            word: 0,
        }
    }
}

pub struct BitSetIter<'a> {
    words: core::slice::Iter<'a, u64>,
    /// Index of bit 0 of `word`.
    base: usize,
    /// Members of the current word not yet returned.
    word: u64,
}

impl<'a> Iterator for BitSetIter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.word == 0 {
            self.word = *self.words.next()?;
            self.base += WORD_BITS;
        }
        let bit = self.word.trailing_zeros() as usize;
        // Clear the lowest set bit.
        self.word &= self.word - 1;
        Some(self.base - WORD_BITS + bit)
    }
}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::compute_ssa_liveness;
    use crate::{Block, Func, InstData, Opcode, VReg};

    #[test]
    fn sparse_members_in_order() {
        // Values either side of every word boundary up to 192.
        let mut set = BitSet::with_capacity(0);
        for &el in &[191, 64, 0, 128, 63, 127] {
            set.insert(el);
        }
        assert_eq!(set.iter().collect::<Vec<_>>(), [0, 63, 64, 127, 128, 191]);
        set.remove(64);
        set.remove(4096);
        assert!(!set.contains(64));
        assert!(!set.contains(4096));
        assert_eq!(set.len(), 5);
        assert!(!set.is_empty());
        set.clear();
        assert!(set.is_empty());
        assert!(set.same_members(&BitSet::with_capacity(1000)));
    }

    #[test]
    fn loop_liveness_spans_words() {
        // A loop body reads 130 values defined before the loop, so the
        // sets grow past two words and the back edge must report a
        // change exactly until the loop header has seen them all.
        let mut f = Func::new();
        let b: Vec<Block> = (0..3).map(|_| f.add_block()).collect();
        f.add_edge(b[0], b[1]);
        f.add_edge(b[1], b[1]);
        f.add_edge(b[1], b[2]);
        let vals: Vec<VReg> = (0..130).map(|_| f.new_vreg()).collect();
        for (i, &v) in vals.iter().enumerate() {
            f.push_inst(b[0], InstData::constant(v, i as u32));
        }
        f.push_inst(b[0], InstData::jump());
        let mut acc = vals[0];
        for &v in &vals[1..] {
            let sum = f.new_vreg();
            f.push_inst(b[1], InstData::alu(Opcode::IAdd, sum, &[acc, v]));
            acc = sum;
        }
        f.push_inst(b[1], InstData::branch(acc));
        f.push_inst(b[2], InstData::ret());

        let live = compute_ssa_liveness(&f);
        let header = live.live_in(b[1]);
        assert_eq!(header.len(), vals.len());
        assert!(vals.iter().all(|v| header.contains(v.index())));
        assert!(header.same_members(live.live_out(b[0])));
        assert!(header.same_members(live.live_out(b[1])));
        assert!(live.live_in(b[0]).is_empty());

        let mut merged = BitSet::with_capacity(0);
        assert!(merged.union_with(header));
        assert!(!merged.union_with(live.live_out(b[1])));
        merged.subtract(header);
        assert!(merged.is_empty());
    }
}
