// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::fmt;

use crate::errs::{
    Result,
    TridentError,
};

/// One of the six sort orders a triple is indexed under. The numeric values
/// match the on-disk directory names `p0..p5`; `SOP`, `OSP` and `PSO` are the
/// reverses of `SPO`, `OPS` and `POS` (same first column, swapped second and
/// third columns).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Permutation {
    Spo = 0,
    Ops = 1,
    Pos = 2,
    Sop = 3,
    Osp = 4,
    Pso = 5,
}

pub const ALL_PERMUTATIONS: [Permutation; 6] = [
    Permutation::Spo,
    Permutation::Ops,
    Permutation::Pos,
    Permutation::Sop,
    Permutation::Osp,
    Permutation::Pso,
];

// which triple component sits in each slot of the permutation
const INV_ORDERS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [2, 1, 0],
    [1, 2, 0],
    [0, 2, 1],
    [2, 0, 1],
    [1, 0, 2],
];

// slot of s, p, o inside each permutation
const ORDERS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [2, 1, 0],
    [2, 0, 1],
    [0, 2, 1],
    [1, 2, 0],
    [1, 0, 2],
];

impl Permutation {
    pub fn from_index(idx: usize) -> Result<Self> {
        ALL_PERMUTATIONS
            .get(idx)
            .copied()
            .ok_or_else(|| TridentError::misuse(format!("no permutation with index {idx}")))
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// For every triple component (s, p, o), its slot in this permutation.
    #[inline]
    pub fn order(self) -> [usize; 3] {
        ORDERS[self.index()]
    }

    /// For every slot of this permutation, the triple component stored there.
    #[inline]
    pub fn inv_order(self) -> [usize; 3] {
        INV_ORDERS[self.index()]
    }

    #[inline]
    pub fn is_reverse(self) -> bool {
        self.index() > 2
    }

    /// The permutation with the same first column and swapped value columns.
    pub fn reverse(self) -> Self {
        ALL_PERMUTATIONS[(self.index() + 3) % 6]
    }

    /// Rearranges an (s, p, o) triple into this permutation's column order.
    #[inline]
    pub fn permute<T: Copy>(self, spo: [T; 3]) -> [T; 3] {
        let inv = self.inv_order();
        [spo[inv[0]], spo[inv[1]], spo[inv[2]]]
    }

    /// Inverse of [`Permutation::permute`].
    #[inline]
    pub fn unpermute<T: Copy>(self, cols: [T; 3]) -> [T; 3] {
        let ord = self.order();
        [cols[ord[0]], cols[ord[1]], cols[ord[2]]]
    }

    pub fn name(self) -> &'static str {
        match self {
            | Permutation::Spo => "spo",
            | Permutation::Ops => "ops",
            | Permutation::Pos => "pos",
            | Permutation::Sop => "sop",
            | Permutation::Osp => "osp",
            | Permutation::Pso => "pso",
        }
    }
}

impl fmt::Display for Permutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permute_roundtrip() {
        let spo = [10, 20, 30];
        for perm in ALL_PERMUTATIONS {
            let cols = perm.permute(spo);
            assert_eq!(perm.unpermute(cols), spo, "{perm}");
        }
        assert_eq!(Permutation::Pos.permute(spo), [20, 30, 10]);
        assert_eq!(Permutation::Osp.permute(spo), [30, 10, 20]);
        assert_eq!(Permutation::Ops.permute(spo), [30, 20, 10]);
    }

    #[test]
    fn test_reverse_pairs() {
        assert_eq!(Permutation::Spo.reverse(), Permutation::Sop);
        assert_eq!(Permutation::Pso.reverse(), Permutation::Pos);
        for perm in ALL_PERMUTATIONS {
            let a = perm.permute([1, 2, 3]);
            let b = perm.reverse().permute([1, 2, 3]);
            assert_eq!(a[0], b[0]);
            assert_eq!((a[1], a[2]), (b[2], b[1]));
        }
        assert!(Permutation::from_index(6).is_err());
    }
}
