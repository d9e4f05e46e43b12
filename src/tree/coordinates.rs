// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use bytes::{
    Buf,
    BufMut,
    BytesMut,
};

use crate::{
    codec,
    errs::{
        Result,
        TridentError,
    },
    perm::Permutation,
};

/// Location of one term's table in one permutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coordinate {
    pub file: u16,
    pub mark: u64,
    pub strat: u8,
    pub n_elements: u64,
}

/// Where the tables of a term live, one optional slot per permutation. An
/// empty slot means the permutation holds no table keyed by the term, either
/// because the term never occurs in that position or because the table was
/// skipped by an incomplete index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TermCoordinates {
    slots: [Option<Coordinate>; 6],
}

impl TermCoordinates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, perm: Permutation, coord: Coordinate) {
        self.slots[perm.index()] = Some(coord);
    }

    pub fn get(&self, perm: Permutation) -> Option<Coordinate> {
        self.slots[perm.index()]
    }

    pub fn exists(&self, perm: Permutation) -> bool {
        self.slots[perm.index()].is_some()
    }

    pub fn n_elements(&self, perm: Permutation) -> u64 {
        self.slots[perm.index()].map_or(0, |c| c.n_elements)
    }

    /// Copies every slot set in `other` over this one.
    pub fn merge(&mut self, other: &TermCoordinates) {
        for (mine, theirs) in self.slots.iter_mut().zip(other.slots.iter()) {
            if theirs.is_some() {
                *mine = *theirs;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        let mut mask = 0u8;
        for (i, s) in self.slots.iter().enumerate() {
            if s.is_some() {
                mask |= 1 << i;
            }
        }
        buf.put_u8(mask);
        for c in self.slots.iter().flatten() {
            codec::put_vlong(buf, c.file as u64);
            codec::put_vlong(buf, c.mark);
            buf.put_u8(c.strat);
            codec::put_vlong(buf, c.n_elements);
        }
    }

    pub(crate) fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(TridentError::corrupt("truncated term coordinates"));
        }
        let mask = buf.get_u8();
        if mask >> 6 != 0 {
            return Err(TridentError::corrupt(format!("bad coordinate mask {mask:#x}")));
        }
        let mut out = Self::default();
        for i in 0..6 {
            if mask & (1 << i) == 0 {
                continue;
            }
            let file = codec::get_vlong(buf)?;
            let mark = codec::get_vlong(buf)?;
            if buf.is_empty() {
                return Err(TridentError::corrupt("truncated term coordinates"));
            }
            let strat = buf.get_u8();
            let n_elements = codec::get_vlong(buf)?;
            let file = u16::try_from(file)
                .map_err(|_| TridentError::corrupt(format!("file id {file} out of range")))?;
            out.slots[i] = Some(Coordinate {
                file,
                mark,
                strat,
                n_elements,
            });
        }
        Ok(out)
    }
}
