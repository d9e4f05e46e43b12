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
};

const INITIAL_SIZE: usize = 128;

/// Sparse index from a key to its physical (file, position). Keys are kept
/// ascending in parallel arrays; lookups binary search for the last entry
/// whose key is not greater than the probe. Sub-indices can be attached under
/// a key when one range needs its own fan-out.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct FileIndex {
    keys: Vec<i64>,
    files: Vec<u16>,
    positions: Vec<u32>,
    additional_keys: Vec<i64>,
    additional: Vec<FileIndex>,
}

fn grow<T>(v: &mut Vec<T>, size: usize) {
    if size >= v.capacity() {
        let target = (size * 2).max(INITIAL_SIZE).max(v.capacity() * 3 / 2);
        v.reserve_exact(target - v.len());
    }
}

impl FileIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub(crate) fn size_index(&self) -> usize {
        self.keys.len()
    }

    /// Appends an entry. Keys must arrive in ascending order.
    pub(crate) fn add(&mut self, key: i64, file: u16, pos: u32) -> Result<()> {
        if let Some(last) = self.keys.last() {
            if key <= *last {
                return Err(TridentError::misuse(format!(
                    "file index key {key} not greater than {last}"
                )));
            }
        }
        let n = self.keys.len();
        grow(&mut self.keys, n);
        grow(&mut self.files, n);
        grow(&mut self.positions, n);
        self.keys.push(key);
        self.files.push(file);
        self.positions.push(pos);
        Ok(())
    }

    pub(crate) fn add_additional_index(&mut self, key: i64, idx: FileIndex) -> Result<()> {
        if self.additional_keys.last().is_some_and(|last| key <= *last) {
            return Err(TridentError::misuse(format!(
                "additional index key {key} out of order"
            )));
        }
        let n = self.additional_keys.len();
        grow(&mut self.additional_keys, n);
        self.additional_keys.push(key);
        self.additional.push(idx);
        Ok(())
    }

    pub(crate) fn key(&self, idx: usize) -> i64 {
        self.keys[idx]
    }

    pub(crate) fn file(&self, idx: usize) -> u16 {
        self.files[idx]
    }

    pub(crate) fn pos(&self, idx: usize) -> u32 {
        self.positions[idx]
    }

    pub(crate) fn set_pos(&mut self, idx: usize, pos: u32) {
        self.positions[idx] = pos;
    }

    /// Index of the last entry with a key `<= key`, if any.
    pub(crate) fn idx(&self, key: i64) -> Option<usize> {
        self.idx_from(0, key)
    }

    pub(crate) fn idx_from(&self, start: usize, key: i64) -> Option<usize> {
        if start >= self.keys.len() {
            return None;
        }
        let n = self.keys[start..].partition_point(|k| *k <= key);
        if n == 0 {
            None
        } else {
            Some(start + n - 1)
        }
    }

    /// Exact lookup.
    pub(crate) fn find(&self, key: i64) -> Option<usize> {
        self.keys.binary_search(&key).ok()
    }

    pub(crate) fn additional_idx(&self, key: i64) -> Option<&FileIndex> {
        let n = self.additional_keys.partition_point(|k| *k <= key);
        if n == 0 {
            None
        } else {
            self.additional.get(n - 1)
        }
    }

    pub(crate) fn serialize(&self, buf: &mut BytesMut) {
        codec::put_vlong(buf, self.keys.len() as u64);
        for i in 0..self.keys.len() {
            buf.put_i64_le(self.keys[i]);
            buf.put_u16_le(self.files[i]);
            buf.put_u32_le(self.positions[i]);
        }
        codec::put_vlong(buf, self.additional_keys.len() as u64);
        for (k, idx) in self.additional_keys.iter().zip(self.additional.iter()) {
            buf.put_i64_le(*k);
            idx.serialize(buf);
        }
    }

    pub(crate) fn deserialize(buf: &mut &[u8]) -> Result<Self> {
        let mut out = FileIndex::new();
        let n = codec::get_vlong(buf)? as usize;
        if buf.remaining() < n * 14 {
            return Err(TridentError::corrupt("truncated file index"));
        }
        for _ in 0..n {
            let key = buf.get_i64_le();
            let file = buf.get_u16_le();
            let pos = buf.get_u32_le();
            out.add(key, file, pos)
                .map_err(|_| TridentError::corrupt("file index keys out of order"))?;
        }
        let nadd = codec::get_vlong(buf)? as usize;
        for _ in 0..nadd {
            if buf.remaining() < 8 {
                return Err(TridentError::corrupt("truncated additional index"));
            }
            let key = buf.get_i64_le();
            let child = FileIndex::deserialize(buf)?;
            out.add_additional_index(key, child)
                .map_err(|_| TridentError::corrupt("additional index keys out of order"))?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_lookup_floor() {
        let mut idx = FileIndex::new();
        assert!(idx.is_empty());
        idx.add(10, 0, 0).unwrap();
        idx.add(20, 0, 100).unwrap();
        idx.add(30, 1, 0).unwrap();
        assert!(idx.add(30, 1, 5).is_err());
        assert_eq!(idx.idx(5), None);
        assert_eq!(idx.idx(10), Some(0));
        assert_eq!(idx.idx(25), Some(1));
        assert_eq!(idx.idx(99), Some(2));
        assert_eq!(idx.idx_from(2, 25), None);
        assert_eq!(idx.find(20), Some(1));
        assert_eq!(idx.find(21), None);
        assert_eq!(idx.file(2), 1);
        assert_eq!(idx.pos(1), 100);
    }

    #[test]
    fn test_additional_and_serialize() {
        let mut child = FileIndex::new();
        child.add(1000, 3, 4).unwrap();
        let mut idx = FileIndex::new();
        idx.add(1, 0, 0).unwrap();
        idx.add_additional_index(500, child.clone()).unwrap();
        assert!(idx.additional_idx(499).is_none());
        assert_eq!(idx.additional_idx(2000), Some(&child));

        let mut buf = BytesMut::new();
        idx.serialize(&mut buf);
        let mut slice: &[u8] = &buf;
        let back = FileIndex::deserialize(&mut slice).unwrap();
        assert_eq!(back, idx);
        assert!(slice.is_empty());
    }

    proptest! {
        #[test]
        fn test_idx_matches_linear_scan(keys in proptest::collection::btree_set(0i64..10_000, 1..300), probe in -10i64..10_010) {
            let mut idx = FileIndex::new();
            for (i, k) in keys.iter().enumerate() {
                idx.add(*k, 0, i as u32).unwrap();
            }
            let expected = keys.iter().rposition(|k| *k <= probe);
            prop_assert_eq!(idx.idx(probe), expected);
        }
    }
}
