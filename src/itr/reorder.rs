// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use bytes::{
    BufMut,
    BytesMut,
};
use tracing::{
    debug,
    instrument,
};

use crate::{
    codec,
    errs::{
        Result,
        TridentError,
    },
    itr::{
        constraint_accessors,
        ColumnIgnorable,
        ItrKind,
        KeySeekable,
        Markable,
        PairItr,
        Seekable,
    },
    perm::Permutation,
};

const RECORD_SIZE: usize = 15;
const HEADER_SIZE: usize = 9;
const MAX_40_BITS: i64 = (1 << 40) - 1;

/// A relation materialized in memory and sorted in an order no stored
/// permutation provides for the requested constraints.
#[derive(Clone)]
pub struct ReOrderItr {
    perm: Permutation,
    rows: Arc<Vec<[i64; 3]>>,
    pos: usize,
    cur: usize,
    key: i64,
    v1: i64,
    v2: i64,
    count: u64,
    c1: Option<i64>,
    c2: Option<i64>,
    ignore: bool,
    saved: Option<(usize, usize, i64, i64, i64, u64, bool)>,
}

impl ReOrderItr {
    /// Triples already laid out as (key, value1, value2) of SPO.
    pub fn from_triples(mut rows: Vec<[i64; 3]>) -> Self {
        rows.sort_unstable();
        Self::sorted(Permutation::Spo, rows)
    }

    /// Drains `source`, which walks `source_perm`, and re-sorts its tuples
    /// into `target`. `selector` holds optional (s, p, o) constants; tuples
    /// that disagree with a constant are dropped.
    pub fn new(
        source: &mut dyn PairItr,
        source_perm: Permutation,
        target: Permutation,
        selector: [Option<i64>; 3],
    ) -> Result<Self> {
        let mut rows = Vec::new();
        while source.has_next()? {
            source.next()?;
            let spo = source_perm.unpermute([source.key(), source.value1(), source.value2()]);
            let keep = spo
                .iter()
                .zip(selector.iter())
                .all(|(v, s)| s.map_or(true, |s| s == *v));
            if keep {
                rows.push(target.permute(spo));
            }
        }
        rows.sort_unstable();
        debug!(%source_perm, %target, n = rows.len(), "materialized reordered relation");
        Ok(Self::sorted(target, rows))
    }

    fn sorted(perm: Permutation, rows: Vec<[i64; 3]>) -> Self {
        ReOrderItr {
            perm,
            rows: Arc::new(rows),
            pos: 0,
            cur: 0,
            key: -1,
            v1: -1,
            v2: -1,
            count: 0,
            c1: None,
            c2: None,
            ignore: false,
            saved: None,
        }
    }

    pub fn permutation(&self) -> Permutation {
        self.perm
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Name of the side file holding the relation for `selector`.
    pub fn file_name(perm: Permutation, selector: [Option<i64>; 3]) -> String {
        let part = |c: Option<i64>| c.map_or_else(|| "x".to_string(), |v| v.to_string());
        format!(
            "reorder-{}-{}-{}-{}",
            perm.name(),
            part(selector[0]),
            part(selector[1]),
            part(selector[2])
        )
    }

    /// Persists the relation under `dir` so [`ReOrderItr::load`] can reopen it
    /// for the same selector.
    #[instrument(level = "debug", skip(self))]
    pub fn dump(&self, dir: &Path, selector: [Option<i64>; 3]) -> Result<PathBuf> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.rows.len() * RECORD_SIZE + 4);
        buf.put_u8(self.perm.index() as u8);
        buf.put_u64_le(self.rows.len() as u64);
        for row in self.rows.iter() {
            for v in row {
                if !(0..=MAX_40_BITS).contains(v) {
                    return Err(TridentError::misuse(format!("term {v} does not fit five bytes")));
                }
                codec::put_fixed(&mut buf, 5, *v as u64);
            }
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(self.perm, selector));
        fs::write(&path, &buf)?;
        Ok(path)
    }

    /// Reopens a relation written by [`ReOrderItr::dump`], or `None` when
    /// nothing was dumped for the selector.
    #[instrument(level = "debug")]
    pub fn load(dir: &Path, perm: Permutation, selector: [Option<i64>; 3]) -> Result<Option<Self>> {
        let path = dir.join(Self::file_name(perm, selector));
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        if data.len() < HEADER_SIZE + 4 {
            return Err(TridentError::corrupt(format!("{} is truncated", path.display())));
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if crc32fast::hash(body) != stored {
            return Err(TridentError::corrupt(format!("checksum mismatch in {}", path.display())));
        }
        let stored_perm = Permutation::from_index(body[0] as usize)?;
        if stored_perm != perm {
            return Err(TridentError::corrupt(format!(
                "{} holds {stored_perm}, expected {perm}",
                path.display()
            )));
        }
        let n = codec::decode_fixed(&body[1..HEADER_SIZE], 8) as usize;
        let records = &body[HEADER_SIZE..];
        if records.len() != n * RECORD_SIZE {
            return Err(TridentError::corrupt(format!(
                "{} declares {n} rows but holds {} bytes",
                path.display(),
                records.len()
            )));
        }
        let rows = records
            .chunks_exact(RECORD_SIZE)
            .map(|r| {
                [
                    codec::decode_fixed(&r[0..5], 5) as i64,
                    codec::decode_fixed(&r[5..10], 5) as i64,
                    codec::decode_fixed(&r[10..15], 5) as i64,
                ]
            })
            .collect();
        Ok(Some(Self::sorted(perm, rows)))
    }

    fn lower_bound(&self, target: [i64; 3], width: usize) -> usize {
        self.pos + self.rows[self.pos..].partition_point(|r| r[..width] < target[..width])
    }

    fn group_end(&self, from: usize) -> usize {
        let head = self.rows[from];
        from + self.rows[from..].partition_point(|r| r[..2] == head[..2])
    }
}

impl PairItr for ReOrderItr {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::ReOrder
    }

    fn value1(&self) -> i64 {
        self.v1
    }

    fn value2(&self) -> i64 {
        self.v2
    }

    fn count(&mut self) -> Result<u64> {
        Ok(self.count)
    }

    fn has_next(&mut self) -> Result<bool> {
        Ok(self.cur < self.rows.len())
    }

    fn next(&mut self) -> Result<()> {
        if self.cur >= self.rows.len() {
            return Err(TridentError::misuse("next on an exhausted reordered relation"));
        }
        self.pos = self.cur;
        [self.key, self.v1, self.v2] = self.rows[self.cur];
        if self.ignore {
            let end = self.group_end(self.cur);
            self.count = (end - self.cur) as u64;
            self.cur = end;
        } else {
            self.count = 1;
            self.cur += 1;
        }
        Ok(())
    }

    fn cardinality(&mut self) -> Result<u64> {
        if !self.ignore {
            return Ok(self.rows.len() as u64);
        }
        let groups = self.rows.windows(2).filter(|w| w[0][..2] != w[1][..2]).count();
        Ok(if self.rows.is_empty() { 0 } else { groups as u64 + 1 })
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        Ok(self.rows.len() as u64)
    }

    fn is_second_column_ignored(&self) -> bool {
        self.ignore
    }

    fn as_seekable(&mut self) -> Option<&mut dyn Seekable> {
        Some(self)
    }

    fn as_key_seekable(&mut self) -> Option<&mut dyn KeySeekable> {
        Some(self)
    }

    fn as_markable(&mut self) -> Option<&mut dyn Markable> {
        Some(self)
    }

    fn as_column_ignorable(&mut self) -> Option<&mut dyn ColumnIgnorable> {
        Some(self)
    }
}

impl Seekable for ReOrderItr {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        let width = if self.ignore { 2 } else { 3 };
        let key = if self.cur > 0 { self.key } else { self.rows.first().map_or(-1, |r| r[0]) };
        self.cur = self.lower_bound([key, c1, c2], width);
        Ok(())
    }
}

impl KeySeekable for ReOrderItr {
    fn goto_key(&mut self, key: i64) -> Result<()> {
        self.cur = self.lower_bound([key, 0, 0], 1);
        Ok(())
    }
}

impl Markable for ReOrderItr {
    fn mark(&mut self) -> Result<()> {
        self.saved = Some((self.pos, self.cur, self.key, self.v1, self.v2, self.count, self.ignore));
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let (pos, cur, key, v1, v2, count, ignore) = self
            .saved
            .ok_or_else(|| TridentError::misuse("reset without a mark"))?;
        (self.pos, self.cur, self.key, self.v1, self.v2) = (pos, cur, key, v1, v2);
        self.count = count;
        self.ignore = ignore;
        Ok(())
    }
}

impl ColumnIgnorable for ReOrderItr {
    fn ignore_second_column(&mut self) -> Result<()> {
        if self.ignore {
            return Ok(());
        }
        self.ignore = true;
        if self.cur > self.pos {
            let end = self.group_end(self.pos);
            self.count = (end - self.pos) as u64;
            self.cur = end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itr::{
        ArrayItr,
        PairItrExt,
    };

    fn spo_rows() -> Vec<[i64; 3]> {
        vec![[1, 10, 7], [1, 11, 8], [2, 10, 8], [3, 10, 7], [3, 12, 7]]
    }

    #[test]
    fn test_reorders_source() {
        // pairs of subject 1 in spo: (p, o)
        let mut src = ArrayItr::from_unsorted(vec![(10, 7), (11, 8), (12, 7)], 1);
        let mut itr = ReOrderItr::new(&mut src, Permutation::Spo, Permutation::Osp, [None; 3]).unwrap();
        assert_eq!(itr.permutation(), Permutation::Osp);
        let got = itr.collect_tuples().unwrap();
        assert_eq!(got, vec![(7, 1, 10, 1), (7, 1, 12, 1), (8, 1, 11, 1)]);

        let mut src = ArrayItr::from_unsorted(vec![(10, 7), (11, 8), (12, 7)], 1);
        let mut itr =
            ReOrderItr::new(&mut src, Permutation::Spo, Permutation::Pos, [None, None, Some(7)]).unwrap();
        let keys: Vec<_> = itr.collect_tuples().unwrap().into_iter().map(|t| t.0).collect();
        assert_eq!(keys, vec![10, 12]);
    }

    #[test]
    fn test_seek_and_groups() {
        let mut itr = ReOrderItr::from_triples(spo_rows());
        PairItrExt::goto_key(&mut itr, 2).unwrap();
        itr.next().unwrap();
        assert_eq!((itr.key(), itr.value1()), (2, 10));
        itr.next().unwrap();
        PairItrExt::moveto(&mut itr, 11, 0).unwrap();
        itr.next().unwrap();
        assert_eq!((itr.key(), itr.value1()), (3, 12));

        let mut itr = ReOrderItr::from_triples(spo_rows());
        PairItrExt::ignore_second_column(&mut itr).unwrap();
        assert_eq!(itr.cardinality().unwrap(), 5);
        let mut itr = ReOrderItr::from_triples(vec![[1, 1, 1], [1, 1, 2], [1, 2, 0]]);
        itr.next().unwrap();
        PairItrExt::ignore_second_column(&mut itr).unwrap();
        assert_eq!(itr.count().unwrap(), 2);
        itr.next().unwrap();
        assert_eq!(itr.value1(), 2);
        assert!(!itr.has_next().unwrap());
    }

    #[test]
    fn test_mark_reset() {
        let mut itr = ReOrderItr::from_triples(spo_rows());
        itr.next().unwrap();
        PairItrExt::mark(&mut itr).unwrap();
        itr.next().unwrap();
        itr.next().unwrap();
        PairItrExt::reset(&mut itr).unwrap();
        itr.next().unwrap();
        assert_eq!((itr.key(), itr.value1(), itr.value2()), (1, 11, 8));
    }

    #[test]
    fn test_dump_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let selector = [None, Some(10), None];
        let itr = ReOrderItr::from_triples(spo_rows());
        let path = itr.dump(dir.path(), selector).unwrap();
        assert!(path.ends_with("reorder-spo-x-10-x"));

        let mut back = ReOrderItr::load(dir.path(), Permutation::Spo, selector).unwrap().unwrap();
        let want: Vec<_> = spo_rows().into_iter().map(|r| (r[0], r[1], r[2], 1)).collect();
        assert_eq!(back.collect_tuples().unwrap(), want);
        assert!(ReOrderItr::load(dir.path(), Permutation::Spo, [None; 3]).unwrap().is_none());
        assert!(ReOrderItr::load(dir.path(), Permutation::Ops, selector).unwrap().is_none());

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();
        assert!(ReOrderItr::load(dir.path(), Permutation::Spo, selector).is_err());
    }
}
