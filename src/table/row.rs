// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use crate::{
    codec,
    errs::{
        Result,
        TridentError,
    },
    fs::Region,
    itr::{
        constraint_accessors,
        ColumnIgnorable,
        ItrKind,
        Markable,
        PairItr,
        Seekable,
    },
    table::strategy::StorageStrat,
};

#[derive(Clone, Copy, Debug)]
struct Saved {
    pos: usize,
    cur: usize,
    v1: i64,
    v2: i64,
    count: u64,
    key: i64,
    ignore: bool,
}

/// Reader over a row table: fixed-width `(v1, v2)` records.
#[derive(Clone)]
pub struct RowTable {
    data: Region,
    w1: usize,
    w2: usize,
    nrows: usize,
    // the rows this iterator may visit
    start: usize,
    end: usize,
    // first row of the current tuple, and the row `next` reads
    pos: usize,
    cur: usize,
    v1: i64,
    v2: i64,
    count: u64,
    key: i64,
    c1: Option<i64>,
    c2: Option<i64>,
    ignore: bool,
    groups: Option<u64>,
    saved: Option<Saved>,
}

impl RowTable {
    pub fn new(data: Region, strat: StorageStrat, key: i64) -> Result<Self> {
        let w1 = strat.bytes_v1();
        let w2 = strat.bytes_v2();
        if data.len() % (w1 + w2) != 0 {
            return Err(TridentError::corrupt(format!(
                "row table of {} bytes is not a multiple of {}",
                data.len(),
                w1 + w2
            )));
        }
        let nrows = data.len() / (w1 + w2);
        Ok(Self {
            data,
            w1,
            w2,
            nrows,
            start: 0,
            end: nrows,
            pos: 0,
            cur: 0,
            v1: -1,
            v2: -1,
            count: 0,
            key,
            c1: None,
            c2: None,
            ignore: false,
            groups: None,
            saved: None,
        })
    }

    #[inline]
    fn v1_at(&self, row: usize) -> i64 {
        let off = row * (self.w1 + self.w2);
        codec::decode_fixed(&self.data[off..], self.w1) as i64
    }

    #[inline]
    fn v2_at(&self, row: usize) -> i64 {
        let off = row * (self.w1 + self.w2) + self.w1;
        codec::decode_fixed(&self.data[off..], self.w2) as i64
    }

    /// First row in `[lo, hi)` not smaller than the target.
    fn lower_bound(&self, lo: usize, hi: usize, c1: i64, c2: Option<i64>) -> usize {
        let (mut lo, mut hi) = (lo, hi);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let smaller = match c2 {
                | Some(c2) => (self.v1_at(mid), self.v2_at(mid)) < (c1, c2),
                | None => self.v1_at(mid) < c1,
            };
            if smaller {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn group_end(&self, row: usize) -> usize {
        let v1 = self.v1_at(row);
        if v1 == i64::MAX {
            return self.end;
        }
        self.lower_bound(row, self.end, v1 + 1, None)
    }

    /// Restricts the iterator to rows with `v1 == c1` (and `v2 == c2`).
    pub fn setup(&mut self, c1: Option<i64>, c2: Option<i64>) {
        self.c1 = c1;
        self.c2 = c2;
        self.groups = None;
        let (start, end) = match (c1, c2) {
            | (Some(c1), Some(c2)) => {
                let s = self.lower_bound(0, self.nrows, c1, Some(c2));
                let e = if c2 == i64::MAX {
                    self.lower_bound(s, self.nrows, c1 + 1, None)
                } else {
                    self.lower_bound(s, self.nrows, c1, Some(c2 + 1))
                };
                (s, e)
            },
            | (Some(c1), None) => {
                let s = self.lower_bound(0, self.nrows, c1, None);
                (s, self.lower_bound(s, self.nrows, c1 + 1, None))
            },
            | _ => (0, self.nrows),
        };
        self.start = start;
        self.end = end;
        self.pos = start;
        self.cur = start;
    }

    pub fn n_rows(&self) -> usize {
        self.nrows
    }
}

impl PairItr for RowTable {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::Row
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
        Ok(self.cur < self.end)
    }

    fn next(&mut self) -> Result<()> {
        if self.cur >= self.end {
            return Err(TridentError::misuse("next on an exhausted row table"));
        }
        self.pos = self.cur;
        self.v1 = self.v1_at(self.cur);
        self.v2 = self.v2_at(self.cur);
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
            return Ok((self.end - self.start) as u64);
        }
        if let Some(g) = self.groups {
            return Ok(g);
        }
        let mut groups = 0;
        let mut row = self.start;
        while row < self.end {
            row = self.group_end(row);
            groups += 1;
        }
        self.groups = Some(groups);
        Ok(groups)
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        Ok(((self.end - self.cur) as u64).max(1))
    }

    fn is_second_column_ignored(&self) -> bool {
        self.ignore
    }

    fn as_seekable(&mut self) -> Option<&mut dyn Seekable> {
        Some(self)
    }

    fn as_markable(&mut self) -> Option<&mut dyn Markable> {
        Some(self)
    }

    fn as_column_ignorable(&mut self) -> Option<&mut dyn ColumnIgnorable> {
        Some(self)
    }
}

impl Seekable for RowTable {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        // searching from the current tuple keeps it when the target is behind
        let from = self.pos.max(self.start);
        let c2 = (!self.ignore).then_some(c2);
        self.cur = self.lower_bound(from, self.end, c1, c2);
        Ok(())
    }
}

impl Markable for RowTable {
    fn mark(&mut self) -> Result<()> {
        self.saved = Some(Saved {
            pos: self.pos,
            cur: self.cur,
            v1: self.v1,
            v2: self.v2,
            count: self.count,
            key: self.key,
            ignore: self.ignore,
        });
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let s = self
            .saved
            .ok_or_else(|| TridentError::misuse("reset without a mark"))?;
        self.pos = s.pos;
        self.cur = s.cur;
        self.v1 = s.v1;
        self.v2 = s.v2;
        self.count = s.count;
        self.key = s.key;
        self.ignore = s.ignore;
        Ok(())
    }
}

impl ColumnIgnorable for RowTable {
    fn ignore_second_column(&mut self) -> Result<()> {
        if self.ignore {
            return Ok(());
        }
        self.ignore = true;
        self.groups = None;
        if self.cur > self.pos {
            // fold the rest of the current group into it
            let group_start = self.lower_bound(self.start, self.pos + 1, self.v1, None);
            let end = self.group_end(self.pos);
            self.pos = group_start;
            self.count = (end - group_start) as u64;
            self.cur = end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::{
        Bytes,
        BytesMut,
    };

    use super::*;
    use crate::itr::PairItrExt;

    fn table(pairs: &[(u64, u64)], w1: usize, w2: usize) -> RowTable {
        let mut buf = BytesMut::new();
        for (a, b) in pairs {
            codec::put_fixed(&mut buf, w1, *a);
            codec::put_fixed(&mut buf, w2, *b);
        }
        let strat = StorageStrat::row(w1, w2).unwrap();
        RowTable::new(Region::from_bytes(Bytes::from(buf.to_vec())), strat, 7).unwrap()
    }

    const PAIRS: [(u64, u64); 6] = [(1, 1), (1, 5), (2, 3), (4, 1), (4, 2), (4, 9)];

    #[test]
    fn test_scan_and_counts() {
        let mut t = table(&PAIRS, 1, 2);
        assert_eq!(t.cardinality().unwrap(), 6);
        let got: Vec<_> = t.collect_tuples().unwrap().iter().map(|x| (x.1, x.2)).collect();
        let want: Vec<_> = PAIRS.iter().map(|(a, b)| (*a as i64, *b as i64)).collect();
        assert_eq!(got, want);
        assert!(t.next().unwrap_err().is_misuse());

        let mut t = table(&PAIRS, 1, 2);
        PairItrExt::ignore_second_column(&mut t).unwrap();
        assert_eq!(t.cardinality().unwrap(), 3);
        let got: Vec<_> = t.collect_tuples().unwrap().iter().map(|x| (x.1, x.3)).collect();
        assert_eq!(got, vec![(1, 2), (2, 1), (4, 3)]);
    }

    #[test]
    fn test_setup_constraints() {
        let mut t = table(&PAIRS, 1, 1);
        t.setup(Some(4), None);
        assert_eq!(t.cardinality().unwrap(), 3);
        t.setup(Some(4), Some(2));
        let got = t.collect_tuples().unwrap();
        assert_eq!(got, vec![(7, 4, 2, 1)]);
        t.setup(Some(3), None);
        assert!(!t.has_next().unwrap());
    }

    #[test]
    fn test_moveto_forward_and_backward() {
        let mut t = table(&PAIRS, 1, 1);
        t.next().unwrap();
        PairItrExt::moveto(&mut t, 2, 0).unwrap();
        t.next().unwrap();
        assert_eq!((t.value1(), t.value2()), (2, 3));
        // a target behind the current row keeps the current row
        PairItrExt::moveto(&mut t, 1, 0).unwrap();
        t.next().unwrap();
        assert_eq!((t.value1(), t.value2()), (2, 3));
        PairItrExt::moveto(&mut t, 4, 2).unwrap();
        t.next().unwrap();
        assert_eq!((t.value1(), t.value2()), (4, 2));
        PairItrExt::moveto(&mut t, 9, 9).unwrap();
        assert!(!t.has_next().unwrap());
    }

    #[test]
    fn test_mark_reset_and_late_ignore() {
        let mut t = table(&PAIRS, 1, 1);
        t.next().unwrap();
        PairItrExt::mark(&mut t).unwrap();
        t.next().unwrap();
        t.next().unwrap();
        PairItrExt::reset(&mut t).unwrap();
        t.next().unwrap();
        assert_eq!(t.value2(), 5);
        PairItrExt::ignore_second_column(&mut t).unwrap();
        assert_eq!(t.count().unwrap(), 2);
        t.next().unwrap();
        assert_eq!((t.value1(), t.count().unwrap()), (2, 1));
    }
}
