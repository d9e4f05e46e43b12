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

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Cursor {
    // byte offset of the group header
    group: usize,
    // index of the value2 inside the group
    idx: usize,
}

#[derive(Clone, Copy, Debug)]
struct Saved {
    pos: Cursor,
    cur: Cursor,
    v1: i64,
    v2: i64,
    count: u64,
    key: i64,
    ignore: bool,
}

/// Reader over a cluster table: groups of `v1, count, v2 * count`.
#[derive(Clone)]
pub struct ClusterTable {
    data: Region,
    w1: usize,
    w2: usize,
    wc: usize,
    first_group: usize,
    end_group: usize,
    // index bounds inside `first_group` when value2 is constrained
    idx_lo: usize,
    idx_hi: Option<usize>,
    pos: Cursor,
    cur: Cursor,
    v1: i64,
    v2: i64,
    count: u64,
    key: i64,
    c1: Option<i64>,
    c2: Option<i64>,
    ignore: bool,
    card: Option<u64>,
    saved: Option<Saved>,
}

impl ClusterTable {
    pub fn new(data: Region, strat: StorageStrat, key: i64) -> Result<Self> {
        let (w1, w2, wc) = (strat.bytes_v1(), strat.bytes_v2(), strat.bytes_count());
        // every group must lie inside the table
        let mut off = 0;
        while off < data.len() {
            if off + w1 + wc > data.len() {
                return Err(TridentError::corrupt(format!(
                    "cluster group header at {off} past end of table"
                )));
            }
            let n = codec::decode_fixed(&data[off + w1..], wc) as usize;
            off += w1 + wc + n * w2;
        }
        if off != data.len() {
            return Err(TridentError::corrupt("cluster table ends inside a group"));
        }
        let end = data.len();
        Ok(Self {
            data,
            w1,
            w2,
            wc,
            first_group: 0,
            end_group: end,
            idx_lo: 0,
            idx_hi: None,
            pos: Cursor { group: 0, idx: 0 },
            cur: Cursor { group: 0, idx: 0 },
            v1: -1,
            v2: -1,
            count: 0,
            key,
            c1: None,
            c2: None,
            ignore: false,
            card: None,
            saved: None,
        })
    }

    #[inline]
    fn group_v1(&self, group: usize) -> i64 {
        codec::decode_fixed(&self.data[group..], self.w1) as i64
    }

    #[inline]
    fn group_size(&self, group: usize) -> usize {
        codec::decode_fixed(&self.data[group + self.w1..], self.wc) as usize
    }

    #[inline]
    fn v2_at(&self, group: usize, idx: usize) -> i64 {
        let off = group + self.w1 + self.wc + idx * self.w2;
        codec::decode_fixed(&self.data[off..], self.w2) as i64
    }

    #[inline]
    fn next_group(&self, group: usize) -> usize {
        group + self.w1 + self.wc + self.group_size(group) * self.w2
    }

    fn lo(&self, group: usize) -> usize {
        if group == self.first_group {
            self.idx_lo
        } else {
            0
        }
    }

    fn limit(&self, group: usize) -> usize {
        match self.idx_hi {
            | Some(hi) if group == self.first_group => hi,
            | _ => self.group_size(group),
        }
    }

    fn normalize(&self, mut c: Cursor) -> Cursor {
        while c.group < self.end_group && c.idx >= self.limit(c.group) {
            c = Cursor {
                group: self.next_group(c.group),
                idx: 0,
            };
        }
        c
    }

    fn lower_bound_v2(&self, group: usize, lo: usize, hi: usize, c2: i64) -> usize {
        let (mut lo, mut hi) = (lo, hi);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.v2_at(group, mid) < c2 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Restricts the iterator to the group `c1` (and value2 `c2` inside it).
    pub fn setup(&mut self, c1: Option<i64>, c2: Option<i64>) {
        self.c1 = c1;
        self.c2 = c2;
        self.card = None;
        self.idx_lo = 0;
        self.idx_hi = None;
        self.first_group = 0;
        self.end_group = self.data.len();
        if let Some(c1) = c1 {
            let mut g = 0;
            while g < self.data.len() && self.group_v1(g) < c1 {
                g = self.next_group(g);
            }
            if g < self.data.len() && self.group_v1(g) == c1 {
                self.first_group = g;
                self.end_group = self.next_group(g);
                if let Some(c2) = c2 {
                    let size = self.group_size(g);
                    self.idx_lo = self.lower_bound_v2(g, 0, size, c2);
                    let hi = if self.idx_lo < size && self.v2_at(g, self.idx_lo) == c2 {
                        self.idx_lo + 1
                    } else {
                        self.idx_lo
                    };
                    self.idx_hi = Some(hi);
                }
            } else {
                self.first_group = g;
                self.end_group = g;
            }
        }
        let start = self.normalize(Cursor {
            group: self.first_group,
            idx: self.idx_lo,
        });
        self.pos = start;
        self.cur = start;
    }

    pub fn n_groups(&self) -> usize {
        let mut g = 0;
        let mut n = 0;
        while g < self.data.len() {
            g = self.next_group(g);
            n += 1;
        }
        n
    }
}

impl PairItr for ClusterTable {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::Cluster
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
        Ok(self.cur.group < self.end_group)
    }

    fn next(&mut self) -> Result<()> {
        if self.cur.group >= self.end_group {
            return Err(TridentError::misuse("next on an exhausted cluster table"));
        }
        let c = self.cur;
        self.pos = c;
        self.v1 = self.group_v1(c.group);
        self.v2 = self.v2_at(c.group, c.idx);
        if self.ignore {
            self.count = (self.limit(c.group) - c.idx) as u64;
            self.cur = self.normalize(Cursor {
                group: self.next_group(c.group),
                idx: 0,
            });
        } else {
            self.count = 1;
            self.cur = self.normalize(Cursor {
                group: c.group,
                idx: c.idx + 1,
            });
        }
        Ok(())
    }

    fn cardinality(&mut self) -> Result<u64> {
        if let Some(c) = self.card {
            return Ok(c);
        }
        let mut n = 0u64;
        let mut g = self.first_group;
        while g < self.end_group {
            n += if self.ignore {
                1
            } else {
                (self.limit(g) - self.lo(g)) as u64
            };
            g = self.next_group(g);
        }
        self.card = Some(n);
        Ok(n)
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        if self.cur.group >= self.end_group {
            return Ok(1);
        }
        let remaining = if self.ignore {
            (self.end_group - self.cur.group) / (self.w1 + self.wc + self.w2)
        } else {
            (self.end_group - self.cur.group) / self.w2
        };
        Ok((remaining as u64).max(1))
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

impl Seekable for ClusterTable {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        let mut c = self.pos;
        if c.group >= self.end_group {
            self.cur = c;
            return Ok(());
        }
        while c.group < self.end_group && self.group_v1(c.group) < c1 {
            c = Cursor {
                group: self.next_group(c.group),
                idx: 0,
            };
        }
        if c.group < self.end_group && c.group != self.pos.group {
            c.idx = self.lo(c.group);
        }
        if c.group < self.end_group && self.group_v1(c.group) == c1 && !self.ignore {
            let hi = self.limit(c.group);
            c.idx = self.lower_bound_v2(c.group, c.idx, hi, c2);
        }
        self.cur = self.normalize(c);
        Ok(())
    }
}

impl Markable for ClusterTable {
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

impl ColumnIgnorable for ClusterTable {
    fn ignore_second_column(&mut self) -> Result<()> {
        if self.ignore {
            return Ok(());
        }
        self.ignore = true;
        self.card = None;
        if self.cur != self.pos {
            let g = self.pos.group;
            self.pos.idx = self.lo(g);
            self.v2 = self.v2_at(g, self.pos.idx);
            self.count = (self.limit(g) - self.pos.idx) as u64;
            self.cur = self.normalize(Cursor {
                group: self.next_group(g),
                idx: 0,
            });
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

    fn table(pairs: &[(u64, u64)]) -> ClusterTable {
        let strat = StorageStrat::cluster(1, 2, false).unwrap();
        let mut buf = BytesMut::new();
        let mut i = 0;
        while i < pairs.len() {
            let v1 = pairs[i].0;
            let group: Vec<u64> = pairs[i..].iter().take_while(|p| p.0 == v1).map(|p| p.1).collect();
            codec::put_fixed(&mut buf, 1, v1);
            codec::put_fixed(&mut buf, 1, group.len() as u64);
            for v2 in group.iter() {
                codec::put_fixed(&mut buf, 2, *v2);
            }
            i += group.len();
        }
        ClusterTable::new(Region::from_bytes(Bytes::from(buf.to_vec())), strat, 3).unwrap()
    }

    const PAIRS: [(u64, u64); 7] = [(1, 10), (1, 20), (1, 30), (5, 7), (6, 1), (6, 2), (6, 300)];

    #[test]
    fn test_full_scan() {
        let mut t = table(&PAIRS);
        assert_eq!(t.n_groups(), 3);
        assert_eq!(t.cardinality().unwrap(), 7);
        let got: Vec<_> = t.collect_tuples().unwrap().iter().map(|x| (x.1 as u64, x.2 as u64)).collect();
        assert_eq!(got, PAIRS.to_vec());
    }

    #[test]
    fn test_ignore_and_constraints() {
        let mut t = table(&PAIRS);
        PairItrExt::ignore_second_column(&mut t).unwrap();
        assert_eq!(t.cardinality().unwrap(), 3);
        let counts: Vec<_> = t.collect_tuples().unwrap().iter().map(|x| (x.1, x.3)).collect();
        assert_eq!(counts, vec![(1, 3), (5, 1), (6, 3)]);

        let mut t = table(&PAIRS);
        t.setup(Some(6), Some(2));
        assert_eq!(t.collect_tuples().unwrap(), vec![(3, 6, 2, 1)]);
        t.setup(Some(2), None);
        assert!(!t.has_next().unwrap());
        assert_eq!(t.cardinality().unwrap(), 0);
        t.setup(Some(1), None);
        assert_eq!(t.cardinality().unwrap(), 3);
    }

    #[test]
    fn test_moveto() {
        let mut t = table(&PAIRS);
        t.next().unwrap();
        PairItrExt::moveto(&mut t, 1, 25).unwrap();
        t.next().unwrap();
        assert_eq!((t.value1(), t.value2()), (1, 30));
        PairItrExt::moveto(&mut t, 1, 0).unwrap();
        t.next().unwrap();
        assert_eq!((t.value1(), t.value2()), (1, 30));
        PairItrExt::moveto(&mut t, 6, 2).unwrap();
        t.next().unwrap();
        assert_eq!((t.value1(), t.value2()), (6, 2));
        PairItrExt::moveto(&mut t, 6, 301).unwrap();
        assert!(!t.has_next().unwrap());
    }

    #[test]
    fn test_corrupt_group_is_rejected() {
        let strat = StorageStrat::cluster(1, 1, false).unwrap();
        let r = ClusterTable::new(Region::from_bytes(Bytes::from_static(&[1, 5, 1])), strat, 0);
        assert!(matches!(r, Err(TridentError::CorruptData(_))));
    }
}
