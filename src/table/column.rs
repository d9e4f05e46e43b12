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
    table::inserter::ColumnHeader,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Cursor {
    group: usize,
    // absolute index into the value2 block
    j: usize,
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

/// Reader over a column table: a header, one `(v1, count, offset)` entry per
/// group, then the value2 block.
#[derive(Clone)]
pub struct ColumnTable {
    data: Region,
    hdr: ColumnHeader,
    groups_at: usize,
    values_at: usize,
    g_lo: usize,
    g_hi: usize,
    j_lo: usize,
    j_hi: usize,
    pos: Cursor,
    cur: Cursor,
    v1: i64,
    v2: i64,
    count: u64,
    key: i64,
    c1: Option<i64>,
    c2: Option<i64>,
    ignore: bool,
    saved: Option<Saved>,
}

impl ColumnTable {
    pub fn new(data: Region, key: i64) -> Result<Self> {
        let (hdr, hdr_len) = ColumnHeader::read(&data)?;
        let entry = hdr.w1 + hdr.wc + hdr.wo;
        let values_at = hdr_len + hdr.ngroups as usize * entry;
        if values_at + hdr.nterms as usize * hdr.w2 != data.len() {
            return Err(TridentError::corrupt(format!(
                "column table of {} bytes does not match its header {:?}",
                data.len(),
                hdr
            )));
        }
        let mut t = Self {
            data,
            hdr,
            groups_at: hdr_len,
            values_at,
            g_lo: 0,
            g_hi: hdr.ngroups as usize,
            j_lo: 0,
            j_hi: hdr.nterms as usize,
            pos: Cursor { group: 0, j: 0 },
            cur: Cursor { group: 0, j: 0 },
            v1: -1,
            v2: -1,
            count: 0,
            key,
            c1: None,
            c2: None,
            ignore: false,
            saved: None,
        };
        t.setup(None, None);
        Ok(t)
    }

    #[inline]
    fn entry(&self, g: usize) -> usize {
        self.groups_at + g * (self.hdr.w1 + self.hdr.wc + self.hdr.wo)
    }

    #[inline]
    fn group_v1(&self, g: usize) -> i64 {
        codec::decode_fixed(&self.data[self.entry(g)..], self.hdr.w1) as i64
    }

    #[inline]
    fn group_count(&self, g: usize) -> usize {
        codec::decode_fixed(&self.data[self.entry(g) + self.hdr.w1..], self.hdr.wc) as usize
    }

    #[inline]
    fn group_offset(&self, g: usize) -> usize {
        codec::decode_fixed(
            &self.data[self.entry(g) + self.hdr.w1 + self.hdr.wc..],
            self.hdr.wo,
        ) as usize
    }

    #[inline]
    fn v2_at(&self, j: usize) -> i64 {
        codec::decode_fixed(&self.data[self.values_at + j * self.hdr.w2..], self.hdr.w2) as i64
    }

    // value2 indices of group g inside the constrained range
    fn span(&self, g: usize) -> (usize, usize) {
        let off = self.group_offset(g);
        let end = off + self.group_count(g);
        (off.max(self.j_lo), end.min(self.j_hi))
    }

    fn lower_bound_group(&self, lo: usize, hi: usize, c1: i64) -> usize {
        let (mut lo, mut hi) = (lo, hi);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.group_v1(mid) < c1 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn lower_bound_v2(&self, lo: usize, hi: usize, c2: i64) -> usize {
        let (mut lo, mut hi) = (lo, hi);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.v2_at(mid) < c2 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn cursor_at_group(&self, g: usize) -> Cursor {
        if g >= self.g_hi {
            return Cursor { group: self.g_hi, j: self.j_hi };
        }
        Cursor {
            group: g,
            j: self.span(g).0,
        }
    }

    /// Restricts the iterator to group `c1` (and value2 `c2` inside it).
    pub fn setup(&mut self, c1: Option<i64>, c2: Option<i64>) {
        self.c1 = c1;
        self.c2 = c2;
        let ngroups = self.hdr.ngroups as usize;
        self.g_lo = 0;
        self.g_hi = ngroups;
        self.j_lo = 0;
        self.j_hi = self.hdr.nterms as usize;
        if let Some(c1) = c1 {
            let g = self.lower_bound_group(0, ngroups, c1);
            if g < ngroups && self.group_v1(g) == c1 {
                let off = self.group_offset(g);
                let end = off + self.group_count(g);
                self.g_lo = g;
                self.g_hi = g + 1;
                self.j_lo = off;
                self.j_hi = end;
                if let Some(c2) = c2 {
                    let lo = self.lower_bound_v2(off, end, c2);
                    let hi = if lo < end && self.v2_at(lo) == c2 { lo + 1 } else { lo };
                    self.j_lo = lo;
                    self.j_hi = hi;
                    if lo == hi {
                        self.g_hi = g;
                    }
                }
            } else {
                self.g_lo = g;
                self.g_hi = g;
            }
        }
        let start = self.cursor_at_group(self.g_lo);
        self.pos = start;
        self.cur = start;
    }

    fn remaining_values(&self) -> usize {
        self.j_hi.saturating_sub(self.cur.j)
    }
}

impl PairItr for ColumnTable {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::Column
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
        Ok(self.cur.group < self.g_hi)
    }

    fn next(&mut self) -> Result<()> {
        if self.cur.group >= self.g_hi {
            return Err(TridentError::misuse("next on an exhausted column table"));
        }
        let c = self.cur;
        self.pos = c;
        self.v1 = self.group_v1(c.group);
        self.v2 = self.v2_at(c.j);
        let (_, end) = self.span(c.group);
        if self.ignore {
            self.count = (end - c.j) as u64;
            self.cur = self.cursor_at_group(c.group + 1);
        } else {
            self.count = 1;
            self.cur = if c.j + 1 < end {
                Cursor {
                    group: c.group,
                    j: c.j + 1,
                }
            } else {
                self.cursor_at_group(c.group + 1)
            };
        }
        Ok(())
    }

    fn cardinality(&mut self) -> Result<u64> {
        if self.ignore {
            Ok((self.g_hi - self.g_lo) as u64)
        } else if self.g_hi == self.g_lo {
            Ok(0)
        } else {
            Ok((self.j_hi - self.j_lo) as u64)
        }
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        let remaining = if self.ignore {
            self.g_hi.saturating_sub(self.cur.group)
        } else {
            self.remaining_values()
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

impl Seekable for ColumnTable {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        let from = self.pos;
        if from.group >= self.g_hi {
            self.cur = from;
            return Ok(());
        }
        let g = self.lower_bound_group(from.group, self.g_hi, c1);
        if g >= self.g_hi {
            self.cur = self.cursor_at_group(g);
            return Ok(());
        }
        let mut c = if g == from.group {
            from
        } else {
            self.cursor_at_group(g)
        };
        if self.group_v1(g) == c1 && !self.ignore {
            let (_, end) = self.span(g);
            c.j = self.lower_bound_v2(c.j, end, c2);
            if c.j >= end {
                c = self.cursor_at_group(g + 1);
            }
        }
        self.cur = c;
        Ok(())
    }
}

impl Markable for ColumnTable {
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

impl ColumnIgnorable for ColumnTable {
    fn ignore_second_column(&mut self) -> Result<()> {
        if self.ignore {
            return Ok(());
        }
        self.ignore = true;
        if self.cur != self.pos {
            let g = self.pos.group;
            let (lo, end) = self.span(g);
            self.pos.j = lo;
            self.v2 = self.v2_at(lo);
            self.count = (end - lo) as u64;
            self.cur = self.cursor_at_group(g + 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        fs::manager::{
            FileLimits,
            FileManager,
        },
        itr::PairItrExt,
        table::inserter::{
            ColumnInserter,
            TableInserter,
        },
    };

    fn table(pairs: &[(u64, u64)]) -> ColumnTable {
        let dir = tempdir().unwrap();
        let fm = FileManager::open(
            dir.path(),
            false,
            FileLimits {
                max_files: 2,
                max_open: 2,
                max_sessions: 2,
                cache_max_bytes: usize::MAX,
            },
        )
        .unwrap();
        fm.create_new_file().unwrap();
        let mut ins = ColumnInserter::new(1 << 20, dir.path().to_path_buf());
        for (a, b) in pairs {
            ins.append_pair(&fm, *a, *b).unwrap();
        }
        ins.stop(&fm).unwrap();
        let region = fm.read_all(0, None).unwrap();
        ColumnTable::new(region, 11).unwrap()
    }

    const PAIRS: [(u64, u64); 6] = [(2, 4), (2, 8), (3, 1), (9, 100_000), (9, 100_001), (9, 100_005)];

    #[test]
    fn test_scan_and_ignore() {
        let mut t = table(&PAIRS);
        assert_eq!(t.cardinality().unwrap(), 6);
        let got: Vec<_> = t.collect_tuples().unwrap().iter().map(|x| (x.1 as u64, x.2 as u64)).collect();
        assert_eq!(got, PAIRS.to_vec());

        let mut t = table(&PAIRS);
        PairItrExt::ignore_second_column(&mut t).unwrap();
        assert_eq!(t.cardinality().unwrap(), 3);
        let got: Vec<_> = t.collect_tuples().unwrap().iter().map(|x| (x.1, x.2, x.3)).collect();
        assert_eq!(got, vec![(2, 4, 2), (3, 1, 1), (9, 100_000, 3)]);
    }

    #[test]
    fn test_setup_and_moveto() {
        let mut t = table(&PAIRS);
        t.setup(Some(9), Some(100_001));
        assert_eq!(t.cardinality().unwrap(), 1);
        assert_eq!(t.collect_tuples().unwrap(), vec![(11, 9, 100_001, 1)]);
        t.setup(Some(9), Some(5));
        assert_eq!(t.cardinality().unwrap(), 0);
        assert!(!t.has_next().unwrap());

        t.setup(None, None);
        t.next().unwrap();
        PairItrExt::moveto(&mut t, 2, 5).unwrap();
        t.next().unwrap();
        assert_eq!((t.value1(), t.value2()), (2, 8));
        PairItrExt::moveto(&mut t, 2, 0).unwrap();
        t.next().unwrap();
        assert_eq!((t.value1(), t.value2()), (2, 8));
        PairItrExt::moveto(&mut t, 9, 100_002).unwrap();
        t.next().unwrap();
        assert_eq!((t.value1(), t.value2()), (9, 100_005));
        assert!(!t.has_next().unwrap());
    }

    proptest! {
        #[test]
        fn test_seek_is_monotonic(
            pairs in proptest::collection::btree_set((0u64..40, 0u64..40), 1..120),
            targets in proptest::collection::vec((0i64..45, 0i64..45), 1..20),
        ) {
            let pairs: Vec<_> = pairs.into_iter().collect();
            let mut t = table(&pairs);
            let mut targets = targets;
            targets.sort();
            let mut last = (i64::MIN, i64::MIN);
            t.next().unwrap();
            for (c1, c2) in targets {
                PairItrExt::moveto(&mut t, c1, c2).unwrap();
                if !t.has_next().unwrap() {
                    break;
                }
                t.next().unwrap();
                let now = (t.value1(), t.value2());
                prop_assert!(now >= last);
                let expected = pairs
                    .iter()
                    .map(|(a, b)| (*a as i64, *b as i64))
                    .find(|p| *p >= (c1, c2))
                    .unwrap_or(now);
                prop_assert!(now <= expected.max(last));
                last = now;
            }
        }
    }
}
