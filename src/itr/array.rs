// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::sync::Arc;

use crate::{
    errs::{
        Result,
        TridentError,
    },
    itr::{
        constraint_accessors,
        ColumnIgnorable,
        ItrKind,
        Markable,
        PairItr,
        Seekable,
    },
};

/// Iterates an in-memory sorted vector of pairs. Used for reversed tables
/// and for small materialized results.
#[derive(Clone)]
pub struct ArrayItr {
    pairs: Arc<Vec<(i64, i64)>>,
    start: usize,
    end: usize,
    pos: usize,
    cur: usize,
    v1: i64,
    v2: i64,
    count: u64,
    key: i64,
    c1: Option<i64>,
    c2: Option<i64>,
    ignore: bool,
    saved: Option<(usize, usize, i64, i64, u64, bool)>,
}

impl ArrayItr {
    /// `pairs` must be sorted ascending.
    pub fn new(pairs: Arc<Vec<(i64, i64)>>, key: i64) -> Self {
        let end = pairs.len();
        ArrayItr {
            pairs,
            start: 0,
            end,
            pos: 0,
            cur: 0,
            v1: -1,
            v2: -1,
            count: 0,
            key,
            c1: None,
            c2: None,
            ignore: false,
            saved: None,
        }
    }

    /// Sorts `pairs` before wrapping them.
    pub fn from_unsorted(mut pairs: Vec<(i64, i64)>, key: i64) -> Self {
        pairs.sort_unstable();
        Self::new(Arc::new(pairs), key)
    }

    fn lower_bound(&self, lo: usize, target: (i64, i64), ignore_second: bool) -> usize {
        let slice = &self.pairs[lo..self.end];
        lo + slice.partition_point(|p| {
            if ignore_second {
                p.0 < target.0
            } else {
                *p < target
            }
        })
    }

    fn group_end(&self, row: usize) -> usize {
        let v1 = self.pairs[row].0;
        row + self.pairs[row..self.end].partition_point(|p| p.0 == v1)
    }

    /// Restricts the iterator to pairs matching the constraints and rewinds.
    pub fn setup(&mut self, c1: Option<i64>, c2: Option<i64>) {
        self.c1 = c1;
        self.c2 = c2;
        let all = self.pairs.as_slice();
        let (start, end) = match (c1, c2) {
            | (Some(c1), Some(c2)) => (
                all.partition_point(|p| *p < (c1, c2)),
                all.partition_point(|p| *p <= (c1, c2)),
            ),
            | (Some(c1), None) => (
                all.partition_point(|p| p.0 < c1),
                all.partition_point(|p| p.0 <= c1),
            ),
            | _ => (0, all.len()),
        };
        self.start = start;
        self.end = end;
        self.pos = start;
        self.cur = start;
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl PairItr for ArrayItr {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::Array
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
            return Err(TridentError::misuse("next on an exhausted array iterator"));
        }
        self.pos = self.cur;
        let (v1, v2) = self.pairs[self.cur];
        self.v1 = v1;
        self.v2 = v2;
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
        let mut groups = 0;
        let mut row = self.start;
        while row < self.end {
            row = self.group_end(row);
            groups += 1;
        }
        Ok(groups)
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        Ok((self.end - self.start) as u64)
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

impl Seekable for ArrayItr {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        let from = self.pos.max(self.start);
        self.cur = self.lower_bound(from, (c1, c2), self.ignore);
        Ok(())
    }
}

impl Markable for ArrayItr {
    fn mark(&mut self) -> Result<()> {
        self.saved = Some((self.pos, self.cur, self.v1, self.v2, self.count, self.ignore));
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let (pos, cur, v1, v2, count, ignore) = self
            .saved
            .ok_or_else(|| TridentError::misuse("reset without a mark"))?;
        self.pos = pos;
        self.cur = cur;
        self.v1 = v1;
        self.v2 = v2;
        self.count = count;
        self.ignore = ignore;
        Ok(())
    }
}

impl ColumnIgnorable for ArrayItr {
    fn ignore_second_column(&mut self) -> Result<()> {
        if self.ignore {
            return Ok(());
        }
        self.ignore = true;
        if self.cur > self.pos && self.pos < self.end {
            // fold the rest of the current group into the tuple just read
            let end = self.group_end(self.pos);
            self.count = (end - self.pos) as u64;
            self.cur = end;
        }
        Ok(())
    }
}

/// An iterator with nothing in it.
#[derive(Clone, Debug, Default)]
pub struct EmptyItr {
    key: i64,
    c1: Option<i64>,
    c2: Option<i64>,
}

impl EmptyItr {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PairItr for EmptyItr {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::Empty
    }

    fn value1(&self) -> i64 {
        -1
    }

    fn value2(&self) -> i64 {
        -1
    }

    fn count(&mut self) -> Result<u64> {
        Ok(0)
    }

    fn has_next(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn next(&mut self) -> Result<()> {
        Err(TridentError::misuse("next on an empty iterator"))
    }

    fn cardinality(&mut self) -> Result<u64> {
        Ok(0)
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        Ok(0)
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

impl Seekable for EmptyItr {
    fn moveto(&mut self, _c1: i64, _c2: i64) -> Result<()> {
        Ok(())
    }
}

impl Markable for EmptyItr {
    fn mark(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

impl ColumnIgnorable for EmptyItr {
    fn ignore_second_column(&mut self) -> Result<()> {
        Ok(())
    }
}
