// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Iterators over differential indices.

use std::sync::Arc;

use crate::{
    errs::{
        Result,
        TridentError,
    },
    itr::{
        constraint_accessors,
        ArrayItr,
        ColumnIgnorable,
        ItrKind,
        KeySeekable,
        Markable,
        PairItr,
        Seekable,
        TableItr,
    },
    kb::catalog::Catalog,
    perm::Permutation,
    tree::TermCoordinates,
};

/// Iterates the triples of a single-pattern update: two components are
/// fixed and the third takes every value of a sorted list. Because only one
/// column varies, tuples come out in permutation order by walking the list.
#[derive(Clone)]
pub struct Diff1Itr {
    // fixed columns in permutation order; the varying one is ignored
    cols: [i64; 3],
    free: usize,
    values: Arc<Vec<i64>>,
    start: usize,
    end: usize,
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

impl Diff1Itr {
    /// `spo` holds the fixed components with `free_spo` naming the component
    /// (0 subject, 1 predicate, 2 object) taken from `values`. `key`, `c1`
    /// and `c2` constrain the three columns of `perm`.
    pub fn new(
        perm: Permutation,
        spo: [i64; 3],
        free_spo: usize,
        values: Arc<Vec<i64>>,
        key: Option<i64>,
        c1: Option<i64>,
        c2: Option<i64>,
    ) -> Result<Self> {
        if free_spo > 2 {
            return Err(TridentError::misuse(format!("no triple component {free_spo}")));
        }
        let cols = perm.permute(spo);
        let free = perm.order()[free_spo];
        let (mut start, mut end) = (0, values.len());
        for (slot, c) in [key, c1, c2].into_iter().enumerate() {
            let Some(c) = c else {
                continue;
            };
            if slot == free {
                let lo = start + values[start..end].partition_point(|v| *v < c);
                let hi = lo + values[lo..end].partition_point(|v| *v == c);
                (start, end) = (lo, hi);
            } else if cols[slot] != c {
                end = start;
            }
        }
        Ok(Diff1Itr {
            cols,
            free,
            values,
            start,
            end,
            pos: start,
            cur: start,
            key: key.unwrap_or(-1),
            v1: -1,
            v2: -1,
            count: 0,
            c1,
            c2,
            ignore: false,
            saved: None,
        })
    }

    fn tuple_at(&self, i: usize) -> [i64; 3] {
        let mut t = self.cols;
        t[self.free] = self.values[i];
        t
    }

    /// First index from `from` whose tuple is not below `target`, compared on
    /// the first `width` columns.
    fn lower_bound(&self, from: usize, target: [i64; 3], width: usize) -> usize {
        from + self.values[from..self.end].partition_point(|v| {
            let mut t = self.cols;
            t[self.free] = *v;
            t[..width] < target[..width]
        })
    }

    fn groups_folded(&self) -> bool {
        self.ignore && self.free == 2
    }
}

impl PairItr for Diff1Itr {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::Diff1
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
            return Err(TridentError::misuse("next on an exhausted update iterator"));
        }
        self.pos = self.cur;
        [self.key, self.v1, self.v2] = self.tuple_at(self.cur);
        if self.groups_folded() {
            self.count = (self.end - self.cur) as u64;
            self.cur = self.end;
        } else {
            self.count = 1;
            self.cur += 1;
        }
        Ok(())
    }

    fn cardinality(&mut self) -> Result<u64> {
        let n = (self.end - self.start) as u64;
        Ok(if self.groups_folded() { n.min(1) } else { n })
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        self.cardinality()
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

impl Seekable for Diff1Itr {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        let width = if self.ignore { 2 } else { 3 };
        self.cur = self.lower_bound(self.pos.max(self.start), [self.key, c1, c2], width);
        Ok(())
    }
}

impl KeySeekable for Diff1Itr {
    fn goto_key(&mut self, key: i64) -> Result<()> {
        self.cur = self.lower_bound(self.pos.max(self.start), [key, 0, 0], 1);
        Ok(())
    }
}

impl Markable for Diff1Itr {
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

impl ColumnIgnorable for Diff1Itr {
    fn ignore_second_column(&mut self) -> Result<()> {
        if self.ignore {
            return Ok(());
        }
        self.ignore = true;
        if self.free == 2 && self.cur > self.pos {
            self.count = (self.end - self.pos) as u64;
            self.cur = self.end;
        }
        Ok(())
    }
}

#[derive(Clone)]
enum TermSource {
    Tree {
        tree: Arc<crate::tree::Tree<u64, TermCoordinates>>,
        perm: Permutation,
        // smallest key not yet looked at
        from: u64,
        ahead: Option<(u64, u64)>,
    },
    Keys {
        keys: Arc<Vec<i64>>,
        next: usize,
    },
    Single {
        key: i64,
        n: u64,
        done: bool,
    },
}

/// Term list of a differential index: read from its coordinates tree, from
/// a sorted key list, or a single key.
#[derive(Clone)]
pub struct DiffTermItr {
    source: TermSource,
    key: i64,
    count: u64,
    size: u64,
    c1: Option<i64>,
    c2: Option<i64>,
}

impl DiffTermItr {
    /// Keys of `perm` in `tree`, counted from the permutation or its reverse.
    pub fn from_tree(tree: Arc<crate::tree::Tree<u64, TermCoordinates>>, perm: Permutation, size: u64) -> Self {
        Self::with_source(
            TermSource::Tree {
                tree,
                perm,
                from: 0,
                ahead: None,
            },
            size,
        )
    }

    /// Every key of a sorted list, each with count one.
    pub fn from_keys(keys: Arc<Vec<i64>>) -> Self {
        let size = keys.len() as u64;
        Self::with_source(TermSource::Keys { keys, next: 0 }, size)
    }

    pub fn single(key: i64, n: u64) -> Self {
        Self::with_source(
            TermSource::Single {
                key,
                n,
                done: false,
            },
            1,
        )
    }

    fn with_source(source: TermSource, size: u64) -> Self {
        DiffTermItr {
            source,
            key: -1,
            count: 0,
            size,
            c1: None,
            c2: None,
        }
    }

    fn fill(&mut self) -> Result<bool> {
        match &mut self.source {
            | TermSource::Tree {
                tree,
                perm,
                from,
                ahead,
            } => {
                if ahead.is_some() {
                    return Ok(true);
                }
                for entry in tree.iter_from(Some(&*from))? {
                    let (k, coords) = entry?;
                    *from = k.saturating_add(1);
                    let n = if coords.exists(*perm) {
                        coords.n_elements(*perm)
                    } else {
                        coords.n_elements(perm.reverse())
                    };
                    if n > 0 {
                        *ahead = Some((k, n));
                        return Ok(true);
                    }
                }
                Ok(false)
            },
            | TermSource::Keys { keys, next } => Ok(*next < keys.len()),
            | TermSource::Single { done, .. } => Ok(!*done),
        }
    }
}

impl PairItr for DiffTermItr {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::DiffTerm
    }

    fn value1(&self) -> i64 {
        -1
    }

    fn value2(&self) -> i64 {
        -1
    }

    fn count(&mut self) -> Result<u64> {
        Ok(self.count)
    }

    fn has_next(&mut self) -> Result<bool> {
        self.fill()
    }

    fn next(&mut self) -> Result<()> {
        if !self.fill()? {
            return Err(TridentError::misuse("next on an exhausted term list"));
        }
        let (key, count) = match &mut self.source {
            | TermSource::Tree { ahead, .. } => {
                let (k, n) = ahead
                    .take()
                    .ok_or_else(|| TridentError::corrupt("term list lost its next key"))?;
                (k as i64, n)
            },
            | TermSource::Keys { keys, next } => {
                *next += 1;
                (keys[*next - 1], 1)
            },
            | TermSource::Single { key, n, done } => {
                *done = true;
                (*key, *n)
            },
        };
        self.key = key;
        self.count = count;
        Ok(())
    }

    fn cardinality(&mut self) -> Result<u64> {
        Ok(self.size)
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        Ok(self.size)
    }

    fn is_second_column_ignored(&self) -> bool {
        true
    }

    fn as_key_seekable(&mut self) -> Option<&mut dyn KeySeekable> {
        Some(self)
    }
}

impl KeySeekable for DiffTermItr {
    fn goto_key(&mut self, key: i64) -> Result<()> {
        let key = key.max(0);
        match &mut self.source {
            | TermSource::Tree { from, ahead, .. } => {
                if ahead.is_some_and(|(k, _)| k as i64 >= key) {
                    return Ok(());
                }
                *ahead = None;
                *from = (*from).max(key as u64);
            },
            | TermSource::Keys { keys, next } => {
                *next += keys[*next..].partition_point(|k| *k < key);
            },
            | TermSource::Single { key: k, done, .. } => {
                if *k < key {
                    *done = true;
                }
            },
        }
        Ok(())
    }
}

#[derive(Clone)]
enum DiffCursor {
    Table(TableItr),
    Reversed(ArrayItr),
}

macro_rules! on_cursor {
    ($c:expr, $t:ident => $e:expr) => {
        match &mut *$c {
            | DiffCursor::Table($t) => $e,
            | DiffCursor::Reversed($t) => $e,
        }
    };
}

/// Scans one permutation of a differential index by walking the keys of its
/// coordinates tree and opening each table in turn.
#[derive(Clone)]
pub struct DiffScanItr {
    catalog: Arc<Catalog>,
    perm: Permutation,
    from: u64,
    cursor: Option<DiffCursor>,
    cursor_key: i64,
    key: i64,
    v1: i64,
    v2: i64,
    count: u64,
    c1: Option<i64>,
    c2: Option<i64>,
    ignore: bool,
    saved: Option<Box<DiffScanItr>>,
}

impl DiffScanItr {
    pub fn new(catalog: Arc<Catalog>, perm: Permutation) -> Self {
        DiffScanItr {
            catalog,
            perm,
            from: 0,
            cursor: None,
            cursor_key: -1,
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

    fn open(&self, key: i64, coords: &TermCoordinates) -> Result<Option<DiffCursor>> {
        if let (Some(c), true) = (coords.get(self.perm), self.catalog.has(self.perm)) {
            return Ok(Some(DiffCursor::Table(self.catalog.open_table(
                self.perm, key, &c, None, None, None,
            )?)));
        }
        let rev = self.perm.reverse();
        if let (Some(c), true) = (coords.get(rev), self.catalog.has(rev)) {
            let mut table = self.catalog.open_table(rev, key, &c, None, None, None)?;
            return Ok(Some(DiffCursor::Reversed(Catalog::reversed(
                &mut table, key, None, None,
            )?)));
        }
        Ok(None)
    }

    fn next_cursor(&mut self) -> Result<bool> {
        loop {
            let entry = self.catalog.tree().iter_from(Some(&self.from))?.next();
            let (k, coords) = match entry {
                | Some(e) => e?,
                | None => return Ok(false),
            };
            self.from = k.saturating_add(1);
            if let Some(mut cursor) = self.open(k as i64, &coords)? {
                if self.ignore {
                    on_cursor!(&mut cursor, t => ColumnIgnorable::ignore_second_column(t))?;
                }
                self.cursor = Some(cursor);
                self.cursor_key = k as i64;
                return Ok(true);
            }
        }
    }

    fn fill(&mut self) -> Result<bool> {
        loop {
            if let Some(c) = self.cursor.as_mut() {
                if on_cursor!(c, t => t.has_next())? {
                    return Ok(true);
                }
            }
            if !self.next_cursor()? {
                self.cursor = None;
                return Ok(false);
            }
        }
    }
}

impl PairItr for DiffScanItr {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::DiffScan
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
        self.fill()
    }

    fn next(&mut self) -> Result<()> {
        if !self.fill()? {
            return Err(TridentError::misuse("next on an exhausted update scan"));
        }
        let c = self
            .cursor
            .as_mut()
            .ok_or_else(|| TridentError::corrupt("update scan cursor vanished"))?;
        on_cursor!(c, t => t.next())?;
        self.v1 = on_cursor!(c, t => t.value1());
        self.v2 = on_cursor!(c, t => t.value2());
        self.count = on_cursor!(c, t => t.count())?;
        self.key = self.cursor_key;
        Ok(())
    }

    fn cardinality(&mut self) -> Result<u64> {
        Ok(if self.ignore {
            self.catalog.n_first_terms(self.perm)
        } else {
            self.catalog.n_triples()
        })
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        self.cardinality()
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

impl Seekable for DiffScanItr {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        match self.cursor.as_mut() {
            | Some(c) => on_cursor!(c, t => Seekable::moveto(t, c1, c2)),
            | None => Ok(()),
        }
    }
}

impl KeySeekable for DiffScanItr {
    fn goto_key(&mut self, key: i64) -> Result<()> {
        if self.cursor.is_some() && key <= self.cursor_key {
            return Ok(());
        }
        self.cursor = None;
        self.from = self.from.max(key.max(0) as u64);
        Ok(())
    }
}

impl Markable for DiffScanItr {
    fn mark(&mut self) -> Result<()> {
        let mut snap = self.clone();
        snap.saved = None;
        self.saved = Some(Box::new(snap));
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let snap = self
            .saved
            .take()
            .ok_or_else(|| TridentError::misuse("reset without a mark"))?;
        *self = (*snap).clone();
        self.saved = Some(snap);
        Ok(())
    }
}

impl ColumnIgnorable for DiffScanItr {
    fn ignore_second_column(&mut self) -> Result<()> {
        if self.ignore {
            return Ok(());
        }
        self.ignore = true;
        if let Some(c) = self.cursor.as_mut() {
            on_cursor!(c, t => ColumnIgnorable::ignore_second_column(t))?;
            if self.cursor_key == self.key {
                self.count = on_cursor!(c, t => t.count())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itr::PairItrExt;

    fn values() -> Arc<Vec<i64>> {
        Arc::new(vec![2, 5, 8])
    }

    #[test]
    fn test_diff1_varying_object() {
        // (7, 3, ?o) for o in {2, 5, 8}
        let spo = [7, 3, -1];
        let mut itr = Diff1Itr::new(Permutation::Spo, spo, 2, values(), Some(7), None, None).unwrap();
        let got = itr.collect_tuples().unwrap();
        assert_eq!(got, vec![(7, 3, 2, 1), (7, 3, 5, 1), (7, 3, 8, 1)]);

        let mut itr = Diff1Itr::new(Permutation::Ops, spo, 2, values(), None, None, None).unwrap();
        let got: Vec<_> = itr.collect_tuples().unwrap().into_iter().map(|t| t.0).collect();
        assert_eq!(got, vec![2, 5, 8]);

        let mut itr = Diff1Itr::new(Permutation::Ops, spo, 2, values(), Some(5), None, None).unwrap();
        assert_eq!(itr.collect_tuples().unwrap(), vec![(5, 3, 7, 1)]);

        let mut itr = Diff1Itr::new(Permutation::Spo, spo, 2, values(), Some(6), None, None).unwrap();
        assert!(!itr.has_next().unwrap());
    }

    #[test]
    fn test_diff1_ignore_and_seek() {
        let spo = [7, 3, -1];
        let mut itr = Diff1Itr::new(Permutation::Spo, spo, 2, values(), Some(7), Some(3), None).unwrap();
        PairItrExt::ignore_second_column(&mut itr).unwrap();
        assert_eq!(itr.cardinality().unwrap(), 1);
        assert_eq!(itr.collect_tuples().unwrap(), vec![(7, 3, 2, 3)]);

        let mut itr = Diff1Itr::new(Permutation::Spo, spo, 2, values(), Some(7), None, None).unwrap();
        PairItrExt::moveto(&mut itr, 3, 4).unwrap();
        itr.next().unwrap();
        assert_eq!(itr.value2(), 5);
        PairItrExt::mark(&mut itr).unwrap();
        itr.next().unwrap();
        PairItrExt::reset(&mut itr).unwrap();
        itr.next().unwrap();
        assert_eq!(itr.value2(), 8);
    }

    #[test]
    fn test_term_sources() {
        let mut keys = DiffTermItr::from_keys(Arc::new(vec![1, 4, 9]));
        PairItrExt::goto_key(&mut keys, 3).unwrap();
        assert_eq!(keys.collect_tuples().unwrap(), vec![(4, -1, -1, 1), (9, -1, -1, 1)]);

        let mut single = DiffTermItr::single(6, 3);
        assert_eq!(single.collect_tuples().unwrap(), vec![(6, -1, -1, 3)]);
        let mut single = DiffTermItr::single(6, 3);
        PairItrExt::goto_key(&mut single, 7).unwrap();
        assert!(!single.has_next().unwrap());
    }
}
