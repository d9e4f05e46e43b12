// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::cmp::Ordering;

use crate::{
    errs::{
        Result,
        TridentError,
    },
    itr::{
        BoxedItr,
        ColumnIgnorable,
        ItrKind,
        Markable,
        PairItr,
        PairItrExt,
        Seekable,
    },
};

/// A child iterator with at most one tuple read ahead.
pub(crate) struct Child {
    pub(crate) itr: BoxedItr,
    /// The child's current tuple has been read ahead and not yet consumed.
    pub(crate) head: bool,
    /// The child's current tuple is the one its parent reported last.
    pub(crate) current: bool,
}

impl Child {
    pub(crate) fn new(itr: BoxedItr) -> Self {
        Child {
            itr,
            head: false,
            current: false,
        }
    }

    pub(crate) fn fill(&mut self) -> Result<bool> {
        if self.head {
            return Ok(true);
        }
        if self.itr.has_next()? {
            self.itr.next()?;
            self.head = true;
            self.current = false;
        }
        Ok(self.head)
    }

    pub(crate) fn tuple(&self) -> (i64, i64, i64) {
        (self.itr.key(), self.itr.value1(), self.itr.value2())
    }

    pub(crate) fn take(&mut self) {
        self.head = false;
        self.current = true;
    }

    pub(crate) fn drop_head(&mut self) {
        self.head = false;
        self.current = false;
    }
}

pub(crate) fn cmp_tuple(a: (i64, i64, i64), b: (i64, i64, i64), ignore_second: bool) -> Ordering {
    if ignore_second {
        (a.0, a.1).cmp(&(b.0, b.1))
    } else {
        a.cmp(&b)
    }
}

#[derive(Clone)]
struct MergeMark {
    flags: Vec<(bool, bool)>,
    key: i64,
    v1: i64,
    v2: i64,
    count: u64,
    started: bool,
    replay: bool,
}

/// Ordered merge of children on (key, value1, value2). Tuples present in
/// several children are reported once per child; with the second column
/// ignored, equal (key, value1) groups are folded and their counts summed.
pub(crate) struct Merger {
    pub(crate) children: Vec<Child>,
    ignore: bool,
    replay: bool,
    started: bool,
    key: i64,
    v1: i64,
    v2: i64,
    count: u64,
    saved: Option<MergeMark>,
}

impl Merger {
    pub(crate) fn new(children: Vec<BoxedItr>) -> Self {
        Merger {
            children: children.into_iter().map(Child::new).collect(),
            ignore: false,
            replay: false,
            started: false,
            key: -1,
            v1: -1,
            v2: -1,
            count: 0,
            saved: None,
        }
    }

    fn min_head(&mut self) -> Result<Option<(i64, i64, i64)>> {
        let mut best: Option<(i64, i64, i64)> = None;
        for child in self.children.iter_mut() {
            if child.fill()? {
                let t = child.tuple();
                if best.map_or(true, |b| cmp_tuple(t, b, self.ignore) == Ordering::Less) {
                    best = Some(t);
                }
            }
        }
        Ok(best)
    }

    pub(crate) fn has_next(&mut self) -> Result<bool> {
        if self.replay {
            return Ok(true);
        }
        Ok(self.min_head()?.is_some())
    }

    pub(crate) fn next(&mut self) -> Result<()> {
        if self.replay {
            self.replay = false;
            return Ok(());
        }
        let best = self
            .min_head()?
            .ok_or_else(|| TridentError::misuse("next on an exhausted merge"))?;
        for child in self.children.iter_mut() {
            child.current = false;
        }
        let mut count = 0;
        for child in self.children.iter_mut() {
            if child.head && cmp_tuple(child.tuple(), best, self.ignore) == Ordering::Equal {
                count += child.itr.count()?;
                child.take();
                if !self.ignore {
                    break;
                }
            }
        }
        (self.key, self.v1, self.v2) = best;
        self.count = count;
        self.started = true;
        Ok(())
    }

    fn behind(&self, target: (i64, i64, i64)) -> bool {
        self.started && cmp_tuple(target, (self.key, self.v1, self.v2), self.ignore) != Ordering::Greater
    }

    pub(crate) fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        let key = if self.started {
            self.key
        } else {
            match self.min_head()? {
                | Some((k, ..)) => k,
                | None => return Ok(()),
            }
        };
        let target = (key, c1, c2);
        if self.behind(target) {
            self.replay = true;
            return Ok(());
        }
        self.replay = false;
        for child in self.children.iter_mut() {
            if child.head && cmp_tuple(child.tuple(), target, self.ignore) != Ordering::Less {
                continue;
            }
            child.drop_head();
            child.itr.moveto(c1, c2)?;
        }
        Ok(())
    }

    pub(crate) fn goto_key(&mut self, key: i64) -> Result<()> {
        if self.started && key <= self.key {
            return Ok(());
        }
        self.replay = false;
        for child in self.children.iter_mut() {
            if child.head && child.itr.key() >= key {
                continue;
            }
            child.drop_head();
            child.itr.goto_key(key)?;
        }
        Ok(())
    }

    pub(crate) fn ignore_second_column(&mut self) -> Result<()> {
        if self.ignore {
            return Ok(());
        }
        self.ignore = true;
        self.replay = false;
        let mut folded = 0;
        for child in self.children.iter_mut() {
            child.itr.ignore_second_column()?;
            if !self.started {
                continue;
            }
            let (k, v1, _) = child.tuple();
            let same_group = (k, v1) == (self.key, self.v1);
            if child.current {
                folded += child.itr.count()?;
            } else if child.head && same_group {
                folded += child.itr.count()?;
                child.take();
            }
        }
        if self.started {
            self.count = folded;
        }
        Ok(())
    }

    pub(crate) fn is_second_column_ignored(&self) -> bool {
        self.ignore
    }

    pub(crate) fn mark(&mut self) -> Result<()> {
        for child in self.children.iter_mut() {
            child.itr.mark()?;
        }
        self.saved = Some(MergeMark {
            flags: self.children.iter().map(|c| (c.head, c.current)).collect(),
            key: self.key,
            v1: self.v1,
            v2: self.v2,
            count: self.count,
            started: self.started,
            replay: self.replay,
        });
        Ok(())
    }

    pub(crate) fn reset(&mut self) -> Result<()> {
        let saved = self
            .saved
            .clone()
            .ok_or_else(|| TridentError::misuse("reset without a mark"))?;
        for (child, (head, current)) in self.children.iter_mut().zip(saved.flags) {
            child.itr.reset()?;
            child.head = head;
            child.current = current;
        }
        self.key = saved.key;
        self.v1 = saved.v1;
        self.v2 = saved.v2;
        self.count = saved.count;
        self.started = saved.started;
        self.replay = saved.replay;
        Ok(())
    }

    pub(crate) fn key(&self) -> i64 {
        self.key
    }

    pub(crate) fn values(&self) -> (i64, i64, u64) {
        (self.v1, self.v2, self.count)
    }

    pub(crate) fn set_key(&mut self, key: i64) {
        self.key = key;
    }
}

/// Merges iterators over the same key, such as a knowledge base table and
/// the matching tables of the differential indices added on top of it.
pub struct CompositeItr {
    merge: Merger,
    n_first_terms: u64,
    kb_child: Option<usize>,
    c1: Option<i64>,
    c2: Option<i64>,
}

impl CompositeItr {
    /// `n_first_terms` is the number of value1 groups the children other
    /// than `kb_child` contribute; it backs the cardinality estimate when the
    /// second column is ignored.
    pub fn new(children: Vec<BoxedItr>, n_first_terms: u64, kb_child: Option<usize>) -> Self {
        let (c1, c2) = children
            .first()
            .map_or((None, None), |c| (c.constraint1(), c.constraint2()));
        CompositeItr {
            merge: Merger::new(children),
            n_first_terms,
            kb_child,
            c1,
            c2,
        }
    }
}

impl PairItr for CompositeItr {
    fn kind(&self) -> ItrKind {
        ItrKind::Composite
    }

    fn key(&self) -> i64 {
        self.merge.key()
    }

    fn set_key(&mut self, key: i64) {
        self.merge.set_key(key);
    }

    fn value1(&self) -> i64 {
        self.merge.values().0
    }

    fn value2(&self) -> i64 {
        self.merge.values().1
    }

    fn count(&mut self) -> Result<u64> {
        Ok(self.merge.values().2)
    }

    fn has_next(&mut self) -> Result<bool> {
        self.merge.has_next()
    }

    fn next(&mut self) -> Result<()> {
        self.merge.next()
    }

    fn cardinality(&mut self) -> Result<u64> {
        if self.merge.is_second_column_ignored() {
            if let Some(kb) = self.kb_child {
                let child = self
                    .merge
                    .children
                    .get_mut(kb)
                    .ok_or_else(|| TridentError::misuse(format!("no child {kb} in composite")))?;
                return Ok(self.n_first_terms + child.itr.cardinality()?);
            }
        }
        let mut total = 0;
        for child in self.merge.children.iter_mut() {
            total += child.itr.cardinality()?;
        }
        Ok(total)
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        let mut total = 0;
        for child in self.merge.children.iter_mut() {
            total += child.itr.est_cardinality()?;
        }
        Ok(total)
    }

    fn constraint1(&self) -> Option<i64> {
        self.c1
    }

    fn constraint2(&self) -> Option<i64> {
        self.c2
    }

    fn set_constraint1(&mut self, c: Option<i64>) {
        self.c1 = c;
    }

    fn set_constraint2(&mut self, c: Option<i64>) {
        self.c2 = c;
    }

    fn is_second_column_ignored(&self) -> bool {
        self.merge.is_second_column_ignored()
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

impl Seekable for CompositeItr {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        self.merge.moveto(c1, c2)
    }
}

impl Markable for CompositeItr {
    fn mark(&mut self) -> Result<()> {
        self.merge.mark()
    }

    fn reset(&mut self) -> Result<()> {
        self.merge.reset()
    }
}

impl ColumnIgnorable for CompositeItr {
    fn ignore_second_column(&mut self) -> Result<()> {
        self.merge.ignore_second_column()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itr::ArrayItr;

    fn array(pairs: Vec<(i64, i64)>) -> BoxedItr {
        Box::new(ArrayItr::from_unsorted(pairs, 4))
    }

    fn pairs(itr: &mut dyn PairItr) -> Vec<(i64, i64, u64)> {
        itr.collect_tuples()
            .unwrap()
            .into_iter()
            .map(|t| (t.1, t.2, t.3))
            .collect()
    }

    #[test]
    fn test_merges_in_order_keeping_duplicates() {
        let mut itr = CompositeItr::new(
            vec![array(vec![(1, 1), (3, 3)]), array(vec![(1, 2), (3, 3), (5, 0)])],
            0,
            Some(0),
        );
        assert_eq!(itr.cardinality().unwrap(), 5);
        assert_eq!(
            pairs(&mut itr),
            vec![(1, 1, 1), (1, 2, 1), (3, 3, 1), (3, 3, 1), (5, 0, 1)]
        );
        assert_eq!(itr.key(), 4);
    }

    #[test]
    fn test_ignore_sums_groups() {
        let mut itr = CompositeItr::new(
            vec![array(vec![(1, 1), (1, 4), (2, 0)]), array(vec![(1, 2), (3, 3)])],
            1,
            Some(0),
        );
        PairItrExt::ignore_second_column(&mut itr).unwrap();
        assert_eq!(pairs(&mut itr), vec![(1, 1, 3), (2, 0, 1), (3, 3, 1)]);
        assert_eq!(itr.cardinality().unwrap(), 3);
    }

    #[test]
    fn test_moveto_across_children() {
        let mut itr = CompositeItr::new(
            vec![array(vec![(1, 1), (4, 1), (9, 9)]), array(vec![(2, 2), (5, 5)])],
            0,
            None,
        );
        itr.next().unwrap();
        PairItrExt::moveto(&mut itr, 4, 0).unwrap();
        itr.next().unwrap();
        assert_eq!((itr.value1(), itr.value2()), (4, 1));
        // behind the current tuple: it is reported again
        PairItrExt::moveto(&mut itr, 2, 0).unwrap();
        itr.next().unwrap();
        assert_eq!((itr.value1(), itr.value2()), (4, 1));
        PairItrExt::mark(&mut itr).unwrap();
        assert_eq!(pairs(&mut itr), vec![(5, 5, 1), (9, 9, 1)]);
        PairItrExt::reset(&mut itr).unwrap();
        itr.next().unwrap();
        assert_eq!((itr.value1(), itr.value2()), (5, 5));
    }
}
