// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use crate::{
    errs::{
        Result,
        TridentError,
    },
    itr::{
        composite::Child,
        constraint_accessors,
        BoxedItr,
        ItrKind,
        KeySeekable,
        PairItr,
        PairItrExt,
    },
};

/// Union of several term lists. A key present in more than one list is
/// reported once with the counts summed.
pub struct CompositeTermItr {
    children: Vec<Child>,
    key: i64,
    count: u64,
    c1: Option<i64>,
    c2: Option<i64>,
}

impl CompositeTermItr {
    pub fn new(children: Vec<BoxedItr>) -> Self {
        CompositeTermItr {
            children: children.into_iter().map(Child::new).collect(),
            key: -1,
            count: 0,
            c1: None,
            c2: None,
        }
    }

    fn min_key(&mut self) -> Result<Option<i64>> {
        let mut best = None;
        for child in self.children.iter_mut() {
            if child.fill()? {
                let k = child.itr.key();
                if best.map_or(true, |b| k < b) {
                    best = Some(k);
                }
            }
        }
        Ok(best)
    }
}

impl PairItr for CompositeTermItr {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::CompositeTerm
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
        Ok(self.min_key()?.is_some())
    }

    fn next(&mut self) -> Result<()> {
        let key = self
            .min_key()?
            .ok_or_else(|| TridentError::misuse("next on an exhausted term union"))?;
        let mut count = 0;
        for child in self.children.iter_mut() {
            if child.head && child.itr.key() == key {
                count += child.itr.count()?;
                child.take();
            }
        }
        self.key = key;
        self.count = count;
        Ok(())
    }

    /// Upper bound: keys shared by several lists are counted once per list.
    fn cardinality(&mut self) -> Result<u64> {
        let mut total = 0;
        for child in self.children.iter_mut() {
            total += child.itr.cardinality()?;
        }
        Ok(total)
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        self.cardinality()
    }

    fn is_second_column_ignored(&self) -> bool {
        true
    }

    fn as_key_seekable(&mut self) -> Option<&mut dyn KeySeekable> {
        Some(self)
    }
}

impl KeySeekable for CompositeTermItr {
    fn goto_key(&mut self, key: i64) -> Result<()> {
        for child in self.children.iter_mut() {
            if child.head && child.itr.key() >= key {
                continue;
            }
            child.drop_head();
            child.itr.goto_key(key)?;
        }
        Ok(())
    }
}

/// A term list minus the counts of another. Keys whose count drops to zero
/// are skipped.
pub struct RmCompositeTermItr {
    main: BoxedItr,
    rm: Child,
    key: i64,
    count: u64,
    c1: Option<i64>,
    c2: Option<i64>,
    // a surviving key read ahead from `main`
    pending: Option<(i64, u64)>,
}

impl RmCompositeTermItr {
    pub fn new(main: BoxedItr, rm: BoxedItr) -> Self {
        RmCompositeTermItr {
            main,
            rm: Child::new(rm),
            key: -1,
            count: 0,
            c1: None,
            c2: None,
            pending: None,
        }
    }

    fn fill(&mut self) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        while self.main.has_next()? {
            self.main.next()?;
            let key = self.main.key();
            let mut count = self.main.count()?;
            while self.rm.fill()? && self.rm.itr.key() < key {
                self.rm.drop_head();
            }
            if self.rm.head && self.rm.itr.key() == key {
                count = count.saturating_sub(self.rm.itr.count()?);
                self.rm.take();
            }
            if count > 0 {
                self.pending = Some((key, count));
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl PairItr for RmCompositeTermItr {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::RmCompositeTerm
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
            return Err(TridentError::misuse("next on an exhausted term difference"));
        }
        if let Some((key, count)) = self.pending.take() {
            self.key = key;
            self.count = count;
        }
        Ok(())
    }

    fn cardinality(&mut self) -> Result<u64> {
        self.main.cardinality()
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        self.main.est_cardinality()
    }

    fn is_second_column_ignored(&self) -> bool {
        true
    }

    fn as_key_seekable(&mut self) -> Option<&mut dyn KeySeekable> {
        Some(self)
    }
}

impl KeySeekable for RmCompositeTermItr {
    fn goto_key(&mut self, key: i64) -> Result<()> {
        if let Some((k, _)) = self.pending {
            if k >= key {
                return Ok(());
            }
            self.pending = None;
        }
        self.main.goto_key(key)?;
        if !(self.rm.head && self.rm.itr.key() >= key) {
            self.rm.drop_head();
            self.rm.itr.goto_key(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::itr::DiffTermItr;

    fn keys(k: &[i64]) -> BoxedItr {
        Box::new(DiffTermItr::from_keys(Arc::new(k.to_vec())))
    }

    #[test]
    fn test_union_sums_counts() {
        let mut itr = CompositeTermItr::new(vec![keys(&[1, 3, 5]), keys(&[2, 3, 9])]);
        let got: Vec<_> = itr.collect_tuples().unwrap().into_iter().map(|t| (t.0, t.3)).collect();
        assert_eq!(got, vec![(1, 1), (2, 1), (3, 2), (5, 1), (9, 1)]);
    }

    #[test]
    fn test_union_goto_key() {
        let mut itr = CompositeTermItr::new(vec![keys(&[1, 3, 5]), keys(&[2, 3, 9])]);
        PairItrExt::goto_key(&mut itr, 4).unwrap();
        itr.next().unwrap();
        assert_eq!(itr.key(), 5);
    }

    #[test]
    fn test_difference_drops_emptied_keys() {
        let main = CompositeTermItr::new(vec![keys(&[1, 3, 5]), keys(&[3, 5, 7])]);
        let mut itr = RmCompositeTermItr::new(Box::new(main), keys(&[1, 5, 6]));
        let got: Vec<_> = itr.collect_tuples().unwrap().into_iter().map(|t| (t.0, t.3)).collect();
        assert_eq!(got, vec![(3, 2), (5, 1), (7, 1)]);
    }
}
