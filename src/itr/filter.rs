// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use crate::{
    errs::{
        Result,
        TridentError,
    },
    itr::{
        constraint_accessors,
        BoxedItr,
        ItrKind,
        PairItr,
        PairItrExt,
        Seekable,
    },
};

/// Keeps only the tuples whose columns at two positions are equal, for
/// patterns that repeat a variable such as `?x p ?x`. Positions are 0 for
/// the key, 1 for value1 and 2 for value2.
pub struct FilterSameItr {
    itr: BoxedItr,
    positions: (usize, usize),
    ahead: bool,
    replay: bool,
    started: bool,
    key: i64,
    v1: i64,
    v2: i64,
    count: u64,
    c1: Option<i64>,
    c2: Option<i64>,
}

impl FilterSameItr {
    pub fn new(itr: BoxedItr, pos1: usize, pos2: usize) -> Result<Self> {
        let positions = match (pos1.min(pos2), pos1.max(pos2)) {
            | (a, b) if a != b && b <= 2 => (a, b),
            | _ => {
                return Err(TridentError::misuse(format!(
                    "cannot compare positions {pos1} and {pos2}"
                )));
            },
        };
        let (c1, c2) = (itr.constraint1(), itr.constraint2());
        Ok(FilterSameItr {
            itr,
            positions,
            ahead: false,
            replay: false,
            started: false,
            key: -1,
            v1: -1,
            v2: -1,
            count: 0,
            c1,
            c2,
        })
    }

    fn matches(&self) -> bool {
        let cols = [self.itr.key(), self.itr.value1(), self.itr.value2()];
        cols[self.positions.0] == cols[self.positions.1]
    }

    fn fill(&mut self) -> Result<bool> {
        if self.ahead {
            return Ok(true);
        }
        while self.itr.has_next()? {
            self.itr.next()?;
            if self.matches() {
                self.ahead = true;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl PairItr for FilterSameItr {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::FilterSame
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
        if self.replay {
            return Ok(true);
        }
        self.fill()
    }

    fn next(&mut self) -> Result<()> {
        if self.replay {
            self.replay = false;
            return Ok(());
        }
        if !self.fill()? {
            return Err(TridentError::misuse("next on an exhausted filter"));
        }
        self.ahead = false;
        self.key = self.itr.key();
        self.v1 = self.itr.value1();
        self.v2 = self.itr.value2();
        self.count = self.itr.count()?;
        self.started = true;
        Ok(())
    }

    /// Not known without reading the input.
    fn cardinality(&mut self) -> Result<u64> {
        Err(TridentError::Unsupported("cardinality of a filtered iterator"))
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        self.itr.est_cardinality()
    }

    fn as_seekable(&mut self) -> Option<&mut dyn Seekable> {
        Some(self)
    }
}

impl Seekable for FilterSameItr {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        if self.started && (c1, c2) <= (self.v1, self.v2) {
            self.replay = true;
            return Ok(());
        }
        self.replay = false;
        if self.ahead && (self.itr.value1(), self.itr.value2()) >= (c1, c2) {
            return Ok(());
        }
        self.ahead = false;
        self.itr.moveto(c1, c2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itr::{
        ArrayItr,
        EmptyItr,
    };

    #[test]
    fn test_keeps_equal_columns() {
        let inner = ArrayItr::from_unsorted(vec![(1, 1), (1, 2), (3, 3), (4, 0), (7, 7)], 3);
        let mut itr = FilterSameItr::new(Box::new(inner), 1, 2).unwrap();
        let got: Vec<_> = itr.collect_tuples().unwrap().into_iter().map(|t| (t.1, t.2)).collect();
        assert_eq!(got, vec![(1, 1), (3, 3), (7, 7)]);
        assert!(itr.cardinality().unwrap_err().is_unsupported());

        let inner = ArrayItr::from_unsorted(vec![(1, 1), (3, 0), (3, 9)], 3);
        let mut itr = FilterSameItr::new(Box::new(inner), 0, 1).unwrap();
        let got: Vec<_> = itr.collect_tuples().unwrap().into_iter().map(|t| (t.1, t.2)).collect();
        assert_eq!(got, vec![(3, 0), (3, 9)]);
        assert!(FilterSameItr::new(Box::new(EmptyItr::new()), 1, 1).is_err());
    }

    #[test]
    fn test_moveto() {
        let inner = ArrayItr::from_unsorted(vec![(1, 1), (2, 2), (3, 4), (5, 5)], 0);
        let mut itr = FilterSameItr::new(Box::new(inner), 1, 2).unwrap();
        PairItrExt::moveto(&mut itr, 3, 0).unwrap();
        itr.next().unwrap();
        assert_eq!(itr.value1(), 5);
        PairItrExt::moveto(&mut itr, 1, 0).unwrap();
        itr.next().unwrap();
        assert_eq!(itr.value1(), 5);
        assert!(!itr.has_next().unwrap());
    }
}
