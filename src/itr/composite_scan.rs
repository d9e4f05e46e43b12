// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use crate::{
    errs::Result,
    itr::{
        composite::Merger,
        BoxedItr,
        ColumnIgnorable,
        ItrKind,
        KeySeekable,
        Markable,
        PairItr,
        Seekable,
    },
};

/// Merges whole-permutation scans, e.g. the main knowledge base scan and the
/// scans of the differential indices, on (key, value1, value2).
pub struct CompositeScanItr {
    merge: Merger,
    c1: Option<i64>,
    c2: Option<i64>,
}

impl CompositeScanItr {
    pub fn new(children: Vec<BoxedItr>) -> Self {
        CompositeScanItr {
            merge: Merger::new(children),
            c1: None,
            c2: None,
        }
    }
}

impl PairItr for CompositeScanItr {
    fn kind(&self) -> ItrKind {
        ItrKind::CompositeScan
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

    /// Sum of the children; groups shared by several children are counted
    /// once per child.
    fn cardinality(&mut self) -> Result<u64> {
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

impl Seekable for CompositeScanItr {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        self.merge.moveto(c1, c2)
    }
}

impl KeySeekable for CompositeScanItr {
    fn goto_key(&mut self, key: i64) -> Result<()> {
        self.merge.goto_key(key)
    }
}

impl Markable for CompositeScanItr {
    fn mark(&mut self) -> Result<()> {
        self.merge.mark()
    }

    fn reset(&mut self) -> Result<()> {
        self.merge.reset()
    }
}

impl ColumnIgnorable for CompositeScanItr {
    fn ignore_second_column(&mut self) -> Result<()> {
        self.merge.ignore_second_column()
    }
}
