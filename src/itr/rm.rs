// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::cmp::Ordering;

use crate::{
    errs::{
        Result,
        TridentError,
    },
    itr::{
        composite::{
            cmp_tuple,
            Child,
        },
        constraint_accessors,
        BoxedItr,
        ColumnIgnorable,
        ItrKind,
        KeySeekable,
        Markable,
        PairItr,
        PairItrExt,
        Seekable,
    },
};

#[derive(Clone, Copy)]
struct RmMark {
    pending: Option<u64>,
    rm_flags: (bool, bool),
    replay: bool,
    started: bool,
    key: i64,
    v1: i64,
    v2: i64,
    count: u64,
}

/// Suppresses from `itr` every tuple that also appears in `rm`. With the
/// second column ignored, the group counts of `rm` are subtracted instead and
/// groups left empty are skipped.
pub struct RmItr {
    itr: BoxedItr,
    rm: Child,
    del_first_terms: u64,
    // count of the surviving tuple `itr` is positioned on, not yet reported
    pending: Option<u64>,
    replay: bool,
    started: bool,
    key: i64,
    v1: i64,
    v2: i64,
    count: u64,
    c1: Option<i64>,
    c2: Option<i64>,
    ignore: bool,
    saved: Option<RmMark>,
}

impl RmItr {
    /// `del_first_terms` is the number of value1 groups deleted by `rm`, used
    /// for cardinality when the second column is ignored.
    pub fn new(itr: BoxedItr, rm: BoxedItr, del_first_terms: u64) -> Self {
        let (c1, c2) = (itr.constraint1(), itr.constraint2());
        let key = itr.key();
        RmItr {
            itr,
            rm: Child::new(rm),
            del_first_terms,
            pending: None,
            replay: false,
            started: false,
            key,
            v1: -1,
            v2: -1,
            count: 0,
            c1,
            c2,
            ignore: false,
            saved: None,
        }
    }

    /// What is left of the tuple `itr` is positioned on, or `None` when it is
    /// removed entirely.
    fn settle(&mut self) -> Result<Option<u64>> {
        let t = (self.itr.key(), self.itr.value1(), self.itr.value2());
        while self.rm.fill()? && cmp_tuple(self.rm.tuple(), t, self.ignore) == Ordering::Less {
            self.rm.drop_head();
        }
        let matched = self.rm.head && cmp_tuple(self.rm.tuple(), t, self.ignore) == Ordering::Equal;
        let count = self.itr.count()?;
        if !matched {
            return Ok(Some(count));
        }
        if !self.ignore {
            self.rm.take();
            return Ok(None);
        }
        let left = count.saturating_sub(self.rm.itr.count()?);
        self.rm.take();
        Ok((left > 0).then_some(left))
    }

    fn fill(&mut self) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        while self.itr.has_next()? {
            self.itr.next()?;
            if let Some(count) = self.settle()? {
                self.pending = Some(count);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl PairItr for RmItr {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::Rm
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
            return Err(TridentError::misuse("next on an exhausted removal iterator"));
        }
        self.key = self.itr.key();
        self.v1 = self.itr.value1();
        self.v2 = self.itr.value2();
        self.count = self.pending.take().unwrap_or(0);
        self.started = true;
        Ok(())
    }

    // Exact only while every removed pair is present in the base.
    fn cardinality(&mut self) -> Result<u64> {
        let total = self.itr.cardinality()?;
        let removed = if self.ignore {
            self.del_first_terms
        } else {
            self.rm.itr.cardinality()?
        };
        Ok(total.saturating_sub(removed))
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        self.itr.est_cardinality()
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

impl Seekable for RmItr {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        let key = if self.started { self.key } else { self.itr.key() };
        let target = (key, c1, c2);
        if self.started && cmp_tuple(target, (self.key, self.v1, self.v2), self.ignore) != Ordering::Greater {
            self.replay = true;
            return Ok(());
        }
        self.replay = false;
        let ahead = (self.itr.key(), self.itr.value1(), self.itr.value2());
        if self.pending.is_none() || cmp_tuple(ahead, target, self.ignore) == Ordering::Less {
            self.pending = None;
            self.itr.moveto(c1, c2)?;
        }
        if self.rm.head && cmp_tuple(self.rm.tuple(), target, self.ignore) == Ordering::Less {
            self.rm.drop_head();
            self.rm.itr.moveto(c1, c2)?;
        }
        Ok(())
    }
}

impl KeySeekable for RmItr {
    fn goto_key(&mut self, key: i64) -> Result<()> {
        if self.started && key <= self.key {
            return Ok(());
        }
        self.replay = false;
        if self.pending.is_none() || self.itr.key() < key {
            self.pending = None;
            self.itr.goto_key(key)?;
        }
        if !(self.rm.head && self.rm.itr.key() >= key) {
            self.rm.drop_head();
            self.rm.itr.goto_key(key)?;
        }
        Ok(())
    }
}

impl Markable for RmItr {
    fn mark(&mut self) -> Result<()> {
        self.itr.mark()?;
        self.rm.itr.mark()?;
        self.saved = Some(RmMark {
            pending: self.pending,
            rm_flags: (self.rm.head, self.rm.current),
            replay: self.replay,
            started: self.started,
            key: self.key,
            v1: self.v1,
            v2: self.v2,
            count: self.count,
        });
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let m = self
            .saved
            .ok_or_else(|| TridentError::misuse("reset without a mark"))?;
        self.itr.reset()?;
        self.rm.itr.reset()?;
        self.pending = m.pending;
        (self.rm.head, self.rm.current) = m.rm_flags;
        self.replay = m.replay;
        self.started = m.started;
        self.key = m.key;
        self.v1 = m.v1;
        self.v2 = m.v2;
        self.count = m.count;
        Ok(())
    }
}

impl ColumnIgnorable for RmItr {
    fn ignore_second_column(&mut self) -> Result<()> {
        if self.ignore {
            return Ok(());
        }
        self.ignore = true;
        self.replay = false;
        self.itr.ignore_second_column()?;
        self.rm.itr.ignore_second_column()?;
        // the rm tuple matched against the current one has to be matched again
        // as a group
        if self.rm.current {
            self.rm.head = true;
            self.rm.current = false;
        }
        if self.pending.is_some() || self.started {
            let left = self.settle()?;
            if self.pending.is_some() {
                self.pending = left;
            } else {
                self.count = left.unwrap_or(0);
            }
        }
        Ok(())
    }
}
