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
        TableItr,
    },
    kb::catalog::{
        aggregation_target,
        unpack_coordinate,
        Catalog,
        Sessions,
    },
    perm::Permutation,
};

/// The expansion of one row of an aggregated table.
#[derive(Clone)]
struct Group {
    v1: i64,
    second: TableItr,
    // not yet reported in ignore mode
    pending: bool,
}

/// Reads an aggregated table. Each row `(value1, coordinate)` points at the
/// table of `value1` in the target permutation (OPS for POS, SPO for PSO);
/// the pairs of that table with first value equal to this iterator's key
/// supply `value2`.
#[derive(Clone)]
pub struct AggrItr {
    catalog: Arc<Catalog>,
    target: Permutation,
    sessions: Sessions,
    main: TableItr,
    group: Option<Group>,
    seek: Option<(i64, i64)>,
    replay: bool,
    started: bool,
    v1: i64,
    v2: i64,
    count: u64,
    key: i64,
    c1: Option<i64>,
    c2: Option<i64>,
    ignore: bool,
    saved: Option<Box<AggrItr>>,
}

impl AggrItr {
    /// `main` must already be restricted to the value1 constraint.
    pub fn new(
        catalog: Arc<Catalog>,
        perm: Permutation,
        key: i64,
        main: TableItr,
        c2: Option<i64>,
        sessions: Sessions,
    ) -> Result<Self> {
        let target = aggregation_target(perm)
            .ok_or_else(|| TridentError::corrupt(format!("{perm} cannot hold aggregated tables")))?;
        let c1 = main.constraint1();
        Ok(AggrItr {
            catalog,
            target,
            sessions,
            main,
            group: None,
            seek: None,
            replay: false,
            started: false,
            v1: -1,
            v2: -1,
            count: 0,
            key,
            c1,
            c2,
            ignore: false,
            saved: None,
        })
    }

    fn open_second(&self, v1: i64, packed: i64) -> Result<TableItr> {
        let coord = unpack_coordinate(packed);
        self.catalog.open_table(
            self.target,
            v1,
            &coord,
            Some(self.key),
            self.c2,
            self.sessions[self.target.index()],
        )
    }

    /// Makes sure a tuple is ready to be read.
    fn fill(&mut self) -> Result<bool> {
        loop {
            if let Some(g) = self.group.as_mut() {
                if self.ignore {
                    if g.pending {
                        return Ok(true);
                    }
                } else if g.second.has_next()? {
                    return Ok(true);
                }
            }
            if !self.main.has_next()? {
                return Ok(false);
            }
            self.main.next()?;
            let v1 = self.main.value1();
            let mut second = self.open_second(v1, self.main.value2())?;
            if let Some((t1, t2)) = self.seek.take() {
                if t1 == v1 && !self.ignore {
                    Seekable::moveto(&mut second, self.key, t2)?;
                }
            }
            if self.ignore && second.cardinality()? == 0 {
                continue;
            }
            self.group = Some(Group {
                v1,
                second,
                pending: true,
            });
        }
    }
}

impl PairItr for AggrItr {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::Aggr
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
            return Err(TridentError::misuse("next on an exhausted aggregated iterator"));
        }
        let ignore = self.ignore;
        let g = self
            .group
            .as_mut()
            .ok_or_else(|| TridentError::corrupt("aggregated group vanished"))?;
        self.v1 = g.v1;
        if ignore {
            self.count = g.second.cardinality()?;
            g.pending = false;
        } else {
            g.second.next()?;
            self.v2 = g.second.value2();
            self.count = 1;
        }
        self.started = true;
        Ok(())
    }

    fn cardinality(&mut self) -> Result<u64> {
        let mut main = self.main.clone();
        main.setup(self.c1, None);
        let mut total = 0;
        while main.has_next()? {
            main.next()?;
            let n = self.open_second(main.value1(), main.value2())?.cardinality()?;
            total += match (self.ignore, n) {
                | (true, 0) => 0,
                | (true, _) => 1,
                | (false, n) => n,
            };
        }
        Ok(total)
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        let groups = self.main.est_cardinality()?;
        if self.ignore {
            return Ok(groups);
        }
        let per_group = match self.group.as_mut() {
            | Some(g) => g.second.est_cardinality()?,
            | None => 1,
        };
        Ok(groups.saturating_mul(per_group.max(1)))
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

impl Seekable for AggrItr {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        let behind = if self.ignore {
            c1 <= self.v1
        } else {
            (c1, c2) <= (self.v1, self.v2)
        };
        if self.started && behind {
            self.replay = true;
            return Ok(());
        }
        self.replay = false;
        let Some(g) = self.group.as_mut() else {
            Seekable::moveto(&mut self.main, c1, 0)?;
            self.seek = Some((c1, c2));
            return Ok(());
        };
        if g.v1 > c1 {
            // the next group is already past the target
            return Ok(());
        }
        if g.v1 == c1 {
            if !self.ignore {
                Seekable::moveto(&mut g.second, self.key, c2)?;
            }
            return Ok(());
        }
        self.group = None;
        Seekable::moveto(&mut self.main, c1, 0)?;
        self.seek = Some((c1, c2));
        Ok(())
    }
}

impl Markable for AggrItr {
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

impl ColumnIgnorable for AggrItr {
    fn ignore_second_column(&mut self) -> Result<()> {
        if self.ignore {
            return Ok(());
        }
        self.ignore = true;
        self.replay = false;
        if let Some(g) = self.group.as_mut() {
            if self.started && g.v1 == self.v1 {
                // the current group has been reported in part, fold it now
                self.count = g.second.cardinality()?;
                g.pending = false;
            } else {
                g.pending = true;
            }
        }
        Ok(())
    }
}
