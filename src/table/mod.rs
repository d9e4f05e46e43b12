// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Binary pair tables and the storage that catalogs them.
//!
//! A table holds the sorted `(value1, value2)` pairs of one key in one
//! permutation. The layout byte ([`strategy::StorageStrat`]) decides between
//! fixed-width rows, clustered groups and two-block columns.

pub mod cluster;
pub mod column;
pub mod inserter;
pub mod row;
pub mod storage;
pub mod strategy;

use crate::{
    errs::Result,
    fs::Region,
    itr::{
        ColumnIgnorable,
        ItrKind,
        Markable,
        PairItr,
        Seekable,
    },
    table::{
        cluster::ClusterTable,
        column::ColumnTable,
        row::RowTable,
        strategy::{
            StorageStrat,
            TableLayout,
        },
    },
};

/// A reader over one table, whatever its layout.
#[derive(Clone)]
pub enum TableItr {
    Row(RowTable),
    Cluster(ClusterTable),
    Column(ColumnTable),
}

macro_rules! dispatch {
    ($self:ident, $t:ident => $e:expr) => {
        match $self {
            | TableItr::Row($t) => $e,
            | TableItr::Cluster($t) => $e,
            | TableItr::Column($t) => $e,
        }
    };
}

impl TableItr {
    pub fn new(data: Region, strat: StorageStrat, key: i64) -> Result<Self> {
        Ok(match strat.layout() {
            | TableLayout::Row => TableItr::Row(RowTable::new(data, strat, key)?),
            | TableLayout::Cluster => TableItr::Cluster(ClusterTable::new(data, strat, key)?),
            | TableLayout::Column => TableItr::Column(ColumnTable::new(data, key)?),
        })
    }

    pub fn layout(&self) -> TableLayout {
        match self {
            | TableItr::Row(_) => TableLayout::Row,
            | TableItr::Cluster(_) => TableLayout::Cluster,
            | TableItr::Column(_) => TableLayout::Column,
        }
    }

    /// Restricts the reader to the pairs matching the given constraints and
    /// rewinds it.
    pub fn setup(&mut self, c1: Option<i64>, c2: Option<i64>) {
        dispatch!(self, t => t.setup(c1, c2))
    }
}

impl PairItr for TableItr {
    fn kind(&self) -> ItrKind {
        dispatch!(self, t => t.kind())
    }

    fn key(&self) -> i64 {
        dispatch!(self, t => t.key())
    }

    fn set_key(&mut self, key: i64) {
        dispatch!(self, t => t.set_key(key))
    }

    fn value1(&self) -> i64 {
        dispatch!(self, t => t.value1())
    }

    fn value2(&self) -> i64 {
        dispatch!(self, t => t.value2())
    }

    fn count(&mut self) -> Result<u64> {
        dispatch!(self, t => t.count())
    }

    fn has_next(&mut self) -> Result<bool> {
        dispatch!(self, t => t.has_next())
    }

    fn next(&mut self) -> Result<()> {
        dispatch!(self, t => t.next())
    }

    fn cardinality(&mut self) -> Result<u64> {
        dispatch!(self, t => t.cardinality())
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        dispatch!(self, t => t.est_cardinality())
    }

    fn constraint1(&self) -> Option<i64> {
        dispatch!(self, t => t.constraint1())
    }

    fn constraint2(&self) -> Option<i64> {
        dispatch!(self, t => t.constraint2())
    }

    fn set_constraint1(&mut self, c: Option<i64>) {
        dispatch!(self, t => t.set_constraint1(c))
    }

    fn set_constraint2(&mut self, c: Option<i64>) {
        dispatch!(self, t => t.set_constraint2(c))
    }

    fn is_second_column_ignored(&self) -> bool {
        dispatch!(self, t => t.is_second_column_ignored())
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

impl Seekable for TableItr {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        dispatch!(self, t => Seekable::moveto(t, c1, c2))
    }
}

impl Markable for TableItr {
    fn mark(&mut self) -> Result<()> {
        dispatch!(self, t => Markable::mark(t))
    }

    fn reset(&mut self) -> Result<()> {
        dispatch!(self, t => Markable::reset(t))
    }
}

impl ColumnIgnorable for TableItr {
    fn ignore_second_column(&mut self) -> Result<()> {
        dispatch!(self, t => ColumnIgnorable::ignore_second_column(t))
    }
}
