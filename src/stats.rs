// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::sync::atomic::{
    AtomicU64,
    Ordering::Relaxed,
};

use crate::table::strategy::TableLayout;

/// Counters kept by a querier about the iterators it hands out.
#[derive(Debug, Default)]
pub struct QueryStats {
    row: AtomicU64,
    column: AtomicU64,
    cluster: AtomicU64,
    aggr: AtomicU64,
    not_aggr: AtomicU64,
    reversed: AtomicU64,
    per_perm: [AtomicU64; 6],
}

/// A point-in-time copy of [`QueryStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub row: u64,
    pub column: u64,
    pub cluster: u64,
    pub aggr: u64,
    pub not_aggr: u64,
    pub reversed: u64,
    pub per_perm: [u64; 6],
}

impl QueryStats {
    pub(crate) fn record_table(&self, layout: TableLayout) {
        match layout {
            | TableLayout::Row => self.row.fetch_add(1, Relaxed),
            | TableLayout::Cluster => self.cluster.fetch_add(1, Relaxed),
            | TableLayout::Column => self.column.fetch_add(1, Relaxed),
        };
    }

    pub(crate) fn record_aggr(&self, aggregated: bool) {
        if aggregated {
            self.aggr.fetch_add(1, Relaxed);
        } else {
            self.not_aggr.fetch_add(1, Relaxed);
        }
    }

    pub(crate) fn record_reversed(&self) {
        self.reversed.fetch_add(1, Relaxed);
    }

    pub(crate) fn record_perm(&self, perm: usize) {
        self.per_perm[perm].fetch_add(1, Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut per_perm = [0u64; 6];
        for (i, c) in self.per_perm.iter().enumerate() {
            per_perm[i] = c.load(Relaxed);
        }
        StatsSnapshot {
            row: self.row.load(Relaxed),
            column: self.column.load(Relaxed),
            cluster: self.cluster.load(Relaxed),
            aggr: self.aggr.load(Relaxed),
            not_aggr: self.not_aggr.load(Relaxed),
            reversed: self.reversed.load(Relaxed),
            per_perm,
        }
    }

    pub fn reset(&self) {
        for c in [
            &self.row,
            &self.column,
            &self.cluster,
            &self.aggr,
            &self.not_aggr,
            &self.reversed,
        ] {
            c.store(0, Relaxed);
        }
        for c in self.per_perm.iter() {
            c.store(0, Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let stats = QueryStats::default();
        stats.record_table(TableLayout::Row);
        stats.record_table(TableLayout::Column);
        stats.record_aggr(true);
        stats.record_perm(2);
        stats.record_perm(2);
        let snap = stats.snapshot();
        assert_eq!(snap.row, 1);
        assert_eq!(snap.column, 1);
        assert_eq!(snap.cluster, 0);
        assert_eq!(snap.aggr, 1);
        assert_eq!(snap.per_perm[2], 2);
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
