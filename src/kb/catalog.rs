// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::sync::Arc;

use tracing::trace;

use crate::{
    errs::{
        Result,
        TridentError,
    },
    fs::manager::SessionId,
    itr::{
        AggrItr,
        ArrayItr,
        BoxedItr,
        EmptyItr,
        PairItr,
        ScanItr,
        TableItr,
        TermItr,
    },
    perm::{
        Permutation,
        ALL_PERMUTATIONS,
    },
    stats::QueryStats,
    table::{
        storage::TableStorage,
        strategy::StorageStrat,
    },
    tree::{
        Coordinate,
        TermCoordinates,
        Tree,
    },
};

/// One optional file manager session per permutation.
pub(crate) type Sessions = [Option<SessionId>; 6];

pub(crate) const NO_SESSIONS: Sessions = [None; 6];

const MAX_32_BITS: u64 = (1 << 32) - 1;

/// Packs a table location into the value stored by aggregated tables.
pub(crate) fn pack_coordinate(file: u16, mark: u64, strat: u8) -> Result<i64> {
    if mark > MAX_32_BITS {
        return Err(TridentError::misuse(format!(
            "mark {mark} cannot be referenced from an aggregated table"
        )));
    }
    Ok(((strat as i64) << 48) | ((file as i64) << 32) | mark as i64)
}

pub(crate) fn unpack_coordinate(packed: i64) -> Coordinate {
    let packed = packed as u64;
    Coordinate {
        file: ((packed >> 32) & 0xFFFF) as u16,
        mark: packed & MAX_32_BITS,
        strat: ((packed >> 48) & 0xFF) as u8,
        n_elements: 0,
    }
}

/// The permutation whose tables an aggregated table of `perm` points into.
pub(crate) fn aggregation_target(perm: Permutation) -> Option<Permutation> {
    match perm {
        | Permutation::Pos => Some(Permutation::Ops),
        | Permutation::Pso => Some(Permutation::Spo),
        | _ => None,
    }
}

/// Persistent counters describing a set of permutations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub n_triples: u64,
    pub n_terms: u64,
    /// Tables stored per permutation.
    pub n_tables: [u64; 6],
    /// Distinct (key, value1) groups per permutation.
    pub n_first_terms: [u64; 6],
}

/// The permutations of one index together with the tree locating their
/// tables. Both the main knowledge base and every differential index are
/// read through one of these.
pub struct Catalog {
    storages: [Option<Arc<TableStorage>>; 6],
    tree: Arc<Tree<u64, TermCoordinates>>,
    stats: CatalogStats,
    qstats: Arc<QueryStats>,
}

impl Catalog {
    pub(crate) fn new(
        storages: [Option<Arc<TableStorage>>; 6],
        tree: Arc<Tree<u64, TermCoordinates>>,
        stats: CatalogStats,
        qstats: Arc<QueryStats>,
    ) -> Self {
        Self {
            storages,
            tree,
            stats,
            qstats,
        }
    }

    pub fn stats(&self) -> &CatalogStats {
        &self.stats
    }

    pub(crate) fn query_stats(&self) -> &Arc<QueryStats> {
        &self.qstats
    }

    pub fn tree(&self) -> &Arc<Tree<u64, TermCoordinates>> {
        &self.tree
    }

    pub fn storage(&self, perm: Permutation) -> Option<&Arc<TableStorage>> {
        self.storages[perm.index()].as_ref()
    }

    /// Whether `perm` is materialized on disk.
    pub fn has(&self, perm: Permutation) -> bool {
        self.storages[perm.index()].is_some()
    }

    /// Whether `perm` can be answered, directly or through its reverse.
    pub fn present(&self, perm: Permutation) -> bool {
        self.has(perm) || self.has(perm.reverse())
    }

    pub fn n_triples(&self) -> u64 {
        self.stats.n_triples
    }

    pub fn n_first_terms(&self, perm: Permutation) -> u64 {
        match self.stats.n_first_terms[perm.index()] {
            | 0 => self.stats.n_first_terms[perm.reverse().index()],
            | n => n,
        }
    }

    pub fn coordinates(&self, key: i64) -> Result<Option<TermCoordinates>> {
        if key < 0 {
            return Ok(None);
        }
        self.tree.get(&(key as u64))
    }

    /// Number of pairs stored under `key` in `perm`, read from its reverse
    /// when the table itself was skipped.
    pub fn n_elements(&self, key: i64, perm: Permutation) -> Result<u64> {
        Ok(match self.coordinates(key)? {
            | Some(c) if c.exists(perm) => c.n_elements(perm),
            | Some(c) => c.n_elements(perm.reverse()),
            | None => 0,
        })
    }

    pub(crate) fn open_sessions(&self) -> Result<Sessions> {
        let mut sessions = NO_SESSIONS;
        for perm in ALL_PERMUTATIONS {
            if let Some(s) = self.storage(perm) {
                sessions[perm.index()] = Some(s.new_session()?);
            }
        }
        Ok(sessions)
    }

    pub(crate) fn close_sessions(&self, sessions: &Sessions) -> Result<()> {
        for perm in ALL_PERMUTATIONS {
            if let (Some(s), Some(id)) = (self.storage(perm), sessions[perm.index()]) {
                s.close_session(id)?;
            }
        }
        Ok(())
    }

    /// The keys of `perm` in ascending order. Without `enforce` the keys of a
    /// reverse permutation are read from its forward one, which has the same
    /// keys and never skips a table.
    pub fn term_list(&self, perm: Permutation, enforce: bool) -> Result<Option<TermItr>> {
        let source = if !enforce && perm.is_reverse() && self.has(perm.reverse()) {
            perm.reverse()
        } else if self.has(perm) {
            perm
        } else if !enforce && self.has(perm.reverse()) {
            perm.reverse()
        } else {
            return Ok(None);
        };
        let storage = self.storages[source.index()]
            .clone()
            .ok_or_else(|| TridentError::corrupt(format!("no storage for {source}")))?;
        Ok(Some(TermItr::new(
            storage,
            self.tree.clone(),
            perm,
            self.stats.n_tables[source.index()],
        )))
    }

    /// Opens one stored table and restricts it to the given constraints.
    pub fn open_table(
        &self,
        perm: Permutation,
        key: i64,
        coord: &Coordinate,
        c1: Option<i64>,
        c2: Option<i64>,
        session: Option<SessionId>,
    ) -> Result<TableItr> {
        let storage = self
            .storage(perm)
            .ok_or_else(|| TridentError::corrupt(format!("permutation {perm} is not stored")))?;
        let strat = StorageStrat::from_byte(coord.strat)?;
        let data = storage.get_table(coord.file, coord.mark, session)?;
        let mut itr = TableItr::new(data, strat, key)?;
        itr.setup(c1, c2);
        self.qstats.record_table(itr.layout());
        trace!(%perm, key, file = coord.file, mark = coord.mark, "opened table");
        Ok(itr)
    }

    /// The pairs of `key` in `perm`, following aggregated tables and falling
    /// back on the reverse permutation when the table was skipped.
    pub fn lookup(
        self: &Arc<Self>,
        perm: Permutation,
        key: i64,
        coords: &TermCoordinates,
        v1: Option<i64>,
        v2: Option<i64>,
        sessions: &Sessions,
    ) -> Result<BoxedItr> {
        self.qstats.record_perm(perm.index());
        if let (Some(coord), true) = (coords.get(perm), self.has(perm)) {
            let strat = StorageStrat::from_byte(coord.strat)?;
            if aggregation_target(perm).is_some() {
                self.qstats.record_aggr(strat.is_aggregated());
            }
            if strat.is_aggregated() {
                let main = self.open_table(perm, key, &coord, v1, None, sessions[perm.index()])?;
                return Ok(Box::new(AggrItr::new(self.clone(), perm, key, main, v2, *sessions)?));
            }
            return Ok(Box::new(self.open_table(
                perm,
                key,
                &coord,
                v1,
                v2,
                sessions[perm.index()],
            )?));
        }
        let rev = perm.reverse();
        if coords.exists(rev) && self.has(rev) {
            self.qstats.record_reversed();
            let mut full = self.lookup(rev, key, coords, None, None, sessions)?;
            return Ok(Box::new(Self::reversed(full.as_mut(), key, v1, v2)?));
        }
        let mut empty = EmptyItr::new();
        empty.set_key(key);
        Ok(Box::new(empty))
    }

    /// Materializes `itr` with its value columns swapped, keeping the pairs
    /// whose new first value matches `v1`.
    pub fn reversed(itr: &mut dyn PairItr, key: i64, v1: Option<i64>, v2: Option<i64>) -> Result<ArrayItr> {
        let mut pairs = Vec::new();
        while itr.has_next()? {
            itr.next()?;
            let (a, b) = (itr.value2(), itr.value1());
            if v1.map_or(true, |v| v == a) {
                pairs.push((a, b));
            }
        }
        let mut out = ArrayItr::from_unsorted(pairs, key);
        out.setup(v1, v2);
        Ok(out)
    }

    /// Every tuple of `perm`.
    pub fn scan(self: &Arc<Self>, perm: Permutation) -> Result<BoxedItr> {
        if !self.present(perm) {
            return Ok(Box::new(EmptyItr::new()));
        }
        Ok(Box::new(ScanItr::new(self.clone(), perm)?))
    }
}
