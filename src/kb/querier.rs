// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::{
    collections::BTreeMap,
    mem,
    path::PathBuf,
    sync::Arc,
};

use tracing::{
    instrument,
    trace,
    warn,
};

use crate::{
    diff::{
        DiffIndex,
        DiffKind,
    },
    errs::{
        Result,
        TridentError,
    },
    itr::{
        ArrayItr,
        BoxedItr,
        CompositeItr,
        CompositeScanItr,
        CompositeTermItr,
        EmptyItr,
        PairItr,
        PairItrExt,
        ReOrderItr,
        RmCompositeTermItr,
        RmItr,
    },
    kb::catalog::{
        Catalog,
        Sessions,
    },
    perm::Permutation,
    stats::{
        QueryStats,
        StatsSnapshot,
    },
    table::strategy::StorageStrat,
    tree::TermCoordinates,
};

/// A variable in a pattern.
pub const VARIABLE: i64 = -1;
/// A variable shared with another pattern of a join.
pub const JOIN_VARIABLE: i64 = -2;

#[inline]
fn bound(v: i64) -> Option<i64> {
    (v >= 0).then_some(v)
}

fn n_unbound(spo: [i64; 3]) -> usize {
    spo.iter().filter(|v| **v < 0).count()
}

/// Drains `itr` with the second column ignored into its value1 groups.
fn groups_of(mut itr: BoxedItr) -> Result<BTreeMap<i64, u64>> {
    itr.ignore_second_column()?;
    let mut groups = BTreeMap::new();
    while itr.has_next()? {
        itr.next()?;
        groups.insert(itr.value1(), itr.count()?);
    }
    Ok(groups)
}

/// Answers triple patterns over a knowledge base and the updates layered on
/// it. Values are term ids; [`VARIABLE`] and [`JOIN_VARIABLE`] mark unbound
/// positions. A querier is meant for a single thread.
pub struct Querier {
    catalog: Arc<Catalog>,
    diffs: Vec<Arc<dyn DiffIndex>>,
    sessions: Sessions,
    // coordinates of the last key looked up
    last: Option<(i64, Option<TermCoordinates>)>,
    reorder_cache: Option<PathBuf>,
}

impl Querier {
    pub(crate) fn new(catalog: Arc<Catalog>, diffs: Vec<Arc<dyn DiffIndex>>) -> Result<Self> {
        let sessions = catalog.open_sessions()?;
        Ok(Self {
            catalog,
            diffs,
            sessions,
            last: None,
            reorder_cache: None,
        })
    }

    pub(crate) fn query_stats(&self) -> &Arc<QueryStats> {
        self.catalog.query_stats()
    }

    /// Counters of the iterators handed out so far.
    pub fn counters(&self) -> StatsSnapshot {
        self.catalog.query_stats().snapshot()
    }

    pub fn reset_counters(&self) {
        self.catalog.query_stats().reset();
    }

    /// Keeps relations materialized for permutations that are not stored in
    /// `dir`, so later queriers can reload them. Ignored while updates are
    /// layered on the knowledge base.
    pub fn set_reorder_cache(&mut self, dir: Option<PathBuf>) {
        self.reorder_cache = dir;
    }

    pub fn n_updates(&self) -> usize {
        self.diffs.len()
    }

    fn coordinates(&mut self, key: i64) -> Result<Option<TermCoordinates>> {
        if let Some((k, coords)) = self.last {
            if k == key {
                return Ok(coords);
            }
        }
        let coords = self.catalog.coordinates(key)?;
        self.last = Some((key, coords));
        Ok(coords)
    }

    /// Number of triples, counting the updates.
    pub fn get_input_size(&self) -> u64 {
        self.diffs.iter().fold(self.catalog.n_triples(), |acc, d| match d.kind() {
            | DiffKind::Addition => acc + d.size(),
            | DiffKind::Deletion => acc.saturating_sub(d.size()),
        })
    }

    /// Sum of `f` over the updates, positive for additions and negative for
    /// deletions, applied to `base`.
    fn adjust<F>(&self, base: u64, mut f: F) -> Result<u64>
    where
        F: FnMut(&dyn DiffIndex) -> Result<u64>,
    {
        let mut total = base;
        for d in &self.diffs {
            let n = f(d.as_ref())?;
            total = match d.kind() {
                | DiffKind::Addition => total + n,
                | DiffKind::Deletion => total.saturating_sub(n),
            };
        }
        Ok(total)
    }

    /// Distinct (key, value1) groups of `perm`.
    pub fn get_n_first_tables_per_partition(&self, perm: Permutation) -> u64 {
        let base = self.catalog.n_first_terms(perm);
        self.adjust(base, |d| Ok(d.unique_n_first_terms(perm)))
            .unwrap_or(base)
    }

    /// Distinct keys of `perm`.
    pub fn n_keys(&self, perm: Permutation) -> u64 {
        let stats = self.catalog.stats();
        let forward = if perm.is_reverse() { perm.reverse() } else { perm };
        let base = match stats.n_tables[forward.index()] {
            | 0 => stats.n_tables[perm.index()],
            | n => n,
        };
        self.adjust(base, |d| Ok(d.n_unique_keys(perm))).unwrap_or(base)
    }

    pub fn get_order(&self, perm: Permutation) -> [usize; 3] {
        perm.order()
    }

    pub fn get_inv_order(&self, perm: Permutation) -> [usize; 3] {
        perm.inv_order()
    }

    /// The permutation best suited to a pattern: its first column is bound
    /// when anything is, and join variables come right after the constants.
    pub fn get_index(&self, s: i64, p: i64, o: i64) -> Permutation {
        use Permutation::*;
        if s >= 0 {
            if p >= 0 || (p == JOIN_VARIABLE && o < 0) {
                return Spo;
            }
            return Sop;
        }
        if o >= 0 {
            if p >= 0 || p == JOIN_VARIABLE {
                return Ops;
            }
            return Osp;
        }
        if p >= 0 {
            if o >= 0 || o == JOIN_VARIABLE {
                return Pos;
            }
            return Pso;
        }
        if s == JOIN_VARIABLE {
            if p != VARIABLE || o == VARIABLE {
                return Spo;
            }
            return Sop;
        }
        if o == JOIN_VARIABLE {
            if p != VARIABLE || s == VARIABLE {
                return Ops;
            }
            return Osp;
        }
        if p == JOIN_VARIABLE {
            if o != VARIABLE || s == VARIABLE {
                return Pos;
            }
            return Pso;
        }
        Spo
    }

    /// The triples matching (s, p, o), walked in the order of `perm`.
    #[instrument(level = "trace", skip(self))]
    pub fn get(&mut self, perm: Permutation, s: i64, p: i64, o: i64) -> Result<BoxedItr> {
        if !self.catalog.present(perm) {
            return self.reordered(perm, s, p, o);
        }
        let [key, v1, v2] = perm.permute([s, p, o]).map(bound);
        match key {
            | Some(key) => self.compose(perm, key, v1, v2),
            | None => self.scan(perm),
        }
    }

    /// Like [`Querier::get`] with the values given in the column order of
    /// `perm`.
    pub fn get_permuted(
        &mut self,
        perm: Permutation,
        v1: i64,
        v2: i64,
        v3: i64,
        ignore_second: bool,
    ) -> Result<BoxedItr> {
        let [s, p, o] = perm.unpermute([v1, v2, v3]);
        let mut itr = self.get(perm, s, p, o)?;
        if ignore_second {
            itr.ignore_second_column()?;
        }
        Ok(itr)
    }

    /// Iterators are released by dropping them.
    pub fn release_itr(&mut self, itr: BoxedItr) {
        drop(itr);
    }

    /// The pairs of `key` in the base knowledge base only.
    fn kb_iterator(&mut self, perm: Permutation, key: i64, v1: Option<i64>, v2: Option<i64>) -> Result<BoxedItr> {
        match self.coordinates(key)? {
            | Some(coords) => self.catalog.lookup(perm, key, &coords, v1, v2, &self.sessions),
            | None => {
                let mut empty = EmptyItr::new();
                empty.set_key(key);
                Ok(Box::new(empty))
            },
        }
    }

    /// The pairs of a bound key with every update merged in. Additions are
    /// unioned, deletions subtract everything merged before them.
    fn compose(&mut self, perm: Permutation, key: i64, v1: Option<i64>, v2: Option<i64>) -> Result<BoxedItr> {
        if v1.is_none() && v2.is_some() {
            // the second column alone is bound: read the reverse and swap back
            let mut rev = self.compose(perm.reverse(), key, v2, None)?;
            return Ok(Box::new(Catalog::reversed(rev.as_mut(), key, None, None)?));
        }
        let mut out = self.kb_iterator(perm, key, v1, v2)?;
        if self.diffs.is_empty() {
            return Ok(out);
        }

        // value1 groups visible so far, to size the composed iterators when
        // the second column is ignored
        let track = v2.is_none();
        let mut view = if track {
            groups_of(self.kb_iterator(perm, key, v1, None)?)?
        } else {
            BTreeMap::new()
        };
        let mut view_at_out = view.clone();
        let mut extra: Vec<BoxedItr> = Vec::new();

        for diff in self.diffs.clone() {
            let mut itr = diff.iterator(perm, Some(key), v1, v2)?;
            if !itr.has_next()? {
                continue;
            }
            let groups = if track {
                groups_of(diff.iterator(perm, Some(key), v1, None)?)?
            } else {
                BTreeMap::new()
            };
            match diff.kind() {
                | DiffKind::Addition => {
                    for (g, n) in groups {
                        *view.entry(g).or_default() += n;
                    }
                    extra.push(itr);
                },
                | DiffKind::Deletion => {
                    if !extra.is_empty() {
                        out = merge_composite(mem::take(&mut extra), out, &view, &view_at_out);
                    }
                    let before = view.len();
                    for (g, n) in groups {
                        if let Some(c) = view.get_mut(&g) {
                            *c = c.saturating_sub(n);
                            if *c == 0 {
                                view.remove(&g);
                            }
                        }
                    }
                    out = Box::new(RmItr::new(out, itr, (before - view.len()) as u64));
                    view_at_out = view.clone();
                },
            }
        }
        if !extra.is_empty() {
            out = merge_composite(extra, out, &view, &view_at_out);
        }
        Ok(out)
    }

    /// Every triple of `perm` with the updates merged in.
    fn scan(&mut self, perm: Permutation) -> Result<BoxedItr> {
        let mut out = self.catalog.scan(perm)?;
        let mut extra: Vec<BoxedItr> = Vec::new();
        for diff in self.diffs.iter() {
            let mut itr = diff.iterator(perm, None, None, None)?;
            if !itr.has_next()? {
                continue;
            }
            match diff.kind() {
                | DiffKind::Addition => extra.push(itr),
                | DiffKind::Deletion => {
                    if !extra.is_empty() {
                        extra.push(out);
                        out = Box::new(CompositeScanItr::new(mem::take(&mut extra)));
                    }
                    out = Box::new(RmItr::new(out, itr, diff.unique_n_first_terms(perm)));
                },
            }
        }
        if !extra.is_empty() {
            extra.push(out);
            out = Box::new(CompositeScanItr::new(extra));
        }
        Ok(out)
    }

    /// Serves a permutation that is not stored by re-sorting the matching
    /// triples of SPO.
    fn reordered(&mut self, perm: Permutation, s: i64, p: i64, o: i64) -> Result<BoxedItr> {
        if !self.catalog.present(Permutation::Spo) {
            return Err(TridentError::corrupt("knowledge base without an SPO index"));
        }
        let selector = [s, p, o].map(bound);
        let cache = self.reorder_cache.clone().filter(|_| self.diffs.is_empty());
        if let Some(dir) = &cache {
            if let Some(itr) = ReOrderItr::load(dir, perm, selector)? {
                trace!(%perm, "reloaded reordered relation");
                return Ok(Box::new(itr));
            }
        }
        let mut source = self.get(Permutation::Spo, s, p, o)?;
        let itr = ReOrderItr::new(source.as_mut(), Permutation::Spo, perm, selector)?;
        if let Some(dir) = &cache {
            itr.dump(dir, selector)?;
        }
        Ok(Box::new(itr))
    }

    /// The value1 groups of `key` in `perm` and their sizes.
    pub(crate) fn value1_groups(&mut self, perm: Permutation, key: i64, v1: Option<i64>) -> Result<BTreeMap<i64, u64>> {
        let [s, p, o] = perm.unpermute([Some(key), v1, None].map(|v| v.unwrap_or(VARIABLE)));
        let itr = self.get(perm, s, p, o)?;
        groups_of(itr)
    }

    /// The keys of `perm` in the base knowledge base. With `enforce` only the
    /// permutation's own tables are consulted.
    pub fn get_kb_term_list(&self, perm: Permutation, enforce: bool) -> Result<BoxedItr> {
        match self.catalog.term_list(perm, enforce)? {
            | Some(itr) => Ok(Box::new(itr)),
            | None => Err(TridentError::Unsupported("term list of a permutation that is not stored")),
        }
    }

    /// The keys of `perm` with the number of triples under each, counting
    /// the updates.
    pub fn get_term_list(&self, perm: Permutation) -> Result<BoxedItr> {
        let mut out = self.get_kb_term_list(perm, false)?;
        for diff in self.diffs.iter().filter(|d| d.size() > 0) {
            out = match diff.kind() {
                | DiffKind::Addition => Box::new(CompositeTermItr::new(vec![out, diff.term_list(perm)?])) as BoxedItr,
                | DiffKind::Deletion => Box::new(RmCompositeTermItr::new(out, diff.term_list(perm)?)),
            };
        }
        Ok(out)
    }

    fn summary_diff(&self, kind: DiffKind) -> Result<Option<BoxedItr>> {
        let mut out: Option<BoxedItr> = None;
        for diff in self.diffs.iter().filter(|d| d.size() > 0) {
            let itr = diff.iterator(Permutation::Spo, None, None, None)?;
            out = if diff.kind() == kind {
                Some(match out {
                    | None => itr,
                    | Some(prev) => Box::new(CompositeScanItr::new(vec![prev, itr])),
                })
            } else {
                out.map(|prev| Box::new(RmItr::new(prev, itr, 0)) as BoxedItr)
            };
        }
        Ok(out)
    }

    /// Triples added by the updates and not removed by later ones, in SPO.
    pub fn summary_add_diff(&self) -> Result<Option<BoxedItr>> {
        self.summary_diff(DiffKind::Addition)
    }

    /// Triples removed by the updates and not added back later, in SPO.
    pub fn summary_rm_diff(&self) -> Result<Option<BoxedItr>> {
        self.summary_diff(DiffKind::Deletion)
    }

    pub fn exists(&mut self, s: i64, p: i64, o: i64) -> Result<bool> {
        let perm = self.get_index(s, p, o);
        self.get(perm, s, p, o)?.has_next()
    }

    pub fn is_empty(&mut self, s: i64, p: i64, o: i64) -> Result<bool> {
        if s < 0 && p < 0 && o < 0 {
            return Ok(self.get_input_size() == 0);
        }
        Ok(!self.exists(s, p, o)?)
    }

    pub fn exist_key(&mut self, perm: Permutation, key: i64) -> Result<bool> {
        self.get_permuted(perm, key, VARIABLE, VARIABLE, true)?
            .has_next()
    }

    /// The pairs of `itr` with its value columns swapped, restricted to the
    /// given constraints.
    pub fn new_itr_on_reverse(&self, itr: &mut dyn PairItr, v1: Option<i64>, v2: Option<i64>) -> Result<ArrayItr> {
        let key = itr.key();
        Catalog::reversed(itr, key, v1, v2)
    }

    /// Number of triples under `key` in `perm`, counting the updates.
    fn key_card(&mut self, perm: Permutation, key: i64) -> Result<u64> {
        let base = match self.coordinates(key)? {
            | Some(c) if c.exists(perm) => c.n_elements(perm),
            | Some(c) => c.n_elements(perm.reverse()),
            | None => 0,
        };
        self.adjust(base, |d| d.card(perm, key))
    }

    /// Exact number of triples matching (s, p, o).
    pub fn get_card(&mut self, s: i64, p: i64, o: i64) -> Result<u64> {
        let spo = [s, p, o];
        let unbound = n_unbound(spo);
        if unbound == 3 {
            return Ok(self.get_input_size());
        }
        let perm = self.get_index(s, p, o);
        if unbound == 2 && self.catalog.present(perm) {
            let key = perm.permute(spo)[0];
            return self.key_card(perm, key);
        }
        let mut itr = self.get(perm, s, p, o)?;
        if !itr.has_next()? {
            return Ok(0);
        }
        if unbound == 0 {
            return Ok(1);
        }
        itr.cardinality()
    }

    /// Number of distinct values component `pos` (0 subject, 1 predicate,
    /// 2 object) takes among the triples matching (s, p, o).
    pub fn get_card_column(&mut self, s: i64, p: i64, o: i64, pos: usize) -> Result<u64> {
        use Permutation::*;
        let spo = [s, p, o];
        let unbound = n_unbound(spo);
        if unbound == 3 {
            return Err(TridentError::Unsupported("distinct values of an unbound pattern"));
        }
        if pos > 2 || spo[pos] >= 0 {
            return Err(TridentError::misuse(format!("position {pos} is not a variable of the pattern")));
        }
        let perm = self.get_index(s, p, o);
        let mut itr = self.get(perm, s, p, o)?;
        if !itr.has_next()? {
            return Ok(0);
        }
        match unbound {
            | 0 => Ok(1),
            | 1 => itr.cardinality(),
            | _ => {
                let grouped = if s >= 0 {
                    if pos == 2 { Sop } else { Spo }
                } else if p >= 0 {
                    if pos == 0 { Pso } else { Pos }
                } else if pos == 0 {
                    Osp
                } else {
                    Ops
                };
                if grouped != perm {
                    itr = self.get(grouped, s, p, o)?;
                }
                itr.ignore_second_column()?;
                itr.cardinality()
            },
        }
    }

    /// Cardinality of (s, p, o) read through `perm`. With `skip_last` the
    /// last column is collapsed, counting distinct (key, value1) groups.
    pub fn get_card_on_index(&mut self, perm: Permutation, s: i64, p: i64, o: i64, skip_last: bool) -> Result<u64> {
        let spo = [s, p, o];
        let key = perm.permute(spo)[0];
        if key < 0 && !skip_last {
            return Ok(self.get_input_size());
        }
        let mut itr = self.get(perm, s, p, o)?;
        if !itr.has_next()? {
            return Ok(0);
        }
        match n_unbound(spo) {
            | 0 => Ok(1),
            | 1 if skip_last => Ok(1),
            | 1 => itr.cardinality(),
            | _ if skip_last => {
                itr.ignore_second_column()?;
                itr.cardinality()
            },
            | _ => {
                drop(itr);
                self.key_card(perm, key)
            },
        }
    }

    /// A cheap estimate of the number of triples matching (s, p, o).
    pub fn est_card(&mut self, s: i64, p: i64, o: i64) -> Result<u64> {
        let spo = [s, p, o];
        match n_unbound(spo) {
            | 3 => Ok(self.get_input_size()),
            | 0 => Ok(1),
            | 1 => {
                let perm = self.get_index(s, p, o);
                self.get(perm, s, p, o)?.est_cardinality()
            },
            | _ => {
                let perm = self.get_index(s, p, o);
                let key = perm.permute(spo)[0];
                self.key_card(perm, key)
            },
        }
    }

    /// Like [`Querier::est_card`] through a given permutation.
    pub fn est_card_on_index(&mut self, perm: Permutation, s: i64, p: i64, o: i64) -> Result<u64> {
        let spo = [s, p, o];
        let [key, second, _] = perm.permute(spo);
        if key < 0 {
            return Ok(self.get_input_size());
        }
        match n_unbound(spo) {
            | 0 => Ok(1),
            | 1 if second >= 0 => self.get(perm, s, p, o)?.est_cardinality(),
            | _ => self.key_card(perm, key),
        }
    }

    /// For POS and PSO lookups served by an aggregated table, the number of
    /// second-level tables the lookup expands; zero otherwise.
    pub fn is_aggregated(&mut self, perm: Permutation, s: i64, p: i64, o: i64) -> Result<u64> {
        if !matches!(perm, Permutation::Pos | Permutation::Pso) || p < 0 {
            return Ok(0);
        }
        let Some(coord) = self.coordinates(p)?.and_then(|c| c.get(perm)) else {
            return Ok(0);
        };
        if !StorageStrat::from_byte(coord.strat)?.is_aggregated() {
            return Ok(0);
        }
        if (perm == Permutation::Pso && s >= 0) || (perm == Permutation::Pos && o >= 0) {
            return Ok(1);
        }
        let mut itr = self.kb_iterator(perm, p, None, None)?;
        itr.ignore_second_column()?;
        itr.cardinality()
    }

    /// For reverse permutations whose table under the pattern's key was
    /// skipped, the number of pairs that must be reversed in memory; the
    /// input size when the key is unbound; zero otherwise.
    pub fn is_reverse(&mut self, perm: Permutation, s: i64, p: i64, o: i64) -> Result<u64> {
        if !perm.is_reverse() {
            return Ok(0);
        }
        let key = perm.permute([s, p, o])[0];
        if key < 0 {
            return Ok(self.get_input_size());
        }
        Ok(match self.coordinates(key)? {
            | Some(c) if !c.exists(perm) && c.exists(perm.reverse()) => c.n_elements(perm.reverse()),
            | _ => 0,
        })
    }
}

/// Unions `extra` with `out`, the iterator over everything merged so far.
fn merge_composite(
    mut extra: Vec<BoxedItr>,
    out: BoxedItr,
    view: &BTreeMap<i64, u64>,
    view_at_out: &BTreeMap<i64, u64>,
) -> BoxedItr {
    let new_groups = view.keys().filter(|g| !view_at_out.contains_key(g)).count() as u64;
    extra.push(out);
    let kb_child = extra.len() - 1;
    Box::new(CompositeItr::new(extra, new_groups, Some(kb_child)))
}

impl Drop for Querier {
    fn drop(&mut self) {
        if let Err(e) = self.catalog.close_sessions(&self.sessions) {
            warn!(error = %e, "failed to close querier sessions");
        }
    }
}
