// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::{
    collections::BTreeMap,
    fs,
    path::{
        Path,
        PathBuf,
    },
    thread,
};

use tracing::{
    debug,
    info,
    instrument,
};

use crate::{
    codec,
    config::KbConfig,
    dict::{
        Dict,
        DictMgmt,
    },
    errs::{
        Result,
        TridentError,
    },
    kb::{
        catalog::{
            aggregation_target,
            pack_coordinate,
            CatalogStats,
        },
        storage_dir,
        KbStats,
        DICT_DIR,
        DIFF_DIR,
        E2R_FILE,
        E2S_FILE,
        TREE_DIR,
    },
    perm::{
        Permutation,
        ALL_PERMUTATIONS,
    },
    table::{
        inserter::inserter_for,
        storage::TableStorage,
        strategy::{
            storable_width,
            StorageStrat,
            StrategyParams,
        },
    },
    tree::{
        Coordinate,
        TermCoordinates,
        Tree,
    },
};

const MAX_TERM: u64 = (1 << 40) - 1;

/// The permutations materialized for a given index count.
pub(crate) fn permutations_for(n_indices: usize) -> Result<&'static [Permutation]> {
    match n_indices {
        | 1 => Ok(&ALL_PERMUTATIONS[..1]),
        | 3 => Ok(&ALL_PERMUTATIONS[..3]),
        | 6 => Ok(&ALL_PERMUTATIONS),
        | n => Err(TridentError::misuse(format!("cannot build {n} indices"))),
    }
}

#[derive(Clone, Copy)]
struct BuildPlan {
    incomplete: bool,
    threshold_skip_table: u64,
    parallel: bool,
    params: StrategyParams,
}

/// The tables one permutation ended up with.
struct PermOutput {
    perm: Permutation,
    coords: Vec<(u64, Coordinate)>,
    n_tables: u64,
    n_first_terms: u64,
}

/// Rows of an aggregated table: every distinct value1 with the packed
/// location of its table in `targets`.
fn aggregate(pairs: &[(u64, u64)], targets: &[(u64, Coordinate)]) -> Result<(StorageStrat, Vec<(u64, u64)>)> {
    let mut rows = Vec::new();
    for group in pairs.chunk_by(|a, b| a.0 == b.0) {
        let v1 = group[0].0;
        let coord = targets
            .binary_search_by_key(&v1, |(k, _)| *k)
            .map(|i| targets[i].1)
            .map_err(|_| TridentError::corrupt(format!("no table of {v1} to aggregate into")))?;
        rows.push((v1, pack_coordinate(coord.file, coord.mark, coord.strat)? as u64));
    }
    let max1 = rows.last().map_or(0, |r| r.0);
    let strat = StorageStrat::aggregated_row(storable_width(codec::num_bytes(max1)), 8)?;
    Ok((strat, rows))
}

fn build_permutation(
    dir: &Path,
    cfg: &KbConfig,
    triples: &[[u64; 3]],
    perm: Permutation,
    targets: Option<&[(u64, Coordinate)]>,
    plan: BuildPlan,
) -> Result<PermOutput> {
    let storage = TableStorage::open(&storage_dir(dir, perm), cfg)?;
    let mut rows: Vec<[u64; 3]> = triples.iter().map(|t| perm.permute(*t)).collect();
    rows.sort_unstable();

    let skip_small = plan.incomplete && perm.is_reverse();
    let mut out = PermOutput {
        perm,
        coords: Vec::new(),
        n_tables: 0,
        n_first_terms: 0,
    };
    let mut skipped = 0u64;
    for group in rows.chunk_by(|a, b| a[0] == b[0]) {
        let key = group[0][0];
        let pairs: Vec<(u64, u64)> = group.iter().map(|r| (r[1], r[2])).collect();
        out.n_first_terms += pairs.chunk_by(|a, b| a.0 == b.0).count() as u64;
        if skip_small && (pairs.len() as u64) < plan.threshold_skip_table {
            skipped += 1;
            continue;
        }
        let (strat, stored) = match targets {
            | Some(t) if StorageStrat::determine_aggregated(&pairs) => aggregate(&pairs, t)?,
            | _ => (StorageStrat::determine(&pairs, &plan.params)?, pairs.clone()),
        };
        let inserter = inserter_for(strat, storage.offload_threshold(), storage.dir().to_path_buf());
        let (file, mark) = storage.start_append(key, strat, inserter)?;
        for (v1, v2) in stored {
            storage.append(v1, v2)?;
        }
        storage.stop_append()?;
        out.coords.push((
            key,
            Coordinate {
                file,
                mark,
                strat: strat.byte(),
                n_elements: pairs.len() as u64,
            },
        ));
        out.n_tables += 1;
    }
    storage.stop_insert()?;
    debug!(%perm, tables = out.n_tables, skipped, "wrote permutation");
    Ok(out)
}

/// Builds every job, one worker thread per permutation when allowed.
fn run_phase(
    dir: &Path,
    cfg: &KbConfig,
    triples: &[[u64; 3]],
    jobs: &[(Permutation, Option<&[(u64, Coordinate)]>)],
    plan: BuildPlan,
) -> Result<Vec<PermOutput>> {
    if !plan.parallel || jobs.len() < 2 {
        return jobs
            .iter()
            .map(|(perm, targets)| build_permutation(dir, cfg, triples, *perm, *targets, plan))
            .collect();
    }
    let (tx, rx) = crossbeam_channel::bounded(jobs.len());
    thread::scope(|scope| {
        for (perm, targets) in jobs {
            let tx = tx.clone();
            scope.spawn(move || {
                let out = build_permutation(dir, cfg, triples, *perm, *targets, plan);
                // capacity covers every job, so this never blocks
                let _ = tx.send(out);
            });
        }
    });
    drop(tx);
    rx.iter().collect()
}

/// Writes the tables of `perms` for the distinct `triples` into `dir`, then
/// the tree locating them. With `aggregated`, POS and PSO are written after
/// OPS and SPO so their aggregated tables can point into them.
#[instrument(level = "debug", skip(cfg, triples), fields(n = triples.len()))]
pub(crate) fn write_permutations(
    dir: &Path,
    cfg: &KbConfig,
    triples: &[[u64; 3]],
    perms: &[Permutation],
    aggregated: bool,
    incomplete: bool,
) -> Result<CatalogStats> {
    let plan = BuildPlan {
        incomplete,
        threshold_skip_table: cfg.threshold_skip_table(),
        parallel: cfg.parallel_build(),
        params: StrategyParams::from(cfg),
    };
    let deferred: Vec<Permutation> = perms
        .iter()
        .copied()
        .filter(|p| aggregated && aggregation_target(*p).is_some_and(|t| perms.contains(&t)))
        .collect();
    let first: Vec<(Permutation, Option<&[(u64, Coordinate)]>)> = perms
        .iter()
        .filter(|p| !deferred.contains(p))
        .map(|p| (*p, None))
        .collect();
    let mut outputs = run_phase(dir, cfg, triples, &first, plan)?;

    if !deferred.is_empty() {
        let second: Vec<(Permutation, Option<&[(u64, Coordinate)]>)> = deferred
            .iter()
            .map(|p| {
                let targets = aggregation_target(*p)
                    .and_then(|t| outputs.iter().find(|o| o.perm == t))
                    .map(|o| o.coords.as_slice());
                (*p, targets)
            })
            .collect();
        let more = run_phase(dir, cfg, triples, &second, plan)?;
        outputs.extend(more);
    }

    let mut stats = CatalogStats {
        n_triples: triples.len() as u64,
        ..Default::default()
    };
    let mut merged: BTreeMap<u64, TermCoordinates> = BTreeMap::new();
    for out in &outputs {
        stats.n_tables[out.perm.index()] = out.n_tables;
        stats.n_first_terms[out.perm.index()] = out.n_first_terms;
        for (key, coord) in &out.coords {
            merged.entry(*key).or_default().set(out.perm, *coord);
        }
    }
    stats.n_terms = merged.len() as u64;

    let tree: Tree<u64, TermCoordinates> = Tree::open(&dir.join(TREE_DIR), cfg)?;
    for (key, coords) in merged {
        tree.append(key, coords)?;
    }
    tree.flush()?;
    Ok(stats)
}

/// Builds a knowledge base from scratch: terms go through the dictionary,
/// triples are buffered and written out by [`KbBuilder::build`].
pub struct KbBuilder {
    dir: PathBuf,
    cfg: KbConfig,
    dict: DictMgmt,
    next_id: u64,
    triples: Vec<[u64; 3]>,
}

impl KbBuilder {
    #[instrument(level = "debug", skip(cfg))]
    pub fn new(dir: &Path, cfg: KbConfig) -> Result<Self> {
        let mut cfg = cfg;
        cfg.set_read_only(false);
        permutations_for(cfg.n_indices())?;
        if KbStats::exists(dir) {
            return Err(TridentError::misuse(format!(
                "{} already holds a knowledge base",
                dir.display()
            )));
        }
        fs::create_dir_all(dir)?;
        let main = Dict::open(&dir.join(DICT_DIR).join("0"), &cfg)?;
        let dict = DictMgmt::open(
            main,
            false,
            &dir.join(DIFF_DIR),
            &dir.join(E2R_FILE),
            &dir.join(E2S_FILE),
        )?;
        Ok(Self {
            dir: dir.to_path_buf(),
            cfg,
            dict,
            next_id: 0,
            triples: Vec::new(),
        })
    }

    pub fn dict(&self) -> &DictMgmt {
        &self.dict
    }

    /// The id of `text`, assigning the next free id to a new term.
    pub fn add_term(&mut self, text: &[u8]) -> Result<u64> {
        let (added, id) = self.dict.put_pair(text, self.next_id)?;
        if added {
            self.next_id += 1;
        }
        Ok(id)
    }

    pub fn add_triple(&mut self, s: u64, p: u64, o: u64) -> Result<()> {
        if let Some(bad) = [s, p, o].into_iter().find(|v| *v > MAX_TERM) {
            return Err(TridentError::misuse(format!("term {bad} exceeds 40 bits")));
        }
        self.next_id = self.next_id.max(s.max(p).max(o) + 1);
        self.triples.push([s, p, o]);
        Ok(())
    }

    /// Adds a triple of texts, returning their ids.
    pub fn add_text_triple(&mut self, s: &[u8], p: &[u8], o: &[u8]) -> Result<[u64; 3]> {
        let ids = [self.add_term(s)?, self.add_term(p)?, self.add_term(o)?];
        self.add_triple(ids[0], ids[1], ids[2])?;
        Ok(ids)
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    #[instrument(level = "debug", skip(self), fields(dir = %self.dir.display()))]
    pub fn build(self) -> Result<KbStats> {
        let mut triples = self.triples;
        triples.sort_unstable();
        triples.dedup();
        let perms = permutations_for(self.cfg.n_indices())?;
        let catalog = write_permutations(
            &self.dir,
            &self.cfg,
            &triples,
            perms,
            self.cfg.aggr_indices(),
            self.cfg.incomplete_indices(),
        )?;
        self.dict.flush()?;

        let stats = KbStats {
            dict_partitions: 1,
            n_terms: catalog.n_terms.max(self.dict.n_terms_inserted()),
            n_triples: catalog.n_triples,
            next_id: self.next_id,
            n_indices: perms.len() as u8,
            aggr_indices: self.cfg.aggr_indices(),
            incomplete_indices: self.cfg.incomplete_indices(),
            n_tables: catalog.n_tables,
            n_first_terms: catalog.n_first_terms,
            rels_ids_separated: self.cfg.rels_ids_separated(),
        };
        stats.write(&self.dir)?;
        info!(dir = %self.dir.display(), triples = stats.n_triples, terms = stats.n_terms, "built knowledge base");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> KbConfig {
        let mut cfg = KbConfig::for_writing();
        cfg.set_tree_max_elements_node(8)
            .set_threshold_skip_table(2)
            .set_parallel_build(false);
        cfg
    }

    #[test]
    fn test_write_permutations_counts() {
        let dir = tempfile::tempdir().unwrap();
        let triples = vec![[1, 1, 2], [1, 1, 3], [2, 1, 3]];
        let stats = write_permutations(dir.path(), &small_cfg(), &triples, &ALL_PERMUTATIONS, false, false).unwrap();
        assert_eq!(stats.n_triples, 3);
        assert_eq!(stats.n_terms, 3);
        // POS: key 1 only, groups o=2 and o=3
        assert_eq!(stats.n_tables[Permutation::Pos.index()], 1);
        assert_eq!(stats.n_first_terms[Permutation::Pos.index()], 2);
        // SPO: keys 1 and 2
        assert_eq!(stats.n_tables[Permutation::Spo.index()], 2);
        assert_eq!(stats.n_first_terms[Permutation::Spo.index()], 2);

        let mut cfg = small_cfg();
        cfg.set_read_only(true);
        let tree: Tree<u64, TermCoordinates> = Tree::open(&dir.path().join(TREE_DIR), &cfg).unwrap();
        let c = tree.get(&1).unwrap().unwrap();
        assert_eq!(c.n_elements(Permutation::Pos), 3);
        assert_eq!(c.n_elements(Permutation::Spo), 2);
        assert!(!c.exists(Permutation::Ops));
    }

    #[test]
    fn test_incomplete_skips_small_reverse_tables() {
        let dir = tempfile::tempdir().unwrap();
        let triples = vec![[1, 1, 2], [1, 1, 3], [2, 1, 3]];
        let mut cfg = small_cfg();
        cfg.set_parallel_build(true);
        let stats = write_permutations(dir.path(), &cfg, &triples, &ALL_PERMUTATIONS, false, true).unwrap();
        // SOP key 2 has one pair and is skipped, key 1 has two and is kept
        assert_eq!(stats.n_tables[Permutation::Sop.index()], 1);
        assert_eq!(stats.n_tables[Permutation::Spo.index()], 2);
        assert_eq!(stats.n_first_terms[Permutation::Sop.index()], 3);
    }

    #[test]
    fn test_builder_rejects_existing_kb_and_wide_terms() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = KbBuilder::new(dir.path(), small_cfg()).unwrap();
        assert!(b.add_triple(1 << 41, 0, 0).unwrap_err().is_misuse());
        let ids = b.add_text_triple(b"<a>", b"<knows>", b"<b>").unwrap();
        assert_eq!(ids, [0, 1, 2]);
        assert_eq!(b.add_term(b"<knows>").unwrap(), 1);
        assert_eq!(b.len(), 1);
        b.build().unwrap();
        assert!(KbBuilder::new(dir.path(), small_cfg()).is_err());

        let other = tempfile::tempdir().unwrap();
        let mut cfg = small_cfg();
        cfg.set_n_indices(2);
        assert!(KbBuilder::new(other.path(), cfg).is_err());
    }
}
