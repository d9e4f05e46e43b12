// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! A knowledge base on disk: the permutations, the tree locating their
//! tables, the dictionary and any updates layered on top.

use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use bytes::{
    Buf,
    BufMut,
    BytesMut,
};
use parking_lot::{
    Mutex,
    RwLock,
};
use tracing::{
    debug,
    info,
    instrument,
    warn,
};

use crate::{
    config::KbConfig,
    dict::{
        Dict,
        DictMgmt,
    },
    diff::{
        create_diff_index,
        open_diff_index,
        DiffIndex,
        DiffKind,
    },
    errs::{
        Result,
        TridentError,
    },
    perm::Permutation,
    stats::{
        QueryStats,
        StatsSnapshot,
    },
    table::storage::TableStorage,
    tree::Tree,
};

pub mod batch;
pub mod builder;
pub mod catalog;
pub mod querier;

#[cfg(test)]
mod test;

pub use batch::{
    BatchDumper,
    BatchReader,
};
pub use builder::KbBuilder;
pub use catalog::{
    Catalog,
    CatalogStats,
};
pub use querier::Querier;

pub(crate) const KBSTATS_FILE: &str = "kbstats";
pub(crate) const TREE_DIR: &str = "tree";
pub(crate) const DICT_DIR: &str = "dict";
pub(crate) const DIFF_DIR: &str = "_diff";
pub(crate) const E2R_FILE: &str = "e2r";
pub(crate) const E2S_FILE: &str = "e2s";

/// Directory of the table storage of `perm`.
pub(crate) fn storage_dir(dir: &Path, perm: Permutation) -> PathBuf {
    dir.join(format!("p{}", perm.index()))
}

/// The persistent summary of a knowledge base, kept in `kbstats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KbStats {
    pub dict_partitions: u32,
    pub n_terms: u64,
    pub n_triples: u64,
    /// Smallest id never handed out.
    pub next_id: u64,
    pub n_indices: u8,
    pub aggr_indices: bool,
    pub incomplete_indices: bool,
    pub n_tables: [u64; 6],
    pub n_first_terms: [u64; 6],
    pub rels_ids_separated: bool,
}

impl KbStats {
    const ENCODED_LEN: usize = 4 + 8 * 3 + 1 + 1 + 1 + 6 * 16 + 1;

    pub(crate) fn exists(dir: &Path) -> bool {
        dir.join(KBSTATS_FILE).exists()
    }

    pub(crate) fn write(&self, dir: &Path) -> Result<()> {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN + 4);
        buf.put_u32_le(self.dict_partitions);
        buf.put_u64_le(self.n_terms);
        buf.put_u64_le(self.n_triples);
        buf.put_u64_le(self.next_id);
        buf.put_u8(self.n_indices);
        buf.put_u8(self.aggr_indices as u8);
        buf.put_u8(self.incomplete_indices as u8);
        for i in 0..6 {
            buf.put_u64_le(self.n_tables[i]);
            buf.put_u64_le(self.n_first_terms[i]);
        }
        buf.put_u8(self.rels_ids_separated as u8);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        fs::write(dir.join(KBSTATS_FILE), &buf)?;
        Ok(())
    }

    pub(crate) fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(KBSTATS_FILE);
        let data = fs::read(&path)?;
        if data.len() != Self::ENCODED_LEN + 4 {
            return Err(TridentError::corrupt(format!(
                "{} holds {} bytes",
                path.display(),
                data.len()
            )));
        }
        let (body, mut trailer) = data.split_at(Self::ENCODED_LEN);
        if crc32fast::hash(body) != trailer.get_u32_le() {
            return Err(TridentError::corrupt(format!(
                "checksum mismatch in {}",
                path.display()
            )));
        }
        let mut buf = body;
        let mut stats = KbStats {
            dict_partitions: buf.get_u32_le(),
            n_terms: buf.get_u64_le(),
            n_triples: buf.get_u64_le(),
            next_id: buf.get_u64_le(),
            n_indices: buf.get_u8(),
            aggr_indices: buf.get_u8() != 0,
            incomplete_indices: buf.get_u8() != 0,
            ..Default::default()
        };
        for i in 0..6 {
            stats.n_tables[i] = buf.get_u64_le();
            stats.n_first_terms[i] = buf.get_u64_le();
        }
        stats.rels_ids_separated = buf.get_u8() != 0;
        Ok(stats)
    }

    pub(crate) fn catalog_stats(&self) -> CatalogStats {
        CatalogStats {
            n_triples: self.n_triples,
            n_terms: self.n_terms,
            n_tables: self.n_tables,
            n_first_terms: self.n_first_terms,
        }
    }
}

/// Opens every numbered update under `dir` in creation order.
fn load_diffs(dir: &Path, cfg: &KbConfig, qstats: &Arc<QueryStats>) -> Result<(Vec<Arc<dyn DiffIndex>>, u64)> {
    if !dir.exists() {
        return Ok((Vec::new(), 0));
    }
    let mut numbered = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
            numbered.push(n);
        }
    }
    numbered.sort_unstable();
    let next = numbered.last().map_or(0, |n| n + 1);
    let mut diffs = Vec::with_capacity(numbered.len());
    for n in numbered {
        diffs.push(open_diff_index(&dir.join(n.to_string()), cfg, qstats.clone())?);
    }
    Ok((diffs, next))
}

/// An open knowledge base. Shared between threads; each thread queries it
/// through its own [`Querier`].
pub struct Kb {
    dir: PathBuf,
    cfg: KbConfig,
    stats: KbStats,
    catalog: Arc<Catalog>,
    dict: Arc<DictMgmt>,
    diffs: RwLock<Vec<Arc<dyn DiffIndex>>>,
    // number of the next update directory; held while an update is written
    next_diff: Mutex<u64>,
    qstats: Arc<QueryStats>,
}

impl Kb {
    /// Opens the knowledge base in `dir`. The index layout recorded at build
    /// time takes precedence over the one in `cfg`.
    #[instrument(level = "debug", skip(cfg))]
    pub fn open(dir: &Path, cfg: KbConfig) -> Result<Self> {
        let stats = KbStats::read(dir)?;
        let qstats = Arc::new(QueryStats::default());

        let mut storages: [Option<Arc<TableStorage>>; 6] = Default::default();
        for perm in builder::permutations_for(stats.n_indices as usize)? {
            storages[perm.index()] = Some(Arc::new(TableStorage::open(&storage_dir(dir, *perm), &cfg)?));
        }
        let tree = Arc::new(Tree::open(&dir.join(TREE_DIR), &cfg)?);
        let catalog = Arc::new(Catalog::new(storages, tree, stats.catalog_stats(), qstats.clone()));

        let dict_dir = dir.join(DICT_DIR);
        let main = Dict::open(&dict_dir.join("0"), &cfg)?;
        let mut dict = DictMgmt::open(
            main,
            cfg.read_only(),
            &dir.join(DIFF_DIR),
            &dir.join(E2R_FILE),
            &dir.join(E2S_FILE),
        )?;
        let mut partitions = Vec::new();
        for i in 1..stats.dict_partitions {
            partitions.push(Dict::open(&dict_dir.join(i.to_string()), &cfg)?);
        }
        dict.add_updates(partitions)?;

        let (diffs, next_diff) = load_diffs(&dir.join(DIFF_DIR), &cfg, &qstats)?;
        info!(
            dir = %dir.display(),
            triples = stats.n_triples,
            indices = stats.n_indices,
            updates = diffs.len(),
            "opened knowledge base"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            cfg,
            stats,
            catalog,
            dict: Arc::new(dict),
            diffs: RwLock::new(diffs),
            next_diff: Mutex::new(next_diff),
            qstats,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stats(&self) -> &KbStats {
        &self.stats
    }

    pub fn dict(&self) -> &Arc<DictMgmt> {
        &self.dict
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn n_updates(&self) -> usize {
        self.diffs.read().len()
    }

    /// Counters accumulated by every querier of this knowledge base.
    pub fn query_stats(&self) -> StatsSnapshot {
        self.qstats.snapshot()
    }

    /// A querier over the base and the updates applied so far.
    pub fn query(&self) -> Result<Querier> {
        Querier::new(self.catalog.clone(), self.diffs.read().clone())
    }

    /// Layers the addition or deletion of `triples` over the knowledge base.
    /// Returns whether anything changed. Queriers created earlier keep their
    /// view.
    #[instrument(level = "debug", skip(self, triples), fields(n = triples.len()))]
    pub fn apply_update(&self, kind: DiffKind, triples: Vec<[i64; 3]>) -> Result<bool> {
        let mut next = self.next_diff.lock();
        let dir = self.dir.join(DIFF_DIR).join(next.to_string());
        let mut querier = self.query()?;
        let created = create_diff_index(&dir, kind, triples, &mut querier, &self.cfg);
        drop(querier);
        match created {
            | Ok(Some(diff)) => {
                self.diffs.write().push(diff);
                *next += 1;
                Ok(true)
            },
            | Ok(None) => Ok(false),
            | Err(e) => {
                if dir.exists() {
                    if let Err(rm) = fs::remove_dir_all(&dir) {
                        warn!(dir = %dir.display(), error = %rm, "could not remove partial update");
                    }
                }
                Err(e)
            },
        }
    }

    /// Persists the dictionary state, including terms registered in the GUD.
    pub fn flush(&self) -> Result<()> {
        self.dict.flush()
    }

    pub fn close(self) -> Result<()> {
        self.flush()
    }
}

impl Drop for Kb {
    fn drop(&mut self) {
        if let Err(e) = self.dict.flush() {
            warn!(dir = %self.dir.display(), error = %e, "failed to flush dictionary on drop");
        }
        debug!(dir = %self.dir.display(), "closed knowledge base");
    }
}
