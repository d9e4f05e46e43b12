// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Differential indices: immutable sets of added or removed triples layered
//! over a knowledge base and merged with it at query time.

use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    sync::Arc,
};

use bytes::{
    Buf,
    BufMut,
    BytesMut,
};
use tracing::{
    debug,
    info,
    instrument,
};

use crate::{
    config::KbConfig,
    errs::{
        Result,
        TridentError,
    },
    itr::BoxedItr,
    kb::querier::Querier,
    perm::{
        Permutation,
        ALL_PERMUTATIONS,
    },
    stats::QueryStats,
};

pub mod one;
pub mod three;

pub use one::DiffIndex1;
pub use three::DiffIndex3;

const STATS_FILE: &str = "stats";

pub(crate) const LAYOUT_ONE: u8 = 1;
pub(crate) const LAYOUT_THREE: u8 = 3;

// term ids of an update must fit the 5-byte encodings of the table storages
const MAX_TERM: i64 = (1 << 40) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    Addition,
    Deletion,
}

impl DiffKind {
    pub(crate) fn byte(self) -> u8 {
        match self {
            | DiffKind::Addition => 0,
            | DiffKind::Deletion => 1,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Result<Self> {
        match b {
            | 0 => Ok(DiffKind::Addition),
            | 1 => Ok(DiffKind::Deletion),
            | other => Err(TridentError::corrupt(format!("unknown update kind {other}"))),
        }
    }
}

/// Per-permutation counters of an update, computed against the view it was
/// created on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    /// Distinct keys.
    pub n_keys: [u64; 6],
    /// Keys new to the view (additions) or left without triples (deletions).
    pub n_unique_keys: [u64; 6],
    /// Distinct (key, value1) groups.
    pub n_first_terms: [u64; 6],
    /// Groups new to the view (additions) or emptied (deletions).
    pub unique_n_first_terms: [u64; 6],
}

impl DiffStats {
    pub(crate) const ENCODED_LEN: usize = 4 * 6 * 8;

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        for arr in [
            &self.n_keys,
            &self.n_unique_keys,
            &self.n_first_terms,
            &self.unique_n_first_terms,
        ] {
            for v in arr {
                buf.put_u64_le(*v);
            }
        }
    }

    /// `buf` must hold at least [`DiffStats::ENCODED_LEN`] bytes.
    pub(crate) fn decode(buf: &mut &[u8]) -> Self {
        let mut stats = DiffStats::default();
        for arr in [
            &mut stats.n_keys,
            &mut stats.n_unique_keys,
            &mut stats.n_first_terms,
            &mut stats.unique_n_first_terms,
        ] {
            for v in arr.iter_mut() {
                *v = buf.get_u64_le();
            }
        }
        stats
    }
}

/// A set of added or removed triples readable in every permutation.
pub trait DiffIndex: Send + Sync {
    fn kind(&self) -> DiffKind;

    /// Number of triples in the update.
    fn size(&self) -> u64;

    fn stats(&self) -> &DiffStats;

    fn dir(&self) -> &Path;

    /// The tuples of `perm` matching the bound columns. An unbound key scans
    /// the whole permutation.
    fn iterator(
        &self,
        perm: Permutation,
        key: Option<i64>,
        v1: Option<i64>,
        v2: Option<i64>,
    ) -> Result<BoxedItr>;

    /// Number of triples with `key` in the first column of `perm`.
    fn card(&self, perm: Permutation, key: i64) -> Result<u64>;

    /// The keys of `perm`, each counted with its number of triples.
    fn term_list(&self, perm: Permutation) -> Result<BoxedItr>;

    fn exists(&self, spo: [i64; 3]) -> Result<bool> {
        let [s, p, o] = spo;
        self.iterator(Permutation::Spo, Some(s), Some(p), Some(o))?
            .has_next()
    }

    fn n_keys(&self, perm: Permutation) -> u64 {
        self.stats().n_keys[perm.index()]
    }

    fn n_unique_keys(&self, perm: Permutation) -> u64 {
        self.stats().n_unique_keys[perm.index()]
    }

    fn n_first_terms(&self, perm: Permutation) -> u64 {
        self.stats().n_first_terms[perm.index()]
    }

    fn unique_n_first_terms(&self, perm: Permutation) -> u64 {
        self.stats().unique_n_first_terms[perm.index()]
    }
}

/// Writes `body` followed by its checksum.
pub(crate) fn write_stats(dir: &Path, body: &[u8]) -> Result<()> {
    let mut buf = BytesMut::with_capacity(body.len() + 4);
    buf.put_slice(body);
    buf.put_u32_le(crc32fast::hash(body));
    fs::write(dir.join(STATS_FILE), &buf)?;
    Ok(())
}

/// Reads a stats file back, returning the body once its checksum matches.
pub(crate) fn read_stats(dir: &Path) -> Result<Vec<u8>> {
    let path = dir.join(STATS_FILE);
    let mut data = fs::read(&path)?;
    if data.len() < 4 {
        return Err(TridentError::corrupt(format!("{} is truncated", path.display())));
    }
    let split = data.len() - 4;
    let stored = (&data[split..]).get_u32_le();
    data.truncate(split);
    if crc32fast::hash(&data) != stored {
        return Err(TridentError::corrupt(format!(
            "checksum mismatch in {}",
            path.display()
        )));
    }
    Ok(data)
}

/// Opens the update stored in `dir`, whichever layout it uses.
#[instrument(level = "debug", skip(cfg, qstats))]
pub fn open_diff_index(dir: &Path, cfg: &KbConfig, qstats: Arc<QueryStats>) -> Result<Arc<dyn DiffIndex>> {
    let body = read_stats(dir)?;
    match body.first().copied() {
        | Some(LAYOUT_ONE) => Ok(Arc::new(DiffIndex1::open(dir, &body)?)),
        | Some(LAYOUT_THREE) => Ok(Arc::new(DiffIndex3::open(dir, &body, cfg, qstats)?)),
        | other => Err(TridentError::corrupt(format!(
            "unknown update layout {other:?} in {}",
            dir.display()
        ))),
    }
}

/// Two components shared by every triple, with -1 in the varying position,
/// and the position that varies.
fn shared_pattern(triples: &[[i64; 3]]) -> Option<([i64; 3], usize)> {
    let first = triples.first()?;
    // the object varying is checked first so single triples land there
    for free in [2, 1, 0] {
        let fixed = triples
            .iter()
            .all(|t| (0..3).all(|i| i == free || t[i] == first[i]));
        if fixed {
            let mut spo = *first;
            spo[free] = -1;
            return Some((spo, free));
        }
    }
    None
}

/// Counts the keys and groups of `triples` in every permutation, comparing
/// them with what `querier` currently sees.
fn compute_stats(kind: DiffKind, triples: &[[i64; 3]], querier: &mut Querier) -> Result<DiffStats> {
    let mut stats = DiffStats::default();
    for perm in ALL_PERMUTATIONS {
        let idx = perm.index();
        let mut rows: Vec<[i64; 3]> = triples.iter().map(|t| perm.permute(*t)).collect();
        rows.sort_unstable();
        for group in rows.chunk_by(|a, b| a[0] == b[0]) {
            let key = group[0][0];
            stats.n_keys[idx] += 1;
            let mut mine: BTreeMap<i64, u64> = BTreeMap::new();
            for r in group {
                *mine.entry(r[1]).or_default() += 1;
            }
            stats.n_first_terms[idx] += mine.len() as u64;
            let base = querier.value1_groups(perm, key, None)?;
            match kind {
                | DiffKind::Addition => {
                    if base.is_empty() {
                        stats.n_unique_keys[idx] += 1;
                    }
                    stats.unique_n_first_terms[idx] +=
                        mine.keys().filter(|v1| !base.contains_key(v1)).count() as u64;
                },
                | DiffKind::Deletion => {
                    if base.values().sum::<u64>() == group.len() as u64 {
                        stats.n_unique_keys[idx] += 1;
                    }
                    stats.unique_n_first_terms[idx] += mine
                        .iter()
                        .filter(|(v1, n)| base.get(v1) == Some(n))
                        .count() as u64;
                },
            }
        }
    }
    Ok(stats)
}

/// Stores an update of `triples` in `dir`. Triples that would not change
/// the view of `querier` (additions already present, deletions of missing
/// triples) are dropped; `None` is returned when nothing is left.
///
/// Updates whose triples all share two components are stored as a single
/// sorted list of the third.
#[instrument(level = "debug", skip(triples, querier, cfg), fields(n = triples.len()))]
pub fn create_diff_index(
    dir: &Path,
    kind: DiffKind,
    triples: Vec<[i64; 3]>,
    querier: &mut Querier,
    cfg: &KbConfig,
) -> Result<Option<Arc<dyn DiffIndex>>> {
    let mut triples = triples;
    if let Some(bad) = triples
        .iter()
        .find(|t| t.iter().any(|v| !(0..=MAX_TERM).contains(v)))
    {
        return Err(TridentError::misuse(format!("triple {bad:?} holds an invalid term")));
    }
    triples.sort_unstable();
    triples.dedup();
    let mut effective = Vec::with_capacity(triples.len());
    for t in triples {
        let [s, p, o] = t;
        if querier.exists(s, p, o)? != (kind == DiffKind::Addition) {
            effective.push(t);
        }
    }
    if effective.is_empty() {
        debug!(?kind, "update leaves the view unchanged");
        return Ok(None);
    }
    let stats = compute_stats(kind, &effective, querier)?;
    fs::create_dir_all(dir)?;
    let diff: Arc<dyn DiffIndex> = match shared_pattern(&effective) {
        | Some((spo, free)) => {
            let values: Vec<i64> = effective.iter().map(|t| t[free]).collect();
            Arc::new(DiffIndex1::create(dir, kind, spo, free, values, stats)?)
        },
        | None => Arc::new(DiffIndex3::create(
            dir,
            kind,
            &effective,
            stats,
            cfg,
            querier.query_stats().clone(),
        )?),
    };
    info!(dir = %dir.display(), ?kind, size = diff.size(), "created update");
    Ok(Some(diff))
}
