// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::{
    hash::RandomState,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use bloom2::{
    Bloom2,
    BloomFilterBuilder,
    CompressedBitmap,
    FilterSize::KeyBytes3,
};
use bytes::{
    Buf,
    BufMut,
    BytesMut,
};
use tracing::{
    debug,
    instrument,
};

use crate::{
    config::KbConfig,
    diff::{
        write_stats,
        DiffIndex,
        DiffKind,
        DiffStats,
        LAYOUT_THREE,
    },
    errs::{
        Result,
        TridentError,
    },
    itr::{
        BoxedItr,
        DiffScanItr,
        DiffTermItr,
        EmptyItr,
        PairItr,
    },
    kb::{
        builder::write_permutations,
        catalog::{
            Catalog,
            CatalogStats,
            NO_SESSIONS,
        },
        storage_dir,
        TREE_DIR,
    },
    perm::Permutation,
    stats::QueryStats,
    table::storage::TableStorage,
    tree::Tree,
};

/// The permutations an update materializes; the other three are read
/// through their reverse.
const STORED: [Permutation; 3] = [Permutation::Spo, Permutation::Ops, Permutation::Pos];

const HEADER_LEN: usize = 1 + 1 + 8 + DiffStats::ENCODED_LEN + 8 * 2 + 6 * 16;

/// An update of arbitrary triples, stored as a small knowledge base of its
/// own with the SPO, OPS and POS permutations.
pub struct DiffIndex3 {
    dir: PathBuf,
    kind: DiffKind,
    size: u64,
    stats: DiffStats,
    catalog: Arc<Catalog>,
    // every key of the tree
    bloom: Bloom2<RandomState, CompressedBitmap, u64>,
}

fn encode_header(kind: DiffKind, size: u64, stats: &DiffStats, cstats: &CatalogStats) -> BytesMut {
    let mut body = BytesMut::with_capacity(HEADER_LEN);
    body.put_u8(LAYOUT_THREE);
    body.put_u8(kind.byte());
    body.put_u64_le(size);
    stats.encode(&mut body);
    body.put_u64_le(cstats.n_triples);
    body.put_u64_le(cstats.n_terms);
    for i in 0..6 {
        body.put_u64_le(cstats.n_tables[i]);
        body.put_u64_le(cstats.n_first_terms[i]);
    }
    body
}

impl DiffIndex3 {
    #[instrument(level = "debug", skip(triples, stats, cfg, qstats), fields(n = triples.len()))]
    pub(crate) fn create(
        dir: &Path,
        kind: DiffKind,
        triples: &[[i64; 3]],
        stats: DiffStats,
        cfg: &KbConfig,
        qstats: Arc<QueryStats>,
    ) -> Result<Self> {
        let rows: Vec<[u64; 3]> = triples.iter().map(|t| t.map(|v| v as u64)).collect();
        let mut wcfg = cfg.clone();
        wcfg.set_read_only(false);
        let cstats = write_permutations(dir, &wcfg, &rows, &STORED, false, false)?;
        write_stats(dir, &encode_header(kind, rows.len() as u64, &stats, &cstats))?;
        debug!(dir = %dir.display(), tables = ?cstats.n_tables, "wrote update permutations");

        let mut rcfg = cfg.clone();
        rcfg.set_read_only(true);
        Self::load(dir, kind, rows.len() as u64, stats, cstats, &rcfg, qstats)
    }

    /// `body` is the checked content of the stats file.
    pub(crate) fn open(dir: &Path, body: &[u8], cfg: &KbConfig, qstats: Arc<QueryStats>) -> Result<Self> {
        if body.len() != HEADER_LEN {
            return Err(TridentError::corrupt(format!(
                "stats of {} hold {} bytes",
                dir.display(),
                body.len()
            )));
        }
        let mut buf = &body[1..];
        let kind = DiffKind::from_byte(buf.get_u8())?;
        let size = buf.get_u64_le();
        let stats = DiffStats::decode(&mut buf);
        let mut cstats = CatalogStats {
            n_triples: buf.get_u64_le(),
            n_terms: buf.get_u64_le(),
            ..Default::default()
        };
        for i in 0..6 {
            cstats.n_tables[i] = buf.get_u64_le();
            cstats.n_first_terms[i] = buf.get_u64_le();
        }
        let mut rcfg = cfg.clone();
        rcfg.set_read_only(true);
        Self::load(dir, kind, size, stats, cstats, &rcfg, qstats)
    }

    fn load(
        dir: &Path,
        kind: DiffKind,
        size: u64,
        stats: DiffStats,
        cstats: CatalogStats,
        cfg: &KbConfig,
        qstats: Arc<QueryStats>,
    ) -> Result<Self> {
        let mut storages: [Option<Arc<TableStorage>>; 6] = Default::default();
        for perm in STORED {
            storages[perm.index()] = Some(Arc::new(TableStorage::open(&storage_dir(dir, perm), cfg)?));
        }
        let tree = Arc::new(Tree::open(&dir.join(TREE_DIR), cfg)?);

        let mut bloom = BloomFilterBuilder::default().size(KeyBytes3).build();
        for entry in tree.iter()? {
            let (key, _) = entry?;
            bloom.insert(&key);
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            kind,
            size,
            stats,
            catalog: Arc::new(Catalog::new(storages, tree, cstats, qstats)),
            bloom,
        })
    }

    fn may_hold(&self, key: i64) -> bool {
        key >= 0 && self.bloom.contains(&(key as u64))
    }
}

impl DiffIndex for DiffIndex3 {
    fn kind(&self) -> DiffKind {
        self.kind
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn stats(&self) -> &DiffStats {
        &self.stats
    }

    fn dir(&self) -> &Path {
        &self.dir
    }

    fn iterator(
        &self,
        perm: Permutation,
        key: Option<i64>,
        v1: Option<i64>,
        v2: Option<i64>,
    ) -> Result<BoxedItr> {
        let Some(key) = key else {
            return Ok(Box::new(DiffScanItr::new(self.catalog.clone(), perm)));
        };
        let coords = match self.may_hold(key) {
            | true => self.catalog.coordinates(key)?,
            | false => None,
        };
        match coords {
            | Some(coords) => self.catalog.lookup(perm, key, &coords, v1, v2, &NO_SESSIONS),
            | None => {
                let mut empty = EmptyItr::new();
                empty.set_key(key);
                Ok(Box::new(empty))
            },
        }
    }

    fn card(&self, perm: Permutation, key: i64) -> Result<u64> {
        if !self.may_hold(key) {
            return Ok(0);
        }
        self.catalog.n_elements(key, perm)
    }

    fn term_list(&self, perm: Permutation) -> Result<BoxedItr> {
        Ok(Box::new(DiffTermItr::from_tree(
            self.catalog.tree().clone(),
            perm,
            self.stats.n_keys[perm.index()],
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        diff::open_diff_index,
        itr::PairItrExt,
    };

    const TRIPLES: [[i64; 3]; 5] = [[1, 2, 3], [1, 4, 5], [6, 2, 3], [6, 2, 7], [8, 4, 1]];

    fn create(dir: &Path) -> DiffIndex3 {
        let mut stats = DiffStats::default();
        stats.n_keys[Permutation::Spo.index()] = 3;
        stats.n_keys[Permutation::Pso.index()] = 2;
        DiffIndex3::create(
            dir,
            DiffKind::Addition,
            &TRIPLES,
            stats,
            &KbConfig::for_writing(),
            Arc::new(QueryStats::default()),
        )
        .unwrap()
    }

    fn pairs(itr: &mut BoxedItr) -> Vec<(i64, i64)> {
        itr.collect_tuples()
            .unwrap()
            .into_iter()
            .map(|t| (t.1, t.2))
            .collect()
    }

    #[test]
    fn test_lookups_in_stored_and_reverse_permutations() {
        let dir = tempfile::tempdir().unwrap();
        let diff = create(dir.path());
        assert_eq!(diff.size(), 5);

        let mut spo = diff.iterator(Permutation::Spo, Some(6), None, None).unwrap();
        assert_eq!(pairs(&mut spo), vec![(2, 3), (2, 7)]);

        // PSO is served from POS
        let mut pso = diff.iterator(Permutation::Pso, Some(2), None, None).unwrap();
        assert_eq!(pairs(&mut pso), vec![(1, 3), (6, 3), (6, 7)]);

        let mut pos = diff.iterator(Permutation::Pos, Some(4), Some(5), None).unwrap();
        assert_eq!(pairs(&mut pos), vec![(5, 1)]);

        let mut miss = diff.iterator(Permutation::Spo, Some(99), None, None).unwrap();
        assert!(!miss.has_next().unwrap());

        assert!(diff.exists([8, 4, 1]).unwrap());
        assert!(!diff.exists([8, 4, 2]).unwrap());
    }

    #[test]
    fn test_scans_cards_and_terms() {
        let dir = tempfile::tempdir().unwrap();
        let diff = create(dir.path());

        let mut scan = diff.iterator(Permutation::Osp, None, None, None).unwrap();
        let got: Vec<_> = scan
            .collect_tuples()
            .unwrap()
            .into_iter()
            .map(|t| [t.0, t.1, t.2])
            .collect();
        assert_eq!(got, vec![[1, 8, 4], [3, 1, 2], [3, 6, 2], [5, 1, 4], [7, 6, 2]]);

        assert_eq!(diff.card(Permutation::Spo, 1).unwrap(), 2);
        assert_eq!(diff.card(Permutation::Pso, 2).unwrap(), 3);
        assert_eq!(diff.card(Permutation::Osp, 3).unwrap(), 2);
        assert_eq!(diff.card(Permutation::Spo, 42).unwrap(), 0);

        let keys: Vec<_> = diff
            .term_list(Permutation::Pso)
            .unwrap()
            .collect_tuples()
            .unwrap()
            .into_iter()
            .map(|t| (t.0, t.3))
            .collect();
        assert_eq!(keys, vec![(2, 3), (4, 2)]);
    }

    #[test]
    fn test_reopen() {
        let dir = tempfile::tempdir().unwrap();
        create(dir.path());
        let diff = open_diff_index(dir.path(), &KbConfig::default(), Arc::new(QueryStats::default())).unwrap();
        assert_eq!(diff.kind(), DiffKind::Addition);
        assert_eq!(diff.size(), 5);
        assert_eq!(diff.n_keys(Permutation::Spo), 3);
        assert!(diff.exists([1, 4, 5]).unwrap());
    }
}
