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
        ItrKind,
        KeySeekable,
        Markable,
        PairItr,
    },
    perm::Permutation,
    table::storage::{
        FileMarks,
        TableStorage,
    },
    tree::{
        TermCoordinates,
        Tree,
    },
};

/// Enumerates the keys of one permutation by walking the mark indices of its
/// data files. `count` is the number of pairs under the current key.
#[derive(Clone)]
pub struct TermItr {
    storage: Arc<TableStorage>,
    tree: Arc<Tree<u64, TermCoordinates>>,
    perm: Permutation,
    size: u64,
    // file whose marks are loaded
    file: Option<u16>,
    marks: Option<Arc<FileMarks>>,
    next_mark: usize,
    // location of the current key
    cur: Option<(u16, usize)>,
    strat: u8,
    count: Option<u64>,
    key: i64,
    c1: Option<i64>,
    c2: Option<i64>,
    saved: Option<Box<TermItr>>,
}

impl TermItr {
    pub fn new(
        storage: Arc<TableStorage>,
        tree: Arc<Tree<u64, TermCoordinates>>,
        perm: Permutation,
        size: u64,
    ) -> Self {
        TermItr {
            storage,
            tree,
            perm,
            size,
            file: None,
            marks: None,
            next_mark: 0,
            cur: None,
            strat: 0,
            count: None,
            key: -1,
            c1: None,
            c2: None,
            saved: None,
        }
    }

    pub fn permutation(&self) -> Permutation {
        self.perm
    }

    pub fn current_file(&self) -> Option<u16> {
        self.cur.map(|(f, _)| f)
    }

    pub fn current_mark(&self) -> Option<u64> {
        self.cur.map(|(_, m)| m as u64)
    }

    pub fn current_strat(&self) -> u8 {
        self.strat
    }

    /// Loads the next file with marks once the current one is used up.
    fn ensure(&mut self) -> Result<bool> {
        loop {
            if let Some(m) = &self.marks {
                if self.next_mark < m.len() {
                    return Ok(true);
                }
            }
            let last = match self.storage.last_file() {
                | Some(l) => l,
                | None => return Ok(false),
            };
            let candidate = match self.file {
                | None => 0,
                | Some(f) if f >= last => return Ok(false),
                | Some(f) => f + 1,
            };
            self.file = Some(candidate);
            self.marks = self.storage.file_marks(candidate)?;
            self.next_mark = 0;
        }
    }

    fn rewind_to_current(&mut self) -> Result<()> {
        if let Some((file, mark)) = self.cur {
            if self.file != Some(file) {
                self.file = Some(file);
                self.marks = self.storage.file_marks(file)?;
            }
            self.next_mark = mark;
        }
        Ok(())
    }
}

impl PairItr for TermItr {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::Term
    }

    fn value1(&self) -> i64 {
        -1
    }

    fn value2(&self) -> i64 {
        -1
    }

    fn count(&mut self) -> Result<u64> {
        if let Some(c) = self.count {
            return Ok(c);
        }
        let c = match self.tree.get(&(self.key as u64))? {
            | Some(coords) if coords.exists(self.perm) => coords.n_elements(self.perm),
            | Some(coords) => coords.n_elements(self.perm.reverse()),
            | None => {
                return Err(TridentError::corrupt(format!(
                    "key {} listed by {} has no coordinates",
                    self.key, self.perm
                )));
            },
        };
        self.count = Some(c);
        Ok(c)
    }

    fn has_next(&mut self) -> Result<bool> {
        self.ensure()
    }

    fn next(&mut self) -> Result<()> {
        if !self.ensure()? {
            return Err(TridentError::misuse("next on an exhausted term list"));
        }
        let (file, marks) = match (self.file, &self.marks) {
            | (Some(f), Some(m)) => (f, m),
            | _ => return Err(TridentError::corrupt("term list lost its mark index")),
        };
        self.key = marks.key(self.next_mark) as i64;
        self.strat = marks.strat(self.next_mark);
        self.cur = Some((file, self.next_mark));
        self.next_mark += 1;
        self.count = None;
        Ok(())
    }

    fn cardinality(&mut self) -> Result<u64> {
        Ok(self.size)
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        Ok(self.size)
    }

    fn is_second_column_ignored(&self) -> bool {
        true
    }

    fn as_key_seekable(&mut self) -> Option<&mut dyn KeySeekable> {
        Some(self)
    }

    fn as_markable(&mut self) -> Option<&mut dyn Markable> {
        Some(self)
    }
}

impl KeySeekable for TermItr {
    fn goto_key(&mut self, key: i64) -> Result<()> {
        self.rewind_to_current()?;
        let key = key.max(0) as u64;
        while self.ensure()? {
            let marks = match &self.marks {
                | Some(m) => m.clone(),
                | None => return Ok(()),
            };
            if marks.key(marks.len() - 1) < key {
                self.next_mark = marks.len();
                continue;
            }
            self.next_mark = marks.lower_bound(self.next_mark, key);
            return Ok(());
        }
        Ok(())
    }
}

impl Markable for TermItr {
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

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::{
        config::KbConfig,
        itr::PairItrExt,
        table::{
            inserter::inserter_for,
            strategy::StorageStrat,
        },
        tree::Coordinate,
    };

    /// Stores one single-pair table per key, rolling files early, and records
    /// the coordinates in a tree.
    fn build(keys: &[u64]) -> (tempfile::TempDir, Arc<TableStorage>, Arc<Tree<u64, TermCoordinates>>) {
        let dir = tempdir().unwrap();
        let mut cfg = KbConfig::for_writing();
        cfg.set_table_max_file_size(16);
        let storage = TableStorage::open(&dir.path().join("p0"), &cfg).unwrap();
        let tree = Tree::open(&dir.path().join("tree"), &cfg).unwrap();
        let strat = StorageStrat::row(1, 1).unwrap();
        for &k in keys {
            let ins = inserter_for(strat, 100, dir.path().to_path_buf());
            let (file, mark) = storage.start_append(k, strat, ins).unwrap();
            for v in 0..(k % 3 + 1) {
                storage.append(1, v).unwrap();
            }
            let n = storage.stop_append().unwrap();
            let mut coords = TermCoordinates::new();
            coords.set(Permutation::Spo, Coordinate {
                file,
                mark,
                strat: strat.byte(),
                n_elements: n,
            });
            tree.put(k, coords).unwrap();
        }
        storage.stop_insert().unwrap();
        (dir, Arc::new(storage), Arc::new(tree))
    }

    #[test]
    fn test_lists_keys_across_files() {
        let keys: Vec<u64> = (0..40).map(|i| i * 3 + 1).collect();
        let (_dir, storage, tree) = build(&keys);
        assert!(storage.n_files() > 1);
        let mut itr = TermItr::new(storage, tree, Permutation::Spo, keys.len() as u64);
        let got = itr.collect_tuples().unwrap();
        assert_eq!(got.len(), keys.len());
        for (t, k) in got.iter().zip(keys.iter()) {
            assert_eq!(t.0, *k as i64);
            assert_eq!(t.3, k % 3 + 1);
        }
        assert_eq!(itr.cardinality().unwrap(), 40);
        assert!(itr.next().unwrap_err().is_misuse());
    }

    #[test]
    fn test_goto_key_and_mark() {
        let keys: Vec<u64> = (0..40).map(|i| i * 3 + 1).collect();
        let (_dir, storage, tree) = build(&keys);
        let mut itr = TermItr::new(storage, tree, Permutation::Spo, 40);
        PairItrExt::goto_key(&mut itr, 50).unwrap();
        itr.next().unwrap();
        assert_eq!(itr.key(), 52);
        let file = itr.current_file().unwrap();
        PairItrExt::mark(&mut itr).unwrap();
        PairItrExt::goto_key(&mut itr, 100).unwrap();
        itr.next().unwrap();
        assert_eq!(itr.key(), 100);
        // a key behind the current one stays put
        PairItrExt::goto_key(&mut itr, 3).unwrap();
        itr.next().unwrap();
        assert_eq!(itr.key(), 100);
        PairItrExt::reset(&mut itr).unwrap();
        assert_eq!(itr.key(), 52);
        assert_eq!(itr.current_file(), Some(file));
        itr.next().unwrap();
        assert_eq!(itr.key(), 55);
        PairItrExt::goto_key(&mut itr, 1000).unwrap();
        assert!(!itr.has_next().unwrap());
    }
}
