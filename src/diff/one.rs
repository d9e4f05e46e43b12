// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

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

use crate::{
    codec,
    diff::{
        write_stats,
        DiffIndex,
        DiffKind,
        DiffStats,
        LAYOUT_ONE,
    },
    errs::{
        Result,
        TridentError,
    },
    itr::{
        BoxedItr,
        Diff1Itr,
        DiffTermItr,
    },
    perm::Permutation,
};

const VALUES_FILE: &str = "values";
const VALUE_BYTES: usize = 5;
const HEADER_LEN: usize = 1 + 1 + 8 + 1 + 3 * 8 + DiffStats::ENCODED_LEN;

/// An update whose triples share two components, e.g. every object of one
/// (subject, predicate) pair. Only the sorted values of the third component
/// are stored.
pub struct DiffIndex1 {
    dir: PathBuf,
    kind: DiffKind,
    // the shared components, -1 where the values go
    spo: [i64; 3],
    free: usize,
    values: Arc<Vec<i64>>,
    stats: DiffStats,
}

impl DiffIndex1 {
    pub(crate) fn create(
        dir: &Path,
        kind: DiffKind,
        spo: [i64; 3],
        free: usize,
        values: Vec<i64>,
        stats: DiffStats,
    ) -> Result<Self> {
        if free > 2 || spo[free] != -1 {
            return Err(TridentError::misuse(format!(
                "pattern {spo:?} does not vary in component {free}"
            )));
        }
        let mut values = values;
        values.sort_unstable();
        values.dedup();

        let mut body = BytesMut::with_capacity(HEADER_LEN);
        body.put_u8(LAYOUT_ONE);
        body.put_u8(kind.byte());
        body.put_u64_le(values.len() as u64);
        body.put_u8(free as u8);
        for v in spo {
            body.put_i64_le(v);
        }
        stats.encode(&mut body);
        write_stats(dir, &body)?;

        let mut buf = BytesMut::with_capacity(8 + values.len() * VALUE_BYTES + 4);
        buf.put_u64_le(values.len() as u64);
        for v in values.iter() {
            codec::put_fixed(&mut buf, VALUE_BYTES, *v as u64);
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        fs::write(dir.join(VALUES_FILE), &buf)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            kind,
            spo,
            free,
            values: Arc::new(values),
            stats,
        })
    }

    /// `body` is the checked content of the stats file.
    pub(crate) fn open(dir: &Path, body: &[u8]) -> Result<Self> {
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
        let free = buf.get_u8() as usize;
        let spo = [buf.get_i64_le(), buf.get_i64_le(), buf.get_i64_le()];
        let stats = DiffStats::decode(&mut buf);
        if free > 2 {
            return Err(TridentError::corrupt(format!("no triple component {free}")));
        }

        let path = dir.join(VALUES_FILE);
        let data = fs::read(&path)?;
        let expected = 8 + size as usize * VALUE_BYTES;
        if data.len() != expected + 4 {
            return Err(TridentError::corrupt(format!(
                "{} holds {} bytes, expected {}",
                path.display(),
                data.len(),
                expected + 4
            )));
        }
        let stored = (&data[expected..]).get_u32_le();
        if crc32fast::hash(&data[..expected]) != stored {
            return Err(TridentError::corrupt(format!(
                "checksum mismatch in {}",
                path.display()
            )));
        }
        let values = data[8..expected]
            .chunks_exact(VALUE_BYTES)
            .map(|c| codec::decode_fixed(c, VALUE_BYTES) as i64)
            .collect();

        Ok(Self {
            dir: dir.to_path_buf(),
            kind,
            spo,
            free,
            values: Arc::new(values),
            stats,
        })
    }

    pub fn pattern(&self) -> [i64; 3] {
        self.spo
    }

    fn free_slot(&self, perm: Permutation) -> usize {
        perm.order()[self.free]
    }
}

impl DiffIndex for DiffIndex1 {
    fn kind(&self) -> DiffKind {
        self.kind
    }

    fn size(&self) -> u64 {
        self.values.len() as u64
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
        Ok(Box::new(Diff1Itr::new(
            perm,
            self.spo,
            self.free,
            self.values.clone(),
            key,
            v1,
            v2,
        )?))
    }

    fn card(&self, perm: Permutation, key: i64) -> Result<u64> {
        if self.free_slot(perm) == 0 {
            return Ok(self.values.binary_search(&key).is_ok() as u64);
        }
        Ok(if perm.permute(self.spo)[0] == key {
            self.size()
        } else {
            0
        })
    }

    fn term_list(&self, perm: Permutation) -> Result<BoxedItr> {
        if self.free_slot(perm) == 0 {
            return Ok(Box::new(DiffTermItr::from_keys(self.values.clone())));
        }
        Ok(Box::new(DiffTermItr::single(perm.permute(self.spo)[0], self.size())))
    }

    fn exists(&self, spo: [i64; 3]) -> Result<bool> {
        let fixed = (0..3).all(|i| i == self.free || self.spo[i] == spo[i]);
        Ok(fixed && self.values.binary_search(&spo[self.free]).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        diff::open_diff_index,
        itr::{
            PairItr,
            PairItrExt,
        },
    };

    fn objects_of_one_pair(dir: &Path) -> DiffIndex1 {
        // (5, 2, o) for o in {9, 3, 7}
        DiffIndex1::create(
            dir,
            DiffKind::Addition,
            [5, 2, -1],
            2,
            vec![9, 3, 7],
            DiffStats::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_iterates_every_permutation() {
        let dir = tempfile::tempdir().unwrap();
        let diff = objects_of_one_pair(dir.path());
        assert_eq!(diff.size(), 3);

        let mut spo = diff.iterator(Permutation::Spo, Some(5), None, None).unwrap();
        let got: Vec<_> = spo.collect_tuples().unwrap().into_iter().map(|t| (t.1, t.2)).collect();
        assert_eq!(got, vec![(2, 3), (2, 7), (2, 9)]);

        let mut ops = diff.iterator(Permutation::Ops, Some(7), None, None).unwrap();
        let got: Vec<_> = ops.collect_tuples().unwrap().into_iter().map(|t| (t.1, t.2)).collect();
        assert_eq!(got, vec![(2, 5)]);

        let mut pos = diff.iterator(Permutation::Pos, None, None, None).unwrap();
        let got: Vec<_> = pos.collect_tuples().unwrap().into_iter().map(|t| (t.0, t.1)).collect();
        assert_eq!(got, vec![(2, 3), (2, 7), (2, 9)]);

        let mut miss = diff.iterator(Permutation::Spo, Some(6), None, None).unwrap();
        assert!(!miss.has_next().unwrap());
    }

    #[test]
    fn test_cards_terms_and_membership() {
        let dir = tempfile::tempdir().unwrap();
        let diff = objects_of_one_pair(dir.path());
        assert_eq!(diff.card(Permutation::Spo, 5).unwrap(), 3);
        assert_eq!(diff.card(Permutation::Pso, 2).unwrap(), 3);
        assert_eq!(diff.card(Permutation::Ops, 9).unwrap(), 1);
        assert_eq!(diff.card(Permutation::Ops, 4).unwrap(), 0);

        let keys: Vec<_> = diff
            .term_list(Permutation::Osp)
            .unwrap()
            .collect_tuples()
            .unwrap()
            .into_iter()
            .map(|t| (t.0, t.3))
            .collect();
        assert_eq!(keys, vec![(3, 1), (7, 1), (9, 1)]);
        let keys: Vec<_> = diff
            .term_list(Permutation::Spo)
            .unwrap()
            .collect_tuples()
            .unwrap()
            .into_iter()
            .map(|t| (t.0, t.3))
            .collect();
        assert_eq!(keys, vec![(5, 3)]);

        assert!(diff.exists([5, 2, 7]).unwrap());
        assert!(!diff.exists([5, 2, 8]).unwrap());
        assert!(!diff.exists([4, 2, 7]).unwrap());
    }

    #[test]
    fn test_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut stats = DiffStats::default();
        stats.n_unique_keys[1] = 2;
        DiffIndex1::create(dir.path(), DiffKind::Deletion, [-1, 4, 8], 0, vec![1, 2], stats).unwrap();
        let diff = open_diff_index(
            dir.path(),
            &crate::config::KbConfig::default(),
            Arc::new(crate::stats::QueryStats::default()),
        )
        .unwrap();
        assert_eq!(diff.kind(), DiffKind::Deletion);
        assert_eq!(diff.size(), 2);
        assert_eq!(diff.n_unique_keys(Permutation::Ops), 2);
        assert!(diff.exists([2, 4, 8]).unwrap());

        fs::write(dir.path().join(VALUES_FILE), b"short").unwrap();
        assert!(open_diff_index(
            dir.path(),
            &crate::config::KbConfig::default(),
            Arc::new(crate::stats::QueryStats::default()),
        )
        .is_err());
    }
}
