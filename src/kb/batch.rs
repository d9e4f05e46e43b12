// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Fixed-width binary dumps of triples, split into a training, a validation
//! and a test set.

use std::{
    fs::{
        self,
        File,
    },
    io::Write,
    path::{
        Path,
        PathBuf,
    },
};

use bytes::BytesMut;
use memmap2::Mmap;
use rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use tracing::{
    info,
    instrument,
};

use crate::{
    codec,
    errs::{
        Result,
        TridentError,
    },
    itr::PairItr,
};

pub const BATCH_FILE: &str = "_batch";
pub const BATCH_VALID_FILE: &str = "_batch_valid";
pub const BATCH_TEST_FILE: &str = "_batch_test";

const TERM_BYTES: usize = 5;
/// Bytes taken by one triple.
pub const TRIPLE_BYTES: usize = 3 * TERM_BYTES;

const MAX_TERM: i64 = (1 << 40) - 1;
const FLUSH_BYTES: usize = 1 << 20;

/// Number of triples written to each file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub train: u64,
    pub valid: u64,
    pub test: u64,
}

impl BatchCounts {
    pub fn total(&self) -> u64 {
        self.train + self.valid + self.test
    }
}

struct Sink {
    file: File,
    buf: BytesMut,
}

impl Sink {
    fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            file: File::create(path)?,
            buf: BytesMut::with_capacity(FLUSH_BYTES),
        })
    }

    fn push(&mut self, spo: [i64; 3]) -> Result<()> {
        for v in spo {
            codec::put_fixed(&mut self.buf, TERM_BYTES, v as u64);
        }
        if self.buf.len() >= FLUSH_BYTES {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Writes the triples of an iterator to the batch files of a directory.
#[derive(Debug, Clone)]
pub struct BatchDumper {
    dir: PathBuf,
    valid_ratio: f64,
    test_ratio: f64,
    seed: u64,
}

impl BatchDumper {
    /// Every triple goes to the training file until ratios are set.
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            valid_ratio: 0.0,
            test_ratio: 0.0,
            seed: 0,
        }
    }

    /// Fractions of the triples sent to the validation and test files.
    pub fn with_ratios(mut self, valid: f64, test: f64) -> Result<Self> {
        let ok = |r: f64| (0.0..=1.0).contains(&r);
        if !ok(valid) || !ok(test) || valid + test > 1.0 {
            return Err(TridentError::misuse(format!(
                "invalid split ratios {valid} and {test}"
            )));
        }
        self.valid_ratio = valid;
        self.test_ratio = test;
        Ok(self)
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Drains `itr`, an iterator over SPO, into the three batch files.
    #[instrument(level = "debug", skip(self, itr), fields(dir = %self.dir.display()))]
    pub fn dump(&self, itr: &mut dyn PairItr) -> Result<BatchCounts> {
        fs::create_dir_all(&self.dir)?;
        let mut train = Sink::create(&self.dir.join(BATCH_FILE))?;
        let mut valid = Sink::create(&self.dir.join(BATCH_VALID_FILE))?;
        let mut test = Sink::create(&self.dir.join(BATCH_TEST_FILE))?;
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let mut counts = BatchCounts::default();

        while itr.has_next()? {
            itr.next()?;
            let spo = [itr.key(), itr.value1(), itr.value2()];
            if spo.iter().any(|v| !(0..=MAX_TERM).contains(v)) {
                return Err(TridentError::misuse(format!(
                    "triple {spo:?} does not fit the batch encoding"
                )));
            }
            let draw: f64 = rng.gen();
            if draw < self.valid_ratio {
                valid.push(spo)?;
                counts.valid += 1;
            } else if draw < self.valid_ratio + self.test_ratio {
                test.push(spo)?;
                counts.test += 1;
            } else {
                train.push(spo)?;
                counts.train += 1;
            }
        }
        train.finish()?;
        valid.finish()?;
        test.finish()?;
        info!(train = counts.train, valid = counts.valid, test = counts.test, "dumped batch");
        Ok(counts)
    }
}

/// Iterates over the triples of one batch file.
pub struct BatchReader {
    data: Option<Mmap>,
    pos: usize,
}

impl BatchReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len % TRIPLE_BYTES != 0 {
            return Err(TridentError::corrupt(format!(
                "{} holds {len} bytes, not a whole number of triples",
                path.display()
            )));
        }
        // empty files cannot be mapped
        let data = match len {
            | 0 => None,
            | _ => Some(unsafe { Mmap::map(&file)? }),
        };
        Ok(Self { data, pos: 0 })
    }

    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len() / TRIPLE_BYTES)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Iterator for BatchReader {
    type Item = [i64; 3];

    fn next(&mut self) -> Option<Self::Item> {
        let data = self.data.as_ref()?;
        let chunk = data.get(self.pos..self.pos + TRIPLE_BYTES)?;
        self.pos += TRIPLE_BYTES;
        let term = |i: usize| codec::decode_fixed(&chunk[i * TERM_BYTES..], TERM_BYTES) as i64;
        Some([term(0), term(1), term(2)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itr::ReOrderItr;

    fn triples(n: i64) -> Vec<[i64; 3]> {
        (0..n).map(|i| [i, i % 7, (1 << 39) + i]).collect()
    }

    #[test]
    fn test_everything_lands_in_training_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut itr = ReOrderItr::from_triples(triples(100));
        let counts = BatchDumper::new(dir.path()).dump(&mut itr).unwrap();
        assert_eq!(counts, BatchCounts { train: 100, valid: 0, test: 0 });

        let reader = BatchReader::open(&dir.path().join(BATCH_FILE)).unwrap();
        assert_eq!(reader.len(), 100);
        let got: Vec<_> = reader.collect();
        assert_eq!(got, triples(100));
        assert!(BatchReader::open(&dir.path().join(BATCH_TEST_FILE)).unwrap().is_empty());
    }

    #[test]
    fn test_split_covers_every_triple() {
        let dir = tempfile::tempdir().unwrap();
        let mut itr = ReOrderItr::from_triples(triples(2000));
        let counts = BatchDumper::new(dir.path())
            .with_ratios(0.2, 0.1)
            .unwrap()
            .with_seed(7)
            .dump(&mut itr)
            .unwrap();
        assert_eq!(counts.total(), 2000);
        assert!(counts.valid > 250 && counts.valid < 550);
        assert!(counts.test > 100 && counts.test < 300);

        let mut all: Vec<_> = [BATCH_FILE, BATCH_VALID_FILE, BATCH_TEST_FILE]
            .iter()
            .flat_map(|f| BatchReader::open(&dir.path().join(f)).unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, triples(2000));
    }

    #[test]
    fn test_rejects_bad_ratios_and_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BatchDumper::new(dir.path()).with_ratios(0.7, 0.5).unwrap_err().is_misuse());
        assert!(BatchDumper::new(dir.path()).with_ratios(-0.1, 0.0).is_err());

        let path = dir.path().join("odd");
        fs::write(&path, [0u8; 16]).unwrap();
        assert!(matches!(BatchReader::open(&path), Err(TridentError::CorruptData(_))));
    }
}
