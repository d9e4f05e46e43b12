// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::{
    fs::{
        self,
        File,
    },
    io::{
        BufReader,
        BufWriter,
        Read,
        Write,
    },
    path::PathBuf,
};

use bytes::{
    BufMut,
    BytesMut,
};
use tracing::debug;

use crate::{
    codec,
    errs::{
        Result,
        TridentError,
    },
    fs::manager::FileManager,
    table::strategy::{
        StorageStrat,
        TableLayout,
    },
};

const FLUSH_BYTES: usize = 64 * 1024;

/// Writes the pairs of one table. Pairs arrive in non-decreasing (v1, v2)
/// order; `stop` finalizes the encoding and flushes everything still
/// buffered.
pub trait TableInserter: Send {
    fn append_pair(&mut self, out: &FileManager, v1: u64, v2: u64) -> Result<()>;

    fn stop(&mut self, out: &FileManager) -> Result<()>;

    fn n_pairs(&self) -> u64;
}

/// Builds the inserter matching `strat`. Column inserters spill to a file in
/// `tmp_dir` once `offload_threshold` pairs are buffered.
pub fn inserter_for(
    strat: StorageStrat,
    offload_threshold: usize,
    tmp_dir: PathBuf,
) -> Box<dyn TableInserter> {
    match strat.layout() {
        | TableLayout::Row => Box::new(RowInserter::new(strat)),
        | TableLayout::Cluster => Box::new(ClusterInserter::new(strat)),
        | TableLayout::Column => Box::new(ColumnInserter::new(offload_threshold, tmp_dir)),
    }
}

fn check_order(prev: Option<(u64, u64)>, v1: u64, v2: u64) -> Result<()> {
    match prev {
        | Some(p) if p > (v1, v2) => Err(TridentError::misuse(format!(
            "pair ({v1}, {v2}) appended after {p:?}"
        ))),
        | _ => Ok(()),
    }
}

fn check_width(value: u64, nbytes: usize, what: &str) -> Result<()> {
    if codec::num_bytes(value) > nbytes {
        return Err(TridentError::misuse(format!(
            "{what} {value} does not fit in {nbytes} bytes"
        )));
    }
    Ok(())
}

pub struct RowInserter {
    strat: StorageStrat,
    buf: BytesMut,
    prev: Option<(u64, u64)>,
    n: u64,
}

impl RowInserter {
    pub fn new(strat: StorageStrat) -> Self {
        Self {
            strat,
            buf: BytesMut::with_capacity(FLUSH_BYTES),
            prev: None,
            n: 0,
        }
    }
}

impl TableInserter for RowInserter {
    fn append_pair(&mut self, out: &FileManager, v1: u64, v2: u64) -> Result<()> {
        check_order(self.prev, v1, v2)?;
        check_width(v1, self.strat.bytes_v1(), "value1")?;
        check_width(v2, self.strat.bytes_v2(), "value2")?;
        codec::put_fixed(&mut self.buf, self.strat.bytes_v1(), v1);
        codec::put_fixed(&mut self.buf, self.strat.bytes_v2(), v2);
        self.prev = Some((v1, v2));
        self.n += 1;
        if self.buf.len() >= FLUSH_BYTES {
            out.append(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    fn stop(&mut self, out: &FileManager) -> Result<()> {
        if !self.buf.is_empty() {
            out.append(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    fn n_pairs(&self) -> u64 {
        self.n
    }
}

/// Streams groups as `v1, count, v2...`. The count of a group is only known
/// once the next value1 shows up, so a placeholder is written and patched.
pub struct ClusterInserter {
    strat: StorageStrat,
    prev: Option<(u64, u64)>,
    // file and position of the pending count placeholder
    count_at: Option<(u16, usize)>,
    group_size: u64,
    n: u64,
}

impl ClusterInserter {
    pub fn new(strat: StorageStrat) -> Self {
        Self {
            strat,
            prev: None,
            count_at: None,
            group_size: 0,
            n: 0,
        }
    }

    fn close_group(&mut self, out: &FileManager) -> Result<()> {
        if let Some((file, pos)) = self.count_at.take() {
            check_width(self.group_size, self.strat.bytes_count(), "group size")?;
            out.overwrite_long_at(file, pos, self.strat.bytes_count(), self.group_size)?;
        }
        self.group_size = 0;
        Ok(())
    }
}

impl TableInserter for ClusterInserter {
    fn append_pair(&mut self, out: &FileManager, v1: u64, v2: u64) -> Result<()> {
        check_order(self.prev, v1, v2)?;
        check_width(v1, self.strat.bytes_v1(), "value1")?;
        check_width(v2, self.strat.bytes_v2(), "value2")?;
        if self.prev.map(|p| p.0) != Some(v1) {
            self.close_group(out)?;
            out.append_long(self.strat.bytes_v1(), v1)?;
            self.count_at = Some(out.append_long(self.strat.bytes_count(), 0)?);
        }
        out.append_long(self.strat.bytes_v2(), v2)?;
        self.group_size += 1;
        self.prev = Some((v1, v2));
        self.n += 1;
        Ok(())
    }

    fn stop(&mut self, out: &FileManager) -> Result<()> {
        self.close_group(out)
    }

    fn n_pairs(&self) -> u64 {
        self.n
    }
}

/// Buffers the whole table, then writes a header, one entry per distinct
/// value1 (`v1, count, offset`) and finally every value2. Widths are the
/// minimum needed by the observed maxima.
pub struct ColumnInserter {
    pairs: Vec<(u64, u64)>,
    offload_threshold: usize,
    tmp_path: PathBuf,
    spill: Option<BufWriter<File>>,
    prev: Option<(u64, u64)>,
    max1: u64,
    max2: u64,
    ngroups: u64,
    max_group: u64,
    run: u64,
    n: u64,
}

impl ColumnInserter {
    pub fn new(offload_threshold: usize, tmp_dir: PathBuf) -> Self {
        Self {
            pairs: Vec::new(),
            offload_threshold: offload_threshold.max(1),
            tmp_path: tmp_dir.join("_column_offload"),
            spill: None,
            prev: None,
            max1: 0,
            max2: 0,
            ngroups: 0,
            max_group: 0,
            run: 0,
            n: 0,
        }
    }

    fn offload(&mut self) -> Result<()> {
        if self.spill.is_none() {
            debug!(path = %self.tmp_path.display(), "offloading column table pairs");
            self.spill = Some(BufWriter::new(File::create(&self.tmp_path)?));
        }
        if let Some(w) = self.spill.as_mut() {
            for (v1, v2) in self.pairs.drain(..) {
                w.write_all(&v1.to_le_bytes())?;
                w.write_all(&v2.to_le_bytes())?;
            }
        }
        Ok(())
    }

    // Replays every pair, spilled ones first.
    fn for_each_pair(&mut self, mut f: impl FnMut(u64, u64) -> Result<()>) -> Result<()> {
        if self.spill.is_some() {
            let mut reader = BufReader::new(File::open(&self.tmp_path)?);
            let mut rec = [0u8; 16];
            loop {
                match reader.read_exact(&mut rec) {
                    | Ok(()) => {},
                    | Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    | Err(e) => return Err(e.into()),
                }
                let v1 = codec::decode_fixed(&rec[..8], 8);
                let v2 = codec::decode_fixed(&rec[8..], 8);
                f(v1, v2)?;
            }
        }
        for (v1, v2) in self.pairs.iter() {
            f(*v1, *v2)?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.pairs.clear();
        if self.spill.take().is_some() {
            fs::remove_file(&self.tmp_path)?;
        }
        self.prev = None;
        self.max1 = 0;
        self.max2 = 0;
        self.ngroups = 0;
        self.max_group = 0;
        self.run = 0;
        self.n = 0;
        Ok(())
    }
}

/// Column header: `((w1-1)<<3 | (w2-1))`, `((wc-1)<<3 | (wo-1))`, then
/// vlong2 number of groups and vlong2 number of pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ColumnHeader {
    pub(crate) w1: usize,
    pub(crate) w2: usize,
    pub(crate) wc: usize,
    pub(crate) wo: usize,
    pub(crate) ngroups: u64,
    pub(crate) nterms: u64,
}

impl ColumnHeader {
    pub(crate) fn write(&self, buf: &mut BytesMut) {
        buf.put_u8((((self.w1 - 1) << 3) | (self.w2 - 1)) as u8);
        buf.put_u8((((self.wc - 1) << 3) | (self.wo - 1)) as u8);
        codec::put_vlong2(buf, self.ngroups);
        codec::put_vlong2(buf, self.nterms);
    }

    /// Parses the header, returning it and its length.
    pub(crate) fn read(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(TridentError::corrupt("column table shorter than its header"));
        }
        let w1 = ((data[0] >> 3) & 7) as usize + 1;
        let w2 = (data[0] & 7) as usize + 1;
        let wc = ((data[1] >> 3) & 7) as usize + 1;
        let wo = (data[1] & 7) as usize + 1;
        let mut pos = 2;
        let ngroups = codec::decode_vlong2(data, &mut pos)?;
        let nterms = codec::decode_vlong2(data, &mut pos)?;
        Ok((
            ColumnHeader {
                w1,
                w2,
                wc,
                wo,
                ngroups,
                nterms,
            },
            pos,
        ))
    }
}

impl TableInserter for ColumnInserter {
    fn append_pair(&mut self, _out: &FileManager, v1: u64, v2: u64) -> Result<()> {
        check_order(self.prev, v1, v2)?;
        if self.prev.map(|p| p.0) != Some(v1) {
            self.ngroups += 1;
            self.run = 0;
        }
        self.run += 1;
        self.max_group = self.max_group.max(self.run);
        self.max1 = self.max1.max(v1);
        self.max2 = self.max2.max(v2);
        self.prev = Some((v1, v2));
        self.n += 1;
        self.pairs.push((v1, v2));
        if self.pairs.len() >= self.offload_threshold {
            self.offload()?;
        }
        Ok(())
    }

    fn stop(&mut self, out: &FileManager) -> Result<()> {
        if self.spill.is_some() {
            self.offload()?;
            if let Some(w) = self.spill.as_mut() {
                w.flush()?;
            }
        }
        let header = ColumnHeader {
            w1: codec::num_bytes(self.max1),
            w2: codec::num_bytes(self.max2),
            wc: codec::num_bytes(self.max_group),
            wo: codec::num_bytes(self.n),
            ngroups: self.ngroups,
            nterms: self.n,
        };
        let mut buf = BytesMut::with_capacity(FLUSH_BYTES);
        header.write(&mut buf);

        // first pass: one entry per group
        let mut group: Option<(u64, u64, u64)> = None;
        let mut idx = 0u64;
        self.for_each_pair(|v1, _| {
            match group.as_mut() {
                | Some(g) if g.0 == v1 => g.1 += 1,
                | _ => {
                    if let Some((gv, count, offset)) = group.take() {
                        codec::put_fixed(&mut buf, header.w1, gv);
                        codec::put_fixed(&mut buf, header.wc, count);
                        codec::put_fixed(&mut buf, header.wo, offset);
                    }
                    group = Some((v1, 1, idx));
                },
            }
            idx += 1;
            if buf.len() >= FLUSH_BYTES {
                out.append(&buf)?;
                buf.clear();
            }
            Ok(())
        })?;
        if let Some((gv, count, offset)) = group {
            codec::put_fixed(&mut buf, header.w1, gv);
            codec::put_fixed(&mut buf, header.wc, count);
            codec::put_fixed(&mut buf, header.wo, offset);
        }

        // second pass: every value2
        self.for_each_pair(|_, v2| {
            codec::put_fixed(&mut buf, header.w2, v2);
            if buf.len() >= FLUSH_BYTES {
                out.append(&buf)?;
                buf.clear();
            }
            Ok(())
        })?;
        if !buf.is_empty() {
            out.append(&buf)?;
        }
        let n = self.n;
        self.reset()?;
        self.n = n;
        Ok(())
    }

    fn n_pairs(&self) -> u64 {
        self.n
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::fs::manager::FileLimits;

    fn manager(dir: &std::path::Path) -> FileManager {
        let fm = FileManager::open(
            dir,
            false,
            FileLimits {
                max_files: 4,
                max_open: 4,
                max_sessions: 4,
                cache_max_bytes: usize::MAX,
            },
        )
        .unwrap();
        fm.create_new_file().unwrap();
        fm
    }

    #[test]
    fn test_row_rejects_out_of_order_and_wide_values() {
        let dir = tempdir().unwrap();
        let fm = manager(dir.path());
        let mut ins = RowInserter::new(StorageStrat::row(1, 1).unwrap());
        ins.append_pair(&fm, 1, 2).unwrap();
        assert!(ins.append_pair(&fm, 1, 1).is_err());
        assert!(ins.append_pair(&fm, 1, 256).is_err());
        ins.stop(&fm).unwrap();
        assert_eq!(fm.size_last_file().unwrap(), 2);
    }

    #[test]
    fn test_cluster_backfills_counts() {
        let dir = tempdir().unwrap();
        let fm = manager(dir.path());
        let mut ins = ClusterInserter::new(StorageStrat::cluster(1, 1, false).unwrap());
        for (a, b) in [(2, 1), (3, 1), (3, 2)] {
            ins.append_pair(&fm, a, b).unwrap();
        }
        ins.stop(&fm).unwrap();
        let r = fm.read(0, 0, fm.size_last_file().unwrap(), None).unwrap();
        assert_eq!(&r[..], &[2, 1, 1, 3, 2, 1, 2]);
    }

    #[test]
    fn test_column_offload_matches_in_memory() {
        let dir = tempdir().unwrap();
        let pairs: Vec<(u64, u64)> = (0..50).map(|i| (i / 7, 1000 + i)).collect();
        let mut outputs = Vec::new();
        for threshold in [1_000, 8] {
            let sub = dir.path().join(format!("t{threshold}"));
            let fm = manager(&sub);
            let mut ins = ColumnInserter::new(threshold, sub.clone());
            for (a, b) in pairs.iter() {
                ins.append_pair(&fm, *a, *b).unwrap();
            }
            ins.stop(&fm).unwrap();
            assert!(!sub.join("_column_offload").exists());
            outputs.push(fm.read_all(0, None).unwrap().to_vec());
        }
        assert_eq!(outputs[0], outputs[1]);
        let (hdr, _) = ColumnHeader::read(&outputs[0]).unwrap();
        assert_eq!(hdr.ngroups, 8);
        assert_eq!(hdr.nterms, 50);
        assert_eq!(hdr.w2, 2);
    }
}
