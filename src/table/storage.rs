// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    fs::{
        File,
        OpenOptions,
    },
    io::{
        Read,
        Seek,
        SeekFrom,
        Write,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use bytes::{
    BufMut,
    BytesMut,
};
use memmap2::Mmap;
use parking_lot::{
    Mutex,
    RwLock,
};
use tracing::{
    debug,
    instrument,
};

use crate::{
    codec,
    config::KbConfig,
    errs::{
        Result,
        TridentError,
    },
    fs::{
        manager::{
            FileLimits,
            FileManager,
            SessionId,
        },
        Region,
    },
    table::{
        inserter::TableInserter,
        strategy::StorageStrat,
    },
};

/// Bytes per record in a `.idx` file: 5 position, 5 key, 1 strategy.
pub const MARK_SIZE: usize = 11;
const MARKS_HEADER: usize = 8;
const MAX_40_BITS: u64 = (1 << 40) - 1;

/// Where one table begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    pub pos: u64,
    pub key: u64,
    pub strat: u8,
}

/// The mark index of one data file.
#[derive(Debug)]
pub struct FileMarks {
    map: Mmap,
    n: usize,
    file_size: usize,
}

impl FileMarks {
    fn load(path: &Path, file_size: usize) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < MARKS_HEADER {
            return Err(TridentError::corrupt(format!(
                "mark index {} shorter than its header",
                path.display()
            )));
        }
        // SAFETY: mark indices are immutable once the storage is read-only.
        let map = unsafe { Mmap::map(&file)? };
        let n = codec::decode_fixed(&map[..], 8) as usize;
        if MARKS_HEADER + n * MARK_SIZE != len {
            return Err(TridentError::corrupt(format!(
                "mark index {} holds {} bytes for {n} marks",
                path.display(),
                len
            )));
        }
        Ok(Self { map, n, file_size })
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    #[inline]
    fn record(&self, mark: usize) -> &[u8] {
        let off = MARKS_HEADER + mark * MARK_SIZE;
        &self.map[off..off + MARK_SIZE]
    }

    pub fn start(&self, mark: usize) -> usize {
        codec::decode_fixed(self.record(mark), 5) as usize
    }

    pub fn end(&self, mark: usize) -> usize {
        if mark + 1 < self.n {
            self.start(mark + 1)
        } else {
            self.file_size
        }
    }

    pub fn key(&self, mark: usize) -> u64 {
        codec::decode_fixed(&self.record(mark)[5..], 5)
    }

    pub fn strat(&self, mark: usize) -> u8 {
        self.record(mark)[10]
    }

    pub fn get(&self, mark: usize) -> Result<Mark> {
        if mark >= self.n {
            return Err(TridentError::corrupt(format!(
                "mark {mark} out of {} marks",
                self.n
            )));
        }
        Ok(Mark {
            pos: self.start(mark) as u64,
            key: self.key(mark),
            strat: self.strat(mark),
        })
    }

    /// Index of the first mark whose key is `>= key`.
    pub fn lower_bound(&self, from: usize, key: u64) -> usize {
        let (mut lo, mut hi) = (from, self.n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

struct Writer {
    pending: BTreeMap<u16, Vec<Mark>>,
    // marks of each file already on disk
    flushed: HashMap<u16, usize>,
    current: Option<Box<dyn TableInserter>>,
}

/// The table catalog of one permutation. Tables are appended to numbered data
/// files; every table start is recorded as a [`Mark`] in the `N.idx` sidecar
/// of its file.
pub struct TableStorage {
    dir: PathBuf,
    files: FileManager,
    read_only: bool,
    max_file_size: usize,
    marks_flush_threshold: usize,
    offload_threshold: usize,
    marks: RwLock<HashMap<u16, Option<Arc<FileMarks>>>>,
    writer: Mutex<Writer>,
}

impl TableStorage {
    #[instrument(level = "debug", skip(cfg))]
    pub fn open(dir: &Path, cfg: &KbConfig) -> Result<Self> {
        let files = FileManager::open(dir, cfg.read_only(), FileLimits::from(cfg))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            read_only: cfg.read_only(),
            max_file_size: cfg.table_max_file_size(),
            marks_flush_threshold: cfg.marks_flush_threshold().max(1),
            offload_threshold: cfg.threshold_to_offload(),
            marks: RwLock::new(HashMap::new()),
            writer: Mutex::new(Writer {
                pending: BTreeMap::new(),
                flushed: HashMap::new(),
                current: None,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn offload_threshold(&self) -> usize {
        self.offload_threshold
    }

    fn idx_path(&self, file: u16) -> PathBuf {
        self.dir.join(format!("{file}.idx"))
    }

    pub fn last_file(&self) -> Option<u16> {
        self.files.last_file()
    }

    pub fn n_files(&self) -> usize {
        self.files.n_files()
    }

    pub(crate) fn new_session(&self) -> Result<SessionId> {
        self.files.new_session()
    }

    pub(crate) fn close_session(&self, id: SessionId) -> Result<()> {
        self.files.close_session(id)
    }

    /// Opens a table for `key` and hands its pairs to `inserter`. Returns the
    /// file and mark index the table was recorded under.
    pub fn start_append(
        &self,
        key: u64,
        strat: StorageStrat,
        inserter: Box<dyn TableInserter>,
    ) -> Result<(u16, u64)> {
        if self.read_only {
            return Err(TridentError::misuse("start_append on a read-only table storage"));
        }
        if key > MAX_40_BITS {
            return Err(TridentError::misuse(format!("table key {key} exceeds 40 bits")));
        }
        let mut w = self.writer.lock();
        if w.current.is_some() {
            return Err(TridentError::misuse("start_append while a table is still open"));
        }
        let needs_roll = match self.files.last_file() {
            | None => true,
            | Some(_) => self.files.size_last_file()? >= self.max_file_size,
        };
        if needs_roll {
            let previous = self.files.last_file();
            let file = self.files.create_new_file()?;
            debug!(dir = %self.dir.display(), file, "rolled table storage to a new file");
            if let Some(prev) = previous {
                self.flush_marks(&mut w, prev)?;
            }
        }
        let file = self
            .files
            .last_file()
            .ok_or_else(|| TridentError::corrupt("no data file after roll"))?;
        let pos = self.files.size_last_file()? as u64;
        let flushed = w.flushed.get(&file).copied().unwrap_or(0);
        let marks = w.pending.entry(file).or_default();
        marks.push(Mark {
            pos,
            key,
            strat: strat.byte(),
        });
        let mark = (flushed + marks.len() - 1) as u64;
        let full = marks.len() >= self.marks_flush_threshold;
        if full {
            self.flush_marks(&mut w, file)?;
        }
        w.current = Some(inserter);
        Ok((file, mark))
    }

    pub fn append(&self, v1: u64, v2: u64) -> Result<()> {
        let mut w = self.writer.lock();
        match w.current.as_mut() {
            | Some(ins) => ins.append_pair(&self.files, v1, v2),
            | None => Err(TridentError::misuse("append outside start_append/stop_append")),
        }
    }

    /// Finalizes the open table; returns the number of pairs it holds.
    pub fn stop_append(&self) -> Result<u64> {
        let mut w = self.writer.lock();
        let mut ins = w
            .current
            .take()
            .ok_or_else(|| TridentError::misuse("stop_append without start_append"))?;
        ins.stop(&self.files)?;
        Ok(ins.n_pairs())
    }

    /// Flushes every buffered mark and closes the data files.
    #[instrument(level = "debug", skip(self), fields(dir = %self.dir.display()))]
    pub fn stop_insert(&self) -> Result<()> {
        let mut w = self.writer.lock();
        if w.current.is_some() {
            return Err(TridentError::misuse("stop_insert while a table is still open"));
        }
        let files: Vec<u16> = w.pending.keys().copied().collect();
        for f in files {
            self.flush_marks(&mut w, f)?;
        }
        self.files.close_all()
    }

    // Appends the buffered marks of `file` to its `.idx` sidecar.
    fn flush_marks(&self, w: &mut Writer, file: u16) -> Result<()> {
        let marks = match w.pending.remove(&file) {
            | Some(m) if !m.is_empty() => m,
            | _ => return Ok(()),
        };
        let path = self.idx_path(file);
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut existing = 0u64;
        if f.metadata()?.len() >= MARKS_HEADER as u64 {
            let mut hdr = [0u8; 8];
            f.read_exact(&mut hdr)?;
            existing = u64::from_le_bytes(hdr);
        }
        let mut buf = BytesMut::with_capacity(marks.len() * MARK_SIZE);
        for m in marks.iter() {
            codec::put_fixed(&mut buf, 5, m.pos);
            codec::put_fixed(&mut buf, 5, m.key);
            buf.put_u8(m.strat);
        }
        f.seek(SeekFrom::Start(MARKS_HEADER as u64 + existing * MARK_SIZE as u64))?;
        f.write_all(&buf)?;
        f.seek(SeekFrom::Start(0))?;
        f.write_all(&(existing + marks.len() as u64).to_le_bytes())?;
        f.sync_data()?;
        *w.flushed.entry(file).or_default() += marks.len();
        self.marks.write().remove(&file);
        debug!(file, n = marks.len(), "flushed marks");
        Ok(())
    }

    /// The mark index of `file`, or `None` if no table starts in it.
    pub fn file_marks(&self, file: u16) -> Result<Option<Arc<FileMarks>>> {
        if let Some(m) = self.marks.read().get(&file) {
            return Ok(m.clone());
        }
        let mut cache = self.marks.write();
        if let Some(m) = cache.get(&file) {
            return Ok(m.clone());
        }
        let path = self.idx_path(file);
        let loaded = if path.exists() {
            let size = self.files.file_size(file)?;
            Some(Arc::new(FileMarks::load(&path, size)?))
        } else {
            None
        };
        cache.insert(file, loaded.clone());
        Ok(loaded)
    }

    /// Byte range `(start, end)` of table `mark` in `file`.
    pub fn get_pos(&self, file: u16, mark: u64) -> Result<(usize, usize)> {
        let marks = self
            .file_marks(file)?
            .ok_or_else(|| TridentError::corrupt(format!("file {file} has no mark index")))?;
        let mark = mark as usize;
        if mark >= marks.len() {
            return Err(TridentError::corrupt(format!(
                "mark {mark} out of {} in file {file}",
                marks.len()
            )));
        }
        let (start, end) = (marks.start(mark), marks.end(mark));
        if start > end {
            return Err(TridentError::corrupt(format!(
                "mark {mark} of file {file} starts after it ends"
            )));
        }
        Ok((start, end))
    }

    pub fn get_table(&self, file: u16, mark: u64, session: Option<SessionId>) -> Result<Region> {
        let (start, end) = self.get_pos(file, mark)?;
        self.files.read(file, start, end - start, session)
    }

    /// Finds the table of `key` by searching the mark indices.
    pub fn find_key(&self, key: u64) -> Result<Option<(u16, u64, u8)>> {
        for file in 0..self.n_files() as u16 {
            if let Some(marks) = self.file_marks(file)? {
                if marks.is_empty() || marks.key(marks.len() - 1) < key {
                    continue;
                }
                let m = marks.lower_bound(0, key);
                if m < marks.len() && marks.key(m) == key {
                    return Ok(Some((file, m as u64, marks.strat(m))));
                }
                return Ok(None);
            }
        }
        Ok(None)
    }
}
