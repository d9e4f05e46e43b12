// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::{
    collections::HashMap,
    fs,
    path::{
        Path,
        PathBuf,
    },
    sync::atomic::{
        AtomicUsize,
        Ordering::Relaxed,
    },
};

use bytes::BytesMut;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::{
    debug,
    error,
    instrument,
};

use crate::{
    codec,
    config::KbConfig,
    errs::{
        Result,
        TridentError,
    },
    fs::descriptor::{
        FileDescriptor,
        Region,
    },
    memory::{
        BlockId,
        MemoryManager,
    },
};

pub(crate) type SessionId = usize;

/// Limits applied to a [`FileManager`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct FileLimits {
    pub(crate) max_files: usize,
    pub(crate) max_open: usize,
    pub(crate) max_sessions: usize,
    pub(crate) cache_max_bytes: usize,
}

impl From<&KbConfig> for FileLimits {
    fn from(cfg: &KbConfig) -> Self {
        Self {
            max_files: cfg.max_n_files(),
            max_open: cfg.max_open_files().min(cfg.max_blocks_in_cache()),
            max_sessions: cfg.max_sessions(),
            cache_max_bytes: cfg.cache_max_bytes(),
        }
    }
}

struct OpenFile {
    desc: FileDescriptor,
    block: BlockId,
}

struct Inner {
    open: HashMap<u16, OpenFile>,
    memory: MemoryManager<u16>,
    // the file a session currently pins, and the block holding its lock
    sessions: HashMap<SessionId, (u16, BlockId)>,
    last_file: Option<u16>,
    // lock held on the append target while writing
    append_lock: Option<BlockId>,
}

/// Owns the numbered data files (`0`, `1`, ...) of one directory. Files are
/// opened on demand and closed again when more than `max_open` are resident
/// or the byte budget is exceeded; files pinned by a session or targeted by
/// appends are never closed underneath their users.
pub(crate) struct FileManager {
    dir: PathBuf,
    read_only: bool,
    limits: FileLimits,
    free_sessions: SegQueue<SessionId>,
    next_session: AtomicUsize,
    inner: Mutex<Inner>,
}

impl FileManager {
    #[instrument(level = "debug", skip(limits))]
    pub(crate) fn open(dir: &Path, read_only: bool, limits: FileLimits) -> Result<Self> {
        if !read_only {
            fs::create_dir_all(dir)?;
        }
        let mut last_file: Option<u16> = None;
        if dir.exists() {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if let Some(id) = entry
                    .file_name()
                    .to_str()
                    .and_then(|n| n.parse::<u16>().ok())
                {
                    last_file = Some(last_file.map_or(id, |l| l.max(id)));
                }
            }
        }
        debug!(dir = %dir.display(), ?last_file, "opened file manager");
        Ok(Self {
            dir: dir.to_path_buf(),
            read_only,
            limits,
            free_sessions: SegQueue::new(),
            next_session: AtomicUsize::new(0),
            inner: Mutex::new(Inner {
                open: HashMap::new(),
                memory: MemoryManager::new(limits.cache_max_bytes, limits.max_open),
                sessions: HashMap::new(),
                last_file,
                append_lock: None,
            }),
        })
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn file_path(&self, id: u16) -> PathBuf {
        self.dir.join(id.to_string())
    }

    pub(crate) fn new_session(&self) -> Result<SessionId> {
        if let Some(id) = self.free_sessions.pop() {
            return Ok(id);
        }
        let id = self.next_session.fetch_add(1, Relaxed);
        if id >= self.limits.max_sessions {
            self.next_session.fetch_sub(1, Relaxed);
            return Err(TridentError::exhausted(format!(
                "more than {} file sessions",
                self.limits.max_sessions
            )));
        }
        Ok(id)
    }

    pub(crate) fn close_session(&self, id: SessionId) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some((_, block)) = inner.sessions.remove(&id) {
            inner.memory.release_lock(block)?;
        }
        self.free_sessions.push(id);
        Ok(())
    }

    // Makes sure `id` is open and returns its memory block.
    fn load_file(&self, inner: &mut Inner, id: u16) -> Result<BlockId> {
        if let Some(f) = inner.open.get(&id) {
            return Ok(f.block);
        }
        let path = self.file_path(id);
        let desc = if self.read_only {
            FileDescriptor::open_read_only(&path)?
        } else {
            FileDescriptor::open_writable(&path)?
        };
        let (block, evicted) = inner.memory.add(desc.len(), id)?;
        for old in evicted {
            if let Some(f) = inner.open.remove(&old) {
                debug!(file = old, path = %f.desc.path().display(), "closing evicted file");
            }
        }
        inner.open.insert(id, OpenFile { desc, block });
        Ok(block)
    }

    /// Returns `len` bytes at `pos` of file `id`. With a session, the file is
    /// pinned until the session reads from another file or is closed.
    pub(crate) fn read(
        &self,
        id: u16,
        pos: usize,
        len: usize,
        session: Option<SessionId>,
    ) -> Result<Region> {
        let mut inner = self.inner.lock();
        let block = self.load_file(&mut inner, id)?;
        if let Some(s) = session {
            match inner.sessions.get(&s).copied() {
                | Some((file, _)) if file == id => {},
                | Some((_, old)) => {
                    inner.memory.add_lock(block);
                    inner.memory.release_lock(old)?;
                    inner.sessions.insert(s, (id, block));
                },
                | None => {
                    inner.memory.add_lock(block);
                    inner.sessions.insert(s, (id, block));
                },
            }
        }
        match inner.open.get(&id) {
            | Some(f) => f.desc.read(pos, len),
            | None => Err(TridentError::corrupt(format!("file {id} vanished while loaded"))),
        }
    }

    pub(crate) fn read_all(&self, id: u16, session: Option<SessionId>) -> Result<Region> {
        let size = self.file_size(id)?;
        self.read(id, 0, size, session)
    }

    pub(crate) fn file_size(&self, id: u16) -> Result<usize> {
        let mut inner = self.inner.lock();
        self.load_file(&mut inner, id)?;
        Ok(inner.open.get(&id).map_or(0, |f| f.desc.len()))
    }

    pub(crate) fn exists(&self, id: u16) -> bool {
        self.file_path(id).exists()
    }

    pub(crate) fn last_file(&self) -> Option<u16> {
        self.inner.lock().last_file
    }

    pub(crate) fn n_files(&self) -> usize {
        self.last_file().map_or(0, |l| l as usize + 1)
    }

    /// Rolls appends over to a fresh file and returns its id.
    #[instrument(level = "debug", skip(self), fields(dir = %self.dir.display()))]
    pub(crate) fn create_new_file(&self) -> Result<u16> {
        if self.read_only {
            return Err(TridentError::misuse("create_new_file on a read-only store"));
        }
        let mut inner = self.inner.lock();
        let next = inner.last_file.map_or(0, |l| l as usize + 1);
        if next >= self.limits.max_files {
            error!(max = self.limits.max_files, "no more files can be created");
            return Err(TridentError::exhausted(format!(
                "more than {} files in {}",
                self.limits.max_files,
                self.dir.display()
            )));
        }
        let id = next as u16;
        if let Some(old) = inner.append_lock.take() {
            inner.memory.release_lock(old)?;
        }
        inner.last_file = Some(id);
        let block = self.load_file(&mut inner, id)?;
        inner.memory.add_lock(block);
        inner.append_lock = Some(block);
        Ok(id)
    }

    fn with_last_file<T>(
        &self,
        f: impl FnOnce(&mut FileDescriptor) -> Result<T>,
    ) -> Result<(u16, T)> {
        let mut inner = self.inner.lock();
        let id = inner
            .last_file
            .ok_or_else(|| TridentError::misuse("append before any file was created"))?;
        let block = self.load_file(&mut inner, id)?;
        if inner.append_lock != Some(block) {
            inner.memory.add_lock(block);
            inner.append_lock = Some(block);
        }
        let file = inner
            .open
            .get_mut(&id)
            .ok_or_else(|| TridentError::corrupt(format!("file {id} vanished while loaded")))?;
        let out = f(&mut file.desc)?;
        let len = file.desc.len();
        inner.memory.update(block, len);
        Ok((id, out))
    }

    fn with_file<T>(&self, id: u16, f: impl FnOnce(&mut FileDescriptor) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock();
        let block = self.load_file(&mut inner, id)?;
        let file = inner
            .open
            .get_mut(&id)
            .ok_or_else(|| TridentError::corrupt(format!("file {id} vanished while loaded")))?;
        let out = f(&mut file.desc)?;
        let len = file.desc.len();
        inner.memory.update(block, len);
        Ok(out)
    }

    /// Appends to the last created file; returns (file, position).
    pub(crate) fn append(&self, data: &[u8]) -> Result<(u16, usize)> {
        self.with_last_file(|d| d.append(data))
    }

    pub(crate) fn append_long(&self, nbytes: usize, value: u64) -> Result<(u16, usize)> {
        let mut buf = BytesMut::with_capacity(nbytes);
        codec::put_fixed(&mut buf, nbytes, value);
        self.append(&buf)
    }

    pub(crate) fn append_vlong(&self, value: u64) -> Result<(u16, usize)> {
        let mut buf = BytesMut::with_capacity(codec::MAX_VLONG_LEN);
        codec::put_vlong(&mut buf, value);
        self.append(&buf)
    }

    pub(crate) fn append_vlong2(&self, value: u64) -> Result<(u16, usize)> {
        let mut buf = BytesMut::with_capacity(codec::MAX_VLONG_LEN);
        codec::put_vlong2(&mut buf, value);
        self.append(&buf)
    }

    pub(crate) fn size_last_file(&self) -> Result<usize> {
        match self.last_file() {
            | Some(id) => self.file_size(id),
            | None => Ok(0),
        }
    }

    /// Patches already written bytes in place.
    pub(crate) fn overwrite_at(&self, id: u16, pos: usize, data: &[u8]) -> Result<()> {
        self.with_file(id, |d| d.overwrite_at(pos, data))
    }

    pub(crate) fn overwrite_long_at(&self, id: u16, pos: usize, nbytes: usize, value: u64) -> Result<()> {
        let mut buf = [0u8; 8];
        codec::encode_fixed(&mut buf, 0, nbytes, value);
        self.overwrite_at(id, pos, &buf[..nbytes])
    }

    pub(crate) fn overwrite_vlong2_at(&self, id: u16, pos: usize, value: u64, len: usize) -> Result<()> {
        let mut buf = [0u8; codec::MAX_VLONG_LEN];
        codec::encode_vlong2_fixed_len(&mut buf, value, len);
        self.overwrite_at(id, pos, &buf[..len])
    }

    /// Writes `data` at the end of file `id`, which need not be the append
    /// target.
    pub(crate) fn append_to(&self, id: u16, data: &[u8]) -> Result<usize> {
        if self.last_file().map_or(true, |l| id > l) {
            return Err(TridentError::misuse(format!("append to unknown file {id}")));
        }
        self.with_file(id, |d| d.append(data))
    }

    pub(crate) fn shift(&self, id: u16, pos: usize, delta: usize) -> Result<()> {
        self.with_file(id, |d| d.shift(pos, delta))
    }

    pub(crate) fn truncate(&self, id: u16, len: usize) -> Result<()> {
        self.with_file(id, |d| d.truncate(len))
    }

    /// Flushes and closes every open file. Sessions stay valid; files are
    /// reopened on the next access.
    pub(crate) fn close_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        for (_, f) in inner.open.iter_mut() {
            f.desc.flush()?;
        }
        let ids: Vec<(u16, BlockId)> = inner.open.iter().map(|(k, f)| (*k, f.block)).collect();
        for (id, block) in ids {
            if !inner.memory.is_used(block) {
                inner.memory.remove_block(block);
                inner.open.remove(&id);
            }
        }
        Ok(())
    }

    pub(crate) fn resident_files(&self) -> usize {
        self.inner.lock().open.len()
    }
}
