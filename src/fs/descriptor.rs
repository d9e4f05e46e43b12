// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::{
    fmt,
    fs::{
        File,
        OpenOptions,
    },
    ops::{
        Deref,
        Range,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use bytes::Bytes;
use memmap2::{
    Mmap,
    MmapMut,
};
use tracing::{
    error,
    trace,
};

use crate::{
    config::{
        FILE_PREALLOC,
        SMALLEST_INCR,
    },
    errs::{
        Result,
        TridentError,
    },
};

#[derive(Clone)]
enum Backing {
    Mapped(Arc<Mmap>),
    Owned(Bytes),
}

/// A byte range of a file: a shared handle on the backing memory plus an
/// offset and length. The mapping stays alive for as long as any region
/// referencing it does, so a region never dangles after its file is evicted.
#[derive(Clone)]
pub struct Region {
    backing: Backing,
    start: usize,
    end: usize,
}

impl Region {
    pub fn from_bytes(bytes: Bytes) -> Self {
        let end = bytes.len();
        Region {
            backing: Backing::Owned(bytes),
            start: 0,
            end,
        }
    }

    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    fn mapped(map: Arc<Mmap>, range: Range<usize>) -> Self {
        Region {
            backing: Backing::Mapped(map),
            start: range.start,
            end: range.end,
        }
    }

    /// A sub-range, relative to this region.
    pub fn slice(&self, range: Range<usize>) -> Result<Region> {
        if range.start > range.end || range.end > self.len() {
            return Err(TridentError::corrupt(format!(
                "sub-range {:?} outside region of {} bytes",
                range,
                self.len()
            )));
        }
        Ok(Region {
            backing: self.backing.clone(),
            start: self.start + range.start,
            end: self.start + range.end,
        })
    }
}

impl Deref for Region {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.backing {
            | Backing::Mapped(map) => &map[self.start..self.end],
            | Backing::Owned(b) => &b[self.start..self.end],
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

enum Mode {
    ReadOnly(Option<Arc<Mmap>>),
    Writable {
        file: File,
        map: MmapMut,
        used: usize,
    },
}

/// One data file. Read-only descriptors map the whole file once and hand out
/// shared regions. Writable descriptors keep a growable mutable mapping and
/// truncate the file to its used size when closed.
pub(crate) struct FileDescriptor {
    path: PathBuf,
    mode: Mode,
}

impl FileDescriptor {
    pub(crate) fn open_read_only(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let map = if len == 0 {
            None
        } else {
            // SAFETY: read-only knowledge bases are never written while open.
            Some(Arc::new(unsafe { Mmap::map(&file)? }))
        };
        Ok(Self {
            path: path.to_path_buf(),
            mode: Mode::ReadOnly(map),
        })
    }

    /// Opens (or creates) a file for appending. Existing content is kept.
    pub(crate) fn open_writable(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let used = file.metadata()?.len() as usize;
        file.set_len((used + FILE_PREALLOC) as u64)?;
        // SAFETY: the file is exclusively owned by this descriptor while in
        // write mode.
        let map = unsafe { MmapMut::map_mut(&file)? };
        trace!(path = %path.display(), used, "opened writable file");
        Ok(Self {
            path: path.to_path_buf(),
            mode: Mode::Writable { file, map, used },
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_writable(&self) -> bool {
        matches!(self.mode, Mode::Writable { .. })
    }

    pub(crate) fn len(&self) -> usize {
        match &self.mode {
            | Mode::ReadOnly(Some(map)) => map.len(),
            | Mode::ReadOnly(None) => 0,
            | Mode::Writable { used, .. } => *used,
        }
    }

    pub(crate) fn read(&self, pos: usize, len: usize) -> Result<Region> {
        let end = pos
            .checked_add(len)
            .filter(|end| *end <= self.len())
            .ok_or_else(|| {
                TridentError::corrupt(format!(
                    "read of {len} bytes at {pos} beyond end of {} ({} bytes)",
                    self.path.display(),
                    self.len()
                ))
            })?;
        match &self.mode {
            | Mode::ReadOnly(Some(map)) => Ok(Region::mapped(map.clone(), pos..end)),
            | Mode::ReadOnly(None) => Ok(Region::empty()),
            | Mode::Writable { map, .. } => {
                Ok(Region::from_bytes(Bytes::copy_from_slice(&map[pos..end])))
            },
        }
    }

    fn writable(&mut self) -> Result<(&mut File, &mut MmapMut, &mut usize)> {
        match &mut self.mode {
            | Mode::Writable { file, map, used } => Ok((file, map, used)),
            | Mode::ReadOnly(_) => Err(TridentError::misuse(format!(
                "write to read-only file {}",
                self.path.display()
            ))),
        }
    }

    /// Makes room for `extra` more bytes, remapping if the file must grow.
    fn reserve(&mut self, extra: usize) -> Result<()> {
        let (file, map, used) = self.writable()?;
        let needed = *used + extra;
        if needed <= map.len() {
            return Ok(());
        }
        let capacity = map.len();
        let new_capacity = capacity + SMALLEST_INCR.max(needed - capacity).max(capacity);
        map.flush()?;
        file.set_len(new_capacity as u64)?;
        // SAFETY: see open_writable.
        *map = unsafe { MmapMut::map_mut(&*file)? };
        trace!(capacity = new_capacity, "grew writable file");
        Ok(())
    }

    /// Appends `data` and returns the position it was written at.
    pub(crate) fn append(&mut self, data: &[u8]) -> Result<usize> {
        self.reserve(data.len())?;
        let (_, map, used) = self.writable()?;
        let pos = *used;
        map[pos..pos + data.len()].copy_from_slice(data);
        *used += data.len();
        Ok(pos)
    }

    pub(crate) fn overwrite_at(&mut self, pos: usize, data: &[u8]) -> Result<()> {
        let (_, map, used) = self.writable()?;
        if pos + data.len() > *used {
            return Err(TridentError::misuse(format!(
                "overwrite of {} bytes at {pos} past written size {used}",
                data.len()
            )));
        }
        map[pos..pos + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Moves every byte from `pos` to the end `delta` bytes forward, leaving a
    /// zeroed gap of `delta` bytes at `pos`.
    pub(crate) fn shift(&mut self, pos: usize, delta: usize) -> Result<()> {
        self.reserve(delta)?;
        let (_, map, used) = self.writable()?;
        if pos > *used {
            return Err(TridentError::misuse(format!(
                "shift from {pos} past written size {used}"
            )));
        }
        map.copy_within(pos..*used, pos + delta);
        map[pos..pos + delta].fill(0);
        *used += delta;
        Ok(())
    }

    /// Drops everything after `len`.
    pub(crate) fn truncate(&mut self, len: usize) -> Result<()> {
        let (_, _, used) = self.writable()?;
        if len < *used {
            *used = len;
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        if let Mode::Writable { map, .. } = &mut self.mode {
            map.flush()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Mode::Writable { file, map, used } = &mut self.mode {
            map.flush()?;
            file.set_len(*used as u64)?;
        }
        Ok(())
    }
}

impl Drop for FileDescriptor {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            error!(path = %self.path.display(), error = %e, "failed to close file");
        }
    }
}
