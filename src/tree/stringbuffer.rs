// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    fs,
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
use parking_lot::Mutex;
use tracing::{
    debug,
    instrument,
    trace,
};

use crate::{
    codec,
    config::{
        KbConfig,
        SB_BLOCK_SIZE,
    },
    errs::{
        Result,
        TridentError,
    },
    fs::manager::{
        FileLimits,
        FileManager,
    },
};

const SB_DIR: &str = "sb";
const SB_IDX: &str = "sb.idx";
// entries between two uncompressed prefix bases
const BASE_EVERY: usize = 16;
const MIN_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy)]
struct BlockLoc {
    file: u16,
    pos: usize,
    len: usize,
}

struct SbInner {
    blocks: Vec<BlockLoc>,
    current: BytesMut,
    since_base: usize,
    base_off: usize,
    base_text: Vec<u8>,
    cache: HashMap<usize, Arc<Vec<u8>>>,
    lru: VecDeque<usize>,
}

/// Append-only store of term text. Entries are packed into blocks of about
/// 64KiB which are LZ4 compressed on disk; an entry may store only the suffix
/// it does not share with the most recent base entry of its block. Positions
/// are `block << 32 | offset`.
pub struct StringBuffer {
    dir: PathBuf,
    files: FileManager,
    read_only: bool,
    max_file_size: usize,
    max_cached: usize,
    inner: Mutex<SbInner>,
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

impl StringBuffer {
    #[instrument(level = "debug", skip(cfg))]
    pub fn open(dir: &Path, cfg: &KbConfig) -> Result<Self> {
        let files = FileManager::open(&dir.join(SB_DIR), cfg.read_only(), FileLimits::from(cfg))?;
        let idx = dir.join(SB_IDX);
        let mut blocks = Vec::new();
        if idx.exists() {
            let raw = fs::read(&idx)?;
            let mut buf = &raw[..];
            let n = codec::get_vlong(&mut buf)? as usize;
            for _ in 0..n {
                let file = codec::get_vlong(&mut buf)?;
                let file = u16::try_from(file)
                    .map_err(|_| TridentError::corrupt(format!("string buffer file {file}")))?;
                let pos = codec::get_vlong(&mut buf)? as usize;
                let len = codec::get_vlong(&mut buf)? as usize;
                blocks.push(BlockLoc { file, pos, len });
            }
        } else if cfg.read_only() {
            return Err(TridentError::corrupt(format!("missing {}", idx.display())));
        }
        debug!(dir = %dir.display(), blocks = blocks.len(), "opened string buffer");
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            read_only: cfg.read_only(),
            max_file_size: cfg.table_max_file_size(),
            max_cached: cfg.sb_cache_blocks().max(1),
            inner: Mutex::new(SbInner {
                blocks,
                current: BytesMut::with_capacity(SB_BLOCK_SIZE),
                since_base: 0,
                base_off: 0,
                base_text: Vec::new(),
                cache: HashMap::new(),
                lru: VecDeque::new(),
            }),
        })
    }

    /// Stores `text` and returns its position.
    pub fn append(&self, text: &[u8]) -> Result<u64> {
        if self.read_only {
            return Err(TridentError::misuse("append to a read-only string buffer"));
        }
        let mut inner = self.inner.lock();
        let worst = 2 * codec::MAX_VLONG_LEN + codec::vlong_len(text.len() as u64) + text.len();
        if !inner.current.is_empty() && inner.current.len() + worst > SB_BLOCK_SIZE {
            self.seal(&mut inner)?;
        }
        let block = inner.blocks.len() as u64;
        let off = inner.current.len();
        let prefix = if inner.since_base > 0 && inner.since_base < BASE_EVERY {
            common_prefix(&inner.base_text, text)
        } else {
            0
        };
        if prefix >= MIN_PREFIX {
            let back = (off - inner.base_off) as u64;
            codec::put_vlong(&mut inner.current, back);
            codec::put_vlong(&mut inner.current, prefix as u64);
            codec::put_bytes(&mut inner.current, &text[prefix..]);
            inner.since_base += 1;
        } else {
            codec::put_vlong(&mut inner.current, 0);
            codec::put_vlong(&mut inner.current, 0);
            codec::put_bytes(&mut inner.current, text);
            if inner.since_base == 0 || inner.since_base >= BASE_EVERY {
                inner.base_off = off;
                inner.base_text = text.to_vec();
                inner.since_base = 1;
            } else {
                inner.since_base += 1;
            }
        }
        Ok(block << 32 | off as u64)
    }

    // Compresses the open block onto disk.
    fn seal(&self, inner: &mut SbInner) -> Result<()> {
        if inner.current.is_empty() {
            return Ok(());
        }
        let roll = match self.files.last_file() {
            | None => true,
            | Some(_) => self.files.size_last_file()? >= self.max_file_size,
        };
        if roll {
            self.files.create_new_file()?;
        }
        let compressed = lz4_flex::compress_prepend_size(&inner.current);
        let (file, pos) = self.files.append(&compressed)?;
        trace!(block = inner.blocks.len(), raw = inner.current.len(), len = compressed.len(), "sealed block");
        inner.blocks.push(BlockLoc {
            file,
            pos,
            len: compressed.len(),
        });
        inner.current.clear();
        inner.since_base = 0;
        inner.base_text.clear();
        Ok(())
    }

    fn block(&self, inner: &mut SbInner, block: usize) -> Result<Arc<Vec<u8>>> {
        if let Some(b) = inner.cache.get(&block) {
            let b = b.clone();
            inner.lru.retain(|x| *x != block);
            inner.lru.push_back(block);
            return Ok(b);
        }
        let loc = *inner
            .blocks
            .get(block)
            .ok_or_else(|| TridentError::corrupt(format!("string buffer block {block} unknown")))?;
        let raw = self.files.read(loc.file, loc.pos, loc.len, None)?;
        let data = Arc::new(
            lz4_flex::decompress_size_prepended(&raw)
                .map_err(|e| TridentError::corrupt(format!("string buffer block {block}: {e}")))?,
        );
        while inner.cache.len() >= self.max_cached {
            match inner.lru.pop_front() {
                | Some(old) => {
                    inner.cache.remove(&old);
                },
                | None => break,
            }
        }
        inner.cache.insert(block, data.clone());
        inner.lru.push_back(block);
        Ok(data)
    }

    /// The text stored at `pos`.
    pub fn get(&self, pos: u64) -> Result<Vec<u8>> {
        let block = (pos >> 32) as usize;
        let off = (pos & 0xFFFF_FFFF) as usize;
        let mut inner = self.inner.lock();
        if block == inner.blocks.len() {
            return decode_entry(&inner.current, off);
        }
        let data = self.block(&mut inner, block)?;
        decode_entry(&data, off)
    }

    /// Seals the open block and writes the block index.
    #[instrument(level = "debug", skip(self), fields(dir = %self.dir.display()))]
    pub fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        self.seal(&mut inner)?;
        let mut buf = BytesMut::new();
        codec::put_vlong(&mut buf, inner.blocks.len() as u64);
        for b in inner.blocks.iter() {
            codec::put_vlong(&mut buf, b.file as u64);
            codec::put_vlong(&mut buf, b.pos as u64);
            codec::put_vlong(&mut buf, b.len as u64);
        }
        fs::write(self.dir.join(SB_IDX), &buf)?;
        self.files.close_all()
    }
}

fn decode_entry(block: &[u8], off: usize) -> Result<Vec<u8>> {
    let mut pos = off;
    let back = codec::decode_vlong(block, &mut pos)? as usize;
    let prefix = codec::decode_vlong(block, &mut pos)? as usize;
    let mut rest = block
        .get(pos..)
        .ok_or_else(|| TridentError::corrupt("string entry out of block"))?;
    let suffix = codec::get_bytes(&mut rest)?;
    if back == 0 {
        return Ok(suffix.to_vec());
    }
    let base_off = off
        .checked_sub(back)
        .ok_or_else(|| TridentError::corrupt("string entry base before block start"))?;
    let base = decode_entry(block, base_off)?;
    if prefix > base.len() {
        return Err(TridentError::corrupt("string entry prefix longer than its base"));
    }
    let mut out = Vec::with_capacity(prefix + suffix.len());
    out.put_slice(&base[..prefix]);
    out.put_slice(suffix);
    Ok(out)
}
