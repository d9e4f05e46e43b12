// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::{
    collections::BTreeMap,
    fs,
    path::{
        Path,
        PathBuf,
    },
};

use bytes::{
    BufMut,
    BytesMut,
};
use tracing::{
    debug,
    instrument,
};

use crate::{
    codec,
    errs::{
        Result,
        TridentError,
    },
    fs::{
        index::FileIndex,
        manager::{
            FileLimits,
            FileManager,
        },
        Region,
    },
    tree::node::NodeId,
};

const IDX_FILE: &str = "idx";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    file: u16,
    pos: usize,
    size: usize,
    available: usize,
}

/// Root pointer and counters of a tree, persisted next to the node slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TreeMeta {
    pub(crate) root: NodeId,
    pub(crate) next_id: NodeId,
    pub(crate) n_elements: u64,
}

/// On-disk slot allocator for serialized tree nodes. Each node owns a slot of
/// `available` bytes in one of the numbered node files; a node that outgrows
/// its slot widens it in place by shifting the rest of the file.
pub(crate) struct NodeManager {
    dir: PathBuf,
    files: FileManager,
    read_only: bool,
    node_min_bytes: usize,
    max_file_size: usize,
    slots: BTreeMap<NodeId, Slot>,
}

impl NodeManager {
    #[instrument(level = "debug", skip(limits))]
    pub(crate) fn open(
        dir: &Path,
        read_only: bool,
        node_min_bytes: usize,
        max_file_size: usize,
        limits: FileLimits,
    ) -> Result<(Self, Option<TreeMeta>)> {
        let files = FileManager::open(dir, read_only, limits)?;
        let mut mgr = Self {
            dir: dir.to_path_buf(),
            files,
            read_only,
            node_min_bytes,
            max_file_size,
            slots: BTreeMap::new(),
        };
        let meta = mgr.load_idx()?;
        Ok((mgr, meta))
    }

    fn idx_path(&self) -> PathBuf {
        self.dir.join(IDX_FILE)
    }

    fn load_idx(&mut self) -> Result<Option<TreeMeta>> {
        let path = self.idx_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        if raw.len() < 4 {
            return Err(TridentError::corrupt("node index shorter than its checksum"));
        }
        let (crc, body) = raw.split_at(4);
        let crc = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if crc32fast::hash(body) != crc {
            return Err(TridentError::corrupt(format!(
                "checksum mismatch in {}",
                path.display()
            )));
        }
        let mut buf = body;
        let meta = TreeMeta {
            root: codec::get_vlong(&mut buf)?,
            next_id: codec::get_vlong(&mut buf)?,
            n_elements: codec::get_vlong(&mut buf)?,
        };
        let index = FileIndex::deserialize(&mut buf)?;
        for i in 0..index.size_index() {
            let size = codec::get_vlong(&mut buf)? as usize;
            let available = codec::get_vlong(&mut buf)? as usize;
            self.slots.insert(index.key(i) as NodeId, Slot {
                file: index.file(i),
                pos: index.pos(i) as usize,
                size,
                available,
            });
        }
        debug!(nodes = self.slots.len(), root = meta.root, "loaded node index");
        Ok(Some(meta))
    }

    /// Writes the slot table and `meta` to the `idx` sidecar.
    pub(crate) fn save(&mut self, meta: TreeMeta) -> Result<()> {
        if self.read_only {
            return Err(TridentError::misuse("saving a read-only node manager"));
        }
        let mut index = FileIndex::new();
        let mut sizes = BytesMut::new();
        for (id, slot) in self.slots.iter() {
            let pos = u32::try_from(slot.pos).map_err(|_| {
                TridentError::exhausted(format!("node {id} at {} beyond 4GiB", slot.pos))
            })?;
            index.add(*id as i64, slot.file, pos)?;
            codec::put_vlong(&mut sizes, slot.size as u64);
            codec::put_vlong(&mut sizes, slot.available as u64);
        }
        let mut body = BytesMut::new();
        codec::put_vlong(&mut body, meta.root);
        codec::put_vlong(&mut body, meta.next_id);
        codec::put_vlong(&mut body, meta.n_elements);
        index.serialize(&mut body);
        body.put_slice(&sizes);
        let mut out = BytesMut::with_capacity(body.len() + 4);
        out.put_u32_le(crc32fast::hash(&body));
        out.put_slice(&body);
        fs::write(self.idx_path(), &out)?;
        self.files.close_all()
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.slots.contains_key(&id)
    }

    pub(crate) fn get(&self, id: NodeId) -> Result<Region> {
        let slot = self
            .slots
            .get(&id)
            .ok_or_else(|| TridentError::corrupt(format!("node {id} has no slot")))?;
        self.files.read(slot.file, slot.pos, slot.size, None)
    }

    /// Stores the serialized node `id`, widening its slot when needed.
    pub(crate) fn put(&mut self, id: NodeId, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(TridentError::misuse("writing a node of a read-only tree"));
        }
        let existing = self.slots.get(&id).copied();
        match existing {
            | Some(mut slot) => {
                if data.len() > slot.available {
                    let diff = data.len() - slot.available;
                    debug!(
                        node = id,
                        file = slot.file,
                        diff,
                        "node outgrew its slot, shifting the rest of the file"
                    );
                    self.files.shift(slot.file, slot.pos + slot.available, diff)?;
                    for other in self.slots.values_mut() {
                        if other.file == slot.file && other.pos > slot.pos {
                            other.pos += diff;
                        }
                    }
                    slot.available += diff;
                }
                self.files.overwrite_at(slot.file, slot.pos, data)?;
                slot.size = data.len();
                self.slots.insert(id, slot);
            },
            | None => {
                let roll = match self.files.last_file() {
                    | None => true,
                    | Some(_) => self.files.size_last_file()? >= self.max_file_size,
                };
                if roll {
                    self.files.create_new_file()?;
                }
                let available = data.len().max(self.node_min_bytes);
                let mut padded = BytesMut::with_capacity(available);
                padded.put_slice(data);
                padded.put_bytes(0, available - data.len());
                let (file, pos) = self.files.append(&padded)?;
                self.slots.insert(id, Slot {
                    file,
                    pos,
                    size: data.len(),
                    available,
                });
            },
        }
        Ok(())
    }

    /// Bytes reserved but not used by any node.
    pub(crate) fn wasted_space(&self) -> usize {
        self.slots.values().map(|s| s.available - s.size).sum()
    }

    /// Rewrites every node file without slack between nodes.
    #[instrument(level = "debug", skip(self), fields(dir = %self.dir.display()))]
    pub(crate) fn compress_space(&mut self) -> Result<()> {
        if self.read_only {
            return Err(TridentError::misuse("compacting a read-only tree"));
        }
        let mut per_file: BTreeMap<u16, Vec<(usize, NodeId)>> = BTreeMap::new();
        for (id, slot) in self.slots.iter() {
            per_file.entry(slot.file).or_default().push((slot.pos, *id));
        }
        for (file, mut nodes) in per_file {
            nodes.sort_unstable();
            let mut contents = Vec::with_capacity(nodes.len());
            for (_, id) in nodes.iter() {
                contents.push((*id, self.get(*id)?.to_vec()));
            }
            let old = self.files.file_size(file)?;
            self.files.truncate(file, 0)?;
            for (id, data) in contents {
                let pos = self.files.append_to(file, &data)?;
                if let Some(slot) = self.slots.get_mut(&id) {
                    slot.pos = pos;
                    slot.available = data.len();
                }
            }
            debug!(file, old, new = self.files.file_size(file)?, "compacted node file");
        }
        Ok(())
    }
}
