// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::collections::{
    BTreeMap,
    HashMap,
};

use bytes::{
    BufMut,
    BytesMut,
};
use tracing::trace;

use crate::{
    errs::{
        Result,
        TridentError,
    },
    tree::{
        manager::{
            NodeManager,
            TreeMeta,
        },
        node::{
            Node,
            NodeId,
            TreeKey,
            TreeValue,
        },
    },
};

const RAW: u8 = 0;
const LZ4: u8 = 1;

struct Cached<K, V> {
    node: Node<K, V>,
    modified: bool,
    tick: u64,
}

/// Decoded nodes in least-recently-used order over a [`NodeManager`]. Only
/// nodes that changed since they were loaded are written back on eviction.
pub(crate) struct Cache<K, V> {
    manager: NodeManager,
    nodes: HashMap<NodeId, Cached<K, V>>,
    lru: BTreeMap<u64, NodeId>,
    tick: u64,
    max_nodes: usize,
    compress: bool,
}

pub(crate) fn encode_node<K: TreeKey, V: TreeValue>(node: &Node<K, V>, compress: bool) -> Vec<u8> {
    let mut raw = BytesMut::new();
    node.serialize(&mut raw);
    let mut out = Vec::with_capacity(raw.len() + 1);
    if compress {
        out.put_u8(LZ4);
        out.extend_from_slice(&lz4_flex::compress_prepend_size(&raw));
    } else {
        out.put_u8(RAW);
        out.extend_from_slice(&raw);
    }
    out
}

pub(crate) fn decode_node<K: TreeKey, V: TreeValue>(data: &[u8]) -> Result<Node<K, V>> {
    match data.split_first() {
        | Some((&RAW, body)) => Node::deserialize(body),
        | Some((&LZ4, body)) => {
            let raw = lz4_flex::decompress_size_prepended(body)
                .map_err(|e| TridentError::corrupt(format!("tree node: {e}")))?;
            Node::deserialize(&raw)
        },
        | Some((tag, _)) => Err(TridentError::corrupt(format!("unknown node encoding {tag}"))),
        | None => Err(TridentError::corrupt("empty node slot")),
    }
}

impl<K: TreeKey, V: TreeValue> Cache<K, V> {
    pub(crate) fn new(manager: NodeManager, max_nodes: usize, compress: bool) -> Self {
        Self {
            manager,
            nodes: HashMap::new(),
            lru: BTreeMap::new(),
            tick: 0,
            max_nodes: max_nodes.max(4),
            compress,
        }
    }

    fn touch(&mut self, id: NodeId) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(c) = self.nodes.get_mut(&id) {
            self.lru.remove(&c.tick);
            c.tick = tick;
            self.lru.insert(tick, id);
        }
    }

    fn load(&mut self, id: NodeId) -> Result<()> {
        if self.nodes.contains_key(&id) {
            self.touch(id);
            return Ok(());
        }
        let node = decode_node(&self.manager.get(id)?)?;
        self.insert(id, node, false)
    }

    fn insert(&mut self, id: NodeId, node: Node<K, V>, modified: bool) -> Result<()> {
        self.evict()?;
        self.tick += 1;
        self.lru.insert(self.tick, id);
        self.nodes.insert(id, Cached {
            node,
            modified,
            tick: self.tick,
        });
        Ok(())
    }

    fn evict(&mut self) -> Result<()> {
        while self.nodes.len() >= self.max_nodes {
            let Some((_, id)) = self.lru.pop_first() else {
                break;
            };
            if let Some(c) = self.nodes.remove(&id) {
                if c.modified {
                    self.manager.put(id, &encode_node(&c.node, self.compress))?;
                }
                trace!(node = id, modified = c.modified, "evicted tree node");
            }
        }
        Ok(())
    }

    pub(crate) fn get(&mut self, id: NodeId) -> Result<&Node<K, V>> {
        self.load(id)?;
        self.nodes
            .get(&id)
            .map(|c| &c.node)
            .ok_or_else(|| TridentError::corrupt(format!("node {id} missing from cache")))
    }

    /// Loads `id` and flags it for write back.
    pub(crate) fn get_mut(&mut self, id: NodeId) -> Result<&mut Node<K, V>> {
        self.load(id)?;
        match self.nodes.get_mut(&id) {
            | Some(c) => {
                c.modified = true;
                Ok(&mut c.node)
            },
            | None => Err(TridentError::corrupt(format!("node {id} missing from cache"))),
        }
    }

    pub(crate) fn put_new(&mut self, id: NodeId, node: Node<K, V>) -> Result<()> {
        self.insert(id, node, true)
    }

    /// Writes back every modified node and persists `meta`.
    pub(crate) fn flush(&mut self, meta: TreeMeta) -> Result<()> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, c)| c.modified)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(c) = self.nodes.get_mut(&id) {
                self.manager.put(id, &encode_node(&c.node, self.compress))?;
                c.modified = false;
            }
        }
        self.manager.save(meta)
    }

    pub(crate) fn compress_space(&mut self, meta: TreeMeta) -> Result<()> {
        self.flush(meta)?;
        self.manager.compress_space()?;
        self.manager.save(meta)
    }

    pub(crate) fn is_stored(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id) || self.manager.contains(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::{
        config::KbConfig,
        fs::manager::FileLimits,
        tree::node::Leaf,
    };

    fn leaf(n: u64) -> Node<u64, u64> {
        Node::Leaf(Leaf {
            keys: (0..n).collect(),
            values: (0..n).map(|v| v * 2).collect(),
            next: None,
        })
    }

    #[test]
    fn test_eviction_writes_back_modified_nodes() {
        let dir = tempdir().unwrap();
        let limits = FileLimits::from(&KbConfig::for_writing());
        let (mgr, _) = NodeManager::open(dir.path(), false, 16, 1 << 20, limits).unwrap();
        let mut cache: Cache<u64, u64> = Cache::new(mgr, 4, true);
        for id in 0..10 {
            cache.put_new(id, leaf(id + 1)).unwrap();
        }
        assert!(cache.len() <= 4);
        assert_eq!(cache.get(0).unwrap(), &leaf(1));
        if let Node::Leaf(l) = cache.get_mut(1).unwrap() {
            l.keys.push(100);
            l.values.push(1);
        }
        for id in 2..10 {
            cache.get(id).unwrap();
        }
        match cache.get(1).unwrap() {
            | Node::Leaf(l) => assert_eq!(l.keys.last(), Some(&100)),
            | Node::Intermediate(_) => panic!("expected a leaf"),
        }
        assert!(cache.is_stored(9));
    }

    #[test]
    fn test_corrupt_encodings() {
        assert!(decode_node::<u64, u64>(&[]).is_err());
        assert!(decode_node::<u64, u64>(&[7, 0]).is_err());
        assert!(decode_node::<u64, u64>(&[LZ4, 1, 2, 3]).is_err());
        let enc = encode_node(&leaf(3), false);
        assert_eq!(decode_node::<u64, u64>(&enc).unwrap(), leaf(3));
    }
}
