// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Disk-backed B+ trees.
//!
//! One tree maps term ids to their [`TermCoordinates`]; the dictionary uses
//! two more, text to id and id to string buffer position. Nodes are paged
//! through an LRU [`cache::Cache`] onto a [`manager::NodeManager`].

pub(crate) mod cache;
pub mod coordinates;
mod itr;
pub(crate) mod manager;
pub(crate) mod node;
pub mod stringbuffer;

use std::path::Path;

use parking_lot::Mutex;
use tracing::{
    debug,
    instrument,
};

pub use self::{
    coordinates::{
        Coordinate,
        TermCoordinates,
    },
    itr::TreeItr,
    node::{
        TreeKey,
        TreeValue,
    },
    stringbuffer::StringBuffer,
};
use crate::{
    config::KbConfig,
    errs::{
        Result,
        TridentError,
    },
    fs::manager::FileLimits,
    tree::{
        cache::Cache,
        manager::{
            NodeManager,
            TreeMeta,
        },
        node::{
            Intermediate,
            Leaf,
            Node,
            NodeId,
        },
    },
};

/// What to do when an inserted key is already present.
#[derive(Clone, Copy, PartialEq, Eq)]
enum OnExisting {
    Replace,
    Keep,
}

struct Split<K> {
    sep: K,
    right: NodeId,
}

struct TreeInner<K, V> {
    cache: Cache<K, V>,
    meta: TreeMeta,
    max_elements: usize,
    read_only: bool,
}

/// A B+ tree whose leaves are chained left to right.
pub struct Tree<K, V> {
    inner: Mutex<TreeInner<K, V>>,
}

impl<K: TreeKey, V: TreeValue> Tree<K, V> {
    #[instrument(level = "debug", skip(cfg))]
    pub fn open(dir: &Path, cfg: &KbConfig) -> Result<Self> {
        let (manager, meta) = NodeManager::open(
            dir,
            cfg.read_only(),
            cfg.tree_node_min_bytes(),
            cfg.tree_max_file_size(),
            FileLimits::from(cfg),
        )?;
        let mut cache = Cache::new(manager, cfg.tree_cache_max_nodes(), cfg.tree_compress_nodes());
        let meta = match meta {
            | Some(m) => m,
            | None if cfg.read_only() => {
                return Err(TridentError::corrupt(format!(
                    "no tree stored in {}",
                    dir.display()
                )));
            },
            | None => {
                cache.put_new(0, Node::Leaf(Leaf::new()))?;
                TreeMeta {
                    root: 0,
                    next_id: 1,
                    n_elements: 0,
                }
            },
        };
        debug!(dir = %dir.display(), elements = meta.n_elements, "opened tree");
        Ok(Self {
            inner: Mutex::new(TreeInner {
                cache,
                meta,
                max_elements: cfg.tree_max_elements_node().max(3),
                read_only: cfg.read_only(),
            }),
        })
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().meta.n_elements
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let mut inner = self.inner.lock();
        let leaf = inner.find_leaf(key)?;
        match inner.cache.get(leaf)? {
            | Node::Leaf(l) => Ok(l.search(key).ok().map(|i| l.values[i].clone())),
            | Node::Intermediate(_) => Err(TridentError::corrupt("leaf lookup ended on an inner node")),
        }
    }

    /// Inserts or replaces; returns the previous value.
    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        let mut inner = self.inner.lock();
        inner.insert(key, value, OnExisting::Replace)
    }

    /// Inserts `value` unless `key` is present. Returns whether it was
    /// inserted together with the value now stored under `key`.
    pub fn insert_if_not_exists(&self, key: K, value: V) -> Result<(bool, V)> {
        let mut inner = self.inner.lock();
        match inner.insert(key, value.clone(), OnExisting::Keep)? {
            | Some(existing) => Ok((false, existing)),
            | None => Ok((true, value)),
        }
    }

    /// Inserts a key larger than every stored key.
    pub fn append(&self, key: K, value: V) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(largest) = inner.edge_key(false)? {
            if key <= largest {
                return Err(TridentError::misuse(format!(
                    "append of {key:?} not after {largest:?}"
                )));
            }
        }
        inner.insert(key, value, OnExisting::Replace)?;
        Ok(())
    }

    pub fn smallest_key(&self) -> Result<Option<K>> {
        self.inner.lock().edge_key(true)
    }

    pub fn largest_key(&self) -> Result<Option<K>> {
        self.inner.lock().edge_key(false)
    }

    /// Entries in key order, starting from the first key `>= from`.
    pub fn iter_from(&self, from: Option<&K>) -> Result<TreeItr<'_, K, V>> {
        let mut inner = self.inner.lock();
        let (leaf, idx) = match from {
            | Some(k) => {
                let leaf = inner.find_leaf(k)?;
                match inner.cache.get(leaf)? {
                    | Node::Leaf(l) => (leaf, l.search(k).unwrap_or_else(|i| i)),
                    | Node::Intermediate(_) => {
                        return Err(TridentError::corrupt("leaf lookup ended on an inner node"));
                    },
                }
            },
            | None => (inner.edge_leaf(true)?, 0),
        };
        Ok(TreeItr::new(self, leaf, idx))
    }

    pub fn iter(&self) -> Result<TreeItr<'_, K, V>> {
        self.iter_from(None)
    }

    /// Copies the entries of leaf `id` from `idx` on; returns them and the
    /// next leaf.
    pub(crate) fn leaf_entries(&self, id: NodeId, idx: usize) -> Result<(Vec<(K, V)>, Option<NodeId>)> {
        let mut inner = self.inner.lock();
        match inner.cache.get(id)? {
            | Node::Leaf(l) => {
                let out = l
                    .keys
                    .iter()
                    .zip(l.values.iter())
                    .skip(idx)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Ok((out, l.next))
            },
            | Node::Intermediate(_) => Err(TridentError::corrupt(format!("node {id} is not a leaf"))),
        }
    }

    /// Writes every modified node and the root pointer to disk.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.read_only {
            return Ok(());
        }
        let meta = inner.meta;
        inner.cache.flush(meta)
    }

    /// Flushes, then rewrites the node files without slack.
    pub fn compress_space(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.read_only {
            return Err(TridentError::misuse("compacting a read-only tree"));
        }
        let meta = inner.meta;
        inner.cache.compress_space(meta)
    }
}

impl<K: TreeKey, V: TreeValue> TreeInner<K, V> {
    fn find_leaf(&mut self, key: &K) -> Result<NodeId> {
        let mut id = self.meta.root;
        loop {
            match self.cache.get(id)? {
                | Node::Leaf(_) => return Ok(id),
                | Node::Intermediate(n) => id = n.children[n.child_for(key)],
            }
        }
    }

    fn edge_leaf(&mut self, smallest: bool) -> Result<NodeId> {
        let mut id = self.meta.root;
        loop {
            match self.cache.get(id)? {
                | Node::Leaf(_) => return Ok(id),
                | Node::Intermediate(n) => {
                    id = if smallest {
                        n.children[0]
                    } else {
                        n.children[n.children.len() - 1]
                    }
                },
            }
        }
    }

    fn edge_key(&mut self, smallest: bool) -> Result<Option<K>> {
        let leaf = self.edge_leaf(smallest)?;
        match self.cache.get(leaf)? {
            | Node::Leaf(l) if smallest => Ok(l.keys.first().cloned()),
            | Node::Leaf(l) => Ok(l.keys.last().cloned()),
            | Node::Intermediate(_) => Err(TridentError::corrupt("edge lookup ended on an inner node")),
        }
    }

    fn alloc(&mut self) -> NodeId {
        let id = self.meta.next_id;
        self.meta.next_id += 1;
        id
    }

    fn insert(&mut self, key: K, value: V, mode: OnExisting) -> Result<Option<V>> {
        if self.read_only {
            return Err(TridentError::misuse("insert into a read-only tree"));
        }
        let root = self.meta.root;
        let (old, split) = self.insert_into(root, key, value, mode)?;
        if let Some(split) = split {
            let new_root = self.alloc();
            self.cache.put_new(
                new_root,
                Node::Intermediate(Intermediate {
                    keys: vec![split.sep],
                    children: vec![root, split.right],
                }),
            )?;
            self.meta.root = new_root;
            debug!(root = new_root, "tree grew a level");
        }
        if old.is_none() {
            self.meta.n_elements += 1;
        }
        Ok(old)
    }

    fn insert_into(
        &mut self,
        id: NodeId,
        key: K,
        value: V,
        mode: OnExisting,
    ) -> Result<(Option<V>, Option<Split<K>>)> {
        let child = match self.cache.get(id)? {
            | Node::Intermediate(n) => Some(n.children[n.child_for(&key)]),
            | Node::Leaf(_) => None,
        };
        let Some(child) = child else {
            return self.insert_into_leaf(id, key, value, mode);
        };
        let (old, split) = self.insert_into(child, key, value, mode)?;
        let Some(split) = split else {
            return Ok((old, None));
        };
        let max = self.max_elements;
        let upper = match self.cache.get_mut(id)? {
            | Node::Intermediate(n) => {
                let at = n.child_for(&split.sep);
                n.keys.insert(at, split.sep);
                n.children.insert(at + 1, split.right);
                (n.children.len() > max).then(|| n.split())
            },
            | Node::Leaf(_) => return Err(TridentError::corrupt(format!("node {id} changed kind"))),
        };
        match upper {
            | Some((sep, right)) => {
                let right_id = self.alloc();
                self.cache.put_new(right_id, Node::Intermediate(right))?;
                Ok((old, Some(Split { sep, right: right_id })))
            },
            | None => Ok((old, None)),
        }
    }

    fn insert_into_leaf(
        &mut self,
        id: NodeId,
        key: K,
        value: V,
        mode: OnExisting,
    ) -> Result<(Option<V>, Option<Split<K>>)> {
        let right_id = self.meta.next_id;
        let max = self.max_elements;
        let (old, split) = match self.cache.get_mut(id)? {
            | Node::Leaf(l) => match l.search(&key) {
                | Ok(i) => {
                    let old = l.values[i].clone();
                    if mode == OnExisting::Replace {
                        l.values[i] = value;
                    }
                    (Some(old), None)
                },
                | Err(i) => {
                    l.keys.insert(i, key);
                    l.values.insert(i, value);
                    (None, (l.keys.len() > max).then(|| l.split(right_id)))
                },
            },
            | Node::Intermediate(_) => return Err(TridentError::corrupt(format!("node {id} changed kind"))),
        };
        match split {
            | Some((sep, right)) => {
                let right_id = self.alloc();
                self.cache.put_new(right_id, Node::Leaf(right))?;
                Ok((old, Some(Split { sep, right: right_id })))
            },
            | None => Ok((old, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{
        rngs::SmallRng,
        seq::SliceRandom,
        SeedableRng,
    };
    use tempfile::tempdir;

    use super::*;

    fn cfg() -> KbConfig {
        let mut cfg = KbConfig::for_writing();
        cfg.set_tree_max_elements_node(4)
            .set_tree_cache_max_nodes(8)
            .set_tree_node_min_bytes(16);
        cfg
    }

    #[test]
    fn test_random_inserts_then_reopen() {
        let dir = tempdir().unwrap();
        let mut keys: Vec<u64> = (0..500).collect();
        keys.shuffle(&mut SmallRng::seed_from_u64(7));
        {
            let tree: Tree<u64, u64> = Tree::open(dir.path(), &cfg()).unwrap();
            for k in keys.iter() {
                assert_eq!(tree.put(*k, k * 3).unwrap(), None);
            }
            assert_eq!(tree.put(10, 11).unwrap(), Some(30));
            assert_eq!(tree.len(), 500);
            tree.flush().unwrap();
        }
        let mut ro = cfg();
        ro.set_read_only(true);
        let tree: Tree<u64, u64> = Tree::open(dir.path(), &ro).unwrap();
        assert_eq!(tree.get(&10).unwrap(), Some(11));
        assert_eq!(tree.get(&499).unwrap(), Some(1497));
        assert_eq!(tree.get(&500).unwrap(), None);
        assert_eq!(tree.smallest_key().unwrap(), Some(0));
        assert_eq!(tree.largest_key().unwrap(), Some(499));
        let all: Vec<u64> = tree.iter().unwrap().map(|r| r.unwrap().0).collect();
        assert_eq!(all, (0..500).collect::<Vec<_>>());
        let tail: Vec<u64> = tree
            .iter_from(Some(&495))
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(tail, vec![495, 496, 497, 498, 499]);
        assert!(tree.put(1000, 1).unwrap_err().is_misuse());
    }

    #[test]
    fn test_insert_if_not_exists_and_append() {
        let dir = tempdir().unwrap();
        let tree: Tree<Vec<u8>, u64> = Tree::open(dir.path(), &cfg()).unwrap();
        assert_eq!(tree.insert_if_not_exists(b"b".to_vec(), 1).unwrap(), (true, 1));
        assert_eq!(tree.insert_if_not_exists(b"b".to_vec(), 2).unwrap(), (false, 1));
        tree.append(b"c".to_vec(), 3).unwrap();
        assert!(tree.append(b"a".to_vec(), 4).unwrap_err().is_misuse());
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_compress_space_keeps_content() {
        let dir = tempdir().unwrap();
        let tree: Tree<u64, u64> = Tree::open(dir.path(), &cfg()).unwrap();
        for k in 0..200u64 {
            tree.put(k, k).unwrap();
        }
        tree.compress_space().unwrap();
        for k in (0..200u64).step_by(17) {
            assert_eq!(tree.get(&k).unwrap(), Some(k));
        }
    }
}
