// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::fmt::Debug;

use bytes::{
    Buf,
    BufMut,
    BytesMut,
};

use crate::{
    codec,
    errs::{
        Result,
        TridentError,
    },
    tree::coordinates::TermCoordinates,
};

pub(crate) type NodeId = u64;

const TAG_LEAF: u8 = 0;
const TAG_INTERMEDIATE: u8 = 1;

/// A key the tree can order and persist.
pub trait TreeKey: Ord + Clone + Debug + Send + Sync + 'static {
    fn encode(&self, buf: &mut BytesMut);

    fn decode(buf: &mut &[u8]) -> Result<Self>;
}

/// A value the tree can persist.
pub trait TreeValue: Clone + Debug + Send + Sync + 'static {
    fn encode(&self, buf: &mut BytesMut);

    fn decode(buf: &mut &[u8]) -> Result<Self>;
}

impl TreeKey for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        codec::put_vlong(buf, *self);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        codec::get_vlong(buf)
    }
}

impl TreeValue for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        codec::put_vlong(buf, *self);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        codec::get_vlong(buf)
    }
}

impl TreeKey for Vec<u8> {
    fn encode(&self, buf: &mut BytesMut) {
        codec::put_bytes(buf, self);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        Ok(codec::get_bytes(buf)?.to_vec())
    }
}

impl TreeValue for TermCoordinates {
    fn encode(&self, buf: &mut BytesMut) {
        TermCoordinates::encode(self, buf);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        TermCoordinates::decode(buf)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Leaf<K, V> {
    pub(crate) keys: Vec<K>,
    pub(crate) values: Vec<V>,
    pub(crate) next: Option<NodeId>,
}

/// `children[i]` holds the keys in `[keys[i-1], keys[i])`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Intermediate<K> {
    pub(crate) keys: Vec<K>,
    pub(crate) children: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node<K, V> {
    Leaf(Leaf<K, V>),
    Intermediate(Intermediate<K>),
}

impl<K: TreeKey, V: TreeValue> Leaf<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            next: None,
        }
    }

    pub(crate) fn search(&self, key: &K) -> std::result::Result<usize, usize> {
        self.keys.binary_search(key)
    }

    /// Moves the upper half into a new leaf; returns it with its first key.
    pub(crate) fn split(&mut self, right_id: NodeId) -> (K, Leaf<K, V>) {
        let mid = self.keys.len() / 2;
        let right = Leaf {
            keys: self.keys.split_off(mid),
            values: self.values.split_off(mid),
            next: self.next,
        };
        self.next = Some(right_id);
        (right.keys[0].clone(), right)
    }
}

impl<K: TreeKey> Intermediate<K> {
    pub(crate) fn child_for(&self, key: &K) -> usize {
        match self.keys.binary_search(key) {
            | Ok(i) => i + 1,
            | Err(i) => i,
        }
    }

    /// Moves the upper half into a new node and returns the separator that
    /// moves up to the parent.
    pub(crate) fn split(&mut self) -> (K, Intermediate<K>) {
        let mid = self.keys.len() / 2;
        let mut upper = self.keys.split_off(mid);
        let sep = upper.remove(0);
        let children = self.children.split_off(mid + 1);
        (sep, Intermediate {
            keys: upper,
            children,
        })
    }
}

impl<K: TreeKey, V: TreeValue> Node<K, V> {
    pub(crate) fn len(&self) -> usize {
        match self {
            | Node::Leaf(l) => l.keys.len(),
            | Node::Intermediate(n) => n.children.len(),
        }
    }

    pub(crate) fn serialize(&self, buf: &mut BytesMut) {
        match self {
            | Node::Leaf(l) => {
                buf.put_u8(TAG_LEAF);
                codec::put_vlong(buf, l.next.map_or(0, |n| n + 1));
                codec::put_vlong(buf, l.keys.len() as u64);
                for (k, v) in l.keys.iter().zip(l.values.iter()) {
                    k.encode(buf);
                    v.encode(buf);
                }
            },
            | Node::Intermediate(n) => {
                buf.put_u8(TAG_INTERMEDIATE);
                codec::put_vlong(buf, n.keys.len() as u64);
                for k in n.keys.iter() {
                    k.encode(buf);
                }
                for c in n.children.iter() {
                    codec::put_vlong(buf, *c);
                }
            },
        }
    }

    pub(crate) fn deserialize(mut buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(TridentError::corrupt("empty tree node"));
        }
        match buf.get_u8() {
            | TAG_LEAF => {
                let next = codec::get_vlong(&mut buf)?;
                let n = codec::get_vlong(&mut buf)? as usize;
                let mut keys = Vec::with_capacity(n);
                let mut values = Vec::with_capacity(n);
                for _ in 0..n {
                    keys.push(K::decode(&mut buf)?);
                    values.push(V::decode(&mut buf)?);
                }
                Ok(Node::Leaf(Leaf {
                    keys,
                    values,
                    next: next.checked_sub(1),
                }))
            },
            | TAG_INTERMEDIATE => {
                let n = codec::get_vlong(&mut buf)? as usize;
                let mut keys = Vec::with_capacity(n);
                for _ in 0..n {
                    keys.push(K::decode(&mut buf)?);
                }
                let mut children = Vec::with_capacity(n + 1);
                for _ in 0..=n {
                    children.push(codec::get_vlong(&mut buf)?);
                }
                Ok(Node::Intermediate(Intermediate { keys, children }))
            },
            | tag => Err(TridentError::corrupt(format!("unknown tree node tag {tag}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_split_links_siblings() {
        let mut leaf: Leaf<u64, u64> = Leaf::new();
        for i in 0..10u64 {
            leaf.keys.push(i);
            leaf.values.push(i * 10);
        }
        leaf.next = Some(99);
        let (sep, right) = leaf.split(5);
        assert_eq!(sep, 5);
        assert_eq!(leaf.keys.len(), 5);
        assert_eq!(leaf.next, Some(5));
        assert_eq!(right.next, Some(99));
        assert_eq!(right.values[0], 50);
    }

    #[test]
    fn test_intermediate_split_and_routing() {
        let mut n = Intermediate {
            keys: vec![10u64, 20, 30, 40],
            children: vec![0, 1, 2, 3, 4],
        };
        assert_eq!(n.child_for(&5), 0);
        assert_eq!(n.child_for(&20), 2);
        assert_eq!(n.child_for(&45), 4);
        let (sep, right) = n.split();
        assert_eq!(sep, 30);
        assert_eq!(n.keys, vec![10, 20]);
        assert_eq!(n.children, vec![0, 1, 2]);
        assert_eq!(right.keys, vec![40]);
        assert_eq!(right.children, vec![3, 4]);
    }

    #[test]
    fn test_node_serialization() {
        let node: Node<Vec<u8>, u64> = Node::Leaf(Leaf {
            keys: vec![b"alpha".to_vec(), b"beta".to_vec()],
            values: vec![1, 2],
            next: Some(0),
        });
        let mut buf = BytesMut::new();
        node.serialize(&mut buf);
        assert_eq!(Node::<Vec<u8>, u64>::deserialize(&buf).unwrap(), node);

        let node: Node<u64, u64> = Node::Intermediate(Intermediate {
            keys: vec![7],
            children: vec![1, 2],
        });
        let mut buf = BytesMut::new();
        node.serialize(&mut buf);
        assert_eq!(Node::<u64, u64>::deserialize(&buf).unwrap(), node);
        assert!(Node::<u64, u64>::deserialize(&[9]).is_err());
    }
}
