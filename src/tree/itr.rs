// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::collections::VecDeque;

use crate::{
    errs::Result,
    tree::{
        node::{
            NodeId,
            TreeKey,
            TreeValue,
        },
        Tree,
    },
};

/// Walks the leaf chain of a [`Tree`], one leaf at a time.
pub struct TreeItr<'a, K, V> {
    tree: &'a Tree<K, V>,
    next_leaf: Option<NodeId>,
    skip: usize,
    buffered: VecDeque<(K, V)>,
    failed: bool,
}

impl<'a, K: TreeKey, V: TreeValue> TreeItr<'a, K, V> {
    pub(crate) fn new(tree: &'a Tree<K, V>, leaf: NodeId, skip: usize) -> Self {
        Self {
            tree,
            next_leaf: Some(leaf),
            skip,
            buffered: VecDeque::new(),
            failed: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        while self.buffered.is_empty() {
            let Some(leaf) = self.next_leaf else {
                return Ok(());
            };
            let (entries, next) = self.tree.leaf_entries(leaf, self.skip)?;
            self.skip = 0;
            self.next_leaf = next;
            self.buffered.extend(entries);
        }
        Ok(())
    }
}

impl<K: TreeKey, V: TreeValue> Iterator for TreeItr<'_, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Err(e) = self.fill() {
            self.failed = true;
            return Some(Err(e));
        }
        self.buffered.pop_front().map(Ok)
    }
}
