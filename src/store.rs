// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Storage contract between the B+ tree algorithm and a block store.
//!
//! The tree never touches blocks itself: it loads, stores and deletes whole
//! nodes through this trait and asks it for sizing policy. Storing a modified
//! node returns a (usually new) block index, which is what makes the tree
//! copy-on-write: the caller must propagate the returned pointer into the
//! parent, all the way up to the root.

use crate::device::BlockIndex;
use crate::node::{IndexNode, LeafNode};
use std::sync::Arc;

/// Current root of a tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Root {
    /// Block holding the root node.
    pub pointer: BlockIndex,

    /// Whether the root is a leaf (single-node tree) or an index.
    pub is_leaf: bool,
}

/// Block-store interface the tree operates against.
pub trait NodeStore {
    /// Current root of the tree.
    fn root(&self) -> Root;

    /// Installs a new root. May commit, depending on store policy.
    fn set_root(&mut self, pointer: BlockIndex, is_leaf: bool) -> crate::Result<()>;

    /// Loads an index node. Implementations may cache these.
    fn load_index(&self, pointer: BlockIndex) -> crate::Result<Arc<IndexNode>>;

    /// Loads a leaf node, following its continuation chain.
    fn load_leaf(&self, pointer: BlockIndex) -> crate::Result<LeafNode>;

    /// Stores an index node, returning its new location.
    fn store_index(&mut self, node: IndexNode) -> crate::Result<BlockIndex>;

    /// Stores a leaf node (and its continuation chain), returning the new
    /// head location.
    fn store_leaf(&mut self, node: LeafNode) -> crate::Result<BlockIndex>;

    /// Releases an index node that is no longer part of the tree.
    fn delete_index(&mut self, node: IndexNode) -> crate::Result<()>;

    /// Releases a leaf node and its continuation chain.
    fn delete_leaf(&mut self, node: LeafNode) -> crate::Result<()>;

    /// Whether `node` is under-filled and should try to pull elements from a
    /// sibling.
    fn index_needs_shift(&self, node: &IndexNode) -> bool;

    /// Rebalances two sibling indexes separated by `mid`. Merging always
    /// merges leftward. Returns `false` if nothing changed.
    fn index_shift(&self, left: &mut IndexNode, mid: Vec<u8>, right: &mut IndexNode) -> bool;

    /// Splits an over-full index, returning the separator and new right
    /// sibling.
    fn index_split(&self, node: &mut IndexNode) -> Option<(Vec<u8>, IndexNode)>;

    /// Whether `node` occupies less than half a block.
    fn leaf_needs_shift(&self, node: &LeafNode) -> bool;

    /// Rebalances two sibling leaves. Merging always merges leftward.
    /// Returns `false` if nothing changed.
    fn leaf_shift(&self, left: &mut LeafNode, right: &mut LeafNode) -> bool;

    /// Splits an over-full leaf, returning the new right sibling.
    fn leaf_split(&self, node: &mut LeafNode) -> Option<LeafNode>;
}
