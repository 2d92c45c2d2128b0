// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! B+ tree algorithm over an abstract [`NodeStore`].
//!
//! Insert and remove share one recursive frame: descend to the target leaf,
//! apply the change there, then unwind structural fallout upward. A child
//! reports back what happened — it split, it fell under half capacity, or it
//! merely needs re-storing — and the parent reacts: adding the new sibling
//! pointer, rebalancing the child against an adjacent sibling (merges always
//! go leftward), or just swapping in the child's new block index. Because the
//! store is copy-on-write, *any* change to a node cascades a pointer update
//! into its parent, so the whole ancestor chain is rewritten on every
//! mutation.
//!
//! Nodes carry no sibling pointers. Ranged traversal re-descends from common
//! ancestors to reach each next leaf and carries the highest key already
//! visited; a subtree whose separator is not strictly above that key was
//! already swept via the previous child and is skipped.

use crate::node::{IndexNode, LeafNode};
use crate::store::{NodeStore, Root};
use crate::{Error, Result};

#[derive(Copy, Clone, Eq, PartialEq)]
enum Action {
    Insert,
    Remove,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Done,
    LeafNeedsJoin,
    IndexNeedsJoin,
    LeafSplit,
    IndexSplit,
    LeafNeedsUpdate,
    IndexNeedsUpdate,
}

struct ModifyInfo {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    action: Action,
    found: bool,
    state: State,

    /// Separator and pointer of a freshly split-off right sibling, handed to
    /// the parent frame.
    new_key: Vec<u8>,
    new_pointer: crate::BlockIndex,
}

/// A node encountered during a whole-tree walk.
pub(crate) enum NodeRef<'a> {
    Index(&'a IndexNode),
    Leaf(&'a LeafNode),
}

/// Ordered map over fixed-width keys, generic over the backing store.
pub struct BTree<S: NodeStore> {
    store: S,
}

impl<S: NodeStore> BTree<S> {
    pub(crate) fn new(store: S) -> Self {
        Self { store }
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Installs an empty leaf as the root.
    pub(crate) fn create_new_root(&mut self) -> Result<()> {
        let pointer = self.store.store_leaf(LeafNode::new())?;
        self.store.set_root(pointer, true)
    }

    pub(crate) fn contains(&self, key: &[u8]) -> Result<bool> {
        let Root { pointer, is_leaf } = self.store.root();

        if is_leaf {
            let leaf = self.store.load_leaf(pointer)?;
            Ok(leaf_find(&leaf, key).1)
        } else {
            self.contains_in(&*self.store.load_index(pointer)?, key)
        }
    }

    fn contains_in(&self, index: &IndexNode, key: &[u8]) -> Result<bool> {
        let i = index_find(index, key);

        if index.level == 0 {
            let leaf = self.store.load_leaf(index.pointer(i))?;
            Ok(leaf_find(&leaf, key).1)
        } else {
            self.contains_in(&*self.store.load_index(index.pointer(i))?, key)
        }
    }

    pub(crate) fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Root { pointer, is_leaf } = self.store.root();

        if is_leaf {
            let leaf = self.store.load_leaf(pointer)?;
            Ok(find_in_leaf(&leaf, key))
        } else {
            self.find_in(&*self.store.load_index(pointer)?, key)
        }
    }

    fn find_in(&self, index: &IndexNode, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let i = index_find(index, key);

        if index.level == 0 {
            let leaf = self.store.load_leaf(index.pointer(i))?;
            Ok(find_in_leaf(&leaf, key))
        } else {
            self.find_in(&*self.store.load_index(index.pointer(i))?, key)
        }
    }

    /// Visits every record with `lower <= key < upper`, in key order.
    pub(crate) fn for_each<F: FnMut(&[u8], &[u8])>(
        &self,
        lower: &[u8],
        upper: &[u8],
        visitor: &mut F,
    ) -> Result<()> {
        let Root { pointer, is_leaf } = self.store.root();

        if is_leaf {
            let leaf = self.store.load_leaf(pointer)?;
            for_each_in_leaf(&leaf, lower, upper, visitor);
        } else {
            self.for_each_in(&*self.store.load_index(pointer)?, lower, upper, visitor)?;
        }

        Ok(())
    }

    /// Returns the highest key of the last leaf visited under `index`.
    fn for_each_in<F: FnMut(&[u8], &[u8])>(
        &self,
        index: &IndexNode,
        lower: &[u8],
        upper: &[u8],
        visitor: &mut F,
    ) -> Result<Vec<u8>> {
        let mut i = index_find(index, lower);

        let mut last_key = if index.level == 0 {
            let leaf = self.store.load_leaf(index.pointer(i))?;
            for_each_in_leaf(&leaf, lower, upper, visitor)
        } else {
            self.for_each_in(&*self.store.load_index(index.pointer(i))?, lower, upper, visitor)?
        };

        if last_key.as_slice() >= upper {
            return Ok(last_key);
        }

        while i < index.pointer_count() - 1 {
            i += 1;

            // This child sits right of its separator; if the separator is
            // not above last_key, the child was already swept.
            if last_key.as_slice() >= index.key_before(i) {
                continue;
            }

            last_key = if index.level == 0 {
                let leaf = self.store.load_leaf(index.pointer(i))?;
                for_each_in_leaf(&leaf, lower, upper, visitor)
            } else {
                self.for_each_in(&*self.store.load_index(index.pointer(i))?, lower, upper, visitor)?
            };

            if last_key.as_slice() >= upper {
                break;
            }
        }

        Ok(last_key)
    }

    /// Visits every record in key order.
    pub(crate) fn for_all<F: FnMut(&[u8], &[u8])>(&self, visitor: &mut F) -> Result<()> {
        let Root { pointer, is_leaf } = self.store.root();

        if is_leaf {
            let leaf = self.store.load_leaf(pointer)?;
            for_all_in_leaf(&leaf, visitor);
        } else {
            self.for_all_in(&*self.store.load_index(pointer)?, visitor)?;
        }

        Ok(())
    }

    fn for_all_in<F: FnMut(&[u8], &[u8])>(
        &self,
        index: &IndexNode,
        visitor: &mut F,
    ) -> Result<Vec<u8>> {
        let mut last_key = Vec::new();

        for i in 0..index.pointer_count() {
            if i > 0 && last_key.as_slice() >= index.key_before(i) {
                continue;
            }

            last_key = if index.level == 0 {
                let leaf = self.store.load_leaf(index.pointer(i))?;
                for_all_in_leaf(&leaf, visitor)
            } else {
                self.for_all_in(&*self.store.load_index(index.pointer(i))?, visitor)?
            };
        }

        Ok(last_key)
    }

    /// Full traversal that brackets every subtree read, so one torn block
    /// only loses the records below it.
    pub(crate) fn recover_all<F, E>(&self, visitor: &mut F, on_error: &mut E)
    where
        F: FnMut(&[u8], &[u8]),
        E: FnMut(&str, &Error),
    {
        let Root { pointer, is_leaf } = self.store.root();

        if is_leaf {
            match self.store.load_leaf(pointer) {
                Ok(leaf) => recover_in_leaf(&leaf, visitor),
                Err(e) => on_error("error loading root leaf node", &e),
            }
        } else {
            match self.store.load_index(pointer) {
                Ok(index) => self.recover_in(&index, visitor, on_error),
                Err(e) => on_error("error loading root index node", &e),
            }
        }
    }

    fn recover_in<F, E>(&self, index: &IndexNode, visitor: &mut F, on_error: &mut E)
    where
        F: FnMut(&[u8], &[u8]),
        E: FnMut(&str, &Error),
    {
        for i in 0..index.pointer_count() {
            if index.level == 0 {
                match self.store.load_leaf(index.pointer(i)) {
                    Ok(leaf) => recover_in_leaf(&leaf, visitor),
                    Err(e) => on_error("error loading leaf node", &e),
                }
            } else {
                match self.store.load_index(index.pointer(i)) {
                    Ok(child) => self.recover_in(&child, visitor, on_error),
                    Err(e) => on_error("error loading index node", &e),
                }
            }
        }
    }

    /// Visits every node. The visitor returns whether to keep descending
    /// below an index (or keep scanning leaves of the current index).
    pub(crate) fn walk_nodes<F>(&self, visitor: &mut F) -> Result<()>
    where
        F: FnMut(NodeRef) -> Result<bool>,
    {
        let Root { pointer, is_leaf } = self.store.root();

        if is_leaf {
            let leaf = self.store.load_leaf(pointer)?;
            visitor(NodeRef::Leaf(&leaf))?;
            Ok(())
        } else {
            self.walk_nodes_in(&*self.store.load_index(pointer)?, visitor)
        }
    }

    fn walk_nodes_in<F>(&self, index: &IndexNode, visitor: &mut F) -> Result<()>
    where
        F: FnMut(NodeRef) -> Result<bool>,
    {
        if !visitor(NodeRef::Index(index))? {
            return Ok(());
        }

        for i in 0..index.pointer_count() {
            if index.level != 0 {
                self.walk_nodes_in(&*self.store.load_index(index.pointer(i))?, visitor)?;
            } else {
                let leaf = self.store.load_leaf(index.pointer(i))?;
                if !visitor(NodeRef::Leaf(&leaf))? {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    pub(crate) fn record_count(&self) -> Result<u64> {
        let mut count = 0;

        self.walk_nodes(&mut |node| {
            if let NodeRef::Leaf(leaf) = node {
                count += leaf.count() as u64;
            }
            Ok(true)
        })?;

        Ok(count)
    }

    pub(crate) fn index_count(&self) -> Result<u64> {
        let mut count = 0;

        self.walk_nodes(&mut |node| match node {
            NodeRef::Index(index) => {
                count += 1;
                Ok(index.level != 0)
            }
            NodeRef::Leaf(_) => Ok(false),
        })?;

        Ok(count)
    }

    pub(crate) fn leaf_count(&self) -> Result<u64> {
        let mut count = 0;
        let root = self.store.root();

        if root.is_leaf {
            return Ok(1);
        }

        self.walk_nodes(&mut |node| match node {
            NodeRef::Index(index) => {
                if index.level == 0 {
                    count += index.pointer_count() as u64;
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
            NodeRef::Leaf(_) => Ok(false),
        })?;

        Ok(count)
    }

    /// Number of index levels above the leaves; 0 means the root is a leaf.
    pub(crate) fn index_levels(&self) -> Result<u32> {
        let Root { pointer, is_leaf } = self.store.root();

        if is_leaf {
            Ok(0)
        } else {
            Ok(u32::from(self.store.load_index(pointer)?.level) + 1)
        }
    }

    /// Returns whether an existing value was overwritten.
    pub(crate) fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<bool> {
        self.modify(key, Some(value), Action::Insert)
    }

    /// Returns whether the key existed.
    pub(crate) fn remove(&mut self, key: &[u8]) -> Result<bool> {
        self.modify(key.to_vec(), None, Action::Remove)
    }

    /// Smallest key stored under `index`, found by walking the left edge.
    fn left_key(&self, index: &IndexNode) -> Result<Vec<u8>> {
        if index.level == 0 {
            let leaf = self.store.load_leaf(index.pointer(0))?;
            Ok(leaf.key(0).to_vec())
        } else {
            self.left_key(&*self.store.load_index(index.pointer(0))?)
        }
    }

    fn modify(&mut self, key: Vec<u8>, value: Option<Vec<u8>>, action: Action) -> Result<bool> {
        let mut info = ModifyInfo {
            key,
            value,
            action,
            found: false,
            state: State::Done,
            new_key: Vec::new(),
            new_pointer: crate::NULL_BLOCK,
        };

        let root = self.store.root();
        let mut lower_leaf = None;
        let mut lower_index = None;

        if root.is_leaf {
            let mut leaf = self.store.load_leaf(root.pointer)?;
            self.modify_leaf(&mut leaf, &mut info)?;
            lower_leaf = Some(leaf);
        } else {
            let mut index = (*self.store.load_index(root.pointer)?).clone();
            self.modify_index(&mut index, &mut info)?;
            lower_index = Some(index);
        }

        if info.state == State::IndexNeedsJoin {
            let index = lower_index.take().expect("index root was modified");
            if index.pointer_count() == 1 {
                // Single-child root index collapses into its only child.
                let pointer = index.pointer(0);
                let level = index.level;
                self.store.delete_index(index)?;
                self.store.set_root(pointer, level == 0)?;
            } else {
                lower_index = Some(index);
                info.state = State::IndexNeedsUpdate;
            }
        }

        if info.state == State::LeafNeedsJoin {
            // A root leaf has no sibling to join with.
            info.state = State::LeafNeedsUpdate;
        }

        if info.state == State::LeafSplit || info.state == State::IndexSplit {
            let mut new_root = if info.state == State::IndexSplit {
                let lower = lower_index.take().expect("index split came from an index");
                let level = lower.level + 1;
                let pointer = self.store.store_index(lower)?;
                IndexNode::with_begin(pointer, level)
            } else {
                let lower = lower_leaf.take().expect("leaf split came from a leaf");
                let pointer = self.store.store_leaf(lower)?;
                IndexNode::with_begin(pointer, 0)
            };

            new_root.insert_after(0, std::mem::take(&mut info.new_key), info.new_pointer);
            let pointer = self.store.store_index(new_root)?;
            self.store.set_root(pointer, false)?;
        }

        if info.state == State::IndexNeedsUpdate {
            let pointer = self
                .store
                .store_index(lower_index.take().expect("index root was modified"))?;
            if pointer != self.store.root().pointer {
                self.store.set_root(pointer, false)?;
            }
        }

        if info.state == State::LeafNeedsUpdate {
            let pointer = self
                .store
                .store_leaf(lower_leaf.take().expect("leaf root was modified"))?;
            if pointer != self.store.root().pointer {
                self.store.set_root(pointer, true)?;
            }
        }

        Ok(info.found)
    }

    fn modify_leaf(&mut self, leaf: &mut LeafNode, info: &mut ModifyInfo) -> Result<()> {
        info.state = State::Done;

        let (i, found) = leaf_find(leaf, &info.key);
        if found {
            info.found = true;
            leaf.remove(i);
        }

        if info.action == Action::Remove && !info.found {
            return Ok(());
        }

        if info.action == Action::Insert {
            let value = info.value.take().expect("insert carries a value");
            leaf.insert(i, info.key.clone(), value);
        }

        if let Some(right) = self.store.leaf_split(leaf) {
            info.new_key = right.key(0).to_vec();
            info.new_pointer = self.store.store_leaf(right)?;
            info.state = State::LeafSplit;
        } else if self.store.leaf_needs_shift(leaf) {
            info.state = State::LeafNeedsJoin;
        } else {
            info.state = State::LeafNeedsUpdate;
        }

        Ok(())
    }

    fn modify_index(&mut self, node: &mut IndexNode, info: &mut ModifyInfo) -> Result<()> {
        let i = index_find(node, &info.key);
        let next_pointer = node.pointer(i);

        let mut lower_leaf = None;
        let mut lower_index = None;

        if node.level == 0 {
            let mut leaf = self.store.load_leaf(next_pointer)?;
            self.modify_leaf(&mut leaf, info)?;
            lower_leaf = Some(leaf);
        } else {
            let mut child = (*self.store.load_index(next_pointer)?).clone();
            self.modify_index(&mut child, info)?;
            lower_index = Some(child);
        }

        if info.state == State::Done {
            return Ok(());
        }

        let mut self_updated = false;

        // Rebalance against the right sibling, unless the child is the last.
        let (left, right) = if i != 0 && i == node.pointer_count() - 1 {
            (i - 1, i)
        } else {
            (i, i + 1)
        };

        if info.state == State::LeafNeedsJoin {
            if node.pointer_count() < 2 {
                // No sibling to join with; just store the pending change.
                info.state = State::LeafNeedsUpdate;
            } else {
                let mut left_leaf;
                let mut right_leaf;
                if left == i {
                    left_leaf = lower_leaf.take().expect("child is a leaf");
                    right_leaf = self.store.load_leaf(node.pointer(right))?;
                } else {
                    left_leaf = self.store.load_leaf(node.pointer(left))?;
                    right_leaf = lower_leaf.take().expect("child is a leaf");
                }

                if !self.store.leaf_shift(&mut left_leaf, &mut right_leaf) {
                    // Siblings untouched; restore the modified child.
                    lower_leaf = Some(if left == i { left_leaf } else { right_leaf });
                    info.state = State::LeafNeedsUpdate;
                } else if right_leaf.count() == 0 {
                    // Merged leftward; the right sibling disappears.
                    self.store.delete_leaf(right_leaf)?;

                    if left != 0 {
                        node.update_key_before(left, left_leaf.key(0).to_vec());
                    }
                    let pointer = self.store.store_leaf(left_leaf)?;
                    node.update_pointer(left, pointer);
                    node.remove_before(right);

                    self_updated = true;
                } else {
                    let pointer = self.store.store_leaf(left_leaf)?;
                    node.update_pointer(left, pointer);

                    // The right sibling's first key changed with the shift.
                    node.update_key_before(right, right_leaf.key(0).to_vec());
                    let pointer = self.store.store_leaf(right_leaf)?;
                    node.update_pointer(right, pointer);

                    self_updated = true;
                }
            }
        }

        if info.state == State::IndexNeedsJoin {
            if node.pointer_count() < 2 {
                info.state = State::IndexNeedsUpdate;
            } else {
                let mut left_index;
                let mut right_index;
                if left == i {
                    left_index = lower_index.take().expect("child is an index");
                    right_index = (*self.store.load_index(node.pointer(right))?).clone();
                } else {
                    left_index = (*self.store.load_index(node.pointer(left))?).clone();
                    right_index = lower_index.take().expect("child is an index");
                }

                let mid = self.left_key(&right_index)?;
                if !self.store.index_shift(&mut left_index, mid, &mut right_index) {
                    lower_index = Some(if left == i { left_index } else { right_index });
                    info.state = State::IndexNeedsUpdate;
                } else if right_index.pointer_count() == 0 {
                    self.store.delete_index(right_index)?;

                    if left != 0 {
                        let key = self.left_key(&left_index)?;
                        node.update_key_before(left, key);
                    }
                    let pointer = self.store.store_index(left_index)?;
                    node.update_pointer(left, pointer);
                    node.remove_before(right);

                    self_updated = true;
                } else {
                    let pointer = self.store.store_index(left_index)?;
                    node.update_pointer(left, pointer);

                    let key_for_right = self.left_key(&right_index)?;
                    let pointer = self.store.store_index(right_index)?;
                    node.update_pointer(right, pointer);
                    node.update_key_before(right, key_for_right);

                    self_updated = true;
                }
            }
        }

        if info.state == State::LeafSplit {
            let pointer = self
                .store
                .store_leaf(lower_leaf.take().expect("child is a leaf"))?;
            node.update_pointer(i, pointer);
            node.insert_after(i, std::mem::take(&mut info.new_key), info.new_pointer);
            self_updated = true;
        }

        if info.state == State::IndexSplit {
            let pointer = self
                .store
                .store_index(lower_index.take().expect("child is an index"))?;
            node.update_pointer(i, pointer);
            node.insert_after(i, std::mem::take(&mut info.new_key), info.new_pointer);
            self_updated = true;
        }

        if info.state == State::LeafNeedsUpdate {
            let pointer = self
                .store
                .store_leaf(lower_leaf.take().expect("child is a leaf"))?;
            if pointer != node.pointer(i) {
                node.update_pointer(i, pointer);
                self_updated = true;
            }
        }

        if info.state == State::IndexNeedsUpdate {
            let pointer = self
                .store
                .store_index(lower_index.take().expect("child is an index"))?;
            if pointer != node.pointer(i) {
                node.update_pointer(i, pointer);
                self_updated = true;
            }
        }

        if let Some((key, right)) = self.store.index_split(node) {
            info.new_key = key;
            info.new_pointer = self.store.store_index(right)?;
            info.state = State::IndexSplit;
        } else if self.store.index_needs_shift(node) {
            info.state = State::IndexNeedsJoin;
        } else if self_updated {
            info.state = State::IndexNeedsUpdate;
        } else {
            info.state = State::Done;
        }

        Ok(())
    }
}

/// Lower-bound position of `key` plus whether it is present.
fn leaf_find(leaf: &LeafNode, key: &[u8]) -> (usize, bool) {
    let i = leaf.elements.partition_point(|e| e.key.as_slice() < key);
    let found = leaf.elements.get(i).is_some_and(|e| e.key == key);
    (i, found)
}

/// Child index whose separator range contains `key` (upper bound over the
/// separator list).
fn index_find(index: &IndexNode, key: &[u8]) -> usize {
    index.pointers.partition_point(|e| e.key.as_slice() <= key)
}

fn find_in_leaf(leaf: &LeafNode, key: &[u8]) -> Option<Vec<u8>> {
    let (i, found) = leaf_find(leaf, key);
    found.then(|| leaf.value(i).to_vec())
}

/// Visits matching records; returns the highest key seen in this leaf.
fn for_each_in_leaf<F: FnMut(&[u8], &[u8])>(
    leaf: &LeafNode,
    lower: &[u8],
    upper: &[u8],
    visitor: &mut F,
) -> Vec<u8> {
    if leaf.count() == 0 {
        return Vec::new();
    }

    let start = leaf_find(leaf, lower).0;
    for i in start..leaf.count() {
        let key = leaf.key(i);
        if key >= lower {
            if key < upper {
                visitor(key, leaf.value(i));
            } else {
                return key.to_vec();
            }
        }
    }

    leaf.key(leaf.count() - 1).to_vec()
}

fn for_all_in_leaf<F: FnMut(&[u8], &[u8])>(leaf: &LeafNode, visitor: &mut F) -> Vec<u8> {
    if leaf.count() == 0 {
        return Vec::new();
    }

    for i in 0..leaf.count() {
        visitor(leaf.key(i), leaf.value(i));
    }

    leaf.key(leaf.count() - 1).to_vec()
}

fn recover_in_leaf<F: FnMut(&[u8], &[u8])>(leaf: &LeafNode, visitor: &mut F) {
    for i in 0..leaf.count() {
        visitor(leaf.key(i), leaf.value(i));
    }
}
