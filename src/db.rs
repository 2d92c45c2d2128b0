// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Database façade: configuration, transactions and the block store.
//!
//! [`Inner`] implements [`NodeStore`] over the block device, the free-space
//! index and the node codec; [`BTree`] supplies the ordered-map algorithm on
//! top. [`Database`] wraps the whole thing in a readers-writer lock: lookups
//! and scans share the read side, mutations and transaction control take the
//! write side.

use crate::codec::NodeCodec;
use crate::device::{
    BlockDevice, BlockIndex, HeaderInfo, CONTENT_IDENTIFIER_SIZE, HEADER_SIZE, NULL_BLOCK,
};
use crate::free_list::FreeSpaceIndex;
use crate::node::{IndexNode, LeafNode};
use crate::store::{NodeStore, Root};
use crate::tree::{BTree, NodeRef};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Database configuration, applied when opening.
///
/// Opening an existing file adopts the block size and key size recorded in
/// its header; the configured values only apply to newly created files.
///
/// # Examples
///
/// ```
/// # use btree_db::Config;
/// # let dir = tempfile::tempdir()?;
/// let db = Config::new(dir.path().join("world.db"))
///     .content_identifier("World4")
///     .key_size(8)
///     .open()?;
///
/// db.insert(&5u64.to_be_bytes(), b"hello")?;
/// assert_eq!(Some(b"hello".to_vec()), db.find(&5u64.to_be_bytes())?);
/// # Ok::<(), btree_db::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    path: PathBuf,
    block_size: u32,
    key_size: u32,
    content_identifier: String,
    index_cache_size: usize,
    flatten_threshold: f32,
    auto_commit: bool,
}

impl Config {
    /// Initializes a configuration for the database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            block_size: 2_048,
            key_size: 0,
            content_identifier: String::new(),
            index_cache_size: 64,
            flatten_threshold: 0.05,
            auto_commit: true,
        }
    }

    /// Sets the block size for newly created files.
    ///
    /// Default = 2048 bytes
    #[must_use]
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets the fixed key length for newly created files. Required when
    /// creating.
    #[must_use]
    pub fn key_size(mut self, key_size: u32) -> Self {
        self.key_size = key_size;
        self
    }

    /// Sets the content identifier stamped into newly created files.
    /// Required when creating; at most 12 bytes.
    #[must_use]
    pub fn content_identifier<S: Into<String>>(mut self, id: S) -> Self {
        self.content_identifier = id.into();
        self
    }

    /// Sets the index-node cache capacity, in nodes.
    ///
    /// Default = 64
    #[must_use]
    pub fn index_cache_size(mut self, nodes: usize) -> Self {
        self.index_cache_size = nodes;
        self
    }

    /// Sets the free-space fraction above which closing the database
    /// compacts the file.
    ///
    /// Default = 0.05
    #[must_use]
    pub fn flatten_threshold(mut self, threshold: f32) -> Self {
        self.flatten_threshold = threshold;
        self
    }

    /// Sets whether every mutation commits on its own. When disabled,
    /// writes accumulate until [`Database::commit`].
    ///
    /// Default = `true`
    #[must_use]
    pub fn auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    /// Opens the database, creating the file if it does not exist yet.
    pub fn open(self) -> Result<Database> {
        let (file, len) = BlockDevice::open(&self.path)?;

        let tree = if len > 0 {
            let (mut device, header) = BlockDevice::load(file)?;
            let descriptor = device.read_root()?;

            // Drop any torn tail past the committed extent.
            device.resize(descriptor.device_size)?;

            log::debug!(
                "opened database '{}' (block size {}, key size {}, {} blocks)",
                header.content_identifier,
                header.block_size,
                header.key_size,
                device.block_count(),
            );

            let codec = NodeCodec::new(header.block_size, header.key_size, self.index_cache_size);

            BTree::new(Inner {
                device,
                free: FreeSpaceIndex::new(descriptor.free_head),
                codec,
                root: descriptor.root,
                root_is_leaf: descriptor.root_is_leaf,
                key_size: header.key_size,
                content_identifier: header.content_identifier,
                auto_commit: self.auto_commit,
                flatten_threshold: self.flatten_threshold,
                open: true,
            })
        } else {
            if self.content_identifier.is_empty() {
                return Err(Error::InvalidState(
                    "creating a database requires a content identifier",
                ));
            }
            if self.content_identifier.len() > CONTENT_IDENTIFIER_SIZE {
                return Err(Error::InvalidArgument(format!(
                    "content identifier {:?} exceeds {CONTENT_IDENTIFIER_SIZE} bytes",
                    self.content_identifier,
                )));
            }
            if self.key_size == 0 {
                return Err(Error::InvalidState("creating a database requires a key size"));
            }
            if self.block_size < 64 {
                return Err(Error::InvalidArgument(format!(
                    "block size {} is too small",
                    self.block_size,
                )));
            }

            log::debug!(
                "creating database '{}' (block size {}, key size {})",
                self.content_identifier,
                self.block_size,
                self.key_size,
            );

            let device = BlockDevice::create(
                file,
                &HeaderInfo {
                    block_size: self.block_size,
                    content_identifier: self.content_identifier.clone(),
                    key_size: self.key_size,
                },
            )?;

            let codec = NodeCodec::new(self.block_size, self.key_size, self.index_cache_size);

            let mut tree = BTree::new(Inner {
                device,
                free: FreeSpaceIndex::new(NULL_BLOCK),
                codec,
                root: NULL_BLOCK,
                root_is_leaf: false,
                key_size: self.key_size,
                content_identifier: self.content_identifier,
                auto_commit: self.auto_commit,
                flatten_threshold: self.flatten_threshold,
                open: true,
            });

            tree.create_new_root()?;
            tree.store_mut().do_commit()?;
            tree
        };

        Ok(Database {
            tree: RwLock::new(tree),
        })
    }
}

/// Block store backing one database: device + free list + codec + root.
pub(crate) struct Inner {
    device: BlockDevice,
    free: FreeSpaceIndex,
    codec: NodeCodec,

    root: BlockIndex,
    root_is_leaf: bool,

    key_size: u32,
    content_identifier: String,
    auto_commit: bool,
    flatten_threshold: f32,
    open: bool,
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::InvalidState("database is closed"))
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() == self.key_size as usize {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "wrong key size {} (expected {})",
                key.len(),
                self.key_size,
            )))
        }
    }

    pub(crate) fn do_commit(&mut self) -> Result<()> {
        if self.free.available_is_empty() && self.free.uncommitted_is_empty() {
            return Ok(());
        }

        self.free.commit(&mut self.device)?;
        self.device.flush_writes()?;
        self.device
            .write_root(self.free.head(), self.root, self.root_is_leaf)?;
        self.free.clear_uncommitted();

        Ok(())
    }

    fn do_rollback(&mut self) -> Result<()> {
        self.codec.cache_clear();
        self.device.discard_writes();

        let descriptor = self.device.read_root()?;
        self.free.reset(descriptor.free_head);
        self.root = descriptor.root;
        self.root_is_leaf = descriptor.root_is_leaf;

        self.device.resize(descriptor.device_size)
    }

    /// Compacts the file if enough of it is free space. Returns whether a
    /// compaction ran; a run also commits.
    fn try_flatten(&mut self) -> Result<bool> {
        if self.free.head() == NULL_BLOCK || self.root_is_leaf {
            return Ok(false);
        }

        let free_blocks = self.free.chain_free_count(&self.device)?;
        let expected_blocks = u64::from(self.device.block_count());
        let free_fraction = free_blocks as f32 / expected_blocks as f32;

        if free_fraction < self.flatten_threshold {
            return Ok(false);
        }

        log::info!(
            "database '{}' is {:.2}% free space, flattening",
            self.content_identifier,
            free_fraction * 100.0,
        );
        let start = std::time::Instant::now();

        // Every freed block becomes allocatable, smallest index first; the
        // visitor then re-stores any node sitting above a free slot.
        self.free.gather_chain(&self.device)?;

        let mut count: u32 = 1; // root index included
        let mut root = (*self.load_index(self.root)?).clone();
        if self.flatten_visitor(&mut root, &mut count)? {
            // Free-then-store (rather than plain re-store) forces a move to
            // the smallest open slot even for blocks born in this
            // transaction.
            self.codec.cache_remove(root.self_ptr);
            self.free.free(&mut self.device, root.self_ptr);
            root.self_ptr = NULL_BLOCK;
            self.root = self.store_index(root)?;
        }

        self.free.clear_available();
        self.device
            .resize(HEADER_SIZE + u64::from(self.device.block_size()) * u64::from(count))?;

        self.codec.cache_clear();
        self.device.flush_writes()?;
        self.device
            .write_root(self.free.head(), self.root, self.root_is_leaf)?;
        self.free.clear_uncommitted();

        let post_free_fraction =
            self.free.chain_free_count(&self.device)? as f32 / count.max(1) as f32;

        log::info!(
            "finished flattening '{}' ({:.2}% free) in {:.2}ms",
            self.content_identifier,
            post_free_fraction * 100.0,
            start.elapsed().as_secs_f64() * 1_000.0,
        );

        Ok(true)
    }

    /// Re-stores every node under `index` whose block sits above the
    /// smallest free slot. Returns whether `index` itself must be re-stored.
    fn flatten_visitor(&mut self, index: &mut IndexNode, count: &mut u32) -> Result<bool> {
        let pointer_count = index.pointer_count();
        *count += pointer_count as u32;
        let mut can_store = !self.free.available_is_empty();

        let mut needs_store = false;

        if index.level == 0 {
            for i in 0..pointer_count {
                let pointer = index.pointer(i);
                let mut tail = self.codec.leaf_tail_blocks(&self.device, pointer)?;

                if can_store {
                    let smallest = self.free.smallest_available().expect("can_store implies one");

                    let mut leaf_needs_store = smallest < pointer;
                    if !leaf_needs_store {
                        leaf_needs_store = tail.iter().any(|block| smallest < *block);
                    }

                    if leaf_needs_store {
                        let mut leaf = self.load_leaf(pointer)?;
                        for block in &tail {
                            self.free.free(&mut self.device, *block);
                        }
                        self.free.free(&mut self.device, pointer);
                        leaf.self_ptr = NULL_BLOCK;

                        let new_pointer = self.store_leaf(leaf)?;
                        index.update_pointer(i, new_pointer);
                        tail = self.codec.leaf_tail_blocks(&self.device, new_pointer)?;
                        needs_store = true;
                    }
                    can_store = !self.free.available_is_empty();
                }

                *count += tail.len() as u32;
            }
        } else {
            for i in 0..pointer_count {
                let mut child = (*self.load_index(index.pointer(i))?).clone();
                if can_store && self.flatten_visitor(&mut child, count)? {
                    self.codec.cache_remove(child.self_ptr);
                    self.free.free(&mut self.device, child.self_ptr);
                    child.self_ptr = NULL_BLOCK;

                    let new_pointer = self.store_index(child)?;
                    index.update_pointer(i, new_pointer);
                    can_store = !self.free.available_is_empty();
                    needs_store = true;
                }
            }
        }

        Ok(needs_store
            || (can_store
                && self.free.smallest_available().expect("can_store implies one") < index.self_ptr))
    }

    fn leaf_tail_len(&self, head: BlockIndex) -> Result<usize> {
        Ok(self.codec.leaf_tail_blocks(&self.device, head)?.len())
    }
}

impl NodeStore for Inner {
    fn root(&self) -> Root {
        Root {
            pointer: self.root,
            is_leaf: self.root_is_leaf,
        }
    }

    fn set_root(&mut self, pointer: BlockIndex, is_leaf: bool) -> Result<()> {
        self.root = pointer;
        self.root_is_leaf = is_leaf;

        if self.auto_commit {
            self.do_commit()?;
        }

        Ok(())
    }

    fn load_index(&self, pointer: BlockIndex) -> Result<Arc<IndexNode>> {
        self.codec.load_index(&self.device, pointer)
    }

    fn load_leaf(&self, pointer: BlockIndex) -> Result<LeafNode> {
        self.codec.load_leaf(&self.device, pointer)
    }

    fn store_index(&mut self, mut node: IndexNode) -> Result<BlockIndex> {
        // Copy-on-write: a committed node moves to a fresh block, releasing
        // its old one. Only blocks born in this transaction are reused in
        // place.
        if node.self_ptr != NULL_BLOCK && !self.free.is_uncommitted(node.self_ptr) {
            self.codec.cache_remove(node.self_ptr);
            self.free.free(&mut self.device, node.self_ptr);
            node.self_ptr = NULL_BLOCK;
        }

        if node.self_ptr == NULL_BLOCK {
            node.self_ptr = self.free.reserve(&mut self.device)?;
        }

        self.codec.write_index(&mut self.device, &node)?;

        let pointer = node.self_ptr;
        self.codec.cache_insert(pointer, Arc::new(node));
        Ok(pointer)
    }

    fn store_leaf(&mut self, mut node: LeafNode) -> Result<BlockIndex> {
        if node.self_ptr != NULL_BLOCK {
            // The chain is rewritten wholesale; continuation blocks always
            // come back to the pool.
            for block in self.codec.leaf_tail_blocks(&self.device, node.self_ptr)? {
                self.free.free(&mut self.device, block);
            }

            if !self.free.is_uncommitted(node.self_ptr) {
                self.free.free(&mut self.device, node.self_ptr);
                node.self_ptr = NULL_BLOCK;
            }
        }

        if node.self_ptr == NULL_BLOCK {
            node.self_ptr = self.free.reserve(&mut self.device)?;
        }

        self.codec
            .write_leaf(&mut self.device, &mut self.free, &node)?;
        Ok(node.self_ptr)
    }

    fn delete_index(&mut self, node: IndexNode) -> Result<()> {
        self.codec.cache_remove(node.self_ptr);
        self.free.free(&mut self.device, node.self_ptr);
        Ok(())
    }

    fn delete_leaf(&mut self, node: LeafNode) -> Result<()> {
        for block in self.codec.leaf_tail_blocks(&self.device, node.self_ptr)? {
            self.free.free(&mut self.device, block);
        }
        self.free.free(&mut self.device, node.self_ptr);
        Ok(())
    }

    fn index_needs_shift(&self, node: &IndexNode) -> bool {
        node.pointer_count() < (self.codec.max_index_pointers() + 1) / 2
    }

    fn index_shift(&self, left: &mut IndexNode, mid: Vec<u8>, right: &mut IndexNode) -> bool {
        if left.pointer_count() + right.pointer_count() <= self.codec.max_index_pointers() {
            let count = right.pointer_count();
            left.shift_left(mid, right, count);
            true
        } else if self.index_needs_shift(right) {
            right.shift_right(mid, left, 1);
            true
        } else if self.index_needs_shift(left) {
            left.shift_left(mid, right, 1);
            true
        } else {
            false
        }
    }

    fn index_split(&self, node: &mut IndexNode) -> Option<(Vec<u8>, IndexNode)> {
        if node.pointer_count() <= self.codec.max_index_pointers() {
            return None;
        }

        Some(node.split_off((node.pointer_count() + 1) / 2))
    }

    fn leaf_needs_shift(&self, node: &LeafNode) -> bool {
        self.codec.leaf_size(node) < self.device.block_size() as usize / 2
    }

    fn leaf_shift(&self, left: &mut LeafNode, right: &mut LeafNode) -> bool {
        if left.count() == 0 {
            let count = right.count();
            left.shift_left(right, count);
            return true;
        }
        if right.count() == 0 {
            return true;
        }

        let block_size = self.device.block_size() as usize;
        let left_size = self.codec.leaf_size(left);
        let right_size = self.codec.leaf_size(right);

        if left_size + right_size < block_size {
            let count = right.count();
            left.shift_left(right, count);
            return true;
        }

        // Could shift more than one element here; one at a time is enough to
        // leave both siblings above half capacity.
        let key_size = self.key_size as usize;
        let right_first = key_size + self.codec.value_size(right.value(0));
        let left_last = key_size + self.codec.value_size(left.value(left.count() - 1));

        if left_size < right_size - right_first && left_size + right_first < block_size {
            left.shift_left(right, 1);
            true
        } else if right_size < left_size - left_last && right_size + left_last < block_size {
            right.shift_right(left, 1);
            true
        } else {
            false
        }
    }

    fn leaf_split(&self, node: &mut LeafNode) -> Option<LeafNode> {
        if node.count() < 2 {
            return None;
        }

        let block_size = self.device.block_size() as usize;
        let key_size = self.key_size as usize;

        let mut size = 6;
        let mut boundary = 0;
        let mut boundary_found = false;

        for (i, element) in node.elements.iter().enumerate() {
            size += key_size + self.codec.value_size(&element.value);
            if size > block_size - 4 && !boundary_found {
                boundary = i;
                boundary_found = true;
            }
        }
        if boundary == 0 {
            boundary = 1;
        }

        // Split eagerly once the chain would exceed two blocks' worth.
        if size < block_size * 2 - 2 * 4 - 4 {
            None
        } else {
            Some(node.split_off(boundary))
        }
    }
}

/// Persistent ordered map over fixed-width keys, backed by a copy-on-write
/// B+ tree on a single file.
///
/// One writer and any number of readers may use the database concurrently;
/// the commit point is a single selector-byte write, so readers (and crash
/// recovery) always observe a complete snapshot.
pub struct Database {
    tree: RwLock<BTree<Inner>>,
}

impl Database {
    fn read_tree(&self) -> RwLockReadGuard<'_, BTree<Inner>> {
        self.tree.read().expect("lock is poisoned")
    }

    fn write_tree(&self) -> RwLockWriteGuard<'_, BTree<Inner>> {
        self.tree.write().expect("lock is poisoned")
    }

    /// Returns whether the database holds the given key.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        let tree = self.read_tree();
        tree.store().check_open()?;
        tree.store().check_key(key)?;
        tree.contains(key)
    }

    /// Returns the value stored for the given key.
    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tree = self.read_tree();
        tree.store().check_open()?;
        tree.store().check_key(key)?;
        tree.find(key)
    }

    /// Returns all records with `lower <= key < upper`, in key order.
    pub fn range(&self, lower: &[u8], upper: &[u8]) -> Result<impl Iterator<Item = (Vec<u8>, Vec<u8>)>> {
        let mut records = Vec::new();
        self.for_each(lower, upper, |key, value| {
            records.push((key.to_vec(), value.to_vec()));
        })?;
        Ok(records.into_iter())
    }

    /// Visits every record with `lower <= key < upper`, in key order.
    pub fn for_each<F: FnMut(&[u8], &[u8])>(
        &self,
        lower: &[u8],
        upper: &[u8],
        mut visitor: F,
    ) -> Result<()> {
        let tree = self.read_tree();
        tree.store().check_open()?;
        tree.store().check_key(lower)?;
        tree.store().check_key(upper)?;
        tree.for_each(lower, upper, &mut visitor)
    }

    /// Visits every record, in key order.
    pub fn for_all<F: FnMut(&[u8], &[u8])>(&self, mut visitor: F) -> Result<()> {
        let tree = self.read_tree();
        tree.store().check_open()?;
        tree.for_all(&mut visitor)
    }

    /// Reads as many records as possible out of a possibly damaged file.
    ///
    /// Each subtree is bracketed: a broken block loses only the records
    /// below it, reported to `on_error` with a short context string.
    pub fn recover_all<F, E>(&self, mut visitor: F, mut on_error: E) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]),
        E: FnMut(&str, &Error),
    {
        let tree = self.read_tree();
        tree.store().check_open()?;
        tree.recover_all(&mut visitor, &mut on_error);
        Ok(())
    }

    /// Inserts a record, returning whether a previous value was overwritten.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut tree = self.write_tree();
        tree.store().check_open()?;
        tree.store().check_key(key)?;
        tree.insert(key.to_vec(), value.to_vec())
    }

    /// Removes a record, returning whether it existed.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        let mut tree = self.write_tree();
        tree.store().check_open()?;
        tree.store().check_key(key)?;
        tree.remove(key)
    }

    /// Removes all records with `lower <= key < upper`, returning them.
    pub fn remove_range(&self, lower: &[u8], upper: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut tree = self.write_tree();
        tree.store().check_open()?;
        tree.store().check_key(lower)?;
        tree.store().check_key(upper)?;

        let mut records = Vec::new();
        tree.for_each(lower, upper, &mut |key: &[u8], value: &[u8]| {
            records.push((key.to_vec(), value.to_vec()));
        })?;

        for (key, _) in &records {
            tree.remove(key)?;
        }

        Ok(records)
    }

    /// Number of records.
    pub fn record_count(&self) -> Result<u64> {
        let tree = self.read_tree();
        tree.store().check_open()?;
        tree.record_count()
    }

    /// Number of index nodes.
    pub fn index_count(&self) -> Result<u64> {
        let tree = self.read_tree();
        tree.store().check_open()?;
        tree.index_count()
    }

    /// Number of leaf nodes.
    pub fn leaf_count(&self) -> Result<u64> {
        let tree = self.read_tree();
        tree.store().check_open()?;
        tree.leaf_count()
    }

    /// Number of index levels above the leaves; 0 means the root is a leaf.
    pub fn index_levels(&self) -> Result<u32> {
        let tree = self.read_tree();
        tree.store().check_open()?;
        tree.index_levels()
    }

    /// Number of blocks in the file, reachable or not.
    pub fn total_block_count(&self) -> Result<u64> {
        let tree = self.read_tree();
        let store = tree.store();
        store.check_open()?;
        Ok((store.device.file_size()? - HEADER_SIZE) / u64::from(store.device.block_size()))
    }

    /// Number of blocks not reachable from the current root: the free-index
    /// chain, the transaction pool and the untracked file tail.
    pub fn free_block_count(&self) -> Result<u64> {
        let tree = self.read_tree();
        let store = tree.store();
        store.check_open()?;

        let mut count = store.free.chain_free_count(&store.device)?;
        count += store.free.available_count() as u64;
        count += (store.device.file_size()? - store.device.device_size())
            / u64::from(store.device.block_size());

        Ok(count)
    }

    /// Number of blocks occupied by leaves, continuation chains included.
    pub fn leaf_block_count(&self) -> Result<u64> {
        let tree = self.read_tree();
        let store = tree.store();
        store.check_open()?;

        let mut count = 0;
        tree.walk_nodes(&mut |node| {
            if let NodeRef::Leaf(leaf) = node {
                count += 1 + store.leaf_tail_len(leaf.self_ptr)? as u64;
            }
            Ok(true)
        })?;

        Ok(count)
    }

    /// Flushes buffered writes and atomically switches to the new root.
    pub fn commit(&self) -> Result<()> {
        let mut tree = self.write_tree();
        tree.store_mut().check_open()?;
        tree.store_mut().do_commit()
    }

    /// Discards everything since the last commit, restoring the committed
    /// root and truncating tail growth.
    pub fn rollback(&self) -> Result<()> {
        let mut tree = self.write_tree();
        tree.store_mut().check_open()?;
        tree.store_mut().do_rollback()
    }

    /// Compacts the file if more than the configured fraction of its blocks
    /// is free. Returns whether a compaction ran; a run also commits.
    pub fn flatten(&self) -> Result<bool> {
        let mut tree = self.write_tree();
        tree.store_mut().check_open()?;
        tree.store_mut().try_flatten()
    }

    /// Enables or disables per-mutation commits. Enabling commits pending
    /// writes immediately.
    pub fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        let mut tree = self.write_tree();
        let store = tree.store_mut();
        store.check_open()?;
        store.auto_commit = auto_commit;

        if auto_commit {
            store.do_commit()?;
        }

        Ok(())
    }

    /// Resizes the index-node cache.
    pub fn set_index_cache_size(&self, nodes: usize) -> Result<()> {
        let mut tree = self.write_tree();
        tree.store_mut().codec.set_cache_size(nodes);
        Ok(())
    }

    /// Flushes and closes the database. Closing compacts the file first when
    /// enough of it is free space. Further operations fail with
    /// [`Error::InvalidState`].
    pub fn close(&self) -> Result<()> {
        let mut tree = self.write_tree();
        let store = tree.store_mut();

        if store.open {
            if !store.try_flatten()? {
                store.do_commit()?;
            }
            store.codec.cache_clear();
            store.open = false;
        }

        Ok(())
    }

    /// Whether the database is open.
    pub fn is_open(&self) -> bool {
        self.read_tree().store().open
    }

    /// Block size of the underlying device.
    pub fn block_size(&self) -> u32 {
        self.read_tree().store().device.block_size()
    }

    /// Fixed key length in bytes.
    pub fn key_size(&self) -> u32 {
        self.read_tree().store().key_size
    }

    /// Content identifier stamped into the file header.
    pub fn content_identifier(&self) -> String {
        self.read_tree().store().content_identifier.clone()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Best-effort final flush; errors cannot go anywhere from here.
        if let Ok(mut tree) = self.tree.write() {
            let store = tree.store_mut();
            if store.open {
                if !store.try_flatten().unwrap_or(false) {
                    store.do_commit().ok();
                }
                store.open = false;
            }
        }
    }
}
