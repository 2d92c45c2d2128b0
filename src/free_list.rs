// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Free-space tracking.
//!
//! Freed blocks are pooled in memory during a transaction and flushed into an
//! on-disk chain of free-index blocks (`FF` magic) at commit. Each chain
//! block lists freed block indices and points at the next chain block; when
//! the head is consumed by an allocation, both its entries *and* the block
//! hosting them become available again.
//!
//! The in-memory pool is ordered: allocation pops the smallest index, which
//! the flatten pass relies on to migrate nodes toward the start of the file.

use crate::device::{BlockDevice, BlockIndex, NULL_BLOCK};
use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use rustc_hash::FxHashSet;
use std::collections::BTreeSet;

const FREE_INDEX_MAGIC: &[u8; 2] = b"FF";

/// Entries that fit one free-index block.
fn max_free_index_len(block_size: u32) -> usize {
    (block_size / 4) as usize - 10
}

#[derive(Debug, Default, Eq, PartialEq)]
pub(crate) struct FreeIndexBlock {
    pub next: BlockIndex,
    pub free_blocks: Vec<BlockIndex>,
}

pub(crate) struct FreeSpaceIndex {
    /// First block of the on-disk free chain, or [`NULL_BLOCK`].
    head: BlockIndex,

    /// Blocks this transaction may hand out, smallest first.
    available: BTreeSet<BlockIndex>,

    /// Blocks first allocated in this transaction. Freeing one of these
    /// bypasses the on-disk chain entirely.
    uncommitted: FxHashSet<BlockIndex>,
}

impl FreeSpaceIndex {
    pub fn new(head: BlockIndex) -> Self {
        Self {
            head,
            available: BTreeSet::new(),
            uncommitted: FxHashSet::default(),
        }
    }

    pub fn head(&self) -> BlockIndex {
        self.head
    }

    /// Rollback support: drop all transaction-local state and re-point at
    /// the committed chain head.
    pub fn reset(&mut self, head: BlockIndex) {
        self.head = head;
        self.available.clear();
        self.uncommitted.clear();
    }

    pub fn is_uncommitted(&self, block: BlockIndex) -> bool {
        self.uncommitted.contains(&block)
    }

    pub fn available_is_empty(&self) -> bool {
        self.available.is_empty()
    }

    pub fn uncommitted_is_empty(&self) -> bool {
        self.uncommitted.is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn smallest_available(&self) -> Option<BlockIndex> {
        self.available.first().copied()
    }

    pub fn clear_available(&mut self) {
        self.available.clear();
    }

    pub fn clear_uncommitted(&mut self) {
        self.uncommitted.clear();
    }

    /// Hands out a block index: the smallest pooled block if any, else the
    /// head free-index block's contents, else fresh space at the file tail.
    pub fn reserve(&mut self, device: &mut BlockDevice) -> Result<BlockIndex> {
        if self.available.is_empty() {
            if self.head != NULL_BLOCK {
                // Make every block tracked by the head chain entry available,
                // along with the chain block itself.
                let index_block = self.read_free_index_block(device, self.head)?;
                self.available.extend(index_block.free_blocks);
                self.available.insert(self.head);
                self.head = index_block.next;
            }

            if self.available.is_empty() {
                self.available.insert(device.grow_one_block()?);
            }
        }

        let block = self.available.pop_first().expect("pool was refilled above");
        self.uncommitted.insert(block);
        Ok(block)
    }

    /// Returns a block to the pool. A buffered write to it is dropped; if it
    /// was allocated in this transaction it will never reach the chain.
    pub fn free(&mut self, device: &mut BlockDevice, block: BlockIndex) {
        self.uncommitted.remove(&block);
        device.drop_buffered_write(block);
        self.available.insert(block);
    }

    /// Flushes the pool into the on-disk chain. Chaining may itself consume
    /// pooled blocks (or grow the file); the loop drains exactly one pool
    /// entry per appended slot, so it terminates.
    pub fn commit(&mut self, device: &mut BlockDevice) -> Result<()> {
        if self.available.is_empty() {
            return Ok(());
        }

        let max_len = max_free_index_len(device.block_size());

        let mut index_block = if self.head == NULL_BLOCK {
            self.head = self.take_block(device)?;
            FreeIndexBlock {
                next: NULL_BLOCK,
                free_blocks: Vec::new(),
            }
        } else {
            self.read_free_index_block(device, self.head)?
        };

        loop {
            if !self.available.is_empty() && index_block.free_blocks.len() < max_len {
                let block = self.available.pop_first().expect("pool is non-empty");
                index_block.free_blocks.push(block);
            } else {
                self.write_free_index_block(device, self.head, &index_block)?;

                if self.available.is_empty() {
                    break;
                }

                // Head entry is full; chain a fresh one in front of it.
                if index_block.free_blocks.len() >= max_len {
                    index_block.next = self.head;
                    index_block.free_blocks.clear();

                    self.head = self.take_block(device)?;
                    self.write_free_index_block(device, self.head, &index_block)?;
                }
            }
        }

        Ok(())
    }

    /// Pool entry if any, tail growth otherwise. Used while chaining, so the
    /// block is consumed without entering the uncommitted set.
    fn take_block(&mut self, device: &mut BlockDevice) -> Result<BlockIndex> {
        match self.available.pop_first() {
            Some(block) => Ok(block),
            None => device.grow_one_block(),
        }
    }

    /// Blocks tracked by the on-disk chain, counting the chain hosts too.
    pub fn chain_free_count(&self, device: &BlockDevice) -> Result<u64> {
        let mut count = 0;
        let mut index = self.head;

        while index != NULL_BLOCK {
            let index_block = self.read_free_index_block(device, index)?;
            count += 1 + index_block.free_blocks.len() as u64;
            index = index_block.next;
        }

        Ok(count)
    }

    /// Flatten support: absorbs the whole chain (entries and hosts) into the
    /// ordered pool and clears the chain head.
    pub fn gather_chain(&mut self, device: &BlockDevice) -> Result<()> {
        let mut index = self.head;

        while index != NULL_BLOCK {
            let index_block = self.read_free_index_block(device, index)?;
            self.available.extend(index_block.free_blocks);
            self.available.insert(index);
            index = index_block.next;
        }

        self.head = NULL_BLOCK;
        Ok(())
    }

    pub fn read_free_index_block(
        &self,
        device: &BlockDevice,
        index: BlockIndex,
    ) -> Result<FreeIndexBlock> {
        let buf = device.read_block_vec(index)?;

        if buf.get(0..2).expect("block holds magic") != FREE_INDEX_MAGIC {
            return Err(Error::Corruption(format!(
                "block {index} missing free index block marker",
            )));
        }

        let next = BigEndian::read_u32(buf.get(2..6).expect("block holds header"));
        let len = BigEndian::read_u32(buf.get(6..10).expect("block holds header")) as usize;

        let mut free_blocks = Vec::with_capacity(len);
        for i in 0..len {
            let at = 10 + 4 * i;
            let slot = buf.get(at..at + 4).ok_or_else(|| {
                Error::Corruption(format!("free index block {index} overruns its block"))
            })?;
            free_blocks.push(BigEndian::read_u32(slot));
        }

        Ok(FreeIndexBlock { next, free_blocks })
    }

    pub fn write_free_index_block(
        &self,
        device: &mut BlockDevice,
        index: BlockIndex,
        index_block: &FreeIndexBlock,
    ) -> Result<()> {
        let mut buf = vec![0; 10 + 4 * index_block.free_blocks.len()];

        buf.get_mut(0..2)
            .expect("buffer holds header")
            .copy_from_slice(FREE_INDEX_MAGIC);
        BigEndian::write_u32(buf.get_mut(2..6).expect("buffer holds header"), index_block.next);
        BigEndian::write_u32(
            buf.get_mut(6..10).expect("buffer holds header"),
            index_block.free_blocks.len() as u32,
        );

        for (i, block) in index_block.free_blocks.iter().enumerate() {
            let at = 10 + 4 * i;
            BigEndian::write_u32(buf.get_mut(at..at + 4).expect("buffer sized above"), *block);
        }

        device.write_block(index, 0, &buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeaderInfo;
    use test_log::test;

    fn test_device() -> Result<(tempfile::TempDir, BlockDevice)> {
        let dir = tempfile::tempdir()?;
        let (file, _) = BlockDevice::open(&dir.path().join("dev"))?;

        let device = BlockDevice::create(
            file,
            &HeaderInfo {
                block_size: 128,
                content_identifier: "Test1".into(),
                key_size: 4,
            },
        )?;

        Ok((dir, device))
    }

    #[test]
    fn reserve_grows_tail_then_reuses_freed() -> Result<()> {
        let (_dir, mut device) = test_device()?;
        let mut free = FreeSpaceIndex::new(NULL_BLOCK);

        let a = free.reserve(&mut device)?;
        let b = free.reserve(&mut device)?;
        assert_eq!(0, a);
        assert_eq!(1, b);

        free.free(&mut device, a);
        assert_eq!(a, free.reserve(&mut device)?);

        Ok(())
    }

    #[test]
    fn chain_round_trip() -> Result<()> {
        let (_dir, mut device) = test_device()?;
        let mut free = FreeSpaceIndex::new(NULL_BLOCK);

        let blocks: Vec<BlockIndex> = (0..6)
            .map(|_| free.reserve(&mut device))
            .collect::<Result<_>>()?;
        free.clear_uncommitted();

        for block in blocks.iter().skip(1) {
            free.free(&mut device, *block);
        }

        free.commit(&mut device)?;
        free.clear_uncommitted();
        device.flush_writes()?;
        assert!(free.available_is_empty());
        assert_ne!(NULL_BLOCK, free.head());

        // One chain host tracking the other four blocks.
        assert_eq!(5, free.chain_free_count(&device)?);

        // A reloaded index serves the freed blocks back, smallest first.
        let mut reloaded = FreeSpaceIndex::new(free.head());
        let first = reloaded.reserve(&mut device)?;
        assert!(blocks.contains(&first) || first == free.head());

        Ok(())
    }

    #[test]
    fn gather_chain_pools_everything() -> Result<()> {
        let (_dir, mut device) = test_device()?;
        let mut free = FreeSpaceIndex::new(NULL_BLOCK);

        for _ in 0..4 {
            free.reserve(&mut device)?;
        }
        free.clear_uncommitted();
        for block in [1, 2, 3] {
            free.free(&mut device, block);
        }
        free.commit(&mut device)?;
        free.clear_uncommitted();

        let mut gathered = FreeSpaceIndex::new(free.head());
        gathered.gather_chain(&device)?;

        // One freed block became the chain host; the pool has it plus the
        // two entries it tracked.
        assert_eq!(NULL_BLOCK, gathered.head());
        assert_eq!(3, gathered.available_count());
        assert_eq!(Some(1), gathered.smallest_available());

        Ok(())
    }
}
