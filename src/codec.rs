// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Node serialization.
//!
//! An index node always fits exactly one block (`II` magic). A leaf node
//! spans a *chain*: the head block (`LL` magic) plus zero or more
//! continuation blocks, each reserving its trailing four bytes for the next
//! chain pointer. Records are written as fixed-width key bytes followed by a
//! VLQ-prefixed value.
//!
//! Index reads go through a recency-based cache keyed by block index; leaf
//! nodes are large and unique, so they are never cached.

use crate::device::{BlockDevice, BlockIndex, NULL_BLOCK};
use crate::free_list::FreeSpaceIndex;
use crate::node::{IndexElement, IndexNode, LeafElement, LeafNode};
use crate::{vlq, Error, Result};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use quick_cache::{sync::Cache as QuickCache, sync::DefaultLifecycle, UnitWeighter};
use std::io::Read;
use std::sync::Arc;

const INDEX_MAGIC: &[u8; 2] = b"II";
const LEAF_MAGIC: &[u8; 2] = b"LL";

/// Trailing bytes of every leaf block: the continuation pointer.
const LEAF_LINK_SIZE: usize = 4;

type IndexCache = QuickCache<BlockIndex, Arc<IndexNode>, UnitWeighter, rustc_hash::FxBuildHasher>;

fn new_cache(capacity: usize) -> IndexCache {
    QuickCache::with(
        capacity,
        capacity as u64,
        UnitWeighter,
        rustc_hash::FxBuildHasher::default(),
        DefaultLifecycle::default(),
    )
}

fn truncated(e: std::io::Error, what: &str) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Corruption(format!("leaf chain ended while reading {what}"))
    } else {
        Error::Io(e)
    }
}

pub(crate) struct NodeCodec {
    block_size: u32,
    key_size: u32,
    cache: IndexCache,
}

impl NodeCodec {
    pub fn new(block_size: u32, key_size: u32, cache_size: usize) -> Self {
        Self {
            block_size,
            key_size,
            cache: new_cache(cache_size.max(1)),
        }
    }

    /// How many child pointers fit one index block.
    pub fn max_index_pointers(&self) -> usize {
        // 2 bytes magic, 1 level, 4 count, 4 begin pointer; then one key and
        // pointer per element, plus the begin child itself.
        ((self.block_size as usize - 2 - 1 - 4 - 4) / (self.key_size as usize + 4)) + 1
    }

    /// Encoded size of a value: VLQ length prefix plus the bytes.
    pub fn value_size(&self, value: &[u8]) -> usize {
        vlq::uvlq_len(value.len() as u64) + value.len()
    }

    /// Encoded size of a whole leaf, including magic and element count.
    pub fn leaf_size(&self, leaf: &LeafNode) -> usize {
        let mut size = 6;
        for element in &leaf.elements {
            size += self.key_size as usize;
            size += self.value_size(&element.value);
        }
        size
    }

    pub fn cache_insert(&self, pointer: BlockIndex, node: Arc<IndexNode>) {
        self.cache.insert(pointer, node);
    }

    pub fn cache_remove(&self, pointer: BlockIndex) {
        self.cache.remove(&pointer);
    }

    pub fn cache_clear(&self) {
        self.cache.clear();
    }

    pub fn set_cache_size(&mut self, capacity: usize) {
        self.cache = new_cache(capacity.max(1));
    }

    /// Loads an index node, serving repeated reads from the cache.
    pub fn load_index(&self, device: &BlockDevice, pointer: BlockIndex) -> Result<Arc<IndexNode>> {
        if let Some(node) = self.cache.get(&pointer) {
            return Ok(node);
        }

        let buf = device.read_block_vec(pointer)?;

        if buf.get(0..2).expect("block holds magic") != INDEX_MAGIC {
            return Err(Error::Corruption(format!(
                "block {pointer} has a bad index block signature",
            )));
        }

        let level = *buf.get(2).expect("block holds header");
        let len = BigEndian::read_u32(buf.get(3..7).expect("block holds header")) as usize;
        let begin = BigEndian::read_u32(buf.get(7..11).expect("block holds header"));

        let key_size = self.key_size as usize;
        let mut pointers = Vec::with_capacity(len.min(self.max_index_pointers()));
        let mut at = 11;
        for _ in 0..len {
            let entry = buf.get(at..at + key_size + 4).ok_or_else(|| {
                Error::Corruption(format!("index block {pointer} overruns its block"))
            })?;
            pointers.push(IndexElement {
                key: entry.get(..key_size).expect("sliced above").to_vec(),
                pointer: BigEndian::read_u32(entry.get(key_size..).expect("sliced above")),
            });
            at += key_size + 4;
        }

        let node = Arc::new(IndexNode {
            self_ptr: pointer,
            level,
            begin: Some(begin),
            pointers,
        });

        self.cache.insert(pointer, node.clone());
        Ok(node)
    }

    /// Encodes an index node into its own block.
    pub fn write_index(&self, device: &mut BlockDevice, node: &IndexNode) -> Result<()> {
        let key_size = self.key_size as usize;
        let mut buf = vec![0; 11 + (key_size + 4) * node.pointers.len()];

        buf.get_mut(0..2)
            .expect("buffer holds header")
            .copy_from_slice(INDEX_MAGIC);
        *buf.get_mut(2).expect("buffer holds header") = node.level;
        BigEndian::write_u32(
            buf.get_mut(3..7).expect("buffer holds header"),
            node.pointers.len() as u32,
        );
        BigEndian::write_u32(
            buf.get_mut(7..11).expect("buffer holds header"),
            node.begin.expect("stored index node has a begin pointer"),
        );

        let mut at = 11;
        for element in &node.pointers {
            buf.get_mut(at..at + key_size)
                .expect("buffer sized above")
                .copy_from_slice(&element.key);
            BigEndian::write_u32(
                buf.get_mut(at + key_size..at + key_size + 4)
                    .expect("buffer sized above"),
                element.pointer,
            );
            at += key_size + 4;
        }

        device.write_block(node.self_ptr, 0, &buf)
    }

    /// Reads the payload bytes of a whole leaf chain.
    fn read_leaf_chain(&self, device: &BlockDevice, head: BlockIndex) -> Result<Vec<u8>> {
        let block_size = self.block_size as usize;
        let data_end = block_size - LEAF_LINK_SIZE;

        let mut payload = Vec::with_capacity(data_end);
        let mut current = head;

        while current != NULL_BLOCK {
            let buf = device.read_block_vec(current)?;

            if buf.get(0..2).expect("block holds magic") != LEAF_MAGIC {
                return Err(Error::Corruption(format!(
                    "block {current} has a bad leaf block signature",
                )));
            }

            payload.extend_from_slice(buf.get(2..data_end).expect("within block"));
            current = BigEndian::read_u32(buf.get(data_end..).expect("within block"));
        }

        Ok(payload)
    }

    /// Loads a leaf node, following continuation pointers.
    pub fn load_leaf(&self, device: &BlockDevice, pointer: BlockIndex) -> Result<LeafNode> {
        let payload = self.read_leaf_chain(device, pointer)?;
        let mut reader = payload.as_slice();

        let len = reader
            .read_u32::<BigEndian>()
            .map_err(|e| truncated(e, "element count"))? as usize;

        let key_size = self.key_size as usize;
        let mut elements = Vec::with_capacity(len.min(payload.len()));
        for _ in 0..len {
            let mut key = vec![0; key_size];
            reader
                .read_exact(&mut key)
                .map_err(|e| truncated(e, "record key"))?;

            let value_len = vlq::read_uvlq(&mut reader).map_err(|e| truncated(e, "value length"))?;
            if value_len > payload.len() as u64 {
                return Err(Error::Corruption(format!(
                    "leaf block {pointer} declares an oversized value ({value_len} bytes)",
                )));
            }

            let mut value = vec![0; value_len as usize];
            reader
                .read_exact(&mut value)
                .map_err(|e| truncated(e, "record value"))?;

            elements.push(LeafElement { key, value });
        }

        Ok(LeafNode {
            self_ptr: pointer,
            elements,
        })
    }

    /// Encodes a leaf into its (already reserved) head block, reserving and
    /// linking continuation blocks as the payload overflows.
    pub fn write_leaf(
        &self,
        device: &mut BlockDevice,
        free: &mut FreeSpaceIndex,
        leaf: &LeafNode,
    ) -> Result<()> {
        let mut payload = Vec::with_capacity(self.leaf_size(leaf));
        {
            let mut len = [0; 4];
            BigEndian::write_u32(&mut len, leaf.count() as u32);
            payload.extend_from_slice(&len);
        }
        for element in &leaf.elements {
            payload.extend_from_slice(&element.key);
            vlq::write_uvlq(&mut payload, element.value.len() as u64)?;
            payload.extend_from_slice(&element.value);
        }

        let block_size = self.block_size as usize;
        let data_end = block_size - LEAF_LINK_SIZE;
        let capacity_per_block = data_end - 2;

        let mut current = leaf.self_ptr;
        let mut written = 0;

        loop {
            let chunk = capacity_per_block.min(payload.len() - written);

            let mut buf = vec![0; block_size];
            buf.get_mut(0..2)
                .expect("buffer holds magic")
                .copy_from_slice(LEAF_MAGIC);
            buf.get_mut(2..2 + chunk)
                .expect("chunk fits block")
                .copy_from_slice(payload.get(written..written + chunk).expect("chunk in payload"));
            written += chunk;

            let next = if written < payload.len() {
                free.reserve(device)?
            } else {
                NULL_BLOCK
            };
            BigEndian::write_u32(buf.get_mut(data_end..).expect("within block"), next);

            device.write_block(current, 0, &buf)?;

            if next == NULL_BLOCK {
                return Ok(());
            }
            current = next;
        }
    }

    /// Continuation blocks hanging off a leaf head, in chain order.
    pub fn leaf_tail_blocks(
        &self,
        device: &BlockDevice,
        head: BlockIndex,
    ) -> Result<Vec<BlockIndex>> {
        let data_end = self.block_size as usize - LEAF_LINK_SIZE;
        let mut tail = Vec::new();
        let mut current = head;

        while current != NULL_BLOCK {
            let mut link = [0; LEAF_LINK_SIZE];
            device.read_block(current, data_end, &mut link)?;
            current = BigEndian::read_u32(&link);
            if current != NULL_BLOCK {
                tail.push(current);
            }
        }

        Ok(tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeaderInfo;
    use test_log::test;

    fn setup(block_size: u32) -> Result<(tempfile::TempDir, BlockDevice, FreeSpaceIndex, NodeCodec)> {
        let dir = tempfile::tempdir()?;
        let (file, _) = BlockDevice::open(&dir.path().join("dev"))?;

        let device = BlockDevice::create(
            file,
            &HeaderInfo {
                block_size,
                content_identifier: "Test1".into(),
                key_size: 4,
            },
        )?;

        let free = FreeSpaceIndex::new(NULL_BLOCK);
        let codec = NodeCodec::new(block_size, 4, 16);

        Ok((dir, device, free, codec))
    }

    #[test]
    fn index_node_round_trip() -> Result<()> {
        let (_dir, mut device, mut free, codec) = setup(128)?;

        let block = free.reserve(&mut device)?;
        let mut node = IndexNode::with_begin(17, 3);
        node.self_ptr = block;
        node.insert_after(0, b"aaaa".to_vec(), 18);
        node.insert_after(1, b"bbbb".to_vec(), 19);

        codec.write_index(&mut device, &node)?;
        codec.cache_clear();

        let loaded = codec.load_index(&device, block)?;
        assert_eq!(node, *loaded);
        assert_eq!(3, loaded.level);
        assert_eq!(17, loaded.pointer(0));
        assert_eq!(19, loaded.pointer(2));

        // Second load is served from the cache.
        let cached = codec.load_index(&device, block)?;
        assert!(Arc::ptr_eq(&loaded, &cached));

        Ok(())
    }

    #[test]
    fn oversized_leaf_spans_chained_blocks() -> Result<()> {
        let (_dir, mut device, mut free, codec) = setup(128)?;

        let mut leaf = LeafNode::new();
        leaf.insert(0, b"aaaa".to_vec(), vec![7; 300]);
        leaf.insert(1, b"bbbb".to_vec(), vec![9; 40]);
        leaf.self_ptr = free.reserve(&mut device)?;

        codec.write_leaf(&mut device, &mut free, &leaf)?;

        let tail = codec.leaf_tail_blocks(&device, leaf.self_ptr)?;
        assert!(tail.len() >= 2, "300-byte value must overflow 128-byte blocks");

        let loaded = codec.load_leaf(&device, leaf.self_ptr)?;
        assert_eq!(leaf, loaded);

        Ok(())
    }

    #[test]
    fn leaf_chain_with_bad_magic_is_corruption() -> Result<()> {
        let (_dir, mut device, mut free, codec) = setup(128)?;

        let block = free.reserve(&mut device)?;
        device.write_block(block, 0, b"XX")?;

        assert!(matches!(
            codec.load_leaf(&device, block),
            Err(Error::Corruption(_)),
        ));

        Ok(())
    }
}
